//! Forward-address derivation
//!
//! Tries to be smart about deriving a full forward address from incomplete
//! host and port input.

/// Derive a full HTTP forward URL from shorthand input.
pub fn derive_http_forward_address(addr: &str) -> String {
    if addr.is_empty() {
        return String::new();
    }

    // Just a port number
    if let Ok(port) = addr.parse::<u16>() {
        return format!("http://localhost:{port}");
    }

    // Omitted hostname, e.g. ":8080"
    if let Some(port) = addr.strip_prefix(':').and_then(|rest| rest.parse::<u16>().ok()) {
        return format!("http://localhost:{port}");
    }

    if !addr.contains("://") {
        return format!("http://{addr}");
    }
    addr.to_string()
}

/// Derive a bare `host:port` TCP forward address from shorthand input.
pub fn derive_tcp_forward_address(addr: &str) -> String {
    if addr.is_empty() {
        return String::new();
    }

    if let Ok(port) = addr.parse::<u16>() {
        return format!("localhost:{port}");
    }

    if let Some(port) = addr.strip_prefix(':').and_then(|rest| rest.parse::<u16>().ok()) {
        return format!("localhost:{port}");
    }
    addr.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_http_forward_address() {
        let cases = [
            ("", ""),
            ("8080", "http://localhost:8080"),
            (":8080", "http://localhost:8080"),
            ("localhost:8080", "http://localhost:8080"),
            ("10.0.0.7:8080", "http://10.0.0.7:8080"),
            ("http://localhost:8080", "http://localhost:8080"),
            ("https://example.com", "https://example.com"),
        ];
        for (input, expected) in cases {
            assert_eq!(derive_http_forward_address(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_derive_tcp_forward_address() {
        let cases = [
            ("", ""),
            ("9833", "localhost:9833"),
            (":9833", "localhost:9833"),
            ("localhost:9833", "localhost:9833"),
            ("db.internal:5432", "db.internal:5432"),
        ];
        for (input, expected) in cases {
            assert_eq!(derive_tcp_forward_address(input), expected, "input {input:?}");
        }
    }
}
