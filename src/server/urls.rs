use std::net::SocketAddr;

fn default_port(scheme: &str) -> Option<&'static str> {
    match scheme {
        "https" | "wss" => Some("443"),
        "http" | "ws" => Some("80"),
        _ => None,
    }
}

// Builds a URL from scheme, host, and port, omitting default port numbers.
// IPv6 zone identifiers are percent-encoded per RFC 6874 and the host is
// bracketed.
pub fn canonical_url(scheme: &str, host: &str, port: &str) -> String {
    let has_zone = host.contains('%');
    let mut host = host.to_owned();
    if has_zone {
        host = host.replace('%', "%25");
    }
    if has_zone || host.contains(':') {
        host = format!("[{host}]");
    }

    if port.is_empty() || default_port(scheme) == Some(port) {
        return format!("{scheme}://{host}");
    }
    format!("{scheme}://{host}:{port}")
}

// Host and port the service should advertise: the configured hostname when
// one is set, otherwise the bound address.
pub fn host_port(addr: &SocketAddr, default_host: &str) -> (String, String) {
    let host = if default_host.is_empty() {
        addr.ip().to_string()
    } else {
        default_host.to_owned()
    };
    (host, addr.port().to_string())
}

#[cfg(test)]
mod tests {
    use super::{canonical_url, host_port};

    #[test]
    fn omits_default_ports() {
        assert_eq!(canonical_url("wss", "example.com", "443"), "wss://example.com");
        assert_eq!(canonical_url("http", "example.com", "80"), "http://example.com");
        assert_eq!(canonical_url("ws", "example.com", ""), "ws://example.com");
    }

    #[test]
    fn keeps_non_default_ports() {
        assert_eq!(
            canonical_url("http", "example.com", "8080"),
            "http://example.com:8080"
        );
        assert_eq!(
            canonical_url("https", "example.com", "80"),
            "https://example.com:80"
        );
    }

    #[test]
    fn brackets_ipv6_hosts_and_encodes_zone_identifiers() {
        assert_eq!(
            canonical_url("wss", "fe80::1%eth0", "443"),
            "wss://[fe80::1%25eth0]"
        );
        assert_eq!(canonical_url("ws", "::1", "80"), "ws://[::1]");
    }

    #[test]
    fn host_port_prefers_configured_hostname() {
        let addr = "127.0.0.1:9000".parse().expect("address should parse");
        assert_eq!(
            host_port(&addr, "push.example.com"),
            ("push.example.com".to_owned(), "9000".to_owned())
        );
        assert_eq!(
            host_port(&addr, ""),
            ("127.0.0.1".to_owned(), "9000".to_owned())
        );
    }
}
