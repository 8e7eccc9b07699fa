//! Subdomain routing: the leftmost label of the public Host header names
//! the backend.

/// Extract the backend id from a Host header.
///
/// The host must be exactly one label followed by the serving domain;
/// anything else (bare domain, nested labels, foreign domains, address
/// literals) is rejected before any registry lookup happens. An optional
/// port is ignored.
pub fn backend_id_for_host(host: &str, serving_domain: &str) -> Option<String> {
    let hostname = host.split(':').next().unwrap_or(host);
    let label = hostname
        .strip_suffix(serving_domain)?
        .strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "tunnel.example.com";

    #[test]
    fn test_leftmost_label_is_backend_id() {
        assert_eq!(
            backend_id_for_host("abc.tunnel.example.com", DOMAIN),
            Some("abc".to_string())
        );
        assert_eq!(
            backend_id_for_host("abc.tunnel.example.com:8080", DOMAIN),
            Some("abc".to_string())
        );
    }

    #[test]
    fn test_label_is_lowercased() {
        assert_eq!(
            backend_id_for_host("ABC.tunnel.example.com", DOMAIN),
            Some("abc".to_string())
        );
    }

    #[test]
    fn test_bare_serving_domain_is_rejected() {
        assert_eq!(backend_id_for_host("tunnel.example.com", DOMAIN), None);
        assert_eq!(backend_id_for_host(".tunnel.example.com", DOMAIN), None);
    }

    #[test]
    fn test_nested_labels_are_rejected() {
        assert_eq!(backend_id_for_host("a.b.tunnel.example.com", DOMAIN), None);
    }

    #[test]
    fn test_foreign_domains_are_rejected() {
        assert_eq!(backend_id_for_host("abc.evil.example.com", DOMAIN), None);
        assert_eq!(backend_id_for_host("abctunnel.example.com", DOMAIN), None);
        assert_eq!(backend_id_for_host("127.0.0.1:8080", DOMAIN), None);
    }
}
