//! Reverse resolution of client addresses to short host names.

use std::net::{IpAddr, Ipv4Addr};

use dns_lookup::lookup_addr;
use tracing::debug;

/// Resolve `ip` to its short host name (domain suffix stripped). Falls back
/// to the dotted quad when no usable name comes back; never fails.
///
/// The result is used in dump file names, so anything that does not look
/// like a plain label is rejected in favor of the numeric form.
pub fn short_hostname(ip: Ipv4Addr) -> String {
    match lookup_addr(&IpAddr::V4(ip)) {
        Ok(name) => short_label(&name).unwrap_or_else(|| ip.to_string()),
        Err(e) => {
            debug!(ip = %ip, error = %e, "reverse lookup failed");
            ip.to_string()
        }
    }
}

fn short_label(name: &str) -> Option<String> {
    // getnameinfo hands back the dotted quad when there is no PTR record;
    // splitting that on '.' would mangle it.
    if name.parse::<IpAddr>().is_ok() {
        return Some(name.to_string());
    }
    let label = name.split('.').next().unwrap_or_default();
    if label.is_empty() || label.contains('/') {
        return None;
    }
    Some(label.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_domain_suffix() {
        assert_eq!(short_label("nodea.example.com"), Some("nodea".to_string()));
        assert_eq!(short_label("nodea"), Some("nodea".to_string()));
    }

    #[test]
    fn keeps_dotted_quad_whole() {
        assert_eq!(short_label("10.0.0.7"), Some("10.0.0.7".to_string()));
    }

    #[test]
    fn rejects_unusable_names() {
        assert_eq!(short_label(""), None);
        assert_eq!(short_label(".example.com"), None);
        assert_eq!(short_label("a/b.example.com"), None);
    }
}
