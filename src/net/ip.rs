//! IP literal classification
//!
//! Telemetry buckets candidate addresses into public vs. private per family.
//! Private covers RFC 1918, loopback, link-local, and CGNAT (100.64/10) for
//! IPv4; loopback, ULA (fc00::/7), and link-local (fe80::/10) for IPv6.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpKind {
    Public,
    Private,
}

/// Classification result for an IP literal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpClass {
    pub version: IpVersion,
    pub kind: IpKind,
}

/// Classify an IP literal. Returns `None` for strings that do not parse.
pub fn classify(literal: &str) -> Option<IpClass> {
    let addr: IpAddr = literal.parse().ok()?;
    Some(match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            let cgnat = octets[0] == 100 && (octets[1] & 0xc0) == 64;
            let private =
                v4.is_private() || v4.is_loopback() || v4.is_link_local() || cgnat;
            IpClass {
                version: IpVersion::V4,
                kind: if private { IpKind::Private } else { IpKind::Public },
            }
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            let unique_local = (segments[0] & 0xfe00) == 0xfc00;
            let link_local = (segments[0] & 0xffc0) == 0xfe80;
            let private = v6.is_loopback() || unique_local || link_local;
            IpClass {
                version: IpVersion::V6,
                kind: if private { IpKind::Private } else { IpKind::Public },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(literal: &str, version: IpVersion, kind: IpKind) {
        let class = classify(literal).unwrap();
        assert_eq!(class.version, version, "{literal}");
        assert_eq!(class.kind, kind, "{literal}");
    }

    #[test]
    fn test_reference_table() {
        check("10.0.0.1", IpVersion::V4, IpKind::Private);
        check("172.20.1.1", IpVersion::V4, IpKind::Private);
        check("192.168.0.1", IpVersion::V4, IpKind::Private);
        check("127.0.0.1", IpVersion::V4, IpKind::Private);
        check("169.254.0.1", IpVersion::V4, IpKind::Private);
        check("100.64.0.1", IpVersion::V4, IpKind::Private);
        check("8.8.8.8", IpVersion::V4, IpKind::Public);
        check("::1", IpVersion::V6, IpKind::Private);
        check("fd00::1", IpVersion::V6, IpKind::Private);
        check("fe80::1", IpVersion::V6, IpKind::Private);
        check("2001:db8::1", IpVersion::V6, IpKind::Public);
    }

    #[test]
    fn test_cgnat_range_bounds() {
        check("100.63.255.255", IpVersion::V4, IpKind::Public);
        check("100.64.0.0", IpVersion::V4, IpKind::Private);
        check("100.127.255.255", IpVersion::V4, IpKind::Private);
        check("100.128.0.0", IpVersion::V4, IpKind::Public);
    }

    #[test]
    fn test_garbage_is_none() {
        assert!(classify("not-an-ip").is_none());
        assert!(classify("").is_none());
    }
}
