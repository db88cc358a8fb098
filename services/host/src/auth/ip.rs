//! 来源 IP 分类与客户端 IP 解析。

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// 来源网络分级。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IpClass {
    Localhost,
    LocalNetwork,
    Public,
}

impl IpClass {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Localhost => "localhost",
            Self::LocalNetwork => "local_network",
            Self::Public => "public",
        }
    }
}

pub(crate) fn classify(ip: IpAddr) -> IpClass {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return classify_v4(mapped);
            }
            if v6 == Ipv6Addr::LOCALHOST {
                IpClass::Localhost
            } else {
                IpClass::Public
            }
        }
    }
}

fn classify_v4(ip: Ipv4Addr) -> IpClass {
    if ip.is_loopback() {
        return IpClass::Localhost;
    }
    if ip.is_private() || ip.is_link_local() || is_tailscale_cgnat(ip) {
        return IpClass::LocalNetwork;
    }
    IpClass::Public
}

/// 100.64.0.0/10。
pub(crate) fn is_tailscale_cgnat(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    a == 100 && (64..=127).contains(&b)
}

/// 仅当直连对端为本机时，才采信 `X-Forwarded-For` 首项。
pub(crate) fn resolve_client_ip(peer: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
    if classify(peer) != IpClass::Localhost {
        return peer;
    }
    forwarded_for
        .and_then(|raw| raw.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .unwrap_or(peer)
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::{IpClass, classify, resolve_client_ip};

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    #[test]
    fn classifies_reference_addresses() {
        for raw in ["10.1.2.3", "192.168.1.1", "172.20.0.1", "100.90.1.1", "169.254.3.4"] {
            assert_eq!(classify(ip(raw)), IpClass::LocalNetwork, "{raw}");
        }
        for raw in ["127.0.0.1", "::1", "::ffff:127.0.0.1"] {
            assert_eq!(classify(ip(raw)), IpClass::Localhost, "{raw}");
        }
        for raw in ["8.8.8.8", "100.128.0.1", "172.32.0.1", "2001:db8::1"] {
            assert_eq!(classify(ip(raw)), IpClass::Public, "{raw}");
        }
        assert_eq!(classify(ip("::ffff:192.168.0.4")), IpClass::LocalNetwork);
    }

    #[test]
    fn forwarded_header_only_trusted_from_localhost_peer() {
        assert_eq!(
            resolve_client_ip(ip("127.0.0.1"), Some("8.8.8.8, 10.0.0.1")),
            ip("8.8.8.8")
        );
        assert_eq!(
            resolve_client_ip(ip("8.8.4.4"), Some("127.0.0.1")),
            ip("8.8.4.4")
        );
        assert_eq!(
            resolve_client_ip(ip("127.0.0.1"), Some("garbage")),
            ip("127.0.0.1")
        );
        assert_eq!(resolve_client_ip(ip("::1"), None), ip("::1"));
    }
}
