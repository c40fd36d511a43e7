//! Line matcher for the tunnel binary's output.
//!
//! Every rule is a (predicate, extractor) pair. Each line is run through the
//! whole table in order and every rule that applies may contribute one
//! [`Field`]. [`OutputParser`] folds those fields into the tunnel
//! configuration being built.

use super::TunnelConfig;
use crate::config::Protocol;
use std::net::Ipv4Addr;

/// Something recognised on one output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Device(String),
    Address(Ipv4Addr),
    Gateway(Ipv4Addr),
    Dns(Ipv4Addr),
    Route(String),
    /// Long-lived GlobalProtect cookie superseding the SSO token.
    Renewal(String),
    /// The transport handshake finished; the tunnel is not usable yet.
    TransportUp,
    /// The tunnel interface has been configured.
    TunnelUp,
}

pub struct Rule {
    pub name: &'static str,
    /// Limits the rule to one protocol.
    pub protocol: Option<Protocol>,
    pub applies: fn(&str) -> bool,
    pub extract: fn(&str) -> Option<Field>,
}

/// Evaluated top to bottom for every line. The tunnel-up marker comes last so
/// the address on the same line is already recorded when it fires.
pub const RULES: &[Rule] = &[
    Rule {
        name: "device",
        protocol: None,
        applies: |l| l.contains("tun"),
        extract: |l| {
            l.split(|c: char| !c.is_ascii_alphanumeric())
                .find(|tok| is_tun_name(tok))
                .map(|tok| Field::Device(tok.to_string()))
        },
    },
    Rule {
        name: "address",
        protocol: None,
        applies: |l| l.contains(" as "),
        extract: |l| ipv4_after(l, " as ").map(Field::Address),
    },
    Rule {
        name: "gateway",
        protocol: None,
        applies: |l| l.contains("Connected to "),
        extract: |l| ipv4_after(l, "Connected to ").map(Field::Gateway),
    },
    Rule {
        name: "dns",
        protocol: None,
        applies: |l| l.contains("DNS server"),
        extract: |l| {
            let rest = &l[l.find("DNS server")?..];
            let addr = match rest.find("address ") {
                Some(_) => ipv4_after(rest, "address "),
                None => rest.split_whitespace().find_map(leading_ipv4),
            };
            addr.map(Field::Dns)
        },
    },
    Rule {
        name: "split-route",
        protocol: None,
        applies: |l| l.contains("Split") && l.contains("route"),
        extract: |l| {
            let rest = &l[l.find("route")? + "route".len()..];
            rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace())
                .split_whitespace()
                .next()
                .map(|r| Field::Route(r.to_string()))
        },
    },
    Rule {
        name: "renewal",
        protocol: Some(Protocol::GlobalProtect),
        applies: |l| l.contains("portal-userauthcookie="),
        extract: |l| {
            let start = l.find("portal-userauthcookie=")? + "portal-userauthcookie=".len();
            let value = l[start..].split_whitespace().next()?;
            let is_placeholder = value
                .get(..5)
                .is_some_and(|p| p.eq_ignore_ascii_case("empty"));
            (!is_placeholder).then(|| Field::Renewal(value.to_string()))
        },
    },
    Rule {
        name: "transport",
        protocol: None,
        applies: |l| {
            l.contains("Connected to")
                || l.contains("Established DTLS")
                || l.contains("ESP session established")
        },
        extract: |_| Some(Field::TransportUp),
    },
    Rule {
        name: "tunnel-up",
        protocol: None,
        applies: |l| l.contains("Configured as"),
        extract: |_| Some(Field::TunnelUp),
    },
];

/// Runs one line through the table.
pub fn match_line(protocol: Protocol, line: &str) -> Vec<Field> {
    RULES
        .iter()
        .filter(|r| r.protocol.map_or(true, |p| p == protocol))
        .filter(|r| (r.applies)(line))
        .filter_map(|r| {
            let field = (r.extract)(line);
            if field.is_some() {
                log::trace!("rule {} matched", r.name);
            }
            field
        })
        .collect()
}

fn is_tun_name(tok: &str) -> bool {
    let digits = tok
        .strip_prefix("utun")
        .or_else(|| tok.strip_prefix("tun"));
    digits.is_some_and(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
}

/// IPv4 address starting right after `marker`.
fn ipv4_after(line: &str, marker: &str) -> Option<Ipv4Addr> {
    let start = line.find(marker)? + marker.len();
    leading_ipv4(line[start..].trim_start())
}

/// Parses the dotted-quad prefix of `s`, ignoring what follows (`:443`, `,`).
fn leading_ipv4(s: &str) -> Option<Ipv4Addr> {
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    s[..end].trim_end_matches('.').parse().ok()
}

/// What the caller has to act on after a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Renewal(String),
    TunnelUp,
}

/// Accumulates the tunnel configuration across lines.
#[derive(Debug, Clone)]
pub struct OutputParser {
    protocol: Protocol,
    device: Option<String>,
    address: Option<Ipv4Addr>,
    gateway: Option<Ipv4Addr>,
    dns: Vec<Ipv4Addr>,
    routes: Vec<String>,
    transport_up: bool,
    tunnel_up: bool,
}

impl OutputParser {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            device: None,
            address: None,
            gateway: None,
            dns: Vec::new(),
            routes: Vec::new(),
            transport_up: false,
            tunnel_up: false,
        }
    }

    pub fn feed(&mut self, line: &str) -> Vec<Notice> {
        let mut notices = Vec::new();
        for field in match_line(self.protocol, line) {
            match field {
                Field::Device(dev) if self.device.is_none() => {
                    log::info!("Detected tunnel device: {}", dev);
                    self.device = Some(dev);
                }
                Field::Address(addr) if self.address.is_none() => {
                    log::info!("Detected VPN address: {}", addr);
                    self.address = Some(addr);
                }
                Field::Gateway(addr) if self.gateway.is_none() => {
                    log::info!("Detected VPN gateway: {}", addr);
                    self.gateway = Some(addr);
                }
                Field::Dns(addr) if !self.dns.contains(&addr) => {
                    log::info!("Detected VPN DNS server: {}", addr);
                    self.dns.push(addr);
                }
                Field::Route(route) if !self.routes.contains(&route) => {
                    log::debug!("Split route: {}", route);
                    self.routes.push(route);
                }
                Field::Renewal(token) => notices.push(Notice::Renewal(token)),
                Field::TransportUp if !self.transport_up => {
                    log::info!("Transport established, waiting for tunnel configuration");
                    self.transport_up = true;
                }
                Field::TunnelUp if !self.tunnel_up => {
                    self.tunnel_up = true;
                    notices.push(Notice::TunnelUp);
                }
                _ => {}
            }
        }
        notices
    }

    pub fn is_tunnel_up(&self) -> bool {
        self.tunnel_up
    }

    /// The configuration as known so far.
    pub fn config(&self) -> TunnelConfig {
        TunnelConfig {
            device: self
                .device
                .clone()
                .unwrap_or_else(|| super::DEFAULT_DEVICE.to_string()),
            address: self.address,
            gateway: self.gateway,
            dns: self.dns.clone(),
            routes: self.routes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut OutputParser, lines: &[&str]) -> Vec<Notice> {
        lines.iter().flat_map(|l| parser.feed(l)).collect()
    }

    #[test]
    fn up_only_after_configured_marker() {
        let mut p = OutputParser::new(Protocol::AnyConnect);
        let early = feed_all(
            &mut p,
            &[
                "POST https://vpn.example.com/",
                "Connected to 203.0.113.9:443",
                "SSL negotiation with vpn.example.com",
                "Established DTLS connection (using GnuTLS)",
            ],
        );
        assert!(early.is_empty());
        assert!(!p.is_tunnel_up());
        assert_eq!(p.config().gateway, Some(Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(p.config().address, None);

        let late = p.feed("Configured as 10.10.5.4, with SSL connected and DTLS in progress");
        assert_eq!(late, vec![Notice::TunnelUp]);
        assert_eq!(p.config().address, Some(Ipv4Addr::new(10, 10, 5, 4)));
    }

    #[test]
    fn configured_before_connected_keeps_both() {
        let mut p = OutputParser::new(Protocol::GlobalProtect);
        assert_eq!(p.feed("Configured as 10.10.5.4"), vec![Notice::TunnelUp]);
        p.feed("Connected to 203.0.113.9:443");
        let cfg = p.config();
        assert_eq!(cfg.address, Some(Ipv4Addr::new(10, 10, 5, 4)));
        assert_eq!(cfg.gateway, Some(Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(p.feed("Configured as 10.10.5.4"), vec![]);
    }

    #[test]
    fn device_dns_and_routes() {
        let mut p = OutputParser::new(Protocol::AnyConnect);
        feed_all(
            &mut p,
            &[
                "Got DNS server address 10.0.0.53",
                "Got DNS server address 10.0.0.54",
                "Got DNS server address 10.0.0.53",
                "DNS server 192.168.1.1 via tunnel",
                "Split include route: 10.0.0.0/8",
                "Split exclude route: 192.0.2.0/24",
                "Using vhost-net for tun1 and tun2",
            ],
        );
        let cfg = p.config();
        assert_eq!(cfg.device, "tun1");
        assert_eq!(
            cfg.dns,
            vec![
                Ipv4Addr::new(10, 0, 0, 53),
                Ipv4Addr::new(10, 0, 0, 54),
                Ipv4Addr::new(192, 168, 1, 1)
            ]
        );
        assert_eq!(cfg.routes, vec!["10.0.0.0/8", "192.0.2.0/24"]);
    }

    #[test]
    fn device_defaults_and_rejects_lookalikes() {
        let mut p = OutputParser::new(Protocol::AnyConnect);
        p.feed("Returning to tunnel mode");
        p.feed("tunable settings applied");
        assert_eq!(p.config().device, "tun0");
        p.feed("Connected utun3 as 10.1.2.3");
        assert_eq!(p.config().device, "utun3");
        assert_eq!(p.config().address, Some(Ipv4Addr::new(10, 1, 2, 3)));
    }

    #[test]
    fn addresses_must_be_dotted_quads() {
        let mut p = OutputParser::new(Protocol::AnyConnect);
        p.feed("Connected to vpn.example.com:443");
        p.feed("Logged in as 300.1.2.3");
        p.feed("Connected to 10.1.2:443");
        assert_eq!(p.config().gateway, None);
        assert_eq!(p.config().address, None);
    }

    #[test]
    fn renewal_is_gp_only_and_skips_placeholder() {
        let line = "GlobalProtect login returned portal-userauthcookie=AbC123xyz";
        let mut gp = OutputParser::new(Protocol::GlobalProtect);
        assert_eq!(gp.feed(line), vec![Notice::Renewal("AbC123xyz".into())]);
        assert!(gp
            .feed("GlobalProtect login returned portal-userauthcookie=empty")
            .is_empty());
        assert!(gp
            .feed("GlobalProtect login returned portal-userauthcookie=")
            .is_empty());

        let mut ac = OutputParser::new(Protocol::AnyConnect);
        assert!(ac.feed(line).is_empty());
    }
}
