use crate::conntrack::{ConnTrack, FlowKey};
use crate::error::ParseError;
use crate::packet::{LayerKind, PacketView};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const LOOPBACK_INTERFACE: &str = "lo";
const LOOPBACK_ADDRS: [&str; 2] = ["127.0.0.1", "::1"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Any,
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "all",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(Self::Any),
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            "ICMP" => Ok(Self::Icmp),
            other => Err(ParseError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Final decision for a packet, also used as a chain's default policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPT" => Ok(Self::Accept),
            "DROP" => Ok(Self::Drop),
            other => Err(ParseError::InvalidPolicy(other.to_string())),
        }
    }
}

/// What happens to a packet once a rule matches
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Accept,
    Drop,
    /// Terminal; the engine reports it as DROP
    Reject,
    /// Non-terminal, scanning continues after the log intent is recorded
    Log { prefix: String },
    Jump { target: String },
}

impl From<Verdict> for Action {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Accept => Self::Accept,
            Verdict::Drop => Self::Drop,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => f.write_str("ACCEPT"),
            Self::Drop => f.write_str("DROP"),
            Self::Reject => f.write_str("REJECT"),
            Self::Log { prefix } if prefix.is_empty() => f.write_str("LOG"),
            Self::Log { prefix } => write!(f, "LOG --log-prefix \"{}\"", prefix),
            Self::Jump { target } => f.write_str(target),
        }
    }
}

/// A single match-predicate-plus-action entry of a chain.
///
/// `None` fields are wildcards. A rule whose `action` is `None` takes the
/// owning chain's default policy when it is inserted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Rule {
    pub protocol: Protocol,
    pub src_addr: Option<String>,
    pub dst_addr: Option<String>,
    pub src_port: Option<String>,
    pub dst_port: Option<String>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub action: Option<Action>,
    pub require_established: bool,
}

impl Rule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action(action: Action) -> Self {
        Self {
            action: Some(action),
            ..Self::default()
        }
    }

    /// Test the rule against a packet; predicates short-circuit in order
    pub fn matches<P: PacketView + ?Sized>(&self, packet: &P, conntrack: &ConnTrack) -> bool {
        self.matches_protocol(packet)
            && self.matches_addresses(packet)
            && self.matches_ports(packet)
            && self.matches_state(packet, conntrack)
            && self.matches_loopback(packet)
    }

    /// Structural equality, used by "delete the rule matching these specs"
    pub fn matches_rule(&self, other: &Rule) -> bool {
        self == other
    }

    fn matches_protocol<P: PacketView + ?Sized>(&self, packet: &P) -> bool {
        match self.protocol {
            Protocol::Any => true,
            Protocol::Tcp => packet.has_layer(LayerKind::Tcp),
            Protocol::Udp => packet.has_layer(LayerKind::Udp),
            Protocol::Icmp => {
                packet.has_layer(LayerKind::IcmpV4) || packet.has_layer(LayerKind::IcmpV6)
            }
        }
    }

    fn matches_addresses<P: PacketView + ?Sized>(&self, packet: &P) -> bool {
        if self.src_addr.is_none() && self.dst_addr.is_none() {
            return true;
        }
        let Some(endpoints) = packet.network_endpoints() else {
            return false;
        };
        field_matches(&self.src_addr, &endpoints.src)
            && field_matches(&self.dst_addr, &endpoints.dst)
    }

    fn matches_ports<P: PacketView + ?Sized>(&self, packet: &P) -> bool {
        if self.src_port.is_none() && self.dst_port.is_none() {
            return true;
        }
        let Some(endpoints) = packet.transport_endpoints() else {
            return false;
        };
        field_matches(&self.src_port, &endpoints.src)
            && field_matches(&self.dst_port, &endpoints.dst)
    }

    fn matches_state<P: PacketView + ?Sized>(&self, packet: &P, conntrack: &ConnTrack) -> bool {
        if !self.require_established {
            return true;
        }
        FlowKey::from_packet(packet)
            .map(|key| conntrack.is_established(&key))
            .unwrap_or(false)
    }

    fn matches_loopback<P: PacketView + ?Sized>(&self, packet: &P) -> bool {
        let wants_loopback = self.in_interface.as_deref() == Some(LOOPBACK_INTERFACE)
            || self.out_interface.as_deref() == Some(LOOPBACK_INTERFACE);
        if !wants_loopback {
            return true;
        }
        packet
            .network_endpoints()
            .map(|e| LOOPBACK_ADDRS.contains(&e.src.as_str()) || LOOPBACK_ADDRS.contains(&e.dst.as_str()))
            .unwrap_or(false)
    }
}

fn field_matches(expected: &Option<String>, actual: &str) -> bool {
    expected.as_deref().map_or(true, |value| value == actual)
}

impl fmt::Display for Rule {
    /// Renders the rule back into rule-file flag syntax
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();

        if self.protocol != Protocol::Any {
            parts.push(format!("-p {}", self.protocol.as_str()));
        }
        let flags = [
            ("-s", &self.src_addr),
            ("--sport", &self.src_port),
            ("-d", &self.dst_addr),
            ("--dport", &self.dst_port),
            ("-i", &self.in_interface),
            ("-o", &self.out_interface),
        ];
        for (flag, value) in flags {
            if let Some(value) = value {
                parts.push(format!("{} {}", flag, value));
            }
        }
        if self.require_established {
            parts.push("-m conntrack --ctstate ESTABLISHED".to_string());
        }
        if let Some(action) = &self.action {
            parts.push(format!("-j {}", action));
        }

        f.write_str(&parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::DecodedPacket;
    use std::net::IpAddr;

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    fn web_packet() -> DecodedPacket {
        DecodedPacket::tcp(ip("4.3.6.8"), 40000, ip("1.2.3.4"), 80)
    }

    #[test]
    fn wildcard_rule_matches_everything() {
        let conntrack = ConnTrack::new();
        let rule = Rule::with_action(Action::Accept);

        assert!(rule.matches(&web_packet(), &conntrack));
        assert!(rule.matches(&DecodedPacket::icmp(ip("10.0.0.1"), ip("10.0.0.2")), &conntrack));
        assert!(rule.matches(&DecodedPacket::default(), &conntrack));
    }

    #[test]
    fn protocol_predicate() {
        let conntrack = ConnTrack::new();
        let tcp = Rule {
            protocol: Protocol::Tcp,
            ..Rule::default()
        };
        let icmp = Rule {
            protocol: Protocol::Icmp,
            ..Rule::default()
        };

        assert!(tcp.matches(&web_packet(), &conntrack));
        assert!(!tcp.matches(&DecodedPacket::udp(ip("1.1.1.1"), 53, ip("2.2.2.2"), 53), &conntrack));
        assert!(icmp.matches(&DecodedPacket::icmp(ip("::2"), ip("::3")), &conntrack));
        assert!(!icmp.matches(&web_packet(), &conntrack));
    }

    #[test]
    fn address_and_port_predicates() {
        let conntrack = ConnTrack::new();
        let rule = Rule {
            dst_addr: Some("1.2.3.4".into()),
            dst_port: Some("80".into()),
            ..Rule::default()
        };

        assert!(rule.matches(&web_packet(), &conntrack));
        assert!(!rule.matches(
            &DecodedPacket::tcp(ip("4.3.6.8"), 40000, ip("1.2.3.4"), 443),
            &conntrack
        ));
        assert!(!rule.matches(
            &DecodedPacket::tcp(ip("4.3.6.8"), 40000, ip("9.9.9.9"), 80),
            &conntrack
        ));
    }

    #[test]
    fn constrained_fields_fail_without_layers() {
        let conntrack = ConnTrack::new();
        let port_rule = Rule {
            dst_port: Some("80".into()),
            ..Rule::default()
        };
        let addr_rule = Rule {
            src_addr: Some("10.0.0.1".into()),
            ..Rule::default()
        };

        assert!(!port_rule.matches(&DecodedPacket::icmp(ip("10.0.0.1"), ip("10.0.0.2")), &conntrack));
        assert!(!addr_rule.matches(&DecodedPacket::default(), &conntrack));
    }

    #[test]
    fn established_predicate_consults_conntrack() {
        let conntrack = ConnTrack::new();
        let rule = Rule {
            require_established: true,
            action: Some(Action::Accept),
            ..Rule::default()
        };
        let packet = web_packet();
        assert!(!rule.matches(&packet, &conntrack));

        conntrack.record(&FlowKey::from_packet(&packet).unwrap());
        assert!(rule.matches(&packet, &conntrack));

        let reply = DecodedPacket::tcp(ip("1.2.3.4"), 80, ip("4.3.6.8"), 40000);
        assert!(rule.matches(&reply, &conntrack));

        let unrelated = DecodedPacket::tcp(ip("4.3.6.8"), 40001, ip("1.2.3.4"), 80);
        assert!(!rule.matches(&unrelated, &conntrack));
    }

    #[test]
    fn loopback_interface_requires_loopback_address() {
        let conntrack = ConnTrack::new();
        let rule = Rule {
            in_interface: Some("lo".into()),
            ..Rule::default()
        };

        assert!(rule.matches(&DecodedPacket::tcp(ip("127.0.0.1"), 1, ip("10.0.0.1"), 2), &conntrack));
        assert!(rule.matches(&DecodedPacket::tcp(ip("10.0.0.1"), 1, ip("::1"), 2), &conntrack));
        assert!(!rule.matches(&web_packet(), &conntrack));

        let eth = Rule {
            in_interface: Some("eth0".into()),
            ..Rule::default()
        };
        assert!(eth.matches(&web_packet(), &conntrack));
    }

    #[test]
    fn structural_equality_covers_every_field() {
        let base = Rule {
            protocol: Protocol::Tcp,
            dst_port: Some("22".into()),
            action: Some(Action::Drop),
            ..Rule::default()
        };

        assert!(base.matches_rule(&base.clone()));

        let mut other = base.clone();
        other.action = Some(Action::Accept);
        assert!(!base.matches_rule(&other));

        let mut other = base.clone();
        other.require_established = true;
        assert!(!base.matches_rule(&other));

        let mut other = base.clone();
        other.action = Some(Action::Log {
            prefix: "x".into(),
        });
        assert!(!base.matches_rule(&other));
    }

    #[test]
    fn display_renders_rule_flags() {
        let rule = Rule {
            protocol: Protocol::Tcp,
            dst_addr: Some("10.0.0.5".into()),
            dst_port: Some("22".into()),
            action: Some(Action::Drop),
            ..Rule::default()
        };
        assert_eq!(rule.to_string(), "-p tcp -d 10.0.0.5 --dport 22 -j DROP");

        let log = Rule::with_action(Action::Log {
            prefix: "blocked: ".into(),
        });
        assert_eq!(log.to_string(), "-j LOG --log-prefix \"blocked: \"");
    }

    #[test]
    fn verdict_parses_exact_policy_names() {
        assert_eq!("ACCEPT".parse::<Verdict>(), Ok(Verdict::Accept));
        assert_eq!("DROP".parse::<Verdict>(), Ok(Verdict::Drop));
        assert!("REJECT".parse::<Verdict>().is_err());
    }
}
