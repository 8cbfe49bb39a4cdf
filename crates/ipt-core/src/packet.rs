//! Read-only view of a decoded packet.
//!
//! The engine never decodes raw bytes. Anything that can answer the
//! [`PacketView`] queries can be evaluated; [`DecodedPacket`] is the serde
//! model used by the CLI and the tests.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// Protocol layers a rule can ask about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Tcp,
    Udp,
    IcmpV4,
    IcmpV6,
}

/// Source/destination pair of a layer, already rendered in canonical form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub src: String,
    pub dst: String,
}

/// Queries the engine needs from a decoded packet.
///
/// A missing layer is reported as `None`, never as an empty string.
pub trait PacketView {
    fn has_layer(&self, layer: LayerKind) -> bool;

    fn network_endpoints(&self) -> Option<Endpoints>;

    fn transport_endpoints(&self) -> Option<Endpoints>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLayer {
    pub src: IpAddr,
    pub dst: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportLayer {
    pub protocol: TransportProtocol,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IcmpVersion {
    V4,
    V6,
}

/// A packet as handed over by the decoding collaborator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedPacket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icmp: Option<IcmpVersion>,
}

impl DecodedPacket {
    pub fn tcp(src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) -> Self {
        Self::transport(TransportProtocol::Tcp, src, src_port, dst, dst_port)
    }

    pub fn udp(src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) -> Self {
        Self::transport(TransportProtocol::Udp, src, src_port, dst, dst_port)
    }

    /// ICMP echo-style packet; the version follows the source address family
    pub fn icmp(src: IpAddr, dst: IpAddr) -> Self {
        let version = match src {
            IpAddr::V4(_) => IcmpVersion::V4,
            IpAddr::V6(_) => IcmpVersion::V6,
        };
        Self {
            network: Some(NetworkLayer { src, dst }),
            transport: None,
            icmp: Some(version),
        }
    }

    fn transport(
        protocol: TransportProtocol,
        src: IpAddr,
        src_port: u16,
        dst: IpAddr,
        dst_port: u16,
    ) -> Self {
        Self {
            network: Some(NetworkLayer { src, dst }),
            transport: Some(TransportLayer {
                protocol,
                src_port,
                dst_port,
            }),
            icmp: None,
        }
    }
}

impl PacketView for DecodedPacket {
    fn has_layer(&self, layer: LayerKind) -> bool {
        match layer {
            LayerKind::Tcp => matches!(
                self.transport,
                Some(TransportLayer {
                    protocol: TransportProtocol::Tcp,
                    ..
                })
            ),
            LayerKind::Udp => matches!(
                self.transport,
                Some(TransportLayer {
                    protocol: TransportProtocol::Udp,
                    ..
                })
            ),
            LayerKind::IcmpV4 => self.icmp == Some(IcmpVersion::V4),
            LayerKind::IcmpV6 => self.icmp == Some(IcmpVersion::V6),
        }
    }

    fn network_endpoints(&self) -> Option<Endpoints> {
        self.network.as_ref().map(|net| Endpoints {
            src: net.src.to_string(),
            dst: net.dst.to_string(),
        })
    }

    fn transport_endpoints(&self) -> Option<Endpoints> {
        self.transport.as_ref().map(|t| Endpoints {
            src: t.src_port.to_string(),
            dst: t.dst_port.to_string(),
        })
    }
}

/// Load a list of decoded packets from a YAML or JSON file
pub fn load_packets(path: &Path) -> Result<Vec<DecodedPacket>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read packets from {:?}", path))?;

    let packets = if path.extension().and_then(|s| s.to_str()) == Some("json") {
        serde_json::from_str(&content).context("Failed to parse packet JSON")?
    } else {
        serde_yaml::from_str(&content).context("Failed to parse packet YAML")?
    };

    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn tcp_packet_exposes_both_layers() {
        let packet = DecodedPacket::tcp(ip("4.3.6.8"), 20, ip("1.2.3.4"), 80);

        assert!(packet.has_layer(LayerKind::Tcp));
        assert!(!packet.has_layer(LayerKind::Udp));
        assert_eq!(
            packet.network_endpoints(),
            Some(Endpoints {
                src: "4.3.6.8".into(),
                dst: "1.2.3.4".into()
            })
        );
        assert_eq!(packet.transport_endpoints().unwrap().dst, "80");
    }

    #[test]
    fn icmp_packet_has_no_transport_layer() {
        let packet = DecodedPacket::icmp(ip("::1"), ip("::1"));

        assert!(packet.has_layer(LayerKind::IcmpV6));
        assert!(!packet.has_layer(LayerKind::IcmpV4));
        assert!(packet.transport_endpoints().is_none());
        assert_eq!(packet.network_endpoints().unwrap().src, "::1");
    }

    #[test]
    fn empty_packet_reports_absent_layers() {
        let packet = DecodedPacket::default();

        assert!(packet.network_endpoints().is_none());
        assert!(packet.transport_endpoints().is_none());
    }

    #[test]
    fn packets_deserialize_from_yaml() {
        let yaml = r#"
- network: { src: 4.3.6.8, dst: 1.2.3.4 }
  transport: { protocol: tcp, src_port: 20, dst_port: 80 }
- network: { src: 10.0.0.1, dst: 10.0.0.2 }
  icmp: v4
"#;
        let packets: Vec<DecodedPacket> = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(packets.len(), 2);
        assert_eq!(
            packets[0],
            DecodedPacket::tcp(ip("4.3.6.8"), 20, ip("1.2.3.4"), 80)
        );
        assert!(packets[1].has_layer(LayerKind::IcmpV4));
    }
}
