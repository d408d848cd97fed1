//! Peer-directory records as reported by other nodes.
//!
//! Peers describe themselves either with a full `address` URL or with
//! separate protocol / host / port fields. Both are folded into the stored
//! `protocol://host:port` form; a record without `node_id` is keyed by an
//! identity derived from host and port.

use crate::types::{NodeStatus, PeerNode, UnixTime};
use serde::Deserialize;
use sha2::{Digest, Sha256};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RemoteNode {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default, alias = "domain", alias = "ip")]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub reputation_score: i64,
    #[serde(default)]
    pub last_seen: UnixTime,
}

struct Endpoint {
    protocol: String,
    host: String,
    port: u16,
}

fn default_port(protocol: &str) -> Option<u16> {
    match protocol {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

fn split_url(url: &str) -> (Option<&str>, &str, Option<&str>) {
    let (proto, rest) = match url.split_once("://") {
        Some((p, r)) => (Some(p), r),
        None => (None, url),
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    // bracketed IPv6 keeps its colons
    if let Some(inner) = authority.strip_prefix('[') {
        if let Some((host, tail)) = inner.split_once(']') {
            return (proto, host, tail.strip_prefix(':'));
        }
    }
    match authority.rsplit_once(':') {
        Some((h, p)) if !h.contains(':') => (proto, h, Some(p)),
        _ => (proto, authority, None),
    }
}

impl RemoteNode {
    fn endpoint(&self) -> Result<Endpoint, String> {
        let (mut protocol, mut host, mut port) = (None, None, None);
        if let Some(addr) = self.address.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            let (p, h, pt) = split_url(addr);
            protocol = p.map(str::to_string);
            host = Some(h.to_string());
            port = match pt {
                Some(s) => Some(s.parse::<u16>().map_err(|_| format!("bad port in {addr:?}"))?),
                None => None,
            };
        }
        let protocol = self
            .protocol
            .clone()
            .or(protocol)
            .unwrap_or_else(|| "http".to_string())
            .trim()
            .trim_end_matches("://")
            .to_ascii_lowercase();
        let host = self
            .host
            .clone()
            .or(host)
            .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| "node record has no host".to_string())?;
        let port = self
            .port
            .or(port)
            .or_else(|| default_port(&protocol))
            .ok_or_else(|| format!("node {host} has no port"))?;
        Ok(Endpoint { protocol, host, port })
    }

    /// Stored form of this record.
    pub fn into_peer_node(self, now: UnixTime) -> Result<PeerNode, String> {
        let ep = self.endpoint()?;
        let host = if ep.host.contains(':') { format!("[{}]", ep.host) } else { ep.host.clone() };
        let address = format!("{}://{}:{}", ep.protocol, host, ep.port);
        let node_id = match self.node_id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            Some(id) => id,
            None => derived_identity(&ep.host, ep.port),
        };
        Ok(PeerNode {
            node_id,
            address,
            status: self.status.unwrap_or(NodeStatus::Online),
            reputation_score: self.reputation_score,
            last_seen: if self.last_seen == 0 { now } else { self.last_seen },
        })
    }
}

/// `node-` + 16 hex digits of sha256("host:port").
pub fn derived_identity(host: &str, port: u16) -> String {
    let digest = Sha256::digest(format!("{host}:{port}").as_bytes());
    format!("node-{}", &hex::encode(digest)[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: serde_json::Value) -> Result<PeerNode, String> {
        serde_json::from_value::<RemoteNode>(v).unwrap().into_peer_node(99)
    }

    #[test]
    fn split_fields_and_url_agree() {
        let a = parse(json!({"node_id": "n1", "protocol": "HTTPS", "domain": "Node.Example.org", "port": 8443})).unwrap();
        let b = parse(json!({"node_id": "n1", "address": "https://node.example.org:8443/api"})).unwrap();
        assert_eq!(a.address, "https://node.example.org:8443");
        assert_eq!(a, b);
        assert_eq!(a.last_seen, 99);
    }

    #[test]
    fn identity_falls_back_to_host_and_port() {
        let n = parse(json!({"ip": "10.0.0.5", "port": 7000})).unwrap();
        assert_eq!(n.node_id, derived_identity("10.0.0.5", 7000));
        assert_eq!(n.address, "http://10.0.0.5:7000");
        let again = parse(json!({"address": "10.0.0.5:7000"})).unwrap();
        assert_eq!(again.node_id, n.node_id);
    }

    #[test]
    fn defaults_and_failures() {
        assert_eq!(parse(json!({"host": "a.b"})).unwrap().address, "http://a.b:80");
        assert_eq!(parse(json!({"address": "http://[::1]:9000"})).unwrap().address, "http://[::1]:9000");
        assert!(parse(json!({"port": 1})).is_err());
        assert!(parse(json!({"protocol": "tcp", "host": "x"})).is_err());
        assert!(parse(json!({"address": "http://x:notaport"})).is_err());
    }
}
