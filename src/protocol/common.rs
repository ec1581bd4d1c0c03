use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::ProtocolError;
use crate::bencode::Value;
use crate::peer::{Endpoint, PeerInfo, ServiceDescriptor, ServicePath};

/// Identity envelope carried after the body of every package except piece
/// carriers and combined packages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommonSection {
    /// The sender, as it describes itself.
    pub src: PeerInfo,
    pub dest_peerid: String,
    /// The endpoint the sender used to reach the destination.
    pub dest_ep: Option<Endpoint>,
    /// Recommended neighbors; only ids and endpoints travel.
    pub nodes: Vec<PeerInfo>,
    /// Correlation id of the task this package belongs to.
    pub task_id: Option<u32>,
    pub service: ServicePath,
}

impl CommonSection {
    /// Encodes the section keeping at most `max_nodes` neighbors.
    pub fn to_value(&self, max_nodes: usize) -> Value {
        let dst = Value::dict()
            .with("id", self.dest_peerid.as_str())
            .with_opt("ep", self.dest_ep.map(|ep| ep.to_string()))
            .build();

        let nodes: Vec<Value> = self
            .nodes
            .iter()
            .take(max_nodes)
            .map(hint_to_value)
            .collect();

        Value::dict()
            .with("src", peer_info_to_value(&self.src))
            .with("dst", dst)
            .with_opt("nodes", (!nodes.is_empty()).then_some(nodes))
            .with_opt("tid", self.task_id)
            .with_opt(
                "sp",
                (!self.service.is_root()).then(|| self.service.to_string()),
            )
            .build()
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let src = value
            .get("src")
            .ok_or_else(|| ProtocolError::Common("missing src".into()))?;
        let src = peer_info_from_value(src).map_err(ProtocolError::Common)?;

        let dst = value
            .get("dst")
            .ok_or_else(|| ProtocolError::Common("missing dst".into()))?;
        let dest_peerid = dst.get_str("id").unwrap_or_default().to_string();
        let dest_ep = dst.get_str("ep").and_then(|s| s.parse().ok());

        let nodes = match value.get_list("nodes") {
            Some(list) => list
                .iter()
                .map(peer_info_from_value)
                .collect::<Result<Vec<_>, _>>()
                .map_err(ProtocolError::Common)?,
            None => Vec::new(),
        };

        let service = match value.get_str("sp") {
            Some(sp) => ServicePath::parse(sp).map_err(|e| ProtocolError::Common(e.to_string()))?,
            None => ServicePath::root(),
        };

        Ok(Self {
            src,
            dest_peerid,
            dest_ep,
            nodes,
            task_id: value.get_u32("tid"),
            service,
        })
    }
}

fn eplist_value(eplist: &[Endpoint]) -> Value {
    Value::str_list(eplist.iter().map(|ep| ep.to_string()))
}

/// Id and endpoints only.
fn hint_to_value(info: &PeerInfo) -> Value {
    Value::dict()
        .with("id", info.peerid.as_str())
        .with("ep", eplist_value(&info.eplist))
        .build()
}

/// Full wire form of a peer: id, endpoints, services and info.
pub(crate) fn peer_info_to_value(info: &PeerInfo) -> Value {
    let services: BTreeMap<Bytes, Value> = info
        .services
        .iter()
        .map(|(path, desc)| {
            let desc = Value::dict()
                .with("f", desc.flags)
                .with("i", &desc.info)
                .build();
            (Bytes::from(path.to_string().into_bytes()), desc)
        })
        .collect();

    Value::dict()
        .with("id", info.peerid.as_str())
        .with("ep", eplist_value(&info.eplist))
        .with_opt("sv", (!services.is_empty()).then_some(services))
        .with_opt("i", (!info.info.is_empty()).then_some(&info.info))
        .build()
}

pub(crate) fn peer_info_from_value(value: &Value) -> Result<PeerInfo, String> {
    let peerid = value
        .get_str("id")
        .filter(|id| PeerInfo::validate_peerid(id).is_ok())
        .ok_or_else(|| "missing or invalid peer id".to_string())?
        .to_string();

    let eplist = value
        .get_str_list("ep")
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let mut services = BTreeMap::new();
    if let Some(sv) = value.get("sv").and_then(|v| v.as_dict()) {
        for (path, desc) in sv {
            let path = std::str::from_utf8(path)
                .ok()
                .and_then(|p| ServicePath::parse(p).ok())
                .filter(|p| !p.is_root())
                .ok_or_else(|| "invalid service path".to_string())?;
            services.insert(
                path,
                ServiceDescriptor {
                    flags: desc.get_u32("f").unwrap_or(0),
                    info: desc.get_str_map("i"),
                },
            );
        }
    }

    Ok(PeerInfo {
        peerid,
        eplist,
        services,
        info: value.get_str_map("i"),
    })
}
