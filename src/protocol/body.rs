use std::collections::BTreeMap;

use bytes::Bytes;

use super::command::Command;
use super::common::{peer_info_from_value, peer_info_to_value};
use super::error::ProtocolError;
use crate::bencode::Value;
use crate::dht::ResultCode;
use crate::peer::{Endpoint, PeerHash, PeerInfo};

/// Command-specific part of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    FindPeerReq {
        target: String,
    },
    FindPeerResp {
        result: ResultCode,
        reached: Vec<String>,
    },
    UpdateValueReq {
        table: String,
        key: String,
        value: Bytes,
    },
    UpdateValueResp {
        result: ResultCode,
        reached: Vec<String>,
    },
    FindValueReq {
        table: String,
        key: String,
    },
    FindValueResp {
        result: ResultCode,
        values: BTreeMap<String, Bytes>,
        reached: Vec<String>,
    },
    PingReq,
    PingResp,
    HandshakeReq,
    HandshakeResp,
    HoleCallReq {
        target: String,
        target_eps: Vec<Endpoint>,
    },
    HoleCallResp {
        result: ResultCode,
        target: Option<PeerInfo>,
    },
    HoleCalledReq {
        source: PeerInfo,
    },
    HoleCalledResp {
        result: ResultCode,
    },
    BroadcastEventReq {
        event: String,
        params: Bytes,
        origin: String,
        event_id: u32,
        /// Hashes of peers the sender knows were reached already.
        arrived: Vec<PeerHash>,
        /// Disclosure width of the sender.
        hashbits: u8,
    },
    BroadcastEventResp {
        result: ResultCode,
        arrived: Vec<PeerHash>,
    },
    PackagePieceReq {
        task_id: u32,
        peerid: String,
        /// Index of the last piece.
        max: u32,
        no: u32,
        payload: Bytes,
    },
    PackagePieceResp {
        task_id: u32,
        no: u32,
    },
    CombinePackage {
        packages: Vec<Bytes>,
    },
}

impl Body {
    pub fn command(&self) -> Command {
        match self {
            Body::FindPeerReq { .. } => Command::FindPeerReq,
            Body::FindPeerResp { .. } => Command::FindPeerResp,
            Body::UpdateValueReq { .. } => Command::UpdateValueReq,
            Body::UpdateValueResp { .. } => Command::UpdateValueResp,
            Body::FindValueReq { .. } => Command::FindValueReq,
            Body::FindValueResp { .. } => Command::FindValueResp,
            Body::PingReq => Command::PingReq,
            Body::PingResp => Command::PingResp,
            Body::HandshakeReq => Command::HandshakeReq,
            Body::HandshakeResp => Command::HandshakeResp,
            Body::HoleCallReq { .. } => Command::HoleCallReq,
            Body::HoleCallResp { .. } => Command::HoleCallResp,
            Body::HoleCalledReq { .. } => Command::HoleCalledReq,
            Body::HoleCalledResp { .. } => Command::HoleCalledResp,
            Body::BroadcastEventReq { .. } => Command::BroadcastEventReq,
            Body::BroadcastEventResp { .. } => Command::BroadcastEventResp,
            Body::PackagePieceReq { .. } => Command::PackagePieceReq,
            Body::PackagePieceResp { .. } => Command::PackagePieceResp,
            Body::CombinePackage { .. } => Command::CombinePackage,
        }
    }

    /// The bencoded part of the body. The raw payload of a piece is not
    /// included; the codec appends it after the dictionary.
    pub fn to_value(&self) -> Value {
        let d = Value::dict();
        match self {
            Body::FindPeerReq { target } => d.with("t", target.as_str()),
            Body::FindPeerResp { result, reached } | Body::UpdateValueResp { result, reached } => {
                d.with("r", result.as_u32()).with("rc", Value::str_list(reached))
            }
            Body::UpdateValueReq { table, key, value } => d
                .with("tb", table.as_str())
                .with("k", key.as_str())
                .with("v", value.clone()),
            Body::FindValueReq { table, key } => {
                d.with("tb", table.as_str()).with("k", key.as_str())
            }
            Body::FindValueResp {
                result,
                values,
                reached,
            } => {
                let vs: BTreeMap<Bytes, Value> = values
                    .iter()
                    .map(|(k, v)| (Bytes::from(k.clone().into_bytes()), Value::Bytes(v.clone())))
                    .collect();
                d.with("r", result.as_u32())
                    .with("vs", vs)
                    .with("rc", Value::str_list(reached))
            }
            Body::PingReq | Body::PingResp | Body::HandshakeReq | Body::HandshakeResp => d,
            Body::HoleCallReq { target, target_eps } => d
                .with("t", target.as_str())
                .with("tep", Value::str_list(target_eps.iter().map(|e| e.to_string()))),
            Body::HoleCallResp { result, target } => d
                .with("r", result.as_u32())
                .with_opt("tp", target.as_ref().map(peer_info_to_value)),
            Body::HoleCalledReq { source } => d.with("s", peer_info_to_value(source)),
            Body::HoleCalledResp { result } => d.with("r", result.as_u32()),
            Body::BroadcastEventReq {
                event,
                params,
                origin,
                event_id,
                arrived,
                hashbits,
            } => d
                .with("ev", event.as_str())
                .with("p", params.clone())
                .with("o", origin.as_str())
                .with("id", *event_id)
                .with("a", hashes_value(arrived))
                .with("hb", *hashbits),
            Body::BroadcastEventResp { result, arrived } => d
                .with("r", result.as_u32())
                .with("a", hashes_value(arrived)),
            Body::PackagePieceReq {
                task_id,
                peerid,
                max,
                no,
                ..
            } => d
                .with("t", *task_id)
                .with("p", peerid.as_str())
                .with("m", *max)
                .with("n", *no),
            Body::PackagePieceResp { task_id, no } => d.with("t", *task_id).with("n", *no),
            Body::CombinePackage { packages } => d.with(
                "ps",
                packages
                    .iter()
                    .map(|p| Value::Bytes(p.clone()))
                    .collect::<Vec<_>>(),
            ),
        }
        .build()
    }

    /// Parses a body dictionary. `payload` is whatever followed the
    /// dictionary and is only meaningful for piece carriers.
    pub fn from_value(cmd: Command, v: &Value, payload: Bytes) -> Result<Self, ProtocolError> {
        let body = match cmd {
            Command::FindPeerReq => Body::FindPeerReq {
                target: req_str(v, "t")?,
            },
            Command::FindPeerResp => Body::FindPeerResp {
                result: result_of(v),
                reached: v.get_str_list("rc"),
            },
            Command::UpdateValueReq => Body::UpdateValueReq {
                table: req_str(v, "tb")?,
                key: req_str(v, "k")?,
                value: v
                    .get_bytes("v")
                    .cloned()
                    .ok_or_else(|| ProtocolError::Body("missing v".into()))?,
            },
            Command::UpdateValueResp => Body::UpdateValueResp {
                result: result_of(v),
                reached: v.get_str_list("rc"),
            },
            Command::FindValueReq => Body::FindValueReq {
                table: req_str(v, "tb")?,
                key: req_str(v, "k")?,
            },
            Command::FindValueResp => {
                let values = v
                    .get("vs")
                    .and_then(|vs| vs.as_dict())
                    .map(|vs| {
                        vs.iter()
                            .filter_map(|(k, val)| {
                                Some((
                                    std::str::from_utf8(k).ok()?.to_string(),
                                    val.as_bytes()?.clone(),
                                ))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Body::FindValueResp {
                    result: result_of(v),
                    values,
                    reached: v.get_str_list("rc"),
                }
            }
            Command::PingReq => Body::PingReq,
            Command::PingResp => Body::PingResp,
            Command::HandshakeReq => Body::HandshakeReq,
            Command::HandshakeResp => Body::HandshakeResp,
            Command::HoleCallReq => Body::HoleCallReq {
                target: req_str(v, "t")?,
                target_eps: v
                    .get_str_list("tep")
                    .iter()
                    .filter_map(|s| s.parse().ok())
                    .collect(),
            },
            Command::HoleCallResp => Body::HoleCallResp {
                result: result_of(v),
                target: v
                    .get("tp")
                    .map(peer_info_from_value)
                    .transpose()
                    .map_err(ProtocolError::Body)?,
            },
            Command::HoleCalledReq => Body::HoleCalledReq {
                source: v
                    .get("s")
                    .ok_or_else(|| ProtocolError::Body("missing s".into()))
                    .and_then(|s| peer_info_from_value(s).map_err(ProtocolError::Body))?,
            },
            Command::HoleCalledResp => Body::HoleCalledResp {
                result: result_of(v),
            },
            Command::BroadcastEventReq => Body::BroadcastEventReq {
                event: req_str(v, "ev")?,
                params: v.get_bytes("p").cloned().unwrap_or_default(),
                origin: req_str(v, "o")?,
                event_id: req_u32(v, "id")?,
                arrived: hashes_of(v, "a"),
                hashbits: v.get_u32("hb").unwrap_or(0).min(32) as u8,
            },
            Command::BroadcastEventResp => Body::BroadcastEventResp {
                result: result_of(v),
                arrived: hashes_of(v, "a"),
            },
            Command::PackagePieceReq => Body::PackagePieceReq {
                task_id: req_u32(v, "t")?,
                peerid: req_str(v, "p")?,
                max: req_u32(v, "m")?,
                no: req_u32(v, "n")?,
                payload,
            },
            Command::PackagePieceResp => Body::PackagePieceResp {
                task_id: req_u32(v, "t")?,
                no: req_u32(v, "n")?,
            },
            Command::CombinePackage => Body::CombinePackage {
                packages: v
                    .get_list("ps")
                    .map(|l| l.iter().filter_map(|p| p.as_bytes().cloned()).collect())
                    .unwrap_or_default(),
            },
        };
        Ok(body)
    }
}

fn req_str(v: &Value, key: &str) -> Result<String, ProtocolError> {
    v.get_str(key)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| ProtocolError::Body(format!("missing {key}")))
}

fn req_u32(v: &Value, key: &str) -> Result<u32, ProtocolError> {
    v.get_u32(key)
        .ok_or_else(|| ProtocolError::Body(format!("missing {key}")))
}

fn result_of(v: &Value) -> ResultCode {
    v.get_u32("r").map(ResultCode::from).unwrap_or(ResultCode::Failed)
}

fn hashes_value(hashes: &[PeerHash]) -> Value {
    Value::List(hashes.iter().map(|h| Value::from(*h)).collect())
}

fn hashes_of(v: &Value, key: &str) -> Vec<PeerHash> {
    v.get_list(key)
        .map(|l| l.iter().filter_map(|h| h.as_u32()).collect())
        .unwrap_or_default()
}
