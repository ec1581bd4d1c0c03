use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use super::body::Body;
use super::command::Command;
use super::common::CommonSection;
use super::error::ProtocolError;
use super::header::PackageHeader;
use crate::bencode::{self, Value};
use crate::config::ProtocolConfig;
use crate::constants::HEADER_LENGTH;
use crate::peer::{hash_peerid, NatType, PeerHash};

/// A decoded (or to be encoded) package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub src_hash: PeerHash,
    pub src_online_duration: u32,
    pub src_nat_type: NatType,
    pub dest_hash: PeerHash,
    pub seq: u32,
    pub ack_seq: u32,
    pub ttl: u8,
    pub body: Body,
    /// Absent only for piece carriers and combined packages.
    pub common: Option<CommonSection>,
}

impl Package {
    pub fn new(body: Body, common: Option<CommonSection>) -> Self {
        let src_hash = common.as_ref().map_or(0, |c| c.src.hash());
        Self {
            src_hash,
            src_online_duration: 0,
            src_nat_type: NatType::Unknown,
            dest_hash: 0,
            seq: 0,
            ack_seq: 0,
            ttl: 0,
            body,
            common,
        }
    }

    pub fn command(&self) -> Command {
        self.body.command()
    }

    pub fn is_resp(&self) -> bool {
        self.command().is_resp()
    }

    pub fn task_id(&self) -> Option<u32> {
        self.common.as_ref().and_then(|c| c.task_id)
    }

    /// Peer id of the sender, from the common section or the piece body.
    pub fn src_peerid(&self) -> Option<&str> {
        match (&self.common, &self.body) {
            (Some(common), _) => Some(common.src.peerid.as_str()),
            (None, Body::PackagePieceReq { peerid, .. }) => Some(peerid.as_str()),
            _ => None,
        }
    }
}

/// Encodes and decodes packages for one deployment (magic, version, app id)
/// and path MTU.
#[derive(Debug, Clone)]
pub struct PackageCodec {
    magic: u16,
    version: u16,
    app_id: u32,
    mtu: usize,
    max_ttl: u8,
}

impl PackageCodec {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            magic: config.magic,
            version: config.version,
            app_id: config.app_id,
            mtu: config.mtu,
            max_ttl: config.max_ttl,
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Encodes a package.
    ///
    /// When the result would exceed the MTU, recommended neighbors are
    /// dropped from the tail until it fits. A package that still does not fit
    /// is returned anyway; the sender splits it into pieces.
    pub fn encode(&self, pkg: &Package) -> Result<Bytes, ProtocolError> {
        let body = bencode::encode(&pkg.body.to_value());
        let body_len = body.len();

        let tail: Vec<u8> = match (&pkg.body, &pkg.common) {
            (Body::PackagePieceReq { payload, .. }, _) => payload.to_vec(),
            (Body::CombinePackage { .. }, _) | (_, None) => Vec::new(),
            (_, Some(common)) => {
                let mut nodes = common.nodes.len();
                loop {
                    let encoded = bencode::encode(&common.to_value(nodes));
                    if HEADER_LENGTH + body_len + encoded.len() <= self.mtu || nodes == 0 {
                        if nodes < common.nodes.len() {
                            trace!(
                                "trimmed {} neighbor hints to fit mtu",
                                common.nodes.len() - nodes
                            );
                        }
                        break encoded;
                    }
                    nodes -= 1;
                }
            }
        };

        let total = HEADER_LENGTH + body_len + tail.len();
        if total > u16::MAX as usize || body_len > u16::MAX as usize {
            return Err(ProtocolError::TooLarge(total));
        }

        let header = PackageHeader {
            magic: self.magic,
            version: self.version,
            cmd: pkg.command().as_u16(),
            total_len: total as u16,
            app_id: self.app_id,
            body_len: body_len as u16,
            src_hash: pkg.src_hash,
            src_online_duration: pkg.src_online_duration,
            src_nat_type: pkg.src_nat_type as u8,
            dest_hash: pkg.dest_hash,
            seq: pkg.seq,
            ack_seq: pkg.ack_seq,
            ttl: pkg.ttl,
        };

        let mut buf = BytesMut::with_capacity(total);
        header.write_to(&mut buf);
        buf.put_slice(&body);
        buf.put_slice(&tail);
        Ok(buf.freeze())
    }

    /// Decodes one package, validating the header and the sender's hash.
    pub fn decode(&self, data: &[u8]) -> Result<Package, ProtocolError> {
        let header = PackageHeader::read_from(data)?;

        if header.magic != self.magic {
            return Err(ProtocolError::BadMagic(header.magic));
        }
        if header.version != self.version {
            return Err(ProtocolError::BadVersion(header.version));
        }
        if header.app_id != self.app_id {
            return Err(ProtocolError::ForeignApp(header.app_id));
        }

        let total = header.total_len as usize;
        let body_end = HEADER_LENGTH + header.body_len as usize;
        if total > data.len() || total < HEADER_LENGTH {
            return Err(ProtocolError::Length {
                declared: total,
                actual: data.len(),
            });
        }
        if body_end > total {
            return Err(ProtocolError::Length {
                declared: body_end,
                actual: total,
            });
        }

        let cmd = Command::try_from(header.cmd)?;
        let body_value = if body_end > HEADER_LENGTH {
            bencode::decode(&data[HEADER_LENGTH..body_end])?
        } else {
            Value::dict().build()
        };
        let rest = &data[body_end..total];

        let (body, common) = if cmd.is_bare() {
            let body = Body::from_value(cmd, &body_value, Bytes::copy_from_slice(rest))?;
            (body, None)
        } else {
            let body = Body::from_value(cmd, &body_value, Bytes::new())?;
            let common = CommonSection::from_value(&bencode::decode(rest)?)?;
            (body, Some(common))
        };

        let claimed = match (&common, &body) {
            (Some(c), _) => Some(c.src.peerid.as_str()),
            (None, Body::PackagePieceReq { peerid, .. }) => Some(peerid.as_str()),
            _ => None,
        };
        if let Some(peerid) = claimed {
            if hash_peerid(peerid) != header.src_hash {
                return Err(ProtocolError::HashMismatch(peerid.to_string()));
            }
        }

        Ok(Package {
            src_hash: header.src_hash,
            src_online_duration: header.src_online_duration,
            src_nat_type: NatType::from(header.src_nat_type),
            dest_hash: header.dest_hash,
            seq: header.seq,
            ack_seq: header.ack_seq,
            ttl: header.ttl.min(self.max_ttl),
            body,
            common,
        })
    }

    /// Packs several encoded packages into one datagram.
    pub fn combine(&self, packages: Vec<Bytes>) -> Result<Bytes, ProtocolError> {
        self.encode(&Package::new(Body::CombinePackage { packages }, None))
    }
}
