use bytes::{Buf, BufMut};

use super::error::ProtocolError;
use crate::constants::HEADER_LENGTH;

/// The fixed 36-byte little-endian package header.
///
/// ```text
/// 0      2        4    6          8       12       14        18          22  23        27   31       35  36
/// +------+--------+----+----------+-------+--------+---------+-----------+---+---------+----+--------+---+
/// |magic |version |cmd |total_len |app_id |body_len|src_hash |src_online |nat|dest_hash|seq |ack_seq |ttl|
/// +------+--------+----+----------+-------+--------+---------+-----------+---+---------+----+--------+---+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackageHeader {
    pub magic: u16,
    pub version: u16,
    pub cmd: u16,
    pub total_len: u16,
    pub app_id: u32,
    pub body_len: u16,
    pub src_hash: u32,
    pub src_online_duration: u32,
    pub src_nat_type: u8,
    pub dest_hash: u32,
    pub seq: u32,
    pub ack_seq: u32,
    pub ttl: u8,
}

impl PackageHeader {
    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.magic);
        buf.put_u16_le(self.version);
        buf.put_u16_le(self.cmd);
        buf.put_u16_le(self.total_len);
        buf.put_u32_le(self.app_id);
        buf.put_u16_le(self.body_len);
        buf.put_u32_le(self.src_hash);
        buf.put_u32_le(self.src_online_duration);
        buf.put_u8(self.src_nat_type);
        buf.put_u32_le(self.dest_hash);
        buf.put_u32_le(self.seq);
        buf.put_u32_le(self.ack_seq);
        buf.put_u8(self.ttl);
    }

    pub fn read_from(mut data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LENGTH {
            return Err(ProtocolError::TooShort(data.len()));
        }
        Ok(Self {
            magic: data.get_u16_le(),
            version: data.get_u16_le(),
            cmd: data.get_u16_le(),
            total_len: data.get_u16_le(),
            app_id: data.get_u32_le(),
            body_len: data.get_u16_le(),
            src_hash: data.get_u32_le(),
            src_online_duration: data.get_u32_le(),
            src_nat_type: data.get_u8(),
            dest_hash: data.get_u32_le(),
            seq: data.get_u32_le(),
            ack_seq: data.get_u32_le(),
            ttl: data.get_u8(),
        })
    }
}
