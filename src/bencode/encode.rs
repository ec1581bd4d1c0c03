use super::value::Value;
use bytes::{BufMut, BytesMut};

/// Encodes a value into a fresh buffer.
///
/// Dictionary keys are written in sorted order, so equal values always
/// produce identical bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(encoded_len(value));
    encode_into(value, &mut buf);
    buf.to_vec()
}

/// Appends the encoding of `value` to `buf`.
pub fn encode_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Integer(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(b) => put_bytes(b, buf),
        Value::List(l) => {
            buf.put_u8(b'l');
            for item in l {
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(d) => {
            buf.put_u8(b'd');
            for (key, val) in d {
                put_bytes(key, buf);
                encode_into(val, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

/// Size of the encoding of `value` without producing it.
pub fn encoded_len(value: &Value) -> usize {
    match value {
        Value::Integer(i) => i.to_string().len() + 2,
        Value::Bytes(b) => string_len(b.len()),
        Value::List(l) => 2 + l.iter().map(encoded_len).sum::<usize>(),
        Value::Dict(d) => {
            2 + d
                .iter()
                .map(|(k, v)| string_len(k.len()) + encoded_len(v))
                .sum::<usize>()
        }
    }
}

fn string_len(len: usize) -> usize {
    len.to_string().len() + 1 + len
}

fn put_bytes(bytes: &[u8], buf: &mut BytesMut) {
    buf.put_slice(bytes.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(bytes);
}
