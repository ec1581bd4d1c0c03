use std::collections::BTreeMap;

use bytes::Bytes;

use super::*;

#[test]
fn test_decode_integer() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-42e").unwrap(), Value::Integer(-42));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
}

#[test]
fn test_decode_integer_invalid() {
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"i03e").is_err());
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i12").is_err());
}

#[test]
fn test_decode_truncated_string() {
    assert!(matches!(decode(b"10:abc"), Err(BencodeError::UnexpectedEof(_))));
    assert!(matches!(
        decode(b"x:abc"),
        Err(BencodeError::UnexpectedByte { byte: b'x', .. })
    ));
}

#[test]
fn test_decode_rejects_non_string_key() {
    assert!(matches!(decode(b"di1ei2ee"), Err(BencodeError::NonStringKey)));
}

#[test]
fn test_decode_trailing_data() {
    assert!(matches!(decode(b"i1ei2e"), Err(BencodeError::TrailingData)));
}

#[test]
fn test_decode_nesting_limit() {
    let mut data = vec![b'l'; 40];
    data.extend(vec![b'e'; 40]);
    assert!(matches!(decode(&data), Err(BencodeError::NestingTooDeep)));
}

#[test]
fn test_section_accessors() {
    let value = decode(b"d2:epl13:udp@1.2.3.4:5e1:ii7e1:k1:v2:svd1:a1:bee").unwrap();
    assert_eq!(value.get_u32("i"), Some(7));
    assert_eq!(value.get_str("k"), Some("v"));
    assert_eq!(value.get_str_list("ep"), vec!["udp@1.2.3.4:5".to_string()]);
    assert_eq!(value.get_str_map("sv").get("a").map(String::as_str), Some("b"));
    assert_eq!(value.get_str("missing"), None);
    assert_eq!(value.get_u32("k"), None);
}

#[test]
fn test_negative_is_not_u32() {
    assert_eq!(Value::Integer(-1).as_u32(), None);
    assert_eq!(Value::Integer(u32::MAX as i64 + 1).as_u32(), None);
}

#[test]
fn test_encode_sorted_keys() {
    let value = Value::dict()
        .with("z", 1i64)
        .with("a", "x")
        .with_opt::<u32>("none", None)
        .build();
    assert_eq!(encode(&value), b"d1:a1:x1:zi1ee");
}

#[test]
fn test_encoded_len_matches() {
    let mut map = BTreeMap::new();
    map.insert("peer".to_string(), "info".to_string());
    let value = Value::dict()
        .with("n", Value::List(vec![Value::Integer(-12), Value::string("")]))
        .with("b", Bytes::from_static(&[0, 1, 2, 255]))
        .with("m", &map)
        .build();
    assert_eq!(encoded_len(&value), encode(&value).len());
}

#[test]
fn test_binary_payload_survives() {
    let payload = Bytes::from_static(&[0xff, 0x00, b'e', b':', b'd']);
    let value = Value::dict().with("v", payload.clone()).build();
    let decoded = decode(&encode(&value)).unwrap();
    assert_eq!(decoded.get_bytes("v"), Some(&payload));
}
