//! Bencode serialization for package bodies and common sections.
//!
//! The fixed wire header is followed by two self-describing sections. Both
//! are bencoded dictionaries, which keeps the format extensible: unknown keys
//! are ignored by older peers and optional fields are simply absent.
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` → 42 |
//! | Byte String | `<length>:<data>` | `4:peer` → "peer" |
//! | List | `l<items>e` | `l1:ai7ee` → ["a", 7] |
//! | Dictionary | `d<key><value>...e` | `d2:id1:xe` → {"id": "x"} |
//!
//! # Examples
//!
//! ```
//! use natdht::bencode::{decode, encode, Value};
//!
//! let body = Value::dict()
//!     .with("tb", "users")
//!     .with("k", "alice")
//!     .build();
//! let encoded = encode(&body);
//! assert_eq!(encoded, b"d1:k5:alice2:tb5:userse");
//!
//! let decoded = decode(&encoded).unwrap();
//! assert_eq!(decoded.get_str("tb"), Some("users"));
//! ```

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::{encode, encode_into, encoded_len};
pub use error::BencodeError;
pub use value::{DictBuilder, Value};

#[cfg(test)]
mod tests;
