use bytes::Bytes;
use std::collections::BTreeMap;

/// A bencode value.
///
/// Package sections are dictionaries keyed by short ASCII names; the typed
/// accessors below return `None` both for absent keys and for values of the
/// wrong type, which lets section parsers treat the two alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A byte string (may or may not be valid UTF-8).
    Bytes(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary with byte string keys (sorted by key in the encoding).
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Creates a byte string value from a UTF-8 string.
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Starts building a dictionary.
    ///
    /// ```
    /// use natdht::bencode::Value;
    ///
    /// let v = Value::dict().with("r", 0i64).with_opt("tid", Some(7u32)).build();
    /// assert_eq!(v.get_u32("tid"), Some(7));
    /// ```
    pub fn dict() -> DictBuilder {
        DictBuilder::default()
    }

    /// A list of byte strings.
    pub fn str_list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Value::List(items.into_iter().map(|s| Value::string(s.as_ref())).collect())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// The integer value if it fits a `u32`.
    pub fn as_u32(&self) -> Option<u32> {
        self.as_integer().and_then(|i| u32::try_from(i).ok())
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns `None` if the value is not a byte string or is not valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key in this value if it is a dictionary.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(key.as_bytes())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key)?.as_u32()
    }

    pub fn get_bytes(&self, key: &str) -> Option<&Bytes> {
        self.get(key)?.as_bytes()
    }

    pub fn get_list(&self, key: &str) -> Option<&Vec<Value>> {
        self.get(key)?.as_list()
    }

    /// A list of UTF-8 strings; non-string items are skipped.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        self.get_list(key)
            .map(|l| l.iter().filter_map(|v| v.as_str()).map(String::from).collect())
            .unwrap_or_default()
    }

    /// A string-to-string dictionary; non-UTF-8 entries are skipped.
    pub fn get_str_map(&self, key: &str) -> BTreeMap<String, String> {
        self.get(key)
            .and_then(|v| v.as_dict())
            .map(|d| {
                d.iter()
                    .filter_map(|(k, v)| {
                        Some((std::str::from_utf8(k).ok()?.to_string(), v.as_str()?.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Incremental dictionary construction.
#[derive(Debug, Default)]
pub struct DictBuilder {
    entries: BTreeMap<Bytes, Value>,
}

impl DictBuilder {
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.entries
            .insert(Bytes::copy_from_slice(key.as_bytes()), value.into());
        self
    }

    /// Inserts the value only when present.
    pub fn with_opt<V: Into<Value>>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    pub fn build(self) -> Value {
        Value::Dict(self.entries)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<u8> for Value {
    fn from(i: u8) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(Bytes::from(s.into_bytes()))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<BTreeMap<Bytes, Value>> for Value {
    fn from(d: BTreeMap<Bytes, Value>) -> Self {
        Value::Dict(d)
    }
}

impl From<&BTreeMap<String, String>> for Value {
    fn from(map: &BTreeMap<String, String>) -> Self {
        Value::Dict(
            map.iter()
                .map(|(k, v)| (Bytes::copy_from_slice(k.as_bytes()), Value::string(v)))
                .collect(),
        )
    }
}
