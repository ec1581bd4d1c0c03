use std::collections::BTreeMap;
use std::fmt;

use super::error::PeerError;

/// Location of a service DHT in the service tree. The empty path is the
/// root DHT; `a/b` is the child `b` of service `a`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServicePath(Vec<String>);

impl ServicePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new<I, S>(segments: I) -> Result<Self, PeerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            if segment.is_empty() || segment.contains('/') {
                return Err(PeerError::InvalidServicePath(segments.join("/")));
            }
        }
        Ok(Self(segments))
    }

    /// Parses `a/b`; the empty string is the root.
    pub fn parse(s: &str) -> Result<Self, PeerError> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        Self::new(s.split('/'))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// True when `self` equals `other` or is one of its ancestors.
    pub fn contains(&self, other: &ServicePath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Every non-root prefix of the path, shortest first.
    pub fn lineage(&self) -> impl Iterator<Item = ServicePath> + '_ {
        (1..=self.0.len()).map(move |n| Self(self.0[..n].to_vec()))
    }
}

impl fmt::Display for ServicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// What a peer advertises for a service it serves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub flags: u32,
    pub info: BTreeMap<String, String>,
}
