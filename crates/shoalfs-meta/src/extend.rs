//! Extended attributes: one ordered name → bytes map per inode.

use std::collections::BTreeMap;

use crate::types::{InodeId, MetaError};

/// The extended-attribute set of a single inode.
///
/// Attributes are kept in a `BTreeMap` so the canonical encoding is
/// byte-stable regardless of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Extend {
    /// Owning inode.
    pub ino: InodeId,
    /// Attribute name to value.
    pub attrs: BTreeMap<String, Vec<u8>>,
}

impl Extend {
    /// Creates an empty attribute set for `ino`.
    pub fn new(ino: InodeId) -> Self {
        Self {
            ino,
            attrs: BTreeMap::new(),
        }
    }

    /// The 8-byte big-endian tree key.
    pub fn key(&self) -> Vec<u8> {
        self.ino.as_u64().to_be_bytes().to_vec()
    }

    /// Sets one attribute, returning the previous value if any.
    pub fn set(&mut self, name: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        self.attrs.insert(name.to_string(), value)
    }

    /// Removes one attribute, returning true if it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.attrs.remove(name).is_some()
    }

    /// Looks up one attribute.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.attrs.get(name).map(|v| v.as_slice())
    }

    /// Returns true if no attributes remain.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Encodes the full canonical record.
    pub fn encode(&self) -> Vec<u8> {
        let mut val = Vec::new();
        val.extend_from_slice(&(self.attrs.len() as u32).to_be_bytes());
        for (name, value) in &self.attrs {
            val.extend_from_slice(&(name.len() as u32).to_be_bytes());
            val.extend_from_slice(name.as_bytes());
            val.extend_from_slice(&(value.len() as u32).to_be_bytes());
            val.extend_from_slice(value);
        }
        let mut buf = Vec::with_capacity(16 + val.len());
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(&self.ino.as_u64().to_be_bytes());
        buf.extend_from_slice(&(val.len() as u32).to_be_bytes());
        buf.extend_from_slice(&val);
        buf
    }

    /// Decodes a canonical record.
    pub fn decode(buf: &[u8]) -> Result<Self, MetaError> {
        if buf.len() < 16 {
            return Err(MetaError::Codec("extend record truncated".to_string()));
        }
        let key_len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if key_len != 8 {
            return Err(MetaError::Codec(format!(
                "bad extend key length {}",
                key_len
            )));
        }
        let ino = InodeId::new(u64::from_be_bytes(buf[4..12].try_into().unwrap()));
        let val_len = u32::from_be_bytes(buf[12..16].try_into().unwrap()) as usize;
        let val = &buf[16..];
        if val.len() != val_len || val_len < 4 {
            return Err(MetaError::Codec("extend value malformed".to_string()));
        }
        let count = u32::from_be_bytes(val[0..4].try_into().unwrap());
        let mut attrs = BTreeMap::new();
        let mut off = 4;
        for _ in 0..count {
            if val.len() < off + 4 {
                return Err(MetaError::Codec("extend attr truncated".to_string()));
            }
            let name_len = u32::from_be_bytes(val[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            if val.len() < off + name_len + 4 {
                return Err(MetaError::Codec("extend attr truncated".to_string()));
            }
            let name = String::from_utf8(val[off..off + name_len].to_vec())
                .map_err(|_| MetaError::Codec("extend attr name is not utf-8".to_string()))?;
            off += name_len;
            let value_len = u32::from_be_bytes(val[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            if val.len() < off + value_len {
                return Err(MetaError::Codec("extend attr truncated".to_string()));
            }
            attrs.insert(name, val[off..off + value_len].to_vec());
            off += value_len;
        }
        if off != val_len {
            return Err(MetaError::Codec("extend value has trailing bytes".to_string()));
        }
        Ok(Self { ino, attrs })
    }
}
