//! Directory entries, live and trash tier, with their canonical layout.
//!
//! The live dentry key is `[u64 parent][name bytes]`, so byte comparison
//! orders entries first by parent and then lexicographically by name. The
//! trash key appends `[0x00][u64 timestamp][u64 deleted-ino]` after the
//! name; the NUL separator keeps the (parent, name, timestamp, ino) order
//! stable under plain byte comparison on every backend. Names never
//! contain NUL (rejected at the packet layer).

use crate::types::{InodeId, MetaError};

/// A live directory entry mapping (parent, name) to a child inode.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Dentry {
    /// Parent directory inode.
    pub parent: InodeId,
    /// Entry name.
    pub name: String,
    /// Child inode.
    pub ino: InodeId,
    /// Child file type bits (S_IFMT of the child's mode).
    pub dtype: u32,
}

/// Builds the tree key for a (parent, name) pair.
pub fn dentry_key(parent: InodeId, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + name.len());
    key.extend_from_slice(&parent.as_u64().to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

/// Builds the half-open key range covering every entry under `parent`.
pub fn dentry_parent_range(parent: InodeId) -> (Vec<u8>, Vec<u8>) {
    let start = parent.as_u64().to_be_bytes().to_vec();
    let end = (parent.as_u64() + 1).to_be_bytes().to_vec();
    (start, end)
}

impl Dentry {
    /// The tree key for this entry.
    pub fn key(&self) -> Vec<u8> {
        dentry_key(self.parent, &self.name)
    }

    /// Encodes the full canonical record.
    pub fn encode(&self) -> Vec<u8> {
        let key = self.key();
        let mut buf = Vec::with_capacity(8 + key.len() + 12);
        buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&key);
        buf.extend_from_slice(&12u32.to_be_bytes());
        buf.extend_from_slice(&self.ino.as_u64().to_be_bytes());
        buf.extend_from_slice(&self.dtype.to_be_bytes());
        buf
    }

    /// Decodes a canonical record.
    pub fn decode(buf: &[u8]) -> Result<Self, MetaError> {
        if buf.len() < 4 {
            return Err(MetaError::Codec("dentry record truncated".to_string()));
        }
        let key_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if key_len < 8 || buf.len() < 4 + key_len + 16 {
            return Err(MetaError::Codec("dentry record truncated".to_string()));
        }
        let key = &buf[4..4 + key_len];
        let parent = InodeId::new(u64::from_be_bytes(key[0..8].try_into().unwrap()));
        let name = String::from_utf8(key[8..].to_vec())
            .map_err(|_| MetaError::Codec("dentry name is not utf-8".to_string()))?;
        let rest = &buf[4 + key_len..];
        let val_len = u32::from_be_bytes(rest[0..4].try_into().unwrap());
        if val_len != 12 || rest.len() != 16 {
            return Err(MetaError::Codec("dentry value malformed".to_string()));
        }
        let ino = InodeId::new(u64::from_be_bytes(rest[4..12].try_into().unwrap()));
        let dtype = u32::from_be_bytes(rest[12..16].try_into().unwrap());
        Ok(Self {
            parent,
            name,
            ino,
            dtype,
        })
    }
}

/// A trash-tier directory entry. The same (parent, name) may appear many
/// times with distinct deletion timestamps.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeletedDentry {
    /// Parent directory inode.
    pub parent: InodeId,
    /// Entry name at deletion time.
    pub name: String,
    /// Deletion timestamp (unix seconds), supplied by the proposing leader.
    pub timestamp: u64,
    /// The child inode the entry pointed at.
    pub ino: InodeId,
    /// Child file type bits.
    pub dtype: u32,
    /// Address of the client that deleted the entry.
    pub from: String,
}

/// Builds the half-open trash key range covering every deleted entry under
/// `parent`.
pub fn deleted_dentry_parent_range(parent: InodeId) -> (Vec<u8>, Vec<u8>) {
    dentry_parent_range(parent)
}

/// Builds the trash key range covering every deletion of (parent, name).
pub fn deleted_dentry_name_range(parent: InodeId, name: &str) -> (Vec<u8>, Vec<u8>) {
    let mut start = dentry_key(parent, name);
    start.push(0);
    let mut end = start.clone();
    end.extend_from_slice(&u64::MAX.to_be_bytes());
    end.extend_from_slice(&u64::MAX.to_be_bytes());
    (start, end)
}

impl DeletedDentry {
    /// Moves a live dentry into the trash tier.
    pub fn from_dentry(d: &Dentry, timestamp: u64, from: &str) -> Self {
        Self {
            parent: d.parent,
            name: d.name.clone(),
            timestamp,
            ino: d.ino,
            dtype: d.dtype,
            from: from.to_string(),
        }
    }

    /// Restores the original live dentry.
    pub fn restore(&self) -> Dentry {
        Dentry {
            parent: self.parent,
            name: self.name.clone(),
            ino: self.ino,
            dtype: self.dtype,
        }
    }

    /// The tree key: `[parent][name][0x00][timestamp][ino]`.
    pub fn key(&self) -> Vec<u8> {
        let mut key = dentry_key(self.parent, &self.name);
        key.push(0);
        key.extend_from_slice(&self.timestamp.to_be_bytes());
        key.extend_from_slice(&self.ino.as_u64().to_be_bytes());
        key
    }

    /// Encodes the full canonical record.
    pub fn encode(&self) -> Vec<u8> {
        let key = self.key();
        let mut val = Vec::with_capacity(16 + self.from.len());
        val.extend_from_slice(&self.ino.as_u64().to_be_bytes());
        val.extend_from_slice(&self.dtype.to_be_bytes());
        val.extend_from_slice(&(self.from.len() as u32).to_be_bytes());
        val.extend_from_slice(self.from.as_bytes());

        let mut buf = Vec::with_capacity(8 + key.len() + val.len());
        buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&key);
        buf.extend_from_slice(&(val.len() as u32).to_be_bytes());
        buf.extend_from_slice(&val);
        buf
    }

    /// Decodes a canonical record.
    pub fn decode(buf: &[u8]) -> Result<Self, MetaError> {
        if buf.len() < 4 {
            return Err(MetaError::Codec(
                "deleted-dentry record truncated".to_string(),
            ));
        }
        let key_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        // Smallest key: parent + separator + timestamp + ino with empty name.
        if key_len < 25 || buf.len() < 4 + key_len + 4 {
            return Err(MetaError::Codec(
                "deleted-dentry record truncated".to_string(),
            ));
        }
        let key = &buf[4..4 + key_len];
        let parent = InodeId::new(u64::from_be_bytes(key[0..8].try_into().unwrap()));
        let name_end = key_len - 17;
        if key[name_end] != 0 {
            return Err(MetaError::Codec(
                "deleted-dentry key separator missing".to_string(),
            ));
        }
        let name = String::from_utf8(key[8..name_end].to_vec())
            .map_err(|_| MetaError::Codec("deleted-dentry name is not utf-8".to_string()))?;
        let timestamp = u64::from_be_bytes(key[name_end + 1..name_end + 9].try_into().unwrap());
        let key_ino = u64::from_be_bytes(key[name_end + 9..].try_into().unwrap());

        let rest = &buf[4 + key_len..];
        let val_len = u32::from_be_bytes(rest[0..4].try_into().unwrap()) as usize;
        let val = &rest[4..];
        if val.len() != val_len || val_len < 16 {
            return Err(MetaError::Codec(
                "deleted-dentry value malformed".to_string(),
            ));
        }
        let ino = InodeId::new(u64::from_be_bytes(val[0..8].try_into().unwrap()));
        if ino.as_u64() != key_ino {
            return Err(MetaError::Codec(
                "deleted-dentry key/value inode mismatch".to_string(),
            ));
        }
        let dtype = u32::from_be_bytes(val[8..12].try_into().unwrap());
        let from_len = u32::from_be_bytes(val[12..16].try_into().unwrap()) as usize;
        if val.len() != 16 + from_len {
            return Err(MetaError::Codec(
                "deleted-dentry deleter address truncated".to_string(),
            ));
        }
        let from = String::from_utf8(val[16..].to_vec())
            .map_err(|_| MetaError::Codec("deleted-dentry address is not utf-8".to_string()))?;
        Ok(Self {
            parent,
            name,
            timestamp,
            ino,
            dtype,
            from,
        })
    }
}
