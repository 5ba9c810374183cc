//! Multipart uploads: staged object parts keyed by (object key, upload ID).
//!
//! The tree key is `[object key][0x00][upload id]`; object keys never
//! contain NUL, so byte comparison orders uploads by key then ID.

use std::collections::BTreeMap;

use crate::types::MetaError;

/// One uploaded part of a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Part {
    /// Part number within the upload (1-based).
    pub id: u16,
    /// Inode holding the staged part data.
    pub ino: u64,
    /// Part size in bytes.
    pub size: u64,
    /// Upload timestamp (unix seconds).
    pub upload_ts: u64,
    /// CRC of the part payload.
    pub crc: u32,
}

impl Part {
    const ENCODED_LEN: usize = 30;

    fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.ino.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.upload_ts.to_be_bytes());
        buf.extend_from_slice(&self.crc.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self, MetaError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(MetaError::Codec("multipart part truncated".to_string()));
        }
        Ok(Self {
            id: u16::from_be_bytes(buf[0..2].try_into().unwrap()),
            ino: u64::from_be_bytes(buf[2..10].try_into().unwrap()),
            size: u64::from_be_bytes(buf[10..18].try_into().unwrap()),
            upload_ts: u64::from_be_bytes(buf[18..26].try_into().unwrap()),
            crc: u32::from_be_bytes(buf[26..30].try_into().unwrap()),
        })
    }
}

/// An in-progress multipart upload.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Multipart {
    /// Object key the upload targets.
    pub object_key: String,
    /// Upload session identifier.
    pub upload_id: String,
    /// Initiation timestamp (unix seconds).
    pub init_ts: u64,
    /// Uploaded parts, ordered by part number.
    pub parts: Vec<Part>,
    /// Upload metadata (content type, tagging, ...).
    pub metadata: BTreeMap<String, String>,
}

/// Builds the tree key for an (object key, upload ID) pair.
pub fn multipart_key(object_key: &str, upload_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(object_key.len() + 1 + upload_id.len());
    key.extend_from_slice(object_key.as_bytes());
    key.push(0);
    key.extend_from_slice(upload_id.as_bytes());
    key
}

impl Multipart {
    /// Creates an empty upload session.
    pub fn new(object_key: &str, upload_id: &str, init_ts: u64) -> Self {
        Self {
            object_key: object_key.to_string(),
            upload_id: upload_id.to_string(),
            init_ts,
            parts: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// The tree key for this upload.
    pub fn key(&self) -> Vec<u8> {
        multipart_key(&self.object_key, &self.upload_id)
    }

    /// Inserts a part in part-number order. Returns false if the part
    /// number is already present (the existing part wins).
    pub fn insert_part(&mut self, part: Part) -> bool {
        match self.parts.binary_search_by_key(&part.id, |p| p.id) {
            Ok(_) => false,
            Err(pos) => {
                self.parts.insert(pos, part);
                true
            }
        }
    }

    /// Looks up a part by number.
    pub fn part(&self, id: u16) -> Option<&Part> {
        self.parts
            .binary_search_by_key(&id, |p| p.id)
            .ok()
            .map(|i| &self.parts[i])
    }

    /// Encodes the full canonical record.
    pub fn encode(&self) -> Vec<u8> {
        let key = self.key();
        let mut val = Vec::new();
        val.extend_from_slice(&self.init_ts.to_be_bytes());
        val.extend_from_slice(&(self.parts.len() as u32).to_be_bytes());
        for p in &self.parts {
            p.encode_to(&mut val);
        }
        val.extend_from_slice(&(self.metadata.len() as u32).to_be_bytes());
        for (k, v) in &self.metadata {
            val.extend_from_slice(&(k.len() as u32).to_be_bytes());
            val.extend_from_slice(k.as_bytes());
            val.extend_from_slice(&(v.len() as u32).to_be_bytes());
            val.extend_from_slice(v.as_bytes());
        }
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
            return Err(MetaError::Codec("multipart record truncated".to_string()));
        }
        let key_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if buf.len() < 4 + key_len + 4 {
            return Err(MetaError::Codec("multipart record truncated".to_string()));
        }
        let key = &buf[4..4 + key_len];
        let sep = key
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| MetaError::Codec("multipart key separator missing".to_string()))?;
        let object_key = String::from_utf8(key[..sep].to_vec())
            .map_err(|_| MetaError::Codec("multipart object key is not utf-8".to_string()))?;
        let upload_id = String::from_utf8(key[sep + 1..].to_vec())
            .map_err(|_| MetaError::Codec("multipart upload id is not utf-8".to_string()))?;

        let rest = &buf[4 + key_len..];
        let val_len = u32::from_be_bytes(rest[0..4].try_into().unwrap()) as usize;
        let val = &rest[4..];
        if val.len() != val_len || val_len < 16 {
            return Err(MetaError::Codec("multipart value malformed".to_string()));
        }
        let init_ts = u64::from_be_bytes(val[0..8].try_into().unwrap());
        let part_count = u32::from_be_bytes(val[8..12].try_into().unwrap()) as usize;
        let mut off = 12;
        let mut parts = Vec::with_capacity(part_count);
        for _ in 0..part_count {
            if val.len() < off + Part::ENCODED_LEN {
                return Err(MetaError::Codec("multipart parts truncated".to_string()));
            }
            parts.push(Part::decode(&val[off..off + Part::ENCODED_LEN])?);
            off += Part::ENCODED_LEN;
        }
        if val.len() < off + 4 {
            return Err(MetaError::Codec("multipart metadata truncated".to_string()));
        }
        let meta_count = u32::from_be_bytes(val[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        let mut metadata = BTreeMap::new();
        for _ in 0..meta_count {
            let read_str = |off: &mut usize| -> Result<String, MetaError> {
                if val.len() < *off + 4 {
                    return Err(MetaError::Codec("multipart metadata truncated".to_string()));
                }
                let len = u32::from_be_bytes(val[*off..*off + 4].try_into().unwrap()) as usize;
                *off += 4;
                if val.len() < *off + len {
                    return Err(MetaError::Codec("multipart metadata truncated".to_string()));
                }
                let s = String::from_utf8(val[*off..*off + len].to_vec())
                    .map_err(|_| MetaError::Codec("multipart metadata is not utf-8".to_string()))?;
                *off += len;
                Ok(s)
            };
            let k = read_str(&mut off)?;
            let v = read_str(&mut off)?;
            metadata.insert(k, v);
        }
        if off != val_len {
            return Err(MetaError::Codec(
                "multipart value has trailing bytes".to_string(),
            ));
        }
        Ok(Self {
            object_key,
            upload_id,
            init_ts,
            parts,
            metadata,
        })
    }
}
