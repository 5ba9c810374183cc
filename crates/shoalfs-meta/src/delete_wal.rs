//! The extent-delete journal: a persistent, date-keyed list of extents
//! awaiting deletion on their data nodes.
//!
//! Journal keys are `[4 bytes packed YYMMDDHH][3 bytes seq][extent
//! record]` inside the backend's `ExtentDel` tree; values are empty. The
//! extent record participates in the key, so re-appending the same extent
//! is idempotent. Records dated before the replicated journal cursor are
//! eligible for reclamation; the cursor and post-ack removals replicate
//! through `SyncDelExtents`/`SyncDelExtentsV2`, keeping follower journals
//! rotating in lockstep. The journal survives restarts and is the source
//! of truth for which extents still need RPC.

use crate::backend::{MetaBackend, TreeTag, WriteBatch};
use crate::extent::ExtentKey;
use crate::types::MetaError;

/// Length of the date+sequence key prefix.
pub const WAL_PREFIX_LEN: usize = 7;

/// Packs a unix timestamp into the journal's `YYMMDDHH` date form.
pub fn pack_date(ts: u64) -> u64 {
    let days = (ts / 86_400) as i64;
    let hh = (ts % 86_400) / 3_600;
    let (y, m, d) = civil_from_days(days);
    let yy = (y.rem_euclid(100)) as u64;
    (yy << 24) | ((m as u64) << 16) | ((d as u64) << 8) | hh
}

/// Gregorian civil date from days since the unix epoch.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Builds a journal key.
pub fn wal_key(date: u64, seq: u32, ek: &ExtentKey) -> Vec<u8> {
    let mut key = Vec::with_capacity(WAL_PREFIX_LEN + ExtentKey::ENCODED_LEN);
    key.extend_from_slice(&(date as u32).to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes()[1..4]);
    ek.encode_to(&mut key);
    key
}

/// Splits a journal key into its date and extent record.
pub fn decode_wal_key(key: &[u8]) -> Result<(u64, ExtentKey), MetaError> {
    if key.len() != WAL_PREFIX_LEN + ExtentKey::ENCODED_LEN {
        return Err(MetaError::Codec(format!(
            "journal key has {} bytes",
            key.len()
        )));
    }
    let date = u32::from_be_bytes(key[0..4].try_into().unwrap()) as u64;
    let ek = ExtentKey::decode(&key[WAL_PREFIX_LEN..])?;
    Ok((date, ek))
}

/// Exclusive upper bound covering every record dated before `date`.
fn date_lower_bound(date: u64) -> Vec<u8> {
    let mut key = (date as u32).to_be_bytes().to_vec();
    key.extend_from_slice(&[0u8; 3]);
    key
}

/// Stages journal records for a batch of garbage extents under `date`.
pub fn stage_delete_extents(
    backend: &dyn MetaBackend,
    batch: &mut WriteBatch,
    date: u64,
    extents: &[ExtentKey],
) -> Result<(), MetaError> {
    for (seq, ek) in extents.iter().enumerate() {
        backend.put(
            batch,
            TreeTag::ExtentDel,
            wal_key(date, seq as u32, ek),
            Vec::new(),
            true,
        )?;
    }
    Ok(())
}

/// Collects every record dated strictly before `cursor`, as raw keys with
/// their decoded extents.
pub fn eligible_records(
    backend: &dyn MetaBackend,
    cursor: u64,
) -> Result<Vec<(Vec<u8>, ExtentKey)>, MetaError> {
    let upper = date_lower_bound(cursor);
    let mut out = Vec::new();
    backend.range(TreeTag::ExtentDel, &[], Some(&upper), &mut |k, _| {
        let (_, ek) = decode_wal_key(k)?;
        out.push((k.to_vec(), ek));
        Ok(true)
    })?;
    Ok(out)
}

/// Collects every record in the journal.
pub fn all_records(backend: &dyn MetaBackend) -> Result<Vec<(Vec<u8>, ExtentKey)>, MetaError> {
    let mut out = Vec::new();
    backend.range(TreeTag::ExtentDel, &[], None, &mut |k, _| {
        let (_, ek) = decode_wal_key(k)?;
        out.push((k.to_vec(), ek));
        Ok(true)
    })?;
    Ok(out)
}

/// Rotates the journal up to `cursor`: drops every record dated before
/// it, then re-inserts `keep` (the leader's surviving keys). This is the
/// apply-side of `SyncDelExtentsV2`.
pub fn rotate(
    backend: &dyn MetaBackend,
    batch: &mut WriteBatch,
    cursor: u64,
    keep: &[Vec<u8>],
) -> Result<(), MetaError> {
    let upper = date_lower_bound(cursor);
    let mut stale = Vec::new();
    backend.range(TreeTag::ExtentDel, &[], Some(&upper), &mut |k, _| {
        stale.push(k.to_vec());
        Ok(true)
    })?;
    for key in stale {
        backend.delete(batch, TreeTag::ExtentDel, &key)?;
    }
    for key in keep {
        backend.put(batch, TreeTag::ExtentDel, key.clone(), Vec::new(), true)?;
    }
    Ok(())
}
