//! Deterministic binary encoding of snapshots
//!
//! Used for revision files in the store and for snapshot replies on the wire.
//! All integers are big-endian:
//!
//! ```text
//! magic "DDSN" | version u8 | revision u64 (0 = uncommitted) | created_ms i64 | count u32
//! count x (path_len u16 | path | size u64 | mtime_secs i64 | mtime_nanos u32 | fingerprint [32] | mode u32)
//! checksum [32]   BLAKE3 of everything above
//! ```
//!
//! Records are written in path order, so equal snapshots always encode to
//! equal bytes.

use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::CodecError;
use crate::hash::{FINGERPRINT_LEN, Fingerprint};
use crate::snapshot::{FileRecord, RevisionId, Snapshot};

const MAGIC: &[u8; 4] = b"DDSN";
const VERSION: u8 = 1;

/// Encode a snapshot to bytes
#[must_use]
pub fn encode_snapshot(snapshot: &Snapshot) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 1 + 8 + 8 + 4 + snapshot.len() * 96 + FINGERPRINT_LEN);

    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&snapshot.revision.map_or(0, RevisionId::get).to_be_bytes());
    let (created_secs, created_nanos) = split_time(snapshot.created);
    let created_ms = created_secs
        .saturating_mul(1000)
        .saturating_add(i64::from(created_nanos / 1_000_000));
    buf.extend_from_slice(&created_ms.to_be_bytes());
    buf.extend_from_slice(&(snapshot.files.len() as u32).to_be_bytes());

    for record in snapshot.files.values() {
        encode_record(&mut buf, record);
    }

    let checksum = blake3::hash(&buf);
    buf.extend_from_slice(checksum.as_bytes());
    buf
}

fn encode_record(buf: &mut Vec<u8>, record: &FileRecord) {
    let path = record.path.to_string_lossy();
    let path_bytes = path.as_bytes();
    buf.extend_from_slice(&(path_bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(path_bytes);

    buf.extend_from_slice(&record.size.to_be_bytes());

    let (secs, nanos) = split_time(record.modified);
    buf.extend_from_slice(&secs.to_be_bytes());
    buf.extend_from_slice(&nanos.to_be_bytes());

    buf.extend_from_slice(record.fingerprint.as_bytes());
    buf.extend_from_slice(&record.mode.to_be_bytes());
}

/// Decode and validate a snapshot
///
/// # Errors
/// Returns a [`CodecError`] for truncated, tampered or malformed input.
pub fn decode_snapshot(data: &[u8]) -> Result<Snapshot, CodecError> {
    if data.len() < FINGERPRINT_LEN {
        return Err(CodecError::Truncated);
    }
    let (body, checksum) = data.split_at(data.len() - FINGERPRINT_LEN);

    // Cheap structural checks first so garbage gets a precise error
    if body.len() >= 4 && &body[..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    if blake3::hash(body).as_bytes() != checksum {
        return Err(CodecError::ChecksumMismatch);
    }

    let mut cursor = Cursor::new(body);

    let magic: [u8; 4] = read_array(&mut cursor)?;
    if &magic != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let [version] = read_array::<1>(&mut cursor)?;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let revision = u64::from_be_bytes(read_array(&mut cursor)?);
    let created_ms = i64::from_be_bytes(read_array(&mut cursor)?);
    let count = u32::from_be_bytes(read_array(&mut cursor)?) as usize;

    let mut snapshot = Snapshot::empty();
    snapshot.revision = (revision != 0).then_some(RevisionId(revision));
    snapshot.created = join_time(
        created_ms.div_euclid(1000),
        (created_ms.rem_euclid(1000) as u32) * 1_000_000,
    );

    let mut previous: Option<PathBuf> = None;
    for _ in 0..count {
        let record = decode_record(&mut cursor)?;
        if previous.as_ref().is_some_and(|p| *p >= record.path) {
            return Err(CodecError::Unordered(record.path));
        }
        previous = Some(record.path.clone());
        snapshot.files.insert(record.path.clone(), record);
    }

    let trailing = body.len() - cursor.position() as usize;
    if trailing != 0 {
        return Err(CodecError::TrailingBytes(trailing));
    }

    Ok(snapshot)
}

fn decode_record(cursor: &mut Cursor<&[u8]>) -> Result<FileRecord, CodecError> {
    let path_len = u16::from_be_bytes(read_array(cursor)?) as usize;
    let mut path_buf = vec![0u8; path_len];
    cursor
        .read_exact(&mut path_buf)
        .map_err(|_| CodecError::Truncated)?;
    let path = String::from_utf8(path_buf).map_err(|_| CodecError::InvalidPath)?;

    let size = u64::from_be_bytes(read_array(cursor)?);
    let secs = i64::from_be_bytes(read_array(cursor)?);
    let nanos = u32::from_be_bytes(read_array(cursor)?);
    let fingerprint = Fingerprint::from_raw(read_array(cursor)?);
    let mode = u32::from_be_bytes(read_array(cursor)?);

    Ok(FileRecord {
        path: PathBuf::from(path),
        size,
        modified: join_time(secs, nanos),
        fingerprint,
        mode,
    })
}

fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>) -> Result<[u8; N], CodecError> {
    let mut buf = [0u8; N];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| CodecError::Truncated)?;
    Ok(buf)
}

/// Split a timestamp into whole seconds relative to the epoch plus a
/// non-negative sub-second part
pub(crate) fn split_time(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => {
            // Pre-epoch: floor towards negative infinity
            let d = e.duration();
            let secs = -(d.as_secs() as i64);
            match d.subsec_nanos() {
                0 => (secs, 0),
                n => (secs - 1, 1_000_000_000 - n),
            }
        }
    }
}

pub(crate) fn join_time(secs: i64, nanos: u32) -> SystemTime {
    let nanos = Duration::from_nanos(u64::from(nanos.min(999_999_999)));
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}
