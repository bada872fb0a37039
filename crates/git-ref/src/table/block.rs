//! Block-level encoding shared by every section of a table file.
//!
//! Every block begins with a one-byte kind tag and a 24-bit big-endian
//! length, holds key-prefix-compressed records, and ends with a restart
//! offset table. Ref and log blocks carry typed values whose on-disk
//! width is self-describing (a type tag plus fixed-width payload); obj
//! and index blocks carry opaque values and so length-prefix them.

use git_hash::HashAlgorithm;

use crate::error::RefError;
use crate::name::RefName;

use super::record::{LogRecord, RefRecord};
use super::varint;

pub const KIND_REF: u8 = b'r';
pub const KIND_LOG: u8 = b'g';
pub const KIND_OBJ: u8 = b'o';
pub const KIND_INDEX: u8 = b'i';

/// Emit a full key at every Nth record so a scan can restart from any of
/// these offsets without needing the preceding record's key.
pub const RESTART_INTERVAL: usize = 16;

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Write the common key-prefix-compressed record stream into `body`,
/// returning the byte offset (within `body`) of every restart point.
/// `value_bytes` is emitted verbatim after each key — callers decide
/// whether that representation is self-describing (ref/log) or needs an
/// explicit length prefix (obj/index).
fn write_records<'a>(entries: impl Iterator<Item = (&'a [u8], &'a [u8])>) -> (Vec<u8>, Vec<u32>) {
    let mut body = Vec::new();
    let mut restarts = Vec::new();
    let mut prev_key: &[u8] = &[];
    let mut count = 0usize;

    for (key, value_bytes) in entries {
        let restart = count % RESTART_INTERVAL == 0;
        let shared = if restart { 0 } else { common_prefix_len(prev_key, key) };
        if restart {
            restarts.push(body.len() as u32);
        }
        let suffix = &key[shared..];
        varint::write(shared as u64, &mut body);
        varint::write(suffix.len() as u64, &mut body);
        body.extend_from_slice(suffix);
        body.extend_from_slice(value_bytes);
        prev_key = key;
        count += 1;
    }

    (body, restarts)
}

fn finish_block(kind: u8, body: Vec<u8>, restarts: &[u32]) -> Vec<u8> {
    let mut block = Vec::with_capacity(body.len() + restarts.len() * 4 + 8);
    block.push(kind);
    block.extend_from_slice(&[0, 0, 0]); // length placeholder, patched below
    block.extend_from_slice(&body);
    for r in restarts {
        block.extend_from_slice(&r.to_be_bytes());
    }
    block.extend_from_slice(&(restarts.len() as u32).to_be_bytes());

    let len_bytes = (block.len() as u32).to_be_bytes();
    block[1] = len_bytes[1];
    block[2] = len_bytes[2];
    block[3] = len_bytes[3];
    block
}

/// Validate a block's header/footer and return its records area.
fn records_area(kind: u8, block: &[u8]) -> Result<&[u8], RefError> {
    if block.len() < 8 || block[0] != kind {
        return Err(RefError::Parse("unexpected block kind".into()));
    }
    let declared_len = u32::from_be_bytes([0, block[1], block[2], block[3]]) as usize;
    if declared_len != block.len() {
        return Err(RefError::Parse("block length mismatch".into()));
    }
    let restart_count =
        u32::from_be_bytes(block[block.len() - 4..].try_into().unwrap()) as usize;
    let restarts_start = block
        .len()
        .checked_sub(4 + restart_count * 4)
        .ok_or_else(|| RefError::Parse("block restart table overruns block".into()))?;
    if restarts_start < 4 {
        return Err(RefError::Parse("block restart table overruns block".into()));
    }
    Ok(&block[4..restarts_start])
}

/// Walk a records area, reconstructing each entry's full key via prefix
/// expansion and handing the remaining bytes to `decode_value`, which
/// reports how many bytes of that remainder it consumed.
fn walk_records<T>(
    records: &[u8],
    mut decode_value: impl FnMut(&[u8], &[u8]) -> Result<(T, usize), RefError>,
) -> Result<Vec<T>, RefError> {
    let mut out = Vec::new();
    let mut pos = 0;
    let mut prev_key: Vec<u8> = Vec::new();
    while pos < records.len() {
        let (shared, n) = varint::read(&records[pos..])
            .ok_or_else(|| RefError::Parse("truncated record shared-len".into()))?;
        pos += n;
        let (suffix_len, n) = varint::read(&records[pos..])
            .ok_or_else(|| RefError::Parse("truncated record suffix-len".into()))?;
        pos += n;
        let suffix_len = suffix_len as usize;
        if shared as usize > prev_key.len() || records.len() < pos + suffix_len {
            return Err(RefError::Parse("truncated record suffix".into()));
        }
        let mut key = prev_key[..shared as usize].to_vec();
        key.extend_from_slice(&records[pos..pos + suffix_len]);
        pos += suffix_len;

        let (value, consumed) = decode_value(&key, &records[pos..])?;
        pos += consumed;
        prev_key = key;
        out.push(value);
    }
    Ok(out)
}

/// Encode opaque (key, value) pairs — used by the obj and index blocks,
/// whose values carry their own length prefix since there's no type tag
/// to infer width from.
pub fn encode_block_generic(kind: u8, entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let framed: Vec<(Vec<u8>, Vec<u8>)> = entries
        .iter()
        .map(|(k, v)| {
            let mut framed_value = Vec::new();
            varint::write(v.len() as u64, &mut framed_value);
            framed_value.extend_from_slice(v);
            (k.clone(), framed_value)
        })
        .collect();
    let (body, restarts) = write_records(framed.iter().map(|(k, v)| (k.as_slice(), v.as_slice())));
    finish_block(kind, body, &restarts)
}

pub fn decode_block_generic(kind: u8, block: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, RefError> {
    let records = records_area(kind, block)?;
    walk_records(records, |key, rest| {
        let (len, n) = varint::read(rest)
            .ok_or_else(|| RefError::Parse("truncated generic value length".into()))?;
        let len = len as usize;
        if rest.len() < n + len {
            return Err(RefError::Parse("truncated generic value".into()));
        }
        Ok(((key.to_vec(), rest[n..n + len].to_vec()), n + len))
    })
}

pub fn encode_ref_block(algo: HashAlgorithm, records: &[RefRecord]) -> Vec<u8> {
    let entries: Vec<(Vec<u8>, Vec<u8>)> = records
        .iter()
        .map(|r| {
            let mut v = Vec::new();
            r.encode_value(algo, &mut v);
            (r.key().to_vec(), v)
        })
        .collect();
    let (body, restarts) =
        write_records(entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())));
    finish_block(KIND_REF, body, &restarts)
}

pub fn decode_ref_block(algo: HashAlgorithm, block: &[u8]) -> Result<Vec<RefRecord>, RefError> {
    let records = records_area(KIND_REF, block)?;
    walk_records(records, |key, rest| {
        let name = RefName::new_unchecked(bstr::BString::from(key.to_vec()));
        RefRecord::decode_value(name, algo, rest)
    })
}

pub fn encode_log_block(records: &[LogRecord]) -> Vec<u8> {
    let entries: Vec<(Vec<u8>, Vec<u8>)> = records
        .iter()
        .map(|r| {
            let mut v = Vec::new();
            r.encode_value(&mut v);
            (r.key(), v)
        })
        .collect();
    let (body, restarts) =
        write_records(entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())));
    finish_block(KIND_LOG, body, &restarts)
}

pub fn decode_log_block(algo: HashAlgorithm, block: &[u8]) -> Result<Vec<LogRecord>, RefError> {
    let records = records_area(KIND_LOG, block)?;
    walk_records(records, |key, rest| LogRecord::decode(key, algo, rest))
}
