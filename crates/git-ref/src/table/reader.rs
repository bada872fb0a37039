//! Reads a single table file back into its ref records, log records, and
//! obj-index.
//!
//! The writer never emits more than a handful of blocks for the table
//! sizes this core is built for, so the reader scans every block
//! sequentially rather than walking the footer's index offsets with a
//! binary search — see the open-question note in the design ledger.

use git_hash::{HashAlgorithm, Hasher};

use crate::error::RefError;

use super::block::{self, KIND_INDEX, KIND_LOG, KIND_OBJ, KIND_REF};
use super::record::{LogRecord, RefRecord};
use super::varint;

const MAGIC: &[u8; 4] = b"REFT";
const HEADER_LEN: usize = 4 + 1 + 3 + 8 + 8 + 4;
const FOOTER_OFFSETS_LEN: usize = 8 * 5;

pub struct Table {
    pub algo: HashAlgorithm,
    pub min_update_index: u64,
    pub max_update_index: u64,
    pub refs: Vec<RefRecord>,
    pub logs: Vec<LogRecord>,
    /// OID bytes -> ref-block byte offsets that mention it, for future
    /// point lookups; the full scan above already has the decoded refs,
    /// so nothing in this reader currently needs to dereference through
    /// it besides exposing it for `Stack`'s contains-oid queries.
    pub obj_index: Vec<(Vec<u8>, Vec<u64>)>,
}

impl Table {
    /// Parse a complete table file image.
    pub fn parse(data: &[u8]) -> Result<Self, RefError> {
        if data.len() < HEADER_LEN {
            return Err(RefError::CorruptTable("table shorter than header".into()));
        }
        if &data[0..4] != MAGIC {
            return Err(RefError::CorruptTable("bad magic".into()));
        }
        let _version = data[4];
        let min_update_index = u64::from_be_bytes(data[8..16].try_into().unwrap());
        let max_update_index = u64::from_be_bytes(data[16..24].try_into().unwrap());
        let format_id = u32::from_be_bytes(data[24..28].try_into().unwrap());
        let algo = HashAlgorithm::from_format_id(format_id)
            .ok_or_else(|| RefError::CorruptTable("unknown hash algorithm id".into()))?;

        let hash_len = algo.digest_len();
        let footer_len = FOOTER_OFFSETS_LEN + hash_len;
        if data.len() < HEADER_LEN + footer_len {
            return Err(RefError::CorruptTable("table shorter than footer".into()));
        }
        let footer_start = data.len() - footer_len;
        let body_end = footer_start + FOOTER_OFFSETS_LEN;

        let computed = Hasher::digest(algo, &data[..body_end])
            .map_err(|e| RefError::CorruptTable(format!("failed to hash table: {e}")))?;
        if computed.as_bytes() != &data[body_end..] {
            return Err(RefError::CorruptTable("footer hash mismatch".into()));
        }

        let mut refs = Vec::new();
        let mut logs = Vec::new();
        let mut obj_index = Vec::new();

        let mut pos = HEADER_LEN;
        while pos < footer_start {
            if data.len() < pos + 4 {
                return Err(RefError::CorruptTable("truncated block header".into()));
            }
            let kind = data[pos];
            let len = u32::from_be_bytes([0, data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
            if len == 0 || pos + len > footer_start {
                return Err(RefError::CorruptTable("block length overruns table".into()));
            }
            let block = &data[pos..pos + len];
            match kind {
                KIND_REF => refs.extend(block::decode_ref_block(algo, block)?),
                KIND_LOG => logs.extend(block::decode_log_block(algo, block)?),
                KIND_OBJ => {
                    for (oid, value) in block::decode_block_generic(KIND_OBJ, block)? {
                        let (count, mut n) = varint::read(&value)
                            .ok_or_else(|| RefError::CorruptTable("truncated obj entry count".into()))?;
                        let mut offsets = Vec::with_capacity(count as usize);
                        let mut prev = 0u64;
                        for _ in 0..count {
                            let (delta, consumed) = varint::read(&value[n..])
                                .ok_or_else(|| RefError::CorruptTable("truncated obj offset".into()))?;
                            prev += delta;
                            offsets.push(prev);
                            n += consumed;
                        }
                        obj_index.push((oid, offsets));
                    }
                }
                KIND_INDEX => {
                    // Sparse index over ref/log blocks; unused by the
                    // sequential scan reader.
                }
                other => {
                    return Err(RefError::CorruptTable(format!("unknown block kind {other}")));
                }
            }
            pos += len;
        }

        Ok(Table {
            algo,
            min_update_index,
            max_update_index,
            refs,
            logs,
            obj_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::record::RefValue;
    use super::super::writer::TableBuilder;
    use super::*;
    use crate::name::RefName;
    use git_hash::ObjectId;

    fn oid(b: u8) -> ObjectId {
        ObjectId::from_bytes(&[b; 20], HashAlgorithm::Sha1).unwrap()
    }

    #[test]
    fn roundtrip_refs_only() {
        let records = vec![
            RefRecord {
                name: RefName::new("refs/heads/main").unwrap(),
                value: RefValue::Direct(oid(1)),
            },
            RefRecord {
                name: RefName::new("refs/heads/topic").unwrap(),
                value: RefValue::Direct(oid(2)),
            },
        ];
        let builder = TableBuilder {
            algo: HashAlgorithm::Sha1,
            min_update_index: 1,
            max_update_index: 1,
        };
        let bytes = builder.build(&records, &[]).unwrap();
        let table = Table::parse(&bytes).unwrap();
        assert_eq!(table.refs, records);
        assert!(table.logs.is_empty());
        assert_eq!(table.min_update_index, 1);
        assert_eq!(table.max_update_index, 1);
        assert_eq!(table.obj_index.len(), 2);
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let mut bytes = vec![0u8; HEADER_LEN + FOOTER_OFFSETS_LEN + 20];
        bytes[0..4].copy_from_slice(b"XXXX");
        assert!(matches!(Table::parse(&bytes), Err(RefError::CorruptTable(_))));
    }

    #[test]
    fn tampered_body_fails_footer_hash_check() {
        let records = vec![RefRecord {
            name: RefName::new("refs/heads/main").unwrap(),
            value: RefValue::Direct(oid(1)),
        }];
        let builder = TableBuilder {
            algo: HashAlgorithm::Sha1,
            min_update_index: 1,
            max_update_index: 1,
        };
        let mut bytes = builder.build(&records, &[]).unwrap();
        let flip_pos = HEADER_LEN + 2;
        bytes[flip_pos] ^= 0xff;
        assert!(matches!(Table::parse(&bytes), Err(RefError::CorruptTable(_))));
    }
}
