//! Record kinds stored inside reftable blocks: the four ref value types
//! from spec section 4.8 and the log entries that back per-reference
//! reflogs in the tabular backend.

use bstr::{BString, ByteSlice, ByteVec};
use git_hash::{HashAlgorithm, ObjectId};
use git_utils::date::{GitDate, Signature};

use crate::error::RefError;
use crate::name::RefName;

use super::varint;

/// Value-type tag occupying the low 3 bits of a ref record's type byte.
pub const REF_DELETION: u8 = 0;
pub const REF_DIRECT: u8 = 1;
pub const REF_DIRECT_PEELED: u8 = 2;
pub const REF_SYMBOLIC: u8 = 3;

/// A ref's value as stored in a reftable block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
    /// Tombstone: shadows the same name in any older table in the stack.
    Deletion,
    Direct(ObjectId),
    DirectWithPeeled(ObjectId, ObjectId),
    Symbolic(RefName),
}

/// A full ref record: the key (ref name) plus its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    pub name: RefName,
    pub value: RefValue,
}

impl RefRecord {
    pub fn key(&self) -> &[u8] {
        self.name.as_str().as_bytes()
    }

    /// Encode the value portion (type byte + payload) to `out`.
    pub fn encode_value(&self, algo: HashAlgorithm, out: &mut Vec<u8>) {
        match &self.value {
            RefValue::Deletion => out.push(REF_DELETION),
            RefValue::Direct(oid) => {
                out.push(REF_DIRECT);
                out.extend_from_slice(oid.as_bytes());
            }
            RefValue::DirectWithPeeled(oid, peeled) => {
                out.push(REF_DIRECT_PEELED);
                out.extend_from_slice(oid.as_bytes());
                out.extend_from_slice(peeled.as_bytes());
            }
            RefValue::Symbolic(target) => {
                out.push(REF_SYMBOLIC);
                let bytes = target.as_str().as_bytes();
                varint::write(bytes.len() as u64, out);
                out.extend_from_slice(bytes);
            }
        }
        let _ = algo;
    }

    /// Decode a value given the key (ref name) and the bytes following the
    /// key's suffix. Returns the record and the number of bytes consumed.
    pub fn decode_value(
        name: RefName,
        algo: HashAlgorithm,
        data: &[u8],
    ) -> Result<(Self, usize), RefError> {
        let tag = *data
            .first()
            .ok_or_else(|| RefError::Parse("truncated ref record".into()))?;
        let rest = &data[1..];
        let oid_len = algo.digest_len();
        let (value, consumed) = match tag {
            REF_DELETION => (RefValue::Deletion, 0),
            REF_DIRECT => {
                if rest.len() < oid_len {
                    return Err(RefError::Parse("truncated direct ref value".into()));
                }
                let oid = ObjectId::from_bytes(&rest[..oid_len], algo)?;
                (RefValue::Direct(oid), oid_len)
            }
            REF_DIRECT_PEELED => {
                if rest.len() < oid_len * 2 {
                    return Err(RefError::Parse("truncated peeled ref value".into()));
                }
                let oid = ObjectId::from_bytes(&rest[..oid_len], algo)?;
                let peeled = ObjectId::from_bytes(&rest[oid_len..oid_len * 2], algo)?;
                (RefValue::DirectWithPeeled(oid, peeled), oid_len * 2)
            }
            REF_SYMBOLIC => {
                let (len, n) = varint::read(rest)
                    .ok_or_else(|| RefError::Parse("truncated symbolic target length".into()))?;
                let len = len as usize;
                if rest.len() < n + len {
                    return Err(RefError::Parse("truncated symbolic target".into()));
                }
                let target_bytes = &rest[n..n + len];
                let target = RefName::new_unchecked(BString::from(target_bytes));
                (RefValue::Symbolic(target), n + len)
            }
            other => {
                return Err(RefError::Parse(format!("unknown ref value type {other}")));
            }
        };
        Ok((RefRecord { name, value }, 1 + consumed))
    }
}

/// A reflog entry's value, or a tombstone shadowing an older log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogValue {
    Deletion,
    Update {
        old_oid: ObjectId,
        new_oid: ObjectId,
        committer: Signature,
        message: BString,
    },
}

/// A log record: keyed by `refname \0 ~update_index` so that a lexical
/// scan of the key space yields, for each ref, newest-update-index first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub ref_name: RefName,
    pub update_index: u64,
    pub value: LogValue,
}

impl LogRecord {
    pub fn key(&self) -> Vec<u8> {
        let mut k = self.ref_name.as_str().as_bytes().to_vec();
        k.push(0);
        k.extend_from_slice(&(!self.update_index).to_be_bytes());
        k
    }

    /// Split an already-decoded key back into (ref_name, update_index).
    pub fn parse_key(key: &[u8]) -> Result<(RefName, u64), RefError> {
        let nul = key
            .iter()
            .rposition(|&b| b == 0)
            .ok_or_else(|| RefError::Parse("log key missing NUL separator".into()))?;
        if key.len() != nul + 1 + 8 {
            return Err(RefError::Parse("log key has wrong inverted-index width".into()));
        }
        let name_bytes = &key[..nul];
        let inv = u64::from_be_bytes(key[nul + 1..].try_into().unwrap());
        let name = RefName::new_unchecked(BString::from(name_bytes));
        Ok((name, !inv))
    }

    pub fn encode_value(&self, out: &mut Vec<u8>) {
        match &self.value {
            LogValue::Deletion => out.push(0),
            LogValue::Update {
                old_oid,
                new_oid,
                committer,
                message,
            } => {
                out.push(1);
                out.extend_from_slice(old_oid.as_bytes());
                out.extend_from_slice(new_oid.as_bytes());
                write_signature(committer, out);
                varint::write(message.len() as u64, out);
                out.extend_from_slice(message.as_bytes());
            }
        }
    }

    pub fn decode(key: &[u8], algo: HashAlgorithm, data: &[u8]) -> Result<(Self, usize), RefError> {
        let (ref_name, update_index) = Self::parse_key(key)?;
        let tag = *data
            .first()
            .ok_or_else(|| RefError::Parse("truncated log record".into()))?;
        let rest = &data[1..];
        let (value, consumed) = match tag {
            0 => (LogValue::Deletion, 0),
            1 => {
                let oid_len = algo.digest_len();
                if rest.len() < oid_len * 2 {
                    return Err(RefError::Parse("truncated log oids".into()));
                }
                let old_oid = ObjectId::from_bytes(&rest[..oid_len], algo)?;
                let new_oid = ObjectId::from_bytes(&rest[oid_len..oid_len * 2], algo)?;
                let mut pos = oid_len * 2;
                let (committer, n) = read_signature(&rest[pos..])?;
                pos += n;
                let (msg_len, n) = varint::read(&rest[pos..])
                    .ok_or_else(|| RefError::Parse("truncated log message length".into()))?;
                pos += n;
                let msg_len = msg_len as usize;
                if rest.len() < pos + msg_len {
                    return Err(RefError::Parse("truncated log message".into()));
                }
                let message = BString::from(&rest[pos..pos + msg_len]);
                pos += msg_len;
                (
                    LogValue::Update {
                        old_oid,
                        new_oid,
                        committer,
                        message,
                    },
                    pos,
                )
            }
            other => return Err(RefError::Parse(format!("unknown log value type {other}"))),
        };
        Ok((
            LogRecord {
                ref_name,
                update_index,
                value,
            },
            1 + consumed,
        ))
    }
}

fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_signature(sig: &Signature, out: &mut Vec<u8>) {
    let name = sig.name.as_bytes();
    let email = sig.email.as_bytes();
    varint::write(name.len() as u64, out);
    out.extend_from_slice(name);
    varint::write(email.len() as u64, out);
    out.extend_from_slice(email);
    varint::write(zigzag_encode(sig.date.timestamp), out);
    varint::write(zigzag_encode(sig.date.tz_offset as i64), out);
    // `tz_offset`'s magnitude alone cannot distinguish `-0000` from `+0000`;
    // carry the parsed sign as its own byte so a negative-zero offset
    // round-trips through the table the same way it does through the
    // commit/tag object encoding (§4.2).
    out.push(sig.date.tz_negative as u8);
}

fn read_signature(data: &[u8]) -> Result<(Signature, usize), RefError> {
    let mut pos = 0;
    let (name_len, n) =
        varint::read(&data[pos..]).ok_or_else(|| RefError::Parse("truncated signature name len".into()))?;
    pos += n;
    let name_len = name_len as usize;
    if data.len() < pos + name_len {
        return Err(RefError::Parse("truncated signature name".into()));
    }
    let name = BString::from(&data[pos..pos + name_len]);
    pos += name_len;

    let (email_len, n) =
        varint::read(&data[pos..]).ok_or_else(|| RefError::Parse("truncated signature email len".into()))?;
    pos += n;
    let email_len = email_len as usize;
    if data.len() < pos + email_len {
        return Err(RefError::Parse("truncated signature email".into()));
    }
    let email = BString::from(&data[pos..pos + email_len]);
    pos += email_len;

    let (ts, n) =
        varint::read(&data[pos..]).ok_or_else(|| RefError::Parse("truncated signature timestamp".into()))?;
    pos += n;
    let (tz, n) =
        varint::read(&data[pos..]).ok_or_else(|| RefError::Parse("truncated signature tz".into()))?;
    pos += n;

    let tz_negative = *data
        .get(pos)
        .ok_or_else(|| RefError::Parse("truncated signature tz sign".into()))?
        != 0;
    pos += 1;

    Ok((
        Signature {
            name,
            email,
            date: GitDate::new_with_sign(zigzag_decode(ts), zigzag_decode(tz) as i32, tz_negative),
        },
        pos,
    ))
}
