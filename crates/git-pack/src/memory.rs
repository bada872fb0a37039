//! Scratch in-memory pack backend.
//!
//! Accepts writes directly into memory so an incoming pack (e.g. the receive
//! side of a push) can be fully validated before any of its objects touch
//! disk. On [`MemoryPackBackend::dump`], objects are emitted as a well-formed
//! pack plus its companion index, ordered by a single reachability walk from
//! the commits passed to `dump`; objects the walk doesn't reach (because they
//! aren't wired into any given commit's tree, e.g. a straggler blob) fall back
//! to insertion order, appended after the reachable set.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use git_hash::hasher::Hasher;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::{Object, ObjectType};

use crate::entry::encode_entry_header;
use crate::write::encode_pack_index;
use crate::{PackError, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION};

struct Entry {
    obj_type: ObjectType,
    data: Vec<u8>,
    sequence: usize,
}

/// A scratch object store held entirely in memory.
pub struct MemoryPackBackend {
    objects: Mutex<HashMap<ObjectId, Entry>>,
    next_sequence: Mutex<usize>,
    hash_algo: HashAlgorithm,
}

impl MemoryPackBackend {
    /// Create an empty in-memory backend for the given hash algorithm.
    pub fn new(hash_algo: HashAlgorithm) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            next_sequence: Mutex::new(0),
            hash_algo,
        }
    }

    /// Write an object into memory, hashing its content. Idempotent: writing
    /// the same OID twice is a no-op that returns the existing OID.
    pub fn write(&self, obj_type: ObjectType, data: &[u8]) -> Result<ObjectId, PackError> {
        let oid = Hasher::hash_object(
            self.hash_algo,
            std::str::from_utf8(obj_type.as_bytes()).expect("object type keyword is ASCII"),
            data,
        )?;
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&oid) {
            return Ok(oid);
        }
        let mut seq = self.next_sequence.lock().unwrap();
        objects.insert(
            oid,
            Entry {
                obj_type,
                data: data.to_vec(),
                sequence: *seq,
            },
        );
        *seq += 1;
        Ok(oid)
    }

    /// Whether the given OID has been written into this backend.
    pub fn exists(&self, oid: &ObjectId) -> bool {
        self.objects.lock().unwrap().contains_key(oid)
    }

    /// Read an object previously written into this backend.
    pub fn read(&self, oid: &ObjectId) -> Option<(ObjectType, Vec<u8>)> {
        self.objects
            .lock()
            .unwrap()
            .get(oid)
            .map(|e| (e.obj_type, e.data.clone()))
    }

    /// Number of objects currently held.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Whether no objects have been written yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all in-memory state.
    pub fn reset(&self) {
        let mut objects = self.objects.lock().unwrap();
        objects.clear();
        *self.next_sequence.lock().unwrap() = 0;
    }

    /// Emit a well-formed pack and its index for every held object, written to
    /// `output`. Returns the pack checksum and the encoded index bytes so the
    /// caller can place them wherever it likes (a buffer, or `objects/pack/`).
    pub fn dump(
        &self,
        commits: &[ObjectId],
        output: &mut dyn Write,
    ) -> Result<(ObjectId, Vec<u8>), PackError> {
        let objects = self.objects.lock().unwrap();
        let ordered = reachability_order(&objects, commits);

        let mut hasher = Hasher::new(self.hash_algo);
        let mut position: u64 = 0;

        let mut header = [0u8; PACK_HEADER_SIZE];
        header[0..4].copy_from_slice(PACK_SIGNATURE);
        header[4..8].copy_from_slice(&PACK_VERSION.to_be_bytes());
        header[8..12].copy_from_slice(&(ordered.len() as u32).to_be_bytes());
        output.write_all(&header)?;
        hasher.update(&header);
        position += header.len() as u64;

        let mut index_entries: Vec<(ObjectId, u64, u32)> = Vec::with_capacity(ordered.len());

        for oid in &ordered {
            let entry = &objects[oid];
            let type_num = match entry.obj_type {
                ObjectType::Commit => 1,
                ObjectType::Tree => 2,
                ObjectType::Blob => 3,
                ObjectType::Tag => 4,
            };
            let entry_header = encode_entry_header(type_num, entry.data.len() as u64);

            let mut compressed = Vec::new();
            {
                let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
                encoder.write_all(&entry.data)?;
                encoder.finish()?;
            }

            let mut crc = crc32fast::Hasher::new();
            crc.update(&entry_header);
            crc.update(&compressed);
            let crc_val = crc.finalize();

            let offset = position;
            output.write_all(&entry_header)?;
            output.write_all(&compressed)?;
            hasher.update(&entry_header);
            hasher.update(&compressed);
            position += (entry_header.len() + compressed.len()) as u64;

            index_entries.push((*oid, offset, crc_val));
        }

        let checksum = hasher.finalize().map_err(PackError::Hash)?;
        output.write_all(checksum.as_bytes())?;

        let index_bytes = encode_pack_index(&mut index_entries, &checksum)?;

        Ok((checksum, index_bytes))
    }

    /// Convenience wrapper: dump into `dir/pack-<checksum>.{pack,idx}`.
    /// Returns the paths written.
    pub fn dump_to_dir(
        &self,
        dir: &Path,
        commits: &[ObjectId],
    ) -> Result<(PathBuf, PathBuf), PackError> {
        let mut pack_bytes = Vec::new();
        let (checksum, index_bytes) = self.dump(commits, &mut pack_bytes)?;

        std::fs::create_dir_all(dir)?;
        let pack_path = dir.join(format!("pack-{checksum}.pack"));
        let idx_path = dir.join(format!("pack-{checksum}.idx"));
        std::fs::write(&pack_path, &pack_bytes)?;
        std::fs::write(&idx_path, &index_bytes)?;

        Ok((pack_path, idx_path))
    }
}

/// Order held objects by a reachability walk from `commits`: each commit's
/// tree is walked depth-first, visiting tree entries in the order they were
/// serialized. Objects never reached by any of the given commits (including
/// the degenerate case of an empty `commits` slice) are appended afterward in
/// insertion order, so `dump` is still total over everything written.
fn reachability_order(
    objects: &HashMap<ObjectId, Entry>,
    commits: &[ObjectId],
) -> Vec<ObjectId> {
    let mut visited: HashSet<ObjectId> = HashSet::new();
    let mut ordered: Vec<ObjectId> = Vec::new();

    for &commit_oid in commits {
        let mut queue: VecDeque<ObjectId> = VecDeque::new();
        queue.push_back(commit_oid);

        while let Some(oid) = queue.pop_front() {
            if !visited.insert(oid) {
                continue;
            }
            let Some(entry) = objects.get(&oid) else {
                // Base lives outside this in-memory backend (e.g. already on disk).
                continue;
            };
            ordered.push(oid);

            match entry.obj_type {
                ObjectType::Commit => {
                    if let Ok(Object::Commit(commit)) =
                        Object::parse_content(ObjectType::Commit, &entry.data)
                    {
                        queue.push_back(commit.tree);
                        for parent in &commit.parents {
                            queue.push_back(*parent);
                        }
                    }
                }
                ObjectType::Tree => {
                    if let Ok(Object::Tree(tree)) =
                        Object::parse_content(ObjectType::Tree, &entry.data)
                    {
                        for child in tree.entries {
                            queue.push_back(child.oid);
                        }
                    }
                }
                ObjectType::Tag => {
                    if let Ok(Object::Tag(tag)) = Object::parse_content(ObjectType::Tag, &entry.data)
                    {
                        queue.push_back(tag.target);
                    }
                }
                ObjectType::Blob => {}
            }
        }
    }

    // Anything not reached (including all objects when `commits` is empty)
    // falls back to insertion order.
    let mut remaining: Vec<&ObjectId> = objects
        .keys()
        .filter(|oid| !visited.contains(oid))
        .collect();
    remaining.sort_by_key(|oid| objects[oid].sequence);
    ordered.extend(remaining.into_iter().copied());

    ordered
}
