//! The `shallow` file: a newline-separated list of OIDs whose parents are
//! synthetically treated as absent (§6).

use std::collections::HashSet;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use git_hash::ObjectId;

use crate::RepoError;

/// Read the `shallow` file in `git_dir`, if present.
///
/// A missing file means the repository is not shallow; returns an empty set.
pub fn read_shallow_roots(git_dir: &Path) -> Result<HashSet<ObjectId>, RepoError> {
    let path = git_dir.join("shallow");
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(RepoError::Io(e)),
    };

    let mut roots = HashSet::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(oid) = ObjectId::from_hex(line) {
            roots.insert(oid);
        }
    }
    Ok(roots)
}

/// Overwrite the `shallow` file with the given roots, one hex OID per line.
///
/// An empty set removes the file entirely (a non-shallow repository has no
/// `shallow` file, rather than an empty one).
pub fn write_shallow_roots(git_dir: &Path, roots: &HashSet<ObjectId>) -> Result<(), RepoError> {
    let path = git_dir.join("shallow");
    if roots.is_empty() {
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RepoError::Io(e)),
        }
    } else {
        let tmp_path = tmp_sibling(&path);
        {
            let mut f = fs::File::create(&tmp_path)?;
            let mut sorted: Vec<&ObjectId> = roots.iter().collect();
            sorted.sort();
            for oid in sorted {
                writeln!(f, "{}", oid.to_hex())?;
            }
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}
