//
// storage.rs
// radifox
//
// Output tree layout, content hashing and crash-safe JSON/file writes shared by conversion and update.
//
// Thales Matheus Mendonça Santos - October 2026

use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::models::SessionMetadata;

/// Root of the converted output tree (`<root>/<project>/<PROJECT>-<SUBJECT>/<session>`).
#[derive(Clone, Debug)]
pub struct OutputTree {
    root: PathBuf,
}

impl OutputTree {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, meta: &SessionMetadata) -> PathBuf {
        self.root.join(meta.project_dir_name())
    }

    pub fn subject_dir(&self, meta: &SessionMetadata) -> PathBuf {
        self.project_dir(meta).join(meta.subject_dir_name())
    }

    pub fn session_dir(&self, meta: &SessionMetadata) -> PathBuf {
        self.root.join(meta.relative_dir())
    }

    /// Hidden sibling of the session directory where a conversion is assembled.
    pub fn staging_dir(&self, meta: &SessionMetadata) -> PathBuf {
        self.subject_dir(meta)
            .join(format!(".{}.staging", meta.session_dir_name()))
    }

    /// Recovers the output root from an existing session directory.
    pub fn from_session_dir(session_dir: &Path) -> Option<Self> {
        session_dir
            .parent()
            .and_then(|subject| subject.parent())
            .and_then(|project| project.parent())
            .map(Self::new)
    }
}

/// Keep only ASCII word characters and a few safe separators to avoid filesystem surprises.
pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// 12 upper-case hex characters of SHA-256; used for non-identifying directory keys.
pub fn short_hash(input: &str) -> String {
    sha256_hex(input.as_bytes())[..12].to_uppercase()
}

pub fn hash_file(path: &Path) -> io::Result<String> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash of a set of files: per-file digests computed in parallel, combined in path order
/// together with each file's path relative to `base`.
pub fn hash_files(base: &Path, files: &[PathBuf]) -> io::Result<String> {
    let mut sorted: Vec<&PathBuf> = files.iter().collect();
    sorted.sort();
    let digests: Vec<(String, String)> = sorted
        .par_iter()
        .map(|path| {
            let path: &Path = path.as_path();
            let relative = path
                .strip_prefix(base)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            hash_file(path).map(|digest| (relative, digest))
        })
        .collect::<io::Result<_>>()?;

    let mut hasher = Sha256::new();
    for (relative, digest) in digests {
        hasher.update(relative.as_bytes());
        hasher.update(b"\0");
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash of a file or of every file under a directory.
pub fn hash_file_dir(path: &Path) -> io::Result<String> {
    if path.is_file() {
        return hash_file(path);
    }
    let files: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    hash_files(path, &files)
}

/// Rebuilds every JSON object with keys in sorted order.
pub fn sorted_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sorted_value(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted_value).collect()),
        other => other,
    }
}

/// Sorted-key JSON with four-space indentation, the on-disk format of every record.
pub fn to_pretty_json<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let value = sorted_value(serde_json::to_value(value)?);
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    out.push(b'\n');
    Ok(out)
}

/// Compact canonical JSON (sorted keys) used for fingerprints.
pub fn canonical_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let value = sorted_value(serde_json::to_value(value)?);
    serde_json::to_string(&value)
}

/// Writes `bytes` to a temporary file next to `path` and renames it into place,
/// so readers see either the old file or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    write_atomic(path, &to_pretty_json(value)?)
}

/// Removes a file or directory tree, ignoring a missing target.
pub fn silent_remove(path: &Path) -> io::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_strips_dangerous_characters() {
        let cleaned = sanitize_filename("../weird name/123.nii");
        assert_eq!(cleaned, "weirdname123.nii");
    }

    #[test]
    fn directory_hash_ignores_walk_order_but_not_content() {
        let dir = tempdir().expect("tmpdir");
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("a.dcm"), b"one").unwrap();
        fs::write(dir.path().join("b/c.dcm"), b"two").unwrap();

        let first = hash_file_dir(dir.path()).expect("hash");
        assert_eq!(first, hash_file_dir(dir.path()).expect("hash again"));

        fs::write(dir.path().join("b/c.dcm"), b"changed").unwrap();
        assert_ne!(first, hash_file_dir(dir.path()).expect("hash changed"));
    }

    #[test]
    fn json_records_have_sorted_keys_and_four_space_indent() {
        let dir = tempdir().expect("tmpdir");
        let path = dir.path().join("record.json");
        write_json_atomic(&path, &serde_json::json!({"b": 1, "a": {"d": 2, "c": 3}}))
            .expect("write");
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "{\n    \"a\": {\n        \"c\": 3,\n        \"d\": 2\n    },\n    \"b\": 1\n}\n"
        );
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn output_root_is_recovered_from_session_dir() {
        let tree = OutputTree::from_session_dir(Path::new("/out/study/STUDY-01/1")).unwrap();
        assert_eq!(tree.root(), Path::new("/out"));
    }
}
