//! Manifest Builder (§4.7): walks a repository tree and emits `files.yaml`
//! plus its `files.yaml.sha256` checksum sidecar.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{CoreError, Result};

pub const MANIFEST_FILE: &str = "files.yaml";
pub const MANIFEST_CHECKSUM_FILE: &str = "files.yaml.sha256";
const MANIFEST_VERSION: &str = "1.0";
const MARKER_FILE: &str = ".mobilecombackup.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
    pub checksum: String,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub version: String,
    pub generated: DateTime<Utc>,
    pub generator: String,
    pub files: Vec<ManifestEntry>,
}

fn is_excluded(rel_path: &str) -> bool {
    if rel_path == MANIFEST_FILE || rel_path == MANIFEST_CHECKSUM_FILE {
        return true;
    }
    if rel_path.starts_with("rejected/") {
        return true;
    }
    if rel_path.ends_with(".tmp") {
        return true;
    }
    let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
    if basename.starts_with('.') && basename != MARKER_FILE {
        return true;
    }
    false
}

fn hash_file(path: &Path) -> Result<String> {
    let mut f = File::open(path).map_err(|e| CoreError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).map_err(|e| CoreError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Builds the manifest in memory without writing anything (so it can be
/// composed with the write step or checked in tests).
pub fn build_manifest(repo_root: &Path, generator: &str) -> Result<Manifest> {
    let mut files = Vec::new();

    for entry in WalkDir::new(repo_root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(repo_root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");

        if is_excluded(&rel) {
            continue;
        }

        let metadata = entry.metadata().map_err(|e| {
            CoreError::io(entry.path(), std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        let size = metadata.len();
        let modified: DateTime<Utc> = metadata
            .modified()
            .map_err(|e| CoreError::io(entry.path(), e))?
            .into();
        let checksum = format!("sha256:{}", hash_file(entry.path())?);

        files.push(ManifestEntry { name: rel, size, checksum, modified });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Manifest {
        version: MANIFEST_VERSION.to_owned(),
        generated: Utc::now(),
        generator: generator.to_owned(),
        files,
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_owned(),
    });
    let write_result = (|| -> std::io::Result<()> {
        let mut f = File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()
    })();
    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(CoreError::io(&tmp_path, e));
    }
    fs::rename(&tmp_path, path).map_err(|e| CoreError::io(path, e))?;
    Ok(())
}

/// Builds and writes `files.yaml`, then unconditionally (re)writes
/// `files.yaml.sha256` to match it.
pub fn write_manifest(repo_root: &Path, generator: &str) -> Result<Manifest> {
    let manifest = build_manifest(repo_root, generator)?;
    let yaml = serde_yaml::to_string(&manifest)
        .map_err(|e| CoreError::StoreFailure { hash: MANIFEST_FILE.to_owned(), message: e.to_string() })?;
    let manifest_path = repo_root.join(MANIFEST_FILE);
    write_atomic(&manifest_path, yaml.as_bytes())?;
    write_checksum(repo_root, true)?;
    info!("wrote {MANIFEST_FILE} with {} file(s)", manifest.files.len());
    Ok(manifest)
}

/// Writes `files.yaml.sha256` from the current contents of `files.yaml`.
/// When `force` is false and the checksum file already exists, does
/// nothing (§4.7 `write_checksum_only`).
pub fn write_checksum(repo_root: &Path, force: bool) -> Result<()> {
    let checksum_path = repo_root.join(MANIFEST_CHECKSUM_FILE);
    if !force && checksum_path.exists() {
        return Ok(());
    }
    let manifest_path = repo_root.join(MANIFEST_FILE);
    let digest = hash_file(&manifest_path)?;
    let line = format!("{digest}  {MANIFEST_FILE}\n");
    write_atomic(&checksum_path, line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_manifest_rejected_tmp_and_dotfiles_but_keeps_marker() {
        assert!(is_excluded("files.yaml"));
        assert!(is_excluded("files.yaml.sha256"));
        assert!(is_excluded("rejected/calls-2014.rejected.xml"));
        assert!(is_excluded("calls/calls-2014.xml.tmp"));
        assert!(is_excluded(".hidden"));
        assert!(!is_excluded(".mobilecombackup.yaml"));
        assert!(!is_excluded("calls/calls-2014.xml"));
    }

    #[test]
    fn build_manifest_walks_tree_and_skips_excluded_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("calls")).unwrap();
        fs::write(root.join("calls/calls-2014.xml"), b"<calls count=\"0\"></calls>").unwrap();
        fs::write(root.join(MARKER_FILE), b"repository_structure_version: '1'\n").unwrap();
        fs::write(root.join("files.yaml"), b"stale").unwrap();
        fs::create_dir_all(root.join("rejected")).unwrap();
        fs::write(root.join("rejected/x.rejected.xml"), b"junk").unwrap();

        let manifest = build_manifest(root, "mobilecombackup-test").unwrap();
        let names: Vec<&str> = manifest.files.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"calls/calls-2014.xml"));
        assert!(names.contains(&".mobilecombackup.yaml"));
        assert!(!names.contains(&"files.yaml"));
        assert!(!names.iter().any(|n| n.starts_with("rejected/")));
        assert_eq!(manifest.version, "1.0");
    }

    #[test]
    fn write_manifest_then_checksum_sidecar_matches() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join(MARKER_FILE), b"repository_structure_version: '1'\n").unwrap();

        write_manifest(root, "mobilecombackup-test").unwrap();
        let checksum_contents = fs::read_to_string(root.join(MANIFEST_CHECKSUM_FILE)).unwrap();
        assert!(checksum_contents.ends_with("  files.yaml\n"));

        let expected = hash_file(&root.join(MANIFEST_FILE)).unwrap();
        assert!(checksum_contents.starts_with(&expected));
    }

    #[test]
    fn write_checksum_only_does_not_overwrite_existing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join(MANIFEST_FILE), b"content-a").unwrap();
        write_checksum(root, true).unwrap();
        let first = fs::read_to_string(root.join(MANIFEST_CHECKSUM_FILE)).unwrap();

        fs::write(root.join(MANIFEST_FILE), b"content-b-different-length").unwrap();
        write_checksum(root, false).unwrap();
        let second = fs::read_to_string(root.join(MANIFEST_CHECKSUM_FILE)).unwrap();
        assert_eq!(first, second, "non-forced call must not overwrite an existing checksum file");
    }
}
