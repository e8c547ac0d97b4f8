//! Attachment Store (§4.3): a content-addressed blob store rooted at
//! `<repo>/attachments/`, with atomic tmp-then-rename writes so concurrent
//! or interrupted stores never publish a partial blob.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};
use crate::hash::{blob_path, hex};

const METADATA_FILE: &str = "metadata.yaml";

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// On-disk sidecar for a stored blob (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentMetadata {
    pub hash: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_mms: Option<String>,
}

pub struct AttachmentStore {
    /// Repository root; blobs live under `root.join("attachments")`.
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        AttachmentStore { root: repo_root.into() }
    }

    fn blob_dir(&self, hex64: &str) -> Result<PathBuf> {
        let rel = blob_path(hex64).ok_or_else(|| CoreError::StoreFailure {
            hash: hex64.to_owned(),
            message: "hash is not exactly 64 lowercase hex characters".to_owned(),
        })?;
        Ok(self.root.join(rel))
    }

    pub fn exists(&self, hex64: &str) -> bool {
        self.blob_dir(hex64).map(|dir| dir.is_dir()).unwrap_or(false)
    }

    fn read_metadata(&self, hex64: &str) -> Result<AttachmentMetadata> {
        let dir = self.blob_dir(hex64)?;
        let meta_path = dir.join(METADATA_FILE);
        let bytes = fs::read(&meta_path).map_err(|e| CoreError::io(&meta_path, e))?;
        serde_yaml::from_slice(&bytes).map_err(|e| CoreError::StoreFailure {
            hash: hex64.to_owned(),
            message: format!("invalid metadata.yaml: {e}"),
        })
    }

    /// Repo-relative path (including filename) of a stored blob.
    pub fn get_path(&self, hex64: &str) -> Result<String> {
        let meta = self.read_metadata(hex64)?;
        let rel = blob_path(hex64).expect("already validated by blob_dir");
        Ok(format!("{rel}/{}", filename_for(&meta)))
    }

    /// Writes `bytes` under the blob's content-addressed directory, atomically.
    /// Idempotent: storing identical bytes under the same hash twice succeeds
    /// both times and converges on the same on-disk state (§4.4 threading
    /// guarantee).
    pub fn store(&self, hex64: &str, bytes: &[u8], metadata: AttachmentMetadata) -> Result<String> {
        let dir = self.blob_dir(hex64)?;
        self.write_blob(&dir, hex64, bytes, &metadata)
    }

    /// Streams `reader` through a running SHA-256 hasher while writing to a
    /// temp file; if the final digest doesn't match `hex64`, the temp file
    /// is removed and `HashMismatch` is raised without publishing anything.
    pub fn store_from_reader<R: Read>(
        &self,
        hex64: &str,
        mut reader: R,
        metadata: AttachmentMetadata,
    ) -> Result<String> {
        let dir = self.blob_dir(hex64)?;
        fs::create_dir_all(&dir).map_err(|e| CoreError::io(&dir, e))?;
        let _ = set_mode(&dir, 0o750);

        let tmp_path = dir.join(format!("{}.tmp", filename_for(&metadata)));
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        {
            let mut tmp_file = File::create(&tmp_path).map_err(|e| CoreError::io(&tmp_path, e))?;
            let _ = set_mode(&tmp_path, 0o600);
            loop {
                let n = reader.read(&mut buf).map_err(|e| CoreError::io(&tmp_path, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                tmp_file.write_all(&buf[..n]).map_err(|e| CoreError::io(&tmp_path, e))?;
            }
            tmp_file.sync_all().map_err(|e| CoreError::io(&tmp_path, e))?;
        }

        let digest = hex(&hasher.finalize().into());
        if digest != hex64 {
            let _ = fs::remove_file(&tmp_path);
            return Err(CoreError::HashMismatch { expected: hex64.to_owned(), actual: digest });
        }

        self.publish(&dir, &tmp_path, hex64, &metadata)
    }

    fn write_blob(
        &self,
        dir: &Path,
        hex64: &str,
        bytes: &[u8],
        metadata: &AttachmentMetadata,
    ) -> Result<String> {
        fs::create_dir_all(dir).map_err(|e| CoreError::io(dir, e))?;
        let _ = set_mode(dir, 0o750);

        let tmp_path = dir.join(format!("{}.tmp", filename_for(metadata)));
        let write_result = (|| -> std::io::Result<()> {
            let mut f = File::create(&tmp_path)?;
            f.write_all(bytes)?;
            f.sync_all()?;
            set_mode(&tmp_path, 0o600)
        })();
        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(CoreError::StoreFailure { hash: hex64.to_owned(), message: e.to_string() });
        }

        self.publish(dir, &tmp_path, hex64, metadata)
    }

    fn publish(&self, dir: &Path, tmp_path: &Path, hex64: &str, metadata: &AttachmentMetadata) -> Result<String> {
        let final_path = dir.join(filename_for(metadata));
        if let Err(e) = fs::rename(tmp_path, &final_path) {
            let _ = fs::remove_file(tmp_path);
            return Err(CoreError::StoreFailure { hash: hex64.to_owned(), message: e.to_string() });
        }

        let meta_tmp = dir.join(format!("{METADATA_FILE}.tmp"));
        let meta_final = dir.join(METADATA_FILE);
        let yaml = serde_yaml::to_string(metadata).map_err(|e| CoreError::StoreFailure {
            hash: hex64.to_owned(),
            message: e.to_string(),
        })?;
        let meta_write = (|| -> std::io::Result<()> {
            fs::write(&meta_tmp, yaml.as_bytes())?;
            set_mode(&meta_tmp, 0o600)
        })();
        if let Err(e) = meta_write {
            let _ = fs::remove_file(&meta_tmp);
            return Err(CoreError::StoreFailure { hash: hex64.to_owned(), message: e.to_string() });
        }
        if let Err(e) = fs::rename(&meta_tmp, &meta_final) {
            let _ = fs::remove_file(&meta_tmp);
            return Err(CoreError::StoreFailure { hash: hex64.to_owned(), message: e.to_string() });
        }

        let rel = blob_path(hex64).expect("already validated by blob_dir");
        Ok(format!("{rel}/{}", filename_for(metadata)))
    }

    pub fn read(&self, hex64: &str) -> Result<Vec<u8>> {
        let meta = self.read_metadata(hex64)?;
        let dir = self.blob_dir(hex64)?;
        let path = dir.join(filename_for(&meta));
        fs::read(&path).map_err(|e| CoreError::io(&path, e))
    }

    /// Rehashes the stored file and compares it against the directory name.
    pub fn verify(&self, hex64: &str) -> Result<bool> {
        let bytes = self.read(hex64)?;
        let digest = hex(&crate::hash::blob_hash(&bytes));
        Ok(digest == hex64)
    }
}

/// Fixed MIME-type → extension mapping (§4.3). Unknown types get `.bin`.
fn extension_for_mime(mime_type: &str) -> &'static str {
    let normalized = mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        "image/webp" => "webp",
        "image/tiff" => "tiff",
        "video/mp4" => "mp4",
        "video/3gpp" | "video/3gp" => "3gp",
        "video/quicktime" => "mov",
        "video/x-msvideo" | "video/avi" => "avi",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" => "m4a",
        "audio/amr" => "amr",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/ogg" => "ogg",
        "audio/aac" => "aac",
        "application/pdf" => "pdf",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "application/vnd.ms-powerpoint" => "ppt",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => "pptx",
        "application/zip" => "zip",
        "application/x-rar-compressed" | "application/vnd.rar" => "rar",
        "application/x-7z-compressed" => "7z",
        _ => "bin",
    }
}

fn filename_for(metadata: &AttachmentMetadata) -> String {
    let provided = metadata.original_name.trim();
    if provided.is_empty() || provided == "null" {
        format!("attachment.{}", extension_for_mime(&metadata.mime_type))
    } else {
        provided.to_owned()
    }
}
