//! Attachment Extractor (§4.4): a policy engine that decides, part by part,
//! whether an MMS part's payload should be pulled out into the attachment
//! store, and mutates the part in place when it is.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;

use crate::attachments::{AttachmentMetadata, AttachmentStore};
use crate::error::{CoreError, Result};
use crate::hash::{blob_hash, hex};
use crate::record::{MultimediaMessage, Part};

const MIN_BASE64_LEN: usize = 1024;

const BINARY_WHITELIST: &[&str] = &[
    "image/jpeg", "image/jpg", "image/png", "image/gif", "image/bmp", "image/webp", "image/tiff",
    "video/mp4", "video/3gpp", "video/3gp", "video/quicktime", "video/x-msvideo", "video/avi",
    "audio/mpeg", "audio/mp3", "audio/mp4", "audio/m4a", "audio/amr", "audio/wav", "audio/x-wav",
    "audio/ogg", "audio/aac",
    "application/pdf", "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/zip", "application/x-rar-compressed", "application/vnd.rar",
    "application/x-7z-compressed", "application/octet-stream",
];

fn is_text_type(normalized: &str) -> bool {
    normalized.starts_with("text/")
        || matches!(
            normalized,
            "application/xml"
                | "application/json"
                | "application/javascript"
                | "application/smil"
                | "application/vnd.wap.multipart.related"
                | "application/xhtml+xml"
        )
}

/// Outcome of running the policy on a single part (§4.4).
#[derive(Debug, Clone, PartialEq)]
pub enum PartDecision {
    Extracted { hash: String, path: String, original_size: i64 },
    Referenced { hash: String, path: String, original_size: i64 },
    Skipped { reason: String },
}

/// Per-MMS rollup of every part's decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionSummary {
    pub extracted: usize,
    pub referenced: usize,
    pub skipped: usize,
    pub bytes_new: u64,
    pub bytes_referenced: u64,
    pub decisions: Vec<PartDecision>,
}

enum Payload {
    Binary(String),
    Text(String),
}

fn determine_payload(part: &Part) -> Option<Payload> {
    if let Some(data) = part.data.as_deref() {
        if !data.is_empty() && data != "null" {
            return Some(Payload::Binary(data.to_owned()));
        }
    }
    if let Some(text) = part.text.as_deref() {
        let is_attachment = part
            .content_disposition
            .as_deref()
            .map(|cd| cd.eq_ignore_ascii_case("attachment"))
            .unwrap_or(false);
        if !text.is_empty() && is_attachment {
            return Some(Payload::Text(text.to_owned()));
        }
    }
    None
}

fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Runs the six-step policy over every part of `mms`, mutating extracted or
/// referenced parts in place. `mms_id` is used only to annotate decode
/// errors.
pub fn extract_mms(mms: &mut MultimediaMessage, store: &AttachmentStore) -> Result<ExtractionSummary> {
    let mms_id = mms.m_id.clone().unwrap_or_else(|| "unknown".to_owned());
    let mut summary = ExtractionSummary::default();

    for (part_index, part) in mms.parts.iter_mut().enumerate() {
        let decision = extract_part(part, &mms_id, part_index, store)?;

        match &decision {
            PartDecision::Extracted { path, original_size, .. } => {
                summary.extracted += 1;
                summary.bytes_new += *original_size as u64;
                apply_extraction(part, path.clone(), *original_size);
            }
            PartDecision::Referenced { path, original_size, .. } => {
                summary.referenced += 1;
                summary.bytes_referenced += *original_size as u64;
                apply_extraction(part, path.clone(), *original_size);
            }
            PartDecision::Skipped { .. } => {
                summary.skipped += 1;
            }
        }

        summary.decisions.push(decision);
    }

    Ok(summary)
}

fn apply_extraction(part: &mut Part, path: String, original_size: i64) {
    part.data = None;
    part.text = None;
    part.path = Some(path);
    part.original_size = Some(original_size);
    part.extraction_date = Some(Utc::now().to_rfc3339());
}

fn extract_part(
    part: &Part,
    mms_id: &str,
    part_index: usize,
    store: &AttachmentStore,
) -> Result<PartDecision> {
    let payload = match determine_payload(part) {
        Some(p) => p,
        None => return Ok(PartDecision::Skipped { reason: "no-data".to_owned() }),
    };

    let normalized = normalize_content_type(&part.content_type);
    if normalized.is_empty() {
        return Ok(PartDecision::Skipped { reason: "missing content type header".to_owned() });
    }

    let bytes = match &payload {
        Payload::Binary(b64) => {
            if !BINARY_WHITELIST.contains(&normalized.as_str()) {
                if is_text_type(&normalized) {
                    return Ok(PartDecision::Skipped { reason: "text content - keeping inline".to_owned() });
                }
                return Ok(PartDecision::Skipped { reason: format!("unknown content type: {normalized}") });
            }
            if b64.len() < MIN_BASE64_LEN {
                return Ok(PartDecision::Skipped { reason: "too-small".to_owned() });
            }
            BASE64.decode(b64.as_bytes()).map_err(|source| CoreError::DecodeError {
                mms_id: mms_id.to_owned(),
                part_index,
                source,
            })?
        }
        Payload::Text(text) => {
            if BINARY_WHITELIST.contains(&normalized.as_str()) {
                text.clone().into_bytes()
            } else if is_text_type(&normalized) {
                return Ok(PartDecision::Skipped { reason: "text content - keeping inline".to_owned() });
            } else {
                return Ok(PartDecision::Skipped { reason: format!("unknown content type: {normalized}") });
            }
        }
    };

    let digest = hex(&blob_hash(&bytes));
    let original_size = bytes.len() as i64;

    if store.exists(&digest) {
        let path = store.get_path(&digest)?;
        return Ok(PartDecision::Referenced { hash: digest, path, original_size });
    }

    let metadata = AttachmentMetadata {
        hash: digest.clone(),
        original_name: part.filename.clone().unwrap_or_default(),
        mime_type: part.content_type.clone(),
        size: original_size,
        created_at: Utc::now(),
        source_mms: Some(mms_id.to_owned()),
    };
    let path = store.store(&digest, &bytes, metadata)?;
    Ok(PartDecision::Extracted { hash: digest, path, original_size })
}
