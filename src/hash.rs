//! Hash & Path (§4.2): canonical identity hashing and content-addressed
//! path layout. Kept dependency-free of everything except `sha2` so it can
//! sit at the bottom of the module graph (§2: "Hash & Path", 2% share).

use sha2::{Digest, Sha256};

use crate::record::{Call, Message, MultimediaMessage, Record, TextMessage};

/// Anything the coalescer can dedup and partition (§4.5).
pub trait Identity {
    /// Stable SHA-256 digest over content fields only (§3).
    fn identity(&self) -> [u8; 32];
    fn timestamp_ms(&self) -> i64;
    fn year(&self) -> i32;
}

impl Identity for Record {
    fn identity(&self) -> [u8; 32] {
        record_identity(self)
    }

    fn timestamp_ms(&self) -> i64 {
        Record::timestamp_ms(self)
    }

    fn year(&self) -> i32 {
        self.utc_year()
    }
}

fn opt_str(s: &Option<String>) -> &str {
    s.as_deref().unwrap_or("")
}

/// Builds a pipe-delimited canonical string field by field, emitting the
/// separator by field position rather than by buffer contents so a leading
/// or interior empty field is still represented as its own `""` segment
/// (§3's literal pipe-delimited format).
#[derive(Default)]
struct CanonicalBuilder {
    buf: String,
    fields: usize,
}

impl CanonicalBuilder {
    fn push(&mut self, field: &str) -> &mut Self {
        if self.fields > 0 {
            self.buf.push('|');
        }
        self.buf.push_str(field);
        self.fields += 1;
        self
    }

    fn finish(self) -> String {
        self.buf
    }
}

fn call_canonical_bytes(call: &Call) -> String {
    let mut b = CanonicalBuilder::default();
    b.push(&call.number)
        .push(&call.duration_s.to_string())
        .push(&call.timestamp_ms.to_string())
        .push(&call.kind.code().to_string());
    b.finish()
}

fn text_canonical_bytes(text: &TextMessage) -> String {
    let mut b = CanonicalBuilder::default();
    b.push("msgtype:sms")
        .push(&text.address)
        .push(&text.timestamp_ms.to_string())
        .push(&text.direction.code().to_string())
        .push(&text.body)
        .push(opt_str(&text.protocol))
        .push(opt_str(&text.subject))
        .push(opt_str(&text.service_center))
        .push(&text.read_flag.to_string())
        .push(&text.status.to_string())
        .push(&text.locked_flag.to_string())
        .push(&text.date_sent_ms.to_string());
    b.finish()
}

fn mms_canonical_bytes(mms: &MultimediaMessage) -> String {
    let mut b = CanonicalBuilder::default();
    b.push("msgtype:mms")
        .push(&mms.address)
        .push(&mms.timestamp_ms.to_string())
        .push(&mms.direction().code().to_string())
        .push(&mms.msg_box.to_string())
        .push(opt_str(&mms.m_id))
        .push(opt_str(&mms.m_type));
    for part in &mms.parts {
        b.push(&part.seq.to_string())
            .push(&part.content_type)
            .push(opt_str(&part.name))
            .push(opt_str(&part.text))
            .push(&part.has_data_flag().to_string());
    }
    for addr in &mms.addresses {
        b.push(&addr.address).push(&addr.kind.to_string()).push(&addr.charset.to_string());
    }
    b.finish()
}

/// SHA-256 over the canonical pipe-delimited content-field string (§3).
/// Deliberately excludes `readable_date`, `contact_name`, and raw part
/// `data` bytes (only the has-data flag is mixed in).
pub fn record_identity(record: &Record) -> [u8; 32] {
    let canonical = match record {
        Record::Call(c) => call_canonical_bytes(c),
        Record::Message(Message::Text(t)) => text_canonical_bytes(t),
        Record::Message(Message::Multimedia(m)) => mms_canonical_bytes(m),
    };
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.finalize().into()
}

/// SHA-256 over raw attachment bytes (§4.2).
pub fn blob_hash(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

pub fn hex(digest: &[u8; 32]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn is_lowercase_hex64(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Two-level content-addressed directory for a blob hash, for storage
/// operations. Rejects anything that isn't exactly 64 lowercase hex chars.
pub fn blob_path(hex64: &str) -> Option<String> {
    if !is_lowercase_hex64(hex64) {
        return None;
    }
    Some(format!("attachments/{}/{}", &hex64[0..2], hex64))
}

/// Best-effort, non-validating path construction for display purposes
/// (e.g. logging partial hashes). Inputs shorter than 2 chars yield "".
pub fn blob_path_display(hex_prefix: &str) -> String {
    if hex_prefix.len() < 2 {
        return String::new();
    }
    format!("attachments/{}/{}", &hex_prefix[0..2], hex_prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AddressEntry, CallKind, Direction};
    use std::collections::BTreeMap;

    fn call(number: &str, duration: i64, ts: i64, kind: CallKind) -> Call {
        Call {
            number: number.to_owned(),
            duration_s: duration,
            timestamp_ms: ts,
            kind,
            readable_date: "ignored".to_owned(),
            contact_name: Some("ignored".to_owned()),
        }
    }

    #[test]
    fn identity_is_stable_for_identical_content() {
        let a = Record::Call(call("+1555", 10, 1000, CallKind::Incoming));
        let b = Record::Call(call("+1555", 10, 1000, CallKind::Incoming));
        assert_eq!(record_identity(&a), record_identity(&b));
    }

    #[test]
    fn identity_excludes_cosmetic_fields() {
        let mut a = call("+1555", 10, 1000, CallKind::Incoming);
        let mut b = a.clone();
        a.readable_date = "Jan 1, 2020".to_owned();
        b.readable_date = "completely different".to_owned();
        a.contact_name = Some("Alice".to_owned());
        b.contact_name = None;
        assert_eq!(
            record_identity(&Record::Call(a)),
            record_identity(&Record::Call(b))
        );
    }

    #[test]
    fn identity_differs_when_content_field_differs() {
        let a = Record::Call(call("+1555", 10, 1000, CallKind::Incoming));
        let b = Record::Call(call("+1555", 11, 1000, CallKind::Incoming));
        assert_ne!(record_identity(&a), record_identity(&b));
    }

    #[test]
    fn canonical_bytes_represent_leading_empty_field_as_its_own_segment() {
        let c = call("", 10, 1000, CallKind::Incoming);
        assert_eq!(call_canonical_bytes(&c), "|10|1000|1");
    }

    #[test]
    fn mms_identity_unaffected_by_extraction_state_change_in_has_data_flag() {
        use crate::record::Part;

        // Before extraction: data present, path absent.
        let part = Part {
            seq: 0,
            content_type: "image/png".to_owned(),
            name: Some("image.png".to_owned()),
            charset: None,
            content_disposition: None,
            filename: Some("image.png".to_owned()),
            content_id: None,
            content_location: None,
            text: None,
            data: Some("iVBORw0KGgo=".to_owned()),
            path: None,
            original_size: None,
            extraction_date: None,
            attachment_ref: None,
        };
        let mut mms = MultimediaMessage {
            timestamp_ms: 1000,
            msg_box: 1,
            address: "+1555".to_owned(),
            m_type: None,
            m_id: Some("1".to_owned()),
            thread_id: None,
            parts: vec![part],
            addresses: vec![AddressEntry { address: "+1555".to_owned(), kind: 137, charset: 106 }],
            extra: BTreeMap::new(),
        };
        let before = record_identity(&Record::Message(Message::Multimedia(mms.clone())));

        // Simulate extraction: clear data, set path. has_data_flag stays true.
        mms.parts[0].data = None;
        mms.parts[0].path = Some("attachments/ab/abc/file.png".to_owned());
        let after = record_identity(&Record::Message(Message::Multimedia(mms)));

        assert_eq!(before, after, "extraction must not change MMS identity");
    }

    #[test]
    fn blob_path_requires_exact_hex64() {
        assert!(blob_path("not-hex").is_none());
        let ok = "a".repeat(64);
        assert_eq!(blob_path(&ok).unwrap(), format!("attachments/aa/{}", ok));
    }

    #[test]
    fn blob_path_display_handles_short_input() {
        assert_eq!(blob_path_display(""), "");
        assert_eq!(blob_path_display("a"), "");
        assert_eq!(blob_path_display("ab"), "attachments/ab/ab");
    }

    #[test]
    fn direction_code_roundtrip() {
        assert_eq!(Direction::from_code(1), Some(Direction::Received));
        assert_eq!(Direction::from_code(2), Some(Direction::Sent));
        assert_eq!(Direction::from_code(9), None);
    }
}
