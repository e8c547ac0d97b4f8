//! The core data model (§3): calls, SMS, MMS and their sub-structures.
//!
//! Records are plain data. Mutation is only ever done by the extractor
//! (on `Part` fields) between construction by the reader and admission to
//! the coalescer — see the lifecycle note in §3 and §9.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};

/// Call direction/kind, matching the source schema's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Incoming,
    Outgoing,
    Missed,
    Voicemail,
}

impl CallKind {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(CallKind::Incoming),
            2 => Some(CallKind::Outgoing),
            3 => Some(CallKind::Missed),
            4 => Some(CallKind::Voicemail),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            CallKind::Incoming => 1,
            CallKind::Outgoing => 2,
            CallKind::Missed => 3,
            CallKind::Voicemail => 4,
        }
    }
}

/// SMS direction, matching the source schema's `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Received,
    Sent,
}

impl Direction {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Direction::Received),
            2 => Some(Direction::Sent),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Direction::Received => 1,
            Direction::Sent => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub number: String,
    pub duration_s: i64,
    pub timestamp_ms: i64,
    pub kind: CallKind,
    pub readable_date: String,
    pub contact_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextMessage {
    pub protocol: Option<String>,
    pub address: String,
    pub timestamp_ms: i64,
    pub direction: Direction,
    pub subject: Option<String>,
    pub body: String,
    pub service_center: Option<String>,
    pub read_flag: i32,
    pub status: i32,
    pub locked_flag: i32,
    pub date_sent_ms: i64,
    pub readable_date: String,
    pub contact_name: Option<String>,
    /// Device-specific attributes the schema doesn't name explicitly.
    /// Forward-compatible: round-tripped verbatim, excluded from identity.
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddressEntry {
    pub address: String,
    pub kind: i32,
    pub charset: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub seq: i32,
    pub content_type: String,
    pub name: Option<String>,
    pub charset: Option<String>,
    pub content_disposition: Option<String>,
    pub filename: Option<String>,
    pub content_id: Option<String>,
    pub content_location: Option<String>,
    /// Present for text-bodied parts (SMIL, plain text, etc.), or for
    /// inline text attachments prior to extraction.
    pub text: Option<String>,
    /// Base64-encoded payload, present only prior to extraction.
    pub data: Option<String>,
    /// Repo-relative path to the extracted blob; set post-extraction.
    pub path: Option<String>,
    /// Decoded byte length of the extracted payload; set post-extraction.
    pub original_size: Option<i64>,
    /// RFC-3339 UTC timestamp of extraction; set post-extraction.
    pub extraction_date: Option<String>,
    pub attachment_ref: Option<String>,
}

impl Part {
    /// True if this part carries (or carried, pre-extraction) payload bytes.
    /// Mixed into the identity hash instead of the bytes themselves so that
    /// extraction never perturbs a record's identity (§9).
    pub fn has_data_flag(&self) -> bool {
        let has_raw_data = self
            .data
            .as_deref()
            .map(|d| !d.is_empty() && d != "null")
            .unwrap_or(false);
        has_raw_data || self.path.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultimediaMessage {
    pub timestamp_ms: i64,
    /// 1 = received, 2 = sent, matching the source schema's `msg_box`.
    pub msg_box: i32,
    pub address: String,
    pub m_type: Option<String>,
    pub m_id: Option<String>,
    pub thread_id: Option<i64>,
    pub parts: Vec<Part>,
    pub addresses: Vec<AddressEntry>,
    /// The ~35 optional device-specific integer/string fields (§3),
    /// round-tripped verbatim, excluded from identity.
    pub extra: BTreeMap<String, String>,
}

impl MultimediaMessage {
    pub fn direction(&self) -> Direction {
        if self.msg_box == 1 {
            Direction::Received
        } else {
            Direction::Sent
        }
    }
}

/// A message is either a text (SMS) or multimedia (MMS) entry; both live
/// in the same `<smses>` container and year partition.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(TextMessage),
    Multimedia(MultimediaMessage),
}

/// Every ingested item is one of these three variants (§3). Kept as a
/// closed tagged union rather than a trait object hierarchy so identity
/// hashing and extraction can be written as variant-aware free functions
/// instead of virtual methods (§9).
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Call(Call),
    Message(Message),
}

impl Record {
    pub fn timestamp_ms(&self) -> i64 {
        match self {
            Record::Call(c) => c.timestamp_ms,
            Record::Message(Message::Text(t)) => t.timestamp_ms,
            Record::Message(Message::Multimedia(m)) => m.timestamp_ms,
        }
    }

    /// UTC calendar year of the record's timestamp (§3, §4.6).
    pub fn utc_year(&self) -> i32 {
        utc_year_of(self.timestamp_ms())
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Record::Call(_))
    }
}

pub fn utc_year_of(timestamp_ms: i64) -> i32 {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
        .format("%Y")
        .to_string()
        .parse()
        .expect("chrono year formatting always yields digits")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_year_matches_known_timestamp() {
        // 2014-09-16T19:11:45Z
        assert_eq!(utc_year_of(1_410_894_705_000), 2014);
    }

    #[test]
    fn mms_direction_derives_from_msg_box() {
        let mut mms = sample_mms();
        mms.msg_box = 1;
        assert_eq!(mms.direction(), Direction::Received);
        mms.msg_box = 2;
        assert_eq!(mms.direction(), Direction::Sent);
    }

    #[test]
    fn part_has_data_flag_reflects_pre_and_post_extraction() {
        let mut part = sample_part();
        part.data = Some("aGVsbG8=".to_owned());
        assert!(part.has_data_flag());

        part.data = None;
        part.path = Some("attachments/ab/abcd.../file.bin".to_owned());
        assert!(part.has_data_flag());

        part.path = None;
        assert!(!part.has_data_flag());
    }

    pub(crate) fn sample_part() -> Part {
        Part {
            seq: 0,
            content_type: "text/plain".to_owned(),
            name: None,
            charset: None,
            content_disposition: None,
            filename: None,
            content_id: None,
            content_location: None,
            text: None,
            data: None,
            path: None,
            original_size: None,
            extraction_date: None,
            attachment_ref: None,
        }
    }

    pub(crate) fn sample_mms() -> MultimediaMessage {
        MultimediaMessage {
            timestamp_ms: 1_410_894_705_000,
            msg_box: 1,
            address: "+15555550000".to_owned(),
            m_type: None,
            m_id: Some("1".to_owned()),
            thread_id: Some(1),
            parts: vec![],
            addresses: vec![],
            extra: BTreeMap::new(),
        }
    }
}
