//! Record Reader (§4.1): a pull-mode streaming decoder over the input XML
//! schema. Never buffers the whole document — records are handed to a
//! caller-supplied sink one at a time as they're parsed off the wire.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{CoreError, Result};
use crate::record::{
    AddressEntry, Call, CallKind, Direction, Message, MultimediaMessage, Part, Record,
    TextMessage,
};

/// Per-token size guard (§4.1 security hardening): bounds how large any
/// single start-tag/text chunk may be, so a hostile or corrupt input can't
/// force unbounded buffer growth. quick-xml itself never resolves external
/// entities or processes a DTD, closing the XXE vector outright.
const MAX_TOKEN_BYTES: usize = 1 << 20; // 1 MiB

/// Declared `count` attribute of the outer container, if present, plus the
/// number of records actually emitted — used by `validate_file` (§4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamSummary {
    pub declared_count: Option<usize>,
    pub actual_count: usize,
}

/// Receives one record (or the error describing why it couldn't be parsed)
/// at a time, indexed from zero in document order. Returning `Err` aborts
/// the stream; returning `Ok(())` after being handed an `Err` means "I
/// reject this record but keep going" (§4.1, §7).
pub trait RecordSink {
    fn consume(&mut self, index: usize, record: std::result::Result<Record, CoreError>) -> Result<()>;
}

impl<F> RecordSink for F
where
    F: FnMut(usize, std::result::Result<Record, CoreError>) -> Result<()>,
{
    fn consume(&mut self, index: usize, record: std::result::Result<Record, CoreError>) -> Result<()> {
        (self)(index, record)
    }
}

/// Streams every `<call>`, `<sms>`, `<mms>` record out of `source` through
/// `sink`, honoring `cancel` every 10 records (§5). `path` is used only to
/// annotate errors.
pub fn stream_records<R: BufRead, S: RecordSink>(
    source: R,
    path: &Path,
    sink: &mut S,
    cancel: &crate::cancel::CancellationToken,
) -> Result<StreamSummary> {
    let mut xml = Reader::from_reader(source);
    xml.trim_text(true);

    let mut buf = Vec::with_capacity(4096);
    let mut summary = StreamSummary::default();
    let mut index = 0usize;
    let mut mms_stack: Vec<MmsBuild> = Vec::new();
    let mut skip_depth: u32 = 0;

    macro_rules! emit {
        ($record:expr) => {{
            sink.consume(index, $record)?;
            index += 1;
            if index % 10 == 0 && cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
        }};
    }

    loop {
        buf.clear();
        let event = xml
            .read_event_into(&mut buf)
            .map_err(|e| xml_error(path, &xml, e))?;

        match event {
            Event::Eof => break,

            Event::Start(e) => {
                if skip_depth > 0 {
                    skip_depth += 1;
                    continue;
                }
                if e.len() > MAX_TOKEN_BYTES {
                    return Err(too_large(path, &xml));
                }
                let local = local_name(&e);
                match local.as_str() {
                    "calls" | "smses" => {
                        summary.declared_count = attr(&e, "count").and_then(|v| v.parse().ok());
                    }
                    "call" => emit!(parse_call(&e, path, index).map(Record::Call)),
                    "sms" => emit!(parse_sms(&e, path, index).map(|t| Record::Message(Message::Text(t)))),
                    "mms" => mms_stack.push(MmsBuild::new(&e, path, index)?),
                    "parts" | "addrs" => {}
                    "part" => {
                        if let Some(top) = mms_stack.last_mut() {
                            top.push_part(&e)?;
                        }
                    }
                    "addr" => {
                        if let Some(top) = mms_stack.last_mut() {
                            top.push_addr(&e);
                        }
                    }
                    _ => skip_depth += 1,
                }
            }

            Event::Empty(e) => {
                if skip_depth > 0 {
                    continue;
                }
                let local = local_name(&e);
                match local.as_str() {
                    "calls" | "smses" => {
                        summary.declared_count = attr(&e, "count").and_then(|v| v.parse().ok());
                    }
                    "call" => emit!(parse_call(&e, path, index).map(Record::Call)),
                    "sms" => emit!(parse_sms(&e, path, index).map(|t| Record::Message(Message::Text(t)))),
                    "mms" => {
                        let build = MmsBuild::new(&e, path, index)?;
                        emit!(build.finish().map(|m| Record::Message(Message::Multimedia(m))))
                    }
                    "part" => {
                        if let Some(top) = mms_stack.last_mut() {
                            top.push_part(&e)?;
                        }
                    }
                    "addr" => {
                        if let Some(top) = mms_stack.last_mut() {
                            top.push_addr(&e);
                        }
                    }
                    _ => {}
                }
            }

            Event::End(e) => {
                if skip_depth > 0 {
                    skip_depth -= 1;
                    continue;
                }
                let local = String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
                if local == "mms" {
                    if let Some(top) = mms_stack.pop() {
                        emit!(top.finish().map(|m| Record::Message(Message::Multimedia(m))));
                    }
                }
            }

            Event::Text(ref e) if e.len() > MAX_TOKEN_BYTES => {
                return Err(too_large(path, &xml));
            }

            Event::DocType(_) => {
                return Err(CoreError::MalformedXml {
                    path: path.to_path_buf(),
                    offset: xml.buffer_position(),
                    message: "DTD processing is not permitted".to_owned(),
                });
            }

            _ => {}
        }
    }

    summary.actual_count = index;
    Ok(summary)
}

fn xml_error(path: &Path, reader: &Reader<impl BufRead>, e: quick_xml::Error) -> CoreError {
    CoreError::MalformedXml {
        path: path.to_path_buf(),
        offset: reader.buffer_position(),
        message: e.to_string(),
    }
}

fn too_large(path: &Path, reader: &Reader<impl BufRead>) -> CoreError {
    CoreError::MalformedXml {
        path: path.to_path_buf(),
        offset: reader.buffer_position(),
        message: "token exceeds maximum size".to_owned(),
    }
}

fn local_name(e: &BytesStart) -> String {
    let raw = e.name();
    let raw = raw.as_ref();
    let local = match raw.iter().position(|b| *b == b':') {
        Some(idx) => &raw[idx + 1..],
        None => raw,
    };
    String::from_utf8_lossy(local).to_ascii_lowercase()
}

fn attr(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == name.as_bytes() {
            Some(String::from_utf8_lossy(a.value.as_ref()).into_owned())
        } else {
            None
        }
    })
}

fn all_attrs(e: &BytesStart) -> BTreeMap<String, String> {
    e.attributes()
        .flatten()
        .map(|a| {
            (
                String::from_utf8_lossy(a.key.as_ref()).to_string(),
                String::from_utf8_lossy(a.value.as_ref()).into_owned(),
            )
        })
        .collect()
}

/// "null" literal or missing ⇒ `None`; otherwise the string (§4.1).
fn norm_opt_string(raw: Option<String>) -> Option<String> {
    match raw {
        None => None,
        Some(s) if s.is_empty() || s == "null" => None,
        Some(s) => Some(s),
    }
}

/// Empty or `"null"` ⇒ 0; integer parse failure ⇒ `MalformedRecord` (§4.1).
fn norm_int(raw: Option<String>, field: &str, path: &Path, index: usize) -> Result<i64> {
    match raw {
        None => Ok(0),
        Some(s) if s.is_empty() || s == "null" => Ok(0),
        Some(s) => s.parse::<i64>().map_err(|_| CoreError::MalformedRecord {
            path: path.to_path_buf(),
            record_index: index,
            message: format!("field '{field}' is not a valid integer: {s:?}"),
        }),
    }
}

/// `"1"` ⇒ 1, anything else (including missing) ⇒ 0 (§4.1).
fn norm_flag(raw: Option<String>) -> i32 {
    match raw.as_deref() {
        Some("1") => 1,
        _ => 0,
    }
}

fn parse_call(e: &BytesStart, path: &Path, index: usize) -> Result<Call> {
    let number = norm_opt_string(attr(e, "number")).unwrap_or_default();
    let duration_s = norm_int(attr(e, "duration"), "duration", path, index)?;
    let timestamp_ms = norm_int(attr(e, "date"), "date", path, index)?;
    let kind_code = norm_int(attr(e, "type"), "type", path, index)? as i32;
    let kind = CallKind::from_code(kind_code).ok_or_else(|| CoreError::MalformedRecord {
        path: path.to_path_buf(),
        record_index: index,
        message: format!("unknown call type code: {kind_code}"),
    })?;
    let readable_date = norm_opt_string(attr(e, "readable_date")).unwrap_or_default();
    let contact_name = norm_opt_string(attr(e, "contact_name"));

    Ok(Call {
        number,
        duration_s,
        timestamp_ms,
        kind,
        readable_date,
        contact_name,
    })
}

fn parse_sms(e: &BytesStart, path: &Path, index: usize) -> Result<TextMessage> {
    let protocol = norm_opt_string(attr(e, "protocol"));
    let address = norm_opt_string(attr(e, "address")).unwrap_or_default();
    let timestamp_ms = norm_int(attr(e, "date"), "date", path, index)?;
    let direction_code = norm_int(attr(e, "type"), "type", path, index)? as i32;
    let direction = Direction::from_code(direction_code).ok_or_else(|| CoreError::MalformedRecord {
        path: path.to_path_buf(),
        record_index: index,
        message: format!("unknown sms type code: {direction_code}"),
    })?;
    let subject = norm_opt_string(attr(e, "subject"));
    let body = norm_opt_string(attr(e, "body")).unwrap_or_default();
    let service_center = norm_opt_string(attr(e, "service_center"));
    let read_flag = norm_flag(attr(e, "read"));
    let status = norm_int(attr(e, "status"), "status", path, index)? as i32;
    let locked_flag = norm_flag(attr(e, "locked"));
    let date_sent_ms = norm_int(attr(e, "date_sent"), "date_sent", path, index)?;
    let readable_date = norm_opt_string(attr(e, "readable_date")).unwrap_or_default();
    let contact_name = norm_opt_string(attr(e, "contact_name"));

    let known: &[&str] = &[
        "protocol", "address", "date", "type", "subject", "body", "service_center",
        "read", "status", "locked", "date_sent", "readable_date", "contact_name",
    ];
    let extra = all_attrs(e)
        .into_iter()
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .collect();

    Ok(TextMessage {
        protocol,
        address,
        timestamp_ms,
        direction,
        subject,
        body,
        service_center,
        read_flag,
        status,
        locked_flag,
        date_sent_ms,
        readable_date,
        contact_name,
        extra,
    })
}

/// Accumulates an in-progress `<mms>` while its `<parts>`/`<addrs>` children
/// stream past; finished into a `MultimediaMessage` on the matching close.
struct MmsBuild {
    path: PathBuf,
    index: usize,
    timestamp_ms: i64,
    msg_box: i32,
    address: String,
    m_type: Option<String>,
    m_id: Option<String>,
    thread_id: Option<i64>,
    parts: Vec<Part>,
    addresses: Vec<AddressEntry>,
    extra: BTreeMap<String, String>,
}

impl MmsBuild {
    fn new(e: &BytesStart, path: &Path, index: usize) -> Result<Self> {
        let timestamp_ms = norm_int(attr(e, "date"), "date", path, index)?;
        let msg_box = norm_int(attr(e, "msg_box"), "msg_box", path, index)? as i32;
        let address = norm_opt_string(attr(e, "address")).unwrap_or_default();
        let m_type = norm_opt_string(attr(e, "m_type"));
        let m_id = norm_opt_string(attr(e, "m_id"));
        let thread_id = match norm_opt_string(attr(e, "thread_id")) {
            Some(s) => Some(s.parse::<i64>().map_err(|_| CoreError::MalformedRecord {
                path: path.to_path_buf(),
                record_index: index,
                message: format!("field 'thread_id' is not a valid integer: {s:?}"),
            })?),
            None => None,
        };

        let known: &[&str] = &["date", "msg_box", "address", "m_type", "m_id", "thread_id"];
        let extra = all_attrs(e)
            .into_iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .collect();

        Ok(MmsBuild {
            path: path.to_path_buf(),
            index,
            timestamp_ms,
            msg_box,
            address,
            m_type,
            m_id,
            thread_id,
            parts: Vec::new(),
            addresses: Vec::new(),
            extra,
        })
    }

    fn push_part(&mut self, e: &BytesStart) -> Result<()> {
        let seq = norm_int(attr(e, "seq"), "seq", &self.path, self.index)? as i32;
        let content_type = norm_opt_string(attr(e, "ct")).unwrap_or_default();
        let name = norm_opt_string(attr(e, "name"));
        let charset = norm_opt_string(attr(e, "chset"));
        let content_disposition = norm_opt_string(attr(e, "cd"));
        let filename = norm_opt_string(attr(e, "fn"));
        let content_id = norm_opt_string(attr(e, "cid"));
        let content_location = norm_opt_string(attr(e, "cl"));
        let text = norm_opt_string(attr(e, "text"));
        let data = norm_opt_string(attr(e, "data"));
        let attachment_ref = norm_opt_string(attr(e, "AttachmentRef"));

        self.parts.push(Part {
            seq,
            content_type,
            name,
            charset,
            content_disposition,
            filename,
            content_id,
            content_location,
            text,
            data,
            path: None,
            original_size: None,
            extraction_date: None,
            attachment_ref,
        });
        Ok(())
    }

    fn push_addr(&mut self, e: &BytesStart) {
        let address = norm_opt_string(attr(e, "address")).unwrap_or_default();
        let kind = norm_int(attr(e, "type"), "type", &self.path, self.index).unwrap_or(0) as i32;
        let charset = norm_int(attr(e, "charset"), "charset", &self.path, self.index).unwrap_or(0) as i32;
        self.addresses.push(AddressEntry { address, kind, charset });
    }

    fn finish(self) -> Result<MultimediaMessage> {
        Ok(MultimediaMessage {
            timestamp_ms: self.timestamp_ms,
            msg_box: self.msg_box,
            address: self.address,
            m_type: self.m_type,
            m_id: self.m_id,
            thread_id: self.thread_id,
            parts: self.parts,
            addresses: self.addresses,
            extra: self.extra,
        })
    }
}

/// Separate validation pass (§4.1): reads the declared count and walks
/// every record, asserting year and count agreement. Checks `cancel` every
/// 100 records, per §5.
pub fn validate_file<R: BufRead>(
    source: R,
    path: &Path,
    expected_year: i32,
    cancel: &crate::cancel::CancellationToken,
) -> Result<()> {
    let mut actual = 0usize;
    let mut year_mismatch: Option<CoreError> = None;
    let mut checked = 0usize;

    let summary = stream_records(
        source,
        path,
        &mut |index: usize, record: std::result::Result<Record, CoreError>| {
            if let Ok(record) = record {
                actual += 1;
                let actual_year = record.utc_year();
                if year_mismatch.is_none() && actual_year != expected_year {
                    year_mismatch = Some(CoreError::YearMismatch {
                        path: path.to_path_buf(),
                        record_index: index,
                        expected_year,
                        actual_year,
                    });
                }
            }
            checked += 1;
            if checked % 100 == 0 && cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            Ok(())
        },
        cancel,
    )?;

    if let Some(err) = year_mismatch {
        return Err(err);
    }

    if let Some(declared) = summary.declared_count {
        if declared != actual {
            return Err(CoreError::CountMismatch {
                path: path.to_path_buf(),
                declared,
                actual,
            });
        }
    }

    Ok(())
}
