//! Partition Router & Writer (§4.6): buckets coalesced records by UTC year
//! and serializes each bucket back to the on-disk schema.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use chrono_tz::America::New_York;
use quick_xml::escape::escape;

use crate::error::{CoreError, Result};
use crate::hash::record_identity;
use crate::record::{Call, Message, MultimediaMessage, Record, TextMessage};

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// America/New_York-formatted `"Jan 2, 2006 3:04:05 PM"`-style rendering of
/// a UTC-millis timestamp (§4.6). Locale-independent: month names are
/// rendered in English regardless of host locale.
pub fn readable_date(timestamp_ms: i64) -> String {
    let utc = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    let local = utc.with_timezone(&New_York);
    local.format("%b %-d, %Y %-I:%M:%S %p").to_string()
}

fn attr(buf: &mut String, name: &str, value: &str) {
    buf.push(' ');
    buf.push_str(name);
    buf.push_str("=\"");
    buf.push_str(&escape(value));
    buf.push('"');
}

fn opt_attr(buf: &mut String, name: &str, value: Option<&str>) {
    attr(buf, name, value.unwrap_or("null"));
}

fn serialize_call(call: &Call) -> String {
    let mut line = String::from("  <call");
    attr(&mut line, "number", &call.number);
    attr(&mut line, "duration", &call.duration_s.to_string());
    attr(&mut line, "date", &call.timestamp_ms.to_string());
    attr(&mut line, "type", &call.kind.code().to_string());
    attr(&mut line, "readable_date", &call.readable_date);
    opt_attr(&mut line, "contact_name", call.contact_name.as_deref());
    line.push_str(" />");
    line
}

fn serialize_sms(sms: &TextMessage) -> String {
    let mut line = String::from("  <sms");
    opt_attr(&mut line, "protocol", sms.protocol.as_deref());
    attr(&mut line, "address", &sms.address);
    attr(&mut line, "date", &sms.timestamp_ms.to_string());
    attr(&mut line, "type", &sms.direction.code().to_string());
    opt_attr(&mut line, "subject", sms.subject.as_deref());
    attr(&mut line, "body", &sms.body);
    opt_attr(&mut line, "service_center", sms.service_center.as_deref());
    attr(&mut line, "read", &sms.read_flag.to_string());
    attr(&mut line, "status", &sms.status.to_string());
    attr(&mut line, "locked", &sms.locked_flag.to_string());
    attr(&mut line, "date_sent", &sms.date_sent_ms.to_string());
    attr(&mut line, "readable_date", &sms.readable_date);
    opt_attr(&mut line, "contact_name", sms.contact_name.as_deref());
    for (k, v) in &sms.extra {
        attr(&mut line, k, v);
    }
    line.push_str(" />");
    line
}

fn serialize_mms(mms: &MultimediaMessage) -> String {
    let mut out = String::from("  <mms");
    attr(&mut out, "date", &mms.timestamp_ms.to_string());
    attr(&mut out, "msg_box", &mms.msg_box.to_string());
    attr(&mut out, "address", &mms.address);
    opt_attr(&mut out, "m_type", mms.m_type.as_deref());
    opt_attr(&mut out, "m_id", mms.m_id.as_deref());
    if let Some(thread_id) = mms.thread_id {
        attr(&mut out, "thread_id", &thread_id.to_string());
    }
    for (k, v) in &mms.extra {
        attr(&mut out, k, v);
    }
    out.push_str(">\n");

    out.push_str("    <parts>\n");
    for part in &mms.parts {
        out.push_str("      <part");
        attr(&mut out, "seq", &part.seq.to_string());
        attr(&mut out, "ct", &part.content_type);
        opt_attr(&mut out, "name", part.name.as_deref());
        opt_attr(&mut out, "chset", part.charset.as_deref());
        opt_attr(&mut out, "cd", part.content_disposition.as_deref());
        opt_attr(&mut out, "fn", part.filename.as_deref());
        opt_attr(&mut out, "cid", part.content_id.as_deref());
        opt_attr(&mut out, "cl", part.content_location.as_deref());
        if let Some(text) = part.text.as_deref() {
            attr(&mut out, "text", text);
        }
        if let Some(data) = part.data.as_deref() {
            attr(&mut out, "data", data);
        }
        if let Some(path) = part.path.as_deref() {
            attr(&mut out, "path", path);
        }
        if let Some(size) = part.original_size {
            attr(&mut out, "original_size", &size.to_string());
        }
        if let Some(extracted) = part.extraction_date.as_deref() {
            attr(&mut out, "extraction_date", extracted);
        }
        opt_attr(&mut out, "AttachmentRef", part.attachment_ref.as_deref());
        out.push_str(" />\n");
    }
    out.push_str("    </parts>\n");

    out.push_str("    <addrs>\n");
    for addr in &mms.addresses {
        out.push_str("      <addr");
        attr(&mut out, "address", &addr.address);
        attr(&mut out, "type", &addr.kind.to_string());
        attr(&mut out, "charset", &addr.charset.to_string());
        out.push_str(" />\n");
    }
    out.push_str("    </addrs>\n");

    out.push_str("  </mms>");
    out
}

fn with_refreshed_readable_date(record: Record) -> Record {
    let date = readable_date(record.timestamp_ms());
    match record {
        Record::Call(mut c) => {
            c.readable_date = date;
            Record::Call(c)
        }
        Record::Message(Message::Text(mut t)) => {
            t.readable_date = date;
            Record::Message(Message::Text(t))
        }
        other @ Record::Message(Message::Multimedia(_)) => other,
    }
}

fn sort_key(record: &Record) -> (i64, [u8; 32]) {
    (record.timestamp_ms(), record_identity(record))
}

/// Writes one year's worth of records to `path`, atomically. `records` need
/// not be pre-sorted; this function sorts by timestamp, tiebroken by
/// identity hash, per §4.6.
pub fn write_year_file(path: &Path, container_tag: &str, mut records: Vec<Record>) -> Result<()> {
    records.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    let records: Vec<Record> = records.into_iter().map(with_refreshed_readable_date).collect();

    let mut body = String::new();
    body.push_str("<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>\n");
    body.push_str(&format!("<{container_tag} count=\"{}\">\n", records.len()));
    for record in &records {
        let line = match record {
            Record::Call(c) => serialize_call(c),
            Record::Message(Message::Text(t)) => serialize_sms(t),
            Record::Message(Message::Multimedia(m)) => serialize_mms(m),
        };
        body.push_str(&line);
        body.push('\n');
    }
    body.push_str(&format!("</{container_tag}>\n"));

    write_atomic(path, body.as_bytes())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        let _ = set_mode(parent, 0o750);
    }
    let tmp_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_owned(),
    });
    let write_result = (|| -> std::io::Result<()> {
        let mut f = File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        set_mode(&tmp_path, 0o600)
    })();
    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(CoreError::io(&tmp_path, e));
    }
    fs::rename(&tmp_path, path).map_err(|e| CoreError::io(path, e))?;
    Ok(())
}

/// Repo-relative path for a record's year file (§6): `calls/calls-<Y>.xml`
/// or `sms/sms-<Y>.xml`.
pub fn year_file_path(repo_root: &Path, is_call: bool, year: i32) -> PathBuf {
    if is_call {
        repo_root.join("calls").join(format!("calls-{year}.xml"))
    } else {
        repo_root.join("sms").join(format!("sms-{year}.xml"))
    }
}

/// Writes every year bucket produced by the coalescer (calls and messages
/// share the same routing rule but different container tags and paths).
pub fn write_partitions(
    repo_root: &Path,
    calls_by_year: &BTreeMap<i32, Vec<Record>>,
    messages_by_year: &BTreeMap<i32, Vec<Record>>,
) -> Result<()> {
    for (year, records) in calls_by_year {
        let path = year_file_path(repo_root, true, *year);
        write_year_file(&path, "calls", records.clone())?;
    }
    for (year, records) in messages_by_year {
        let path = year_file_path(repo_root, false, *year);
        write_year_file(&path, "smses", records.clone())?;
    }
    Ok(())
}
