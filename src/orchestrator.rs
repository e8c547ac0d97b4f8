//! Ingest Orchestrator (§6): the four boundary functions the CLI calls —
//! `open_repository`, `coalesce`, `validate`, `manifest` — plus the
//! `Repository` handle and report types they return.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::attachments::AttachmentStore;
use crate::cancel::CancellationToken;
use crate::coalescer::{Admission, Coalescer};
use crate::error::{CoreError, Result};
use crate::extractor::extract_mms;
use crate::hash::Identity;
use crate::manifest::{self, Manifest};
use crate::reader;
use crate::record::{Message, Record};
use crate::writer;

const MARKER_FILE: &str = ".mobilecombackup.yaml";
const SUPPORTED_STRUCTURE_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Marker {
    repository_structure_version: String,
}

/// An opened, validated repository root (§15 marker handling).
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads and validates `.mobilecombackup.yaml`; fails if it's missing or
    /// names an unsupported structure version.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let marker_path = root.join(MARKER_FILE);
        let bytes = fs::read(&marker_path).map_err(|e| CoreError::io(&marker_path, e))?;
        let marker: Marker = serde_yaml::from_slice(&bytes).map_err(|e| CoreError::MalformedRecord {
            path: marker_path.clone(),
            record_index: 0,
            message: format!("invalid {MARKER_FILE}: {e}"),
        })?;
        if marker.repository_structure_version != SUPPORTED_STRUCTURE_VERSION {
            return Err(CoreError::MalformedRecord {
                path: marker_path,
                record_index: 0,
                message: format!(
                    "unsupported repository_structure_version {:?}, expected {SUPPORTED_STRUCTURE_VERSION:?}",
                    marker.repository_structure_version
                ),
            });
        }
        Ok(Repository { root })
    }

    /// Creates a fresh repository at `root`: writes the marker and the
    /// `calls/`, `sms/`, `attachments/`, `rejected/` directories.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CoreError::io(&root, e))?;
        for dir in ["calls", "sms", "attachments", "rejected"] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| CoreError::io(&path, e))?;
        }
        let marker = Marker { repository_structure_version: SUPPORTED_STRUCTURE_VERSION.to_owned() };
        let yaml = serde_yaml::to_string(&marker)
            .map_err(|e| CoreError::StoreFailure { hash: MARKER_FILE.to_owned(), message: e.to_string() })?;
        let marker_path = root.join(MARKER_FILE);
        fs::write(&marker_path, yaml.as_bytes()).map_err(|e| CoreError::io(&marker_path, e))?;
        Ok(Repository { root })
    }
}

pub fn open_repository(root: impl Into<PathBuf>) -> Result<Repository> {
    Repository::open(root)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct YearCounts {
    pub new: usize,
    pub duplicate: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub new: usize,
    pub duplicate: usize,
    pub rejected: usize,
    pub attachments_extracted: usize,
    pub attachments_referenced: usize,
    pub attachment_bytes_new: u64,
    pub attachment_bytes_referenced: u64,
    pub per_year: BTreeMap<i32, YearCounts>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountMismatchDetail {
    pub path: PathBuf,
    pub declared: usize,
    pub actual: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearMismatchDetail {
    pub path: PathBuf,
    pub record_index: usize,
    pub expected_year: i32,
    pub actual_year: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub files_checked: usize,
    pub count_mismatches: Vec<CountMismatchDetail>,
    pub year_mismatches: Vec<YearMismatchDetail>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.count_mismatches.is_empty() && self.year_mismatches.is_empty()
    }
}

fn rejected_sink_paths(repo_root: &Path, source_stem: &str) -> (PathBuf, PathBuf) {
    let dir = repo_root.join("rejected");
    (
        dir.join(format!("{source_stem}.rejected.xml")),
        dir.join(format!("{source_stem}.rejected.log")),
    )
}

/// Appends a structured note about a record the reader couldn't parse.
/// The streaming reader doesn't retain each record's raw markup (it parses
/// attribute-by-attribute without buffering the source token), so the
/// rejected-record sink captures the error detail rather than re-emitting
/// the original bytes verbatim.
fn write_rejected(repo_root: &Path, source_stem: &str, index: usize, err: &CoreError) -> Result<()> {
    let (xml_path, log_path) = rejected_sink_paths(repo_root, source_stem);
    if let Some(parent) = xml_path.parent() {
        fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
    }
    let fragment = format!("<!-- rejected record #{index}: {err} -->\n");
    append(&xml_path, fragment.as_bytes())?;
    let log_line = format!("record #{index}: {err}\n");
    append(&log_path, log_line.as_bytes())
}

fn append(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CoreError::io(path, e))?;
    f.write_all(bytes).map_err(|e| CoreError::io(path, e))
}

fn source_stem(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "source".to_owned())
}

/// Walks every existing `calls/calls-*.xml` and `sms/sms-*.xml` file,
/// feeding their records into `coalescer` so re-importing overlapping
/// sources stays idempotent (§4.5 pre-seeding).
fn pre_seed(repo: &Repository, coalescer: &mut Coalescer<Record>, cancel: &CancellationToken) -> Result<()> {
    for dir in ["calls", "sms"] {
        let dir_path = repo.root().join(dir);
        let Ok(read_dir) = fs::read_dir(&dir_path) else { continue };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("xml") {
                continue;
            }
            let file = File::open(&path).map_err(|e| CoreError::io(&path, e))?;
            reader::stream_records(
                BufReader::new(file),
                &path,
                &mut |_index: usize, record: std::result::Result<Record, CoreError>| {
                    if let Ok(record) = record {
                        coalescer.add(record);
                    }
                    Ok(())
                },
                cancel,
            )?;
        }
    }
    Ok(())
}

/// Streams every source file into the repository's coalescer, extracting
/// MMS attachments along the way, then writes the updated year partitions.
pub fn coalesce(
    repo: &Repository,
    sources: &[PathBuf],
    cancel: &CancellationToken,
) -> Result<IngestReport> {
    let store = AttachmentStore::new(repo.root());
    let mut coalescer: Coalescer<Record> = Coalescer::new();
    pre_seed(repo, &mut coalescer, cancel)?;

    let mut report = IngestReport::default();

    for source in sources {
        let start_time = Instant::now();
        info!("ingesting {}", source.display());
        let file = File::open(source).map_err(|e| CoreError::io(source, e))?;
        let stem = source_stem(source);

        reader::stream_records(
            BufReader::new(file),
            source,
            &mut |index: usize, record: std::result::Result<Record, CoreError>| {
                let mut record = match record {
                    Ok(r) => r,
                    Err(err) => {
                        warn!("rejecting record #{index} in {}: {err}", source.display());
                        write_rejected(repo.root(), &stem, index, &err)?;
                        report.rejected += 1;
                        return Ok(());
                    }
                };

                if let Record::Message(Message::Multimedia(mms)) = &mut record {
                    match extract_mms(mms, &store) {
                        Ok(summary) => {
                            debug!(
                                "mms #{index} in {}: {} extracted, {} referenced, {} skipped",
                                source.display(),
                                summary.extracted,
                                summary.referenced,
                                summary.skipped,
                            );
                            report.attachments_extracted += summary.extracted;
                            report.attachments_referenced += summary.referenced;
                            report.attachment_bytes_new += summary.bytes_new;
                            report.attachment_bytes_referenced += summary.bytes_referenced;
                        }
                        Err(err @ (CoreError::DecodeError { .. } | CoreError::StoreFailure { .. })) => {
                            warn!("rejecting record #{index} in {}: {err}", source.display());
                            write_rejected(repo.root(), &stem, index, &err)?;
                            report.rejected += 1;
                            return Ok(());
                        }
                        Err(other) => return Err(other),
                    }
                }

                let year = record.year();
                let year_counts = report.per_year.entry(year).or_default();
                match coalescer.add(record) {
                    Admission::New => {
                        report.new += 1;
                        year_counts.new += 1;
                    }
                    Admission::Duplicate => {
                        report.duplicate += 1;
                        year_counts.duplicate += 1;
                    }
                }
                Ok(())
            },
            cancel,
        )?;

        info!(
            "ingested {} in {} ms",
            source.display(),
            start_time.elapsed().as_millis()
        );
    }

    let by_year = coalescer.by_year();
    let mut calls_by_year: BTreeMap<i32, Vec<Record>> = BTreeMap::new();
    let mut messages_by_year: BTreeMap<i32, Vec<Record>> = BTreeMap::new();
    for (year, records) in by_year {
        for record in records {
            if record.is_call() {
                calls_by_year.entry(year).or_default().push(record);
            } else {
                messages_by_year.entry(year).or_default().push(record);
            }
        }
    }
    writer::write_partitions(repo.root(), &calls_by_year, &messages_by_year)?;

    for (year, counts) in &report.per_year {
        info!("year {year}: {} new, {} duplicate", counts.new, counts.duplicate);
    }

    Ok(report)
}

/// Validates every existing year file's declared count and year consistency
/// (§4.1 `validate_file`, §8).
pub fn validate(repo: &Repository, cancel: &CancellationToken) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();

    for dir in ["calls", "sms"] {
        let dir_path = repo.root().join(dir);
        let Ok(read_dir) = fs::read_dir(&dir_path) else { continue };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("xml") {
                continue;
            }
            let Some(year) = year_from_filename(&path) else { continue };

            let file = File::open(&path).map_err(|e| CoreError::io(&path, e))?;
            report.files_checked += 1;
            match reader::validate_file(BufReader::new(file), &path, year, cancel) {
                Ok(()) => {}
                Err(CoreError::CountMismatch { path, declared, actual }) => {
                    report.count_mismatches.push(CountMismatchDetail { path, declared, actual });
                }
                Err(CoreError::YearMismatch { path, record_index, expected_year, actual_year }) => {
                    report.year_mismatches.push(YearMismatchDetail {
                        path,
                        record_index,
                        expected_year,
                        actual_year,
                    });
                }
                Err(other) => return Err(other),
            }
        }
    }

    Ok(report)
}

fn year_from_filename(path: &Path) -> Option<i32> {
    let stem = path.file_stem()?.to_str()?;
    stem.rsplit('-').next()?.parse().ok()
}

/// Builds and writes the manifest for `repo` (§4.7).
pub fn manifest(repo: &Repository, generator: &str) -> Result<Manifest> {
    manifest::write_manifest(repo.root(), generator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_open_roundtrips_marker() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        Repository::init(&root).unwrap();
        let repo = Repository::open(&root).unwrap();
        assert_eq!(repo.root(), root);
        assert!(root.join("calls").is_dir());
        assert!(root.join("attachments").is_dir());
    }

    #[test]
    fn open_rejects_missing_marker() {
        let dir = tempfile::tempdir().unwrap();
        let err = Repository::open(dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::Io { .. }));
    }

    #[test]
    fn open_rejects_unsupported_structure_version() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MARKER_FILE), b"repository_structure_version: '99'\n").unwrap();
        let err = Repository::open(dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::MalformedRecord { .. }));
    }

    #[test]
    fn coalesce_ingests_calls_and_writes_year_partition() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        let repo = Repository::init(&root).unwrap();

        let source = dir.path().join("calls-2014.xml");
        fs::write(
            &source,
            br#"<calls count="1"><call number="+1" duration="0" date="1410881505425" type="1"/></calls>"#,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let report = coalesce(&repo, &[source], &cancel).unwrap();
        assert_eq!(report.new, 1);
        assert_eq!(report.duplicate, 0);
        assert!(root.join("calls/calls-2014.xml").exists());
    }

    #[test]
    fn reimporting_identical_source_is_fully_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        let repo = Repository::init(&root).unwrap();

        let source = dir.path().join("calls-2014.xml");
        fs::write(
            &source,
            br#"<calls count="1"><call number="+1" duration="0" date="1410881505425" type="1"/></calls>"#,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        coalesce(&repo, &[source.clone()], &cancel).unwrap();
        let second = coalesce(&repo, &[source], &cancel).unwrap();
        assert_eq!(second.new, 0);
        assert_eq!(second.duplicate, 1);
    }

    #[test]
    fn malformed_record_is_rejected_and_sunk_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        let repo = Repository::init(&root).unwrap();

        let source = dir.path().join("calls-2014.xml");
        fs::write(
            &source,
            br#"<calls count="1"><call number="+1" duration="not-a-number" date="1000" type="1"/></calls>"#,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let report = coalesce(&repo, &[source], &cancel).unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.new, 0);
        assert!(root.join("rejected/calls-2014.rejected.xml").exists());
        assert!(root.join("rejected/calls-2014.rejected.log").exists());
    }

    #[test]
    fn mms_with_corrupt_attachment_is_rejected_without_aborting_the_rest_of_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        let repo = Repository::init(&root).unwrap();

        let source = dir.path().join("mms.xml");
        fs::write(
            &source,
            format!(
                r#"<smses count="2">
<mms date="1410881505425" msg_box="1" address="+1" m_type="128" m_id="1" thread_id="1">
  <parts><part seq="0" ct="image/png" name="bad.png" data="{}"/></parts>
  <addrs><addr address="+1" type="137" charset="106"/></addrs>
</mms>
<sms protocol="0" address="+2" date="1410881505426" type="1" body="fine" read="1" status="-1" locked="0" date_sent="1410881505426"/>
</smses>"#,
                "*".repeat(2000)
            ),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let report = coalesce(&repo, &[source], &cancel).unwrap();
        assert_eq!(report.rejected, 1, "the corrupt mms must be rejected, not bubble an error");
        assert_eq!(report.new, 1, "the well-formed sms in the same archive must still be ingested");
        assert!(root.join("rejected/mms.rejected.log").exists());

        let sms_contents = fs::read_to_string(root.join("sms/sms-2014.xml")).unwrap();
        assert!(sms_contents.contains("fine"), "year file must still be written for the surviving record");
    }

    #[test]
    fn validate_reports_count_mismatch_for_year_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        let repo = Repository::init(&root).unwrap();
        fs::write(
            root.join("calls/calls-2014.xml"),
            br#"<calls count="5"><call number="+1" duration="0" date="1410881505425" type="1"/></calls>"#,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let report = validate(&repo, &cancel).unwrap();
        assert_eq!(report.files_checked, 1);
        assert_eq!(report.count_mismatches.len(), 1);
        assert!(!report.is_clean());
    }
}
