//! Integration tests exercising the full orchestrator boundary
//! (`open_repository` → `coalesce` → `validate` → `manifest`) against the
//! literal scenarios an ingest run must satisfy.

use std::fs;

use mobilecombackup::cancel::CancellationToken;
use mobilecombackup::orchestrator::{coalesce, manifest, open_repository, validate, Repository};
use pretty_assertions::assert_eq;

fn write_source(dir: &std::path::Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn single_call_ingest_writes_year_file_with_reformatted_date() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let repo = Repository::init(&root).unwrap();
    let source = write_source(
        dir.path(),
        "calls.xml",
        r#"<calls count="1"><call number="+15555550000" duration="0" date="1410881505425" type="3" readable_date="stale" contact_name="(Unknown)"/></calls>"#,
    );

    let cancel = CancellationToken::new();
    let report = coalesce(&repo, &[source], &cancel).unwrap();
    assert_eq!(report.new, 1);
    assert_eq!(report.duplicate, 0);

    let out_path = root.join("calls/calls-2014.xml");
    let contents = fs::read_to_string(&out_path).unwrap();
    assert!(contents.contains("count=\"1\""));
    assert!(contents.contains("+15555550000"));
    assert!(!contents.contains("stale"), "readable_date must be recomputed, not passed through");
}

#[test]
fn duplicate_call_ingested_twice_is_deduplicated_and_output_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let repo = Repository::init(&root).unwrap();
    let source = write_source(
        dir.path(),
        "calls.xml",
        r#"<calls count="1"><call number="+1" duration="0" date="1410881505425" type="1"/></calls>"#,
    );

    let cancel = CancellationToken::new();
    coalesce(&repo, &[source.clone()], &cancel).unwrap();
    let first_bytes = fs::read(root.join("calls/calls-2014.xml")).unwrap();

    let report = coalesce(&repo, &[source], &cancel).unwrap();
    assert_eq!(report.new, 0);
    assert_eq!(report.duplicate, 1);

    let second_bytes = fs::read(root.join("calls/calls-2014.xml")).unwrap();
    assert_eq!(first_bytes, second_bytes);
}

#[test]
fn count_mismatch_is_reported_by_validate() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let repo = Repository::init(&root).unwrap();
    fs::write(
        root.join("calls/calls-2014.xml"),
        r#"<calls count="3"><call number="+1" duration="0" date="1410881505425" type="1"/></calls>"#,
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let report = validate(&repo, &cancel).unwrap();
    assert_eq!(report.count_mismatches.len(), 1);
    assert_eq!(report.count_mismatches[0].declared, 3);
    assert_eq!(report.count_mismatches[0].actual, 1);
}

#[test]
fn cross_year_mixed_file_fails_validate_but_ingest_routes_by_year() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let repo = Repository::init(&root).unwrap();

    // One record in 2014, one in 2015, both declared under a 2014-named file.
    fs::write(
        root.join("calls/calls-2014.xml"),
        r#"<calls count="2"><call number="+1" duration="0" date="1410881505425" type="1"/><call number="+2" duration="0" date="1435702800000" type="1"/></calls>"#,
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let report = validate(&repo, &cancel).unwrap();
    assert_eq!(report.year_mismatches.len(), 1);

    // Now run it through coalesce/writer: it must split correctly on output.
    let source = write_source(
        dir.path(),
        "mixed.xml",
        r#"<calls count="2"><call number="+3" duration="0" date="1410881505425" type="1"/><call number="+4" duration="0" date="1435702800000" type="1"/></calls>"#,
    );
    coalesce(&repo, &[source], &cancel).unwrap();
    assert!(root.join("calls/calls-2015.xml").exists());
    let contents_2015 = fs::read_to_string(root.join("calls/calls-2015.xml")).unwrap();
    assert!(contents_2015.contains("+4"));
    assert!(!contents_2015.contains("+3"));
}

const SAMPLE_PNG_1180: &str = include_str!("fixtures/sample_png_base64_1180.txt");

#[test]
fn mms_image_part_is_extracted_and_text_parts_are_left_inline() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let repo = Repository::init(&root).unwrap();
    let xml = format!(
        r#"<smses count="1">
<mms date="1410881505425" msg_box="1" address="+15555550000" m_type="128" m_id="1" thread_id="1">
  <parts>
    <part seq="0" ct="application/smil" name="smil.xml" text="&lt;smil/&gt;"/>
    <part seq="1" ct="text/plain" text="hello there" cd="attachment"/>
    <part seq="2" ct="image/png" name="image.png" fn="image.png" data="{SAMPLE_PNG_1180}"/>
  </parts>
  <addrs><addr address="+15555550000" type="137" charset="106"/></addrs>
</mms>
</smses>"#
    );
    let source = write_source(dir.path(), "mms.xml", &xml);

    let cancel = CancellationToken::new();
    let report = coalesce(&repo, &[source], &cancel).unwrap();
    assert_eq!(report.attachments_extracted, 1);

    let out = fs::read_to_string(root.join("sms/sms-2014.xml")).unwrap();
    assert!(out.contains("smil.xml"), "SMIL part must survive unchanged");
    assert!(out.contains("original_size"));
    assert!(out.contains("extraction_date"));

    let attachments_dir = root.join("attachments");
    let mut found_png = false;
    for xx in fs::read_dir(&attachments_dir).unwrap().flatten() {
        for hash_dir in fs::read_dir(xx.path()).unwrap().flatten() {
            if hash_dir.path().join("image.png").exists() {
                found_png = true;
            }
        }
    }
    assert!(found_png, "extracted PNG blob must exist on disk");
}

#[test]
fn identical_attachment_bytes_across_two_mms_deduplicate_to_one_blob() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let repo = Repository::init(&root).unwrap();

    let xml = format!(
        r#"<smses count="2">
<mms date="1410881505425" msg_box="1" address="+1" m_type="128" m_id="1" thread_id="1">
  <parts><part seq="0" ct="image/png" name="a.png" fn="a.png" data="{SAMPLE_PNG_1180}"/></parts>
  <addrs><addr address="+1" type="137" charset="106"/></addrs>
</mms>
<mms date="1410881505426" msg_box="1" address="+2" m_type="128" m_id="2" thread_id="1">
  <parts><part seq="0" ct="image/png" name="b.png" fn="b.png" data="{SAMPLE_PNG_1180}"/></parts>
  <addrs><addr address="+2" type="137" charset="106"/></addrs>
</mms>
</smses>"#
    );
    let source = write_source(dir.path(), "mms2.xml", &xml);

    let cancel = CancellationToken::new();
    let report = coalesce(&repo, &[source], &cancel).unwrap();
    assert_eq!(report.attachments_extracted, 1);
    assert_eq!(report.attachments_referenced, 1);

    let attachments_dir = root.join("attachments");
    let mut blob_dirs = 0;
    for xx in fs::read_dir(&attachments_dir).unwrap().flatten() {
        blob_dirs += fs::read_dir(xx.path()).unwrap().count();
    }
    assert_eq!(blob_dirs, 1, "identical bytes must produce exactly one blob directory");
}

#[test]
fn manifest_round_trip_checksum_matches_and_every_listed_file_exists() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let repo = Repository::init(&root).unwrap();
    let source = write_source(
        dir.path(),
        "calls.xml",
        r#"<calls count="1"><call number="+1" duration="0" date="1410881505425" type="1"/></calls>"#,
    );
    let cancel = CancellationToken::new();
    coalesce(&repo, &[source], &cancel).unwrap();

    let built = manifest(&repo, "mobilecombackup-test").unwrap();

    let checksum_contents = fs::read_to_string(root.join("files.yaml.sha256")).unwrap();
    let manifest_digest = {
        use sha2::{Digest, Sha256};
        let bytes = fs::read(root.join("files.yaml")).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect::<String>()
    };
    assert!(checksum_contents.starts_with(&manifest_digest));

    for entry in &built.files {
        let path = root.join(&entry.name);
        assert!(path.exists(), "manifest-listed file {} must exist on disk", entry.name);
        let actual_size = fs::metadata(&path).unwrap().len();
        assert_eq!(actual_size, entry.size);
    }
}

#[test]
fn ingesting_two_archives_yields_union_minus_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let repo = Repository::init(&root).unwrap();

    let a = write_source(
        dir.path(),
        "a.xml",
        r#"<calls count="2"><call number="+1" duration="0" date="1410881505425" type="1"/><call number="+2" duration="0" date="1410881505426" type="1"/></calls>"#,
    );
    let b = write_source(
        dir.path(),
        "b.xml",
        r#"<calls count="2"><call number="+2" duration="0" date="1410881505426" type="1"/><call number="+3" duration="0" date="1410881505427" type="1"/></calls>"#,
    );

    let cancel = CancellationToken::new();
    coalesce(&repo, &[a], &cancel).unwrap();
    let second = coalesce(&repo, &[b], &cancel).unwrap();

    assert_eq!(second.new, 1, "only +3 is new in the second archive");
    assert_eq!(second.duplicate, 1, "+2 overlaps with the first archive");

    let contents = fs::read_to_string(root.join("calls/calls-2014.xml")).unwrap();
    assert_eq!(contents.matches("<call").count(), 3);
}
