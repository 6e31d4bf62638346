use std::{io::Write, path::Path};

use iogen::{
    arena::HeapBackend,
    parse_job_file,
    random::{Stream, REPEATABLE_SEED},
    record::WorkerRecord,
    JobRef, JobSource, JobTable, ParseOptions, SectionFilter, SetupConfig, SetupError,
};
use tempfile::NamedTempFile;

fn job_file(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

fn table() -> JobTable {
    JobTable::new(SetupConfig {
        max_jobs: 32,
        terse: true,
        ..Default::default()
    })
    .with_backend(HeapBackend::default())
}

/// Parse `paths` the way the command line does: fresh template per file and
/// a stonewall in front of every file but the first.
fn parse_all(t: &mut JobTable, paths: &[&Path], sections: &[&str]) -> Result<usize, SetupError> {
    let mut added = 0;
    for (i, path) in paths.iter().enumerate() {
        t.reset_template();
        let opts = ParseOptions {
            sections: SectionFilter::new(sections.iter().map(|s| s.to_string()).collect()),
            stonewall: i > 0,
            show_command: false,
        };
        added += parse_job_file(t, JobSource::Path(path), &opts)?.jobs_added;
    }
    Ok(added)
}

const SEQ: &str = "\
[global]
ioengine=libaio
iodepth=16
size=64m

[seq-read]
rw=read
bs=128k

[seq-write]
rw=write
bs=128k
";

const RANDOM: &str = "\
; random mix, paced
[rand]
rw=randrw
bsrange=4k-16k
numjobs=3
rate_iops=200
file_service_type=random
nrfiles=2
";

#[test]
fn files_form_groups_and_fan_out() {
    let a = job_file(SEQ);
    let b = job_file(RANDOM);
    let mut t = table();
    let added = parse_all(&mut t, &[a.path(), b.path()], &[]).unwrap();
    assert_eq!(added, 5);

    let recs: Vec<&WorkerRecord> = t.records().collect();
    let summary: Vec<(&str, u32)> = recs.iter().map(|r| (r.name(), r.group_id)).collect();
    assert_eq!(
        summary,
        vec![("seq-read", 0), ("seq-write", 0), ("rand", 1), ("rand", 1), ("rand", 1)]
    );

    // globals of the first file do not leak into the second
    assert_eq!(recs[0].options.iodepth, 16);
    assert_eq!(recs[2].options.iodepth, 1);
    assert_eq!(recs[2].engine.as_ref().unwrap().name(), "sync");

    let mut files: Vec<&str> = recs[2..]
        .iter()
        .flat_map(|r| r.files.iter().map(|f| f.name.as_str()))
        .collect();
    files.sort_unstable();
    assert_eq!(
        files,
        vec!["rand.3.0", "rand.3.1", "rand.4.0", "rand.4.1", "rand.5.0", "rand.5.1"]
    );

    let rate = |rec: &WorkerRecord| t.run_state(JobRef::Slot(rec.ordinal)).unwrap().rate;
    for rec in &recs[2..] {
        assert!(rec.streams.next_file.is_seeded());
        // 200 iops at the 4k minimum block size
        assert_eq!(rate(rec).read.unwrap().nsec_cycle, 1_000_000_000 / (200 * 4096));
    }
    assert!(!recs[0].streams.next_file.is_seeded());
    assert_eq!(rate(recs[0]).read, None);
}

#[test]
fn primary_seed_repeats_across_runs() {
    let file = job_file(RANDOM);
    let seeds = |t: &JobTable| -> Vec<u32> { t.records().map(|r| r.streams.seed(Stream::RandomIo)).collect() };

    let mut first = table();
    parse_all(&mut first, &[file.path()], &[]).unwrap();
    let mut second = table();
    parse_all(&mut second, &[file.path()], &[]).unwrap();

    assert_eq!(seeds(&first), seeds(&second));
    assert_eq!(seeds(&first)[0], REPEATABLE_SEED);
    assert_eq!(seeds(&first)[2], REPEATABLE_SEED.wrapping_mul(3));
}

#[test]
fn section_filter_applies_across_files() {
    let a = job_file(SEQ);
    let b = job_file(RANDOM);
    let mut t = table();
    let added = parse_all(&mut t, &[a.path(), b.path()], &["seq-write"]).unwrap();
    assert_eq!(added, 1);
    let rec = t.records().next().unwrap();
    assert_eq!(rec.name(), "seq-write");
    // global sections are still honoured
    assert_eq!(rec.options.iodepth, 16);
}

#[test]
fn dropped_job_leaves_earlier_jobs() {
    let good = job_file(SEQ);
    let bad = job_file("[conflict]\nrate=1m\nrate_iops=10\n");
    let mut t = table();
    let err = parse_all(&mut t, &[good.path(), bad.path()], &[]).unwrap_err();
    assert!(matches!(err, SetupError::ConfigConflict { ref job, .. } if job == "conflict"));
    assert_eq!(t.live(), 2);
}

#[test]
fn report_serializes() {
    let file = job_file(SEQ);
    let mut t = table();
    parse_all(&mut t, &[file.path()], &[]).unwrap();

    let json = serde_json::to_value(t.reports()).unwrap();
    assert_eq!(json[0]["name"], "seq-read");
    assert_eq!(json[0]["engine"], "libaio");
    assert_eq!(json[1]["options"]["rw"], "write");
    assert_eq!(json[1]["files"][0]["name"], "seq-write.2.0");
    assert!(json[1]["rate"]["read"].is_null());
    assert!(json[1]["pid"].is_null());
    assert!(json[1]["error"].is_null());
}

#[test]
fn limit_applies_to_fan_out() {
    let file = job_file("[wide]\nnumjobs=40\n");
    let mut t = table();
    let err = parse_all(&mut t, &[file.path()], &[]).unwrap_err();
    assert!(matches!(err, SetupError::JobLimitReached { max: 32 }));
    // the first record was released, its siblings stay
    assert_eq!(t.live(), 31);
}
