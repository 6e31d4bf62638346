use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::{
    engine::EngineHandle,
    options::{Ddir, JobOptions, PerDdir},
    random::RandomStreams,
    rate::RateLimit,
};

/// Size of a file that cannot be known up front.
pub const UNKNOWN_FILE_SIZE: u64 = u64::MAX;

const LOG_INITIAL_SAMPLES: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobFile {
    pub name: String,
    pub real_file_size: u64,
}

/// Running min/max/mean of one latency or bandwidth series.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct IoStat {
    pub min_val: u64,
    pub max_val: u64,
    pub samples: u64,
    pub mean: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ThreadStats {
    pub clat: PerDdir<IoStat>,
    pub slat: PerDdir<IoStat>,
    pub lat: PerDdir<IoStat>,
    pub bw: PerDdir<IoStat>,
}

impl ThreadStats {
    /// Empty series whose minimums any first observation lowers.
    pub fn initial() -> Self {
        let mut stats = ThreadStats::default();
        for series in stats.series_mut() {
            for ddir in Ddir::ALL {
                series[ddir].min_val = u64::MAX;
            }
        }
        stats
    }

    pub fn series(&self) -> [&PerDdir<IoStat>; 4] {
        [&self.clat, &self.slat, &self.lat, &self.bw]
    }

    pub fn series_mut(&mut self) -> [&mut PerDdir<IoStat>; 4] {
        [&mut self.clat, &mut self.slat, &mut self.lat, &mut self.bw]
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Percentiles {
    pub clat: bool,
    /// `None` uses the default percentile set.
    pub list: Option<Vec<f64>>,
}

impl Percentiles {
    pub fn from_options(opts: &JobOptions) -> Self {
        Percentiles {
            clat: opts.clat_percentiles,
            list: opts.overwrite_plist.then(|| opts.percentile_list.clone()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogSample {
    pub time_ms: u64,
    pub value: u64,
    pub ddir: Ddir,
    pub bs: u32,
}

/// Sample buffers for the per-job latency and bandwidth logs.
#[derive(Clone, Debug, Default)]
pub struct JobLogs {
    pub lat: Option<Vec<LogSample>>,
    pub slat: Option<Vec<LogSample>>,
    pub clat: Option<Vec<LogSample>>,
    pub bw: Option<Vec<LogSample>>,
}

impl JobLogs {
    pub fn setup(&mut self, opts: &JobOptions) {
        let buffer = || Some(Vec::with_capacity(LOG_INITIAL_SAMPLES));
        if opts.write_lat_log {
            self.lat = buffer();
            self.slat = buffer();
            self.clat = buffer();
        }
        if opts.write_bw_log {
            self.bw = buffer();
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobError {
    pub code: i32,
    pub message: String,
}

/// What a job changes while it runs. Kept in the job's arena slot, where
/// the controller and every worker see the same bytes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunState {
    pub pid: Option<u32>,
    pub error: Option<JobError>,
    pub rate: PerDdir<Option<RateLimit>>,
    pub stats: ThreadStats,
}

/// One runnable job instance.
#[derive(Clone, Debug, Default)]
pub struct WorkerRecord {
    /// 1-based slot key; zero only for the template.
    pub ordinal: u32,
    pub group_id: u32,
    pub options: JobOptions,
    pub files: Vec<JobFile>,
    /// The file list was generated from the job name rather than given.
    pub files_synthesized: bool,
    pub engine: Option<EngineHandle>,
    pub streams: RandomStreams,
    pub percentiles: Percentiles,
    pub logs: JobLogs,
    pub mutex: Option<Arc<Mutex<()>>>,
    pub ddir_seq_nr: u32,
}

impl WorkerRecord {
    /// The record holding global defaults. It is never executed.
    pub fn template() -> Self {
        WorkerRecord {
            ddir_seq_nr: 1,
            ..Default::default()
        }
    }

    pub fn is_template(&self) -> bool {
        self.ordinal == 0
    }

    /// Copy this record into a new slot. Owned collections are deep copies;
    /// identity fields start over.
    pub fn clone_for_slot(&self, ordinal: u32) -> Self {
        let mut child = self.clone();
        child.ordinal = ordinal;
        child.options.uid = None;
        child.options.gid = None;
        child.mutex = None;
        child
    }

    pub fn name(&self) -> &str {
        self.options.name.as_deref().unwrap_or("")
    }

    pub fn add_file(&mut self, name: impl Into<String>) {
        self.files.push(JobFile {
            name: name.into(),
            real_file_size: 0,
        });
    }

    /// The one-line description printed when a job is added.
    pub fn summary_line(&self) -> String {
        let o = &self.options;
        let engine = self.engine.as_ref();
        if engine.map_or(false, EngineHandle::synthetic) {
            return format!(
                "{}: ioengine=cpu, cpuload={}, cpucycle={}",
                self.name(),
                o.cpuload,
                o.cpucycle
            );
        }
        format!(
            "{}: (g={}): rw={}, bs={}-{}/{}-{}, ioengine={}, iodepth={}",
            self.name(),
            self.group_id,
            o.rw.name(),
            to_kmg(o.min_bs.read),
            to_kmg(o.max_bs.read),
            to_kmg(o.min_bs.write),
            to_kmg(o.max_bs.write),
            engine.map_or(o.ioengine.as_str(), EngineHandle::name),
            o.iodepth
        )
    }

    pub fn report(&self, run: &RunState) -> JobReport<'_> {
        JobReport {
            ordinal: self.ordinal,
            group_id: self.group_id,
            name: self.name(),
            engine: self.engine.as_ref().map(EngineHandle::name),
            files: &self.files,
            pid: run.pid,
            rate: run.rate,
            error: run.error.clone(),
            options: &self.options,
        }
    }
}

/// Serializable view of a ready record.
#[derive(Debug, Serialize)]
pub struct JobReport<'a> {
    pub ordinal: u32,
    pub group_id: u32,
    pub name: &'a str,
    pub engine: Option<&'a str>,
    pub files: &'a [JobFile],
    pub pid: Option<u32>,
    pub rate: PerDdir<Option<RateLimit>>,
    pub error: Option<JobError>,
    pub options: &'a JobOptions,
}

/// Render a block size with the largest exact binary suffix.
pub fn to_kmg(mut val: u32) -> String {
    const SUFFIXES: [&str; 4] = ["", "K", "M", "G"];
    let mut i = 0;
    while val != 0 && val & 1023 == 0 && i + 1 < SUFFIXES.len() {
        val >>= 10;
        i += 1;
    }
    format!("{val}{}", SUFFIXES[i])
}
