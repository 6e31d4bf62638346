use serde::Serialize;
use tracing::{error, warn};

use crate::{
    engine::{EngineHandle, LEGACY_DRAIN_ENGINE},
    error::SetupError,
    options::{Ddir, JobOptions, VerifyMode, UNBOUNDED_SIZE},
};

/// Host capabilities some rules depend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Platform {
    /// Mutexes can be shared between processes.
    pub pshared_mutex: bool,
    pub fdatasync: bool,
}

impl Platform {
    pub fn host() -> Self {
        Platform {
            pshared_mutex: cfg!(any(
                target_os = "linux",
                target_os = "freebsd",
                target_os = "solaris",
                target_os = "illumos"
            )),
            fdatasync: cfg!(any(
                target_os = "linux",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "solaris",
                target_os = "illumos"
            )),
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::host()
    }
}

/// What the rules may look at besides the options themselves.
#[derive(Clone, Copy, Debug)]
pub struct FixupContext<'a> {
    pub engine: &'a EngineHandle,
    /// Files actually attached to the record.
    pub files_present: u32,
    pub platform: Platform,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// A documented default; nothing is reported.
    Silent,
    /// Logged, never promoted.
    Notice,
    /// The job proceeds unless warnings are fatal.
    Warning,
    /// The job is dropped.
    Fatal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub rule: &'static str,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Warning(Vec<Diagnostic>),
    Fatal(Vec<Diagnostic>),
}

impl Outcome {
    /// Turn the outcome into the caller-facing result. With `warnings_fatal`
    /// every warning becomes a conflict.
    pub fn resolve(self, job: &str, warnings_fatal: bool) -> Result<Vec<Diagnostic>, SetupError> {
        match self {
            Outcome::Ok => Ok(Vec::new()),
            Outcome::Warning(reasons) if warnings_fatal => Err(SetupError::ConfigConflict {
                job: job.to_owned(),
                reasons,
            }),
            Outcome::Warning(warnings) => Ok(warnings),
            Outcome::Fatal(reasons) => Err(SetupError::ConfigConflict {
                job: job.to_owned(),
                reasons,
            }),
        }
    }
}

struct Rule {
    name: &'static str,
    severity: Severity,
    message: &'static str,
    when: fn(&JobOptions, &FixupContext<'_>) -> bool,
    effect: fn(&mut JobOptions, &FixupContext<'_>),
}

fn fixed_block_size(o: &JobOptions) -> bool {
    o.min_bs.read == o.max_bs.read
        && o.min_bs.write == o.max_bs.write
        && o.min_bs.read == o.min_bs.write
}

/// Rules are independent except for the default chains (block sizes before
/// alignment, file count before open-file count before zones), which the
/// order here encodes.
static RULES: &[Rule] = &[
    Rule {
        name: "thread_fallback",
        severity: Severity::Warning,
        message: "this platform does not support process shared mutexes, forcing use of threads",
        when: |o, cx| !cx.platform.pshared_mutex && !o.use_thread,
        effect: |o, _| o.use_thread = true,
    },
    Rule {
        name: "iolog_conflict",
        severity: Severity::Warning,
        message: "read iolog overrides write_iolog",
        when: |o, _| o.read_iolog_file.is_some() && o.write_iolog_file.is_some(),
        effect: |o, _| o.write_iolog_file = None,
    },
    Rule {
        name: "overwrite_for_reads",
        severity: Severity::Silent,
        message: "reads need pre-created files",
        when: |o, _| o.rw.is_read(),
        effect: |o, _| o.overwrite = true,
    },
    Rule {
        name: "bs_defaults",
        severity: Severity::Silent,
        message: "block size range defaults to bs",
        when: |_, _| true,
        effect: |o, _| {
            for d in Ddir::ALL {
                if o.min_bs[d] == 0 {
                    o.min_bs[d] = o.bs[d];
                }
                if o.max_bs[d] == 0 {
                    o.max_bs[d] = o.bs[d];
                }
            }
        },
    },
    Rule {
        name: "rw_min_bs",
        severity: Severity::Silent,
        message: "alignment unit is the smallest minimum block size",
        when: |_, _| true,
        effect: |o, _| o.rw_min_bs = o.min_bs.read.min(o.min_bs.write),
    },
    Rule {
        name: "ba_defaults",
        severity: Severity::Silent,
        message: "block alignment defaults to the minimum block size",
        when: |_, _| true,
        effect: |o, _| {
            for d in Ddir::ALL {
                if o.ba[d] == 0 || !o.rw.is_random() {
                    o.ba[d] = o.min_bs[d];
                }
            }
        },
    },
    Rule {
        name: "blockalign_randommap",
        severity: Severity::Warning,
        message: "any use of blockalign= turns off randommap",
        when: |o, _| {
            (o.ba.read != o.min_bs.read || o.ba.write != o.min_bs.write) && !o.norandommap
        },
        effect: |o, _| o.norandommap = true,
    },
    Rule {
        name: "file_size_high",
        severity: Severity::Silent,
        message: "file size upper bound defaults to the lower bound",
        when: |o, _| o.file_size_high == 0,
        effect: |o, _| o.file_size_high = o.file_size_low,
    },
    Rule {
        name: "verify_variable_bs",
        severity: Severity::Warning,
        message: "norandommap given for variable block sizes, verify disabled",
        when: |o, _| o.norandommap && o.verify != VerifyMode::None && !fixed_block_size(o),
        effect: |o, _| o.verify = VerifyMode::None,
    },
    Rule {
        name: "bs_unaligned_raw",
        severity: Severity::Notice,
        message: "bs_unaligned may not work with raw io",
        when: |o, cx| o.bs_unaligned && (o.direct || cx.engine.requires_raw_io()),
        effect: |_, _| {},
    },
    Rule {
        name: "thinktime_spin",
        severity: Severity::Silent,
        message: "thinktime_spin cannot exceed thinktime",
        when: |o, _| o.thinktime_spin > o.thinktime,
        effect: |o, _| o.thinktime_spin = o.thinktime,
    },
    Rule {
        name: "iodepth_low",
        severity: Severity::Silent,
        message: "low water mark defaults to the queue depth",
        when: |o, _| o.iodepth_low == 0 || o.iodepth_low > o.iodepth,
        effect: |o, cx| {
            // sequential jobs on this engine drain the queue to avoid seeking
            // between its async threads
            o.iodepth_low = if cx.engine.name() == LEGACY_DRAIN_ENGINE && !o.rw.is_random() {
                1
            } else {
                o.iodepth
            };
        },
    },
    Rule {
        name: "iodepth_batch",
        severity: Severity::Silent,
        message: "batch size defaults to the queue depth",
        when: |o, _| o.iodepth_batch == 0 || o.iodepth_batch > o.iodepth,
        effect: |o, _| o.iodepth_batch = o.iodepth,
    },
    Rule {
        name: "nr_files_clamp",
        severity: Severity::Silent,
        message: "file count limited to the files present",
        when: |o, cx| o.nr_files > cx.files_present,
        effect: |o, cx| o.nr_files = cx.files_present,
    },
    Rule {
        name: "open_files_default",
        severity: Severity::Silent,
        message: "open file count defaults to the file count",
        when: |o, _| o.open_files == 0 || o.open_files > o.nr_files,
        effect: |o, _| o.open_files = o.nr_files,
    },
    Rule {
        name: "zone_sequential_only",
        severity: Severity::Silent,
        message: "zones only apply to sequential io on one open file",
        when: |o, _| o.zone_size != 0 && (o.rw.is_random() || o.open_files != 1),
        effect: |o, _| o.zone_size = 0,
    },
    Rule {
        name: "rate_exclusive",
        severity: Severity::Fatal,
        message: "rate and rate_iops are mutually exclusive",
        when: |o, _| {
            (o.rate.any() && o.rate_iops.any()) || (o.ratemin.any() && o.rate_iops_min.any())
        },
        effect: |_, _| {},
    },
    Rule {
        name: "ratemin_exceeds_rate",
        severity: Severity::Fatal,
        message: "minimum rate exceeds rate",
        when: |o, _| {
            Ddir::ALL
                .iter()
                .any(|&d| o.rate[d] < o.ratemin[d] || o.rate_iops[d] < o.rate_iops_min[d])
        },
        effect: |_, _| {},
    },
    Rule {
        name: "time_based_runtime",
        severity: Severity::Warning,
        message: "time_based requires a runtime/timeout setting",
        when: |o, _| o.time_based && o.timeout.is_none(),
        effect: |o, _| o.time_based = false,
    },
    Rule {
        name: "fill_device_size",
        severity: Severity::Silent,
        message: "fill_device without size consumes all space",
        when: |o, _| o.fill_device && o.size == 0,
        effect: |o, _| o.size = UNBOUNDED_SIZE,
    },
    Rule {
        name: "verify_multiple_writers",
        severity: Severity::Warning,
        message: "multiple writers may overwrite blocks that belong to other jobs, verification may fail",
        when: |o, _| {
            o.verify != VerifyMode::None && o.rw.is_write() && o.do_verify && o.numjobs > 1
        },
        effect: |_, _| {},
    },
    Rule {
        name: "verify_refill",
        severity: Severity::Silent,
        message: "verification refills buffers on every write",
        when: |o, _| o.verify != VerifyMode::None,
        effect: |o, _| {
            o.refill_buffers = true;
            if o.max_bs.write != o.min_bs.write && o.verify_interval == 0 {
                o.verify_interval = o.min_bs.write;
            }
        },
    },
    Rule {
        name: "pre_read_cache",
        severity: Severity::Silent,
        message: "pre-read files are not invalidated",
        when: |o, _| o.pre_read && o.invalidate_cache,
        effect: |o, _| o.invalidate_cache = false,
    },
    Rule {
        name: "pre_read_seekable",
        severity: Severity::Warning,
        message: "cannot pre-read files with an engine that isn't seekable, pre-read disabled",
        when: |o, cx| o.pre_read && !cx.engine.seekable(),
        effect: |o, _| o.pre_read = false,
    },
    Rule {
        name: "fdatasync_fallback",
        severity: Severity::Warning,
        message: "this platform does not support fdatasync, falling back to fsync",
        when: |o, cx| !cx.platform.fdatasync && o.fdatasync_blocks != 0,
        effect: |o, _| {
            o.fsync_blocks = o.fdatasync_blocks;
            o.fdatasync_blocks = 0;
        },
    },
];

/// Run every rule against `o`, mutating it in place.
pub fn fixup_options(o: &mut JobOptions, cx: &FixupContext<'_>) -> Outcome {
    let mut warnings = Vec::new();
    let mut fatal = Vec::new();

    for rule in RULES {
        if !(rule.when)(o, cx) {
            continue;
        }
        (rule.effect)(o, cx);

        let diagnostic = || Diagnostic {
            rule: rule.name,
            severity: rule.severity,
            message: rule.message.to_owned(),
        };
        match rule.severity {
            Severity::Silent => {}
            Severity::Notice => warn!(rule = rule.name, "{}", rule.message),
            Severity::Warning => {
                warn!(rule = rule.name, "{}", rule.message);
                warnings.push(diagnostic());
            }
            Severity::Fatal => {
                error!(rule = rule.name, "{}", rule.message);
                fatal.push(diagnostic());
            }
        }
    }

    if !fatal.is_empty() {
        Outcome::Fatal(fatal)
    } else if !warnings.is_empty() {
        Outcome::Warning(warnings)
    } else {
        Outcome::Ok
    }
}
