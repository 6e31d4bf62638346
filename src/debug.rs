use itertools::Itertools;
use tracing::info;
use tracing_subscriber::filter::{Directive, EnvFilter};

use crate::error::SetupError;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DebugMask: u32 {
        const PROCESS = 1 << 0;
        const FILE = 1 << 1;
        const IO = 1 << 2;
        const MEM = 1 << 3;
        const BLKTRACE = 1 << 4;
        const VERIFY = 1 << 5;
        const RANDOM = 1 << 6;
        const PARSE = 1 << 7;
        const DISKUTIL = 1 << 8;
        const JOB = 1 << 9;
        const MUTEX = 1 << 10;
        const PROFILE = 1 << 11;
        const TIME = 1 << 12;
        const NET = 1 << 13;
    }
}

struct Area {
    name: &'static str,
    mask: DebugMask,
    /// Modules whose debug events belong to the area.
    targets: &'static [&'static str],
}

static AREAS: &[Area] = &[
    Area { name: "process", mask: DebugMask::PROCESS, targets: &["iogen::setup"] },
    Area { name: "file", mask: DebugMask::FILE, targets: &["iogen::setup", "iogen::filehash"] },
    Area { name: "io", mask: DebugMask::IO, targets: &["iogen::engine"] },
    Area { name: "mem", mask: DebugMask::MEM, targets: &["iogen::arena"] },
    Area { name: "blktrace", mask: DebugMask::BLKTRACE, targets: &[] },
    Area { name: "verify", mask: DebugMask::VERIFY, targets: &["iogen::fixup"] },
    Area { name: "random", mask: DebugMask::RANDOM, targets: &["iogen::random"] },
    Area { name: "parse", mask: DebugMask::PARSE, targets: &["iogen::parser", "iogen::options"] },
    Area { name: "diskutil", mask: DebugMask::DISKUTIL, targets: &[] },
    Area { name: "job", mask: DebugMask::JOB, targets: &["iogen::setup"] },
    Area { name: "mutex", mask: DebugMask::MUTEX, targets: &["iogen::setup"] },
    Area { name: "profile", mask: DebugMask::PROFILE, targets: &["iogen::engine"] },
    Area { name: "time", mask: DebugMask::TIME, targets: &["iogen::rate"] },
    Area { name: "net", mask: DebugMask::NET, targets: &[] },
];

/// Comma-separated list of every area name, `all` last.
pub fn area_names() -> String {
    AREAS.iter().map(|a| a.name).chain(["all"]).join(",")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugSettings {
    pub mask: DebugMask,
    /// Only this job ordinal logs job-level debug output.
    pub job: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugRequest {
    /// `?` or `help`: list the areas and stop.
    Help,
    Set(DebugSettings),
}

/// Parse a `--debug` value such as `file,random` or `job:3`.
pub fn parse_debug(value: &str) -> Result<DebugRequest, SetupError> {
    if value == "?" || value == "help" {
        return Ok(DebugRequest::Help);
    }

    let mut settings = DebugSettings::default();
    for opt in value.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        if opt.starts_with("all") {
            info!("set all debug options");
            settings.mask = DebugMask::all();
            continue;
        }
        let (name, arg) = match opt.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (opt, None),
        };
        let area = AREAS
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| SetupError::Debug(opt.to_owned()))?;

        if area.mask == DebugMask::JOB {
            let ordinal = arg
                .and_then(|n| n.trim().parse().ok())
                .ok_or_else(|| SetupError::Debug(format!("{opt} (missing job number)")))?;
            info!(ordinal, "set debug job");
            settings.job = Some(ordinal);
        } else {
            info!(area = area.name, "set debug option");
        }
        settings.mask |= area.mask;
    }
    Ok(DebugRequest::Set(settings))
}

impl DebugSettings {
    /// Filter directives enabling debug events of the selected areas.
    pub fn directives(&self) -> Vec<String> {
        if self.mask == DebugMask::all() {
            return vec!["iogen=debug".to_owned()];
        }
        AREAS
            .iter()
            .filter(|a| self.mask.contains(a.mask))
            .flat_map(|a| a.targets.iter())
            .unique()
            .map(|t| format!("{t}=debug"))
            .collect()
    }

    /// Layer the selected areas over `base`.
    pub fn apply(&self, mut base: EnvFilter) -> Result<EnvFilter, SetupError> {
        for d in self.directives() {
            let directive: Directive = d.parse().map_err(|_| SetupError::Debug(d.clone()))?;
            base = base.add_directive(directive);
        }
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(value: &str) -> DebugSettings {
        match parse_debug(value).unwrap() {
            DebugRequest::Set(s) => s,
            DebugRequest::Help => panic!("unexpected help"),
        }
    }

    #[test]
    fn help() {
        assert_eq!(parse_debug("?").unwrap(), DebugRequest::Help);
        assert_eq!(parse_debug("help").unwrap(), DebugRequest::Help);
        assert!(area_names().starts_with("process,file,"));
        assert!(area_names().ends_with(",net,all"));
    }

    #[test]
    fn areas_combine() {
        let s = settings("file,random");
        assert_eq!(s.mask, DebugMask::FILE | DebugMask::RANDOM);
        assert_eq!(s.job, None);
        assert_eq!(
            s.directives(),
            vec!["iogen::setup=debug", "iogen::filehash=debug", "iogen::random=debug"]
        );
    }

    #[test]
    fn all() {
        let s = settings("all");
        assert!(s.mask.is_all());
        assert_eq!(s.directives(), vec!["iogen=debug"]);
    }

    #[test]
    fn job_number() {
        let s = settings("job:3,mem");
        assert_eq!(s.job, Some(3));
        assert!(s.mask.contains(DebugMask::JOB | DebugMask::MEM));

        assert!(matches!(parse_debug("job"), Err(SetupError::Debug(_))));
        assert!(matches!(parse_debug("job:x"), Err(SetupError::Debug(_))));
    }

    #[test]
    fn unknown_area() {
        let err = parse_debug("file,bogus").unwrap_err();
        assert_eq!(err.to_string(), "debug mask bogus not found");
    }

    #[test]
    fn areas_without_targets_add_nothing() {
        let s = settings("net,diskutil");
        assert!(s.directives().is_empty());
        assert!(s.apply(EnvFilter::new("info")).is_ok());
    }
}
