use std::{
    io::Read,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use tracing::{debug, error};

use crate::{
    error::SetupError,
    options::split_option,
    setup::{JobRef, JobTable},
};

/// Restricts parsing to named sections. Global sections always pass.
#[derive(Clone, Debug, Default)]
pub struct SectionFilter {
    sections: Vec<String>,
}

impl SectionFilter {
    pub fn new(sections: Vec<String>) -> Self {
        SectionFilter { sections }
    }

    pub fn skip(&self, name: &str) -> bool {
        if self.sections.is_empty() || is_global(name) {
            return false;
        }
        !self.sections.iter().any(|s| s == name)
    }
}

pub fn is_global(name: &str) -> bool {
    name.starts_with("global")
}

/// Blank lines and lines whose first visible character starts a comment.
pub fn is_empty_or_comment(line: &str) -> bool {
    for c in line.chars() {
        match c {
            ';' | '#' => return true,
            c if c.is_whitespace() || c.is_control() => {}
            _ => return false,
        }
    }
    true
}

#[derive(Clone, Copy, Debug)]
pub enum JobSource<'a> {
    Path(&'a Path),
    /// Read from standard input; named `-` on the command line.
    Stdin,
    Buffer(&'a str),
}

impl<'a> JobSource<'a> {
    pub fn from_arg(arg: &'a Path) -> Self {
        if arg == Path::new("-") {
            JobSource::Stdin
        } else {
            JobSource::Path(arg)
        }
    }

    fn label(&self) -> PathBuf {
        match self {
            JobSource::Path(p) => p.to_path_buf(),
            JobSource::Stdin => PathBuf::from("-"),
            JobSource::Buffer(_) => PathBuf::from("<buffer>"),
        }
    }

    fn read(&self) -> Result<String, SetupError> {
        match self {
            JobSource::Path(p) => std::fs::read_to_string(p)
                .map_err(|e| SetupError::io(format!("open job file {}", p.display()), e)),
            JobSource::Stdin => {
                let mut text = String::new();
                std::io::stdin()
                    .read_to_string(&mut text)
                    .map_err(|e| SetupError::io("read job file from stdin", e))?;
                Ok(text)
            }
            JobSource::Buffer(text) => Ok((*text).to_owned()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ParseOptions {
    pub sections: SectionFilter,
    /// Put a stonewall before the first job, separating this file from the
    /// one before it.
    pub stonewall: bool,
    /// Also render the file as an equivalent command line.
    pub show_command: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParseReport {
    /// Sections parsed, global ones included.
    pub sections: usize,
    /// Live records created, siblings included.
    pub jobs_added: usize,
    pub command_line: Option<String>,
}

/// Parse one job file into `table`.
///
/// ```text
/// [global]
/// rw=randread
///
/// [job1]
/// bs=8k
/// ```
///
/// A `[global*]` section edits the template; every other section becomes a
/// job cloned from the template as it stands at that point. An option that
/// fails to apply drops its job and ends the parse with that error; jobs
/// added before stay.
pub fn parse_job_file(
    table: &mut JobTable,
    source: JobSource<'_>,
    opts: &ParseOptions,
) -> Result<ParseReport, SetupError> {
    let text = source.read()?;
    let path = source.label();
    let parse_error = |line: usize, message: String| SetupError::Parse {
        path: path.clone(),
        line,
        message,
    };

    let mut report = ParseReport::default();
    let mut command: Option<Vec<String>> = opts.show_command.then(Vec::new);
    let mut stonewall = opts.stonewall;
    let mut skipping = false;
    let mut lines = text.lines().enumerate().peekable();

    while let Some((idx, raw)) = lines.next() {
        let line = raw.trim();
        if is_empty_or_comment(line) {
            continue;
        }
        let Some(header) = line.strip_prefix('[') else {
            if skipping {
                continue;
            }
            return Err(parse_error(
                idx + 1,
                format!("option <{line}> outside of [] job section"),
            ));
        };
        let Some(name) = header.strip_suffix(']') else {
            return Err(parse_error(idx + 1, format!("unterminated section <{line}>")));
        };

        if opts.sections.skip(name) {
            debug!(section = name, "skipping section");
            skipping = true;
            continue;
        }
        skipping = false;

        let mut body = Vec::new();
        while let Some(&(_, raw)) = lines.peek() {
            let line = raw.trim();
            if line.starts_with('[') {
                break;
            }
            lines.next();
            if !is_empty_or_comment(line) {
                body.push(line);
            }
        }

        let global = is_global(name);
        if let Some(command) = command.as_mut() {
            if !global {
                command.push(format!("--name={name}"));
            }
            command.extend(body.iter().map(|o| format!("--{o}")));
        }

        let before = table.live();
        let job = table.acquire(global, JobRef::Template)?;
        if !global && stonewall {
            if let Some(rec) = table.record_mut(job) {
                rec.options.stonewall = true;
            }
            stonewall = false;
        }

        if let Err(e) = apply_options(table, job, &body) {
            error!(job = name, error = %e, "job dropped");
            table.release(job);
            return Err(e);
        }

        report.sections += 1;
        table.instantiate(job, name, 0)?;
        report.jobs_added += table.live().saturating_sub(before);
    }

    report.command_line = command.map(|parts| {
        std::iter::once(env!("CARGO_PKG_NAME").to_owned())
            .chain(parts)
            .join(" ")
    });
    Ok(report)
}

fn apply_options(table: &mut JobTable, job: JobRef, lines: &[&str]) -> Result<(), SetupError> {
    let ordinal = match job {
        JobRef::Slot(o) => o,
        JobRef::Template => 0,
    };
    let rec = table
        .record_mut(job)
        .ok_or(SetupError::UnknownJob { ordinal })?;
    for line in lines {
        rec.options.apply_line(line)?;
    }
    Ok(())
}

/// Add jobs described as a flat list of `key=value` options, as given on a
/// command line. Options before the first `name=` edit the template; each
/// `name=` starts a new job. Returns the number of records added.
pub fn add_job_opts(table: &mut JobTable, opts: &[&str]) -> Result<usize, SetupError> {
    let mut current: Option<(JobRef, String)> = None;
    let mut added = 0;

    for opt in opts {
        let (key, value) = split_option(opt);
        if key == "name" {
            if let Some((job, name)) = current.take() {
                added += finish(table, job, &name)?;
            }
            let job = table.acquire(false, JobRef::Template)?;
            current = Some((job, value.unwrap_or_default().to_owned()));
        }

        let job = current.as_ref().map_or(JobRef::Template, |(job, _)| *job);
        if let Err(e) = apply_options(table, job, &[*opt]) {
            table.release(job);
            return Err(e);
        }
    }

    if let Some((job, name)) = current {
        added += finish(table, job, &name)?;
    }
    Ok(added)
}

fn finish(table: &mut JobTable, job: JobRef, name: &str) -> Result<usize, SetupError> {
    let before = table.live();
    table.instantiate(job, name, 0)?;
    // the record itself was counted when it was acquired
    Ok(table.live() + 1 - before)
}
