use std::{io::Write, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use iogen::{
    add_job_opts,
    debug::{area_names, parse_debug, DebugRequest, DebugSettings},
    parse_job_file,
    setup::DEFAULT_MAX_JOBS,
    JobSource, JobTable, ParseOptions, SectionFilter, SetupConfig,
};
use tracing::info;

#[derive(clap::Parser)]
#[clap(version, about = "Set up synthetic I/O jobs from job files")]
struct Args {
    /// Job files. `-` reads standard input.
    job_files: Vec<PathBuf>,
    /// Only set up these sections. Global sections are always read.
    #[clap(long = "section")]
    sections: Vec<String>,
    #[clap(long, default_value_t = DEFAULT_MAX_JOBS)]
    max_jobs: usize,
    /// Drop jobs whose options needed adjusting.
    #[clap(long)]
    warnings_fatal: bool,
    /// Do not print a summary line per job.
    #[clap(long)]
    minimal: bool,
    /// Print each job file as a command line instead of setting up jobs.
    #[clap(long)]
    showcmd: bool,
    /// Debug areas, e.g. `file,random` or `job:2`. `?` lists them.
    #[clap(long)]
    debug: Option<String>,
    /// Runtime for jobs that do not set their own, e.g. `30s`.
    #[clap(long, value_parser = humantime::parse_duration)]
    runtime: Option<Duration>,
    /// Write the ready jobs as JSON to this file.
    #[clap(long)]
    dump_json: Option<PathBuf>,
    /// Job options as `key=value`; every `name=` starts a new job.
    #[clap(last = true)]
    options: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let debug = match args.debug.as_deref().map(parse_debug).transpose()? {
        Some(DebugRequest::Help) => {
            println!("debug options: {}", area_names());
            return Ok(());
        }
        Some(DebugRequest::Set(settings)) => settings,
        None => DebugSettings::default(),
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(debug.apply(filter)?)
        .init();

    let mut table = JobTable::new(SetupConfig {
        max_jobs: args.max_jobs,
        warnings_fatal: args.warnings_fatal,
        terse: args.minimal,
        dry_validate: args.showcmd,
        ..Default::default()
    });
    table.set_debug_target(debug.job);

    if !args.options.is_empty() {
        set_runtime(&mut table, args.runtime);
        let opts: Vec<&str> = args.options.iter().map(String::as_str).collect();
        add_job_opts(&mut table, &opts).context("command line job options")?;
    }

    for (i, path) in args.job_files.iter().enumerate() {
        table.reset_template();
        set_runtime(&mut table, args.runtime);
        let opts = ParseOptions {
            sections: SectionFilter::new(args.sections.clone()),
            stonewall: i > 0,
            show_command: args.showcmd,
        };
        let report = parse_job_file(&mut table, JobSource::from_arg(path), &opts)
            .with_context(|| format!("job file {}", path.display()))?;
        if let Some(command) = report.command_line {
            println!("{command}");
        }
    }

    if table.live() == 0 {
        if args.showcmd {
            return Ok(());
        }
        anyhow::bail!("No jobs(s) defined");
    }

    let (threads, processes) = table.worker_counts();
    info!(jobs = table.live(), threads, processes, "jobs ready");

    if let Some(path) = &args.dump_json {
        let reports = table.reports();
        let file = std::fs::File::create(path)
            .with_context(|| format!("create {}", path.display()))?;
        let mut out = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, &reports)?;
        out.flush()?;
    }

    table.teardown();
    Ok(())
}

fn set_runtime(table: &mut JobTable, runtime: Option<Duration>) {
    if runtime.is_some() {
        table.template_mut().options.timeout = runtime;
    }
}
