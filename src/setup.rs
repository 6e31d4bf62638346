use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use tracing::{debug, error, info};

use crate::{
    arena::{Arena, ArenaHandle, HeapBackend, RegionBackend},
    engine::{engine_name, BuiltinEngines, EngineFlags, EngineResolver, NoProfile, ProfileHooks},
    error::SetupError,
    filehash::Registration,
    fixup::{fixup_options, FixupContext, Platform},
    random::{DeviceEntropy, EntropySource, RandomStreams},
    rate::setup_rate,
    record::{JobError, JobReport, Percentiles, RunState, ThreadStats, WorkerRecord, UNKNOWN_FILE_SIZE},
};

pub const DEFAULT_MAX_JOBS: usize = 2048;

/// Names either the template or a live slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobRef {
    Template,
    Slot(u32),
}

#[derive(Clone, Debug)]
pub struct SetupConfig {
    /// Requested arena capacity. Lowered if the system cannot map that much.
    pub max_jobs: usize,
    /// Treat normalizer warnings as fatal for the job.
    pub warnings_fatal: bool,
    /// Suppress the per-job summary lines.
    pub terse: bool,
    /// Check job descriptions without keeping any jobs.
    pub dry_validate: bool,
    pub platform: Platform,
}

impl Default for SetupConfig {
    fn default() -> Self {
        SetupConfig {
            max_jobs: DEFAULT_MAX_JOBS,
            warnings_fatal: false,
            terse: false,
            dry_validate: false,
            platform: Platform::host(),
        }
    }
}

/// Stonewall grouping state across instantiations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupState {
    pub group_id: u32,
    /// Records that joined `group_id` so far.
    pub members: u32,
}

impl GroupState {
    /// Add one record and return the group it belongs to. A barrier opens a
    /// new group unless the current one is still empty.
    pub fn join(&mut self, barrier: bool) -> u32 {
        if barrier && self.members > 0 {
            self.group_id += 1;
            self.members = 0;
        }
        self.members += 1;
        self.group_id
    }
}

#[cfg(unix)]
fn default_backend() -> Box<dyn RegionBackend> {
    Box::new(crate::arena::SharedMapping)
}

#[cfg(not(unix))]
fn default_backend() -> Box<dyn RegionBackend> {
    Box::new(HeapBackend::default())
}

/// Owns the shared job area and the template record. Parsing a job section
/// acquires a slot cloned from the template, applies options to it, then
/// [`JobTable::instantiate`]s it.
pub struct JobTable {
    config: SetupConfig,
    backend: Box<dyn RegionBackend>,
    arena: Option<Arena>,
    template: WorkerRecord,
    engines: Box<dyn EngineResolver>,
    hooks: Box<dyn ProfileHooks>,
    entropy: Box<dyn EntropySource>,
    groups: GroupState,
    debug_target: Option<u32>,
    nr_thread: u32,
    nr_process: u32,
}

impl JobTable {
    pub fn new(config: SetupConfig) -> Self {
        JobTable {
            config,
            backend: default_backend(),
            arena: None,
            template: WorkerRecord::template(),
            engines: Box::new(BuiltinEngines),
            hooks: Box::new(NoProfile),
            entropy: Box::new(DeviceEntropy::default()),
            groups: GroupState::default(),
            debug_target: None,
            nr_thread: 0,
            nr_process: 0,
        }
    }

    /// Keep the arena in private memory; workers must then be threads.
    pub fn in_process(config: SetupConfig) -> Self {
        Self::new(config).with_backend(HeapBackend::default())
    }

    pub fn with_backend(mut self, backend: impl RegionBackend + 'static) -> Self {
        self.backend = Box::new(backend);
        self
    }

    pub fn with_engines(mut self, engines: impl EngineResolver + 'static) -> Self {
        self.engines = Box::new(engines);
        self
    }

    pub fn with_hooks(mut self, hooks: impl ProfileHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn with_entropy(mut self, entropy: impl EntropySource + 'static) -> Self {
        self.entropy = Box::new(entropy);
        self
    }

    pub fn config(&self) -> &SetupConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SetupConfig {
        &mut self.config
    }

    pub fn template(&self) -> &WorkerRecord {
        &self.template
    }

    pub fn template_mut(&mut self) -> &mut WorkerRecord {
        &mut self.template
    }

    /// Forget global options, e.g. before the next job file.
    pub fn reset_template(&mut self) {
        self.template = WorkerRecord::template();
    }

    pub fn arena(&self) -> Option<&Arena> {
        self.arena.as_ref()
    }

    pub fn record(&self, job: JobRef) -> Option<&WorkerRecord> {
        match job {
            JobRef::Template => Some(&self.template),
            JobRef::Slot(ordinal) => self.arena.as_ref()?.get(ordinal),
        }
    }

    pub fn record_mut(&mut self, job: JobRef) -> Option<&mut WorkerRecord> {
        match job {
            JobRef::Template => Some(&mut self.template),
            JobRef::Slot(ordinal) => self.arena.as_mut()?.get_mut(ordinal),
        }
    }

    /// Live records in ordinal order.
    pub fn records(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.arena.iter().flat_map(Arena::records)
    }

    /// What the job in `job` has changed while running, read from its slot.
    pub fn run_state(&self, job: JobRef) -> Option<RunState> {
        match job {
            JobRef::Template => None,
            JobRef::Slot(ordinal) => self.arena.as_ref()?.run_state(ordinal),
        }
    }

    /// Serializable views of every live record.
    pub fn reports(&self) -> Vec<JobReport<'_>> {
        let Some(arena) = &self.arena else {
            return Vec::new();
        };
        arena
            .records()
            .map(|r| r.report(&arena.run_state(r.ordinal).unwrap_or_default()))
            .collect()
    }

    pub fn live(&self) -> usize {
        self.arena.as_ref().map_or(0, Arena::live)
    }

    pub fn groups(&self) -> GroupState {
        self.groups
    }

    /// Instantiated jobs running as threads and as processes.
    pub fn worker_counts(&self) -> (u32, u32) {
        (self.nr_thread, self.nr_process)
    }

    /// Create the arena on first use. Later calls return the same handle
    /// and leave the contents alone.
    pub fn ensure_arena(&mut self) -> Result<ArenaHandle, SetupError> {
        let arena = attach(
            &mut self.arena,
            self.backend.as_ref(),
            &mut self.config,
            self.debug_target,
        )?;
        Ok(arena.handle())
    }

    /// Change the capacity of an arena that holds no records yet.
    pub fn set_max_jobs(&mut self, max_jobs: usize) -> Result<(), SetupError> {
        if let Some(arena) = &self.arena {
            let live = arena.live();
            if live > 0 {
                return Err(SetupError::ArenaBusy {
                    requested: max_jobs,
                    live,
                });
            }
        }
        if let Some(arena) = self.arena.take() {
            arena.teardown();
        }
        self.config.max_jobs = max_jobs;
        Ok(())
    }

    /// Restrict job debug output to one ordinal.
    pub fn set_debug_target(&mut self, ordinal: Option<u32>) {
        self.debug_target = ordinal;
        if let Some(arena) = self.arena.as_mut() {
            arena.set_debug_target(ordinal);
        }
    }

    pub fn teardown(&mut self) {
        if let Some(arena) = self.arena.take() {
            arena.teardown();
        }
    }

    /// Get a record to fill in. The template is handed out as is; anything
    /// else is a deep copy of `parent` placed in the lowest free slot.
    pub fn acquire(&mut self, is_template: bool, parent: JobRef) -> Result<JobRef, SetupError> {
        if is_template {
            return Ok(JobRef::Template);
        }

        let arena = attach(
            &mut self.arena,
            self.backend.as_ref(),
            &mut self.config,
            self.debug_target,
        )
        .map_err(|e| {
            error!(error = %e, "failed to setup shared job area");
            e
        })?;

        let Some(ordinal) = arena.free_ordinal() else {
            let max = arena.capacity();
            error!(max, "maximum number of jobs reached");
            return Err(SetupError::JobLimitReached { max });
        };

        let mut record = match parent {
            JobRef::Template => self.template.clone_for_slot(ordinal),
            JobRef::Slot(p) => arena
                .get(p)
                .ok_or(SetupError::UnknownJob { ordinal: p })?
                .clone_for_slot(ordinal),
        };
        self.hooks.on_clone(&mut record);
        arena.place(record);
        debug!(ordinal, "acquired job slot");
        Ok(JobRef::Slot(ordinal))
    }

    /// Return a slot to the free pool. Releasing the template is a no-op.
    pub fn release(&mut self, job: JobRef) {
        let JobRef::Slot(ordinal) = job else {
            return;
        };
        let Some(arena) = self.arena.as_mut() else {
            return;
        };
        let failure = arena.run_state(ordinal).and_then(|s| s.error);
        let Some(mut record) = arena.take(ordinal) else {
            return;
        };
        self.hooks.on_exit(&mut record);
        if let Some(err) = failure {
            error!(job = record.name(), code = err.code, "{}", err.message);
        }
        debug!(ordinal, "released job slot");
    }

    /// Turn an acquired record into a ready job, then create its
    /// `numjobs - 1` siblings. Any failure releases the record.
    pub fn instantiate(&mut self, job: JobRef, base_name: &str, add_num: u32) -> Result<(), SetupError> {
        let JobRef::Slot(ordinal) = job else {
            return Ok(());
        };
        if self.config.dry_validate {
            self.release(job);
            return Ok(());
        }

        let mut record = self
            .arena
            .as_mut()
            .and_then(|a| a.take(ordinal))
            .ok_or(SetupError::UnknownJob { ordinal })?;
        let prepared = self.prepare(&mut record, base_name, add_num);

        let Some(arena) = self.arena.as_mut() else {
            return Err(SetupError::UnknownJob { ordinal });
        };
        let group_id = record.group_id;
        arena.place(record);

        let run = match prepared {
            Ok(run) => run,
            Err(e) => {
                let failure = JobError {
                    code: e.code(),
                    message: e.to_string(),
                };
                arena.set_error(ordinal, &failure);
                self.release(job);
                return Err(e);
            }
        };
        arena.write_run_state(ordinal, &run);
        arena.mark_ready(ordinal, group_id);

        self.fan_out(ordinal, base_name)?;
        self.register_files(ordinal);
        Ok(())
    }

    /// Enter the files of a ready job into the arena's side table.
    fn register_files(&mut self, ordinal: u32) {
        let Some(arena) = self.arena.as_mut() else {
            return;
        };
        let names: Vec<String> = arena
            .get(ordinal)
            .map(|r| r.files.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default();
        let mut table = arena.file_table();
        for name in &names {
            match table.register(name) {
                Registration::Shared => debug!(file = %name, "file shared with another job"),
                Registration::Full => debug!(file = %name, "file table full, not tracked"),
                Registration::Added => {}
            }
        }
    }

    fn prepare(&mut self, rec: &mut WorkerRecord, base_name: &str, add_num: u32) -> Result<RunState, SetupError> {
        self.hooks.on_init(rec)?;

        let name = engine_name(&rec.options.ioengine).to_owned();
        let mut engine = self.engines.resolve(&name).ok_or_else(|| {
            error!(engine = %name, "failed to load io engine");
            SetupError::EngineLoadFailed { name: name.clone() }
        })?;
        if rec.options.direct {
            engine.insert_flags(EngineFlags::RAW_IO);
        }
        if rec.options.use_thread {
            self.nr_thread += 1;
        } else {
            self.nr_process += 1;
        }

        if rec.files.is_empty() {
            attach_files(rec, base_name);
        }

        let cx = FixupContext {
            engine: &engine,
            files_present: rec.files.len() as u32,
            platform: self.config.platform,
        };
        let job_name = rec.options.name.clone().unwrap_or_else(|| base_name.to_owned());
        let warnings = fixup_options(&mut rec.options, &cx).resolve(&job_name, self.config.warnings_fatal)?;
        if !warnings.is_empty() {
            debug!(job = %job_name, warnings = warnings.len(), "options adjusted");
        }

        if engine.file_size_unknown() {
            for file in &mut rec.files {
                file.real_file_size = UNKNOWN_FILE_SIZE;
            }
        }

        rec.mutex = Some(Arc::new(Mutex::new(())));
        rec.percentiles = Percentiles::from_options(&rec.options);
        rec.ddir_seq_nr = rec.options.ddir_seq_nr;
        rec.group_id = self.groups.join(rec.options.stonewall || rec.options.new_group);

        rec.streams = RandomStreams::init(&rec.options, rec.ordinal, self.entropy.as_mut())?;
        let rate = setup_rate(&rec.options).map_err(|e| {
            error!(job = %job_name, error = %e, "rate setup failed");
            e
        })?;
        rec.logs.setup(&rec.options);

        if rec.options.name.is_none() {
            rec.options.name = Some(base_name.to_owned());
        }
        rec.engine = Some(engine);

        if !self.config.terse {
            match add_num {
                0 => info!("{}", rec.summary_line()),
                1 => info!("..."),
                _ => {}
            }
        }
        Ok(RunState {
            rate,
            stats: ThreadStats::initial(),
            ..Default::default()
        })
    }

    fn fan_out(&mut self, ordinal: u32, base_name: &str) -> Result<(), SetupError> {
        let parent = JobRef::Slot(ordinal);
        let Some((numjobs, synthesized)) = self
            .record(parent)
            .map(|r| (r.options.numjobs, r.files_synthesized))
        else {
            return Ok(());
        };

        for add_num in 1..numjobs {
            let sibling = match self.acquire(false, parent) {
                Ok(sibling) => sibling,
                Err(e) => {
                    self.release(parent);
                    return Err(e);
                }
            };
            if let Some(rec) = self.record_mut(sibling) {
                rec.options.numjobs = 1;
                rec.options.stonewall = false;
                rec.options.new_group = false;
                if synthesized {
                    rec.files.clear();
                    rec.files_synthesized = false;
                }
            }
            if let Err(e) = self.instantiate(sibling, base_name, add_num) {
                self.release(parent);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for JobTable {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn attach<'a>(
    slot: &'a mut Option<Arena>,
    backend: &dyn RegionBackend,
    config: &mut SetupConfig,
    debug_target: Option<u32>,
) -> Result<&'a mut Arena, SetupError> {
    let arena = match slot.take() {
        Some(arena) => arena,
        None => {
            let mut arena = Arena::create(backend, config.max_jobs)?;
            arena.set_debug_target(debug_target);
            config.max_jobs = arena.capacity();
            arena
        }
    };
    Ok(slot.insert(arena))
}

/// Fill in the file list from `filename`, or make one up from the job name.
fn attach_files(rec: &mut WorkerRecord, base_name: &str) {
    let dir = rec.options.directory.clone();
    let in_dir = |name: &str| match &dir {
        Some(dir) => Path::new(dir).join(name).to_string_lossy().into_owned(),
        None => name.to_owned(),
    };

    if let Some(list) = rec.options.filename.clone() {
        for name in list.split(':').filter(|n| !n.is_empty()) {
            rec.add_file(in_dir(name));
        }
        return;
    }
    if rec.options.read_iolog_file.is_some() {
        return;
    }

    rec.files_synthesized = true;
    if rec.options.nr_files == 1 && is_special(base_name) {
        rec.add_file(base_name);
        return;
    }
    for i in 0..rec.options.nr_files {
        let name = in_dir(&format!("{base_name}.{}.{i}", rec.ordinal));
        rec.add_file(name);
    }
}

/// An existing target that is not a regular file, such as a block device.
fn is_special(name: &str) -> bool {
    if name.starts_with(r"\\.\") {
        return true;
    }
    std::fs::symlink_metadata(name).map_or(false, |md| !md.file_type().is_file())
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::{
        arena::{SlotHeader, SlotState},
        engine::EngineHandle,
        fixup::Severity,
    };

    const FULL: Platform = Platform {
        pshared_mutex: true,
        fdatasync: true,
    };

    struct Counter(u8);

    impl EntropySource for Counter {
        fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
            for b in buf {
                self.0 = self.0.wrapping_add(1);
                *b = self.0;
            }
            Ok(())
        }
    }

    struct Broken;

    impl EntropySource for Broken {
        fn fill(&mut self, _buf: &mut [u8]) -> std::io::Result<()> {
            Err(std::io::ErrorKind::NotFound.into())
        }
    }

    fn config(max_jobs: usize) -> SetupConfig {
        SetupConfig {
            max_jobs,
            terse: true,
            platform: FULL,
            ..Default::default()
        }
    }

    fn table(max_jobs: usize) -> JobTable {
        JobTable::in_process(config(max_jobs)).with_entropy(Counter(0))
    }

    /// Acquire from the template, apply `opts`, instantiate.
    fn add(t: &mut JobTable, name: &str, opts: &[&str]) -> Result<JobRef, SetupError> {
        let job = t.acquire(false, JobRef::Template)?;
        for line in opts {
            t.record_mut(job).unwrap().options.apply_line(line)?;
        }
        t.instantiate(job, name, 0)?;
        Ok(job)
    }

    #[test]
    fn template_is_not_in_the_arena() {
        let mut t = table(4);
        assert_eq!(t.acquire(true, JobRef::Template).unwrap(), JobRef::Template);
        assert!(t.arena().is_none());
        assert_eq!(t.live(), 0);
        t.instantiate(JobRef::Template, "global", 0).unwrap();
        t.release(JobRef::Template);
        assert_eq!(t.live(), 0);
    }

    #[test]
    fn lowest_free_slot_is_reused() {
        let mut t = table(4);
        let a = t.acquire(false, JobRef::Template).unwrap();
        let b = t.acquire(false, JobRef::Template).unwrap();
        let c = t.acquire(false, JobRef::Template).unwrap();
        assert_eq!((a, b, c), (JobRef::Slot(1), JobRef::Slot(2), JobRef::Slot(3)));

        t.release(b);
        assert_eq!(t.arena().unwrap().header(2).unwrap().state, SlotState::Free);
        assert_eq!(t.acquire(false, JobRef::Template).unwrap(), JobRef::Slot(2));
        assert_eq!(t.acquire(false, JobRef::Template).unwrap(), JobRef::Slot(4));
        // double release is harmless
        t.release(c);
        t.release(c);
        assert_eq!(t.live(), 3);
    }

    #[test]
    fn limit_reached() {
        let mut t = table(2);
        t.acquire(false, JobRef::Template).unwrap();
        t.acquire(false, JobRef::Template).unwrap();
        let err = t.acquire(false, JobRef::Template).unwrap_err();
        assert!(matches!(err, SetupError::JobLimitReached { max: 2 }));
        assert_eq!(t.live(), 2);
    }

    #[test]
    fn clones_are_isolated() {
        let mut t = table(4);
        t.template_mut().options.apply_line("filename=/tmp/a").unwrap();
        t.template_mut().options.percentile_list = vec![50.0];

        let job = t.acquire(false, JobRef::Template).unwrap();
        let rec = t.record_mut(job).unwrap();
        rec.options.filename = Some("/tmp/b".into());
        rec.options.percentile_list.push(99.0);

        assert_eq!(t.template().options.filename.as_deref(), Some("/tmp/a"));
        assert_eq!(t.template().options.percentile_list, vec![50.0]);

        let copy = t.acquire(false, job).unwrap();
        assert_eq!(
            t.record(copy).unwrap().options.filename.as_deref(),
            Some("/tmp/b")
        );
        assert_eq!(t.record(copy).unwrap().ordinal, 2);
    }

    #[test]
    fn unknown_parent() {
        let mut t = table(4);
        let err = t.acquire(false, JobRef::Slot(3)).unwrap_err();
        assert!(matches!(err, SetupError::UnknownJob { ordinal: 3 }));
        assert_eq!(t.live(), 0);
    }

    #[test]
    fn instantiated_job_is_ready() {
        let mut t = table(4);
        let job = add(&mut t, "ready-job-x", &["rw=randread", "rate=1m"]).unwrap();
        let rec = t.record(job).unwrap();
        assert_eq!(rec.name(), "ready-job-x");
        assert_eq!(rec.files.len(), 1);
        assert_eq!(rec.files[0].name, "ready-job-x.1.0");
        assert!(rec.files_synthesized);
        assert!(rec.mutex.is_some());
        assert!(rec.streams.random.is_seeded());
        assert_eq!(rec.engine.as_ref().map(EngineHandle::name), Some("sync"));
        assert_eq!(t.arena().unwrap().header(1).unwrap().state, SlotState::Ready);

        let run = t.run_state(job).unwrap();
        assert_eq!(run.rate.read.unwrap().nsec_cycle, 953);
        assert_eq!(run.stats.clat.read.min_val, u64::MAX);
        assert_eq!((run.pid, run.error), (None, None));

        let mut arena_files = 0;
        if let Some(arena) = t.arena.as_mut() {
            assert!(arena.file_table().contains("ready-job-x.1.0"));
            arena_files = arena.file_table().len();
        }
        assert_eq!(arena_files, 1);
        assert_eq!(t.worker_counts(), (0, 1));
    }

    #[test]
    fn fan_out_makes_disjoint_siblings() {
        let mut t = table(8);
        add(&mut t, "fan-job-x", &["numjobs=3", "nrfiles=2", "stonewall"]).unwrap();
        assert_eq!(t.live(), 3);

        let recs: Vec<_> = t.records().collect();
        assert_eq!(recs[0].options.numjobs, 3);
        assert!(recs[0].options.stonewall);
        for sibling in &recs[1..] {
            assert_eq!(sibling.options.numjobs, 1);
            assert!(!sibling.options.stonewall && !sibling.options.new_group);
        }

        let mut names: Vec<&str> = recs
            .iter()
            .flat_map(|r| r.files.iter().map(|f| f.name.as_str()))
            .collect();
        assert_eq!(names.len(), 6);
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 6);
        assert!(names.contains(&"fan-job-x.3.1"));

        // siblings share the parent's group
        assert!(recs.iter().all(|r| r.group_id == recs[0].group_id));
        let ordinals: Vec<u32> = recs.iter().map(|r| r.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
    }

    #[test]
    fn explicit_files_are_shared_by_siblings() {
        let mut t = table(8);
        add(&mut t, "shared", &["numjobs=2", "filename=/dev/null:/tmp/x"]).unwrap();
        let recs: Vec<_> = t.records().collect();
        assert_eq!(recs.len(), 2);
        for rec in recs {
            assert!(!rec.files_synthesized);
            let names: Vec<&str> = rec.files.iter().map(|f| f.name.as_str()).collect();
            assert_eq!(names, vec!["/dev/null", "/tmp/x"]);
        }
    }

    #[test]
    fn directory_prefixes_files() {
        let mut t = table(2);
        let job = add(&mut t, "dir-job", &["directory=/scratch"]).unwrap();
        assert_eq!(t.record(job).unwrap().files[0].name, "/scratch/dir-job.1.0");
    }

    #[test]
    fn iolog_jobs_get_no_files() {
        let mut t = table(2);
        let job = add(&mut t, "replay", &["read_iolog=/tmp/trace"]).unwrap();
        let rec = t.record(job).unwrap();
        assert!(rec.files.is_empty());
        assert!(!rec.files_synthesized);
    }

    #[cfg(unix)]
    #[test]
    fn special_target_is_used_directly() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_string_lossy().into_owned();
        let mut t = table(2);
        let job = add(&mut t, &base, &[]).unwrap();
        assert_eq!(t.record(job).unwrap().files[0].name, base);
    }

    #[test]
    fn stonewall_opens_groups() {
        let mut t = table(8);
        let a = add(&mut t, "g-a", &[]).unwrap();
        let b = add(&mut t, "g-b", &["stonewall"]).unwrap();
        let c = add(&mut t, "g-c", &[]).unwrap();
        let d = add(&mut t, "g-d", &["new_group"]).unwrap();
        let groups: Vec<u32> = [a, b, c, d]
            .iter()
            .map(|&j| t.record(j).unwrap().group_id)
            .collect();
        assert_eq!(groups, vec![0, 1, 1, 2]);
        assert_eq!(t.groups(), GroupState { group_id: 2, members: 1 });
    }

    #[test]
    fn leading_barrier_does_not_skip_a_group() {
        let mut g = GroupState::default();
        assert_eq!(g.join(true), 0);
        assert_eq!(g.join(false), 0);
        assert_eq!(g.join(true), 1);
    }

    #[test]
    fn fatal_conflict_drops_job() {
        let mut t = table(4);
        let err = add(&mut t, "conflict", &["rate=1m", "rate_iops=100"]).unwrap_err();
        let SetupError::ConfigConflict { job, reasons } = err else {
            panic!("unexpected error");
        };
        assert_eq!(job, "conflict");
        assert_eq!(reasons[0].rule, "rate_exclusive");
        assert_eq!(reasons[0].severity, Severity::Fatal);
        assert_eq!(t.live(), 0);
        assert_eq!(t.arena().unwrap().header(1), Some(SlotHeader::default()));
    }

    #[test]
    fn warnings_fatal_promotes() {
        let mut lenient = table(4);
        let job = add(&mut lenient, "tb", &["time_based"]).unwrap();
        assert!(!lenient.record(job).unwrap().options.time_based);

        let mut strict = JobTable::in_process(SetupConfig {
            warnings_fatal: true,
            ..config(4)
        })
        .with_entropy(Counter(0));
        let err = add(&mut strict, "tb", &["time_based"]).unwrap_err();
        assert!(matches!(err, SetupError::ConfigConflict { .. }));
        assert_eq!(strict.live(), 0);
    }

    #[test]
    fn unknown_engine_drops_job() {
        let mut t = table(4);
        let err = add(&mut t, "e", &["ioengine=warp-drive"]).unwrap_err();
        assert!(matches!(err, SetupError::EngineLoadFailed { ref name } if name == "warp-drive"));
        assert_eq!(t.live(), 0);
    }

    #[test]
    fn entropy_failure_drops_job() {
        let mut t = JobTable::in_process(config(4)).with_entropy(Broken);
        let err = add(&mut t, "e", &[]).unwrap_err();
        assert!(matches!(err, SetupError::Io { .. }));
        assert_eq!(t.live(), 0);
    }

    #[test]
    fn engine_flags_follow_options() {
        let mut t = table(4);
        let direct = add(&mut t, "d", &["direct"]).unwrap();
        assert!(t.record(direct).unwrap().engine.as_ref().unwrap().requires_raw_io());

        let null = add(&mut t, "n", &["ioengine=null", "nrfiles=2"]).unwrap();
        let rec = t.record(null).unwrap();
        assert!(rec.files.iter().all(|f| f.real_file_size == UNKNOWN_FILE_SIZE));
        assert!(!rec.engine.as_ref().unwrap().requires_raw_io());

        let threaded = add(&mut t, "t", &["thread"]).unwrap();
        assert!(t.record(threaded).unwrap().options.use_thread);
        assert_eq!(t.worker_counts(), (1, 2));
    }

    #[test]
    fn dry_validate_keeps_nothing() {
        let mut t = JobTable::in_process(SetupConfig {
            dry_validate: true,
            ..config(4)
        });
        add(&mut t, "dry", &["numjobs=4"]).unwrap();
        assert_eq!(t.live(), 0);
    }

    #[test]
    fn fan_out_failure_releases_parent() {
        let mut t = table(2);
        let err = add(&mut t, "big", &["numjobs=3"]).unwrap_err();
        assert!(matches!(err, SetupError::JobLimitReached { max: 2 }));
        // the sibling created before the failure stays
        assert!(t.record(JobRef::Slot(1)).is_none());
        assert!(t.record(JobRef::Slot(2)).is_some());

        // only the surviving sibling's file is tracked
        let arena = t.arena.as_mut().unwrap();
        let files = arena.file_table();
        assert_eq!(files.len(), 1);
        assert!(files.contains("big.2.0"));
        assert!(!files.contains("big.1.0"));
    }

    #[test]
    fn slot_zero_is_not_a_job() {
        let mut t = table(2);
        t.ensure_arena().unwrap();
        t.release(JobRef::Slot(0));
        assert!(t.record(JobRef::Slot(0)).is_none());
        assert!(t.run_state(JobRef::Slot(0)).is_none());
        assert_eq!(t.live(), 0);
    }

    #[test]
    fn ensure_arena_is_idempotent() {
        let mut t = table(4);
        let first = t.ensure_arena().unwrap();
        let job = t.acquire(false, JobRef::Template).unwrap();
        let second = t.ensure_arena().unwrap();
        assert_eq!(first, second);
        assert_eq!(t.arena().unwrap().header(1).unwrap().state, SlotState::Acquired);
        assert!(t.record(job).is_some());
    }

    #[test]
    fn capacity_is_lowered_to_what_fits() {
        let limit = Arena::region_len(10).unwrap();
        let mut t = JobTable::new(config(64)).with_backend(HeapBackend::with_limit(limit));
        let handle = t.ensure_arena().unwrap();
        assert_eq!(handle.capacity, 8);
        assert_eq!(t.config().max_jobs, 8);
    }

    #[test]
    fn oversized_capacity_hint_is_halved() {
        let mut t = JobTable::new(config(usize::MAX)).with_backend(HeapBackend::with_limit(1 << 20));
        let handle = t.ensure_arena().unwrap();
        assert_eq!(handle.capacity, 2047);
        assert_eq!(t.config().max_jobs, 2047);
    }

    #[test]
    fn resizing_needs_an_empty_arena() {
        let mut t = table(4);
        let job = t.acquire(false, JobRef::Template).unwrap();
        assert!(matches!(
            t.set_max_jobs(16),
            Err(SetupError::ArenaBusy { requested: 16, live: 1 })
        ));
        t.release(job);
        t.set_max_jobs(16).unwrap();
        assert!(t.arena().is_none());
        assert_eq!(t.ensure_arena().unwrap().capacity, 16);
    }

    #[test]
    fn debug_target_survives_arena_creation() {
        let mut t = table(4);
        t.set_debug_target(Some(3));
        t.ensure_arena().unwrap();
        assert_eq!(t.arena().unwrap().debug_target(), Some(3));
        t.set_debug_target(None);
        assert_eq!(t.arena().unwrap().debug_target(), None);
    }

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<(&'static str, u32)>>>);

    impl ProfileHooks for Recorder {
        fn on_clone(&self, record: &mut WorkerRecord) {
            self.0.borrow_mut().push(("clone", record.ordinal));
        }

        fn on_init(&self, record: &mut WorkerRecord) -> Result<(), SetupError> {
            self.0.borrow_mut().push(("init", record.ordinal));
            Ok(())
        }

        fn on_exit(&self, record: &mut WorkerRecord) {
            self.0.borrow_mut().push(("exit", record.ordinal));
        }
    }

    #[test]
    fn profile_hooks_run_per_record() {
        let calls = Recorder::default();
        let mut t = table(4).with_hooks(calls.clone());
        let job = add(&mut t, "hooked", &["numjobs=2"]).unwrap();
        t.release(job);
        assert_eq!(
            *calls.0.borrow(),
            vec![("clone", 1), ("init", 1), ("clone", 2), ("init", 2), ("exit", 1)]
        );
    }

    #[test]
    fn teardown_drops_everything() {
        let mut t = table(4);
        add(&mut t, "gone", &[]).unwrap();
        t.teardown();
        assert!(t.arena().is_none());
        assert_eq!(t.live(), 0);
    }
}
