use crate::{error::SetupError, record::WorkerRecord};

bitflags::bitflags! {
    /// Capabilities an engine declares about itself.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EngineFlags: u32 {
        /// Each submission completes before returning.
        const SYNC_IO = 1 << 0;
        /// Needs unbuffered access to the target.
        const RAW_IO = 1 << 1;
        /// Targets have no knowable size.
        const DISKLESS_IO = 1 << 2;
        /// Never extends files.
        const NO_EXTEND = 1 << 3;
        /// Synthetic workload without block-size semantics.
        const NO_IO = 1 << 4;
        /// Targets are streams and cannot seek.
        const PIPE_IO = 1 << 5;
        /// Only one direction per job.
        const UNIDIR = 1 << 6;
    }
}

/// Engine whose sequential workloads drain the queue to empty.
pub const LEGACY_DRAIN_ENGINE: &str = "syslet-rw";

/// A loaded engine as seen by one record. Each record holds its own copy, so
/// flags set on it do not leak into other jobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineHandle {
    name: String,
    flags: EngineFlags,
}

impl EngineHandle {
    pub fn new(name: impl Into<String>, flags: EngineFlags) -> Self {
        EngineHandle {
            name: name.into(),
            flags,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> EngineFlags {
        self.flags
    }

    pub fn insert_flags(&mut self, flags: EngineFlags) {
        self.flags.insert(flags);
    }

    pub fn requires_raw_io(&self) -> bool {
        self.flags.contains(EngineFlags::RAW_IO)
    }

    pub fn file_size_unknown(&self) -> bool {
        self.flags.contains(EngineFlags::DISKLESS_IO)
    }

    pub fn seekable(&self) -> bool {
        !self.flags.contains(EngineFlags::PIPE_IO)
    }

    pub fn synthetic(&self) -> bool {
        self.flags.contains(EngineFlags::NO_IO)
    }
}

/// Looks up engines by name.
pub trait EngineResolver {
    fn resolve(&self, name: &str) -> Option<EngineHandle>;
}

/// The engines compiled into the binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEngines;

impl BuiltinEngines {
    pub const NAMES: &'static [&'static str] = &[
        "sync",
        "psync",
        "vsync",
        "libaio",
        "posixaio",
        "mmap",
        "splice",
        "syslet-rw",
        "sg",
        "null",
        "net",
        "netsplice",
        "cpuio",
    ];

    fn flags(name: &str) -> Option<EngineFlags> {
        use EngineFlags as F;
        Some(match name {
            "sync" | "psync" | "vsync" => F::SYNC_IO,
            "libaio" | "posixaio" | "mmap" | "syslet-rw" => F::empty(),
            "splice" => F::SYNC_IO,
            "sg" => F::SYNC_IO | F::RAW_IO,
            "null" => F::DISKLESS_IO,
            "net" | "netsplice" => F::SYNC_IO | F::DISKLESS_IO | F::UNIDIR | F::PIPE_IO,
            "cpuio" => F::SYNC_IO | F::DISKLESS_IO | F::NO_IO,
            _ => return None,
        })
    }
}

impl EngineResolver for BuiltinEngines {
    fn resolve(&self, name: &str) -> Option<EngineHandle> {
        Self::flags(name).map(|flags| EngineHandle::new(name, flags))
    }
}

/// Strip an external-engine qualifier: `external:/path/engine.so` names the
/// engine `/path/engine.so`.
pub fn engine_name(qualified: &str) -> &str {
    match qualified.split_once(':') {
        Some((_, rest)) => rest.trim(),
        None => qualified,
    }
}

/// Per-record hooks of the active workload profile.
pub trait ProfileHooks {
    /// Called once on every freshly acquired record.
    fn on_clone(&self, _record: &mut WorkerRecord) {}

    /// Called at the start of instantiation.
    fn on_init(&self, _record: &mut WorkerRecord) -> Result<(), SetupError> {
        Ok(())
    }

    /// Called when a record is released.
    fn on_exit(&self, _record: &mut WorkerRecord) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProfile;

impl ProfileHooks for NoProfile {}
