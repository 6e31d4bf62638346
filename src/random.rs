use std::{fs::File, io::Read, path::PathBuf};

use byteorder::{ByteOrder, NativeEndian};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use tracing::debug;

use crate::{
    error::SetupError,
    options::{FileServiceType, JobOptions},
};

/// Base of repeatable seeds; multiplied by the record ordinal.
pub const REPEATABLE_SEED: u32 = 0xb189_9bed;

pub const SEED_SLOTS: usize = 8;

/// Which seed slot feeds which stream. The mapping is fixed regardless of
/// generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    BlockSize = 0,
    Verify = 1,
    RwMix = 2,
    NextFile = 3,
    RandomIo = 4,
    FileSize = 5,
    Trim = 6,
    BufferFill = 7,
}

/// Where seed bytes come from.
pub trait EntropySource {
    /// Fill `buf` completely or fail.
    fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<()>;
}

/// Reads seeds from a device such as `/dev/urandom`.
#[derive(Clone, Debug)]
pub struct DeviceEntropy {
    path: PathBuf,
}

impl DeviceEntropy {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        DeviceEntropy { path: path.into() }
    }
}

impl Default for DeviceEntropy {
    fn default() -> Self {
        DeviceEntropy::at("/dev/urandom")
    }
}

impl EntropySource for DeviceEntropy {
    fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let mut file = File::open(&self.path)?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if filled < buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "short read from {}: {filled} of {} bytes",
                    self.path.display(),
                    buf.len()
                ),
            ));
        }
        Ok(())
    }
}

/// The portable three-component Tausworthe generator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Taus88 {
    s1: u32,
    s2: u32,
    s3: u32,
}

impl Taus88 {
    pub fn new(seed: u32) -> Self {
        fn lcg(x: u32, seed: u32) -> u32 {
            x.wrapping_mul(69069) ^ seed
        }
        // each component has a minimum valid state
        fn floor(x: u32, m: u32) -> u32 {
            if x < m {
                x + m
            } else {
                x
            }
        }
        let s1 = floor(lcg((1 << 31) + (1 << 17) + (1 << 7), seed), 1);
        let s2 = floor(lcg(s1, seed), 7);
        let s3 = floor(lcg(s2, seed), 15);
        let mut taus = Taus88 { s1, s2, s3 };
        for _ in 0..10 {
            taus.next_u32();
        }
        taus
    }

    pub fn next_u32(&mut self) -> u32 {
        fn step(s: u32, a: u32, b: u32, c: u32, d: u32) -> u32 {
            ((s & c) << d) ^ (((s << a) ^ s) >> b)
        }
        self.s1 = step(self.s1, 13, 19, 0xffff_fffe, 12);
        self.s2 = step(self.s2, 2, 25, 0xffff_fff8, 4);
        self.s3 = step(self.s3, 3, 11, 0xffff_fff0, 17);
        self.s1 ^ self.s2 ^ self.s3
    }
}

/// One stream's generator state.
#[derive(Clone, Debug, Default)]
pub enum RandState {
    #[default]
    Unseeded,
    Platform(Box<StdRng>),
    Builtin(Taus88),
}

impl RandState {
    pub fn seeded(use_os_rand: bool, seed: u32) -> Self {
        if use_os_rand {
            RandState::Platform(Box::new(StdRng::seed_from_u64(u64::from(seed))))
        } else {
            RandState::Builtin(Taus88::new(seed))
        }
    }

    pub fn is_seeded(&self) -> bool {
        !matches!(self, RandState::Unseeded)
    }

    /// `None` for a stream that was never seeded.
    pub fn next_u32(&mut self) -> Option<u32> {
        match self {
            RandState::Unseeded => None,
            RandState::Platform(rng) => Some(rng.next_u32()),
            RandState::Builtin(taus) => Some(taus.next_u32()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RandomStreams {
    pub seeds: [u32; SEED_SLOTS],
    pub bsrange: RandState,
    pub verify: RandState,
    pub rwmix: RandState,
    pub next_file: RandState,
    pub random: RandState,
    pub file_size: RandState,
    pub trim: RandState,
    pub buf: RandState,
}

impl RandomStreams {
    /// Read a fresh seed block and seed every stream from it.
    pub fn init(
        opts: &JobOptions,
        ordinal: u32,
        source: &mut dyn EntropySource,
    ) -> Result<Self, SetupError> {
        let mut raw = [0u8; SEED_SLOTS * 4];
        source
            .fill(&mut raw)
            .map_err(|e| SetupError::io("read entropy", e))?;

        let mut streams = RandomStreams::default();
        NativeEndian::read_u32_into(&raw, &mut streams.seeds);
        streams.fill(opts, ordinal);
        Ok(streams)
    }

    /// Seed the streams from `self.seeds`.
    pub fn fill(&mut self, opts: &JobOptions, ordinal: u32) {
        if opts.rand_repeatable {
            self.seeds[Stream::RandomIo as usize] = REPEATABLE_SEED.wrapping_mul(ordinal);
        }

        let os = opts.use_os_rand;
        let seed = |s: Stream| self.seeds[s as usize];

        self.bsrange = RandState::seeded(os, seed(Stream::BlockSize));
        self.verify = RandState::seeded(os, seed(Stream::Verify));
        self.rwmix = RandState::seeded(os, seed(Stream::RwMix));
        self.next_file = if opts.file_service_type == FileServiceType::Random {
            RandState::seeded(os, seed(Stream::NextFile))
        } else {
            RandState::Unseeded
        };
        self.random = RandState::seeded(os, seed(Stream::RandomIo));
        self.file_size = RandState::seeded(os, seed(Stream::FileSize));
        self.trim = RandState::seeded(os, seed(Stream::Trim));
        // buffer contents always come from the portable generator
        self.buf = RandState::seeded(false, seed(Stream::BufferFill));

        debug!(ordinal, seed = self.seeds[Stream::RandomIo as usize], "seeded random streams");
    }

    pub fn seed(&self, stream: Stream) -> u32 {
        self.seeds[stream as usize]
    }
}
