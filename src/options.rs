use std::{
    fmt,
    ops::{Index, IndexMut},
    str::FromStr,
    time::Duration,
};

use serde::Serialize;

use crate::error::SetupError;

/// Size meaning "consume all available space".
pub const UNBOUNDED_SIZE: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Ddir {
    Read,
    Write,
}

impl Ddir {
    pub const ALL: [Ddir; 2] = [Ddir::Read, Ddir::Write];
}

impl fmt::Display for Ddir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ddir::Read => f.write_str("read"),
            Ddir::Write => f.write_str("write"),
        }
    }
}

/// One value per I/O direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PerDdir<T> {
    pub read: T,
    pub write: T,
}

impl<T: Copy> PerDdir<T> {
    pub fn both(v: T) -> Self {
        PerDdir { read: v, write: v }
    }
}

impl PerDdir<u64> {
    pub fn any(&self) -> bool {
        self.read != 0 || self.write != 0
    }
}

impl<T> Index<Ddir> for PerDdir<T> {
    type Output = T;
    fn index(&self, ddir: Ddir) -> &T {
        match ddir {
            Ddir::Read => &self.read,
            Ddir::Write => &self.write,
        }
    }
}

impl<T> IndexMut<Ddir> for PerDdir<T> {
    fn index_mut(&mut self, ddir: Ddir) -> &mut T {
        match ddir {
            Ddir::Read => &mut self.read,
            Ddir::Write => &mut self.write,
        }
    }
}

/// Access pattern (`rw=`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadWrite {
    #[default]
    Read,
    Write,
    Rw,
    RandRead,
    RandWrite,
    RandRw,
}

impl ReadWrite {
    pub fn is_read(self) -> bool {
        matches!(
            self,
            ReadWrite::Read | ReadWrite::Rw | ReadWrite::RandRead | ReadWrite::RandRw
        )
    }

    pub fn is_write(self) -> bool {
        matches!(
            self,
            ReadWrite::Write | ReadWrite::Rw | ReadWrite::RandWrite | ReadWrite::RandRw
        )
    }

    pub fn is_random(self) -> bool {
        matches!(
            self,
            ReadWrite::RandRead | ReadWrite::RandWrite | ReadWrite::RandRw
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ReadWrite::Read => "read",
            ReadWrite::Write => "write",
            ReadWrite::Rw => "rw",
            ReadWrite::RandRead => "randread",
            ReadWrite::RandWrite => "randwrite",
            ReadWrite::RandRw => "randrw",
        }
    }
}

impl FromStr for ReadWrite {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        Ok(match s {
            "read" => ReadWrite::Read,
            "write" => ReadWrite::Write,
            "rw" | "readwrite" => ReadWrite::Rw,
            "randread" => ReadWrite::RandRead,
            "randwrite" => ReadWrite::RandWrite,
            "randrw" => ReadWrite::RandRw,
            other => return Err(format!("unknown access pattern {other}")),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    #[default]
    None,
    Md5,
    Crc64,
    Crc32c,
    Crc32,
    Crc16,
    Crc7,
    Sha256,
    Sha512,
    Meta,
    Null,
}

impl FromStr for VerifyMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        Ok(match s {
            "0" | "none" => VerifyMode::None,
            "md5" => VerifyMode::Md5,
            "crc64" => VerifyMode::Crc64,
            "crc32c" | "crc32c-intel" => VerifyMode::Crc32c,
            "crc32" => VerifyMode::Crc32,
            "crc16" => VerifyMode::Crc16,
            "crc7" => VerifyMode::Crc7,
            "sha256" => VerifyMode::Sha256,
            "sha512" => VerifyMode::Sha512,
            "meta" => VerifyMode::Meta,
            "null" => VerifyMode::Null,
            other => return Err(format!("unknown verify mode {other}")),
        })
    }
}

/// How the next file to issue I/O against is picked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileServiceType {
    #[default]
    RoundRobin,
    Sequential,
    Random,
}

impl FromStr for FileServiceType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        // "random:32" carries a switch count we do not need here
        let kind = s.split(':').next().unwrap_or(s);
        Ok(match kind {
            "roundrobin" => FileServiceType::RoundRobin,
            "sequential" => FileServiceType::Sequential,
            "random" => FileServiceType::Random,
            other => return Err(format!("unknown file service type {other}")),
        })
    }
}

/// The full option set of one job.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobOptions {
    pub name: Option<String>,
    pub description: Option<String>,
    pub ioengine: String,
    pub rw: ReadWrite,

    pub bs: PerDdir<u32>,
    pub min_bs: PerDdir<u32>,
    pub max_bs: PerDdir<u32>,
    /// Smallest of the two minimum block sizes; the record's alignment unit.
    pub rw_min_bs: u32,
    pub ba: PerDdir<u32>,
    pub bs_unaligned: bool,

    pub size: u64,
    pub fill_device: bool,
    pub file_size_low: u64,
    pub file_size_high: u64,
    pub filename: Option<String>,
    pub directory: Option<String>,
    pub nr_files: u32,
    pub open_files: u32,
    pub file_service_type: FileServiceType,
    pub zone_size: u64,
    pub overwrite: bool,
    pub pre_read: bool,
    pub invalidate_cache: bool,
    pub direct: bool,

    pub iodepth: u32,
    pub iodepth_low: u32,
    pub iodepth_batch: u32,

    pub rate: PerDdir<u64>,
    pub ratemin: PerDdir<u64>,
    pub rate_iops: PerDdir<u64>,
    pub rate_iops_min: PerDdir<u64>,

    pub numjobs: u32,
    pub stonewall: bool,
    pub new_group: bool,
    pub use_thread: bool,

    pub verify: VerifyMode,
    pub do_verify: bool,
    pub verify_interval: u32,
    pub refill_buffers: bool,
    pub norandommap: bool,
    pub rand_repeatable: bool,
    pub use_os_rand: bool,

    pub thinktime: u32,
    pub thinktime_spin: u32,
    pub timeout: Option<Duration>,
    pub time_based: bool,
    pub fsync_blocks: u32,
    pub fdatasync_blocks: u32,

    pub read_iolog_file: Option<String>,
    pub write_iolog_file: Option<String>,
    pub write_lat_log: bool,
    pub write_bw_log: bool,
    pub clat_percentiles: bool,
    pub overwrite_plist: bool,
    pub percentile_list: Vec<f64>,
    pub ddir_seq_nr: u32,

    pub cpuload: u32,
    pub cpucycle: u32,

    /// `None` means "do not switch identity".
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Default for JobOptions {
    fn default() -> Self {
        JobOptions {
            name: None,
            description: None,
            ioengine: "sync".to_owned(),
            rw: ReadWrite::Read,
            bs: PerDdir::both(4096),
            min_bs: PerDdir::default(),
            max_bs: PerDdir::default(),
            rw_min_bs: 0,
            ba: PerDdir::default(),
            bs_unaligned: false,
            size: 0,
            fill_device: false,
            file_size_low: 0,
            file_size_high: 0,
            filename: None,
            directory: None,
            nr_files: 1,
            open_files: 0,
            file_service_type: FileServiceType::RoundRobin,
            zone_size: 0,
            overwrite: false,
            pre_read: false,
            invalidate_cache: true,
            direct: false,
            iodepth: 1,
            iodepth_low: 0,
            iodepth_batch: 0,
            rate: PerDdir::default(),
            ratemin: PerDdir::default(),
            rate_iops: PerDdir::default(),
            rate_iops_min: PerDdir::default(),
            numjobs: 1,
            stonewall: false,
            new_group: false,
            use_thread: false,
            verify: VerifyMode::None,
            do_verify: true,
            verify_interval: 0,
            refill_buffers: false,
            norandommap: false,
            rand_repeatable: true,
            use_os_rand: false,
            thinktime: 0,
            thinktime_spin: 0,
            timeout: None,
            time_based: false,
            fsync_blocks: 0,
            fdatasync_blocks: 0,
            read_iolog_file: None,
            write_iolog_file: None,
            write_lat_log: false,
            write_bw_log: false,
            clat_percentiles: true,
            overwrite_plist: false,
            percentile_list: Vec::new(),
            ddir_seq_nr: 1,
            cpuload: 0,
            cpucycle: 0,
            uid: None,
            gid: None,
        }
    }
}

impl JobOptions {
    /// Parse one option line (`key=value` or a bare `key`) and apply it.
    pub fn apply_line(&mut self, line: &str) -> Result<(), SetupError> {
        let (key, value) = split_option(line);
        self.apply(key, value)
    }

    pub fn apply(&mut self, key: &str, value: Option<&str>) -> Result<(), SetupError> {
        let bad = |message: String| SetupError::Option {
            key: key.to_owned(),
            message,
        };
        let need = || value.ok_or_else(|| bad("missing value".to_owned()));

        match key {
            "name" => self.name = Some(need()?.to_owned()),
            "description" => self.description = Some(need()?.to_owned()),
            "ioengine" => self.ioengine = need()?.to_owned(),
            "rw" | "readwrite" => self.rw = need()?.parse().map_err(bad)?,
            "bs" | "blocksize" => {
                self.bs = parse_per_ddir(need()?, self.bs, parse_u32_size).map_err(bad)?
            }
            "bsrange" | "blocksize_range" => {
                let (min, max) = parse_bs_range(need()?, self.min_bs, self.max_bs).map_err(bad)?;
                self.min_bs = min;
                self.max_bs = max;
            }
            "ba" | "blockalign" => {
                self.ba = parse_per_ddir(need()?, self.ba, parse_u32_size).map_err(bad)?
            }
            "bs_unaligned" => self.bs_unaligned = parse_bool(value).map_err(bad)?,
            "size" => self.size = parse_size(need()?).map_err(bad)?,
            "fill_device" => self.fill_device = parse_bool(value).map_err(bad)?,
            "filesize" => {
                let (lo, hi) = parse_range(need()?).map_err(bad)?;
                self.file_size_low = lo;
                self.file_size_high = hi;
            }
            "filename" => self.filename = Some(need()?.to_owned()),
            "directory" => self.directory = Some(need()?.to_owned()),
            "nrfiles" => self.nr_files = parse_u32(need()?).map_err(bad)?,
            "openfiles" => self.open_files = parse_u32(need()?).map_err(bad)?,
            "file_service_type" => self.file_service_type = need()?.parse().map_err(bad)?,
            "zonesize" => self.zone_size = parse_size(need()?).map_err(bad)?,
            "overwrite" => self.overwrite = parse_bool(value).map_err(bad)?,
            "pre_read" => self.pre_read = parse_bool(value).map_err(bad)?,
            "invalidate" => self.invalidate_cache = parse_bool(value).map_err(bad)?,
            "direct" => self.direct = parse_bool(value).map_err(bad)?,
            "buffered" => self.direct = !parse_bool(value).map_err(bad)?,
            "iodepth" => self.iodepth = parse_u32(need()?).map_err(bad)?.max(1),
            "iodepth_low" => self.iodepth_low = parse_u32(need()?).map_err(bad)?,
            "iodepth_batch" => self.iodepth_batch = parse_u32(need()?).map_err(bad)?,
            "rate" => self.rate = parse_per_ddir(need()?, self.rate, parse_size).map_err(bad)?,
            "ratemin" => {
                self.ratemin = parse_per_ddir(need()?, self.ratemin, parse_size).map_err(bad)?
            }
            "rate_iops" => {
                self.rate_iops = parse_per_ddir(need()?, self.rate_iops, parse_u64).map_err(bad)?
            }
            "rate_iops_min" => {
                self.rate_iops_min =
                    parse_per_ddir(need()?, self.rate_iops_min, parse_u64).map_err(bad)?
            }
            "numjobs" => self.numjobs = parse_u32(need()?).map_err(bad)?.max(1),
            "stonewall" | "wait_for_previous" => self.stonewall = parse_bool(value).map_err(bad)?,
            "new_group" => self.new_group = parse_bool(value).map_err(bad)?,
            "thread" => self.use_thread = parse_bool(value).map_err(bad)?,
            "verify" => self.verify = need()?.parse().map_err(bad)?,
            "do_verify" => self.do_verify = parse_bool(value).map_err(bad)?,
            "verify_interval" => self.verify_interval = parse_u32_size(need()?).map_err(bad)?,
            "refill_buffers" => self.refill_buffers = parse_bool(value).map_err(bad)?,
            "norandommap" => self.norandommap = parse_bool(value).map_err(bad)?,
            "randrepeat" => self.rand_repeatable = parse_bool(value).map_err(bad)?,
            "use_os_rand" => self.use_os_rand = parse_bool(value).map_err(bad)?,
            "thinktime" => self.thinktime = parse_u32(need()?).map_err(bad)?,
            "thinktime_spin" => self.thinktime_spin = parse_u32(need()?).map_err(bad)?,
            "runtime" | "timeout" => {
                let d = parse_duration(need()?).map_err(bad)?;
                self.timeout = (!d.is_zero()).then_some(d);
            }
            "time_based" => self.time_based = parse_bool(value).map_err(bad)?,
            "fsync" => self.fsync_blocks = parse_u32(need()?).map_err(bad)?,
            "fdatasync" => self.fdatasync_blocks = parse_u32(need()?).map_err(bad)?,
            "read_iolog" => self.read_iolog_file = Some(need()?.to_owned()),
            "write_iolog" => self.write_iolog_file = Some(need()?.to_owned()),
            "write_lat_log" => self.write_lat_log = parse_bool(value).map_err(bad)?,
            "write_bw_log" => self.write_bw_log = parse_bool(value).map_err(bad)?,
            "clat_percentiles" => self.clat_percentiles = parse_bool(value).map_err(bad)?,
            "percentile_list" => {
                self.percentile_list = parse_percentiles(need()?).map_err(bad)?;
                self.overwrite_plist = true;
            }
            "ddir_seq_nr" => self.ddir_seq_nr = parse_u32(need()?).map_err(bad)?.max(1),
            "cpuload" => self.cpuload = parse_u32(need()?).map_err(bad)?,
            "cpuchunks" => self.cpucycle = parse_u32(need()?).map_err(bad)?,
            "uid" => self.uid = Some(parse_u32(need()?).map_err(bad)?),
            "gid" => self.gid = Some(parse_u32(need()?).map_err(bad)?),
            _ => return Err(bad("unknown option".to_owned())),
        }
        Ok(())
    }
}

/// Split `key=value` into its trimmed halves. A line without `=` is a bare flag.
pub fn split_option(line: &str) -> (&str, Option<&str>) {
    match line.split_once('=') {
        Some((k, v)) => (k.trim(), Some(v.trim())),
        None => (line.trim(), None),
    }
}

/// Parse a size with an optional binary suffix (`4k`, `1m`, `2GiB`).
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(digits_end);
    if num.is_empty() {
        return Err(format!("invalid size {s:?}"));
    }
    let num: u64 = num.parse().map_err(|e| format!("invalid size {s:?}: {e}"))?;
    let shift = match suffix.to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        "p" | "pb" | "pib" => 50,
        other => return Err(format!("invalid size suffix {other:?}")),
    };
    num.checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size {s:?} overflows"))
}

fn parse_u32_size(s: &str) -> Result<u32, String> {
    let v = parse_size(s)?;
    u32::try_from(v).map_err(|_| format!("{s:?} out of range"))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    s.trim()
        .parse()
        .map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn parse_u64(s: &str) -> Result<u64, String> {
    s.trim()
        .parse()
        .map_err(|e| format!("invalid number {s:?}: {e}"))
}

/// A bare flag means "on".
pub fn parse_bool(value: Option<&str>) -> Result<bool, String> {
    match value.map(str::trim) {
        None | Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
        Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
        Some(other) => Err(format!("invalid boolean {other:?}")),
    }
}

/// Bare integers are seconds, anything else goes through humantime.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration {s:?}: {e}"))
}

/// `a` sets both directions, `a,b` sets read and write, an empty half keeps
/// the current value.
fn parse_per_ddir<T: Copy>(
    s: &str,
    current: PerDdir<T>,
    parse: fn(&str) -> Result<T, String>,
) -> Result<PerDdir<T>, String> {
    match s.split_once(',') {
        None => Ok(PerDdir::both(parse(s)?)),
        Some((r, w)) => {
            let mut out = current;
            if !r.trim().is_empty() {
                out.read = parse(r)?;
            }
            if !w.trim().is_empty() {
                out.write = parse(w)?;
            }
            Ok(out)
        }
    }
}

/// `lo-hi`; the bounds are swapped if given in the wrong order.
fn parse_range(s: &str) -> Result<(u64, u64), String> {
    let (lo, hi) = match s.split_once('-') {
        Some((lo, hi)) => (parse_size(lo)?, parse_size(hi)?),
        None => {
            let v = parse_size(s)?;
            (v, v)
        }
    };
    Ok(if lo <= hi { (lo, hi) } else { (hi, lo) })
}

fn parse_bs_range(
    s: &str,
    min: PerDdir<u32>,
    max: PerDdir<u32>,
) -> Result<(PerDdir<u32>, PerDdir<u32>), String> {
    let to_u32 = |(lo, hi): (u64, u64)| -> Result<(u32, u32), String> {
        Ok((
            u32::try_from(lo).map_err(|_| format!("{lo} out of range"))?,
            u32::try_from(hi).map_err(|_| format!("{hi} out of range"))?,
        ))
    };
    let (mut min, mut max) = (min, max);
    match s.split_once(',') {
        None => {
            let (lo, hi) = to_u32(parse_range(s)?)?;
            min = PerDdir::both(lo);
            max = PerDdir::both(hi);
        }
        Some((r, w)) => {
            if !r.trim().is_empty() {
                (min.read, max.read) = to_u32(parse_range(r)?)?;
            }
            if !w.trim().is_empty() {
                (min.write, max.write) = to_u32(parse_range(w)?)?;
            }
        }
    }
    Ok((min, max))
}

fn parse_percentiles(s: &str) -> Result<Vec<f64>, String> {
    s.split(':')
        .map(|p| {
            let v: f64 = p
                .trim()
                .parse()
                .map_err(|e| format!("invalid percentile {p:?}: {e}"))?;
            if v <= 0.0 || v > 100.0 {
                return Err(format!("percentile {v} out of range"));
            }
            Ok(v)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("1m").unwrap(), 1 << 20);
        assert_eq!(parse_size("2GiB").unwrap(), 2 << 30);
        assert!(parse_size("k").is_err());
        assert!(parse_size("12q").is_err());
        assert!(parse_size("99999999999p").is_err());
    }

    #[test]
    fn per_direction_values() {
        let mut o = JobOptions::default();
        o.apply_line("bs=8k").unwrap();
        assert_eq!(o.bs, PerDdir::both(8192));
        o.apply_line("bs=,16k").unwrap();
        assert_eq!(o.bs, PerDdir { read: 8192, write: 16384 });
        o.apply_line("rate=1m,2m").unwrap();
        assert_eq!(o.rate, PerDdir { read: 1 << 20, write: 2 << 20 });
    }

    #[test]
    fn block_size_range() {
        let mut o = JobOptions::default();
        o.apply_line("bsrange=1k-4k,16k-8k").unwrap();
        assert_eq!(o.min_bs, PerDdir { read: 1024, write: 8192 });
        assert_eq!(o.max_bs, PerDdir { read: 4096, write: 16384 });
    }

    #[test]
    fn flags_and_enums() {
        let mut o = JobOptions::default();
        o.apply_line("stonewall").unwrap();
        o.apply_line("thread = 0").unwrap();
        o.apply_line("rw=randrw").unwrap();
        o.apply_line("verify=crc32c").unwrap();
        o.apply_line("file_service_type=random:8").unwrap();
        assert!(o.stonewall);
        assert!(!o.use_thread);
        assert_eq!(o.rw, ReadWrite::RandRw);
        assert!(o.rw.is_read() && o.rw.is_write() && o.rw.is_random());
        assert_eq!(o.verify, VerifyMode::Crc32c);
        assert_eq!(o.file_service_type, FileServiceType::Random);
    }

    #[test]
    fn durations() {
        let mut o = JobOptions::default();
        o.apply_line("runtime=30").unwrap();
        assert_eq!(o.timeout, Some(Duration::from_secs(30)));
        o.apply_line("runtime=1m 30s").unwrap();
        assert_eq!(o.timeout, Some(Duration::from_secs(90)));
        o.apply_line("runtime=0").unwrap();
        assert_eq!(o.timeout, None);
    }

    #[test]
    fn percentiles_set_override() {
        let mut o = JobOptions::default();
        o.apply_line("percentile_list=50:99:99.9").unwrap();
        assert_eq!(o.percentile_list, vec![50.0, 99.0, 99.9]);
        assert!(o.overwrite_plist);
        assert!(o.apply_line("percentile_list=0").is_err());
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        let mut o = JobOptions::default();
        assert!(matches!(
            o.apply_line("frobnicate=1"),
            Err(SetupError::Option { ref key, .. }) if key == "frobnicate"
        ));
        assert!(o.apply_line("iodepth").is_err());
        assert!(o.apply_line("rw=sideways").is_err());
        assert!(o.apply_line("direct=maybe").is_err());
    }
}
