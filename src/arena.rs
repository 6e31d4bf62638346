use std::{
    io,
    ops::Range,
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info};

use crate::{
    error::SetupError,
    filehash::{FileHashTable, TABLE_LEN},
    options::{Ddir, PerDdir},
    rate::RateLimit,
    record::{IoStat, JobError, RunState, ThreadStats, WorkerRecord},
};

/// Stored in the debug-target slot when no job is singled out.
pub const NO_DEBUG_TARGET: u32 = u32::MAX;

// Slot layout, little endian:
//   0  ordinal, state, group id, pid, error code (u32/i32 each)
//  20  error message length (u16) and up to ERROR_MESSAGE_MAX bytes
// 128  rate presence bits (u32), then per direction nsec_cycle and pending sleep
// 168  four stat series, per direction min, max, samples, mean
const HEADER_LEN: usize = 20;
const MESSAGE_OFF: usize = HEADER_LEN;
const RATE_OFF: usize = 128;
const RATE_DDIR_LEN: usize = 16;
const STATS_OFF: usize = RATE_OFF + 8 + 2 * RATE_DDIR_LEN;
const STAT_LEN: usize = 32;

/// Longest error message a slot keeps; longer ones are cut.
pub const ERROR_MESSAGE_MAX: usize = RATE_OFF - MESSAGE_OFF - 2;

/// Bytes per slot.
pub const SLOT_LEN: usize = STATS_OFF + 4 * 2 * STAT_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub u64);

/// Why a region could not be created.
#[derive(Debug)]
pub enum RegionError {
    /// The request was bigger than the system allows; a smaller one may work.
    TooLarge(io::Error),
    Other(io::Error),
}

/// Memory writable by the controller and every worker it spawns.
pub trait Region: Send {
    fn id(&self) -> RegionId;
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

pub trait RegionBackend {
    fn create(&self, len: usize) -> Result<Box<dyn Region>, RegionError>;
}

/// `MAP_SHARED | MAP_ANONYMOUS` memory, visible across `fork()`.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedMapping;

#[cfg(unix)]
struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is owned by this value and only reachable through it.
#[cfg(unix)]
unsafe impl Send for MappedRegion {}

#[cfg(unix)]
impl Region for MappedRegion {
    fn id(&self) -> RegionId {
        RegionId(self.ptr.as_ptr() as u64)
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[cfg(unix)]
impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(unix)]
impl RegionBackend for SharedMapping {
    fn create(&self, len: usize) -> Result<Box<dyn Region>, RegionError> {
        // Safety: MAP_ANONYMOUS does not require a file descriptor; the kernel
        // hands back zeroed memory.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOMEM) => RegionError::TooLarge(err),
                _ => RegionError::Other(err),
            });
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| RegionError::Other(io::Error::new(io::ErrorKind::Other, "mmap returned null")))?;
        Ok(Box::new(MappedRegion { ptr, len }))
    }
}

/// Private heap memory with an optional size limit. Only shared between
/// threads of one process.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapBackend {
    limit: Option<usize>,
}

impl HeapBackend {
    pub fn with_limit(limit: usize) -> Self {
        HeapBackend { limit: Some(limit) }
    }
}

struct HeapRegion {
    id: RegionId,
    bytes: Vec<u8>,
}

impl Region for HeapRegion {
    fn id(&self) -> RegionId {
        self.id
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl RegionBackend for HeapBackend {
    fn create(&self, len: usize) -> Result<Box<dyn Region>, RegionError> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        if self.limit.map_or(false, |limit| len > limit) {
            return Err(RegionError::TooLarge(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("{len} bytes exceeds limit"),
            )));
        }
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|e| RegionError::TooLarge(io::Error::new(io::ErrorKind::OutOfMemory, e)))?;
        bytes.resize(len, 0);
        Ok(Box::new(HeapRegion {
            id: RegionId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            bytes,
        }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Free,
    /// Holds a record that is still being set up.
    Acquired,
    /// Fully instantiated and handed to the run phase.
    Ready,
}

/// Identity and status words at the start of every slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotHeader {
    pub ordinal: u32,
    pub state: SlotState,
    pub group_id: u32,
    /// Worker pid once it runs; zero before.
    pub pid: u32,
    pub error: i32,
}

impl SlotHeader {
    fn decode(buf: &[u8]) -> Self {
        SlotHeader {
            ordinal: LittleEndian::read_u32(&buf[0..4]),
            state: match LittleEndian::read_u32(&buf[4..8]) {
                1 => SlotState::Acquired,
                2 => SlotState::Ready,
                _ => SlotState::Free,
            },
            group_id: LittleEndian::read_u32(&buf[8..12]),
            pid: LittleEndian::read_u32(&buf[12..16]),
            error: LittleEndian::read_i32(&buf[16..20]),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.ordinal);
        let state = match self.state {
            SlotState::Free => 0,
            SlotState::Acquired => 1,
            SlotState::Ready => 2,
        };
        LittleEndian::write_u32(&mut buf[4..8], state);
        LittleEndian::write_u32(&mut buf[8..12], self.group_id);
        LittleEndian::write_u32(&mut buf[12..16], self.pid);
        LittleEndian::write_i32(&mut buf[16..20], self.error);
    }
}

fn decode_message(buf: &[u8]) -> String {
    let len = usize::from(LittleEndian::read_u16(&buf[MESSAGE_OFF..])).min(ERROR_MESSAGE_MAX);
    let start = MESSAGE_OFF + 2;
    String::from_utf8_lossy(&buf[start..start + len]).into_owned()
}

fn encode_message(message: &str, buf: &mut [u8]) {
    let mut len = message.len().min(ERROR_MESSAGE_MAX);
    while !message.is_char_boundary(len) {
        len -= 1;
    }
    let start = MESSAGE_OFF + 2;
    LittleEndian::write_u16(&mut buf[MESSAGE_OFF..], len as u16);
    buf[start..start + len].copy_from_slice(&message.as_bytes()[..len]);
    buf[start + len..RATE_OFF].fill(0);
}

fn decode_rate(buf: &[u8]) -> PerDdir<Option<RateLimit>> {
    let present = LittleEndian::read_u32(&buf[RATE_OFF..]);
    let mut rate = PerDdir::default();
    for (i, ddir) in Ddir::ALL.into_iter().enumerate() {
        if present & (1 << i) == 0 {
            continue;
        }
        let off = RATE_OFF + 8 + i * RATE_DDIR_LEN;
        rate[ddir] = Some(RateLimit {
            nsec_cycle: LittleEndian::read_u64(&buf[off..]),
            pending_sleep_us: LittleEndian::read_i64(&buf[off + 8..]),
        });
    }
    rate
}

fn encode_rate(rate: &PerDdir<Option<RateLimit>>, buf: &mut [u8]) {
    let mut present = 0;
    for (i, ddir) in Ddir::ALL.into_iter().enumerate() {
        let off = RATE_OFF + 8 + i * RATE_DDIR_LEN;
        let limit = rate[ddir].unwrap_or_default();
        if rate[ddir].is_some() {
            present |= 1 << i;
        }
        LittleEndian::write_u64(&mut buf[off..], limit.nsec_cycle);
        LittleEndian::write_i64(&mut buf[off + 8..], limit.pending_sleep_us);
    }
    LittleEndian::write_u32(&mut buf[RATE_OFF..], present);
}

fn stat_offset(series: usize, ddir: usize) -> usize {
    STATS_OFF + (series * 2 + ddir) * STAT_LEN
}

fn decode_stats(buf: &[u8]) -> ThreadStats {
    let [clat, slat, lat, bw] = [0, 1, 2, 3].map(|series| {
        let mut per = PerDdir::<IoStat>::default();
        for (i, ddir) in Ddir::ALL.into_iter().enumerate() {
            let off = stat_offset(series, i);
            per[ddir] = IoStat {
                min_val: LittleEndian::read_u64(&buf[off..]),
                max_val: LittleEndian::read_u64(&buf[off + 8..]),
                samples: LittleEndian::read_u64(&buf[off + 16..]),
                mean: LittleEndian::read_f64(&buf[off + 24..]),
            };
        }
        per
    });
    ThreadStats { clat, slat, lat, bw }
}

fn encode_stats(stats: &ThreadStats, buf: &mut [u8]) {
    for (series, per) in stats.series().into_iter().enumerate() {
        for (i, ddir) in Ddir::ALL.into_iter().enumerate() {
            let off = stat_offset(series, i);
            let stat = per[ddir];
            LittleEndian::write_u64(&mut buf[off..], stat.min_val);
            LittleEndian::write_u64(&mut buf[off + 8..], stat.max_val);
            LittleEndian::write_u64(&mut buf[off + 16..], stat.samples);
            LittleEndian::write_f64(&mut buf[off + 24..], stat.mean);
        }
    }
}

/// Identity of an arena: which region, and how many slots it ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaHandle {
    pub id: RegionId,
    pub capacity: usize,
}

/// One region, created once by the controller and inherited by every worker
/// it forks:
///
/// ```text
/// | slot 1 | slot 2 | ... | slot N | file hash table | debug target |
/// ```
///
/// A slot holds everything a job changes while running. The owned parts of
/// each record (options, file list, streams) are kept in a vector beside the
/// region, indexed by the same ordinals.
pub struct Arena {
    region: Box<dyn Region>,
    capacity: usize,
    owner_pid: u32,
    records: Vec<Option<WorkerRecord>>,
}

impl Arena {
    /// Region bytes needed for `capacity` slots, or `None` if that does not
    /// fit in a `usize`.
    pub fn region_len(capacity: usize) -> Option<usize> {
        capacity
            .checked_mul(SLOT_LEN)?
            .checked_add(TABLE_LEN + std::mem::size_of::<u32>())
    }

    /// Create the region, halving the capacity for as long as the request is
    /// too large.
    pub fn create(backend: &dyn RegionBackend, capacity_hint: usize) -> Result<Arena, SetupError> {
        let mut capacity = capacity_hint;
        let mut last_error = "no capacity requested".to_owned();

        let (region, records) = loop {
            if capacity == 0 {
                return Err(SetupError::ArenaCreationFailed {
                    capacity,
                    reason: last_error,
                });
            }
            let Some(len) = Self::region_len(capacity) else {
                debug!(capacity, "job area size overflows, halving");
                last_error = format!("{capacity} slots overflow the address space");
                capacity >>= 1;
                continue;
            };
            let region = match backend.create(len) {
                Ok(region) => region,
                Err(RegionError::TooLarge(e)) => {
                    debug!(capacity, error = %e, "job area too large, halving");
                    last_error = e.to_string();
                    capacity >>= 1;
                    continue;
                }
                Err(RegionError::Other(e)) => {
                    return Err(SetupError::ArenaCreationFailed {
                        capacity,
                        reason: e.to_string(),
                    })
                }
            };
            let mut records = Vec::new();
            if let Err(e) = records.try_reserve_exact(capacity) {
                debug!(capacity, error = %e, "record table too large, halving");
                last_error = e.to_string();
                capacity >>= 1;
                continue;
            }
            records.resize_with(capacity, || None);
            break (region, records);
        };

        let mut arena = Arena {
            region,
            capacity,
            owner_pid: std::process::id(),
            records,
        };
        let table_off = arena.table_offset();
        let bytes = arena.region.bytes_mut();
        bytes[..table_off].fill(0);
        FileHashTable::init(&mut bytes[table_off..table_off + TABLE_LEN]);
        arena.set_debug_target(None);

        if capacity < capacity_hint {
            info!(capacity, requested = capacity_hint, "job area capacity reduced");
        }
        debug!(capacity, id = ?arena.region.id(), "job area created");
        Ok(arena)
    }

    pub fn handle(&self) -> ArenaHandle {
        ArenaHandle {
            id: self.region.id(),
            capacity: self.capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn table_offset(&self) -> usize {
        self.capacity * SLOT_LEN
    }

    fn debug_offset(&self) -> usize {
        self.table_offset() + TABLE_LEN
    }

    fn slot_range(&self, ordinal: u32) -> Option<Range<usize>> {
        let index = ordinal.checked_sub(1)? as usize;
        (index < self.capacity).then(|| index * SLOT_LEN..(index + 1) * SLOT_LEN)
    }

    fn slot(&self, ordinal: u32) -> Option<&[u8]> {
        let range = self.slot_range(ordinal)?;
        Some(&self.region.bytes()[range])
    }

    fn slot_mut(&mut self, ordinal: u32) -> Option<&mut [u8]> {
        let range = self.slot_range(ordinal)?;
        Some(&mut self.region.bytes_mut()[range])
    }

    pub fn debug_target(&self) -> Option<u32> {
        let off = self.debug_offset();
        match LittleEndian::read_u32(&self.region.bytes()[off..off + 4]) {
            NO_DEBUG_TARGET => None,
            ordinal => Some(ordinal),
        }
    }

    pub fn set_debug_target(&mut self, ordinal: Option<u32>) {
        let off = self.debug_offset();
        LittleEndian::write_u32(
            &mut self.region.bytes_mut()[off..off + 4],
            ordinal.unwrap_or(NO_DEBUG_TARGET),
        );
    }

    pub fn file_table(&mut self) -> FileHashTable<'_> {
        let off = self.table_offset();
        FileHashTable::attach(&mut self.region.bytes_mut()[off..off + TABLE_LEN])
    }

    pub fn header(&self, ordinal: u32) -> Option<SlotHeader> {
        self.slot(ordinal).map(SlotHeader::decode)
    }

    /// Overwrite the header words of `header.ordinal`, leaving the rest of
    /// the slot alone. Ordinals outside the arena are ignored.
    pub fn write_header(&mut self, header: SlotHeader) {
        if let Some(buf) = self.slot_mut(header.ordinal) {
            header.encode(buf);
        }
    }

    fn update_header(&mut self, ordinal: u32, f: impl FnOnce(&mut SlotHeader)) {
        if let Some(mut header) = self.header(ordinal) {
            f(&mut header);
            self.write_header(header);
        }
    }

    pub fn mark_ready(&mut self, ordinal: u32, group_id: u32) {
        self.update_header(ordinal, |h| {
            h.state = SlotState::Ready;
            h.group_id = group_id;
        });
    }

    pub fn set_pid(&mut self, ordinal: u32, pid: u32) {
        self.update_header(ordinal, |h| h.pid = pid);
    }

    /// Record why the job in `ordinal` failed. The message is cut to
    /// [`ERROR_MESSAGE_MAX`] bytes.
    pub fn set_error(&mut self, ordinal: u32, error: &JobError) {
        self.update_header(ordinal, |h| h.error = error.code);
        if let Some(buf) = self.slot_mut(ordinal) {
            encode_message(&error.message, buf);
        }
    }

    /// Decode the run-time part of the job in `ordinal`.
    pub fn run_state(&self, ordinal: u32) -> Option<RunState> {
        let buf = self.slot(ordinal)?;
        let header = SlotHeader::decode(buf);
        let message = decode_message(buf);
        let error = (header.error != 0 || !message.is_empty()).then(|| JobError {
            code: header.error,
            message,
        });
        Some(RunState {
            pid: (header.pid != 0).then_some(header.pid),
            error,
            rate: decode_rate(buf),
            stats: decode_stats(buf),
        })
    }

    /// Store `state` in the slot of `ordinal`. Nothing here allocates, so a
    /// forked worker may call it.
    pub fn write_run_state(&mut self, ordinal: u32, state: &RunState) {
        let Some(buf) = self.slot_mut(ordinal) else {
            return;
        };
        let mut header = SlotHeader::decode(buf);
        header.pid = state.pid.unwrap_or(0);
        header.error = state.error.as_ref().map_or(0, |e| e.code);
        header.encode(buf);
        encode_message(state.error.as_ref().map_or("", |e| e.message.as_str()), buf);
        encode_rate(&state.rate, buf);
        encode_stats(&state.stats, buf);
    }

    /// Lowest ordinal whose slot is free.
    pub fn free_ordinal(&self) -> Option<u32> {
        self.records
            .iter()
            .position(Option::is_none)
            .map(|i| i as u32 + 1)
    }

    /// Put `record` into its slot and clear the slot's bytes. The slot must
    /// be free.
    pub fn place(&mut self, record: WorkerRecord) {
        let ordinal = record.ordinal;
        assert!(
            ordinal >= 1 && ordinal as usize <= self.capacity,
            "ordinal {ordinal} outside the job area"
        );
        let slot = &mut self.records[ordinal as usize - 1];
        assert!(slot.is_none(), "slot {ordinal} already in use");
        *slot = Some(record);
        if let Some(buf) = self.slot_mut(ordinal) {
            buf.fill(0);
            SlotHeader {
                ordinal,
                state: SlotState::Acquired,
                ..Default::default()
            }
            .encode(buf);
        }
    }

    /// Empty the slot, zeroing its bytes, and hand back the record.
    pub fn take(&mut self, ordinal: u32) -> Option<WorkerRecord> {
        let record = self.records.get_mut(ordinal.checked_sub(1)? as usize)?.take();
        if let Some(buf) = self.slot_mut(ordinal) {
            buf.fill(0);
        }
        record
    }

    pub fn get(&self, ordinal: u32) -> Option<&WorkerRecord> {
        self.records.get(ordinal.checked_sub(1)? as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, ordinal: u32) -> Option<&mut WorkerRecord> {
        self.records
            .get_mut(ordinal.checked_sub(1)? as usize)?
            .as_mut()
    }

    pub fn live(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }

    /// Live records in ordinal order.
    pub fn records(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.records.iter().flatten()
    }

    pub fn is_owner(&self) -> bool {
        self.owner_pid == std::process::id()
    }

    /// Detach; the owning process also destroys the region and side table.
    pub fn teardown(self) {
        if self.is_owner() {
            debug!(id = ?self.region.id(), live = self.live(), "destroying job area");
        } else {
            debug!(id = ?self.region.id(), "detaching from job area");
        }
        drop(self);
    }
}
