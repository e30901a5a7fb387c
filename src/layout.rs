//! On-disk structures of a trace file.
//!
//! ```text
//! [TraceFileHeader][MsgCounter x n][level 0] ... [level 9][file trailer][dictionary ...]
//! ```
//!
//! All integers are native-endian. The header and counter rows are
//! `#[repr(C)]` so their byte layout is fixed and shared with any reader
//! built against the same definitions.

use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::region::RawRegion;

/// Number of independent ring buffers in every trace file.
pub const NUM_LEVELS: usize = 10;
/// Version written by this crate.
pub const FILE_VERSION: u32 = 5;
/// Oldest version a reader can decode. Version 2 dictionaries carry no
/// explicit message id.
pub const OLDEST_READABLE_VERSION: u32 = 2;
/// Bytes reserved after the last ring buffer.
pub const FILE_TRAILER_SIZE: u32 = 1024;
/// Bytes at the end of every ring buffer poisoned with `0xFF`.
pub const RING_TRAILER_SIZE: usize = 256;
/// Size of the wrap offset stored in front of every ring buffer.
pub const RING_HEADER_SIZE: usize = 4;
pub const DEFAULT_NUM_COUNTERS: u32 = 512;
pub const DEFAULT_LEVEL_KB: u32 = 8;
/// Upper bound for one level before scaling.
pub const MAX_LEVEL_KB: u32 = 16 * 1024;
/// Upper bound for all levels together.
pub const MAX_TOTAL_KB: u32 = 32 * 1024;
/// Bit of [`MsgCounter::last_tsc`] that disables a message id.
pub const OFF_BIT: u32 = 0x8000_0000;
/// Minimum monotonic distance between the two calibration samples.
pub const CALIBRATION_SECS: f64 = 0.1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TraceFileHeader {
    pub version: u32,
    /// Mapped size: header, counters and ring buffers. Excludes the trailer.
    pub file_size: u32,
    /// Header plus counter table; the first ring buffer starts here.
    pub header_size: u32,
    pub trailer_size: u32,
    pub first_msg_offset: u32,
    pub log_count: u32,
    pub tsc0: u64,
    pub monotime0: f64,
    pub tsc1: u64,
    pub monotime1: f64,
    pub utc1: f64,
    /// Per-level sizes in KB.
    pub log_sizes: [u32; NUM_LEVELS],
}

const _: () = assert!(size_of::<TraceFileHeader>() == 104);

impl TraceFileHeader {
    pub const SIZE: usize = size_of::<TraceFileHeader>();

    /// Header for a freshly created file. Calibration fields start at zero.
    pub fn new(sizes: &SizeSpec, num_counters: u32) -> Self {
        let header_size = Self::SIZE as u32 + num_counters * MsgCounter::SIZE as u32;
        Self {
            version: FILE_VERSION,
            file_size: header_size + sizes.total_kb() * 1024,
            header_size,
            trailer_size: FILE_TRAILER_SIZE,
            first_msg_offset: Self::SIZE as u32,
            log_count: NUM_LEVELS as u32,
            log_sizes: sizes.kb,
            ..Default::default()
        }
    }

    /// Snapshot of the header at the start of `region`.
    pub fn load(region: &RawRegion) -> Self {
        let mut bytes = [0u8; Self::SIZE];
        region.read_into(0, &mut bytes);
        unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }

    pub fn store(&self, region: &RawRegion) {
        let bytes = unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE)
        };
        region.write(0, bytes);
    }

    /// Writes the running calibration sample only. `monotime1` goes last as
    /// readers gate on it.
    pub fn store_sample1(region: &RawRegion, tsc: u64, monotime: f64, utc: f64) {
        region.store_u64(offset_of!(TraceFileHeader, tsc1), tsc);
        region.store_f64(offset_of!(TraceFileHeader, utc1), utc);
        region.store_f64(offset_of!(TraceFileHeader, monotime1), monotime);
    }

    pub fn store_sample0(region: &RawRegion, tsc: u64, monotime: f64) {
        region.store_u64(offset_of!(TraceFileHeader, tsc0), tsc);
        region.store_f64(offset_of!(TraceFileHeader, monotime0), monotime);
    }

    pub fn load_tsc1(region: &RawRegion) -> u64 {
        region.load_u64(offset_of!(TraceFileHeader, tsc1))
    }

    /// Readers must not trust anything else until this holds.
    pub fn is_calibrated(&self) -> bool {
        self.monotime1 - self.monotime0 >= CALIBRATION_SECS
    }

    pub fn dictionary_offset(&self) -> u64 {
        self.file_size as u64 + self.trailer_size as u64
    }

    /// Byte range `(offset, len)` of ring buffer `level`.
    pub fn level_range(&self, level: usize) -> (usize, usize) {
        let before: usize = self.log_sizes[..level].iter().map(|kb| *kb as usize * 1024).sum();
        (self.header_size as usize + before, self.log_sizes[level] as usize * 1024)
    }

    /// Checks that the declared layout fits in `mapped_len` bytes.
    pub fn fits(&self, mapped_len: usize) -> bool {
        let levels = (self.log_count as usize).min(NUM_LEVELS);
        if self.log_count as usize > NUM_LEVELS || levels == 0 {
            return false;
        }
        let (off, len) = self.level_range(levels - 1);
        self.header_size as usize >= Self::SIZE && off + len <= mapped_len
    }
}

/// Per message-id statistics row.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgCounter {
    pub count: u32,
    /// Bits 28..59 of the last timestamp; bit 31 is the off bit.
    pub last_tsc: u32,
    pub tsc_count: u64,
    pub tsc_self_count: u64,
}

const _: () = assert!(size_of::<MsgCounter>() == 24);

impl MsgCounter {
    pub const SIZE: usize = size_of::<MsgCounter>();

    pub fn is_disabled(&self) -> bool {
        self.last_tsc & OFF_BIT != 0
    }
}

/// Direct-mapped table of [`MsgCounter`] rows indexed by `id % len`.
///
/// Collisions are tolerated: the table only carries statistics and the off
/// bit, never anything structural.
#[derive(Clone, Copy, Debug)]
pub struct CounterTable {
    region: RawRegion,
    len: u32,
}

impl CounterTable {
    pub fn new(region: RawRegion, len: u32) -> Self {
        Self { region, len: len.max(1) }
    }

    pub fn rows(&self) -> u32 {
        self.len
    }

    #[inline(always)]
    pub(crate) fn row_offset(&self, id: u32) -> usize {
        (id % self.len) as usize * MsgCounter::SIZE
    }

    pub fn get(&self, id: u32) -> MsgCounter {
        let at = self.row_offset(id);
        MsgCounter {
            count: self.region.load_u32(at + offset_of!(MsgCounter, count)),
            last_tsc: self.load_last_tsc(at),
            tsc_count: self.region.load_u64(at + offset_of!(MsgCounter, tsc_count)),
            tsc_self_count: self.region.load_u64(at + offset_of!(MsgCounter, tsc_self_count)),
        }
    }

    pub fn is_disabled(&self, id: u32) -> bool {
        self.load_last_tsc(self.row_offset(id)) & OFF_BIT != 0
    }

    /// Toggles the off bit. The writer keeps updating the row either way.
    pub fn set_disabled(&self, id: u32, off: bool) {
        let at = self.row_offset(id) + offset_of!(MsgCounter, last_tsc);
        match self.atomic(at) {
            Some(cell) if off => {
                cell.fetch_or(OFF_BIT, Ordering::Relaxed);
            }
            Some(cell) => {
                cell.fetch_and(!OFF_BIT, Ordering::Relaxed);
            }
            None => {
                let v = self.region.load_u32(at);
                self.region.store_u32(at, if off { v | OFF_BIT } else { v & !OFF_BIT });
            }
        }
    }

    /// Zeroes the statistics of every row, preserving off bits.
    pub fn clear(&self) {
        for i in 0..self.len {
            let at = self.row_offset(i);
            let off = self.load_last_tsc(at) & OFF_BIT;
            self.region.store_u32(at, 0);
            self.region.store_u32(at + offset_of!(MsgCounter, last_tsc), off);
            self.region.store_u64(at + offset_of!(MsgCounter, tsc_count), 0);
            self.region.store_u64(at + offset_of!(MsgCounter, tsc_self_count), 0);
        }
    }

    /// Records one hit at `tsc`, keeping whatever off bit is set. Returns
    /// true if the id is enabled.
    #[inline(always)]
    pub(crate) fn hit(&self, id: u32, tsc: u64) -> bool {
        let at = self.row_offset(id);
        let last_at = at + offset_of!(MsgCounter, last_tsc);
        let off = self.load_last_tsc(at) & OFF_BIT;
        let stamp = ((tsc >> 28) as u32 & !OFF_BIT) | off;
        match self.atomic(last_at) {
            Some(cell) => cell.store(stamp, Ordering::Relaxed),
            None => self.region.store_u32(last_at, stamp),
        }
        self.region.store_u32(at, self.region.load_u32(at).wrapping_add(1));
        off == 0
    }

    #[inline(always)]
    pub(crate) fn add_cycles(&self, id: u32, cycles: u64, self_cycles: Option<u64>, count: bool) {
        let at = self.row_offset(id);
        let total = at + offset_of!(MsgCounter, tsc_count);
        self.region.store_u64(total, self.region.load_u64(total).wrapping_add(cycles));
        if let Some(own) = self_cycles {
            let mine = at + offset_of!(MsgCounter, tsc_self_count);
            self.region.store_u64(mine, self.region.load_u64(mine).wrapping_add(own));
        }
        if count {
            self.region.store_u32(at, self.region.load_u32(at).wrapping_add(1));
        }
    }

    pub(crate) fn prefetch(&self, id: u32) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
            _mm_prefetch::<_MM_HINT_T0>(self.region.addr(self.row_offset(id)) as *const i8);
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = id;
    }

    #[inline(always)]
    fn load_last_tsc(&self, row: usize) -> u32 {
        let at = row + offset_of!(MsgCounter, last_tsc);
        match self.atomic(at) {
            Some(cell) => cell.load(Ordering::Relaxed),
            None => self.region.load_u32(at),
        }
    }

    #[inline(always)]
    fn atomic(&self, at: usize) -> Option<&AtomicU32> {
        let p = self.region.addr(at);
        if at + 4 <= self.region.len() && (p as usize) % std::mem::align_of::<AtomicU32>() == 0 {
            Some(unsafe { AtomicU32::from_ptr(p as *mut u32) })
        } else {
            None
        }
    }
}

/// Per-level ring buffer sizes in KB.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SizeSpec {
    pub kb: [u32; NUM_LEVELS],
}

impl Default for SizeSpec {
    fn default() -> Self {
        Self { kb: [DEFAULT_LEVEL_KB; NUM_LEVELS] }
    }
}

impl SizeSpec {
    pub fn new(kb: [u32; NUM_LEVELS]) -> Self {
        Self { kb }
    }

    pub fn uniform(kb: u32) -> Self {
        Self { kb: [kb; NUM_LEVELS] }
    }

    /// Parses `"8,8,16,..."` (commas and/or spaces). Missing levels keep the
    /// default; unparsable tokens count as zero and are raised to 1 KB by
    /// [`SizeSpec::limited`].
    pub fn parse(spec: &str) -> Self {
        let mut kb = [DEFAULT_LEVEL_KB; NUM_LEVELS];
        let tokens = spec.split([',', ' ']).filter(|t| !t.is_empty());
        for (slot, token) in kb.iter_mut().zip(tokens) {
            *slot = token.trim().parse().unwrap_or(0);
        }
        Self { kb }
    }

    pub fn total_kb(&self) -> u32 {
        self.kb.iter().sum()
    }

    /// Raises empty levels to 1 KB, caps every level at [`MAX_LEVEL_KB`] and
    /// scales all levels down by the same factor when the total exceeds
    /// [`MAX_TOTAL_KB`].
    pub fn limited(mut self) -> Self {
        for kb in self.kb.iter_mut() {
            *kb = (*kb).clamp(1, MAX_LEVEL_KB);
        }
        let total = self.total_kb();
        if total > MAX_TOTAL_KB {
            let factor = MAX_TOTAL_KB as f64 / total as f64;
            for kb in self.kb.iter_mut() {
                *kb = ((*kb as f64 * factor) as u32).max(1);
            }
        }
        self
    }

    /// Like [`SizeSpec::limited`] but without the caps; only empty levels
    /// are raised. Used for explicit resizes.
    pub fn unlimited(mut self) -> Self {
        for kb in self.kb.iter_mut() {
            *kb = (*kb).max(1);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapArena;

    #[test]
    fn test_header_field_offsets() {
        assert_eq!(offset_of!(TraceFileHeader, tsc0), 24);
        assert_eq!(offset_of!(TraceFileHeader, monotime0), 32);
        assert_eq!(offset_of!(TraceFileHeader, tsc1), 40);
        assert_eq!(offset_of!(TraceFileHeader, utc1), 56);
        assert_eq!(offset_of!(TraceFileHeader, log_sizes), 64);
    }

    #[test]
    fn test_header_store_load() {
        let arena = HeapArena::new(TraceFileHeader::SIZE).unwrap();
        let spec = SizeSpec::parse("1,2,3");
        let header = TraceFileHeader::new(&spec, 512);
        header.store(&arena.region());
        TraceFileHeader::store_sample1(&arena.region(), 77, 1.5, 2.5);
        let loaded = TraceFileHeader::load(&arena.region());
        assert_eq!(loaded.log_sizes[..4], [1, 2, 3, 8]);
        assert_eq!(loaded.header_size, 104 + 512 * 24);
        assert_eq!(loaded.tsc1, 77);
        assert_eq!(loaded.level_range(1), (104 + 512 * 24 + 1024, 2048));
        assert_eq!(loaded.dictionary_offset(), loaded.file_size as u64 + 1024);
    }

    #[test]
    fn test_size_spec_limits() {
        let spec = SizeSpec::parse("0, 20000, 8").limited();
        assert_eq!(spec.kb[0], 1);
        assert_eq!(spec.kb[1], MAX_LEVEL_KB);
        assert_eq!(spec.kb[2], 8);

        let big = SizeSpec::uniform(16 * 1024).limited();
        assert!(big.total_kb() <= MAX_TOTAL_KB);
        assert!(big.kb.iter().all(|kb| *kb >= 1));
    }

    #[test]
    fn test_off_bit_survives_hits() {
        let arena = HeapArena::new(MsgCounter::SIZE * 4).unwrap();
        let table = CounterTable::new(arena.region(), 4);
        assert!(table.hit(6, 1 << 40));
        table.set_disabled(6, true);
        assert!(!table.hit(6, 2 << 40));
        assert!(table.is_disabled(2), "rows are shared modulo the table size");
        let row = table.get(6);
        assert_eq!(row.count, 2);
        assert!(row.is_disabled());
        table.set_disabled(6, false);
        assert!(table.hit(6, 3 << 40));
        table.clear();
        assert_eq!(table.get(6).count, 0);
    }
}
