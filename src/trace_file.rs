//! One memory-mapped trace file and its ten ring buffers.
//!
//! A `TraceFile` belongs to exactly one writer identity. Its hot path takes
//! `&mut self` and never locks or performs blocking I/O; the only I/O after
//! creation is appending a dictionary entry the first time a call site runs
//! in this file, and the optional whole-file copy on wrap.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

use crate::clock;
use crate::error::TraceError;
use crate::handle::Lease;
use crate::layout::{
    CounterTable, MsgCounter, SizeSpec, TraceFileHeader, DEFAULT_NUM_COUNTERS, NUM_LEVELS,
};
use crate::profile::{ProfileGuard, ProfileKind};
use crate::region::RawRegion;
use crate::registry;
use crate::ring_buf::{RingBuf, Ticket, DEFAULT_MAX_STRING_LEN, MAX_STRING_LEN};
use crate::rotate::{self, RotationPolicy};
use crate::site::MsgSite;
use crate::traceable::{TraceArgs, Traceable};

const PAGE_SIZE: u64 = 4096;
/// Cycles between two refreshes of the running calibration sample.
const CALIBRATION_INTERVAL: u64 = 1_000_000;

/// Copy the whole file to `<path>.<n>` every time a level wraps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeverLog {
    pub path: PathBuf,
    pub first_index: u32,
}

#[derive(Clone, Debug)]
pub struct FileOptions {
    pub sizes: SizeSpec,
    pub num_counters: u32,
    pub max_string_len: usize,
    pub rotate: bool,
    pub compress_rotated: bool,
    pub rotation: RotationPolicy,
    pub forever_log: Option<ForeverLog>,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            sizes: SizeSpec::default(),
            num_counters: DEFAULT_NUM_COUNTERS,
            max_string_len: DEFAULT_MAX_STRING_LEN,
            rotate: true,
            compress_rotated: false,
            rotation: RotationPolicy::Shift,
            forever_log: None,
        }
    }
}

pub struct TraceFile {
    path: PathBuf,
    file: File,
    map: Arc<MmapMut>,
    region: RawRegion,
    counters: CounterTable,
    levels: Vec<RingBuf>,
    options: FileOptions,
    dict_end: u64,
    registered: Vec<u64>,
    calibrated_at: u64,
    forever_index: u32,
    fault_logged: bool,
    pub(crate) lease: Option<Lease>,
}

impl TraceFile {
    /// Creates (after rotating any previous generations) and maps a trace
    /// file at `path`, then calibrates it. Takes at least 0.1 s.
    pub fn create(path: impl AsRef<Path>, options: &FileOptions) -> Result<Self, TraceError> {
        let path = path.as_ref().to_path_buf();
        if options.max_string_len > MAX_STRING_LEN {
            return Err(TraceError::InvalidConfig(format!(
                "max string length {} exceeds {}",
                options.max_string_len, MAX_STRING_LEN
            )));
        }
        if options.rotate {
            rotate::rotate(&path, options.rotation, options.compress_rotated)
                .map_err(|e| TraceError::io(&path, e))?;
        }

        let num_counters = options.num_counters.max(1);
        let header = TraceFileHeader::new(&options.sizes, num_counters);
        let real_size = header.dictionary_offset();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666)
            .open(&path)
            .map_err(|e| TraceError::io(&path, e))?;
        file.set_len(real_size).map_err(|e| TraceError::io(&path, e))?;
        if let Err(e) = touch_pages(&file, real_size) {
            let _ = fs::remove_file(&path);
            return Err(match e.raw_os_error() {
                Some(libc::ENOSPC) | Some(libc::EDQUOT) => TraceError::FilesystemFull(path),
                _ => TraceError::io(path, e),
            });
        }

        let mut mmap = unsafe { MmapOptions::new().len(real_size as usize).map_mut(&file) }
            .map_err(|e| TraceError::io(&path, e))?;
        mmap.fill(0);
        let region = unsafe { RawRegion::from_raw_parts(mmap.as_mut_ptr(), mmap.len()) };
        let map = Arc::new(mmap);

        header.store(&region);
        let counters = CounterTable::new(
            region.sub(TraceFileHeader::SIZE, num_counters as usize * MsgCounter::SIZE),
            num_counters,
        );
        let levels = (0..NUM_LEVELS)
            .map(|level| {
                let (offset, len) = header.level_range(level);
                RingBuf::new(region.sub(offset, len), counters, options.max_string_len)
            })
            .collect();

        let mut tf = Self {
            path,
            file,
            map,
            region,
            counters,
            levels,
            dict_end: real_size,
            registered: Vec::new(),
            calibrated_at: 0,
            forever_index: options.forever_log.as_ref().map_or(0, |f| f.first_index),
            fault_logged: false,
            options: options.clone(),
            lease: None,
        };
        tf.calibrate();
        debug!(path = %tf.path.display(), size = real_size, "created trace file");
        Ok(tf)
    }

    fn calibrate(&mut self) {
        let tsc0 = clock::tsc();
        let mono0 = clock::monotime();
        TraceFileHeader::store_sample0(&self.region, tsc0, mono0);
        TraceFileHeader::store_sample1(&self.region, tsc0, mono0, clock::utc_now());
        self.calibrated_at = tsc0;
        loop {
            thread::sleep(Duration::from_millis(1));
            self.take_timestamp(clock::tsc());
            if TraceFileHeader::load(&self.region).is_calibrated() {
                break;
            }
        }
    }

    /// Refreshes the running calibration sample, at most once per
    /// [`CALIBRATION_INTERVAL`] cycles.
    fn take_timestamp(&mut self, tsc: u64) {
        if tsc.wrapping_sub(self.calibrated_at) > CALIBRATION_INTERVAL {
            TraceFileHeader::store_sample1(&self.region, tsc, clock::monotime(), clock::utc_now());
            self.calibrated_at = tsc;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> TraceFileHeader {
        TraceFileHeader::load(&self.region)
    }

    pub fn sizes(&self) -> SizeSpec {
        self.options.sizes
    }

    pub fn options(&self) -> &FileOptions {
        &self.options
    }

    pub fn counters(&self) -> CounterTable {
        self.counters
    }

    /// True once the owning handle was closed; tracing then does nothing.
    pub fn is_closed(&self) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_closed())
    }

    fn is_registered(&self, id: u32) -> bool {
        self.registered
            .get(id as usize / 64)
            .is_some_and(|w| w & (1 << (id % 64)) != 0)
    }

    fn mark_registered(&mut self, id: u32) {
        let word = id as usize / 64;
        if self.registered.len() <= word {
            self.registered.resize(word + 1, 0);
        }
        self.registered[word] |= 1 << (id % 64);
    }

    /// Id of `site`, appending its dictionary entry to this file first if
    /// this is the site's first message here.
    #[inline]
    pub fn register_with(&mut self, site: &MsgSite, type_key: impl FnOnce() -> String) -> u32 {
        let id = site.id();
        if !self.is_registered(id) {
            self.write_dictionary_entry(id, site, &type_key());
        }
        id
    }

    pub fn register(&mut self, site: &MsgSite, type_key: &str) -> u32 {
        self.register_with(site, || type_key.to_string())
    }

    #[cold]
    fn write_dictionary_entry(&mut self, id: u32, site: &MsgSite, type_key: &str) {
        self.mark_registered(id);
        let file = site.file.replace(char::is_whitespace, "_");
        let entry = registry::encode_entry(clock::tsc(), &file, site.line, id, site.template, type_key);
        match self.file.write_all_at(&entry, self.dict_end) {
            Ok(()) => self.dict_end += entry.len() as u64,
            Err(e) => self.fault("dictionary write failed", &e),
        }
    }

    fn fault(&mut self, what: &str, err: &io::Error) {
        if !self.fault_logged {
            warn!(path = %self.path.display(), error = %err, "{}; further faults are not logged", what);
            self.fault_logged = true;
        }
    }

    fn on_wrap(&mut self, tsc: u64) {
        self.take_timestamp(tsc);
        let Some(forever) = self.options.forever_log.as_ref() else { return };
        let target = rotate::generation(&forever.path, self.forever_index);
        self.forever_index += 1;
        if let Err(e) = fs::copy(&self.path, &target) {
            self.fault("forever log copy failed", &e);
        }
    }

    /// Traces one message with `args` at `level`. Never fails; returns the
    /// ticket of the attempt when the file is open and the level exists.
    #[inline]
    pub fn trace<A: TraceArgs>(&mut self, site: &MsgSite, level: usize, args: &A) -> Option<Ticket> {
        if level >= NUM_LEVELS || self.is_closed() {
            return None;
        }
        let id = self.register_with(site, || args.type_key());
        let ticket = self.levels[level].start(id);
        if ticket.wrapped {
            self.on_wrap(ticket.tsc);
        }
        if ticket.on {
            let rb = &mut self.levels[level];
            args.put_all(rb);
            rb.end();
        }
        Some(ticket)
    }

    /// Opens a message for an id obtained from [`TraceFile::register`].
    pub fn start(&mut self, level: usize, id: u32) -> Option<MsgWriter<'_>> {
        if level >= NUM_LEVELS || self.is_closed() {
            return None;
        }
        let ticket = self.levels[level].start(id);
        if ticket.wrapped {
            self.on_wrap(ticket.tsc);
        }
        Some(MsgWriter { rb: &mut self.levels[level], ticket })
    }

    /// Starts a cycle timer for `site` that is added to its counter row
    /// when the guard drops.
    pub fn profile(&mut self, site: &MsgSite, self_time: bool) -> Option<ProfileGuard> {
        if self.is_closed() {
            return None;
        }
        let id = self.register_with(site, String::new);
        let kind = if self_time { ProfileKind::SelfTime } else { ProfileKind::Block };
        Some(ProfileGuard::new(self.counters, Arc::clone(&self.map), id, clock::tsc(), kind))
    }

    /// Traces a message and times the rest of the scope against its row.
    pub fn trace_profiled<A: TraceArgs>(
        &mut self,
        site: &MsgSite,
        level: usize,
        args: &A,
    ) -> Option<ProfileGuard> {
        let ticket = self.trace(site, level, args)?;
        let id = site.id();
        Some(ProfileGuard::new(self.counters, Arc::clone(&self.map), id, ticket.tsc, ProfileKind::Message))
    }

    /// Recreates the file with new level sizes. Existing generations are
    /// rotated and every call site is registered afresh.
    pub(crate) fn recreate(&mut self, sizes: SizeSpec) -> Result<(), TraceError> {
        let mut options = self.options.clone();
        options.sizes = sizes;
        options.rotate = true;
        let mut fresh = TraceFile::create(&self.path, &options)?;
        fresh.lease = self.lease.take();
        *self = fresh;
        Ok(())
    }

    /// Replaces the level sizes. Returns `Ok(false)` when `sizes` equals the
    /// current layout and refuses while the owning handle has files open for
    /// other identities.
    pub fn resize(&mut self, sizes: SizeSpec) -> Result<bool, TraceError> {
        if let Some(lease) = &self.lease {
            let others = lease.open_files().saturating_sub(1);
            if others > 0 {
                return Err(TraceError::ResizeBusy(others));
            }
        }
        let sizes = sizes.unlimited();
        if sizes == self.options.sizes {
            return Ok(false);
        }
        self.recreate(sizes)?;
        if let Some(lease) = &self.lease {
            lease.set_sizes(sizes);
        }
        Ok(true)
    }
}

/// An open message. Values are appended with [`MsgWriter::put`]; nothing is
/// visible to readers before [`MsgWriter::end`].
pub struct MsgWriter<'a> {
    rb: &'a mut RingBuf,
    pub ticket: Ticket,
}

impl MsgWriter<'_> {
    pub fn put<T: Traceable + ?Sized>(&mut self, value: &T) -> &mut Self {
        self.rb.put(value);
        self
    }

    pub fn append(&mut self, bytes: &[u8]) -> &mut Self {
        self.rb.append(bytes);
        self
    }

    pub fn end(self) {
        self.rb.end();
    }
}

/// Writes one byte into every page so a full filesystem fails here rather
/// than as a fault on a later store through the mapping.
fn touch_pages(file: &File, size: u64) -> io::Result<()> {
    let mut offset = 0;
    while offset < size {
        file.write_all_at(&[0], offset)?;
        offset += PAGE_SIZE;
    }
    file.write_all_at(&[0], size - 1)?;
    file.sync_data()
}
