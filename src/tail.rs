//! Printing trace files: the per-file state machine and the two drivers.
//!
//! [`FileTail`] owns one mapped file, its dictionary and one decoder per
//! level and always knows which level holds its oldest unread message.
//! [`CatControl`] merges existing messages of several files once;
//! [`TailControl`] follows live writers across restarts and deletions.
//!
//! ```text
//!  (start) REINIT_READY ──▶ INITIALIZING ──(calibrated)──▶ ACTIVE
//!              ▲                                          │      │
//!              │ modify                            create │      │ delete
//!              │                                          ▼      ▼
//!              └──────────────── REINIT_PENDING ◀──create── DELETE_PENDING
//! ```

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use memmap2::Mmap;
use tracing::{debug, error, warn};

use crate::clock::{self, TimestampFormatter};
use crate::decoder::{Pending, ReadMode, RingDecoder};
use crate::error::{Corruption, ReadError};
use crate::format::{MessageFormatter, ParamTable};
use crate::layout::{TraceFileHeader, FILE_VERSION, NUM_LEVELS, OLDEST_READABLE_VERSION};
use crate::region::RawRegion;
use crate::registry::{DictionaryRegistry, MessageRegistry};
use crate::watch::{DirWatcher, FsEvent, Wait};

/// Longest stretch of output without looking at notifications.
const CHECK_INTERVAL: Duration = Duration::from_secs(1);
const POLL_MS: u16 = 1;

/// Set of levels to print.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelMask(u16);

impl Default for LevelMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl LevelMask {
    pub const ALL: LevelMask = LevelMask((1 << NUM_LEVELS) - 1);

    pub fn empty() -> Self {
        LevelMask(0)
    }

    pub fn contains(&self, level: usize) -> bool {
        level < NUM_LEVELS && self.0 & (1 << level) != 0
    }

    pub fn insert(&mut self, level: usize) {
        if level < NUM_LEVELS {
            self.0 |= 1 << level;
        }
    }
}

impl FromStr for LevelMask {
    type Err = String;

    /// `"0,2-4"`: single levels and inclusive ranges.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = |t: &str| match t.trim().parse::<usize>() {
            Ok(l) if l < NUM_LEVELS => Ok(l),
            _ => Err(format!("invalid log level, must be 0..{}", NUM_LEVELS - 1)),
        };
        let mut mask = LevelMask::empty();
        for part in s.split(',') {
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (level(lo)?, level(hi)?),
                None => {
                    let l = level(part)?;
                    (l, l)
                }
            };
            if lo > hi {
                return Err("start log level must be less than end log level".to_string());
            }
            (lo..=hi).for_each(|l| mask.insert(l));
        }
        Ok(mask)
    }
}

/// What goes into each output line.
#[derive(Clone, Debug, Default)]
pub struct OutputOptions {
    pub levels: LevelMask,
    /// `<file>:<line>` of the call site.
    pub file_line: bool,
    /// Raw cycle counter of each message.
    pub tsc: bool,
    /// Only line-0 messages, stamped with their embedded wall clock.
    pub wall_clock: bool,
    /// `--- opened`/`re-opened`/`deleted` notes on stderr.
    pub events: bool,
    /// Short file name in every line; set automatically for several files.
    pub file_name: bool,
    /// The timestamp the merge ordered by, for debugging the merge itself.
    pub debug: bool,
}

/// Writes message lines and corruption reports.
pub struct Emitter<W: Write> {
    out: W,
    line: String,
    last_printed_tsc: u64,
    options: OutputOptions,
}

impl<W: Write> Emitter<W> {
    pub fn new(out: W, options: OutputOptions) -> Self {
        Self { out, line: String::with_capacity(256), last_printed_tsc: 0, options }
    }

    pub fn options(&self) -> &OutputOptions {
        &self.options
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    /// Prints one message. Returns false, printing nothing, if the payload
    /// does not render.
    #[allow(clippy::too_many_arguments)]
    fn message(
        &mut self,
        timestamps: &mut TimestampFormatter,
        name: &str,
        level: usize,
        order_tsc: u64,
        pending: &Pending,
        formatter: &MessageFormatter,
    ) -> io::Result<bool> {
        let opts = &self.options;
        if opts.wall_clock && formatter.line() != 0 {
            return Ok(true);
        }
        let line = &mut self.line;
        line.clear();
        match formatter.wall_clock(pending.payload()).filter(|_| opts.wall_clock) {
            Some((sec, usec)) => timestamps.format_wall_clock(sec, usec, line),
            None => timestamps.format(pending.tsc, line),
        }
        let _ = write!(line, " {}", level);
        if opts.debug {
            let _ = write!(line, " 0x{:016x}", order_tsc);
        }
        if opts.tsc {
            let _ = write!(line, " 0x{:016x}", pending.tsc);
        }
        if opts.file_name {
            let _ = write!(line, " {}", name);
        }
        let _ = write!(line, " +{} ", pending.tsc.wrapping_sub(self.last_printed_tsc));
        if opts.file_line {
            let _ = write!(line, "{}:{} ", formatter.file(), formatter.line());
        }
        line.push('"');
        match formatter.render(pending.payload(), line) {
            Some(n) if n == pending.len => {}
            _ => return Ok(false),
        }
        line.push_str("\"\n");
        self.out.write_all(self.line.as_bytes())?;
        self.last_printed_tsc = pending.tsc;
        Ok(true)
    }

    fn corruption(
        &mut self,
        path: &Path,
        level: usize,
        corruption: &Corruption,
        formatter: Option<&MessageFormatter>,
    ) -> io::Result<()> {
        writeln!(self.out, "---------- corruption detected in {}", path.display())?;
        writeln!(self.out, "log level: {}", level)?;
        if let Some(f) = formatter {
            writeln!(self.out, "message id: {}", f.id())?;
            writeln!(self.out, "message: {}", f.template())?;
            writeln!(self.out, "format: {}", f.type_key())?;
        }
        writeln!(self.out, "reason: {}", corruption)
    }

    fn note(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        writeln!(self.out, "---------- {}", args)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailStatus {
    /// Mapped, waiting for the header to be calibrated.
    Initializing,
    Active,
    /// Deleted; drain what is left, then drop the mapping.
    DeletePending,
    /// Created again; drain the old mapping and wait for the new header.
    ReinitPending,
    /// The new file has been written to; remap once the old one is drained.
    ReinitReady,
}

struct Mapping {
    file: File,
    _map: Mmap,
    region: RawRegion,
}

/// One trace file being printed.
pub struct FileTail {
    path: PathBuf,
    name: String,
    mode: ReadMode,
    status: TailStatus,
    levels: LevelMask,
    events: bool,
    table: ParamTable,
    mapping: Option<Mapping>,
    registry: Option<DictionaryRegistry>,
    decoders: Vec<RingDecoder>,
    /// Oldest unread `(tsc, level)`, valid until a message is consumed.
    next: Option<(u64, usize)>,
    tsc1: u64,
    timestamps: TimestampFormatter,
    aborted: bool,
}

impl FileTail {
    /// Opens `path`. A file that is not calibrated yet is accepted and
    /// initialized later. With `skip_to_end`, only messages written from
    /// now on are printed; otherwise everything still in the levels.
    pub fn open(
        path: impl Into<PathBuf>,
        mode: ReadMode,
        skip_to_end: bool,
        options: &OutputOptions,
    ) -> Result<Self, ReadError> {
        Self::with_table(path, mode, skip_to_end, options, ParamTable::new())
    }

    /// Like [`FileTail::open`], with extra parameter codecs.
    pub fn with_table(
        path: impl Into<PathBuf>,
        mode: ReadMode,
        skip_to_end: bool,
        options: &OutputOptions,
        table: ParamTable,
    ) -> Result<Self, ReadError> {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mut tail = Self {
            path,
            name,
            mode,
            status: TailStatus::ReinitReady,
            levels: options.levels,
            events: options.events,
            table,
            mapping: None,
            registry: None,
            decoders: Vec::new(),
            next: None,
            tsc1: 0,
            timestamps: TimestampFormatter::default(),
            aborted: false,
        };
        tail.initialize(true, skip_to_end)?;
        Ok(tail)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name without directories.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TailStatus {
        self.status
    }

    /// True after corruption ended a one-shot dump of this file, or after a
    /// fatal error while following it.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn header(&self) -> Option<TraceFileHeader> {
        self.mapping.as_ref().map(|m| TraceFileHeader::load(&m.region))
    }

    /// Applies a state change, following the transitions allowed from the
    /// current state.
    pub fn transition(&mut self, status: TailStatus) {
        if status == self.status {
            return;
        }
        match status {
            TailStatus::Initializing | TailStatus::Active => {}
            TailStatus::DeletePending | TailStatus::ReinitPending => {
                if status == TailStatus::DeletePending && self.events {
                    eprintln!("--- deleted {}", self.path.display());
                }
                // Nothing was printed from this mapping yet.
                if self.status == TailStatus::Initializing {
                    self.cleanup();
                }
            }
            TailStatus::ReinitReady => {
                if self.status != TailStatus::ReinitPending {
                    return;
                }
            }
        }
        debug!(file = %self.name, from = ?self.status, to = ?status, "tail status");
        self.status = status;
    }

    /// Drops the mapping and all decoding state.
    pub fn cleanup(&mut self) {
        self.next = None;
        self.decoders.clear();
        self.registry = None;
        self.mapping = None;
    }

    /// Stops reading this file for good.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.cleanup();
    }

    /// Maps the file and positions the decoders. `Ok(false)` while the
    /// file is not ready; an `initial` open reports every failure.
    fn initialize(&mut self, initial: bool, skip_to_end: bool) -> Result<bool, ReadError> {
        self.transition(TailStatus::Initializing);
        if self.mapping.is_none() {
            match self.map_file() {
                Ok(mapping) => self.mapping = Some(mapping),
                Err(e) if initial => return Err(e),
                Err(e) => {
                    debug!(file = %self.name, error = %e, "not ready to re-open");
                    return Ok(false);
                }
            }
            if self.events {
                let again = if initial { "" } else { "re-" };
                eprintln!("--- {}opened {}", again, self.path.display());
            }
        }
        let Some(mapping) = self.mapping.as_ref() else { return Ok(false) };
        let region = mapping.region;
        let header = TraceFileHeader::load(&region);
        if !header.is_calibrated() {
            return Ok(false);
        }
        if header.version < OLDEST_READABLE_VERSION {
            return Err(ReadError::UnsupportedVersion {
                path: self.path.clone(),
                version: header.version,
                oldest: OLDEST_READABLE_VERSION,
            });
        }
        if header.version > FILE_VERSION {
            warn!(
                path = %self.path.display(),
                version = header.version,
                "file is newer than this reader, output may be incorrect"
            );
        }
        if !header.fits(region.len()) {
            return Err(ReadError::BadLayout(self.path.clone()));
        }

        let open_err = |source| ReadError::Open { path: self.path.clone(), source };
        let file = mapping.file.try_clone().map_err(open_err)?;
        let mut registry = DictionaryRegistry::from_file(
            file,
            header.version,
            header.dictionary_offset(),
            self.table.clone(),
        )
        .map_err(open_err)?;

        let mut decoders: Vec<RingDecoder> = (0..header.log_count as usize)
            .map(|level| {
                let (offset, len) = header.level_range(level);
                RingDecoder::new(region.sub(offset, len), level, self.mode)
            })
            .collect();
        for decoder in decoders.iter_mut().filter(|d| self.levels.contains(d.level())) {
            if skip_to_end {
                decoder.fast_forward(&mut registry);
            } else if !decoder.rewind(&mut registry) {
                return Err(ReadError::ChangedWhileReading(self.path.clone()));
            }
        }

        self.registry = Some(registry);
        self.decoders = decoders;
        self.next = None;
        self.tsc1 = header.tsc1;
        self.timestamps = TimestampFormatter::new(&header);
        self.transition(TailStatus::Active);
        Ok(true)
    }

    fn map_file(&self) -> Result<Mapping, ReadError> {
        let open_err = |source| ReadError::Open { path: self.path.clone(), source };
        let file = File::open(&self.path).map_err(open_err)?;
        if file.metadata().map_err(open_err)?.len() == 0 {
            return Err(ReadError::Empty(self.path.clone()));
        }
        // SAFETY: the mapping is only read through `RawRegion`, which
        // tolerates concurrent writers.
        let map = unsafe { Mmap::map(&file) }.map_err(open_err)?;
        let region = unsafe { RawRegion::from_raw_parts(map.as_ptr() as *mut u8, map.len()) };
        Ok(Mapping { file, _map: map, region })
    }

    /// The level holding the oldest unread message and its timestamp.
    pub fn next_tsc(&mut self) -> Result<Option<(u64, usize)>, ReadError> {
        if self.aborted {
            return Ok(None);
        }
        if self.next.is_some() {
            return Ok(self.next);
        }
        if self.status == TailStatus::Initializing && !self.initialize(false, false)? {
            return Ok(None);
        }
        if self.mapping.is_none()
            && (self.status != TailStatus::ReinitReady || !self.initialize(false, false)?)
        {
            return Ok(None);
        }

        // A timestamp read while it is being written can look smaller than
        // it is; repeat until two rounds agree.
        let mut previous = None;
        let next = loop {
            let mut best: Option<(u64, usize)> = None;
            for decoder in self.decoders.iter().filter(|d| self.levels.contains(d.level())) {
                let tsc = decoder.next_tsc();
                if tsc != 0 && best.map_or(true, |(min, _)| tsc < min) {
                    best = Some((tsc, decoder.level()));
                }
            }
            let min = best.map(|(tsc, _)| tsc);
            if previous == Some(min) {
                break best;
            }
            previous = Some(min);
        };
        self.next = next;

        if next.is_none() {
            match self.status {
                TailStatus::DeletePending | TailStatus::ReinitPending | TailStatus::ReinitReady => {
                    self.cleanup()
                }
                _ => self.refresh_calibration(),
            }
        }
        Ok(next)
    }

    /// Writers refresh their second calibration sample on every wrap.
    fn refresh_calibration(&mut self) {
        let Some(mapping) = self.mapping.as_ref() else { return };
        let tsc1 = TraceFileHeader::load_tsc1(&mapping.region);
        if tsc1 != self.tsc1 {
            self.tsc1 = tsc1;
            self.timestamps = TimestampFormatter::new(&TraceFileHeader::load(&mapping.region));
        }
    }

    /// Prints the next message of `level`, which [`FileTail::next_tsc`]
    /// picked with timestamp `order_tsc`. Returns false when nothing was
    /// consumed.
    pub fn tail_buffer<W: Write>(
        &mut self,
        order_tsc: u64,
        max_valid_tsc: u64,
        level: usize,
        emitter: &mut Emitter<W>,
    ) -> Result<bool, ReadError> {
        let (Some(registry), Some(decoder)) = (self.registry.as_mut(), self.decoders.get_mut(level))
        else {
            self.next = None;
            return Ok(false);
        };
        match decoder.next(registry, max_valid_tsc) {
            Ok(Some(pending)) => {
                if pending.tsc != order_tsc {
                    // The level was picked on a different timestamp; pick again.
                    decoder.note_failure();
                    self.next = None;
                    return Ok(true);
                }
                let printed = match registry.get(pending.id) {
                    Some(formatter) => emitter.message(
                        &mut self.timestamps,
                        &self.name,
                        level,
                        order_tsc,
                        &pending,
                        formatter,
                    )?,
                    None => false,
                };
                if printed {
                    decoder.consume(&pending);
                    self.next = None;
                    Ok(true)
                } else {
                    let corruption = Corruption::new(
                        Some(pending.id),
                        "failed to dump message after successful decode",
                    );
                    self.on_corruption(level, corruption, emitter)
                }
            }
            Ok(None) => {
                decoder.note_failure();
                Ok(false)
            }
            Err(corruption) => self.on_corruption(level, corruption, emitter),
        }
    }

    /// Prints the next message of any level.
    pub fn tail<W: Write>(
        &mut self,
        max_valid_tsc: u64,
        emitter: &mut Emitter<W>,
    ) -> Result<bool, ReadError> {
        match self.next_tsc()? {
            Some((tsc, level)) => self.tail_buffer(tsc, max_valid_tsc, level, emitter),
            None => Ok(false),
        }
    }

    fn on_corruption<W: Write>(
        &mut self,
        level: usize,
        corruption: Corruption,
        emitter: &mut Emitter<W>,
    ) -> Result<bool, ReadError> {
        let formatter = corruption
            .msg_id
            .and_then(|id| self.registry.as_ref().and_then(|r| r.get(id)));
        emitter.corruption(&self.path, level, &corruption, formatter)?;
        self.next = None;
        match self.mode {
            ReadMode::Tail => {
                if self.decoders.get_mut(level).is_some_and(|d| d.reset()) {
                    emitter.note(format_args!(
                        "resetting log buffer {} of {} due to corruption - potential message loss",
                        level, self.name
                    ))?;
                }
            }
            ReadMode::Cat => {
                emitter.note(format_args!("aborting {} due to corruption", self.path.display()))?;
                self.abort();
            }
        }
        Ok(false)
    }
}

/// Prints the messages already in one or more files, merged by timestamp.
pub struct CatControl<W: Write> {
    files: Vec<FileTail>,
    emitter: Emitter<W>,
}

impl<W: Write> CatControl<W> {
    pub fn new<P: AsRef<Path>>(
        paths: &[P],
        mut options: OutputOptions,
        out: W,
    ) -> Result<Self, ReadError> {
        options.file_name |= paths.len() > 1;
        let files = paths
            .iter()
            .map(|p| FileTail::open(p.as_ref(), ReadMode::Cat, false, &options))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { files, emitter: Emitter::new(out, options) })
    }

    pub fn files(&self) -> &[FileTail] {
        &self.files
    }

    pub fn into_output(self) -> W {
        self.emitter.into_inner()
    }

    /// Prints everything. Returns true if every file was read to its end.
    ///
    /// A file that fails is dropped and the others are still printed; only
    /// a failure to write the output ends the run early.
    pub fn run(&mut self) -> Result<bool, ReadError> {
        let mut queue = BTreeMap::new();
        for index in 0..self.files.len() {
            if let Some((tsc, level)) = self.next_of(index)? {
                queue.insert((tsc, index), level);
            }
        }
        while let Some(((tsc, index), level)) = queue.pop_first() {
            let file = &mut self.files[index];
            if let Err(e) = file.tail_buffer(tsc, u64::MAX, level, &mut self.emitter) {
                drop_failed(file, e)?;
                continue;
            }
            if let Some((tsc, level)) = self.next_of(index)? {
                queue.insert((tsc, index), level);
            }
        }
        self.emitter.flush()?;
        Ok(!self.files.iter().any(FileTail::is_aborted))
    }

    fn next_of(&mut self, index: usize) -> Result<Option<(u64, usize)>, ReadError> {
        let file = &mut self.files[index];
        match file.next_tsc() {
            Ok(next) => Ok(next),
            Err(e) => drop_failed(file, e).map(|()| None),
        }
    }
}

/// Stops reading `file` after `err`. Output failures concern every file and
/// are passed on.
fn drop_failed(file: &mut FileTail, err: ReadError) -> Result<(), ReadError> {
    if matches!(err, ReadError::Output(_) | ReadError::OutputClosed) {
        return Err(err);
    }
    error!(path = %file.path().display(), error = %err, "no longer reading file");
    file.abort();
    Ok(())
}

/// Result of one [`TailControl::step`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// A message was looked at.
    Progress,
    /// Nothing to print; waited for notifications.
    Idle,
    /// Every file was deleted and drained.
    Done,
}

/// Follows one or more files as writers append, restart and go away.
pub struct TailControl<W: Write> {
    files: Vec<FileTail>,
    emitter: Emitter<W>,
    watcher: DirWatcher,
    poll_stdout: bool,
    last_check: Instant,
    failed: bool,
}

impl<W: Write> TailControl<W> {
    /// Starts at the newest message of every file.
    pub fn new<P: AsRef<Path>>(
        paths: &[P],
        mut options: OutputOptions,
        out: W,
    ) -> Result<Self, ReadError> {
        options.file_name |= paths.len() > 1;
        let watcher = DirWatcher::new(paths)?;
        let files = paths
            .iter()
            .map(|p| FileTail::open(p.as_ref(), ReadMode::Tail, true, &options))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            files,
            emitter: Emitter::new(out, options),
            watcher,
            poll_stdout: false,
            last_check: Instant::now(),
            failed: false,
        })
    }

    /// Also ends the run when stdout reports an error (closed pipe).
    pub fn poll_stdout(mut self, on: bool) -> Self {
        self.poll_stdout = on;
        self
    }

    pub fn files(&self) -> &[FileTail] {
        &self.files
    }

    pub fn output(&self) -> &W {
        self.emitter.get_ref()
    }

    /// True if a file had to be dropped after an error.
    pub fn had_failures(&self) -> bool {
        self.failed
    }

    /// Prints the oldest message across all files, or waits briefly for
    /// notifications when there is none.
    pub fn step(&mut self) -> Result<Step, ReadError> {
        let max_valid_tsc = clock::tsc();
        let mut all_deleted = true;
        let mut oldest: Option<(u64, usize, usize)> = None;
        for (index, file) in self.files.iter_mut().enumerate() {
            match file.next_tsc() {
                Ok(Some((tsc, level))) => {
                    if oldest.map_or(true, |(min, _, _)| tsc < min) {
                        oldest = Some((tsc, index, level));
                    }
                }
                Ok(None) => {
                    if file.status() != TailStatus::DeletePending && !file.is_aborted() {
                        all_deleted = false;
                    }
                }
                Err(e) => {
                    drop_failed(file, e)?;
                    self.failed = true;
                }
            }
        }

        if let Some((tsc, index, level)) = oldest {
            let consumed =
                self.files[index].tail_buffer(tsc, max_valid_tsc, level, &mut self.emitter)?;
            if !consumed || self.last_check.elapsed() >= CHECK_INTERVAL {
                self.last_check = Instant::now();
                self.check_events(false)?;
            }
            return Ok(Step::Progress);
        }

        self.emitter.flush()?;
        if all_deleted {
            return Ok(Step::Done);
        }
        self.check_events(true)?;
        Ok(Step::Idle)
    }

    /// Runs until every file is deleted and drained.
    pub fn run(&mut self) -> Result<(), ReadError> {
        while self.step()? != Step::Done {}
        Ok(())
    }

    fn check_events(&mut self, wait: bool) -> Result<(), ReadError> {
        let mut read = !wait;
        if wait {
            let stdout = io::stdout();
            let output = self.poll_stdout.then(|| stdout.as_fd());
            match self.watcher.wait(POLL_MS, output)? {
                Wait::OutputClosed => return Err(ReadError::OutputClosed),
                Wait::Ready => read = true,
                Wait::Idle => {}
            }
        }
        if read {
            for (file, event) in self.watcher.read()? {
                self.handle_event(file, event)?;
            }
        }
        Ok(())
    }

    /// Applies a notification about file `index`.
    pub fn handle_event(&mut self, index: usize, event: FsEvent) -> Result<(), ReadError> {
        let dir = self.watcher.dir_of(index);
        match event {
            FsEvent::Created => {
                self.watch_modifications(dir, true)?;
                self.files[index].transition(TailStatus::ReinitPending);
            }
            FsEvent::Deleted => {
                self.watch_modifications(dir, false)?;
                self.files[index].transition(TailStatus::DeletePending);
            }
            FsEvent::Modified => {
                self.files[index].transition(TailStatus::ReinitReady);
                self.watch_modifications(dir, false)?;
            }
        }
        Ok(())
    }

    /// A directory keeps its modify watch while any of its files still
    /// waits for the first write to its new incarnation.
    fn watch_modifications(&mut self, dir: usize, on: bool) -> Result<(), ReadError> {
        let waiting = self
            .watcher
            .files_in(dir)
            .any(|i| self.files[i].status() == TailStatus::ReinitPending);
        if !waiting && self.watcher.watches_modifications(dir) != on {
            self.watcher.set_modify_watch(dir, on)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{CounterTable, MsgCounter, SizeSpec};
    use crate::region::HeapArena;
    use crate::registry::StaticRegistry;
    use crate::ring_buf::RingBuf;
    use crate::trace_file::{FileOptions, TraceFile};
    use tempfile::tempdir;

    /// One decoded `v={}` message carrying 7, traced from `net.rs:line`.
    fn decoded(line: u32) -> (StaticRegistry, Pending) {
        let counters = HeapArena::new(MsgCounter::SIZE * 8).unwrap();
        let buf = HeapArena::new(1024).unwrap();
        let mut rb = RingBuf::new(buf.region(), CounterTable::new(counters.region(), 8), 24);
        let mut registry = StaticRegistry::new();
        let mut table = ParamTable::new();
        registry.insert(MessageFormatter::new(1, "net.rs", line, "v={}", "i", &mut table).unwrap());
        rb.start(1);
        rb.put(&7u32);
        rb.end();
        let decoder = RingDecoder::new(buf.region(), 0, ReadMode::Cat);
        let pending = decoder.next(&mut registry, u64::MAX).unwrap().unwrap();
        (registry, pending)
    }

    /// Renders one line and returns it without the date and time.
    fn emit(options: OutputOptions, line: u32) -> (String, u64) {
        let (registry, pending) = decoded(line);
        let header = TraceFileHeader {
            tsc0: pending.tsc,
            monotime0: 0.0,
            tsc1: pending.tsc + 1_000_000_000,
            monotime1: 1.0,
            utc1: 1_700_000_001.0,
            ..Default::default()
        };
        let mut timestamps = TimestampFormatter::new(&header);
        let mut emitter = Emitter::new(Vec::new(), options);
        let formatter = registry.get(1).unwrap();
        assert!(emitter.message(&mut timestamps, "svc.qt", 3, 0xabc, &pending, formatter).unwrap());
        let out = String::from_utf8(emitter.into_inner()).unwrap();
        let rest = out.splitn(3, ' ').nth(2).unwrap_or_default().to_string();
        (rest, pending.tsc)
    }

    #[test]
    fn test_emitter_columns() {
        let (line, tsc) = emit(OutputOptions::default(), 12);
        assert_eq!(line, format!("3 +{} \"v=7\"\n", tsc));

        let (line, tsc) = emit(OutputOptions { debug: true, ..Default::default() }, 12);
        assert_eq!(line, format!("3 0x0000000000000abc +{} \"v=7\"\n", tsc));

        let (line, tsc) = emit(OutputOptions { tsc: true, ..Default::default() }, 12);
        assert_eq!(line, format!("3 0x{:016x} +{} \"v=7\"\n", tsc, tsc));

        let (line, tsc) = emit(OutputOptions { file_name: true, ..Default::default() }, 12);
        assert_eq!(line, format!("3 svc.qt +{} \"v=7\"\n", tsc));

        let (line, tsc) = emit(OutputOptions { file_line: true, ..Default::default() }, 12);
        assert_eq!(line, format!("3 +{} net.rs:12 \"v=7\"\n", tsc));

        let all = OutputOptions { debug: true, tsc: true, file_name: true, file_line: true, ..Default::default() };
        let (line, tsc) = emit(all, 12);
        assert_eq!(
            line,
            format!("3 0x0000000000000abc 0x{:016x} svc.qt +{} net.rs:12 \"v=7\"\n", tsc, tsc)
        );

        // only line-0 messages are printed in wall-clock mode
        let (line, _) = emit(OutputOptions { wall_clock: true, ..Default::default() }, 12);
        assert!(line.is_empty());
    }

    #[test]
    fn test_deltas_follow_the_last_printed_line() {
        let (registry, pending) = decoded(1);
        let mut timestamps = TimestampFormatter::default();
        let mut emitter = Emitter::new(Vec::new(), OutputOptions::default());
        let formatter = registry.get(1).unwrap();
        for _ in 0..2 {
            emitter.message(&mut timestamps, "a.qt", 0, 0, &pending, formatter).unwrap();
        }
        let out = String::from_utf8(emitter.into_inner()).unwrap();
        let deltas: Vec<&str> = out.lines().filter_map(|l| l.split(' ').find(|t| t.starts_with('+'))).collect();
        assert_eq!(deltas, vec![format!("+{}", pending.tsc).as_str(), "+0"]);
    }

    #[test]
    fn test_corruption_report_wording() {
        let (registry, _) = decoded(1);
        let mut emitter = Emitter::new(Vec::new(), OutputOptions::default());
        let path = Path::new("/traces/x.qt");
        let known = Corruption::new(Some(1), "invalid length: 99 (expected: 16)");
        emitter.corruption(path, 2, &known, registry.get(1)).unwrap();
        emitter
            .note(format_args!("resetting log buffer {} of {} due to corruption - potential message loss", 2, "x.qt"))
            .unwrap();
        let unknown = Corruption::new(None, "invalid tsc: 5 (last: 9)");
        emitter.corruption(path, 4, &unknown, None).unwrap();

        let out = String::from_utf8(emitter.into_inner()).unwrap();
        assert_eq!(
            out,
            "---------- corruption detected in /traces/x.qt\n\
             log level: 2\n\
             message id: 1\n\
             message: v={}\n\
             format: i\n\
             reason: invalid length: 99 (expected: 16)\n\
             ---------- resetting log buffer 2 of x.qt due to corruption - potential message loss\n\
             ---------- corruption detected in /traces/x.qt\n\
             log level: 4\n\
             reason: invalid tsc: 5 (last: 9)\n"
        );
    }

    #[test]
    fn test_events_drive_status_and_modify_watch() {
        let dir = tempdir().unwrap();
        let options = FileOptions { sizes: SizeSpec::uniform(1), ..Default::default() };
        let a = dir.path().join("a.qt");
        let b = dir.path().join("b.qt");
        let _ta = TraceFile::create(&a, &options).unwrap();
        let _tb = TraceFile::create(&b, &options).unwrap();
        let mut control = TailControl::new(&[&a, &b], OutputOptions::default(), Vec::new()).unwrap();
        let dir = control.watcher.dir_of(0);
        assert_eq!(control.watcher.dir_of(1), dir);
        assert!(!control.watcher.watches_modifications(dir));

        control.handle_event(0, FsEvent::Created).unwrap();
        assert_eq!(control.files[0].status(), TailStatus::ReinitPending);
        assert!(control.watcher.watches_modifications(dir));

        // a second create while pending changes nothing
        control.handle_event(0, FsEvent::Created).unwrap();
        assert_eq!(control.files[0].status(), TailStatus::ReinitPending);
        assert!(control.watcher.watches_modifications(dir));

        control.handle_event(1, FsEvent::Created).unwrap();
        control.handle_event(0, FsEvent::Modified).unwrap();
        assert_eq!(control.files[0].status(), TailStatus::ReinitReady);
        // b still waits for its first write
        assert!(control.watcher.watches_modifications(dir));

        control.handle_event(1, FsEvent::Modified).unwrap();
        assert_eq!(control.files[1].status(), TailStatus::ReinitReady);
        assert!(!control.watcher.watches_modifications(dir));

        // a repeated modification changes nothing
        control.handle_event(1, FsEvent::Modified).unwrap();
        assert_eq!(control.files[1].status(), TailStatus::ReinitReady);

        control.handle_event(0, FsEvent::Deleted).unwrap();
        assert_eq!(control.files[0].status(), TailStatus::DeletePending);
        assert!(!control.watcher.watches_modifications(dir));
    }

    #[test]
    fn test_level_mask_parsing() {
        let mask: LevelMask = "0,2-4".parse().unwrap();
        let levels: Vec<usize> = (0..NUM_LEVELS).filter(|l| mask.contains(*l)).collect();
        assert_eq!(levels, vec![0, 2, 3, 4]);
        assert!("10".parse::<LevelMask>().is_err());
        assert!("4-2".parse::<LevelMask>().is_err());
        assert!("x".parse::<LevelMask>().is_err());
        assert_eq!(LevelMask::default(), LevelMask::ALL);
    }
}
