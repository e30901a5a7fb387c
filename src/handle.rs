//! Trace handles: configuration, per-identity file fan-out and process
//! duplication.
//!
//! A [`TraceHandle`] hands out [`TraceFile`]s. In [`WriterMode::Single`] it
//! owns one file created at initialization; in [`WriterMode::PerIdentity`]
//! every caller-supplied [`Identity`] (a thread, a task, a worker) gets its
//! own file, created on first request. The identity map is locked only when
//! a file is created or dropped, never on the tracing path.

use std::collections::HashSet;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Once, Weak};
use std::thread;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::TraceError;
use crate::layout::SizeSpec;
use crate::ring_buf::MAX_STRING_LEN;
use crate::rotate::RotationPolicy;
use crate::trace_file::{FileOptions, ForeverLog, TraceFile};

/// Overrides where relative trace file names are created.
pub const DIR_ENV: &str = "RINGTRACE_DIR";
pub const DEFAULT_DIR: &str = ".ringtrace";

lazy_static! {
    static ref HANDLES: Mutex<Vec<Weak<HandleShared>>> = Mutex::new(Vec::new());
}

static FORK_POLICY: AtomicU8 = AtomicU8::new(ForkPolicy::Close as u8);
static ATFORK: Once = Once::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterMode {
    Single,
    PerIdentity,
}

/// What happens to live handles in a duplicated (forked) child process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ForkPolicy {
    /// Mark every handle closed but keep all structures, so files still
    /// held by the child stay valid and silently stop tracing.
    #[default]
    Close = 0,
    /// Also forget every handle and release files not yet handed out.
    Delete = 1,
}

pub fn set_fork_policy(policy: ForkPolicy) {
    FORK_POLICY.store(policy as u8, Ordering::Relaxed);
}

pub fn fork_policy() -> ForkPolicy {
    match FORK_POLICY.load(Ordering::Relaxed) {
        1 => ForkPolicy::Delete,
        _ => ForkPolicy::Close,
    }
}

/// Opaque token naming one writer. Its text becomes part of the file name
/// in per-identity mode.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Identity(name.into())
    }

    /// The current thread's name, or `thread-<n>` for unnamed threads.
    pub fn current_thread() -> Self {
        let current = thread::current();
        match current.name() {
            Some(name) => Identity(name.replace('/', "_")),
            None => {
                let id = format!("{:?}", current.id());
                Identity(format!("thread-{}", id.trim_matches(|c: char| !c.is_ascii_digit())))
            }
        }
    }

    fn process() -> Self {
        Identity(String::from("process"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builder-style configuration of a [`TraceHandle`].
///
/// # Examples
///
/// ```no_run
/// # use ringtrace::{TraceConfig, TraceHandle, WriterMode, SizeSpec};
/// let handle = TraceHandle::initialize(
///     TraceConfig::new("agent-%d.qt")
///         .sizes(SizeSpec::parse("64,32,8"))
///         .mode(WriterMode::PerIdentity),
/// )?;
/// # Ok::<(), ringtrace::TraceError>(())
/// ```
#[derive(Clone, Debug)]
pub struct TraceConfig {
    pub name: String,
    pub mode: WriterMode,
    pub dir: Option<PathBuf>,
    pub file: FileOptions,
}

impl TraceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: WriterMode::Single,
            dir: None,
            file: FileOptions::default(),
        }
    }

    pub fn mode(mut self, mode: WriterMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sizes are limited (see [`SizeSpec::limited`]).
    pub fn sizes(mut self, sizes: SizeSpec) -> Self {
        self.file.sizes = sizes.limited();
        self
    }

    pub fn max_string_len(mut self, len: usize) -> Self {
        self.file.max_string_len = len;
        self
    }

    pub fn num_msg_counters(mut self, n: u32) -> Self {
        self.file.num_counters = n;
        self
    }

    pub fn rotate(mut self, on: bool) -> Self {
        self.file.rotate = on;
        self
    }

    pub fn compress_rotated(mut self, on: bool) -> Self {
        self.file.compress_rotated = on;
        self
    }

    pub fn rotation(mut self, policy: RotationPolicy) -> Self {
        self.file.rotation = policy;
        self
    }

    pub fn forever_log(mut self, path: impl Into<PathBuf>, first_index: u32) -> Self {
        self.file.forever_log = Some(ForeverLog { path: path.into(), first_index });
        self
    }

    /// Directory for relative names; takes precedence over [`DIR_ENV`].
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    fn validate(&self) -> Result<(), TraceError> {
        if self.name.is_empty() {
            return Err(TraceError::InvalidConfig("empty file name".into()));
        }
        if self.file.max_string_len > MAX_STRING_LEN {
            return Err(TraceError::InvalidConfig(format!(
                "max string length {} exceeds {}",
                self.file.max_string_len, MAX_STRING_LEN
            )));
        }
        if self.file.num_counters == 0 {
            return Err(TraceError::InvalidConfig("no message counters".into()));
        }
        Ok(())
    }

    fn expanded_name(&self) -> String {
        self.name.replace("%d", &std::process::id().to_string())
    }

    fn is_path_like(name: &str) -> bool {
        name.starts_with('/') || name.starts_with("./") || name.starts_with("../")
    }

    fn trace_dir(&self) -> Result<PathBuf, TraceError> {
        let dir = self
            .dir
            .clone()
            .or_else(|| env::var_os(DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIR));
        fs::create_dir_all(&dir).map_err(|e| TraceError::io(&dir, e))?;
        Ok(dir)
    }

    /// Where the file of `identity` lives. Path-like names are used as
    /// given in single mode; per-identity files prefix the file name with
    /// the identity.
    pub fn path_for(&self, identity: Option<&Identity>) -> Result<PathBuf, TraceError> {
        let name = self.expanded_name();
        match identity {
            None if Self::is_path_like(&name) => Ok(PathBuf::from(name)),
            None => Ok(self.trace_dir()?.join(name)),
            Some(identity) => {
                let path = Path::new(&name);
                let file_name = path.file_name().map_or_else(
                    || name.clone(),
                    |f| f.to_string_lossy().into_owned(),
                );
                let dir = match path.parent() {
                    Some(parent) if Self::is_path_like(&name) => parent.to_path_buf(),
                    _ => self.trace_dir()?,
                };
                Ok(dir.join(format!("{}{}", identity, file_name)))
            }
        }
    }
}

pub(crate) struct HandleShared {
    name: String,
    closed: AtomicBool,
    config: Mutex<TraceConfig>,
    open: Mutex<HashSet<Identity>>,
    single: Mutex<Option<TraceFile>>,
}

/// Ties a handed-out [`TraceFile`] to its handle: carries the closed flag
/// and removes the identity from the handle when the file drops.
pub(crate) struct Lease {
    shared: Arc<HandleShared>,
    identity: Identity,
}

impl Lease {
    #[inline(always)]
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }

    pub(crate) fn open_files(&self) -> usize {
        self.shared.open.lock().len()
    }

    pub(crate) fn set_sizes(&self, sizes: SizeSpec) {
        self.shared.config.lock().file.sizes = sizes;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // A closed handle may belong to a forked child whose map lock was
        // held by a thread that no longer exists.
        let open = if self.is_closed() {
            self.shared.open.try_lock()
        } else {
            Some(self.shared.open.lock())
        };
        if let Some(mut open) = open {
            open.remove(&self.identity);
        }
    }
}

#[derive(Clone)]
pub struct TraceHandle {
    shared: Arc<HandleShared>,
}

impl TraceHandle {
    /// Validates `config` and registers the handle. In single mode the
    /// trace file is created (and calibrated) right away.
    pub fn initialize(config: TraceConfig) -> Result<Self, TraceError> {
        config.validate()?;
        ATFORK.call_once(register_atfork);
        let shared = Arc::new(HandleShared {
            name: config.name.clone(),
            closed: AtomicBool::new(false),
            open: Mutex::new(HashSet::new()),
            single: Mutex::new(None),
            config: Mutex::new(config.clone()),
        });
        if config.mode == WriterMode::Single {
            let path = config.path_for(None)?;
            let mut file = TraceFile::create(&path, &config.file)?;
            let identity = Identity::process();
            shared.open.lock().insert(identity.clone());
            file.lease = Some(Lease { shared: Arc::clone(&shared), identity });
            *shared.single.lock() = Some(file);
        }
        HANDLES.lock().push(Arc::downgrade(&shared));
        debug!(name = %config.name, mode = ?config.mode, "initialized trace handle");
        Ok(Self { shared })
    }

    /// Finds a live handle by the name it was initialized with.
    pub fn lookup(name: &str) -> Option<TraceHandle> {
        HANDLES
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|h| h.name == name && !h.closed.load(Ordering::Relaxed))
            .map(|shared| TraceHandle { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> TraceConfig {
        self.shared.config.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }

    /// Number of files currently handed out or pending.
    pub fn open_files(&self) -> usize {
        self.shared.open.lock().len()
    }

    /// The trace file for `identity`.
    ///
    /// In single mode the one file is handed out to the first caller; the
    /// identity is ignored. In per-identity mode a new file is created for
    /// an identity that has none open.
    pub fn trace_file(&self, identity: &Identity) -> Result<TraceFile, TraceError> {
        if self.is_closed() {
            return Err(TraceError::Closed);
        }
        let config = self.config();
        if config.mode == WriterMode::Single {
            return self
                .shared
                .single
                .lock()
                .take()
                .ok_or_else(|| TraceError::IdentityInUse(identity.to_string()));
        }

        if !self.shared.open.lock().insert(identity.clone()) {
            return Err(TraceError::IdentityInUse(identity.to_string()));
        }
        // on failure the dropped lease releases the identity again
        let lease = Lease { shared: Arc::clone(&self.shared), identity: identity.clone() };
        let path = config.path_for(Some(identity))?;
        let mut file = TraceFile::create(path, &config.file)?;
        file.lease = Some(lease);
        Ok(file)
    }

    /// Closes the handle: files already handed out stop tracing, a pending
    /// single-mode file is released.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        let pending = self.shared.single.lock().take();
        drop(pending);
        HANDLES
            .lock()
            .retain(|h| h.upgrade().is_some_and(|h| !Arc::ptr_eq(&h, &self.shared)));
    }
}

/// Applies the process-wide [`ForkPolicy`] to every live handle. Runs in
/// the child after `fork`; exposed for runtimes that duplicate processes by
/// other means.
pub fn on_process_duplicate() {
    let live: Vec<Arc<HandleShared>> = HANDLES.lock().iter().filter_map(Weak::upgrade).collect();
    for shared in &live {
        shared.closed.store(true, Ordering::Relaxed);
    }
    if fork_policy() == ForkPolicy::Delete {
        HANDLES.lock().clear();
        for shared in &live {
            if let Some(mut single) = shared.single.try_lock() {
                drop(single.take());
            }
        }
    }
}

extern "C" fn before_fork() {
    std::mem::forget(HANDLES.lock());
}

extern "C" fn after_fork_parent() {
    unsafe { HANDLES.force_unlock() };
}

extern "C" fn after_fork_child() {
    unsafe { HANDLES.force_unlock() };
    on_process_duplicate();
}

fn register_atfork() {
    let rc = unsafe {
        libc::pthread_atfork(Some(before_fork), Some(after_fork_parent), Some(after_fork_child))
    };
    if rc != 0 {
        tracing::warn!(rc, "pthread_atfork failed; forked children keep tracing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let traces = dir.path().join("rt");
        let config = TraceConfig::new("agent.qt").dir(&traces);
        assert_eq!(config.path_for(None).unwrap(), traces.join("agent.qt"));
        assert!(traces.is_dir());
        assert_eq!(
            config.path_for(Some(&Identity::new("w0-"))).unwrap(),
            traces.join("w0-agent.qt")
        );

        let config = TraceConfig::new("/tmp/agent.qt");
        assert_eq!(config.path_for(None).unwrap(), PathBuf::from("/tmp/agent.qt"));
        assert_eq!(
            config.path_for(Some(&Identity::new("w1-"))).unwrap(),
            PathBuf::from("/tmp/w1-agent.qt")
        );
    }

    #[test]
    fn test_pid_expansion() {
        let config = TraceConfig::new("/tmp/agent-%d.qt");
        let path = config.path_for(None).unwrap();
        assert_eq!(path, PathBuf::from(format!("/tmp/agent-{}.qt", std::process::id())));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(TraceConfig::new("").validate().is_err());
        assert!(TraceConfig::new("a.qt").max_string_len(81).validate().is_err());
        assert!(TraceConfig::new("a.qt").num_msg_counters(0).validate().is_err());
    }
}
