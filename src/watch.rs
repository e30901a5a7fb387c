//! Directory notifications for tailed files.
//!
//! Writers announce a restart by creating the file again and then writing
//! its header, so every directory holding a tailed file is watched for
//! create and delete, and for modify only while some file there waits for
//! its new header.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsEvent {
    Created,
    Deleted,
    Modified,
}

/// Outcome of [`DirWatcher::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Notifications are ready to read.
    Ready,
    /// Timed out.
    Idle,
    /// The polled output descriptor reported an error.
    OutputClosed,
}

#[derive(Debug)]
struct DirWatch {
    dir: PathBuf,
    wd: WatchDescriptor,
    /// File name → index of the file in the watcher's input list.
    files: HashMap<OsString, usize>,
    modify: bool,
}

#[derive(Debug)]
pub struct DirWatcher {
    inotify: Inotify,
    dirs: Vec<DirWatch>,
    /// Directory index per file.
    dir_of: Vec<usize>,
}

const BASE_MASK: AddWatchFlags = AddWatchFlags::IN_CREATE.union(AddWatchFlags::IN_DELETE);

fn split(path: &Path) -> (PathBuf, OsString) {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path.file_name().unwrap_or(OsStr::new("")).to_os_string();
    (dir, name)
}

impl DirWatcher {
    /// Watches the directories of `paths`. Events are reported by the
    /// index of the path in this list.
    pub fn new<P: AsRef<Path>>(paths: &[P]) -> nix::Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK)?;
        let mut dirs: Vec<DirWatch> = Vec::new();
        let mut dir_of = Vec::with_capacity(paths.len());
        for (index, path) in paths.iter().enumerate() {
            let (dir, name) = split(path.as_ref());
            let slot = match dirs.iter().position(|d| d.dir == dir) {
                Some(slot) => slot,
                None => {
                    let wd = inotify.add_watch(dir.as_path(), BASE_MASK)?;
                    debug!(dir = %dir.display(), "watching directory");
                    dirs.push(DirWatch { dir, wd, files: HashMap::new(), modify: false });
                    dirs.len() - 1
                }
            };
            dirs[slot].files.insert(name, index);
            dir_of.push(slot);
        }
        Ok(Self { inotify, dirs, dir_of })
    }

    /// Directory slot of file `index`.
    pub fn dir_of(&self, index: usize) -> usize {
        self.dir_of[index]
    }

    /// Files sharing directory `dir`.
    pub fn files_in(&self, dir: usize) -> impl Iterator<Item = usize> + '_ {
        self.dirs[dir].files.values().copied()
    }

    pub fn watches_modifications(&self, dir: usize) -> bool {
        self.dirs[dir].modify
    }

    /// Adds or removes modify notifications for directory `dir`.
    pub fn set_modify_watch(&mut self, dir: usize, on: bool) -> nix::Result<()> {
        let watch = &mut self.dirs[dir];
        let mask = if on { BASE_MASK | AddWatchFlags::IN_MODIFY } else { BASE_MASK };
        watch.wd = self.inotify.add_watch(watch.dir.as_path(), mask)?;
        watch.modify = on;
        Ok(())
    }

    /// Waits up to `timeout_ms` for notifications. `output`, if given, is
    /// polled for errors so a closed pipe ends the run.
    pub fn wait(&self, timeout_ms: u16, output: Option<BorrowedFd<'_>>) -> nix::Result<Wait> {
        let mut fds = vec![PollFd::new(self.inotify.as_fd(), PollFlags::POLLIN)];
        if let Some(fd) = output {
            fds.push(PollFd::new(fd, PollFlags::empty()));
        }
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(Wait::Idle),
            Ok(_) => {}
            Err(e) => return Err(e),
        }
        let errored = |fd: &PollFd| {
            fd.revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLERR | PollFlags::POLLHUP))
        };
        if fds.get(1).is_some_and(errored) {
            return Ok(Wait::OutputClosed);
        }
        let ready = fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN));
        Ok(if ready { Wait::Ready } else { Wait::Idle })
    }

    /// Drains pending notifications for watched files as `(file, event)`.
    pub fn read(&self) -> nix::Result<Vec<(usize, FsEvent)>> {
        let events = match self.inotify.read_events() {
            Ok(events) => events,
            Err(Errno::EAGAIN) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut out = Vec::new();
        for event in events {
            let Some(dir) = self.dirs.iter().find(|d| d.wd == event.wd) else { continue };
            let Some(&file) = event.name.as_ref().and_then(|n| dir.files.get(n)) else {
                continue;
            };
            let kind = if event.mask.contains(AddWatchFlags::IN_CREATE) {
                FsEvent::Created
            } else if event.mask.contains(AddWatchFlags::IN_DELETE) {
                FsEvent::Deleted
            } else if event.mask.contains(AddWatchFlags::IN_MODIFY) {
                FsEvent::Modified
            } else {
                continue;
            };
            out.push((file, kind));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use tempfile::tempdir;

    fn drain(watcher: &DirWatcher) -> Vec<(usize, FsEvent)> {
        let mut all = Vec::new();
        for _ in 0..50 {
            if watcher.wait(10, None).unwrap() == Wait::Ready {
                all.extend(watcher.read().unwrap());
            }
        }
        all
    }

    #[test]
    fn test_create_delete_and_modify() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.qt");
        let b = dir.path().join("b.qt");
        let mut watcher = DirWatcher::new(&[&a, &b]).unwrap();
        assert_eq!(watcher.dir_of(0), watcher.dir_of(1));

        fs::write(&b, b"x").unwrap();
        fs::write(dir.path().join("other"), b"x").unwrap();
        let events = drain(&watcher);
        assert!(events.contains(&(1, FsEvent::Created)));
        assert!(!events.iter().any(|(_, e)| *e == FsEvent::Modified));

        watcher.set_modify_watch(0, true).unwrap();
        fs::write(&b, b"yy").unwrap();
        fs::remove_file(&b).unwrap();
        let events = drain(&watcher);
        assert!(events.contains(&(1, FsEvent::Modified)));
        assert!(events.contains(&(1, FsEvent::Deleted)));
    }
}
