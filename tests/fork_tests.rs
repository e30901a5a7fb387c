//! Kept in its own binary: duplicating the process touches every live
//! handle, which would disturb tests running alongside.

use ringtrace::{
    qtrace, set_fork_policy, ForkPolicy, Identity, TraceConfig, TraceHandle, WriterMode,
};
use tempfile::tempdir;

fn in_child(check: impl FnOnce() -> bool) -> bool {
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed"),
        0 => {
            let ok = std::panic::catch_unwind(std::panic::AssertUnwindSafe(check)).unwrap_or(false);
            unsafe { libc::_exit(if ok { 0 } else { 1 }) }
        }
        pid => {
            let mut status = 0;
            assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
            libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
        }
    }
}

#[test]
fn test_fork_policies() {
    let dir = tempdir().unwrap();
    let handle = TraceHandle::initialize(
        TraceConfig::new("forked.qt").dir(dir.path()).mode(WriterMode::PerIdentity),
    )
    .unwrap();
    let mut tf = handle.trace_file(&Identity::new("p-")).unwrap();

    set_fork_policy(ForkPolicy::Close);
    assert!(in_child(|| {
        handle.is_closed()
            && qtrace!(tf, 0, "from child").is_none()
            && TraceHandle::lookup("forked.qt").is_none()
    }));
    // the parent keeps tracing
    assert!(!handle.is_closed());
    assert!(qtrace!(tf, 0, "from parent").is_some());

    set_fork_policy(ForkPolicy::Delete);
    assert!(in_child(|| {
        handle.is_closed() && TraceHandle::lookup("forked.qt").is_none()
    }));
    assert!(TraceHandle::lookup("forked.qt").is_some());
}
