//! # ringtrace
//!
//! A tracer for hot code paths that writes binary messages into per-level
//! ring buffers inside a memory-mapped file, and the reader that turns them
//! back into text while the writer is still running.
//!
//! * **Cheap tracing**: a message is a cycle counter, an id and the raw
//!   argument bytes; the format string is written once per file, in a
//!   dictionary after the buffers.
//! * **Bounded files**: ten levels, each a ring buffer of its own size, so
//!   chatty debug levels never push out rare important messages.
//! * **Live reading**: `ringtail` follows one or more files as writers
//!   append, restart and rotate them, merging everything by timestamp.
//!
//! ## Main Components
//!
//! * [`TraceHandle`]: configuration and file fan-out per writer identity
//! * [`TraceFile`]: one mapped file; the [`qtrace!`] family writes into it
//! * [`tail`]: the reader side, [`CatControl`] and [`TailControl`]
//! * [`format`]: rendering of payloads through their templates
//!
//! ## Quick Start
//!
//! ```no_run
//! use ringtrace::{qprof, qtrace, Identity, TraceConfig, TraceHandle, WriterMode};
//!
//! # fn main() -> Result<(), ringtrace::TraceError> {
//! let handle = TraceHandle::initialize(TraceConfig::new("server.qt").mode(WriterMode::PerIdentity))?;
//! let mut tf = handle.trace_file(&Identity::current_thread())?;
//!
//! qtrace!(tf, 0, "accepted {} from {}", 42u32, "10.0.0.1");
//! {
//!     qprof!(tf, "parse");
//!     qtrace!(tf, 1, "parsed %d bytes in frame {:#x}", 512u64, 7u16);
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod decoder;
pub mod error;
pub mod format;
pub mod handle;
pub mod layout;
pub mod profile;
pub mod region;
pub mod registry;
pub mod ring_buf;
pub mod rotate;
pub mod site;
pub mod tail;
pub mod trace_file;
pub mod traceable;
pub mod watch;

pub use decoder::{Pending, ReadMode, RingDecoder};
pub use error::{Corruption, FormatError, ReadError, TraceError};
pub use format::{MessageFormatter, ParamCodec, ParamTable};
pub use handle::{
    on_process_duplicate, set_fork_policy, ForkPolicy, Identity, TraceConfig, TraceHandle,
    WriterMode,
};
pub use layout::SizeSpec;
pub use profile::ProfileGuard;
pub use registry::{DictionaryRegistry, MessageRegistry, StaticRegistry};
pub use rotate::RotationPolicy;
pub use site::MsgSite;
pub use tail::{CatControl, FileTail, LevelMask, OutputOptions, TailControl};
pub use trace_file::{FileOptions, TraceFile};
pub use traceable::{TraceArgs, Traceable};

/// Traces a message at a level.
///
/// The template takes `{}`-style or printf-style placeholders. Arguments are
/// any [`Traceable`]; at most twelve per message.
///
/// ```no_run
/// # use ringtrace::*;
/// # fn demo(tf: &mut TraceFile) {
/// qtrace!(tf, 2, "queue {} at {:x}", 3u8, 0xbeefu32);
/// # }
/// ```
#[macro_export]
macro_rules! qtrace {
    ($tf:expr, $level:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        static __SITE: $crate::MsgSite = $crate::MsgSite::new(file!(), line!(), $fmt);
        $tf.trace(&__SITE, $level, &($(&$arg,)*))
    }};
}

/// Like [`qtrace!`], stamping the message with the wall clock. Readers in
/// wall-clock mode print only these messages. At most ten arguments.
#[macro_export]
macro_rules! qtrace_wallclock {
    ($tf:expr, $level:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        static __SITE: $crate::MsgSite = $crate::MsgSite::new(file!(), 0, $fmt);
        let (__sec, __usec) = $crate::clock::wall_clock_now();
        $tf.trace(&__SITE, $level, &(&__sec, &__usec, $(&$arg,)*))
    }};
}

/// Counts the rest of the enclosing scope against a named counter row.
#[macro_export]
macro_rules! qprof {
    ($tf:expr, $name:literal) => {
        let __guard = {
            static __SITE: $crate::MsgSite = $crate::MsgSite::new(file!(), line!(), $name);
            $tf.profile(&__SITE, false)
        };
    };
}

/// Like [`qprof!`], also recording the time not spent in nested self timers.
#[macro_export]
macro_rules! qprof_self {
    ($tf:expr, $name:literal) => {
        let __guard = {
            static __SITE: $crate::MsgSite = $crate::MsgSite::new(file!(), line!(), $name);
            $tf.profile(&__SITE, true)
        };
    };
}

/// Traces a message and times the rest of the enclosing scope against it.
#[macro_export]
macro_rules! qtprof {
    ($tf:expr, $level:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        let __guard = {
            static __SITE: $crate::MsgSite = $crate::MsgSite::new(file!(), line!(), $fmt);
            $tf.trace_profiled(&__SITE, $level, &($(&$arg,)*))
        };
    };
}
