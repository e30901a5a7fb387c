//! Call sites and message id allocation.
//!
//! Every `qtrace!` expansion owns one static [`MsgSite`]. The first time a
//! site executes it takes a process-wide id under a single mutex; later
//! calls only load the cached id.

use std::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;
use parking_lot::Mutex;

lazy_static! {
    static ref NEXT_MSG_ID: Mutex<u32> = Mutex::new(1);
}

pub struct MsgSite {
    pub file: &'static str,
    /// Line 0 marks messages carrying a leading wall-clock pair.
    pub line: u32,
    pub template: &'static str,
    id: AtomicU32,
}

impl MsgSite {
    pub const fn new(file: &'static str, line: u32, template: &'static str) -> Self {
        Self { file, line, template, id: AtomicU32::new(0) }
    }

    /// The site's message id, allocated on first use.
    #[inline(always)]
    pub fn id(&self) -> u32 {
        match self.id.load(Ordering::Acquire) {
            0 => self.allocate(),
            id => id,
        }
    }

    #[cold]
    fn allocate(&self) -> u32 {
        let mut next = NEXT_MSG_ID.lock();
        let current = self.id.load(Ordering::Acquire);
        if current != 0 {
            return current;
        }
        let id = *next;
        *next = next.wrapping_add(1).max(1);
        self.id.store(id, Ordering::Release);
        id
    }
}
