//! Scope timers that accumulate cycles into a call site's counter row.
//!
//! Self timers nest: each one subtracts the cycles spent in self timers
//! opened inside it on the same thread, giving `tsc_self_count`.

use std::cell::RefCell;
use std::sync::Arc;

use memmap2::MmapMut;

use crate::clock;
use crate::layout::CounterTable;

thread_local! {
    static CHILD_CYCLES: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileKind {
    /// Counts one hit and the total cycles of the scope.
    Block,
    /// Like `Block`, and also the cycles not spent in nested self timers.
    SelfTime,
    /// Times the scope following a traced message; the message already
    /// counted the hit.
    Message,
}

#[must_use = "the scope is timed until the guard drops"]
pub struct ProfileGuard {
    counters: CounterTable,
    _map: Arc<MmapMut>,
    id: u32,
    start: u64,
    kind: ProfileKind,
}

impl ProfileGuard {
    pub(crate) fn new(
        counters: CounterTable,
        map: Arc<MmapMut>,
        id: u32,
        start: u64,
        kind: ProfileKind,
    ) -> Self {
        if kind == ProfileKind::SelfTime {
            CHILD_CYCLES.with(|stack| stack.borrow_mut().push(0));
        }
        Self { counters, _map: map, id, start, kind }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for ProfileGuard {
    fn drop(&mut self) {
        let elapsed = clock::tsc().wrapping_sub(self.start);
        match self.kind {
            ProfileKind::Block => self.counters.add_cycles(self.id, elapsed, None, true),
            ProfileKind::Message => self.counters.add_cycles(self.id, elapsed, None, false),
            ProfileKind::SelfTime => {
                let children = CHILD_CYCLES.with(|stack| {
                    let mut stack = stack.borrow_mut();
                    let children = stack.pop().unwrap_or(0);
                    if let Some(parent) = stack.last_mut() {
                        *parent += elapsed;
                    }
                    children
                });
                let own = elapsed.saturating_sub(children);
                self.counters.add_cycles(self.id, elapsed, Some(own), true);
            }
        }
    }
}
