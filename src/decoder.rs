//! Read side of one level.
//!
//! The decoder never writes to the level and never blocks the writer, so
//! every check here has to tolerate bytes that are still being written. A
//! message that fails validation is simply "not there yet"; only when the
//! same position keeps failing for [`CORRUPTION_THRESHOLD`] attempts does
//! `next` report [`Corruption`].

use std::fmt;

use crate::error::Corruption;
use crate::layout::{RING_HEADER_SIZE, RING_TRAILER_SIZE};
use crate::region::RawRegion;
use crate::registry::MessageRegistry;
use crate::ring_buf::MSG_OVERHEAD;

/// Failed attempts at one position before it counts as corrupt.
pub const CORRUPTION_THRESHOLD: u32 = 1024;
/// Longest message plus the following timestamp.
const SNAPSHOT_LEN: usize = RING_TRAILER_SIZE + 8;

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(word)
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(word)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// Follow a live writer. An all-ones timestamp after a message near the
    /// end means "look at the start of the level".
    Tail,
    /// One-shot dump. An all-ones timestamp there means the level wrapped.
    Cat,
}

/// A validated message, copied out of the level.
#[derive(Clone)]
pub struct Pending {
    pub tsc: u64,
    pub id: u32,
    /// Payload length.
    pub len: usize,
    bytes: [u8; SNAPSHOT_LEN],
}

impl Pending {
    pub fn payload(&self) -> &[u8] {
        &self.bytes[12..12 + self.len]
    }

    /// Bytes the message occupies in the level.
    pub fn size(&self) -> usize {
        MSG_OVERHEAD + self.len
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("tsc", &self.tsc)
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

#[derive(Debug)]
pub struct RingDecoder {
    region: RawRegion,
    level: usize,
    start: usize,
    end: usize,
    cur: usize,
    last_tsc: u64,
    corruption: u32,
    mode: ReadMode,
}

impl RingDecoder {
    /// Decoder positioned at the start of `region`, which spans a whole
    /// level including its wrap offset and trailer.
    pub fn new(region: RawRegion, level: usize, mode: ReadMode) -> Self {
        let end = region.len().saturating_sub(RING_TRAILER_SIZE).max(RING_HEADER_SIZE);
        Self {
            region,
            level,
            start: RING_HEADER_SIZE,
            end,
            cur: RING_HEADER_SIZE,
            last_tsc: 0,
            corruption: 0,
            mode,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn position(&self) -> usize {
        self.cur
    }

    pub fn last_tsc(&self) -> u64 {
        self.last_tsc
    }

    pub fn corruption(&self) -> u32 {
        self.corruption
    }

    /// Timestamp at the cursor without validating the message, used to pick
    /// the next level to look at. Zero means nothing to read.
    pub fn next_tsc(&self) -> u64 {
        let tsc = self.region.load_u64(self.cur);
        // Back at the start after a reset: wait for something newer.
        if self.cur == self.start && tsc < self.last_tsc {
            return 0;
        }
        tsc
    }

    fn is_valid_tsc(&self, tsc: u64, max_valid_tsc: u64) -> bool {
        tsc > 0 && tsc >= self.last_tsc && tsc < max_valid_tsc
    }

    fn fail(
        &self,
        msg_id: Option<u32>,
        reason: impl FnOnce() -> String,
    ) -> Result<Option<Pending>, Corruption> {
        if self.corruption >= CORRUPTION_THRESHOLD {
            Err(Corruption::new(msg_id, reason()))
        } else {
            Ok(None)
        }
    }

    /// Validates the message at the cursor. `max_valid_tsc` bounds
    /// timestamps from above (a message cannot come from the future).
    pub fn next<R: MessageRegistry + ?Sized>(
        &self,
        registry: &mut R,
        max_valid_tsc: u64,
    ) -> Result<Option<Pending>, Corruption> {
        let tsc = self.next_tsc();
        if tsc == 0 {
            return Ok(None);
        }
        if !self.is_valid_tsc(tsc, max_valid_tsc) {
            return self.fail(None, || format!("invalid tsc: {} (last: {})", tsc, self.last_tsc));
        }

        let mut bytes = [0u8; SNAPSHOT_LEN];
        let avail = self.region.read_into(self.cur, &mut bytes);
        if u64_at(&bytes, 0) != tsc {
            return self.fail(None, || format!("tsc changed while reading: {}", tsc));
        }
        let id = u32_at(&bytes, 8);

        let Some(formatter) = registry.resolve(id) else {
            return self.fail(Some(id), || format!("invalid message id: {}", id));
        };
        let len = match formatter.length(&bytes[12..avail]) {
            Some(len) if MSG_OVERHEAD + len + 8 <= avail => len,
            _ => return self.fail(Some(id), || "invalid parameter data".to_string()),
        };
        let expected = bytes[12 + len] as usize;
        if expected != 12 + len {
            return self.fail(Some(id), || {
                format!("invalid length: {} (expected: {})", expected, 12 + len)
            });
        }

        let next_at = MSG_OVERHEAD + len;
        let mut next_tsc = u64_at(&bytes, next_at);
        if next_tsc != 0 && self.cur + next_at >= self.end {
            if next_tsc != u64::MAX {
                return self.fail(Some(id), || {
                    format!("invalid next tsc: {} (tsc: {})", next_tsc, tsc)
                });
            }
            next_tsc = match self.mode {
                // Either the writer wrapped (then the start holds something
                // newer) or this message is still incomplete.
                ReadMode::Tail => self.region.load_u64(self.start),
                ReadMode::Cat => 0,
            };
        }
        if next_tsc != 0 && (next_tsc < tsc || next_tsc > max_valid_tsc) {
            return self.fail(Some(id), || format!("invalid next tsc: {} (tsc: {})", next_tsc, tsc));
        }

        Ok(Some(Pending { tsc, id, len, bytes }))
    }

    /// Moves past a message returned by [`RingDecoder::next`].
    pub fn consume(&mut self, pending: &Pending) {
        self.cur += pending.size();
        if self.cur >= self.end {
            self.cur = self.start;
        }
        self.last_tsc = pending.tsc;
        self.corruption = 0;
    }

    /// Records one more failed attempt at the current position.
    pub fn note_failure(&mut self) {
        self.corruption = self.corruption.saturating_add(1);
    }

    /// Steps over the message at the cursor without wrapping.
    pub fn skip<R: MessageRegistry + ?Sized>(&mut self, registry: &mut R) -> bool {
        match self.next(registry, u64::MAX) {
            Ok(Some(pending)) => {
                self.cur += pending.size();
                self.last_tsc = pending.tsc;
                true
            }
            _ => false,
        }
    }

    /// Positions the cursor after the newest message, for tailing from now on.
    pub fn fast_forward<R: MessageRegistry + ?Sized>(&mut self, registry: &mut R) {
        while self.skip(registry) {}
        if self.cur >= self.end {
            self.cur = self.start;
        }
    }

    /// Restarts at the beginning of the level after corruption, skipping
    /// anything not newer than the last message. Returns false if the cursor
    /// already is at the start.
    ///
    /// The failure count is cleared even when nothing moved, so a stuck
    /// position is reported again only after another full round of attempts
    /// instead of on every read.
    pub fn reset(&mut self) -> bool {
        self.corruption = 0;
        if self.cur == self.start {
            return false;
        }
        self.cur = self.start;
        self.last_tsc += 1;
        true
    }

    /// Positions the cursor at the oldest message still in the level.
    ///
    /// Walks forward from the start to the newest message, then walks back
    /// from the recorded wrap offset through the length bytes of the older
    /// messages to the first one the newest write did not clobber. Returns
    /// false on any corruption found along the way.
    pub fn rewind<R: MessageRegistry + ?Sized>(&mut self, registry: &mut R) -> bool {
        self.corruption = CORRUPTION_THRESHOLD;
        let wrap = self.region.load_u32(0) as usize;
        if wrap != 0 {
            while self.cur < self.end {
                match self.next(registry, u64::MAX) {
                    Ok(Some(pending)) => {
                        self.cur += pending.size();
                        self.last_tsc = pending.tsc;
                    }
                    Ok(None) => break,
                    Err(_) => return false,
                }
            }
            // The newest message's sentinel ends here.
            let split = self.cur + 8;
            let mut p = wrap;
            if p <= split {
                self.cur = self.start;
            } else {
                let mut moved = 0;
                while p >= split && p > self.start {
                    moved += 1;
                    self.cur = p;
                    p = p.saturating_sub(1 + self.region.load_u8(p - 1) as usize);
                }
                if p < split && moved == 1 {
                    self.cur = self.start;
                }
            }
            if self.cur >= self.end {
                self.cur = self.start;
            }
        }
        self.last_tsc = self.region.load_u64(self.cur);
        self.corruption = 0;
        true
    }
}
