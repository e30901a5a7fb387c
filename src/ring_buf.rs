//! Write side of one level.
//!
//! A level is a fixed byte region:
//!
//! ```text
//! [u32 wrap offset][msg][msg]...[u64 0 sentinel] ... [256-byte trailer of 0xFF]
//! msg = [u64 tsc][u32 id][payload][u8 12 + payload length]
//! ```
//!
//! The writer never takes a lock. A reader in another process sees a
//! message only once its length byte and the following zero sentinel are in
//! place; until then the sentinel left by the previous message (or a
//! mismatching length byte) makes the partial write observably incomplete.

use std::sync::atomic::{compiler_fence, Ordering};

use crate::clock;
use crate::layout::{CounterTable, RING_HEADER_SIZE, RING_TRAILER_SIZE};
use crate::region::RawRegion;
use crate::traceable::Traceable;

/// Bytes of framing around every payload: timestamp, id and length byte.
pub const MSG_OVERHEAD: usize = 13;
/// Largest payload that keeps a message plus its sentinel inside the trailer.
pub const MAX_PAYLOAD: usize = RING_TRAILER_SIZE - MSG_OVERHEAD - 8;
/// Hard cap for traced string lengths.
pub const MAX_STRING_LEN: usize = 80;
pub const DEFAULT_MAX_STRING_LEN: usize = 24;
/// Smallest usable level: header, one maximal message and the trailer.
pub const MIN_LEVEL_BYTES: usize = RING_HEADER_SIZE + RING_TRAILER_SIZE + 8;

/// Result of [`RingBuf::start`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket {
    pub tsc: u64,
    /// False when the id's off bit is set; nothing is written then.
    pub on: bool,
    /// The cursor wrapped to the start of the level before this message.
    pub wrapped: bool,
}

pub struct RingBuf {
    region: RawRegion,
    counters: CounterTable,
    end: usize,
    ptr: usize,
    msg_start: Option<usize>,
    overflowed: bool,
    max_string_len: usize,
}

impl RingBuf {
    /// Formats `region` as an empty level. The region must hold at least
    /// [`MIN_LEVEL_BYTES`].
    pub fn new(region: RawRegion, counters: CounterTable, max_string_len: usize) -> Self {
        debug_assert!(region.len() >= MIN_LEVEL_BYTES);
        let end = region.len().saturating_sub(RING_TRAILER_SIZE).max(RING_HEADER_SIZE);
        region.fill(end, RING_TRAILER_SIZE, 0xff);
        let mut rb = Self {
            region,
            counters,
            end,
            ptr: 0,
            msg_start: None,
            overflowed: false,
            max_string_len: max_string_len.min(MAX_STRING_LEN),
        };
        rb.wrap();
        rb.region.store_u64(rb.ptr, 0);
        rb
    }

    pub fn region(&self) -> RawRegion {
        self.region
    }

    /// Current write offset within the level.
    pub fn position(&self) -> usize {
        self.ptr
    }

    pub fn max_string_len(&self) -> usize {
        self.max_string_len
    }

    fn wrap(&mut self) {
        // The sentinel of the last message sits in the trailer; restore it.
        self.region.fill(self.ptr, 8, 0xff);
        self.region.store_u32(0, self.ptr as u32);
        self.ptr = RING_HEADER_SIZE;
    }

    /// Opens a message for `id`.
    #[inline]
    pub fn start(&mut self, id: u32) -> Ticket {
        self.counters.prefetch(id);
        let wrapped = self.ptr >= self.end;
        if wrapped {
            self.wrap();
        }
        let tsc = clock::tsc();
        let on = self.counters.hit(id, tsc);
        self.overflowed = false;
        if on {
            self.msg_start = Some(self.ptr);
            self.region.store_u64(self.ptr, tsc);
            self.region.store_u32(self.ptr + 8, id);
            self.ptr += 12;
        } else {
            self.msg_start = None;
        }
        Ticket { tsc, on, wrapped }
    }

    /// Appends raw payload bytes to the open message.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        let Some(start) = self.msg_start else { return };
        if self.overflowed || self.ptr - start - 12 + bytes.len() > MAX_PAYLOAD {
            self.overflowed = true;
            return;
        }
        self.region.write(self.ptr, bytes);
        self.ptr += bytes.len();
    }

    /// Appends a length-prefixed string truncated to the configured cap.
    #[inline]
    pub fn put_str(&mut self, s: &str) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(self.max_string_len);
        self.append(&[n as u8]);
        self.append(&bytes[..n]);
    }

    #[inline]
    pub fn put<T: Traceable + ?Sized>(&mut self, value: &T) {
        value.put(self);
    }

    /// Commits the open message. A message whose payload overflowed is
    /// abandoned instead: its timestamp is zeroed and the cursor restored.
    #[inline]
    pub fn end(&mut self) {
        let Some(start) = self.msg_start.take() else { return };
        if self.overflowed {
            self.region.store_u64(start, 0);
            self.ptr = start;
            return;
        }
        compiler_fence(Ordering::Release);
        self.region.store_u8(self.ptr, (self.ptr - start) as u8);
        self.ptr += 1;
        compiler_fence(Ordering::Release);
        self.region.store_u64(self.ptr, 0);
    }

    /// True while a message is open and has not overflowed.
    pub fn is_open(&self) -> bool {
        self.msg_start.is_some() && !self.overflowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MsgCounter;
    use crate::region::HeapArena;

    fn level(size: usize) -> (HeapArena, HeapArena, RingBuf) {
        let counters = HeapArena::new(MsgCounter::SIZE * 8).unwrap();
        let buf = HeapArena::new(size).unwrap();
        let rb = RingBuf::new(buf.region(), CounterTable::new(counters.region(), 8), 24);
        (counters, buf, rb)
    }

    #[test]
    fn test_fresh_level_layout() {
        let (_c, buf, rb) = level(1024);
        let bytes = buf.as_slice();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..12], &[0; 8]);
        assert!(bytes[1024 - 256..].iter().all(|b| *b == 0xff));
        assert_eq!(rb.position(), 4);
    }

    #[test]
    fn test_message_framing() {
        let (_c, buf, mut rb) = level(1024);
        let ticket = rb.start(3);
        assert!(ticket.on && !ticket.wrapped);
        rb.put(&7u32);
        rb.put_str("hello");
        rb.end();
        let r = buf.region();
        assert_eq!(r.load_u64(4), ticket.tsc);
        assert_eq!(r.load_u32(12), 3);
        assert_eq!(r.load_u32(16), 7);
        assert_eq!(r.load_u8(20), 5);
        assert_eq!(r.load_u8(26), 12 + 4 + 6);
        assert_eq!(r.load_u64(27), 0);
    }

    #[test]
    fn test_wrap_records_offset() {
        let (_c, buf, mut rb) = level(1024);
        let mut last_end = 0;
        let mut wrapped = false;
        for _ in 0..100 {
            let before = rb.position();
            let t = rb.start(1);
            if t.wrapped {
                wrapped = true;
                last_end = before;
                rb.end();
                break;
            }
            rb.append(&[0u8; 20]);
            rb.end();
        }
        assert!(wrapped);
        assert_eq!(buf.region().load_u32(0) as usize, last_end);
        assert!(last_end >= 1024 - 256);
        assert_eq!(buf.region().load_u64(last_end), u64::MAX);
    }

    #[test]
    fn test_oversized_payload_is_abandoned() {
        let (_c, buf, mut rb) = level(2048);
        rb.start(2);
        rb.append(&[1u8; MAX_PAYLOAD + 1]);
        rb.end();
        assert_eq!(rb.position(), 4);
        assert_eq!(buf.region().load_u64(4), 0);
    }

    #[test]
    fn test_disabled_id_writes_nothing() {
        let (counters, _buf, mut rb) = level(1024);
        let table = CounterTable::new(counters.region(), 8);
        table.set_disabled(5, true);
        let t = rb.start(5);
        rb.put(&1u64);
        rb.end();
        assert!(!t.on);
        assert_eq!(rb.position(), 4);
        assert_eq!(table.get(5).count, 1);
    }
}
