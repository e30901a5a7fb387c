//! Message id → formatter lookup for readers.
//!
//! Dictionary entries follow the file trailer:
//!
//! ```text
//! "<tsc> <file> <line> <id> " [i32 len][template\0] [i32 len][type key\0]
//! ```
//!
//! Version 2 files omit `<id> `; ids are then the 1-based position of the
//! entry. Writers keep appending while a reader runs, so the registry parses
//! incrementally and only consults the file again when asked for an id it
//! has not seen yet.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::{debug, warn};

use crate::format::{MessageFormatter, ParamTable};

const READ_CHUNK: usize = 64 * 1024;

/// Source of formatters for the decoder.
pub trait MessageRegistry {
    /// Formatter for `id`, loading more entries when it is not known yet.
    fn resolve(&mut self, id: u32) -> Option<&MessageFormatter>;

    /// Formatter for an id that has already been resolved.
    fn get(&self, id: u32) -> Option<&MessageFormatter>;
}

#[derive(Debug, PartialEq, Eq)]
struct RawEntry {
    id: Option<u32>,
    file: String,
    line: u32,
    template: String,
    type_key: String,
}

/// Dictionary of one trace file.
#[derive(Debug)]
pub struct DictionaryRegistry {
    file: File,
    version: u32,
    /// File offset of the first byte not yet parsed.
    offset: u64,
    /// Bytes of an incomplete trailing entry.
    pending: Vec<u8>,
    entries: u32,
    formatters: HashMap<u32, MessageFormatter>,
    unsupported: HashSet<u32>,
    table: ParamTable,
}

impl DictionaryRegistry {
    pub fn open(path: impl AsRef<Path>, version: u32, offset: u64) -> io::Result<Self> {
        Self::from_file(File::open(path)?, version, offset, ParamTable::new())
    }

    /// Uses an already open handle, so the dictionary always belongs to the
    /// same file as a mapping made from that handle.
    pub fn from_file(file: File, version: u32, offset: u64, table: ParamTable) -> io::Result<Self> {
        let mut registry = Self {
            file,
            version,
            offset,
            pending: Vec::new(),
            entries: 0,
            formatters: HashMap::new(),
            unsupported: HashSet::new(),
            table,
        };
        registry.refresh()?;
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.formatters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formatters.is_empty()
    }

    /// Reads whatever the writers appended since the last call. Returns the
    /// number of new entries.
    pub fn refresh(&mut self) -> io::Result<usize> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = match self.file.read_at(&mut chunk, self.offset) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                break;
            }
            self.offset += n as u64;
            self.pending.extend_from_slice(&chunk[..n]);
        }
        let before = self.entries;
        self.parse_pending();
        let added = (self.entries - before) as usize;
        if added > 0 {
            debug!(entries = self.entries, added, "dictionary grew");
        }
        Ok(added)
    }

    fn parse_pending(&mut self) {
        let mut pos = 0;
        while let Some((entry, used)) = parse_entry(&self.pending[pos..], self.version) {
            pos += used;
            self.entries += 1;
            let id = entry.id.unwrap_or(self.entries);
            self.insert(id, entry);
        }
        self.pending.drain(..pos);
    }

    fn insert(&mut self, id: u32, entry: RawEntry) {
        if self.formatters.contains_key(&id) || self.unsupported.contains(&id) {
            return;
        }
        match MessageFormatter::new(
            id,
            entry.file,
            entry.line,
            entry.template,
            entry.type_key,
            &mut self.table,
        ) {
            Ok(formatter) => {
                self.formatters.insert(id, formatter);
            }
            Err(e) => {
                warn!(id, error = %e, "skipping dictionary entry");
                self.unsupported.insert(id);
            }
        }
    }
}

impl MessageRegistry for DictionaryRegistry {
    fn resolve(&mut self, id: u32) -> Option<&MessageFormatter> {
        if !self.formatters.contains_key(&id) && !self.unsupported.contains(&id) {
            if let Err(e) = self.refresh() {
                debug!(error = %e, "dictionary refresh failed");
            }
        }
        self.formatters.get(&id)
    }

    fn get(&self, id: u32) -> Option<&MessageFormatter> {
        self.formatters.get(&id)
    }
}

/// In-memory registry, for tests and for embedding a decoder without a file.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    formatters: HashMap<u32, MessageFormatter>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, formatter: MessageFormatter) {
        self.formatters.entry(formatter.id()).or_insert(formatter);
    }
}

impl MessageRegistry for StaticRegistry {
    fn resolve(&mut self, id: u32) -> Option<&MessageFormatter> {
        self.formatters.get(&id)
    }

    fn get(&self, id: u32) -> Option<&MessageFormatter> {
        self.formatters.get(&id)
    }
}

/// Space terminated token.
fn token(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let end = buf.iter().position(|b| *b == b' ')?;
    Some((&buf[..end], &buf[end + 1..]))
}

fn number<T: std::str::FromStr>(buf: &[u8]) -> Option<(T, &[u8])> {
    let (digits, rest) = token(buf)?;
    let value = std::str::from_utf8(digits).ok()?.parse().ok()?;
    Some((value, rest))
}

/// `[i32 len][bytes incl. NUL]`
fn counted(buf: &[u8]) -> Option<(String, &[u8])> {
    let len = i32::from_ne_bytes(buf.get(..4)?.try_into().ok()?);
    let len = usize::try_from(len).ok()?;
    let body = buf.get(4..4 + len)?;
    let text = body.strip_suffix(&[0]).unwrap_or(body);
    Some((String::from_utf8_lossy(text).into_owned(), &buf[4 + len..]))
}

/// One complete entry at the start of `buf` and its size; `None` when the
/// entry is incomplete (or the bytes are not an entry at all).
fn parse_entry(buf: &[u8], version: u32) -> Option<(RawEntry, usize)> {
    let (_tsc, rest) = number::<u64>(buf)?;
    let (file, rest) = token(rest)?;
    let (line, rest) = number::<u32>(rest)?;
    let (id, rest) = if version >= 3 {
        let (id, rest) = number::<u32>(rest)?;
        (Some(id), rest)
    } else {
        (None, rest)
    };
    let (template, rest) = counted(rest)?;
    let (type_key, rest) = counted(rest)?;
    let entry = RawEntry {
        id,
        file: String::from_utf8_lossy(file).into_owned(),
        line,
        template,
        type_key,
    };
    Some((entry, buf.len() - rest.len()))
}

/// Bytes of one dictionary entry as writers append it.
pub fn encode_entry(
    tsc: u64,
    file: &str,
    line: u32,
    id: u32,
    template: &str,
    type_key: &str,
) -> Vec<u8> {
    let mut out = format!("{} {} {} {} ", tsc, file, line, id).into_bytes();
    for text in [template, type_key] {
        out.extend_from_slice(&(text.len() as i32 + 1).to_ne_bytes());
        out.extend_from_slice(text.as_bytes());
        out.push(0);
    }
    out
}
