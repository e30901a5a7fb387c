//! Payload decoding and template rendering for the reader.
//!
//! A dictionary entry names its parameters with a comma separated type key
//! (`"i,p,OPTq"`). Each key resolves to a [`ParamCodec`] in a [`ParamTable`];
//! a [`MessageFormatter`] pairs the codecs with the placeholders of the
//! template.

use std::collections::HashMap;
use std::fmt::{self, Write};
use std::sync::Arc;

use crate::error::FormatError;

/// Keys starting with this wrap an inner key in a presence byte.
pub const OPTIONAL_PREFIX: &str = "OPT";
/// Key of the embedded `(seconds, microseconds)` pair on line-0 messages.
pub const WALL_CLOCK_KEY: &str = "w";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Radix {
    /// Integers as unsigned decimal.
    #[default]
    Decimal,
    /// Integers sign-extended from their encoded width.
    Signed,
    Hex,
}

/// How one placeholder wants its value shown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Spec {
    pub radix: Radix,
    pub width: Option<usize>,
    pub precision: Option<usize>,
    pub zero_pad: bool,
    /// Pad on the right instead of the left.
    pub left: bool,
    pub plus: bool,
    /// Emit `0x` in front of the value.
    pub prefix: bool,
}

impl Spec {
    fn is_plain(&self) -> bool {
        self.width.is_none() && !self.plus && !self.prefix
    }
}

/// Decoder for one parameter type.
///
/// Both methods look at the bytes starting at the parameter and report how
/// many of them the value occupies; `None` means `buf` cannot hold a valid
/// value.
pub trait ParamCodec: Send + Sync {
    fn length(&self, buf: &[u8]) -> Option<usize>;
    fn render(&self, buf: &[u8], spec: &Spec, out: &mut String) -> Option<usize>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Builtin {
    U8,
    U16,
    U32,
    U64,
    Char,
    Str,
    Bool,
    F32,
    F64,
    WallClock,
}

impl Builtin {
    const ALL: [(&'static str, Builtin); 10] = [
        ("u", Builtin::U8),
        ("s", Builtin::U16),
        ("i", Builtin::U32),
        ("q", Builtin::U64),
        ("c", Builtin::Char),
        ("p", Builtin::Str),
        ("b", Builtin::Bool),
        ("f", Builtin::F32),
        ("d", Builtin::F64),
        (WALL_CLOCK_KEY, Builtin::WallClock),
    ];
}

fn array_at<const N: usize>(buf: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[..N]);
    out
}

impl ParamCodec for Builtin {
    fn length(&self, buf: &[u8]) -> Option<usize> {
        let n = match self {
            Builtin::U8 | Builtin::Char | Builtin::Bool => 1,
            Builtin::U16 => 2,
            Builtin::U32 | Builtin::F32 => 4,
            Builtin::U64 | Builtin::F64 => 8,
            Builtin::WallClock => 16,
            Builtin::Str => 1 + *buf.first()? as usize,
        };
        (n <= buf.len()).then_some(n)
    }

    fn render(&self, buf: &[u8], spec: &Spec, out: &mut String) -> Option<usize> {
        let n = self.length(buf)?;
        match self {
            Builtin::U8 => push_int(buf[0] as u64, 8, spec, out),
            Builtin::U16 => push_int(u16::from_ne_bytes(array_at(buf)) as u64, 16, spec, out),
            Builtin::U32 => push_int(u32::from_ne_bytes(array_at(buf)) as u64, 32, spec, out),
            Builtin::U64 => push_int(u64::from_ne_bytes(array_at(buf)), 64, spec, out),
            Builtin::Char => push_char(buf[0], out),
            Builtin::Str => out.push_str(&String::from_utf8_lossy(&buf[1..n])),
            Builtin::Bool => out.push_str(if buf[0] != 0 { "True" } else { "False" }),
            Builtin::F32 => push_float(f32::from_ne_bytes(array_at(buf)) as f64, spec, out),
            Builtin::F64 => push_float(f64::from_ne_bytes(array_at(buf)), spec, out),
            Builtin::WallClock => {}
        }
        Some(n)
    }
}

fn push_int(value: u64, bits: u32, spec: &Spec, out: &mut String) {
    let _ = match spec.radix {
        Radix::Decimal => write!(out, "{}", value),
        Radix::Hex => write!(out, "{:x}", value),
        Radix::Signed => {
            let shift = 64 - bits;
            write!(out, "{}", ((value << shift) as i64) >> shift)
        }
    };
}

fn push_char(byte: u8, out: &mut String) {
    match byte {
        b'\n' => out.push_str("\\n"),
        b'\r' => out.push_str("\\r"),
        b'\t' => out.push_str("\\t"),
        b'\'' => out.push_str("\\'"),
        b'\\' => out.push_str("\\\\"),
        b' '..=b'~' => out.push(byte as char),
        _ => {
            let _ = write!(out, "\\x{:02x}", byte);
        }
    }
}

/// Floats keep at most six decimals with trailing zeros trimmed down to one
/// (`123.4`, `123.0`), unless the placeholder asks for a fixed precision.
fn push_float(value: f64, spec: &Spec, out: &mut String) {
    if value.is_nan() {
        out.push_str("nan");
    } else if value.is_infinite() {
        out.push_str(if value > 0.0 { "inf" } else { "-inf" });
    } else if let Some(precision) = spec.precision {
        let _ = write!(out, "{:.*}", precision, value);
    } else if spec.width.is_some() {
        let _ = write!(out, "{:.6}", value);
    } else {
        let text = format!("{:.6}", value);
        let trimmed = text.trim_end_matches('0');
        out.push_str(trimmed);
        if trimmed.ends_with('.') {
            out.push('0');
        }
    }
}

/// `OPT<key>`: a presence byte followed by the inner value when non-zero.
struct Optional(Arc<dyn ParamCodec>);

impl ParamCodec for Optional {
    fn length(&self, buf: &[u8]) -> Option<usize> {
        match *buf.first()? {
            0 => Some(1),
            _ => Some(1 + self.0.length(&buf[1..])?),
        }
    }

    fn render(&self, buf: &[u8], spec: &Spec, out: &mut String) -> Option<usize> {
        match *buf.first()? {
            0 => {
                out.push_str("OptionalNone");
                Some(1)
            }
            _ => Some(1 + self.0.render(&buf[1..], spec, out)?),
        }
    }
}

/// Parameter codecs by type key.
///
/// Starts with the built-in keys. Prefixed keys such as `OPTq` are built on
/// first lookup and remembered.
#[derive(Clone)]
pub struct ParamTable {
    codecs: HashMap<String, Arc<dyn ParamCodec>>,
}

impl Default for ParamTable {
    fn default() -> Self {
        let codecs = Builtin::ALL
            .iter()
            .map(|(key, codec)| (key.to_string(), Arc::new(*codec) as Arc<dyn ParamCodec>))
            .collect();
        Self { codecs }
    }
}

impl fmt::Debug for ParamTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.codecs.keys().collect();
        keys.sort();
        f.debug_struct("ParamTable").field("keys", &keys).finish()
    }
}

impl ParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the codec for `key`.
    pub fn register(
        &mut self,
        key: impl Into<String>,
        codec: Arc<dyn ParamCodec>,
    ) -> Result<(), FormatError> {
        let key = key.into();
        if key.starts_with(OPTIONAL_PREFIX) {
            return Err(FormatError::ReservedKey(key));
        }
        self.codecs.insert(key, codec);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.codecs.contains_key(key)
    }

    pub fn resolve(&mut self, key: &str) -> Option<Arc<dyn ParamCodec>> {
        if let Some(codec) = self.codecs.get(key) {
            return Some(Arc::clone(codec));
        }
        let inner = key.strip_prefix(OPTIONAL_PREFIX)?;
        let codec: Arc<dyn ParamCodec> = Arc::new(Optional(self.resolve(inner)?));
        self.codecs.insert(key.to_string(), Arc::clone(&codec));
        Some(codec)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Piece {
    Text(String),
    Value(Spec),
}

/// Renders the payload of one message id.
pub struct MessageFormatter {
    id: u32,
    file: String,
    line: u32,
    template: String,
    type_key: String,
    params: Vec<Arc<dyn ParamCodec>>,
    wall_clock: bool,
    pieces: Vec<Piece>,
}

impl fmt::Debug for MessageFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFormatter")
            .field("id", &self.id)
            .field("file", &self.file)
            .field("line", &self.line)
            .field("template", &self.template)
            .field("type_key", &self.type_key)
            .finish()
    }
}

impl MessageFormatter {
    pub fn new(
        id: u32,
        file: impl Into<String>,
        line: u32,
        template: impl Into<String>,
        type_key: impl Into<String>,
        table: &mut ParamTable,
    ) -> Result<Self, FormatError> {
        let (file, template, type_key) = (file.into(), template.into(), type_key.into());
        let mut keys: Vec<&str> = type_key.split(',').filter(|k| !k.is_empty()).collect();

        // Line 0 marks a `(sec, usec)` pair in front of the real parameters.
        let wall_clock = line == 0 && keys.len() >= 2 && keys[0] == "q" && keys[1] == "q";
        if wall_clock {
            keys[1] = WALL_CLOCK_KEY;
            keys.remove(0);
        }

        let mut params = Vec::with_capacity(keys.len());
        for key in &keys {
            let codec = table
                .resolve(key)
                .ok_or_else(|| FormatError::UnsupportedKey(key.to_string()))?;
            params.push(codec);
        }

        let values = params.len() - wall_clock as usize;
        let mut pieces = parse_template(&template);
        let placeholders = pieces.iter().filter(|p| matches!(p, Piece::Value(_))).count();
        if placeholders != values {
            pieces = mismatch_pieces(&template, values);
        }

        Ok(Self { id, file, line, template, type_key, params, wall_clock, pieces })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn type_key(&self) -> &str {
        &self.type_key
    }

    pub fn has_wall_clock(&self) -> bool {
        self.wall_clock
    }

    /// Total encoded size of the parameters at the start of `payload`.
    pub fn length(&self, payload: &[u8]) -> Option<usize> {
        let mut off = 0;
        for codec in &self.params {
            off += codec.length(payload.get(off..)?)?;
        }
        Some(off)
    }

    /// Appends the rendered text and returns the number of payload bytes
    /// consumed. `None` if the payload does not decode.
    pub fn render(&self, payload: &[u8], out: &mut String) -> Option<usize> {
        let mut params = self.params.iter();
        let mut off = 0;
        if self.wall_clock {
            off += params.next()?.length(payload)?;
        }
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Value(spec) => {
                    let codec = params.next()?;
                    off += render_value(codec.as_ref(), payload.get(off..)?, spec, out)?;
                }
            }
        }
        Some(off)
    }

    /// The embedded `(seconds, microseconds)` of a line-0 message.
    pub fn wall_clock(&self, payload: &[u8]) -> Option<(u64, u64)> {
        if !self.wall_clock || payload.len() < 16 {
            return None;
        }
        Some((
            u64::from_ne_bytes(array_at(payload)),
            u64::from_ne_bytes(array_at(&payload[8..])),
        ))
    }
}

fn render_value(codec: &dyn ParamCodec, buf: &[u8], spec: &Spec, out: &mut String) -> Option<usize> {
    if spec.is_plain() {
        return codec.render(buf, spec, out);
    }
    let mut text = String::new();
    let n = codec.render(buf, spec, &mut text)?;
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None if spec.plus && text.starts_with(|c: char| c.is_ascii_digit()) => ("+", text.as_str()),
        None => ("", text.as_str()),
    };
    let prefix = if spec.prefix { "0x" } else { "" };
    let used = sign.len() + prefix.len() + digits.chars().count();
    let pad = spec.width.unwrap_or(0).saturating_sub(used);
    let numeric = digits.starts_with(|c: char| {
        c.is_ascii_digit() || (spec.radix == Radix::Hex && c.is_ascii_hexdigit())
    });
    if spec.left {
        out.push_str(sign);
        out.push_str(prefix);
        out.push_str(digits);
        out.extend(std::iter::repeat(' ').take(pad));
        return Some(n);
    }
    if spec.zero_pad && numeric {
        out.push_str(sign);
        out.push_str(prefix);
        out.extend(std::iter::repeat('0').take(pad));
    } else {
        out.extend(std::iter::repeat(' ').take(pad));
        out.push_str(sign);
        out.push_str(prefix);
    }
    out.push_str(digits);
    Some(n)
}

/// `template % (v1,v2) ` for entries whose placeholders and parameters
/// disagree.
fn mismatch_pieces(template: &str, values: usize) -> Vec<Piece> {
    let mut pieces = vec![Piece::Text(format!("{} % (", template))];
    for i in 0..values {
        if i > 0 {
            pieces.push(Piece::Text(",".to_string()));
        }
        pieces.push(Piece::Value(Spec::default()));
    }
    pieces.push(Piece::Text(") ".to_string()));
    pieces
}

fn parse_template(template: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}', '%']) {
        text.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let (consumed, spec) = if tail.starts_with("{{") {
            text.push('{');
            (2, None)
        } else if tail.starts_with("}}") {
            text.push('}');
            (2, None)
        } else if tail.starts_with("%%") {
            text.push('%');
            (2, None)
        } else if tail.starts_with('{') {
            match tail.find('}').and_then(|end| Some((end + 1, brace_spec(&tail[1..end])?))) {
                Some((len, spec)) => (len, Some(spec)),
                None => {
                    text.push('{');
                    (1, None)
                }
            }
        } else if tail.starts_with('%') {
            match printf_spec(tail) {
                Some((len, spec)) => (len, Some(spec)),
                None => {
                    text.push('%');
                    (1, None)
                }
            }
        } else {
            text.push('}');
            (1, None)
        };
        if let Some(spec) = spec {
            if !text.is_empty() {
                pieces.push(Piece::Text(std::mem::take(&mut text)));
            }
            pieces.push(Piece::Value(spec));
        }
        rest = &tail[consumed..];
    }
    text.push_str(rest);
    if !text.is_empty() {
        pieces.push(Piece::Text(text));
    }
    pieces
}

fn take_number(s: &str) -> (Option<usize>, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    (s[..end].parse().ok(), &s[end..])
}

/// `{}`, `{:x}`, `{:#x}`, `{:?}`, `{:08.3}` and friends.
fn brace_spec(inner: &str) -> Option<Spec> {
    let mut spec = Spec::default();
    if inner.is_empty() {
        return Some(spec);
    }
    let mut s = inner.strip_prefix(':')?;
    if let Some(rest) = s.strip_prefix('+') {
        spec.plus = true;
        s = rest;
    }
    if let Some(rest) = s.strip_prefix('#') {
        spec.prefix = true;
        s = rest;
    }
    if let Some(rest) = s.strip_prefix('0') {
        spec.zero_pad = true;
        s = rest;
    }
    let (width, rest) = take_number(s);
    spec.width = width;
    s = rest;
    if let Some(rest) = s.strip_prefix('.') {
        let (precision, rest) = take_number(rest);
        spec.precision = Some(precision.unwrap_or(0));
        s = rest;
    }
    match s {
        "" | "?" => spec.prefix = false,
        "x" | "X" => spec.radix = Radix::Hex,
        _ => return None,
    }
    Some(spec)
}

/// A printf conversion at the start of `s` (which begins with `%`).
/// Returns its length and the placeholder it stands for.
fn printf_spec(s: &str) -> Option<(usize, Spec)> {
    let bytes = s.as_bytes();
    let mut spec = Spec::default();
    let mut i = 1;
    while let Some(&flag) = bytes.get(i).filter(|b| b"#0- +'I".contains(*b)) {
        match flag {
            b'+' => spec.plus = true,
            b'0' => spec.zero_pad = true,
            b'-' => spec.left = true,
            _ => {}
        }
        i += 1;
    }
    let (width, rest) = take_number(&s[i..]);
    spec.width = width;
    i = s.len() - rest.len();
    if bytes.get(i) == Some(&b'.') {
        let (precision, rest) = take_number(&s[i + 1..]);
        spec.precision = Some(precision.unwrap_or(0));
        i = s.len() - rest.len();
    }
    while bytes.get(i).is_some_and(|b| b"hlqLjzZt".contains(b)) {
        i += 1;
    }
    let conversion = *bytes.get(i).filter(|b| b.is_ascii_alphabetic())?;
    match conversion {
        b'd' | b'i' => spec.radix = Radix::Signed,
        b'x' | b'X' => spec.radix = Radix::Hex,
        b'p' => {
            spec.radix = Radix::Hex;
            spec.prefix = true;
        }
        _ => {}
    }
    Some((i + 1, spec))
}
