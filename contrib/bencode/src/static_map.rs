//! One-pass binding of a fixed key set to indexed slots.
//!
//! Wire formats like the DHT message format use a small, known set of keys
//! inside (possibly nested) dictionaries. Materializing a full value tree
//! for every incoming packet is wasteful; this module scans the bencoded
//! buffer once, routes the keys it recognizes into caller-provided slots and
//! skips everything else.
//!
//! Keys are written in a compact dotted syntax:
//!
//! | key           | meaning                                             |
//! |---------------|-----------------------------------------------------|
//! | `port`        | top-level integer                                   |
//! | `a::id*S`     | byte string inside the top-level dict `a`           |
//! | `e[]*`        | positional list element, kept as a raw slice        |
//!
//! Suffixes select how the matched value is captured: no suffix expects an
//! integer, `*` keeps the raw bencoded slice of any value, `*S` a byte
//! string, `*L` a raw list slice and `*M` a raw dictionary slice. A matched
//! key whose value has the wrong type leaves the slot `Empty`; missing keys
//! do too. Only structurally malformed bencode fails the scan.
use crate::error::{BencodeParseError, BencodeParseResult};
use crate::reference::decode::skip_value;

/// Maximum byte length of one key in a static map table.
pub const MAX_KEY_SIZE: usize = 24;

/// One entry of a static map key table: the slot index it fills and the
/// dotted key that matches it.
#[derive(Debug, Clone, Copy)]
pub struct MapKey {
    pub index: usize,
    pub key: &'static str,
}

impl MapKey {
    #[must_use]
    pub const fn new(index: usize, key: &'static str) -> MapKey {
        MapKey { index, key }
    }
}

/// A value captured for one table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Slot<'a> {
    /// Key missing from the input, or present with a non-matching type.
    #[default]
    Empty,
    /// Integer value (table entry without a suffix).
    Int(i64),
    /// Raw bencoded slice of the whole value (`*`).
    Raw(&'a [u8]),
    /// Contents of a byte string (`*S`).
    Bytes(&'a [u8]),
    /// Raw bencoded slice of a list (`*L`).
    List(&'a [u8]),
    /// Raw bencoded slice of a dictionary (`*M`).
    Dict(&'a [u8]),
}

impl<'a> Slot<'a> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    #[must_use]
    pub fn int(&self) -> Option<i64> {
        match self {
            Slot::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn bytes(&self) -> Option<&'a [u8]> {
        match self {
            Slot::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The raw bencoded slice for `*`, `*L` and `*M` captures.
    #[must_use]
    pub fn raw(&self) -> Option<&'a [u8]> {
        match self {
            Slot::Raw(raw) | Slot::List(raw) | Slot::Dict(raw) => Some(raw),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    Int,
    Raw,
    Str,
    List,
    Map,
}

#[derive(Debug, Clone, Copy)]
struct ParsedKey {
    index: usize,
    group: Option<&'static str>,
    name: &'static str,
    positional: bool,
    capture: Capture,
}

/// Key tables are compile-time constants, so a malformed entry is a
/// programming error and panics.
fn parse_key(entry: &MapKey) -> ParsedKey {
    let key = entry.key;
    assert!(!key.is_empty() && key.len() <= MAX_KEY_SIZE, "invalid static map key: {key:?}");

    let (path, capture) = if let Some(path) = key.strip_suffix("*S") {
        (path, Capture::Str)
    } else if let Some(path) = key.strip_suffix("*L") {
        (path, Capture::List)
    } else if let Some(path) = key.strip_suffix("*M") {
        (path, Capture::Map)
    } else if let Some(path) = key.strip_suffix('*') {
        (path, Capture::Raw)
    } else {
        (key, Capture::Int)
    };

    let (group, leaf) = match path.split_once("::") {
        Some((group, leaf)) => {
            assert!(!leaf.contains("::"), "static map keys nest at most one level: {key:?}");
            (Some(group), leaf)
        }
        None => (None, path),
    };

    let (name, positional) = match leaf.strip_suffix("[]") {
        Some(name) => (name, true),
        None => (leaf, false),
    };

    assert!(!name.is_empty(), "invalid static map key: {key:?}");
    assert!(
        !(positional && group.is_some()),
        "positional keys must be top level: {key:?}"
    );

    ParsedKey {
        index: entry.index,
        group,
        name,
        positional,
        capture,
    }
}

/// Scans one bencoded dictionary and fills `slots` according to `keys`.
///
/// # Errors
///
/// Will return an error when the input is not structurally valid bencode or
/// does not start with a dictionary. Unknown keys and type mismatches on
/// known keys are not errors.
///
/// # Panics
///
/// Will panic if the key table itself is malformed or a table index is out
/// of `slots` bounds.
pub fn read_static_map<'a>(bytes: &'a [u8], keys: &[MapKey], slots: &mut [Slot<'a>]) -> BencodeParseResult<()> {
    let parsed: Vec<ParsedKey> = keys.iter().map(parse_key).collect();

    for slot in slots.iter_mut() {
        *slot = Slot::Empty;
    }

    if bytes.first() != Some(&crate::DICT_START) {
        return Err(BencodeParseError::InvalidByte { pos: 0 });
    }

    let mut pos = 1;

    while next_byte(bytes, pos)? != crate::BEN_END {
        let (key, value_pos) = read_key(bytes, pos)?;
        let value_end = skip_value(bytes, value_pos)?;
        let value = &bytes[value_pos..value_end];

        if parsed.iter().any(|k| k.group.map(str::as_bytes) == Some(key)) {
            read_group(value, key, &parsed, slots)?;
        } else if let Some(entry) = parsed.iter().find(|k| k.group.is_none() && !k.positional && k.name.as_bytes() == key) {
            fill_slot(&mut slots[entry.index], entry.capture, value);
        } else if parsed.iter().any(|k| k.positional && k.name.as_bytes() == key) {
            read_positional(value, key, &parsed, slots)?;
        }

        pos = value_end;
    }

    Ok(())
}

fn read_group<'a>(value: &'a [u8], group: &[u8], parsed: &[ParsedKey], slots: &mut [Slot<'a>]) -> BencodeParseResult<()> {
    if value.first() != Some(&crate::DICT_START) {
        // A recognized group of the wrong type: all its slots stay empty.
        return Ok(());
    }

    let mut pos = 1;

    while next_byte(value, pos)? != crate::BEN_END {
        let (key, value_pos) = read_key(value, pos)?;
        let value_end = skip_value(value, value_pos)?;

        if let Some(entry) = parsed
            .iter()
            .find(|k| k.group.map(str::as_bytes) == Some(group) && k.name.as_bytes() == key)
        {
            fill_slot(&mut slots[entry.index], entry.capture, &value[value_pos..value_end]);
        }

        pos = value_end;
    }

    Ok(())
}

fn read_positional<'a>(value: &'a [u8], name: &[u8], parsed: &[ParsedKey], slots: &mut [Slot<'a>]) -> BencodeParseResult<()> {
    if value.first() != Some(&crate::LIST_START) {
        return Ok(());
    }

    let mut entries = parsed.iter().filter(|k| k.positional && k.name.as_bytes() == name);
    let mut pos = 1;

    while next_byte(value, pos)? != crate::BEN_END {
        let value_end = skip_value(value, pos)?;

        match entries.next() {
            Some(entry) => fill_slot(&mut slots[entry.index], entry.capture, &value[pos..value_end]),
            None => break,
        }

        pos = value_end;
    }

    Ok(())
}

fn fill_slot<'a>(slot: &mut Slot<'a>, capture: Capture, value: &'a [u8]) {
    let first = value.first().copied().unwrap_or(0);

    *slot = match capture {
        Capture::Raw => Slot::Raw(value),
        Capture::Int if first == crate::INT_START => match parse_int_value(value) {
            Some(int) => Slot::Int(int),
            None => Slot::Empty,
        },
        Capture::Str if first.is_ascii_digit() => match value.iter().position(|b| *b == crate::BYTE_LEN_END) {
            Some(delim) => Slot::Bytes(&value[delim + 1..]),
            None => Slot::Empty,
        },
        Capture::List if first == crate::LIST_START => Slot::List(value),
        Capture::Map if first == crate::DICT_START => Slot::Dict(value),
        _ => Slot::Empty,
    };
}

fn parse_int_value(value: &[u8]) -> Option<i64> {
    let inner = value.strip_prefix(b"i")?.strip_suffix(b"e")?;
    std::str::from_utf8(inner).ok()?.parse().ok()
}

fn read_key(bytes: &[u8], pos: usize) -> BencodeParseResult<(&[u8], usize)> {
    let key_end = skip_value(bytes, pos)?;
    let key = &bytes[pos..key_end];

    let delim = key
        .iter()
        .position(|b| *b == crate::BYTE_LEN_END)
        .ok_or(BencodeParseError::InvalidByte { pos })?;

    Ok((&key[delim + 1..], key_end))
}

fn next_byte(bytes: &[u8], pos: usize) -> BencodeParseResult<u8> {
    bytes.get(pos).copied().ok_or(BencodeParseError::BytesEmpty { pos })
}
