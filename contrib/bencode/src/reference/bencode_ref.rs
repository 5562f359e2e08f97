use std::collections::BTreeMap;
use std::str;

use crate::access::bencode::{BRefAccess, RefKind};
use crate::access::dict::BDictAccess;
use crate::access::list::BListAccess;
use crate::error::{BencodeParseError, BencodeParseResult};
use crate::reference::decode;
use crate::reference::decode_opt::BDecodeOpt;

/// Bencode object that holds references to the underlying data.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Inner<'a> {
    /// Bencode Integer.
    Int(i64, &'a [u8]),
    /// Bencode Bytes.
    Bytes(&'a [u8], &'a [u8]),
    /// Bencode List and whether it and everything below it was ordered.
    List(Vec<BencodeRef<'a>>, &'a [u8], bool),
    /// Bencode Dictionary and whether it and everything below it was ordered.
    Dict(BTreeMap<&'a [u8], BencodeRef<'a>>, &'a [u8], bool),
}

impl<'a> From<Inner<'a>> for BencodeRef<'a> {
    fn from(inner: Inner<'a>) -> Self {
        BencodeRef { inner }
    }
}

/// `BencodeRef` object that stores references to some buffer.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct BencodeRef<'a> {
    inner: Inner<'a>,
}

impl<'a> BencodeRef<'a> {
    /// Decode the given bytes into a `BencodeRef` using the given decode options.
    #[allow(clippy::missing_errors_doc)]
    pub fn decode(bytes: &'a [u8], opts: BDecodeOpt) -> BencodeParseResult<BencodeRef<'a>> {
        let (bencode, end_pos) = decode::decode(bytes, 0, opts, 0)?;

        if end_pos != bytes.len() && opts.enforce_full_decode() {
            return Err(BencodeParseError::BytesEmpty { pos: end_pos });
        }

        Ok(bencode)
    }

    /// Get a byte slice of the current bencode byte representation.
    #[must_use]
    pub fn buffer(&self) -> &'a [u8] {
        match self.inner {
            Inner::Int(_, buffer) | Inner::Bytes(_, buffer) | Inner::List(_, buffer, _) | Inner::Dict(_, buffer, _) => buffer,
        }
    }

    /// False if this value is, or contains, a dictionary whose keys were
    /// not in ascending order on the wire. Observational: such input still
    /// decodes.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        match self.inner {
            Inner::Int(..) | Inner::Bytes(..) => true,
            Inner::List(_, _, ordered) | Inner::Dict(_, _, ordered) => ordered,
        }
    }

    /// Attempt to access the bytes with the lifetime of the backing buffer.
    #[must_use]
    pub fn bytes_ext(&self) -> Option<&'a [u8]> {
        match self.inner {
            Inner::Bytes(bytes, _) => Some(bytes),
            _ => None,
        }
    }

    /// Attempt to access the value as a `str` with the lifetime of the
    /// backing buffer.
    #[must_use]
    pub fn str_ext(&self) -> Option<&'a str> {
        str::from_utf8(self.bytes_ext()?).ok()
    }
}

impl<'a> BRefAccess for BencodeRef<'a> {
    type BKey = &'a [u8];
    type BType = BencodeRef<'a>;

    fn kind<'b>(&'b self) -> RefKind<'b, &'a [u8], BencodeRef<'a>> {
        match self.inner {
            Inner::Int(value, _) => RefKind::Int(value),
            Inner::Bytes(value, _) => RefKind::Bytes(value),
            Inner::List(ref value, _, _) => RefKind::List(value),
            Inner::Dict(ref value, _, _) => RefKind::Dict(value),
        }
    }

    fn str(&self) -> Option<&str> {
        self.str_ext()
    }

    fn int(&self) -> Option<i64> {
        match self.inner {
            Inner::Int(value, _) => Some(value),
            _ => None,
        }
    }

    fn bytes(&self) -> Option<&[u8]> {
        self.bytes_ext()
    }

    fn list(&self) -> Option<&dyn BListAccess<BencodeRef<'a>>> {
        match self.inner {
            Inner::List(ref value, _, _) => Some(value),
            _ => None,
        }
    }

    fn dict(&self) -> Option<&dyn BDictAccess<&'a [u8], BencodeRef<'a>>> {
        match self.inner {
            Inner::Dict(ref value, _, _) => Some(value),
            _ => None,
        }
    }
}
