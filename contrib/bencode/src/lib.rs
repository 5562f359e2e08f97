//! Library for parsing and converting bencoded data.
//!
//! # Examples
//!
//! Decoding bencoded data:
//!
//! ```rust
//!     use bencode::{BencodeRef, BRefAccess, BDecodeOpt};
//!
//!     let data = b"d12:lucky_numberi7ee"; // cspell:disable-line
//!     let bencode = BencodeRef::decode(data, BDecodeOpt::default()).unwrap();
//!
//!     assert_eq!(7, bencode.dict().unwrap().lookup("lucky_number".as_bytes())
//!         .unwrap().int().unwrap());
//! ```
//!
//! Encoding bencoded data:
//!
//! ```rust
//!     use bencode::{ben_map, ben_int, ben_bytes};
//!
//!     let message = (ben_map!{
//!         "lucky_number" => ben_int!(7),
//!         "lucky_string" => ben_bytes!("7")
//!     }).encode();
//!
//!     let data = b"d12:lucky_numberi7e12:lucky_string1:7e"; // cspell:disable-line
//!     assert_eq!(&data[..], &message[..]);
//! ```
//!
//! Reading a fixed set of keys in one pass with the static map:
//!
//! ```rust
//!     use bencode::static_map::{read_static_map, MapKey, Slot};
//!
//!     const KEYS: &[MapKey] = &[MapKey::new(0, "t*S"), MapKey::new(1, "a::id*S")];
//!
//!     let data = b"d1:ad2:id3:abce1:t1:xe";
//!     let mut slots = [Slot::Empty, Slot::Empty];
//!     read_static_map(data, KEYS, &mut slots).unwrap();
//!
//!     assert_eq!(slots[0].bytes(), Some(&b"x"[..]));
//!     assert_eq!(slots[1].bytes(), Some(&b"abc"[..]));
//! ```

mod access;
mod cow;
mod error;
mod mutable;
mod reference;
pub mod static_map;

/// Traits for implementation functionality.
pub mod inner {
    pub use crate::cow::BCowConvert;
}

pub use crate::access::bencode::{BMutAccess, BRefAccess, MutKind, RefKind};
pub use crate::access::dict::BDictAccess;
pub use crate::access::list::BListAccess;
pub use crate::error::{BencodeParseError, BencodeParseResult};
pub use crate::mutable::bencode_mut::BencodeMut;
pub use crate::reference::bencode_ref::BencodeRef;
pub use crate::reference::decode::skip_value;
pub use crate::reference::decode_opt::BDecodeOpt;

const BEN_END: u8 = b'e';
const DICT_START: u8 = b'd';
const LIST_START: u8 = b'l';
const INT_START: u8 = b'i';

const BYTE_LEN_LOW: u8 = b'0';
const BYTE_LEN_HIGH: u8 = b'9';
const BYTE_LEN_END: u8 = b':';

/// Construct a `BencodeMut` map by supplying string references as keys and `BencodeMut` as values.
#[macro_export]
macro_rules! ben_map {
( $($key:expr => $val:expr),* ) => {
        {
            use $crate::{BMutAccess, BencodeMut};
            use $crate::inner::BCowConvert;

            let mut bencode_map = BencodeMut::new_dict();
            {
                let map = bencode_map.dict_mut().unwrap();
                $(
                    map.insert(BCowConvert::convert($key), $val);
                )*
            }

            bencode_map
        }
    }
}

/// Construct a `BencodeMut` list by supplying a list of `BencodeMut` values.
#[macro_export]
macro_rules! ben_list {
    ( $($ben:expr),* ) => {
        {
            use $crate::{BencodeMut, BMutAccess};

            let mut bencode_list = BencodeMut::new_list();
            {
                let list = bencode_list.list_mut().unwrap();
                $(
                    list.push($ben);
                )*
            }

            bencode_list
        }
    }
}

/// Construct `BencodeMut` bytes by supplying a type convertible to `Vec<u8>`.
#[macro_export]
macro_rules! ben_bytes {
    ( $ben:expr ) => {{
        use $crate::inner::BCowConvert;
        use $crate::BencodeMut;

        BencodeMut::new_bytes(BCowConvert::convert($ben))
    }};
}

/// Construct a `BencodeMut` integer by supplying an `i64`.
#[macro_export]
macro_rules! ben_int {
    ( $ben:expr ) => {{
        use $crate::BencodeMut;

        BencodeMut::new_int($ben)
    }};
}
