//! 160-bit identifiers and the Kademlia XOR metric.
//!
//! DHT nodes and search targets are identified by 20-byte ids. The distance
//! between two ids is their bitwise XOR interpreted as a 160-bit unsigned
//! integer; "closer to a target" means a smaller distance. Because the XOR
//! with the target is order-preserving byte by byte, comparing two ids for
//! closeness only needs the first byte in which they differ.
use std::panic::Location;

use thiserror::Error;

pub const NODE_ID_BYTES_LEN: usize = 20;

/// A 160-bit DHT node id or search target.
///
/// The all-zero id is reserved: too many broken implementations advertise an
/// id of zero, which causes collisions, so nodes claiming it are rejected.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub struct NodeId(pub [u8; NODE_ID_BYTES_LEN]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0u8; NODE_ID_BYTES_LEN]);
    pub const MAX: NodeId = NodeId([0xFFu8; NODE_ID_BYTES_LEN]);

    /// Returns the bit at the given index, counting from the most
    /// significant bit of the first byte.
    ///
    /// # Panics
    ///
    /// Will panic if `index` is not below 160.
    #[must_use]
    pub fn bit(&self, index: usize) -> bool {
        assert!(index < NODE_ID_BYTES_LEN * 8, "bit index out of range");

        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    #[must_use]
    pub fn xor(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; NODE_ID_BYTES_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(out)
    }

    /// True if `one` is strictly closer to `target` than `two` under the
    /// XOR metric. Only the first differing byte decides.
    #[must_use]
    pub fn is_closer(one: &NodeId, two: &NodeId, target: &NodeId) -> bool {
        for i in 0..NODE_ID_BYTES_LEN {
            if one.0[i] != two.0[i] {
                return (one.0[i] ^ target.0[i]) < (two.0[i] ^ target.0[i]);
            }
        }

        false
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    #[must_use]
    pub fn bytes(&self) -> [u8; NODE_ID_BYTES_LEN] {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut chars = [0u8; NODE_ID_BYTES_LEN * 2];
        binascii::bin2hex(&self.0, &mut chars).expect("it should fit the output buffer");
        write!(f, "{}", std::str::from_utf8(&chars).unwrap())
    }
}

impl std::str::FromStr for NodeId {
    type Err = binascii::ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != NODE_ID_BYTES_LEN * 2 {
            return Err(binascii::ConvertError::InvalidInputLength);
        }

        let mut id = NodeId::ZERO;
        binascii::hex2bin(s.as_bytes(), &mut id.0)?;
        Ok(id)
    }
}

impl From<[u8; NODE_ID_BYTES_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_BYTES_LEN]) -> Self {
        Self(bytes)
    }
}

/// Errors that can occur when converting from a byte slice to a `NodeId`.
#[derive(Error, Debug)]
pub enum ConversionError {
    /// Not enough bytes for a node id. A node id is 20 bytes.
    #[error("not enough bytes for node id: {message} {location}")]
    NotEnoughBytes {
        location: &'static Location<'static>,
        message: String,
    },
    /// Too many bytes for a node id. A node id is 20 bytes.
    #[error("too many bytes for node id: {message} {location}")]
    TooManyBytes {
        location: &'static Location<'static>,
        message: String,
    },
}

impl TryFrom<&[u8]> for NodeId {
    type Error = ConversionError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() < NODE_ID_BYTES_LEN {
            return Err(ConversionError::NotEnoughBytes {
                location: Location::caller(),
                message: format! {"got {} bytes, expected {}", bytes.len(), NODE_ID_BYTES_LEN},
            });
        }
        if bytes.len() > NODE_ID_BYTES_LEN {
            return Err(ConversionError::TooManyBytes {
                location: Location::caller(),
                message: format! {"got {} bytes, expected {}", bytes.len(), NODE_ID_BYTES_LEN},
            });
        }

        let mut id = NodeId::ZERO;
        id.0.copy_from_slice(bytes);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::NodeId;

    fn id_with_last_byte(last: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        NodeId(bytes)
    }

    #[test]
    fn it_should_compute_the_xor_of_two_ids() {
        let one = id_with_last_byte(0b1010_0000);
        let two = id_with_last_byte(0b0110_0000);

        assert_eq!(one.xor(&two), id_with_last_byte(0b1100_0000));
        assert_eq!(one.xor(&one), NodeId::ZERO);
    }

    #[test]
    fn it_should_expose_single_bits() {
        let id = NodeId([0x80; 20]);

        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(8));
        assert!(!id.bit(159));
    }

    #[test]
    fn it_should_order_ids_by_distance_to_a_target() {
        let target = NodeId::ZERO;
        let near = id_with_last_byte(1);
        let far = id_with_last_byte(2);

        assert!(NodeId::is_closer(&near, &far, &target));
        assert!(!NodeId::is_closer(&far, &near, &target));
        assert!(!NodeId::is_closer(&near, &near, &target));
    }

    #[test]
    fn it_should_use_the_first_differing_byte_for_closeness() {
        // The first byte decides even though later bytes disagree.
        let mut one = [0u8; 20];
        let mut two = [0u8; 20];
        one[0] = 0x01;
        one[19] = 0xFF;
        two[0] = 0x02;

        assert!(NodeId::is_closer(&NodeId(one), &NodeId(two), &NodeId::ZERO));
    }

    #[test]
    fn it_should_be_converted_to_and_from_a_hex_string() {
        let id = NodeId([0xAB; 20]);
        let hex = id.to_string();

        assert_eq!(hex, "abababababababababababababababababababab");
        assert_eq!(NodeId::from_str(&hex).unwrap(), id);
    }

    #[test]
    #[should_panic = "NotEnoughBytes"]
    fn it_should_fail_converting_from_a_short_byte_slice() {
        let _ = NodeId::try_from(&[0u8; 19][..]).unwrap();
    }
}
