//! Peer identity used in announce requests.
use std::panic::Location;

use thiserror::Error;

pub const PEER_ID_BYTES_LEN: usize = 20;

/// ID used by the downloader peer, sent with every announce.
///
/// By convention the first 8 bytes identify the client implementation and
/// version (Azureus style, e.g. `-SD0010-`) and the rest is random.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub struct PeerId(pub [u8; PEER_ID_BYTES_LEN]);

impl PeerId {
    /// Builds a peer id from a client prefix plus caller-supplied entropy.
    ///
    /// Only the first 8 bytes of `prefix` are used; a shorter prefix is
    /// padded with `-`.
    #[must_use]
    pub fn from_prefix_and_entropy(prefix: &[u8], entropy: &[u8; 12]) -> Self {
        let mut bytes = [b'-'; PEER_ID_BYTES_LEN];

        let len = prefix.len().min(8);
        bytes[..len].copy_from_slice(&prefix[..len]);
        bytes[8..].copy_from_slice(entropy);

        Self(bytes)
    }

    #[must_use]
    pub fn bytes(&self) -> [u8; PEER_ID_BYTES_LEN] {
        self.0
    }

    /// Converts to a hex string, or `None` when the bytes cannot be
    /// hex-encoded (never for a valid 20-byte id).
    #[must_use]
    pub fn to_hex_string(&self) -> Option<String> {
        let mut tmp = [0u8; PEER_ID_BYTES_LEN * 2];
        binascii::bin2hex(&self.0, &mut tmp).ok()?;
        std::str::from_utf8(&tmp).map(|hex| format!("0x{hex}")).ok()
    }
}

impl From<[u8; PEER_ID_BYTES_LEN]> for PeerId {
    fn from(bytes: [u8; PEER_ID_BYTES_LEN]) -> Self {
        Self(bytes)
    }
}

/// Error returned when trying to convert an invalid peer id from another type.
///
/// Usually because the source format does not contain 20 bytes.
#[derive(Error, Debug)]
pub enum IdConversionError {
    #[error("not enough bytes for peer id: {message} {location}")]
    NotEnoughBytes {
        location: &'static Location<'static>,
        message: String,
    },
    #[error("too many bytes for peer id: {message} {location}")]
    TooManyBytes {
        location: &'static Location<'static>,
        message: String,
    },
}

impl TryFrom<&[u8]> for PeerId {
    type Error = IdConversionError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() < PEER_ID_BYTES_LEN {
            return Err(IdConversionError::NotEnoughBytes {
                location: Location::caller(),
                message: format! {"got {} bytes, expected {}", bytes.len(), PEER_ID_BYTES_LEN},
            });
        }
        if bytes.len() > PEER_ID_BYTES_LEN {
            return Err(IdConversionError::TooManyBytes {
                location: Location::caller(),
                message: format! {"got {} bytes, expected {}", bytes.len(), PEER_ID_BYTES_LEN},
            });
        }

        let mut id = [0u8; PEER_ID_BYTES_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }
}

#[cfg(test)]
mod tests {
    use super::PeerId;

    #[test]
    fn it_should_build_an_id_from_prefix_and_entropy() {
        let id = PeerId::from_prefix_and_entropy(b"-SD0010-", &[7u8; 12]);

        assert_eq!(&id.0[..8], b"-SD0010-");
        assert_eq!(&id.0[8..], &[7u8; 12]);
    }

    #[test]
    fn it_should_pad_a_short_prefix() {
        let id = PeerId::from_prefix_and_entropy(b"-SD", &[0u8; 12]);

        assert_eq!(&id.0[..8], b"-SD-----");
    }

    #[test]
    fn it_should_be_converted_to_hex_string() {
        let id = PeerId(*b"-qB00000000000000000");
        assert_eq!(id.to_hex_string().unwrap(), "0x2d71423030303030303030303030303030303030");
    }

    #[test]
    #[should_panic = "TooManyBytes"]
    fn it_should_fail_converting_from_too_many_bytes() {
        let _ = PeerId::try_from(&[0u8; 21][..]).unwrap();
    }
}
