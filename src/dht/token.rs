//! Announce tokens: short-lived proof of recent contact.
//!
//! `get_peers` replies carry a token the peer must echo in a later
//! `announce_peer`. The token is bound to the peer's IP address and a
//! rotating secret, so it can be verified without storing per-peer state.
//! The secret rotates with the 15 minute housekeeping and the previous
//! secret stays acceptable, giving a validity of 15 to 30 minutes.
use std::net::SocketAddrV4;

use rand::Rng;
use sha1::{Digest, Sha1};

/// How many bytes of the 20-byte SHA-1 digest make up a token.
pub const TOKEN_LEN: usize = 8;

pub struct TokenKeeper {
    current: u32,
    previous: u32,
}

impl TokenKeeper {
    #[must_use]
    pub fn new(rng: &mut impl Rng) -> TokenKeeper {
        TokenKeeper {
            current: rng.gen(),
            previous: rng.gen(),
        }
    }

    /// The token for the given address under the current secret.
    #[must_use]
    pub fn make_token(&self, addr: &SocketAddrV4) -> [u8; TOKEN_LEN] {
        generate(self.current, addr)
    }

    /// A token matches when it was issued under the current or the
    /// previous secret; clients announcing with a token from just before a
    /// rotation stay valid.
    #[must_use]
    pub fn token_valid(&self, token: &[u8], addr: &SocketAddrV4) -> bool {
        if token.len() != TOKEN_LEN {
            return false;
        }

        token == generate(self.current, addr) || token == generate(self.previous, addr)
    }

    /// Called by the 15 minute housekeeping.
    pub fn rotate(&mut self, rng: &mut impl Rng) {
        self.previous = self.current;
        self.current = rng.gen();
    }
}

fn generate(secret: u32, addr: &SocketAddrV4) -> [u8; TOKEN_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(secret.to_le_bytes());
    hasher.update(addr.ip().octets());

    let digest = hasher.finalize();

    let mut token = [0u8; TOKEN_LEN];
    token.copy_from_slice(&digest[..TOKEN_LEN]);
    token
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::TokenKeeper;

    fn keeper() -> TokenKeeper {
        TokenKeeper::new(&mut rand::thread_rng())
    }

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), 6881)
    }

    #[test]
    fn it_should_accept_its_own_token() {
        let keeper = keeper();

        let token = keeper.make_token(&addr(1));

        assert!(keeper.token_valid(&token, &addr(1)));
    }

    #[test]
    fn it_should_bind_the_token_to_the_address() {
        let keeper = keeper();

        let token = keeper.make_token(&addr(1));

        assert!(!keeper.token_valid(&token, &addr(2)));
    }

    #[test]
    fn it_should_ignore_the_port_when_verifying() {
        let keeper = keeper();

        let token = keeper.make_token(&addr(1));
        let other_port = SocketAddrV4::new(*addr(1).ip(), 1);

        assert!(keeper.token_valid(&token, &other_port));
    }

    #[test]
    fn it_should_accept_a_token_across_one_rotation_but_not_two() {
        let mut keeper = keeper();
        let token = keeper.make_token(&addr(1));

        keeper.rotate(&mut rand::thread_rng());
        assert!(keeper.token_valid(&token, &addr(1)));

        keeper.rotate(&mut rand::thread_rng());
        assert!(!keeper.token_valid(&token, &addr(1)));
    }

    #[test]
    fn it_should_reject_tokens_of_the_wrong_length() {
        let keeper = keeper();

        assert!(!keeper.token_valid(b"short", &addr(1)));
        assert!(!keeper.token_valid(b"much too long token", &addr(1)));
    }
}
