//! Session tokens: 48 random bytes identifying a session across transport reconnections.
//!
//! Grounded in the teacher's `flux::session::server::SessionKey` (base64-encoded fixed-size
//! key with a custom serde impl); generalized to the 48-byte session token of spec §3 and
//! §4.3. Token generation uses `rand`'s OS-backed CSPRNG rather than the teacher's
//! `libsodium_sys::randombytes_buf` — encryption itself is explicitly out of scope (spec
//! §1 Non-goals) and `libsodium-sys` otherwise has no remaining use in this crate, so the
//! FFI dependency is dropped in favor of a dependency already on the pure-Rust `rand`
//! crate (see DESIGN.md).
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

/// Size of a session token in bytes (spec §3, §6).
pub const TOKEN_SIZE: usize = 48;

/// Size of the "token prefix" used to cheaply authenticate datagrams (spec §4.3).
pub const TOKEN_PREFIX_SIZE: usize = 2;

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct SessionToken([u8; TOKEN_SIZE]);

impl SessionToken {
    /// Generates a fresh, cryptographically random token.
    pub fn generate() -> SessionToken {
        let mut bytes = [0u8; TOKEN_SIZE];
        OsRng.fill_bytes(&mut bytes);
        SessionToken(bytes)
    }

    pub fn from_bytes(bytes: [u8; TOKEN_SIZE]) -> SessionToken {
        SessionToken(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }

    /// The first two bytes, used to authenticate datagrams against session hijacking at
    /// low cost (spec §4.3).
    pub fn prefix(&self) -> [u8; TOKEN_PREFIX_SIZE] {
        [self.0[0], self.0[1]]
    }

    pub fn base64(&self) -> String {
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, self.0)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({}…)", &self.base64()[..8.min(self.base64().len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unlikely_to_collide() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn prefix_is_first_two_bytes() {
        let token = SessionToken::from_bytes([7u8; TOKEN_SIZE]);
        assert_eq!(token.prefix(), [7u8, 7u8]);
    }
}
