//! Credential hashing for the hello/validate handshake.
//!
//! The password is hashed once, when the session is built, and only the hash
//! is kept. On `hello` the server supplies a salt and the client answers with
//! `token = H(H(password) ‖ salt)`, where `H` is SHA-256 rendered as
//! lowercase hex. The stored hash is consumed by that one answer.

#[cfg(test)]
#[path = "auth_test.rs"]
mod auth_test;

use std::fmt;

use serde::Serialize;
use sha2::digest::generic_array::GenericArray;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::Password;

/// Position in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthState {
    /// No challenge answered yet.
    Unauthenticated,
    /// Token sent, waiting for the server verdict.
    Challenged,
    /// Server accepted the token.
    Validated,
    /// Server refused the token. Terminal.
    Rejected,
}

impl AuthState {
    /// True once the server has given its verdict.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Validated | Self::Rejected)
    }
}

const HEX: &[u8; 16] = b"0123456789abcdef";
const HEX_DIGEST_LEN: usize = 64;

/// SHA-256 of `input` as lowercase hex. Written into a buffer sized up front
/// so no partial copy is left behind by reallocation.
#[must_use]
pub fn sha256_hex(input: &[u8]) -> String {
    let mut digest = Zeroizing::new([0_u8; 32]);
    let mut hasher = Sha256::new();
    hasher.update(input);
    hasher.finalize_into(GenericArray::from_mut_slice(&mut digest[..]));

    let mut hex = String::with_capacity(HEX_DIGEST_LEN);
    for byte in digest.iter() {
        hex.push(char::from(HEX[usize::from(byte >> 4)]));
        hex.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    hex
}

/// One-way hash of the user's password. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CredentialHash(String);

impl CredentialHash {
    #[must_use]
    pub fn from_password(password: &Password) -> Self {
        Self(sha256_hex(password.expose().as_bytes()))
    }

    /// Salted token for a `validate` answer.
    #[must_use]
    pub fn token(&self, salt: &str) -> String {
        let mut salted = String::with_capacity(self.0.len() + salt.len());
        salted.push_str(&self.0);
        salted.push_str(salt);
        let token = sha256_hex(salted.as_bytes());
        salted.zeroize();
        token
    }
}

impl fmt::Debug for CredentialHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialHash(<redacted>)")
    }
}

/// `H(H(password) ‖ salt)`. Pure; equal inputs give equal tokens.
#[must_use]
pub fn token(password: &Password, salt: &str) -> String {
    CredentialHash::from_password(password).token(salt)
}

/// The server never sends a dedicated failure tag: `validate:false` is also
/// its reply to anything sent before validation. A `false` verdict only
/// means the password was wrong if our one-time credential was already
/// spent answering a challenge.
#[must_use]
pub fn is_genuine_rejection(status: bool, credential_cleared: bool) -> bool {
    !status && credential_cleared
}
