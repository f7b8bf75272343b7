//! Authentication scrambles.
//!
//! Only the two plugins a modern MySQL server offers by default are
//! supported. `caching_sha2_password` full authentication (RSA key
//! exchange or TLS) is not: a server that refuses fast auth fails the
//! connect with `Unsupported`.

use crate::error::{ClientError, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256};

pub const NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// Second byte of the `0x01` auth-more-data packet.
pub const FAST_AUTH_SUCCESS: u8 = 0x03;
pub const PERFORM_FULL_AUTH: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    Native,
    CachingSha2,
}

impl AuthPlugin {
    /// An empty name (pre-plugin servers) means native.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            NATIVE_PASSWORD | "" => Ok(AuthPlugin::Native),
            CACHING_SHA2_PASSWORD => Ok(AuthPlugin::CachingSha2),
            other => Err(ClientError::Unsupported(format!("auth plugin {}", other))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AuthPlugin::Native => NATIVE_PASSWORD,
            AuthPlugin::CachingSha2 => CACHING_SHA2_PASSWORD,
        }
    }

    pub fn scramble(self, password: &str, salt: &[u8]) -> Vec<u8> {
        match self {
            AuthPlugin::Native => scramble_native(password, salt),
            AuthPlugin::CachingSha2 => scramble_caching_sha2(password, salt),
        }
    }
}

fn trim_salt(salt: &[u8]) -> &[u8] {
    match salt.last() {
        Some(0) => &salt[..salt.len() - 1],
        _ => salt,
    }
}

/// `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`
pub fn scramble_native(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let salt = trim_salt(salt);
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + salt)`
pub fn scramble_caching_sha2(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let salt = trim_salt(salt);
    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);
    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(salt);
    let stage3 = hasher.finalize();
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &[u8] = b"abcdefghijklmnopqrst";

    #[test]
    fn test_empty_password_sends_nothing() {
        assert!(scramble_native("", SALT).is_empty());
        assert!(scramble_caching_sha2("", SALT).is_empty());
    }

    #[test]
    fn test_scramble_lengths() {
        assert_eq!(scramble_native("secret", SALT).len(), 20);
        assert_eq!(scramble_caching_sha2("secret", SALT).len(), 32);
    }

    #[test]
    fn test_scramble_is_deterministic_and_salted() {
        let a = scramble_native("secret", SALT);
        assert_eq!(a, scramble_native("secret", SALT));
        assert_ne!(a, scramble_native("secret", b"tsrqponmlkjihgfedcba"));
        assert_ne!(a, scramble_native("other", SALT));
    }

    #[test]
    fn test_trailing_nul_in_salt_ignored() {
        let mut salted = SALT.to_vec();
        salted.push(0);
        assert_eq!(scramble_native("pw", &salted), scramble_native("pw", SALT));
        assert_eq!(
            scramble_caching_sha2("pw", &salted),
            scramble_caching_sha2("pw", SALT)
        );
    }

    #[test]
    fn test_native_scramble_reverses_with_stored_hash() {
        // Server side check: SHA1(scramble XOR SHA1(salt + stored)) == stored
        let password = "secret";
        let stored = Sha1::digest(Sha1::digest(password.as_bytes()));
        let scramble = scramble_native(password, SALT);

        let mut hasher = Sha1::new();
        hasher.update(SALT);
        hasher.update(stored);
        let mask = hasher.finalize();
        let candidate: Vec<u8> = scramble.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(Sha1::digest(&candidate).as_slice(), stored.as_slice());
    }

    #[test]
    fn test_plugin_from_name() {
        assert_eq!(AuthPlugin::from_name("").unwrap(), AuthPlugin::Native);
        assert_eq!(
            AuthPlugin::from_name(CACHING_SHA2_PASSWORD).unwrap(),
            AuthPlugin::CachingSha2
        );
        let err = AuthPlugin::from_name("sha256_password").unwrap_err();
        assert_eq!(err.kind(), "unsupported");
    }
}
