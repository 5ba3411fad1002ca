//! Server-wide shared password gate.
//!
//! Only the SHA-256 digest of the configured password is kept in memory and
//! candidates are compared digest to digest.

use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

/// Digest of the tunnel password configured for this server.
#[derive(Clone)]
pub struct SharedSecret {
    digest: [u8; 32],
}

impl SharedSecret {
    pub fn new(password: &str) -> Self {
        Self {
            digest: digest_of(password),
        }
    }

    /// Compare a candidate password in constant time.
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = digest_of(candidate);
        bool::from(self.digest.ct_eq(&candidate))
    }

    /// Short hex prefix of the digest, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.digest[..4])
    }
}

fn digest_of(value: &str) -> [u8; 32] {
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(value.as_bytes()));
    digest
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_only_the_configured_password() {
        let secret = SharedSecret::new("hunter2");
        assert!(secret.matches("hunter2"));
        assert!(!secret.matches("hunter3"));
        assert!(!secret.matches(""));
    }

    #[test]
    fn digests_are_compared_whole() {
        let secret = SharedSecret::new("hunter2");
        let mut almost = secret.digest;
        almost[31] ^= 1;
        assert!(!bool::from(secret.digest.ct_eq(&almost)));
        assert!(bool::from(secret.digest.ct_eq(&digest_of("hunter2"))));
    }

    #[test]
    fn debug_output_hides_the_digest() {
        let secret = SharedSecret::new("hunter2");
        let debug = format!("{secret:?}");
        assert!(debug.contains(&secret.fingerprint()));
        assert_eq!(secret.fingerprint().len(), 8);
        assert!(!debug.contains(&hex::encode(secret.digest)));
    }
}
