/// Sealed boxes for handshake frames.
///
/// Uses ephemeral X25519 Diffie-Hellman + XChaCha20-Poly1305 AEAD.
/// Each seal gets a fresh ephemeral keypair, so only the holder of the
/// recipient's long-term secret can open it.
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::{PublicKey, SecretKey, SessionError};

/// HKDF info string for domain separation.
const SEAL_INFO: &[u8] = b"courier-session-seal-xchacha20poly1305-v1";

/// A payload sealed to a long-term public key.
///
/// Contains everything needed to open it: ciphertext, nonce, and the
/// sender's ephemeral X25519 public key for DH key recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SealedBox {
    /// XChaCha20-Poly1305 ciphertext (includes 16-byte auth tag).
    pub ciphertext: Vec<u8>,
    /// 24-byte nonce (extended nonce, safe to generate randomly).
    pub nonce: [u8; 24],
    /// Sender's ephemeral X25519 public key.
    pub ephemeral_pk: [u8; 32],
}

/// Derive a 32-byte sealing key from a DH shared secret.
fn derive_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(SEAL_INFO, &mut key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    key
}

/// Seal a plaintext to the recipient's long-term public key.
pub(crate) fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<SealedBox, SessionError> {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&recipient.as_x25519());
    let key = derive_key(shared_secret.as_bytes());
    let cipher = XChaCha20Poly1305::new(&key.into());

    let mut nonce_bytes = [0u8; 24];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| SessionError::Crypto(format!("seal failed: {e}")))?;

    Ok(SealedBox {
        ciphertext,
        nonce: nonce_bytes,
        ephemeral_pk: ephemeral_public.to_bytes(),
    })
}

/// Open a sealed box with the recipient's long-term secret key.
pub(crate) fn open(sealed: &SealedBox, recipient: &SecretKey) -> Result<Vec<u8>, SessionError> {
    let ephemeral_pk = X25519PublicKey::from(sealed.ephemeral_pk);

    let shared_secret = recipient.as_x25519().diffie_hellman(&ephemeral_pk);
    let key = derive_key(shared_secret.as_bytes());
    let cipher = XChaCha20Poly1305::new(&key.into());

    let nonce = XNonce::from(sealed.nonce);
    cipher
        .decrypt(&nonce, sealed.ciphertext.as_ref())
        .map_err(|_| SessionError::Crypto("unseal failed: authentication error".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn keypair(seed: u64) -> (SecretKey, PublicKey) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let secret = SecretKey::generate(&mut rng);
        let public = secret.public();
        (secret, public)
    }

    #[test]
    fn seal_open_roundtrip() {
        let (sk, pk) = keypair(42);
        let plaintext = b"handshake material";

        let sealed = seal(plaintext, &pk).unwrap();
        let opened = open(&sealed, &sk).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let (_sk1, pk1) = keypair(1);
        let (sk2, _pk2) = keypair(2);

        let sealed = seal(b"secret", &pk1).unwrap();
        assert!(open(&sealed, &sk2).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (sk, pk) = keypair(3);
        let mut sealed = seal(b"secret", &pk).unwrap();

        if let Some(byte) = sealed.ciphertext.first_mut() {
            *byte ^= 0xFF;
        }
        assert!(open(&sealed, &sk).is_err());
    }

    #[test]
    fn tampered_ephemeral_fails() {
        let (sk, pk) = keypair(4);
        let mut sealed = seal(b"secret", &pk).unwrap();
        sealed.ephemeral_pk[0] ^= 0xFF;

        assert!(open(&sealed, &sk).is_err());
    }

    #[test]
    fn seals_are_randomized() {
        let (_sk, pk) = keypair(5);
        let a = seal(b"same message", &pk).unwrap();
        let b = seal(b"same message", &pk).unwrap();

        assert_ne!(a.ephemeral_pk, b.ephemeral_pk);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
