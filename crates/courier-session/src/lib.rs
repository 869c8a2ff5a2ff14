//! Courier session layer.
//!
//! Authenticated, symmetrically-encrypted duplex links between two overlay
//! nodes, split into independent control and data subchannels, plus the
//! schema-registered message stream that rides on them.
//!
//! Crypto: X25519 key exchange + HKDF-SHA256 key schedule, ChaCha20
//! subchannel ciphers, HMAC-SHA256 frame authentication. Handshake frames
//! are sealed to the peer's long-term public key with XChaCha20-Poly1305.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use courier_session::{Listener, Session, SecretKey};
//!
//! # async fn example() -> Result<(), courier_session::SessionError> {
//! let server_key = SecretKey::generate(&mut rand::thread_rng());
//! let server_pub = server_key.public();
//!
//! let listener = Listener::bind("127.0.0.1:0", server_key).await?;
//! let addr = listener.local_addr()?;
//!
//! let client_key = SecretKey::generate(&mut rand::thread_rng());
//! let session = Session::dial(addr, &client_key, &server_pub).await?;
//! session.send_data(b"hello").await?;
//! # Ok(())
//! # }
//! ```

mod codec;
mod error;
mod handshake;
mod seal;
mod session;
mod stream;

pub use codec::Codec;
pub use error::SessionError;
pub use session::{Listener, Session, SessionState, Subchannel};
pub use stream::Stream;

use std::fmt;
use std::str::FromStr;

use rand::{CryptoRng, RngCore};

/// Long-term node identity — an X25519 public key.
///
/// Displayed and parsed as a 64-character hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// The raw 32-byte key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_x25519(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_string();
        write!(f, "PublicKey({}...)", &hex[..12])
    }
}

impl FromStr for PublicKey {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(SessionError::InvalidKey(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in bytes.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| SessionError::InvalidKey(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: serde_bytes_array::ByteArray = serde::Deserialize::deserialize(deserializer)?;
        Ok(Self(bytes.0))
    }
}

/// Fixed-size byte array deserialization helper for [`PublicKey`].
mod serde_bytes_array {
    pub(super) struct ByteArray(pub [u8; 32]);

    impl<'de> serde::Deserialize<'de> for ByteArray {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            struct Visitor;

            impl serde::de::Visitor<'_> for Visitor {
                type Value = ByteArray;

                fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.write_str("32 bytes")
                }

                fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<ByteArray, E> {
                    let bytes: [u8; 32] = v
                        .try_into()
                        .map_err(|_| E::invalid_length(v.len(), &self))?;
                    Ok(ByteArray(bytes))
                }
            }

            deserializer.deserialize_bytes(Visitor)
        }
    }
}

/// Long-term node secret — an X25519 static secret.
#[derive(Clone)]
pub struct SecretKey(x25519_dalek::StaticSecret);

impl SecretKey {
    /// Generate a fresh secret from the given RNG.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Reconstruct a secret from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// The corresponding public key.
    pub fn public(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }

    pub(crate) fn as_x25519(&self) -> &x25519_dalek::StaticSecret {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}
