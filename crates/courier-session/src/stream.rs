/// Schema-registered message transport over a session link.
///
/// A stream owns a [`Session`] and a [`Codec`]. Messages are serialized,
/// buffered by `send`, and pushed onto the data subchannel by `flush`.
/// `recv` reads one frame and decodes it; decode failures rebuild the
/// codec state (see [`Codec`]) and surface the original error while
/// leaving the stream usable.
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Codec, Session, SessionError};

pub struct Stream {
    session: Session,
    codec: Codec,
    outbound: Vec<Vec<u8>>,
}

impl Stream {
    /// Wrap a negotiated session.
    pub fn new(session: Session) -> Self {
        Self {
            session,
            codec: Codec::new(),
            outbound: Vec::new(),
        }
    }

    /// Register a message kind; must mirror the peer's registrations.
    pub fn register(&mut self, kind: &str) -> Result<(), SessionError> {
        self.codec.register(kind)
    }

    /// Serialize a message and queue it for the next flush.
    pub fn send<T: Serialize>(&mut self, kind: &str, msg: &T) -> Result<(), SessionError> {
        let frame = self.codec.encode(kind, msg)?;
        self.outbound.push(frame);
        Ok(())
    }

    /// Push every buffered frame onto the session's data subchannel.
    pub async fn flush(&mut self) -> Result<(), SessionError> {
        for frame in self.outbound.drain(..) {
            self.session.send_data(&frame).await?;
        }
        Ok(())
    }

    /// Receive and decode the next message.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<(String, T), SessionError> {
        let frame = self.session.recv_data().await?;
        self.codec.decode(&frame)
    }

    /// Close the underlying session.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        self.session.close().await
    }

    /// The remote endpoint's identity.
    pub fn remote(&self) -> crate::PublicKey {
        self.session.remote()
    }
}
