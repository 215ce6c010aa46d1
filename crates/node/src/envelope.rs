use crate::channel::{PeerIdentity, Session};
use crate::error::{BackupError, Result};

/// A decoded message tagged with the sender identity proven by the transport.
#[derive(Debug, Clone)]
pub struct Envelope<M> {
    sender: PeerIdentity,
    message: M,
}

impl<M> Envelope<M> {
    /// Wraps `message` with the identity bound to `session`. A session without an identity
    /// means the channel skipped authentication and must be closed.
    pub fn wrap(session: &Session, message: M) -> Result<Self> {
        let sender = session
            .identity()
            .map_err(|_| BackupError::MissingIdentity)?
            .clone();
        Ok(Self { sender, message })
    }

    pub fn sender(&self) -> &PeerIdentity {
        &self.sender
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_parts(self) -> (PeerIdentity, M) {
        (self.sender, self.message)
    }
}
