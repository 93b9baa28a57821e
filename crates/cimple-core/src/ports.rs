//! Port traits.
//!
//! These traits define the interfaces between the core domain and the
//! transport and secret adapters.

use crate::Result;
use crate::messages::Envelope;
use async_trait::async_trait;

/// Duplex channel carrying envelopes between one agent and the server.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Write one envelope. Fails if the channel is closed or the write
    /// deadline passes.
    async fn send_message(&self, envelope: Envelope) -> Result<()>;

    /// Wait for the next envelope. Keepalive frames are consumed internally.
    async fn read_message(&self) -> Result<Envelope>;

    /// Release the underlying socket. Calling it more than once is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Resolves secrets referenced from step templates.
pub trait SecretStore: Send + Sync {
    fn get(&self, kind: &str, key: &str) -> Result<String>;
}
