//! Wire protocol exchanged between the server and its agents.
//!
//! Every frame on an agent connection carries exactly one [`Envelope`],
//! encoded with bincode's standard configuration. The set of message
//! variants is closed: a peer that receives a variant it does not know
//! fails to decode the frame.

use crate::ids::{AgentId, MessageId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire unit: a correlation id plus one typed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub body: Message,
}

impl Envelope {
    /// Wrap a message in a fresh envelope.
    pub fn new(body: impl Into<Message>) -> Self {
        Self {
            id: MessageId::new(),
            body: body.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Serialize into a single binary frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| Error::Encode(e.to_string()))
    }

    /// Decode one frame. Trailing bytes are treated as a malformed frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (envelope, read): (Envelope, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| Error::Decode(e.to_string()))?;

        if read != bytes.len() {
            return Err(Error::Decode(format!(
                "{} trailing bytes after envelope",
                bytes.len() - read
            )));
        }

        Ok(envelope)
    }
}

/// Closed registry of message variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    RegisterAgent(RegisterAgentMessage),
    BuildGitRepository(BuildGitRepository),
    BuildComplete(BuildComplete),
    Confirmation(ConfirmationMessage),
    BuildRefused(BuildRefused),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::RegisterAgent(_) => MessageKind::RegisterAgent,
            Message::BuildGitRepository(_) => MessageKind::BuildGitRepository,
            Message::BuildComplete(_) => MessageKind::BuildComplete,
            Message::Confirmation(_) => MessageKind::Confirmation,
            Message::BuildRefused(_) => MessageKind::BuildRefused,
        }
    }
}

/// Tag used to key handlers in a [`crate::router::MessageRouter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RegisterAgent,
    BuildGitRepository,
    BuildComplete,
    Confirmation,
    BuildRefused,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::RegisterAgent => "RegisterAgentMessage",
            MessageKind::BuildGitRepository => "BuildGitRepository",
            MessageKind::BuildComplete => "BuildComplete",
            MessageKind::Confirmation => "ConfirmationMessage",
            MessageKind::BuildRefused => "BuildRefused",
        };
        f.write_str(name)
    }
}

/// Sent by an agent after every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAgentMessage {
    pub agent_id: AgentId,
    pub hostname: String,
}

/// Asks an agent to check out a repository at a commit and build it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildGitRepository {
    pub url: String,
    pub commit: String,
}

/// Sent by an agent once the requested build has finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildComplete {}

/// Sent by an agent that is already running a different build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRefused {
    pub reason: String,
}

/// Acknowledges the envelope identified by `confirmed_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationMessage {
    pub confirmed_id: MessageId,
    pub text: String,
}

impl From<RegisterAgentMessage> for Message {
    fn from(msg: RegisterAgentMessage) -> Self {
        Message::RegisterAgent(msg)
    }
}

impl From<BuildGitRepository> for Message {
    fn from(msg: BuildGitRepository) -> Self {
        Message::BuildGitRepository(msg)
    }
}

impl From<BuildComplete> for Message {
    fn from(msg: BuildComplete) -> Self {
        Message::BuildComplete(msg)
    }
}

impl From<BuildRefused> for Message {
    fn from(msg: BuildRefused) -> Self {
        Message::BuildRefused(msg)
    }
}

impl From<ConfirmationMessage> for Message {
    fn from(msg: ConfirmationMessage) -> Self {
        Message::Confirmation(msg)
    }
}
