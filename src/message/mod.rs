//! Message model for the chat relay
//!
//! Defines the reserved client identifiers, the immutable `Message` value
//! exchanged between clients, and validation of client supplied payloads.

use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// Identifier of a connected party.
pub type ClientId = i64;

/// Destination meaning "every currently connected client".
///
/// Also the inclusive floor for sender and destination ids in any payload
/// accepted from a client or read back from the broker.
pub const BROADCAST_ID: ClientId = -1;

/// Sender identity of messages generated by the server itself.
///
/// Sits below `BROADCAST_ID`, so it can never pass payload validation.
pub const SERVICE_ID: ClientId = -2;

/// Diagnostic text sent back when a client payload can't be accepted.
pub const INVALID_MESSAGE_TEXT: &str = "Invalid message format";

/// Wire representation of a party: `{"client_id": <int>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub client_id: ClientId,
}

impl Party {
    pub fn new(client_id: ClientId) -> Self {
        Self { client_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    sender: Party,
    destination: Party,
    text: String,
}

impl Message {
    pub fn new(sender: ClientId, destination: ClientId, text: impl Into<String>) -> Self {
        Self {
            sender: Party::new(sender),
            destination: Party::new(destination),
            text: text.into(),
        }
    }

    /// Builds a message addressed to every connected client.
    pub fn broadcast(sender: ClientId, text: impl Into<String>) -> Self {
        Self::new(sender, BROADCAST_ID, text)
    }

    /// Builds a message sent on behalf of the server.
    pub fn service(destination: ClientId, text: impl Into<String>) -> Self {
        Self::new(SERVICE_ID, destination, text)
    }

    /// The diagnostic returned to a client whose payload was rejected.
    pub fn invalid_format() -> Self {
        Self::service(SERVICE_ID, INVALID_MESSAGE_TEXT)
    }

    /// Parses and validates a JSON payload.
    pub fn parse(payload: &str) -> Result<Self, MessageError> {
        let message: Message = serde_json::from_str(payload)
            .map_err(|e| MessageError::Malformed(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), MessageError> {
        for (field, id) in [("sender", self.sender.client_id), ("destination", self.destination.client_id)] {
            if id < BROADCAST_ID {
                return Err(MessageError::Malformed(format!(
                    "{} client_id {} is below {}",
                    field, id, BROADCAST_ID
                )));
            }
        }
        Ok(())
    }

    /// Copy of this message addressed to `destination`.
    pub fn readdressed(&self, destination: ClientId) -> Self {
        Self {
            sender: self.sender,
            destination: Party::new(destination),
            text: self.text.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn sender(&self) -> ClientId {
        self.sender.client_id
    }

    pub fn destination(&self) -> ClientId {
        self.destination.client_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.client_id == BROADCAST_ID
    }

    pub fn is_service(&self) -> bool {
        self.sender.client_id == SERVICE_ID
    }
}
