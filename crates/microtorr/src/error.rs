use std::io;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::{control::ControlMessage, tracker::TrackerMsg};

impl From<bendy::decoding::Error> for Error {
    fn from(value: bendy::decoding::Error) -> Self {
        Self::BencodeError(value.to_string())
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(value: bendy::encoding::Error) -> Self {
        Self::BencodeError(value.to_string())
    }
}

impl From<mpsc::error::SendError<ControlMessage>> for Error {
    fn from(value: mpsc::error::SendError<ControlMessage>) -> Self {
        Self::SendControlError(value.0.opcode().to_string())
    }
}

impl From<mpsc::error::SendError<TrackerMsg>> for Error {
    fn from(_value: mpsc::error::SendError<TrackerMsg>) -> Self {
        Self::SendTrackerError
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),

    #[error("String is not UTF-8")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    #[error("Failed to decode or encode the bencode buffer: {0}")]
    BencodeError(String),

    #[error("Failed to encode or decode the handshake")]
    SpeedyError(#[from] speedy::Error),

    #[error("Failed to parse json: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to parse the configuration file: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Could not find the user's home folder")]
    HomeInvalid,

    #[error("The descriptor is invalid: {0}")]
    MetaInfoInvalid(String),

    #[error("Tracker request failed: {0}")]
    TrackerRequest(#[from] reqwest::Error),

    #[error("Tracker sent an invalid response: {0}")]
    TrackerResponse(String),

    #[error("Could not send a message to the tracker")]
    SendTrackerError,

    #[error("Could not deliver the {0} message, the receiver is gone")]
    SendControlError(String),

    #[error("Peer closed the socket")]
    PeerClosedSocket,

    #[error("Peer did not send a handshake")]
    NoHandshake,

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("Peer id must have exactly 20 alphanumeric bytes")]
    PeerIdInvalid,

    #[error("Received a message with an unknown id: {0}")]
    UnknownMessageId(u8),

    #[error("Received a malformed {0} message")]
    MalformedMessage(&'static str),

    #[error("Message of {0} bytes exceeds the maximum allowed size")]
    MessageTooLarge(usize),

    #[error("Received an unexpected {0} message")]
    UnexpectedMessage(String),

    #[error("Received piece {0} while seeding, seeders never request pieces")]
    PieceWhileSeeding(u32),

    #[error("Piece {0} does not match its expected hash")]
    PieceInvalid(u32),

    #[error("Piece index {0} is out of bounds")]
    PieceOutOfBounds(u32),

    #[error("The seed file does not match the descriptor hashes")]
    SeedFileInvalid,

    #[error("Could not determine the address of the default route")]
    NoDefaultRoute,
}

impl Error {
    /// Errors that signal a version or logic mismatch between peers. There is
    /// no way to recover from them, the client must stop.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::UnknownMessageId(_)
                | Error::MalformedMessage(_)
                | Error::MessageTooLarge(_)
                | Error::Utf8Error(_)
                | Error::UnexpectedMessage(_)
                | Error::PieceWhileSeeding(_)
        )
    }

    /// Errors that must terminate the process through the shutdown
    /// coordinator, as opposed to transport failures that only cost us a
    /// connection.
    pub fn is_fatal(&self) -> bool {
        self.is_protocol_violation()
            || matches!(
                self,
                Error::PieceInvalid(_)
                    | Error::SeedFileInvalid
                    | Error::IO(_)
            )
    }
}
