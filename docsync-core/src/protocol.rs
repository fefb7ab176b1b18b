//! Message envelope for document synchronization.
//!
//! Wire format:
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ kind varuint │ payload                                      │
//! ├──────────────┼──────────────────────────────────────────────┤
//! │ 0  SYNC      │ subtype varuint | varbytes                   │
//! │              │   0 = state vector, 1 = delta, 2 = request   │
//! │ 1  AWARENESS │ varbytes (awareness update, see awareness)   │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Decoding is pure. A decode error concerns one message only; the
//! connection that carried it keeps reading.

use thiserror::Error;

use crate::encoding::{BytesReader, BytesWriter};

/// Top-level message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Document state exchange (state vectors and deltas)
    Sync = 0,
    /// Ephemeral presence records
    Awareness = 1,
}

impl MessageKind {
    pub fn from_u64(value: u64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Sync),
            1 => Ok(Self::Awareness),
            other => Err(ProtocolError::UnknownMessageKind(other)),
        }
    }
}

/// Sub-message discriminator inside a SYNC payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyncKind {
    StateVector = 0,
    Update = 1,
    Request = 2,
}

impl SyncKind {
    pub fn from_u64(value: u64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::StateVector),
            1 => Ok(Self::Update),
            2 => Ok(Self::Request),
            other => Err(ProtocolError::UnknownSyncKind(other)),
        }
    }
}

/// Decoded SYNC sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Summary of what the sender has seen (handshake step 1).
    StateVector(Vec<u8>),
    /// Opaque delta to merge (handshake step 2 or live edit).
    Update(Vec<u8>),
    /// Ask the other side for a fresh state-vector exchange.
    Request,
}

impl SyncMessage {
    pub fn kind(&self) -> SyncKind {
        match self {
            Self::StateVector(_) => SyncKind::StateVector,
            Self::Update(_) => SyncKind::Update,
            Self::Request => SyncKind::Request,
        }
    }

    fn write(&self, w: &mut BytesWriter) {
        w.push_var_uint(self.kind() as u64);
        match self {
            Self::StateVector(bytes) | Self::Update(bytes) => w.push_var_bytes(bytes),
            Self::Request => {}
        }
    }

    fn read(r: &mut BytesReader<'_>) -> Result<Self, ProtocolError> {
        match SyncKind::from_u64(r.read_var_uint()?)? {
            SyncKind::StateVector => Ok(Self::StateVector(r.read_var_bytes()?.to_vec())),
            SyncKind::Update => Ok(Self::Update(r.read_var_bytes()?.to_vec())),
            SyncKind::Request => Ok(Self::Request),
        }
    }
}

/// A complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Raw awareness update bytes, interpreted by the awareness tracker.
    Awareness(Vec<u8>),
}

impl Message {
    pub fn state_vector(sv: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::StateVector(sv))
    }

    pub fn update(delta: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::Update(delta))
    }

    pub fn request() -> Self {
        Self::Sync(SyncMessage::Request)
    }

    pub fn awareness(update: Vec<u8>) -> Self {
        Self::Awareness(update)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Sync(_) => MessageKind::Sync,
            Self::Awareness(_) => MessageKind::Awareness,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BytesWriter::new();
        w.push_var_uint(self.kind() as u64);
        match self {
            Self::Sync(sync) => sync.write(&mut w),
            Self::Awareness(update) => w.push_var_bytes(update),
        }
        w.finish()
    }

    /// Deserialize from the binary wire format.
    ///
    /// Trailing bytes after a complete message are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (kind, mut r) = decode_envelope(bytes)?;
        match kind {
            MessageKind::Sync => Ok(Self::Sync(SyncMessage::read(&mut r)?)),
            MessageKind::Awareness => Ok(Self::Awareness(r.read_var_bytes()?.to_vec())),
        }
    }
}

/// Prefix `payload` with the varuint `kind`.
pub fn encode_envelope(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let mut w = BytesWriter::with_capacity(payload.len() + 1);
    w.push_var_uint(kind as u64);
    w.push_bytes(payload);
    w.finish()
}

/// Read the discriminator and hand back a reader positioned at the payload.
pub fn decode_envelope(bytes: &[u8]) -> Result<(MessageKind, BytesReader<'_>), ProtocolError> {
    let mut r = BytesReader::new(bytes);
    let kind = MessageKind::from_u64(r.read_var_uint()?)?;
    Ok((kind, r))
}

/// Decode errors. All of them are local to a single message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected end of message")]
    UnexpectedEof,
    #[error("varint exceeds 64 bits")]
    VarintOverflow,
    #[error("unknown message kind {0}")]
    UnknownMessageKind(u64),
    #[error("unknown sync message kind {0}")]
    UnknownSyncKind(u64),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid awareness state: {0}")]
    InvalidJson(String),
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },
}
