use std::fmt;

use arrayref::array_ref;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use super::{
    error::{Error, ErrorKind},
    BoardKey, ContentHash, PeerKey, KEY_LEN,
};

/// Scratch space reserved by the rkyv serializer for message bodies.
const SCRATCH: usize = 256;

/// The first byte of every envelope. Only these two types are handled by the
/// relay; anything else is rejected as malformed.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// A content change sent to the master of its board
    Submission = 1,
    /// The master's verdict on a submission
    SubmissionResponse = 2,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Submission),
            2 => Ok(MessageType::SubmissionResponse),
            other => Err(Error::MalformedMessage(format!(
                "unknown message type {}",
                other
            ))),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(msg_type: MessageType) -> Self {
        msg_type as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Submission => f.write_str("submission"),
            MessageType::SubmissionResponse => f.write_str("submission response"),
        }
    }
}

/// A decoded wire message.
///
/// Layout: `type (1) | from (32) | body`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: MessageType,
    /// The node that created the message. Replies are addressed to it.
    pub from: PeerKey,
    pub body: Vec<u8>,
}

impl Envelope {
    pub const HEADER_LEN: usize = 1 + KEY_LEN;

    pub fn new(msg_type: MessageType, from: PeerKey, body: Vec<u8>) -> Self {
        Self {
            msg_type,
            from,
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_LEN + self.body.len());
        buf.push(self.msg_type.into());
        buf.extend_from_slice(&self.from);
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::HEADER_LEN {
            return Err(Error::MalformedMessage(format!(
                "envelope of {} bytes is shorter than its {} byte header",
                buf.len(),
                Self::HEADER_LEN
            )));
        }
        Ok(Self {
            msg_type: MessageType::try_from(buf[0])?,
            from: *array_ref![buf, 1, KEY_LEN],
            body: buf[Self::HEADER_LEN..].to_vec(),
        })
    }
}

/// A proposed content change for a board.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Submission {
    /// BLAKE3 of `payload`.
    pub content_hash: ContentHash,
    pub board: BoardKey,
    pub payload: Vec<u8>,
}

impl Submission {
    pub fn new(board: BoardKey, payload: Vec<u8>) -> Self {
        Self {
            content_hash: *blake3::hash(&payload).as_bytes(),
            board,
            payload,
        }
    }

    /// Checks that the payload is the content the hash claims.
    pub fn verify(&self) -> Result<(), Error> {
        if *blake3::hash(&self.payload).as_bytes() != self.content_hash {
            return Err(Error::InvalidRead(
                "failed to extract transport: payload does not match its content hash".into(),
            ));
        }
        Ok(())
    }

    pub fn to_body(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<_, SCRATCH>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| Error::Internal(format!("failed to serialize submission: {:?}", e)))
    }

    pub fn from_body(body: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self>(&aligned(body)).map_err(|e| {
            Error::InvalidRead(format!("failed to extract submission: {:?}", e))
        })
    }
}

/// An error reported by the node that handled a submission.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RemoteError {
    /// An [`ErrorKind`] code.
    pub kind: u8,
    pub message: String,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct SubmissionResponse {
    pub content_hash: ContentHash,
    /// The sequence number assigned by the master, zero on error.
    pub seq: u64,
    pub error: Option<RemoteError>,
}

impl SubmissionResponse {
    pub fn from_outcome(content_hash: ContentHash, outcome: Result<u64, Error>) -> Self {
        match outcome {
            Ok(seq) => Self {
                content_hash,
                seq,
                error: None,
            },
            Err(e) => Self {
                content_hash,
                seq: 0,
                error: Some(RemoteError {
                    kind: e.kind().code(),
                    message: e.message(),
                }),
            },
        }
    }

    pub fn into_result(self) -> Result<u64, Error> {
        match self.error {
            None => Ok(self.seq),
            Some(RemoteError { kind, message }) => Err(Error::Remote {
                kind: ErrorKind::from_code(kind),
                message,
            }),
        }
    }

    pub fn to_body(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<_, SCRATCH>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| Error::Internal(format!("failed to serialize response: {:?}", e)))
    }

    pub fn from_body(body: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self>(&aligned(body)).map_err(|e| {
            Error::MalformedMessage(format!("failed to extract submission response: {:?}", e))
        })
    }
}

/// rkyv validates alignment, and a body sliced out of a frame has none.
fn aligned(body: &[u8]) -> AlignedVec {
    let mut buf = AlignedVec::with_capacity(body.len());
    buf.extend_from_slice(body);
    buf
}
