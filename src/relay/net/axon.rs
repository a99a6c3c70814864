use std::net::SocketAddr;

use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use quinn::{ReadExactError, RecvStream, SendStream, VarInt};
use tokio::{select, sync::mpsc};
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    error::TransportError::{self, *},
    identity::key_of,
    PeerKey, KEY_LEN,
};

/// The largest frame the `u32` length prefix can describe.
pub const MAX_FRAME_LIMIT: usize = u32::MAX as usize;

/// Axons are the QUIC links between relays, one per connected peer.
///
/// Can be cloned to obtain another handle to the same axon. Each side opens a
/// single unidirectional stream to carry its frames, so the inbound half
/// ([`Inbound`]) is owned by the axon's dispatch loop. The outbound stream is
/// owned by a writer task that takes whole frames off a channel, so a sender
/// that goes away never leaves a frame half written.
#[derive(Clone)]
pub struct Axon {
    conn: quinn::Connection,
    remote_addr: SocketAddr,
    peer_key: PeerKey,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    max_frame_len: usize,
    connected_at: DateTime<Utc>,
}

impl Axon {
    /// Wraps an established connection, reading the peer's key from the
    /// certificate it presented.
    pub async fn new(
        conn: quinn::Connection,
        max_frame_len: usize,
    ) -> Result<(Self, Inbound), TransportError> {
        let remote_addr = conn.remote_address();
        let max_frame_len = frame_limit(max_frame_len);
        let span = debug_span!("axon", remote = %remote_addr);
        async move {
            let peer_key = peer_key_of(&conn)?;
            debug!("opening outbound stream");
            let stream = conn.open_uni().await?;
            let (outbound, frames) = mpsc::unbounded_channel();
            tokio::spawn(write_frames(conn.clone(), stream, frames).in_current_span());
            let inbound = Inbound {
                conn: conn.clone(),
                stream: None,
                max_frame_len,
            };
            Ok((
                Axon {
                    conn,
                    remote_addr,
                    peer_key,
                    outbound,
                    max_frame_len,
                    connected_at: Utc::now(),
                },
                inbound,
            ))
        }
        .instrument(span)
        .await
    }

    pub fn id(&self) -> usize {
        self.conn.stable_id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn peer_key(&self) -> PeerKey {
        self.peer_key
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queues one frame addressed to `to`. Returns once the frame is queued,
    /// not once it is written.
    pub fn send(&self, to: &PeerKey, payload: &[u8]) -> Result<(), TransportError> {
        let frame = encode_frame(to, payload, self.max_frame_len)?;
        self.outbound.send(frame).map_err(|_| WriterStopped)
    }

    /// Closes the connection. The dispatch loops on both ends see their
    /// inbound stream end.
    pub fn close(&self) {
        self.conn.close(VarInt::from_u32(0), b"disconnect");
    }
}

/// Clamps a configured frame limit to what the length prefix can carry.
pub fn frame_limit(max_frame_len: usize) -> usize {
    max_frame_len.min(MAX_FRAME_LIMIT)
}

/// frame: len (u32 LE) | to | payload
pub fn encode_frame(
    to: &PeerKey,
    payload: &[u8],
    max_frame_len: usize,
) -> Result<Vec<u8>, TransportError> {
    let len = KEY_LEN + payload.len();
    if len > max_frame_len {
        Err(FrameTooLarge(len))?
    }
    let prefix = u32::try_from(len).map_err(|_| FrameTooLarge(len))?;
    let mut buf = vec![0u8; 4];
    LittleEndian::write_u32(&mut buf, prefix);
    buf.reserve(len);
    buf.extend_from_slice(to);
    buf.extend_from_slice(payload);
    Ok(buf)
}

async fn write_frames(
    conn: quinn::Connection,
    mut stream: SendStream,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    loop {
        let frame = select! {
            _ = conn.closed() => return,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = stream.write_all(&frame).await {
            // the stream may end mid-frame, so nothing after it can be read
            warn!(error = %e, "failed to write frame, closing axon");
            conn.close(VarInt::from_u32(1), b"write failed");
            return;
        }
    }
    // every handle is gone
    if let Err(e) = stream.finish().await {
        debug!(error = %e, "failed to finish outbound stream");
    }
}

/// One addressed unit read off an axon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub to: PeerKey,
    pub payload: Vec<u8>,
}

/// The receiving half of an axon.
pub struct Inbound {
    conn: quinn::Connection,
    stream: Option<RecvStream>,
    max_frame_len: usize,
}

impl Inbound {
    /// Reads the next frame. `Ok(None)` means the peer finished its stream
    /// cleanly; errors mean the connection is gone or the stream is corrupt.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        // the peer's stream only shows up once it has written to it
        if self.stream.is_none() {
            self.stream = Some(self.conn.accept_uni().await?);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(ReadExactError::FinishedEarly) => return Ok(None),
            Err(e) => Err(e)?,
        }
        let len = LittleEndian::read_u32(&len_buf) as usize;
        if len > self.max_frame_len {
            Err(FrameTooLarge(len))?
        }
        if len < KEY_LEN {
            Err(FrameTooShort(len))?
        }

        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        let to = *array_ref![buf, 0, KEY_LEN];
        buf.drain(..KEY_LEN);
        Ok(Some(Frame { to, payload: buf }))
    }
}

fn peer_key_of(conn: &quinn::Connection) -> Result<PeerKey, TransportError> {
    let certs = conn
        .peer_identity()
        .and_then(|identity| identity.downcast::<Vec<rustls::Certificate>>().ok())
        .ok_or(MissingPeerIdentity)?;
    certs.first().map(key_of).ok_or(MissingPeerIdentity)
}
