pub mod axon;
pub mod connections;
pub(crate) mod dispatch;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod pending;
pub mod wire;

/// A peer's identity: the BLAKE3 digest of its certificate.
pub type PeerKey = [u8; 32];
/// BLAKE3 digest of a submission's payload. Correlates requests and responses.
pub type ContentHash = [u8; 32];
/// The public key of a board.
pub type BoardKey = [u8; 32];

pub const KEY_LEN: usize = 32;

pub const SYNAPSE_PORT: u16 = 4710;
/// Name presented in the TLS handshake. Peer certificates are pinned by key,
/// so this never has to resolve.
pub const SERVER_NAME: &str = "synapse.local";
pub const ALPN: &[u8] = b"synapse/1";
