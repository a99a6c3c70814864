pub mod compiler;
pub mod config;
pub mod hex;
pub mod net;
mod node;

pub use compiler::{Board, MemoryBoard, MemoryCompiler, StateCompiler};
pub use config::{Fanout, RelayConfig};
pub use net::{
    error::{Error, ErrorKind, TransportError},
    identity::NodeIdentity,
    wire::{Submission, SubmissionResponse},
    BoardKey, ContentHash, PeerKey,
};
pub use node::{PeerInfo, Relay};

// Boards are sequenced by exactly one node, their master. Every other node that
// wants to change a board sends its edit, a submission, to that master and
// waits for the master to either assign it a sequence number or reject it.
// SYNAPSE is the part of a node that carries those submissions and their
// answers between nodes.

// Peers are linked by axons, one QUIC connection per peer, and every axon is
// driven by its own dispatch task. The dispatch task answers submissions from
// the peer and hands answers to our own submissions back to whoever is waiting
// for them. Waiting is keyed by the submission's content hash, so an answer
// can arrive on any axon and still reach the right caller, and the same edit
// can never be waiting twice.

// Nothing here survives a restart. A submission that is in flight when its
// axon drops simply never gets an answer, and the submitter's deadline is what
// ends the wait.
