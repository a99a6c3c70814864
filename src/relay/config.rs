use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use typed_builder::TypedBuilder;

use super::net::SYNAPSE_PORT;

/// Frames above this size are refused in both directions.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Which axons a submission is written to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Fanout {
    /// Every connected peer. Frames stay addressed to the target, so peers
    /// other than the target drop them.
    #[default]
    Broadcast,
    /// Only axons whose peer key is the target.
    Target,
}

#[derive(TypedBuilder, Clone, Debug)]
pub struct RelayConfig {
    /// Address the QUIC endpoint listens on.
    #[builder(default = SocketAddr::from((Ipv4Addr::UNSPECIFIED, SYNAPSE_PORT)))]
    pub listen: SocketAddr,
    #[builder(default = Duration::from_secs(5))]
    pub keep_alive: Duration,
    #[builder(default = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,
    #[builder(default)]
    pub fanout: Fanout,
    /// Disconnect notifications buffered per subscriber before the oldest are
    /// dropped.
    #[builder(default = 64)]
    pub disconnect_backlog: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
