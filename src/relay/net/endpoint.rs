use std::{net::SocketAddr, sync::Arc, time::Duration};

use quinn::{Connecting, VarInt};
use tracing::debug;

use super::{
    axon::{Axon, Inbound},
    error::TransportError,
    identity::NodeIdentity,
    SERVER_NAME,
};

/// A QUIC endpoint that both accepts and dials axons.
#[derive(Clone)]
pub struct Endpoint {
    ep: quinn::Endpoint,
    max_frame_len: usize,
}

impl Endpoint {
    /// Binds a QUIC endpoint to `addr`, presenting `identity` on every link.
    pub fn bind(
        addr: SocketAddr,
        identity: &NodeIdentity,
        keep_alive: Duration,
        max_frame_len: usize,
    ) -> Result<Self, TransportError> {
        let (client_tls, server_tls) = identity.tls_config()?;

        // shared transport configuration for the server and client sides
        // this is the default config with the BBR congestion controller enabled
        let mut transport_config = quinn::TransportConfig::default();
        let bbr_config = quinn::congestion::BbrConfig::default();
        transport_config.congestion_controller_factory(Arc::new(bbr_config));
        transport_config.keep_alive_interval(Some(keep_alive));
        let transport_config = Arc::new(transport_config);

        let mut server_config =
            quinn::ServerConfig::with_crypto(Arc::new(server_tls));
        server_config.transport_config(transport_config.clone());

        let mut client_config = quinn::ClientConfig::new(Arc::new(client_tls));
        client_config.transport_config(transport_config);

        let mut ep = quinn::Endpoint::server(server_config, addr)?;
        ep.set_default_client_config(client_config);
        Ok(Self { ep, max_frame_len })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.ep.local_addr()?)
    }

    /// Dials `remote` and completes the QUIC handshake.
    pub async fn connect(
        &self,
        remote: SocketAddr,
    ) -> Result<(Axon, Inbound), TransportError> {
        debug!(%remote, "dialing");
        let conn = self.ep.connect(remote, SERVER_NAME)?.await?;
        Axon::new(conn, self.max_frame_len).await
    }

    /// Waits for the next incoming connection. Returns `None` once the
    /// endpoint is closed.
    pub async fn accept(&self) -> Option<Connecting> {
        self.ep.accept().await
    }

    /// Completes a connection handed out by [`Endpoint::accept`].
    pub async fn establish(
        &self,
        connecting: Connecting,
    ) -> Result<(Axon, Inbound), TransportError> {
        let conn = connecting.await?;
        Axon::new(conn, self.max_frame_len).await
    }

    /// Closes every connection and stops accepting new ones.
    pub fn close(&self) {
        self.ep.close(VarInt::from_u32(0), b"shutdown");
    }
}
