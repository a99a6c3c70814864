use std::{
    net::SocketAddr,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{select, sync::broadcast};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

use super::{
    compiler::StateCompiler,
    config::{Fanout, RelayConfig},
    hex::HexDisplayExt,
    net::{
        connections::Connections,
        dispatch::{self, Shared},
        endpoint::Endpoint,
        error::Error,
        identity::NodeIdentity,
        pending::Pending,
        wire::{Envelope, MessageType, Submission},
        ContentHash, PeerKey,
    },
};

/// A connected peer as reported by [`Relay::peers`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: SocketAddr,
    pub key: PeerKey,
    pub connected_at: DateTime<Utc>,
}

/// Relays submissions to the masters of their boards and answers the
/// submissions that peers relay to this node.
///
/// Each relay owns its endpoint and registries, so several can run in one
/// process. Call [`Relay::close`] to stop it; dropping it only signals its
/// tasks to stop.
pub struct Relay {
    endpoint: Endpoint,
    shared: Arc<Shared>,
}

impl Relay {
    /// Binds the endpoint and starts accepting peers.
    pub async fn open(
        config: RelayConfig,
        identity: NodeIdentity,
        compiler: Arc<dyn StateCompiler>,
    ) -> Result<Self, Error> {
        let endpoint = Endpoint::bind(
            config.listen,
            &identity,
            config.keep_alive,
            config.max_frame_len,
        )?;
        let (disconnects, _) = broadcast::channel(config.disconnect_backlog.max(1));
        let shared = Arc::new(Shared {
            local_key: identity.peer_key(),
            config,
            compiler,
            connections: Connections::new(),
            pending: Pending::new(),
            initialised: AtomicBool::new(false),
            disconnects,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        shared
            .tracker
            .spawn(dispatch::accept_loop(shared.clone(), endpoint.clone()));
        info!(
            addr = %endpoint.local_addr()?,
            key = %shared.local_key.short(),
            "relay listening"
        );
        Ok(Self { endpoint, shared })
    }

    /// The key peers know this node by.
    pub fn local_key(&self) -> PeerKey {
        self.shared.local_key
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Whether a peer link has ever been established.
    pub fn is_initialised(&self) -> bool {
        self.shared.is_initialised()
    }

    /// Dials a peer once and starts dispatching its messages. There is no
    /// reconnect; callers dial again if they want one.
    pub async fn connect(&self, address: SocketAddr) -> Result<PeerKey, Error> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let (axon, inbound) = self.endpoint.connect(address).await?;
        let key = axon.peer_key();
        dispatch::attach(&self.shared, axon, inbound).await;
        Ok(key)
    }

    /// Closes the link to `address`. Returns whether there was one.
    pub async fn disconnect(&self, address: &SocketAddr) -> bool {
        if !self.is_initialised() {
            return false;
        }
        match self.shared.connections.unregister(address).await {
            Some(axon) => {
                axon.close();
                true
            }
            None => false,
        }
    }

    /// Relays `submission` to the master `target` and waits for its sequence
    /// number, or until `cancel` fires.
    ///
    /// The same content hash may only be in flight once at a time. A remote
    /// rejection comes back as [`Error::Remote`].
    pub async fn submit(
        &self,
        target: PeerKey,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> Result<u64, Error> {
        if !self.is_initialised() {
            return Err(Error::NotAllowed(
                "relay is not initialised - no available connections".into(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut waiter = self.shared.pending.add(submission.content_hash)?;

        let frame = Envelope::new(
            MessageType::Submission,
            self.shared.local_key,
            submission.to_body()?,
        )
        .encode();

        let mut axons = self.shared.connections.snapshot().await;
        if self.shared.config.fanout == Fanout::Target {
            axons.retain(|axon| axon.peer_key() == target);
            if axons.is_empty() {
                return Err(Error::NotFound(format!(
                    "peer {} is not connected",
                    target.short()
                )));
            }
        }

        // queuing never waits on a peer, so only the response wait below can
        // block and it always watches `cancel`
        let mut sent = 0;
        let mut errors = Vec::new();
        for axon in &axons {
            match axon.send(&target, &frame) {
                Ok(()) => sent += 1,
                Err(e) => errors.push(Error::from(e)),
            }
        }
        if sent == 0 {
            return Err(Error::Unsent(errors));
        }
        debug!(
            hash = %submission.content_hash.short(),
            target = %target.short(),
            sent,
            failed = errors.len(),
            "submission sent"
        );

        select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            response = waiter.recv() => response?.into_result(),
        }
    }

    /// [`Relay::submit`] with a deadline instead of a token.
    pub async fn submit_timeout(
        &self,
        target: PeerKey,
        submission: &Submission,
        timeout: Duration,
    ) -> Result<u64, Error> {
        let cancel = CancellationToken::new();
        match tokio::time::timeout(timeout, self.submit(target, submission, &cancel)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }

    /// Whether a submission with this hash is waiting for its response.
    pub fn is_pending(&self, hash: &ContentHash) -> bool {
        self.shared.pending.contains(hash)
    }

    /// The currently connected peers.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        if !self.is_initialised() {
            return Vec::new();
        }
        let mut peers = Vec::new();
        self.shared
            .connections
            .for_each(|axon| {
                peers.push(PeerInfo {
                    address: axon.remote_addr(),
                    key: axon.peer_key(),
                    connected_at: axon.connected_at(),
                })
            })
            .await;
        peers
    }

    /// Addresses of peers whose link dropped, as they drop. Links closed by
    /// [`Relay::close`] are not reported.
    pub fn disconnections(&self) -> broadcast::Receiver<SocketAddr> {
        self.shared.disconnects.subscribe()
    }

    /// Stops every task and waits for them to finish. Submissions still
    /// waiting fail with [`Error::Closed`].
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        for axon in self.shared.connections.drain().await {
            axon.close();
        }
        self.endpoint.close();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        self.shared.pending.clear();
        info!("relay closed");
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
