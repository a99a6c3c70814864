// Every axon gets its own dispatch task. The task owns the axon's inbound
// stream and handles frames strictly in wire order; a slow submission holds up
// the rest of that one link but never another one. Tasks share nothing but the
// two registries, and they all stop on the relay's shutdown token.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::{select, sync::broadcast};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use super::{
    axon::{Axon, Frame, Inbound},
    connections::Connections,
    endpoint::Endpoint,
    error::Error,
    pending::Pending,
    wire::{Envelope, MessageType, Submission, SubmissionResponse},
    ContentHash, PeerKey,
};
use crate::relay::{config::RelayConfig, compiler::StateCompiler, hex::HexDisplayExt};

/// State shared between the relay handle and its tasks.
pub(crate) struct Shared {
    pub local_key: PeerKey,
    pub config: RelayConfig,
    pub compiler: Arc<dyn StateCompiler>,
    pub connections: Connections,
    pub pending: Pending,
    /// Set once the first axon is up. Never cleared.
    pub initialised: AtomicBool,
    pub disconnects: broadcast::Sender<SocketAddr>,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

impl Shared {
    pub fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Acquire)
    }
}

/// Registers a fresh axon and spawns its dispatch loop.
pub(crate) async fn attach(shared: &Arc<Shared>, axon: Axon, inbound: Inbound) {
    if let Some(replaced) = shared.connections.register(axon.clone()).await {
        debug!(remote = %replaced.remote_addr(), "replacing existing axon");
        replaced.close();
    }
    shared.initialised.store(true, Ordering::Release);
    info!(
        remote = %axon.remote_addr(),
        peer = %axon.peer_key().short(),
        "connected"
    );
    shared.tracker.spawn(run(shared.clone(), axon, inbound));
}

/// Accepts incoming axons until shutdown or until the endpoint closes.
pub(crate) async fn accept_loop(shared: Arc<Shared>, endpoint: Endpoint) {
    loop {
        let connecting = select! {
            _ = shared.shutdown.cancelled() => return,
            connecting = endpoint.accept() => match connecting {
                Some(connecting) => connecting,
                None => return,
            },
        };
        let shared = shared.clone();
        let endpoint = endpoint.clone();
        let remote = connecting.remote_address();
        shared.tracker.clone().spawn(async move {
            select! {
                _ = shared.shutdown.cancelled() => {}
                established = endpoint.establish(connecting) => match established {
                    Ok((axon, inbound)) => attach(&shared, axon, inbound).await,
                    Err(e) => warn!(%remote, error = %e, "failed to accept axon"),
                },
            }
        });
    }
}

/// The dispatch loop for one axon.
async fn run(shared: Arc<Shared>, axon: Axon, mut inbound: Inbound) {
    let span = info_span!(
        "axon",
        remote = %axon.remote_addr(),
        peer = %axon.peer_key().short()
    );
    async move {
        loop {
            select! {
                _ = shared.shutdown.cancelled() => {
                    debug!("shutting down");
                    return;
                }
                frame = inbound.recv() => match frame {
                    Ok(Some(frame)) => handle_frame(&shared, &axon, frame),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "inbound stream ended");
                        break;
                    }
                },
            }
        }

        shared.connections.release(&axon).await;
        let replaced = shared
            .connections
            .find(&axon.remote_addr())
            .await
            .is_some_and(|current| current.id() != axon.id());
        if replaced {
            debug!("superseded by a newer axon");
            return;
        }
        // nobody listening is fine
        let _ = shared.disconnects.send(axon.remote_addr());
        info!("disconnected");
    }
    .instrument(span)
    .await
}

fn handle_frame(shared: &Shared, axon: &Axon, frame: Frame) {
    if frame.to != shared.local_key {
        trace!(to = %frame.to.short(), "dropping frame addressed elsewhere");
        return;
    }

    let envelope = match Envelope::decode(&frame.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "received invalid message");
            return;
        }
    };
    debug!(kind = %envelope.msg_type, from = %envelope.from.short(), "received message");

    match envelope.msg_type {
        MessageType::Submission => {
            let (hash, outcome) = process_submission(shared.compiler.as_ref(), &envelope.body);
            match &outcome {
                Ok(seq) => debug!(hash = %hash.short(), seq, "submission applied"),
                Err(e) => debug!(hash = %hash.short(), error = %e, "submission rejected"),
            }
            let response = SubmissionResponse::from_outcome(hash, outcome);
            if let Err(e) = reply(shared, axon, &envelope.from, &response) {
                warn!(error = %e, "failed to send message");
            }
        }
        MessageType::SubmissionResponse => match SubmissionResponse::from_body(&envelope.body) {
            Ok(response) => {
                let hash = response.content_hash;
                if !shared.pending.satisfy(response) {
                    trace!(hash = %hash.short(), "discarding stale response");
                }
            }
            Err(e) => warn!(error = %e, "failed to obtain submission response"),
        },
    }
}

fn reply(
    shared: &Shared,
    axon: &Axon,
    to: &PeerKey,
    response: &SubmissionResponse,
) -> Result<(), Error> {
    let envelope = Envelope::new(
        MessageType::SubmissionResponse,
        shared.local_key,
        response.to_body()?,
    );
    axon.send(to, &envelope.encode())?;
    Ok(())
}

/// Validates an inbound submission and applies it to its board.
///
/// Always yields the content hash it was about (all zeroes when even that
/// could not be read) so the outcome can be sent back to the submitter.
pub(crate) fn process_submission(
    compiler: &dyn StateCompiler,
    body: &[u8],
) -> (ContentHash, Result<u64, Error>) {
    let submission = match Submission::from_body(body) {
        Ok(submission) => submission,
        Err(e) => return ([0; 32], Err(e)),
    };
    let hash = submission.content_hash;
    (hash, apply(compiler, &submission))
}

fn apply(compiler: &dyn StateCompiler, submission: &Submission) -> Result<u64, Error> {
    submission.verify()?;
    let board = compiler.board(&submission.board).map_err(|e| match e {
        Error::NotFound(_) => Error::NotFound("board instance not found".into()),
        e => Error::InvalidRead(format!("failed to obtain board instance: {}", e)),
    })?;
    if !board.is_master() {
        return Err(Error::NotAllowed("node does not own this board".into()));
    }
    board.submit(submission)
}
