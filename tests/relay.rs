use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use synapse::relay::{
    config::DEFAULT_MAX_FRAME_LEN,
    net::{
        endpoint::Endpoint,
        wire::{Envelope, MessageType},
    },
    Board, Error, ErrorKind, Fanout, MemoryBoard, MemoryCompiler, NodeIdentity, PeerKey, Relay,
    RelayConfig, StateCompiler, Submission, SubmissionResponse,
};
use tokio::{
    sync::broadcast::error::TryRecvError,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

const BOARD: [u8; 32] = [0xb0; 32];
/// A key no relay in these tests holds, so nobody ever answers it.
const NOBODY: [u8; 32] = [0x77; 32];
const WAIT: Duration = Duration::from_secs(10);

fn loopback() -> RelayConfig {
    RelayConfig::builder()
        .listen(([127, 0, 0, 1], 0).into())
        .build()
}

async fn relay_with(config: RelayConfig, compiler: Arc<dyn StateCompiler>) -> Relay {
    Relay::open(config, NodeIdentity::generate().unwrap(), compiler)
        .await
        .unwrap()
}

async fn relay(compiler: Arc<dyn StateCompiler>) -> Relay {
    relay_with(loopback(), compiler).await
}

async fn empty_relay() -> Relay {
    relay(Arc::new(MemoryCompiler::new())).await
}

/// A relay mastering `BOARD`, numbering from `first_seq`.
async fn master(first_seq: u64) -> (Relay, Arc<MemoryBoard>) {
    let compiler = Arc::new(MemoryCompiler::new());
    let board = compiler.insert(BOARD, MemoryBoard::master_from(first_seq));
    (relay(compiler).await, board)
}

/// Dials `to` from `from` and waits until both ends have registered the axon.
async fn link(from: &Relay, to: &Relay) {
    let key = from.connect(to.local_addr().unwrap()).await.unwrap();
    assert_eq!(key, to.local_key());
    let local = from.local_key();
    timeout(WAIT, async {
        while !to.peers().await.iter().any(|p| p.key == local) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("accepting side never registered the axon");
}

async fn wait_pending(relay: &Relay, hash: &[u8; 32]) {
    timeout(WAIT, async {
        while !relay.is_pending(hash) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("submission never became pending");
}

fn spawn_submit(
    relay: &Arc<Relay>,
    target: PeerKey,
    submission: Submission,
) -> JoinHandle<Result<u64, Error>> {
    let relay = relay.clone();
    tokio::spawn(async move {
        relay
            .submit_timeout(target, &submission, Duration::from_secs(30))
            .await
    })
}

/// A relay whose only board sleeps `delay` before sequencing each submission.
async fn slow_master(delay: Duration) -> (Relay, Arc<SlowBoard>) {
    let board = Arc::new(SlowBoard {
        inner: MemoryBoard::master(),
        delay,
    });
    (relay(Arc::new(SlowCompiler(board.clone()))).await, board)
}

/// About 900 KiB, so two of them fill a peer's stream window.
fn large(fill: u8) -> Submission {
    Submission::new(BOARD, vec![fill; 900 * 1024])
}

/// Sequences like a master board, but only after holding up its dispatch loop.
struct SlowBoard {
    inner: MemoryBoard,
    delay: Duration,
}

impl Board for SlowBoard {
    fn is_master(&self) -> bool {
        true
    }

    fn submit(&self, submission: &Submission) -> Result<u64, Error> {
        std::thread::sleep(self.delay);
        self.inner.submit(submission)
    }
}

struct SlowCompiler(Arc<SlowBoard>);

impl StateCompiler for SlowCompiler {
    fn board(&self, key: &[u8; 32]) -> Result<Arc<dyn Board>, Error> {
        if *key == BOARD {
            Ok(self.0.clone() as Arc<dyn Board>)
        } else {
            Err(Error::NotFound("no such board".into()))
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn round_trip_returns_sequence_number() {
    let (b, board) = master(42).await;
    let a = empty_relay().await;
    link(&a, &b).await;

    let submission = Submission::new(BOARD, b"first edit".to_vec());
    let seq = timeout(WAIT, a.submit(b.local_key(), &submission, &CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seq, 42);
    assert_eq!(board.history(), vec![submission.content_hash]);
    assert!(!a.is_pending(&submission.content_hash));

    let second = Submission::new(BOARD, b"second edit".to_vec());
    let seq = a.submit_timeout(b.local_key(), &second, WAIT).await.unwrap();
    assert_eq!(seq, 43);

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn master_can_submit_over_an_inbound_axon() {
    let (b, _) = master(0).await;
    let (a, board) = master(7).await;
    // b dialed a, so a only knows b from its acceptor
    link(&b, &a).await;

    let submission = Submission::new(BOARD, b"from the dialer".to_vec());
    assert_eq!(b.submit_timeout(a.local_key(), &submission, WAIT).await.unwrap(), 7);
    assert_eq!(board.history().len(), 1);

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn uninitialised_relay_is_not_allowed() {
    let a = empty_relay().await;
    assert!(!a.is_initialised());
    assert!(a.peers().await.is_empty());

    let submission = Submission::new(BOARD, b"too early".to_vec());
    let err = a
        .submit(NOBODY, &submission, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAllowed);
    assert!(!a.is_pending(&submission.content_hash));
    assert!(!a.disconnect(&"127.0.0.1:1".parse().unwrap()).await);

    a.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_hash_is_already_pending() {
    let (b, _) = master(0).await;
    let a = Arc::new(empty_relay().await);
    link(&a, &b).await;

    let submission = Submission::new(BOARD, b"twice".to_vec());
    let hash = submission.content_hash;
    let cancel = CancellationToken::new();
    let first = tokio::spawn({
        let a = a.clone();
        let submission = submission.clone();
        let cancel = cancel.clone();
        async move { a.submit(NOBODY, &submission, &cancel).await }
    });
    wait_pending(&a, &hash).await;

    let err = a
        .submit(NOBODY, &submission, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyPending(h) if h == hash));
    // the rejected duplicate must not have evicted the first
    assert!(a.is_pending(&hash));

    cancel.cancel();
    let err = timeout(WAIT, first).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(!a.is_pending(&hash));

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deadline_leaves_nothing_pending() {
    let (b, board) = master(0).await;
    let a = empty_relay().await;
    link(&a, &b).await;

    let submission = Submission::new(BOARD, b"into the void".to_vec());
    let err = a
        .submit_timeout(NOBODY, &submission, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    assert!(!a.is_pending(&submission.content_hash));
    // b saw the frame but it was not addressed to it
    assert!(board.history().is_empty());

    // the same content can be retried once the first attempt is gone
    let seq = a.submit_timeout(b.local_key(), &submission, WAIT).await.unwrap();
    assert_eq!(seq, 0);

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_board_is_reported_by_the_peer() {
    let (b, _) = master(0).await;
    let a = empty_relay().await;
    link(&a, &b).await;

    let submission = Submission::new([0xee; 32], b"wrong board".to_vec());
    let err = a.submit_timeout(b.local_key(), &submission, WAIT).await.unwrap_err();
    match err {
        Error::Remote { kind, message } => {
            assert_eq!(kind, ErrorKind::NotFound);
            assert_eq!(message, "board instance not found");
        }
        other => panic!("expected a remote error, got {other}"),
    }

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn followed_board_is_refused_and_not_applied() {
    let compiler = Arc::new(MemoryCompiler::new());
    let board = compiler.insert(BOARD, MemoryBoard::follower());
    let b = relay(compiler).await;
    let a = empty_relay().await;
    link(&a, &b).await;

    let submission = Submission::new(BOARD, b"not yours".to_vec());
    let err = a.submit_timeout(b.local_key(), &submission, WAIT).await.unwrap_err();
    assert!(matches!(err, Error::Remote { kind: ErrorKind::NotAllowed, .. }));
    assert!(board.history().is_empty());

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn losing_one_peer_does_not_disturb_another() {
    let slow = Arc::new(SlowBoard {
        inner: MemoryBoard::master_from(5),
        delay: Duration::from_millis(300),
    });
    let c = relay(Arc::new(SlowCompiler(slow.clone()))).await;
    let (b, _) = master(0).await;
    let a = Arc::new(empty_relay().await);
    link(&a, &b).await;
    link(&a, &c).await;

    let mut disconnections = a.disconnections();
    let submission = Submission::new(BOARD, b"slow answer".to_vec());
    let hash = submission.content_hash;
    let pending = tokio::spawn({
        let a = a.clone();
        let target = c.local_key();
        async move { a.submit_timeout(target, &submission, WAIT).await }
    });
    wait_pending(&a, &hash).await;

    b.close().await;
    let gone = timeout(WAIT, disconnections.recv()).await.unwrap().unwrap();
    assert_eq!(gone, b.local_addr().unwrap());

    let seq = timeout(WAIT, pending).await.unwrap().unwrap().unwrap();
    assert_eq!(seq, 5);
    assert_eq!(slow.inner.history(), vec![hash]);

    a.close().await;
    c.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_is_reported_to_the_peer() {
    let (b, _) = master(0).await;
    let a = empty_relay().await;
    link(&a, &b).await;
    assert!(a.is_initialised());
    assert!(b.is_initialised());

    let peers = a.peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].key, b.local_key());
    assert_eq!(peers[0].address, b.local_addr().unwrap());

    let a_seen_by_b: SocketAddr = b
        .peers()
        .await
        .into_iter()
        .find(|p| p.key == a.local_key())
        .map(|p| p.address)
        .unwrap();

    let mut disconnections = a.disconnections();
    assert!(b.disconnect(&a_seen_by_b).await);
    assert!(!b.disconnect(&a_seen_by_b).await);

    let gone = timeout(WAIT, disconnections.recv()).await.unwrap().unwrap();
    assert_eq!(gone, b.local_addr().unwrap());
    assert!(a.peers().await.is_empty());
    // still initialised: the flag records that a link was ever made
    assert!(a.is_initialised());

    // with no axons left there is nowhere to send
    let submission = Submission::new(BOARD, b"alone".to_vec());
    let err = a.submit_timeout(b.local_key(), &submission, WAIT).await.unwrap_err();
    assert!(matches!(err, Error::Unsent(ref causes) if causes.is_empty()));
    assert!(!a.is_pending(&submission.content_hash));

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn targeted_fanout_needs_the_target_connected() {
    let (b, _) = master(3).await;
    let a = relay_with(
        RelayConfig::builder()
            .listen(([127, 0, 0, 1], 0).into())
            .fanout(Fanout::Target)
            .build(),
        Arc::new(MemoryCompiler::new()),
    )
    .await;
    link(&a, &b).await;

    let submission = Submission::new(BOARD, b"aimed".to_vec());
    let err = a.submit_timeout(NOBODY, &submission, WAIT).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!a.is_pending(&submission.content_hash));

    assert_eq!(a.submit_timeout(b.local_key(), &submission, WAIT).await.unwrap(), 3);

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn close_fails_waiting_submissions() {
    let (b, _) = master(0).await;
    let a = Arc::new(empty_relay().await);
    link(&a, &b).await;

    let submission = Submission::new(BOARD, b"cut short".to_vec());
    let hash = submission.content_hash;
    let waiting = tokio::spawn({
        let a = a.clone();
        async move {
            a.submit(NOBODY, &submission, &CancellationToken::new())
                .await
        }
    });
    wait_pending(&a, &hash).await;

    a.close().await;
    let err = timeout(WAIT, waiting).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    assert!(!a.is_pending(&hash));

    // closing twice is harmless, and a closed relay dials nobody
    a.close().await;
    let err = a.connect(b.local_addr().unwrap()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);

    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_submit_leaves_the_link_usable() {
    let (b, board) = slow_master(Duration::from_millis(500)).await;
    let a = Arc::new(empty_relay().await);
    link(&a, &b).await;
    let target = b.local_key();

    // b sits on each submission, so its receive window fills up behind them
    let small = Submission::new(BOARD, b"small".to_vec());
    let first = spawn_submit(&a, target, small.clone());
    wait_pending(&a, &small.content_hash).await;
    let big = large(1);
    let second = spawn_submit(&a, target, big.clone());
    wait_pending(&a, &big.content_hash).await;

    let abandoned = large(2);
    let err = a
        .submit_timeout(target, &abandoned, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

    let last = Submission::new(BOARD, b"after the deadline".to_vec());
    let seq = a
        .submit_timeout(target, &last, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(timeout(WAIT, first).await.unwrap().unwrap().unwrap(), 0);
    assert_eq!(timeout(WAIT, second).await.unwrap().unwrap().unwrap(), 1);
    // the abandoned frame still went out whole, ahead of the last one
    assert_eq!(seq, 3);
    assert_eq!(
        board.inner.history(),
        vec![
            small.content_hash,
            big.content_hash,
            abandoned.content_hash,
            last.content_hash
        ]
    );

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_is_honoured_while_a_peer_is_stalled() {
    let (b, _) = slow_master(Duration::from_secs(1)).await;
    let a = Arc::new(empty_relay().await);
    link(&a, &b).await;
    let target = b.local_key();

    let small = Submission::new(BOARD, b"small".to_vec());
    let _first = spawn_submit(&a, target, small.clone());
    wait_pending(&a, &small.content_hash).await;
    let (one, two) = (large(1), large(2));
    let _second = spawn_submit(&a, target, one.clone());
    let _third = spawn_submit(&a, target, two.clone());
    wait_pending(&a, &one.content_hash).await;
    wait_pending(&a, &two.content_hash).await;

    let stalled = large(3);
    let hash = stalled.content_hash;
    let cancel = CancellationToken::new();
    let waiting = tokio::spawn({
        let a = a.clone();
        let cancel = cancel.clone();
        async move { a.submit(target, &stalled, &cancel).await }
    });
    wait_pending(&a, &hash).await;

    cancel.cancel();
    let err = timeout(Duration::from_millis(500), waiting)
        .await
        .expect("cancellation was not honoured")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(!a.is_pending(&hash));

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_frames_do_not_stop_dispatch() {
    let (b, board) = master(9).await;
    let identity = NodeIdentity::generate().unwrap();
    let me = identity.peer_key();
    let raw = Endpoint::bind(
        ([127, 0, 0, 1], 0).into(),
        &identity,
        Duration::from_secs(5),
        DEFAULT_MAX_FRAME_LEN,
    )
    .unwrap();
    let (axon, mut inbound) = raw.connect(b.local_addr().unwrap()).await.unwrap();
    let to = b.local_key();

    let mut unknown_type = Envelope::new(MessageType::Submission, me, vec![]).encode();
    unknown_type[0] = 0xff;
    axon.send(&to, &unknown_type).unwrap();
    axon.send(&to, &[1, 2, 3]).unwrap();
    let garbage_response =
        Envelope::new(MessageType::SubmissionResponse, me, b"garbage".to_vec());
    axon.send(&to, &garbage_response.encode()).unwrap();
    // an unreadable submission is still answered
    let garbage_submission = Envelope::new(MessageType::Submission, me, b"garbage".to_vec());
    axon.send(&to, &garbage_submission.encode()).unwrap();

    let submission = Submission::new(BOARD, b"still listening".to_vec());
    let valid = Envelope::new(MessageType::Submission, me, submission.to_body().unwrap());
    axon.send(&to, &valid.encode()).unwrap();

    let mut responses = Vec::new();
    while responses.len() < 2 {
        let frame = timeout(WAIT, inbound.recv())
            .await
            .unwrap()
            .unwrap()
            .expect("inbound stream ended");
        assert_eq!(frame.to, me);
        let envelope = Envelope::decode(&frame.payload).unwrap();
        assert_eq!(envelope.msg_type, MessageType::SubmissionResponse);
        assert_eq!(envelope.from, to);
        responses.push(SubmissionResponse::from_body(&envelope.body).unwrap());
    }

    assert_eq!(responses[0].content_hash, [0; 32]);
    let err = responses[0].clone().into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRead);
    assert_eq!(responses[1].content_hash, submission.content_hash);
    assert_eq!(responses[1].clone().into_result().unwrap(), 9);
    assert_eq!(board.history(), vec![submission.content_hash]);
    assert!(b.peers().await.iter().any(|p| p.key == me));

    raw.close();
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn redialing_an_address_is_not_a_disconnect() {
    let (b, _) = master(0).await;
    let a = empty_relay().await;
    link(&a, &b).await;

    let mut disconnections = a.disconnections();
    assert_eq!(a.connect(b.local_addr().unwrap()).await.unwrap(), b.local_key());
    sleep(Duration::from_millis(300)).await;
    assert!(matches!(disconnections.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(a.peers().await.len(), 1);

    let submission = Submission::new(BOARD, b"over the new axon".to_vec());
    assert_eq!(a.submit_timeout(b.local_key(), &submission, WAIT).await.unwrap(), 0);

    a.close().await;
    b.close().await;
}
