use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{error::Error, wire::SubmissionResponse, ContentHash};

/// Submissions waiting for their response, keyed by content hash.
///
/// At most one request per hash may be in flight. Dispatch loops deliver into
/// it concurrently with the submitting callers adding and removing entries.
#[derive(Default)]
pub struct Pending {
    waiting: Mutex<HashMap<ContentHash, Entry>>,
    tickets: AtomicU64,
}

struct Entry {
    /// Tells a waiter apart from a later request that reused its key.
    ticket: u64,
    tx: oneshot::Sender<SubmissionResponse>,
}

impl Pending {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key`, failing if a request for it is already in flight.
    /// The entry is removed again when the returned waiter is dropped.
    pub fn add(&self, key: ContentHash) -> Result<Waiter<'_>, Error> {
        let mut waiting = self.waiting.lock();
        if waiting.contains_key(&key) {
            return Err(Error::AlreadyPending(key));
        }
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        waiting.insert(key, Entry { ticket, tx });
        Ok(Waiter {
            pending: self,
            key,
            ticket,
            rx,
        })
    }

    /// Drops the entry for `key`, if any. Its waiter observes the closure.
    pub fn remove(&self, key: &ContentHash) {
        self.waiting.lock().remove(key);
    }

    /// Hands a response to whoever waits for its hash. Returns false when the
    /// response is stale: nobody is waiting, or the waiter already left.
    pub fn satisfy(&self, response: SubmissionResponse) -> bool {
        let entry = self.waiting.lock().remove(&response.content_hash);
        match entry {
            Some(entry) => entry.tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, key: &ContentHash) -> bool {
        self.waiting.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.lock().is_empty()
    }

    /// Closes every waiter.
    pub fn clear(&self) {
        self.waiting.lock().clear();
    }
}

/// The receiving half of a pending entry.
pub struct Waiter<'a> {
    pending: &'a Pending,
    key: ContentHash,
    ticket: u64,
    rx: oneshot::Receiver<SubmissionResponse>,
}

impl Waiter<'_> {
    pub fn key(&self) -> &ContentHash {
        &self.key
    }

    /// Waits for the response. Fails with `Closed` if the entry was removed
    /// before anything was delivered.
    pub async fn recv(&mut self) -> Result<SubmissionResponse, Error> {
        (&mut self.rx).await.map_err(|_| Error::Closed)
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        // a later request may have reused the key after satisfy, leave it be
        let mut waiting = self.pending.waiting.lock();
        if waiting
            .get(&self.key)
            .is_some_and(|entry| entry.ticket == self.ticket)
        {
            waiting.remove(&self.key);
        }
    }
}
