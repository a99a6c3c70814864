//! The board state the relay submits into.
//!
//! The relay never stores content itself. It resolves boards through a
//! [`StateCompiler`] and lets the [`Board`] decide whether and where a
//! submission lands in its history.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use super::{
    hex::HexDisplayExt,
    net::{error::Error, wire::Submission, BoardKey, ContentHash},
};

pub trait StateCompiler: Send + Sync {
    /// Fails with [`Error::NotFound`] for boards this node does not know.
    fn board(&self, key: &BoardKey) -> Result<Arc<dyn Board>, Error>;
}

pub trait Board: Send + Sync {
    /// Whether this node masters the board and may sequence its submissions.
    fn is_master(&self) -> bool;

    /// Applies the submission and returns its sequence number.
    fn submit(&self, submission: &Submission) -> Result<u64, Error>;
}

/// Keeps boards in memory. Used by the node binary and the tests.
#[derive(Default)]
pub struct MemoryCompiler {
    boards: RwLock<HashMap<BoardKey, Arc<MemoryBoard>>>,
}

impl MemoryCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: BoardKey, board: MemoryBoard) -> Arc<MemoryBoard> {
        let board = Arc::new(board);
        self.boards.write().insert(key, board.clone());
        board
    }

    pub fn get(&self, key: &BoardKey) -> Option<Arc<MemoryBoard>> {
        self.boards.read().get(key).cloned()
    }
}

impl StateCompiler for MemoryCompiler {
    fn board(&self, key: &BoardKey) -> Result<Arc<dyn Board>, Error> {
        match self.boards.read().get(key) {
            Some(board) => Ok(board.clone() as Arc<dyn Board>),
            None => Err(Error::NotFound(format!(
                "board {} is not known to this node",
                key.short()
            ))),
        }
    }
}

pub struct MemoryBoard {
    master: bool,
    first_seq: u64,
    history: Mutex<Vec<ContentHash>>,
}

impl MemoryBoard {
    /// A board this node masters, numbering submissions from zero.
    pub fn master() -> Self {
        Self::master_from(0)
    }

    pub fn master_from(first_seq: u64) -> Self {
        Self {
            master: true,
            first_seq,
            history: Mutex::new(Vec::new()),
        }
    }

    /// A board this node only follows.
    pub fn follower() -> Self {
        Self {
            master: false,
            first_seq: 0,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Content hashes in sequence order.
    pub fn history(&self) -> Vec<ContentHash> {
        self.history.lock().clone()
    }
}

impl Board for MemoryBoard {
    fn is_master(&self) -> bool {
        self.master
    }

    fn submit(&self, submission: &Submission) -> Result<u64, Error> {
        if !self.master {
            return Err(Error::NotAllowed("board is not mastered here".into()));
        }
        let mut history = self.history.lock();
        // resubmitting known content gets its original number back
        if let Some(index) = history.iter().position(|h| *h == submission.content_hash) {
            return Ok(self.first_seq + index as u64);
        }
        history.push(submission.content_hash);
        Ok(self.first_seq + history.len() as u64 - 1)
    }
}
