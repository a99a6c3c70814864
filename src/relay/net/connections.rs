use std::net::SocketAddr;

use hashbrown::HashMap;
use tokio::sync::RwLock;

use super::axon::Axon;

/// Live axons keyed by remote address.
#[derive(Default)]
pub struct Connections {
    axons: RwLock<HashMap<SocketAddr, Axon>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an axon. A previous axon for the same address is handed back so
    /// the caller can close it.
    pub async fn register(&self, axon: Axon) -> Option<Axon> {
        self.axons.write().await.insert(axon.remote_addr(), axon)
    }

    pub async fn unregister(&self, addr: &SocketAddr) -> Option<Axon> {
        self.axons.write().await.remove(addr)
    }

    /// Unregisters `axon` unless its address has since been taken over by a
    /// newer connection.
    pub async fn release(&self, axon: &Axon) -> bool {
        let mut axons = self.axons.write().await;
        match axons.get(&axon.remote_addr()) {
            Some(current) if current.id() == axon.id() => {
                axons.remove(&axon.remote_addr());
                true
            }
            _ => false,
        }
    }

    pub async fn find(&self, addr: &SocketAddr) -> Option<Axon> {
        self.axons.read().await.get(addr).cloned()
    }

    /// A copy of the current axons. Holding it does not block registration.
    pub async fn snapshot(&self) -> Vec<Axon> {
        self.axons.read().await.values().cloned().collect()
    }

    /// Visits a snapshot, so `visit` is free to close or unregister axons.
    pub async fn for_each(&self, mut visit: impl FnMut(&Axon)) {
        for axon in self.snapshot().await {
            visit(&axon);
        }
    }

    /// Removes and returns every axon.
    pub async fn drain(&self) -> Vec<Axon> {
        self.axons.write().await.drain().map(|(_, axon)| axon).collect()
    }

    pub async fn len(&self) -> usize {
        self.axons.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.axons.read().await.is_empty()
    }
}
