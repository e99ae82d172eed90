use std::sync::Arc;
use tokio::sync::Notify;

use crate::arena::Arena;
use crate::directory::Directory;
use crate::pairing::PairingTable;

#[derive(Clone, Default)]
pub struct ServerState {
    pub directory: Arc<Directory>,
    pub pairings: Arc<PairingTable>,
    /// Wakes the opponent search worker.
    pub search: Arc<Notify>,
    pub arena: Arena,
}

impl ServerState {
    pub fn new(arena: Arena) -> Self {
        Self {
            arena,
            ..Self::default()
        }
    }
}
