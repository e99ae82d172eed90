use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};

use crate::arena::Point;
use crate::pairing::PairingTable;
use crate::protocol::{ServerMessage, UserMeta};

pub type UserId = u32;

/// Messages a connection may have queued but not yet written.
pub const OUTBOX_CAPACITY: usize = 64;

/// Bounded queue drained by the connection's writer task.
///
/// Senders never wait. A full queue means the peer stopped reading: the
/// message is dropped and `overflow` fires so the owning handler can close.
pub struct Outbox {
    tx: mpsc::Sender<ServerMessage>,
    overflow: Arc<Notify>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);

        let outbox = Self {
            tx,
            overflow: Arc::new(Notify::new()),
        };

        (outbox, rx)
    }

    /// Fires once the queue has overflowed.
    pub fn overflow(&self) -> Arc<Notify> {
        self.overflow.clone()
    }

    pub fn send(&self, msg: ServerMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflow.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

pub struct User {
    pub id: UserId,
    /// Raw bytes of the first read, unvalidated.
    pub name: Vec<u8>,
    pub position: Option<Point>,
    pub pistol_armed: bool,
    pub searching: bool,
    outbox: Outbox,
}

impl User {
    /// Queue a message for this user. False if the connection is gone or stalled.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.outbox.send(msg)
    }

    pub fn meta(&self) -> UserMeta {
        UserMeta {
            name: String::from_utf8_lossy(&self.name).into_owned(),
            id: self.id,
        }
    }
}

/// Registered users by id.
///
/// Never hold a guard returned by [`Directory::get`] while touching another
/// user; two guards in the same shard deadlock.
#[derive(Default)]
pub struct Directory {
    users: DashMap<UserId, User>,
    next_id: AtomicU32,
}

impl Directory {
    pub fn register(&self, name: Vec<u8>, outbox: Outbox) -> UserId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        self.users.insert(
            id,
            User {
                id,
                name,
                position: None,
                pistol_armed: false,
                searching: false,
                outbox,
            },
        );

        id
    }

    pub fn get(&self, id: UserId) -> Option<Ref<'_, UserId, User>> {
        self.users.get(&id)
    }

    pub fn contains(&self, id: UserId) -> bool {
        self.users.contains_key(&id)
    }

    pub fn remove(&self, id: UserId) -> Option<User> {
        self.users.remove(&id).map(|(_, user)| user)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Run `f` on the user under its shard lock.
    pub fn update<R>(&self, id: UserId, f: impl FnOnce(&mut User) -> R) -> Option<R> {
        self.users.get_mut(&id).map(|mut guard| f(guard.value_mut()))
    }

    /// Forget arena positions. Called whenever a pairing starts or ends, so only
    /// an accepted duel has positions to shoot at.
    pub fn clear_positions(&self, a: UserId, b: UserId) {
        self.update(a, |u| u.position = None);
        self.update(b, |u| u.position = None);
    }

    pub fn name_of(&self, id: UserId) -> Option<Vec<u8>> {
        self.get(id).map(|user| user.name.clone())
    }

    pub fn send_to(&self, id: UserId, msg: ServerMessage) -> bool {
        self.get(id).is_some_and(|user| user.send(msg))
    }

    /// Everyone but `excluding` and users currently holding a pairing, ordered by id.
    pub fn list_others(&self, excluding: UserId, pairings: &PairingTable) -> Vec<UserMeta> {
        let paired = pairings.paired_ids();

        let mut list: Vec<UserMeta> = self
            .users
            .iter()
            .filter(|e| *e.key() != excluding && !paired.contains(e.key()))
            .map(|e| e.value().meta())
            .collect();

        list.sort_by_key(|meta| meta.id);
        list
    }

    /// Ids of users with the search flag set, ordered by id.
    pub fn searching(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self
            .users
            .iter()
            .filter(|e| e.value().searching)
            .map(|e| *e.key())
            .collect();

        ids.sort_unstable();
        ids
    }
}
