use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::directory::UserId;

/// Who is invited to or dueling whom. Entries always exist in both directions.
#[derive(Default)]
pub struct PairingTable {
    inner: Mutex<HashMap<UserId, UserId>>,
}

impl PairingTable {
    /// Pair `a` with `b` if neither is paired yet.
    pub fn try_pair(&self, a: UserId, b: UserId) -> bool {
        if a == b {
            return false;
        }

        let mut games = self.inner.lock();

        if games.contains_key(&a) || games.contains_key(&b) {
            return false;
        }

        games.insert(a, b);
        games.insert(b, a);

        true
    }

    /// Remove the `a <-> b` pairing. False if `a` is not paired with `b`.
    pub fn unpair(&self, a: UserId, b: UserId) -> bool {
        let mut games = self.inner.lock();

        if games.get(&a) != Some(&b) {
            return false;
        }

        games.remove(&a);
        games.remove(&b);

        true
    }

    /// Remove whatever pairing `a` holds and return the former opponent.
    pub fn dissolve(&self, a: UserId) -> Option<UserId> {
        let mut games = self.inner.lock();

        let b = games.remove(&a)?;
        games.remove(&b);

        Some(b)
    }

    pub fn opponent_of(&self, a: UserId) -> Option<UserId> {
        self.inner.lock().get(&a).copied()
    }

    pub fn is_paired(&self, a: UserId) -> bool {
        self.inner.lock().contains_key(&a)
    }

    pub fn paired_ids(&self) -> HashSet<UserId> {
        self.inner.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
