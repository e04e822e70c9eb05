//! Table of pending offers and live sessions.
//!
//! Layout is `type → mask → offer id → entry`. The table itself is plain
//! data; the [`DccManager`](crate::dcc::manager::DccManager) owns one behind
//! a short-lived mutex and decides what an entry holds.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Kind of DCC session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DccType {
    Chat,
    Send,
}

impl fmt::Display for DccType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat => f.write_str("CHAT"),
            Self::Send => f.write_str("SEND"),
        }
    }
}

/// Which side of the offer this process plays.
///
/// `Offering` listens and announces the offer; `Accepting` dials an
/// address announced by the peer. For `Send`, the offering side is the one
/// that reads the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Offering,
    Accepting,
}

/// Identifies an offer within one (type, mask) pair: the local listening
/// port when offering, the remote port when accepting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OfferId {
    pub role: Role,
    pub port: u16,
}

impl OfferId {
    pub fn new(role: Role, port: u16) -> Self {
        Self { role, port }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub kind: DccType,
    pub mask: String,
    pub id: OfferId,
}

impl SessionKey {
    pub fn new(kind: DccType, mask: impl Into<String>, id: OfferId) -> Self {
        Self {
            kind,
            mask: mask.into(),
            id,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}:{}", self.kind, self.mask, self.id.role, self.id.port)
    }
}

#[derive(Debug)]
pub(crate) struct Registry<E> {
    tables: HashMap<DccType, HashMap<String, BTreeMap<OfferId, E>>>,
}

impl<E> Default for Registry<E> {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }
}

impl<E> Registry<E> {
    /// Insert a new entry. Hands the entry back if the id is already taken
    /// for this (type, mask).
    pub fn insert(&mut self, key: &SessionKey, entry: E) -> Result<(), E> {
        let ids = self
            .tables
            .entry(key.kind)
            .or_default()
            .entry(key.mask.clone())
            .or_default();
        if ids.contains_key(&key.id) {
            return Err(entry);
        }
        ids.insert(key.id, entry);
        Ok(())
    }

    pub fn get(&self, key: &SessionKey) -> Option<&E> {
        self.tables.get(&key.kind)?.get(&key.mask)?.get(&key.id)
    }

    pub fn get_mut(&mut self, key: &SessionKey) -> Option<&mut E> {
        self.tables
            .get_mut(&key.kind)?
            .get_mut(&key.mask)?
            .get_mut(&key.id)
    }

    /// Remove an entry, pruning the mask level once it is empty.
    pub fn remove(&mut self, key: &SessionKey) -> Option<E> {
        let masks = self.tables.get_mut(&key.kind)?;
        let ids = masks.get_mut(&key.mask)?;
        let entry = ids.remove(&key.id);
        if ids.is_empty() {
            masks.remove(&key.mask);
        }
        entry
    }

    /// Offer ids currently registered for (type, mask), in id order.
    pub fn ids(&self, kind: DccType, mask: &str) -> Vec<OfferId> {
        self.tables
            .get(&kind)
            .and_then(|masks| masks.get(mask))
            .map(|ids| ids.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: DccType) -> usize {
        self.tables
            .get(&kind)
            .map(|masks| masks.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    pub fn count_for(&self, kind: DccType, mask: &str) -> usize {
        self.tables
            .get(&kind)
            .and_then(|masks| masks.get(mask))
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}
