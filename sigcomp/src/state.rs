//! # State handling
//!
//! State items persist between messages of one compartment. A compartment
//! holds its items oldest first and never lets their total cost exceed
//! `state_memory_size`; when a commit needs room the lowest retention
//! priority goes first, the oldest among equals.
//!
//! Global states (typically the static SIP/SDP dictionary) are visible from
//! every compartment and are never evicted.

use crate::buffer::MemoryBuffer;
use crate::nack::NackReason;
use nebula_utils::{sha1_parts, SHA1_LEN};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Per-item bookkeeping charged on top of the value length.
pub const STATE_OVERHEAD: usize = 64;
pub const MIN_PARTIAL_ID_LENGTH: usize = 6;
pub const MAX_PARTIAL_ID_LENGTH: usize = SHA1_LEN;

pub type StateId = [u8; SHA1_LEN];

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum StateError {
    #[error("state not found")]
    NotFound,
    #[error("state id prefix matches more than one state")]
    Ambiguous,
    #[error("invalid partial state id length {0}")]
    InvalidIdLength(usize),
}

impl StateError {
    pub fn reason(&self) -> NackReason {
        match self {
            StateError::NotFound => NackReason::StateNotFound,
            StateError::Ambiguous => NackReason::IdNotUnique,
            StateError::InvalidIdLength(_) => NackReason::InvalidStateIdLength,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompartmentId(pub Vec<u8>);

impl From<&str> for CompartmentId {
    fn from(s: &str) -> Self {
        CompartmentId(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for CompartmentId {
    fn from(v: Vec<u8>) -> Self {
        CompartmentId(v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateItem {
    pub id: StateId,
    pub value: Vec<u8>,
    /// Where the value is loaded in UDVM memory.
    pub address: u16,
    /// Where execution resumes after loading, 0 for none.
    pub instruction: u16,
    pub minimum_access_length: u16,
    pub retention_priority: u16,
}

impl StateItem {
    pub fn new(
        value: Vec<u8>,
        address: u16,
        instruction: u16,
        minimum_access_length: u16,
        retention_priority: u16,
    ) -> StateItem {
        let length = value.len() as u16;
        let id = sha1_parts(&[
            &length.to_be_bytes(),
            &address.to_be_bytes(),
            &instruction.to_be_bytes(),
            &minimum_access_length.to_be_bytes(),
            &value,
        ]);
        StateItem {
            id,
            value,
            address,
            instruction,
            minimum_access_length,
            retention_priority,
        }
    }

    pub fn cost(&self) -> usize {
        self.value.len() + STATE_OVERHEAD
    }

    /// Whether `prefix` is long enough for this item and starts its id.
    pub fn matches(&self, prefix: &[u8]) -> bool {
        prefix.len() >= self.minimum_access_length as usize && self.id.starts_with(prefix)
    }
}

/// A STATE-CREATE request waiting for END-MESSAGE. The value is taken from
/// memory when the request is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempState {
    pub length: u16,
    pub address: u16,
    pub instruction: u16,
    pub minimum_access_length: u16,
    pub retention_priority: u16,
}

impl TempState {
    pub fn capture(&self, memory: &MemoryBuffer) -> StateItem {
        StateItem::new(
            memory.store_external(self.address, self.length as usize),
            self.address,
            self.instruction,
            self.minimum_access_length,
            self.retention_priority,
        )
    }
}

fn check_prefix(prefix: &[u8]) -> Result<(), StateError> {
    if (MIN_PARTIAL_ID_LENGTH..=MAX_PARTIAL_ID_LENGTH).contains(&prefix.len()) {
        Ok(())
    } else {
        Err(StateError::InvalidIdLength(prefix.len()))
    }
}

/// Find the single item matching `prefix`. Copies of one state, such as a
/// compartment item re-saving a global dictionary, count as one match and
/// the first copy wins.
pub fn resolve<'a>(
    items: impl Iterator<Item = &'a StateItem>,
    prefix: &[u8],
) -> Result<&'a StateItem, StateError> {
    check_prefix(prefix)?;
    let mut found: Option<&StateItem> = None;
    for item in items.filter(|item| item.matches(prefix)) {
        match found {
            Some(first) if first.id == item.id => {}
            Some(_) => return Err(StateError::Ambiguous),
            None => found = Some(item),
        }
    }
    found.ok_or(StateError::NotFound)
}

pub struct Compartment {
    state_memory_size: usize,
    used: usize,
    // oldest first
    items: Vec<StateItem>,
    staged: Vec<StateItem>,
}

impl Compartment {
    pub fn new(state_memory_size: usize) -> Self {
        Self {
            state_memory_size,
            used: 0,
            items: Vec::new(),
            staged: Vec::new(),
        }
    }

    pub fn lookup(&self, prefix: &[u8]) -> Result<&StateItem, StateError> {
        resolve(self.items.iter(), prefix)
    }

    pub fn stage(&mut self, item: StateItem) {
        self.staged.push(item);
    }

    /// Delete the item matching `prefix`, committed or staged. Nothing is
    /// removed when the prefix is ambiguous.
    pub fn free(&mut self, prefix: &[u8]) -> Result<StateItem, StateError> {
        let id = resolve(self.items.iter().chain(self.staged.iter()), prefix)?.id;
        if let Some(pos) = self.staged.iter().position(|item| item.id == id) {
            return Ok(self.staged.remove(pos));
        }
        let pos = self
            .items
            .iter()
            .position(|item| item.id == id)
            .ok_or(StateError::NotFound)?;
        let item = self.items.remove(pos);
        self.used -= item.cost();
        Ok(item)
    }

    /// Move the staged items into the compartment, evicting older items
    /// as needed. Returns the items actually stored.
    pub fn commit(&mut self) -> Vec<StateItem> {
        let staged = std::mem::take(&mut self.staged);
        let mut batch = HashSet::new();
        let mut committed = Vec::new();
        for item in staged {
            if self.insert(item.clone(), &batch) {
                batch.insert(item.id);
                committed.push(item);
            }
        }
        committed
    }

    fn insert(&mut self, item: StateItem, batch: &HashSet<StateId>) -> bool {
        let cost = item.cost();
        if cost > self.state_memory_size {
            warn!(
                "state {} of {cost} bytes exceeds state memory {}",
                hex::encode(&item.id),
                self.state_memory_size
            );
            return false;
        }

        if let Some(pos) = self.items.iter().position(|i| i.id == item.id) {
            let existing = self.items.remove(pos);
            self.used -= existing.cost();
        }

        while self.used + cost > self.state_memory_size {
            let victim = self
                .items
                .iter()
                .enumerate()
                .filter(|(_, i)| !batch.contains(&i.id))
                .min_by_key(|(_, i)| i.retention_priority)
                .map(|(pos, _)| pos);
            match victim {
                Some(pos) => {
                    let evicted = self.items.remove(pos);
                    self.used -= evicted.cost();
                    debug!(
                        "evicted state {} priority {}",
                        hex::encode(&evicted.id),
                        evicted.retention_priority
                    );
                }
                None => {
                    warn!(
                        "no room for state {}",
                        hex::encode(&item.id)
                    );
                    return false;
                }
            }
        }

        self.used += cost;
        self.items.push(item);
        true
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateItem> {
        self.items.iter()
    }
}

pub struct StateStore {
    state_memory_size: usize,
    compartments: RwLock<HashMap<CompartmentId, Arc<Mutex<Compartment>>>>,
    globals: RwLock<Vec<StateItem>>,
}

impl StateStore {
    pub fn new(state_memory_size: usize) -> Self {
        Self {
            state_memory_size,
            compartments: RwLock::new(HashMap::new()),
            globals: RwLock::new(Vec::new()),
        }
    }

    pub fn state_memory_size(&self) -> usize {
        self.state_memory_size
    }

    /// The compartment for `id`, created empty on first use.
    pub fn compartment(&self, id: &CompartmentId) -> Arc<Mutex<Compartment>> {
        if let Some(compartment) = self.compartments.read().get(id) {
            return compartment.clone();
        }
        self.compartments
            .write()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Compartment::new(self.state_memory_size))))
            .clone()
    }

    pub fn close_compartment(&self, id: &CompartmentId) -> bool {
        self.compartments.write().remove(id).is_some()
    }

    /// Register a state shared by every compartment.
    pub fn add_global_state(&self, item: StateItem) {
        let mut globals = self.globals.write();
        if !globals.iter().any(|g| g.id == item.id) {
            globals.push(item);
        }
    }

    pub fn global_states(&self) -> Vec<StateItem> {
        self.globals.read().clone()
    }

    /// Find the state for `prefix` among the compartment's items and the
    /// global states.
    pub fn lookup(
        &self,
        compartment: Option<&CompartmentId>,
        prefix: &[u8],
    ) -> Result<StateItem, StateError> {
        let globals = self.globals.read();
        let compartment = compartment.and_then(|id| self.compartments.read().get(id).cloned());
        match compartment {
            Some(compartment) => {
                let compartment = compartment.lock();
                resolve(compartment.iter().chain(globals.iter()), prefix).cloned()
            }
            None => resolve(globals.iter(), prefix).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(fill: u8, priority: u16) -> StateItem {
        StateItem::new(vec![fill; 10], 0, 0, 6, priority)
    }

    fn with_id(id: StateId) -> StateItem {
        StateItem {
            id,
            value: b"value".to_vec(),
            address: 0,
            instruction: 0,
            minimum_access_length: 6,
            retention_priority: 0,
        }
    }

    #[test]
    fn id_covers_parameters() {
        let a = StateItem::new(b"abcd".to_vec(), 1024, 0, 6, 0);
        let b = StateItem::new(b"abcd".to_vec(), 1024, 0, 6, 9);
        let c = StateItem::new(b"abcd".to_vec(), 1025, 0, 6, 0);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        let mut data = vec![0, 4, 0x04, 0x00, 0, 0, 0, 6];
        data.extend(b"abcd");
        assert_eq!(nebula_utils::sha1(&data), a.id);
        assert_eq!(68, a.cost());
    }

    #[test]
    fn eviction_lowest_priority_then_oldest() {
        let mut compartment = Compartment::new(3 * 74);
        for (fill, priority) in [(1, 1), (2, 0), (3, 1)] {
            compartment.stage(item(fill, priority));
            assert_eq!(1, compartment.commit().len());
        }
        assert_eq!(222, compartment.used());

        compartment.stage(item(4, 5));
        compartment.commit();
        let fills: Vec<u8> = compartment.iter().map(|i| i.value[0]).collect();
        assert_eq!(vec![1, 3, 4], fills);

        compartment.stage(item(5, 1));
        compartment.commit();
        let fills: Vec<u8> = compartment.iter().map(|i| i.value[0]).collect();
        assert_eq!(vec![3, 4, 5], fills);
        assert!(compartment.used() <= 222);
    }

    #[test]
    fn batch_is_never_evicted() {
        let mut compartment = Compartment::new(2 * 74);
        compartment.stage(item(1, 0));
        compartment.stage(item(2, 0));
        compartment.stage(item(3, 0));
        let committed = compartment.commit();
        assert_eq!(2, committed.len());
        assert_eq!(148, compartment.used());
        let fills: Vec<u8> = compartment.iter().map(|i| i.value[0]).collect();
        assert_eq!(vec![1, 2], fills);
    }

    #[test]
    fn oversized_item_skipped() {
        let mut compartment = Compartment::new(70);
        compartment.stage(item(1, 0));
        assert!(compartment.commit().is_empty());
        assert!(compartment.is_empty());
    }

    #[test]
    fn recommit_refreshes_item() {
        let mut compartment = Compartment::new(1024);
        compartment.stage(item(1, 0));
        compartment.stage(item(2, 0));
        compartment.commit();
        compartment.stage(item(1, 7));
        compartment.commit();
        assert_eq!(2, compartment.len());
        assert_eq!(148, compartment.used());
        let last = compartment.iter().last().unwrap();
        assert_eq!((1, 7), (last.value[0], last.retention_priority));
    }

    #[test]
    fn ambiguous_prefix() {
        let mut first = [1u8; 20];
        first[19] = 0xAA;
        let mut second = [1u8; 20];
        second[19] = 0xBB;
        let mut compartment = Compartment::new(1024);
        compartment.stage(with_id(first));
        compartment.stage(with_id(second));
        compartment.commit();

        assert_eq!(Err(StateError::Ambiguous), compartment.lookup(&[1; 6]).map(|i| i.id));
        assert_eq!(Ok(first), compartment.lookup(&first).map(|i| i.id));
        assert_eq!(Err(StateError::Ambiguous), compartment.free(&[1; 12]).map(|i| i.id));
        assert_eq!(2, compartment.len());
        assert_eq!(Err(StateError::InvalidIdLength(5)), compartment.lookup(&[1; 5]).map(|i| i.id));
    }

    #[test]
    fn prefix_shorter_than_minimum_access_length() {
        let mut compartment = Compartment::new(1024);
        let mut stored = item(1, 0);
        stored.minimum_access_length = 9;
        let id = stored.id;
        compartment.stage(stored);
        compartment.commit();
        assert_eq!(Err(StateError::NotFound), compartment.lookup(&id[..6]).map(|i| i.id));
        assert_eq!(Ok(id), compartment.lookup(&id[..9]).map(|i| i.id));
    }

    #[test]
    fn free_removes_committed_and_staged() {
        let mut compartment = Compartment::new(1024);
        let kept = item(1, 0);
        compartment.stage(kept.clone());
        compartment.commit();
        assert_eq!(Ok(kept.clone()), compartment.free(&kept.id[..6]));
        assert_eq!(0, compartment.used());
        assert_eq!(Err(StateError::NotFound), compartment.free(&kept.id[..6]));

        compartment.stage(kept.clone());
        assert!(compartment.free(&kept.id).is_ok());
        assert!(compartment.commit().is_empty());
    }

    #[test]
    fn store_lookup_sees_globals() {
        let store = StateStore::new(2048);
        let dictionary = StateItem::new(b"INVITE sip:".to_vec(), 128, 128, 6, 65535);
        store.add_global_state(dictionary.clone());
        store.add_global_state(dictionary.clone());
        assert_eq!(1, store.global_states().len());

        let local = item(9, 0);
        let id = CompartmentId::from("peer-1");
        {
            let compartment = store.compartment(&id);
            let mut compartment = compartment.lock();
            compartment.stage(local.clone());
            compartment.commit();
        }

        assert_eq!(Ok(dictionary.clone()), store.lookup(None, &dictionary.id[..6]));
        assert_eq!(Ok(dictionary.clone()), store.lookup(Some(&id), &dictionary.id[..6]));
        assert_eq!(Ok(local.clone()), store.lookup(Some(&id), &local.id[..6]));
        assert_eq!(Err(StateError::NotFound), store.lookup(None, &local.id[..6]));
        assert_eq!(
            Err(StateError::NotFound),
            store.lookup(Some(&CompartmentId::from("peer-2")), &local.id[..6])
        );

        assert!(store.close_compartment(&id));
        assert_eq!(Err(StateError::NotFound), store.lookup(Some(&id), &local.id[..6]));
    }

    #[test]
    fn compartment_copy_of_global_is_not_ambiguous() {
        let store = StateStore::new(2048);
        let dictionary = StateItem::new(b"INVITE sip:".to_vec(), 128, 128, 6, 65535);
        store.add_global_state(dictionary.clone());

        let id = CompartmentId::from("peer-1");
        let copy = StateItem::new(b"INVITE sip:".to_vec(), 128, 128, 6, 0);
        assert_eq!(dictionary.id, copy.id);
        {
            let compartment = store.compartment(&id);
            let mut compartment = compartment.lock();
            compartment.stage(copy.clone());
            assert_eq!(vec![copy.clone()], compartment.commit());
        }

        assert_eq!(Ok(copy), store.lookup(Some(&id), &dictionary.id[..6]));
        assert_eq!(Ok(dictionary.clone()), store.lookup(None, &dictionary.id[..6]));
    }
}
