//! Per-slot Paxos -- lazily extended slot store.

use std::sync::Arc;

use super::{Command, Slot};
use crate::utils::Address;

use tokio::sync::{Mutex, RwLock};

/// Ordered, append-only array of slots. The outer lock only guards growth
/// of the array; each slot carries its own lock so that unrelated slots can
/// be worked on concurrently.
pub(crate) struct SlotStore {
    /// Owner address, used for the null ballot of fresh slots.
    me: Address,

    slots: RwLock<Vec<Arc<Mutex<Slot>>>>,
}

impl SlotStore {
    pub(crate) fn new(me: Address) -> Self {
        SlotStore {
            me,
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Ensures slots exist up to and including index `n`. Never overwrites
    /// existing slots.
    pub(crate) async fn get_slots(&self, n: usize) {
        if self.slots.read().await.len() > n {
            return;
        }
        let mut slots = self.slots.write().await;
        self.extend_locked(&mut slots, n);
    }

    fn extend_locked(&self, slots: &mut Vec<Arc<Mutex<Slot>>>, n: usize) {
        while slots.len() <= n {
            let index = slots.len();
            slots.push(Arc::new(Mutex::new(Slot::null(index, &self.me))));
        }
    }

    /// Returns the slot at index `idx`, creating it (and any missing slots
    /// below it) if needed.
    pub(crate) async fn slot(&self, idx: usize) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.read().await.get(idx) {
            return slot.clone();
        }
        let mut slots = self.slots.write().await;
        self.extend_locked(&mut slots, idx);
        slots[idx].clone()
    }

    /// Returns the slot at index `idx` only if it already exists.
    pub(crate) async fn existing(&self, idx: usize) -> Option<Arc<Mutex<Slot>>> {
        self.slots.read().await.get(idx).cloned()
    }

    /// Number of slots in the store.
    pub(crate) async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Index of the first undecided slot. Appends a fresh slot if every
    /// existing one is decided.
    pub(crate) async fn first_undecided(&self) -> usize {
        {
            let slots = self.slots.read().await;
            for slot in slots.iter() {
                let slot = slot.lock().await;
                if !slot.decided {
                    return slot.index;
                }
            }
        }
        let mut slots = self.slots.write().await;
        // someone may have appended in between
        for slot in slots.iter() {
            let slot = slot.lock().await;
            if !slot.decided {
                return slot.index;
            }
        }
        let n = slots.len();
        self.extend_locked(&mut slots, n);
        n
    }

    /// Round of the ballot currently promised at slot `idx`.
    pub(crate) async fn ballot_round(&self, idx: usize) -> u64 {
        self.slot(idx).await.lock().await.ballot.round
    }

    /// The decided command at slot `idx`, if the slot is decided.
    pub(crate) async fn decided_command(&self, idx: usize) -> Option<Command> {
        let slot = self.slot(idx).await;
        let slot = slot.lock().await;
        if slot.decided {
            slot.command.clone()
        } else {
            None
        }
    }

    /// Copies of all slots, in index order.
    pub(crate) async fn snapshot(&self) -> Vec<Slot> {
        let slots = self.slots.read().await;
        let mut copies = Vec::with_capacity(slots.len());
        for slot in slots.iter() {
            copies.push(slot.lock().await.clone());
        }
        copies
    }
}
