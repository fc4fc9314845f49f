//! The consistent-hash ring.
//!
//! All state lives behind a single mutex so lookups always see an
//! atomic view of the angle set. Externally visible snapshots are deep
//! copies; nothing outside this module can mutate ring state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::debug;

use cachemesh_core::{HashFunctionId, ServerId};

use crate::hash::ring_position;

/// Attempts to draw a fresh position for one angle before giving up.
const MAX_DRAW_ATTEMPTS: u32 = 64;

/// Ring state errors. Pure in-memory failures, surfaced synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// No angles exist; nothing can own a key.
    #[error("hash ring has no angles")]
    Empty,

    /// A fresh position could not be drawn within the attempt budget.
    #[error("hash ring is saturated, could not place a new angle")]
    Saturated,
}

struct RingState {
    ring_size: u32,
    hash_fn: HashFunctionId,
    rng: StdRng,
    /// Position -> owning server, ordered by position.
    angles: BTreeMap<u32, ServerId>,
    /// Per-server positions, kept sorted ascending. Derivable from
    /// `angles`; maintained together under the same lock.
    angles_by_server: HashMap<ServerId, Vec<u32>>,
    /// Timestamp -> deep copy of `angles_by_server`. Append-only,
    /// strictly increasing keys.
    angle_history: BTreeMap<u64, HashMap<ServerId, Vec<u32>>>,
}

/// Weighted consistent-hash ring mapping resource names to server ids.
pub struct HashRing {
    inner: Mutex<RingState>,
}

impl HashRing {
    /// Create an empty ring.
    ///
    /// `ring_size` must be a power of two (validated at config load);
    /// `seed` makes every angle draw reproducible.
    pub fn new(ring_size: u32, hash_fn: HashFunctionId, seed: u64) -> Self {
        debug_assert!(ring_size.is_power_of_two());
        Self {
            inner: Mutex::new(RingState {
                ring_size,
                hash_fn,
                rng: StdRng::seed_from_u64(seed),
                angles: BTreeMap::new(),
                angles_by_server: HashMap::new(),
                angle_history: BTreeMap::new(),
            }),
        }
    }

    /// Resolve the server owning `resource_name`.
    ///
    /// The owner is the angle with the smallest position >= the name's
    /// ring position, wrapping to the smallest position overall.
    pub fn find_server_id(&self, resource_name: &str) -> Result<ServerId, RingError> {
        let state = self.inner.lock().expect("ring lock");
        let pos = ring_position(resource_name, state.hash_fn, state.ring_size);
        state
            .angles
            .range(pos..)
            .next()
            .or_else(|| state.angles.iter().next())
            .map(|(_, id)| *id)
            .ok_or(RingError::Empty)
    }

    /// Register a server with no angles yet. Idempotent.
    pub fn add_server(&self, id: ServerId) {
        let mut state = self.inner.lock().expect("ring lock");
        state.angles_by_server.entry(id).or_default();
    }

    /// Place `n` new angles for `id` at freshly drawn positions.
    ///
    /// A draw colliding with a live position is redrawn, up to
    /// [`MAX_DRAW_ATTEMPTS`] times per angle; exhausting the budget
    /// fails with [`RingError::Saturated`] (angles placed so far stay).
    pub fn add_angle(&self, id: ServerId, n: u32) -> Result<(), RingError> {
        let mut state = self.inner.lock().expect("ring lock");
        for _ in 0..n {
            let pos = Self::draw_position(&mut state)?;
            state.angles.insert(pos, id);
            let positions = state.angles_by_server.entry(id).or_default();
            let idx = positions.partition_point(|&p| p < pos);
            positions.insert(idx, pos);
        }
        Ok(())
    }

    fn draw_position(state: &mut RingState) -> Result<u32, RingError> {
        let ring_size = state.ring_size;
        for _ in 0..MAX_DRAW_ATTEMPTS {
            let candidate = state.rng.gen_range(0..ring_size);
            if !state.angles.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(RingError::Saturated)
    }

    /// Remove up to `n` angles for `id`, highest positions first.
    ///
    /// The order is part of the contract: given identical state, the
    /// same call removes the same angles. Returns the removed count.
    pub fn remove_angle(&self, id: ServerId, n: u32) -> usize {
        let mut state = self.inner.lock().expect("ring lock");
        let mut removed = Vec::new();
        if let Some(positions) = state.angles_by_server.get_mut(&id) {
            for _ in 0..n {
                match positions.pop() {
                    Some(pos) => removed.push(pos),
                    None => break,
                }
            }
        }
        for pos in &removed {
            state.angles.remove(pos);
        }
        removed.len()
    }

    /// Evict `id` entirely: drop all its angles and its registration.
    ///
    /// Returns the number of angles removed.
    pub fn remove_server(&self, id: ServerId) -> usize {
        let mut state = self.inner.lock().expect("ring lock");
        let positions = state.angles_by_server.remove(&id).unwrap_or_default();
        for pos in &positions {
            state.angles.remove(pos);
        }
        positions.len()
    }

    /// Append a deep copy of the per-server angle table to the history.
    ///
    /// Timestamps must be strictly increasing; a stale timestamp is
    /// dropped so same-second ticks cannot rewrite history.
    pub fn record_snapshot(&self, timestamp: u64) {
        let mut state = self.inner.lock().expect("ring lock");
        if let Some((&last, _)) = state.angle_history.iter().next_back() {
            if timestamp <= last {
                debug!(timestamp, last, "skipping non-increasing ring snapshot");
                return;
            }
        }
        let snapshot = state.angles_by_server.clone();
        state.angle_history.insert(timestamp, snapshot);
    }

    /// Deep copy of the snapshot history.
    pub fn history(&self) -> BTreeMap<u64, HashMap<ServerId, Vec<u32>>> {
        self.inner.lock().expect("ring lock").angle_history.clone()
    }

    /// Total number of angles on the ring.
    pub fn angle_count(&self) -> usize {
        self.inner.lock().expect("ring lock").angles.len()
    }

    /// Number of angles currently owned by `id` (0 if unregistered).
    pub fn server_angle_count(&self, id: ServerId) -> usize {
        self.inner
            .lock()
            .expect("ring lock")
            .angles_by_server
            .get(&id)
            .map_or(0, Vec::len)
    }

    /// Number of servers that own at least one angle.
    pub fn servers_with_angles(&self) -> usize {
        self.inner
            .lock()
            .expect("ring lock")
            .angles_by_server
            .values()
            .filter(|positions| !positions.is_empty())
            .count()
    }

    /// Ids of all registered servers, with or without angles.
    pub fn server_ids(&self) -> Vec<ServerId> {
        self.inner
            .lock()
            .expect("ring lock")
            .angles_by_server
            .keys()
            .copied()
            .collect()
    }

    /// All live angle positions, ascending. Snapshot copy.
    pub fn angle_positions(&self) -> Vec<u32> {
        self.inner
            .lock()
            .expect("ring lock")
            .angles
            .keys()
            .copied()
            .collect()
    }

    /// Test hook: place an angle at an exact position.
    #[cfg(test)]
    fn insert_angle_at(&self, pos: u32, id: ServerId) {
        let mut state = self.inner.lock().expect("ring lock");
        assert!(!state.angles.contains_key(&pos), "position {pos} occupied");
        state.angles.insert(pos, id);
        let positions = state.angles_by_server.entry(id).or_default();
        let idx = positions.partition_point(|&p| p < pos);
        positions.insert(idx, pos);
    }

    /// Test hook: resolve the owner of a raw ring position.
    #[cfg(test)]
    fn find_owner_at(&self, pos: u32) -> Option<ServerId> {
        let state = self.inner.lock().expect("ring lock");
        state
            .angles
            .range(pos..)
            .next()
            .or_else(|| state.angles.iter().next())
            .map(|(_, id)| *id)
    }
}
