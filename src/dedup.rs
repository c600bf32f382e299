use fnv::FnvHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const SHARD_COUNT: usize = 64;

struct Shard {
    seen: HashSet<String>,
    /// Insertion order, oldest first. Evicted when the shard is full.
    order: VecDeque<String>,
}

/// Process-wide "seen recently" set with bounded memory. Best-effort
/// only: the unique constraint in the database is the final guarantee,
/// this exists to keep duplicate CT entries from reaching the resolver.
pub struct Deduplicator {
    shards: Vec<Mutex<Shard>>,
    shard_capacity: usize,
    length: AtomicUsize,
}

impl Deduplicator {
    pub fn new(max_entries: usize) -> Self {
        let shard_capacity = (max_entries / SHARD_COUNT).max(1);
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Mutex::new(Shard {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }));
        }
        Self { shards, shard_capacity, length: AtomicUsize::new(0) }
    }

    fn shard_for(&self, name: &str) -> &Mutex<Shard> {
        let mut hasher = FnvHasher::default();
        hasher.write(name.as_bytes());
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Returns true on first sight of `name` within the current window,
    /// false for anything still remembered.
    pub fn admit(&self, name: &str) -> bool {
        let mut shard = self.shard_for(name).lock().unwrap();
        if shard.seen.contains(name) {
            return false;
        }
        if shard.seen.len() >= self.shard_capacity {
            if let Some(oldest) = shard.order.pop_front() {
                shard.seen.remove(&oldest);
                self.length.fetch_sub(1, Ordering::Relaxed);
            }
        }
        shard.seen.insert(name.to_string());
        shard.order.push_back(name.to_string());
        self.length.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn len(&self) -> usize {
        self.length.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
