//! Sharded weak registry of computed nodes.
//!
//! The registry maps an [`InputKey`] to the node currently cached for it. Entries
//! hold the node weakly, so a node nobody reads any more is freed and its entry
//! swept. Two things keep a node alive from the registry side: the method's
//! minimum cache duration, and the grace period after a node is invalidated,
//! during which [`ComputedRegistry::get_latest`] can still find it.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use papaya::{Compute, HashMap, Operation};

use crate::invalidation::InvalidationReason;
use crate::key::InputKey;
use crate::node::NodeCore;
use crate::tracer::Tracer;

#[derive(Clone)]
struct Hold {
    node: Arc<NodeCore>,
    until: Instant,
}

#[derive(Clone)]
struct Entry {
    node: Weak<NodeCore>,
    hold: Option<Hold>,
    unregistered: bool,
}

impl Entry {
    fn points_at(&self, node: &Arc<NodeCore>) -> bool {
        std::ptr::eq(self.node.as_ptr(), Arc::as_ptr(node))
    }

    /// Whether the sweeper should drop this entry at `now`.
    fn is_stale(&self, now: Instant) -> bool {
        match &self.hold {
            Some(hold) if hold.until > now => false,
            _ => self.unregistered || self.node.strong_count() == 0,
        }
    }

    fn hold_expired(&self, now: Instant) -> bool {
        self.hold.as_ref().is_some_and(|hold| hold.until <= now)
    }
}

struct Shard {
    entries: HashMap<InputKey, Entry, ahash::RandomState>,
    ops: AtomicUsize,
}

impl Shard {
    fn new() -> Self {
        Self {
            entries: HashMap::with_hasher(ahash::RandomState::new()),
            ops: AtomicUsize::new(0),
        }
    }
}

struct RegistryInner {
    shards: Box<[Shard]>,
    mask: usize,
    hasher: ahash::RandomState,
    grace_period: Duration,
    sweep_every_ops: usize,
    tracer: Arc<dyn Tracer>,
}

/// Concurrent map from input key to the computed node cached for it.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct ComputedRegistry {
    inner: Arc<RegistryInner>,
}

/// Non-owning handle to a registry, held by nodes.
#[derive(Clone)]
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<ComputedRegistry> {
        self.0.upgrade().map(|inner| ComputedRegistry { inner })
    }
}

impl ComputedRegistry {
    /// Create a registry. `shard_count` is rounded up to a power of two.
    pub fn new(
        shard_count: usize,
        grace_period: Duration,
        sweep_every_ops: usize,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        let shard_count = shard_count.max(1).next_power_of_two();
        let shards = (0..shard_count).map(|_| Shard::new()).collect();
        Self {
            inner: Arc::new(RegistryInner {
                shards,
                mask: shard_count - 1,
                hasher: ahash::RandomState::new(),
                grace_period,
                sweep_every_ops: sweep_every_ops.max(1),
                tracer,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }

    pub(crate) fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.inner.tracer
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// How long an invalidated node stays discoverable through [`Self::get_latest`].
    pub fn grace_period(&self) -> Duration {
        self.inner.grace_period
    }

    fn shard(&self, key: &InputKey) -> &Shard {
        let index = self.inner.hasher.hash_one(key) as usize & self.inner.mask;
        &self.inner.shards[index]
    }

    /// Return the registered node for `key` if it is `Consistent`.
    pub fn get_or_none(&self, key: &InputKey) -> Option<Arc<NodeCore>> {
        let found = self.peek(key);
        self.inner.tracer.on_access(key, found.is_some());
        found
    }

    /// Like [`Self::get_or_none`] without reporting the access to the tracer.
    pub(crate) fn peek(&self, key: &InputKey) -> Option<Arc<NodeCore>> {
        let entries = self.shard(key).entries.pin();
        let entry = entries.get(key)?;
        if entry.unregistered {
            return None;
        }
        entry.node.upgrade().filter(|node| node.is_consistent())
    }

    /// Return the most recent node for `key`, whatever its state.
    ///
    /// This includes a node that was invalidated and is still within its grace period.
    pub fn get_latest(&self, key: &InputKey) -> Option<Arc<NodeCore>> {
        let entries = self.shard(key).entries.pin();
        entries.get(key).and_then(|entry| entry.node.upgrade())
    }

    /// Publish `node` as the current node for its key.
    ///
    /// An older node that is still `Consistent` is invalidated, so each key has at
    /// most one `Consistent` node. With `min_cache` set the registry keeps the node
    /// alive for at least that long.
    pub fn register(&self, node: &Arc<NodeCore>, min_cache: Option<Duration>) {
        let shard = self.shard(node.key());
        let hold = min_cache.map(|duration| Hold {
            node: node.clone(),
            until: Instant::now() + duration,
        });
        let entries = shard.entries.pin();
        let previous = entries.insert(
            node.key().clone(),
            Entry {
                node: Arc::downgrade(node),
                hold,
                unregistered: false,
            },
        );
        let replaced = previous
            .filter(|previous| !previous.points_at(node))
            .and_then(|previous| previous.node.upgrade());
        drop(entries);

        self.inner.tracer.on_register(node.key(), node.version_tag());
        tracing::trace!(key = ?node.key(), tag = %node.version_tag(), "registered");

        if let Some(replaced) = replaced {
            replaced.invalidate(InvalidationReason::Replaced);
        }
        // Invalidated between completion and registration: hide it again.
        if node.is_invalidated() {
            self.pseudo_unregister(node);
        }

        let ops = shard.ops.fetch_add(1, Ordering::Relaxed) + 1;
        if ops % self.inner.sweep_every_ops == 0 {
            self.sweep_shard(shard, Instant::now());
        }
    }

    /// Remove the entry for `node`'s key if it still points at `node`.
    pub fn unregister(&self, node: &Arc<NodeCore>) -> bool {
        let entries = self.shard(node.key()).entries.pin();
        let result = entries.compute(node.key().clone(), |entry| match entry {
            Some((_, entry)) if entry.points_at(node) => Operation::Remove,
            _ => Operation::Abort(()),
        });
        let removed = matches!(result, Compute::Removed(_, _));
        drop(entries);
        if removed {
            self.inner.tracer.on_unregister(node.key(), node.version_tag());
        }
        removed
    }

    /// Hide `node` from [`Self::get_or_none`] but keep it for the grace period.
    ///
    /// With a zero grace period this is [`Self::unregister`].
    pub fn pseudo_unregister(&self, node: &Arc<NodeCore>) -> bool {
        let grace = self.inner.grace_period;
        if grace.is_zero() {
            return self.unregister(node);
        }
        let until = Instant::now() + grace;
        let entries = self.shard(node.key()).entries.pin();
        let result = entries.compute(node.key().clone(), |entry| match entry {
            Some((_, entry)) if entry.points_at(node) && !entry.unregistered => {
                Operation::Insert(Entry {
                    node: Arc::downgrade(node),
                    hold: Some(Hold {
                        node: node.clone(),
                        until,
                    }),
                    unregistered: true,
                })
            }
            _ => Operation::Abort(()),
        });
        let hidden = matches!(result, Compute::Updated { .. });
        drop(entries);
        if hidden {
            self.inner.tracer.on_unregister(node.key(), node.version_tag());
        }
        hidden
    }

    /// Drop dead entries, entries past their grace period and expired holds.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        self.inner
            .shards
            .iter()
            .map(|shard| self.sweep_shard(shard, now))
            .sum()
    }

    fn sweep_shard(&self, shard: &Shard, now: Instant) -> usize {
        let entries = shard.entries.pin();
        let candidates: Vec<InputKey> = entries
            .iter()
            .filter(|(_, entry)| entry.is_stale(now) || entry.hold_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            let result = entries.compute(key, |entry| match entry {
                Some((_, entry)) if entry.is_stale(now) => Operation::Remove,
                Some((_, entry)) if entry.hold_expired(now) => Operation::Insert(Entry {
                    node: entry.node.clone(),
                    hold: None,
                    unregistered: entry.unregistered,
                }),
                _ => Operation::Abort(()),
            });
            if matches!(result, Compute::Removed(_, _)) {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::trace!(removed, "swept registry shard");
        }
        removed
    }

    /// Number of entries, including dead and pseudo-unregistered ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.entries.pin().len())
            .sum()
    }

    /// Returns `true` if no entries are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalidate every registered node.
    pub fn invalidate_all(&self, reason: InvalidationReason) -> usize {
        let nodes: Vec<Arc<NodeCore>> = self
            .inner
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .entries
                    .pin()
                    .iter()
                    .filter(|(_, entry)| !entry.unregistered)
                    .filter_map(|(_, entry)| entry.node.upgrade())
                    .collect::<Vec<_>>()
            })
            .collect();
        nodes
            .into_iter()
            .filter(|node| node.invalidate(reason))
            .count()
    }

    /// Sweep every `interval` on the current tokio runtime until the registry is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.downgrade();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep();
            }
        })
    }
}
