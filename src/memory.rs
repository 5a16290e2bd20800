//! Tiered memory allocation with a hard ceiling.
//!
//! Embedded targets have a small fast pool and a larger slow one. The
//! allocator walks an ordered list of [`MemoryTier`]s and hands out the
//! first [`Block`] any tier can provide. A budgeted tier gets its bytes
//! back when the block drops, so every exit path releases memory.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AllocError;

/// A source of memory.
pub trait MemoryTier: Send + Sync {
    fn name(&self) -> &str;

    /// Return a zeroed block of exactly `len` bytes, or `None` if this tier
    /// cannot satisfy the request.
    fn try_allocate(&self, len: usize) -> Option<Block>;
}

fn zeroed(len: usize) -> Option<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len).ok()?;
    data.resize(len, 0);
    Some(data)
}

/// Fixed-size, zero-initialized allocation.
pub struct Block {
    data: Vec<u8>,
    _lease: Option<Lease>,
}

impl Block {
    fn new(data: Vec<u8>, lease: Option<Lease>) -> Self {
        Self { data, _lease: lease }
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("len", &self.data.len()).finish()
    }
}

/// Returns reserved bytes to a [`BudgetTier`] on drop.
struct Lease {
    in_use: Arc<AtomicUsize>,
    len: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.in_use.fetch_sub(self.len, Ordering::AcqRel);
    }
}

/// A limited pool: at most `budget` bytes outstanding at once.
pub struct BudgetTier {
    name: String,
    budget: usize,
    in_use: Arc<AtomicUsize>,
}

impl BudgetTier {
    pub fn new(name: impl Into<String>, budget: usize) -> Self {
        Self {
            name: name.into(),
            budget,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

impl MemoryTier for BudgetTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_allocate(&self, len: usize) -> Option<Block> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(len).filter(|n| *n <= self.budget)?;
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let lease = Lease {
            in_use: Arc::clone(&self.in_use),
            len,
        };
        // On failure the lease drops here and the reservation is undone.
        let data = zeroed(len)?;
        Some(Block::new(data, Some(lease)))
    }
}

/// The general heap. Fails only when the system allocator does.
pub struct HeapTier {
    name: String,
}

impl HeapTier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl MemoryTier for HeapTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_allocate(&self, len: usize) -> Option<Block> {
        zeroed(len).map(|data| Block::new(data, None))
    }
}

/// Declarative tier description used in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    /// `None` means the unbounded heap.
    #[serde(default)]
    pub budget_bytes: Option<usize>,
}

/// Ordered list of tiers tried in turn.
#[derive(Clone)]
pub struct TieredAllocator {
    tiers: Vec<Arc<dyn MemoryTier>>,
    ceiling: usize,
}

impl TieredAllocator {
    pub fn new(tiers: Vec<Arc<dyn MemoryTier>>, ceiling: usize) -> Self {
        Self { tiers, ceiling }
    }

    /// A single unbounded heap tier.
    pub fn heap(ceiling: usize) -> Self {
        let heap: Arc<dyn MemoryTier> = Arc::new(HeapTier::new("heap"));
        Self::new(vec![heap], ceiling)
    }

    pub fn from_config(tiers: &[TierConfig], ceiling: usize) -> Self {
        let tiers = tiers
            .iter()
            .map(|tier| -> Arc<dyn MemoryTier> {
                match tier.budget_bytes {
                    Some(budget) => Arc::new(BudgetTier::new(tier.name.clone(), budget)),
                    None => Arc::new(HeapTier::new(tier.name.clone())),
                }
            })
            .collect();
        Self::new(tiers, ceiling)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Allocate `len` bytes from the first tier that can provide them.
    pub fn allocate(&self, len: usize, purpose: &'static str) -> Result<Block, AllocError> {
        if len > self.ceiling {
            return Err(AllocError::OverCeiling {
                purpose,
                requested: len,
                ceiling: self.ceiling,
            });
        }

        for (rank, tier) in self.tiers.iter().enumerate() {
            if let Some(block) = tier.try_allocate(len) {
                if rank > 0 {
                    debug!(purpose, len, tier = tier.name(), "allocated from fallback tier");
                }
                return Ok(block);
            }
            debug!(purpose, len, tier = tier.name(), "tier refused allocation");
        }

        warn!(purpose, len, "all memory tiers exhausted");
        Err(AllocError::Exhausted {
            purpose,
            requested: len,
        })
    }
}

impl fmt::Debug for TieredAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.tiers.iter().map(|t| t.name()).collect();
        f.debug_struct("TieredAllocator")
            .field("tiers", &names)
            .field("ceiling", &self.ceiling)
            .finish()
    }
}
