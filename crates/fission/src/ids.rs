//! Process-wide identifier allocation.
//!
//! All identifiers come from monotonic atomic counters shared by every
//! power plant in the process; constructing a new plant does not reset
//! them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a thread pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(pub u64);

impl PoolId {
    /// The main-thread pool, serviced by the process's originating thread.
    pub const MAIN: Self = Self(0);
    /// The default pool.
    pub const DEFAULT: Self = Self(1);

    /// Allocate a fresh pool id. Ids `0` and `1` are reserved.
    pub fn next() -> Self {
        static SOURCE: AtomicU64 = AtomicU64::new(2);
        Self(SOURCE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MAIN => f.write_str("main"),
            Self::DEFAULT => f.write_str("default"),
            Self(id) => write!(f, "{id}"),
        }
    }
}

/// Identifies a concurrency group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub u64);

impl GroupId {
    /// The default group, effectively unbounded.
    pub const DEFAULT: Self = Self(0);

    /// Allocate a fresh group id. Id `0` is reserved.
    pub fn next() -> Self {
        static SOURCE: AtomicU64 = AtomicU64::new(1);
        Self(SOURCE.fetch_add(1, Ordering::Relaxed))
    }

    /// A group id derived from a type hash. The top bit partitions
    /// derived ids from allocated ones.
    pub(crate) fn derived(hash: u128) -> Self {
        Self((hash as u64 ^ (hash >> 64) as u64) | 1 << 63)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a bound reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReactionId(pub u64);

impl ReactionId {
    pub fn next() -> Self {
        static SOURCE: AtomicU64 = AtomicU64::new(0);
        Self(SOURCE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ReactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one scheduled execution of a reaction. Task ids are the
/// tie-breaker in queue ordering: older tasks win at equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn next() -> Self {
        static SOURCE: AtomicU64 = AtomicU64::new(0);
        Self(SOURCE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert!(a < b);

        let p = PoolId::next();
        assert!(p.0 >= 2, "ids 0 and 1 are reserved");

        let g = GroupId::next();
        assert!(g.0 >= 1, "id 0 is reserved");
    }

    #[test]
    fn test_derived_group_ids_are_partitioned() {
        assert!(GroupId::derived(0x1234).0 > u64::MAX / 2);
    }
}
