//! Scheduling descriptors.

use crate::bus;
use crate::ids::{GroupId, PoolId};

/// Describes the thread pool a reaction's tasks execute on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool {
    pub id: PoolId,
    /// Number of worker threads. For [`Pool::DEFAULT`] this is a
    /// placeholder; the scheduler fixes the count at start.
    pub threads: usize,
}

impl Pool {
    /// The main-thread pool: its single worker is the thread the
    /// scheduler was started on.
    pub const MAIN: Self = Self {
        id: PoolId::MAIN,
        threads: 1,
    };

    /// The default pool, sized by the plant configuration.
    pub const DEFAULT: Self = Self {
        id: PoolId::DEFAULT,
        threads: 0,
    };

    /// A new pool with its own set of worker threads.
    pub fn new(threads: usize) -> Self {
        Self {
            id: PoolId::next(),
            threads,
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// An abstract mutex: at most `concurrency` tasks of a group execute in
/// parallel, across all pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub concurrency: usize,
}

impl Group {
    /// A new group bounding parallelism to `concurrency`.
    pub fn new(concurrency: usize) -> Self {
        Self {
            id: GroupId::next(),
            concurrency,
        }
    }

    /// The group shared by every binding synchronized on `T`. Tasks in
    /// it run in sequence with each other.
    pub fn sync<T: 'static>() -> Self {
        Self {
            id: GroupId::derived(bus::type_hash::<T>()),
            concurrency: 1,
        }
    }
}

impl Default for Group {
    fn default() -> Self {
        Self {
            id: GroupId::DEFAULT,
            concurrency: usize::MAX,
        }
    }
}

/// Dispatch priority. Within a pool, queued tasks are dispatched
/// highest priority first, oldest first within a priority.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Idle,
    Low,
    #[default]
    Normal,
    High,
    /// Also raises the OS priority of the executing thread for the
    /// duration of the task, and may bypass group concurrency limits
    /// depending on scheduler configuration.
    Realtime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Realtime > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Low > Priority::Idle);
    }

    #[test]
    fn test_sync_groups_are_shared() {
        struct Camera;
        struct Lidar;

        assert_eq!(Group::sync::<Camera>(), Group::sync::<Camera>());
        assert_ne!(Group::sync::<Camera>().id, Group::sync::<Lidar>().id);
        assert_eq!(Group::sync::<Camera>().concurrency, 1);
    }
}
