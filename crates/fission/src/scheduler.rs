//! The task scheduler.
//!
//! One FIFO-by-priority queue per pool, each with its own lock and
//! condition variable; a global table of group active-counts behind a
//! single lock. Workers scan their pool's queue for the first runnable
//! task, claiming the task's group slot before releasing the queue
//! lock. Lock order is pool-queue, then group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use crate::descriptor::{Pool, Priority};
use crate::ids::{GroupId, PoolId};
use crate::task::ReactionTask;

/// A pool's queue, lock and wakeup, shared with its workers.
struct PoolQueue {
    id: PoolId,
    /// Worker count. Zero marks a placeholder that the scheduler sizes
    /// when it starts.
    threads: AtomicUsize,
    /// Tasks ordered by `(priority desc, task id asc)`.
    queue: Mutex<Vec<ReactionTask>>,
    /// Signalled on submit, on group release and at shutdown.
    available: Condvar,
    /// Whether this pool's workers have been spawned.
    spawned: AtomicBool,
}

pub struct TaskScheduler {
    /// Accepting new tasks. Cleared by [`TaskScheduler::shutdown`];
    /// submissions after that are dropped.
    running: AtomicBool,
    /// Set once [`TaskScheduler::prepare`] ran. Workers only spawn, and
    /// direct emissions only promote, from this point on.
    started: AtomicBool,
    /// Whether `Realtime` tasks may run in a saturated group.
    realtime_bypass: bool,
    pools: Mutex<HashMap<PoolId, Arc<PoolQueue>>>,
    /// Which pool each worker thread belongs to.
    pool_map: Mutex<HashMap<ThreadId, PoolId>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Active task count per group.
    groups: Mutex<HashMap<GroupId, usize>>,
}

impl TaskScheduler {
    /// Build a scheduler whose main-thread pool is serviced by the
    /// calling thread.
    pub fn new(realtime_bypass: bool) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            running: AtomicBool::new(true),
            started: AtomicBool::new(false),
            realtime_bypass,
            pools: Mutex::new(HashMap::new()),
            pool_map: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
            groups: Mutex::new(HashMap::new()),
        });
        scheduler.ensure_pool(Pool::MAIN);
        scheduler
            .pool_map
            .lock()
            .unwrap()
            .insert(thread::current().id(), PoolId::MAIN);
        scheduler
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Size the default pool and enter the started state. Direct
    /// emissions promote from here on; workers are not up yet, so
    /// nothing queued can run before [`TaskScheduler::launch`].
    pub fn prepare(self: &Arc<Self>, default_threads: usize) {
        self.ensure_pool(Pool {
            id: PoolId::DEFAULT,
            threads: default_threads.max(1),
        });
        self.started.store(true, Ordering::Release);
    }

    /// Spawn workers for every known pool.
    pub fn launch(self: &Arc<Self>) {
        let pools: Vec<Arc<PoolQueue>> = self.pools.lock().unwrap().values().cloned().collect();
        for pool in pools {
            self.spawn_workers(&pool);
        }
    }

    /// Service the main-thread pool on the calling thread. Returns once
    /// the scheduler was shut down and the pool's queue has drained.
    pub fn run_main(self: &Arc<Self>) {
        self.pool_map
            .lock()
            .unwrap()
            .insert(thread::current().id(), PoolId::MAIN);

        let pool = self.pool(PoolId::MAIN).expect("main pool always exists");
        self.worker(&pool);
    }

    /// Join all worker threads, including pools created while draining.
    pub fn join(&self) {
        loop {
            let handles = std::mem::take(&mut *self.threads.lock().unwrap());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                handle.join().ok();
            }
        }
    }

    /// Run the scheduler to completion on the calling thread.
    pub fn start(self: &Arc<Self>, default_threads: usize) {
        self.prepare(default_threads);
        self.launch();
        self.run_main();
        self.join();
    }

    /// Stop accepting tasks and wake every worker so queues drain and
    /// workers exit. Idempotent.
    pub fn shutdown(&self) {
        self.started.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);

        let pools: Vec<Arc<PoolQueue>> = self.pools.lock().unwrap().values().cloned().collect();
        for pool in pools {
            // Lock the queue so no worker misses the wakeup between its
            // running check and its wait.
            let _queue = pool.queue.lock().unwrap();
            pool.available.notify_all();
        }
        log::debug!(target: "scheduler", "Scheduler shutting down");
    }

    /// Submit a task for execution.
    ///
    /// Returns the task back when the scheduler is no longer accepting
    /// work; the caller decides whether to drop it or run it inline.
    pub fn submit(self: &Arc<Self>, task: ReactionTask) -> Result<(), ReactionTask> {
        if !self.is_running() {
            return Err(task);
        }
        let pool = self.ensure_pool(task.pool);
        self.ensure_group(task.group.id);

        // Direct promotion: run on the submitting thread when the task
        // is runnable on the caller's pool or on the default pool.
        if self.is_started() && task.immediate {
            let caller = self
                .pool_map
                .lock()
                .unwrap()
                .get(&thread::current().id())
                .copied()
                .unwrap_or(PoolId::DEFAULT);

            if (task.pool.id == caller || task.pool.id == PoolId::DEFAULT)
                && self.claim_group(&task)
            {
                self.run_claimed(task);
                return Ok(());
            }
        }

        {
            let mut queue = pool.queue.lock().unwrap();
            let at = queue.partition_point(|queued| queued.order() < task.order());
            queue.insert(at, task);
        }
        pool.available.notify_all();
        Ok(())
    }

    /// Active task count of a group.
    pub fn group_active(&self, group: GroupId) -> usize {
        self.groups
            .lock()
            .unwrap()
            .get(&group)
            .copied()
            .unwrap_or(0)
    }

    fn pool(&self, id: PoolId) -> Option<Arc<PoolQueue>> {
        self.pools.lock().unwrap().get(&id).cloned()
    }

    /// Look up or create the pool for a descriptor, spawning its
    /// workers if the scheduler is already started.
    fn ensure_pool(self: &Arc<Self>, descriptor: Pool) -> Arc<PoolQueue> {
        let pool = {
            let mut pools = self.pools.lock().unwrap();
            let pool = pools.entry(descriptor.id).or_insert_with(|| {
                Arc::new(PoolQueue {
                    id: descriptor.id,
                    threads: AtomicUsize::new(descriptor.threads),
                    queue: Mutex::new(Vec::new()),
                    available: Condvar::new(),
                    spawned: AtomicBool::new(false),
                })
            });
            // A placeholder gets its size from the first descriptor
            // that carries one.
            if pool.threads.load(Ordering::Acquire) == 0 && descriptor.threads > 0 {
                pool.threads.store(descriptor.threads, Ordering::Release);
            }
            pool.clone()
        };

        if self.is_started() {
            self.spawn_workers(&pool);
        }
        pool
    }

    fn ensure_group(&self, group: GroupId) {
        self.groups.lock().unwrap().entry(group).or_insert(0);
    }

    /// Spawn the pool's workers, once. The main-thread pool has no
    /// spawned workers; its thread enters via [`TaskScheduler::run_main`].
    fn spawn_workers(self: &Arc<Self>, pool: &Arc<PoolQueue>) {
        if pool.id == PoolId::MAIN {
            return;
        }
        let threads = pool.threads.load(Ordering::Acquire);
        if threads == 0 || pool.spawned.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!(target: "scheduler", "Starting {threads} workers for pool {}", pool.id);

        for i in 0..threads {
            let scheduler = self.clone();
            let pool = pool.clone();
            let handle = thread::Builder::new()
                .name(format!("pool-{}/{i}", pool.id))
                .spawn(move || {
                    scheduler
                        .pool_map
                        .lock()
                        .unwrap()
                        .insert(thread::current().id(), pool.id);
                    scheduler.worker(&pool);
                })
                .expect("failed to spawn worker thread");
            self.threads.lock().unwrap().push(handle);
        }
    }

    /// The worker loop: pick up runnable tasks until shutdown drains
    /// the queue.
    fn worker(&self, pool: &Arc<PoolQueue>) {
        loop {
            os::update_current_thread_priority(os::ELEVATED);

            match self.get_task(pool) {
                Some(task) => self.run_claimed(task),
                None => break,
            }
        }
        log::trace!(target: "scheduler", "Worker for pool {} exiting", pool.id);
    }

    /// Block until a runnable task is available on `pool` and claim it.
    /// Returns `None` once the scheduler stopped and the queue is empty.
    ///
    /// The group slot is claimed under the queue lock, before the task
    /// leaves the queue.
    fn get_task(&self, pool: &Arc<PoolQueue>) -> Option<ReactionTask> {
        let mut queue = pool.queue.lock().unwrap();
        loop {
            let runnable = queue.iter().position(|task| {
                debug_assert_eq!(task.pool.id, pool.id);
                self.claim_group(task)
            });
            if let Some(at) = runnable {
                return Some(queue.remove(at));
            }
            if !self.is_running() && queue.is_empty() {
                return None;
            }
            // Skipped tasks stay in place; they are reconsidered on
            // every wake.
            queue = pool.available.wait(queue).unwrap();
        }
    }

    /// Try to claim a slot in the task's group.
    fn claim_group(&self, task: &ReactionTask) -> bool {
        let mut groups = self.groups.lock().unwrap();
        let active = groups.entry(task.group.id).or_insert(0);
        let bypass = self.realtime_bypass && task.priority == Priority::Realtime;

        if *active < task.group.concurrency || bypass {
            *active += 1;
            true
        } else {
            false
        }
    }

    /// Run a task whose group slot is already claimed, and release the
    /// slot afterwards.
    fn run_claimed(&self, task: ReactionTask) {
        let group = task.group.id;
        let bounded = task.group.concurrency != usize::MAX;
        let realtime = task.priority == Priority::Realtime;

        if realtime {
            os::update_current_thread_priority(os::REALTIME);
        }
        task.run();
        if realtime {
            os::update_current_thread_priority(os::ELEVATED);
        }

        {
            let mut groups = self.groups.lock().unwrap();
            if let Some(active) = groups.get_mut(&group) {
                *active = active.saturating_sub(1);
            }
        }
        // A freed slot in a bounded group can make a skipped task
        // runnable, in this pool or any other.
        if bounded {
            let pools: Vec<Arc<PoolQueue>> =
                self.pools.lock().unwrap().values().cloned().collect();
            for pool in pools {
                pool.available.notify_all();
            }
        }
    }
}

/// Best-effort OS thread priority. Raising priority usually requires
/// privileges; failure is ignored.
mod os {
    #[cfg(unix)]
    pub const ELEVATED: i32 = -2;
    #[cfg(unix)]
    pub const REALTIME: i32 = -10;
    #[cfg(not(unix))]
    pub const ELEVATED: i32 = 0;
    #[cfg(not(unix))]
    pub const REALTIME: i32 = 0;

    #[cfg(unix)]
    pub fn update_current_thread_priority(nice: i32) {
        // SAFETY: plain syscall; `0` addresses the calling thread.
        unsafe {
            libc::setpriority(libc::PRIO_PROCESS as _, 0, nice);
        }
    }

    #[cfg(not(unix))]
    pub fn update_current_thread_priority(_nice: i32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::descriptor::Group;
    use crate::registry::BindOptions;
    use crate::task::test::task;

    #[test]
    fn test_submit_after_shutdown_is_refused() {
        let scheduler = TaskScheduler::new(false);
        scheduler.shutdown();

        let t = task(BindOptions::new(), false, || {});
        assert!(scheduler.submit(t).is_err());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let scheduler = TaskScheduler::new(false);
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_queue_order() {
        let scheduler = TaskScheduler::new(false);

        for priority in [Priority::Low, Priority::High, Priority::Normal, Priority::High] {
            let t = task(BindOptions::new().priority(priority), false, || {});
            scheduler.submit(t).unwrap();
        }

        let pool = scheduler.pool(PoolId::DEFAULT).unwrap();
        let queue = pool.queue.lock().unwrap();
        let priorities: Vec<Priority> = queue.iter().map(|t| t.priority).collect();
        assert_eq!(
            priorities,
            vec![Priority::High, Priority::High, Priority::Normal, Priority::Low]
        );
        // Equal priorities keep submission order.
        assert!(queue[0].id < queue[1].id);
    }

    #[test]
    fn test_group_concurrency_claims() {
        let scheduler = TaskScheduler::new(false);
        let group = Group::new(2);

        let a = task(BindOptions::new().group(group), false, || {});
        let b = task(BindOptions::new().group(group), false, || {});
        let c = task(BindOptions::new().group(group), false, || {});

        assert!(scheduler.claim_group(&a));
        assert!(scheduler.claim_group(&b));
        assert!(!scheduler.claim_group(&c), "group is saturated");
        assert_eq!(scheduler.group_active(group.id), 2);
    }

    #[test]
    fn test_realtime_bypass_flag() {
        let group = Group::new(1);
        let normal = task(BindOptions::new().group(group), false, || {});
        let realtime = task(
            BindOptions::new().group(group).priority(Priority::Realtime),
            false,
            || {},
        );

        // Strict mode: realtime respects the limit.
        let strict = TaskScheduler::new(false);
        assert!(strict.claim_group(&normal));
        assert!(!strict.claim_group(&realtime));

        // Bypass mode: realtime is admitted and still counted.
        let bypass = TaskScheduler::new(true);
        assert!(bypass.claim_group(&normal));
        assert!(bypass.claim_group(&realtime));
        assert_eq!(bypass.group_active(group.id), 2);
    }

    #[test]
    fn test_workers_drain_queue_on_shutdown() {
        let scheduler = TaskScheduler::new(false);
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let ran = ran.clone();
            let t = task(BindOptions::new(), false, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
            scheduler.submit(t).unwrap();
        }

        let main = {
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.start(2))
        };
        // Accepted tasks run to completion even though shutdown races
        // the queue.
        thread::sleep(Duration::from_millis(50));
        scheduler.shutdown();
        main.join().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 16);
    }
}
