//! Worker pool for fan-out of independent per-file tasks.
//!
//! Every batch phase of the run (inspection, package parsing, resolution,
//! archive scanning) is expressed as a set of [`Task`]s: `compute` runs in
//! parallel and must not touch cross-task state, `merge` publishes the result
//! and is serialized globally. Task outcomes are plain `Result`s; the first
//! failure is reported and flips a stop flag that drains the remaining work.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::thread;

use log::error;

use crate::lock;
use crate::Error;

/// A unit of work submitted to [`WorkerPool::run`].
pub trait Task: Send {
    /// Parallel phase. Must not mutate state shared with other tasks.
    fn compute(&mut self) -> Result<(), Error>;

    /// Serialized phase, called only when `compute` succeeded. At most one
    /// `merge` of the whole batch runs at any moment.
    fn merge(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Fixed-size pool of worker threads, sized `max(1, CPUs - spare)`.
#[derive(Debug)]
pub struct WorkerPool {
    num_threads: usize,
}

impl WorkerPool {
    /// Create a pool leaving `spare` CPUs to the rest of the system.
    pub fn new(spare: usize) -> Self {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            num_threads: cpus.saturating_sub(spare).max(1),
        }
    }

    /// Number of worker threads per batch.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Run a batch of tasks to completion and return whether any failed.
    ///
    /// Tasks are grouped into bundles, one per worker. A task failure is
    /// logged (unless it is [`Error::Aborted`], which is a silent re-raise),
    /// sets the stop flag, and makes the remaining tasks of every bundle
    /// return early; the error surfaced here is always [`Error::Aborted`].
    pub fn run<T: Task>(&self, tasks: Vec<T>) -> Result<(), Error> {
        if tasks.is_empty() {
            return Ok(());
        }
        let queue = Mutex::new(bundles(tasks, self.num_threads));
        let merge_guard = Mutex::new(());
        let failed = AtomicBool::new(false);
        thread::scope(|scope| {
            for _ in 0..self.num_threads {
                scope.spawn(|| worker(&queue, &merge_guard, &failed));
            }
        });
        if failed.load(Ordering::SeqCst) {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }
}

fn worker<T: Task>(
    queue: &Mutex<VecDeque<Vec<T>>>,
    merge_guard: &Mutex<()>,
    failed: &AtomicBool,
) {
    loop {
        let Some(mut bundle) = lock(queue).pop_front() else {
            return;
        };
        for task in bundle.iter_mut() {
            if failed.load(Ordering::SeqCst) {
                // Some task already failed; drain the rest of the bundle.
                break;
            }
            let outcome = task.compute().and_then(|()| {
                let _serialized = lock(merge_guard);
                task.merge()
            });
            match outcome {
                Ok(()) => {}
                Err(Error::Aborted) => failed.store(true, Ordering::SeqCst),
                Err(e) => {
                    error!("{e}");
                    failed.store(true, Ordering::SeqCst);
                }
            }
        }
    }
}

/// Split `tasks` into up to `n` bundles of near-equal size.
fn bundles<T>(tasks: Vec<T>, n: usize) -> VecDeque<Vec<T>> {
    let len = tasks.len();
    let per_bundle = len.div_ceil(n).max(1);
    let mut result = VecDeque::with_capacity(n);
    let mut tasks = tasks.into_iter();
    loop {
        let bundle: Vec<T> = tasks.by_ref().take(per_bundle).collect();
        if bundle.is_empty() {
            break;
        }
        result.push_back(bundle);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct Count<'a> {
        computed: &'a AtomicUsize,
        merged: &'a Mutex<Vec<usize>>,
        id: usize,
        fail: bool,
    }

    impl Task for Count<'_> {
        fn compute(&mut self) -> Result<(), Error> {
            if self.fail {
                return Err(Error::Malformed("synthetic failure".into()));
            }
            self.computed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn merge(&mut self) -> Result<(), Error> {
            lock(self.merged).push(self.id);
            Ok(())
        }
    }

    #[test]
    fn runs_every_task_once() {
        let computed = AtomicUsize::new(0);
        let merged = Mutex::new(Vec::new());
        let pool = WorkerPool::new(0);
        let tasks: Vec<Count<'_>> = (0..100)
            .map(|id| Count {
                computed: &computed,
                merged: &merged,
                id,
                fail: false,
            })
            .collect();
        pool.run(tasks).unwrap();
        assert_eq!(computed.load(Ordering::SeqCst), 100);
        let mut merged = lock(&merged).clone();
        merged.sort_unstable();
        assert_eq!(merged, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn failure_aborts_the_batch() {
        let computed = AtomicUsize::new(0);
        let merged = Mutex::new(Vec::new());
        let pool = WorkerPool::new(0);
        let mut tasks: Vec<Count<'_>> = (0..10)
            .map(|id| Count {
                computed: &computed,
                merged: &merged,
                id,
                fail: false,
            })
            .collect();
        tasks[0].fail = true;
        let result = pool.run(tasks);
        assert!(matches!(result, Err(Error::Aborted)));
    }

    #[test]
    fn bundles_cover_all_tasks() {
        let split = bundles((0..101).collect::<Vec<_>>(), 4);
        assert_eq!(split.iter().map(Vec::len).sum::<usize>(), 101);
        assert!(split.len() <= 4);
    }

    #[test]
    fn at_least_one_thread() {
        assert!(WorkerPool::new(10_000).num_threads() >= 1);
    }
}
