//! Worker Pool and Task Management
//!
//! This module provides a scoped thread pool that runs one task per
//! partition, retrying failed attempts, and returns results in task order.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{ApproxError, Result};
use crate::source::PartitionId;

/// Identity of a task within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskId {
    /// Sampling and partial aggregation of one input partition
    Map(PartitionId),
    /// Merge of one reduce bucket
    Reduce(usize),
}

impl TaskId {
    /// Input partition of a map task.
    pub fn partition(&self) -> Option<PartitionId> {
        match self {
            TaskId::Map(p) => Some(*p),
            TaskId::Reduce(_) => None,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Map(p) => write!(f, "map {}", p),
            TaskId::Reduce(bucket) => write!(f, "reduce {}", bucket),
        }
    }
}

/// Task context passed to worker tasks.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task being run
    pub task: TaskId,
    /// Attempt number, starting at 1
    pub attempt: usize,
    /// Task start time
    pub start_time: Instant,
}

impl TaskContext {
    /// Create a new task context.
    pub fn new(task: TaskId, attempt: usize) -> Self {
        Self {
            task,
            attempt,
            start_time: Instant::now(),
        }
    }

    /// Get elapsed time since task start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

type TaskFn<'a, T> = Box<dyn Fn(&TaskContext) -> Result<T> + Send + Sync + 'a>;

/// A task to be executed by a worker.
///
/// The task function may run more than once when an attempt fails, so it
/// must be idempotent.
pub struct WorkerTask<'a, T> {
    /// Task identity
    pub id: TaskId,
    task_fn: TaskFn<'a, T>,
}

impl<'a, T> WorkerTask<'a, T> {
    /// Create a new worker task.
    pub fn new<F>(id: TaskId, task_fn: F) -> Self
    where
        F: Fn(&TaskContext) -> Result<T> + Send + Sync + 'a,
    {
        Self {
            id,
            task_fn: Box::new(task_fn),
        }
    }

    /// Run the task, retrying up to `max_attempts` times.
    fn execute(&self, max_attempts: usize) -> Result<T> {
        let mut attempt = 1;
        loop {
            let context = TaskContext::new(self.id, attempt);
            match (self.task_fn)(&context) {
                Ok(value) => return Ok(value),
                Err(ApproxError::Cancelled) => return Err(ApproxError::Cancelled),
                Err(e) if attempt < max_attempts => {
                    warn!(
                        task = %self.id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "task attempt failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Thread pool for partition tasks.
///
/// Uses scoped threads so tasks can borrow the source and query of the pass.
pub struct WorkerPool {
    num_workers: usize,
    max_attempts: usize,
}

impl WorkerPool {
    /// Create a new worker pool with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            max_attempts: 1,
        }
    }

    /// Set how many times a failing task is attempted.
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Get the number of workers.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Execute all tasks and return one result per task, in task order.
    ///
    /// Returns only once every task has finished.
    pub fn execute_all<T: Send>(&self, tasks: Vec<WorkerTask<'_, T>>) -> Vec<Result<T>> {
        if tasks.is_empty() {
            return vec![];
        }

        let num_tasks = tasks.len();

        // For single task, execute directly
        if num_tasks == 1 {
            return tasks.iter().map(|t| t.execute(self.max_attempts)).collect();
        }

        let results: Mutex<Vec<Option<Result<T>>>> =
            Mutex::new((0..num_tasks).map(|_| None).collect());
        let task_idx = AtomicUsize::new(0);

        thread::scope(|s| {
            let num_threads = self.num_workers.min(num_tasks);

            for _ in 0..num_threads {
                s.spawn(|| loop {
                    let idx = task_idx.fetch_add(1, Ordering::SeqCst);
                    if idx >= num_tasks {
                        break;
                    }

                    let result = tasks[idx].execute(self.max_attempts);
                    results.lock()[idx] = Some(result);
                });
            }
        });

        results
            .into_inner()
            .into_iter()
            .zip(tasks.iter())
            .map(|(slot, task)| {
                slot.unwrap_or_else(|| {
                    Err(ApproxError::internal(format!(
                        "task result missing for {}",
                        task.id
                    )))
                })
            })
            .collect()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(crate::config::default_parallelism())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn pid(i: u32) -> TaskId {
        TaskId::Map(PartitionId::new(i))
    }

    #[test]
    fn test_worker_pool_creation() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.num_workers(), 1);
    }

    #[test]
    fn test_worker_pool_execute_tasks_in_order() {
        let pool = WorkerPool::new(4);
        let counter = AtomicU32::new(0);

        let tasks: Vec<WorkerTask<'_, u32>> = (0..10)
            .map(|i| {
                let counter = &counter;
                WorkerTask::new(pid(i), move |ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(ctx.task.partition().map(|p| p.as_u32()).unwrap_or(0) * 10)
                })
            })
            .collect();

        let results = pool.execute_all(tasks);

        assert_eq!(results.len(), 10);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i as u32 * 10);
        }
    }

    #[test]
    fn test_failed_attempt_is_retried() {
        let pool = WorkerPool::new(2).with_max_attempts(3);
        let attempts = AtomicU32::new(0);

        let tasks = vec![
            WorkerTask::new(pid(0), |ctx: &TaskContext| {
                attempts.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt < 3 {
                    Err(ApproxError::internal("flaky"))
                } else {
                    Ok(ctx.attempt)
                }
            }),
            WorkerTask::new(pid(1), |_ctx: &TaskContext| Ok(1)),
        ];

        let results = pool.execute_all(tasks);
        assert_eq!(results[0].as_ref().unwrap(), &3);
        assert_eq!(results[1].as_ref().unwrap(), &1);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_attempts_report_error() {
        let pool = WorkerPool::new(2).with_max_attempts(2);
        let tasks = vec![WorkerTask::new(pid(0), |_ctx: &TaskContext| -> Result<()> {
            Err(ApproxError::internal("broken"))
        })];

        let results = pool.execute_all(tasks);
        assert!(matches!(results[0], Err(ApproxError::Internal { .. })));
    }

    #[test]
    fn test_cancellation_is_not_retried() {
        let pool = WorkerPool::new(1).with_max_attempts(5);
        let attempts = AtomicU32::new(0);
        let tasks = vec![WorkerTask::new(pid(0), |_ctx: &TaskContext| -> Result<()> {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ApproxError::Cancelled)
        })];

        let results = pool.execute_all(tasks);
        assert!(matches!(results[0], Err(ApproxError::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_task_context() {
        let ctx = TaskContext::new(pid(2), 1);
        assert_eq!(ctx.task, pid(2));
        assert_eq!(ctx.task.partition(), Some(PartitionId::new(2)));
        assert_eq!(TaskId::Reduce(1).partition(), None);
        assert_eq!(TaskId::Reduce(1).to_string(), "reduce 1");
        assert_eq!(ctx.attempt, 1);

        thread::sleep(Duration::from_millis(10));
        assert!(ctx.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_empty_tasks() {
        let pool = WorkerPool::new(2);
        let results = pool.execute_all::<()>(vec![]);
        assert!(results.is_empty());
    }
}
