//! Cross-Slice Executor
//!
//! Runs one task per slice on a dedicated pool and joins them all before
//! returning. Callers stay synchronous; only the fan-out itself is
//! parallel.
//!
//! ```text
//!  caller ──► execute_all(op, [(slice, task)...])
//!                │ try_acquire_many(n)  ──(fail)──► ExecutorRejected
//!                ▼
//!        ┌─────────────┐   spawn    ┌────────┐ ┌────────┐
//!        │   runtime   │──────────► │ east   │ │ west   │ ...
//!        └─────────────┘            └────────┘ └────────┘
//!                │ join all
//!                ▼
//!       all Ok ──► Vec<(slice, T)>   any Err ──► CrossSliceFailure
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, SliceFailure};

/// A unit of work bound to one slice
pub type SliceTask<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Thread pool flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Exactly `threads` workers
    Fixed,
    /// One worker per core, idle workers retired after a minute
    #[default]
    Cached,
}

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub kind: PoolKind,
    /// Worker threads for the fixed pool
    pub threads: usize,
    /// Slice tasks allowed in flight across all callers
    pub max_in_flight: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            kind: PoolKind::Cached,
            threads: 4,
            max_in_flight: 256,
        }
    }
}

impl ExecutorSettings {
    pub fn fixed(threads: usize) -> Self {
        Self {
            kind: PoolKind::Fixed,
            threads,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.kind == PoolKind::Fixed && self.threads == 0 {
            return Err(Error::Config(
                "executor.threads must be positive for a fixed pool".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(Error::Config("executor.max_in_flight must be positive".to_string()));
        }
        Ok(())
    }
}

/// Executor counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub submitted: u64,
    pub rejected: u64,
    pub failed: u64,
}

/// Bounded parallel fan-out across slices
pub struct SliceExecutor {
    runtime: RwLock<Option<Runtime>>,
    permits: Arc<Semaphore>,
    settings: ExecutorSettings,
    submitted: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

impl std::fmt::Debug for SliceExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceExecutor")
            .field("settings", &self.settings)
            .field("available", &self.permits.available_permits())
            .field("running", &self.runtime.read().is_some())
            .finish()
    }
}

impl SliceExecutor {
    /// Start the pool
    pub fn new(settings: ExecutorSettings) -> Result<Self> {
        settings.validate()?;
        let mut builder = Builder::new_multi_thread();
        builder.thread_name("slice-exec").enable_time();
        match settings.kind {
            PoolKind::Fixed => {
                builder.worker_threads(settings.threads);
            }
            PoolKind::Cached => {
                builder.thread_keep_alive(Duration::from_secs(60));
            }
        }
        let runtime = builder.build()?;
        info!(kind = ?settings.kind, threads = settings.threads, max_in_flight = settings.max_in_flight, "Slice executor started");
        Ok(Self {
            runtime: RwLock::new(Some(runtime)),
            permits: Arc::new(Semaphore::new(settings.max_in_flight)),
            settings,
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run every task and wait for all of them.
    ///
    /// Fails with [`Error::ExecutorRejected`] when the pool cannot take
    /// all tasks at once, and with [`Error::CrossSliceFailure`] carrying
    /// every per-slice error when any task fails. Must not be called from
    /// inside an async runtime.
    pub fn execute_all<T>(&self, operation: &str, tasks: Vec<(String, SliceTask<T>)>) -> Result<Vec<(String, T)>>
    where
        T: Send + 'static,
    {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::Internal(
                "slice fan-out cannot block inside an async runtime".to_string(),
            ));
        }

        let requested = tasks.len();
        let permits = u32::try_from(requested)
            .ok()
            .and_then(|n| Arc::clone(&self.permits).try_acquire_many_owned(n).ok());
        let Some(permits) = permits else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(operation, requested, "Slice executor rejected submission");
            return Err(Error::ExecutorRejected {
                requested,
                available: self.permits.available_permits(),
            });
        };

        let guard = self.runtime.read();
        let runtime = guard
            .as_ref()
            .ok_or_else(|| Error::Internal("slice executor is shut down".to_string()))?;

        self.submitted.fetch_add(requested as u64, Ordering::Relaxed);
        let (slices, handles): (Vec<String>, Vec<_>) = tasks
            .into_iter()
            .map(|(slice, task)| (slice, runtime.spawn(task)))
            .unzip();
        let results = runtime.block_on(futures::future::join_all(handles));
        drop(permits);

        let mut done = Vec::with_capacity(requested);
        let mut failures = Vec::new();
        for (slice, result) in slices.into_iter().zip(results) {
            match result {
                Ok(Ok(value)) => done.push((slice, value)),
                Ok(Err(error)) => failures.push(SliceFailure { slice, error }),
                Err(join) => failures.push(SliceFailure {
                    slice,
                    error: Error::Internal(format!("slice task aborted: {}", join)),
                }),
            }
        }

        if !failures.is_empty() {
            self.failed.fetch_add(1, Ordering::Relaxed);
            for f in &failures {
                warn!(operation, slice = %f.slice, error = %f.error, "Slice task failed");
            }
            return Err(Error::CrossSliceFailure {
                operation: operation.to_string(),
                failures,
            });
        }
        debug!(operation, slices = requested, "Slice fan-out completed");
        Ok(done)
    }

    /// Stop the pool; later submissions fail
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.write().take() {
            runtime.shutdown_background();
            info!("Slice executor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.runtime.read().is_some()
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SliceExecutor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn task<T: Send + 'static>(value: Result<T>) -> SliceTask<T> {
        Box::pin(async move { value })
    }

    #[test]
    fn test_all_tasks_joined_in_submission_order() {
        let executor = SliceExecutor::new(ExecutorSettings::fixed(2)).unwrap();
        let tasks = (0..5)
            .map(|i| {
                let t: SliceTask<i32> = Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis((5 - i) as u64)).await;
                    Ok(i)
                });
                (format!("s{}", i), t)
            })
            .collect();
        let results = executor.execute_all("test", tasks).unwrap();
        assert_eq!(
            results,
            (0..5).map(|i| (format!("s{}", i), i)).collect::<Vec<_>>()
        );
        assert_eq!(executor.stats().submitted, 5);
    }

    #[test]
    fn test_any_failure_fails_whole_operation() {
        let executor = SliceExecutor::new(ExecutorSettings::default()).unwrap();
        let tasks = vec![
            ("east".to_string(), task(Ok(1))),
            (
                "west".to_string(),
                task(Err(Error::Store {
                    slice: "west".to_string(),
                    reason: "boom".to_string(),
                })),
            ),
            ("north".to_string(), task(Err(Error::SliceInactive("north".to_string())))),
        ];
        let err = executor.execute_all("flush", tasks).unwrap_err();
        assert_matches!(&err, Error::CrossSliceFailure { operation, .. } if operation == "flush");
        let failed: Vec<&str> = err.slice_failures().iter().map(|f| f.slice.as_str()).collect();
        assert_eq!(failed, vec!["west", "north"]);
        assert_eq!(executor.stats().failed, 1);
    }

    #[test]
    fn test_rejection_surfaces_as_error() {
        let executor = SliceExecutor::new(ExecutorSettings {
            max_in_flight: 2,
            ..ExecutorSettings::default()
        })
        .unwrap();
        let tasks = (0..3).map(|i| (format!("s{}", i), task(Ok(())))).collect();
        assert_matches!(
            executor.execute_all("query", tasks),
            Err(Error::ExecutorRejected { requested: 3, available: 2 })
        );
        assert_eq!(executor.stats().rejected, 1);
        // Permits are returned after a successful run
        let tasks = (0..2).map(|i| (format!("s{}", i), task(Ok(())))).collect();
        executor.execute_all("query", tasks).unwrap();
        executor.execute_all("query", vec![("s".to_string(), task(Ok(())))]).unwrap();
    }

    #[test]
    fn test_shutdown_stops_submissions() {
        let executor = SliceExecutor::new(ExecutorSettings::default()).unwrap();
        executor.shutdown();
        assert!(!executor.is_running());
        assert_matches!(
            executor.execute_all("q", vec![("s".to_string(), task(Ok(())))]),
            Err(Error::Internal(_))
        );
    }

    #[test]
    fn test_invalid_settings() {
        assert!(SliceExecutor::new(ExecutorSettings::fixed(0)).is_err());
        assert!(SliceExecutor::new(ExecutorSettings {
            max_in_flight: 0,
            ..ExecutorSettings::default()
        })
        .is_err());
    }
}
