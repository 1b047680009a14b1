// Copyright 2025 Cowboy AI, LLC.

//! Background tasks with cooperative cancellation
//!
//! Every long-running loop in the crate (bus dispatcher, health polls,
//! reconnection scan, event syncer) is a [`BackgroundTask`]: a spawned future
//! plus a `watch` flag it polls at its suspension points. Stopping a task
//! first raises the flag and waits a grace period, then aborts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Grace period given to a task between the cancel flag and abort
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Receiving side of a task's cancel flag
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested (or the sender is gone)
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration`, returning `false` if cancelled first
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// A spawned loop with a cancel flag
#[derive(Debug)]
pub struct BackgroundTask {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `f(signal)` on the current runtime
    pub fn spawn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (shutdown_tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f(ShutdownSignal { rx }));
        debug!(task = %name, "Spawned background task");
        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the future already completed
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Raise the cancel flag without waiting
    pub fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Raise the cancel flag, wait up to `grace`, then abort
    pub async fn stop(self, grace: Duration) {
        self.cancel();
        let Self { name, handle, .. } = self;
        let abort = handle.abort_handle();
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => debug!(task = %name, "Background task stopped"),
            Ok(Err(e)) if e.is_cancelled() => debug!(task = %name, "Background task aborted"),
            Ok(Err(e)) => warn!(task = %name, error = %e, "Background task panicked"),
            Err(_) => {
                warn!(task = %name, "Background task ignored cancellation, aborting");
                abort.abort();
            }
        }
    }

    /// Abort immediately
    pub fn abort(&self) {
        self.cancel();
        self.handle.abort();
    }
}

/// Keyed set of background tasks owned by one component
///
/// Spawning under an existing key replaces (and cancels) the old task.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, BackgroundTask>>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BackgroundTask>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn a cancellable task under `key`
    pub fn spawn_cancellable<F, Fut>(&self, key: impl Into<String>, f: F)
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let task = BackgroundTask::spawn(key.clone(), f);
        if let Some(previous) = self.lock().insert(key, task) {
            previous.cancel();
        }
    }

    /// Spawn under `key` only when no live task holds it; `false` if one does
    pub fn spawn_if_idle<F, Fut>(&self, key: impl Into<String>, f: F) -> bool
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let mut tasks = self.lock();
        if tasks.get(&key).is_some_and(|task| !task.is_finished()) {
            return false;
        }
        let task = BackgroundTask::spawn(key.clone(), f);
        tasks.insert(key, task);
        true
    }

    /// Whether a live task is registered under `key`
    pub fn is_running(&self, key: &str) -> bool {
        self.lock().get(key).is_some_and(|task| !task.is_finished())
    }

    /// Cancel and forget the task under `key`
    pub fn cancel(&self, key: &str) -> bool {
        match self.lock().remove(key) {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// Keys of live tasks
    pub fn running(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, task)| !task.is_finished())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of live tasks
    pub fn len(&self) -> usize {
        self.lock().values().filter(|task| !task.is_finished()).count()
    }

    /// Whether no task is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every task, waiting up to `grace` for each
    pub async fn shutdown(&self, grace: Duration) {
        let tasks: Vec<BackgroundTask> = self.lock().drain().map(|(_, task)| task).collect();
        for task in &tasks {
            task.cancel();
        }
        for task in tasks {
            task.stop(grace).await;
        }
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        for (_, task) in self.lock().drain() {
            task.abort();
        }
    }
}
