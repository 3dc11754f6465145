/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

use super::{run_task, Task, TaskRef};
use crate::errors::TaskError;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;

/// How long a timed out task gets to report its own failure after cancel.
const CANCEL_GRACE: Duration = Duration::from_millis(100);

/// Runs children in order and stops at the first failure.
pub struct SerialGroupTask {
    name: String,
    tasks: Vec<TaskRef>,
    current: Mutex<Option<TaskRef>>,
    canceled: AtomicBool,
}

impl SerialGroupTask {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskRef>) -> Self {
        Self {
            name: name.into(),
            tasks,
            current: Mutex::new(None),
            canceled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Task for SerialGroupTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(&self) -> Result<(), TaskError> {
        for task in &self.tasks {
            if self.canceled.load(Ordering::SeqCst) {
                return Err(TaskError::canceled(self.name.clone()));
            }
            *self.current.lock() = Some(task.clone());
            let result = run_task(task.as_ref()).await;
            *self.current.lock() = None;
            result?;
        }
        Ok(())
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        let current = self.current.lock().clone();
        if let Some(task) = current {
            task.cancel();
        }
    }
}

/// Runs children concurrently. Fails with the first failure and leaves the
/// remaining children running.
pub struct ParallelGroupTask {
    name: String,
    tasks: Vec<TaskRef>,
}

impl ParallelGroupTask {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskRef>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }
}

#[async_trait]
impl Task for ParallelGroupTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(&self) -> Result<(), TaskError> {
        let mut running: FuturesUnordered<_> = self
            .tasks
            .iter()
            .cloned()
            .map(|task| tokio::spawn(async move { run_task(task.as_ref()).await }))
            .collect();
        while let Some(joined) = running.next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(TaskError::failed(self.name.clone(), e.to_string())),
            }
        }
        Ok(())
    }

    fn cancel(&self) {
        for task in &self.tasks {
            task.cancel();
        }
    }
}

/// Fails with [`TaskError::Timeout`] if the wrapped task runs too long.
///
/// On timeout the task is canceled. If it then fails with a status of its
/// own within a short grace period, that error wins, so a task can report
/// a more specific cause than the timeout.
pub struct TimeoutTask {
    task: TaskRef,
    timeout: Duration,
}

impl TimeoutTask {
    pub fn new(task: TaskRef, timeout: Duration) -> Self {
        Self { task, timeout }
    }
}

#[async_trait]
impl Task for TimeoutTask {
    fn name(&self) -> String {
        format!("Timeout{}ms({})", self.timeout.as_millis(), self.task.name())
    }

    async fn run(&self) -> Result<(), TaskError> {
        let run = run_task(self.task.as_ref());
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => return result,
            _ = tokio::time::sleep(self.timeout) => {}
        }

        warn!("{} timed out, canceling", self.task.name());
        self.task.cancel();
        let timeout = TaskError::Timeout {
            task: self.task.name(),
            after_ms: self.timeout.as_millis() as u64,
        };
        match tokio::time::timeout(CANCEL_GRACE, run).await {
            Ok(Err(e)) if e.status_code().is_some() => Err(e),
            _ => Err(timeout),
        }
    }

    fn cancel(&self) {
        self.task.cancel();
    }
}

/// Runs the wrapped task at most once. Later and concurrent runs share the
/// first outcome.
pub struct OnceTask {
    task: TaskRef,
    outcome: OnceCell<Result<(), TaskError>>,
}

impl OnceTask {
    pub fn new(task: TaskRef) -> Self {
        Self {
            task,
            outcome: OnceCell::new(),
        }
    }
}

#[async_trait]
impl Task for OnceTask {
    fn name(&self) -> String {
        format!("Once({})", self.task.name())
    }

    async fn run(&self) -> Result<(), TaskError> {
        if self.outcome.initialized() {
            info!("{} already ran", self.task.name());
        }
        self.outcome
            .get_or_init(|| async { self.task.run().await })
            .await
            .clone()
    }

    fn cancel(&self) {
        self.task.cancel();
    }
}
