//! Execution backend seam.
//!
//! The pool never runs work itself; it hands each claimed task to an
//! `ExecutionBackend` and supervises the returned future. An `Ok(())`
//! means the attempt succeeded, any error feeds the retry path.

use crate::core::{Task, Worker};
use crate::error::Result;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;

pub trait ExecutionBackend: Send + Sync + 'static {
    /// Run one attempt of `task` on `worker`.
    fn execute(&self, task: Task, worker: Worker) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> ExecutionBackend for F
where
    F: Fn(Task, Worker) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn execute(&self, task: Task, worker: Worker) -> BoxFuture<'static, Result<()>> {
        self(task, worker).boxed()
    }
}
