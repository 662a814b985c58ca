//! Delayed one-shot reconnect jobs on a private runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::trace;

/// Cancellation flag of one scheduled job. Checked right before the job fires.
#[derive(Debug, Clone, Default)]
pub struct ReconnectToken(Arc<AtomicBool>);

impl ReconnectToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Owns a one-worker runtime. Created when the manager starts, shut down when it stops.
pub struct RetryQueue {
    runtime: Option<Runtime>,
    tokens: Mutex<Vec<ReconnectToken>>,
}

impl RetryQueue {
    pub fn new() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("peerlink-retry")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            tokens: Mutex::new(Vec::new()),
        })
    }

    /// Run `job` after `delay` unless the returned token is cancelled first.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> ReconnectToken
    where
        F: FnOnce(&ReconnectToken) + Send + 'static,
    {
        let token = ReconnectToken::default();
        {
            let mut tokens = self.tokens.lock();
            // Drop tokens whose task already finished.
            tokens.retain(|t| Arc::strong_count(&t.0) > 1 && !t.is_cancelled());
            tokens.push(token.clone());
        }
        let Some(runtime) = self.runtime.as_ref() else {
            token.cancel();
            return token;
        };
        let task_token = token.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if task_token.is_cancelled() {
                trace!("reconnect job cancelled");
                return;
            }
            job(&task_token);
        });
        token
    }

    pub fn cancel_all(&self) {
        for t in self.tokens.lock().drain(..) {
            t.cancel();
        }
    }

    pub fn pending(&self) -> usize {
        self.tokens
            .lock()
            .iter()
            .filter(|t| Arc::strong_count(&t.0) > 1 && !t.is_cancelled())
            .count()
    }

    /// Cancel every job and stop the runtime without blocking on in-flight tasks.
    pub fn shutdown(mut self) {
        self.cancel_all();
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}

impl Drop for RetryQueue {
    fn drop(&mut self) {
        self.cancel_all();
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}
