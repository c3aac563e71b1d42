//! # Drift-corrected periodic execution.
//!
//! [`PeriodicScheduler`] repeats an async callback every `interval`, anchored to
//! a fixed phase grid: the next fire time is computed as
//! `interval - ((now - start_time) % interval)`, so a slow callback does not
//! push later cycles off schedule. If a callback is still executing when its
//! next grid point arrives, that grid point is skipped — there is never more
//! than one concurrent invocation.
//!
//! Callback panics are caught and logged; the scheduler keeps running.
//! [`PeriodicScheduler::cancel`] has join semantics: it resolves only after the
//! background task has fully stopped, so callers can free resources afterward.
//!
//! Pausing only suppresses firing; the phase grid keeps advancing, and
//! unpausing resumes on the original grid.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Handle to a repeating background callback.
pub struct PeriodicScheduler {
    name: Arc<str>,
    paused: Arc<AtomicBool>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicScheduler {
    /// Spawns the scheduler.
    ///
    /// ### Parameters
    /// - `name`: included in logs.
    /// - `interval`: spacing of the phase grid; must be non-zero.
    /// - `run_immediately`: fire once right away instead of waiting a full
    ///   interval first.
    /// - `run_after`: initial delay before the grid is anchored. Happens before
    ///   `run_immediately`.
    /// - `callback`: produces a fresh future per tick; state is shared via
    ///   `Arc` inside the closure.
    pub fn spawn<F, Fut>(
        name: impl Into<Arc<str>>,
        interval: Duration,
        run_immediately: bool,
        run_after: Duration,
        callback: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let paused = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();

        let handle = tokio::spawn(Self::tick_loop(
            name.clone(),
            interval.max(Duration::from_millis(1)),
            run_immediately,
            run_after,
            callback,
            paused.clone(),
            token.clone(),
        ));

        Self {
            name,
            paused,
            token,
            handle: Some(handle),
        }
    }

    async fn tick_loop<F, Fut>(
        name: Arc<str>,
        interval: Duration,
        run_immediately: bool,
        run_after: Duration,
        callback: F,
        paused: Arc<AtomicBool>,
        token: CancellationToken,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !run_after.is_zero() {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = time::sleep(run_after) => {}
            }
        }

        let start_time = Instant::now();

        if run_immediately && !paused.load(Ordering::SeqCst) {
            Self::run_once(&name, &callback).await;
        }

        loop {
            let elapsed = start_time.elapsed().as_secs_f64();
            let period = interval.as_secs_f64();
            let wait = Duration::from_secs_f64(period - (elapsed % period));

            tokio::select! {
                _ = token.cancelled() => break,
                _ = time::sleep(wait) => {}
            }

            if paused.load(Ordering::SeqCst) {
                continue;
            }

            Self::run_once(&name, &callback).await;
        }

        debug!("scheduler `{name}` stopped");
    }

    /// Runs the callback on its own task so a panic is contained.
    async fn run_once<F, Fut>(name: &Arc<str>, callback: &F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Err(join_err) = tokio::spawn(callback()).await {
            if join_err.is_panic() {
                error!("scheduler `{name}`: callback panicked; continuing");
            }
        }
    }

    /// Stops the callback from firing. The phase grid keeps advancing.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes firing on the original phase grid.
    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancels the scheduler and waits for the background task to stop.
    ///
    /// Safe to call while a callback is mid-flight: the in-progress invocation
    /// finishes first (join semantics).
    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    error!("scheduler `{}`: tick loop panicked", self.name);
                }
            }
        }
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        // Dropping without cancel() still stops the loop, just without joining.
        self.token.cancel();
    }
}
