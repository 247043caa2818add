//! Dedicated scheduler thread driving a [`ChainManager`] every tick.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use parking_lot::{Condvar, Mutex};

use super::{ChainManager, TICK_MS};

const TICK: Duration = Duration::from_millis(TICK_MS as u64);

/// Stop flag and wake-up signal owned by one scheduler instance.
#[derive(Default)]
struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Handle to the running scheduler thread. Dropping it stops the thread.
pub struct Scheduler {
    context: Arc<Signal>,
    handle: Option<JoinHandle<ChainManager>>,
}

impl Scheduler {
    /// Moves `manager` onto a new thread named `air-scheduler`.
    pub fn spawn(mut manager: ChainManager) -> Result<Self> {
        let context = Arc::new(Signal::default());
        let thread_context = Arc::clone(&context);

        let handle = std::thread::Builder::new()
            .name("air-scheduler".to_string())
            .spawn(move || {
                run(&mut manager, &thread_context);
                manager
            })
            .context("spawning scheduler thread")?;

        tracing::debug!("scheduler started");

        Ok(Self {
            context,
            handle: Some(handle),
        })
    }

    /// Signals the thread, waits for the current tick to finish and hands
    /// the chain manager back.
    pub fn stop(mut self) -> Result<ChainManager> {
        self.shutdown()
            .ok_or_else(|| anyhow!("scheduler already stopped"))?
    }

    fn shutdown(&mut self) -> Option<Result<ChainManager>> {
        let handle = self.handle.take()?;
        {
            let mut stopped = self.context.stopped.lock();
            *stopped = true;
            self.context.wake.notify_all();
        }
        let joined = handle
            .join()
            .map_err(|_| anyhow!("scheduler thread panicked"));
        tracing::debug!("scheduler stopped");
        Some(joined)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(Err(e)) = self.shutdown() {
            tracing::error!(error = %e, "stopping scheduler");
        }
    }
}

fn run(manager: &mut ChainManager, context: &Signal) {
    let mut delayed = 0u32;
    loop {
        let started = Instant::now();
        manager.run_thread(delayed);
        let elapsed = started.elapsed();

        let mut stopped = context.stopped.lock();
        if *stopped {
            return;
        }

        if elapsed < TICK {
            let deadline = started + TICK;
            while !*stopped {
                if context.wake.wait_until(&mut stopped, deadline).timed_out() {
                    break;
                }
            }
            if *stopped {
                return;
            }
            delayed = 0;
        } else {
            // Ticks that fit in the overrun, minus the one run_thread counts.
            let missed = (elapsed.as_millis() / TICK.as_millis()) as u32;
            delayed = missed.saturating_sub(1);
            tracing::trace!(elapsed_ms = elapsed.as_millis() as u64, delayed, "tick overran");
        }
    }
}
