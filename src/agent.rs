//! Cooperative duty-cycle scheduling. Each agent runs single-threaded on its
//! own runner thread and never blocks: `do_work` returns the amount of work
//! done and the idle strategy decides how hard to back off when there was
//! none.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub trait Agent: Send {
    fn role_name(&self) -> &'static str;

    /// One duty cycle; returns the number of work units performed.
    fn do_work(&mut self) -> usize;

    /// Called once on the agent's thread after the final duty cycle.
    fn on_close(&mut self) {}
}

/// Spin, then yield, then park with doubling pauses. Resets as soon as a
/// cycle does work.
pub struct BackoffIdleStrategy {
    max_spins: u32,
    max_yields: u32,
    min_park: Duration,
    max_park: Duration,
    spins: u32,
    yields: u32,
    park: Duration,
}

impl Default for BackoffIdleStrategy {
    fn default() -> Self {
        Self::new(10, 5, Duration::from_micros(1), Duration::from_millis(1))
    }
}

impl BackoffIdleStrategy {
    pub fn new(max_spins: u32, max_yields: u32, min_park: Duration, max_park: Duration) -> Self {
        Self {
            max_spins,
            max_yields,
            min_park,
            max_park,
            spins: 0,
            yields: 0,
            park: min_park,
        }
    }

    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }
        if self.spins < self.max_spins {
            self.spins += 1;
            std::hint::spin_loop();
        } else if self.yields < self.max_yields {
            self.yields += 1;
            std::thread::yield_now();
        } else {
            std::thread::park_timeout(self.park);
            self.park = (self.park * 2).min(self.max_park);
        }
    }

    pub fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park = self.min_park;
    }
}

/// Drives one agent on a dedicated thread until stopped.
pub struct AgentRunner {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AgentRunner {
    pub fn start(mut agent: impl Agent + 'static) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_flag = running.clone();
        let handle = std::thread::Builder::new()
            .name(agent.role_name().to_string())
            .spawn(move || {
                let mut idle = BackoffIdleStrategy::default();
                tracing::debug!(role = agent.role_name(), "agent started");
                while thread_flag.load(Ordering::Acquire) {
                    let work = agent.do_work();
                    idle.idle(work);
                }
                agent.on_close();
                tracing::debug!(role = agent.role_name(), "agent closed");
            })
            .expect("spawn agent thread");
        Self {
            running,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
