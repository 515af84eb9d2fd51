//! Clocked execution.
//!
//! The clock thread posts pulses on a bounded channel; the run-loop thread
//! takes the context lock once per pulse and advances the pipeline one
//! tick. Shell commands take the same lock, so they always see a whole
//! tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::component::Component;
use crate::components::clock::generic_clock::GenericClock;
use crate::error::{EmuError, Result};
use crate::systems::cpu_context::CpuContext;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Locks the shared context, recovering from a poisoned lock.
pub fn lock(context: &Mutex<CpuContext>) -> MutexGuard<'_, CpuContext> {
    context.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Runner {
    context: Arc<Mutex<CpuContext>>,
    clock: GenericClock,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Runner {
    /// Attaches a clock to `context`. From now on `run` only starts the
    /// machine and the pulses drive it.
    pub fn start(context: Arc<Mutex<CpuContext>>, interval: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(1);
        let mut clock = GenericClock::new("SYSTEM_CLOCK", interval);
        clock
            .start(tx)
            .map_err(|source| EmuError::Thread { name: "clock", source })?;

        let shutdown = Arc::new(AtomicBool::new(false));
        lock(&context).set_clocked(true);
        let worker = {
            let context = Arc::clone(&context);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("run-loop".to_string())
                .spawn(move || run_loop(&context, &rx, &shutdown))
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(source) => {
                clock.stop();
                lock(&context).set_clocked(false);
                return Err(EmuError::Thread { name: "run loop", source });
            }
        };

        info!(interval = ?interval, "clock attached");
        Ok(Self {
            context,
            clock,
            shutdown,
            worker: Some(worker),
        })
    }

    pub fn pulse_count(&self) -> u64 {
        self.clock.pulse_count()
    }

    /// Stops both threads. A run still in progress is stopped and, with
    /// autosave on, persisted.
    pub fn shutdown(mut self) {
        self.stop_threads();
    }

    fn stop_threads(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.clock.stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        lock(&self.context).set_clocked(false);
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop_threads();
        }
    }
}

fn run_loop(context: &Mutex<CpuContext>, pulses: &Receiver<()>, shutdown: &AtomicBool) {
    let mut was_running = false;
    while !shutdown.load(Ordering::SeqCst) {
        match pulses.recv_timeout(POLL_INTERVAL) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let mut cpu = lock(context);
        if cpu.is_running() {
            was_running = true;
            // a failure is logged and kept as the context's last error
            let _ = cpu.step();
        }
        if was_running && !cpu.is_running() {
            was_running = false;
            debug!(outcome = ?cpu.last_outcome(), "clocked run ended");
            persist(&cpu);
        }
    }

    let mut cpu = lock(context);
    if cpu.is_running() {
        cpu.stop();
        persist(&cpu);
    }
}

fn persist(cpu: &CpuContext) {
    if let Err(e) = cpu.autosave() {
        warn!(error = %e, "autosave failed");
    }
}
