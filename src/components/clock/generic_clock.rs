use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::component::{BaseComponent, Component};

/// Pulse generator running on its own thread.
///
/// Each period one `()` is offered on the channel. A pulse the consumer
/// has not picked up yet is dropped rather than queued, so a slow run loop
/// never builds a backlog.
pub struct GenericClock {
    base: BaseComponent,
    interval: Duration,
    pulses: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl GenericClock {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            base: BaseComponent::new(name),
            interval,
            pulses: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }

    pub fn from_frequency(name: impl Into<String>, frequency: f64) -> Self {
        let interval = if frequency <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / frequency)
        };
        Self::new(name, interval)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts the generator thread. Calling it on a running clock does
    /// nothing. The thread exits on [`Component::stop`] or when the
    /// receiving side hangs up.
    pub fn start(&mut self, pulses: SyncSender<()>) -> std::io::Result<()> {
        if self.base.is_running() {
            return Ok(());
        }
        self.base.set_running(true);
        let running = self.base.running_flag();
        let count = Arc::clone(&self.pulses);
        let interval = self.interval;
        let name = self.base.name.clone();

        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut next = Instant::now() + interval;
            while running.load(Ordering::SeqCst) {
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                }
                next += interval;
                match pulses.try_send(()) {
                    Ok(()) => {
                        count.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(())) => {}
                    Err(TrySendError::Disconnected(())) => break,
                }
            }
            running.store(false, Ordering::SeqCst);
            debug!(clock = %name, "clock thread exited");
        });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.base.set_running(false);
                Err(e)
            }
        }
    }

    /// Pulses delivered so far.
    pub fn pulse_count(&self) -> u64 {
        self.pulses.load(Ordering::Relaxed)
    }
}

impl Component for GenericClock {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn reset(&mut self) {
        self.stop();
        self.pulses.store(0, Ordering::Relaxed);
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }

    fn stop(&mut self) {
        self.base.set_running(false);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GenericClock {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_frequency_converts_to_interval() {
        let clock = GenericClock::from_frequency("CLK", 100.0);
        assert_eq!(clock.interval(), Duration::from_millis(10));
        assert_eq!(GenericClock::from_frequency("CLK", 0.0).interval(), Duration::ZERO);
    }

    #[test]
    fn test_pulses_arrive_until_stopped() {
        let (tx, rx) = mpsc::sync_channel(1);
        let mut clock = GenericClock::new("CLK", Duration::from_millis(1));
        clock.start(tx).unwrap();
        assert!(clock.is_running());
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        clock.stop();
        assert!(!clock.is_running());
        assert!(clock.pulse_count() >= 3);
    }

    #[test]
    fn test_exits_when_receiver_is_dropped() {
        let (tx, rx) = mpsc::sync_channel(0);
        let mut clock = GenericClock::new("CLK", Duration::from_millis(1));
        clock.start(tx).unwrap();
        drop(rx);
        let deadline = Instant::now() + Duration::from_secs(2);
        while clock.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!clock.is_running());
    }
}
