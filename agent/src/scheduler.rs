use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::TELEMETRY_INTERVAL_SECONDS;

/// Longest accepted telemetry period: one day
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Something whose telemetry period can be changed at runtime
pub trait IntervalControl: Send + Sync {
    /// Apply a new period in seconds. Values outside
    /// `1..=MAX_INTERVAL_SECS` are ignored and false is returned.
    fn reschedule(&self, seconds: i64) -> bool;

    fn interval(&self) -> u64;
}

#[derive(Debug)]
enum Command {
    Reschedule(u64),
    Stop,
}

#[derive(Default)]
struct State {
    tx: Option<mpsc::UnboundedSender<Command>>,
    interval: u64,
}

/// Repeating telemetry timer.
///
/// The timer lives in a single task that selects over its command channel and
/// its ticker, so a reschedule can never race a tick. The interval and the
/// command sender share one mutex.
#[derive(Default)]
pub struct TelemetryScheduler {
    state: Mutex<State>,
}

impl TelemetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start calling `emit` every `seconds`, first call one period from now.
    /// A running timer is replaced. Must be called within a tokio runtime.
    pub fn start<F, Fut>(&self, seconds: u64, emit: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !valid_interval(seconds) {
            warn!("Refusing to start telemetry every {}s", seconds);
            return false;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            if let Some(previous) = state.tx.replace(tx) {
                let _ = previous.send(Command::Stop);
            }
            state.interval = seconds;
        }
        TELEMETRY_INTERVAL_SECONDS.set(seconds as f64);

        info!("Starting telemetry every {}s", seconds);
        tokio::spawn(run_timer(rx, seconds, emit));
        true
    }

    /// Cancel the timer. Calling it again is harmless.
    pub fn stop(&self) {
        if let Some(tx) = self.lock().tx.take() {
            info!("Stopping telemetry");
            let _ = tx.send(Command::Stop);
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl IntervalControl for TelemetryScheduler {
    fn reschedule(&self, seconds: i64) -> bool {
        if seconds <= 0 || !valid_interval(seconds as u64) {
            warn!("Ignoring out-of-range telemetry interval {}", seconds);
            return false;
        }
        let seconds = seconds as u64;

        let mut state = self.lock();
        let Some(tx) = state.tx.as_ref() else {
            debug!("Telemetry not running, ignoring reschedule to {}s", seconds);
            return false;
        };
        if tx.send(Command::Reschedule(seconds)).is_err() {
            return false;
        }
        state.interval = seconds;
        TELEMETRY_INTERVAL_SECONDS.set(seconds as f64);

        info!("Telemetry interval changed to {}s", seconds);
        true
    }

    fn interval(&self) -> u64 {
        self.lock().interval
    }
}

impl Drop for TelemetryScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn valid_interval(seconds: u64) -> bool {
    (1..=MAX_INTERVAL_SECS).contains(&seconds)
        && Instant::now()
            .checked_add(Duration::from_secs(seconds))
            .is_some()
}

fn new_ticker(seconds: u64) -> Interval {
    let period = Duration::from_secs(seconds);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run_timer<F, Fut>(mut rx: mpsc::UnboundedReceiver<Command>, seconds: u64, mut emit: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut ticker = new_ticker(seconds);

    loop {
        tokio::select! {
            biased;

            command = rx.recv() => {
                match command {
                    Some(Command::Reschedule(seconds)) => {
                        ticker = new_ticker(seconds);
                    }
                    Some(Command::Stop) | None => break,
                }
            }

            _ = ticker.tick() => {
                emit().await;
            }
        }
    }

    debug!("Telemetry timer stopped");
}
