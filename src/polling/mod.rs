use crate::acquisition::{run_cycle, CycleOutcome};
use crate::config::MeterConfig;
use crate::history::HistorySink;
use crate::models::RegisterMap;
use crate::obis_utils::{numeric_value, Quantity};
use crate::resolver::{self, ResolvedPower};
use crate::sensors::{Phase, SensorSink};
use crate::transport::{MeasurementReader, ReaderError};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug)]
pub enum TickError {
    #[error("Meter read failed: {0}")]
    Read(ReaderError),
    #[error("No meter data within {0:?}")]
    Timeout(Duration),
    #[error("No active power register found, present: {present}")]
    ResolutionNotFound { present: String },
    #[error("Loop stopped while reading, result discarded")]
    Discarded,
    #[error("Another cycle is reading the meter")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoopState {
    Stopped,
    Scheduled,
    Running,
}

/// Subscribers of the loop, called in registration order.
#[derive(Default, Clone)]
pub struct Subscribers {
    pub sensors: Vec<Arc<dyn SensorSink>>,
    pub history: Vec<Arc<dyn HistorySink>>,
}

struct LoopInner {
    reader: Arc<dyn MeasurementReader>,
    options: MeterConfig,
    timeout: Duration,
    subscribers: Subscribers,
    state: Mutex<LoopState>,
    /// Bumped by every stop; a cycle whose generation changed is discarded.
    generation: AtomicU64,
    /// Held for the whole acquisition, one cycle per transport.
    cycle: tokio::sync::Mutex<()>,
    latest: Mutex<Option<RegisterMap>>,
}

/// Periodic meter poll. Ticks never overlap: the next one is only started
/// once the previous cycle has settled.
pub struct PollingLoop {
    inner: Arc<LoopInner>,
    interval: Duration,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PollingLoop {
    pub fn new(
        reader: Arc<dyn MeasurementReader>,
        options: MeterConfig,
        interval: Duration,
        timeout: Duration,
        subscribers: Subscribers,
    ) -> Self {
        PollingLoop {
            inner: Arc::new(LoopInner {
                reader,
                options,
                timeout,
                subscribers,
                state: Mutex::new(LoopState::Stopped),
                generation: AtomicU64::new(0),
                cycle: tokio::sync::Mutex::new(()),
                latest: Mutex::new(None),
            }),
            interval,
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LoopState {
        *lock(&self.inner.state)
    }

    /// Registers of the last successful tick.
    pub fn latest_registers(&self) -> Option<RegisterMap> {
        lock(&self.inner.latest).clone()
    }

    /// Ticks once right away, then every interval until stopped.
    pub fn start(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state != LoopState::Stopped {
                warn!("Polling loop already started");
                return;
            }
            *state = LoopState::Scheduled;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *lock(&self.stop_tx) = Some(stop_tx);

        let inner = self.inner.clone();
        let interval = self.interval;
        let previous = lock(&self.task).take();
        info!("Polling meter every {:?}", interval);

        let task = tokio::spawn(async move {
            // a restarted loop waits for the tick still in flight from before
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let generation = inner.generation();
                        let _cycle = inner.cycle.lock().await;
                        if let Err(e) = inner.tick(generation).await {
                            debug!("Tick skipped: {}", e);
                        }
                    }
                }
            }
            debug!("Polling task finished");
        });
        *lock(&self.task) = Some(task);
    }

    /// Cancels the timer. A cycle already in flight runs to its deadline but
    /// its result is dropped. Safe to call repeatedly.
    pub fn stop(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let was_running = self.state() != LoopState::Stopped;
        if let Some(stop_tx) = lock(&self.stop_tx).take() {
            let _ = stop_tx.send(true);
        }
        // the task exits on its own once any in-flight tick returns
        *lock(&self.inner.state) = LoopState::Stopped;
        if was_running {
            info!("Polling loop stopped");
        }
    }

    /// Runs a single tick outside the schedule. Refused while another cycle
    /// holds the meter.
    pub async fn tick(&self) -> Result<ResolvedPower, TickError> {
        let _cycle = self.inner.cycle.try_lock().map_err(|_| TickError::Busy)?;
        self.inner.tick(self.inner.generation()).await
    }
}

impl Drop for PollingLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl LoopInner {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: LoopState) {
        let mut current = lock(&self.state);
        if *current != LoopState::Stopped {
            *current = state;
        }
    }

    /// `generation` is the one seen when the tick was due.
    async fn tick(&self, generation: u64) -> Result<ResolvedPower, TickError> {
        self.set_state(LoopState::Running);
        let outcome = run_cycle(self.reader.as_ref(), &self.options, self.timeout).await;
        let result = self.handle_outcome(outcome, generation);
        self.set_state(LoopState::Scheduled);
        result
    }

    fn handle_outcome(&self, outcome: CycleOutcome, generation: u64) -> Result<ResolvedPower, TickError> {
        let registers = match outcome {
            CycleOutcome::Settled(registers) => registers,
            CycleOutcome::Failed(e) => {
                error!("Meter read failed: {}", e);
                return Err(TickError::Read(e));
            }
            CycleOutcome::TimedOut => {
                error!("No meter data within {:?}", self.timeout);
                return Err(TickError::Timeout(self.timeout));
            }
        };

        if self.generation() != generation {
            debug!("Discarding meter data read after stop");
            return Err(TickError::Discarded);
        }

        for sensor in &self.subscribers.sensors {
            sensor.publish_auxiliary(&registers);
        }

        let resolved = resolver::resolve(&registers);
        if !resolved.is_found() {
            let present = registers.key_preview(20);
            error!("No active power register found. Present registers: {}", present);
            *lock(&self.latest) = Some(registers);
            return Err(TickError::ResolutionNotFound { present });
        }

        debug!("Active power {} W from {:?}", resolved.value, resolved.source);
        for sensor in &self.subscribers.sensors {
            sensor.publish_active_power(resolved.value);
        }

        if !self.subscribers.history.is_empty() {
            let fields = history_fields(&registers, resolved.value);
            let now = chrono::Utc::now().timestamp();
            for history in &self.subscribers.history {
                history.record_sample(now, &fields);
            }
        }

        *lock(&self.latest) = Some(registers);
        Ok(resolved)
    }
}

fn history_fields(registers: &RegisterMap, power: f64) -> HashMap<String, f64> {
    let mut fields = HashMap::new();
    fields.insert("power".to_string(), power);
    fields.insert("energy".to_string(), numeric_value(registers.lookup_code("1.8.0"), Quantity::Energy));
    for (i, phase) in Phase::ALL.iter().enumerate() {
        fields.insert(
            format!("voltage_l{}", i + 1),
            numeric_value(registers.lookup_code(phase.register()), Quantity::Voltage),
        );
    }
    fields
}
