use crate::config::MeterConfig;
use crate::models::RegisterMap;
use crate::transport::{MeasurementReader, ReaderError, ReaderHandle};
use log::{debug, error, warn};
use std::time::Duration;
use tokio::sync::mpsc;

/// Result of one bounded read against the meter.
#[derive(Debug)]
pub enum CycleOutcome {
    Settled(RegisterMap),
    Failed(ReaderError),
    TimedOut,
}

impl CycleOutcome {
    pub fn is_settled(&self) -> bool {
        matches!(self, CycleOutcome::Settled(_))
    }
}

/// Owns the open reader handle until the cycle's outcome is decided.
///
/// Whoever settles first takes the handle and stops it; every later attempt
/// finds nothing to stop. Dropping an unsettled cycle (the caller gave up on
/// the future) settles it as well, so the reader is stopped exactly once.
pub struct Settlement {
    handle: Option<Box<dyn ReaderHandle>>,
}

impl Settlement {
    pub fn new(handle: Box<dyn ReaderHandle>) -> Self {
        Settlement { handle: Some(handle) }
    }

    pub fn is_settled(&self) -> bool {
        self.handle.is_none()
    }

    fn handle_mut(&mut self) -> Option<&mut Box<dyn ReaderHandle>> {
        self.handle.as_mut()
    }

    /// Stops the reader. Returns false when the cycle was already settled.
    pub fn settle(&mut self) -> bool {
        match self.handle.take() {
            Some(mut handle) => {
                if let Err(e) = handle.stop() {
                    warn!("Stopping the meter reader failed: {}", e);
                }
                true
            }
            None => false,
        }
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if self.settle() {
            debug!("Acquisition cycle dropped before settling, reader stopped");
        }
    }
}

/// Runs one acquisition against `reader`: the first non-empty register map,
/// the first error or the deadline decides the outcome.
pub async fn run_cycle(reader: &dyn MeasurementReader, options: &MeterConfig, deadline: Duration) -> CycleOutcome {
    let handle = match reader.open(options) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Unable to start reading from {}: {}", options.serial_port, e);
            return CycleOutcome::Failed(e);
        }
    };

    let mut settlement = Settlement::new(handle);
    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(handle) = settlement.handle_mut() {
        handle.process(tx);
    }

    let timer = tokio::time::sleep(deadline);
    tokio::pin!(timer);
    let mut listening = true;

    loop {
        tokio::select! {
            biased;

            event = rx.recv(), if listening => match event {
                Some(Ok(registers)) if registers.is_empty() => {
                    debug!("Meter reported no registers yet, waiting");
                }
                Some(Ok(registers)) => {
                    settlement.settle();
                    return CycleOutcome::Settled(registers);
                }
                Some(Err(e)) => {
                    settlement.settle();
                    return CycleOutcome::Failed(e);
                }
                None => {
                    // reader finished without a result, only the deadline is left
                    debug!("Meter reader closed its channel without data");
                    listening = false;
                }
            },
            _ = &mut timer => {
                settlement.settle();
                debug!("No meter data within {:?}", deadline);
                return CycleOutcome::TimedOut;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, Transport};
    use crate::models::Measurement;
    use crate::transport::stub::{ScriptedReader, Step};
    use std::sync::atomic::Ordering;

    fn options() -> MeterConfig {
        MeterConfig::new("/dev/ttyUSB0", Protocol::Sml, Transport::SerialResponse)
    }

    fn registers(id: &str, value: &str) -> RegisterMap {
        let mut map = RegisterMap::new();
        map.insert(id.to_string(), Measurement::from_rendered(value));
        map
    }

    #[tokio::test(start_paused = true)]
    async fn test_settles_on_first_registers() {
        let reader = ScriptedReader::new(vec![
            Step::Wait(Duration::from_millis(20)),
            Step::Emit(Ok(registers("1-0:16.7.0*255", "874 W"))),
        ]);
        let outcome = run_cycle(&reader, &options(), Duration::from_secs(30)).await;
        match outcome {
            CycleOutcome::Settled(regs) => assert_eq!(regs.len(), 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(reader.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_error_wins_and_stops_once() {
        let reader = ScriptedReader::new(vec![
            Step::Emit(Err(ReaderError::Read("line noise".to_string()))),
            Step::Emit(Ok(registers("1-0:16.7.0*255", "874 W"))),
        ]);
        let outcome = run_cycle(&reader, &options(), Duration::from_secs(30)).await;
        assert!(matches!(outcome, CycleOutcome::Failed(ReaderError::Read(_))));

        // give the stub a chance to fire late
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reader.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_bounded() {
        let reader = ScriptedReader::new(vec![]);
        let started = tokio::time::Instant::now();
        let outcome = run_cycle(&reader, &options(), Duration::from_millis(100)).await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome, CycleOutcome::TimedOut));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed <= Duration::from_millis(150));
        assert_eq!(reader.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_maps_are_not_terminal() {
        let reader = ScriptedReader::new(vec![
            Step::Emit(Ok(RegisterMap::new())),
            Step::Wait(Duration::from_millis(10)),
            Step::Emit(Ok(RegisterMap::new())),
            Step::Wait(Duration::from_millis(10)),
            Step::Emit(Ok(registers("1-0:1.7.0*255", "500 W"))),
        ]);
        let outcome = run_cycle(&reader, &options(), Duration::from_secs(1)).await;
        assert!(outcome.is_settled());
        assert_eq!(reader.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_empty_maps_time_out() {
        let reader = ScriptedReader::new(vec![Step::Emit(Ok(RegisterMap::new()))]);
        let outcome = run_cycle(&reader, &options(), Duration::from_millis(100)).await;
        assert!(matches!(outcome, CycleOutcome::TimedOut));
        assert_eq!(reader.stops(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_has_nothing_to_stop() {
        let mut reader = ScriptedReader::new(vec![]);
        reader.fail_open = true;
        let outcome = run_cycle(&reader, &options(), Duration::from_millis(100)).await;
        assert!(matches!(outcome, CycleOutcome::Failed(ReaderError::Open { .. })));
        assert_eq!(reader.stops(), 0);
        assert_eq!(reader.counters.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_cycle_stops_reader() {
        let reader = ScriptedReader::new(vec![]);
        let options = options();
        let cycle = run_cycle(&reader, &options, Duration::from_secs(10));
        let result = tokio::time::timeout(Duration::from_millis(10), cycle).await;
        assert!(result.is_err());
        assert_eq!(reader.stops(), 1);
    }

    #[test]
    fn test_settle_is_one_shot() {
        struct Counting(std::sync::Arc<std::sync::atomic::AtomicUsize>);
        impl ReaderHandle for Counting {
            fn process(&mut self, _events: crate::transport::ReaderEvents) {}
            fn stop(&mut self) -> Result<(), ReaderError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let stops = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut settlement = Settlement::new(Box::new(Counting(stops.clone())));
        assert!(!settlement.is_settled());
        assert!(settlement.settle());
        assert!(!settlement.settle());
        drop(settlement);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
