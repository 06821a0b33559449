//! Reader doubles built on the public traits only.

#![allow(dead_code)]

use obis2mqtt::config::MeterConfig;
use obis2mqtt::models::{Measurement, RegisterMap};
use obis2mqtt::sensors::SensorSink;
use obis2mqtt::transport::{MeasurementReader, ReaderError, ReaderEvents, ReaderHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a mock meter does after `process` was called.
#[derive(Clone)]
pub enum Reply {
    Registers(RegisterMap),
    Error(ReaderError),
    After(Duration, Box<Reply>),
    Silent,
}

pub struct MockMeter {
    reply: Reply,
    pub opens: AtomicUsize,
    pub stops: Arc<AtomicUsize>,
}

impl MockMeter {
    pub fn new(reply: Reply) -> Self {
        MockMeter {
            reply,
            opens: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MeasurementReader for MockMeter {
    fn open(&self, _options: &MeterConfig) -> Result<Box<dyn ReaderHandle>, ReaderError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockHandle {
            reply: Some(self.reply.clone()),
            stops: self.stops.clone(),
            task: None,
        }))
    }
}

struct MockHandle {
    reply: Option<Reply>,
    stops: Arc<AtomicUsize>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ReaderHandle for MockHandle {
    fn process(&mut self, events: ReaderEvents) {
        let reply = match self.reply.take() {
            Some(reply) => reply,
            None => return,
        };
        self.task = Some(tokio::spawn(async move {
            let mut reply = reply;
            loop {
                match reply {
                    Reply::After(delay, next) => {
                        tokio::time::sleep(delay).await;
                        reply = *next;
                    }
                    Reply::Registers(registers) => {
                        let _ = events.send(Ok(registers));
                        break;
                    }
                    Reply::Error(e) => {
                        let _ = events.send(Err(e));
                        break;
                    }
                    Reply::Silent => break,
                }
            }
            // keep the channel open like a meter that just goes quiet
            std::future::pending::<()>().await;
        }));
    }

    fn stop(&mut self) -> Result<(), ReaderError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

/// Sensor sink remembering every published active power value.
#[derive(Default)]
pub struct PowerRecorder {
    pub values: Mutex<Vec<f64>>,
    pub auxiliary: AtomicUsize,
}

impl SensorSink for PowerRecorder {
    fn name(&self) -> &str {
        "power recorder"
    }

    fn publish_active_power(&self, value: f64) {
        self.values.lock().unwrap().push(value);
    }

    fn publish_auxiliary(&self, _registers: &RegisterMap) {
        self.auxiliary.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn registers(entries: &[(&str, &str)]) -> RegisterMap {
    entries
        .iter()
        .map(|(id, value)| (id.to_string(), Measurement::from_rendered(value)))
        .collect()
}
