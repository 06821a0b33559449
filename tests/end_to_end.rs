//! Whole-pipeline tests: reader, acquisition cycle, resolution and sensors.

mod common;

use common::{registers, MockMeter, PowerRecorder, Reply};
use obis2mqtt::config::{MeterConfig, MqttConfig, Protocol, Transport};
use obis2mqtt::mqtt::Transmission;
use obis2mqtt::polling::{Subscribers, TickError};
use obis2mqtt::sensors::{clamp_sensor_value, MqttSensor, SensorKind, SensorSink, SENSOR_MAX, SENSOR_MIN};
use obis2mqtt::transport::ReaderError;
use obis2mqtt::{resolve, run_cycle, CycleOutcome, ObisReader, PollingLoop, PowerSource, RegisterMap};
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn serial_options() -> MeterConfig {
    MeterConfig::new("/dev/ttyUSB0", Protocol::Sml, Transport::SerialResponse)
}

fn polling_with(meter: Arc<MockMeter>, recorder: Arc<PowerRecorder>) -> PollingLoop {
    let subscribers = Subscribers { sensors: vec![recorder as Arc<dyn SensorSink>], history: vec![] };
    PollingLoop::new(meter, serial_options(), Duration::from_secs(60), Duration::from_secs(30), subscribers)
}

#[test]
fn e2e_resolution_priority() {
    let net = resolve(&registers(&[("1-0:16.7.0*255", "874 W"), ("1-0:1.7.0*255", "1000 W")]));
    assert_eq!(net.value, 874.0);
    assert_eq!(net.source, PowerSource::NetTotal);

    let balance = resolve(&registers(&[("1-0:1.7.0*255", "500 W"), ("1-0:2.7.0*255", "120 W")]));
    assert_eq!(balance.value, 380.0);
    assert_eq!(balance.source, PowerSource::ImportMinusExport);

    let missing = resolve(&RegisterMap::new());
    assert!(missing.value.is_nan());
    assert_eq!(missing.source, PowerSource::NotFound);
}

#[tokio::test(start_paused = true)]
async fn e2e_tick_publishes_resolved_power() {
    let meter = Arc::new(MockMeter::new(Reply::After(
        Duration::from_millis(300),
        Box::new(Reply::Registers(registers(&[("1-0:16.7.0*255", "1.5 kW")]))),
    )));
    let recorder = Arc::new(PowerRecorder::default());
    let polling = polling_with(meter.clone(), recorder.clone());

    let resolved = polling.tick().await.unwrap();
    assert_eq!(resolved.value, 1500.0);
    assert_eq!(*recorder.values.lock().unwrap(), vec![1500.0]);
    assert_eq!(recorder.auxiliary.load(Ordering::SeqCst), 1);
    assert_eq!(meter.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn e2e_unresolved_power_publishes_no_power() {
    let meter = Arc::new(MockMeter::new(Reply::Registers(registers(&[("1-0:1.8.0*255", "12 kWh")]))));
    let recorder = Arc::new(PowerRecorder::default());
    let polling = polling_with(meter, recorder.clone());

    match polling.tick().await {
        Err(TickError::ResolutionNotFound { present }) => assert!(present.contains("1-0:1.8.0*255")),
        other => panic!("unexpected tick result {:?}", other),
    }
    assert!(recorder.values.lock().unwrap().is_empty());
    // auxiliary values still go out
    assert_eq!(recorder.auxiliary.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn e2e_error_settles_exactly_once() {
    let meter = MockMeter::new(Reply::Error(ReaderError::Crc("frame 3".to_string())));
    let outcome = run_cycle(&meter, &serial_options(), Duration::from_secs(30)).await;
    assert!(matches!(outcome, CycleOutcome::Failed(ReaderError::Crc(_))));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(meter.stops(), 1);
    assert_eq!(meter.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn e2e_silent_meter_times_out() {
    let meter = MockMeter::new(Reply::Silent);
    let started = tokio::time::Instant::now();
    let outcome = run_cycle(&meter, &serial_options(), Duration::from_millis(100)).await;

    assert!(matches!(outcome, CycleOutcome::TimedOut));
    assert!(started.elapsed() <= Duration::from_millis(150));
    assert_eq!(meter.stops(), 1);
}

#[tokio::test]
async fn e2e_sensor_values_stay_in_range() {
    assert_eq!(clamp_sensor_value(0.0), SENSOR_MIN);
    assert_eq!(clamp_sensor_value(-42.0), SENSOR_MIN);
    assert_eq!(clamp_sensor_value(f64::NAN), SENSOR_MIN);
    assert_eq!(clamp_sensor_value(250000.0), SENSOR_MAX);
    assert_eq!(clamp_sensor_value(874.0), 874.0);

    let mqtt: MqttConfig = serde_yml::from_str("host: localhost").unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::channel(10);
    let returned = MqttSensor::new(SensorKind::PowerReturn, &mqtt, tx);

    returned.publish_active_power(-250000.0);
    returned.publish_active_power(874.0);

    let mut values = Vec::new();
    while let Ok(Transmission::Publish(data)) = rx.try_recv() {
        assert_eq!(data.topic, "obis2mqtt/power_return");
        let payload: serde_json::Value = serde_json::from_str(&data.payload).unwrap();
        values.push(payload["power_return"].as_f64().unwrap());
    }
    assert_eq!(values, vec![SENSOR_MAX, SENSOR_MIN]);
}

#[tokio::test]
async fn e2e_d0_telegram_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "/ESY5Q3DA1004 V3.04\r\n\r\n\
1-0:0.0.0*255(1ESY1160407485)\r\n\
1-0:1.8.0*255(00002686.6750095*kWh)\r\n\
1-0:16.7.0*255(000874.81*W)\r\n\
!\r\n"
    )
    .unwrap();

    let mut options = MeterConfig::new(&file.path().display().to_string(), Protocol::D0, Transport::LocalFile);
    options.request_interval = 1;

    let reader = ObisReader::new();
    match run_cycle(&reader, &options, Duration::from_secs(5)).await {
        CycleOutcome::Settled(registers) => {
            assert_eq!(registers.len(), 3);
            let resolved = resolve(&registers);
            assert!((resolved.value - 874.81).abs() < 1e-9);
            assert_eq!(resolved.source, PowerSource::NetTotal);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}
