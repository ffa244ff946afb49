use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use epicars_runtime::{
    CaError, CagetOptions, ClientConfig, Context, ContextRegistry, DecodeMode, GetOutcome,
    PutOutcome, PvOptions, Reading, Value,
    dbr::DbrValue,
    transport::{MemoryTransport, MonitorMask},
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

/// A registry whose contexts all talk to `transport`
fn registry_for(transport: &MemoryTransport, config: ClientConfig) -> ContextRegistry {
    let transport = transport.clone();
    ContextRegistry::new(config, move || Arc::new(transport.clone()))
}

fn quiet_context(transport: &MemoryTransport) -> (ContextRegistry, Context) {
    let registry = registry_for(
        transport,
        ClientConfig::default()
            .preemptive(false)
            .connect_timeout(Duration::from_millis(500)),
    );
    let context = registry.create_context(false);
    (registry, context)
}

fn ready(outcome: GetOutcome) -> Reading {
    match outcome {
        GetOutcome::Ready(reading) => reading,
        GetOutcome::Incomplete => panic!("Get did not wait"),
    }
}

#[test]
fn monitor_then_write_and_read_back() {
    init_logging();
    let transport = MemoryTransport::new();
    let temp = transport.add_pv("TEMP1", 23.4f64).unwrap();
    let (registry, context) = quiet_context(&transport);

    let channel = context.wait_for_connect("TEMP1", None).unwrap();
    let initial = ready(
        context
            .get(&channel, DecodeMode::Native, 0, true, None)
            .unwrap(),
    );
    assert_eq!(initial.value, Value::Float(23.4));

    let readings = Arc::new(Mutex::new(Vec::new()));
    let sink = readings.clone();
    context
        .subscribe(&channel, DecodeMode::Time, MonitorMask::default(), move |_, r| {
            sink.lock().unwrap().push(r.clone())
        })
        .unwrap();
    context.pend_event(Duration::from_millis(10)).unwrap();
    {
        let readings = readings.lock().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, Value::Float(23.4));
    }

    temp.store(23.9f64).unwrap();
    context.pend_event(Duration::from_millis(10)).unwrap();
    {
        let readings = readings.lock().unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].value, Value::Float(23.9));
        assert_eq!(readings[1].severity(), 0);
        assert!(readings[1].meta.timestamp.is_some());
    }

    assert_eq!(
        context.put(&channel, 25.0, true, None, None),
        Ok(PutOutcome::Done)
    );
    let reading = ready(
        context
            .get(&channel, DecodeMode::Native, 0, true, None)
            .unwrap(),
    );
    assert_eq!(reading.value, Value::Float(25.0));
    registry.shutdown();
}

#[test]
fn unknown_names_time_out() {
    init_logging();
    let transport = MemoryTransport::new();
    let (registry, context) = quiet_context(&transport);

    let start = Instant::now();
    let result = context.wait_for_connect("BAD:NAME", Some(Duration::from_millis(500)));
    assert!(matches!(result, Err(CaError::NotConnected { .. })));
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert_eq!(context.failure_count("BAD:NAME"), Some(1));

    assert_eq!(context.caget("BAD:NAME", CagetOptions::default()), None);
    assert_eq!(context.failure_count("BAD:NAME"), Some(1));
    registry.shutdown();
}

#[test]
fn channel_creation_is_idempotent() {
    init_logging();
    let transport = MemoryTransport::new();
    transport.add_pv("TEST", 1i32).unwrap();
    let (registry, context) = quiet_context(&transport);

    let first = context.create_channel("TEST", None).unwrap();
    let second = context.create_channel("TEST", None).unwrap();
    assert_eq!(first, second);
    context.wait_for_connect("TEST", None).unwrap();

    let told = Arc::new(Mutex::new(Vec::new()));
    let sink = told.clone();
    let third = context
        .create_channel(
            "TEST",
            Some(Arc::new(move |name: &str, up: bool| {
                sink.lock().unwrap().push((name.to_string(), up))
            })),
        )
        .unwrap();
    assert_eq!(third, first);
    assert_eq!(*told.lock().unwrap(), vec![("TEST".to_string(), true)]);
    assert_eq!(transport.channel_count(), 1);
    registry.shutdown();
}

#[test]
fn one_get_in_flight_per_channel() {
    init_logging();
    let transport = MemoryTransport::with_latency(Duration::from_millis(20));
    transport.add_pv("TEST", 7i16).unwrap();
    let (registry, context) = quiet_context(&transport);
    let channel = context.wait_for_connect("TEST", None).unwrap();

    for _ in 0..3 {
        assert_eq!(
            context.get(&channel, DecodeMode::Time, 0, false, None),
            Ok(GetOutcome::Incomplete)
        );
    }
    assert!(context.get_pending(&channel, DecodeMode::Time));
    let reading = context
        .complete(&channel, DecodeMode::Time, None)
        .unwrap();
    assert_eq!(reading.value, Value::Integer(7));
    assert!(matches!(
        context.complete(&channel, DecodeMode::Time, None),
        Err(CaError::NothingPending(_))
    ));
    registry.shutdown();
}

#[test]
fn large_pvs_are_not_auto_monitored() {
    init_logging();
    let transport = MemoryTransport::new();
    transport.add_pv("SCALAR", 0.0f64).unwrap();
    transport.add_pv("WAVEFORM", vec![0.0f64; 32]).unwrap();
    transport.add_pv("FORCED", vec![0.0f64; 32]).unwrap();
    let registry = registry_for(
        &transport,
        ClientConfig::default()
            .preemptive(false)
            .auto_monitor_max_elements(8),
    );
    let context = registry.create_context(false);
    let scalar = context.get_pv("SCALAR", PvOptions::default()).unwrap();
    let waveform = context.get_pv("WAVEFORM", PvOptions::default()).unwrap();
    let forced = context
        .get_pv(
            "FORCED",
            PvOptions {
                auto_monitor: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
    for pv in [&scalar, &waveform, &forced] {
        pv.wait_for_connection(None).unwrap();
    }
    assert_eq!(transport.monitor_count("SCALAR"), 1);
    assert_eq!(transport.monitor_count("WAVEFORM"), 0);
    assert_eq!(transport.monitor_count("FORCED"), 1);
    registry.shutdown();
    assert_eq!(transport.monitor_count("SCALAR"), 0);
    assert_eq!(transport.channel_count(), 0);
}

#[test]
fn every_type_round_trips() {
    init_logging();
    let transport = MemoryTransport::new();
    let modes = transport.add_pv("ENUM", DbrValue::Enum(vec![0])).unwrap();
    modes.set_enum_strings(&["Off", "On"]);
    let cases: Vec<(&str, DbrValue, Value, Value)> = vec![
        ("CHAR", 5i8.into(), Value::Integer(-7), Value::Integer(-7)),
        ("INT", 5i16.into(), Value::Integer(-300), Value::Integer(-300)),
        ("LONG", 5i32.into(), Value::Integer(70000), Value::Integer(70000)),
        ("FLOAT", 1.0f32.into(), Value::Float(2.25), Value::Float(2.25)),
        ("DOUBLE", 1.0f64.into(), Value::Float(-0.125), Value::Float(-0.125)),
        ("STRING", "hello".into(), "world".into(), "world".into()),
        ("ENUM", DbrValue::Enum(vec![0]), Value::Integer(1), Value::Enum(1)),
        (
            "LONGS",
            vec![1i32, 2, 3].into(),
            Value::Array(DbrValue::Long(vec![4, 5, 6])),
            Value::Array(DbrValue::Long(vec![4, 5, 6])),
        ),
        (
            "DOUBLES",
            vec![0.0f64; 2].into(),
            Value::List(vec![0.5, 1.5]),
            Value::Array(DbrValue::Double(vec![0.5, 1.5])),
        ),
        (
            "STRINGS",
            DbrValue::String(vec!["a".into(), "b".into()]),
            Value::Strings(vec!["c".into(), "d".into()]),
            Value::Strings(vec!["c".into(), "d".into()]),
        ),
        (
            "TEXT",
            vec![0i8; 16].into(),
            "some text".into(),
            "some text".into(),
        ),
    ];
    for (name, initial, _, _) in &cases {
        if *name != "ENUM" {
            transport.add_pv(name, initial.clone()).unwrap();
        }
    }
    let (registry, context) = quiet_context(&transport);
    for (name, _, written, expected) in cases {
        let channel = context.wait_for_connect(name, None).unwrap();
        assert_eq!(
            context.put(&channel, written, true, None, None),
            Ok(PutOutcome::Done),
            "writing {name}"
        );
        let reading = ready(
            context
                .get(&channel, DecodeMode::Native, 0, true, None)
                .unwrap(),
        );
        assert_eq!(reading.value, expected, "reading {name}");
    }
    registry.shutdown();
}

#[test]
fn timeouts_are_honoured() {
    init_logging();
    let transport = MemoryTransport::new();
    let stuck = transport.add_pv("STUCK", 1i32).unwrap();
    let (registry, context) = quiet_context(&transport);
    let channel = context.wait_for_connect("STUCK", None).unwrap();
    stuck.set_responsive(false);

    let start = Instant::now();
    let result = context.get(
        &channel,
        DecodeMode::Time,
        0,
        true,
        Some(Duration::from_millis(100)),
    );
    let elapsed = start.elapsed();
    assert!(matches!(result, Err(CaError::Timeout { .. })));
    assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_secs(1));

    let start = Instant::now();
    let result = context.put(&channel, 2, true, Some(Duration::from_millis(100)), None);
    assert!(matches!(result, Err(CaError::Timeout { operation: "put", .. })));
    assert!(start.elapsed() < Duration::from_secs(1));

    // A callback put never blocks, even when asked to wait
    let start = Instant::now();
    let outcome = context.put(
        &channel,
        3,
        true,
        Some(Duration::from_secs(5)),
        Some(Box::new(|_: &str, _: Result<(), CaError>| ())),
    );
    assert_eq!(outcome, Ok(PutOutcome::Sent));
    assert!(start.elapsed() < Duration::from_secs(1));
    registry.shutdown();
}

#[test]
fn unsubscribing_twice_is_harmless() {
    init_logging();
    let transport = MemoryTransport::new();
    transport.add_pv("TEST", 1i32).unwrap();
    let (registry, context) = quiet_context(&transport);
    let channel = context.wait_for_connect("TEST", None).unwrap();
    let subscription = context
        .subscribe(&channel, DecodeMode::Time, MonitorMask::default(), |_, _| ())
        .unwrap();
    assert_eq!(transport.monitor_count("TEST"), 1);
    subscription.unsubscribe();
    subscription.clone().unsubscribe();
    assert!(!subscription.is_active());
    assert_eq!(transport.monitor_count("TEST"), 0);
    assert_eq!(context.subscription_count("TEST"), 0);
    registry.shutdown();
}

#[test]
fn group_completes_together() {
    init_logging();
    let transport = MemoryTransport::with_latency(Duration::from_millis(2));
    transport.add_pv("X", 1.0f64).unwrap();
    transport.add_pv("Y", "ready").unwrap();
    let z = transport.add_pv("Z", 0i16).unwrap();
    let (registry, context) = quiet_context(&transport);
    let x = context.wait_for_connect("X", None).unwrap();
    let y = context.wait_for_connect("Y", None).unwrap();
    let z_channel = context.wait_for_connect("Z", None).unwrap();

    let group = context.create_group().unwrap();
    let x_slot = group.get(&x, DecodeMode::Time, 0).unwrap();
    let y_slot = group.get(&y, DecodeMode::Native, 0).unwrap();
    group.put(&z_channel, "12").unwrap();
    group.block(Duration::from_secs(1)).unwrap();
    assert_eq!(group.value(x_slot).unwrap().value, Value::Float(1.0));
    assert_eq!(
        group.value(y_slot).unwrap().value,
        Value::String("ready".into())
    );
    assert_eq!(z.load(), DbrValue::Int(vec![12]));
    group.delete();
    registry.shutdown();
}

#[test]
fn blocking_inside_callbacks_is_refused() {
    init_logging();
    let transport = MemoryTransport::new();
    transport.add_pv("TEST", 1i32).unwrap();
    let (registry, context) = quiet_context(&transport);
    let channel = context.wait_for_connect("TEST", None).unwrap();
    let outcome = Arc::new(Mutex::new(None));
    let sink = outcome.clone();
    let inner = context.clone();
    context
        .subscribe(&channel, DecodeMode::Time, MonitorMask::default(), move |_, _| {
            *sink.lock().unwrap() = Some(inner.pend_event(Duration::from_millis(1)));
        })
        .unwrap();
    context.pend_event(Duration::from_millis(10)).unwrap();
    assert_eq!(
        *outcome.lock().unwrap(),
        Some(Err(CaError::InsideCallback {
            operation: "pend_event"
        }))
    );
    registry.shutdown();
}

#[test]
fn preemptive_contexts_deliver_without_polling() {
    init_logging();
    let transport = MemoryTransport::new();
    let source = transport.add_pv("TEST", 0i32).unwrap();
    let registry = registry_for(&transport, ClientConfig::default());
    let context = registry.create_context(true);
    let channel = context.wait_for_connect("TEST", None).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    context
        .subscribe(&channel, DecodeMode::Native, MonitorMask::default(), move |_, r| {
            sink.lock().unwrap().push(r.value.clone())
        })
        .unwrap();
    source.store(9).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !seen.lock().unwrap().contains(&Value::Integer(9)) {
        assert!(Instant::now() < deadline, "Update never delivered");
        thread::sleep(Duration::from_millis(1));
    }
    registry.destroy(&context);
    assert!(context.is_destroyed());
}

#[tokio::test]
async fn typed_update_stream() {
    init_logging();
    let transport = MemoryTransport::new();
    let source = transport.add_pv("SETPOINT", 1.0f64).unwrap();
    let registry = registry_for(&transport, ClientConfig::default());
    let context = registry.create_context(true);
    let pv = context.get_pv("SETPOINT", PvOptions::default()).unwrap();
    pv.wait_for_connection(None).unwrap();
    let mut updates = pv.updates::<f64>().unwrap();
    source.store(2.5f64).unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if updates.recv().await.unwrap() == 2.5 {
                break;
            }
        }
    })
    .await;
    assert!(received.is_ok(), "Did not get update");
    registry.shutdown();
}
