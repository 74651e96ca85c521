use std::{
    sync::{Arc, Mutex, mpsc},
    time::{Duration, Instant},
};

use pvlink::{
    Channel, ChannelFactory, ConnectionError, ConnectionEvent, ConnectionState, Context,
    ContextConfig, GetError, MonitorError, PutError, PvServer,
    dbr::{DbrBasicType, DbrValue},
    protocol::{ErrorCondition, MonitorMask},
    records::ChannelRecord,
    transform::LinearTransform,
    transport::{InprocBus, InprocTransport},
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

const TIMEOUT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

/// A server and a client context sharing a private bus
fn server_and_context() -> (InprocBus, PvServer, Context) {
    init_logging();
    let bus = InprocBus::new();
    let server = PvServer::with_host_name(&bus, "sim");
    let transport = InprocTransport::new(bus.clone()).max_search_interval(Duration::from_millis(200));
    let context = Context::with_transport(
        Arc::new(transport),
        ContextConfig::from_env().io_timeout(TIMEOUT),
    );
    (bus, server, context)
}

fn connected(name: &str, context: &Context) -> Arc<Channel> {
    let channel = Channel::new(name, context);
    assert!(channel.connect_and_wait(TIMEOUT), "{name} did not connect");
    channel
}

#[test]
fn channels_share_one_native_channel() {
    let (_bus, server, context) = server_and_context();
    server
        .register_pv("Magnet1:I", 1.0f64, DbrBasicType::Double)
        .unwrap();

    let a = connected("Magnet1:I", &context);
    let b = connected("Magnet1:I", &context);
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(context.cache().len(), 1);
    assert!(context.cache().contains("Magnet1:I"));

    drop(a);
    assert!(context.cache().contains("Magnet1:I"));
    assert_eq!(b.get_value::<f64>().unwrap(), 1.0);
    drop(b);
    assert!(context.cache().is_empty());

    let factory = ChannelFactory::new(context.clone());
    let c = factory.channel_for("Magnet1:I");
    let d = factory.channel_for("Magnet1:I");
    assert!(Arc::ptr_eq(&c, &d));
}

#[test]
fn connect_to_missing_pv_is_bounded() {
    let (_bus, _server, context) = server_and_context();
    let channel = Channel::new("Nowhere:PV", &context);
    channel.set_io_timeout(Duration::from_millis(200));

    let start = Instant::now();
    assert!(!channel.connect_and_wait(Duration::from_millis(300)));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(channel.connection_state(), ConnectionState::Connecting);
    assert!(!channel.has_ever_been_connected());

    assert_eq!(
        channel.check_connection(),
        Err(ConnectionError::NotConnected("Nowhere:PV".into()))
    );
    assert!(matches!(
        channel.get_value::<f64>(),
        Err(GetError::Connection(ConnectionError::NotConnected(_)))
    ));
    assert!(matches!(
        channel.element_count(),
        Err(ConnectionError::NeverConnected(_))
    ));
}

#[test]
fn put_is_visible_to_the_next_get() {
    let (_bus, server, context) = server_and_context();
    server
        .register_pv("Magnet1:I", 0.0f64, DbrBasicType::Double)
        .unwrap();
    let channel = connected("Magnet1:I", &context);

    for value in [4.5, -1.25, 30.0] {
        channel.put_val(value).unwrap();
        assert_eq!(channel.get_value::<f64>().unwrap(), value);
    }
    // Strings written to numeric PVs are parsed
    channel.put_val("7.25").unwrap();
    assert_eq!(channel.get_value::<f64>().unwrap(), 7.25);
    assert!(matches!(
        channel.put_val("seven"),
        Err(PutError::Rejected {
            condition: ErrorCondition::NoConvert,
            ..
        })
    ));
    assert_eq!(server.pv("Magnet1:I").unwrap().load(), DbrValue::Double(vec![7.25]));
}

#[test]
fn array_write_reads_back_exactly() {
    let (_bus, server, context) = server_and_context();
    server
        .register_pv("BPM01:xArr", vec![0.0f64, 0.0], DbrBasicType::Double)
        .unwrap();
    let channel = connected("BPM01:xArr", &context);
    assert_eq!(channel.element_count().unwrap(), 2);
    assert_eq!(channel.element_type().unwrap(), DbrBasicType::Double);

    channel.put_val(vec![1.0f64, 2.0]).unwrap();
    assert_eq!(channel.get_array::<f64>().unwrap(), vec![1.0, 2.0]);
}

#[test]
fn metadata_and_control_info() {
    let (_bus, server, context) = server_and_context();
    let pv = server
        .register_pv("Magnet1:I", 3.0f64, DbrBasicType::Double)
        .unwrap();
    pv.set_limits(0.0, 50.0);
    pv.set_units("A");
    pv.set_precision(3);
    server
        .register_pv("Mode", DbrValue::Enum(1), DbrBasicType::Enum)
        .unwrap();

    let channel = connected("Magnet1:I", &context);
    assert_eq!(channel.host_name().unwrap(), "sim");
    assert!(channel.read_access().unwrap());
    assert!(channel.write_access().unwrap());
    assert_eq!(channel.units().unwrap(), "A");
    assert_eq!(channel.precision().unwrap(), 3);
    assert_eq!(channel.display_limits().unwrap(), (0.0, 50.0));
    assert_eq!(channel.alarm_limits().unwrap(), (0.0, 50.0));
    assert_eq!(channel.warning_limits().unwrap(), (0.0, 50.0));
    assert_eq!(channel.control_limits().unwrap(), (0.0, 50.0));
    assert_eq!(
        channel.warning_limit_pvs(),
        ["Magnet1:I.LOW".to_string(), "Magnet1:I.HIGH".to_string()]
    );

    let time = channel.get_raw_time_record().unwrap();
    assert_eq!(time.double_value().unwrap(), 3.0);
    assert!(time.time_in_seconds() > 0.0);
    let status = channel.get_raw_status_record().unwrap();
    assert_eq!(status.severity(), 0);

    let mode = connected("Mode", &context);
    assert!(matches!(
        mode.control_info(),
        Err(GetError::NoControlRecord(_))
    ));
}

#[test]
fn read_only_pvs_refuse_puts() {
    let (_bus, server, context) = server_and_context();
    let pv = server
        .register_pv("Ring:Freq", 1.0f64, DbrBasicType::Double)
        .unwrap();
    pv.set_read_only(true);
    let channel = connected("Ring:Freq", &context);
    assert!(!channel.write_access().unwrap());
    assert_eq!(
        channel.put_val(2.0f64),
        Err(PutError::NoWriteAccess("Ring:Freq".into()))
    );
}

#[test]
fn callback_and_async_requests() {
    let (_bus, server, context) = server_and_context();
    server
        .register_pv("Magnet1:I", 2.0f64, DbrBasicType::Double)
        .unwrap();
    let channel = connected("Magnet1:I", &context);

    let (tx, rx) = mpsc::channel();
    channel
        .get_raw_value_callback(Some(Box::new(
            move |result: Result<ChannelRecord, GetError>| tx.send(result).unwrap(),
        )))
        .unwrap();
    let record: ChannelRecord = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(record.double_value().unwrap(), 2.0);
    // Exactly once
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    let (tx, rx) = mpsc::channel();
    channel
        .put_raw_val_callback(
            9.0f64,
            Some(Box::new(move |result: Result<(), PutError>| {
                tx.send(result).unwrap()
            })),
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ok(()));

    // No listener waits for outstanding IO instead
    channel.get_raw_value_time_callback(None).unwrap();

    let pending = channel.get_raw_time_record_async().unwrap();
    assert_eq!(pending.wait(TIMEOUT).unwrap().double_value().unwrap(), 9.0);
    channel.put_val_async(10.0f64).unwrap().wait(TIMEOUT).unwrap();
    let pending = channel.get_raw_value_record_async().unwrap();
    assert_eq!(pending.wait(TIMEOUT).unwrap().double_value().unwrap(), 10.0);
}

#[test]
fn monitor_delivers_then_stops_after_clear() {
    let (_bus, server, context) = server_and_context();
    let pv = server
        .register_pv("Magnet1:I", 0.0f64, DbrBasicType::Double)
        .unwrap();
    let channel = connected("Magnet1:I", &context);

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let monitor = channel
        .add_monitor_val_time(
            move |record| {
                let _ = tx.lock().unwrap().send(record.double_value().unwrap());
            },
            MonitorMask::default(),
        )
        .unwrap();
    assert!(monitor.is_active());
    assert_eq!(monitor.channel_name(), "Magnet1:I");
    // The current value arrives first
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 0.0);
    pv.store(5.0f64).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 5.0);
    channel.put_val(6.0f64).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 6.0);

    monitor.clear();
    monitor.clear();
    assert!(!monitor.is_active());
    pv.store(7.0f64).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn monitor_flavors_and_masks() {
    let (_bus, server, context) = server_and_context();
    let pv = server
        .register_pv("Magnet1:I", 1.0f64, DbrBasicType::Double)
        .unwrap();
    let channel = connected("Magnet1:I", &context);

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let _value = channel
        .add_monitor_value(
            move |record| {
                let _ = tx.lock().unwrap().send(record.double_value().unwrap());
            },
            MonitorMask::VALUE,
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 1.0);

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let _alarms = channel
        .add_monitor_val_status(
            move |record| {
                let _ = tx.lock().unwrap().send(record.severity());
            },
            MonitorMask::ALARM,
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 0);
    // A value change is not an alarm change
    pv.store(2.0f64).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    pv.set_status(pvlink::dbr::Status {
        status: 3,
        severity: 2,
    });
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 2);

    assert!(matches!(
        channel.add_monitor_value(|_| (), MonitorMask::empty()),
        Err(MonitorError::Rejected {
            condition: ErrorCondition::BadMask,
            ..
        })
    ));
}

#[test]
fn connection_listeners_follow_the_server() {
    let (bus, server, context) = server_and_context();
    server
        .register_pv("Magnet1:I", 1.0f64, DbrBasicType::Double)
        .unwrap();
    let channel = Channel::new("Magnet1:I", &context);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    channel.add_connection_listener(move |event| {
        let _ = tx.lock().unwrap().send(event);
    });
    assert!(channel.connect_and_wait(TIMEOUT));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ConnectionEvent::Made);

    server.destroy();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ConnectionEvent::Dropped);
    assert!(!channel.is_connected());
    assert!(channel.has_ever_been_connected());
    // Metadata from the last connection is kept
    assert_eq!(channel.element_count().unwrap(), 1);

    // A new server with the same PV brings the channel back
    let replacement = PvServer::with_host_name(&bus, "sim2");
    replacement
        .register_pv("Magnet1:I", 8.0f64, DbrBasicType::Double)
        .unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ConnectionEvent::Made);
    assert_eq!(channel.get_value::<f64>().unwrap(), 8.0);
    assert_eq!(channel.host_name().unwrap(), "sim2");
}

#[test]
fn disconnect_then_reconnect() {
    let (_bus, server, context) = server_and_context();
    server
        .register_pv("Magnet1:I", 1.0f64, DbrBasicType::Double)
        .unwrap();
    let channel = connected("Magnet1:I", &context);

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    // Already connected, so this fires straight away
    let id = channel.add_connection_listener(move |event| {
        let _ = tx.lock().unwrap().send(event);
    });
    assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::Made);

    channel.disconnect();
    assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::Dropped);
    assert_eq!(channel.connection_state(), ConnectionState::Unconnected);
    assert!(channel.has_ever_been_connected());
    assert!(!context.cache().contains("Magnet1:I"));
    // Disconnecting twice is harmless
    channel.disconnect();

    channel.request_connection().unwrap();
    assert!(channel.connect_and_wait(TIMEOUT));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ConnectionEvent::Made);
    assert_eq!(channel.get_value::<f64>().unwrap(), 1.0);

    channel.remove_connection_listener(id);
    channel.disconnect();
    assert!(rx.try_recv().is_err());
}

#[test]
fn debug_mode_keeps_channels_offline() {
    let (_bus, server, context) = server_and_context();
    server
        .register_pv("Magnet1:I", 1.0f64, DbrBasicType::Double)
        .unwrap();
    context.set_debug_mode(true).unwrap();
    let channel = Channel::new("Magnet1:I", &context);
    assert_eq!(
        channel.request_connection(),
        Err(ConnectionError::NotInitialized)
    );
    assert!(!channel.connect_and_wait(Duration::from_millis(100)));

    context.set_debug_mode(false).unwrap();
    assert!(channel.connect_and_wait(TIMEOUT));
}

#[test]
fn unnamed_channels_never_connect() {
    let (_bus, _server, context) = server_and_context();
    let channel = Channel::new("", &context);
    channel.request_connection().unwrap();
    assert_eq!(channel.connection_state(), ConnectionState::Unconnected);
    assert!(!channel.connect_and_wait(Duration::from_millis(50)));
    assert!(context.cache().is_empty());
}

#[test]
fn clear_waits_for_a_running_delivery() {
    let (_bus, server, context) = server_and_context();
    let pv = server
        .register_pv("Magnet1:I", 0.0f64, DbrBasicType::Double)
        .unwrap();
    let channel = connected("Magnet1:I", &context);

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let monitor = {
        let delivered = delivered.clone();
        channel
            .add_monitor_value(
                move |record| {
                    let value = record.double_value().unwrap();
                    let _ = entered_tx.lock().unwrap().send(value);
                    // Hold the second delivery until the test lets it go
                    if value == 1.0 {
                        let _ = release_rx.lock().unwrap().recv();
                    }
                    delivered.lock().unwrap().push((value, Instant::now()));
                },
                MonitorMask::VALUE,
            )
            .unwrap()
    };
    assert_eq!(entered_rx.recv_timeout(TIMEOUT).unwrap(), 0.0);
    pv.store(1.0f64).unwrap();
    assert_eq!(entered_rx.recv_timeout(TIMEOUT).unwrap(), 1.0);

    let monitor = Arc::new(monitor);
    let clearer = {
        let monitor = monitor.clone();
        std::thread::spawn(move || {
            monitor.clear();
            Instant::now()
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    assert!(!clearer.is_finished(), "clear returned mid-delivery");
    assert!(!monitor.is_active());

    release_tx.send(()).unwrap();
    let cleared_at = clearer.join().unwrap();
    let (last, finished_at) = *delivered.lock().unwrap().last().unwrap();
    assert_eq!(last, 1.0);
    assert!(finished_at <= cleared_at);

    let count = delivered.lock().unwrap().len();
    for value in [2.0, 3.0, 4.0] {
        pv.store(value).unwrap();
    }
    assert!(entered_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(delivered.lock().unwrap().len(), count);
}

#[test]
fn slow_sink_still_sees_the_latest_value() {
    let (_bus, server, context) = server_and_context();
    let pv = server
        .register_pv("Magnet1:I", 0.0f64, DbrBasicType::Double)
        .unwrap();
    let channel = connected("Magnet1:I", &context);

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let _monitor = channel
        .add_monitor_value(
            move |record| {
                let value = record.double_value().unwrap();
                if value == 0.0 {
                    let _ = release_rx.lock().unwrap().recv();
                }
                let _ = tx.lock().unwrap().send(value);
            },
            MonitorMask::VALUE,
        )
        .unwrap();

    let overflow = pvlink::providers::memory::EVENT_QUEUE_CAPACITY * 2;
    for i in 1..=overflow {
        pv.store(i as f64).unwrap();
    }
    release_tx.send(()).unwrap();

    let mut seen = Vec::new();
    while let Ok(value) = rx.recv_timeout(Duration::from_millis(500)) {
        seen.push(value);
        if value == overflow as f64 {
            break;
        }
    }
    assert_eq!(seen.last(), Some(&(overflow as f64)));
    assert!(seen.len() <= overflow);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn panicking_callbacks_leave_the_channel_usable() {
    let (_bus, server, context) = server_and_context();
    let pv = server
        .register_pv("Magnet1:I", 1.0f64, DbrBasicType::Double)
        .unwrap();
    let channel = connected("Magnet1:I", &context);

    channel
        .put_raw_val_callback(
            2.0f64,
            Some(Box::new(|_: Result<(), PutError>| panic!("put listener"))),
        )
        .unwrap();
    channel
        .get_raw_value_callback(Some(Box::new(|_: Result<ChannelRecord, GetError>| {
            panic!("get listener")
        })))
        .unwrap();
    let monitor = channel
        .add_monitor_value(|_: ChannelRecord| panic!("monitor sink"), MonitorMask::VALUE)
        .unwrap();
    pv.store(3.0f64).unwrap();

    // Later requests on the same circuit still complete
    let start = Instant::now();
    while channel.get_value::<f64>().unwrap() != 3.0 {
        assert!(start.elapsed() < TIMEOUT);
        std::thread::sleep(Duration::from_millis(10));
    }
    channel.put_val(4.0f64).unwrap();
    assert_eq!(channel.get_value::<f64>().unwrap(), 4.0);
    assert!(channel.is_connected());
    assert!(monitor.is_active());
    monitor.clear();
    assert!(context.pend_io(TIMEOUT));
}

#[test]
fn blocking_calls_work_from_spawn_blocking() {
    let (_bus, server, context) = server_and_context();
    server
        .register_pv("Magnet1:I", 8.5f64, DbrBasicType::Double)
        .unwrap();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let value = runtime.block_on(async move {
        tokio::task::spawn_blocking(move || {
            let channel = Channel::new("Magnet1:I", &context);
            assert!(channel.connect_and_wait(TIMEOUT));
            channel.put_val(9.5f64).unwrap();
            let pending = channel.get_raw_value_record_async().unwrap();
            assert_eq!(pending.wait(TIMEOUT).unwrap().double_value().unwrap(), 9.5);
            assert!(context.pend_io(TIMEOUT));
            channel.get_value::<f64>()
        })
        .await
        .unwrap()
    });
    assert_eq!(value, Ok(9.5));
}

#[test]
fn transformed_channel_works_in_physical_units() {
    let (_bus, server, context) = server_and_context();
    let pv = server
        .register_pv("Magnet1:I", 10.0f64, DbrBasicType::Double)
        .unwrap();
    pv.set_limits(0.0, 100.0);
    // physical = 0.5 * raw + 2
    let transform = Arc::new(LinearTransform::new(0.5, 2.0).unwrap());
    let channel = Channel::with_transform("Magnet1:I", &context, transform);
    assert!(channel.connect_and_wait(TIMEOUT));

    assert_eq!(channel.get_value::<f64>().unwrap(), 7.0);
    assert_eq!(channel.get_raw_value_record().unwrap().double_value().unwrap(), 10.0);
    assert_eq!(channel.display_limits().unwrap(), (2.0, 52.0));
    assert_eq!(channel.control_limits().unwrap(), (2.0, 52.0));

    channel.put_val(12.0f64).unwrap();
    assert_eq!(pv.load(), DbrValue::Double(vec![20.0]));
    assert_eq!(channel.get_value_record().unwrap().double_value().unwrap(), 12.0);

    // Raw writes are not converted
    channel.put_raw_val_callback(30.0f64, None).unwrap();
    assert_eq!(pv.load(), DbrValue::Double(vec![30.0]));
    assert_eq!(channel.get_value::<f64>().unwrap(), 17.0);

    let (tx, rx) = mpsc::channel();
    channel
        .get_value_callback(Some(Box::new(
            move |result: Result<ChannelRecord, GetError>| tx.send(result).unwrap(),
        )))
        .unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().unwrap().double_value().unwrap(), 17.0);

    // Plain channels are untouched
    let plain = connected("Magnet1:I", &context);
    assert_eq!(plain.get_value::<f64>().unwrap(), 30.0);
}
