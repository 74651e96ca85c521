use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use pvlink::{
    BatchGetRequest, Channel, Context, ContextConfig, GetError, PvServer,
    dbr::DbrBasicType,
    records::ChannelTimeRecord,
    transform::LinearTransform,
    transport::{InprocBus, InprocTransport},
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

const TIMEOUT: Duration = Duration::from_secs(2);

fn server_and_context() -> (PvServer, Context) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
    let bus = InprocBus::new();
    let server = PvServer::with_host_name(&bus, "sim");
    let transport = InprocTransport::new(bus).max_search_interval(Duration::from_millis(100));
    let context = Context::with_transport(
        Arc::new(transport),
        ContextConfig::from_env().io_timeout(TIMEOUT),
    );
    (server, context)
}

#[test]
fn batch_collects_a_result_for_every_channel() {
    let (server, context) = server_and_context();
    server
        .register_pv("Magnet1:I", 1.5f64, DbrBasicType::Double)
        .unwrap();
    server
        .register_pv("Magnet2:I", 4.0f64, DbrBasicType::Double)
        .unwrap();

    let ready = Channel::new("Magnet1:I", &context);
    assert!(ready.connect_and_wait(TIMEOUT));
    // Not connected yet, and converted to physical units
    let scaled = Channel::with_transform(
        "Magnet2:I",
        &context,
        Arc::new(LinearTransform::new(2.0, 0.0).unwrap()),
    );
    let missing = Channel::new("Nowhere:PV", &context);

    let batch: BatchGetRequest =
        BatchGetRequest::new(&[ready.clone(), scaled.clone(), missing.clone(), ready.clone()]);
    assert_eq!(batch.channels().len(), 3);

    let start = Instant::now();
    assert!(!batch.submit_and_wait(Duration::from_millis(500)));
    assert!(start.elapsed() < TIMEOUT);
    assert!(batch.is_complete());

    assert_eq!(batch.record_count(), 2);
    assert_eq!(batch.result_channels(), ["Magnet1:I", "Magnet2:I"]);
    assert_eq!(
        batch.record("Magnet1:I").unwrap().double_value().unwrap(),
        1.5
    );
    assert_eq!(
        batch.record("Magnet2:I").unwrap().double_value().unwrap(),
        8.0
    );
    assert!(batch.has_errors());
    assert_eq!(batch.failed_channels(), ["Nowhere:PV"]);
    assert_eq!(
        batch.error("Nowhere:PV"),
        Some(GetError::Timeout {
            name: "Nowhere:PV".into()
        })
    );
}

#[test]
fn batch_picks_up_channels_that_connect_while_waiting() {
    let (server, context) = server_and_context();
    let late = Channel::new("Magnet3:I", &context);
    let mut batch = BatchGetRequest::<ChannelTimeRecord>::new(&[]);
    batch.add_channel(late.clone());
    batch.submit();
    assert!(!batch.is_complete());

    thread::sleep(Duration::from_millis(100));
    let pv = server
        .register_pv("Magnet3:I", 6.0f64, DbrBasicType::Double)
        .unwrap();
    assert!(batch.wait_for_completion(TIMEOUT));
    assert!(!batch.has_errors());
    assert_eq!(
        batch.record("Magnet3:I").unwrap().double_value().unwrap(),
        6.0
    );

    // A second submit starts over with fresh values
    pv.store(7.0f64).unwrap();
    assert!(batch.submit_and_wait(TIMEOUT));
    assert_eq!(
        batch.record("Magnet3:I").unwrap().double_value().unwrap(),
        7.0
    );
    assert_eq!(batch.record_count(), 1);
}

#[test]
fn empty_batch_is_complete_at_once() {
    let batch: BatchGetRequest = BatchGetRequest::new(&[]);
    assert!(batch.submit_and_wait(Duration::from_millis(10)));
    assert_eq!(batch.record_count(), 0);
    assert!(!batch.has_errors());
}
