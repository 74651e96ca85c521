use std::{sync::Arc, time::Duration};

use pvlink::{
    Channel, Context, ContextConfig, GetError, PvServer,
    dbr::DbrBasicType,
    naming::DEFAULT_ARRAY_SIZE,
    provisioning::{
        DeviceNode, DeviceType, FIELD_RB_HANDLE, FIELD_SET_HANDLE, NodeFilter,
        PROFILE_MONITOR_SOFT_TYPE, register_node_channels, register_standard_nodes,
    },
    transport::{InprocBus, InprocTransport},
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

const TIMEOUT: Duration = Duration::from_secs(2);

/// A context whose channels search `bus`
fn client_on(bus: &InprocBus) -> Context {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
    Context::with_transport(
        Arc::new(InprocTransport::new(bus.clone())),
        ContextConfig::from_env().io_timeout(TIMEOUT),
    )
}

fn read(context: &Context, name: &str) -> f64 {
    let channel = Channel::new(name, context);
    assert!(channel.connect_and_wait(TIMEOUT), "{name} did not connect");
    channel.get_value().unwrap()
}

#[test]
fn unipolar_magnets_get_limits_on_field_handles() {
    let bus = InprocBus::new();
    let server = PvServer::with_host_name(&bus, "sim");
    let nodes = [
        DeviceNode::new("Magnet1", DeviceType::Quadrupole)
            .channel(FIELD_RB_HANDLE, "Magnet1:I")
            .channel(FIELD_SET_HANDLE, "Magnet1:I_Set")
            .channel("cycleState", "Magnet1:CycleState"),
        DeviceNode::new("Magnet2", DeviceType::Quadrupole)
            .status(false)
            .channel(FIELD_RB_HANDLE, "Magnet2:I"),
    ];
    let report = register_node_channels(
        &server,
        &nodes,
        &NodeFilter::kind(DeviceType::Quadrupole),
    )
    .unwrap();
    assert_eq!(
        report.registered,
        vec!["Magnet1:CycleState", "Magnet1:I", "Magnet1:I_Set"]
    );
    // Every scalar gets its eight limit PVs
    assert_eq!(report.limit_pvs, 24);

    let context = client_on(&bus);
    for name in ["Magnet1:I", "Magnet1:I_Set"] {
        let channel = Channel::new(name, &context);
        assert!(channel.connect_and_wait(TIMEOUT));
        assert_eq!(channel.display_limits().unwrap(), (0.0, 50.0));
        assert_eq!(channel.alarm_limits().unwrap(), (0.0, 50.0));
        assert_eq!(channel.warning_limits().unwrap(), (0.0, 50.0));
        assert_eq!(channel.control_limits().unwrap(), (0.0, 50.0));
        assert_eq!(channel.units().unwrap(), "units");

        let [lopr, hopr] = channel.operation_limit_pvs();
        assert_eq!(read(&context, &lopr), 0.0);
        assert_eq!(read(&context, &hopr), 50.0);
        let [_, drvh] = channel.drive_limit_pvs();
        assert_eq!(read(&context, &drvh), 50.0);
        let [low, high] = channel.warning_limit_pvs();
        assert_eq!(read(&context, &low), 0.0);
        assert_eq!(read(&context, &high), 0.0);
    }

    let unrelated = Channel::new("Magnet1:CycleState", &context);
    assert!(unrelated.connect_and_wait(TIMEOUT));
    assert_eq!(unrelated.control_limits().unwrap(), (0.0, 0.0));
    assert_eq!(read(&context, "Magnet1:CycleState.HOPR"), 0.0);
    // Devices switched off are not served
    assert!(server.pv("Magnet2:I").is_none());
}

#[test]
fn standard_nodes_serve_waveforms_and_profile_monitors() {
    let bus = InprocBus::new();
    let server = PvServer::with_host_name(&bus, "sim");
    let nodes = [
        DeviceNode::new("BPM01", DeviceType::Bpm)
            .channel("xAvg", "BPM01:xAvg")
            .channel("xTBT", "BPM01:xTBT")
            .channel("amplitudeAvg", "BPM01:amplitudeAvg"),
        DeviceNode::new("WS01", DeviceType::ProfileMonitor)
            .soft_type(PROFILE_MONITOR_SOFT_TYPE)
            .channel("hSigmaM", "WS01:hSigmaM")
            .channel("vSigmaM", "WS01:vSigmaM")
            .channel("position", "WS01:Position"),
        DeviceNode::new("WS02", DeviceType::ProfileMonitor)
            .soft_type("Version 0.9")
            .channel("hSigmaM", "WS02:hSigmaM"),
    ];
    let timing = DeviceNode::new("TimingCenter", DeviceType::TimingCenter)
        .channel("ringFreq", "Ring:Freq")
        .unbound_handle("triggerEvent");
    let report = register_standard_nodes(&server, &nodes, Some(&timing)).unwrap();

    assert!(report.registered.contains(&"BPM01:xTBT".to_string()));
    assert!(report.registered.contains(&"WS01:hSigmaM".to_string()));
    assert!(report.registered.contains(&"Ring:Freq".to_string()));
    assert!(!report.registered.contains(&"WS01:Position".to_string()));
    assert!(server.pv("WS02:hSigmaM").is_none());
    assert!(
        report
            .skipped
            .contains(&("WS01".to_string(), "hSigmaF".to_string()))
    );
    assert!(
        report
            .skipped
            .contains(&("TimingCenter".to_string(), "triggerEvent".to_string()))
    );

    let context = client_on(&bus);
    let tbt = Channel::new("BPM01:xTBT", &context);
    assert!(tbt.connect_and_wait(TIMEOUT));
    assert_eq!(tbt.element_count().unwrap(), DEFAULT_ARRAY_SIZE);
    assert_eq!(tbt.get_array::<f64>().unwrap().len(), DEFAULT_ARRAY_SIZE);
    // Waveforms get no limit PVs
    assert!(server.pv("BPM01:xTBT.HOPR").is_none());

    let amplitude = Channel::new("BPM01:amplitudeAvg", &context);
    assert!(amplitude.connect_and_wait(TIMEOUT));
    assert_eq!(amplitude.element_count().unwrap(), 1);
    assert_eq!(amplitude.display_limits().unwrap(), (0.0, 50.0));

    let position = Channel::new("BPM01:xAvg", &context);
    assert!(position.connect_and_wait(TIMEOUT));
    assert_eq!(position.display_limits().unwrap(), (-1000.0, 1000.0));

    let sigma = Channel::new("WS01:hSigmaM", &context);
    assert!(sigma.connect_and_wait(TIMEOUT));
    assert_eq!(sigma.display_limits().unwrap(), (0.0, 0.0));
}

#[test]
fn destroyed_server_drops_clients() {
    let bus = InprocBus::new();
    let server = PvServer::with_host_name(&bus, "sim");
    let pv = server
        .register_pv("Magnet1:I", 12.0f64, DbrBasicType::Double)
        .unwrap();
    let context = client_on(&bus);
    let channel = Channel::new("Magnet1:I", &context);
    assert!(channel.connect_and_wait(TIMEOUT));
    assert_eq!(channel.get_value::<f64>().unwrap(), 12.0);

    server.destroy();
    let deadline = std::time::Instant::now() + TIMEOUT;
    while channel.is_connected() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!channel.is_connected());
    // Handles keep working locally
    pv.store(13.0f64).unwrap();
    channel.set_io_timeout(Duration::from_millis(300));
    assert!(matches!(channel.get_value::<f64>(), Err(GetError::Connection(_))));
    assert!(channel.has_ever_been_connected());
    assert_eq!(bus.server_count(), 0);
}
