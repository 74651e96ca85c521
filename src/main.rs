use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use pvlink::{
    Channel, ConnectionEvent, Context, ContextConfig, PvServer,
    dbr::DbrValue,
    protocol::MonitorMask,
    provisioning::{
        DeviceNode, DeviceType, FIELD_RB_HANDLE, FIELD_SET_HANDLE, PROFILE_MONITOR_SOFT_TYPE,
        register_standard_nodes,
    },
    records::ChannelTimeRecord,
    transport::{InprocBus, InprocTransport},
};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

#[derive(Parser)]
#[command(version, about = "Serve a simulated sequence and talk to it through channels")]
struct Options {
    #[command(subcommand)]
    command: Command,
    /// Seconds to wait for connections and replies
    #[clap(short, long, default_value_t = 2.0)]
    timeout: f64,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// List every simulated PV
    List,
    /// Read PVs
    Get {
        #[clap(required = true, id = "PV_NAME")]
        names: Vec<String>,
    },
    /// Write a value, then read it back
    Put {
        #[clap(id = "PV_NAME")]
        name: String,
        value: String,
    },
    /// Watch a PV while the simulation ramps it
    Monitor {
        #[clap(id = "PV_NAME")]
        name: String,
        /// Seconds to watch for
        #[clap(short, long, default_value_t = 3.0)]
        duration: f64,
    },
}

fn sequence() -> (Vec<DeviceNode>, DeviceNode) {
    let nodes = vec![
        DeviceNode::new("QH01", DeviceType::Quadrupole)
            .channel(FIELD_RB_HANDLE, "QH01:B")
            .channel(FIELD_SET_HANDLE, "QH01:B_Set"),
        DeviceNode::new("QV02", DeviceType::TrimmedQuadrupole)
            .channel(FIELD_RB_HANDLE, "QV02:B")
            .channel(FIELD_SET_HANDLE, "QV02:B_Set")
            .channel("trimSet", "QV02:B_TrimSet"),
        DeviceNode::new("DCH01", DeviceType::HDipoleCorr)
            .channel(FIELD_RB_HANDLE, "DCH01:B")
            .channel(FIELD_SET_HANDLE, "DCH01:B_Set"),
        DeviceNode::new("BPM01", DeviceType::Bpm)
            .channel("xAvg", "BPM01:xAvg")
            .channel("amplitudeAvg", "BPM01:amplitudeAvg")
            .channel("xTBT", "BPM01:xTBT"),
        DeviceNode::new("WS01", DeviceType::ProfileMonitor)
            .soft_type(PROFILE_MONITOR_SOFT_TYPE)
            .channel("hSigmaM", "WS01:hSigmaM")
            .channel("vSigmaM", "WS01:vSigmaM")
            .channel("hSigmaF", "WS01:hSigmaF")
            .channel("vSigmaF", "WS01:vSigmaF"),
    ];
    let timing = DeviceNode::new("TimingCenter", DeviceType::TimingCenter)
        .channel("ringFreq", "Ring_Diag:BCM_D09:ringFreq")
        .channel("triggerEvent", "Ring_Diag:BCM_D09:trigEvent");
    (nodes, timing)
}

fn parse_value(text: &str) -> DbrValue {
    let numbers: Result<Vec<f64>, _> = text.split_whitespace().map(str::parse).collect();
    match numbers {
        Ok(numbers) if !numbers.is_empty() => DbrValue::Double(numbers),
        _ => DbrValue::from(text),
    }
}

fn print_time_record(name: &str, record: &ChannelTimeRecord) {
    println!(
        "{name} {:.6} {} (status {}, severity {})",
        record.time_in_seconds(),
        record.string_value(),
        record.status(),
        record.severity()
    );
}

fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    let filter = EnvFilter::default()
        .add_directive(
            match opts.verbose {
                0 => LevelFilter::WARN,
                1 => LevelFilter::INFO,
                2 => LevelFilter::DEBUG,
                3.. => LevelFilter::TRACE,
            }
            .into(),
        )
        .add_directive("tokio=off".parse().unwrap())
        .add_directive("runtime=off".parse().unwrap());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_filter(filter);
    let subscriber = tracing_subscriber::registry().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global subscriber");

    let timeout = Duration::from_secs_f64(opts.timeout.max(0.0));
    let bus = InprocBus::new();
    let server = PvServer::new(&bus);
    let (nodes, timing) = sequence();
    let report = match register_standard_nodes(&server, &nodes, Some(&timing)) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Could not provision the simulated sequence: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "Serving {} PVs from {}",
        report.registered.len() + report.limit_pvs,
        server.host_name()
    );

    let context = Context::with_transport(
        Arc::new(InprocTransport::new(bus)),
        ContextConfig::from_env().io_timeout(timeout),
    );

    match opts.command {
        Command::List => {
            for name in server.pv_names() {
                println!("{name}");
            }
        }
        Command::Get { names } => {
            for name in names {
                let channel = Channel::new(&name, &context);
                if !channel.connect_and_wait(timeout) {
                    println!("{name}: not connected");
                    continue;
                }
                match channel.get_raw_time_record() {
                    Ok(record) => print_time_record(&name, &record),
                    Err(e) => println!("{name}: {e}"),
                }
            }
        }
        Command::Put { name, value } => {
            let channel = Channel::new(&name, &context);
            if let Err(e) = channel
                .check_connection()
                .map_err(pvlink::PutError::from)
                .and_then(|_| channel.put_val(parse_value(&value)))
            {
                eprintln!("{name}: {e}");
                std::process::exit(1);
            }
            match channel.get_raw_value_record() {
                Ok(record) => println!("{name} {record}"),
                Err(e) => println!("{name}: {e}"),
            }
        }
        Command::Monitor { name, duration } => {
            let channel = Channel::new(&name, &context);
            channel.add_connection_listener({
                let name = name.clone();
                move |event| match event {
                    ConnectionEvent::Made => info!("{name}: connected"),
                    ConnectionEvent::Dropped => println!("Lost connection to PV {name}"),
                }
            });
            let monitor = {
                let name = name.clone();
                channel.add_monitor_val_time(
                    move |record| print_time_record(&name, &record),
                    MonitorMask::default(),
                )
            };
            let monitor = match monitor {
                Ok(monitor) => monitor,
                Err(e) => {
                    eprintln!("{name}: {e}");
                    std::process::exit(1);
                }
            };
            let duration = Duration::from_secs_f64(duration.max(0.0));
            let start = Instant::now();
            let mut step = 0u32;
            while start.elapsed() < duration {
                thread::sleep(Duration::from_millis(500));
                step += 1;
                if let Some(pv) = server.pv(&name)
                    && let Err(e) = pv.store(f64::from(step))
                {
                    warn!("Could not ramp {name}: {e}");
                }
            }
            monitor.clear();
        }
    }
    server.destroy();
}
