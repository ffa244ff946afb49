use std::{sync::Arc, thread, time::Duration};

use clap::Parser;
use epicars_runtime::{
    ClientConfig, ContextRegistry, PvOptions, pv::UpdateRecvError, transport::MemoryTransport,
};

use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

#[derive(Parser)]
struct Options {
    /// PV name to monitor
    #[clap(default_value = "DEMO:TEMP", id = "PV_NAME")]
    name: String,
    /// Stop after this many updates
    #[clap(short = 'n', long, default_value_t = 10)]
    count: usize,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// An in-process server whose record drifts every `period`
fn drifting_server(name: &str, period: Duration) -> MemoryTransport {
    let server = MemoryTransport::new();
    let record = server.add_pv(name, 20.0f64).unwrap();
    record.set_units("degC");
    thread::spawn(move || {
        let mut step = 0u32;
        loop {
            thread::sleep(period);
            step += 1;
            let value = 20.0 + f64::from(step % 20) * 0.25;
            if value > 24.0 {
                record.set_alarm(3, 1);
            } else {
                record.set_alarm(0, 0);
            }
            if record.store(value).is_err() {
                break;
            }
        }
    });
    server
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() {
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
                0 => LevelFilter::INFO,
                1 => LevelFilter::DEBUG,
                2.. => LevelFilter::TRACE,
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

    let server = drifting_server(&opts.name, Duration::from_millis(250));
    let registry = ContextRegistry::new(ClientConfig::default(), move || {
        Arc::new(server.clone())
    });
    let context = registry.create_context(true);
    let pv = context.get_pv(&opts.name, PvOptions::default()).unwrap();
    pv.wait_for_connection(None).unwrap();
    info!("Monitoring {} ({:?})", pv.name(), pv.native_type());

    let mut updates = pv.updates::<f64>().unwrap();
    let mut seen = 0;
    while seen < opts.count {
        match updates.recv().await {
            Ok(value) => {
                seen += 1;
                let units = pv.units().unwrap_or_default();
                println!(
                    "{:<20} {value:.2} {units}  severity={}",
                    pv.name(),
                    pv.severity().unwrap_or(0)
                );
            }
            Err(UpdateRecvError::Lagged(n)) => warn!("Missed {n} updates"),
            Err(e) => {
                println!("Lost PV {}: {e}", opts.name);
                break;
            }
        }
    }
    registry.shutdown();
}
