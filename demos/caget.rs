use std::sync::Arc;

use clap::Parser;
use epicars_runtime::{
    ClientConfig, ContextRegistry, Value,
    ca::{self, CagetOptions},
    dbr::DbrValue,
    transport::MemoryTransport,
};

use tracing::level_filters::LevelFilter;

#[derive(Parser)]
struct Options {
    /// PV names to read
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Format values as text, with enum labels and display precision
    #[clap(short = 's', long)]
    as_string: bool,
    /// Print a full summary of each PV instead of its value
    #[clap(short = 'i', long)]
    info: bool,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// An in-process server with a few records to read
fn demo_server() -> MemoryTransport {
    let server = MemoryTransport::new();
    if let Ok(temp) = server.add_pv("DEMO:TEMP", 23.4f64) {
        temp.set_units("degC");
        temp.set_precision(1);
        temp.set_limits((0.0, 100.0), (5.0, 80.0), (10.0, 60.0));
    }
    if let Ok(mode) = server.add_pv("DEMO:MODE", DbrValue::Enum(vec![1])) {
        mode.set_enum_strings(&["Idle", "Running", "Fault"]);
    }
    let _ = server.add_pv("DEMO:NAME", "demo ioc");
    let _ = server.add_pv("DEMO:WAVE", vec![0.0f64, 0.5, 1.0, 0.5]);
    server
}

fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    let server = demo_server();
    let registry = ContextRegistry::new(ClientConfig::from_env(), move || {
        Arc::new(server.clone())
    })
    .install_global()
    .unwrap();

    for name in opts.names {
        if opts.info {
            match ca::cainfo(&name) {
                Some(info) => print!("{info}"),
                None => println!("{name}: not available"),
            }
            continue;
        }
        let options = CagetOptions {
            as_string: opts.as_string,
            ..Default::default()
        };
        match ca::caget(&name, options) {
            Some(Value::String(text)) => println!("{name:<24} {text}"),
            Some(value) => println!("{name:<24} {value:?}"),
            None => println!("{name:<24} *** not connected"),
        }
    }
    registry.shutdown();
}
