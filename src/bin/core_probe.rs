//! core-probe
//!
//! Loads a Clash core library on the desktop, runs an action against it and
//! prints traffic counters. Useful for checking a core build without the app.

use clash_core_bridge::{
    config::BridgeConfig,
    error::{BridgeError, IntoBridgeError, Result},
    logging, runtime, BufferStats, CoreEvent, NativeHost, NativeRuntime,
};
use log::{debug, info, warn};
use serde_json::Value;
use std::env;
use std::path::PathBuf;
use std::process;

const USAGE: &str = "usage: core-probe <library> [--config <file>] [--action <method> [--data <json>]] [--traffic]";

#[derive(Debug, Default)]
struct Options {
    library: Option<PathBuf>,
    config: Option<PathBuf>,
    action: Option<String>,
    data: Option<String>,
    traffic: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Options> {
    let mut options = Options::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => options.config = Some(required(&mut args, "--config")?.into()),
            "--action" => options.action = Some(required(&mut args, "--action")?),
            "--data" => options.data = Some(required(&mut args, "--data")?),
            "--traffic" => options.traffic = true,
            flag if flag.starts_with("--") => {
                return Err(BridgeError::InvalidArgument(format!("unknown flag {flag}")));
            }
            _ if options.library.is_none() => options.library = Some(arg.into()),
            _ => {
                return Err(BridgeError::InvalidArgument(format!(
                    "unexpected argument {arg}"
                )))
            }
        }
    }
    if options.data.is_some() && options.action.is_none() {
        return Err(BridgeError::InvalidArgument(
            "--data requires --action".to_string(),
        ));
    }
    Ok(options)
}

fn required(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .ok_or_else(|| BridgeError::InvalidArgument(format!("{flag} needs a value")))
}

fn main() {
    let options = match parse_args(env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            process::exit(2);
        }
    };

    // Config errors land before a logger exists.
    if let Err(e) = run(options) {
        eprintln!("core-probe: {e}");
        process::exit(1);
    }
}

fn run(options: Options) -> Result<()> {
    let config = match &options.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    config.validate()?;
    logging::init(&config.logging.level)?;

    info!("Starting core-probe v{}", clash_core_bridge::VERSION);

    let library = options
        .library
        .clone()
        .unwrap_or_else(|| config.resolve_library_path());
    runtime::install(&NativeRuntime);

    let bridge = clash_core_bridge::core::global();
    bridge.init(&library)?;

    let host = NativeHost::new(bridge, config.invoke_timeout());
    host.set_event_listener(|payload| match CoreEvent::parse(payload) {
        Ok(CoreEvent::Log(entry)) => info!("[core {}] {}", entry.level, entry.payload),
        Ok(CoreEvent::Other { kind, data }) => debug!("event {kind}: {data}"),
        Err(e) => warn!("undecodable event: {e}"),
    })?;

    if let Some(method) = &options.action {
        let data = match &options.data {
            Some(json) => serde_json::from_str::<Value>(json).into_bridge_error("invalid --data JSON")?,
            None => Value::Null,
        };
        let result = host.invoke_sync(method, data)?;
        println!("{}", serde_json::to_string_pretty(&result.data)?);
    }

    if options.traffic {
        println!("traffic: {}", bridge.get_traffic(false)?);
        println!("total traffic: {}", bridge.get_total_traffic(false)?);
    }

    host.clear_event_listener()?;
    debug!("buffer stats: {:?}", BufferStats::snapshot());
    Ok(())
}
