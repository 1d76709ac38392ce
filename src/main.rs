use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use gt06_lib::frame::{ChecksumPolicy, FrameReader};
use gt06_lib::protocol::{encode_ack, PROTOCOL_LOGIN};
use gt06_lib::sink::TelemetrySink;
use log::*;
use std::{ops::Deref, panic, path::Path};

mod commandline;
mod daemon;
mod mqtt;
mod store;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn decode_dump(hex_args: &[String]) -> Result<()> {
    let text: String = hex_args
        .concat()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let bytes = hex::decode(&text).with_context(|| format!("Invalid hex input {text:?}"))?;

    let mut reader = FrameReader::with_policy(ChecksumPolicy::Report);
    let frames = reader.push(&bytes);
    if frames.is_empty() {
        bail!("No complete frame in {} bytes", bytes.len());
    }

    for frame in frames {
        println!(
            "Frame: protocol={:#04X} serial={} checksum={}",
            frame.protocol,
            frame.serial_number,
            if frame.checksum_valid { "ok" } else { "MISMATCH" }
        );
        match frame.decode() {
            Ok(message) => {
                println!("{message}");
                println!(
                    "{}",
                    serde_json::to_string_pretty(&message)
                        .with_context(|| "Cannot serialize message")?
                );
            }
            Err(err) => println!("Cannot decode payload: {err}"),
        }
    }

    let stats = reader.stats();
    if reader.buffered() > 0 || stats.discarded_bytes > 0 {
        warn!(
            "{} trailing bytes incomplete, {} bytes discarded",
            reader.buffered(),
            stats.discarded_bytes
        );
    }
    Ok(())
}

fn lookup(store_dir: &Path, device_id: &str) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .with_context(|| "Cannot create tokio runtime")?;
    let store = store::FileStore::new(store_dir)?;
    let snapshot = runtime
        .block_on(store.lookup(device_id))
        .with_context(|| format!("Cannot read snapshot of {device_id}"))?;
    match snapshot {
        Some(snapshot) => println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).with_context(|| "Cannot serialize snapshot")?
        ),
        None => bail!("No snapshot stored for {device_id} in {store_dir:?}"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    match args.command {
        CliCommands::Serve(serve_args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .with_context(|| "Cannot create tokio runtime")?;
            runtime.block_on(daemon::run(serve_args))?;
        }
        CliCommands::Decode { hex } => decode_dump(&hex)?,
        CliCommands::Ack { serial } => {
            println!("{}", hex::encode_upper(encode_ack(PROTOCOL_LOGIN, serial)))
        }
        CliCommands::Lookup {
            store_dir,
            device_id,
        } => lookup(&store_dir, &device_id)?,
    }

    Ok(())
}
