use crate::mqtt;
use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum BroadcastOutput {
    /// Print every snapshot as a JSON line on standard output
    Console,
    /// Publish every snapshot to an MQTT broker
    Mqtt,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct ServeArgs {
    /// Address to accept device connections on
    #[arg(short, long, default_value = "0.0.0.0:21100")]
    pub bind: SocketAddr,

    /// Close a connection after the device stays silent this long (e.g. "90s", "5m")
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    pub idle_timeout: Duration,

    /// Size of the socket read buffer per connection
    #[arg(long, default_value = "1024")]
    pub read_buffer_size: usize,

    /// Number of snapshots waiting for the sink before new ones are dropped
    #[arg(long, default_value = "1024")]
    pub queue_capacity: usize,

    /// Persist the newest snapshot per device at this interval ("0s" persists every update)
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    pub persist_interval: Duration,

    /// Directory for device snapshots; without it snapshots are only kept in memory
    #[arg(long)]
    pub store_dir: Option<PathBuf>,

    /// Comma-separated list of live outputs
    #[arg(long, value_enum, value_delimiter = ',', default_value = "console")]
    pub broadcast: Vec<BroadcastOutput>,

    /// The configuration file for the MQTT broker
    #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
    pub mqtt_config: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the TCP gateway and forward device telemetry
    Serve(ServeArgs),
    /// Decode a hex dump of one or more frames (spaces are ignored)
    Decode {
        /// Raw bytes as hex, e.g. "78 78 0D 01 ..."
        hex: Vec<String>,
    },
    /// Print the login acknowledgement for a serial number
    Ack {
        /// Serial number, decimal or 0x-prefixed hex
        #[arg(value_parser = maybe_hex::<u16>)]
        serial: u16,
    },
    /// Show the stored snapshot of a device
    Lookup {
        /// Directory the gateway stores snapshots in
        #[arg(long)]
        store_dir: PathBuf,
        /// Device identifier as sent at login (16 hex digits)
        device_id: String,
    },
}

const fn about_text() -> &'static str {
    "GT06 GPS tracker gateway"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: CliCommands,
}
