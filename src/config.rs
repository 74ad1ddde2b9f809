use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

/// How propagation requests are grouped into debounce windows.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebounceScope {
    /// One window per device name.
    #[default]
    PerDevice,
    /// A single window shared by every device.
    Global,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ledhub",
    about = "LED device state hub",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP server and propagation coordinator (default).
    Run,

    /// Push the stored state of every registered device once, then exit.
    Push,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "LEDHUB_BIND",
        value_name = "ADDR",
        default_value = "0.0.0.0:4999"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "LEDHUB_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "debounce-ms",
        global = true,
        env = "LEDHUB_DEBOUNCE_MS",
        value_name = "MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(50..=5000)
    )]
    pub debounce_ms: u64,

    #[arg(
        long = "debounce-scope",
        global = true,
        env = "LEDHUB_DEBOUNCE_SCOPE",
        value_name = "SCOPE",
        default_value = "per-device",
        value_enum
    )]
    pub debounce_scope: DebounceScope,

    /// Full re-push of every device on this cadence; 0 disables it.
    #[arg(
        long = "sweep-interval-ms",
        global = true,
        env = "LEDHUB_SWEEP_INTERVAL_MS",
        value_name = "MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(0..=60_000)
    )]
    pub sweep_interval_ms: u64,

    #[arg(
        long = "device-timeout-ms",
        global = true,
        env = "LEDHUB_DEVICE_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(50..=5000)
    )]
    pub device_timeout_ms: u64,

    #[arg(
        long = "device-retries",
        global = true,
        env = "LEDHUB_DEVICE_RETRIES",
        value_name = "N",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(0..=1)
    )]
    pub device_retries: u32,

    #[arg(
        long = "device-port",
        global = true,
        env = "LEDHUB_DEVICE_PORT",
        value_name = "PORT",
        default_value_t = 80
    )]
    pub device_port: u16,
}
