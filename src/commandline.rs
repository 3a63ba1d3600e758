use crate::config::Config;
use bmsrtu_lib::poll::PollRate;
use bmsrtu_lib::protocol::{MAX_CELLS, MAX_SLAVES};
use clap::{Parser, Subcommand};
use clap_num::{maybe_hex, number_range};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::{path::PathBuf, time::Duration};

fn slave_number(s: &str) -> Result<u8, String> {
    number_range(s, 1, MAX_SLAVES)
}

fn slave_count(s: &str) -> Result<u8, String> {
    number_range(s, 0, MAX_SLAVES)
}

fn cell_count(s: &str) -> Result<u8, String> {
    number_range(s, 0, MAX_CELLS)
}

fn attempts(s: &str) -> Result<u8, String> {
    number_range(s, 1, 10)
}

fn poll_rate(s: &str) -> Result<PollRate, String> {
    let hertz: f64 = s.parse().map_err(|e| format!("{e}"))?;
    PollRate::try_from(hertz).map_err(|e| e.to_string())
}

/// Raw bytes given as hex, separators ' ' and ':' are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexPayload(pub Vec<u8>);

fn hex_payload(s: &str) -> Result<HexPayload, String> {
    let digits: String = s.chars().filter(|c| !matches!(c, ' ' | ':')).collect();
    let bytes = hex::decode(digits).map_err(|e| format!("{e}"))?;
    if bytes.is_empty() {
        return Err("payload must not be empty".into());
    }
    Ok(HexPayload(bytes))
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show communication state, number of slaves and number of cells of the selected board
    Status,
    /// Show the pack voltage
    PackVoltage,
    /// Show the pack current (negative while charging)
    PackCurrent,
    /// Show individual cell voltages
    CellVoltages,
    /// Show the four zone temperatures
    Temperatures,
    /// Show whether cell balancing is enabled
    Balancing,
    /// Show which cells are being balanced
    BalancingState,
    /// Show all readings of the selected board
    All,
    /// Start communication with the BMS
    Start,
    /// Stop communication with the BMS
    Stop,
    /// Set the number of slave boards behind the master
    SetSlaves {
        #[arg(value_parser = slave_count)]
        count: u8,
    },
    /// Set the number of cells of the selected board
    SetCells {
        #[arg(value_parser = cell_count)]
        count: u8,
    },
    /// Enable or disable cell balancing
    SetBalancing {
        /// Enable balancing. If this flag is not present, it will be disabled.
        #[clap(long, short, action)]
        enable: bool,
    },
    /// Set the balancing sequence, bit 0 is cell 1 (e.g., "0x0005" balances cells 1 and 3)
    SetBalancingSequence {
        #[arg(value_parser = maybe_hex::<u16>)]
        pattern: u16,
    },
    /// Send raw bytes with the debug function code and show the raw reply
    Debug {
        /// Payload as hex (e.g., "0C0001" or "0C:00:01")
        #[arg(value_parser = hex_payload)]
        payload: HexPayload,
    },
    /// Run in daemon mode, periodically reading the master and all configured slaves
    Daemon {
        /// Output format for readings
        #[arg(long, value_enum, default_value_t = DaemonFormat::Console)]
        format: DaemonFormat,
        /// Poll rate in Hz, 0.5 or 1 (overrides the config file)
        #[arg(long, short, value_parser = poll_rate)]
        rate: Option<PollRate>,
        /// Number of slaves to poll (overrides the config file)
        #[arg(long, value_parser = slave_count)]
        slaves: Option<u8>,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum DaemonFormat {
    Console,
    Json,
}

const fn about_text() -> &'static str {
    "modbus-rtu bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long)]
    pub device: Option<String>,

    /// YAML file with device, slaves, cells, poll rate, timeout and retries
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Talk to an in-memory BMS instead of a serial port
    #[arg(long)]
    pub simulate: bool,

    /// Address slave N (1-35) instead of the master
    #[arg(short, long, value_parser = slave_number)]
    pub slave: Option<u8>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for one reply (e.g., "500ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub timeout: Option<Duration>,

    // Some USB - RS485 dongles requires time to switch between TX and RX
    /// Delay between sending multiple commands to the BMS (e.g., "5ms", "10ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1ms")]
    pub delay: Duration,

    /// Number of attempts per command
    #[arg(long, value_parser = attempts)]
    pub retries: Option<u8>,
}

impl CliArgs {
    /// Applies the command line over the config file.
    pub fn merge_into(&self, mut config: Config) -> Config {
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        if let CliCommands::Daemon { rate, slaves, .. } = &self.command {
            if let Some(rate) = rate {
                config.poll_rate = rate.hertz();
            }
            if slaves.is_some() {
                config.slaves = *slaves;
            }
        }
        config
    }
}
