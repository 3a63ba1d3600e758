use anyhow::{Context, Result};
use bmsrtu_lib::protocol::{COMMUNICATION_START, COMMUNICATION_STOP};
use bmsrtu_lib::sim::SimulatedBms;
use bmsrtu_lib::transport::Session;
use bmsrtu_lib::{Bms, Device};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod config;
mod daemon;

use commandline::{CliArgs, CliCommands};
use config::Config;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

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
    log_handle
}

macro_rules! print_pack_voltage {
    ($bms:expr, $device:expr) => {
        println!(
            "Pack voltage: {:.3} V",
            $bms.pack_voltage($device)
                .with_context(|| "Cannot get pack voltage")?
        )
    };
}
macro_rules! print_pack_current {
    ($bms:expr, $device:expr) => {
        println!(
            "Pack current: {:.3} A",
            $bms.pack_current($device)
                .with_context(|| "Cannot get pack current")?
        )
    };
}
macro_rules! print_cell_voltages {
    ($bms:expr, $device:expr) => {
        println!(
            "Cell voltages: {:.4?}",
            $bms.cell_voltages($device)
                .with_context(|| "Cannot get cell voltages")?
        )
    };
}
macro_rules! print_temperatures {
    ($bms:expr, $device:expr) => {
        println!(
            "Temperatures: {:.1?}",
            $bms.temperatures($device)
                .with_context(|| "Cannot get temperatures")?
        )
    };
}
macro_rules! print_balancing {
    ($bms:expr, $device:expr) => {
        println!(
            "Balancing enabled: {}",
            $bms.balancing($device)
                .with_context(|| "Cannot get balancing")?
        )
    };
}
macro_rules! print_balancing_state {
    ($bms:expr, $device:expr) => {
        println!(
            "Balancing state: {:#06X}",
            $bms.balancing_state($device)
                .with_context(|| "Cannot get balancing state")?
        )
    };
}

fn communication_label(value: u16) -> String {
    match value {
        COMMUNICATION_START => "started".to_string(),
        COMMUNICATION_STOP => "stopped".to_string(),
        other => format!("unknown ({other:#06X})"),
    }
}

fn run_command(bms: &Bms, device: Device, command: CliCommands, config: &Config) -> Result<()> {
    match command {
        CliCommands::Status => {
            let communication = bms
                .communication_status(device)
                .with_context(|| "Cannot get communication state")?;
            println!("Communication: {}", communication_label(communication));
            println!(
                "Slaves: {}",
                bms.slave_count().with_context(|| "Cannot get slave count")?
            );
            println!(
                "Cells: {}",
                bms.cell_count(device).with_context(|| "Cannot get cell count")?
            );
        }
        CliCommands::PackVoltage => print_pack_voltage!(bms, device),
        CliCommands::PackCurrent => print_pack_current!(bms, device),
        CliCommands::CellVoltages => print_cell_voltages!(bms, device),
        CliCommands::Temperatures => print_temperatures!(bms, device),
        CliCommands::Balancing => print_balancing!(bms, device),
        CliCommands::BalancingState => print_balancing_state!(bms, device),
        CliCommands::All => {
            print_pack_voltage!(bms, device);
            print_pack_current!(bms, device);
            print_cell_voltages!(bms, device);
            print_temperatures!(bms, device);
            print_balancing!(bms, device);
            print_balancing_state!(bms, device);
        }
        CliCommands::Start => bms
            .start_communication(device)
            .with_context(|| "Cannot start communication")?,
        CliCommands::Stop => bms
            .stop_communication(device)
            .with_context(|| "Cannot stop communication")?,
        CliCommands::SetSlaves { count } => bms
            .set_slave_count(count)
            .with_context(|| "Cannot set number of slaves")?,
        CliCommands::SetCells { count } => bms
            .set_cell_count(device, count)
            .with_context(|| "Cannot set number of cells")?,
        CliCommands::SetBalancing { enable } => bms
            .set_balancing(device, enable)
            .with_context(|| "Cannot set balancing")?,
        CliCommands::SetBalancingSequence { pattern } => bms
            .set_balancing_sequence(device, pattern)
            .with_context(|| "Cannot set balancing sequence")?,
        CliCommands::Debug { payload } => {
            let reply = bms
                .debug(device, &payload.0)
                .with_context(|| "Cannot run debug command")?;
            println!("Request: {}", hex::encode_upper(&reply.request));
            println!("CRC: {:#06X}", reply.crc);
            println!("Response: {}", hex::encode_upper(&reply.response));
        }
        CliCommands::Daemon { format, .. } => {
            let devices = daemon::chain(bms, config)?;
            daemon::run(bms, devices, config.poll_rate()?, format)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let config = args.merge_into(config);
    config.validate()?;

    let mut bms = Bms::new(Session::with_timeout(config.timeout));
    bms.set_delay(args.delay);
    bms.set_attempts(config.retries);

    if args.simulate {
        let sim = SimulatedBms::new();
        bms.connect_link("simulator", sim.link())
            .with_context(|| "Cannot connect to simulator")?;
    } else {
        bms.connect(&config.device)
            .with_context(|| format!("Cannot connect to BMS on '{}'", config.device))?;
    }

    let device = match args.slave {
        Some(n) => Device::slave(n)?,
        None => Device::MASTER,
    };

    let result = run_command(&bms, device, args.command, &config);
    bms.disconnect();
    result
}
