use anyhow::{Context, Result};
use bmsrtu_lib::poll::{PollRate, Poller};
use bmsrtu_lib::{Bms, Device, Error, Telemetry};
use log::info;
use serde_json::json;
use std::ops::ControlFlow;

use crate::commandline::DaemonFormat;
use crate::config::Config;

fn print_console(device: Device, reading: &Result<Telemetry, Error>) {
    match reading {
        Ok(telemetry) => {
            println!(
                "--- {} at {} ---",
                device,
                chrono::Local::now().to_rfc3339()
            );
            println!("Pack voltage: {:.3} V", telemetry.pack_voltage);
            println!("Pack current: {:.3} A", telemetry.pack_current);
            println!("Cell voltages: {:.4?}", telemetry.cell_voltages);
            println!("Temperatures: {:.1?}", telemetry.temperatures);
            if let Some(cells) = telemetry.balancing_cells() {
                println!("Balancing: {cells:?}");
            }
        }
        Err(e) => println!("--- {device}: {e} ---"),
    }
}

fn json_line(device: Device, reading: &Result<Telemetry, Error>) -> Result<String> {
    let mut line = serde_json::Map::new();
    line.insert(
        "timestamp".to_string(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    line.insert("device".to_string(), json!(device.address()));
    match reading {
        Ok(telemetry) => {
            line.insert("reading".to_string(), serde_json::to_value(telemetry)?);
        }
        Err(e) => {
            line.insert("error".to_string(), json!(e.to_string()));
        }
    }
    Ok(serde_json::to_string(&line)?)
}

/// Applies the configured chain layout to the master and returns the boards to poll.
///
/// Without a configured slave count the one stored in the master is used.
pub fn chain(bms: &Bms, config: &Config) -> Result<Vec<Device>> {
    let slaves = match config.slaves {
        Some(slaves) => {
            bms.set_slave_count(slaves)
                .with_context(|| "Cannot set number of slaves")?;
            slaves
        }
        None => bms
            .slave_count()
            .with_context(|| "Cannot get number of slaves")?,
    };
    if let Some(cells) = config.cells {
        bms.set_cell_count(Device::MASTER, cells)
            .with_context(|| "Cannot set number of cells")?;
    }
    Ok(Device::chain(slaves))
}

pub fn run(bms: &Bms, devices: Vec<Device>, rate: PollRate, format: DaemonFormat) -> Result<()> {
    info!("Starting daemon mode: format={format:?}, rate={rate}, devices={devices:?}");
    let poller = Poller::new(bms, devices, rate);
    let ticks = poller
        .run(|device, reading| {
            match format {
                DaemonFormat::Console => print_console(device, reading),
                DaemonFormat::Json => match json_line(device, reading) {
                    Ok(line) => println!("{line}"),
                    Err(e) => log::error!("Failed to serialize reading of {device}: {e}"),
                },
            }
            ControlFlow::Continue(())
        })
        .with_context(|| "Polling stopped")?;
    info!("Daemon finished after {ticks} poll(s)");
    Ok(())
}
