use anyhow::{bail, Context, Result};
use bmsrtu_lib::client::MAX_ATTEMPTS;
use bmsrtu_lib::poll::PollRate;
use bmsrtu_lib::protocol::{MAX_CELLS, MAX_SLAVES};
use bmsrtu_lib::transport::RESPONSE_TIMEOUT;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "Config::default_device")]
    pub device: String,
    /// Written to the master before polling when set, otherwise read from it.
    #[serde(default)]
    pub slaves: Option<u8>,
    /// Written to the master before polling when set.
    #[serde(default)]
    pub cells: Option<u8>,
    #[serde(default = "Config::default_poll_rate")]
    pub poll_rate: f64,
    #[serde(default = "Config::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "Config::default_retries")]
    pub retries: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: Self::default_device(),
            slaves: None,
            cells: None,
            poll_rate: Self::default_poll_rate(),
            timeout: Self::default_timeout(),
            retries: Self::default_retries(),
        }
    }
}

impl Config {
    fn default_device() -> String {
        if cfg!(target_os = "windows") {
            String::from("COM1")
        } else {
            String::from("/dev/ttyUSB0")
        }
    }

    fn default_poll_rate() -> f64 {
        PollRate::default().hertz()
    }

    fn default_timeout() -> Duration {
        RESPONSE_TIMEOUT
    }

    fn default_retries() -> u8 {
        MAX_ATTEMPTS
    }

    pub fn load(config_file_path: &Path) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {config_file_path:?}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(slaves) = self.slaves.filter(|slaves| *slaves > MAX_SLAVES) {
            bail!("slaves {slaves} out of range 0..={MAX_SLAVES}");
        }
        if let Some(cells) = self.cells.filter(|cells| *cells > MAX_CELLS) {
            bail!("cells {cells} out of range 0..={MAX_CELLS}");
        }
        if self.retries == 0 {
            bail!("retries must be at least 1");
        }
        self.poll_rate()?;
        Ok(())
    }

    pub fn poll_rate(&self) -> Result<PollRate> {
        Ok(PollRate::try_from(self.poll_rate)?)
    }
}
