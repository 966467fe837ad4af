//! Client configuration.
//!
//! Strongly-typed configuration for the chassis client, loaded from three
//! layers in increasing precedence:
//! 1. built-in defaults (the appliance's fixed port scheme),
//! 2. a `chassis.toml` file,
//! 3. environment variables prefixed with `DAQ_CHASSIS_`.
//!
//! # Example
//! ```no_run
//! use daq_chassis::config::ChassisConfig;
//!
//! # fn main() -> Result<(), daq_chassis::ChassisError> {
//! let config = ChassisConfig::load()?;
//! println!("site 0 control port: {}", config.ports.site_port(0));
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ChassisError, ChassisResult};

/// Fixed port-offset scheme of the appliance.
///
/// The control service for site N listens at `site_base + N`; per-channel
/// data for channel C at `data_base + C`, with the aggregate (multiplexed)
/// stream at `data_base + 0`. Overridable so tests can target loopback mock
/// services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMap {
    /// Base port for site command services (site 0 = chassis control).
    #[serde(default = "default_site_base")]
    pub site_base: u16,
    /// Free-running transient status feed.
    #[serde(default = "default_status")]
    pub status: u16,
    /// Base port for post-shot channel data; +0 is the aggregate stream.
    #[serde(default = "default_data_base")]
    pub data_base: u16,
    /// Live streaming port.
    #[serde(default = "default_stream")]
    pub stream: u16,
    /// Waveform load, single shot.
    #[serde(default = "default_awg_once")]
    pub awg_once: u16,
    /// Waveform load, auto re-arm after each shot.
    #[serde(default = "default_awg_auto_rearm")]
    pub awg_auto_rearm: u16,
    /// Waveform load, continuous replay.
    #[serde(default = "default_awg_continuous")]
    pub awg_continuous: u16,
}

fn default_site_base() -> u16 {
    4220
}
fn default_status() -> u16 {
    2235
}
fn default_data_base() -> u16 {
    53000
}
fn default_stream() -> u16 {
    4210
}
fn default_awg_once() -> u16 {
    54201
}
fn default_awg_auto_rearm() -> u16 {
    54202
}
fn default_awg_continuous() -> u16 {
    54205
}

impl Default for PortMap {
    fn default() -> Self {
        PortMap {
            site_base: default_site_base(),
            status: default_status(),
            data_base: default_data_base(),
            stream: default_stream(),
            awg_once: default_awg_once(),
            awg_auto_rearm: default_awg_auto_rearm(),
            awg_continuous: default_awg_continuous(),
        }
    }
}

impl PortMap {
    /// Command service port for a site (site 0 is the chassis control service).
    pub fn site_port(&self, site: u32) -> u16 {
        self.site_base + site as u16
    }

    /// Data port for a channel; channel 0 is the aggregate stream.
    pub fn data_port(&self, channel: u32) -> u16 {
        self.data_base + channel as u16
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChassisConfig {
    /// Service port scheme.
    #[serde(default)]
    pub ports: PortMap,
    /// TCP connect timeout per service, milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Join budget for each concurrent site discovery task, milliseconds.
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Poll interval for blocking waits, milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Whether to run the background status monitor after connect.
    #[serde(default = "default_monitor")]
    pub monitor: bool,
    /// Bound on parallel per-channel fetches in demultiplexed reads.
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_discovery_timeout_ms() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_monitor() -> bool {
    true
}
fn default_read_concurrency() -> usize {
    4
}

impl Default for ChassisConfig {
    fn default() -> Self {
        ChassisConfig {
            ports: PortMap::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            monitor: default_monitor(),
            read_concurrency: default_read_concurrency(),
        }
    }
}

impl ChassisConfig {
    /// Load configuration from `chassis.toml` and `DAQ_CHASSIS_*` environment
    /// variables, layered over the defaults.
    pub fn load() -> ChassisResult<Self> {
        Self::load_from("chassis.toml")
    }

    /// Load from an explicit TOML path (missing file is fine, defaults apply).
    pub fn load_from(path: impl AsRef<Path>) -> ChassisResult<Self> {
        Figment::from(Serialized::defaults(ChassisConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_CHASSIS_").split("__"))
            .extract()
            .map_err(|e| ChassisError::Config(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
