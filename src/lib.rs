//! # Chassis Client Library
//!
//! Host-side client for networked modular data-acquisition appliances. Each
//! appliance is a chassis with numbered module slots ("sites"); every site
//! runs a text command service on its own TCP port, and sample data comes
//! back over dedicated binary data ports. This crate encapsulates the whole
//! conversation: service discovery, knob get/set, capture status tracking,
//! typed channel retrieval, calibration, and waveform upload.
//!
//! ## Crate Structure
//!
//! - **`net`**: Line-framed TCP transport shared by every service client.
//!   Text and raw framings coexist on one connection without dropping bytes.
//! - **`site`**: The `NAME` / `NAME=VALUE` command protocol, one
//!   [`SiteService`] per populated slot.
//! - **`status`**: Capture state machine, snapshot parsing, and the
//!   background [`StatusMonitor`] that follows the free-running status feed
//!   and serves edge-triggered waits.
//! - **`channel`**: Binary sample retrieval in the device's native width,
//!   fixed-count, open-ended, or as a lazy block stream.
//! - **`chassis`**: The [`Chassis`] device proxy tying it all together:
//!   concurrent site discovery, demux-aware multi-channel reads, cached
//!   calibration, waveform loads.
//! - **`registry`**: [`ChassisRegistry`], sharing one proxy per host across
//!   an application.
//! - **`config`**: Layered configuration (defaults, TOML file, environment).
//! - **`error`**: The crate-wide [`ChassisError`] taxonomy.
//!
//! ## Quick start
//!
//! ```no_run
//! use daq_chassis::{Chassis, ChassisConfig};
//!
//! # async fn demo() -> Result<(), daq_chassis::ChassisError> {
//! let dev = Chassis::connect("10.12.132.22", ChassisConfig::load()?).await?;
//! dev.wait_stopped().await?;
//! let channels = dev.read_channels(&[], 0).await?;
//! let volts = dev.chan2volts(1, &channels[0]).await?;
//! println!("ch1[0] = {} V", volts[0]);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod chassis;
pub mod config;
pub mod error;
pub mod net;
pub mod registry;
pub mod site;
pub mod status;

pub use channel::{BlockReader, ChannelDataClient, SampleWidth, Samples};
pub use chassis::{AwgMode, Calibration, Chassis};
pub use config::{ChassisConfig, PortMap};
pub use error::{ChassisError, ChassisResult};
pub use registry::ChassisRegistry;
pub use site::SiteService;
pub use status::{CaptureState, StatusMonitor, StatusSnapshot};
