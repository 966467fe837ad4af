//! Error types for the chassis client.
//!
//! `ChassisError` consolidates every failure a caller can see, from transport
//! problems to protocol-level faults. Variants map one-to-one onto the
//! conditions the appliance protocol can produce:
//!
//! - **`Connection`**: the TCP service was unreachable, refused, or timed out.
//! - **`UnknownAttribute`**: a site service did not recognise a queried knob.
//!   Distinct from transport failure so callers can probe optional knobs.
//! - **`ShortRead`**: a data stream closed before a fixed-count read was
//!   satisfied; carries the byte count actually received.
//! - **`ProtocolViolation`**: the capture state machine skipped ARM. Fatal for
//!   the whole session; every blocked wait is failed with this.
//! - **`Busy`**: a conflicting hardware operation is already in flight
//!   (e.g. a waveform load while one is active). Fail fast, never queue.
//! - **`DiscoveryTimeout`**: no declared site service resolved within the
//!   per-site join budget. Individual slow sites degrade to "absent" and are
//!   never surfaced; this fires only when the whole set came up empty.
//! - **`MonitorStopped`**: a wait was pending when the status monitor shut
//!   down in an orderly fashion (device dropped, feed closed).

use std::time::Duration;

use thiserror::Error;

use crate::status::CaptureState;

/// Convenience alias for results using the crate error type.
pub type ChassisResult<T> = std::result::Result<T, ChassisError>;

/// Primary error type for the chassis client.
#[derive(Error, Debug)]
pub enum ChassisError {
    /// TCP connect/reset failure for one service endpoint.
    #[error("connection to {host}:{port} failed: {source}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The site service does not define the requested attribute.
    #[error("site {site}: unknown attribute '{name}'")]
    UnknownAttribute { site: u32, name: String },

    /// Data stream closed before a fixed-count read completed.
    #[error("short read: wanted {wanted} samples ({wanted_bytes} bytes), stream closed after {got_bytes} bytes")]
    ShortRead {
        wanted: usize,
        wanted_bytes: usize,
        got_bytes: usize,
    },

    /// The capture state machine skipped ARM. Fatal for the session.
    #[error("protocol violation: capture state skipped ARM ({from} -> {to})")]
    ProtocolViolation { from: CaptureState, to: CaptureState },

    /// A conflicting hardware operation is already active.
    #[error("device busy: {0}")]
    Busy(String),

    /// No declared site service resolved within the discovery budget.
    #[error("no site service resolved within {timeout:?} (declared sites {sites:?})")]
    DiscoveryTimeout { sites: Vec<u32>, timeout: Duration },

    /// The status monitor shut down while a wait was pending.
    #[error("status monitor stopped")]
    MonitorStopped,

    /// An operation addressed a site slot that was not populated.
    #[error("site {site} is not populated")]
    SiteAbsent { site: u32 },

    /// A requested channel is outside the device's channel range.
    #[error("channel {chan} out of range (device has {nchan} channels)")]
    InvalidChannel { chan: usize, nchan: usize },

    /// Malformed text where a structured reply was expected.
    #[error("parse error: {0}")]
    Parse(String),

    /// Configuration loading/validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying I/O failure on an established connection.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChassisError {
    /// True for conditions that terminate the whole session rather than the
    /// current call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChassisError::ProtocolViolation { .. } | ChassisError::DiscoveryTimeout { .. }
        )
    }
}
