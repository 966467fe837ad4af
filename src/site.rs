//! Per-module site command service.
//!
//! Each populated module slot ("site") on the chassis runs its own command
//! service speaking a `NAME` / `NAME=VALUE` text protocol; site 0 is the
//! chassis-wide control service. One `SiteService` owns one persistent
//! connection for the lifetime of the device proxy.
//!
//! A query for a knob the device does not define comes back without the
//! `name=value` shape (the firmware answers with an error line); that maps to
//! [`ChassisError::UnknownAttribute`] so callers can tell "never defined on
//! this device" apart from a transport failure.

use tracing::trace;

use crate::config::ChassisConfig;
use crate::error::{ChassisError, ChassisResult};
use crate::net::{Connection, Link};

/// Client for one site command service.
pub struct SiteService {
    site: u32,
    conn: Connection,
}

impl SiteService {
    /// Connect to the command service for `site` on `host`.
    pub async fn connect(host: &str, site: u32, config: &ChassisConfig) -> ChassisResult<Self> {
        let conn = Connection::open(host, config.ports.site_port(site), config.connect_timeout())
            .await?;
        Ok(SiteService { site, conn })
    }

    /// Wrap an established link (tests).
    pub fn from_link(site: u32, io: Box<dyn Link>) -> Self {
        SiteService {
            site,
            conn: Connection::from_link(io, format!("site{site}")),
        }
    }

    /// Site-slot identifier this service talks to.
    pub fn site(&self) -> u32 {
        self.site
    }

    /// Query one attribute; returns its value string.
    pub async fn get(&mut self, name: &str) -> ChassisResult<String> {
        self.conn.send(name).await?;
        let reply = self.conn.receive_line().await?;
        trace!(site = self.site, name, reply, "get");
        match reply.split_once('=') {
            Some((key, value)) if key.trim() == name => Ok(value.trim().to_string()),
            _ => Err(ChassisError::UnknownAttribute {
                site: self.site,
                name: name.to_string(),
            }),
        }
    }

    /// Set one attribute. The device sends no acknowledgement; only transport
    /// failures surface.
    pub async fn set(&mut self, name: &str, value: impl std::fmt::Display) -> ChassisResult<()> {
        trace!(site = self.site, name, %value, "set");
        self.conn.send(&format!("{name}={value}")).await
    }

    /// Query an attribute and parse it as an integer.
    pub async fn get_u32(&mut self, name: &str) -> ChassisResult<u32> {
        let value = self.get(name).await?;
        value.trim().parse().map_err(|_| {
            ChassisError::Parse(format!(
                "site {}: attribute '{name}' is not an integer: '{value}'",
                self.site
            ))
        })
    }

    /// Query a 0/1 flag attribute.
    pub async fn get_flag(&mut self, name: &str) -> ChassisResult<bool> {
        Ok(self.get(name).await?.trim() == "1")
    }
}
