//! Device proxy: discovery, status, channel reads, calibration.
//!
//! One [`Chassis`] is the host-side proxy for one physical appliance. On
//! connect it opens the site-0 control service, enumerates the populated
//! module slots from the device's site list, opens the remaining site
//! services concurrently (each bounded by a join budget so one dead module
//! cannot stall the whole open), reads one synchronous status snapshot, and
//! then hands the status feed to a background [`StatusMonitor`].
//!
//! Channel retrieval branches on the device's demux flag: demultiplexed
//! devices serve each channel on its own data port and the proxy fetches
//! them with a bounded set of parallel reads; multiplexed devices serve one
//! interleaved aggregate stream which the proxy de-interleaves client-side.

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::channel::{BlockReader, ChannelDataClient, Samples, SampleWidth};
use crate::config::ChassisConfig;
use crate::error::{ChassisError, ChassisResult};
use crate::net::Connection;
use crate::site::SiteService;
use crate::status::{CaptureState, StatusMonitor, StatusSnapshot};

/// Which replay regime a waveform load targets. Selects the upload port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwgMode {
    /// Play once on the next shot.
    Once,
    /// Re-arm automatically after each shot.
    AutoRearm,
    /// Replay continuously.
    Continuous,
}

/// Per-channel affine calibration, indexed from channel 1 (index 0 unused).
#[derive(Debug, Clone)]
pub struct Calibration {
    pub scale: Vec<f64>,
    pub offset: Vec<f64>,
}

impl Calibration {
    /// Convert raw integer codes for `chan` to volts:
    /// `volts = raw * scale[chan] + offset[chan]`.
    pub fn chan2volts(&self, chan: usize, raw: &Samples) -> ChassisResult<Vec<f64>> {
        if chan == 0 || chan >= self.scale.len() {
            return Err(ChassisError::InvalidChannel {
                chan,
                nchan: self.scale.len().saturating_sub(1),
            });
        }
        let scale = self.scale[chan];
        let offset = self.offset[chan];
        Ok(raw.to_f64().into_iter().map(|v| v * scale + offset).collect())
    }
}

/// Host-side proxy for one acquisition chassis.
pub struct Chassis {
    host: String,
    config: ChassisConfig,
    /// Populated site services keyed by slot; site 0 is chassis control.
    sites: BTreeMap<u32, Mutex<SiteService>>,
    /// Sites the device declared, populated or not: `(site, model)`.
    declared: Vec<(u32, String)>,
    monitor: Option<StatusMonitor>,
    /// Snapshot read synchronously at open; status stays valid even when the
    /// monitor is disabled.
    boot_status: StatusSnapshot,
    awg_site: Option<u32>,
    cal: OnceCell<Calibration>,
}

impl Chassis {
    /// Open a proxy for the appliance at `host`.
    ///
    /// A declared site that refuses or fails to resolve within the discovery
    /// budget is recorded as absent, not fatal, unless no declared site
    /// resolves at all, which fails the open with
    /// [`ChassisError::DiscoveryTimeout`].
    pub async fn connect(host: &str, config: ChassisConfig) -> ChassisResult<Self> {
        let mut s0 = SiteService::connect(host, 0, &config).await?;
        let sitelist = s0.get("SITELIST").await?;
        let declared = parse_sitelist(&sitelist)?;
        info!(host, sites = ?declared, "site list enumerated");

        let mut discovery = JoinSet::new();
        for &(site, _) in &declared {
            let host = host.to_string();
            let config = config.clone();
            discovery.spawn(async move {
                let result = tokio::time::timeout(
                    config.discovery_timeout(),
                    SiteService::connect(&host, site, &config),
                )
                .await;
                (site, result)
            });
        }

        let mut sites = BTreeMap::new();
        while let Some(joined) = discovery.join_next().await {
            let (site, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "discovery task failed");
                    continue;
                }
            };
            match result {
                Ok(Ok(svc)) => {
                    debug!(site, "site service up");
                    sites.insert(site, Mutex::new(svc));
                }
                Ok(Err(e)) => warn!(site, error = %e, "site service absent"),
                Err(_) => warn!(
                    site,
                    budget = ?config.discovery_timeout(),
                    "site discovery timed out, marking absent"
                ),
            }
        }
        if sites.is_empty() && !declared.is_empty() {
            return Err(ChassisError::DiscoveryTimeout {
                sites: declared.iter().map(|&(site, _)| site).collect(),
                timeout: config.discovery_timeout(),
            });
        }

        // Waveform modules announce themselves with an "ao" model prefix.
        let awg_site = declared
            .iter()
            .find(|(site, model)| model.starts_with("ao") && sites.contains_key(site))
            .map(|&(site, _)| site);

        let state_line = s0.get("state").await?;
        let boot_status = StatusSnapshot::parse(&state_line).ok_or_else(|| {
            ChassisError::Parse(format!("malformed state reply: '{state_line}'"))
        })?;

        let monitor = if config.monitor {
            let conn = Connection::open(host, config.ports.status, config.connect_timeout()).await?;
            Some(StatusMonitor::start(conn, boot_status, config.poll_interval()))
        } else {
            None
        };

        sites.insert(0, Mutex::new(s0));

        Ok(Chassis {
            host: host.to_string(),
            config,
            sites,
            declared,
            monitor,
            boot_status,
            awg_site,
            cal: OnceCell::new(),
        })
    }

    /// Address this proxy talks to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Populated module count (excludes the site-0 control service).
    pub fn mod_count(&self) -> usize {
        self.sites.len().saturating_sub(1)
    }

    /// Populated site ids, control service included.
    pub fn populated_sites(&self) -> impl Iterator<Item = u32> + '_ {
        self.sites.keys().copied()
    }

    /// Site list as declared by the device, `(site, model)` pairs.
    pub fn declared_sites(&self) -> &[(u32, String)] {
        &self.declared
    }

    /// Waveform-generator site, when one is populated.
    pub fn awg_site(&self) -> Option<u32> {
        self.awg_site
    }

    /// The command service for `site`, if populated.
    pub fn site(&self, site: u32) -> ChassisResult<&Mutex<SiteService>> {
        self.sites
            .get(&site)
            .ok_or(ChassisError::SiteAbsent { site })
    }

    /// The background status monitor, when enabled.
    pub fn monitor(&self) -> Option<&StatusMonitor> {
        self.monitor.as_ref()
    }

    /// Latest status snapshot: live from the monitor, or the one read at
    /// open when the monitor is disabled.
    pub fn status(&self) -> StatusSnapshot {
        self.monitor
            .as_ref()
            .map(|m| m.snapshot())
            .unwrap_or(self.boot_status)
    }

    /// Current capture state.
    pub fn state(&self) -> CaptureState {
        self.status().state
    }

    pub fn pre_samples(&self) -> u64 {
        self.status().pre
    }

    pub fn post_samples(&self) -> u64 {
        self.status().post
    }

    pub fn elapsed_samples(&self) -> u64 {
        self.status().elapsed
    }

    /// Total samples configured for the shot.
    pub fn samples(&self) -> u64 {
        self.status().samples()
    }

    /// Demux flag from the latest status snapshot.
    pub fn demux_enabled(&self) -> bool {
        self.status().demux
    }

    /// Block until the device has been observed ARMED since the last wait.
    pub async fn wait_armed(&self) -> ChassisResult<()> {
        match &self.monitor {
            Some(monitor) => monitor.wait_armed().await,
            None => Err(ChassisError::MonitorStopped),
        }
    }

    /// Block until a running→IDLE edge has been observed since the last wait.
    pub async fn wait_stopped(&self) -> ChassisResult<()> {
        match &self.monitor {
            Some(monitor) => monitor.wait_stopped().await,
            None => Err(ChassisError::MonitorStopped),
        }
    }

    /// Aggregate channel count reported by the control service.
    pub async fn nchan(&self) -> ChassisResult<u32> {
        self.site(0)?.lock().await.get_u32("NCHAN").await
    }

    /// Device-wide sample width for the current shot (`data32` knob).
    pub async fn sample_width(&self) -> ChassisResult<SampleWidth> {
        let data32 = self.site(0)?.lock().await.get_flag("data32").await?;
        Ok(if data32 {
            SampleWidth::I32
        } else {
            SampleWidth::I16
        })
    }

    /// Demux state read fresh from the control service's `transient` knob.
    ///
    /// Beware: this reports the *current* setting. If demux was changed after
    /// the shot there is no way to recover what it was during the shot.
    pub async fn get_demux_state(&self) -> ChassisResult<bool> {
        let transient = self.site(0)?.lock().await.get("transient").await?;
        parse_demux(&transient)
    }

    /// Demux flag used to pick the read strategy: the monitor's current
    /// snapshot when a monitor runs, otherwise a fresh `transient` query.
    async fn demux_now(&self) -> ChassisResult<bool> {
        match &self.monitor {
            Some(monitor) => Ok(monitor.snapshot().demux),
            None => self.get_demux_state().await,
        }
    }

    /// Read one channel's post-shot data.
    ///
    /// `count == 0` means "whatever the shot produced": the configured
    /// `pre + post` total when status knows it, else read to end of stream.
    /// Channel 0 is the aggregate (multiplexed) stream and is always read
    /// open-ended for `count == 0`.
    pub async fn read_chan(
        &self,
        channel: u32,
        count: usize,
        width: SampleWidth,
    ) -> ChassisResult<Samples> {
        let mut client = ChannelDataClient::connect(&self.host, channel, &self.config).await?;
        if count > 0 {
            return client.read(count, width).await;
        }
        if channel != 0 {
            let shot = self.samples() as usize;
            if shot > 0 {
                return client.read(shot, width).await;
            }
        }
        client.read_to_end(width).await
    }

    /// Read post-shot data for `channels` (1-based; empty = all channels),
    /// `count` samples per channel (0 = whole shot).
    ///
    /// Demultiplexed devices are read per-channel with at most
    /// `read_concurrency` fetches in flight; multiplexed devices are read as
    /// one interleaved stream and de-interleaved by channel stride.
    pub async fn read_channels(
        &self,
        channels: &[u32],
        count: usize,
    ) -> ChassisResult<Vec<Samples>> {
        let nchan = self.nchan().await? as usize;
        let channels: Vec<u32> = if channels.is_empty() {
            (1..=nchan as u32).collect()
        } else {
            channels.to_vec()
        };
        for &ch in &channels {
            if ch == 0 || ch as usize > nchan {
                return Err(ChassisError::InvalidChannel {
                    chan: ch as usize,
                    nchan,
                });
            }
        }
        let width = self.sample_width().await?;

        if self.demux_now().await? {
            debug!(?channels, count, "demuxed read, per-channel ports");
            stream::iter(
                channels
                    .iter()
                    .map(|&ch| self.read_chan(ch, count, width)),
            )
            .buffered(self.config.read_concurrency.max(1))
            .try_collect()
            .await
        } else {
            debug!(?channels, count, nchan, "multiplexed read, de-interleaving");
            let total = count.checked_mul(nchan).unwrap_or(0);
            let muxed = self.read_chan(0, total, width).await?;
            Ok(channels
                .iter()
                .map(|&ch| muxed.stride_select(ch as usize - 1, nchan))
                .collect())
        }
    }

    /// Read the aggregate stream to end of stream. Only meaningful when
    /// demux is off; with demux on the combined port does not carry the
    /// shot's interleaved data.
    pub async fn read_muxed(&self) -> ChassisResult<Samples> {
        let width = self.sample_width().await?;
        self.read_chan(0, 0, width).await
    }

    /// Fetch the per-channel calibration vectors, once. Subsequent calls
    /// return the cached vectors.
    pub async fn fetch_all_calibration(&self) -> ChassisResult<&Calibration> {
        self.cal.get_or_try_init(|| self.load_calibration()).await
    }

    async fn load_calibration(&self) -> ChassisResult<Calibration> {
        info!(host = %self.host, "fetching calibration data");
        // Channel numbering starts at 1; index 0 is a placeholder.
        let mut scale = vec![0.0];
        let mut offset = vec![0.0];
        let agg = self.site(0)?.lock().await.get("aggregator").await?;
        for site in parse_aggregator_sites(&agg)? {
            let service = self.site(site)?;
            let mut service = service.lock().await;
            let eslo = service.get("AI_CAL_ESLO").await?;
            let eoff = service.get("AI_CAL_EOFF").await?;
            scale.append(&mut parse_cal_values(&eslo)?);
            offset.append(&mut parse_cal_values(&eoff)?);
        }
        if scale.len() != offset.len() {
            return Err(ChassisError::Parse(format!(
                "calibration vector length mismatch: {} scale vs {} offset entries",
                scale.len() - 1,
                offset.len() - 1
            )));
        }
        debug!(channels = scale.len() - 1, "calibration loaded");
        Ok(Calibration { scale, offset })
    }

    /// Calibrated volts for raw codes of `chan`:
    /// `raw * scale[chan] + offset[chan]`. Fetches calibration lazily on
    /// first use.
    pub async fn chan2volts(&self, chan: usize, raw: &Samples) -> ChassisResult<Vec<f64>> {
        self.fetch_all_calibration().await?.chan2volts(chan, raw)
    }

    /// Upload a waveform to the generator module.
    ///
    /// Fails fast with [`ChassisError::Busy`] when a load is already active
    /// on the waveform site; conflicting loads are never queued. The upload
    /// half-closes the connection and drains the reply until the device
    /// acknowledges with `DONE`.
    pub async fn load_awg(&self, data: &[u8], mode: AwgMode) -> ChassisResult<()> {
        if let Some(site) = self.awg_site {
            let active = self.site(site)?.lock().await.get_flag("task_active").await?;
            if active {
                return Err(ChassisError::Busy(format!(
                    "waveform load already active on site {site}"
                )));
            }
        }
        let port = match mode {
            AwgMode::Once => self.config.ports.awg_once,
            AwgMode::AutoRearm => self.config.ports.awg_auto_rearm,
            AwgMode::Continuous => self.config.ports.awg_continuous,
        };
        let mut conn = Connection::open(&self.host, port, self.config.connect_timeout()).await?;
        conn.send_bytes(data).await?;
        conn.shutdown().await?;
        loop {
            let chunk = conn.recv_raw(128).await?;
            if chunk.is_empty() || chunk.starts_with(b"DONE") {
                break;
            }
        }
        debug!(bytes = data.len(), ?mode, "waveform load complete");
        Ok(())
    }

    /// Open the live stream port as a lazy block sequence.
    pub async fn stream_blocks(
        &self,
        count: usize,
        width: SampleWidth,
    ) -> ChassisResult<BlockReader> {
        let conn =
            Connection::open(&self.host, self.config.ports.stream, self.config.connect_timeout())
                .await?;
        Ok(ChannelDataClient::with_connection(conn, 0).blocks(count, width))
    }

    /// Tear the proxy down, stopping the status monitor.
    pub async fn close(mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
    }
}

impl std::fmt::Debug for Chassis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chassis")
            .field("host", &self.host)
            .field("sites", &self.sites.keys().collect::<Vec<_>>())
            .field("awg_site", &self.awg_site)
            .field("monitor", &self.monitor.is_some())
            .finish()
    }
}

/// Parse the control service's site list: `"<count>,1=<model>,2=<model>,..."`.
fn parse_sitelist(value: &str) -> ChassisResult<Vec<(u32, String)>> {
    let mut entries = value.split(',');
    // Leading field is the declared count; the entries speak for themselves.
    entries.next();
    let mut declared = Vec::new();
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (site, model) = entry.split_once('=').ok_or_else(|| {
            ChassisError::Parse(format!("malformed site list entry: '{entry}'"))
        })?;
        let site = site.trim().parse().map_err(|_| {
            ChassisError::Parse(format!("malformed site id in site list: '{entry}'"))
        })?;
        declared.push((site, model.trim().to_string()));
    }
    Ok(declared)
}

/// Extract the `DEMUX=` flag from a `transient` knob value like
/// `"PRE=0 POST=100000 SOFT_TRIGGER=1 DEMUX=1"`.
fn parse_demux(transient: &str) -> ChassisResult<bool> {
    for token in transient.split_whitespace() {
        if let Some(flag) = token.strip_prefix("DEMUX=") {
            return Ok(flag.starts_with('1'));
        }
    }
    Err(ChassisError::Parse(format!(
        "transient reply missing DEMUX flag: '{transient}'"
    )))
}

/// Extract the site list from an `aggregator` knob value like
/// `"reg=0x09 sites=1,2 threshold=16384"`.
fn parse_aggregator_sites(value: &str) -> ChassisResult<Vec<u32>> {
    for token in value.split_whitespace() {
        if let Some(list) = token.strip_prefix("sites=") {
            return list
                .split(',')
                .map(|s| {
                    s.trim().parse().map_err(|_| {
                        ChassisError::Parse(format!("malformed aggregator site: '{s}'"))
                    })
                })
                .collect();
        }
    }
    Err(ChassisError::Parse(format!(
        "aggregator reply missing sites list: '{value}'"
    )))
}

/// Parse a calibration vector knob value: two header tokens (element count
/// and units) followed by one value per channel.
fn parse_cal_values(value: &str) -> ChassisResult<Vec<f64>> {
    value
        .split_whitespace()
        .skip(2)
        .map(|token| {
            token.parse().map_err(|_| {
                ChassisError::Parse(format!("malformed calibration value: '{token}'"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sitelist_parses_sites_and_models() {
        let declared = parse_sitelist("3,1=acq425,2=acq425,3=ao420").unwrap();
        assert_eq!(
            declared,
            vec![
                (1, "acq425".to_string()),
                (2, "acq425".to_string()),
                (3, "ao420".to_string()),
            ]
        );
    }

    #[test]
    fn sitelist_tolerates_empty_tail() {
        assert!(parse_sitelist("0").unwrap().is_empty());
        assert!(parse_sitelist("1,2=acq480,").unwrap().len() == 1);
    }

    #[test]
    fn sitelist_rejects_garbage_entries() {
        assert!(parse_sitelist("2,1=acq425,bogus").is_err());
        assert!(parse_sitelist("1,x=acq425").is_err());
    }

    #[test]
    fn demux_flag_comes_from_transient_knob() {
        assert!(parse_demux("PRE=0 POST=100000 SOFT_TRIGGER=1 DEMUX=1").unwrap());
        assert!(!parse_demux("PRE=50000 POST=100000 DEMUX=0").unwrap());
        assert!(parse_demux("PRE=0 POST=100000").is_err());
    }

    #[test]
    fn aggregator_sites_parse() {
        assert_eq!(
            parse_aggregator_sites("reg=0x09 sites=1,2 threshold=16384").unwrap(),
            vec![1, 2]
        );
        assert_eq!(parse_aggregator_sites("sites=4").unwrap(), vec![4]);
        assert!(parse_aggregator_sites("reg=0x09 threshold=1").is_err());
        assert!(parse_aggregator_sites("sites=1,x").is_err());
    }

    #[test]
    fn calibration_values_skip_header_tokens() {
        let values = parse_cal_values("4 V 3.05e-05 3.05e-05 6.1e-05 6.1e-05").unwrap();
        assert_eq!(values, vec![3.05e-05, 3.05e-05, 6.1e-05, 6.1e-05]);
        assert!(parse_cal_values("2 V 1.0 oops").is_err());
    }

    #[test]
    fn chan2volts_is_affine() {
        let cal = Calibration {
            scale: vec![0.0, 2.5e-4, 1.0e-3],
            offset: vec![0.0, 0.125, -0.5],
        };

        // Zero raw code lands exactly on the channel offset.
        let zeros = Samples::I16(vec![0, 0]);
        assert_eq!(cal.chan2volts(1, &zeros).unwrap(), vec![0.125, 0.125]);

        // Linearity within floating tolerance.
        let (r1, r2) = (1234i16, -567i16);
        let a = cal.chan2volts(2, &Samples::I16(vec![r1])).unwrap()[0];
        let b = cal.chan2volts(2, &Samples::I16(vec![r2])).unwrap()[0];
        let sum = cal.chan2volts(2, &Samples::I16(vec![r1 + r2])).unwrap()[0];
        let offset = cal.offset[2];
        assert!((sum - (a + b - offset)).abs() < 1e-12);
    }

    #[test]
    fn chan2volts_rejects_out_of_range_channels() {
        let cal = Calibration {
            scale: vec![0.0, 1.0],
            offset: vec![0.0, 0.0],
        };
        let raw = Samples::I16(vec![1]);
        assert!(matches!(
            cal.chan2volts(0, &raw),
            Err(ChassisError::InvalidChannel { .. })
        ));
        assert!(matches!(
            cal.chan2volts(2, &raw),
            Err(ChassisError::InvalidChannel { .. })
        ));
    }
}
