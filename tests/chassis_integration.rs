//! End-to-end tests against a loopback mock appliance.
//!
//! The mock binds a contiguous block of localhost ports laid out like the
//! real device (site command services at `site_base + N`, per-channel data
//! at `data_base + C`, a status feed, and the waveform load ports), then
//! serves the text and binary protocols from in-memory tables. Every test
//! drives the public [`Chassis`] / [`ChassisRegistry`] API over real TCP.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use daq_chassis::{
    AwgMode, CaptureState, Chassis, ChassisConfig, ChassisError, ChassisRegistry, PortMap,
    SampleWidth, Samples,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

const HOST: &str = "127.0.0.1";

/// Sites 0..8 and data channels 0..8 are enough for every scenario here.
const SITE_SPAN: u16 = 8;
const CHAN_SPAN: u16 = 8;

type SharedKnobs = Arc<Mutex<HashMap<String, String>>>;

fn knob_table(pairs: &[(&str, &str)]) -> SharedKnobs {
    Arc::new(Mutex::new(
        pairs
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    ))
}

fn encode_i16(values: &[i16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn encode_i32(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// One mock appliance holding a reserved block of loopback ports.
///
/// Listeners start out bound but silent; each `serve_*` call takes one over
/// and gives it behavior. Declared-but-dead sites are simulated by dropping
/// the listener so connects are refused.
struct MockChassis {
    ports: PortMap,
    held: BTreeMap<u16, TcpListener>,
}

impl MockChassis {
    async fn bind() -> Self {
        // Diagnostics on demand: RUST_LOG=daq_chassis=trace cargo test ...
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        // Each mock takes its own block so parallel tests never collide.
        static NEXT_BASE: AtomicU16 = AtomicU16::new(21_000);
        'blocks: loop {
            let base = NEXT_BASE.fetch_add(64, Ordering::Relaxed);
            let ports = PortMap {
                site_base: base,
                status: base + 20,
                stream: base + 21,
                data_base: base + 24,
                awg_once: base + 40,
                awg_auto_rearm: base + 41,
                awg_continuous: base + 42,
            };
            let mut wanted: Vec<u16> = (0..SITE_SPAN).map(|s| ports.site_base + s).collect();
            wanted.extend((0..CHAN_SPAN).map(|c| ports.data_base + c));
            wanted.extend([
                ports.status,
                ports.stream,
                ports.awg_once,
                ports.awg_auto_rearm,
                ports.awg_continuous,
            ]);

            let mut held = BTreeMap::new();
            for port in wanted {
                match TcpListener::bind((HOST, port)).await {
                    Ok(listener) => {
                        held.insert(port, listener);
                    }
                    Err(_) => continue 'blocks,
                }
            }
            return MockChassis { ports, held };
        }
    }

    fn config(&self) -> ChassisConfig {
        let mut config = ChassisConfig::default();
        config.ports = self.ports.clone();
        config.connect_timeout_ms = 2_000;
        config.discovery_timeout_ms = 2_000;
        config.poll_interval_ms = 10;
        config
    }

    fn take(&mut self, port: u16) -> TcpListener {
        match self.held.remove(&port) {
            Some(listener) => listener,
            None => panic!("port {port} already taken"),
        }
    }

    /// Refuse connects to this site's command port.
    fn kill_site(&mut self, site: u32) {
        self.held.remove(&self.ports.site_port(site));
    }

    /// Serve the knob protocol for one site: bare `NAME` lines are queries
    /// answered `NAME=VALUE` (or an error line for unknown knobs),
    /// `NAME=VALUE` lines are sets applied to the table.
    fn serve_site(&mut self, site: u32, knobs: SharedKnobs) {
        let listener = self.take(self.ports.site_port(site));
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let knobs = Arc::clone(&knobs);
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut lines = BufReader::new(reader).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if let Some((name, value)) = line.split_once('=') {
                            knobs
                                .lock()
                                .unwrap()
                                .insert(name.to_string(), value.to_string());
                            continue;
                        }
                        let reply = match knobs.lock().unwrap().get(line) {
                            Some(value) => format!("{line}={value}\n"),
                            None => format!("ERROR: unknown knob {line}\n"),
                        };
                        if writer.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
    }

    /// Serve the free-running status feed: each scripted line followed by
    /// its pause, then hold the connection open.
    fn serve_status(&mut self, script: Vec<(&'static str, Duration)>) {
        let listener = self.take(self.ports.status);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let script = script.clone();
                tokio::spawn(async move {
                    for (line, pause) in script {
                        if stream.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(pause).await;
                    }
                    // No EOF: a live device keeps the feed open between shots.
                    std::future::pending::<()>().await;
                });
            }
        });
    }

    /// Serve a fixed payload on one data port, then close (end of shot data).
    fn serve_data(&mut self, channel: u32, payload: Vec<u8>) {
        let listener = self.take(self.ports.data_port(channel));
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let payload = payload.clone();
                tokio::spawn(async move {
                    let _ = stream.write_all(&payload).await;
                });
            }
        });
    }

    /// Serve the live stream port: a fixed payload per connection, then close.
    fn serve_stream(&mut self, payload: Vec<u8>) {
        let listener = self.take(self.ports.stream);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let payload = payload.clone();
                tokio::spawn(async move {
                    let _ = stream.write_all(&payload).await;
                });
            }
        });
    }

    /// Serve one waveform load port: capture the upload, acknowledge `DONE`.
    /// Returns the capture buffer.
    fn serve_awg(&mut self, port: u16) -> Arc<Mutex<Vec<u8>>> {
        let listener = self.take(port);
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    let mut payload = Vec::new();
                    if stream.read_to_end(&mut payload).await.is_err() {
                        return;
                    }
                    *sink.lock().unwrap() = payload;
                    let _ = stream.write_all(b"DONE\n").await;
                });
            }
        });
        captured
    }
}

#[tokio::test]
async fn connect_tolerates_absent_sites() {
    let mut mock = MockChassis::bind().await;
    mock.serve_site(
        0,
        knob_table(&[("SITELIST", "3,1=acq425,2=acq425,5=acq425"), ("state", "0 0 0 0 0")]),
    );
    mock.serve_site(1, knob_table(&[("MODEL", "acq425")]));
    mock.serve_site(2, knob_table(&[("MODEL", "acq425")]));
    mock.kill_site(5);
    mock.serve_status(vec![("0 0 0 0 0", Duration::from_millis(20))]);

    let dev = Chassis::connect(HOST, mock.config()).await.unwrap();
    assert_eq!(dev.mod_count(), 2);
    assert_eq!(dev.populated_sites().collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(dev.declared_sites().len(), 3);
    assert_eq!(dev.awg_site(), None);
    assert!(matches!(
        dev.site(5),
        Err(ChassisError::SiteAbsent { site: 5 })
    ));

    // Populated sites answer module-level queries.
    let model = dev.site(1).unwrap().lock().await.get("MODEL").await.unwrap();
    assert_eq!(model, "acq425");
    dev.close().await;
}

#[tokio::test]
async fn connect_fails_when_no_declared_site_resolves() {
    let mut mock = MockChassis::bind().await;
    mock.serve_site(
        0,
        knob_table(&[("SITELIST", "2,1=acq425,2=acq425"), ("state", "0 0 0 0 0")]),
    );
    mock.kill_site(1);
    mock.kill_site(2);

    let err = Chassis::connect(HOST, mock.config()).await.unwrap_err();
    assert!(err.is_fatal());
    match err {
        ChassisError::DiscoveryTimeout { sites, .. } => assert_eq!(sites, vec![1, 2]),
        other => panic!("expected DiscoveryTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn shot_cycle_waits_follow_the_status_feed() {
    let mut mock = MockChassis::bind().await;
    mock.serve_site(
        0,
        knob_table(&[("SITELIST", "1,1=acq425"), ("state", "0 0 100000 0 0")]),
    );
    mock.serve_site(1, knob_table(&[]));
    // IDLE, ARM, RUNPOST, back to IDLE: one complete transient shot. The
    // long pause after the ARM line guarantees wait_armed consumes the edge
    // before the stop edge clears the armed latch.
    mock.serve_status(vec![
        ("0 0 100000 0 0", Duration::from_millis(10)),
        ("1 0 100000 0 0", Duration::from_millis(300)),
        ("3 0 100000 50000 0", Duration::from_millis(30)),
        ("0 0 100000 100000 0", Duration::from_millis(30)),
    ]);

    let dev = Chassis::connect(HOST, mock.config()).await.unwrap();
    dev.wait_armed().await.unwrap();
    dev.wait_stopped().await.unwrap();
    assert_eq!(dev.state(), CaptureState::Idle);
    assert_eq!(dev.post_samples(), 100_000);
    assert_eq!(dev.elapsed_samples(), 100_000);
    dev.close().await;
}

#[tokio::test]
async fn demuxed_read_fetches_per_channel_ports() {
    let ch1: Vec<i16> = (0..100).collect();
    let ch2: Vec<i16> = (0..100).map(|v| -1000 - v).collect();

    let mut mock = MockChassis::bind().await;
    mock.serve_site(
        0,
        knob_table(&[
            ("SITELIST", "1,1=acq425"),
            ("state", "0 0 100 0 1"),
            ("NCHAN", "2"),
            ("data32", "0"),
        ]),
    );
    mock.serve_site(1, knob_table(&[]));
    // Status feed reports demux on; 100 samples configured.
    mock.serve_status(vec![("0 0 100 0 1", Duration::from_millis(20))]);
    mock.serve_data(1, encode_i16(&ch1));
    mock.serve_data(2, encode_i16(&ch2));

    let dev = Chassis::connect(HOST, mock.config()).await.unwrap();

    let channels = dev.read_channels(&[], 100).await.unwrap();
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[0].as_i16().unwrap(), &ch1[..]);
    assert_eq!(channels[1].as_i16().unwrap(), &ch2[..]);

    // count = 0 resolves to the shot's configured sample total.
    let whole_shot = dev.read_channels(&[2], 0).await.unwrap();
    assert_eq!(whole_shot[0].as_i16().unwrap(), &ch2[..]);

    // Out-of-range channel is rejected before any port is touched.
    assert!(matches!(
        dev.read_channels(&[3], 10).await,
        Err(ChassisError::InvalidChannel { chan: 3, nchan: 2 })
    ));
    dev.close().await;
}

#[tokio::test]
async fn multiplexed_read_deinterleaves_the_aggregate_stream() {
    // Interleaved frames ch1,ch2 per sample; data32 device.
    let muxed = [1i32, -1, 2, -2, 3, -3];

    let mut mock = MockChassis::bind().await;
    mock.serve_site(
        0,
        knob_table(&[
            ("SITELIST", "1,1=acq425"),
            ("state", "0 0 3 0 0"),
            ("NCHAN", "2"),
            ("data32", "1"),
            ("transient", "PRE=0 POST=3 SOFT_TRIGGER=1 DEMUX=0"),
        ]),
    );
    mock.serve_site(1, knob_table(&[]));
    mock.serve_data(0, encode_i32(&muxed));
    let mut config = mock.config();
    config.monitor = false;

    let dev = Chassis::connect(HOST, config).await.unwrap();
    assert!(!dev.get_demux_state().await.unwrap());
    assert_eq!(dev.sample_width().await.unwrap(), SampleWidth::I32);

    let channels = dev.read_channels(&[], 3).await.unwrap();
    assert_eq!(channels[0].as_i32().unwrap(), &[1, 2, 3]);
    assert_eq!(channels[1].as_i32().unwrap(), &[-1, -2, -3]);

    // The raw aggregate is available undecimated as well.
    let raw = dev.read_muxed().await.unwrap();
    assert_eq!(raw.as_i32().unwrap(), &muxed[..]);
    dev.close().await;
}

#[tokio::test]
async fn calibration_converts_raw_codes_to_volts() {
    let mut mock = MockChassis::bind().await;
    mock.serve_site(
        0,
        knob_table(&[
            ("SITELIST", "2,1=acq425,2=acq425"),
            ("state", "0 0 0 0 0"),
            ("aggregator", "reg=0x09 sites=1,2 threshold=16384"),
        ]),
    );
    // Two channels per site; site 2 has coarser gain and a bias.
    mock.serve_site(
        1,
        knob_table(&[
            ("AI_CAL_ESLO", "2 V 0.0005 0.0005"),
            ("AI_CAL_EOFF", "2 V 0.0 0.0"),
        ]),
    );
    mock.serve_site(
        2,
        knob_table(&[
            ("AI_CAL_ESLO", "2 V 0.001 0.001"),
            ("AI_CAL_EOFF", "2 V 0.5 0.5"),
        ]),
    );
    let mut config = mock.config();
    config.monitor = false;

    let dev = Chassis::connect(HOST, config).await.unwrap();
    let cal = dev.fetch_all_calibration().await.unwrap();
    // 1 placeholder + 2 channels from each aggregated site.
    assert_eq!(cal.scale.len(), 5);
    assert_eq!(cal.scale[1], 0.0005);
    assert_eq!(cal.offset[3], 0.5);

    // Channel 3 is site 2's first channel: volts = raw * 0.001 + 0.5.
    let volts = dev
        .chan2volts(3, &Samples::I16(vec![1000, -500, 0]))
        .await
        .unwrap();
    for (got, want) in volts.iter().zip([1.5, 0.0, 0.5]) {
        assert!((got - want).abs() < 1e-12, "got {got}, want {want}");
    }
    dev.close().await;
}

#[tokio::test]
async fn waveform_load_uploads_and_respects_busy() {
    let payload = encode_i16(&(0..256).map(|v| v as i16).collect::<Vec<_>>());

    let mut mock = MockChassis::bind().await;
    let awg_knobs = knob_table(&[("task_active", "0")]);
    mock.serve_site(
        0,
        knob_table(&[("SITELIST", "2,1=acq425,3=ao420"), ("state", "0 0 0 0 0")]),
    );
    mock.serve_site(1, knob_table(&[]));
    mock.serve_site(3, Arc::clone(&awg_knobs));
    let awg_once = mock.ports.awg_once;
    let captured = mock.serve_awg(awg_once);
    let mut config = mock.config();
    config.monitor = false;

    let dev = Chassis::connect(HOST, config).await.unwrap();
    assert_eq!(dev.awg_site(), Some(3));

    dev.load_awg(&payload, AwgMode::Once).await.unwrap();
    assert_eq!(*captured.lock().unwrap(), payload);

    // A load already in flight on the module must fail fast, not queue.
    awg_knobs
        .lock()
        .unwrap()
        .insert("task_active".to_string(), "1".to_string());
    assert!(matches!(
        dev.load_awg(&payload, AwgMode::Once).await,
        Err(ChassisError::Busy(_))
    ));
    dev.close().await;
}

#[tokio::test]
async fn stream_port_yields_blocks_until_close() {
    let mut mock = MockChassis::bind().await;
    mock.serve_site(
        0,
        knob_table(&[("SITELIST", "1,1=acq425"), ("state", "0 0 0 0 0")]),
    );
    mock.serve_site(1, knob_table(&[]));
    mock.serve_stream(encode_i16(&(0..10).collect::<Vec<i16>>()));
    let mut config = mock.config();
    config.monitor = false;

    let dev = Chassis::connect(HOST, config).await.unwrap();
    let mut blocks = dev.stream_blocks(4, SampleWidth::I16).await.unwrap();
    assert_eq!(
        blocks.next().await.unwrap().unwrap().as_i16().unwrap(),
        &[0, 1, 2, 3]
    );
    assert_eq!(
        blocks.next().await.unwrap().unwrap().as_i16().unwrap(),
        &[4, 5, 6, 7]
    );
    // The tail comes back as one short block, then the sequence ends.
    assert_eq!(
        blocks.next().await.unwrap().unwrap().as_i16().unwrap(),
        &[8, 9]
    );
    assert!(blocks.next().await.unwrap().is_none());
    dev.close().await;
}

#[tokio::test]
async fn registry_shares_one_proxy_per_host() {
    let mut mock = MockChassis::bind().await;
    mock.serve_site(
        0,
        knob_table(&[("SITELIST", "1,1=acq425"), ("state", "0 0 0 0 0")]),
    );
    mock.serve_site(1, knob_table(&[]));
    let mut config = mock.config();
    config.monitor = false;

    let registry = ChassisRegistry::new(config);
    let first = registry.open(HOST).await.unwrap();
    let second = registry.open(HOST).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.hosts().await, vec![HOST.to_string()]);

    assert!(registry.close(HOST).await);
    assert!(registry.get(HOST).await.is_none());
    // Outstanding handles keep working after deregistration.
    assert_eq!(first.mod_count(), 1);
}
