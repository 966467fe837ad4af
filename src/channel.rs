//! Binary channel-data client.
//!
//! Post-shot sample data arrives on the data ports as raw little-endian
//! fixed-width signed integers: one contiguous stream per channel when the
//! appliance demultiplexes, or one channel-interleaved aggregate stream on
//! the combined port. TCP hands this back in arbitrary fragments, so the
//! client accumulates bytes across reads and decodes only once a whole
//! number of requested elements is buffered, so a caller never sees a
//! truncated sample.
//!
//! Width and signedness are caller-supplied from the device's reported
//! sample format; nothing is inferred from the data.

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::config::ChassisConfig;
use crate::error::{ChassisError, ChassisResult};
use crate::net::{Connection, Link};

/// Fixed sample width, in bytes, of one raw integer code.
///
/// Device-wide property, fixed for the duration of one shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleWidth {
    /// 8-bit signed.
    I8,
    /// 16-bit signed (the common ADC format).
    I16,
    /// 32-bit signed (`data32` devices).
    I32,
}

impl SampleWidth {
    /// Size of one element in bytes.
    pub fn bytes(self) -> usize {
        match self {
            SampleWidth::I8 => 1,
            SampleWidth::I16 => 2,
            SampleWidth::I32 => 4,
        }
    }

    /// Map a byte count onto a width.
    pub fn from_bytes(n: usize) -> ChassisResult<Self> {
        match n {
            1 => Ok(SampleWidth::I8),
            2 => Ok(SampleWidth::I16),
            4 => Ok(SampleWidth::I32),
            other => Err(ChassisError::Parse(format!(
                "unsupported sample width: {other} bytes"
            ))),
        }
    }
}

/// A decoded sample buffer in its native width.
///
/// Keeping the native representation avoids widening whole shots to `f64`
/// just to look at them; calibration converts on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Samples {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
}

impl Samples {
    /// Decode as many whole elements as `bytes` holds, little-endian.
    pub fn decode(bytes: &[u8], width: SampleWidth) -> Self {
        match width {
            SampleWidth::I8 => Samples::I8(bytes.iter().map(|&b| b as i8).collect()),
            SampleWidth::I16 => Samples::I16(
                bytes
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            SampleWidth::I32 => Samples::I32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Samples::I8(v) => v.len(),
            Samples::I16(v) => v.len(),
            Samples::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Width of the stored elements.
    pub fn width(&self) -> SampleWidth {
        match self {
            Samples::I8(_) => SampleWidth::I8,
            Samples::I16(_) => SampleWidth::I16,
            Samples::I32(_) => SampleWidth::I32,
        }
    }

    /// Element at `index`, widened to `i32`.
    pub fn get(&self, index: usize) -> Option<i32> {
        match self {
            Samples::I8(v) => v.get(index).map(|&x| x as i32),
            Samples::I16(v) => v.get(index).map(|&x| x as i32),
            Samples::I32(v) => v.get(index).copied(),
        }
    }

    /// Widen all elements to `f64` (calibration input).
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Samples::I8(v) => v.iter().map(|&x| x as f64).collect(),
            Samples::I16(v) => v.iter().map(|&x| x as f64).collect(),
            Samples::I32(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }

    /// Every `stride`-th element starting at `offset`; de-interleaves one
    /// channel out of a multiplexed aggregate buffer.
    pub fn stride_select(&self, offset: usize, stride: usize) -> Samples {
        fn pick<T: Copy>(v: &[T], offset: usize, stride: usize) -> Vec<T> {
            v.iter().skip(offset).step_by(stride).copied().collect()
        }
        match self {
            Samples::I8(v) => Samples::I8(pick(v, offset, stride)),
            Samples::I16(v) => Samples::I16(pick(v, offset, stride)),
            Samples::I32(v) => Samples::I32(pick(v, offset, stride)),
        }
    }

    /// Borrow as `i16` elements, if that is the stored width.
    pub fn as_i16(&self) -> Option<&[i16]> {
        match self {
            Samples::I16(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow as `i32` elements, if that is the stored width.
    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            Samples::I32(v) => Some(v),
            _ => None,
        }
    }
}

const RECV_CHUNK: usize = 0x10000;

/// Reads typed sample data from one data port.
///
/// The same client serves both the per-channel ports and the aggregate
/// (multiplexed) port; only the port number differs. Bytes received beyond
/// what a read consumed stay buffered for the next read on this client.
pub struct ChannelDataClient {
    conn: Connection,
    channel: u32,
    pending: BytesMut,
}

impl ChannelDataClient {
    /// Connect to the data port for `channel`; channel 0 is the aggregate
    /// stream.
    pub async fn connect(host: &str, channel: u32, config: &ChassisConfig) -> ChassisResult<Self> {
        let conn = Connection::open(host, config.ports.data_port(channel), config.connect_timeout())
            .await?;
        Ok(Self::with_connection(conn, channel))
    }

    /// Wrap an established connection (tests, or the live stream port).
    pub fn with_connection(conn: Connection, channel: u32) -> Self {
        ChannelDataClient {
            conn,
            channel,
            pending: BytesMut::new(),
        }
    }

    /// Wrap an established link (tests).
    pub fn from_link(channel: u32, io: Box<dyn Link>) -> Self {
        Self::with_connection(Connection::from_link(io, format!("data{channel}")), channel)
    }

    /// Accumulate until `need` bytes are buffered. `Ok(false)` means the
    /// stream ended first.
    async fn fill(&mut self, need: usize) -> ChassisResult<bool> {
        while self.pending.len() < need {
            let chunk = self.conn.recv_raw(RECV_CHUNK).await?;
            if chunk.is_empty() {
                return Ok(false);
            }
            self.pending.extend_from_slice(&chunk);
        }
        Ok(true)
    }

    /// Read exactly `count` elements of the given width.
    ///
    /// Fails with [`ChassisError::ShortRead`] if the connection closes before
    /// enough bytes arrived; never returns a truncated buffer.
    pub async fn read(&mut self, count: usize, width: SampleWidth) -> ChassisResult<Samples> {
        let need = count * width.bytes();
        if !self.fill(need).await? {
            return Err(ChassisError::ShortRead {
                wanted: count,
                wanted_bytes: need,
                got_bytes: self.pending.len(),
            });
        }
        let frame = self.pending.split_to(need);
        Ok(Samples::decode(&frame, width))
    }

    /// Read until end of stream and decode the entire buffer.
    ///
    /// Used for unknown-length post-shot retrieval (the "count ≤ 0" read of
    /// the wire protocol). Whole elements only; a trailing fragment shorter
    /// than one element is dropped with a warning.
    pub async fn read_to_end(&mut self, width: SampleWidth) -> ChassisResult<Samples> {
        loop {
            let chunk = self.conn.recv_raw(RECV_CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            self.pending.extend_from_slice(&chunk);
        }
        let whole = self.pending.len() - self.pending.len() % width.bytes();
        if whole != self.pending.len() {
            warn!(
                channel = self.channel,
                trailing = self.pending.len() - whole,
                "dropping partial trailing sample at end of stream"
            );
        }
        let frame = self.pending.split_to(whole);
        self.pending.clear();
        debug!(channel = self.channel, elements = whole / width.bytes(), "stream drained");
        Ok(Samples::decode(&frame, width))
    }

    /// Turn this client into a lazy, finite, non-restartable sequence of
    /// decoded blocks of `count` elements, for continuous streaming. The
    /// sequence ends on a zero-length read; a final short block is yielded
    /// as-is.
    pub fn blocks(self, count: usize, width: SampleWidth) -> BlockReader {
        BlockReader {
            client: self,
            count,
            width,
            done: false,
        }
    }
}

/// Lazy block sequence over a data connection. See
/// [`ChannelDataClient::blocks`].
pub struct BlockReader {
    client: ChannelDataClient,
    count: usize,
    width: SampleWidth,
    done: bool,
}

impl BlockReader {
    /// Next decoded block, or `None` once the stream has ended.
    pub async fn next(&mut self) -> ChassisResult<Option<Samples>> {
        if self.done {
            return Ok(None);
        }
        let need = self.count * self.width.bytes();
        if self.client.fill(need).await? {
            let frame = self.client.pending.split_to(need);
            return Ok(Some(Samples::decode(&frame, self.width)));
        }
        // Stream ended; flush whatever whole elements are left as a final
        // short block.
        self.done = true;
        let whole = self.client.pending.len() - self.client.pending.len() % self.width.bytes();
        if whole == 0 {
            self.client.pending.clear();
            return Ok(None);
        }
        let frame = self.client.pending.split_to(whole);
        self.client.pending.clear();
        Ok(Some(Samples::decode(&frame, self.width)))
    }
}
