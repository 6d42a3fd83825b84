//! Wire-level traffic capture for debugging.
//!
//! Each bridged session owns one [`DumpBuffer`] per direction. Bridge loops
//! append the bytes they forward; a periodic flush renders everything
//! accumulated so far as a hex/ASCII snapshot, logs it as a single record and
//! empties the buffer.
//!
//! Rendering ([`render_hex_dump`]) is independent of logging so it can be
//! tested on its own.

use std::fmt;
use std::sync::Mutex;
use tracing::info;

/// Bytes per rendered row.
pub const BYTES_PER_ROW: usize = 16;

/// Direction of a captured stream, logged as its numeric tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client WebSocket → upstream TCP.
    ClientToUpstream,
    /// Upstream TCP → client WebSocket.
    UpstreamToClient,
}

impl Direction {
    pub fn tag(self) -> u8 {
        match self {
            Direction::ClientToUpstream => 1,
            Direction::UpstreamToClient => 2,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Capture verbosity.
///
/// | Level | Captured directions          |
/// |-------|------------------------------|
/// | 0     | none                         |
/// | 1     | client → upstream            |
/// | ≥2    | client → upstream and back   |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct CaptureLevel(pub u8);

impl CaptureLevel {
    pub const OFF: CaptureLevel = CaptureLevel(0);

    pub fn is_enabled(self) -> bool {
        self.0 > 0
    }

    /// Whether traffic flowing in `direction` is captured at this level.
    pub fn captures(self, direction: Direction) -> bool {
        match direction {
            Direction::ClientToUpstream => self.0 >= 1,
            Direction::UpstreamToClient => self.0 >= 2,
        }
    }
}

/// A rendered snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexDump {
    /// Hex bytes separated by single spaces.
    pub hex: String,
    /// Printable ASCII, `.` for everything else.
    pub ascii: String,
}

/// Render bytes as 16-byte rows of hex and printable ASCII, then join the
/// rows' hex groups with single spaces and their ASCII groups with nothing.
pub fn render_hex_dump(data: &[u8]) -> HexDump {
    let mut hex = String::with_capacity(data.len() * 3);
    let mut ascii = String::with_capacity(data.len());

    for row in data.chunks(BYTES_PER_ROW) {
        let encoded = hex::encode(row);
        for pair in encoded.as_bytes().chunks(2) {
            if !hex.is_empty() {
                hex.push(' ');
            }
            hex.push(char::from(pair[0]));
            hex.push(char::from(pair[1]));
        }
        ascii.extend(row.iter().map(|&b| printable(b)));
    }

    HexDump { hex, ascii }
}

fn printable(b: u8) -> char {
    if (0x20..=0x7e).contains(&b) {
        b as char
    } else {
        '.'
    }
}

/// Per-direction capture buffer. `write` and `flush` may race freely; a
/// flush always takes the whole buffer at once.
#[derive(Debug)]
pub struct DumpBuffer {
    direction: Direction,
    buf: Mutex<Vec<u8>>,
}

impl DumpBuffer {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            buf: Mutex::new(Vec::new()),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Append captured bytes.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.lock().extend_from_slice(data);
    }

    /// Number of bytes waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Log the accumulated bytes as one `dump` record and reset the buffer.
    ///
    /// Returns the rendered snapshot, or `None` (and logs nothing) when the
    /// buffer is empty.
    pub fn flush(&self) -> Option<HexDump> {
        let data = std::mem::take(&mut *self.lock());
        if data.is_empty() {
            return None;
        }

        let dump = render_hex_dump(&data);
        info!(
            direction = self.direction.tag(),
            hex = %dump.hex,
            ascii = %dump.ascii,
            "dump"
        );
        Some(dump)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The pair of capture buffers owned by one session.
#[derive(Debug)]
pub struct Capture {
    level: CaptureLevel,
    client_to_upstream: DumpBuffer,
    upstream_to_client: DumpBuffer,
}

impl Capture {
    pub fn new(level: CaptureLevel) -> Self {
        Self {
            level,
            client_to_upstream: DumpBuffer::new(Direction::ClientToUpstream),
            upstream_to_client: DumpBuffer::new(Direction::UpstreamToClient),
        }
    }

    pub fn level(&self) -> CaptureLevel {
        self.level
    }

    /// Tee forwarded bytes into the buffer for `direction` if the level
    /// captures it.
    pub fn record(&self, direction: Direction, data: &[u8]) {
        if self.level.captures(direction) {
            self.buffer(direction).write(data);
        }
    }

    pub fn buffer(&self, direction: Direction) -> &DumpBuffer {
        match direction {
            Direction::ClientToUpstream => &self.client_to_upstream,
            Direction::UpstreamToClient => &self.upstream_to_client,
        }
    }

    /// Flush both directions.
    pub fn flush(&self) {
        self.client_to_upstream.flush();
        self.upstream_to_client.flush();
    }
}
