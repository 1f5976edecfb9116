//! SNTP packet handling and the wall clock derived from it.

pub const NTP_PORT: u16 = 123;
pub const NTP_PACKET_LEN: usize = 48;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const MODE_SERVER: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SntpError {
    /// Response shorter than an NTP header
    Truncated,
    /// Packet was not sent by a server
    UnexpectedMode(u8),
    /// Server asked us to back off (stratum 0)
    KissOfDeath,
    /// Stratum above the configured maximum
    InvalidStratum(u8),
    /// Transmit timestamp missing or before the Unix epoch
    InvalidTimestamp,
}

impl core::fmt::Display for SntpError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated response"),
            Self::UnexpectedMode(mode) => write!(f, "unexpected mode {}", mode),
            Self::KissOfDeath => write!(f, "kiss of death"),
            Self::InvalidStratum(stratum) => write!(f, "invalid stratum {}", stratum),
            Self::InvalidTimestamp => write!(f, "invalid timestamp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timestamp {
    pub unix_secs: u64,
    pub micros: u32,
}

impl Timestamp {
    pub fn from_ntp(ntp_secs: u64, fraction: u32) -> Self {
        Self {
            unix_secs: ntp_secs.saturating_sub(NTP_UNIX_OFFSET),
            micros: ((fraction as u64 * 1_000_000) >> 32) as u32,
        }
    }

    /// Shifts the timestamp forward, used for round-trip correction.
    pub fn delayed_by(self, micros: u64) -> Self {
        let total = self.micros as u64 + micros;
        Self {
            unix_secs: self.unix_secs + total / 1_000_000,
            micros: (total % 1_000_000) as u32,
        }
    }

    pub fn as_millis(&self) -> u64 {
        self.unix_secs * 1000 + self.micros as u64 / 1000
    }
}

/// Client request: LI=0, VN=3, Mode=3 (client).
pub fn request() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = 0x1b;
    packet
}

/// Validates a server response and extracts its transmit timestamp.
pub fn parse_response(response: &[u8], max_stratum: u8) -> Result<Timestamp, SntpError> {
    if response.len() < NTP_PACKET_LEN {
        return Err(SntpError::Truncated);
    }

    let mode = response[0] & 0x07;
    if mode != MODE_SERVER {
        return Err(SntpError::UnexpectedMode(mode));
    }

    match response[1] {
        0 => return Err(SntpError::KissOfDeath),
        stratum if stratum > max_stratum => return Err(SntpError::InvalidStratum(stratum)),
        _ => {}
    }

    let secs = u32::from_be_bytes([response[40], response[41], response[42], response[43]]) as u64;
    let fraction = u32::from_be_bytes([response[44], response[45], response[46], response[47]]);
    if secs < NTP_UNIX_OFFSET {
        return Err(SntpError::InvalidTimestamp);
    }

    Ok(Timestamp::from_ntp(secs, fraction))
}

/// Maps the monotonic uptime onto Unix time once a synchronization happened.
///
/// An unsynchronized clock reports the uptime itself, as if the device booted at the epoch.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WallClock {
    boot_unix_ms: Option<u64>,
}

impl WallClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(&mut self, unix_ms: u64, uptime_ms: u64) {
        self.boot_unix_ms = Some(unix_ms.saturating_sub(uptime_ms));
    }

    pub fn is_synced(&self) -> bool {
        self.boot_unix_ms.is_some()
    }

    pub fn now_ms(&self, uptime_ms: u64) -> u64 {
        self.boot_unix_ms.unwrap_or(0) + uptime_ms
    }
}
