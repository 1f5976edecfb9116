use serde::{Serialize, Serializer};

use crate::Error;

/// Stream the device shadow is published on.
pub const SHADOW_STREAM: &str = "device_shadow";

/// Position of the blind actuator, driven through a single GPIO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlindState {
    #[default]
    Open,
    Closed,
}

impl BlindState {
    pub fn toggled(self) -> Self {
        match self {
            Self::Open => Self::Closed,
            Self::Closed => Self::Open,
        }
    }

    /// Output level of the actuator pin, high means open.
    pub fn is_open(self) -> bool {
        self == Self::Open
    }

    /// Human readable status reported in the shadow.
    pub fn status(self) -> &'static str {
        match self {
            Self::Open => "Blinds are Open!",
            Self::Closed => "Blinds are Closed!",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Open => "BLIND_OPEN",
            Self::Closed => "BLIND_CLOSE",
        }
    }
}

/// Blind state plus the toggle requested by the cloud but not yet applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Blinds {
    state: BlindState,
    toggle_pending: bool,
}

impl Blinds {
    pub fn new(state: BlindState) -> Self {
        Self {
            state,
            toggle_pending: false,
        }
    }

    pub fn state(&self) -> BlindState {
        self.state
    }

    pub fn request_toggle(&mut self) {
        self.toggle_pending = true;
    }

    pub fn is_toggle_pending(&self) -> bool {
        self.toggle_pending
    }

    /// Applies a pending toggle and returns the new state the GPIO has to follow.
    pub fn apply_pending(&mut self) -> Option<BlindState> {
        if !core::mem::take(&mut self.toggle_pending) {
            return None;
        }
        self.state = self.state.toggled();
        Some(self.state)
    }
}

/// Latest values read from the sensors.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Readings {
    /// Temperature [°C]
    pub temperature: f32,
    /// Relative humidity [%RH]
    pub humidity: f32,
    /// Equivalent CO2 [ppm]
    pub carbon: u16,
}

impl Default for Readings {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            humidity: 90.0,
            carbon: 0,
        }
    }
}

/// Monotonic counter stamped on every outgoing document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SequenceCounter(u64);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    pub fn current(&self) -> u64 {
        self.0
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct DeviceShadow<'a> {
    pub timestamp: u64,
    pub sequence: u64,
    #[serde(rename = "Status")]
    pub status: &'a str,
    #[serde(serialize_with = "finite_or_null")]
    pub temperature: f32,
    #[serde(serialize_with = "finite_or_null")]
    pub humidity: f32,
    pub carbon: u16,
}

fn finite_or_null<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f32(*value)
    } else {
        serializer.serialize_none()
    }
}

/// Serializes a document the way the broker expects it: a batch holding one element.
pub fn encode_batch<'b, T: Serialize>(item: &T, buf: &'b mut [u8]) -> Result<&'b [u8], Error> {
    let batch = core::slice::from_ref(item);
    let len = serde_json_core::to_slice(&batch, buf)?;
    Ok(&buf[..len])
}

/// Builds device shadow documents, owning the shadow sequence number.
#[derive(Default)]
pub struct ShadowEncoder {
    sequence: SequenceCounter,
}

impl ShadowEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.current()
    }

    /// Encodes the next shadow into `buf`.
    ///
    /// The sequence number is consumed even if the document does not fit.
    pub fn encode<'b>(
        &mut self,
        timestamp: u64,
        blinds: BlindState,
        readings: &Readings,
        buf: &'b mut [u8],
    ) -> Result<&'b [u8], Error> {
        let shadow = DeviceShadow {
            timestamp,
            sequence: self.sequence.next(),
            status: blinds.status(),
            temperature: readings.temperature,
            humidity: readings.humidity,
            carbon: readings.carbon,
        };
        encode_batch(&shadow, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readings() -> Readings {
        Readings {
            temperature: 21.5,
            humidity: 40.0,
            carbon: 412,
        }
    }

    #[test]
    fn shadow_is_a_single_element_array() {
        let mut encoder = ShadowEncoder::new();
        let mut buf = [0u8; 256];
        let json = encoder
            .encode(1_700_000_000_000, BlindState::Open, &readings(), &mut buf)
            .unwrap();
        let json = core::str::from_utf8(json).unwrap();

        assert!(json.starts_with(r#"[{"timestamp":1700000000000,"sequence":1,"#));
        assert!(json.contains(r#""Status":"Blinds are Open!""#));
        assert!(json.contains(r#""temperature":21.5"#));
        assert!(json.ends_with(r#""carbon":412}]"#));
    }

    #[test]
    fn sequence_increases_per_publish() {
        let mut encoder = ShadowEncoder::new();
        let mut buf = [0u8; 256];
        for expected in 1..=3u64 {
            let json = encoder
                .encode(0, BlindState::Closed, &readings(), &mut buf)
                .unwrap();
            let json = core::str::from_utf8(json).unwrap();
            let needle = format!(r#""sequence":{},"#, expected);
            assert!(json.contains(&needle), "{}", json);
            assert!(json.contains("Blinds are Closed!"));
        }
        assert_eq!(encoder.sequence(), 3);
    }

    #[test]
    fn overflow_consumes_sequence() {
        let mut encoder = ShadowEncoder::new();
        let mut small = [0u8; 16];
        assert_eq!(
            encoder.encode(0, BlindState::Open, &readings(), &mut small),
            Err(Error::BufferFull)
        );

        let mut buf = [0u8; 256];
        let json = encoder
            .encode(0, BlindState::Open, &readings(), &mut buf)
            .unwrap();
        assert!(core::str::from_utf8(json)
            .unwrap()
            .contains(r#""sequence":2,"#));
    }

    #[test]
    fn failed_reading_is_null() {
        let mut encoder = ShadowEncoder::new();
        let mut buf = [0u8; 256];
        let broken = Readings {
            temperature: f32::NAN,
            humidity: f32::INFINITY,
            carbon: 0,
        };
        let json = encoder
            .encode(0, BlindState::Open, &broken, &mut buf)
            .unwrap();
        let json = core::str::from_utf8(json).unwrap();

        assert!(json.contains(r#""temperature":null,"humidity":null,"#));
    }

    #[test]
    fn toggle_is_applied_once() {
        let mut blinds = Blinds::default();
        assert_eq!(blinds.state(), BlindState::Open);
        assert_eq!(blinds.apply_pending(), None);

        blinds.request_toggle();
        blinds.request_toggle();
        assert!(blinds.is_toggle_pending());
        assert_eq!(blinds.apply_pending(), Some(BlindState::Closed));
        assert_eq!(blinds.apply_pending(), None);
        assert!(!blinds.state().is_open());

        blinds.request_toggle();
        assert_eq!(blinds.apply_pending(), Some(BlindState::Open));
    }
}
