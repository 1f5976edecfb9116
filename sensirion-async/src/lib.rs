#![cfg_attr(not(test), no_std)]

pub mod ccs811;
pub mod sht3x;

use crc_all::Crc;
use embedded_hal_async::i2c::I2c;

pub trait SensirionCommand {
    fn raw(&self) -> u16;
}

#[derive(Debug)]
pub enum Error<Inner: core::fmt::Debug> {
    Bus(Inner),
    Parsing(ParsingError),
    Device(DeviceError),
}

impl<E: embedded_hal_async::i2c::Error> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Bus(e)
    }
}

#[cfg(feature = "defmt")]
impl<E: embedded_hal_async::i2c::Error + defmt::Format> defmt::Format for Error<E> {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Error::Bus(e) => e.format(fmt),
            Error::Parsing(e) => e.format(fmt),
            Error::Device(e) => e.format(fmt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParsingError {
    Crc,
}

/// The sensor answered, but not the way a working part would.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceError {
    UnexpectedHardwareId(u8),
    /// No valid application firmware on the sensor
    NoApplication,
    /// Sensor is still in boot mode
    NotInApplicationMode,
    /// Error flagged by the sensor, carries its error register
    Sensor(u8),
}

impl<T: core::fmt::Debug> From<ParsingError> for Error<T> {
    fn from(e: ParsingError) -> Self {
        Error::Parsing(e)
    }
}

impl<T: core::fmt::Debug> From<DeviceError> for Error<T> {
    fn from(e: DeviceError) -> Self {
        Error::Device(e)
    }
}

pub struct SensirionI2c<T>
where
    T: I2c,
{
    bus: T,
    crc: SensirionCrc,
}

impl<T> SensirionI2c<T>
where
    T: I2c,
{
    pub fn new(bus: T) -> SensirionI2c<T> {
        Self {
            bus,
            crc: Default::default(),
        }
    }

    pub fn release(self) -> T {
        self.bus
    }

    pub async fn write_command<Command: SensirionCommand>(
        &mut self,
        address: u8,
        command: Command,
    ) -> Result<(), Error<T::Error>> {
        self.bus
            .write(address, &command.raw().to_be_bytes())
            .await?;
        Ok(())
    }

    pub async fn read_word<Command: SensirionCommand>(
        &mut self,
        address: u8,
        command: Command,
        check_crc: bool,
    ) -> Result<u16, Error<T::Error>> {
        self.write_command(address, command).await?;

        let mut buffer = [0; 3];
        self.bus.read(address, &mut buffer).await?;

        if check_crc {
            self.check_words(&buffer)?;
        }

        Ok(u16::from_be_bytes([buffer[0], buffer[1]]))
    }

    /// Reads `buffer.len() / 3` words, each followed by its CRC.
    pub async fn read_words(
        &mut self,
        address: u8,
        buffer: &mut [u8],
    ) -> Result<(), Error<T::Error>> {
        self.bus.read(address, buffer).await?;
        self.check_words(buffer)?;
        Ok(())
    }

    fn check_words(&mut self, buffer: &[u8]) -> Result<(), ParsingError> {
        for word in buffer.chunks_exact(3) {
            if self.crc.calculate(&word[..2]) != word[2] {
                return Err(ParsingError::Crc);
            }
        }
        Ok(())
    }
}

pub(crate) struct SensirionCrc {
    inner: Crc<u8>,
}

impl SensirionCrc {
    pub fn new() -> Self {
        Self {
            inner: crc_all::Crc::<u8>::new(0x31, 8, 0xff, 0x00, false),
        }
    }

    pub fn calculate(&mut self, input: &[u8]) -> u8 {
        self.inner.init();
        self.inner.update(input);
        self.inner.finish()
    }
}

impl Default for SensirionCrc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Delay that returns immediately.
    pub struct NoDelay;

    impl embedded_hal_async::delay::DelayNs for NoDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    /// Appends the CRC to every word, the way the sensor sends them.
    pub fn with_crc(words: &[u16]) -> Vec<u8> {
        let mut crc = SensirionCrc::new();
        words
            .iter()
            .flat_map(|word| {
                let bytes = word.to_be_bytes();
                [bytes[0], bytes[1], crc.calculate(&bytes)]
            })
            .collect()
    }

    #[test]
    fn crc() {
        let mut crc = SensirionCrc::new();

        assert_eq!(0x92, crc.calculate(&[0xbe, 0xef]));
    }

    #[test]
    fn crc_framing() {
        assert_eq!(with_crc(&[0xbeef]), vec![0xbe, 0xef, 0x92]);
    }
}
