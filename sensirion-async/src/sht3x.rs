use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use crate::{Error, SensirionCommand, SensirionI2c};

pub const DEFAULT_ADDRESS: u8 = 0x44;

#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Command {
    MeasureHighRepeatability,
    MeasureMediumRepeatability,
    MeasureLowRepeatability,
    SoftReset,
    ReadStatus,
    ClearStatus,
    HeaterEnable,
    HeaterDisable,
}

impl SensirionCommand for Command {
    fn raw(&self) -> u16 {
        match self {
            // single shot, clock stretching disabled
            Command::MeasureHighRepeatability => 0x2400,
            Command::MeasureMediumRepeatability => 0x240b,
            Command::MeasureLowRepeatability => 0x2416,
            Command::SoftReset => 0x30a2,
            Command::ReadStatus => 0xf32d,
            Command::ClearStatus => 0x3041,
            Command::HeaterEnable => 0x306d,
            Command::HeaterDisable => 0x3066,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Repeatability {
    #[default]
    High,
    Medium,
    Low,
}

impl Repeatability {
    fn command(self) -> Command {
        match self {
            Self::High => Command::MeasureHighRepeatability,
            Self::Medium => Command::MeasureMediumRepeatability,
            Self::Low => Command::MeasureLowRepeatability,
        }
    }

    /// Maximum measurement duration from the datasheet.
    fn duration_ms(self) -> u32 {
        match self {
            Self::High => 15,
            Self::Medium => 6,
            Self::Low => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Measurement {
    /// Temperature [°C]
    pub temperature: f32,
    /// Relative humidity [%RH]
    pub humidity: f32,
}

impl Measurement {
    pub fn from_raw(raw_temperature: u16, raw_humidity: u16) -> Self {
        Self {
            temperature: -45.0 + 175.0 * raw_temperature as f32 / u16::MAX as f32,
            humidity: 100.0 * raw_humidity as f32 / u16::MAX as f32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status(pub u16);

impl Status {
    pub fn alert_pending(&self) -> bool {
        self.0 & (1 << 15) != 0
    }

    pub fn heater_on(&self) -> bool {
        self.0 & (1 << 13) != 0
    }

    pub fn reset_detected(&self) -> bool {
        self.0 & (1 << 4) != 0
    }

    pub fn command_failed(&self) -> bool {
        self.0 & (1 << 1) != 0
    }

    pub fn checksum_failed(&self) -> bool {
        self.0 & 1 != 0
    }
}

/// SHT3x temperature and humidity sensor (SHT30, SHT31, SHT35).
pub struct Sht3x<T>
where
    T: I2c,
{
    bus: SensirionI2c<T>,
    address: u8,
}

impl<T> Sht3x<T>
where
    T: I2c,
{
    pub fn new(bus: T) -> Self {
        Self::with_address(bus, DEFAULT_ADDRESS)
    }

    /// Sensor with the ADDR pin pulled high answers on 0x45.
    pub fn with_address(bus: T, address: u8) -> Self {
        Self {
            bus: SensirionI2c::new(bus),
            address,
        }
    }

    pub fn release(self) -> T {
        self.bus.release()
    }

    pub async fn measure(
        &mut self,
        repeatability: Repeatability,
        delay: &mut impl DelayNs,
    ) -> Result<Measurement, Error<T::Error>> {
        self.bus
            .write_command(self.address, repeatability.command())
            .await?;
        delay.delay_ms(repeatability.duration_ms()).await;

        let mut result = [0u8; 6];
        self.bus.read_words(self.address, &mut result).await?;

        Ok(Measurement::from_raw(
            u16::from_be_bytes([result[0], result[1]]),
            u16::from_be_bytes([result[3], result[4]]),
        ))
    }

    pub async fn soft_reset(&mut self, delay: &mut impl DelayNs) -> Result<(), Error<T::Error>> {
        self.bus
            .write_command(self.address, Command::SoftReset)
            .await?;
        delay.delay_ms(2).await;
        Ok(())
    }

    pub async fn status(&mut self) -> Result<Status, Error<T::Error>> {
        self.bus
            .read_word(self.address, Command::ReadStatus, true)
            .await
            .map(Status)
    }

    pub async fn clear_status(&mut self) -> Result<(), Error<T::Error>> {
        self.bus
            .write_command(self.address, Command::ClearStatus)
            .await
    }

    pub async fn set_heater(&mut self, enabled: bool) -> Result<(), Error<T::Error>> {
        let command = if enabled {
            Command::HeaterEnable
        } else {
            Command::HeaterDisable
        };
        self.bus.write_command(self.address, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{with_crc, NoDelay};
    use crate::ParsingError;
    use embassy_futures::block_on;
    use embedded_hal_mock::eh1::i2c::{Mock, Transaction};

    #[test]
    fn conversion() {
        let measurement = Measurement::from_raw(0x6666, 0x8000);
        assert!((measurement.temperature - 25.0).abs() < 0.01);
        assert!((measurement.humidity - 50.0).abs() < 0.01);

        let cold = Measurement::from_raw(0, 0);
        assert_eq!(cold.temperature, -45.0);
        assert_eq!(cold.humidity, 0.0);
    }

    #[test]
    fn single_shot_measurement() {
        let expectations = [
            Transaction::write(DEFAULT_ADDRESS, vec![0x24, 0x00]),
            Transaction::read(DEFAULT_ADDRESS, with_crc(&[0x6666, 0x8000])),
        ];
        let mut i2c = Mock::new(&expectations);
        let mut sensor = Sht3x::new(i2c.clone());

        let measurement = block_on(sensor.measure(Repeatability::High, &mut NoDelay)).unwrap();
        assert!((measurement.temperature - 25.0).abs() < 0.01);
        assert!((measurement.humidity - 50.0).abs() < 0.01);

        i2c.done();
    }

    #[test]
    fn corrupted_measurement() {
        let mut response = with_crc(&[0x6666, 0x8000]);
        response[5] ^= 0xff;
        let expectations = [
            Transaction::write(0x45, vec![0x24, 0x16]),
            Transaction::read(0x45, response),
        ];
        let mut i2c = Mock::new(&expectations);
        let mut sensor = Sht3x::with_address(i2c.clone(), 0x45);

        let result = block_on(sensor.measure(Repeatability::Low, &mut NoDelay));
        assert!(matches!(result, Err(Error::Parsing(ParsingError::Crc))));

        i2c.done();
    }

    #[test]
    fn status_register() {
        let expectations = [
            Transaction::write(DEFAULT_ADDRESS, vec![0xf3, 0x2d]),
            Transaction::read(DEFAULT_ADDRESS, with_crc(&[0x8010])),
            Transaction::write(DEFAULT_ADDRESS, vec![0x30, 0x41]),
        ];
        let mut i2c = Mock::new(&expectations);
        let mut sensor = Sht3x::new(i2c.clone());

        let status = block_on(sensor.status()).unwrap();
        assert!(status.alert_pending());
        assert!(status.reset_detected());
        assert!(!status.heater_on());
        assert!(!status.checksum_failed());
        block_on(sensor.clear_status()).unwrap();

        i2c.done();
    }

    #[test]
    fn heater_and_reset() {
        let expectations = [
            Transaction::write(DEFAULT_ADDRESS, vec![0x30, 0x6d]),
            Transaction::write(DEFAULT_ADDRESS, vec![0x30, 0x66]),
            Transaction::write(DEFAULT_ADDRESS, vec![0x30, 0xa2]),
        ];
        let mut i2c = Mock::new(&expectations);
        let mut sensor = Sht3x::new(i2c.clone());

        block_on(sensor.set_heater(true)).unwrap();
        block_on(sensor.set_heater(false)).unwrap();
        block_on(sensor.soft_reset(&mut NoDelay)).unwrap();

        i2c.done();
    }
}
