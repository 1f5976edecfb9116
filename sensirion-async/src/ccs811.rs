//! AMS CCS811 metal oxide gas sensor.
//!
//! Not a Sensirion part: registers are addressed by a single byte and the
//! payloads carry no CRC, so the driver talks to the bus directly.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use crate::{DeviceError, Error};

pub const DEFAULT_ADDRESS: u8 = 0x5a;
pub const HARDWARE_ID: u8 = 0x81;

mod register {
    pub const STATUS: u8 = 0x00;
    pub const MEAS_MODE: u8 = 0x01;
    pub const ALG_RESULT_DATA: u8 = 0x02;
    pub const ENV_DATA: u8 = 0x05;
    pub const HW_ID: u8 = 0x20;
    pub const ERROR_ID: u8 = 0xe0;
    pub const APP_START: u8 = 0xf4;
    pub const SW_RESET: u8 = 0xff;
}

const RESET_SEQUENCE: [u8; 4] = [0x11, 0xe5, 0x72, 0x8a];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status(pub u8);

impl Status {
    pub fn error(&self) -> bool {
        self.0 & 1 != 0
    }

    pub fn data_ready(&self) -> bool {
        self.0 & (1 << 3) != 0
    }

    pub fn app_valid(&self) -> bool {
        self.0 & (1 << 4) != 0
    }

    pub fn application_mode(&self) -> bool {
        self.0 & (1 << 7) != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriveMode {
    Idle = 0,
    #[default]
    EverySecond = 1,
    Every10Seconds = 2,
    Every60Seconds = 3,
    /// Raw data only, every 250 ms
    Constant = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlgorithmResult {
    /// Equivalent CO2 [ppm]
    pub eco2: u16,
    /// Total volatile organic compounds [ppb]
    pub tvoc: u16,
}

pub struct Ccs811<T>
where
    T: I2c,
{
    bus: T,
    address: u8,
}

impl<T> Ccs811<T>
where
    T: I2c,
{
    pub fn new(bus: T) -> Self {
        Self::with_address(bus, DEFAULT_ADDRESS)
    }

    /// Sensor with ADDR pulled high answers on 0x5b.
    pub fn with_address(bus: T, address: u8) -> Self {
        Self { bus, address }
    }

    pub fn release(self) -> T {
        self.bus
    }

    /// Checks the part, starts the application firmware and selects the drive mode.
    pub async fn init(
        &mut self,
        mode: DriveMode,
        delay: &mut impl DelayNs,
    ) -> Result<(), Error<T::Error>> {
        let hardware_id = self.read_register(register::HW_ID).await?;
        if hardware_id != HARDWARE_ID {
            return Err(DeviceError::UnexpectedHardwareId(hardware_id).into());
        }

        if !self.status().await?.app_valid() {
            return Err(DeviceError::NoApplication.into());
        }

        self.bus.write(self.address, &[register::APP_START]).await?;
        delay.delay_ms(1).await;

        if !self.status().await?.application_mode() {
            return Err(DeviceError::NotInApplicationMode.into());
        }

        self.set_drive_mode(mode).await
    }

    pub async fn set_drive_mode(&mut self, mode: DriveMode) -> Result<(), Error<T::Error>> {
        self.bus
            .write(self.address, &[register::MEAS_MODE, (mode as u8) << 4])
            .await?;
        Ok(())
    }

    pub async fn status(&mut self) -> Result<Status, Error<T::Error>> {
        self.read_register(register::STATUS).await.map(Status)
    }

    pub async fn data_ready(&mut self) -> Result<bool, Error<T::Error>> {
        Ok(self.status().await?.data_ready())
    }

    /// Reads the latest eCO2 and TVOC values.
    pub async fn read(&mut self) -> Result<AlgorithmResult, Error<T::Error>> {
        let mut data = [0u8; 5];
        self.bus
            .write_read(self.address, &[register::ALG_RESULT_DATA], &mut data)
            .await?;

        if Status(data[4]).error() {
            let error = self.read_register(register::ERROR_ID).await?;
            return Err(DeviceError::Sensor(error).into());
        }

        Ok(AlgorithmResult {
            eco2: u16::from_be_bytes([data[0], data[1]]),
            tvoc: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    /// Feeds ambient conditions to the compensation algorithm.
    pub async fn set_environment(
        &mut self,
        humidity: f32,
        temperature: f32,
    ) -> Result<(), Error<T::Error>> {
        // both in 1/512 units, temperature offset by 25 °C
        let humidity = (humidity.clamp(0.0, 100.0) * 512.0) as u16;
        let temperature = ((temperature.clamp(-25.0, 100.0) + 25.0) * 512.0) as u16;
        let [h0, h1] = humidity.to_be_bytes();
        let [t0, t1] = temperature.to_be_bytes();

        self.bus
            .write(self.address, &[register::ENV_DATA, h0, h1, t0, t1])
            .await?;
        Ok(())
    }

    /// Returns the sensor to boot mode, `init` has to run again afterwards.
    pub async fn reset(&mut self, delay: &mut impl DelayNs) -> Result<(), Error<T::Error>> {
        let mut command = [register::SW_RESET; 5];
        command[1..].copy_from_slice(&RESET_SEQUENCE);
        self.bus.write(self.address, &command).await?;
        delay.delay_ms(2).await;
        Ok(())
    }

    async fn read_register(&mut self, register: u8) -> Result<u8, Error<T::Error>> {
        let mut value = [0u8];
        self.bus
            .write_read(self.address, &[register], &mut value)
            .await?;
        Ok(value[0])
    }
}
