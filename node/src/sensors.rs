use core::cell::RefCell;

use air_sensors::ccs811::{Ccs811, DriveMode};
use air_sensors::sht3x::{Repeatability, Sht3x};
use embassy_embedded_hal::shared_bus::asynch::i2c::I2cDevice;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::NoopMutex;
use embassy_time::{Delay, Duration, Ticker};
use hal::i2c::I2C;
use hal::peripherals::I2C0;
use shared::Readings;

pub type SensorBus = I2cDevice<'static, NoopRawMutex, I2C<'static, I2C0>>;

pub type SharedReadings = NoopMutex<RefCell<Readings>>;

/// Samples both sensors once per publish period.
///
/// A sensor that fails keeps its last value in the shadow.
#[embassy_executor::task]
pub async fn sensors_task(
    mut sht: Sht3x<SensorBus>,
    mut ccs: Ccs811<SensorBus>,
    readings: &'static SharedReadings,
    period: Duration,
) {
    let mut delay = Delay;

    let ccs_ready = match ccs.init(DriveMode::EverySecond, &mut delay).await {
        Ok(()) => {
            defmt::info!("CCS811 running");
            true
        }
        Err(err) => {
            defmt::error!("CCS811 init failed: {:?}", defmt::Debug2Format(&err));
            false
        }
    };

    let mut ticker = Ticker::every(period);
    loop {
        match sht.measure(Repeatability::High, &mut delay).await {
            Ok(measurement) => {
                readings.lock(|r| {
                    let mut r = r.borrow_mut();
                    r.temperature = measurement.temperature;
                    r.humidity = measurement.humidity;
                });
                defmt::debug!(
                    "Temperature: {}, Humidity: {}",
                    measurement.temperature,
                    measurement.humidity
                );

                if ccs_ready {
                    if let Err(err) = ccs
                        .set_environment(measurement.humidity, measurement.temperature)
                        .await
                    {
                        defmt::warn!(
                            "CCS811 compensation failed: {:?}",
                            defmt::Debug2Format(&err)
                        );
                    }
                }
            }
            Err(err) => {
                defmt::error!("Error accessing SHT3x: {:?}", defmt::Debug2Format(&err));
            }
        }

        if ccs_ready {
            match ccs.data_ready().await {
                Ok(true) => match ccs.read().await {
                    Ok(result) => {
                        readings.lock(|r| r.borrow_mut().carbon = result.eco2);
                        defmt::debug!("eCO2: {}, TVOC: {}", result.eco2, result.tvoc);
                    }
                    Err(err) => {
                        defmt::error!("Error accessing CCS811: {:?}", defmt::Debug2Format(&err));
                    }
                },
                Ok(false) => {}
                Err(err) => {
                    defmt::error!("Error accessing CCS811: {:?}", defmt::Debug2Format(&err));
                }
            }
        }

        ticker.next().await;
    }
}
