#![no_std]
#![no_main]
#![feature(type_alias_impl_trait)]

mod cloud;
mod net;
mod ota;
mod sensors;
mod sntp;

use core::cell::RefCell;

use air_sensors::ccs811::Ccs811;
use air_sensors::sht3x::Sht3x;
use embassy_embedded_hal::shared_bus::asynch::i2c::I2cDevice;
use embassy_executor::Spawner;
use embassy_net::{Config, StackResources};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::NoopMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Timer};
use esp_backtrace as _;
use esp_println as _;
use esp_wifi::wifi::{ClientConfiguration, Configuration};
use hal::embassy;
use hal::i2c::I2C;
use hal::Rng;
use hal::{clock::ClockControl, peripherals::Peripherals, prelude::*, IO};
use shared::{DeviceConfig, NodeConfig, Readings};
use static_cell::make_static;

use crate::cloud::Cloud;
use crate::net::NetStack;

const SSID: &str = env!("SSID");
const PASSWORD: &str = env!("PASSWORD");
/// Bytebeam provisioning file, `DEVICE_CONFIG` holds its path.
const DEVICE_CONFIG: &str = include_str!(env!("DEVICE_CONFIG"));

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    defmt::error!("panic: {:?}", defmt::Debug2Format(info));
    restart()
}

pub fn restart() -> ! {
    hal::reset::software_reset();
    loop {}
}

#[main]
async fn main(spawner: Spawner) {
    defmt::info!("Air quality node starting");
    let node = NodeConfig::default();
    let device_config = match DeviceConfig::parse(DEVICE_CONFIG.as_bytes()) {
        Ok(config) => config,
        Err(e) => {
            defmt::error!("invalid device config: {}", e);
            return;
        }
    };
    defmt::info!(
        "project {=str}, device {=str}, broker {=str}:{}",
        device_config.project_id,
        device_config.device_id,
        device_config.broker,
        device_config.port
    );

    let peripherals = Peripherals::take();
    let system = peripherals.SYSTEM.split();
    let clocks = ClockControl::max(system.clock_control).freeze();

    embassy::init(
        &clocks,
        hal::timer::TimerGroup::new(peripherals.TIMG0, &clocks),
    );
    let io = IO::new(peripherals.GPIO, peripherals.IO_MUX);

    let readings = &*make_static!(NoopMutex::new(RefCell::new(Readings::default())));

    let i2c0 = I2C::new(
        peripherals.I2C0,
        io.pins.gpio8,
        io.pins.gpio10,
        100u32.kHz(),
        &clocks,
    );
    let bus = &*make_static!(Mutex::<NoopRawMutex, _>::new(i2c0));
    let sht = Sht3x::new(I2cDevice::new(bus));
    let ccs = Ccs811::new(I2cDevice::new(bus));
    spawner
        .spawn(sensors::sensors_task(
            sht,
            ccs,
            readings,
            Duration::from_millis(node.publish_period_ms),
        ))
        .unwrap();

    let mut blind = io.pins.gpio2.into_push_pull_output();
    // blinds start open
    let _ = blind.set_high();

    let mut rng = Rng::new(peripherals.RNG);
    let stack_seed = rng.random() as u64;

    let init = esp_wifi::initialize(
        esp_wifi::EspWifiInitFor::Wifi,
        hal::systimer::SystemTimer::new(peripherals.SYSTIMER).alarm0,
        rng,
        system.radio_clock_control,
        &clocks,
    )
    .unwrap();

    let (wifi_interface, controller) =
        esp_wifi::wifi::new_with_mode(&init, peripherals.WIFI, esp_wifi::wifi::WifiStaDevice)
            .unwrap();

    // broker, sntp, dns and firmware download
    let stack = &*make_static!(embassy_net::Stack::new(
        wifi_interface,
        Config::dhcpv4(Default::default()),
        make_static!(StackResources::<4>::new()),
        stack_seed
    ));

    spawner.spawn(connection(controller)).ok();
    spawner.spawn(net_task(stack)).ok();

    let cloud = match Cloud::new(device_config, node, blind, readings) {
        Ok(cloud) => cloud,
        Err(e) => {
            defmt::error!("failed to set up the cloud session: {}", e);
            return;
        }
    };
    spawner.spawn(cloud::cloud_task(stack, cloud)).ok();
}

#[embassy_executor::task]
async fn connection(mut controller: esp_wifi::wifi::WifiController<'static>) {
    loop {
        if esp_wifi::wifi::get_wifi_state() == esp_wifi::wifi::WifiState::StaConnected {
            // wait until we're no longer connected
            controller
                .wait_for_event(esp_wifi::wifi::WifiEvent::StaDisconnected)
                .await;
            defmt::warn!("Wifi disconnected");
            Timer::after(Duration::from_millis(5000)).await
        }
        if !matches!(controller.is_started(), Ok(true)) {
            let client_config = Configuration::Client(ClientConfiguration {
                ssid: SSID.try_into().unwrap(),
                password: PASSWORD.try_into().unwrap(),
                ..Default::default()
            });
            controller.set_configuration(&client_config).unwrap();
            controller.start().await.unwrap();
        }

        match controller.connect().await {
            Ok(_) => defmt::info!("Wifi connected!"),
            Err(e) => {
                defmt::error!("Failed to connect to wifi: {:?}", e);
                Timer::after(Duration::from_millis(5000)).await
            }
        }
    }
}

#[embassy_executor::task]
async fn net_task(stack: &'static NetStack) {
    stack.run().await
}
