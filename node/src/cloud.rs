//! Broker session: device shadow publishing and action handling.

use embassy_futures::select::{select, Either};
use embassy_net::dns;
use embassy_net::tcp::{ConnectError, TcpSocket};
use embassy_time::{Duration, Instant, Timer};
use hal::gpio::{GpioPin, Output, PushPull};
use hal::prelude::*;
use rust_mqtt::client::client::MqttClient;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;
use shared::action::RouteError;
use shared::device::{self, ACTION_COUNT};
use shared::sntp::WallClock;
use shared::{
    Ack, Action, ActionOutcome, ActionRouter, ActionStatusEncoder, BlindState, Device,
    DeviceConfig, FirmwareUpdate, NodeConfig, ShadowEncoder, Topics,
};

use crate::net::{self, NetStack};
use crate::ota::{self, Download};
use crate::sensors::SharedReadings;
use crate::sntp;

pub type BlindPin = GpioPin<Output<PushPull>, 2>;

type Client<'a> = MqttClient<'a, TcpSocket<'a>, 5, CountingRng>;

const MQTT_BUFFER_LEN: usize = 1024;
const ACTION_LEN: usize = 1024;
const SHADOW_LEN: usize = 256;
const STATUS_LEN: usize = 256;

#[derive(Debug)]
pub enum CloudError {
    Dns(dns::Error),
    Connect(ConnectError),
    Mqtt(ReasonCode),
    Config(shared::Error),
    Router(RouteError),
}

impl defmt::Format for CloudError {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Self::Dns(e) => defmt::write!(fmt, "dns: {}", e),
            Self::Connect(e) => defmt::write!(fmt, "connect: {}", e),
            Self::Mqtt(code) => defmt::write!(fmt, "mqtt: {}", defmt::Debug2Format(code)),
            Self::Config(e) => defmt::write!(fmt, "config: {}", e),
            Self::Router(e) => defmt::write!(fmt, "router: {}", e),
        }
    }
}

impl From<ReasonCode> for CloudError {
    fn from(code: ReasonCode) -> Self {
        Self::Mqtt(code)
    }
}

impl From<dns::Error> for CloudError {
    fn from(e: dns::Error) -> Self {
        Self::Dns(e)
    }
}

impl From<ConnectError> for CloudError {
    fn from(e: ConnectError) -> Self {
        Self::Connect(e)
    }
}

pub struct Cloud {
    config: DeviceConfig<'static>,
    node: NodeConfig,
    topics: Topics,
    device: Device,
    router: ActionRouter<Device, ACTION_COUNT>,
    shadow: ShadowEncoder,
    statuses: ActionStatusEncoder,
    clock: WallClock,
    blind: BlindPin,
    readings: &'static SharedReadings,
}

impl Cloud {
    pub fn new(
        config: DeviceConfig<'static>,
        node: NodeConfig,
        blind: BlindPin,
        readings: &'static SharedReadings,
    ) -> Result<Self, CloudError> {
        Ok(Self {
            topics: config.topics().map_err(CloudError::Config)?,
            router: device::router().map_err(CloudError::Router)?,
            config,
            node,
            device: Device::default(),
            shadow: ShadowEncoder::new(),
            statuses: ActionStatusEncoder::new(),
            clock: WallClock::new(),
            blind,
            readings,
        })
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms(Instant::now().as_millis())
    }

    /// Runs one broker connection until it fails.
    async fn session(&mut self, stack: &'static NetStack) -> Result<(), CloudError> {
        let address = net::resolve(stack, self.config.broker).await?;

        let mut rx_buffer = [0; MQTT_BUFFER_LEN];
        let mut tx_buffer = [0; MQTT_BUFFER_LEN];
        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(Some(Duration::from_secs(60)));
        socket.connect((address, self.config.port)).await?;

        let mut config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(20000));
        config.add_max_subscribe_qos(QualityOfService::QoS0);
        config.add_client_id(self.config.device_id);
        config.max_packet_size = MQTT_BUFFER_LEN as u32;
        let mut recv_buffer = [0; MQTT_BUFFER_LEN];
        let mut write_buffer = [0; MQTT_BUFFER_LEN];

        let mut client: Client<'_> = MqttClient::new(
            socket,
            &mut write_buffer,
            MQTT_BUFFER_LEN,
            &mut recv_buffer,
            MQTT_BUFFER_LEN,
            config,
        );
        client.connect_to_broker().await?;
        client.subscribe_to_topic(&self.topics.actions).await?;
        defmt::info!("Connected to {=str}, waiting for actions", self.config.broker);

        let period = Duration::from_millis(self.node.publish_period_ms);
        let mut next_publish = Instant::now();

        loop {
            let event = select(client.receive_message(), Timer::at(next_publish)).await;
            match event {
                Either::First(message) => {
                    let (_, payload) = message?;
                    let Ok(action) = heapless::Vec::<u8, ACTION_LEN>::from_slice(payload) else {
                        defmt::warn!("Dropping action of {} bytes", payload.len());
                        continue;
                    };
                    self.handle_action(&mut client, stack, &action).await?;
                }
                Either::Second(()) => {
                    self.publish_shadow(&mut client).await?;
                    self.apply_blinds();

                    next_publish += period;
                    let now = Instant::now();
                    if next_publish < now {
                        next_publish = now + period;
                    }
                }
            }
        }
    }

    async fn publish_shadow(&mut self, client: &mut Client<'_>) -> Result<(), CloudError> {
        let readings = self.readings.lock(|r| *r.borrow());
        let timestamp = self.now_ms();

        let mut buf = [0u8; SHADOW_LEN];
        let payload = match self
            .shadow
            .encode(timestamp, self.device.blinds.state(), &readings, &mut buf)
        {
            Ok(payload) => payload,
            Err(e) => {
                defmt::error!("Failed to encode device shadow: {}", e);
                return Ok(());
            }
        };

        client
            .send_message(&self.topics.shadow, payload, QualityOfService::QoS0, false)
            .await?;
        defmt::debug!("Published shadow {}", self.shadow.sequence());
        Ok(())
    }

    fn apply_blinds(&mut self) {
        if let Some(state) = self.device.blinds.apply_pending() {
            defmt::info!("{=str}", state.label());
            let _ = match state {
                BlindState::Open => self.blind.set_high(),
                BlindState::Closed => self.blind.set_low(),
            };
        }
    }

    async fn handle_action(
        &mut self,
        client: &mut Client<'_>,
        stack: &'static NetStack,
        message: &[u8],
    ) -> Result<(), CloudError> {
        let action = match Action::parse(message) {
            Ok(action) => action,
            Err(e) => {
                defmt::warn!("Dropping malformed action: {}", e);
                return Ok(());
            }
        };
        defmt::info!("Received action {=str} ({=str})", action.name, action.id);

        let outcome = match self.router.dispatch(&mut self.device, &action) {
            Ok(Ack::Completed) => ActionOutcome::Completed,
            Ok(Ack::Deferred) => ActionOutcome::Progress(0),
            Err(e) => {
                defmt::warn!("Action {=str} failed: {}", action.name, e);
                ActionOutcome::Failed(e.message())
            }
        };
        self.publish_status(client, action.id, outcome).await?;

        if let Some(update) = self.device.take_pending_update() {
            self.update_firmware(client, stack, &update).await?;
        }
        Ok(())
    }

    async fn publish_status(
        &mut self,
        client: &mut Client<'_>,
        id: &str,
        outcome: ActionOutcome<'_>,
    ) -> Result<(), CloudError> {
        let timestamp = self.now_ms();
        let mut buf = [0u8; STATUS_LEN];
        let payload = match self.statuses.encode(id, outcome, timestamp, &mut buf) {
            Ok(payload) => payload,
            Err(e) => {
                defmt::error!("Failed to encode action status: {}", e);
                return Ok(());
            }
        };

        client
            .send_message(
                &self.topics.action_status,
                payload,
                QualityOfService::QoS0,
                false,
            )
            .await?;
        Ok(())
    }

    /// Downloads and activates a new image, restarting into it on success.
    ///
    /// A failed update is reported and the current image keeps running.
    async fn update_firmware(
        &mut self,
        client: &mut Client<'_>,
        stack: &'static NetStack,
        update: &FirmwareUpdate,
    ) -> Result<(), CloudError> {
        defmt::info!("Updating firmware to {=str}", update.version.as_str());
        let id = update.action_id.as_str();

        let mut rx_buffer = [0; ota::SOCKET_BUFFER_LEN];
        let mut tx_buffer = [0; ota::SOCKET_BUFFER_LEN];
        let result = match Download::start(
            stack,
            &mut rx_buffer,
            &mut tx_buffer,
            update,
            self.device.layout,
        )
        .await
        {
            Ok(mut download) => loop {
                match download.advance().await {
                    Ok(Some(percent)) => {
                        defmt::info!("Firmware download {}%", percent);
                        self.publish_status(client, id, ActionOutcome::Progress(percent))
                            .await?;
                    }
                    Ok(None) => break download.finish(),
                    Err(e) => break Err(e),
                }
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(slot) => {
                defmt::info!("Firmware {=str} written to {}, restarting", update.version.as_str(), slot);
                self.publish_status(client, id, ActionOutcome::Completed)
                    .await?;
                // rust-mqtt has no flush, give the status time to leave
                Timer::after_secs(1).await;
                crate::restart()
            }
            Err(e) => {
                defmt::error!("Firmware update failed: {}", e);
                self.publish_status(client, id, ActionOutcome::Failed(e.message()))
                    .await
            }
        }
    }
}

/// Keeps a broker session up, reconnecting after a delay whenever it drops.
#[embassy_executor::task]
pub async fn cloud_task(stack: &'static NetStack, mut cloud: Cloud) {
    net::wait_for_connection(stack).await;
    cloud.clock = sntp::sync_time(stack, &cloud.node).await;

    loop {
        if let Err(e) = cloud.session(stack).await {
            defmt::error!("Cloud session ended: {}", e);
        }
        Timer::after_secs(cloud.node.reconnect_delay_secs).await;
    }
}
