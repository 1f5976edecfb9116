use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_time::{with_timeout, Duration, Instant, Timer};
use shared::sntp::{self, SntpError, Timestamp, WallClock, NTP_PACKET_LEN, NTP_PORT};
use shared::NodeConfig;

use crate::net::{self, NetStack};

#[derive(Debug, defmt::Format)]
enum SyncError {
    Dns,
    Socket,
    Timeout,
    Response(SntpError),
}

/// Synchronizes the wall clock, falling back to time since boot when every attempt fails.
pub async fn sync_time(stack: &'static NetStack, config: &NodeConfig) -> WallClock {
    let mut clock = WallClock::new();

    for attempt in 1..=config.sntp_retries {
        match query(stack, config).await {
            Ok((timestamp, uptime_ms)) => {
                clock.sync(timestamp.as_millis(), uptime_ms);
                defmt::info!("Time synchronized, unix time {}", timestamp.unix_secs);
                return clock;
            }
            Err(e) => {
                defmt::warn!(
                    "Waiting for system time to be set... ({}/{}): {}",
                    attempt,
                    config.sntp_retries,
                    e
                );
                Timer::after(Duration::from_millis(config.sntp_retry_delay_ms)).await;
            }
        }
    }

    defmt::error!("Time synchronization failed, timestamps count from boot");
    clock
}

/// Returns the server time and the uptime it corresponds to.
async fn query(stack: &'static NetStack, config: &NodeConfig) -> Result<(Timestamp, u64), SyncError> {
    let server = net::resolve(stack, config.sntp_server)
        .await
        .map_err(|_| SyncError::Dns)?;

    let mut rx_meta = [PacketMetadata::EMPTY; 1];
    let mut rx_buffer = [0; 128];
    let mut tx_meta = [PacketMetadata::EMPTY; 1];
    let mut tx_buffer = [0; 128];
    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    socket.bind(0).map_err(|_| SyncError::Socket)?;

    let sent = Instant::now();
    socket
        .send_to(&sntp::request(), (server, NTP_PORT))
        .await
        .map_err(|_| SyncError::Socket)?;

    let mut response = [0u8; NTP_PACKET_LEN];
    let (len, _) = with_timeout(
        Duration::from_millis(config.sntp_timeout_ms),
        socket.recv_from(&mut response),
    )
    .await
    .map_err(|_| SyncError::Timeout)?
    .map_err(|_| SyncError::Socket)?;
    let received = Instant::now();

    let timestamp =
        sntp::parse_response(&response[..len], config.sntp_max_stratum).map_err(SyncError::Response)?;
    let round_trip = received.duration_since(sent).as_micros();

    Ok((timestamp.delayed_by(round_trip / 2), received.as_millis()))
}
