use embassy_net::dns::{self, DnsQueryType};
use embassy_net::IpAddress;
use embassy_time::{Duration, Timer};
use esp_wifi::wifi::{WifiDevice, WifiStaDevice};

pub type NetStack = embassy_net::Stack<WifiDevice<'static, WifiStaDevice>>;

pub async fn wait_for_connection(stack: &'static NetStack) {
    loop {
        if stack.is_link_up() {
            break;
        }
        Timer::after(Duration::from_millis(500)).await;
    }

    defmt::info!("Waiting to get IP address...");
    loop {
        if let Some(config) = stack.config_v4() {
            defmt::info!("Got IP: {}", config.address);
            break;
        }
        Timer::after(Duration::from_millis(500)).await;
    }
}

/// Resolves `host` to its first IPv4 address, IP literals are returned as they are.
pub async fn resolve(stack: &'static NetStack, host: &str) -> Result<IpAddress, dns::Error> {
    let addresses = stack.dns_query(host, DnsQueryType::A).await?;
    addresses.first().copied().ok_or(dns::Error::Failed)
}
