use serde::Deserialize;

use crate::topic::Topics;
use crate::Error;

/// Provisioning file downloaded from the cloud console for a device.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceConfig<'a> {
    pub project_id: &'a str,
    pub broker: &'a str,
    pub port: u16,
    pub device_id: &'a str,
    #[serde(default, borrow)]
    pub authentication: Option<Authentication<'a>>,
}

/// Client credentials, PEM text with escaped newlines.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Authentication<'a> {
    pub ca_certificate: &'a str,
    pub device_certificate: &'a str,
    pub device_private_key: &'a str,
}

impl<'a> DeviceConfig<'a> {
    pub fn parse(json: &'a [u8]) -> Result<Self, Error> {
        let (config, _) = serde_json_core::from_slice::<DeviceConfig<'a>>(json)?;
        Ok(config)
    }

    pub fn topics(&self) -> Result<Topics, Error> {
        Topics::new(self.project_id, self.device_id)
    }
}

/// Runtime tuning of the node.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeConfig {
    /// Period between two device shadow publishes in milliseconds
    pub publish_period_ms: u64,
    /// NTP server used for the wall clock
    pub sntp_server: &'static str,
    /// Number of time synchronization attempts
    pub sntp_retries: usize,
    /// Delay between two time synchronization attempts in milliseconds
    pub sntp_retry_delay_ms: u64,
    /// Time to wait for an NTP response in milliseconds
    pub sntp_timeout_ms: u64,
    /// Maximum accepted stratum level (1-15)
    pub sntp_max_stratum: u8,
    /// Delay before reconnecting to the broker in seconds
    pub reconnect_delay_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            publish_period_ms: 1000,
            sntp_server: "pool.ntp.org",
            sntp_retries: 10,
            sntp_retry_delay_ms: 2000,
            sntp_timeout_ms: 5000,
            sntp_max_stratum: 15,
            reconnect_delay_secs: 2,
        }
    }
}
