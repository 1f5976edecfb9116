//! Device state shared by the action handlers and the publish loop.

use heapless::String;

use crate::action::{Ack, Action, ActionError, ActionRouter, RouteError};
use crate::ota::{OtaRequest, PartitionLayout};
use crate::shadow::{BlindState, Blinds};

pub const TOGGLE_BLIND: &str = "toggle_blind";
pub const UPDATE_FIRMWARE: &str = "update_firmware";

/// Number of actions the device understands.
pub const ACTION_COUNT: usize = 2;

const PAYLOAD_LEN: usize = 512;

/// Firmware update accepted from the cloud and waiting to be carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FirmwareUpdate {
    pub action_id: String<32>,
    pub url: String<256>,
    pub version: String<32>,
    pub size: u32,
}

impl FirmwareUpdate {
    fn from_request(action_id: &str, request: &OtaRequest<'_>) -> Result<Self, ActionError> {
        Ok(Self {
            action_id: copy(action_id)?,
            url: copy(request.url)?,
            version: copy(request.version)?,
            size: request.content_length,
        })
    }
}

fn copy<const N: usize>(value: &str) -> Result<String<N>, ActionError> {
    String::try_from(value).map_err(|_| ActionError::InvalidPayload)
}

pub struct Device {
    pub blinds: Blinds,
    pub layout: PartitionLayout,
    pending_update: Option<FirmwareUpdate>,
}

impl Device {
    pub fn new(layout: PartitionLayout) -> Self {
        Self {
            blinds: Blinds::new(BlindState::Open),
            layout,
            pending_update: None,
        }
    }

    /// Hands the accepted firmware update to the caller, leaving none pending.
    pub fn take_pending_update(&mut self) -> Option<FirmwareUpdate> {
        self.pending_update.take()
    }

    pub fn has_pending_update(&self) -> bool {
        self.pending_update.is_some()
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new(PartitionLayout::default())
    }
}

/// Queues a blind toggle, applied on the next publish tick.
pub fn toggle_blind(device: &mut Device, _action: &Action<'_>) -> Result<Ack, ActionError> {
    device.blinds.request_toggle();
    Ok(Ack::Completed)
}

/// Validates the update request and keeps it for the cloud session to download.
pub fn update_firmware(device: &mut Device, action: &Action<'_>) -> Result<Ack, ActionError> {
    if device.pending_update.is_some() {
        return Err(ActionError::Busy);
    }

    let mut payload = [0u8; PAYLOAD_LEN];
    let payload = action
        .payload_into(&mut payload)
        .map_err(|_| ActionError::InvalidPayload)?;
    let request = OtaRequest::parse(payload).map_err(|_| ActionError::InvalidPayload)?;
    request
        .validate(&device.layout)
        .map_err(|_| ActionError::InvalidPayload)?;

    device.pending_update = Some(FirmwareUpdate::from_request(action.id, &request)?);
    Ok(Ack::Deferred)
}

/// Router with every action the device supports.
pub fn router() -> Result<ActionRouter<Device, ACTION_COUNT>, RouteError> {
    let mut router = ActionRouter::new();
    router.add(UPDATE_FIRMWARE, update_firmware)?;
    router.add(TOGGLE_BLIND, toggle_blind)?;
    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPDATE: &[u8] = br#"{"id":"12","kind":"process","name":"update_firmware","payload":"{\"url\":\"http://10.42.0.1/fw.bin\",\"version\":\"1.2.0\",\"content-length\":4096}"}"#;

    #[test]
    fn toggle_blind_action() {
        let router = router().unwrap();
        let mut device = Device::default();
        let action = Action::parse(br#"{"id":"5","name":"toggle_blind","payload":""}"#).unwrap();

        assert_eq!(router.dispatch(&mut device, &action), Ok(Ack::Completed));
        assert!(device.blinds.is_toggle_pending());
        assert_eq!(device.blinds.state(), BlindState::Open);
        assert_eq!(device.blinds.apply_pending(), Some(BlindState::Closed));
    }

    #[test]
    fn firmware_update_is_deferred() {
        let router = router().unwrap();
        let mut device = Device::default();
        let action = Action::parse(UPDATE).unwrap();

        assert_eq!(router.dispatch(&mut device, &action), Ok(Ack::Deferred));
        assert!(device.has_pending_update());
        assert_eq!(router.dispatch(&mut device, &action), Err(ActionError::Busy));

        let update = device.take_pending_update().unwrap();
        assert_eq!(update.action_id.as_str(), "12");
        assert_eq!(update.url.as_str(), "http://10.42.0.1/fw.bin");
        assert_eq!(update.version.as_str(), "1.2.0");
        assert_eq!(update.size, 4096);
        assert!(!device.has_pending_update());
    }

    #[test]
    fn invalid_firmware_payloads() {
        let router = router().unwrap();
        let mut device = Device::default();

        for message in [
            &br#"{"id":"1","name":"update_firmware","payload":"not json"}"#[..],
            &br#"{"id":"2","name":"update_firmware","payload":"{\"url\":\"http://h/fw\",\"version\":\"1\",\"content-length\":0}"}"#[..],
            &br#"{"id":"3","name":"update_firmware","payload":"{\"url\":\"http://h/fw\",\"version\":\"1\",\"content-length\":99999999}"}"#[..],
        ] {
            let action = Action::parse(message).unwrap();
            assert_eq!(
                router.dispatch(&mut device, &action),
                Err(ActionError::InvalidPayload)
            );
        }
        assert!(!device.has_pending_update());
    }

    #[test]
    fn unknown_action() {
        let router = router().unwrap();
        let mut device = Device::default();
        let action = Action::parse(br#"{"id":"9","name":"reboot"}"#).unwrap();

        assert_eq!(
            router.dispatch(&mut device, &action),
            Err(ActionError::Unregistered)
        );
    }
}
