use core::fmt::Write;

use heapless::String;

use crate::shadow::SHADOW_STREAM;
use crate::Error;

pub const MAX_TOPIC_LEN: usize = 128;

pub type Topic = String<MAX_TOPIC_LEN>;

/// Topics a device uses, all rooted at `/tenants/{project}/devices/{device}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Device shadow stream
    pub shadow: Topic,
    /// Actions addressed to the device
    pub actions: Topic,
    /// Action status reports
    pub action_status: Topic,
}

impl Topics {
    pub fn new(project_id: &str, device_id: &str) -> Result<Self, Error> {
        let mut actions = Topic::new();
        write!(actions, "/tenants/{}/devices/{}/actions", project_id, device_id)?;

        let mut action_status = Topic::new();
        write!(
            action_status,
            "/tenants/{}/devices/{}/action/status",
            project_id, device_id
        )?;

        Ok(Self {
            shadow: stream(project_id, device_id, SHADOW_STREAM)?,
            actions,
            action_status,
        })
    }
}

/// Topic of a JSON-array data stream.
pub fn stream(project_id: &str, device_id: &str, stream: &str) -> Result<Topic, Error> {
    let mut topic = Topic::new();
    write!(
        topic,
        "/tenants/{}/devices/{}/events/{}/jsonarray",
        project_id, device_id, stream
    )?;
    Ok(topic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_topics() {
        let topics = Topics::new("demo", "17").unwrap();

        assert_eq!(
            topics.shadow.as_str(),
            "/tenants/demo/devices/17/events/device_shadow/jsonarray"
        );
        assert_eq!(topics.actions.as_str(), "/tenants/demo/devices/17/actions");
        assert_eq!(
            topics.action_status.as_str(),
            "/tenants/demo/devices/17/action/status"
        );
    }

    #[test]
    fn custom_stream() {
        let topic = stream("demo", "17", "metrics").unwrap();
        assert_eq!(topic.as_str(), "/tenants/demo/devices/17/events/metrics/jsonarray");
    }

    #[test]
    fn too_long() {
        let long = "x".repeat(MAX_TOPIC_LEN);
        assert_eq!(Topics::new(&long, "17"), Err(Error::BufferFull));
    }
}
