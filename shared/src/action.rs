//! Remote actions: parsing the command the cloud sends, routing it to a handler and
//! building the status the device reports back.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::json::unescape;
use crate::shadow::{encode_batch, SequenceCounter};
use crate::Error;

/// A command issued from the cloud.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Action<'a> {
    pub id: &'a str,
    #[serde(default, borrow)]
    pub kind: Option<&'a str>,
    pub name: &'a str,
    /// Escaped JSON text, see [`Action::payload_into`].
    #[serde(default)]
    pub payload: &'a str,
}

impl<'a> Action<'a> {
    pub fn parse(message: &'a [u8]) -> Result<Self, Error> {
        let (action, _) = serde_json_core::from_slice::<Action<'a>>(message)?;
        Ok(action)
    }

    /// Un-escapes the payload into `buf`.
    pub fn payload_into<'b>(&self, buf: &'b mut [u8]) -> Result<&'b str, Error> {
        unescape(self.payload, buf)
    }
}

/// How a successful handler wants the action acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ack {
    /// Done, report completion right away.
    Completed,
    /// Accepted, progress and completion are reported by whoever carries it out.
    Deferred,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ActionError {
    /// No handler is registered under the action name.
    Unregistered,
    /// The payload could not be decoded.
    InvalidPayload,
    /// The requested operation is not supported by this device.
    Unsupported,
    /// A previous action of the same kind is still in progress.
    Busy,
}

impl ActionError {
    /// Message carried in the `errors` list of a failed status.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Unregistered => "Unregistered action",
            Self::InvalidPayload => "Invalid action payload",
            Self::Unsupported => "Unsupported action",
            Self::Busy => "Action already in progress",
        }
    }
}

impl core::fmt::Display for ActionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.message())
    }
}

pub type ActionHandler<C> = fn(&mut C, &Action<'_>) -> Result<Ack, ActionError>;

/// Fixed capacity table mapping action names to handlers.
pub struct ActionRouter<C, const N: usize> {
    routes: Vec<(&'static str, ActionHandler<C>), N>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RouteError {
    Duplicate,
    Full,
}

impl<C, const N: usize> ActionRouter<C, N> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn add(&mut self, name: &'static str, handler: ActionHandler<C>) -> Result<(), RouteError> {
        if self.routes.iter().any(|(route, _)| *route == name) {
            return Err(RouteError::Duplicate);
        }
        self.routes
            .push((name, handler))
            .map_err(|_| RouteError::Full)
    }

    pub fn dispatch(&self, context: &mut C, action: &Action<'_>) -> Result<Ack, ActionError> {
        let (_, handler) = self
            .routes
            .iter()
            .find(|(name, _)| *name == action.name)
            .ok_or(ActionError::Unregistered)?;
        handler(context, action)
    }
}

impl<C, const N: usize> Default for ActionRouter<C, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ActionState {
    Progress,
    Completed,
    Failed,
}

/// Result reported back for an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ActionOutcome<'a> {
    Progress(u8),
    Completed,
    Failed(&'a str),
}

#[derive(Serialize)]
struct ActionStatus<'a> {
    id: &'a str,
    sequence: u64,
    timestamp: u64,
    state: ActionState,
    progress: u8,
    errors: &'a [&'a str],
}

/// Builds action status documents, owning the status sequence number.
#[derive(Default)]
pub struct ActionStatusEncoder {
    sequence: SequenceCounter,
}

impl ActionStatusEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode<'b>(
        &mut self,
        id: &str,
        outcome: ActionOutcome<'_>,
        timestamp: u64,
        buf: &'b mut [u8],
    ) -> Result<&'b [u8], Error> {
        let message;
        let errors: &[&str] = match outcome {
            ActionOutcome::Failed(error) => {
                message = [error];
                &message
            }
            _ => &[],
        };
        let (state, progress) = match outcome {
            ActionOutcome::Progress(progress) => (ActionState::Progress, progress.min(100)),
            ActionOutcome::Completed => (ActionState::Completed, 100),
            ActionOutcome::Failed(_) => (ActionState::Failed, 0),
        };

        let status = ActionStatus {
            id,
            sequence: self.sequence.next(),
            timestamp,
            state,
            progress,
            errors,
        };
        encode_batch(&status, buf)
    }
}
