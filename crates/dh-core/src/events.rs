//! Structured lifecycle events emitted to downstream consumers
//!
//! Events are value types with no ownership semantics: the monitor
//! produces them, the bus hands shared references to subscribers, and the
//! serialized form is the external contract.

use serde::{Serialize, Serializer};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{ContainerState, NodeIdentity};

/// Action carried by a lifecycle event.
///
/// The container actions form a closed whitelist. Anything else the event
/// tail reports is preserved verbatim in `Unknown` and filtered out by the
/// monitor rather than matched as a free-form string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Stop,
    Restart,
    Die,
    Create,
    Destroy,
    Pause,
    Unpause,
    HealthStatus,
    /// Synthetic action used for node lifecycle events
    Online,
    /// Any action outside the whitelist, preserved verbatim
    Unknown(String),
}

impl EventAction {
    /// Parse a raw action string from the event tail.
    ///
    /// Health records arrive as `health_status: <verdict>`; the verdict is
    /// intentionally collapsed since subscribers receive the action only.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("health_status") {
            return EventAction::HealthStatus;
        }
        match raw {
            "start" => EventAction::Start,
            "stop" => EventAction::Stop,
            "restart" => EventAction::Restart,
            "die" => EventAction::Die,
            "create" => EventAction::Create,
            "destroy" => EventAction::Destroy,
            "pause" => EventAction::Pause,
            "unpause" => EventAction::Unpause,
            other => EventAction::Unknown(other.to_string()),
        }
    }

    /// Whether this action is on the container lifecycle whitelist
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            EventAction::Start
                | EventAction::Stop
                | EventAction::Restart
                | EventAction::Die
                | EventAction::Create
                | EventAction::Destroy
                | EventAction::Pause
                | EventAction::Unpause
                | EventAction::HealthStatus
        )
    }

    /// Container state this action implies, if any.
    ///
    /// `Destroy` removes the container instead of moving it to a state;
    /// `HealthStatus` reports without changing state.
    pub fn implied_state(&self) -> Option<ContainerState> {
        match self {
            EventAction::Start | EventAction::Restart | EventAction::Unpause => {
                Some(ContainerState::Running)
            }
            EventAction::Stop | EventAction::Die => Some(ContainerState::Stopped),
            EventAction::Pause => Some(ContainerState::Paused),
            EventAction::Create => Some(ContainerState::Created),
            EventAction::Destroy
            | EventAction::HealthStatus
            | EventAction::Online
            | EventAction::Unknown(_) => None,
        }
    }

    /// Wire representation of the action
    pub fn as_str(&self) -> &str {
        match self {
            EventAction::Start => "start",
            EventAction::Stop => "stop",
            EventAction::Restart => "restart",
            EventAction::Die => "die",
            EventAction::Create => "create",
            EventAction::Destroy => "destroy",
            EventAction::Pause => "pause",
            EventAction::Unpause => "unpause",
            EventAction::HealthStatus => "health_status",
            EventAction::Online => "online",
            EventAction::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for EventAction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Record type of a lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Container,
    Node,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Container => write!(f, "container"),
            EventKind::Node => write!(f, "node"),
        }
    }
}

/// Attributes of the object an event happened to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActorAttributes {
    pub name: String,
    pub image: String,
}

/// The object an event happened to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventActor {
    pub id: String,
    pub attributes: ActorAttributes,
}

/// A discrete lifecycle event in the external schema:
/// `{type, action, actor: {id, attributes: {name, image}}, scope, time, timeNano}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub action: EventAction,
    pub actor: EventActor,
    pub scope: String,
    /// Milliseconds since the Unix epoch
    #[serde(rename = "time")]
    pub time_ms: u64,
    /// Nanoseconds since the Unix epoch
    #[serde(rename = "timeNano")]
    pub time_nano: u64,
}

impl StructuredEvent {
    /// Build a container lifecycle event
    pub fn container(
        action: EventAction,
        id: impl Into<String>,
        name: impl Into<String>,
        image: impl Into<String>,
        time_ms: u64,
    ) -> Self {
        Self {
            kind: EventKind::Container,
            action,
            actor: EventActor {
                id: id.into(),
                attributes: ActorAttributes {
                    name: name.into(),
                    image: image.into(),
                },
            },
            scope: "local".to_string(),
            time_ms,
            time_nano: time_ms.saturating_mul(1_000_000),
        }
    }

    /// Build the synthetic event published when a node comes online
    pub fn node_online(node: &NodeIdentity, time_ms: u64) -> Self {
        Self {
            kind: EventKind::Node,
            action: EventAction::Online,
            actor: EventActor {
                id: node.id.as_str().to_string(),
                attributes: ActorAttributes {
                    name: node.name.clone(),
                    image: String::new(),
                },
            },
            scope: "local".to_string(),
            time_ms,
            time_nano: time_ms.saturating_mul(1_000_000),
        }
    }

    /// Serialize to the external JSON schema
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Milliseconds since the Unix epoch
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Whole seconds since the Unix epoch
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
