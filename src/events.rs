use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::port::Port;

/// What happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    /// A port appeared.
    Add(Port),

    /// A port went away.
    Remove(Port),

    /// The discovery stopped reporting.
    /// All ports it reported earlier should be considered gone.
    Stop,
}

/// An event produced by a discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// The discovery which produced this event.
    pub discovery_id: String,

    /// The event.
    pub kind: EventKind,
}

impl Event {
    /// A port appeared.
    pub fn add(discovery_id: impl Into<String>, port: Port) -> Self {
        Self {
            discovery_id: discovery_id.into(),
            kind: EventKind::Add(port),
        }
    }

    /// A port went away.
    pub fn remove(discovery_id: impl Into<String>, port: Port) -> Self {
        Self {
            discovery_id: discovery_id.into(),
            kind: EventKind::Remove(port),
        }
    }

    /// The discovery stopped.
    pub fn stop(discovery_id: impl Into<String>) -> Self {
        Self {
            discovery_id: discovery_id.into(),
            kind: EventKind::Stop,
        }
    }

    /// The port this event is about, if any.
    pub fn port(&self) -> Option<&Port> {
        match &self.kind {
            EventKind::Add(port) | EventKind::Remove(port) => Some(port),
            EventKind::Stop => None,
        }
    }

    /// The wire name of this kind of event.
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::Add(_) => "add",
            EventKind::Remove(_) => "remove",
            EventKind::Stop => "stop",
        }
    }

    pub(crate) fn into_remove(self) -> Self {
        match self.kind {
            EventKind::Add(port) => Self::remove(self.discovery_id, port),
            _ => self,
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EventKind::Add(port) => write!(f, "{}: add {port}", self.discovery_id),
            EventKind::Remove(port) => write!(f, "{}: remove {port}", self.discovery_id),
            EventKind::Stop => write!(f, "{}: stop", self.discovery_id),
        }
    }
}
