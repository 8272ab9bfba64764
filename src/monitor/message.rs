use std::{collections::BTreeMap, convert::Infallible};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::Error,
    protocol::{ProtocolMessage, Route},
};

/// Describes what a monitor tool supports, as replied to DESCRIBE.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    /// The protocol the tool handles, e.g. `serial`.
    #[serde(default)]
    pub protocol: String,

    /// The settings which can be changed via CONFIGURE, by name.
    #[serde(default)]
    pub configuration_parameters: BTreeMap<String, PortParameterDescriptor>,
}

/// A setting of a monitor, such as the baudrate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortParameterDescriptor {
    /// Human readable name.
    #[serde(default)]
    pub label: String,

    /// E.g. `enum`.
    #[serde(rename = "type", default)]
    pub kind: String,

    /// The values which may be chosen.
    #[serde(rename = "value", alias = "values", default)]
    pub values: Vec<String>,

    /// The current value.
    #[serde(default)]
    pub selected: String,
}

/// A monitor message, as read off the wire.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Envelope {
    #[serde(default)]
    event_type: String,

    #[serde(default)]
    message: String,

    #[serde(default)]
    error: bool,

    #[serde(default)]
    protocol_version: u32,

    #[serde(rename = "port_description", default)]
    port_description: Option<PortDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    message: String,
    error: bool,
}

impl Reply {
    fn failure(&self) -> Option<&str> {
        (self.error || !self.message.eq_ignore_ascii_case("OK")).then_some(self.message.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MonitorMessage {
    Hello {
        reply: Reply,
        protocol_version: u32,
    },
    Describe {
        reply: Reply,
        descriptor: Option<PortDescriptor>,
    },
    Configure(Reply),
    Open(Reply),
    Close(Reply),
    Quit(Reply),
    PortClosed,
    Other {
        event_type: String,
        reply: Reply,
    },
}

impl ProtocolMessage for MonitorMessage {
    type Envelope = Envelope;
    type Event = Infallible;

    fn from_envelope(envelope: Envelope) -> Result<Self, Error> {
        let Envelope {
            event_type,
            message,
            error,
            protocol_version,
            port_description,
        } = envelope;
        let reply = Reply { message, error };

        Ok(match event_type.as_str() {
            "hello" => Self::Hello {
                reply,
                protocol_version,
            },
            "describe" => Self::Describe {
                reply,
                descriptor: port_description,
            },
            "configure" => Self::Configure(reply),
            "open" => Self::Open(reply),
            "close" => Self::Close(reply),
            "quit" => Self::Quit(reply),
            "port_closed" => Self::PortClosed,
            _ => Self::Other { event_type, reply },
        })
    }

    fn event_type(&self) -> &str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Describe { .. } => "describe",
            Self::Configure(_) => "configure",
            Self::Open(_) => "open",
            Self::Close(_) => "close",
            Self::Quit(_) => "quit",
            Self::PortClosed => "port_closed",
            Self::Other { event_type, .. } => event_type,
        }
    }

    fn failure(&self) -> Option<&str> {
        match self {
            Self::Hello { reply, .. }
            | Self::Describe { reply, .. }
            | Self::Configure(reply)
            | Self::Open(reply)
            | Self::Close(reply)
            | Self::Quit(reply)
            | Self::Other { reply, .. } => reply.failure(),
            Self::PortClosed => None,
        }
    }

    fn route(self, _client_id: &str, _listening: bool) -> Route<Self, Infallible> {
        match self {
            Self::PortClosed => {
                info!("Port closed by the tool");
                Route::Discard
            }
            reply => Route::Reply(reply),
        }
    }

    fn closing_event(_client_id: &str) -> Option<Infallible> {
        None
    }
}
