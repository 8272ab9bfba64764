use serde::Deserialize;

use crate::{
    error::Error,
    events::Event,
    port::Port,
    protocol::{ProtocolMessage, Route},
};

/// A discovery message, as read off the wire.
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
    ports: Option<Vec<Port>>,

    #[serde(default)]
    port: Option<Port>,
}

/// The outcome of a command, as reported by the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    message: String,
    error: bool,
}

impl Reply {
    fn failure(&self) -> Option<&str> {
        (self.error || self.message != "OK").then_some(self.message.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DiscoveryMessage {
    Start(Reply),
    Stop(Reply),
    Quit(Reply),
    List { reply: Reply, ports: Vec<Port> },
    Add(Port),
    Remove(Port),
    Other { event_type: String, reply: Reply },
}

impl ProtocolMessage for DiscoveryMessage {
    type Envelope = Envelope;
    type Event = Event;

    fn from_envelope(envelope: Envelope) -> Result<Self, Error> {
        let Envelope {
            event_type,
            message,
            error,
            ports,
            port,
        } = envelope;
        let reply = Reply { message, error };

        let missing_port = |event_type: &str| {
            Error::Protocol(format!("`{event_type}` event without a port"))
        };

        Ok(match event_type.as_str() {
            "start" => Self::Start(reply),
            "stop" => Self::Stop(reply),
            "quit" => Self::Quit(reply),
            "list" => Self::List {
                reply,
                ports: ports.unwrap_or_default(),
            },
            "add" => Self::Add(port.ok_or_else(|| missing_port("add"))?),
            "remove" => Self::Remove(port.ok_or_else(|| missing_port("remove"))?),
            _ => Self::Other { event_type, reply },
        })
    }

    fn event_type(&self) -> &str {
        match self {
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Quit(_) => "quit",
            Self::List { .. } => "list",
            Self::Add(_) => "add",
            Self::Remove(_) => "remove",
            Self::Other { event_type, .. } => event_type,
        }
    }

    fn failure(&self) -> Option<&str> {
        match self {
            Self::Start(reply)
            | Self::Stop(reply)
            | Self::Quit(reply)
            | Self::List { reply, .. }
            | Self::Other { reply, .. } => reply.failure(),
            Self::Add(_) | Self::Remove(_) => None,
        }
    }

    fn route(self, client_id: &str, listening: bool) -> Route<Self, Event> {
        match self {
            Self::Add(port) if listening => Route::Event(Event::add(client_id, port)),
            Self::Remove(port) if listening => Route::Event(Event::remove(client_id, port)),
            // Outside sync mode nobody asked for these.
            Self::Add(_) | Self::Remove(_) => Route::Discard,
            reply => Route::Reply(reply),
        }
    }

    fn closing_event(client_id: &str) -> Option<Event> {
        Some(Event::stop(client_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode(json: &str) -> Result<DiscoveryMessage, Error> {
        DiscoveryMessage::from_envelope(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn list_without_ports_is_empty() {
        let message = decode(r#"{"eventType":"list","message":"OK","ports":null}"#).unwrap();

        assert_eq!(
            message,
            DiscoveryMessage::List {
                reply: Reply {
                    message: "OK".into(),
                    error: false
                },
                ports: vec![]
            }
        );
        assert_eq!(message.failure(), None);
    }

    #[test]
    fn add_without_port_is_fatal() {
        let err = decode(r#"{"eventType":"add"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn non_ok_message_is_a_failure() {
        let message =
            decode(r#"{"eventType":"start","message":"Permission denied","error":true}"#).unwrap();

        assert_eq!(message.failure(), Some("Permission denied"));
    }

    #[test]
    fn events_are_routed_only_while_listening() {
        let add = decode(r#"{"eventType":"add","port":{"address":"COM3","protocol":"serial"}}"#)
            .unwrap();

        assert!(matches!(add.clone().route("d", false), Route::Discard));
        match add.route("d", true) {
            Route::Event(event) => {
                assert_eq!(event.discovery_id, "d");
                assert_eq!(event.port().unwrap().key(), "COM3|serial");
            }
            other => panic!("Unexpected route: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_kept() {
        let message = decode(r#"{"eventType":"hello","message":"OK"}"#).unwrap();

        assert_eq!(message.event_type(), "hello");
        assert!(matches!(message.route("d", true), Route::Reply(_)));
    }
}
