use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Deserializer, Serialize};

/// A communication port, as reported by a discovery tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    /// Where the port can be reached, e.g. `/dev/ttyACM0` or `192.168.1.10`.
    pub address: String,

    /// Human readable variant of the address.
    #[serde(rename = "label", default)]
    pub address_label: String,

    /// E.g. `serial` or `network`.
    #[serde(default)]
    pub protocol: String,

    /// Human readable variant of the protocol.
    #[serde(default)]
    pub protocol_label: String,

    /// Free-form properties, such as USB vendor and product IDs.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub properties: BTreeMap<String, String>,

    /// Properties which identify the device behind the port.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub identification_properties: BTreeMap<String, String>,
}

impl Port {
    /// Create a port with the given address and protocol.
    /// Labels are set equal to their values.
    pub fn new(address: impl Into<String>, protocol: impl Into<String>) -> Self {
        let address = address.into();
        let protocol = protocol.into();

        Self {
            address_label: address.clone(),
            protocol_label: protocol.clone(),
            address,
            protocol,
            ..Default::default()
        }
    }

    /// Add a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The identity of a port: two reports with the same key
    /// are the same port.
    pub fn key(&self) -> String {
        format!("{}|{}", self.address, self.protocol)
    }
}

impl Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = if self.address_label.is_empty() {
            &self.address
        } else {
            &self.address_label
        };

        write!(f, "{label} ({})", self.protocol)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}
