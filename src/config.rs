use std::{path::Path, sync::Arc};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{discovery::DiscoveryManager, error::Error, process::Launcher};

/// A discovery tool to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Unique ID, e.g. `builtin:serial-discovery`.
    pub id: String,

    /// The tool's command line. The first entry is the program.
    pub command: Vec<String>,
}

/// A monitor tool to use for some protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorConfig {
    /// The protocol the tool handles, e.g. `serial`.
    pub protocol: String,

    /// The tool's command line. The first entry is the program.
    pub command: Vec<String>,
}

/// The configuration of discoveries and monitors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// The discoveries the manager should run.
    #[serde(default)]
    pub discoveries: Vec<DiscoveryConfig>,

    /// The monitors available, by protocol.
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,

    /// How we introduce ourselves to monitor tools.
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            discoveries: vec![
                DiscoveryConfig {
                    id: "builtin:serial-discovery".into(),
                    command: vec!["serial-discovery".into()],
                },
                DiscoveryConfig {
                    id: "builtin:mdns-discovery".into(),
                    command: vec!["mdns-discovery".into()],
                },
            ],
            monitors: vec![MonitorConfig {
                protocol: "serial".into(),
                command: vec!["serial-monitor".into()],
            }],
            user_agent: Some("port-keel".into()),
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let s = std::fs::read_to_string(p)?;

        Self::deserialize(&s)
    }

    /// The user agent to use, falling back to our name and version.
    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("port-keel {}", env!("CARGO_PKG_VERSION")))
    }

    /// The monitor configured for `protocol`.
    pub fn monitor_for(&self, protocol: &str) -> Option<&MonitorConfig> {
        self.monitors
            .iter()
            .find(|monitor| monitor.protocol == protocol)
    }

    /// A manager with every configured discovery added (not started).
    pub async fn discovery_manager(
        &self,
        launcher: Arc<dyn Launcher>,
    ) -> Result<DiscoveryManager, Error> {
        let manager = DiscoveryManager::new(launcher);

        for discovery in &self.discoveries {
            manager
                .add(discovery.id.clone(), discovery.command.clone())
                .await?;
        }

        Ok(manager)
    }

    fn check_duplicate_discoveries(&self) -> Result<(), Error> {
        let duplicates = self
            .discoveries
            .iter()
            .map(|discovery| &discovery.id)
            .duplicates()
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "Discovery IDs must be unique. Duplicates: {duplicates:?}"
            )))
        }
    }

    fn check_duplicate_monitors(&self) -> Result<(), Error> {
        let duplicates = self
            .monitors
            .iter()
            .map(|monitor| &monitor.protocol)
            .duplicates()
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "Only one monitor per protocol. Duplicates: {duplicates:?}"
            )))
        }
    }

    fn check_empty_commands(&self) -> Result<(), Error> {
        let discoveries = self
            .discoveries
            .iter()
            .filter(|discovery| discovery.command.is_empty())
            .map(|discovery| format!("discovery `{}`", discovery.id));

        let monitors = self
            .monitors
            .iter()
            .filter(|monitor| monitor.command.is_empty())
            .map(|monitor| format!("monitor for `{}`", monitor.protocol));

        let empty = discoveries.chain(monitors).join(", ");

        if empty.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "Commands must name a program. Empty: {empty}"
            )))
        }
    }

    /// Check the configuration makes sense.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_empty_commands()?;
        self.check_duplicate_discoveries()?;
        self.check_duplicate_monitors()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn example_roundtrips() {
        let example = Config::example();
        let serialized = example.serialize_pretty().unwrap();

        assert_eq!(Config::deserialize(&serialized).unwrap(), example);
    }

    #[test]
    fn deserialize() {
        let input = r#"
(
    discoveries: [
        (
            id: "serial",
            command: ["serial-discovery", "-v"],
        ),
    ],
    user_agent: "tests",
)
"#;

        let config = Config::deserialize(input).unwrap();

        assert_eq!(config.discoveries[0].command, vec!["serial-discovery", "-v"]);
        assert!(config.monitors.is_empty());
        assert_eq!(config.user_agent(), "tests");
        config.validate().unwrap();
    }

    #[test]
    fn garbage_is_bad_config() {
        let problem = Config::deserialize("(discoveries: 3)")
            .unwrap_err()
            .try_into_bad_config();

        assert!(problem.is_ok());
    }

    #[test]
    fn duplicate_discovery_ids() {
        let mut config = Config::example();
        config.discoveries.push(config.discoveries[0].clone());

        let problem = config.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(problem.contains("builtin:serial-discovery"), "{problem}");
    }

    #[test]
    fn duplicate_monitor_protocols() {
        let mut config = Config::example();
        config.monitors.push(config.monitors[0].clone());

        assert!(config.validate().unwrap_err().try_into_bad_config().is_ok());
    }

    #[test]
    fn empty_command() {
        let mut config = Config::example();
        config.monitors[0].command.clear();

        let problem = config.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(problem.contains("monitor for `serial`"), "{problem}");
    }

    #[test]
    fn finds_monitor_by_protocol() {
        let config = Config::example();

        assert!(config.monitor_for("serial").is_some());
        assert!(config.monitor_for("network").is_none());
    }
}
