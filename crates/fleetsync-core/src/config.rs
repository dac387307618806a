// ── Runtime hub configuration ──
//
// These types describe which accounts the hub reconciles and how writes
// are routed between them. They never touch disk: the CLI (or any other
// host) builds a `HubConfig` and hands it in.

use std::collections::HashSet;

use crate::error::CoreError;
use crate::model::{SourceId, SourceKind};

/// One backend account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub id: SourceId,
    pub kind: SourceKind,
    /// Another source whose cache this one wraps. Reports, command
    /// dispatch and message-source registration go through the backing.
    pub backing: Option<SourceId>,
    /// Topics to subscribe on this source's message bus after connecting.
    pub topics: Vec<String>,
}

impl SourceConfig {
    pub fn new(id: impl Into<SourceId>, kind: SourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            backing: None,
            topics: Vec::new(),
        }
    }

    pub fn backed_by(mut self, backing: impl Into<SourceId>) -> Self {
        self.backing = Some(backing.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }
}

/// Which source kinds serve the two write transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRouting {
    /// Serves regular commands for codes without `use_open_api`, and raw
    /// commands for devices no cache knows.
    pub default_kind: SourceKind,
    /// Serves codes whose strategy entry sets `use_open_api`.
    pub alternate_kind: SourceKind,
}

impl Default for CommandRouting {
    fn default() -> Self {
        Self {
            default_kind: SourceKind::Sharing,
            alternate_kind: SourceKind::OpenApi,
        }
    }
}

/// Configuration for one hub.
///
/// `sources` is in precedence order: it fixes the merge order, the order
/// of first-seen wins in the canonical directory and the order in which
/// write locks are taken.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    pub sources: Vec<SourceConfig>,
    /// How often to perform a full refresh (seconds). 0 = never.
    pub refresh_interval_secs: u64,
    pub command_routing: CommandRouting,
}

impl HubConfig {
    /// Check source ids and backing references.
    ///
    /// A backing must name another configured source that is not itself
    /// backed.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.as_str().is_empty() {
                return Err(CoreError::Config {
                    message: "source id must not be empty".into(),
                });
            }
            if !seen.insert(&source.id) {
                return Err(CoreError::Config {
                    message: format!("duplicate source id '{}'", source.id),
                });
            }
        }

        for source in &self.sources {
            let Some(ref backing) = source.backing else {
                continue;
            };
            if *backing == source.id {
                return Err(CoreError::Config {
                    message: format!("source '{}' cannot back itself", source.id),
                });
            }
            let Some(target) = self.source(backing) else {
                return Err(CoreError::Config {
                    message: format!(
                        "source '{}' is backed by unknown source '{backing}'",
                        source.id
                    ),
                });
            };
            if target.backing.is_some() {
                return Err(CoreError::Config {
                    message: format!(
                        "source '{}' is backed by '{backing}', which is itself backed",
                        source.id
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn source(&self, id: &SourceId) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == *id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(sources: Vec<SourceConfig>) -> HubConfig {
        HubConfig {
            sources,
            ..HubConfig::default()
        }
    }

    #[test]
    fn accepts_single_level_backing() {
        let cfg = config(vec![
            SourceConfig::new("home", SourceKind::Sharing),
            SourceConfig::new("legacy", SourceKind::Sharing).backed_by("home"),
            SourceConfig::new("cloud", SourceKind::OpenApi),
        ]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let cfg = config(vec![
            SourceConfig::new("home", SourceKind::Sharing),
            SourceConfig::new("home", SourceKind::OpenApi),
        ]);
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate source id 'home'"), "{err}");
    }

    #[test]
    fn rejects_unknown_and_chained_backing() {
        let unknown = config(vec![SourceConfig::new("a", SourceKind::Sharing).backed_by("zz")]);
        assert!(unknown.validate().is_err());

        let chained = config(vec![
            SourceConfig::new("a", SourceKind::Sharing),
            SourceConfig::new("b", SourceKind::Sharing).backed_by("a"),
            SourceConfig::new("c", SourceKind::Sharing).backed_by("b"),
        ]);
        assert!(chained.validate().is_err());

        let own = config(vec![SourceConfig::new("a", SourceKind::Sharing).backed_by("a")]);
        assert!(own.validate().is_err());
    }

    #[test]
    fn default_routing_prefers_sharing() {
        let routing = CommandRouting::default();
        assert_eq!(routing.default_kind, SourceKind::Sharing);
        assert_eq!(routing.alternate_kind, SourceKind::OpenApi);
    }
}
