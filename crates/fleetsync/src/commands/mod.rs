//! Command dispatch: bridges CLI args -> hub operations -> output formatting.

pub mod config_cmd;
pub mod device;
pub mod devices;
pub mod plan;
pub mod replay;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use fleetsync_api::SnapshotBackend;
use fleetsync_config::ConfigError;
use fleetsync_core::{DeviceRecord, Hub, RefreshReport, SourceId};

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;
use crate::output;

/// The config file selected by `--config`, else the platform default.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(fleetsync_config::config_path)
}

// ── Session ─────────────────────────────────────────────────────────

/// A hub built from the active profile, with snapshot backends only.
pub struct Session {
    pub profile: String,
    pub hub: Hub,
}

impl Session {
    pub fn open(global: &GlobalOpts) -> Result<Self, CliError> {
        let path = config_file(global);
        let cfg = fleetsync_config::load_config_from(&path)?;
        let profile = fleetsync_config::active_profile_name(global.profile.as_deref(), &cfg);

        let resolved = fleetsync_config::resolve_profile(&cfg, &profile, path.parent())
            .map_err(|e| match e {
                ConfigError::ProfileNotFound { name, available } => CliError::ProfileNotFound {
                    name,
                    available,
                    path: path.display().to_string(),
                },
                other => other.into(),
            })?;
        let rules = fleetsync_config::build_rule_registry(&cfg)?;

        let mut builder = Hub::builder(resolved.hub).rules(Arc::new(rules));
        for source in resolved.sources {
            let Some(snapshot) = source.snapshot else {
                return Err(CliError::NoSnapshot {
                    source_id: source.config.id.to_string(),
                });
            };
            if source.endpoint.is_some() {
                tracing::debug!(source = %source.config.id, "endpoint configured, serving from snapshot");
            }
            builder = builder.backend(
                source.config.id.clone(),
                Arc::new(SnapshotBackend::from_path(snapshot)),
            );
        }

        Ok(Self {
            profile,
            hub: builder.build()?,
        })
    }

    /// Refresh every source; partial failures are reported on stderr.
    pub async fn refresh(&self, global: &GlobalOpts) -> Result<RefreshReport, CliError> {
        let report = self.hub.refresh().await?;
        for (source, err) in &report.failed {
            output::print_note(&format!("warning: source {source} kept its last devices: {err}"), global.quiet);
        }
        Ok(report)
    }

    /// A merged record plus the sources listing it.
    pub async fn listed(&self, record: DeviceRecord) -> ListedDevice {
        let sources = self.hub.aggregator().owners(&record.id).await;
        ListedDevice { record, sources }
    }
}

/// Serialized shape of one directory entry.
#[derive(Debug, Serialize)]
pub struct ListedDevice {
    #[serde(flatten)]
    pub record: DeviceRecord,
    pub sources: Vec<SourceId>,
}

/// Dispatch a hub-bound command to the appropriate handler.
pub async fn dispatch(cmd: &Command, session: &Session, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Devices(args) => devices::handle(session, args, global).await,
        Command::Device(args) => device::handle(session, args, global).await,
        Command::Replay(args) => replay::handle(session, args, global).await,
        Command::Plan(args) => plan::handle(session, args, global).await,
        // Config and Completions are handled before dispatch
        Command::Config(_) | Command::Completions(_) => unreachable!(),
    }
}
