//! Profile configuration for fleetsync hosts.
//!
//! TOML profiles, credential resolution (env + plaintext), virtual state
//! rule tables, and translation to `fleetsync_core::HubConfig`. The core
//! never reads files; hosts load a [`Config`] here and hand the resolved
//! pieces in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleetsync_core::{
    CommandRouting, HubConfig, RuleDeclaration, RuleRegistry, SourceConfig, SourceKind,
    VirtualStateKind,
};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{name}' not found (available: {available})")]
    ProfileNotFound { name: String, available: String },

    #[error("no credentials configured for source '{source_id}' in profile '{profile}'")]
    NoCredentials { profile: String, source_id: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Default profile name.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named hub profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,

    /// Virtual state rules per device category, shared by every profile.
    #[serde(default)]
    pub rules: BTreeMap<String, Vec<RuleDeclaration>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: BTreeMap::new(),
            rules: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    /// Periodic refresh interval for long-running hosts. 0 = never.
    #[serde(default)]
    pub refresh_interval_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            refresh_interval_secs: 0,
        }
    }
}

fn default_output() -> String {
    "table".into()
}

/// A named set of backend accounts reconciled by one hub.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Profile {
    /// Accounts in precedence order.
    #[serde(default)]
    pub sources: Vec<SourceProfile>,

    /// Override the global refresh interval.
    pub refresh_interval_secs: Option<u64>,

    /// Source kind serving regular commands ("sharing" unless set).
    pub default_transport: Option<String>,

    /// Source kind serving strategy-routed commands ("open_api" unless set).
    pub alternate_transport: Option<String>,
}

/// One backend account inside a profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceProfile {
    pub id: String,

    /// "sharing" or "open_api".
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Another source in the same profile whose cache this one wraps.
    pub backing: Option<String>,

    /// JSON snapshot file serving this account's devices.
    pub snapshot: Option<PathBuf>,

    /// Backend base URL.
    pub endpoint: Option<String>,

    pub access_id: Option<String>,

    /// Access secret (plaintext, prefer `access_secret_env`).
    pub access_secret: Option<String>,

    /// Environment variable name containing the access secret.
    pub access_secret_env: Option<String>,

    /// Message bus topics to subscribe after connecting.
    #[serde(default)]
    pub topics: Vec<String>,
}

fn default_kind() -> String {
    "sharing".into()
}

// ── Resolved profile ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_id: String,
    pub access_secret: SecretString,
}

/// A source with its file paths and credentials resolved.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub config: SourceConfig,
    pub snapshot: Option<PathBuf>,
    pub endpoint: Option<url::Url>,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone)]
pub struct ResolvedProfile {
    pub name: String,
    pub hub: HubConfig,
    pub sources: Vec<ResolvedSource>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "fleetsync", "fleetsync").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("fleetsync");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load defaults, then `path` (if it exists), then `FLEETSYNC_` variables.
///
/// Nested keys use a double underscore: `FLEETSYNC_DEFAULTS__OUTPUT=json`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("FLEETSYNC_").split("__"));

    let config: Config = figment.extract()?;
    tracing::debug!(
        path = %path.display(),
        profiles = config.profiles.len(),
        rule_categories = config.rules.len(),
        "configuration loaded"
    );
    Ok(config)
}

/// Load config, returning a default if loading fails.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

/// The profile to use: explicit name, else `default_profile`, else "default".
pub fn active_profile_name(explicit: Option<&str>, cfg: &Config) -> String {
    explicit
        .map(str::to_owned)
        .or_else(|| cfg.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

/// A copy of `profile` with plaintext secrets masked.
pub fn redact(profile: &Profile) -> Profile {
    let mut redacted = profile.clone();
    for source in &mut redacted.sources {
        if source.access_secret.is_some() {
            source.access_secret = Some("********".into());
        }
    }
    redacted
}

/// Render `profile` as TOML with secrets masked.
pub fn redacted_profile_toml(profile: &Profile) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(&redact(profile))?)
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the access secret from the credential chain.
///
/// 1. `access_secret_env` names a set variable
/// 2. plaintext `access_secret`
pub fn resolve_access_secret(source: &SourceProfile) -> Option<SecretString> {
    if let Some(ref env_name) = source.access_secret_env {
        if let Ok(val) = std::env::var(env_name) {
            return Some(SecretString::from(val));
        }
        tracing::debug!(source = %source.id, env = %env_name, "access secret variable not set");
    }
    source
        .access_secret
        .as_ref()
        .map(|s| SecretString::from(s.clone()))
}

/// Credentials are required when the source has an endpoint or an access id.
fn resolve_credentials(
    source: &SourceProfile,
    profile_name: &str,
) -> Result<Option<Credentials>, ConfigError> {
    if source.endpoint.is_none() && source.access_id.is_none() {
        return Ok(None);
    }
    let missing = || ConfigError::NoCredentials {
        profile: profile_name.into(),
        source_id: source.id.clone(),
    };
    let access_id = source.access_id.clone().ok_or_else(missing)?;
    let access_secret = resolve_access_secret(source).ok_or_else(missing)?;
    Ok(Some(Credentials {
        access_id,
        access_secret,
    }))
}

// ── Translation ─────────────────────────────────────────────────────

fn parse_kind(raw: &str, field: String) -> Result<SourceKind, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Validation {
        field,
        reason: format!("expected 'sharing' or 'open_api', got '{raw}'"),
    })
}

/// Resolve the profile `name` into a `HubConfig` plus per-source details.
///
/// Relative snapshot paths are joined onto `base_dir` when given.
pub fn resolve_profile(
    cfg: &Config,
    name: &str,
    base_dir: Option<&Path>,
) -> Result<ResolvedProfile, ConfigError> {
    let profile = cfg
        .profiles
        .get(name)
        .ok_or_else(|| ConfigError::ProfileNotFound {
            name: name.into(),
            available: available_profiles(cfg),
        })?;

    if profile.sources.is_empty() {
        return Err(ConfigError::Validation {
            field: format!("profiles.{name}.sources"),
            reason: "at least one source is required".into(),
        });
    }

    let mut sources = Vec::with_capacity(profile.sources.len());
    for (i, source) in profile.sources.iter().enumerate() {
        let field = |key: &str| format!("profiles.{name}.sources[{i}].{key}");

        let kind = parse_kind(&source.kind, field("kind"))?;
        let mut config = SourceConfig::new(source.id.as_str(), kind);
        config.backing = source.backing.as_deref().map(Into::into);
        config.topics.clone_from(&source.topics);

        let endpoint = source
            .endpoint
            .as_deref()
            .map(|raw| {
                raw.parse::<url::Url>().map_err(|_| ConfigError::Validation {
                    field: field("endpoint"),
                    reason: format!("invalid URL: {raw}"),
                })
            })
            .transpose()?;

        if source.snapshot.is_none() && endpoint.is_none() {
            return Err(ConfigError::Validation {
                field: field("snapshot"),
                reason: "a source needs a snapshot file or an endpoint".into(),
            });
        }

        let snapshot = source.snapshot.as_ref().map(|p| match base_dir {
            Some(base) if p.is_relative() => base.join(p),
            _ => p.clone(),
        });

        sources.push(ResolvedSource {
            config,
            snapshot,
            endpoint,
            credentials: resolve_credentials(source, name)?,
        });
    }

    let mut command_routing = CommandRouting::default();
    if let Some(ref raw) = profile.default_transport {
        command_routing.default_kind = parse_kind(raw, format!("profiles.{name}.default_transport"))?;
    }
    if let Some(ref raw) = profile.alternate_transport {
        command_routing.alternate_kind =
            parse_kind(raw, format!("profiles.{name}.alternate_transport"))?;
    }

    let hub = HubConfig {
        sources: sources.iter().map(|s| s.config.clone()).collect(),
        refresh_interval_secs: profile
            .refresh_interval_secs
            .unwrap_or(cfg.defaults.refresh_interval_secs),
        command_routing,
    };
    hub.validate().map_err(|e| ConfigError::Validation {
        field: format!("profiles.{name}.sources"),
        reason: e.to_string(),
    })?;

    Ok(ResolvedProfile {
        name: name.into(),
        hub,
        sources,
    })
}

/// Build the rule registry from `[[rules.<category>]]` tables.
pub fn build_rule_registry(cfg: &Config) -> Result<RuleRegistry, ConfigError> {
    let mut registry = RuleRegistry::new();
    for (category, declarations) in &cfg.rules {
        for (i, decl) in declarations.iter().enumerate() {
            if decl.key.is_empty() {
                return Err(ConfigError::Validation {
                    field: format!("rules.{category}[{i}].key"),
                    reason: "must not be empty".into(),
                });
            }
            if VirtualStateKind::from_bits(decl.kind).is_none_or(|k| k.is_empty()) {
                return Err(ConfigError::Validation {
                    field: format!("rules.{category}[{i}].kind"),
                    reason: format!("expected a non-zero combination of 1, 2 and 4, got {}", decl.kind),
                });
            }
        }
        registry.register_declarations(category.as_str(), declarations.iter().cloned());
    }
    Ok(registry)
}

fn available_profiles(cfg: &Config) -> String {
    if cfg.profiles.is_empty() {
        "(none)".into()
    } else {
        cfg.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}
