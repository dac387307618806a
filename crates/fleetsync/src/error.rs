//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` variants into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use fleetsync_config::ConfigError;
use fleetsync_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const UNAVAILABLE: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(fleetsync::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Select one with --profile or set default_profile in {path}"
        )
    )]
    ProfileNotFound {
        name: String,
        available: String,
        path: String,
    },

    #[error("Invalid configuration: {field}")]
    #[diagnostic(code(fleetsync::config), help("{reason}"))]
    InvalidConfig { field: String, reason: String },

    #[error("No credentials configured for source '{source_id}'")]
    #[diagnostic(
        code(fleetsync::no_credentials),
        help(
            "Set access_id together with access_secret_env (preferred) or\n\
             access_secret for this source in profile '{profile}'."
        )
    )]
    NoCredentials { profile: String, source_id: String },

    #[error("Source '{source_id}' has no snapshot file")]
    #[diagnostic(
        code(fleetsync::no_snapshot),
        help(
            "This binary serves accounts from snapshot files only.\n\
             Add `snapshot = \"<file>.json\"` to the source in your profile."
        )
    )]
    NoSnapshot { source_id: String },

    #[error(transparent)]
    #[diagnostic(code(fleetsync::config_load))]
    Config(Box<ConfigError>),

    // ── Resources ────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(fleetsync::not_found),
        help("Run: fleetsync {list_command} to see available {resource_type}s")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    #[error("No {kind} source is available to {operation}")]
    #[diagnostic(
        code(fleetsync::source_unavailable),
        help("Add a source of kind '{kind}' to the profile, or change its transports.")
    )]
    SourceUnavailable { kind: String, operation: String },

    #[error("Refresh failed: {message}")]
    #[diagnostic(
        code(fleetsync::refresh_failed),
        help("Check that every snapshot file exists and holds valid JSON.")
    )]
    RefreshFailed { message: String },

    #[error("Backend error: {message}")]
    #[diagnostic(code(fleetsync::backend))]
    Backend { message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(fleetsync::validation))]
    Validation { field: String, reason: String },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON payload: {0}")]
    #[diagnostic(code(fleetsync::json), help("Check the JSON file contents and try again."))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ProfileNotFound { .. }
            | Self::InvalidConfig { .. }
            | Self::NoCredentials { .. }
            | Self::NoSnapshot { .. }
            | Self::Config(_) => exit_code::CONFIG,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::SourceUnavailable { .. } | Self::RefreshFailed { .. } => exit_code::UNAVAILABLE,
            Self::Validation { .. } => exit_code::USAGE,
            Self::Backend { .. } | Self::Io(_) | Self::Json(_) => exit_code::GENERAL,
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ProfileNotFound { name, available } => CliError::ProfileNotFound {
                name,
                available,
                path: fleetsync_config::config_path().display().to_string(),
            },
            ConfigError::Validation { field, reason } => CliError::InvalidConfig { field, reason },
            ConfigError::NoCredentials { profile, source_id } => {
                CliError::NoCredentials { profile, source_id }
            }
            other => CliError::Config(Box::new(other)),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::DeviceNotFound { identifier } => CliError::NotFound {
                resource_type: "device".into(),
                identifier,
                list_command: "devices".into(),
            },

            CoreError::SourceNotFound { source_id } => CliError::NotFound {
                resource_type: "source".into(),
                identifier: source_id.to_string(),
                list_command: "config show".into(),
            },

            CoreError::SourceUnavailable { kind, operation } => {
                CliError::SourceUnavailable { kind, operation }
            }

            CoreError::RefreshFailed { source_id, message } => CliError::RefreshFailed {
                message: format!("{source_id}: {message}"),
            },

            CoreError::Config { message } => CliError::InvalidConfig {
                field: "profile".into(),
                reason: message,
            },

            CoreError::ValidationFailed { message } => CliError::Validation {
                field: "input".into(),
                reason: message,
            },

            other => CliError::Backend {
                message: other.to_string(),
            },
        }
    }
}
