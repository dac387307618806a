//! Config command handlers (no hub needed).

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

use super::config_file;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = config_file(global);

    match args.command {
        ConfigCommand::Path => {
            output::print_output(&path.display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = fleetsync_config::load_config_from(&path)?;
            let name = fleetsync_config::active_profile_name(global.profile.as_deref(), &cfg);
            let profile = cfg
                .profiles
                .get(&name)
                .ok_or_else(|| CliError::ProfileNotFound {
                    name: name.clone(),
                    available: cfg.profiles.keys().cloned().collect::<Vec<_>>().join(", "),
                    path: path.display().to_string(),
                })?;

            let redacted = fleetsync_config::redact(profile);
            let body = fleetsync_config::redacted_profile_toml(profile)?;
            let categories: Vec<&str> = cfg.rules.keys().map(String::as_str).collect();
            let rendered = output::render_single(
                &global.output,
                &redacted,
                |_| {
                    let mut text = format!("# profile: {name}\n{body}");
                    if !categories.is_empty() {
                        text.push_str(&format!("\n# rule categories: {}", categories.join(", ")));
                    }
                    text
                },
                |_| name.clone(),
            )?;
            output::print_output(&rendered, global.quiet);
            Ok(())
        }
    }
}
