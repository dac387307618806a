//! Directory listing.

use tabled::Tabled;

use crate::cli::{DevicesArgs, GlobalOpts};
use crate::error::CliError;
use crate::output;

use super::{ListedDevice, Session};

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Category")]
    category: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Sources")]
    sources: String,
    #[tabled(rename = "Codes")]
    codes: usize,
}

fn row(listed: &ListedDevice, color: bool) -> DeviceRow {
    let d = &listed.record;
    DeviceRow {
        id: d.id.clone(),
        name: if d.name.is_empty() { "-".into() } else { d.name.clone() },
        category: d.category.clone(),
        state: output::online_label(d.online, color),
        sources: listed
            .sources
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        codes: d.status.len(),
    }
}

pub async fn handle(session: &Session, args: &DevicesArgs, global: &GlobalOpts) -> Result<(), CliError> {
    session.refresh(global).await?;
    print_directory(session, global, args.category.as_deref(), args.online).await
}

/// Print the canonical directory, optionally filtered.
pub async fn print_directory(
    session: &Session,
    global: &GlobalOpts,
    category: Option<&str>,
    online_only: bool,
) -> Result<(), CliError> {
    let mut listed = Vec::new();
    for record in session.hub.devices().await.into_values() {
        if category.is_some_and(|c| c != record.category) || (online_only && !record.online) {
            continue;
        }
        listed.push(session.listed(record).await);
    }

    let color = output::should_color(&global.color);
    let rendered = output::render_list(
        &global.output,
        &listed,
        |d| row(d, color),
        |d| d.record.id.clone(),
    )?;
    output::print_output(&rendered, global.quiet);
    Ok(())
}
