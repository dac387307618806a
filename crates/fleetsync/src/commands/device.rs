//! Single device detail.

use crate::cli::{DeviceArgs, GlobalOpts};
use crate::error::CliError;
use crate::output;

use super::{ListedDevice, Session};

fn detail(listed: &ListedDevice) -> String {
    let d = &listed.record;
    let sources: Vec<String> = listed.sources.iter().map(ToString::to_string).collect();
    let mut lines = vec![
        format!("ID:       {}", d.id),
        format!("Name:     {}", if d.name.is_empty() { "-" } else { d.name.as_str() }),
        format!("Category: {}", d.category),
        format!(
            "Product:  {}",
            if d.product_name.is_empty() { &d.product_id } else { &d.product_name }
        ),
        format!("Online:   {}", d.online),
        format!(
            "Updated:  {}",
            d.update_time.map_or_else(|| "-".into(), |t| t.to_rfc3339())
        ),
        format!("Sources:  {}", sources.join(", ")),
    ];

    if !d.status.is_empty() {
        lines.push(String::new());
        lines.push("Status:".into());
        for (code, value) in &d.status {
            let dp = d
                .get_transport_id(code)
                .map_or_else(String::new, |id| format!(" (dp {id})"));
            lines.push(format!("  {code}{dp} = {value}"));
        }
    }

    if !d.local_strategy.is_empty() {
        lines.push(String::new());
        lines.push("Strategy:".into());
        for (id, entry) in d.local_strategy.iter() {
            let mut flags = Vec::new();
            if entry.use_open_api {
                flags.push("open_api");
            }
            if entry.property_update {
                flags.push("property");
            }
            lines.push(format!("  {id:>5} {} [{}]", entry.status_code, flags.join(",")));
        }
    }
    lines.join("\n")
}

pub async fn handle(session: &Session, args: &DeviceArgs, global: &GlobalOpts) -> Result<(), CliError> {
    session.refresh(global).await?;
    let record = session.hub.device(&args.id).await?;
    let listed = session.listed(record).await;

    let rendered = output::render_single(&global.output, &listed, detail, |d| d.record.id.clone())?;
    output::print_output(&rendered, global.quiet);
    Ok(())
}
