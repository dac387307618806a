//! Command planning and dispatch.

use serde_json::Value;
use tabled::Tabled;

use fleetsync_api::wire::CommandPayload;
use fleetsync_core::{BatchKind, CommandPlan, DeviceCommand};

use crate::cli::{GlobalOpts, OutputFormat, PlanArgs};
use crate::error::CliError;
use crate::output;

use super::Session;

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct BatchRow {
    #[tabled(rename = "Batch")]
    batch: String,
    #[tabled(rename = "Code")]
    code: String,
    #[tabled(rename = "Value")]
    value: String,
}

fn command_row(kind: BatchKind, command: &CommandPayload) -> BatchRow {
    BatchRow {
        batch: kind.to_string(),
        code: command.code.clone(),
        value: command.value.to_string(),
    }
}

fn rows(plan: &CommandPlan) -> Vec<BatchRow> {
    plan.regular_default
        .iter()
        .map(|c| command_row(BatchKind::RegularDefault, c))
        .chain(
            plan.regular_alternate
                .iter()
                .map(|c| command_row(BatchKind::RegularAlternate, c)),
        )
        .chain(plan.property_alternate.iter().map(|p| BatchRow {
            batch: BatchKind::PropertyAlternate.to_string(),
            code: p.code.clone(),
            value: format!("{:?}", p.value),
        }))
        .collect()
}

/// Parse `code=value`. The value is JSON when it parses, else a string.
pub fn parse_assignment(raw: &str) -> Result<DeviceCommand, CliError> {
    let (code, value) = raw.split_once('=').ok_or_else(|| CliError::Validation {
        field: "command".into(),
        reason: format!("expected CODE=VALUE, got '{raw}'"),
    })?;
    let code = code.trim();
    if code.is_empty() {
        return Err(CliError::Validation {
            field: "command".into(),
            reason: format!("missing code in '{raw}'"),
        });
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok(DeviceCommand::new(code, value))
}

pub async fn handle(session: &Session, args: &PlanArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let commands = args
        .commands
        .iter()
        .map(|raw| parse_assignment(raw))
        .collect::<Result<Vec<_>, _>>()?;

    session.refresh(global).await?;

    if args.dry_run {
        let plan = session.hub.plan_commands(&args.id, &commands).await;
        if !plan.known_device {
            output::print_note(
                &format!("note: no source lists {}; commands go unmodified to the default transport", args.id),
                global.quiet,
            );
        }
        return print_plan(&plan, global);
    }

    let report = session.hub.send_commands(&args.id, &commands).await?;
    match global.output {
        OutputFormat::Json | OutputFormat::JsonCompact => {
            let rendered = output::render_single(&global.output, &report, |_| String::new(), |_| String::new())?;
            output::print_output(&rendered, global.quiet);
        }
        OutputFormat::Table | OutputFormat::Plain => {
            print_plan(&report.plan, global)?;
            for batch in &report.dispatched {
                output::print_note(
                    &format!("sent {} via {} ({} entries)", batch.kind, batch.source_id, batch.count),
                    global.quiet,
                );
            }
        }
    }
    Ok(())
}

fn print_plan(plan: &CommandPlan, global: &GlobalOpts) -> Result<(), CliError> {
    let rendered = match global.output {
        OutputFormat::Table => output::render_table(&rows(plan)),
        OutputFormat::Plain => rows(plan)
            .into_iter()
            .map(|r| format!("{}\t{}\t{}", r.batch, r.code, r.value))
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Json | OutputFormat::JsonCompact => {
            output::render_single(&global.output, plan, |_| String::new(), |_| String::new())?
        }
    };
    output::print_output(&rendered, global.quiet);
    Ok(())
}
