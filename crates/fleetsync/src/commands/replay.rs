//! Push message replay.
//!
//! Each non-empty line of the input is `{"source": "<id>", "message": {...}}`.
//! Lines starting with `#` are skipped. Messages are routed in file order
//! as if they had arrived on the named source's bus.

use serde::Deserialize;
use serde_json::Value;

use fleetsync_core::{RouteOutcome, SourceId};

use crate::cli::{GlobalOpts, ReplayArgs};
use crate::error::CliError;
use crate::output;

use super::Session;
use super::devices::print_directory;

#[derive(Debug, Deserialize)]
struct ReplayLine {
    source: SourceId,
    message: Value,
}

#[derive(Debug, Default)]
struct Tally {
    reported: usize,
    events: usize,
    dropped: usize,
    unhandled: usize,
}

impl Tally {
    fn record(&mut self, outcome: &RouteOutcome) {
        match outcome {
            RouteOutcome::Reported { .. } => self.reported += 1,
            RouteOutcome::DeviceEvent { .. } => self.events += 1,
            RouteOutcome::Dropped(_) => self.dropped += 1,
            RouteOutcome::Unhandled { .. } => self.unhandled += 1,
        }
    }

    fn total(&self) -> usize {
        self.reported + self.events + self.dropped + self.unhandled
    }
}

fn parse_line(file: &str, number: usize, line: &str) -> Result<Option<ReplayLine>, CliError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| CliError::Validation {
            field: format!("{file}:{number}"),
            reason: e.to_string(),
        })
}

pub async fn handle(session: &Session, args: &ReplayArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let body = tokio::fs::read_to_string(&args.file).await?;
    let file = args.file.display().to_string();

    // Parse everything first so a bad line routes nothing.
    let mut entries = Vec::new();
    for (i, line) in body.lines().enumerate() {
        if let Some(entry) = parse_line(&file, i + 1, line)? {
            entries.push(entry);
        }
    }

    session.refresh(global).await?;

    let mut tally = Tally::default();
    for entry in &entries {
        let outcome = session.hub.route_message(&entry.source, &entry.message).await;
        if let RouteOutcome::Dropped(ref reason) = outcome {
            tracing::info!(source = %entry.source, %reason, "replayed message dropped");
        }
        tally.record(&outcome);
    }

    output::print_note(
        &format!(
            "replayed {} messages: {} reports, {} events, {} dropped, {} unhandled",
            tally.total(),
            tally.reported,
            tally.events,
            tally.dropped,
            tally.unhandled
        ),
        global.quiet,
    );
    print_directory(session, global, None, false).await
}
