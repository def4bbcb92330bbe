use std::{fmt::Write as _, str::FromStr};

use anyhow::{anyhow, Result};

use crate::reconcile::{ActionOutcome, LotController, LotView};

pub const HELP: &str = "\
Commands:
  enter    simulate a car entering (assigns the first free spot)
  exit     simulate a car leaving (frees the highest occupied spot)
  reset    clear every spot and the analytics
  status   show the lot and the analytics summary
  help     show this text
  quit     leave";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Enter,
    Exit,
    Reset,
    Status,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "enter" | "in" | "e" => Ok(Command::Enter),
            "exit" | "leave" | "out" | "x" => Ok(Command::Exit),
            "reset" => Ok(Command::Reset),
            "status" | "s" | "ls" => Ok(Command::Status),
            "help" | "?" | "h" => Ok(Command::Help),
            "quit" | "q" => Ok(Command::Quit),
            other => Err(anyhow!("unknown command '{other}', type 'help'")),
        }
    }
}

/// Runs one command and returns the text to show. `Quit` is left to the caller.
pub async fn execute(controller: &LotController, command: Command) -> Result<String> {
    let outcome = match command {
        Command::Enter => controller.enter().await?,
        Command::Exit => controller.exit().await?,
        Command::Reset => controller.reset().await?,
        Command::Status => return Ok(render_status(&controller.view().await)),
        Command::Help | Command::Quit => return Ok(HELP.to_string()),
    };

    // Every action leaves a notification behind; fall back to the outcome if it already expired.
    Ok(controller
        .notifier()
        .current()
        .map(|notification| notification.message)
        .unwrap_or_else(|| describe(&outcome)))
}

fn describe(outcome: &ActionOutcome) -> String {
    match outcome {
        ActionOutcome::Assigned { index, lane } => {
            format!("Assigned to Spot {} (Lane {lane})", index + 1)
        }
        ActionOutcome::Released {
            index, duration, ..
        } => format!("Spot {} released after {duration}", index + 1),
        ActionOutcome::Reset => "Parking lot reset.".to_string(),
        ActionOutcome::Rejected { reason } => format!("Rejected: {reason}"),
        ActionOutcome::Conflict => "Parking lot changed, try again.".to_string(),
    }
}

pub fn render_status(view: &LotView) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}/{} spots occupied", view.occupied, view.capacity);

    for spot in &view.spots {
        let detail = match (spot.occupied, &spot.elapsed, &spot.last_duration) {
            (true, Some(elapsed), _) => format!("occupied  {elapsed}"),
            (true, None, _) => "occupied".to_string(),
            (false, _, Some(last)) => format!("vacant    last stay {last}"),
            (false, _, None) => "vacant".to_string(),
        };
        let _ = writeln!(
            out,
            "Spot {:>2} | Lane {} | {detail}",
            spot.number, spot.lane
        );
    }

    let last_updated = view
        .analytics
        .last_updated
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string());
    let _ = write!(
        out,
        "Entries: {}  Exits: {}  Last updated: {last_updated}",
        view.analytics.entries, view.analytics.exits
    );

    if let Some(notification) = &view.notification {
        let _ = write!(out, "\n> {}", notification.message);
    }
    out
}
