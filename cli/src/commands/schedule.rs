// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Schedule commands
//!
//! `warden schedule next` prints upcoming fire times of a recurrence spec,
//! which is handy when writing persona schedules by hand.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use clap::Subcommand;
use colored::Colorize;

use warden_orchestrator_core::domain::schedule::{ScheduleError, ScheduleSpec};

#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// Print the next fire times of a schedule
    Next {
        /// Schedule, e.g. EVERY:2h, WEEKDAYS:MO:FR/09:30, MONTHDAY:-1/18:00
        #[arg(long)]
        spec: String,

        /// Last run as RFC 3339 (default: now)
        #[arg(long, value_name = "RFC3339")]
        last_run: Option<String>,

        /// IANA timezone the wall-clock times refer to
        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// Jitter seed for EVERY schedules, usually the persona id
        #[arg(long, default_value = "")]
        seed: String,

        /// Number of fire times to print
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

pub fn handle_command(command: ScheduleCommand) -> Result<()> {
    match command {
        ScheduleCommand::Next {
            spec,
            last_run,
            timezone,
            seed,
            count,
        } => {
            let last_run = match last_run {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("Invalid --last-run '{}'", raw))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            for line in next_runs(&spec, last_run, &timezone, &seed, count)? {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

/// Render the next `count` fire times, each in UTC and in the schedule's zone.
pub fn next_runs(
    spec: &str,
    last_run: DateTime<Utc>,
    timezone: &str,
    seed: &str,
    count: usize,
) -> Result<Vec<String>, ScheduleError> {
    let schedule: ScheduleSpec = spec.parse()?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| ScheduleError::UnknownTimezone(timezone.to_string()))?;

    let mut lines = Vec::new();
    let mut cursor = last_run;
    for _ in 0..count {
        let next = schedule.next_run_in(cursor, tz, seed);
        if next == DateTime::<Utc>::MAX_UTC {
            lines.push(format!("{}", "no further runs".yellow()));
            break;
        }
        lines.push(format!(
            "{}  ({})",
            next.to_rfc3339(),
            next.with_timezone(&tz).format("%a %Y-%m-%d %H:%M %Z")
        ));
        cursor = next;
    }
    Ok(lines)
}
