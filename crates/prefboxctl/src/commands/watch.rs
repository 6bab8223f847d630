//! Watch command implementation.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use prefbox::{Query, Resolver, ResourceId, SettingValue, SettingsService};
use serde::Serialize;
use tokio::signal;

use crate::OutputFormat;

#[derive(Serialize)]
struct ChangeOutput<'a> {
    change: &'a str,
    key: &'a str,
    value: Option<String>,
}

type Snapshot = HashMap<String, SettingValue>;

fn snapshot(service: &SettingsService) -> Result<Snapshot> {
    let settings = service
        .query(ResourceId::Collection, &Query::all())
        .context("failed to read settings")?;
    Ok(settings.into_iter().map(|s| (s.key, s.value)).collect())
}

fn print_change(change: &str, key: &str, value: Option<&SettingValue>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => match value {
            Some(value) => println!("{:<8} {} = {}", change, key, value),
            None => println!("{:<8} {}", change, key),
        },
        OutputFormat::Json => {
            let output = ChangeOutput {
                change,
                key,
                value: value.map(ToString::to_string),
            };
            println!("{}", serde_json::to_string(&output)?);
        }
    }
    Ok(())
}

/// Print the differences between two snapshots, returning how many there were.
fn print_diff(before: &Snapshot, after: &Snapshot, format: OutputFormat) -> Result<usize> {
    let mut keys: Vec<&String> = before.keys().chain(after.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut changes = 0;
    for key in keys {
        let change = match (before.get(key), after.get(key)) {
            (None, Some(_)) => "added",
            (Some(old), Some(new)) if old != new => "changed",
            (Some(_), None) => "removed",
            _ => continue,
        };
        print_change(change, key, after.get(key), format)?;
        changes += 1;
    }
    Ok(changes)
}

pub async fn run(service: &SettingsService, interval_ms: u64, format: OutputFormat) -> Result<()> {
    let mut current = snapshot(service)?;

    if format == OutputFormat::Text {
        eprintln!(
            "Watching {} setting(s) every {}ms",
            current.len(),
            interval_ms
        );
        eprintln!("Press Ctrl+C to stop...\n");
    }

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let mut changes: usize = 0;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                if format == OutputFormat::Text {
                    eprintln!("\nSaw {} change(s)", changes);
                }
                break;
            }
            _ = interval.tick() => {
                let next = snapshot(service)?;
                changes += print_diff(&current, &next, format)?;
                current = next;
            }
        }
    }

    Ok(())
}
