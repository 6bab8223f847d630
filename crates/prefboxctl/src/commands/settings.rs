//! Single-setting commands and listing.

use anyhow::{anyhow, Context, Result};
use prefbox::{Filter, Query, Resolver, ResourceId, Setting, SettingValue, SettingsService, ValueType};
use serde::Serialize;

use crate::OutputFormat;

#[derive(Serialize)]
struct SettingInfo {
    id: i64,
    key: String,
    #[serde(rename = "type")]
    value_type: &'static str,
    value: String,
}

impl From<&Setting> for SettingInfo {
    fn from(setting: &Setting) -> Self {
        Self {
            id: setting.id,
            key: setting.key.clone(),
            value_type: setting.value_type().tag(),
            value: setting.value.to_string(),
        }
    }
}

#[derive(Serialize)]
struct SettingsOutput {
    settings: Vec<SettingInfo>,
    total: usize,
}

#[derive(Serialize)]
struct ChangeOutput<'a> {
    action: &'a str,
    key: Option<&'a str>,
    resource: Option<String>,
    count: usize,
}

pub fn get(service: &SettingsService, key: &str, format: OutputFormat) -> Result<()> {
    let setting = service
        .query(ResourceId::Collection, &Query::by_key(key))
        .context("failed to query setting")?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no setting named {key:?}"))?;

    match format {
        OutputFormat::Text => println!("{}", setting.value),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&SettingInfo::from(&setting))?);
        }
    }
    Ok(())
}

pub fn set(
    service: &SettingsService,
    key: &str,
    value: &str,
    value_type: &str,
    format: OutputFormat,
) -> Result<()> {
    let value_type = ValueType::parse_tag(value_type)?;
    let value = SettingValue::parse(value_type, value)?;
    let resource = service
        .upsert(&Setting::new(key, value))
        .with_context(|| format!("failed to set {key:?}"))?;

    let output = ChangeOutput {
        action: "set",
        key: Some(key),
        resource: Some(service.contract().uri(&resource)),
        count: 1,
    };
    match format {
        OutputFormat::Text => println!("Set '{}' ({})", key, output.resource.as_deref().unwrap_or("-")),
        OutputFormat::Json => println!("{}", serde_json::to_string(&output)?),
    }
    Ok(())
}

pub fn remove(service: &SettingsService, key: &str, format: OutputFormat) -> Result<()> {
    let count = service
        .delete(ResourceId::Collection, Some(&Filter::Key(key.to_string())))
        .with_context(|| format!("failed to remove {key:?}"))?;

    match format {
        OutputFormat::Text if count == 0 => println!("No setting named '{}'", key),
        OutputFormat::Text => println!("Removed '{}'", key),
        OutputFormat::Json => {
            let output = ChangeOutput {
                action: "remove",
                key: Some(key),
                resource: None,
                count,
            };
            println!("{}", serde_json::to_string(&output)?);
        }
    }
    Ok(())
}

pub fn clear(service: &SettingsService, format: OutputFormat) -> Result<()> {
    let count = service
        .delete(ResourceId::Collection, None)
        .context("failed to clear settings")?;

    match format {
        OutputFormat::Text => println!("Removed {} setting(s)", count),
        OutputFormat::Json => {
            let output = ChangeOutput {
                action: "clear",
                key: None,
                resource: None,
                count,
            };
            println!("{}", serde_json::to_string(&output)?);
        }
    }
    Ok(())
}

pub fn list(service: &SettingsService, format: OutputFormat) -> Result<()> {
    let settings = service
        .query(ResourceId::Collection, &Query::all())
        .context("failed to list settings")?;

    let output = SettingsOutput {
        total: settings.len(),
        settings: settings.iter().map(SettingInfo::from).collect(),
    };

    match format {
        OutputFormat::Text => {
            if output.settings.is_empty() {
                println!("No settings found.");
            } else {
                println!("{:>6}  {:<32} {:<10} {}", "ID", "KEY", "TYPE", "VALUE");
                println!("{}", "-".repeat(72));
                for setting in &output.settings {
                    println!(
                        "{:>6}  {:<32} {:<10} {}",
                        setting.id, setting.key, setting.value_type, setting.value
                    );
                }
                println!();
                println!("Total: {} setting(s)", output.total);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
