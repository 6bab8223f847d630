//! Import command implementation.

use anyhow::{Context, Result};
use prefbox::{Resolver, ResourceId, Setting, SettingValue, SettingsService, ValueType};
use serde::{Deserialize, Serialize};

use crate::OutputFormat;

#[derive(Deserialize)]
struct ImportEntry {
    key: String,
    #[serde(rename = "type")]
    value_type: String,
    value: serde_json::Value,
}

impl ImportEntry {
    fn into_setting(self) -> prefbox::Result<Setting> {
        let value_type = ValueType::parse_tag(&self.value_type)?;
        let value = SettingValue::from_json(value_type, &self.value)?;
        Ok(Setting::new(self.key, value))
    }
}

#[derive(Serialize)]
struct ImportOutput<'a> {
    file: &'a str,
    imported: usize,
}

pub fn run(service: &SettingsService, file: &str, format: OutputFormat) -> Result<()> {
    let text =
        std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file))?;
    let entries: Vec<ImportEntry> =
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", file))?;

    let settings = entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| {
            let key = entry.key.clone();
            entry
                .into_setting()
                .with_context(|| format!("entry {} ({:?}) is invalid", i, key))
        })
        .collect::<Result<Vec<_>>>()?;

    let imported = service
        .bulk_insert(ResourceId::Collection, &settings)
        .context("import failed, nothing was written")?;

    let output = ImportOutput { file, imported };
    match format {
        OutputFormat::Text => println!("Imported {} setting(s) from {}", imported, file),
        OutputFormat::Json => println!("{}", serde_json::to_string(&output)?),
    }
    Ok(())
}
