//! `rsz strategies`: list registered recommendation strategies

use anyhow::{Context, Result};
use scan_lib::StrategyRegistry;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_table, OutputFormat};

/// Row for the strategies table
#[derive(Debug, Serialize, Tabled)]
pub struct StrategyRow {
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "History")]
    pub history: String,
    #[tabled(rename = "Step")]
    pub step: String,
    #[tabled(rename = "Default settings")]
    #[serde(skip)]
    pub settings_text: String,
    #[tabled(skip)]
    pub settings: serde_json::Value,
}

/// One row per strategy, built with its default settings
pub fn strategy_rows(registry: &StrategyRegistry) -> Result<Vec<StrategyRow>> {
    registry
        .names()
        .into_iter()
        .map(|name| {
            let strategy = registry
                .resolve(&name, &serde_json::Value::Null)
                .with_context(|| format!("Failed to build strategy {}", name))?;
            let settings = strategy.snapshot().settings;
            Ok(StrategyRow {
                history: humantime::format_duration(strategy.history_duration()).to_string(),
                step: humantime::format_duration(strategy.timeframe()).to_string(),
                settings_text: serde_json::to_string(&settings)?,
                settings,
                name,
            })
        })
        .collect()
}

pub fn list(format: OutputFormat) -> Result<()> {
    let rows = strategy_rows(&StrategyRegistry::with_defaults())?;
    print_table(&rows, format)
}
