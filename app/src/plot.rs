use std::{
    fs::{create_dir_all, remove_dir_all, write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use common::{
    record::{CampaignInfo, CampaignRecord, RESULTS_FILE, ResultStore},
    util::format_block_size,
};
use console::style;
use eyre::{Context, Result};
use serde::Serialize;
use tracing::debug;

const PLOT_DIR: &str = "plots";
const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Serialize)]
struct CellSeries {
    configuration: &'static str,
    configuration_id: u8,
    block_size: u64,
    runs: Vec<u32>,
    bandwidth: Vec<f64>,
    iops: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct Summary<'a> {
    name: Option<&'a str>,
    started_at: Option<DateTime<Local>>,
    runs_per_config: Option<u32>,
    cells: Vec<CellSeries>,
}

/// Analysis only entry point, never runs a trial.
///
/// `target` is either a campaign folder or a result CSV file.
pub fn plot(target: &str) -> Result<()> {
    let target = PathBuf::from(target);
    let (dir, csv) = if target.is_dir() {
        (target.clone(), target.join(RESULTS_FILE))
    } else {
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        (dir, target.clone())
    };

    let mut record = ResultStore::load_from(&csv)
        .with_context(|| format!("Loading result record {}", csv.display()))?;
    record.info = CampaignInfo::read(&dir)?;
    debug!("Loaded {} measurements from {}", record.len(), csv.display());

    present(&dir, &record)?;
    Ok(())
}

/// Writes the per cell series consumed by plotting and prints them as a table
pub fn present(dir: &Path, record: &CampaignRecord) -> Result<PathBuf> {
    let plot_path = dir.join(PLOT_DIR);
    _ = remove_dir_all(&plot_path);
    create_dir_all(&plot_path)?;

    let summary = Summary {
        name: record.info.as_ref().map(|i| i.name.as_str()),
        started_at: record.info.as_ref().map(|i| i.started_at),
        runs_per_config: record.info.as_ref().map(|i| i.runs_per_config),
        cells: record
            .cells()
            .map(|(key, cell)| CellSeries {
                configuration: key.configuration.name(),
                configuration_id: key.configuration.id(),
                block_size: key.block_size,
                runs: cell.run_indices(),
                bandwidth: cell.bandwidth(),
                iops: cell.iops(),
            })
            .collect(),
    };

    let summary_path = plot_path.join(SUMMARY_FILE);
    write(&summary_path, serde_json::to_string_pretty(&summary)?)
        .context("Writing result summary")?;

    print_table(&summary);
    println!("Summary written to {}", summary_path.display());
    Ok(summary_path)
}

fn join(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{v:.2}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_table(summary: &Summary<'_>) {
    if let Some(name) = summary.name {
        println!("{}", style(name).bold());
    }
    println!(
        "{}",
        style(format!(
            "{:<12} {:>6} {:>5}  {:<40} {}",
            "config", "bsize", "runs", "bandwidth (MB/s)", "IOPS"
        ))
        .underlined()
    );
    for cell in &summary.cells {
        let runs = match summary.runs_per_config {
            Some(expected) if cell.runs.len() < expected as usize => {
                style(format!("{}/{expected}", cell.runs.len())).yellow()
            }
            _ => style(cell.runs.len().to_string()),
        };
        println!(
            "{:<12} {:>6} {:>5}  {:<40} {}",
            cell.configuration,
            format_block_size(cell.block_size),
            runs,
            join(&cell.bandwidth),
            join(&cell.iops)
        );
    }
}
