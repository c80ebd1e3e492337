use std::{collections::HashMap, path::PathBuf};

use chrono::Local;
use common::{
    config::Config,
    configuration::Configuration,
    matrix::{Trial, TrialMatrix},
    record::{CampaignInfo, CampaignRecord, RESULTS_FILE, ResultStore},
    runner::{CampaignLog, Console, ProcessRunner},
};
use eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::fs::{copy, create_dir_all};
use tracing::{debug, info, warn};

use crate::{RESULTS_DIR, plot};

const CONFIG_FILE: &str = "config.yaml";
const LOG_FILE: &str = "campaign.log";

/// Where a trial currently is, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ResettingSystem,
    ExecutingBenchmark,
    ExtractingMetrics,
    Recording,
    SkippingFailedTrial,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CampaignSummary {
    pub proposed: usize,
    pub recorded: usize,
    pub skipped: usize,
    /// Already in the record when resuming
    pub already_recorded: usize,
    pub reset_failures: usize,
}

pub async fn run_benchmark(
    config_file: String,
    resume: Option<String>,
    no_progress: bool,
    skip_plot: bool,
) -> Result<()> {
    let (results_path, config, store) = match resume {
        Some(folder) => {
            let results_path = PathBuf::from(folder);
            let config = Config::load(results_path.join(CONFIG_FILE))
                .await
                .context("Loading campaign config")?;
            let info = CampaignInfo::read(&results_path)?;
            let store = ResultStore::resume(results_path.join(RESULTS_FILE), info)
                .context("Reopening result record")?;
            println!("Resuming campaign in folder: {}", results_path.display());
            (results_path, config, store)
        }
        None => {
            let config = Config::load(&config_file)
                .await
                .context("Loading campaign config")?;
            let started_at = Local::now();
            let file_prefix = started_at.format("%Y-%m-%d_%H-%M-%S").to_string();
            let results_path =
                PathBuf::from(RESULTS_DIR).join(format!("{}-{file_prefix}", config.name));
            create_dir_all(&results_path).await?;
            copy(&config_file, results_path.join(CONFIG_FILE)).await?;

            let info = CampaignInfo {
                name: config.name.clone(),
                started_at,
                workload: config.bench.name().to_owned(),
                configurations: config.configurations.clone(),
                block_sizes: config.block_sizes.clone(),
                runs_per_config: config.settings.runs_per_config,
            };
            info.write(&results_path)?;
            let store = ResultStore::create(results_path.join(RESULTS_FILE), Some(info))
                .context("Creating result record")?;
            println!("Results created in folder: {}", results_path.display());
            (results_path, config, store)
        }
    };

    let log = CampaignLog::create(results_path.join(LOG_FILE))
        .await
        .context("Opening campaign log")?;
    let matrix = config.matrix();
    let bar = (!no_progress).then(|| progress_bar(matrix.len() as u64));
    let console = match &bar {
        Some(bar) => Console::Bar(bar.clone()),
        None => Console::Stdout,
    };

    let runner = ProcessRunner::new(log, console, config.settings.trial_timeout());
    let mut campaign = Campaign::new(&config, runner, store);
    let result = campaign.run(&matrix, bar.as_ref()).await;
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    // release both sinks before reporting, also on a fatal error
    let (record, closed) = campaign.close().await;
    let summary = result?;
    let record = closed.and(record)?;

    println!(
        "Campaign done: {} of {} trials recorded, {} skipped, {} reset failures{}",
        summary.recorded,
        summary.proposed,
        summary.skipped,
        summary.reset_failures,
        if summary.already_recorded > 0 {
            format!(", {} recorded earlier", summary.already_recorded)
        } else {
            String::new()
        }
    );

    if !skip_plot {
        plot::present(&results_path, &record)?;
    }

    debug!("Exiting");
    Ok(())
}

fn progress_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    if let Ok(style) =
        ProgressStyle::with_template("{elapsed_precise} [{bar:40}] {pos}/{len} {msg}")
    {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

/// Runs every trial of a matrix in order: reset, benchmark, extract, record.
///
/// Reset and benchmark failures stay inside their trial. Only a broken
/// campaign log or result record ends the campaign early.
pub struct Campaign<'a> {
    config: &'a Config,
    runner: ProcessRunner,
    store: ResultStore,
    env: HashMap<String, String>,
}

impl<'a> Campaign<'a> {
    pub fn new(config: &'a Config, runner: ProcessRunner, store: ResultStore) -> Self {
        Self {
            config,
            runner,
            store,
            env: config.settings.env(),
        }
    }

    pub async fn run(
        &mut self,
        matrix: &TrialMatrix,
        progress: Option<&ProgressBar>,
    ) -> Result<CampaignSummary> {
        let mut summary = CampaignSummary::default();
        let mut current: Option<Configuration> = None;

        for trial in matrix.iter() {
            summary.proposed += 1;
            if current != Some(trial.configuration) {
                self.runner.console().suspend(|| {
                    info!(
                        "Running configuration {} ({})",
                        trial.configuration.id(),
                        trial.configuration
                    )
                });
                current = Some(trial.configuration);
            }
            if let Some(bar) = progress {
                bar.set_message(trial.to_string());
            }

            if self.store.contains(&trial) {
                debug!("[{trial}] already recorded");
                summary.already_recorded += 1;
            } else {
                self.run_trial(&trial, &mut summary).await?;
            }

            if let Some(bar) = progress {
                bar.inc(1);
            }
        }

        info!("Campaign finished: {summary:?}");
        Ok(summary)
    }

    async fn run_trial(&mut self, trial: &Trial, summary: &mut CampaignSummary) -> Result<()> {
        self.enter(trial, Stage::ResettingSystem);
        self.runner.trial_header(trial, "reset").await?;
        let reset = self.config.settings.reset.cmd(trial.configuration, &self.env);
        match self.runner.run(&reset).await {
            Ok(outcome) if outcome.exit.success() => {}
            Ok(outcome) => {
                summary.reset_failures += 1;
                self.flag(trial, &format!("reset exited with {}", outcome.exit))
                    .await?;
            }
            Err(err) if !err.is_fatal() => {
                summary.reset_failures += 1;
                self.flag(trial, &format!("reset failed: {:#}", eyre::Report::new(err)))
                    .await?;
            }
            Err(err) => return Err(err).context("Resetting system"),
        }

        self.enter(trial, Stage::ExecutingBenchmark);
        self.runner.trial_header(trial, "benchmark").await?;
        let cmd = self.config.bench.cmd(trial.block_size, &self.env);
        let output = match self.runner.run(&cmd).await {
            Ok(outcome) if outcome.exit.timed_out() => {
                return self
                    .skip(trial, summary, &format!("benchmark {}", outcome.exit))
                    .await;
            }
            Ok(outcome) => {
                if !outcome.exit.success() {
                    self.flag(trial, &format!("benchmark exited with {}", outcome.exit))
                        .await?;
                }
                outcome.output
            }
            Err(err) if !err.is_fatal() => {
                self.flag(
                    trial,
                    &format!("benchmark failed: {:#}", eyre::Report::new(err)),
                )
                .await?;
                String::new()
            }
            Err(err) => return Err(err).context("Running benchmark"),
        };

        self.enter(trial, Stage::ExtractingMetrics);
        let measurement = match self.config.bench.extract(&output) {
            Ok(measurement) => measurement,
            Err(miss) => return self.skip(trial, summary, &miss.to_string()).await,
        };

        self.enter(trial, Stage::Recording);
        match self.store.record(trial, measurement) {
            Ok(()) => {
                summary.recorded += 1;
                self.runner.console().suspend(|| {
                    info!(
                        "[{trial}] bandwidth={} MB/s iops={}",
                        measurement.bandwidth, measurement.iops
                    )
                });
                Ok(())
            }
            Err(err) if !err.is_fatal() => {
                self.skip(trial, summary, &format!("anomaly: {err}")).await
            }
            Err(err) => Err(err).context("Recording measurement"),
        }
    }

    fn enter(&self, trial: &Trial, stage: Stage) {
        debug!("[{trial}] {stage:?}");
    }

    /// Loud warning in both sinks for a failure the trial carries on past
    async fn flag(&mut self, trial: &Trial, reason: &str) -> Result<()> {
        self.runner
            .console()
            .suspend(|| warn!("[{trial}] {reason}, continuing"));
        self.runner
            .note(&format!("!!!! [{trial}] {reason}, continuing"))
            .await?;
        Ok(())
    }

    async fn skip(&mut self, trial: &Trial, summary: &mut CampaignSummary, reason: &str) -> Result<()> {
        self.enter(trial, Stage::SkippingFailedTrial);
        summary.skipped += 1;
        self.runner
            .console()
            .suspend(|| warn!("[{trial}] skipped: {reason}"));
        self.runner
            .note(&format!("!!!! [{trial}] skipped: {reason}"))
            .await?;
        Ok(())
    }

    /// Flushes and releases the campaign log and the result record
    pub async fn close(self) -> (Result<CampaignRecord>, Result<()>) {
        let record = self.store.close().context("Closing result record");
        let log = self.runner.close().await.context("Closing campaign log");
        (record, log)
    }
}
