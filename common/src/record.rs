use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions, read_to_string, write},
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{configuration::Configuration, matrix::Trial};

pub const RESULTS_FILE: &str = "results.csv";
pub const INFO_FILE: &str = "info.json";

const HEADER: [&str; 5] = ["configuration_name", "block_size", "run_index", "bandwidth", "iops"];

/// Bandwidth in MB/s and operations per second of one successful trial
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub bandwidth: f64,
    pub iops: f64,
}

impl Measurement {
    pub fn is_valid(&self) -> bool {
        [self.bandwidth, self.iops]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} is already recorded")]
    Duplicate(Trial),
    #[error("{trial}: refusing to record {measurement:?}")]
    InvalidMeasurement {
        trial: Trial,
        measurement: Measurement,
    },
    #[error("unknown configuration `{0}` in result record")]
    UnknownConfiguration(String),
    #[error("result record I/O")]
    Io(#[from] io::Error),
    #[error("result record CSV")]
    Csv(#[from] csv::Error),
    #[error("campaign info")]
    Info(#[from] serde_json::Error),
}

impl StoreError {
    /// Anything but a rejected row means the durable record can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StoreError::Duplicate(_) | StoreError::InvalidMeasurement { .. }
        )
    }
}

/// Campaign level metadata, stored next to the result record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignInfo {
    pub name: String,
    pub started_at: DateTime<Local>,
    pub workload: String,
    pub configurations: Vec<Configuration>,
    pub block_sizes: Vec<u64>,
    pub runs_per_config: u32,
}

impl CampaignInfo {
    pub fn write(&self, dir: &Path) -> Result<(), StoreError> {
        write(dir.join(INFO_FILE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// `None` when the folder has no info file, e.g. a bare CSV export
    pub fn read(dir: &Path) -> Result<Option<Self>, StoreError> {
        let path = dir.join(INFO_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&read_to_string(path)?)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    pub configuration: Configuration,
    pub block_size: u64,
}

/// All measurements sharing a configuration and block size, in run order.
/// Runs whose extraction failed are simply absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultCell {
    runs: BTreeMap<u32, Measurement>,
}

impl ResultCell {
    pub fn get(&self, run_index: u32) -> Option<&Measurement> {
        self.runs.get(&run_index)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Measurement)> {
        self.runs.iter().map(|(run, m)| (*run, m))
    }

    pub fn run_indices(&self) -> Vec<u32> {
        self.runs.keys().copied().collect()
    }

    pub fn bandwidth(&self) -> Vec<f64> {
        self.runs.values().map(|m| m.bandwidth).collect()
    }

    pub fn iops(&self) -> Vec<f64> {
        self.runs.values().map(|m| m.iops).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CampaignRecord {
    pub info: Option<CampaignInfo>,
    cells: BTreeMap<CellKey, ResultCell>,
}

impl CampaignRecord {
    pub fn new(info: Option<CampaignInfo>) -> Self {
        Self {
            info,
            cells: BTreeMap::new(),
        }
    }

    fn insert(&mut self, trial: &Trial, measurement: Measurement) -> Result<(), StoreError> {
        if self.contains(trial) {
            return Err(StoreError::Duplicate(*trial));
        }
        self.cells
            .entry(CellKey {
                configuration: trial.configuration,
                block_size: trial.block_size,
            })
            .or_default()
            .runs
            .insert(trial.run_index, measurement);
        Ok(())
    }

    pub fn contains(&self, trial: &Trial) -> bool {
        self.cell(trial.configuration, trial.block_size)
            .is_some_and(|c| c.get(trial.run_index).is_some())
    }

    pub fn cell(&self, configuration: Configuration, block_size: u64) -> Option<&ResultCell> {
        self.cells.get(&CellKey {
            configuration,
            block_size,
        })
    }

    pub fn cells(&self) -> impl Iterator<Item = (&CellKey, &ResultCell)> {
        self.cells.iter()
    }

    /// Every recorded trial with its measurement
    pub fn trials(&self) -> impl Iterator<Item = (Trial, &Measurement)> {
        self.cells.iter().flat_map(|(key, cell)| {
            cell.iter().map(|(run_index, m)| {
                (
                    Trial {
                        configuration: key.configuration,
                        block_size: key.block_size,
                        run_index,
                    },
                    m,
                )
            })
        })
    }

    /// Number of measurements
    pub fn len(&self) -> usize {
        self.cells.values().map(ResultCell::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ResultRow {
    #[serde(alias = "config")]
    configuration_name: String,
    #[serde(alias = "bsize")]
    block_size: u64,
    #[serde(alias = "run")]
    run_index: u32,
    bandwidth: f64,
    iops: f64,
}

/// Append only CSV record of every successful trial.
///
/// Each [`ResultStore::record`] reaches stable storage before it returns, so
/// the completed prefix of an interrupted campaign can always be reloaded.
pub struct ResultStore {
    path: PathBuf,
    writer: csv::Writer<File>,
    record: CampaignRecord,
}

impl ResultStore {
    /// Starts a new record, failing if `path` already exists
    pub fn create(path: impl AsRef<Path>, info: Option<CampaignInfo>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(HEADER)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        debug!("Created result record {}", path.display());
        Ok(Self {
            path,
            writer,
            record: CampaignRecord::new(info),
        })
    }

    /// Reopens an existing record for appending, keeping its complete rows.
    ///
    /// A torn final row, left by a write that failed midway, is cut off
    /// before anything is loaded or appended.
    pub fn resume(path: impl AsRef<Path>, info: Option<CampaignInfo>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dropped) = truncate_partial_row(&path)? {
            warn!(
                "Dropped {dropped} bytes of an unterminated last row from {}",
                path.display()
            );
        }
        let mut record = Self::load_from(&path)?;
        record.info = info;
        let file = OpenOptions::new().append(true).open(&path)?;
        let empty = file.metadata()?.len() == 0;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if empty {
            writer.write_record(HEADER)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        debug!(
            "Resumed result record {} with {} rows",
            path.display(),
            record.len()
        );
        Ok(Self {
            path,
            writer,
            record,
        })
    }

    /// Appends one row and syncs it to disk. A key can only be recorded once.
    pub fn record(&mut self, trial: &Trial, measurement: Measurement) -> Result<(), StoreError> {
        if self.record.contains(trial) {
            return Err(StoreError::Duplicate(*trial));
        }
        if !measurement.is_valid() {
            return Err(StoreError::InvalidMeasurement {
                trial: *trial,
                measurement,
            });
        }
        self.writer.serialize(ResultRow {
            configuration_name: trial.configuration.name().to_owned(),
            block_size: trial.block_size,
            run_index: trial.run_index,
            bandwidth: measurement.bandwidth,
            iops: measurement.iops,
        })?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.record.insert(trial, measurement)
    }

    pub fn contains(&self, trial: &Trial) -> bool {
        self.record.contains(trial)
    }

    pub fn all(&self) -> &CampaignRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(mut self) -> Result<CampaignRecord, StoreError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.record)
    }

    /// Rebuilds a record from a persisted CSV file without running anything
    pub fn load_from(path: impl AsRef<Path>) -> Result<CampaignRecord, StoreError> {
        let mut reader = csv::Reader::from_path(path.as_ref())?;
        let mut record = CampaignRecord::default();
        for row in reader.deserialize::<ResultRow>() {
            let row = row?;
            let configuration = row
                .configuration_name
                .parse::<Configuration>()
                .map_err(|_| StoreError::UnknownConfiguration(row.configuration_name.clone()))?;
            record.insert(
                &Trial {
                    configuration,
                    block_size: row.block_size,
                    run_index: row.run_index,
                },
                Measurement {
                    bandwidth: row.bandwidth,
                    iops: row.iops,
                },
            )?;
        }
        Ok(record)
    }
}

/// Cuts `path` back to its last newline, returning how many bytes went
fn truncate_partial_row(path: &Path) -> io::Result<Option<u64>> {
    let content = std::fs::read(path)?;
    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(None);
    }
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_all()?;
    Ok(Some((content.len() - keep) as u64))
}
