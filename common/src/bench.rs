use core::fmt::Debug;
use std::collections::HashMap;

use downcast_rs::{Downcast, impl_downcast};
use dyn_clone::{DynClone, clone_trait_object};
use thiserror::Error;

use crate::{record::Measurement, runner::CommandSpec};

/// Why a benchmark's captured output did not yield a complete [`Measurement`]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionMiss {
    #[error("no {0} line in benchmark output")]
    Missing(&'static str),
    #[error("neither bandwidth nor IOPS found in benchmark output")]
    Both,
    #[error("{label} value `{value}` is not a non-negative number")]
    Invalid { label: &'static str, value: String },
}

/// The I/O workload run once per trial.
#[typetag::serde(tag = "type")]
pub trait Bench: Debug + DynClone + Downcast + Send + Sync {
    /// Name of the workload, for identification
    fn name(&self) -> &'static str;
    /// The invocation for one trial
    ///
    /// Arguments:
    /// * `block_size` - Transfer unit of the trial in bytes
    /// * `env` - Campaign wide environment, overlaid before the workload's own variables
    fn cmd(&self, block_size: u64, env: &HashMap<String, String>) -> CommandSpec;
    /// Pulls the two summary metrics out of the captured output
    fn extract(&self, output: &str) -> Result<Measurement, ExtractionMiss>;
}
clone_trait_object!(Bench);
impl_downcast!(Bench);
