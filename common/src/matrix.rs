use std::fmt;

use itertools::iproduct;
use serde::{Deserialize, Serialize};

use crate::{configuration::Configuration, util::format_block_size};

/// One unit of work: a configuration, a block size and a zero based run index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Trial {
    pub configuration: Configuration,
    pub block_size: u64,
    pub run_index: u32,
}

impl fmt::Display for Trial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config={}({}) run={} bsize={}",
            self.configuration,
            self.configuration.id(),
            self.run_index,
            format_block_size(self.block_size)
        )
    }
}

/// The full set of trials of a campaign.
///
/// Iteration order is configuration, then run index, then block size, so all
/// runs of one configuration are grouped and block size varies fastest.
/// [`TrialMatrix::iter`] can be called any number of times and always yields
/// the same sequence.
#[derive(Debug, Clone)]
pub struct TrialMatrix {
    configurations: Vec<Configuration>,
    block_sizes: Vec<u64>,
    runs_per_config: u32,
}

impl TrialMatrix {
    pub fn new(configurations: Vec<Configuration>, block_sizes: Vec<u64>, runs_per_config: u32) -> Self {
        Self {
            configurations,
            block_sizes,
            runs_per_config,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Trial> + '_ {
        iproduct!(
            self.configurations.iter(),
            0..self.runs_per_config,
            self.block_sizes.iter()
        )
        .map(|(configuration, run_index, block_size)| Trial {
            configuration: *configuration,
            block_size: *block_size,
            run_index,
        })
    }

    pub fn len(&self) -> usize {
        self.configurations.len() * self.block_sizes.len() * self.runs_per_config as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    pub fn block_sizes(&self) -> &[u64] {
        &self.block_sizes
    }

    pub fn runs_per_config(&self) -> u32 {
        self.runs_per_config
    }
}
