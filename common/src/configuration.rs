use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Storage backend setup the reset tool switches the cluster into.
///
/// The discriminant is the id passed to the reset tool as its second
/// positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Configuration {
    Rocks = 1,
    Procks = 2,
    RocksPmem = 3,
    ProcksPmem = 4,
    Kstore = 5,
}

impl Configuration {
    pub const ALL: [Configuration; 5] = [
        Configuration::Rocks,
        Configuration::Procks,
        Configuration::RocksPmem,
        Configuration::ProcksPmem,
        Configuration::Kstore,
    ];

    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Configuration::Rocks => "rocks",
            Configuration::Procks => "procks",
            Configuration::RocksPmem => "rocks+pmem",
            Configuration::ProcksPmem => "procks+pmem",
            Configuration::Kstore => "kstore",
        }
    }

    /// Whether the backend keeps its store on persistent memory
    pub fn uses_pmem(&self) -> bool {
        matches!(self, Configuration::RocksPmem | Configuration::ProcksPmem)
    }
}

impl TryFrom<u8> for Configuration {
    type Error = ConfigError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|c| c.id() == id)
            .ok_or(ConfigError::UnknownConfiguration(id.to_string()))
    }
}

impl From<Configuration> for u8 {
    fn from(value: Configuration) -> Self {
        value.id()
    }
}

impl FromStr for Configuration {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(c) = Self::ALL.into_iter().find(|c| c.name() == s) {
            return Ok(c);
        }
        s.parse::<u8>()
            .map_err(|_| ConfigError::UnknownConfiguration(s.to_owned()))
            .and_then(Self::try_from)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_and_names_match_lookup_table() {
        let table: Vec<_> = Configuration::ALL
            .iter()
            .map(|c| (c.id(), c.name()))
            .collect();
        assert_eq!(
            table,
            vec![
                (1, "rocks"),
                (2, "procks"),
                (3, "rocks+pmem"),
                (4, "procks+pmem"),
                (5, "kstore"),
            ]
        );
    }

    #[test]
    fn unknown_ids_are_rejected() {
        assert!(Configuration::try_from(0).is_err());
        assert!(Configuration::try_from(6).is_err());
        assert_eq!(Configuration::try_from(3).unwrap(), Configuration::RocksPmem);
    }

    #[test]
    fn parses_names_and_ids() {
        assert_eq!("procks+pmem".parse::<Configuration>().unwrap(), Configuration::ProcksPmem);
        assert_eq!("5".parse::<Configuration>().unwrap(), Configuration::Kstore);
        assert!("bluestore".parse::<Configuration>().is_err());
    }

    #[test]
    fn deserializes_from_id_only() {
        let parsed: Vec<Configuration> = serde_yml::from_str("[1, 2]").unwrap();
        assert_eq!(parsed, vec![Configuration::Rocks, Configuration::Procks]);
        assert!(serde_yml::from_str::<Vec<Configuration>>("[9]").is_err());
    }
}
