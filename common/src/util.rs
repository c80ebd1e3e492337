use serde::{Deserialize, Deserializer, de::Error};

use crate::config::ConfigError;

pub fn flag(item: bool) -> String {
    let value = if item { "1" } else { "0" };
    value.to_owned()
}

/// Parses `64`, `4k`, `4K`, `1m` style block sizes into bytes
pub fn parse_block_size(block_size: &str) -> Result<u64, ConfigError> {
    let lower = block_size.trim().to_lowercase();
    let invalid = || ConfigError::InvalidBlockSize(block_size.to_owned());
    let (digits, multiplier) = if let Some(n) = lower.strip_suffix('k') {
        (n, 1024)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 1024 * 1024)
    } else {
        (lower.as_str(), 1)
    };
    digits
        .parse::<u64>()
        .map_err(|_| invalid())?
        .checked_mul(multiplier)
        .ok_or_else(invalid)
}

/// Inverse of [`parse_block_size`] for display, keeps exact byte counts
pub fn format_block_size(bytes: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{}M", bytes / MIB)
    } else if bytes >= 1024 && bytes % 1024 == 0 {
        format!("{}K", bytes / 1024)
    } else {
        bytes.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BlockSizeRepr {
    Bytes(u64),
    Text(String),
}

pub(crate) fn deserialize_block_sizes<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<BlockSizeRepr>::deserialize(deserializer)?
        .into_iter()
        .map(|repr| match repr {
            BlockSizeRepr::Bytes(b) => Ok(b),
            BlockSizeRepr::Text(s) => parse_block_size(&s).map_err(D::Error::custom),
        })
        .collect()
}
