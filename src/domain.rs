use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::RepoError;

/// Accession prefixes the store knows how to shard.
pub const PROPER_PREFIXES: [&str; 3] = ["ERR", "SRR", "SRS"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessionId {
    value: String,
    prefix_len: usize,
}

impl AccessionId {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn prefix(&self) -> &str {
        &self.value[..self.prefix_len]
    }

    pub fn suffix(&self) -> &str {
        &self.value[self.prefix_len..]
    }

    /// Two-level shard directories derived from the numeric suffix.
    pub fn shard(&self) -> (&str, &str) {
        let suffix = self.suffix();
        (&suffix[..2], &suffix[2..4])
    }
}

impl fmt::Display for AccessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl FromStr for AccessionId {
    type Err = RepoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let prefix_len = normalized
            .find(|ch: char| ch.is_ascii_digit())
            .unwrap_or(normalized.len());
        let (prefix, suffix) = normalized.split_at(prefix_len);
        let is_valid = PROPER_PREFIXES.contains(&prefix)
            && suffix.len() >= 4
            && suffix.chars().all(|ch| ch.is_ascii_digit());
        if !is_valid {
            return Err(RepoError::InvalidIdentifier(value.to_string()));
        }
        Ok(Self {
            value: normalized,
            prefix_len,
        })
    }
}

impl TryFrom<String> for AccessionId {
    type Error = RepoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AccessionId> for String {
    fn from(value: AccessionId) -> Self {
        value.value
    }
}

/// Provider ordering used for fetching and revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderSite {
    Ena,
    Entrez,
    #[default]
    EnaEntrez,
    EntrezEna,
}

impl fmt::Display for ProviderSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderSite::Ena => write!(f, "ena"),
            ProviderSite::Entrez => write!(f, "entrez"),
            ProviderSite::EnaEntrez => write!(f, "ena-entrez"),
            ProviderSite::EntrezEna => write!(f, "entrez-ena"),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_accession_normalizes_case() {
        let id: AccessionId = " err1000 ".parse().unwrap();
        assert_eq!(id.as_str(), "ERR1000");
        assert_eq!(id.prefix(), "ERR");
        assert_eq!(id.suffix(), "1000");
    }

    #[test]
    fn parse_accession_rejects_unknown_prefix() {
        let err = "DRR123456".parse::<AccessionId>().unwrap_err();
        assert_matches!(err, RepoError::InvalidIdentifier(_));
    }

    #[test]
    fn parse_accession_rejects_short_suffix() {
        let err = "SRR12".parse::<AccessionId>().unwrap_err();
        assert_matches!(err, RepoError::InvalidIdentifier(_));
    }

    #[test]
    fn shard_uses_first_four_digits() {
        let id: AccessionId = "SRR014966".parse().unwrap();
        assert_eq!(id.shard(), ("01", "49"));
    }
}
