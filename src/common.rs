//! Library-wide utilities.
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::Error::ArgumentError;
use crate::error::{Error, Result};

/// A set of tags a server must provide to satisfy a read preference.
pub type TagSet = BTreeMap<String, String>;

/// Indicates how a server should be selected during read operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl FromStr for ReadMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Primary" => ReadMode::Primary,
            "PrimaryPreferred" => ReadMode::PrimaryPreferred,
            "Secondary" => ReadMode::Secondary,
            "SecondaryPreferred" => ReadMode::SecondaryPreferred,
            "Nearest" => ReadMode::Nearest,
            _ => {
                return Err(ArgumentError(
                    format!("Could not convert '{}' to ReadMode.", s),
                ))
            }
        })
    }
}

/// Indicates which servers are acceptable for a read and in what order the
/// tag sets should be tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPreference {
    /// Indicates how a server should be selected during read operations.
    pub mode: ReadMode,
    /// Filters servers based on the first tag set that matches at least one
    /// server; an empty list matches everything.
    pub tag_sets: Vec<TagSet>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode, tag_sets: Option<Vec<TagSet>>) -> ReadPreference {
        ReadPreference {
            mode,
            tag_sets: tag_sets.unwrap_or_else(Vec::new),
        }
    }
}

impl Default for ReadPreference {
    fn default() -> Self {
        ReadPreference::new(ReadMode::Primary, None)
    }
}
