//! Hierarchical index levels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Granularity of an HHNI node, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexLevel {
    /// Whole document.
    System,
    Section,
    Paragraph,
    Sentence,
    /// Word or symbol token.
    Subword,
}

impl IndexLevel {
    /// Depth below the root (SYSTEM is 0).
    pub fn depth(&self) -> usize {
        match self {
            Self::System => 0,
            Self::Section => 1,
            Self::Paragraph => 2,
            Self::Sentence => 3,
            Self::Subword => 4,
        }
    }

    /// The next finer level, if any.
    pub fn child(&self) -> Option<Self> {
        match self {
            Self::System => Some(Self::Section),
            Self::Section => Some(Self::Paragraph),
            Self::Paragraph => Some(Self::Sentence),
            Self::Sentence => Some(Self::Subword),
            Self::Subword => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::Section => "SECTION",
            Self::Paragraph => "PARAGRAPH",
            Self::Sentence => "SENTENCE",
            Self::Subword => "SUBWORD",
        }
    }
}

impl fmt::Display for IndexLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SYSTEM" | "DOCUMENT" => Ok(Self::System),
            "SECTION" => Ok(Self::Section),
            "PARAGRAPH" => Ok(Self::Paragraph),
            "SENTENCE" => Ok(Self::Sentence),
            "SUBWORD" | "TOKEN" => Ok(Self::Subword),
            other => Err(format!("unknown index level '{other}'")),
        }
    }
}
