//! Entity type discriminators and source state vocabulary.

use serde::{Deserialize, Serialize};

/// Source entity types mirrored into the records store.
///
/// Each variant owns exactly one target table. Feed discriminators that do
/// not parse into one of these decode as invalid change records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A teacher (source `contact` entity), mirrored into `persons`.
    Contact,
    /// A teacher's induction, mirrored into `inductions`.
    Induction,
}

impl EntityType {
    /// Every supported entity type, in the order a full run processes them.
    ///
    /// Contacts come first so inductions referencing them are usually
    /// applied after their person exists (not required for correctness).
    pub const ALL: [Self; 2] = [Self::Contact, Self::Induction];

    /// Feed discriminator string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Induction => "induction",
        }
    }

    /// Target table holding rows for this entity type.
    #[must_use]
    pub const fn table(&self) -> &'static str {
        match self {
            Self::Contact => "persons",
            Self::Induction => "inductions",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "contact" => Ok(Self::Contact),
            "induction" => Ok(Self::Induction),
            other => Err(format!("Unknown entity type: {other}")),
        }
    }
}

/// The store's vocabulary for a source record's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Active,
    Inactive,
    /// Superseded by another record in the source. Mirrored as-is; merge
    /// chains are not followed.
    Merged,
}

impl SourceState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Merged => "merged",
        }
    }
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "merged" => Ok(Self::Merged),
            _ => Err(format!("Unknown source state: {s}")),
        }
    }
}
