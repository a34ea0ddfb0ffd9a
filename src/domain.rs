use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MirrorError;

static ENTITY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[QP][1-9][0-9]*$").expect("valid entity id pattern"));

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kind implied by the id prefix.
    pub fn implied_kind(&self) -> EntityKind {
        if self.0.starts_with('P') {
            EntityKind::Property
        } else {
            EntityKind::Item
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if !ENTITY_ID.is_match(&normalized) {
            return Err(MirrorError::InvalidEntityId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for EntityId {
    type Error = MirrorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Item,
    Property,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Item => "item",
            EntityKind::Property => "property",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "item" => Ok(EntityKind::Item),
            "property" => Ok(EntityKind::Property),
            other => Err(MirrorError::Decode(format!("unknown entity type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Dump,
    Api,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Dump => "dump",
            Source::Api => "api",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "dump" => Ok(Source::Dump),
            "api" => Ok(Source::Api),
            other => Err(MirrorError::StorageIo(format!("unknown row source: {other}"))),
        }
    }
}

/// Statements plus every top-level field the decoder does not model.
///
/// Both halves are kept verbatim; consumers interpret them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub statements: Map<String, Value>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub descriptions: BTreeMap<String, String>,
    #[serde(default)]
    pub aliases: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub claims: Claims,
    #[serde(default)]
    pub modified: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub source: Source,
}

impl Entity {
    pub fn summary(&self, language: &str) -> EntitySummary {
        EntitySummary {
            id: self.id.clone(),
            kind: self.kind,
            label: pick_language(&self.labels, language).map(str::to_string),
            description: pick_language(&self.descriptions, language).map(str::to_string),
        }
    }

    pub fn label(&self, language: &str) -> Option<&str> {
        pick_language(&self.labels, language)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub id: EntityId,
    pub kind: EntityKind,
    pub label: Option<String>,
    pub description: Option<String>,
}

/// Preferred language first, then the lexically first language present.
pub fn pick_language<'a>(values: &'a BTreeMap<String, String>, language: &str) -> Option<&'a str> {
    values
        .get(language)
        .or_else(|| values.values().next())
        .map(String::as_str)
}

/// Truncate to the millisecond precision rows are persisted with.
pub fn to_stored_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        to_stored_precision(Utc::now())
    }
}
