//! Core types used throughout tradepost

use crate::error::TradeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a trading actor
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for trade sessions
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID
    pub fn generate() -> Self {
        let bytes: [u8; 8] = rand::random();
        Self(format!("trade_{}", hex::encode(bytes)))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a kind of stackable resource (e.g. "wood")
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKind(pub String);

impl ItemKind {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A positive quantity of one resource kind.
///
/// Zero-quantity entries cannot be constructed, so every stored entry is valid.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawEntry")]
pub struct ResourceEntry {
    kind: ItemKind,
    quantity: u32,
}

impl ResourceEntry {
    /// Create an entry; returns `None` for a zero quantity
    pub fn new(kind: impl Into<String>, quantity: u32) -> Option<Self> {
        Self::of(ItemKind::new(kind), quantity)
    }

    pub fn of(kind: ItemKind, quantity: u32) -> Option<Self> {
        (quantity > 0).then_some(Self { kind, quantity })
    }

    pub fn kind(&self) -> &ItemKind {
        &self.kind
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    /// Same kind, different quantity; `None` for zero
    pub fn with_quantity(&self, quantity: u32) -> Option<Self> {
        Self::of(self.kind.clone(), quantity)
    }

    pub fn is_kind(&self, kind: &ItemKind) -> bool {
        &self.kind == kind
    }
}

#[derive(Deserialize)]
struct RawEntry {
    kind: ItemKind,
    quantity: u32,
}

impl TryFrom<RawEntry> for ResourceEntry {
    type Error = String;

    fn try_from(raw: RawEntry) -> std::result::Result<Self, Self::Error> {
        Self::of(raw.kind, raw.quantity)
            .ok_or_else(|| "resource quantity must be positive".to_string())
    }
}

/// Parses `kind:quantity`, e.g. `wood:10`
impl FromStr for ResourceEntry {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, quantity) = s
            .rsplit_once(':')
            .ok_or_else(|| TradeError::InvalidEntry(format!("expected kind:quantity, got '{}'", s)))?;
        let kind = kind.trim();
        if kind.is_empty() {
            return Err(TradeError::InvalidEntry(format!("missing kind in '{}'", s)));
        }
        let quantity: u32 = quantity
            .trim()
            .parse()
            .map_err(|_| TradeError::InvalidEntry(format!("bad quantity in '{}'", s)))?;
        Self::new(kind, quantity)
            .ok_or_else(|| TradeError::InvalidEntry(format!("quantity must be positive in '{}'", s)))
    }
}

impl fmt::Display for ResourceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.kind, self.quantity)
    }
}
