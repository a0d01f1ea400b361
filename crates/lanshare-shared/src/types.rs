use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Stable identifier of a node: a UUID in canonical lowercase hyphenated form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a peer-supplied identifier, accepting only the canonical
    /// `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` lowercase shape.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if !is_valid_node_id(s) {
            return Err(ValidationError::InvalidNodeId(s.to_string()));
        }
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ValidationError::InvalidNodeId(s.to_string()))
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for NodeId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// UUID-shape check used on every identifier read off the wire.
pub fn is_valid_node_id(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => *b == b'-',
        _ => b.is_ascii_digit() || (b'a'..=b'f').contains(b),
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PresenceState {
    Online,
    Offline,
}

/// Direction of a logged transfer or chat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Direction::Sent),
            "received" => Some(Direction::Received),
            _ => None,
        }
    }
}

/// Contact trust grade set by the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TrustGrade {
    #[default]
    Green,
    Orange,
    Red,
}

impl TrustGrade {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustGrade::Green => "Green",
            TrustGrade::Orange => "Orange",
            TrustGrade::Red => "Red",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "Green" => Some(TrustGrade::Green),
            "Orange" => Some(TrustGrade::Orange),
            "Red" => Some(TrustGrade::Red),
            _ => None,
        }
    }
}

/// Compare two dotted-numeric version strings (`1.2.10` > `1.2.9`).
///
/// Components are compared pairwise; when one version is a prefix of the
/// other, the longer one is newer.
pub fn compare_versions(a: &str, b: &str) -> Result<std::cmp::Ordering, ValidationError> {
    let pa = parse_version(a)?;
    let pb = parse_version(b)?;
    for (x, y) in pa.iter().zip(pb.iter()) {
        if x != y {
            return Ok(x.cmp(y));
        }
    }
    Ok(pa.len().cmp(&pb.len()))
}

fn parse_version(v: &str) -> Result<Vec<u64>, ValidationError> {
    let trimmed = v.trim().trim_start_matches('v');
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidVersion(v.to_string()));
    }
    trimmed
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| ValidationError::InvalidVersion(v.to_string()))
        })
        .collect()
}
