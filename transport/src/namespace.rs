use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Socket.IO namespaces used by the patrol backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Chat,
    Tracking,
}

impl Namespace {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Chat => "/chat",
            Self::Tracking => "/tracking",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/chat" => Some(Self::Chat),
            "/tracking" => Some(Self::Tracking),
            _ => None,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('/') {
            "chat" => Ok(Self::Chat),
            "tracking" => Ok(Self::Tracking),
            other => Err(format!("unknown namespace: {other}")),
        }
    }
}
