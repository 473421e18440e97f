use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Auxiliary capabilities whose health is tracked independently of the
/// phase pipeline. Failures here never affect task scheduling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Dashboard,
    SidebarPanel,
    StatusBar,
    FileLogging,
    AutoUpdate,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 5] = [
        FeatureKind::Dashboard,
        FeatureKind::SidebarPanel,
        FeatureKind::StatusBar,
        FeatureKind::FileLogging,
        FeatureKind::AutoUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::SidebarPanel => "sidebar_panel",
            Self::StatusBar => "status_bar",
            Self::FileLogging => "file_logging",
            Self::AutoUpdate => "auto_update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dashboard" => Some(Self::Dashboard),
            "sidebar_panel" => Some(Self::SidebarPanel),
            "status_bar" => Some(Self::StatusBar),
            "file_logging" => Some(Self::FileLogging),
            "auto_update" => Some(Self::AutoUpdate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// Health record for one named feature. Created at startup for every
/// known feature; never destroyed, only reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStatus {
    pub kind: FeatureKind,
    pub healthy: bool,
    pub fallback_active: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl FeatureStatus {
    pub fn new(kind: FeatureKind, max_retries: u32) -> Self {
        Self {
            kind,
            healthy: true,
            fallback_active: false,
            retry_count: 0,
            max_retries,
            last_error: None,
            next_retry_at: None,
        }
    }

    pub fn record_failure(&mut self, error: String, next_retry_at: DateTime<Utc>) {
        self.healthy = false;
        self.retry_count += 1;
        self.last_error = Some(error);
        self.next_retry_at = Some(next_retry_at);
    }

    pub fn reset(&mut self) {
        self.healthy = true;
        self.fallback_active = false;
        self.retry_count = 0;
        self.last_error = None;
        self.next_retry_at = None;
    }

    /// True once the feature has used up its retry budget; the fallback
    /// then stays in place until a manual `reset`.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn recovery_due(&self, now: DateTime<Utc>) -> bool {
        if self.healthy || self.retries_exhausted() {
            return false;
        }
        match self.next_retry_at {
            Some(at) => now >= at,
            None => false,
        }
    }
}
