use serde::Deserialize;

use super::JobStatus;

/// Selects a page of job records, newest first.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub limit: u32,
    pub offset: u32,
}

impl JobQuery {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 500;

    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(self, status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }

    pub fn with_limit(self, limit: u32) -> Self {
        Self { limit, ..self }
    }

    pub fn with_offset(self, offset: u32) -> Self {
        Self { offset, ..self }
    }

    /// The limit clamped to `1..=MAX_LIMIT`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}
