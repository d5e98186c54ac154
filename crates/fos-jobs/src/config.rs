//! Job System Configuration

use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};
use crate::types::PoolKind;

/// Worker layout and growth policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSystemConfig {
    pub composition_threadcount: usize,
    pub script_threadcount: usize,
    pub rendering_threadcount: usize,
    pub parsing_threadcount: usize,
    /// Spawn extra workers when a pool falls behind
    pub allow_dynamic_growth: bool,
    /// Cap on extra workers across all pools
    pub max_dynamic_threads: usize,
    /// Pending tickets per pool before `add_job` refuses work
    pub max_pending_jobs: usize,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            composition_threadcount: 1,
            script_threadcount: 1,
            rendering_threadcount: 1,
            parsing_threadcount: 1,
            allow_dynamic_growth: false,
            max_dynamic_threads: 4,
            max_pending_jobs: 1024,
        }
    }
}

impl JobSystemConfig {
    /// Create a config with explicit thread counts
    pub fn new(composition: usize, script: usize, rendering: usize, parsing: usize) -> Self {
        Self {
            composition_threadcount: composition,
            script_threadcount: script,
            rendering_threadcount: rendering,
            parsing_threadcount: parsing,
            ..Self::default()
        }
    }

    pub fn with_composition_threads(mut self, count: usize) -> Self {
        self.composition_threadcount = count;
        self
    }

    pub fn with_script_threads(mut self, count: usize) -> Self {
        self.script_threadcount = count;
        self
    }

    pub fn with_rendering_threads(mut self, count: usize) -> Self {
        self.rendering_threadcount = count;
        self
    }

    pub fn with_parsing_threads(mut self, count: usize) -> Self {
        self.parsing_threadcount = count;
        self
    }

    pub fn with_dynamic_growth(mut self, allow: bool) -> Self {
        self.allow_dynamic_growth = allow;
        self
    }

    pub fn with_max_dynamic_threads(mut self, count: usize) -> Self {
        self.max_dynamic_threads = count;
        self
    }

    pub fn with_max_pending_jobs(mut self, count: usize) -> Self {
        self.max_pending_jobs = count;
        self
    }

    /// Initial worker count for one pool
    pub fn threads_for(&self, kind: PoolKind) -> usize {
        match kind {
            PoolKind::Composition => self.composition_threadcount,
            PoolKind::Scripting => self.script_threadcount,
            PoolKind::Rendering => self.rendering_threadcount,
            PoolKind::Parsing => self.parsing_threadcount,
        }
    }

    /// Sum of the initial worker counts
    pub fn total_threads(&self) -> usize {
        PoolKind::ALL.iter().map(|&kind| self.threads_for(kind)).sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pending_jobs == 0 {
            return Err(JobError::InvalidConfig(
                "max_pending_jobs must be at least 1".into(),
            ));
        }
        if self.total_threads() == 0 && !self.allow_dynamic_growth {
            return Err(JobError::InvalidConfig(
                "no worker threads and dynamic growth disabled".into(),
            ));
        }
        if self.allow_dynamic_growth && self.max_dynamic_threads == 0 {
            return Err(JobError::InvalidConfig(
                "dynamic growth enabled with max_dynamic_threads = 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JobSystemConfig::default();
        assert_eq!(config.total_threads(), 4);
        assert!(!config.allow_dynamic_growth);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threads_per_pool() {
        let config = JobSystemConfig::new(2, 1, 1, 0);
        assert_eq!(config.threads_for(PoolKind::Composition), 2);
        assert_eq!(config.threads_for(PoolKind::Parsing), 0);
        assert_eq!(config.total_threads(), 4);
    }

    #[test]
    fn test_validate_rejects_empty_system() {
        let config = JobSystemConfig::new(0, 0, 0, 0);
        assert!(matches!(config.validate(), Err(JobError::InvalidConfig(_))));
        assert!(config.with_dynamic_growth(true).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_backlog() {
        let config = JobSystemConfig::default().with_max_pending_jobs(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: JobSystemConfig =
            serde_json::from_str(r#"{ "rendering_threadcount": 3, "allow_dynamic_growth": true }"#)
                .unwrap();

        assert_eq!(config.rendering_threadcount, 3);
        assert_eq!(config.composition_threadcount, 1);
        assert!(config.allow_dynamic_growth);
        assert_eq!(config.max_pending_jobs, 1024);
    }
}
