//! Machine-readable summary of a build run (`build/run.json`).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const RECORD_FILE: &str = "run.json";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRecord {
    pub number: u8,
    pub is_final: bool,
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub target: String,
    pub package: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageRecord>,
    pub outcome: Option<String>,
}

impl RunRecord {
    pub fn start(target: &str, package: &str) -> Self {
        Self {
            target: target.to_string(),
            package: package.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            stages: Vec::new(),
            outcome: None,
        }
    }

    pub fn finish(&mut self, outcome: &str) {
        self.finished_at = Some(Utc::now());
        self.outcome = Some(outcome.to_string());
    }

    /// Write the record as `run.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(RECORD_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(RECORD_FILE);
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let mut record = RunRecord::start("x86_64-unknown-linux-gnu", "clang");
        let now = Utc::now();
        record.stages.push(StageRecord {
            number: 1,
            is_final: false,
            profile: "none".to_string(),
            started_at: now,
            finished_at: now,
        });
        record.finish("installed");
        record.save(tmp.path()).unwrap();

        let loaded = RunRecord::load(tmp.path()).unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.outcome.as_deref(), Some("installed"));
    }
}
