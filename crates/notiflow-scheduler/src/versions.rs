//! Content version history — snapshots of template, variables and email settings.
//!
//! Versions are numbered from 1 and only ever appended. A rollback restores an
//! old snapshot and records the restore as a new version.

use chrono::{DateTime, Utc};
use notiflow_core::error::{NotiflowError, Result};

use crate::tasks::{Task, TemplateVersion};

impl Task {
    /// Snapshot the current content as the next version. Returns its number.
    pub fn record_version(
        &mut self,
        changed_by: Option<&str>,
        description: &str,
        at: DateTime<Utc>,
    ) -> u32 {
        let version = self.current_version().map_or(1, |v| v + 1);
        self.version_history.push(TemplateVersion {
            version,
            timestamp: at,
            template: self.template.clone(),
            variables: self.variables.clone(),
            email_config: self.email_config.clone(),
            changed_by: changed_by.map(str::to_string),
            change_description: description.to_string(),
        });
        version
    }

    /// Restore the content of `version` and record the restore as a new version.
    pub fn rollback(
        &mut self,
        version: u32,
        changed_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<u32> {
        let snapshot = self
            .version_history
            .iter()
            .find(|v| v.version == version)
            .cloned()
            .ok_or_else(|| {
                NotiflowError::NotFound(format!("version {version} of task {}", self.id))
            })?;

        self.template = snapshot.template;
        self.variables = snapshot.variables;
        self.email_config = snapshot.email_config;
        let restored = self.record_version(changed_by, &format!("Rolled back to version {version}"), at);
        tracing::info!("⏪ Task {} rolled back to version {version} (now v{restored})", self.id);
        Ok(restored)
    }
}
