use crate::db::Database;
use crate::errors::AppResult;
use crate::models::CascadeReport;
use std::sync::Arc;

/// Per-dashboard mutation counter.
///
/// Increments go through a single `edit_count = edit_count + 1` statement, so
/// concurrent callers never lose an update.
#[derive(Clone)]
pub struct EditCounter {
    db: Arc<Database>,
}

impl EditCounter {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn increment(&self, owner_id: &str, dashboard_id: &str) -> AppResult<i64> {
        let count = self.db.increment_edit_count(owner_id, dashboard_id)?;
        tracing::debug!(owner_id = %owner_id, dashboard_id = %dashboard_id, edit_count = count, "dashboard edit counted");
        Ok(count)
    }

    /// Applies an optional dashboard hint carried by a chart mutation.
    /// Failures are logged and recorded on `report`, never returned.
    pub fn apply_hint(&self, owner_id: &str, dashboard_hint: Option<&str>, report: &mut CascadeReport) {
        let Some(dashboard_id) = dashboard_hint.filter(|id| !id.trim().is_empty()) else {
            return;
        };
        match self.increment(owner_id, dashboard_id) {
            Ok(count) => report.edit_count = Some(count),
            Err(error) => {
                tracing::warn!(
                    owner_id = %owner_id,
                    dashboard_id = %dashboard_id,
                    error = %error,
                    "failed to increment dashboard edit count"
                );
                report.failed_steps.push(format!("increment_edit_count:{dashboard_id}"));
            }
        }
    }
}
