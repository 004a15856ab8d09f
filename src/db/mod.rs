use crate::errors::{AppError, AppResult};
use crate::models::{
    ActivityRecord, ActivityType, AuditEvent, Chart, ChartConfig, CreateChartPayload, CreateDataSourcePayload,
    Dashboard, DataSource, DataSourceType, LayoutPlacement, MlModel, PreprocessingRule, SaveDashboardPayload,
    SaveMlModelPayload, UpdateChartPayload,
};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const DATA_SOURCE_COLUMNS: &str = "id, owner_id, name, source_type, headers_json, content_json, file_url,
     preprocessing_json, linked_charts_json, created_at, updated_at";
const CHART_COLUMNS: &str = "id, owner_id, name, chart_type, data_source_id, config_json, created_at, updated_at";
const DASHBOARD_COLUMNS: &str = "id, owner_id, name, description, layout_json, edit_count, created_at, updated_at";
const ML_MODEL_COLUMNS: &str = "id, owner_id, name, description, model_type, data_source_id, features_json, target,
     parameters_json, preprocessing_json, training_result_json, created_at, updated_at";

/// The owner-scoped collections the store exposes generically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    DataSources,
    Charts,
    Dashboards,
    MlModels,
}

impl Collection {
    pub fn table(self) -> &'static str {
        match self {
            Self::DataSources => "data_sources",
            Self::Charts => "charts",
            Self::Dashboards => "dashboards",
            Self::MlModels => "ml_models",
        }
    }

    fn kind_column(self) -> &'static str {
        match self {
            Self::DataSources => "source_type",
            Self::Charts => "chart_type",
            Self::Dashboards => "NULL",
            Self::MlModels => "model_type",
        }
    }

    pub fn activity_type(self) -> Option<ActivityType> {
        match self {
            Self::DataSources => None,
            Self::Charts => Some(ActivityType::Chart),
            Self::Dashboards => Some(ActivityType::Dashboard),
            Self::MlModels => Some(ActivityType::Mlmodel),
        }
    }
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        tracing::debug!(path = %path.display(), "entity store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Data Sources ───────────────────────────────────────────────────────

    pub fn insert_data_source(&self, owner_id: &str, payload: CreateDataSourcePayload) -> AppResult<DataSource> {
        let now = Utc::now().trunc_subsecs(6);
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO data_sources (id, owner_id, name, source_type, headers_json, content_json, file_url,
             preprocessing_json, linked_charts_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '[]', '[]', ?8, ?8)",
            params![
                id,
                owner_id,
                payload.name,
                payload.source_type.as_str(),
                serde_json::to_string(&payload.headers)?,
                serde_json::to_string(&payload.content)?,
                payload.file_url,
                fmt_time(now),
            ],
        )?;

        Ok(DataSource {
            id,
            owner_id: owner_id.to_string(),
            name: payload.name,
            source_type: payload.source_type,
            headers: payload.headers,
            content: payload.content,
            file_url: payload.file_url,
            preprocessing: Vec::new(),
            linked_charts: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_data_source(&self, owner_id: &str, id: &str) -> AppResult<Option<DataSource>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {DATA_SOURCE_COLUMNS} FROM data_sources WHERE id = ?1 AND owner_id = ?2"),
            params![id, owner_id],
            parse_data_source_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_data_sources(&self, owner_id: &str) -> AppResult<Vec<DataSource>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DATA_SOURCE_COLUMNS} FROM data_sources WHERE owner_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([owner_id], parse_data_source_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn rename_data_source(&self, owner_id: &str, id: &str, name: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE data_sources SET name = ?1, updated_at = ?2 WHERE id = ?3 AND owner_id = ?4",
            params![name, fmt_time(Utc::now()), id, owner_id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_preprocessing(&self, owner_id: &str, id: &str, rules: &[PreprocessingRule]) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE data_sources SET preprocessing_json = ?1, updated_at = ?2 WHERE id = ?3 AND owner_id = ?4",
            params![serde_json::to_string(rules)?, fmt_time(Utc::now()), id, owner_id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_data_source(&self, owner_id: &str, id: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM data_sources WHERE id = ?1 AND owner_id = ?2",
            params![id, owner_id],
        )?;
        Ok(changed > 0)
    }

    /// Adds `chart_id` to the data source's linked set. Returns `false` when it was already present.
    pub fn add_linked_chart(&self, data_source_id: &str, chart_id: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT linked_charts_json FROM data_sources WHERE id = ?1",
                [data_source_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(existing) = existing else {
            return Err(AppError::NotFound(format!("data source {data_source_id}")));
        };

        let mut linked: Vec<String> = serde_json::from_str(&existing)?;
        if linked.iter().any(|current| current == chart_id) {
            return Ok(false);
        }
        linked.push(chart_id.to_string());

        conn.execute(
            "UPDATE data_sources SET linked_charts_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&linked)?, data_source_id],
        )?;
        Ok(true)
    }

    pub fn set_linked_charts(&self, data_source_id: &str, chart_ids: &[String]) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE data_sources SET linked_charts_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(chart_ids)?, data_source_id],
        )?;
        Ok(changed > 0)
    }

    /// Pulls every id in `chart_ids` out of the linked sets of the owner's data sources.
    /// Returns how many linked entries were removed in total.
    pub fn remove_linked_charts(&self, owner_id: &str, chart_ids: &[String]) -> AppResult<u64> {
        if chart_ids.is_empty() {
            return Ok(0);
        }
        let targets: HashSet<&str> = chart_ids.iter().map(String::as_str).collect();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare("SELECT id, linked_charts_json FROM data_sources WHERE owner_id = ?1")?;
            let rows = stmt
                .query_map([owner_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut removed = 0u64;
        for (id, raw) in rows {
            let mut linked: Vec<String> = match serde_json::from_str(&raw) {
                Ok(linked) => linked,
                Err(error) => {
                    tracing::warn!(
                        owner_id = %owner_id,
                        data_source_id = %id,
                        error = %error,
                        "skipping data source with unreadable linked charts"
                    );
                    continue;
                }
            };
            let before = linked.len();
            linked.retain(|chart_id| !targets.contains(chart_id.as_str()));
            if linked.len() != before {
                removed += (before - linked.len()) as u64;
                tx.execute(
                    "UPDATE data_sources SET linked_charts_json = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&linked)?, id],
                )?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    // ─── Charts ─────────────────────────────────────────────────────────────

    pub fn insert_chart(&self, owner_id: &str, payload: CreateChartPayload) -> AppResult<Chart> {
        let now = Utc::now().trunc_subsecs(6);
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO charts (id, owner_id, name, chart_type, data_source_id, config_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id,
                owner_id,
                payload.name,
                payload.chart_type,
                payload.data_source_id,
                serde_json::to_string(&payload.config)?,
                fmt_time(now),
            ],
        )?;

        Ok(Chart {
            id,
            owner_id: owner_id.to_string(),
            name: payload.name,
            chart_type: payload.chart_type,
            data_source_id: payload.data_source_id,
            config: payload.config,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_chart(&self, owner_id: &str, id: &str) -> AppResult<Option<Chart>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {CHART_COLUMNS} FROM charts WHERE id = ?1 AND owner_id = ?2"),
            params![id, owner_id],
            parse_chart_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn get_charts_by_ids(&self, owner_id: &str, ids: &[String]) -> AppResult<Vec<Chart>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {CHART_COLUMNS} FROM charts WHERE owner_id = ?1 AND id IN ({})",
            placeholders(ids.len(), 2)
        );
        let mut stmt = conn.prepare(&sql)?;
        let values = std::iter::once(owner_id).chain(ids.iter().map(String::as_str));
        let rows = stmt.query_map(params_from_iter(values), parse_chart_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn list_charts(&self, owner_id: &str) -> AppResult<Vec<Chart>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHART_COLUMNS} FROM charts WHERE owner_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([owner_id], parse_chart_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn update_chart(&self, owner_id: &str, id: &str, payload: &UpdateChartPayload) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE charts SET name = ?1, chart_type = ?2, config_json = ?3, updated_at = ?4
             WHERE id = ?5 AND owner_id = ?6",
            params![
                payload.name,
                payload.chart_type,
                serde_json::to_string(&payload.config)?,
                fmt_time(Utc::now()),
                id,
                owner_id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn update_chart_config(&self, owner_id: &str, id: &str, config: &ChartConfig) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE charts SET config_json = ?1, updated_at = ?2 WHERE id = ?3 AND owner_id = ?4",
            params![serde_json::to_string(config)?, fmt_time(Utc::now()), id, owner_id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_chart(&self, owner_id: &str, id: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM charts WHERE id = ?1 AND owner_id = ?2", params![id, owner_id])?;
        Ok(changed > 0)
    }

    /// Bulk delete by id. `owner_id = None` skips the owner filter for callers that
    /// already trust the ids (charts listed in a data source's linked set).
    pub fn delete_many_by_ids(&self, collection: Collection, owner_id: Option<&str>, ids: &[String]) -> AppResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let changed = match owner_id {
            Some(owner_id) => {
                let sql = format!(
                    "DELETE FROM {} WHERE owner_id = ?1 AND id IN ({})",
                    collection.table(),
                    placeholders(ids.len(), 2)
                );
                let values = std::iter::once(owner_id).chain(ids.iter().map(String::as_str));
                conn.execute(&sql, params_from_iter(values))?
            }
            None => {
                let sql = format!(
                    "DELETE FROM {} WHERE id IN ({})",
                    collection.table(),
                    placeholders(ids.len(), 1)
                );
                conn.execute(&sql, params_from_iter(ids.iter().map(String::as_str)))?
            }
        };
        Ok(changed as u64)
    }

    // ─── Dashboards ─────────────────────────────────────────────────────────

    pub fn insert_dashboard(&self, owner_id: &str, payload: SaveDashboardPayload) -> AppResult<Dashboard> {
        let now = Utc::now().trunc_subsecs(6);
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO dashboards (id, owner_id, name, description, layout_json, edit_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
            params![
                id,
                owner_id,
                payload.name,
                payload.description,
                serde_json::to_string(&payload.layout)?,
                fmt_time(now),
            ],
        )?;

        Ok(Dashboard {
            id,
            owner_id: owner_id.to_string(),
            name: payload.name,
            description: payload.description,
            layout: payload.layout,
            edit_count: 1,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_dashboard(&self, owner_id: &str, id: &str) -> AppResult<Option<Dashboard>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {DASHBOARD_COLUMNS} FROM dashboards WHERE id = ?1 AND owner_id = ?2"),
            params![id, owner_id],
            parse_dashboard_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Newest first. `limit = None` returns every dashboard of the owner.
    pub fn list_dashboards(&self, owner_id: &str, limit: Option<u32>) -> AppResult<Vec<Dashboard>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DASHBOARD_COLUMNS} FROM dashboards WHERE owner_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![owner_id, sql_limit(limit)], parse_dashboard_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Overwrites name, description and layout and bumps the edit count in one statement.
    /// Returns the new edit count, or `None` when no dashboard matched.
    pub fn update_dashboard(&self, owner_id: &str, id: &str, payload: &SaveDashboardPayload) -> AppResult<Option<i64>> {
        let conn = self.conn()?;
        conn.query_row(
            "UPDATE dashboards
             SET name = ?1, description = ?2, layout_json = ?3, edit_count = edit_count + 1, updated_at = ?4
             WHERE id = ?5 AND owner_id = ?6
             RETURNING edit_count",
            params![
                payload.name,
                payload.description,
                serde_json::to_string(&payload.layout)?,
                fmt_time(Utc::now()),
                id,
                owner_id,
            ],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Atomic `edit_count + 1`; concurrent increments never lose an update.
    pub fn increment_edit_count(&self, owner_id: &str, id: &str) -> AppResult<i64> {
        let conn = self.conn()?;
        let count: Option<i64> = conn
            .query_row(
                "UPDATE dashboards SET edit_count = edit_count + 1, updated_at = ?1
                 WHERE id = ?2 AND owner_id = ?3
                 RETURNING edit_count",
                params![fmt_time(Utc::now()), id, owner_id],
                |row| row.get(0),
            )
            .optional()?;
        count.ok_or_else(|| AppError::NotFound(format!("dashboard {id}")))
    }

    pub fn delete_dashboard(&self, owner_id: &str, id: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM dashboards WHERE id = ?1 AND owner_id = ?2",
            params![id, owner_id],
        )?;
        Ok(changed > 0)
    }

    /// Removes placements referencing any of `chart_ids` from every dashboard of the owner.
    /// Dashboards without a match are left untouched. Returns the number of dashboards changed.
    pub fn prune_layouts(&self, owner_id: &str, chart_ids: &[String]) -> AppResult<u64> {
        if chart_ids.is_empty() {
            return Ok(0);
        }
        let targets: HashSet<&str> = chart_ids.iter().map(String::as_str).collect();
        let (_, dashboards) = self.retain_layouts(owner_id, |placement| !targets.contains(placement.chart_id.as_str()))?;
        Ok(dashboards)
    }

    /// Drops placements whose chart no longer exists for the owner.
    /// Returns `(placements_removed, dashboards_changed)`.
    pub fn prune_missing_layout_entries(&self, owner_id: &str) -> AppResult<(u64, u64)> {
        let existing: HashSet<String> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT id FROM charts WHERE owner_id = ?1")?;
            let ids = stmt
                .query_map([owner_id], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            ids
        };
        self.retain_layouts(owner_id, |placement| existing.contains(&placement.chart_id))
    }

    fn retain_layouts<F>(&self, owner_id: &str, mut keep: F) -> AppResult<(u64, u64)>
    where
        F: FnMut(&LayoutPlacement) -> bool,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare("SELECT id, layout_json FROM dashboards WHERE owner_id = ?1")?;
            let rows = stmt
                .query_map([owner_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut removed = 0u64;
        let mut dashboards = 0u64;
        for (id, raw) in rows {
            let mut layout: Vec<LayoutPlacement> = match serde_json::from_str(&raw) {
                Ok(layout) => layout,
                Err(error) => {
                    tracing::warn!(
                        owner_id = %owner_id,
                        dashboard_id = %id,
                        error = %error,
                        "skipping dashboard with unreadable layout"
                    );
                    continue;
                }
            };
            let before = layout.len();
            layout.retain(|placement| keep(placement));
            if layout.len() != before {
                removed += (before - layout.len()) as u64;
                dashboards += 1;
                tx.execute(
                    "UPDATE dashboards SET layout_json = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&layout)?, id],
                )?;
            }
        }
        tx.commit()?;
        Ok((removed, dashboards))
    }

    // ─── ML Models ──────────────────────────────────────────────────────────

    pub fn insert_ml_model(&self, owner_id: &str, payload: SaveMlModelPayload) -> AppResult<MlModel> {
        let now = Utc::now().trunc_subsecs(6);
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ml_models (id, owner_id, name, description, model_type, data_source_id, features_json,
             target, parameters_json, preprocessing_json, training_result_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, ?11)",
            params![
                id,
                owner_id,
                payload.name,
                payload.description,
                payload.model_type,
                payload.data_source_id,
                serde_json::to_string(&payload.features)?,
                payload.target,
                serde_json::to_string(&payload.parameters)?,
                serde_json::to_string(&payload.preprocessing)?,
                fmt_time(now),
            ],
        )?;

        Ok(MlModel {
            id,
            owner_id: owner_id.to_string(),
            name: payload.name,
            description: payload.description,
            model_type: payload.model_type,
            data_source_id: payload.data_source_id,
            features: payload.features,
            target: payload.target,
            parameters: payload.parameters,
            preprocessing: payload.preprocessing,
            training_result: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_ml_model(&self, owner_id: &str, id: &str) -> AppResult<Option<MlModel>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ML_MODEL_COLUMNS} FROM ml_models WHERE id = ?1 AND owner_id = ?2"),
            params![id, owner_id],
            parse_ml_model_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_ml_models(&self, owner_id: &str, limit: Option<u32>) -> AppResult<Vec<MlModel>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ML_MODEL_COLUMNS} FROM ml_models WHERE owner_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![owner_id, sql_limit(limit)], parse_ml_model_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn update_ml_model(&self, owner_id: &str, id: &str, payload: &SaveMlModelPayload) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE ml_models SET name = ?1, description = ?2, model_type = ?3, features_json = ?4, target = ?5,
             parameters_json = ?6, preprocessing_json = ?7, updated_at = ?8
             WHERE id = ?9 AND owner_id = ?10",
            params![
                payload.name,
                payload.description,
                payload.model_type,
                serde_json::to_string(&payload.features)?,
                payload.target,
                serde_json::to_string(&payload.parameters)?,
                serde_json::to_string(&payload.preprocessing)?,
                fmt_time(Utc::now()),
                id,
                owner_id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// A JSON `null` result clears the stored payload so the model counts as pending again.
    pub fn set_training_result(&self, owner_id: &str, id: &str, result: &serde_json::Value) -> AppResult<bool> {
        let encoded = if result.is_null() {
            None
        } else {
            Some(serde_json::to_string(result)?)
        };
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE ml_models SET training_result_json = ?1, updated_at = ?2 WHERE id = ?3 AND owner_id = ?4",
            params![encoded, fmt_time(Utc::now()), id, owner_id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_ml_model(&self, owner_id: &str, id: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM ml_models WHERE id = ?1 AND owner_id = ?2", params![id, owner_id])?;
        Ok(changed > 0)
    }

    pub fn count_trained_models(&self, owner_id: &str) -> AppResult<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM ml_models WHERE owner_id = ?1 AND training_result_json IS NOT NULL",
            [owner_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_models_by_type(&self, owner_id: &str) -> AppResult<BTreeMap<String, i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT model_type, COUNT(1) FROM ml_models WHERE owner_id = ?1 GROUP BY model_type ORDER BY model_type",
        )?;
        let rows = stmt.query_map([owner_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut result = BTreeMap::new();
        for row in rows {
            let (model_type, count) = row?;
            result.insert(model_type, count);
        }
        Ok(result)
    }

    pub fn list_training_results(&self, owner_id: &str) -> AppResult<Vec<serde_json::Value>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT training_result_json FROM ml_models WHERE owner_id = ?1 AND training_result_json IS NOT NULL",
        )?;
        let rows = stmt.query_map([owner_id], |row| row.get::<_, String>(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(serde_json::from_str(&row?)?);
        }
        Ok(result)
    }

    // ─── Generic collection queries ─────────────────────────────────────────

    pub fn count_owned(&self, collection: Collection, owner_id: &str) -> AppResult<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            &format!("SELECT COUNT(1) FROM {} WHERE owner_id = ?1", collection.table()),
            [owner_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Counts entities created in `[start, end)`.
    pub fn count_created_between(
        &self,
        collection: Collection,
        owner_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            &format!(
                "SELECT COUNT(1) FROM {} WHERE owner_id = ?1 AND created_at >= ?2 AND created_at < ?3",
                collection.table()
            ),
            params![owner_id, fmt_time(start), fmt_time(end)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Projects the newest entities created at or after `since` into activity records.
    pub fn recent_activity(
        &self,
        collection: Collection,
        owner_id: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> AppResult<Vec<ActivityRecord>> {
        let Some(activity_type) = collection.activity_type() else {
            return Err(AppError::Validation(format!(
                "{} does not contribute to the activity feed",
                collection.table()
            )));
        };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, {kind}, created_at FROM {table}
             WHERE owner_id = ?1 AND created_at >= ?2
             ORDER BY created_at DESC
             LIMIT ?3",
            kind = collection.kind_column(),
            table = collection.table(),
        ))?;
        let rows = stmt.query_map(params![owner_id, fmt_time(since), limit], |row| {
            Ok(ActivityRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                kind: row.get(2)?,
                created_at: parse_time(&row.get::<_, String>(3)?)?,
                activity_type,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ─── Audit ──────────────────────────────────────────────────────────────

    pub fn insert_audit_event(&self, event: &AuditEvent) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO audit_events (id, owner_id, action, entity_id, detail_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.owner_id,
                event.action,
                event.entity_id,
                serde_json::to_string(&event.detail)?,
                fmt_time(event.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_audit_events(&self, owner_id: &str, limit: u32) -> AppResult<Vec<AuditEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, action, entity_id, detail_json, created_at
             FROM audit_events WHERE owner_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![owner_id, limit], |row| {
            Ok(AuditEvent {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                action: row.get(2)?,
                entity_id: row.get(3)?,
                detail: json_column(row, 4)?,
                created_at: parse_time(&row.get::<_, String>(5)?)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    #[cfg(test)]
    pub(crate) fn set_created_at(&self, collection: Collection, id: &str, at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!("UPDATE {} SET created_at = ?1 WHERE id = ?2", collection.table()),
            params![fmt_time(at), id],
        )?;
        Ok(())
    }
}

fn parse_data_source_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataSource> {
    Ok(DataSource {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        source_type: parse_source_type(&row.get::<_, String>(3)?)?,
        headers: json_column(row, 4)?,
        content: json_column(row, 5)?,
        file_url: row.get(6)?,
        preprocessing: json_column(row, 7)?,
        linked_charts: json_column(row, 8)?,
        created_at: parse_time(&row.get::<_, String>(9)?)?,
        updated_at: parse_time(&row.get::<_, String>(10)?)?,
    })
}

fn parse_chart_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chart> {
    Ok(Chart {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        chart_type: row.get(3)?,
        data_source_id: row.get(4)?,
        config: json_column(row, 5)?,
        created_at: parse_time(&row.get::<_, String>(6)?)?,
        updated_at: parse_time(&row.get::<_, String>(7)?)?,
    })
}

fn parse_dashboard_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dashboard> {
    Ok(Dashboard {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        layout: json_column(row, 4)?,
        edit_count: row.get(5)?,
        created_at: parse_time(&row.get::<_, String>(6)?)?,
        updated_at: parse_time(&row.get::<_, String>(7)?)?,
    })
}

fn parse_ml_model_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MlModel> {
    let training_result = row
        .get::<_, Option<String>>(10)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(error)))?;
    Ok(MlModel {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        model_type: row.get(4)?,
        data_source_id: row.get(5)?,
        features: json_column(row, 6)?,
        target: row.get(7)?,
        parameters: json_column(row, 8)?,
        preprocessing: json_column(row, 9)?,
        training_result,
        created_at: parse_time(&row.get::<_, String>(11)?)?,
        updated_at: parse_time(&row.get::<_, String>(12)?)?,
    })
}

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(error)))
}

fn parse_source_type(raw: &str) -> rusqlite::Result<DataSourceType> {
    DataSourceType::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown data source type: {raw}"),
            )),
        )
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

/// Fixed-width UTC so that text comparison in SQL matches chronological order.
fn fmt_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn sql_limit(limit: Option<u32>) -> i64 {
    limit.map(i64::from).unwrap_or(-1)
}

fn placeholders(count: usize, first: usize) -> String {
    (first..first + count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ")
}
