use crate::config::CoreConfig;
use crate::db::Database;
use crate::edit_counter::EditCounter;
use crate::errors::{AppError, AppResult};
use crate::links::LinkMaintainer;
use crate::models::{
    AuditEvent, CascadeReport, Chart, ChartConfig, ChartMutation, ChartWithSource, CreateChartPayload,
    CreateDataSourcePayload, Dashboard, DashboardView, DataSource, MlModel, PreprocessingRule, ReconcileReport,
    ResolvedPlacement, SaveDashboardPayload, SaveMlModelPayload, UpdateChartPayload, UserStats,
};
use crate::outbox::{store_deliverer, OutboundTask, Outbox};
use crate::stats::StatsAggregator;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Owner-scoped entry point for every entity operation.
///
/// Construct once at startup, call [`PlatformCore::start`] inside a tokio runtime
/// and [`PlatformCore::shutdown`] before exit so queued audit events are flushed.
#[derive(Clone)]
pub struct PlatformCore {
    config: CoreConfig,
    db: Arc<Database>,
    links: LinkMaintainer,
    edit_counter: EditCounter,
    stats: StatsAggregator,
    outbox: Outbox,
}

impl PlatformCore {
    pub fn new(config: CoreConfig) -> AppResult<Self> {
        let db = Arc::new(Database::new(&config.database_path)?);
        Ok(Self::with_database(db, config))
    }

    pub fn with_database(db: Arc<Database>, config: CoreConfig) -> Self {
        let edit_counter = EditCounter::new(db.clone());
        Self {
            links: LinkMaintainer::new(db.clone(), edit_counter.clone()),
            stats: StatsAggregator::new(db.clone(), config.stats),
            outbox: Outbox::new(config.outbox),
            edit_counter,
            db,
            config,
        }
    }

    pub fn start(&self) -> AppResult<()> {
        self.outbox.start(store_deliverer(self.db.clone()))?;
        tracing::info!(path = %self.db.path().display(), "platform core started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.outbox.shutdown().await;
        tracing::info!("platform core stopped");
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn record(&self, owner_id: &str, action: &str, entity_id: &str, detail: serde_json::Value) {
        self.outbox
            .enqueue(OutboundTask::audit(owner_id, action, entity_id, detail));
    }

    // ─── Data Sources ───────────────────────────────────────────────────────

    pub fn create_data_source(&self, owner_id: &str, payload: CreateDataSourcePayload) -> AppResult<DataSource> {
        if payload.name.trim().is_empty() {
            return Err(AppError::Validation("data source name must not be empty".to_string()));
        }
        let data_source = self.db.insert_data_source(owner_id, payload)?;
        self.record(
            owner_id,
            "data_source.create",
            &data_source.id,
            json!({ "rows": data_source.content.len() }),
        );
        Ok(data_source)
    }

    pub fn list_data_sources(&self, owner_id: &str) -> AppResult<Vec<DataSource>> {
        self.db.list_data_sources(owner_id)
    }

    pub fn get_data_source(&self, owner_id: &str, id: &str) -> AppResult<DataSource> {
        self.db
            .get_data_source(owner_id, id)?
            .ok_or_else(|| AppError::NotFound(format!("data source {id}")))
    }

    pub fn rename_data_source(&self, owner_id: &str, id: &str, name: &str) -> AppResult<DataSource> {
        if name.trim().is_empty() {
            return Err(AppError::Validation("data source name must not be empty".to_string()));
        }
        if !self.db.rename_data_source(owner_id, id, name)? {
            return Err(AppError::NotFound(format!("data source {id}")));
        }
        self.get_data_source(owner_id, id)
    }

    pub fn update_preprocessing(
        &self,
        owner_id: &str,
        id: &str,
        rules: &[PreprocessingRule],
    ) -> AppResult<DataSource> {
        if !self.db.update_preprocessing(owner_id, id, rules)? {
            return Err(AppError::NotFound(format!("data source {id}")));
        }
        self.get_data_source(owner_id, id)
    }

    pub fn delete_data_source(&self, owner_id: &str, id: &str) -> AppResult<CascadeReport> {
        let report = self.links.delete_data_source(owner_id, id)?;
        self.record(owner_id, "data_source.delete", id, cascade_detail(&report));
        Ok(report)
    }

    // ─── Charts ─────────────────────────────────────────────────────────────

    pub fn create_chart(
        &self,
        owner_id: &str,
        payload: CreateChartPayload,
        dashboard_hint: Option<&str>,
    ) -> AppResult<ChartMutation> {
        let created = self.links.create_chart(owner_id, payload, dashboard_hint)?;
        self.record(owner_id, "chart.create", &created.chart.id, cascade_detail(&created.cascade));
        Ok(created)
    }

    /// The chart together with its data source; a source that no longer resolves yields `None`.
    pub fn get_chart(&self, owner_id: &str, id: &str) -> AppResult<ChartWithSource> {
        let chart = self
            .db
            .get_chart(owner_id, id)?
            .ok_or_else(|| AppError::NotFound(format!("chart {id}")))?;
        let data_source = self.db.get_data_source(owner_id, &chart.data_source_id)?;
        if data_source.is_none() {
            tracing::debug!(owner_id = %owner_id, chart_id = %id, "chart references a missing data source");
        }
        Ok(ChartWithSource { chart, data_source })
    }

    pub fn get_charts_by_ids(&self, owner_id: &str, ids: &[String]) -> AppResult<Vec<Chart>> {
        self.db.get_charts_by_ids(owner_id, ids)
    }

    pub fn list_charts(&self, owner_id: &str) -> AppResult<Vec<Chart>> {
        self.db.list_charts(owner_id)
    }

    pub fn update_chart(
        &self,
        owner_id: &str,
        id: &str,
        payload: &UpdateChartPayload,
        dashboard_hint: Option<&str>,
    ) -> AppResult<ChartMutation> {
        let updated = self.links.update_chart(owner_id, id, payload, dashboard_hint)?;
        self.record(owner_id, "chart.update", id, cascade_detail(&updated.cascade));
        Ok(updated)
    }

    pub fn update_chart_config(
        &self,
        owner_id: &str,
        id: &str,
        config: &ChartConfig,
        dashboard_hint: Option<&str>,
    ) -> AppResult<ChartMutation> {
        let updated = self.links.update_chart_config(owner_id, id, config, dashboard_hint)?;
        self.record(owner_id, "chart.update_config", id, cascade_detail(&updated.cascade));
        Ok(updated)
    }

    pub fn delete_chart(&self, owner_id: &str, id: &str) -> AppResult<CascadeReport> {
        let report = self.links.delete_chart(owner_id, id)?;
        self.record(owner_id, "chart.delete", id, cascade_detail(&report));
        Ok(report)
    }

    // ─── Dashboards ─────────────────────────────────────────────────────────

    pub fn create_dashboard(&self, owner_id: &str, payload: SaveDashboardPayload) -> AppResult<Dashboard> {
        validate_dashboard(&payload)?;
        let dashboard = self.db.insert_dashboard(owner_id, payload)?;
        self.record(owner_id, "dashboard.create", &dashboard.id, json!({ "placements": dashboard.layout.len() }));
        Ok(dashboard)
    }

    pub fn list_dashboards(&self, owner_id: &str) -> AppResult<Vec<Dashboard>> {
        self.db.list_dashboards(owner_id, None)
    }

    pub fn get_dashboard(&self, owner_id: &str, id: &str) -> AppResult<Dashboard> {
        self.db
            .get_dashboard(owner_id, id)?
            .ok_or_else(|| AppError::NotFound(format!("dashboard {id}")))
    }

    /// Dashboard with each placement joined to its chart, in layout order.
    /// Placements whose chart is gone are skipped.
    pub fn get_dashboard_view(&self, owner_id: &str, id: &str) -> AppResult<DashboardView> {
        let dashboard = self.get_dashboard(owner_id, id)?;
        let chart_ids = dashboard
            .layout
            .iter()
            .map(|placement| placement.chart_id.clone())
            .collect::<Vec<_>>();
        let charts: HashMap<String, Chart> = self
            .db
            .get_charts_by_ids(owner_id, &chart_ids)?
            .into_iter()
            .map(|chart| (chart.id.clone(), chart))
            .collect();

        let mut placements = Vec::with_capacity(dashboard.layout.len());
        for placement in &dashboard.layout {
            let chart = match charts.get(&placement.chart_id) {
                Some(chart) => chart.clone(),
                None => {
                    tracing::debug!(
                        owner_id = %owner_id,
                        dashboard_id = %id,
                        chart_id = %placement.chart_id,
                        "skipping placement with missing chart"
                    );
                    continue;
                }
            };
            placements.push(ResolvedPlacement {
                placement: placement.clone(),
                chart,
            });
        }
        Ok(DashboardView { dashboard, placements })
    }

    pub fn update_dashboard(&self, owner_id: &str, id: &str, payload: &SaveDashboardPayload) -> AppResult<Dashboard> {
        validate_dashboard(payload)?;
        let edit_count = self
            .db
            .update_dashboard(owner_id, id, payload)?
            .ok_or_else(|| AppError::NotFound(format!("dashboard {id}")))?;
        self.record(owner_id, "dashboard.update", id, json!({ "editCount": edit_count }));
        self.get_dashboard(owner_id, id)
    }

    pub fn increment_edit_count(&self, owner_id: &str, id: &str) -> AppResult<i64> {
        self.edit_counter.increment(owner_id, id)
    }

    pub fn delete_dashboard(&self, owner_id: &str, id: &str) -> AppResult<CascadeReport> {
        let report = self.links.delete_dashboard(owner_id, id)?;
        self.record(owner_id, "dashboard.delete", id, cascade_detail(&report));
        Ok(report)
    }

    // ─── ML Models ──────────────────────────────────────────────────────────

    pub fn create_ml_model(&self, owner_id: &str, payload: SaveMlModelPayload) -> AppResult<MlModel> {
        validate_ml_model(&payload)?;
        self.require_data_source(owner_id, &payload.data_source_id)?;
        let model = self.db.insert_ml_model(owner_id, payload)?;
        self.record(owner_id, "ml_model.create", &model.id, json!({ "modelType": model.model_type }));
        Ok(model)
    }

    pub fn list_ml_models(&self, owner_id: &str) -> AppResult<Vec<MlModel>> {
        self.db.list_ml_models(owner_id, None)
    }

    pub fn get_ml_model(&self, owner_id: &str, id: &str) -> AppResult<MlModel> {
        self.db
            .get_ml_model(owner_id, id)?
            .ok_or_else(|| AppError::NotFound(format!("ml model {id}")))
    }

    pub fn update_ml_model(&self, owner_id: &str, id: &str, payload: &SaveMlModelPayload) -> AppResult<MlModel> {
        validate_ml_model(payload)?;
        if !self.db.update_ml_model(owner_id, id, payload)? {
            return Err(AppError::NotFound(format!("ml model {id}")));
        }
        self.get_ml_model(owner_id, id)
    }

    /// Stores the trainer's opaque result payload. `null` marks the model pending again.
    pub fn set_training_result(&self, owner_id: &str, id: &str, result: serde_json::Value) -> AppResult<MlModel> {
        if !self.db.set_training_result(owner_id, id, &result)? {
            return Err(AppError::NotFound(format!("ml model {id}")));
        }
        self.record(owner_id, "ml_model.train", id, json!({ "trained": !result.is_null() }));
        self.get_ml_model(owner_id, id)
    }

    pub fn delete_ml_model(&self, owner_id: &str, id: &str) -> AppResult<()> {
        if !self.db.delete_ml_model(owner_id, id)? {
            return Err(AppError::NotFound(format!("ml model {id}")));
        }
        self.record(owner_id, "ml_model.delete", id, serde_json::Value::Null);
        Ok(())
    }

    fn require_data_source(&self, owner_id: &str, data_source_id: &str) -> AppResult<()> {
        if data_source_id.trim().is_empty() {
            return Err(AppError::Validation("model must reference a data source".to_string()));
        }
        match self.db.get_data_source(owner_id, data_source_id)? {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!("data source {data_source_id}"))),
        }
    }

    // ─── Stats & maintenance ────────────────────────────────────────────────

    pub fn build_user_stats(&self, owner_id: &str) -> UserStats {
        self.stats.build_user_stats(owner_id)
    }

    pub fn reconcile_links(&self, owner_id: &str) -> AppResult<ReconcileReport> {
        let report = self.links.reconcile_links(owner_id)?;
        if !report.is_clean() {
            self.record(owner_id, "links.reconcile", owner_id, json!(report));
        }
        Ok(report)
    }

    pub fn audit_log(&self, owner_id: &str, limit: u32) -> AppResult<Vec<AuditEvent>> {
        self.db.list_audit_events(owner_id, limit)
    }
}

fn cascade_detail(report: &CascadeReport) -> serde_json::Value {
    json!(report)
}

fn validate_dashboard(payload: &SaveDashboardPayload) -> AppResult<()> {
    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("dashboard name must not be empty".to_string()));
    }
    if let Some(placement) = payload
        .layout
        .iter()
        .find(|placement| placement.chart_id.trim().is_empty() || placement.width <= 0 || placement.height <= 0)
    {
        return Err(AppError::Validation(format!(
            "invalid layout placement for chart '{}'",
            placement.chart_id
        )));
    }
    Ok(())
}

fn validate_ml_model(payload: &SaveMlModelPayload) -> AppResult<()> {
    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("model name must not be empty".to_string()));
    }
    if payload.model_type.trim().is_empty() {
        return Err(AppError::Validation("model type must not be empty".to_string()));
    }
    Ok(())
}
