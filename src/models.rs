use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Data Sources ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSourceType {
    Csv,
    Excel,
    Json,
}

impl DataSourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Excel => "excel",
            Self::Json => "json",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "csv" => Some(Self::Csv),
            "excel" | "xlsx" | "xls" => Some(Self::Excel),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessingRule {
    pub field: String,
    /// number, date or text.
    #[serde(rename = "type")]
    pub semantic_type: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub aggregator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub source_type: DataSourceType,
    pub headers: Vec<String>,
    pub content: Vec<Vec<String>>,
    pub file_url: Option<String>,
    pub preprocessing: Vec<PreprocessingRule>,
    pub linked_charts: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tabular content arrives already parsed; ingestion happens upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDataSourcePayload {
    pub name: String,
    pub source_type: DataSourceType,
    pub headers: Vec<String>,
    pub content: Vec<Vec<String>>,
    pub file_url: Option<String>,
}

// ─── Charts ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartDimension {
    pub field: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetric {
    pub field: String,
    pub aggregator: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualMapConfig {
    pub color_field: String,
    pub color_range: Vec<String>,
    pub size_field: String,
    pub size_range: Vec<f64>,
    pub label_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DualAxisConfig {
    pub enabled: bool,
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartConfig {
    #[serde(default)]
    pub dimensions: Vec<ChartDimension>,
    #[serde(default)]
    pub metrics: Vec<ChartMetric>,
    #[serde(default)]
    pub settings: serde_json::Value,
    pub visual_map: Option<VisualMapConfig>,
    pub dual_axis: Option<DualAxisConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chart {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// bar, line, pie, scatter...
    pub chart_type: String,
    pub data_source_id: String,
    pub config: ChartConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChartPayload {
    pub name: String,
    pub chart_type: String,
    pub data_source_id: String,
    #[serde(default)]
    pub config: ChartConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChartPayload {
    pub name: String,
    pub chart_type: String,
    #[serde(default)]
    pub config: ChartConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartWithSource {
    pub chart: Chart,
    pub data_source: Option<DataSource>,
}

// ─── Dashboards ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutPlacement {
    pub chart_id: String,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub layout: Vec<LayoutPlacement>,
    pub edit_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDashboardPayload {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub layout: Vec<LayoutPlacement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPlacement {
    pub placement: LayoutPlacement,
    pub chart: Chart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub dashboard: Dashboard,
    pub placements: Vec<ResolvedPlacement>,
}

// ─── ML Models ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MlModel {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    /// linear_regression, decision_tree, kmeans, correlation...
    pub model_type: String,
    pub data_source_id: String,
    pub features: Vec<String>,
    pub target: String,
    pub parameters: serde_json::Value,
    pub preprocessing: Vec<PreprocessingRule>,
    /// Opaque payload written by the external trainer.
    pub training_result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveMlModelPayload {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub model_type: String,
    pub data_source_id: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub preprocessing: Vec<PreprocessingRule>,
}

// ─── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Dashboard,
    Chart,
    Mlmodel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: String,
    pub name: String,
    /// Type tag of the entity; dashboards carry none.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub created_at: DateTime<Utc>,
    pub activity_type: ActivityType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStat {
    /// Calendar month, `YYYY-MM`.
    pub date: String,
    pub dashboards: i64,
    pub charts: i64,
    pub queries: i64,
    pub ml_models: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MlModelStats {
    pub model_types: BTreeMap<String, i64>,
    pub trained_models: i64,
    pub pending_models: i64,
    pub average_metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub total_dashboards: i64,
    pub total_data_sources: i64,
    pub total_charts: i64,
    pub total_ml_models: i64,
    pub recent_activity: Vec<ActivityRecord>,
    pub recent_dashboards: Vec<Dashboard>,
    pub recent_ml_models: Vec<MlModel>,
    pub usage_stats: Vec<UsageStat>,
    pub ml_model_stats: MlModelStats,
}

// ─── Cascades ───────────────────────────────────────────────────────────────

/// Outcome of the follow-up writes attached to a primary mutation.
///
/// A primary operation that returns `Ok` may still carry `failed_steps`; the
/// reference graph converges once a later operation or `reconcile_links` runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeReport {
    pub charts_deleted: u64,
    pub dashboards_pruned: u64,
    pub links_removed: u64,
    pub edit_count: Option<i64>,
    pub failed_steps: Vec<String>,
}

impl CascadeReport {
    pub fn is_complete(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub dangling_links_removed: u64,
    pub missing_links_added: u64,
    pub layout_entries_pruned: u64,
    pub dashboards_repaired: u64,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.dangling_links_removed == 0
            && self.missing_links_added == 0
            && self.layout_entries_pruned == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMutation {
    pub chart: Chart,
    pub cascade: CascadeReport,
}

// ─── Audit ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub owner_id: String,
    /// `chart.create`, `data_source.delete`...
    pub action: String,
    pub entity_id: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
