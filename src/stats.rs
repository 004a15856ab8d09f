use crate::config::StatsConfig;
use crate::db::{Collection, Database};
use crate::errors::AppResult;
use crate::models::{ActivityRecord, MlModelStats, UsageStat, UserStats};
use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

const ACTIVITY_COLLECTIONS: [Collection; 3] = [Collection::Dashboards, Collection::Charts, Collection::MlModels];

/// Read-only composite view over an owner's entities.
///
/// Every sub-query degrades independently: a failure is logged and replaced by
/// zero or an empty list, so the report itself never fails.
#[derive(Clone)]
pub struct StatsAggregator {
    db: Arc<Database>,
    config: StatsConfig,
}

impl StatsAggregator {
    pub fn new(db: Arc<Database>, config: StatsConfig) -> Self {
        Self { db, config }
    }

    pub fn build_user_stats(&self, owner_id: &str) -> UserStats {
        self.build_user_stats_at(owner_id, Utc::now())
    }

    pub fn build_user_stats_at(&self, owner_id: &str, now: DateTime<Utc>) -> UserStats {
        let total_dashboards = degrade(owner_id, "count_dashboards", self.db.count_owned(Collection::Dashboards, owner_id));
        let total_data_sources = degrade(
            owner_id,
            "count_data_sources",
            self.db.count_owned(Collection::DataSources, owner_id),
        );
        let total_charts = degrade(owner_id, "count_charts", self.db.count_owned(Collection::Charts, owner_id));
        let total_ml_models = degrade(owner_id, "count_ml_models", self.db.count_owned(Collection::MlModels, owner_id));

        let recent_dashboards = degrade(
            owner_id,
            "recent_dashboards",
            self.db.list_dashboards(owner_id, Some(self.config.recent_limit)),
        );
        let recent_ml_models = degrade(
            owner_id,
            "recent_ml_models",
            self.db.list_ml_models(owner_id, Some(self.config.recent_limit)),
        );

        let ml_model_stats = if total_ml_models > 0 {
            self.ml_model_stats(owner_id, total_ml_models)
        } else {
            MlModelStats::default()
        };

        UserStats {
            total_dashboards,
            total_data_sources,
            total_charts,
            total_ml_models,
            recent_activity: self.recent_activity(owner_id, now),
            recent_dashboards,
            recent_ml_models,
            usage_stats: self.usage_series(owner_id, now),
            ml_model_stats,
        }
    }

    fn ml_model_stats(&self, owner_id: &str, total: i64) -> MlModelStats {
        let trained_models = degrade(owner_id, "count_trained_models", self.db.count_trained_models(owner_id));
        let model_types = degrade(owner_id, "count_models_by_type", self.db.count_models_by_type(owner_id));
        let results = degrade(owner_id, "list_training_results", self.db.list_training_results(owner_id));
        MlModelStats {
            model_types,
            trained_models,
            pending_models: (total - trained_models).max(0),
            average_metrics: average_metrics(&results),
        }
    }

    /// Oldest month first, always `usage_months` entries, current month last.
    pub fn usage_series(&self, owner_id: &str, now: DateTime<Utc>) -> Vec<UsageStat> {
        (0..self.config.usage_months)
            .rev()
            .map(|back| {
                let (year, month) = shift_month(now.year(), now.month(), back);
                let mut stat = UsageStat {
                    date: format!("{year:04}-{month:02}"),
                    dashboards: 0,
                    charts: 0,
                    queries: 0,
                    ml_models: 0,
                };
                let Some((start, end)) = month_bounds(year, month) else {
                    tracing::warn!(owner_id = %owner_id, month = %stat.date, "month outside supported range");
                    return stat;
                };
                let count = |collection: Collection, step: &'static str| {
                    degrade(owner_id, step, self.db.count_created_between(collection, owner_id, start, end))
                };
                stat.dashboards = count(Collection::Dashboards, "usage_dashboards");
                stat.charts = count(Collection::Charts, "usage_charts");
                stat.ml_models = count(Collection::MlModels, "usage_ml_models");
                stat.queries = stat.charts * self.config.queries_per_chart;
                stat
            })
            .collect()
    }

    /// Newest creations across dashboards, charts and models, merged and truncated.
    /// Equal timestamps keep the fetch order.
    pub fn recent_activity(&self, owner_id: &str, now: DateTime<Utc>) -> Vec<ActivityRecord> {
        let since = now
            .checked_sub_months(Months::new(self.config.usage_months))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut merged = Vec::new();
        for collection in ACTIVITY_COLLECTIONS {
            merged.extend(degrade(
                owner_id,
                collection.table(),
                self.db
                    .recent_activity(collection, owner_id, since, self.config.activity_limit),
            ));
        }
        merged.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        merged.truncate(self.config.activity_limit as usize);
        merged
    }
}

fn degrade<T: Default>(owner_id: &str, step: &str, result: AppResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(owner_id = %owner_id, step = %step, error = %error, "stats query failed, using empty value");
            T::default()
        }
    }
}

fn shift_month(year: i32, month: u32, back: u32) -> (i32, u32) {
    let index = year * 12 + month as i32 - 1 - back as i32;
    (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

fn month_bounds(year: i32, month: u32) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
    let end = start.checked_add_months(Months::new(1))?;
    Some((start, end))
}

/// Mean of every numeric entry under `metrics` across training results.
fn average_metrics(results: &[serde_json::Value]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
    for result in results {
        let Some(metrics) = result.get("metrics").and_then(|value| value.as_object()) else {
            continue;
        };
        for (name, value) in metrics {
            if let Some(number) = value.as_f64() {
                let entry = sums.entry(name.clone()).or_insert((0.0, 0));
                entry.0 += number;
                entry.1 += 1;
            }
        }
    }
    sums.into_iter()
        .map(|(name, (sum, count))| (name, sum / f64::from(count)))
        .collect()
}
