use crate::db::{Collection, Database};
use crate::edit_counter::EditCounter;
use crate::errors::{AppError, AppResult};
use crate::models::{
    CascadeReport, ChartConfig, ChartMutation, CreateChartPayload, ReconcileReport, UpdateChartPayload,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Keeps the data source → chart → dashboard reference graph consistent.
///
/// Primary writes surface their errors. Follow-up writes are best-effort: a
/// failure is logged at `warn` and recorded in the returned [`CascadeReport`].
#[derive(Clone)]
pub struct LinkMaintainer {
    db: Arc<Database>,
    edit_counter: EditCounter,
}

impl LinkMaintainer {
    pub fn new(db: Arc<Database>, edit_counter: EditCounter) -> Self {
        Self { db, edit_counter }
    }

    pub fn create_chart(
        &self,
        owner_id: &str,
        payload: CreateChartPayload,
        dashboard_hint: Option<&str>,
    ) -> AppResult<ChartMutation> {
        if payload.name.trim().is_empty() {
            return Err(AppError::Validation("chart name must not be empty".to_string()));
        }
        if payload.data_source_id.trim().is_empty() {
            return Err(AppError::Validation("chart must reference a data source".to_string()));
        }
        let data_source = self
            .db
            .get_data_source(owner_id, &payload.data_source_id)?
            .ok_or_else(|| AppError::NotFound(format!("data source {}", payload.data_source_id)))?;

        let chart = self.db.insert_chart(owner_id, payload)?;
        let mut report = CascadeReport::default();

        if let Err(error) = self.db.add_linked_chart(&data_source.id, &chart.id) {
            tracing::warn!(
                owner_id = %owner_id,
                chart_id = %chart.id,
                data_source_id = %data_source.id,
                error = %error,
                "failed to link chart to data source"
            );
            report.failed_steps.push(format!("link_chart:{}", data_source.id));
        }
        self.edit_counter.apply_hint(owner_id, dashboard_hint, &mut report);

        tracing::info!(owner_id = %owner_id, chart_id = %chart.id, data_source_id = %data_source.id, "chart created");
        Ok(ChartMutation { chart, cascade: report })
    }

    pub fn update_chart(
        &self,
        owner_id: &str,
        chart_id: &str,
        payload: &UpdateChartPayload,
        dashboard_hint: Option<&str>,
    ) -> AppResult<ChartMutation> {
        if payload.name.trim().is_empty() {
            return Err(AppError::Validation("chart name must not be empty".to_string()));
        }
        if !self.db.update_chart(owner_id, chart_id, payload)? {
            return Err(AppError::NotFound(format!("chart {chart_id}")));
        }
        self.finish_chart_update(owner_id, chart_id, dashboard_hint)
    }

    pub fn update_chart_config(
        &self,
        owner_id: &str,
        chart_id: &str,
        config: &ChartConfig,
        dashboard_hint: Option<&str>,
    ) -> AppResult<ChartMutation> {
        if !self.db.update_chart_config(owner_id, chart_id, config)? {
            return Err(AppError::NotFound(format!("chart {chart_id}")));
        }
        self.finish_chart_update(owner_id, chart_id, dashboard_hint)
    }

    fn finish_chart_update(
        &self,
        owner_id: &str,
        chart_id: &str,
        dashboard_hint: Option<&str>,
    ) -> AppResult<ChartMutation> {
        let chart = self
            .db
            .get_chart(owner_id, chart_id)?
            .ok_or_else(|| AppError::NotFound(format!("chart {chart_id}")))?;
        let mut report = CascadeReport::default();
        self.edit_counter.apply_hint(owner_id, dashboard_hint, &mut report);
        tracing::debug!(owner_id = %owner_id, chart_id = %chart_id, "chart updated");
        Ok(ChartMutation { chart, cascade: report })
    }

    pub fn delete_chart(&self, owner_id: &str, chart_id: &str) -> AppResult<CascadeReport> {
        if !self.db.delete_chart(owner_id, chart_id)? {
            return Err(AppError::NotFound(format!("chart {chart_id}")));
        }
        let mut report = CascadeReport {
            charts_deleted: 1,
            ..Default::default()
        };
        let deleted = [chart_id.to_string()];
        self.prune_layouts(owner_id, &deleted, &mut report);
        self.unlink_charts(owner_id, &deleted, &mut report);

        tracing::info!(
            owner_id = %owner_id,
            chart_id = %chart_id,
            dashboards_pruned = report.dashboards_pruned,
            "chart deleted"
        );
        Ok(report)
    }

    /// Children first: linked charts, then layout entries, then the data source itself.
    pub fn delete_data_source(&self, owner_id: &str, data_source_id: &str) -> AppResult<CascadeReport> {
        let data_source = self
            .db
            .get_data_source(owner_id, data_source_id)?
            .ok_or_else(|| AppError::NotFound(format!("data source {data_source_id}")))?;

        let mut report = CascadeReport::default();
        let linked = data_source.linked_charts;
        if !linked.is_empty() {
            match self.db.delete_many_by_ids(Collection::Charts, None, &linked) {
                Ok(count) => report.charts_deleted = count,
                Err(error) => {
                    tracing::warn!(
                        owner_id = %owner_id,
                        data_source_id = %data_source_id,
                        error = %error,
                        "failed to delete linked charts"
                    );
                    report.failed_steps.push("delete_linked_charts".to_string());
                }
            }
            self.prune_layouts(owner_id, &linked, &mut report);
        }

        if !self.db.delete_data_source(owner_id, data_source_id)? {
            return Err(AppError::NotFound(format!("data source {data_source_id}")));
        }

        tracing::info!(
            owner_id = %owner_id,
            data_source_id = %data_source_id,
            charts_deleted = report.charts_deleted,
            dashboards_pruned = report.dashboards_pruned,
            "data source deleted"
        );
        Ok(report)
    }

    /// Deletes the dashboard together with every chart placed on it.
    ///
    /// A failed chart delete aborts before the dashboard is touched. Link cleanup
    /// and pruning the same charts from other dashboards are best-effort.
    pub fn delete_dashboard(&self, owner_id: &str, dashboard_id: &str) -> AppResult<CascadeReport> {
        let dashboard = self
            .db
            .get_dashboard(owner_id, dashboard_id)?
            .ok_or_else(|| AppError::NotFound(format!("dashboard {dashboard_id}")))?;

        let chart_ids = dashboard
            .layout
            .iter()
            .map(|placement| placement.chart_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let mut report = CascadeReport::default();
        if !chart_ids.is_empty() {
            report.charts_deleted = self
                .db
                .delete_many_by_ids(Collection::Charts, Some(owner_id), &chart_ids)?;
            self.unlink_charts(owner_id, &chart_ids, &mut report);
        }

        if !self.db.delete_dashboard(owner_id, dashboard_id)? {
            return Err(AppError::NotFound(format!("dashboard {dashboard_id}")));
        }
        if !chart_ids.is_empty() {
            self.prune_layouts(owner_id, &chart_ids, &mut report);
        }

        tracing::info!(
            owner_id = %owner_id,
            dashboard_id = %dashboard_id,
            charts_deleted = report.charts_deleted,
            "dashboard deleted"
        );
        Ok(report)
    }

    /// Rebuilds linked sets from the charts that exist and drops layout entries
    /// whose chart is gone. Running it twice in a row reports no changes the second time.
    pub fn reconcile_links(&self, owner_id: &str) -> AppResult<ReconcileReport> {
        let charts = self.db.list_charts(owner_id)?;
        let data_sources = self.db.list_data_sources(owner_id)?;

        let mut charts_by_source: HashMap<&str, Vec<&str>> = HashMap::new();
        // Oldest first so repaired sets keep creation order.
        for chart in charts.iter().rev() {
            charts_by_source
                .entry(chart.data_source_id.as_str())
                .or_default()
                .push(chart.id.as_str());
        }
        let chart_sources: HashMap<&str, &str> = charts
            .iter()
            .map(|chart| (chart.id.as_str(), chart.data_source_id.as_str()))
            .collect();

        let mut report = ReconcileReport::default();
        for data_source in &data_sources {
            let mut repaired: Vec<String> = Vec::with_capacity(data_source.linked_charts.len());
            for chart_id in &data_source.linked_charts {
                let resolves = chart_sources.get(chart_id.as_str()) == Some(&data_source.id.as_str());
                if resolves && !repaired.contains(chart_id) {
                    repaired.push(chart_id.clone());
                } else {
                    report.dangling_links_removed += 1;
                }
            }
            for chart_id in charts_by_source.get(data_source.id.as_str()).into_iter().flatten() {
                if !repaired.iter().any(|existing| existing == chart_id) {
                    repaired.push((*chart_id).to_string());
                    report.missing_links_added += 1;
                }
            }
            if repaired != data_source.linked_charts {
                self.db.set_linked_charts(&data_source.id, &repaired)?;
            }
        }

        let (pruned, dashboards) = self.db.prune_missing_layout_entries(owner_id)?;
        report.layout_entries_pruned = pruned;
        report.dashboards_repaired = dashboards;

        if report.is_clean() {
            tracing::debug!(owner_id = %owner_id, "reference graph already consistent");
        } else {
            tracing::info!(
                owner_id = %owner_id,
                dangling_links_removed = report.dangling_links_removed,
                missing_links_added = report.missing_links_added,
                layout_entries_pruned = report.layout_entries_pruned,
                "reference graph repaired"
            );
        }
        Ok(report)
    }

    fn prune_layouts(&self, owner_id: &str, chart_ids: &[String], report: &mut CascadeReport) {
        match self.db.prune_layouts(owner_id, chart_ids) {
            Ok(count) => report.dashboards_pruned += count,
            Err(error) => {
                tracing::warn!(owner_id = %owner_id, error = %error, "failed to prune dashboard layouts");
                report.failed_steps.push("prune_layouts".to_string());
            }
        }
    }

    fn unlink_charts(&self, owner_id: &str, chart_ids: &[String], report: &mut CascadeReport) {
        match self.db.remove_linked_charts(owner_id, chart_ids) {
            Ok(count) => report.links_removed += count,
            Err(error) => {
                tracing::warn!(owner_id = %owner_id, error = %error, "failed to unlink charts from data sources");
                report.failed_steps.push("unlink_charts".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LinkMaintainer;
    use crate::db::Database;
    use crate::edit_counter::EditCounter;
    use crate::errors::AppError;
    use crate::models::{
        ChartConfig, ChartMetric, CreateChartPayload, CreateDataSourcePayload, DataSourceType, LayoutPlacement,
        SaveDashboardPayload, UpdateChartPayload,
    };
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        links: LinkMaintainer,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let links = LinkMaintainer::new(db.clone(), EditCounter::new(db.clone()));
        Fixture { _dir: dir, db, links }
    }

    fn source(db: &Database, owner: &str) -> String {
        db.insert_data_source(
            owner,
            CreateDataSourcePayload {
                name: "orders.csv".to_string(),
                source_type: DataSourceType::Csv,
                headers: vec!["day".to_string(), "total".to_string()],
                content: Vec::new(),
                file_url: None,
            },
        )
        .expect("data source")
        .id
    }

    fn chart(name: &str, data_source_id: &str) -> CreateChartPayload {
        CreateChartPayload {
            name: name.to_string(),
            chart_type: "line".to_string(),
            data_source_id: data_source_id.to_string(),
            config: ChartConfig::default(),
        }
    }

    fn dashboard(db: &Database, owner: &str, chart_ids: &[&str]) -> String {
        db.insert_dashboard(
            owner,
            SaveDashboardPayload {
                name: "Board".to_string(),
                description: String::new(),
                layout: chart_ids
                    .iter()
                    .enumerate()
                    .map(|(index, id)| LayoutPlacement {
                        chart_id: (*id).to_string(),
                        x: index as i32 * 4,
                        y: 0,
                        width: 4,
                        height: 3,
                    })
                    .collect(),
            },
        )
        .expect("dashboard")
        .id
    }

    #[test]
    fn create_chart_links_data_source_and_counts_hint() {
        let fx = fixture();
        let ds = source(&fx.db, "alice");
        let board = dashboard(&fx.db, "alice", &[]);

        let created = fx
            .links
            .create_chart("alice", chart("Daily totals", &ds), Some(&board))
            .expect("create");
        assert!(created.cascade.is_complete());
        assert_eq!(created.cascade.edit_count, Some(2));

        let stored = fx.db.get_data_source("alice", &ds).expect("get").expect("present");
        assert_eq!(stored.linked_charts, vec![created.chart.id.clone()]);
    }

    #[test]
    fn create_chart_rejects_unresolvable_or_malformed_sources() {
        let fx = fixture();
        let foreign = source(&fx.db, "bob");

        let err = fx.links.create_chart("alice", chart("x", &foreign), None).expect_err("foreign");
        assert!(matches!(err, AppError::NotFound(_)));
        let err = fx.links.create_chart("alice", chart("x", ""), None).expect_err("empty reference");
        assert!(matches!(err, AppError::Validation(_)));
        let err = fx.links.create_chart("alice", chart("   ", &foreign), None).expect_err("blank name");
        assert!(matches!(err, AppError::Validation(_)));
        assert!(fx.db.list_charts("alice").expect("list").is_empty());
    }

    #[test]
    fn chart_survives_failed_dashboard_hint() {
        let fx = fixture();
        let ds = source(&fx.db, "alice");

        let created = fx
            .links
            .create_chart("alice", chart("Totals", &ds), Some("no-such-dashboard"))
            .expect("create still succeeds");
        assert_eq!(created.cascade.failed_steps.len(), 1);
        assert!(fx.db.get_chart("alice", &created.chart.id).expect("get").is_some());
    }

    #[test]
    fn update_chart_config_bumps_hinted_dashboard() {
        let fx = fixture();
        let ds = source(&fx.db, "alice");
        let created = fx.links.create_chart("alice", chart("Totals", &ds), None).expect("create");
        let board = dashboard(&fx.db, "alice", &[created.chart.id.as_str()]);

        let config = ChartConfig {
            metrics: vec![ChartMetric {
                field: "total".to_string(),
                aggregator: "sum".to_string(),
                alias: None,
            }],
            ..Default::default()
        };
        let updated = fx
            .links
            .update_chart_config("alice", &created.chart.id, &config, Some(&board))
            .expect("update");
        assert_eq!(updated.chart.config, config);
        assert_eq!(updated.cascade.edit_count, Some(2));

        let renamed = fx
            .links
            .update_chart(
                "alice",
                &created.chart.id,
                &UpdateChartPayload {
                    name: "Renamed".to_string(),
                    chart_type: "bar".to_string(),
                    config: config.clone(),
                },
                None,
            )
            .expect("rename");
        assert_eq!(renamed.chart.name, "Renamed");

        let err = fx
            .links
            .update_chart_config("bob", &created.chart.id, &config, None)
            .expect_err("foreign owner");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn delete_chart_prunes_layouts_and_links() {
        let fx = fixture();
        let ds = source(&fx.db, "alice");
        let a = fx.links.create_chart("alice", chart("A", &ds), None).expect("a").chart;
        let b = fx.links.create_chart("alice", chart("B", &ds), None).expect("b").chart;
        let board = dashboard(&fx.db, "alice", &[a.id.as_str(), b.id.as_str()]);
        let unrelated = dashboard(&fx.db, "alice", &[b.id.as_str()]);

        let report = fx.links.delete_chart("alice", &a.id).expect("delete");
        assert_eq!(report.charts_deleted, 1);
        assert_eq!(report.dashboards_pruned, 1);
        assert_eq!(report.links_removed, 1);

        let board = fx.db.get_dashboard("alice", &board).expect("get").expect("present");
        assert_eq!(board.layout.len(), 1);
        assert_eq!(board.layout[0].chart_id, b.id);
        let unrelated = fx.db.get_dashboard("alice", &unrelated).expect("get").expect("present");
        assert_eq!(unrelated.layout.len(), 1);
        let stored = fx.db.get_data_source("alice", &ds).expect("get").expect("present");
        assert_eq!(stored.linked_charts, vec![b.id.clone()]);

        let err = fx.links.delete_chart("alice", &a.id).expect_err("already gone");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    fn raw_sql(db: &Database, sql: &str) {
        let conn = rusqlite::Connection::open(db.path()).expect("raw connection");
        conn.execute_batch(sql).expect("raw sql");
    }

    #[test]
    fn delete_chart_skips_a_dashboard_with_unreadable_layout() {
        let fx = fixture();
        let ds = source(&fx.db, "alice");
        let a = fx.links.create_chart("alice", chart("A", &ds), None).expect("a").chart;
        let broken = dashboard(&fx.db, "alice", &[a.id.as_str()]);
        let healthy = dashboard(&fx.db, "alice", &[a.id.as_str()]);
        raw_sql(&fx.db, &format!("UPDATE dashboards SET layout_json = 'oops' WHERE id = '{broken}'"));

        let report = fx.links.delete_chart("alice", &a.id).expect("delete");
        assert!(report.is_complete());
        assert_eq!(report.dashboards_pruned, 1);
        assert_eq!(report.links_removed, 1);
        let healthy = fx.db.get_dashboard("alice", &healthy).expect("get").expect("present");
        assert!(healthy.layout.is_empty());
    }

    #[test]
    fn delete_chart_succeeds_when_layout_pruning_fails() {
        let fx = fixture();
        let ds = source(&fx.db, "alice");
        let a = fx.links.create_chart("alice", chart("A", &ds), None).expect("a").chart;
        dashboard(&fx.db, "alice", &[a.id.as_str()]);
        raw_sql(&fx.db, "DROP TABLE dashboards");

        let report = fx.links.delete_chart("alice", &a.id).expect("primary delete wins");
        assert_eq!(report.charts_deleted, 1);
        assert_eq!(report.links_removed, 1);
        assert_eq!(report.failed_steps, vec!["prune_layouts".to_string()]);
        assert!(!report.is_complete());
        assert!(fx.db.get_chart("alice", &a.id).expect("get").is_none());
    }

    #[test]
    fn delete_data_source_succeeds_when_chart_cascade_fails() {
        let fx = fixture();
        let ds = source(&fx.db, "alice");
        let a = fx.links.create_chart("alice", chart("A", &ds), None).expect("a").chart;
        let board = dashboard(&fx.db, "alice", &[a.id.as_str()]);
        raw_sql(&fx.db, "DROP TABLE charts");

        let report = fx.links.delete_data_source("alice", &ds).expect("primary delete wins");
        assert_eq!(report.charts_deleted, 0);
        assert_eq!(report.failed_steps, vec!["delete_linked_charts".to_string()]);
        assert_eq!(report.dashboards_pruned, 1);
        assert!(fx.db.get_data_source("alice", &ds).expect("get").is_none());
        let board = fx.db.get_dashboard("alice", &board).expect("get").expect("present");
        assert!(board.layout.is_empty());
    }

    #[test]
    fn delete_data_source_succeeds_when_layout_pruning_fails() {
        let fx = fixture();
        let ds = source(&fx.db, "alice");
        let a = fx.links.create_chart("alice", chart("A", &ds), None).expect("a").chart;
        dashboard(&fx.db, "alice", &[a.id.as_str()]);
        raw_sql(&fx.db, "DROP TABLE dashboards");

        let report = fx.links.delete_data_source("alice", &ds).expect("primary delete wins");
        assert_eq!(report.charts_deleted, 1);
        assert_eq!(report.failed_steps, vec!["prune_layouts".to_string()]);
        assert!(fx.db.get_data_source("alice", &ds).expect("get").is_none());
        assert!(fx.db.get_chart("alice", &a.id).expect("get").is_none());
    }

    #[test]
    fn delete_data_source_cascades_children_first() {
        let fx = fixture();
        let ds = source(&fx.db, "alice");
        let a = fx.links.create_chart("alice", chart("A", &ds), None).expect("a").chart;
        let b = fx.links.create_chart("alice", chart("B", &ds), None).expect("b").chart;
        let board = dashboard(&fx.db, "alice", &[a.id.as_str(), b.id.as_str()]);

        let report = fx.links.delete_data_source("alice", &ds).expect("delete");
        assert!(report.is_complete());
        assert_eq!(report.charts_deleted, 2);
        assert_eq!(report.dashboards_pruned, 1);

        assert!(fx.db.list_charts("alice").expect("list").is_empty());
        let board = fx.db.get_dashboard("alice", &board).expect("get").expect("present");
        assert!(board.layout.is_empty());
        assert!(fx.db.get_data_source("alice", &ds).expect("get").is_none());
    }

    #[test]
    fn delete_data_source_without_charts_only_removes_itself() {
        let fx = fixture();
        let ds = source(&fx.db, "alice");
        let report = fx.links.delete_data_source("alice", &ds).expect("delete");
        assert_eq!(report.charts_deleted, 0);
        assert_eq!(report.dashboards_pruned, 0);

        let err = fx.links.delete_data_source("alice", &ds).expect_err("second delete");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn delete_dashboard_removes_charts_and_their_links() {
        let fx = fixture();
        let ds = source(&fx.db, "alice");
        let a = fx.links.create_chart("alice", chart("A", &ds), None).expect("a").chart;
        let b = fx.links.create_chart("alice", chart("B", &ds), None).expect("b").chart;
        let keep = fx.links.create_chart("alice", chart("Keep", &ds), None).expect("keep").chart;
        let board = dashboard(&fx.db, "alice", &[a.id.as_str(), b.id.as_str()]);
        let other = dashboard(&fx.db, "alice", &[b.id.as_str(), keep.id.as_str()]);

        let report = fx.links.delete_dashboard("alice", &board).expect("delete");
        assert_eq!(report.charts_deleted, 2);
        assert_eq!(report.links_removed, 2);
        assert_eq!(report.dashboards_pruned, 1);

        assert!(fx.db.get_dashboard("alice", &board).expect("get").is_none());
        let stored = fx.db.get_data_source("alice", &ds).expect("get").expect("present");
        assert_eq!(stored.linked_charts, vec![keep.id.clone()]);
        let other = fx.db.get_dashboard("alice", &other).expect("get").expect("present");
        assert_eq!(other.layout.len(), 1);
        assert_eq!(other.layout[0].chart_id, keep.id);
    }

    #[test]
    fn reconcile_repairs_then_reports_clean() {
        let fx = fixture();
        let ds = source(&fx.db, "alice");
        let linked = fx.links.create_chart("alice", chart("Linked", &ds), None).expect("linked").chart;
        let unlinked = fx.db.insert_chart("alice", chart("Unlinked", &ds)).expect("raw insert");
        fx.db.add_linked_chart(&ds, "ghost-chart").expect("dangling link");
        let board = dashboard(&fx.db, "alice", &[linked.id.as_str(), "ghost-chart"]);

        let report = fx.links.reconcile_links("alice").expect("reconcile");
        assert_eq!(report.dangling_links_removed, 1);
        assert_eq!(report.missing_links_added, 1);
        assert_eq!(report.layout_entries_pruned, 1);
        assert_eq!(report.dashboards_repaired, 1);

        let stored = fx.db.get_data_source("alice", &ds).expect("get").expect("present");
        assert_eq!(stored.linked_charts, vec![linked.id.clone(), unlinked.id.clone()]);
        let board = fx.db.get_dashboard("alice", &board).expect("get").expect("present");
        assert_eq!(board.layout.len(), 1);

        let again = fx.links.reconcile_links("alice").expect("reconcile again");
        assert!(again.is_clean());
    }
}
