use bi_platform_lib::models::{
    ChartConfig, CreateChartPayload, CreateDataSourcePayload, DataSourceType, LayoutPlacement, SaveDashboardPayload,
    SaveMlModelPayload,
};
use bi_platform_lib::{AppError, CoreConfig, PlatformCore};
use chrono::{Datelike, Months, Utc};

fn core(dir: &tempfile::TempDir) -> PlatformCore {
    let config = CoreConfig {
        database_path: dir.path().join("core.sqlite"),
        ..Default::default()
    };
    PlatformCore::new(config).expect("core")
}

fn data_source(core: &PlatformCore, owner: &str) -> String {
    core.create_data_source(
        owner,
        CreateDataSourcePayload {
            name: "sales.xlsx".to_string(),
            source_type: DataSourceType::Excel,
            headers: vec!["month".to_string(), "amount".to_string()],
            content: vec![
                vec!["2026-01".to_string(), "120".to_string()],
                vec!["2026-02".to_string(), "95".to_string()],
            ],
            file_url: Some("https://files.example.com/sales.xlsx".to_string()),
        },
    )
    .expect("data source")
    .id
}

fn chart(core: &PlatformCore, owner: &str, data_source_id: &str, name: &str) -> String {
    core.create_chart(
        owner,
        CreateChartPayload {
            name: name.to_string(),
            chart_type: "bar".to_string(),
            data_source_id: data_source_id.to_string(),
            config: ChartConfig::default(),
        },
        None,
    )
    .expect("chart")
    .chart
    .id
}

fn layout(chart_ids: &[String]) -> Vec<LayoutPlacement> {
    chart_ids
        .iter()
        .enumerate()
        .map(|(index, chart_id)| LayoutPlacement {
            chart_id: chart_id.clone(),
            x: 0,
            y: index as i32 * 3,
            width: 6,
            height: 3,
        })
        .collect()
}

fn dashboard(core: &PlatformCore, owner: &str, chart_ids: &[String]) -> String {
    core.create_dashboard(
        owner,
        SaveDashboardPayload {
            name: "Revenue".to_string(),
            description: "monthly revenue".to_string(),
            layout: layout(chart_ids),
        },
    )
    .expect("dashboard")
    .id
}

#[test]
fn deleting_a_data_source_removes_its_charts_and_layout_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let ds = data_source(&core, "u");
    let a = chart(&core, "u", &ds, "A");
    let b = chart(&core, "u", &ds, "B");
    let board = dashboard(&core, "u", &[a, b]);

    let report = core.delete_data_source("u", &ds).expect("delete");
    assert!(report.is_complete());

    assert!(core.list_charts("u").expect("charts").is_empty());
    assert!(core.get_dashboard("u", &board).expect("dashboard").layout.is_empty());
    assert!(matches!(core.get_data_source("u", &ds), Err(AppError::NotFound(_))));
}

#[test]
fn cascade_is_complete_for_any_number_of_linked_charts() {
    for count in 0..4 {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core(&dir);
        let ds = data_source(&core, "u");
        let boards = (0..count)
            .map(|index| {
                let chart_id = chart(&core, "u", &ds, &format!("chart {index}"));
                dashboard(&core, "u", &[chart_id])
            })
            .collect::<Vec<_>>();

        let report = core.delete_data_source("u", &ds).expect("delete");
        assert_eq!(report.charts_deleted, count as u64);
        assert_eq!(report.dashboards_pruned, count as u64);
        assert!(core.list_charts("u").expect("charts").is_empty());
        for board in boards {
            assert!(core.get_dashboard("u", &board).expect("dashboard").layout.is_empty());
        }
    }
}

#[test]
fn dashboard_edit_count_tracks_updates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let board = dashboard(&core, "u", &[]);
    assert_eq!(core.get_dashboard("u", &board).expect("dashboard").edit_count, 1);

    let updated = core
        .update_dashboard(
            "u",
            &board,
            &SaveDashboardPayload {
                name: "Revenue v2".to_string(),
                description: String::new(),
                layout: Vec::new(),
            },
        )
        .expect("update");
    assert_eq!(updated.edit_count, 2);
    assert_eq!(updated.name, "Revenue v2");
}

#[test]
fn chart_update_with_dashboard_hint_counts_as_dashboard_edit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let ds = data_source(&core, "u");
    let chart_id = chart(&core, "u", &ds, "A");
    let board = dashboard(&core, "u", &[chart_id.clone()]);

    let updated = core
        .update_chart_config("u", &chart_id, &ChartConfig::default(), Some(&board))
        .expect("update config");
    assert_eq!(updated.cascade.edit_count, Some(2));
    assert_eq!(core.get_dashboard("u", &board).expect("dashboard").edit_count, 2);
}

#[test]
fn empty_owner_stats_are_zeroed_with_six_labeled_months() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);

    let stats = core.build_user_stats("nobody");
    assert_eq!(stats.total_dashboards, 0);
    assert_eq!(stats.total_data_sources, 0);
    assert_eq!(stats.total_charts, 0);
    assert_eq!(stats.total_ml_models, 0);
    assert!(stats.recent_activity.is_empty());
    assert_eq!(stats.usage_stats.len(), 6);

    let now = Utc::now();
    let expected = (0..6u32)
        .rev()
        .map(|back| {
            let month = now
                .with_day(1)
                .and_then(|first| first.checked_sub_months(Months::new(back)))
                .expect("month");
            month.format("%Y-%m").to_string()
        })
        .collect::<Vec<_>>();
    let labels = stats.usage_stats.iter().map(|stat| stat.date.clone()).collect::<Vec<_>>();
    assert_eq!(labels, expected);
    assert!(stats.usage_stats.iter().all(|stat| stat.queries == 0));
}

#[test]
fn stats_reflect_current_month_activity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let ds = data_source(&core, "u");
    let first = chart(&core, "u", &ds, "A");
    chart(&core, "u", &ds, "B");
    dashboard(&core, "u", &[first]);

    let stats = core.build_user_stats("u");
    assert_eq!(stats.total_charts, 2);
    assert_eq!(stats.total_data_sources, 1);
    let current = stats.usage_stats.last().expect("current month");
    assert_eq!(current.charts, 2);
    assert_eq!(current.queries, 4);
    assert_eq!(current.dashboards, 1);
    assert_eq!(stats.recent_activity.len(), 3);
    assert!(stats
        .recent_activity
        .windows(2)
        .all(|pair| pair[0].created_at >= pair[1].created_at));
}

#[test]
fn linking_the_same_chart_twice_keeps_one_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let ds = data_source(&core, "u");
    let chart_id = chart(&core, "u", &ds, "A");

    assert!(!core.database().add_linked_chart(&ds, &chart_id).expect("relink"));
    let linked = core.get_data_source("u", &ds).expect("ds").linked_charts;
    assert_eq!(linked.iter().filter(|id| **id == chart_id).count(), 1);
}

#[test]
fn other_owners_cannot_see_or_reference_entities() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let ds = data_source(&core, "alice");
    let chart_id = chart(&core, "alice", &ds, "A");

    assert!(matches!(core.get_chart("bob", &chart_id), Err(AppError::NotFound(_))));
    assert!(matches!(core.delete_chart("bob", &chart_id), Err(AppError::NotFound(_))));
    let err = core
        .create_chart(
            "bob",
            CreateChartPayload {
                name: "stolen".to_string(),
                chart_type: "pie".to_string(),
                data_source_id: ds.clone(),
                config: ChartConfig::default(),
            },
            None,
        )
        .expect_err("foreign data source");
    assert_eq!(err.code(), "NOT_FOUND");
}

#[test]
fn dashboard_view_skips_missing_charts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let ds = data_source(&core, "u");
    let kept = chart(&core, "u", &ds, "kept");
    let board = dashboard(&core, "u", &[kept.clone(), "deleted-elsewhere".to_string()]);

    let view = core.get_dashboard_view("u", &board).expect("view");
    assert_eq!(view.dashboard.layout.len(), 2);
    assert_eq!(view.placements.len(), 1);
    assert_eq!(view.placements[0].chart.id, kept);

    let with_source = core.get_chart("u", &kept).expect("chart");
    assert_eq!(with_source.data_source.map(|source| source.id), Some(ds));
}

#[test]
fn ml_models_require_a_resolvable_data_source() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let ds = data_source(&core, "u");
    let payload = SaveMlModelPayload {
        name: "forecast".to_string(),
        description: String::new(),
        model_type: "linear_regression".to_string(),
        data_source_id: "missing".to_string(),
        features: vec!["month".to_string()],
        target: "amount".to_string(),
        parameters: serde_json::json!({}),
        preprocessing: Vec::new(),
    };
    assert!(matches!(
        core.create_ml_model("u", payload.clone()),
        Err(AppError::NotFound(_))
    ));

    let model = core
        .create_ml_model(
            "u",
            SaveMlModelPayload {
                data_source_id: ds,
                ..payload
            },
        )
        .expect("model");
    assert!(model.training_result.is_none());

    let trained = core
        .set_training_result("u", &model.id, serde_json::json!({ "metrics": { "r2": 0.91 } }))
        .expect("train");
    assert!(trained.training_result.is_some());

    let stats = core.build_user_stats("u");
    assert_eq!(stats.ml_model_stats.trained_models, 1);
    assert_eq!(stats.ml_model_stats.pending_models, 0);
    assert_eq!(stats.ml_model_stats.average_metrics.get("r2"), Some(&0.91));
}

#[test]
fn reconcile_is_idempotent_on_a_consistent_graph() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let ds = data_source(&core, "u");
    let chart_id = chart(&core, "u", &ds, "A");
    dashboard(&core, "u", &[chart_id]);

    assert!(core.reconcile_links("u").expect("reconcile").is_clean());
    assert!(core.reconcile_links("u").expect("reconcile").is_clean());
}

#[test]
fn starting_outside_a_runtime_returns_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    let err = core.start().expect_err("no runtime");
    assert_eq!(err.code(), "INTERNAL");

    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    runtime.block_on(async {
        core.start().expect("start inside runtime");
        core.shutdown().await;
    });
}

#[tokio::test]
async fn audit_events_are_flushed_on_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = core(&dir);
    core.start().expect("start");

    let ds = data_source(&core, "u");
    let chart_id = chart(&core, "u", &ds, "A");
    core.delete_chart("u", &chart_id).expect("delete");
    core.shutdown().await;

    let actions = core
        .audit_log("u", 10)
        .expect("audit")
        .into_iter()
        .map(|event| event.action)
        .collect::<Vec<_>>();
    assert_eq!(actions.len(), 3);
    assert!(actions.contains(&"data_source.create".to_string()));
    assert!(actions.contains(&"chart.create".to_string()));
    assert!(actions.contains(&"chart.delete".to_string()));
}
