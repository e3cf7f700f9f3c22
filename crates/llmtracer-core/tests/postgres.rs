//! PostgreSQL store against a live database
//!
//! These need a scratch database: `DATABASE_URL=postgres://... cargo test
//! --test postgres -- --ignored`. Every test works in a project of its own,
//! so they can share one database and run in parallel.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;

use llmtracer::config::DatabaseConfig;
use llmtracer::models::{RecordStatus, Span, SpanType, Trace, TraceListQuery};
use llmtracer::storage::{PostgresStore, SpanCompletion, TraceCompletion, TraceStore};

async fn store() -> PostgresStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must name a scratch database");
    let store = PostgresStore::connect(&DatabaseConfig {
        url,
        max_connections: 4,
        min_connections: 1,
        ..DatabaseConfig::default()
    })
    .await
    .unwrap();
    store.migrate().await.unwrap();
    store
}

/// A project id no other test run uses
fn project() -> String {
    format!("pg_{}", Uuid::new_v4().simple())
}

fn id(project: &str, name: &str) -> String {
    format!("{project}.{name}")
}

fn trace(id: &str, project: &str, start: DateTime<Utc>) -> Trace {
    Trace::new(id, project, format!("run {id}"), start, Duration::days(90))
}

fn span(id: &str, trace_id: &str, start: DateTime<Utc>) -> Span {
    Span::new(id, trace_id, id, SpanType::Llm, start, Duration::days(90))
}

fn finish_span(tokens: i64, cost: f64) -> SpanCompletion {
    SpanCompletion {
        end_time: Utc::now(),
        status: RecordStatus::Completed,
        output_data: json!({"text": "ok"}),
        tokens_input: Some(tokens),
        tokens_output: Some(0),
        cost_usd: Some(cost),
        error: None,
        input_data: None,
        metadata: None,
    }
}

fn finish_trace(end_time: DateTime<Utc>) -> TraceCompletion {
    TraceCompletion {
        end_time,
        status: RecordStatus::Completed,
        output: Some("done".to_string()),
        error: None,
        metadata: None,
    }
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn puts_are_idempotent() {
    let store = store().await;
    let project = project();
    let trace_id = id(&project, "t");
    let start = Utc::now();

    assert!(store.put_trace(&trace(&trace_id, &project, start)).await.unwrap());
    let mut replay = trace(&trace_id, &project, start);
    replay.name = "replayed".to_string();
    assert!(!store.put_trace(&replay).await.unwrap());

    let span_id = id(&project, "s");
    assert!(store.put_span(&span(&span_id, &trace_id, start)).await.unwrap());
    assert!(!store.put_span(&span(&span_id, &trace_id, start)).await.unwrap());

    let detail = store.get_trace(&trace_id).await.unwrap().unwrap();
    assert_eq!(detail.trace.name, format!("run {trace_id}"));
    assert_eq!(detail.spans.len(), 1);
    assert_eq!(store.get_stats(&project).await.unwrap().total_traces, 1);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn completion_aggregates_once() {
    let store = store().await;
    let project = project();
    let trace_id = id(&project, "t");
    let start = Utc::now();
    store.put_trace(&trace(&trace_id, &project, start)).await.unwrap();
    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        let span_id = id(&project, name);
        store.put_span(&span(&span_id, &trace_id, start)).await.unwrap();
        let tokens = 10 * (i64::try_from(i).unwrap() + 1);
        let done = store.complete_span(&span_id, finish_span(tokens, 0.5)).await.unwrap();
        assert_eq!(done.label(), "completed");
    }

    let again = store
        .complete_span(&id(&project, "a"), finish_span(999, 9.0))
        .await
        .unwrap();
    assert!(again.is_repeat());
    assert_eq!(again.record().tokens_input, Some(10));

    let done = store
        .complete_trace(&trace_id, finish_trace(Utc::now()))
        .await
        .unwrap();
    assert_eq!(done.label(), "completed");
    let record = done.into_record();
    assert_eq!(record.span_count, 3);
    assert_eq!(record.total_tokens, 60);
    assert!((record.total_cost_usd - 1.5).abs() < 1e-9);
    assert_eq!(record.output.as_deref(), Some("done"));

    let repeat = store
        .complete_trace(&trace_id, finish_trace(Utc::now()))
        .await
        .unwrap();
    assert!(repeat.is_repeat());

    let stats = store.get_stats(&project).await.unwrap();
    assert_eq!(stats.total_traces, 1);
    assert_eq!(stats.total_spans, 3);
    assert_eq!(stats.total_tokens, 60);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn token_totals_saturate() {
    let store = store().await;
    let project = project();
    let trace_id = id(&project, "t");
    let start = Utc::now();
    store.put_trace(&trace(&trace_id, &project, start)).await.unwrap();
    for name in ["a", "b"] {
        let span_id = id(&project, name);
        store.put_span(&span(&span_id, &trace_id, start)).await.unwrap();
        store
            .complete_span(&span_id, finish_span(i64::MAX, 0.0))
            .await
            .unwrap();
    }

    let record = store
        .complete_trace(&trace_id, finish_trace(Utc::now()))
        .await
        .unwrap()
        .into_record();
    assert_eq!(record.total_tokens, i64::MAX);
    assert_eq!(store.get_stats(&project).await.unwrap().total_tokens, i64::MAX);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn pagination_walks_every_trace_once() {
    let store = store().await;
    let project = project();
    let base = Utc::now();
    // two traces share a start time to exercise the id tie-break
    let starts = [0, 1, 2, 2, 3];
    for (i, offset) in starts.iter().enumerate() {
        let trace_id = id(&project, &format!("t{i}"));
        store
            .put_trace(&trace(&trace_id, &project, base + Duration::seconds(*offset)))
            .await
            .unwrap();
    }

    let mut query = TraceListQuery::new(project.clone()).with_limit(2);
    let mut sizes = Vec::new();
    let mut seen = Vec::new();
    loop {
        let page = store.list_traces(&query).await.unwrap();
        sizes.push(page.count);
        seen.extend(page.traces.iter().map(|t| t.trace_id.clone()));
        if page.next_cursor.is_none() {
            assert!(!page.has_more);
            break;
        }
        query = query.with_cursor(page.next_cursor);
    }

    assert_eq!(sizes, vec![2, 2, 1]);
    let expected: Vec<String> = ["t4", "t3", "t2", "t1", "t0"]
        .iter()
        .map(|name| id(&project, name))
        .collect();
    assert_eq!(seen, expected);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 5);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn listing_filters_by_tags_user_and_status() {
    let store = store().await;
    let project = project();
    let now = Utc::now();

    let mut tagged = trace(&id(&project, "tagged"), &project, now);
    tagged.tags = vec!["prod".to_string(), "chat".to_string()];
    tagged.user_id = Some("u1".to_string());
    store.put_trace(&tagged).await.unwrap();
    store
        .put_trace(&trace(&id(&project, "plain"), &project, now))
        .await
        .unwrap();
    store
        .complete_trace(&id(&project, "plain"), finish_trace(now))
        .await
        .unwrap();

    let mut by_tag = TraceListQuery::new(project.clone());
    by_tag.tags = vec!["chat".to_string(), "unused".to_string()];
    let page = store.list_traces(&by_tag).await.unwrap();
    assert_eq!(page.count, 1);
    assert_eq!(page.traces[0].trace_id, tagged.trace_id);

    let mut by_user = TraceListQuery::new(project.clone());
    by_user.user_id = Some("u2".to_string());
    assert_eq!(store.list_traces(&by_user).await.unwrap().count, 0);

    let mut by_status = TraceListQuery::new(project.clone());
    by_status.status = Some(RecordStatus::Completed);
    let page = store.list_traces(&by_status).await.unwrap();
    assert_eq!(page.count, 1);
    assert_eq!(page.traces[0].trace_id, id(&project, "plain"));
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn purge_removes_expired_records_and_their_stats() {
    let store = store().await;
    let project = project();
    let long_ago = Utc::now() - Duration::days(120);

    let old = id(&project, "old");
    let old_span = id(&project, "old-span");
    store.put_trace(&trace(&old, &project, long_ago)).await.unwrap();
    store.put_span(&span(&old_span, &old, long_ago)).await.unwrap();
    store.complete_span(&old_span, finish_span(5, 0.1)).await.unwrap();
    store.complete_trace(&old, finish_trace(long_ago)).await.unwrap();

    let fresh = id(&project, "fresh");
    store.put_trace(&trace(&fresh, &project, Utc::now())).await.unwrap();

    assert!(store.get_trace(&old).await.unwrap().is_none());
    assert_eq!(
        store
            .list_traces(&TraceListQuery::new(project.clone()))
            .await
            .unwrap()
            .count,
        1
    );

    // other runs may leave expired rows behind, so only a lower bound holds
    let report = store.purge_expired(Utc::now()).await.unwrap();
    assert!(report.traces >= 1);
    assert!(report.spans >= 1);
    assert!(store.get_span(&old_span).await.unwrap().is_none());

    let stats = store.get_stats(&project).await.unwrap();
    assert_eq!(stats.total_traces, 1);
    assert_eq!(stats.total_spans, 0);
    assert_eq!(stats.total_tokens, 0);
    assert!(store.get_trace(&fresh).await.unwrap().is_some());
}
