//! In-process trace store
//!
//! Mirrors the persisted layout: a primary map per record type, a
//! `(project, start_time, trace_id)` ordered index for listings, a
//! trace-to-spans index and a running aggregate per project.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::{into_page, start_after, Completion, SpanCompletion, TraceCompletion, TraceStore};
use crate::error::{Error, Result};
use crate::models::{
    ProjectStats, PurgeReport, Span, Trace, TraceDetail, TraceListQuery, TracePage, TraceTotals,
};

type ListingKey = (DateTime<Utc>, String);

#[derive(Default)]
struct Tables {
    traces: HashMap<String, Trace>,
    spans: HashMap<String, Span>,
    spans_by_trace: HashMap<String, BTreeSet<String>>,
    by_project: HashMap<String, BTreeSet<ListingKey>>,
    stats: HashMap<String, ProjectStats>,
}

impl Tables {
    fn live_spans<'a>(&'a self, trace_id: &str, now: DateTime<Utc>) -> impl Iterator<Item = &'a Span> + 'a {
        self.spans_by_trace
            .get(trace_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.spans.get(id))
            .filter(move |span| !span.is_expired(now))
    }

    fn remove_span(&mut self, span_id: &str) -> Option<Span> {
        let span = self.spans.remove(span_id)?;
        if let Some(ids) = self.spans_by_trace.get_mut(&span.trace_id) {
            ids.remove(span_id);
            if ids.is_empty() {
                self.spans_by_trace.remove(&span.trace_id);
            }
        }
        Some(span)
    }
}

/// Trace store held in process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TraceStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put_trace(&self, trace: &Trace) -> Result<bool> {
        let mut tables = self.tables.write();
        if tables.traces.contains_key(&trace.trace_id) {
            return Ok(false);
        }
        tables
            .by_project
            .entry(trace.project_id.clone())
            .or_default()
            .insert((trace.start_time, trace.trace_id.clone()));
        tables
            .stats
            .entry(trace.project_id.clone())
            .or_default()
            .total_traces += 1;
        tables.traces.insert(trace.trace_id.clone(), trace.clone());
        Ok(true)
    }

    async fn put_span(&self, span: &Span) -> Result<bool> {
        let mut tables = self.tables.write();
        if tables.spans.contains_key(&span.span_id) {
            return Ok(false);
        }
        tables
            .spans_by_trace
            .entry(span.trace_id.clone())
            .or_default()
            .insert(span.span_id.clone());
        tables.spans.insert(span.span_id.clone(), span.clone());
        Ok(true)
    }

    async fn get_trace_record(&self, trace_id: &str) -> Result<Option<Trace>> {
        let now = Utc::now();
        let tables = self.tables.read();
        Ok(tables
            .traces
            .get(trace_id)
            .filter(|trace| !trace.is_expired(now))
            .cloned())
    }

    async fn get_trace(&self, trace_id: &str) -> Result<Option<TraceDetail>> {
        let now = Utc::now();
        let tables = self.tables.read();
        let Some(trace) = tables.traces.get(trace_id).filter(|t| !t.is_expired(now)) else {
            return Ok(None);
        };
        Ok(Some(TraceDetail {
            trace: trace.clone(),
            spans: tables.live_spans(trace_id, now).cloned().collect(),
        }))
    }

    async fn get_span(&self, span_id: &str) -> Result<Option<Span>> {
        let now = Utc::now();
        let tables = self.tables.read();
        Ok(tables
            .spans
            .get(span_id)
            .filter(|span| !span.is_expired(now))
            .cloned())
    }

    async fn complete_span(
        &self,
        span_id: &str,
        completion: SpanCompletion,
    ) -> Result<Completion<Span>> {
        let mut tables = self.tables.write();
        let span = tables
            .spans
            .get_mut(span_id)
            .ok_or_else(|| Error::not_found("Span", span_id))?;

        if span.is_complete() {
            return Ok(Completion::AlreadyCompleted(span.clone()));
        }
        completion.apply(span);
        Ok(Completion::Completed(span.clone()))
    }

    async fn complete_trace(
        &self,
        trace_id: &str,
        completion: TraceCompletion,
    ) -> Result<Completion<Trace>> {
        let now = Utc::now();
        let mut tables = self.tables.write();

        let trace = tables
            .traces
            .get(trace_id)
            .ok_or_else(|| Error::not_found("Trace", trace_id))?;
        if trace.is_complete() {
            return Ok(Completion::AlreadyCompleted(trace.clone()));
        }

        let totals = TraceTotals::from_spans(tables.live_spans(trace_id, now));
        let mut trace = trace.clone();
        completion.apply_fields(&mut trace);
        trace.finish(completion.end_time, completion.status, totals);

        let stats = tables.stats.entry(trace.project_id.clone()).or_default();
        stats.total_spans = stats.total_spans.saturating_add(totals.span_count);
        stats.total_tokens = stats.total_tokens.saturating_add(totals.total_tokens);
        stats.total_cost += totals.total_cost_usd;

        tables.traces.insert(trace.trace_id.clone(), trace.clone());
        Ok(Completion::Completed(trace))
    }

    async fn list_traces(&self, query: &TraceListQuery) -> Result<TracePage> {
        let after = start_after(query)?;
        let now = Utc::now();
        let tables = self.tables.read();

        let Some(index) = tables.by_project.get(&query.project_id) else {
            return into_page(Vec::new(), query.limit);
        };

        let keys: Box<dyn Iterator<Item = &ListingKey> + '_> = match after {
            Some(cursor) => Box::new(index.range(..(cursor.start_time, cursor.trace_id)).rev()),
            None => Box::new(index.iter().rev()),
        };

        let traces: Vec<Trace> = keys
            .filter_map(|(_, trace_id)| tables.traces.get(trace_id))
            .filter(|trace| !trace.is_expired(now) && query.matches(trace))
            .take(query.limit + 1)
            .cloned()
            .collect();

        into_page(traces, query.limit)
    }

    async fn get_stats(&self, project_id: &str) -> Result<ProjectStats> {
        Ok(self
            .tables
            .read()
            .stats
            .get(project_id)
            .copied()
            .unwrap_or_default())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        let mut tables = self.tables.write();
        let mut report = PurgeReport::default();

        let expired: Vec<String> = tables
            .traces
            .values()
            .filter(|trace| trace.is_expired(now))
            .map(|trace| trace.trace_id.clone())
            .collect();

        for trace_id in expired {
            let Some(trace) = tables.traces.remove(&trace_id) else {
                continue;
            };
            if let Some(index) = tables.by_project.get_mut(&trace.project_id) {
                index.remove(&(trace.start_time, trace.trace_id.clone()));
            }
            if let Some(stats) = tables.stats.get_mut(&trace.project_id) {
                stats.total_traces -= 1;
                if trace.is_complete() {
                    stats.total_spans = stats.total_spans.saturating_sub(trace.span_count).max(0);
                    stats.total_tokens = stats.total_tokens.saturating_sub(trace.total_tokens).max(0);
                    stats.total_cost -= trace.total_cost_usd;
                }
            }

            let span_ids: Vec<String> = tables
                .spans_by_trace
                .get(&trace_id)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default();
            for span_id in span_ids {
                if tables.remove_span(&span_id).is_some() {
                    report.spans += 1;
                }
            }
            report.traces += 1;
        }

        let expired_spans: Vec<String> = tables
            .spans
            .values()
            .filter(|span| span.is_expired(now))
            .map(|span| span.span_id.clone())
            .collect();
        for span_id in expired_spans {
            if tables.remove_span(&span_id).is_some() {
                report.spans += 1;
            }
        }

        tables.by_project.retain(|_, index| !index.is_empty());
        debug!(traces = report.traces, spans = report.spans, "purged expired records");
        Ok(report)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
