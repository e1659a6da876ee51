//! Deferred cost reconciliation.
//!
//! The engine logs LLM calls the moment the response arrives, but the
//! provider's authoritative cost and native token counts settle a few
//! seconds later. The tracker queues `(request_id, trace_id)` pairs, waits a
//! settle interval, polls the cost feed, and merges the result one of two
//! ways:
//!
//! - **Deferred-log mode**: the enqueue carried the full pending row; the
//!   row is written only now, with cost fields populated.
//! - **Patch mode**: the row already exists; the tracker patches it and logs
//!   a separate `cost_update` row for live consumers.
//!
//! Either way a `cost_update` event is published on the bus. Network
//! failures log `cost = null`; the row is still emitted. Cost data being
//! unavailable is never fatal.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::event_bus::{Event, EventBus, EVENT_COST_UPDATE};
use crate::log::{CostPatch, LogRow, LogStore};
use crate::provider::CostFeed;
use crate::types::NodeType;

/// One tracked request awaiting provider cost data.
#[derive(Debug)]
pub struct PendingCost {
    pub session_id: String,
    pub request_id: String,
    pub trace_id: String,
    pub parent_trace_id: Option<String>,
    pub cell_name: Option<String>,
    pub cascade_id: Option<String>,
    pub candidate_index: Option<u32>,
    /// Deferred-log mode: the complete row held back until cost arrives.
    pub pending_row: Option<LogRow>,
    received_at: Instant,
}

impl PendingCost {
    #[must_use]
    pub fn new(session_id: &str, request_id: &str, trace_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            trace_id: trace_id.to_string(),
            parent_trace_id: None,
            cell_name: None,
            cascade_id: None,
            candidate_index: None,
            pending_row: None,
            received_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn in_cell(mut self, cell_name: &str, cascade_id: &str) -> Self {
        self.cell_name = Some(cell_name.to_string());
        self.cascade_id = Some(cascade_id.to_string());
        self
    }

    /// Hold the full row until cost arrives (deferred-log mode).
    #[must_use]
    pub fn deferring(mut self, row: LogRow) -> Self {
        self.pending_row = Some(row);
        self
    }
}

/// Background worker reconciling provider cost into the log.
pub struct CostTracker {
    queue: Arc<Mutex<Vec<PendingCost>>>,
    feed: Arc<dyn CostFeed>,
    log: Arc<dyn LogStore>,
    bus: EventBus,
    settle: Duration,
    poll: Duration,
}

impl CostTracker {
    #[must_use]
    pub fn new(
        feed: Arc<dyn CostFeed>,
        log: Arc<dyn LogStore>,
        bus: EventBus,
        settle: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            feed,
            log,
            bus,
            settle,
            poll,
        }
    }

    /// Enqueue a request for later reconciliation.
    pub async fn track(&self, pending: PendingCost) {
        self.queue.lock().await.push(pending);
    }

    /// Number of requests still awaiting cost data.
    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Spawn the worker loop. The handle aborts on drop by the caller.
    #[must_use]
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tracker.drain_settled().await;
                tokio::time::sleep(tracker.poll).await;
            }
        })
    }

    /// Process every queued item older than the settle interval. Exposed so
    /// tests can drive the tracker without the background loop.
    pub async fn drain_settled(&self) {
        let ready: Vec<PendingCost> = {
            let mut queue = self.queue.lock().await;
            let now = Instant::now();
            let mut ready = Vec::new();
            let mut remaining = Vec::new();
            for item in queue.drain(..) {
                if now.duration_since(item.received_at) >= self.settle {
                    ready.push(item);
                } else {
                    remaining.push(item);
                }
            }
            *queue = remaining;
            ready
        };

        for item in ready {
            self.reconcile(item).await;
        }
    }

    async fn reconcile(&self, item: PendingCost) {
        let fetched = match self.feed.fetch(&item.request_id).await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(
                    target: "rvbbit::cost",
                    request_id = %item.request_id,
                    error = %err,
                    "cost fetch failed; logging without cost"
                );
                None
            }
        };

        let patch = fetched
            .as_ref()
            .map(|cost| CostPatch {
                cost: Some(cost.total_cost),
                tokens_in: Some(cost.tokens_in),
                tokens_out: Some(cost.tokens_out),
                model_actual: cost.model.clone(),
                duration_ms: cost.generation_time_ms,
            })
            .unwrap_or_default();

        if let Some(mut row) = item.pending_row {
            // Deferred-log mode: write the held row with cost merged in.
            row.cost = patch.cost;
            if patch.tokens_in.is_some() {
                row.tokens_in = patch.tokens_in;
            }
            if patch.tokens_out.is_some() {
                row.tokens_out = patch.tokens_out;
            }
            if row.model_actual.is_none() {
                row.model_actual = patch.model_actual.clone();
            }
            if let Some(duration) = patch.duration_ms {
                row.duration_ms = Some(duration);
            }
            if let Err(err) = self.log.append(row).await {
                tracing::error!(target: "rvbbit::cost", error = %err, "deferred row append failed");
            }
        } else {
            // Patch mode: update the existing row and log a cost_update row.
            if let Err(err) = self.log.patch_cost(&item.trace_id, patch.clone()).await {
                tracing::warn!(target: "rvbbit::cost", error = %err, "cost patch failed");
            }
            let tokens = patch.tokens_in.unwrap_or(0) + patch.tokens_out.unwrap_or(0);
            let mut update = LogRow::new(
                &item.session_id,
                NodeType::CostUpdate,
                "system",
                json!({
                    "cost": patch.cost,
                    "tokens": tokens,
                    "provider_id": item.request_id.clone(),
                }),
            )
            .with_parent(&item.trace_id);
            update.cell_name = item.cell_name.clone();
            update.cascade_id = item.cascade_id.clone();
            update.candidate_index = item.candidate_index;
            update.cost = patch.cost;
            update.tokens_in = patch.tokens_in;
            update.tokens_out = patch.tokens_out;
            update.model_actual = patch.model_actual.clone();
            if let Err(err) = self.log.append(update).await {
                tracing::error!(target: "rvbbit::cost", error = %err, "cost_update append failed");
            }
        }

        // Live consumers always get the event, whichever logging path ran.
        self.bus.publish(Event::now(
            EVENT_COST_UPDATE,
            &item.session_id,
            json!({
                "trace_id": item.trace_id,
                "request_id": item.request_id,
                "cost": patch.cost,
                "tokens_in": patch.tokens_in.unwrap_or(0),
                "tokens_out": patch.tokens_out.unwrap_or(0),
                "cell_name": item.cell_name,
                "cascade_id": item.cascade_id,
                "candidate_index": item.candidate_index,
            }),
        ));
    }
}
