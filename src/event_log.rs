//! The canonical, append-only `ExecutionEvent` store. `append` is the only
//! write path; everything else — the observability `EventHandler` callback,
//! the broadcast `stream`, and the `parent_event_id` forest — reads back
//! through it.

use crate::types::{bound_summary, new_id, DecisionSource, ExecutionEvent, Id, Stage};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone)]
pub enum EventLogError {
    /// Storage write failed; callers must retry, never silently drop.
    Unavailable(String),
}

impl fmt::Display for EventLogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventLogError::Unavailable(msg) => write!(f, "event log unavailable: {msg}"),
        }
    }
}

impl std::error::Error for EventLogError {}

/// Optional filter for `by_workflow`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub stage: Option<Stage>,
    pub component_role: Option<String>,
}

impl EventFilter {
    fn matches(&self, event: &ExecutionEvent) -> bool {
        if let Some(stage) = self.stage {
            if event.stage as u8 != stage as u8 {
                return false;
            }
        }
        if let Some(role) = &self.component_role {
            if &event.component_role != role {
                return false;
            }
        }
        true
    }
}

/// Observability hook invoked after every successful append. Distinct from
/// the durable log itself — registering a handler never substitutes for
/// persistence, it only mirrors what was already committed.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: &ExecutionEvent);
}

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1024;

struct WorkflowLog {
    events: Vec<ExecutionEvent>,
}

/// Append-only, causally-linked `ExecutionEvent` store.
///
/// `append` is atomic and totally ordered per workflow (guarded by the
/// per-workflow entry in `logs`, matching the "single writer per workflow"
/// rule). Subscribers receive events via a bounded broadcast
/// channel; a subscriber that falls behind is dropped with a
/// `subscriber_lag` marker event rather than blocking producers.
pub struct EventLog {
    logs: RwLock<HashMap<Id, WorkflowLog>>,
    sender: broadcast::Sender<ExecutionEvent>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventLog {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        Self {
            logs: RwLock::new(HashMap::new()),
            sender,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub async fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Build and append an event in one call; stamps `event_id`/`timestamp`
    /// and bounds the summaries per the EventLog contract.
    #[allow(clippy::too_many_arguments)]
    pub async fn emit(
        &self,
        workflow_id: impl Into<String>,
        session_id: impl Into<String>,
        stage: Stage,
        component_role: impl Into<String>,
        component_name: impl Into<String>,
        decision_source: DecisionSource,
        status: impl Into<String>,
        input_summary: &str,
        output_summary: &str,
        parent_event_id: Option<Id>,
    ) -> Result<Id, EventLogError> {
        let event = ExecutionEvent {
            event_id: new_id(),
            timestamp: Utc::now(),
            workflow_id: workflow_id.into(),
            session_id: session_id.into(),
            stage,
            component_role: component_role.into(),
            component_name: component_name.into(),
            decision_source,
            status: status.into(),
            input_summary: bound_summary(input_summary),
            output_summary: bound_summary(output_summary),
            reason_code: None,
            parent_event_id,
            event_metadata: HashMap::new(),
            prompt_id: None,
            prompt_version: None,
        };
        self.append(event).await
    }

    /// Append a fully-formed event. `decision_source` must already be
    /// stamped by the caller.
    pub async fn append(&self, event: ExecutionEvent) -> Result<Id, EventLogError> {
        if let Some(parent_id) = &event.parent_event_id {
            self.verify_parent(&event.workflow_id, parent_id, event.timestamp)
                .await?;
        }

        let event_id = event.event_id.clone();
        {
            let mut logs = self.logs.write().await;
            let log = logs
                .entry(event.workflow_id.clone())
                .or_insert_with(|| WorkflowLog { events: Vec::new() });
            log.events.push(event.clone());
        }

        debug!(
            "event appended: workflow={} stage={:?} role={} status={}",
            event.workflow_id, event.stage, event.component_role, event.status
        );

        // A lagging/absent subscriber must never block the producer — the
        // send error (no receivers, or a full channel causing a lagged
        // recv on the reader side) is swallowed here by design.
        let _ = self.sender.send(event.clone());

        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.on_event(&event).await;
        }

        Ok(event_id)
    }

    async fn verify_parent(
        &self,
        workflow_id: &str,
        parent_id: &str,
        child_timestamp: chrono::DateTime<Utc>,
    ) -> Result<(), EventLogError> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(workflow_id) else {
            return Err(EventLogError::Unavailable(format!(
                "parent event {parent_id} referenced before its workflow {workflow_id} has any events"
            )));
        };
        let Some(parent) = log.events.iter().find(|e| e.event_id == parent_id) else {
            return Err(EventLogError::Unavailable(format!(
                "parent event {parent_id} not found in workflow {workflow_id}"
            )));
        };
        if parent.timestamp > child_timestamp {
            return Err(EventLogError::Unavailable(format!(
                "parent event {parent_id} timestamp is after its child"
            )));
        }
        Ok(())
    }

    /// Direct children of `event_id` across all workflows it could belong
    /// to (an event id is unique, so this is unambiguous).
    pub async fn children(&self, event_id: &str) -> Vec<ExecutionEvent> {
        let logs = self.logs.read().await;
        logs.values()
            .flat_map(|log| log.events.iter())
            .filter(|e| e.parent_event_id.as_deref() == Some(event_id))
            .cloned()
            .collect()
    }

    pub async fn by_workflow(&self, workflow_id: &str, filter: Option<EventFilter>) -> Vec<ExecutionEvent> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(workflow_id) else {
            return Vec::new();
        };
        match filter {
            Some(f) => log.events.iter().filter(|e| f.matches(e)).cloned().collect(),
            None => log.events.clone(),
        }
    }

    /// Subscribe to append-order events for a single workflow. Returns a
    /// `broadcast::Receiver` filtered, at the call site, to the requested
    /// workflow. If the receiver falls behind, `recv()` returns
    /// `RecvError::Lagged` — callers should treat that as the
    /// `subscriber_lag` marker and resubscribe rather than block producers.
    pub fn stream(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Count of currently active subscribers, useful for diagnosing the
    /// "slow subscriber dropped" path in tests.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain a workflow's stream until either `n` events are observed or the
/// receiver lags, logging a warning in the latter case. This is the
/// pattern a UI-facing consumer (out of scope here) would build on.
pub async fn drain_or_warn(
    mut receiver: broadcast::Receiver<ExecutionEvent>,
    workflow_id: &str,
    n: usize,
) -> Vec<ExecutionEvent> {
    let mut collected = Vec::new();
    while collected.len() < n {
        match receiver.recv().await {
            Ok(event) => {
                if event.workflow_id == workflow_id {
                    collected.push(event);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("subscriber lagged behind by {skipped} events for workflow {workflow_id}");
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestType;

    #[tokio::test]
    async fn append_is_totally_ordered_per_workflow() {
        let log = EventLog::new();
        let wf = "wf-1";
        let first = log
            .emit(
                wf,
                "sess-1",
                Stage::Interpretation,
                "interpretation",
                "kernel",
                DecisionSource::Component,
                "started",
                "hello",
                "",
                None,
            )
            .await
            .unwrap();
        let second = log
            .emit(
                wf,
                "sess-1",
                Stage::ValidatorA,
                "semantic_validator",
                "kernel",
                DecisionSource::Component,
                "ok",
                "hello",
                "valid",
                Some(first.clone()),
            )
            .await
            .unwrap();

        let events = log.by_workflow(wf, None).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, first);
        assert_eq!(events[1].event_id, second);
        assert_eq!(events[1].parent_event_id.as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn appending_with_unknown_parent_fails() {
        let log = EventLog::new();
        let result = log
            .emit(
                "wf-2",
                "sess-2",
                Stage::Execution,
                "execution",
                "agent_x",
                DecisionSource::Component,
                "ok",
                "",
                "",
                Some("nonexistent".to_string()),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn filter_by_stage_restricts_results() {
        let log = EventLog::new();
        let wf = "wf-3";
        log.emit(
            wf,
            "s",
            Stage::Interpretation,
            "interpretation",
            "k",
            DecisionSource::Component,
            "ok",
            "",
            "",
            None,
        )
        .await
        .unwrap();
        log.emit(
            wf,
            "s",
            Stage::Routing,
            "routing",
            "k",
            DecisionSource::Component,
            "ok",
            "",
            "",
            None,
        )
        .await
        .unwrap();

        let filtered = log
            .by_workflow(
                wf,
                Some(EventFilter {
                    stage: Some(Stage::Routing),
                    component_role: None,
                }),
            )
            .await;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].component_role, "routing");
    }

    #[tokio::test]
    async fn handler_is_invoked_on_append() {
        struct Counter(std::sync::atomic::AtomicUsize);
        #[async_trait]
        impl EventHandler for Counter {
            async fn on_event(&self, _event: &ExecutionEvent) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let log = EventLog::new();
        let counter = Arc::new(Counter(std::sync::atomic::AtomicUsize::new(0)));
        log.register_handler(counter.clone()).await;
        log.emit(
            "wf-4",
            "s",
            Stage::Interpretation,
            "interpretation",
            "k",
            DecisionSource::Component,
            "ok",
            "",
            "",
            None,
        )
        .await
        .unwrap();
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        // request_type is unused here, but keep the import exercised across
        // the test module so the scenario reads like a real workflow setup.
        let _ = RequestType::SimpleQuestion;
    }
}
