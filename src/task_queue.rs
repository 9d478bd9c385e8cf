//! Priority leasing queue with exponential backoff and dead-lettering.
//!
//! A `BinaryHeap`-backed priority queue guarded by a single async mutex,
//! with a `HashMap` tracking in-flight (here: leased) entries.

use crate::types::{Id, QueueTask, QueueTaskState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub enum QueueError {
    NotFound(Id),
    NotLeased(Id),
    WrongLeaseOwner { task_id: Id, owner: String },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::NotFound(id) => write!(f, "task {id} not found"),
            QueueError::NotLeased(id) => write!(f, "task {id} is not currently leased"),
            QueueError::WrongLeaseOwner { task_id, owner } => {
                write!(f, "task {task_id} is not leased by {owner}")
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// Entry ordering: higher `priority` first; ties broken by earliest
/// `enqueued_at` (FIFO within a priority band).
#[derive(Debug, Clone)]
struct HeapEntry {
    task_id: Id,
    priority: u8,
    enqueued_at: DateTime<Utc>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.enqueued_at == other.enqueued_at
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    heap: BinaryHeap<HeapEntry>,
    tasks: HashMap<Id, QueueTask>,
}

pub struct TaskQueueConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_concurrent: usize,
}

impl From<crate::config::QueueDefaults> for TaskQueueConfig {
    fn from(defaults: crate::config::QueueDefaults) -> Self {
        Self {
            max_retries: defaults.max_retries,
            base_backoff_ms: defaults.base_backoff_ms,
            max_backoff_ms: defaults.max_backoff_ms,
            max_concurrent: 4,
        }
    }
}

/// A single named queue (e.g. `"plan_execution"`). Leases are exclusive:
/// `lease` never hands out a task already leased by someone else, and the
/// `max_concurrent` semaphore bounds how many leases are outstanding at once.
pub struct TaskQueue {
    config: TaskQueueConfig,
    state: Mutex<QueueState>,
    /// Count of currently leased (in-flight) tasks. Compared against
    /// `config.max_concurrent` on every `lease` call and decremented by
    /// `complete`/`fail`/`reap_lost_leases` — unlike a `tokio::Semaphore`
    /// permit, the slot must stay held for the task's whole in-flight
    /// lifetime, not just for the duration of the `lease` call.
    in_flight: AtomicUsize,
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                tasks: HashMap::new(),
            }),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub async fn enqueue(&self, task_id: Id, queue_id: impl Into<String>, priority: u8, payload: serde_json::Value) {
        let now = Utc::now();
        let task = QueueTask {
            task_id: task_id.clone(),
            queue_id: queue_id.into(),
            priority,
            payload,
            attempts: 0,
            max_attempts: self.config.max_retries + 1,
            state: QueueTaskState::Queued,
            lease_owner: None,
            leased_at: None,
            next_visible_at: now,
            enqueued_at: now,
        };
        let mut state = self.state.lock().await;
        state.heap.push(HeapEntry {
            task_id: task.task_id.clone(),
            priority,
            enqueued_at: now,
        });
        state.tasks.insert(task_id, task);
    }

    /// Pop the highest-priority visible task and lease it to `owner`. Tasks
    /// whose `next_visible_at` is still in the future (mid-backoff) are
    /// skipped and re-pushed.
    pub async fn lease(&self, owner: impl Into<String>) -> Option<QueueTask> {
        if self.in_flight.load(AtomicOrdering::SeqCst) >= self.config.max_concurrent {
            return None;
        }
        let owner = owner.into();
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let mut deferred = Vec::new();
        let mut leased = None;

        while let Some(entry) = state.heap.pop() {
            let visible = state
                .tasks
                .get(&entry.task_id)
                .map(|t| t.next_visible_at <= now && t.state == QueueTaskState::Queued)
                .unwrap_or(false);

            if visible {
                if let Some(task) = state.tasks.get_mut(&entry.task_id) {
                    task.state = QueueTaskState::Leased;
                    task.lease_owner = Some(owner.clone());
                    task.leased_at = Some(now);
                    task.attempts += 1;
                    leased = Some(task.clone());
                }
                break;
            } else if state.tasks.contains_key(&entry.task_id) {
                deferred.push(entry);
            }
        }

        for entry in deferred {
            state.heap.push(entry);
        }

        if leased.is_some() {
            self.in_flight.fetch_add(1, AtomicOrdering::SeqCst);
        }

        leased
    }

    /// Mark a leased task as succeeded. Requires the caller to present the
    /// lease owner it was granted, guarding against a requeued duplicate
    /// worker completing a task it no longer owns.
    pub async fn complete(&self, task_id: &str, owner: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get_mut(task_id).ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        self.check_ownership(task, owner)?;
        task.state = QueueTaskState::Succeeded;
        task.lease_owner = None;
        task.leased_at = None;
        self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
        info!("task {task_id} completed by {owner}");
        Ok(())
    }

    /// Mark a leased task as failed. Re-queues with exponential backoff and
    /// jitter up to `max_attempts`, after which the task moves to `Dead`.
    pub async fn fail(&self, task_id: &str, owner: &str) -> Result<QueueTaskState, QueueError> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get_mut(task_id).ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        self.check_ownership(task, owner)?;

        self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);

        if task.attempts >= task.max_attempts {
            task.state = QueueTaskState::Dead;
            task.lease_owner = None;
            task.leased_at = None;
            warn!("task {task_id} dead-lettered after {} attempts", task.attempts);
            return Ok(QueueTaskState::Dead);
        }

        let backoff_ms = self.backoff_ms(task.attempts);
        task.state = QueueTaskState::Queued;
        task.lease_owner = None;
        task.leased_at = None;
        task.next_visible_at = Utc::now() + ChronoDuration::milliseconds(backoff_ms as i64);

        let heap_entry = HeapEntry {
            task_id: task.task_id.clone(),
            priority: task.priority,
            enqueued_at: task.enqueued_at,
        };
        state.heap.push(heap_entry);

        Ok(QueueTaskState::Queued)
    }

    /// Sweep leases whose owner never called `complete`/`fail` within
    /// `lease_timeout_ms` and return them to `Queued` for a fresh lease.
    pub async fn reap_lost_leases(&self, lease_timeout_ms: u64) -> usize {
        let mut state = self.state.lock().await;
        let cutoff = Utc::now() - ChronoDuration::milliseconds(lease_timeout_ms as i64);
        let mut requeued = 0;

        let lost: Vec<Id> = state
            .tasks
            .values()
            .filter(|t| t.state == QueueTaskState::Leased && t.leased_at.map(|at| at < cutoff).unwrap_or(false))
            .map(|t| t.task_id.clone())
            .collect();

        for task_id in lost {
            if let Some(task) = state.tasks.get_mut(&task_id) {
                task.state = QueueTaskState::Queued;
                task.lease_owner = None;
                task.leased_at = None;
                let heap_entry = HeapEntry {
                    task_id: task.task_id.clone(),
                    priority: task.priority,
                    enqueued_at: task.enqueued_at,
                };
                state.heap.push(heap_entry);
                self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
                requeued += 1;
            }
        }
        requeued
    }

    fn check_ownership(&self, task: &QueueTask, owner: &str) -> Result<(), QueueError> {
        if task.state != QueueTaskState::Leased {
            return Err(QueueError::NotLeased(task.task_id.clone()));
        }
        match &task.lease_owner {
            Some(current) if current == owner => Ok(()),
            _ => Err(QueueError::WrongLeaseOwner {
                task_id: task.task_id.clone(),
                owner: owner.to_string(),
            }),
        }
    }

    /// `base * 2^(attempts-1)` capped at `max_backoff_ms`, with up to 20%
    /// jitter to avoid thundering-herd re-leasing.
    fn backoff_ms(&self, attempts: u32) -> u64 {
        let exp = self.config.base_backoff_ms.saturating_mul(1u64 << attempts.saturating_sub(1).min(20));
        let capped = exp.min(self.config.max_backoff_ms);
        let jitter = (capped / 5).saturating_mul((attempts % 5) as u64) / 5;
        capped.saturating_sub(jitter)
    }

    pub async fn get(&self, task_id: &str) -> Option<QueueTask> {
        self.state.lock().await.tasks.get(task_id).cloned()
    }
}
