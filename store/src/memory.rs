//! In-process queues and sets
//!
//! Messages live in a mutex-protected state shared by every handle opened under the same name, so
//! all tasks of one process see the same queues. Visibility deadlines use `tokio::time::Instant`,
//! which lets tests drive redelivery with a paused clock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{Backend, Message, Queue, QueueKind, QueueOptions, Result, Set, StoreError};

#[derive(Debug, Clone)]
struct Stored {
    seq: u64,
    id: String,
    body: String,
}

#[derive(Debug)]
struct Lease {
    message: Stored,
    pop_token: String,
    visible_at: tokio::time::Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Stored>,
    inflight: HashMap<String, Lease>,
    next_seq: u64,
}

impl QueueState {
    /// Moves messages whose visibility timeout expired back to the pending list
    fn requeue_expired(&mut self, now: tokio::time::Instant) {
        let mut expired: Vec<Stored> = vec![];
        self.inflight.retain(|_, lease| {
            if lease.visible_at <= now {
                expired.push(lease.message.clone());
                false
            } else {
                true
            }
        });
        expired.sort_by_key(|message| message.seq);
        for message in expired {
            tracing::debug!("message {} became visible again", message.id);
            self.pending.push_back(message);
        }
    }
}

#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    kind: QueueKind,
    visibility_timeout: std::time::Duration,
    batch_size: usize,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new(name: &str, kind: QueueKind, options: &QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            kind,
            visibility_timeout: options.visibility_timeout(kind),
            batch_size: std::cmp::max(1, options.batch_size),
            state: Mutex::new(QueueState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> QueueKind {
        self.kind
    }

    async fn enqueue(&self, body: &str) -> Result<()> {
        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push_back(Stored {
            seq,
            id: seq.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn dequeue_batch(&self) -> Result<Vec<Message>> {
        let now = tokio::time::Instant::now();
        let mut state = self.state();
        state.requeue_expired(now);
        let mut batch = vec![];
        while batch.len() < self.batch_size {
            let Some(message) = state.pending.pop_front() else {
                break;
            };
            let pop_token = format!("{:016x}", rand::random::<u64>());
            batch.push(Message {
                id: message.id.clone(),
                pop_token: pop_token.clone(),
                body: message.body.clone(),
            });
            state.inflight.insert(
                message.id.clone(),
                Lease {
                    message,
                    pop_token,
                    visible_at: now + self.visibility_timeout,
                },
            );
        }
        Ok(batch)
    }

    async fn delete(&self, id: &str, pop_token: &str) -> Result<()> {
        let mut state = self.state();
        match state.inflight.get(id) {
            Some(lease) if lease.pop_token == pop_token => {
                state.inflight.remove(id);
                Ok(())
            }
            _ => Err(StoreError::StaleReceipt {
                queue: self.name.clone(),
                id: id.to_string(),
            }),
        }
    }

    async fn is_empty(&self) -> Result<bool> {
        let mut state = self.state();
        state.requeue_expired(tokio::time::Instant::now());
        Ok(state.pending.is_empty())
    }

    async fn approx_size(&self) -> Result<usize> {
        let state = self.state();
        Ok(state.pending.len() + state.inflight.len())
    }

    async fn reset(&self) -> Result<()> {
        let mut state = self.state();
        state.pending.clear();
        state.inflight.clear();
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemorySet {
    name: String,
    members: Mutex<HashSet<String>>,
}

impl MemorySet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: Mutex::new(HashSet::new()),
        }
    }

    fn members(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members().is_empty()
    }
}

#[async_trait::async_trait]
impl Set for MemorySet {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, value: &str) -> Result<bool> {
        Ok(self.members().insert(value.to_string()))
    }

    async fn is_member(&self, value: &str) -> Result<bool> {
        Ok(self.members().contains(value))
    }

    async fn reset(&self) -> Result<()> {
        self.members().clear();
        Ok(())
    }
}

/// Hands out process-wide shared queues and sets keyed by name
#[derive(Debug, Default)]
pub struct MemoryBackend {
    options: QueueOptions,
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    sets: Mutex<HashMap<String, Arc<MemorySet>>>,
}

impl MemoryBackend {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            queues: Mutex::new(HashMap::new()),
            sets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the queue opened under `name`, creating it if needed
    pub fn queue(&self, name: &str, kind: QueueKind) -> Arc<MemoryQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(name, kind, &self.options)))
            .clone()
    }

    /// Returns the set opened under `name`, creating it if needed
    pub fn set(&self, name: &str) -> Arc<MemorySet> {
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        sets.entry(name.to_string())
            .or_insert_with(|| Arc::new(MemorySet::new(name)))
            .clone()
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn open_queue(&self, name: &str, kind: QueueKind) -> Result<Arc<dyn Queue>> {
        Ok(self.queue(name, kind))
    }

    async fn open_set(&self, name: &str) -> Result<Arc<dyn Set>> {
        Ok(self.set(name))
    }
}
