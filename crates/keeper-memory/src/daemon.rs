//! Extraction daemon lifecycle and the per-conversation pipeline.
//!
//! ```text
//! Stopped ──start()──▶ Starting ──first cycle──▶ Running ──stop()──▶ Stopping ──▶ Stopped
//! ```
//!
//! The timer task runs cycles back to back on its own schedule; a tick that
//! falls due while a cycle is still running is dropped, not queued. `stop()`
//! cancels the timer and then waits for any in-flight cycle, so a batch is
//! never cut off between its durable insert and its local commit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use keeper_core::{ConversationId, ConversationRef, ExtractedFact, MemoryFact};
use keeper_llm::{CompletionOptions, CompletionProvider, Embedder, embed_with_timeout, with_timeout};
use keeper_settings::DaemonSettings;
use keeper_store::{CursorAdvance, DurableStore, LocalCache, MessageCursor, NewFact, StoreError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::{MemoryError, Result};
use crate::events::{DaemonEvent, EventEmitter};
use crate::extraction::{extraction_request, parse_candidates, transcript};

/// Lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// No timer armed.
    Stopped,
    /// Migrating the local cache and running the first cycle.
    Starting,
    /// Timer armed.
    Running,
    /// Waiting for the in-flight cycle before stopping.
    Stopping,
}

/// External collaborators, injected at construction.
#[derive(Clone)]
pub struct DaemonDeps {
    /// System of record for conversations and facts.
    pub durable: Arc<dyn DurableStore>,
    /// Cursor table and fact mirror.
    pub cache: LocalCache,
    /// Runs the extraction prompt.
    pub completion: Arc<dyn CompletionProvider>,
    /// Embeds surviving candidates.
    pub embedder: Arc<dyn Embedder>,
}

/// Outcome of one cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Another cycle held the guard; nothing ran.
    pub skipped: bool,
    /// Conversations examined.
    pub conversations: usize,
    /// Facts persisted across all conversations.
    pub facts_persisted: usize,
    /// Conversations whose batch failed and will be retried.
    pub failures: usize,
    /// Cycle-level failure, if the conversation page could not be fetched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time view of the daemon.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    /// Lifecycle state.
    pub state: DaemonState,
    /// Cycles that ran to completion (including ones that failed early).
    pub cycles_completed: u64,
    /// Cycles skipped because another was in flight.
    pub cycles_skipped: u64,
    /// Facts persisted since construction.
    pub facts_persisted: u64,
    /// When the last cycle finished.
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Most recent failure message.
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Stats {
    cycles_completed: u64,
    cycles_skipped: u64,
    facts_persisted: u64,
    last_cycle_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct Inner {
    settings: DaemonSettings,
    deps: DaemonDeps,
    events: EventEmitter,
    cycle_lock: tokio::sync::Mutex<()>,
    state: Mutex<DaemonState>,
    stats: Mutex<Stats>,
}

/// Background fact extraction over recently active conversations.
pub struct ExtractionDaemon {
    inner: Arc<Inner>,
    timer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ExtractionDaemon {
    /// Create a stopped daemon. Out-of-range settings are replaced by
    /// defaults (each correction is logged).
    pub fn new(settings: DaemonSettings, deps: DaemonDeps) -> Self {
        let settings = settings.validated();
        let events = EventEmitter::with_capacity(settings.event_capacity);
        Self {
            inner: Arc::new(Inner {
                settings,
                deps,
                events,
                cycle_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(DaemonState::Stopped),
                stats: Mutex::new(Stats::default()),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Effective (validated) settings.
    pub fn settings(&self) -> &DaemonSettings {
        &self.inner.settings
    }

    /// Receive daemon events. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.inner.events.subscribe()
    }

    /// Migrate the local cache, run one cycle, then arm the timer.
    ///
    /// # Errors
    ///
    /// [`MemoryError::InvalidState`] unless stopped; a migration failure
    /// returns the daemon to `Stopped`.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != DaemonState::Stopped {
                return Err(MemoryError::InvalidState {
                    action: "start",
                    state: *state,
                });
            }
            *state = DaemonState::Starting;
        }

        // Held until the timer is armed, so a concurrent stop() waits for
        // the whole start sequence.
        let _cycle = self.inner.cycle_lock.lock().await;

        let cache = self.inner.deps.cache.clone();
        if let Err(err) = blocking(move || cache.migrate()).await {
            error!(error = %err, "local cache migration failed, daemon not started");
            *self.inner.state.lock() = DaemonState::Stopped;
            return Err(err);
        }

        if *self.inner.state.lock() == DaemonState::Starting {
            let _ = self.inner.cycle().await;
        }

        let mut state = self.inner.state.lock();
        if *state != DaemonState::Starting {
            debug!("stop requested while starting, timer not armed");
            return Ok(());
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(timer_loop(Arc::clone(&self.inner), token.clone()));
        *self.timer.lock() = Some((token, handle));
        *state = DaemonState::Running;
        info!(interval_ms = self.inner.settings.interval_ms, "extraction daemon started");
        Ok(())
    }

    /// Disarm the timer and wait for any in-flight cycle, including a
    /// `start()` that has not finished yet.
    ///
    /// # Errors
    ///
    /// [`MemoryError::InvalidState`] if already stopped or stopping.
    pub async fn stop(&self) -> Result<()> {
        let timer = {
            let mut state = self.inner.state.lock();
            match *state {
                DaemonState::Running | DaemonState::Starting => *state = DaemonState::Stopping,
                other => {
                    return Err(MemoryError::InvalidState {
                        action: "stop",
                        state: other,
                    });
                }
            }
            self.timer.lock().take()
        };

        if let Some((token, handle)) = timer {
            token.cancel();
            if let Err(err) = handle.await {
                warn!(error = %err, "extraction timer task ended abnormally");
            }
        }
        let _cycle = self.inner.cycle_lock.lock().await;
        *self.inner.state.lock() = DaemonState::Stopped;
        info!("extraction daemon stopped");
        Ok(())
    }

    /// Run one cycle now. Returns a skipped report if one is in flight.
    pub async fn run_cycle(&self) -> CycleReport {
        self.inner.run_cycle().await
    }

    /// Process a single conversation outside the timer, returning the
    /// number of facts persisted.
    ///
    /// # Errors
    ///
    /// Any storage, completion, or timeout failure; the cursor is left
    /// unchanged in that case.
    pub async fn process_conversation(&self, conversation: &ConversationRef) -> Result<usize> {
        self.inner.process_conversation(conversation).await
    }

    /// Current state and counters.
    pub fn status(&self) -> DaemonStatus {
        let state = *self.inner.state.lock();
        let stats = self.inner.stats.lock();
        DaemonStatus {
            state,
            cycles_completed: stats.cycles_completed,
            cycles_skipped: stats.cycles_skipped,
            facts_persisted: stats.facts_persisted,
            last_cycle_at: stats.last_cycle_at,
            last_error: stats.last_error.clone(),
        }
    }
}

impl Drop for ExtractionDaemon {
    fn drop(&mut self) {
        if let Some((token, _)) = self.timer.lock().take() {
            token.cancel();
        }
    }
}

async fn timer_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let period = Duration::from_millis(inner.settings.interval_ms);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let _ = inner.run_cycle().await;
            }
        }
    }
    debug!("extraction timer disarmed");
}

impl Inner {
    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.call_timeout_ms)
    }

    async fn run_cycle(&self) -> CycleReport {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            debug!("extraction cycle already in flight, skipping");
            self.stats.lock().cycles_skipped += 1;
            return CycleReport {
                skipped: true,
                ..CycleReport::default()
            };
        };
        self.cycle().await
    }

    /// One pass over recent conversations. Callers hold `cycle_lock`.
    async fn cycle(&self) -> CycleReport {
        let started = Instant::now();
        debug!("extraction cycle started");

        let conversations = match bounded(
            self.call_timeout(),
            "conversation fetch",
            self.deps.durable.recent_conversations(self.settings.conversation_page),
        )
        .await
        {
            Ok(conversations) => conversations,
            Err(err) => return self.cycle_failed(&err),
        };

        let outcomes: Vec<(ConversationId, Result<usize>)> = stream::iter(conversations)
            .map(|conversation| async move {
                let outcome = self.process_conversation(&conversation).await;
                (conversation.id, outcome)
            })
            .buffer_unordered(self.settings.max_concurrency)
            .collect()
            .await;

        let mut report = CycleReport {
            conversations: outcomes.len(),
            ..CycleReport::default()
        };
        let mut last_error = None;
        for (conversation_id, outcome) in outcomes {
            match outcome {
                Ok(persisted) => report.facts_persisted += persisted,
                Err(err) => {
                    report.failures += 1;
                    warn!(
                        conversation_id = %conversation_id,
                        error = %err,
                        "conversation batch failed, cursor unchanged"
                    );
                    let cause = err.to_string();
                    let _ = self.events.emit(DaemonEvent::Error {
                        cause: cause.clone(),
                        conversation_id: Some(conversation_id),
                    });
                    last_error = Some(cause);
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.cycles_completed += 1;
            stats.facts_persisted += u64::try_from(report.facts_persisted).unwrap_or(u64::MAX);
            stats.last_cycle_at = Some(Utc::now());
            if last_error.is_some() {
                stats.last_error = last_error;
            }
        }
        debug!(
            conversations = report.conversations,
            facts = report.facts_persisted,
            failures = report.failures,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "extraction cycle finished"
        );
        report
    }

    fn cycle_failed(&self, err: &MemoryError) -> CycleReport {
        let cause = err.to_string();
        error!(error = %cause, "extraction cycle failed");
        let _ = self.events.emit(DaemonEvent::Error {
            cause: cause.clone(),
            conversation_id: None,
        });
        let mut stats = self.stats.lock();
        stats.cycles_completed += 1;
        stats.last_cycle_at = Some(Utc::now());
        stats.last_error = Some(cause.clone());
        CycleReport {
            error: Some(cause),
            ..CycleReport::default()
        }
    }

    #[instrument(skip_all, fields(conversation_id = %conversation.id))]
    async fn process_conversation(&self, conversation: &ConversationRef) -> Result<usize> {
        let limit = self.call_timeout();

        let cache = self.deps.cache.clone();
        let id = conversation.id.clone();
        let cursor = blocking(move || cache.cursor(&id)).await?;

        let batch = bounded(
            limit,
            "message fetch",
            self.deps.durable.messages_after(
                &conversation.id,
                cursor.as_ref().map(|c| c.position),
                self.settings.batch_size,
            ),
        )
        .await?;
        let Some(last) = batch.last() else {
            debug!("no new messages");
            return Ok(0);
        };

        let request = extraction_request(&transcript(&batch));
        let reply = with_timeout(limit, self.deps.completion.complete(&request, &CompletionOptions::json())).await?;

        let candidates = parse_candidates(&reply.content);
        let found = candidates.len();
        let kept: Vec<ExtractedFact> = candidates
            .into_iter()
            .filter(|c| c.importance >= self.settings.min_importance)
            .collect();

        let mut new_facts = Vec::with_capacity(kept.len());
        for fact in kept {
            match embed_with_timeout(self.deps.embedder.as_ref(), &fact.content, limit).await {
                Some(embedding) => new_facts.push(NewFact {
                    workspace_id: conversation.workspace_id.clone(),
                    conversation_id: conversation.id.clone(),
                    source_message_id: last.id.clone(),
                    fact,
                    embedding,
                }),
                None => warn!(summary = %fact.summary, "embedding failed, dropping candidate"),
            }
        }

        let ids = if new_facts.is_empty() {
            Vec::new()
        } else {
            bounded(limit, "fact insert", self.deps.durable.insert_facts(&new_facts)).await?
        };
        if ids.len() != new_facts.len() {
            return Err(StoreError::InvalidData(format!(
                "fact insert returned {} ids for {} facts",
                ids.len(),
                new_facts.len()
            ))
            .into());
        }

        let now = Utc::now();
        let mirrored: Vec<MemoryFact> = new_facts
            .iter()
            .zip(ids)
            .map(|(fact, id)| fact.to_memory_fact(id, now))
            .collect();
        let persisted = mirrored.len();
        let advance = CursorAdvance {
            conversation_id: conversation.id.clone(),
            workspace_id: conversation.workspace_id.clone(),
            last_processed: MessageCursor {
                message_id: last.id.clone(),
                position: last.position,
            },
            processed: u64::try_from(batch.len()).unwrap_or(u64::MAX),
            at: now,
        };
        let cache = self.deps.cache.clone();
        let _ = blocking(move || cache.commit_batch(&mirrored, &advance)).await?;

        if persisted > 0 {
            let _ = self.events.emit(DaemonEvent::MemoriesExtracted {
                count: persisted,
                conversation_id: conversation.id.clone(),
            });
            info!(messages = batch.len(), candidates = found, persisted, "memories extracted");
        } else {
            debug!(messages = batch.len(), candidates = found, "batch yielded no facts");
        }
        Ok(persisted)
    }
}

async fn bounded<T, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = keeper_store::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(MemoryError::Timeout { operation, limit }),
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> keeper_store::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MemoryError::Task(e.to_string()))?
        .map_err(MemoryError::from)
}
