//! End-to-end extraction scenarios against in-memory stores and scripted
//! completion/embedding backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use keeper_context::{
    AssemblyRequest, BudgetAllocator, BudgetThresholds, CanonConfig, CompressionConfig, CompressionEngine,
    ContextAssembler, ProtectedFactCache,
};
use keeper_core::{ConversationId, FactKind, Message, Role, WorkspaceId};
use keeper_llm::{Completion, CompletionOptions, CompletionProvider, Embedder, ProviderError, ProviderResult};
use keeper_memory::{DaemonDeps, DaemonEvent, DaemonState, ExtractionDaemon};
use keeper_settings::DaemonSettings;
use keeper_store::{ConnectionConfig, LocalCache, NewProtectedFact, PROTECTION_CANON, SqliteDurableStore, connection};
use keeper_tokens::CharEstimator;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::broadcast::error::TryRecvError;

// ─── Test doubles ───────────────────────────────────────────────────────────

/// Replies with a fixed payload (or fails when none is set) and records
/// every transcript it was shown.
#[derive(Default)]
struct ScriptedProvider {
    reply: Mutex<Option<String>>,
    transcripts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn replying(reply: &str) -> Arc<Self> {
        let provider = Self::default();
        *provider.reply.lock() = Some(reply.to_string());
        Arc::new(provider)
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set_reply(&self, reply: &str) {
        *self.reply.lock() = Some(reply.to_string());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, messages: &[Message], options: &CompletionOptions) -> ProviderResult<Completion> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(*options, CompletionOptions::json());
        if let Some(last) = messages.last() {
            self.transcripts.lock().push(last.content.clone());
        }
        match self.reply.lock().clone() {
            Some(content) => Ok(Completion { content }),
            None => Err(ProviderError::Api {
                status: 503,
                message: "overloaded".into(),
            }),
        }
    }
}

/// Returns a unit vector, except for text containing `UNEMBEDDABLE`.
#[derive(Default)]
struct CountingEmbedder {
    calls: AtomicUsize,
}

impl CountingEmbedder {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        (!text.contains("UNEMBEDDABLE")).then(|| vec![0.6, 0.8])
    }
}

/// Blocks inside `complete` until released.
#[derive(Default)]
struct GatedProvider {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl CompletionProvider for GatedProvider {
    async fn complete(&self, _messages: &[Message], _options: &CompletionOptions) -> ProviderResult<Completion> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Completion { content: "[]".into() })
    }
}

struct Harness {
    durable: Arc<SqliteDurableStore>,
    cache: LocalCache,
    embedder: Arc<CountingEmbedder>,
    workspace: WorkspaceId,
}

impl Harness {
    fn new() -> Self {
        Self {
            durable: Arc::new(SqliteDurableStore::in_memory().unwrap()),
            cache: LocalCache::in_memory().unwrap(),
            embedder: Arc::new(CountingEmbedder::default()),
            workspace: WorkspaceId::from("ws-trading"),
        }
    }

    fn daemon(&self, completion: Arc<dyn CompletionProvider>, settings: DaemonSettings) -> ExtractionDaemon {
        let deps = DaemonDeps {
            durable: self.durable.clone(),
            cache: self.cache.clone(),
            completion,
            embedder: self.embedder.clone(),
        };
        ExtractionDaemon::new(settings, deps)
    }

    fn conversation(&self, turns: &[&str]) -> ConversationId {
        let id = self.durable.create_conversation(&self.workspace, Some("session")).unwrap();
        for (i, turn) in turns.iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            let _ = self.durable.append_message(&id, role, turn).unwrap();
        }
        id
    }
}

const TWO_FACTS: &str = r#"[
  {"content":"User never holds options through earnings","summary":"no options through earnings","kind":"rule","importance":0.9},
  {"content":"User prefers limit orders on illiquid names","summary":"limit orders on illiquid names","kind":"preference","importance":0.5}
]"#;

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_is_persisted_mirrored_and_announced() {
    let h = Harness::new();
    let conv = h.conversation(&["I got burned holding calls into earnings", "Noted.", "Also use limits on small caps"]);
    let provider = ScriptedProvider::replying(TWO_FACTS);
    let daemon = h.daemon(provider.clone(), DaemonSettings::default());
    let mut rx = daemon.subscribe();

    let report = daemon.run_cycle().await;
    assert_eq!(report.conversations, 1);
    assert_eq!(report.facts_persisted, 2);
    assert_eq!(report.failures, 0);

    assert_eq!(
        rx.try_recv().unwrap(),
        DaemonEvent::MemoriesExtracted {
            count: 2,
            conversation_id: conv.clone(),
        }
    );
    assert_eq!(h.durable.fact_count(&conv).unwrap(), 2);

    let mirrored = h.cache.facts_for_conversation(&conv).unwrap();
    assert_eq!(mirrored.len(), 2);
    assert!(mirrored.iter().all(|f| f.embedding == vec![0.6_f32, 0.8]));
    assert!(mirrored.iter().any(|f| f.kind == FactKind::Rule));

    let state = h.cache.extraction_state(&conv).unwrap().unwrap();
    assert_eq!(state.messages_processed_count, 3);
    assert_eq!(state.workspace_id, h.workspace);

    let transcripts = provider.transcripts.lock();
    let transcript = &transcripts[0];
    let first = transcript.find("burned").unwrap();
    let last = transcript.find("small caps").unwrap();
    assert!(first < last, "transcript must be oldest first");

    assert_eq!(daemon.status().facts_persisted, 2);
}

#[tokio::test]
async fn reprocessing_without_new_messages_is_a_no_op() {
    let h = Harness::new();
    let conv = h.conversation(&["remember: stops at 2%"]);
    let provider = ScriptedProvider::replying(TWO_FACTS);
    let daemon = h.daemon(provider.clone(), DaemonSettings::default());

    let _ = daemon.run_cycle().await;
    let cursor = h.cache.cursor(&conv).unwrap();
    let facts = h.durable.fact_count(&conv).unwrap();

    let second = daemon.run_cycle().await;
    assert_eq!(second.facts_persisted, 0);
    assert_eq!(provider.calls(), 1);
    assert_eq!(h.cache.cursor(&conv).unwrap(), cursor);
    assert_eq!(h.durable.fact_count(&conv).unwrap(), facts);
}

#[tokio::test]
async fn low_importance_candidates_are_never_embedded() {
    let h = Harness::new();
    let conv = h.conversation(&["nice weather today"]);
    let reply = r#"[{"content":"weather is nice","importance":0.1},{"content":"user said hi","importance":0.29}]"#;
    let daemon = h.daemon(ScriptedProvider::replying(reply), DaemonSettings::default());

    let report = daemon.run_cycle().await;
    assert_eq!(report.facts_persisted, 0);
    assert_eq!(h.embedder.calls(), 0);
    assert_eq!(h.durable.fact_count(&conv).unwrap(), 0);
    // the batch was still consumed
    assert!(h.cache.cursor(&conv).unwrap().is_some());
}

#[tokio::test]
async fn candidate_at_threshold_is_kept() {
    let h = Harness::new();
    let conv = h.conversation(&["x"]);
    let reply = r#"[{"content":"exactly at the floor","importance":0.3}]"#;
    let daemon = h.daemon(ScriptedProvider::replying(reply), DaemonSettings::default());
    let _ = daemon.run_cycle().await;
    assert_eq!(h.durable.fact_count(&conv).unwrap(), 1);
}

#[tokio::test]
async fn failed_embedding_is_dropped_everywhere() {
    let h = Harness::new();
    let conv = h.conversation(&["two lessons today"]);
    let reply = r#"[
      {"content":"Size down after two losing days","importance":0.8},
      {"content":"UNEMBEDDABLE lesson","importance":0.8}
    ]"#;
    let daemon = h.daemon(ScriptedProvider::replying(reply), DaemonSettings::default());

    let report = daemon.run_cycle().await;
    assert_eq!(report.facts_persisted, 1);
    assert_eq!(h.embedder.calls(), 2);
    assert_eq!(h.durable.fact_count(&conv).unwrap(), 1);

    let mirrored = h.cache.facts_for_conversation(&conv).unwrap();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].content, "Size down after two losing days");
}

#[tokio::test]
async fn fresh_daemon_on_empty_conversation_creates_no_state() {
    let h = Harness::new();
    let conv = h.conversation(&[]);
    let provider = ScriptedProvider::replying(TWO_FACTS);
    let daemon = h.daemon(provider.clone(), DaemonSettings::default());
    let mut rx = daemon.subscribe();

    daemon.start().await.unwrap();
    assert_eq!(daemon.status().state, DaemonState::Running);
    assert_eq!(daemon.status().cycles_completed, 1);

    assert!(h.cache.extraction_state(&conv).unwrap().is_none());
    assert_matches!(rx.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(provider.calls(), 0);

    daemon.stop().await.unwrap();
    assert_eq!(daemon.status().state, DaemonState::Stopped);
}

#[tokio::test]
async fn completion_failure_leaves_cursor_for_retry() {
    let h = Harness::new();
    let conv = h.conversation(&["a lesson worth keeping"]);
    let provider = ScriptedProvider::failing();
    let daemon = h.daemon(provider.clone(), DaemonSettings::default());
    let mut rx = daemon.subscribe();

    let report = daemon.run_cycle().await;
    assert_eq!(report.failures, 1);
    assert!(h.cache.cursor(&conv).unwrap().is_none());
    assert_matches!(
        rx.try_recv(),
        Ok(DaemonEvent::Error { conversation_id: Some(id), .. }) if id == conv
    );
    assert!(daemon.status().last_error.unwrap().contains("overloaded"));

    provider.set_reply(TWO_FACTS);
    let retry = daemon.run_cycle().await;
    assert_eq!(retry.facts_persisted, 2);
    assert!(h.cache.cursor(&conv).unwrap().is_some());
}

#[tokio::test]
async fn malformed_reply_consumes_the_batch() {
    let h = Harness::new();
    let conv = h.conversation(&["hello", "hi there"]);
    let daemon = h.daemon(ScriptedProvider::replying("Sorry, I can't help with that."), DaemonSettings::default());
    let mut rx = daemon.subscribe();

    let report = daemon.run_cycle().await;
    assert_eq!(report.failures, 0);
    assert_eq!(report.facts_persisted, 0);
    assert_matches!(rx.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(h.cache.extraction_state(&conv).unwrap().unwrap().messages_processed_count, 2);
}

#[tokio::test]
async fn cursor_walks_forward_in_batches() {
    let h = Harness::new();
    let conv = h.conversation(&["m1", "m2", "m3", "m4", "m5"]);
    let provider = ScriptedProvider::replying("[]");
    let settings = DaemonSettings {
        batch_size: 2,
        ..DaemonSettings::default()
    };
    let daemon = h.daemon(provider.clone(), settings);

    let mut positions = Vec::new();
    for _ in 0..4 {
        let _ = daemon.run_cycle().await;
        positions.push(h.cache.cursor(&conv).unwrap().unwrap().position);
    }
    assert!(positions.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(positions[2], positions[3], "nothing left after three batches");
    assert_eq!(provider.calls(), 3);
    assert_eq!(h.cache.extraction_state(&conv).unwrap().unwrap().messages_processed_count, 5);

    let transcripts = provider.transcripts.lock();
    assert!(transcripts[0].contains("m1") && transcripts[0].contains("m2") && !transcripts[0].contains("m3"));
    assert!(transcripts[1].contains("m3") && !transcripts[1].contains("m2"));
    assert!(transcripts[2].contains("m5"));
}

#[tokio::test]
async fn overlapping_cycle_is_skipped() {
    let h = Harness::new();
    let _conv = h.conversation(&["slow one"]);
    let provider = Arc::new(GatedProvider::default());
    let daemon = Arc::new(h.daemon(provider.clone(), DaemonSettings::default()));

    let background = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.run_cycle().await })
    };
    provider.entered.notified().await;

    let overlapped = daemon.run_cycle().await;
    assert!(overlapped.skipped);
    assert_eq!(daemon.status().cycles_skipped, 1);

    provider.release.notify_one();
    let first = background.await.unwrap();
    assert!(!first.skipped);
    assert_eq!(first.conversations, 1);
    assert_eq!(daemon.status().cycles_completed, 1);
}

#[tokio::test]
async fn stop_waits_for_in_flight_cycle() {
    let h = Harness::new();
    let conv = h.conversation(&[]);
    let provider = Arc::new(GatedProvider::default());
    let daemon = Arc::new(h.daemon(provider.clone(), DaemonSettings::default()));
    daemon.start().await.unwrap();

    let _ = h.durable.append_message(&conv, Role::User, "pending").unwrap();
    let cycle = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.run_cycle().await })
    };
    provider.entered.notified().await;

    let stopper = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.stop().await })
    };
    for _ in 0..100 {
        if daemon.status().state == DaemonState::Stopping {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(daemon.status().state, DaemonState::Stopping);
    assert!(!stopper.is_finished());

    provider.release.notify_one();
    assert!(!cycle.await.unwrap().skipped);
    stopper.await.unwrap().unwrap();
    assert_eq!(daemon.status().state, DaemonState::Stopped);
    assert!(h.cache.cursor(&conv).unwrap().is_some());
}

#[tokio::test]
async fn stop_during_migration_prevents_any_cycle() {
    // Single-connection pool: holding its connection stalls the start-up
    // migration until released.
    let pool = connection::new_in_memory(&ConnectionConfig::default()).unwrap();
    let h = Harness {
        cache: LocalCache::from_pool(pool.clone()).unwrap(),
        ..Harness::new()
    };
    let conv = h.conversation(&["always size positions at 1% risk"]);
    let provider = ScriptedProvider::replying(TWO_FACTS);
    let daemon = Arc::new(h.daemon(provider.clone(), DaemonSettings::default()));

    let held = pool.get().unwrap();
    let starter = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.start().await })
    };
    for _ in 0..100 {
        if daemon.status().state == DaemonState::Starting {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(daemon.status().state, DaemonState::Starting);

    let stopper = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.stop().await })
    };
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
    assert_eq!(daemon.status().state, DaemonState::Stopping);
    assert!(!stopper.is_finished(), "stop must wait for the start sequence");

    drop(held);
    starter.await.unwrap().unwrap();
    stopper.await.unwrap().unwrap();

    assert_eq!(daemon.status().state, DaemonState::Stopped);
    assert_eq!(daemon.status().cycles_completed, 0);
    assert_eq!(provider.calls(), 0);
    assert!(h.cache.cursor(&conv).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn timer_picks_up_new_messages() {
    let h = Harness::new();
    let conv = h.conversation(&[]);
    let daemon = h.daemon(ScriptedProvider::replying(TWO_FACTS), DaemonSettings::default());
    let mut rx = daemon.subscribe();
    daemon.start().await.unwrap();

    let _ = h.durable.append_message(&conv, Role::User, "lesson: respect the stop").unwrap();
    let event = tokio::time::timeout(Duration::from_secs(60), rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        DaemonEvent::MemoriesExtracted {
            count: 2,
            conversation_id: conv,
        }
    );
    assert!(daemon.status().cycles_completed >= 2);
    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn extracted_and_canon_facts_reach_the_prompt() {
    let h = Harness::new();
    let conv = h.conversation(&["never average down on a loser", "understood"]);
    let daemon = h.daemon(ScriptedProvider::replying(TWO_FACTS), DaemonSettings::default());
    let _ = daemon.run_cycle().await;

    let _ = h
        .durable
        .add_protected_fact(
            &h.workspace,
            &NewProtectedFact {
                content: "Never average down on a losing position".into(),
                summary: "no averaging down".into(),
                kind: FactKind::Lesson,
                protection_level: PROTECTION_CANON,
                financial_impact: Some(-1250.0),
                importance: 1.0,
            },
        )
        .unwrap();

    let hits = h.cache.search_summaries(Some(&h.workspace), "earnings", 5).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].conversation_id, conv);

    let estimator = Arc::new(CharEstimator::default());
    let canon = Arc::new(ProtectedFactCache::new(h.durable.clone(), estimator.clone(), CanonConfig::default()));
    let allocator = BudgetAllocator::new(8_000, BudgetThresholds::default(), estimator);
    let assembler =
        ContextAssembler::new(CompressionEngine::new(allocator, CompressionConfig::default())).with_canon_cache(canon);

    let retrieved = hits.iter().map(|f| format!("- {}", f.summary)).collect::<Vec<_>>().join("\n");
    let request = AssemblyRequest::new("should I hold these calls through earnings?")
        .with_system_prompt("You are a trading copilot.")
        .with_retrieved_facts(retrieved);
    let assembled = assembler.build_for_workspace(&h.workspace, request).await.unwrap();

    let system = &assembled.messages[0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.contains("You are a trading copilot."));
    assert!(system.content.contains("Never average down on a losing position"));
    assert!(assembled.messages.iter().any(|m| m.content.contains("no options through earnings")));
    assert_eq!(assembled.messages.last().unwrap().role, Role::User);
}
