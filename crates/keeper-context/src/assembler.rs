//! Context assembler: the single entry point for building a model call.
//!
//! Output order:
//!
//! ```text
//! [system] base prompt + protected canon + working memory   (tiers 0, 1)
//! [system] retrieved facts                                  (tier 2, if any)
//! ...history, possibly summarized and shortened...          (tier 3)
//! [user]   the new message
//! ```
//!
//! The new user message is never compressed and always comes last.

use std::sync::Arc;

use keeper_core::{Message, WorkspaceId};
use tracing::debug;

use crate::budget::BudgetStatus;
use crate::canon::ProtectedFactCache;
use crate::compression::{CompressionAction, CompressionEngine, join_blocks};
use crate::constants::{RETRIEVED_HEADING, WORKING_MEMORY_HEADING};
use crate::errors::{ContextError, Result};

/// Everything that goes into one model call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AssemblyRequest {
    /// Fixed instructions for the assistant.
    pub base_system_prompt: String,
    /// Formatted canon block. Filled in by
    /// [`ContextAssembler::build_for_workspace`] when empty.
    pub protected_canon: String,
    /// Current task scratch state.
    pub working_memory: String,
    /// Recalled facts for this turn.
    pub retrieved_facts: String,
    /// Prior conversation, oldest first.
    pub history: Vec<Message>,
    /// The user's new message.
    pub user_message: String,
}

impl AssemblyRequest {
    /// A request carrying only the user's message.
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            ..Self::default()
        }
    }

    /// Set the base system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.base_system_prompt = prompt.into();
        self
    }

    /// Set working memory.
    #[must_use]
    pub fn with_working_memory(mut self, text: impl Into<String>) -> Self {
        self.working_memory = text.into();
        self
    }

    /// Set retrieved facts.
    #[must_use]
    pub fn with_retrieved_facts(mut self, text: impl Into<String>) -> Self {
        self.retrieved_facts = text.into();
        self
    }

    /// Set the conversation history.
    #[must_use]
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.user_message.trim().is_empty() {
            return Err(ContextError::InvalidRequest("user message is empty".into()));
        }
        Ok(())
    }
}

/// The final message list plus what it cost.
#[derive(Clone, Debug, PartialEq)]
pub struct AssembledContext {
    /// Ordered messages for the completion call.
    pub messages: Vec<Message>,
    /// Budget of the tiers (the new user message is not counted).
    pub status: BudgetStatus,
    /// Summary produced while compressing, if any.
    pub summary: Option<String>,
    /// Compression steps that ran.
    pub actions: Vec<CompressionAction>,
}

/// Builds ordered message lists within the token budget.
pub struct ContextAssembler {
    engine: CompressionEngine,
    canon: Option<Arc<ProtectedFactCache>>,
}

impl ContextAssembler {
    /// Create an assembler around a compression engine.
    pub fn new(engine: CompressionEngine) -> Self {
        Self { engine, canon: None }
    }

    /// Attach the canon cache used by [`Self::build_for_workspace`].
    #[must_use]
    pub fn with_canon_cache(mut self, cache: Arc<ProtectedFactCache>) -> Self {
        self.canon = Some(cache);
        self
    }

    /// The compression engine in use.
    pub fn engine(&self) -> &CompressionEngine {
        &self.engine
    }

    /// Assemble `request` into the final message list.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::InvalidRequest`] if the user message is blank.
    /// Internal degradation never produces an error.
    pub async fn build_messages(&self, request: AssemblyRequest) -> Result<AssembledContext> {
        request.validate()?;

        let tier0 = join_blocks(&[request.base_system_prompt.as_str(), request.protected_canon.as_str()]);
        let tier1 = labelled(WORKING_MEMORY_HEADING, &request.working_memory);
        let tier2 = labelled(RETRIEVED_HEADING, &request.retrieved_facts);

        let compressed = self.engine.compress(&tier0, &tier1, &tier2, &request.history).await;

        let mut messages = Vec::with_capacity(compressed.messages.len() + 3);
        let system = join_blocks(&[compressed.system_prompt.as_str(), compressed.working_memory.as_str()]);
        if !system.is_empty() {
            messages.push(Message::system(system));
        }
        if !compressed.retrieved.trim().is_empty() {
            messages.push(Message::system(compressed.retrieved));
        }
        messages.extend(compressed.messages);
        messages.push(Message::user(request.user_message));

        debug!(
            messages = messages.len(),
            tokens = compressed.status.total_tokens,
            usage = compressed.status.usage_percent,
            "context assembled"
        );

        Ok(AssembledContext {
            messages,
            status: compressed.status,
            summary: compressed.summary,
            actions: compressed.actions,
        })
    }

    /// Load the workspace canon through the cache, then assemble.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotConfigured`] without a canon cache, or
    /// whatever [`Self::build_messages`] returns.
    pub async fn build_for_workspace(
        &self,
        workspace_id: &WorkspaceId,
        mut request: AssemblyRequest,
    ) -> Result<AssembledContext> {
        let cache = self.canon.as_ref().ok_or(ContextError::NotConfigured("protected fact cache"))?;
        request.validate()?;
        if request.protected_canon.is_empty() {
            request.protected_canon.clone_from(&cache.load(workspace_id).await.formatted_content);
        }
        self.build_messages(request).await
    }
}

fn labelled(heading: &str, body: &str) -> String {
    if body.trim().is_empty() {
        String::new()
    } else {
        format!("{heading}\n{body}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetAllocator, BudgetThresholds};
    use crate::canon::CanonConfig;
    use crate::compression::CompressionConfig;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use keeper_core::{ConversationId, ConversationMessage, ConversationRef, FactId, FactKind, ProtectedFact, Role};
    use keeper_store::{DurableStore, NewFact};
    use keeper_tokens::CharEstimator;

    fn assembler(max_tokens: usize) -> ContextAssembler {
        let allocator =
            BudgetAllocator::new(max_tokens, BudgetThresholds::default(), Arc::new(CharEstimator::default()));
        ContextAssembler::new(CompressionEngine::new(allocator, CompressionConfig::default()))
    }

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                Message::new(role, format!("h{i:02}{}", ".".repeat(197)))
            })
            .collect()
    }

    struct RulesOnly;

    #[async_trait]
    impl DurableStore for RulesOnly {
        async fn recent_conversations(&self, _limit: usize) -> keeper_store::Result<Vec<ConversationRef>> {
            Ok(vec![])
        }

        async fn messages_after(
            &self,
            _conversation_id: &ConversationId,
            _after: Option<i64>,
            _limit: usize,
        ) -> keeper_store::Result<Vec<ConversationMessage>> {
            Ok(vec![])
        }

        async fn insert_facts(&self, _facts: &[NewFact]) -> keeper_store::Result<Vec<FactId>> {
            Ok(vec![])
        }

        async fn protected_facts(&self, _workspace_id: &WorkspaceId, _limit: usize) -> keeper_store::Result<Vec<ProtectedFact>> {
            Ok(vec![ProtectedFact {
                id: FactId::new(),
                content: "Never share API keys".into(),
                summary: String::new(),
                kind: FactKind::Rule,
                protection_level: 0,
                financial_impact: None,
                importance: 1.0,
            }])
        }
    }

    #[tokio::test]
    async fn orders_tiers_then_history_then_user() {
        let request = AssemblyRequest::new("what next?")
            .with_system_prompt("You are a research assistant.")
            .with_working_memory("task: compare funds")
            .with_retrieved_facts("- prefers index funds")
            .with_history(history(2));
        let out = assembler(128_000).build_messages(request).await.unwrap();

        assert_eq!(out.messages.len(), 5);
        assert_eq!(out.messages[0].role, Role::System);
        assert!(out.messages[0].content.starts_with("You are a research assistant."));
        assert!(out.messages[0].content.contains("## Working Memory\ntask: compare funds"));
        assert_eq!(out.messages[1].content, "## Relevant Memories\n- prefers index funds");
        assert_eq!(out.messages[2].content, history(2)[0].content);
        assert_eq!(out.messages[4], Message::user("what next?"));
        assert!(out.actions.is_empty());
    }

    #[tokio::test]
    async fn empty_blocks_are_omitted() {
        let out = assembler(1000).build_messages(AssemblyRequest::new("hi")).await.unwrap();
        assert_eq!(out.messages, vec![Message::user("hi")]);
        assert_eq!(out.status.total_tokens, 0);
    }

    #[tokio::test]
    async fn blank_user_message_is_rejected() {
        let err = assembler(1000).build_messages(AssemblyRequest::new("  ")).await.unwrap_err();
        assert_matches!(err, ContextError::InvalidRequest(_));
    }

    #[tokio::test]
    async fn hard_limit_history_is_bounded() {
        let request = AssemblyRequest::new("continue").with_history(history(20));
        let out = assembler(1000).build_messages(request).await.unwrap();

        let replayed: Vec<_> = out.messages.iter().filter(|m| m.content.starts_with('h')).collect();
        assert!(replayed.len() <= 5);
        assert_eq!(replayed.last().unwrap().content, history(20)[19].content);
        assert_eq!(out.messages.last().unwrap().content, "continue");
        assert!(out.summary.is_some());
    }

    #[tokio::test]
    async fn canon_survives_pressure_verbatim() {
        let canon = "## Absolute Rules\n- Never share API keys";
        let request = AssemblyRequest {
            protected_canon: canon.into(),
            ..AssemblyRequest::new("go").with_history(history(20))
        };
        let out = assembler(1000).build_messages(request).await.unwrap();
        assert!(out.messages[0].content.contains(canon));
    }

    #[tokio::test]
    async fn build_for_workspace_loads_canon() {
        let store: Arc<dyn DurableStore> = Arc::new(RulesOnly);
        let cache = Arc::new(ProtectedFactCache::new(
            store,
            Arc::new(CharEstimator::default()),
            CanonConfig::default(),
        ));
        let assembler = assembler(128_000).with_canon_cache(cache);
        let out = assembler
            .build_for_workspace(&WorkspaceId::from("ws"), AssemblyRequest::new("hello").with_system_prompt("base"))
            .await
            .unwrap();
        assert_eq!(
            out.messages[0].content,
            "base\n\n## Absolute Rules\n- Never share API keys"
        );
    }

    #[tokio::test]
    async fn build_for_workspace_needs_cache() {
        let err = assembler(1000)
            .build_for_workspace(&WorkspaceId::from("ws"), AssemblyRequest::new("hello"))
            .await
            .unwrap_err();
        assert_matches!(err, ContextError::NotConfigured(_));
    }
}
