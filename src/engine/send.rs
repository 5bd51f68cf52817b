use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{HISTORY_WINDOW, SessionEngine};
use crate::billing::{Beneficiary, BillingLedger};
use crate::cache::last_reply_key;
use crate::error::{ChatError, ChatResult};
use crate::llm::{ChatTurn, ChunkFn, GenerationRequest};
use crate::models::ModelConfig;
use crate::persona::{Persona, Preset};
use crate::prompt::{PromptComposer, join_memories};
use crate::session::{ChatMessage, ChatSession, MessageRole};
use crate::storage::SessionStore;

/// Case-insensitive keyword that turns a user message into a memory note.
pub const MEMORY_TRIGGER: &str = "remember";
pub const REASONING_METADATA_KEY: &str = "reasoning_text";

pub type ChunkSink<'a> = &'a mut ChunkFn<'a>;

impl SessionEngine {
    /// Appends the user turn, generates and persists a billed reply, and
    /// returns the conversation including the new reply.
    pub async fn send_message(
        &self,
        user_id: &str,
        session_id: Uuid,
        content: &str,
        preset: Option<&Preset>,
    ) -> ChatResult<Vec<ChatMessage>> {
        self.send_internal(user_id, session_id, content, preset, None).await
    }

    /// Like `send_message`, forwarding `(content, reasoning)` deltas to
    /// `on_chunk` in arrival order. Dropping the returned future during
    /// generation persists no reply and bills nothing; once generation has
    /// finished the reply is stored and billed regardless.
    pub async fn send_message_stream(
        &self,
        user_id: &str,
        session_id: Uuid,
        content: &str,
        preset: Option<&Preset>,
        on_chunk: ChunkSink<'_>,
    ) -> ChatResult<Vec<ChatMessage>> {
        self.send_internal(user_id, session_id, content, preset, Some(on_chunk)).await
    }

    async fn send_internal(
        &self,
        user_id: &str,
        session_id: Uuid,
        content: &str,
        preset: Option<&Preset>,
        on_chunk: Option<ChunkSink<'_>>,
    ) -> ChatResult<Vec<ChatMessage>> {
        if content.trim().is_empty() {
            return Err(ChatError::Validation("empty message".into()));
        }
        let session = self.owned_session(user_id, session_id).await?;
        let persona = self.persona(&session.persona_id).await?;
        let model = self.resolver.resolve(&session.model_key).await?;
        let price = model.price();

        let user_msg = ChatMessage::new(session.id, MessageRole::User, content);
        self.store.sessions.append_message(&user_msg).await?;
        self.ledger.precheck(user_id, price).await?;

        let mut history = self.store.sessions.list_messages(session.id, HISTORY_WINDOW).await?;
        let turns: Vec<ChatTurn> = history.iter().map(ChatTurn::from).collect();
        let prompt = self.compose_prompt(user_id, &session, &persona, preset).await;
        self.log_prompt(&session, user_id, &model, content, &prompt, &turns);

        let req = GenerationRequest::new(&prompt, &model, &turns)
            .with_sampling(session.settings.temperature, session.settings.max_tokens);
        let (reply, reasoning) = self.generate(&session, req, on_chunk).await?;

        let mut bot = ChatMessage::new(session.id, MessageRole::Assistant, reply);
        if !reasoning.is_empty() {
            bot.metadata.insert(REASONING_METADATA_KEY.into(), reasoning.into());
        }
        let charge = Charge::new(user_id, &persona.id, price, beneficiaries(&model, &persona, preset));
        self.commit_reply(ReplyWrite::Append(bot.clone()), charge).await?;

        self.remember_reply(session.id, &bot.content).await;
        self.maybe_store_memory(user_id, &persona.id, content).await;

        history.push(bot);
        match self.store.sessions.count_messages(session.id).await {
            Ok(count) if super::summarize::should_summarize(count) => {
                let snapshot = history.iter().map(ChatTurn::from).collect();
                self.summarizer.schedule(session.id, session.model_key.clone(), snapshot);
            }
            Ok(_) => {}
            Err(e) => debug!(session_id = %session.id, error = %e, "message count unavailable"),
        }
        info!(session_id = %session.id, user_id = %user_id, model = %model.id, price, "reply sent");
        Ok(history)
    }

    /// Regenerates an assistant reply in place. The model never sees the
    /// reply being replaced; id and position are kept.
    pub async fn retry_assistant_message(&self, user_id: &str, message_id: Uuid) -> ChatResult<Vec<ChatMessage>> {
        let session = self.owned_session_by_message(user_id, message_id).await?;
        let mut history = self.store.sessions.list_messages(session.id, HISTORY_WINDOW).await?;
        let idx = history.iter().position(|m| m.id == message_id).ok_or(ChatError::NotFound("message"))?;
        if history[idx].role != MessageRole::Assistant {
            return Err(ChatError::Validation("only assistant replies can be retried".into()));
        }

        let persona = self.persona(&session.persona_id).await?;
        let model = self.resolver.resolve(&session.model_key).await?;
        let price = model.price();
        self.ledger.precheck(user_id, price).await?;

        let prompt = self.compose_prompt(user_id, &session, &persona, None).await;
        let turns: Vec<ChatTurn> =
            history.iter().enumerate().filter(|(i, _)| *i != idx).map(|(_, m)| ChatTurn::from(m)).collect();
        self.log_prompt(&session, user_id, &model, &history[idx].content, &prompt, &turns);

        let req = GenerationRequest::new(&prompt, &model, &turns)
            .with_sampling(session.settings.temperature, session.settings.max_tokens);
        let (reply, _) = self.generate(&session, req, None).await?;

        let previous = history[idx].clone();
        let mut next = previous.clone();
        next.content = reply;
        next.metadata.remove(REASONING_METADATA_KEY);
        let charge = Charge::new(user_id, &persona.id, price, beneficiaries(&model, &persona, None));
        self.commit_reply(ReplyWrite::Replace { previous, next: next.clone() }, charge).await?;
        history[idx] = next;

        self.remember_reply(session.id, &history[idx].content).await;
        info!(session_id = %session.id, user_id = %user_id, message_id = %message_id, model = %model.id, "reply regenerated");
        Ok(history)
    }

    /// The most recent reply for a session, if still cached.
    pub async fn last_reply(&self, user_id: &str, session_id: Uuid) -> ChatResult<Option<String>> {
        let session = self.owned_session(user_id, session_id).await?;
        match self.store.cache.fetch(&last_reply_key(session.id)).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                debug!(session_id = %session.id, error = %e, "reply cache read failed");
                Ok(None)
            }
        }
    }

    async fn compose_prompt(
        &self,
        user_id: &str,
        session: &ChatSession,
        persona: &Persona,
        preset: Option<&Preset>,
    ) -> String {
        let world = self.world(&persona.id).await;
        let retrieval = match self.store.retriever.retrieve_context(&persona.id).await {
            Ok(text) => text,
            Err(e) => {
                debug!(persona_id = %persona.id, error = %e, "retrieval failed");
                String::new()
            }
        };
        let memories = match self.store.memories.list_memories(user_id, &persona.id).await {
            Ok(notes) => join_memories(notes.iter().map(|m| m.content.as_str())),
            Err(e) => {
                debug!(persona_id = %persona.id, error = %e, "memory lookup failed");
                String::new()
            }
        };
        PromptComposer::new(persona, &session.settings, session.mode)
            .world(world.as_ref())
            .retrieval(&retrieval)
            .memories(&memories)
            .summary(&session.summary)
            .preset(preset)
            .compose()
    }

    /// Returns `(reply, reasoning)`.
    async fn generate(
        &self,
        session: &ChatSession,
        req: GenerationRequest<'_>,
        on_chunk: Option<ChunkSink<'_>>,
    ) -> ChatResult<(String, String)> {
        let res = match on_chunk {
            Some(forward) => {
                let mut reply = String::new();
                let mut reasoning = String::new();
                let streamed = self
                    .gateway
                    .stream_generate(req, &mut |delta: &str, thought: &str| {
                        reply.push_str(delta);
                        reasoning.push_str(thought);
                        forward(delta, thought);
                    })
                    .await;
                streamed.map(|()| (reply, reasoning))
            }
            None => self.gateway.generate(req).await.map(|reply| (reply, String::new())),
        };
        res.map_err(|source| {
            warn!(
                session_id = %session.id,
                model = %req.model.id,
                provider = %req.model.provider,
                error = %source,
                "generation failed"
            );
            ChatError::Provider { model: req.model.id.clone(), source }
        })
    }

    /// Persists the reply and settles its charge on a detached task, so
    /// dropping the caller cannot separate the two. A failed settle undoes the
    /// write.
    async fn commit_reply(&self, write: ReplyWrite, charge: Charge) -> ChatResult<()> {
        let sessions = self.store.sessions.clone();
        let ledger = self.ledger.clone();
        let task = tokio::spawn(async move { write.commit(sessions, &ledger, &charge).await });
        task.await.map_err(|e| ChatError::Storage(anyhow::anyhow!("reply commit task failed: {e}")))?
    }

    async fn remember_reply(&self, session_id: Uuid, reply: &str) {
        let key = last_reply_key(session_id);
        if let Err(e) = self.store.cache.remember(&key, reply, self.options.reply_cache_ttl).await {
            debug!(session_id = %session_id, error = %e, "reply cache write failed");
        }
    }

    async fn maybe_store_memory(&self, user_id: &str, persona_id: &str, content: &str) {
        if content.trim().is_empty() || !content.to_lowercase().contains(MEMORY_TRIGGER) {
            return;
        }
        match self.store.memories.append_memory(user_id, persona_id, content).await {
            Ok(capsule) => debug!(user_id = %user_id, persona_id = %persona_id, memory_id = %capsule.id, "memory stored"),
            Err(e) => warn!(user_id = %user_id, persona_id = %persona_id, error = %e, "failed to store memory"),
        }
    }

    fn log_prompt(
        &self,
        session: &ChatSession,
        user_id: &str,
        model: &ModelConfig,
        content: &str,
        prompt: &str,
        turns: &[ChatTurn],
    ) {
        if !self.options.debug_prompt {
            return;
        }
        let transcript: String = turns.iter().map(|t| format!("[{}] {}\n", t.role, t.content)).collect();
        debug!(
            session_id = %session.id,
            user_id = %user_id,
            model = %model.id,
            content = %content,
            prompt = %prompt,
            history = %transcript,
            "composed prompt"
        );
    }
}

struct Charge {
    user_id: String,
    persona_id: String,
    price: i64,
    beneficiaries: Vec<Beneficiary>,
}

impl Charge {
    fn new(user_id: &str, persona_id: &str, price: i64, beneficiaries: Vec<Beneficiary>) -> Self {
        Self { user_id: user_id.to_string(), persona_id: persona_id.to_string(), price, beneficiaries }
    }
}

/// How a generated reply lands in the session.
enum ReplyWrite {
    Append(ChatMessage),
    /// Retry: `next` takes the place of `previous`, keeping id and position.
    Replace { previous: ChatMessage, next: ChatMessage },
}

impl ReplyWrite {
    async fn commit(self, sessions: Arc<dyn SessionStore>, ledger: &BillingLedger, charge: &Charge) -> ChatResult<()> {
        match &self {
            ReplyWrite::Append(bot) => sessions.append_message(bot).await?,
            ReplyWrite::Replace { next, .. } => {
                if !sessions.replace_message(next).await? {
                    return Err(ChatError::NotFound("message"));
                }
            }
        }
        if let Err(e) = ledger.settle(&charge.user_id, &charge.persona_id, charge.price, &charge.beneficiaries).await {
            // An unbilled reply must not survive.
            self.undo(sessions.as_ref()).await;
            return Err(e);
        }
        Ok(())
    }

    async fn undo(&self, sessions: &dyn SessionStore) {
        let (msg, res) = match self {
            ReplyWrite::Append(bot) => (bot, sessions.delete_message(bot.session_id, bot.id).await),
            ReplyWrite::Replace { previous, .. } => (previous, sessions.replace_message(previous).await),
        };
        if let Err(e) = res {
            warn!(session_id = %msg.session_id, message_id = %msg.id, error = %e, "failed to roll back unbilled reply");
        }
    }
}

fn beneficiaries(model: &ModelConfig, persona: &Persona, preset: Option<&Preset>) -> Vec<Beneficiary> {
    let (role_pct, preset_pct) = model.revenue_shares();
    let mut out = vec![Beneficiary::persona_creator(&persona.creator_id, role_pct)];
    if let Some(p) = preset {
        out.push(Beneficiary::preset_creator(&p.creator_id, preset_pct));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::FutureExt;

    use super::super::testkit::*;
    use super::super::{Collaborators, EngineOptions};
    use super::*;
    use crate::cache::InMemoryReplyCache;
    use crate::persona::PresetBlock;
    use crate::storage::{CreatorWallet, MemoryStore, RevenueEvent, SessionStore, SqliteStore, WalletStore};

    /// Wallet whose debit stalls, leaving a window between reply write and charge.
    struct SlowDebit(Arc<SqliteStore>);

    #[async_trait]
    impl WalletStore for SlowDebit {
        async fn balance(&self, user_id: &str) -> anyhow::Result<i64> {
            self.0.balance(user_id).await
        }
        async fn set_balance(&self, user_id: &str, balance: i64) -> anyhow::Result<()> {
            self.0.set_balance(user_id, balance).await
        }
        async fn debit_if_sufficient(&self, user_id: &str, amount: i64) -> anyhow::Result<Option<i64>> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.0.debit_if_sufficient(user_id, amount).await
        }
        async fn record_revenue(&self, event: &RevenueEvent) -> anyhow::Result<CreatorWallet> {
            self.0.record_revenue(event).await
        }
        async fn creator_wallet(&self, creator_id: &str) -> anyhow::Result<CreatorWallet> {
            self.0.creator_wallet(creator_id).await
        }
        async fn list_revenue_events(&self, creator_id: &str, limit: u32) -> anyhow::Result<Vec<RevenueEvent>> {
            self.0.list_revenue_events(creator_id, limit).await
        }
    }

    async fn paid_session(h: &Harness, price: i64, balance: i64) -> ChatSession {
        h.add_model(ModelConfig { is_default: true, ..paid_model("gpt", price) }).await;
        h.store.set_balance("u1", balance).await.unwrap();
        h.engine.start_session("u1", "nova", "", "").await.unwrap()
    }

    #[tokio::test]
    async fn blank_content_is_rejected_without_side_effects() {
        let h = Harness::new(ScriptedGateway::echo()).await;
        let session = h.engine.start_session("u1", "nova", "", "").await.unwrap();
        for content in ["", "   ", "\n\t"] {
            let err = h.engine.send_message("u1", session.id, content, None).await.unwrap_err();
            assert!(matches!(err, ChatError::Validation(_)));
        }
        assert_eq!(h.store.count_messages(session.id).await.unwrap(), 0);
        assert!(h.gateway.chat_calls().is_empty());
    }

    #[tokio::test]
    async fn send_bills_price_and_credits_floored_shares() {
        let h = Harness::new(ScriptedGateway::echo()).await;
        let session = paid_session(&h, 10, 25).await;
        let preset = Preset {
            creator_id: "preset-author".into(),
            blocks: vec![PresetBlock { content: "Speak as {{char}}.".into(), enabled: true, ..Default::default() }],
            ..Default::default()
        };

        let msgs = h.engine.send_message("u1", session.id, "hello", Some(&preset)).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, MessageRole::User);
        assert_eq!(msgs[1].role, MessageRole::Assistant);
        assert_eq!(msgs[1].content, "reply 1 to hello");

        assert_eq!(h.store.balance("u1").await.unwrap(), 15);
        assert_eq!(h.store.creator_wallet("creator-nova").await.unwrap().total_earned, 3);
        assert_eq!(h.store.creator_wallet("preset-author").await.unwrap().total_earned, 2);
        assert_eq!(h.engine.last_reply("u1", session.id).await.unwrap().as_deref(), Some("reply 1 to hello"));

        let call = &h.gateway.chat_calls()[0];
        assert_eq!(call.model_id, "gpt");
        assert!(call.instruction.ends_with("Speak as Nova."));
        assert_eq!(call.temperature, Some(0.7));
        assert_eq!(call.turns, vec![ChatTurn::new(MessageRole::User, "hello")]);
    }

    #[tokio::test]
    async fn provider_failure_persists_nothing_and_bills_nothing() {
        let h = Harness::new(ScriptedGateway::failing()).await;
        let session = paid_session(&h, 10, 25).await;
        let err = h.engine.send_message("u1", session.id, "hello", None).await.unwrap_err();
        assert!(matches!(err, ChatError::Provider { ref model, .. } if model == "gpt"));
        assert_eq!(h.store.balance("u1").await.unwrap(), 25);
        let history = h.engine.history("u1", session.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn insufficient_balance_keeps_user_turn() {
        let h = Harness::new(ScriptedGateway::echo()).await;
        let session = paid_session(&h, 10, 5).await;
        let err = h.engine.send_message("u1", session.id, "hello", None).await.unwrap_err();
        assert!(matches!(err, ChatError::InsufficientBalance { required: 10 }));
        let history = h.engine.history("u1", session.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hello");
        assert!(h.gateway.chat_calls().is_empty());
        assert_eq!(h.store.balance("u1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn balance_drained_mid_generation_rolls_back_reply() {
        let h = Harness::build(|store| {
            ScriptedGateway::with_hook(Arc::new(move || {
                let store = store.clone();
                async move { store.set_balance("u1", 0).await.unwrap() }.boxed()
            }))
        })
        .await;
        let session = paid_session(&h, 10, 25).await;
        let err = h.engine.send_message("u1", session.id, "hello", None).await.unwrap_err();
        assert!(matches!(err, ChatError::InsufficientBalance { .. }));
        let history = h.engine.history("u1", session.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(h.store.creator_wallet("creator-nova").await.unwrap().total_earned, 0);
    }

    #[tokio::test]
    async fn stream_forwards_chunks_and_keeps_reasoning() {
        let h = Harness::new(ScriptedGateway::echo()).await;
        let session = h.engine.start_session("u1", "nova", "", "").await.unwrap();
        let mut content = String::new();
        let mut chunks = 0;
        let msgs = h
            .engine
            .send_message_stream("u1", session.id, "hi there", None, &mut |c: &str, _r: &str| {
                content.push_str(c);
                chunks += 1;
            })
            .await
            .unwrap();
        assert_eq!(chunks, 3);
        assert_eq!(content, "reply 1 to hi there");
        let bot = &msgs[1];
        assert_eq!(bot.content, content);
        assert_eq!(bot.metadata[REASONING_METADATA_KEY], "thinking...");

        let stored = h.engine.history("u1", session.id).await.unwrap();
        assert_eq!(stored[1].metadata[REASONING_METADATA_KEY], "thinking...");
    }

    #[tokio::test]
    async fn retry_excludes_target_and_keeps_position() {
        let h = Harness::new(ScriptedGateway::echo()).await;
        let session = paid_session(&h, 4, 100).await;
        h.engine.send_message("u1", session.id, "first", None).await.unwrap();
        let msgs = h.engine.send_message("u1", session.id, "second", None).await.unwrap();
        let target = msgs[1].clone();
        assert_eq!(target.content, "reply 1 to first");

        let after = h.engine.retry_assistant_message("u1", target.id).await.unwrap();
        let call = h.gateway.chat_calls().pop().unwrap();
        assert_eq!(call.turns.len(), 3);
        assert!(call.turns.iter().all(|t| t.content != target.content));

        assert_eq!(after.len(), 4);
        assert_eq!(after[1].id, target.id);
        assert_ne!(after[1].content, target.content);
        let stored = h.engine.history("u1", session.id).await.unwrap();
        assert_eq!(stored.iter().map(|m| m.id).collect::<Vec<_>>(), msgs.iter().map(|m| m.id).collect::<Vec<_>>());
        assert_eq!(stored[1].content, after[1].content);

        // Three billed generations at price 4; the retry credits only the persona creator.
        assert_eq!(h.store.balance("u1").await.unwrap(), 88);
        assert_eq!(h.store.creator_wallet("creator-nova").await.unwrap().total_earned, 3);
    }

    #[tokio::test]
    async fn retry_clears_reasoning_of_replaced_reply() {
        let h = Harness::new(ScriptedGateway::echo()).await;
        let session = h.engine.start_session("u1", "nova", "", "").await.unwrap();
        let msgs = h.engine.send_message_stream("u1", session.id, "hello", None, &mut |_: &str, _: &str| {}).await.unwrap();
        assert_eq!(msgs[1].metadata[REASONING_METADATA_KEY], "thinking...");

        let after = h.engine.retry_assistant_message("u1", msgs[1].id).await.unwrap();
        assert_eq!(after[1].content, "reply 2 to hello");
        assert!(!after[1].metadata.contains_key(REASONING_METADATA_KEY));
        let stored = h.engine.history("u1", session.id).await.unwrap();
        assert_eq!(stored[1].content, "reply 2 to hello");
        assert!(!stored[1].metadata.contains_key(REASONING_METADATA_KEY));
    }

    #[tokio::test]
    async fn send_dropped_during_generation_stores_and_bills_nothing() {
        let h = Harness::new(ScriptedGateway::with_hook(Arc::new(|| {
            tokio::time::sleep(Duration::from_millis(300)).boxed()
        })))
        .await;
        let session = paid_session(&h, 10, 25).await;

        let res = tokio::time::timeout(
            Duration::from_millis(50),
            h.engine.send_message("u1", session.id, "hello", None),
        )
        .await;
        assert!(res.is_err());
        tokio::time::sleep(Duration::from_millis(400)).await;

        let history = h.engine.history("u1", session.id).await.unwrap();
        assert_eq!(history.iter().map(|m| m.role).collect::<Vec<_>>(), vec![MessageRole::User]);
        assert_eq!(h.store.balance("u1").await.unwrap(), 25);
        assert_eq!(h.store.creator_wallet("creator-nova").await.unwrap().total_earned, 0);
    }

    #[tokio::test]
    async fn send_dropped_during_settle_still_bills_the_stored_reply() {
        let h = Harness::new(ScriptedGateway::echo()).await;
        let session = paid_session(&h, 10, 25).await;
        let mut collab = Collaborators::from_store(h.store.clone(), Arc::new(InMemoryReplyCache::new()));
        collab.wallets = Arc::new(SlowDebit(h.store.clone()));
        let engine = SessionEngine::new(collab, h.gateway.clone(), EngineOptions::default());

        let res =
            tokio::time::timeout(Duration::from_millis(100), engine.send_message("u1", session.id, "hello", None)).await;
        assert!(res.is_err());

        let mut balance = 25;
        for _ in 0..50 {
            balance = h.store.balance("u1").await.unwrap();
            if balance != 25 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(balance, 15);
        let history = h.engine.history("u1", session.id).await.unwrap();
        assert_eq!(history.iter().map(|m| m.role).collect::<Vec<_>>(), vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(h.store.creator_wallet("creator-nova").await.unwrap().total_earned, 3);
    }

    #[tokio::test]
    async fn retry_requires_assistant_message() {
        let h = Harness::new(ScriptedGateway::echo()).await;
        let session = h.engine.start_session("u1", "nova", "", "").await.unwrap();
        let msgs = h.engine.send_message("u1", session.id, "hello", None).await.unwrap();
        let err = h.engine.retry_assistant_message("u1", msgs[0].id).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        let err = h.engine.retry_assistant_message("u1", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound("message")));
    }

    #[tokio::test]
    async fn remember_keyword_stores_memory_capsule() {
        let h = Harness::new(ScriptedGateway::echo()).await;
        let session = h.engine.start_session("u1", "nova", "", "").await.unwrap();
        h.engine.send_message("u1", session.id, "hello", None).await.unwrap();
        h.engine.send_message("u1", session.id, "please remember I like tea", None).await.unwrap();
        let notes = h.store.list_memories("u1", "nova").await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].content, "please remember I like tea");

        h.engine.send_message("u1", session.id, "what do I drink?", None).await.unwrap();
        let call = h.gateway.chat_calls().pop().unwrap();
        assert!(call.instruction.contains("User preferences or memories:\nplease remember I like tea"));
    }

    #[tokio::test]
    async fn summary_written_every_ten_messages() {
        let h = Harness::new(ScriptedGateway::echo()).await;
        let session = h.engine.start_session("u1", "nova", "", "").await.unwrap();
        for i in 0..4 {
            h.engine.send_message("u1", session.id, &format!("m{i}"), None).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.gateway.summary_calls(), 0);

        h.engine.send_message("u1", session.id, "m4", None).await.unwrap();
        assert_eq!(h.wait_for_summary(session.id, "S1").await, "S1");

        // 11 messages: no new summary.
        h.engine.send_message("u1", session.id, "m5", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.gateway.summary_calls(), 1);

        for i in 6..10 {
            h.engine.send_message("u1", session.id, &format!("m{i}"), None).await.unwrap();
        }
        assert_eq!(h.wait_for_summary(session.id, "S1\nS2").await, "S1\nS2");

        let summary_prompt = h
            .gateway
            .calls
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.instruction.starts_with("Summarize"))
            .map(|c| c.instruction.clone())
            .unwrap();
        assert!(summary_prompt.contains("user: m0\nassistant: reply 1 to m0\n"));
    }

    #[tokio::test]
    async fn failed_summary_does_not_touch_send_or_summary() {
        let h = Harness::new(ScriptedGateway::failing_summaries()).await;
        let session = h.engine.start_session("u1", "nova", "", "").await.unwrap();
        for i in 0..5 {
            let msgs = h.engine.send_message("u1", session.id, &format!("m{i}"), None).await.unwrap();
            assert_eq!(msgs.len(), 2 * (i + 1));
        }
        for _ in 0..50 {
            if h.gateway.summary_calls() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.gateway.summary_calls(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.store.find_session(session.id).await.unwrap().unwrap().summary, "");
    }

    #[tokio::test]
    async fn every_session_gets_its_summary_under_load() {
        let h = Harness::new(ScriptedGateway::slow_summaries(Duration::from_millis(200))).await;
        let mut ids = Vec::new();
        for _ in 0..12 {
            let session = h.engine.start_session("u1", "nova", "", "").await.unwrap();
            for i in 0..5 {
                h.engine.send_message("u1", session.id, &format!("m{i}"), None).await.unwrap();
            }
            ids.push(session.id);
        }

        let mut missing = ids.len();
        for _ in 0..100 {
            missing = 0;
            for id in &ids {
                if h.store.find_session(*id).await.unwrap().unwrap().summary.is_empty() {
                    missing += 1;
                }
            }
            if missing == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(missing, 0);
        assert_eq!(h.gateway.summary_calls(), 12);
    }
}
