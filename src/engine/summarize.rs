use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::llm::{ChatTurn, GenerationGateway, GenerationRequest};
use crate::metrics::SUMMARIZATIONS_TOTAL;
use crate::models::ModelResolver;
use crate::storage::SessionStore;

/// A summary is produced every time a session reaches a multiple of this many messages.
pub const SUMMARY_INTERVAL: i64 = 10;

const SUMMARY_INSTRUCTION: &str =
    "Summarize the following conversation in 2-3 sentences, focusing on key events and facts. Keep it concise.\n\n";

pub fn should_summarize(message_count: i64) -> bool {
    message_count > 0 && message_count % SUMMARY_INTERVAL == 0
}

pub fn summary_prompt(history: &[ChatTurn]) -> String {
    let mut prompt = String::from(SUMMARY_INSTRUCTION);
    for turn in history {
        prompt.push_str(turn.role.as_str());
        prompt.push_str(": ");
        prompt.push_str(&turn.content);
        prompt.push('\n');
    }
    prompt
}

/// Appends rolling summaries to sessions, off the request path.
#[derive(Clone)]
pub struct SummarizationWorker {
    sessions: Arc<dyn SessionStore>,
    resolver: ModelResolver,
    gateway: Arc<dyn GenerationGateway>,
}

impl SummarizationWorker {
    pub fn new(sessions: Arc<dyn SessionStore>, resolver: ModelResolver, gateway: Arc<dyn GenerationGateway>) -> Self {
        Self { sessions, resolver, gateway }
    }

    /// Summarizes `history` on a detached task. Failures are logged and counted,
    /// never reported to the caller.
    pub fn schedule(&self, session_id: Uuid, model_key: String, history: Vec<ChatTurn>) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            match worker.run(session_id, &model_key, &history).await {
                Ok(_) => {
                    counter!(SUMMARIZATIONS_TOTAL, "outcome" => "ok").increment(1);
                    info!(session_id = %session_id, "session summary updated");
                }
                Err(e) => {
                    counter!(SUMMARIZATIONS_TOTAL, "outcome" => "error").increment(1);
                    warn!(session_id = %session_id, error = %e, "auto-summarization failed");
                }
            }
        })
    }

    /// Generates a summary and appends it to the session's current summary.
    pub async fn run(&self, session_id: Uuid, model_key: &str, history: &[ChatTurn]) -> ChatResult<String> {
        let model = self.resolver.resolve(model_key).await?;
        let prompt = summary_prompt(history);
        let summary = self
            .gateway
            .generate(GenerationRequest::new(&prompt, &model, &[]))
            .await
            .map_err(|source| ChatError::Provider { model: model.id.clone(), source })?;
        let summary = summary.trim();
        if summary.is_empty() {
            debug!(session_id = %session_id, "empty summary, nothing to append");
            return Ok(String::new());
        }

        // Re-read so a summary written since scheduling is kept.
        let session = self.sessions.find_session(session_id).await?.ok_or(ChatError::NotFound("session"))?;
        let combined = if session.summary.is_empty() {
            summary.to_string()
        } else {
            format!("{}\n{}", session.summary, summary)
        };
        self.sessions.update_summary(session_id, &combined).await?;
        Ok(combined)
    }
}
