use async_trait::async_trait;

use super::{ChunkFn, GenerationError, GenerationGateway, GenerationRequest};
use crate::session::MessageRole;

const STREAM_CHUNK_CHARS: usize = 16;
const INSTRUCTION_PREVIEW_CHARS: usize = 160;

/// Deterministic, offline stand-in: echoes the latest user turn and the start of the instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockGateway;

impl MockGateway {
    pub fn reply(req: &GenerationRequest<'_>) -> String {
        let latest_user = req
            .history
            .iter()
            .rev()
            .find(|t| t.role == MessageRole::User)
            .map(|t| t.content.as_str())
            .unwrap_or_default();
        let name = if req.model.name.is_empty() { &req.model.id } else { &req.model.name };
        let preview: String = req.instruction.chars().take(INSTRUCTION_PREVIEW_CHARS).collect();
        format!("[{name} mock] You said: {latest_user}\nSystem prompt: {preview}")
    }
}

#[async_trait]
impl GenerationGateway for MockGateway {
    async fn generate(&self, req: GenerationRequest<'_>) -> Result<String, GenerationError> {
        Ok(Self::reply(&req))
    }

    async fn stream_generate(
        &self,
        req: GenerationRequest<'_>,
        on_chunk: &mut ChunkFn<'_>,
    ) -> Result<(), GenerationError> {
        let reply: Vec<char> = Self::reply(&req).chars().collect();
        for piece in reply.chunks(STREAM_CHUNK_CHARS) {
            let piece: String = piece.iter().collect();
            on_chunk(&piece, "");
        }
        Ok(())
    }
}
