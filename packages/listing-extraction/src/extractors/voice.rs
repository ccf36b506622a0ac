//! Voice modality: a recorded note from the seller.
//!
//! Two stages. The voice backend transcribes (and may extract directly).
//! When it returns a transcript without fields, or when the request already
//! carries a transcript, the transcript is sent to the text backend. Either
//! way every field is attributed to voice. Voice results are never cached.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{missing_input, prompts, Extraction, ExtractorCore, ModalityExtractor};
use crate::error::Failure;
use crate::traits::backend::{BackendKind, BackendPayload};
use crate::types::field::Modality;
use crate::types::request::ExtractionRequest;

#[derive(Debug, Clone)]
pub struct VoiceExtractor {
    core: Arc<ExtractorCore>,
}

impl VoiceExtractor {
    pub fn new(core: Arc<ExtractorCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ModalityExtractor for VoiceExtractor {
    fn modality(&self) -> Modality {
        Modality::Voice
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Extraction, Failure> {
        let voice = request.voice().ok_or_else(|| missing_input(Modality::Voice))?;
        let mut billed_cost = 0.0;

        let transcript = match &voice.transcript {
            Some(transcript) => {
                debug!("Voice note carries a transcript, skipping transcription");
                transcript.clone()
            }
            None => {
                let invocation = self
                    .core
                    .invoke(
                        BackendKind::Voice,
                        prompts::VOICE_PROMPT,
                        BackendPayload::Audio(voice.clone()),
                        deadline,
                        cancel,
                    )
                    .await;
                billed_cost += invocation.billed_cost;
                let output = invocation.outcome?;

                let partial = self.core.parse(Modality::Voice, &output);
                match output.transcript {
                    Some(transcript) if partial.is_empty() && !transcript.trim().is_empty() => transcript,
                    _ => {
                        debug!(fields = partial.len(), "Voice extraction complete");
                        return Ok(Extraction {
                            partial,
                            cached: false,
                            billed_cost,
                        });
                    }
                }
            }
        };

        let invocation = self
            .core
            .invoke(
                BackendKind::Text,
                prompts::TRANSCRIPT_PROMPT,
                BackendPayload::Text(transcript),
                deadline,
                cancel,
            )
            .await;
        billed_cost += invocation.billed_cost;
        let output = invocation.outcome?;

        let partial = self.core.parse(Modality::Voice, &output);
        debug!(fields = partial.len(), "Voice extraction complete from transcript");

        Ok(Extraction {
            partial,
            cached: false,
            billed_cost,
        })
    }
}
