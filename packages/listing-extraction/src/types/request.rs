//! Extraction requests - the inbound description of one listing.

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::RequestError;
use crate::types::field::Modality;

/// Reference to one listing photo.
///
/// The engine never sees image bytes; backends resolve the URI themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub uri: Url,

    /// Content digest (e.g. hex SHA-256) of the image bytes, if the caller
    /// knows it. Image sets are only cached when every image has one.
    pub content_digest: Option<String>,
}

impl ImageRef {
    pub fn new(uri: &str) -> Result<Self, RequestError> {
        let uri = Url::parse(uri).map_err(|e| RequestError::InvalidImage(format!("{uri}: {e}")))?;
        Ok(Self {
            uri,
            content_digest: None,
        })
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.content_digest = Some(digest.into());
        self
    }
}

/// Reference to a recorded voice note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceRef {
    pub uri: Url,

    /// Transcript, when the caller already has one. Skips transcription.
    pub transcript: Option<String>,
}

impl VoiceRef {
    pub fn new(uri: &str) -> Result<Self, RequestError> {
        let uri = Url::parse(uri).map_err(|e| RequestError::InvalidVoice(format!("{uri}: {e}")))?;
        Ok(Self {
            uri,
            transcript: None,
        })
    }

    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        let transcript = transcript.into();
        if !transcript.trim().is_empty() {
            self.transcript = Some(transcript);
        }
        self
    }
}

/// A listing described through up to three evidence channels.
///
/// Immutable once built; at least one channel is always present.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRequest {
    id: Uuid,
    text: Option<String>,
    images: Vec<ImageRef>,
    voice: Option<VoiceRef>,
}

impl ExtractionRequest {
    pub fn builder() -> ExtractionRequestBuilder {
        ExtractionRequestBuilder::default()
    }

    /// Shorthand for a text-only request.
    pub fn from_text(text: impl Into<String>) -> Result<Self, RequestError> {
        Self::builder().text(text).build()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Images in caller order; empty when no image channel was supplied.
    pub fn images(&self) -> &[ImageRef] {
        &self.images
    }

    pub fn voice(&self) -> Option<&VoiceRef> {
        self.voice.as_ref()
    }

    /// Modalities present in this request.
    pub fn modalities(&self) -> Vec<Modality> {
        let mut present = Vec::with_capacity(3);
        if self.text.is_some() {
            present.push(Modality::Text);
        }
        if !self.images.is_empty() {
            present.push(Modality::Image);
        }
        if self.voice.is_some() {
            present.push(Modality::Voice);
        }
        present
    }
}

/// Builder for [`ExtractionRequest`].
#[derive(Debug, Default)]
pub struct ExtractionRequestBuilder {
    text: Option<String>,
    images: Vec<ImageRef>,
    voice: Option<VoiceRef>,
}

impl ExtractionRequestBuilder {
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn image(mut self, image: ImageRef) -> Self {
        self.images.push(image);
        self
    }

    pub fn images(mut self, images: impl IntoIterator<Item = ImageRef>) -> Self {
        self.images.extend(images);
        self
    }

    pub fn voice(mut self, voice: VoiceRef) -> Self {
        self.voice = Some(voice);
        self
    }

    pub fn build(self) -> Result<ExtractionRequest, RequestError> {
        if let Some(text) = &self.text {
            if text.trim().is_empty() {
                return Err(RequestError::BlankText);
            }
        }
        if self.text.is_none() && self.images.is_empty() && self.voice.is_none() {
            return Err(RequestError::NoModality);
        }

        Ok(ExtractionRequest {
            id: Uuid::new_v4(),
            text: self.text,
            images: self.images,
            voice: self.voice,
        })
    }
}
