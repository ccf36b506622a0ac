//! Instructions sent to backends with each modality's payload.
//!
//! The canonical field names are appended at build time so prompts follow
//! the configured catalog rather than a hardcoded list.

use crate::types::schema::FieldCatalog;

/// Instructions for listing text.
pub const TEXT_PROMPT: &str = r#"Extract property listing facts from the seller's description.

Rules:
- Only report facts the text states or directly implies. Leave anything else out.
- Never fill a field with a placeholder such as 0, "unknown" or false.
- Prices: report the number only, put the currency and period in their own fields.
- Areas are in square meters.
- amenities is a list of short labels ("pool", "elevator", "sea view").
- For every field you report, give a confidence between 0 and 1."#;

/// Instructions for a batch of listing photos.
pub const IMAGE_PROMPT: &str = r#"Extract property listing facts visible in these photos.

Rules:
- Report only what the photos show: room counts you can verify, visible amenities,
  furnishing, property type, condition.
- Do not guess prices, addresses or years from photos.
- Never fill a field with a placeholder such as 0, "unknown" or false.
- amenities is a list of short labels ("pool", "balcony", "fitted kitchen").
- For every field you report, give a confidence between 0 and 1."#;

/// Instructions for a voice note. Backends that only transcribe return the
/// transcript and no fields; the transcript then goes through
/// [`TRANSCRIPT_PROMPT`].
pub const VOICE_PROMPT: &str = r#"Transcribe the seller's voice note describing a property,
then extract the listing facts it states.

Rules:
- Always return the full transcript.
- Only report facts the speaker states. Leave anything else out.
- Spoken numbers ("forty-eight thousand a month") become digits with currency and period fields.
- For every field you report, give a confidence between 0 and 1."#;

/// Instructions for a transcript produced from a voice note.
pub const TRANSCRIPT_PROMPT: &str = r#"Extract property listing facts from this transcript of a seller's voice note.

Rules:
- The transcript is conversational and may contain corrections; the seller's last statement wins.
- Only report facts the speaker states. Leave anything else out.
- Never fill a field with a placeholder such as 0, "unknown" or false.
- For every field you report, give a confidence between 0 and 1."#;

/// Append the catalog's field names to a prompt.
pub fn with_fields(prompt: &str, catalog: &FieldCatalog) -> String {
    let names = catalog
        .specs()
        .iter()
        .map(|spec| spec.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!("{prompt}\n\nFields: {names}")
}
