//! Attachment context assembly.
//!
//! Uploaded files ride into the turn as content blocks: native
//! multimodal blocks when the provider supports them, text fallback
//! otherwise. Per-file and per-turn size caps apply; truncation and
//! drops emit explicit context-optimization events so the user knows
//! what the model did not see. Native blocks always win for images; for
//! documents both the native block and the text fallback are attached.

use serde_json::json;

use tess_domain::config::LimitsConfig;
use tess_domain::event::AgentEvent;
use tess_providers::ContentPart;

/// One uploaded file, already parsed by the upload pipeline.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    /// Extracted text (documents) or base64 payload (images).
    pub content: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }
}

/// Build content parts from attachments under the configured caps.
/// Events describing truncations and drops are pushed to `events`.
pub fn build_attachment_context(
    attachments: &[Attachment],
    limits: &LimitsConfig,
    supports_native_blocks: bool,
    events: &mut Vec<AgentEvent>,
) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    let mut total_used = 0usize;

    for attachment in attachments {
        // Per-turn cap: anything past it is dropped entirely.
        if total_used >= limits.attachment_max_total_bytes {
            events.push(AgentEvent::system(
                "Context Optimization",
                "system_message",
                json!({
                    "summary": format!(
                        "Attachment '{}' was dropped: the per-turn attachment budget is exhausted.",
                        attachment.name
                    ),
                    "correction_type": "attachment_dropped"
                }),
            ));
            continue;
        }

        // Per-file cap: truncate with an event.
        let budget = limits
            .attachment_max_file_bytes
            .min(limits.attachment_max_total_bytes - total_used);
        let (content, truncated) = truncate_at_char_boundary(&attachment.content, budget);
        if truncated {
            events.push(AgentEvent::system(
                "Context Optimization",
                "system_message",
                json!({
                    "summary": format!(
                        "Attachment '{}' exceeds the per-file cap and was truncated to {} bytes.",
                        attachment.name, content.len()
                    ),
                    "correction_type": "attachment_truncated"
                }),
            ));
        }
        total_used += content.len();

        if attachment.is_image() && supports_native_blocks {
            // Images ride natively or not at all.
            parts.push(ContentPart::Image {
                media_type: attachment.media_type.clone(),
                data: content,
            });
        } else if supports_native_blocks && !attachment.is_image() {
            // Documents: native block plus the text fallback.
            parts.push(ContentPart::Document {
                name: attachment.name.clone(),
                media_type: attachment.media_type.clone(),
                data: content.clone(),
            });
            parts.push(ContentPart::Text {
                text: format!("[attached document: {}]\n{}", attachment.name, content),
            });
        } else {
            parts.push(ContentPart::Text {
                text: format!("[attached document: {}]\n{}", attachment.name, content),
            });
        }
    }

    parts
}

fn truncate_at_char_boundary(content: &str, budget: usize) -> (String, bool) {
    if content.len() <= budget {
        return (content.to_string(), false);
    }
    let mut cut = budget;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    (content[..cut].to_string(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(file: usize, total: usize) -> LimitsConfig {
        LimitsConfig {
            attachment_max_file_bytes: file,
            attachment_max_total_bytes: total,
            ..Default::default()
        }
    }

    fn doc(name: &str, size: usize) -> Attachment {
        Attachment {
            name: name.into(),
            media_type: "text/plain".into(),
            content: "x".repeat(size),
        }
    }

    #[test]
    fn oversized_file_is_truncated_with_event() {
        let mut events = Vec::new();
        let parts =
            build_attachment_context(&[doc("big.txt", 100)], &limits(10, 1000), false, &mut events);
        assert_eq!(parts.len(), 1);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].payload()["details"]["correction_type"],
            "attachment_truncated"
        );
    }

    #[test]
    fn total_cap_drops_later_files_with_event() {
        let mut events = Vec::new();
        let parts = build_attachment_context(
            &[doc("a.txt", 50), doc("b.txt", 50), doc("c.txt", 50)],
            &limits(60, 100),
            false,
            &mut events,
        );
        assert_eq!(parts.len(), 2);
        assert!(events
            .iter()
            .any(|e| e.payload()["details"]["correction_type"] == "attachment_dropped"));
    }

    #[test]
    fn images_ride_natively_when_supported() {
        let image = Attachment {
            name: "shot.png".into(),
            media_type: "image/png".into(),
            content: "aGVsbG8=".into(),
        };
        let mut events = Vec::new();
        let parts = build_attachment_context(&[image], &limits(1000, 1000), true, &mut events);
        assert!(matches!(parts[0], ContentPart::Image { .. }));
    }

    #[test]
    fn documents_get_native_plus_text_fallback() {
        let mut events = Vec::new();
        let parts =
            build_attachment_context(&[doc("d.txt", 10)], &limits(1000, 1000), true, &mut events);
        assert_eq!(parts.len(), 2);
        assert!(matches!(parts[0], ContentPart::Document { .. }));
        assert!(matches!(parts[1], ContentPart::Text { .. }));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let attachment = Attachment {
            name: "uni.txt".into(),
            media_type: "text/plain".into(),
            content: "héllo wörld".repeat(10),
        };
        let mut events = Vec::new();
        let parts =
            build_attachment_context(&[attachment], &limits(7, 1000), false, &mut events);
        // No panic on a multi-byte boundary and the text survives.
        assert_eq!(parts.len(), 1);
    }
}
