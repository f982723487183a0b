//! Retrieval hits and the formatted context block.
//!
//! A `ContextBlock` carries the merged retrieval results for one turn,
//! ordered sections of hits in descending similarity. `format_context`
//! renders it into the deterministic text block prepended to the system
//! prompt.

use serde_json::Value;

/// Which store a hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOrigin {
    Message,
    Document,
    Global,
}

impl HitOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            HitOrigin::Message => "message",
            HitOrigin::Document => "document",
            HitOrigin::Global => "global",
        }
    }
}

/// One retrieval result, owned for the duration of a turn.
#[derive(Debug, Clone)]
pub struct RetrievalHit {
    pub origin: HitOrigin,
    /// Provenance label: filename for documents, role for messages,
    /// category for global patterns.
    pub source: String,
    pub similarity: f32,
    pub text: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ContextBlock {
    pub documents: Vec<RetrievalHit>,
    pub messages: Vec<RetrievalHit>,
    pub global: Vec<RetrievalHit>,
}

impl ContextBlock {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.messages.is_empty() && self.global.is_empty()
    }

    pub fn hit_count(&self) -> usize {
        self.documents.len() + self.messages.len() + self.global.len()
    }
}

/// Per-hit payload cap in the rendered block.
const HIT_TEXT_MAX_CHARS: usize = 1_200;

/// Render the context block. Pure: equal inputs produce byte-equal
/// output. Sections appear in fixed order and empty sections are
/// omitted; when the rendered block would exceed `max_chars`, the
/// lowest-similarity hits are dropped first.
pub fn format_context(block: &ContextBlock, max_chars: usize) -> String {
    let mut sections: Vec<(&str, Vec<&RetrievalHit>)> = vec![
        ("## Documents", block.documents.iter().collect()),
        ("## Prior Messages", block.messages.iter().collect()),
        ("## Global Patterns", block.global.iter().collect()),
    ];

    loop {
        let rendered = render(&sections);
        if rendered.chars().count() <= max_chars {
            return rendered;
        }
        if !drop_weakest(&mut sections) {
            return rendered;
        }
    }
}

fn render(sections: &[(&str, Vec<&RetrievalHit>)]) -> String {
    let mut out = String::new();
    for (header, hits) in sections {
        if hits.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(header);
        out.push('\n');
        for (i, hit) in hits.iter().enumerate() {
            out.push_str(&format!(
                "[{}] source={} similarity={:.2} {}\n",
                i + 1,
                hit.source,
                hit.similarity,
                clip(&hit.text)
            ));
        }
    }
    out
}

/// Remove the lowest-similarity hit across all sections. Lists are
/// similarity-sorted, so only each section's tail is a candidate; ties
/// prefer the later section. Returns false when nothing is left to drop.
fn drop_weakest(sections: &mut [(&str, Vec<&RetrievalHit>)]) -> bool {
    let mut weakest: Option<(usize, f32)> = None;
    for (idx, (_, hits)) in sections.iter().enumerate() {
        if let Some(last) = hits.last() {
            match weakest {
                Some((_, similarity)) if similarity < last.similarity => {}
                _ => weakest = Some((idx, last.similarity)),
            }
        }
    }
    match weakest {
        Some((idx, _)) => {
            sections[idx].1.pop();
            true
        }
        None => false,
    }
}

fn clip(text: &str) -> String {
    let total = text.chars().count();
    if total <= HIT_TEXT_MAX_CHARS {
        return text.to_string();
    }
    let clipped: String = text.chars().take(HIT_TEXT_MAX_CHARS).collect();
    format!("{clipped}…")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn hit(origin: HitOrigin, source: &str, similarity: f32, text: &str) -> RetrievalHit {
        RetrievalHit {
            origin,
            source: source.to_string(),
            similarity,
            text: text.to_string(),
            metadata: json!({}),
        }
    }

    fn sample_block() -> ContextBlock {
        ContextBlock {
            documents: vec![hit(
                HitOrigin::Document,
                "voice.txt",
                0.62,
                "Grounded, intelligent, emotionally honest",
            )],
            messages: vec![hit(HitOrigin::Message, "user", 0.55, "earlier question")],
            global: vec![hit(HitOrigin::Global, "tone", 0.48, "calm authority")],
        }
    }

    #[test]
    fn sections_render_in_fixed_order() {
        let text = format_context(&sample_block(), 16_000);
        let docs = text.find("## Documents").unwrap();
        let msgs = text.find("## Prior Messages").unwrap();
        let glob = text.find("## Global Patterns").unwrap();
        assert!(docs < msgs && msgs < glob);
        assert!(text.contains("[1] source=voice.txt similarity=0.62 Grounded"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let block = ContextBlock {
            documents: vec![hit(HitOrigin::Document, "a.txt", 0.9, "doc text")],
            ..ContextBlock::default()
        };
        let text = format_context(&block, 16_000);
        assert!(text.contains("## Documents"));
        assert!(!text.contains("## Prior Messages"));
        assert!(!text.contains("## Global Patterns"));
    }

    #[test]
    fn empty_block_renders_empty_string() {
        assert_eq!(format_context(&ContextBlock::default(), 16_000), "");
    }

    #[test]
    fn formatting_is_deterministic() {
        let block = sample_block();
        assert_eq!(format_context(&block, 16_000), format_context(&block, 16_000));
    }

    #[test]
    fn long_payloads_are_clipped_with_ellipsis() {
        let block = ContextBlock {
            documents: vec![hit(HitOrigin::Document, "big.txt", 0.9, &"z".repeat(5_000))],
            ..ContextBlock::default()
        };
        let text = format_context(&block, 16_000);
        assert!(text.contains('…'));
        assert!(text.chars().count() < 1_400);
    }

    #[test]
    fn ceiling_drops_lowest_similarity_hits_first() {
        let block = ContextBlock {
            documents: vec![
                hit(HitOrigin::Document, "a.txt", 0.9, &"a".repeat(400)),
                hit(HitOrigin::Document, "b.txt", 0.5, &"b".repeat(400)),
            ],
            messages: vec![hit(HitOrigin::Message, "user", 0.3, &"c".repeat(400))],
            global: vec![],
        };
        let text = format_context(&block, 900);
        assert!(text.chars().count() <= 900);
        // The 0.9 document survives; the 0.3 message goes first.
        assert!(text.contains("a.txt"));
        assert!(!text.contains("## Prior Messages"));
    }
}
