//! Document chunking.
//!
//! Cuts normalized text into overlapping windows around a target size.
//! Split points prefer sentence boundaries near the target, fall back to
//! word boundaries, and hard-split as a last resort. A document yields at
//! most `max_chunks_per_doc` chunks; excess text marks the plan truncated.

use crate::core::config::ChunkingConfig;

/// How far from the nominal split point a sentence boundary may be.
const BOUNDARY_MARGIN: usize = 100;

#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub chunks: Vec<String>,
    pub truncated: bool,
}

pub fn chunk_text(text: &str, config: &ChunkingConfig) -> ChunkPlan {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();

    if total == 0 {
        return ChunkPlan {
            chunks: Vec::new(),
            truncated: false,
        };
    }

    let target = config.target_chars.max(1);
    let overlap = config.overlap_chars.min(target.saturating_sub(1));

    // Split points on the target grid, nudged to nearby boundaries.
    let mut splits = vec![0usize];
    loop {
        let start = *splits.last().unwrap_or(&0);
        let nominal = start + target;
        if nominal >= total {
            splits.push(total);
            break;
        }
        let split = find_split(&chars, start, nominal, total);
        if split >= total {
            splits.push(total);
            break;
        }
        splits.push(split);
    }

    let span_count = splits.len() - 1;
    let truncated = span_count > config.max_chunks_per_doc;
    let kept = span_count.min(config.max_chunks_per_doc);

    let mut chunks = Vec::with_capacity(kept);
    for window in 0..kept {
        let start = splits[window].saturating_sub(if window == 0 { 0 } else { overlap });
        let end = splits[window + 1];
        let chunk: String = chars[start..end].iter().collect();
        let chunk = chunk.trim().to_string();
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
    }

    ChunkPlan { chunks, truncated }
}

fn find_split(chars: &[char], start: usize, nominal: usize, total: usize) -> usize {
    let margin = BOUNDARY_MARGIN.min(nominal - start - 1);
    let lo = nominal - margin;
    let hi = (nominal + BOUNDARY_MARGIN).min(total - 1);

    // Sentence boundary closest to the nominal point.
    let mut best: Option<usize> = None;
    for p in lo..=hi {
        if !matches!(chars[p], '.' | '!' | '?') {
            continue;
        }
        if p + 1 < total && !chars[p + 1].is_whitespace() {
            continue;
        }
        let end = p + 1;
        let distance = end.abs_diff(nominal);
        match best {
            Some(current) if current.abs_diff(nominal) <= distance => {}
            _ => best = Some(end),
        }
    }
    if let Some(end) = best {
        return end;
    }

    // Word boundary at or before the nominal point.
    for p in (lo..=nominal.min(total - 1)).rev() {
        if chars[p].is_whitespace() {
            return p + 1;
        }
    }

    nominal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(target: usize, overlap: usize, max: usize) -> ChunkingConfig {
        ChunkingConfig {
            target_chars: target,
            overlap_chars: overlap,
            max_chunks_per_doc: max,
        }
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let plan = chunk_text("", &config(1000, 200, 50));
        assert!(plan.chunks.is_empty());
        assert!(!plan.truncated);
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let plan = chunk_text("just a short note", &config(1000, 200, 50));
        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(plan.chunks[0], "just a short note");
    }

    #[test]
    fn splits_prefer_sentence_boundaries() {
        let text = "First sentence here. ".repeat(20);
        let plan = chunk_text(&text, &config(100, 20, 50));
        assert!(plan.chunks.len() > 1);
        // Every non-final chunk ends at a sentence boundary.
        for chunk in &plan.chunks[..plan.chunks.len() - 1] {
            assert!(chunk.ends_with('.'), "chunk did not end at sentence: {chunk:?}");
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "word ".repeat(400);
        let plan = chunk_text(&text, &config(100, 20, 50));
        assert!(plan.chunks.len() >= 2);
        let first_tail: String = plan.chunks[0]
            .chars()
            .rev()
            .take(10)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        assert!(plan.chunks[1].contains(first_tail.trim()));
    }

    #[test]
    fn exact_grid_fills_cap_without_truncation() {
        let text = "x".repeat(50 * 1000);
        let plan = chunk_text(&text, &config(1000, 200, 50));
        assert_eq!(plan.chunks.len(), 50);
        assert!(!plan.truncated);
    }

    #[test]
    fn excess_text_marks_truncation() {
        let text = "x".repeat(51 * 1000);
        let plan = chunk_text(&text, &config(1000, 200, 50));
        assert_eq!(plan.chunks.len(), 50);
        assert!(plan.truncated);
    }

    #[test]
    fn chunk_size_stays_near_target_plus_overlap() {
        let text = "alpha beta gamma delta. ".repeat(300);
        let plan = chunk_text(&text, &config(1000, 200, 50));
        for chunk in &plan.chunks {
            assert!(chunk.chars().count() <= 1000 + 200 + BOUNDARY_MARGIN);
        }
    }
}
