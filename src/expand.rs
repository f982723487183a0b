//! Query expansion.
//!
//! Rewrites the user turn into a retrieval query by appending keyword
//! expansions from an ordered rule table. The first rule whose any-keyword
//! test matches wins; when nothing matches, a default brand-context
//! expansion is appended. The original text is never removed or reordered.

/// Ordered (trigger substrings, appended expansion) rules. Triggers are
/// matched against the lowercased, whitespace-collapsed user text.
const EXPANSION_RULES: &[(&[&str], &str)] = &[
    (
        &[
            "who are my",
            "my niche",
            "potential clients",
            "target audience",
            "ideal client",
        ],
        "avatar sheet, ICP, ideal customer profile, demographics, psychographics",
    ),
    (
        &["tone", "voice", "style", "how should i write"],
        "brand tone, voice, writing style, brand identity, brand vision",
    ),
    (
        &["script", "hook", "cta", "storytelling", "video", "reel"],
        "script structure, hook formulas, CTA, storytelling, retention",
    ),
    (
        &["carousel", "slides"],
        "carousel rules, slide structure, headline",
    ),
    (
        &[
            "content strategy",
            "weekly",
            "ideas",
            "content plan",
            "what to post",
        ],
        "content pillars, weekly planning, content calendar",
    ),
    (
        &["competitor", "rewrite", "in my voice"],
        "competitor adaptation, brand voice rewrite",
    ),
    (
        &[
            "tell me about yourself",
            "your story",
            "about you",
            "who are you",
        ],
        "personal background, journey, transformation",
    ),
    (
        &["brand", "identity", "philosophy", "positioning", "values"],
        "brand identity, philosophy, mission, values",
    ),
];

const DEFAULT_EXPANSION: &str = "brand documents, content strategy";

/// Deterministic, side-effect-free. `expand(t)` always contains `t`.
pub fn expand(user_text: &str) -> String {
    let normalized = user_text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    for (triggers, expansion) in EXPANSION_RULES {
        if triggers.iter().any(|t| normalized.contains(t)) {
            return format!("{user_text} {expansion}");
        }
    }

    format!("{user_text} {DEFAULT_EXPANSION}")
}
