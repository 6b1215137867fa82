//! "Smart Enhancement": deterministic quality-keyword rewrite of prompts.
//!
//! Prompts are treated as comma-separated clauses. Enhancement appends each
//! quality clause that is not already present, comparing case-insensitively
//! with surrounding whitespace trimmed, so applying it twice is a no-op.

use serde::{Deserialize, Serialize};

pub const DEFAULT_QUALITY_SUFFIX: &str = "organic surface, seamless texture, tileable, \
top-down view, flat lighting, no shadows, no highlights, uniform pattern, albedo map, \
base color only, PBR texture, high detail, 4k resolution, ultra sharp, no logos, no borders";

pub const DEFAULT_QUALITY_NEGATIVE: &str = "shadows, lighting effects, reflections, text, \
logo, objects, 3D render, depth, photorealistic, noise, background, blur, photo";

/// Quality clauses appended to the positive and negative prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enhancement {
    pub quality_suffix: String,
    pub quality_negative: String,
}

impl Default for Enhancement {
    fn default() -> Self {
        Self {
            quality_suffix: DEFAULT_QUALITY_SUFFIX.to_string(),
            quality_negative: DEFAULT_QUALITY_NEGATIVE.to_string(),
        }
    }
}

impl Enhancement {
    /// Rewrite the positive prompt.
    pub fn prompt(&self, base: &str) -> String {
        append_clauses(base, &self.quality_suffix)
    }

    /// Rewrite the negative prompt.
    pub fn negative(&self, base: &str) -> String {
        append_clauses(base, &self.quality_negative)
    }

    /// Both prompts, or the trimmed originals when `enabled` is false.
    pub fn apply(&self, enabled: bool, prompt: &str, negative: &str) -> (String, String) {
        if enabled {
            (self.prompt(prompt), self.negative(negative))
        } else {
            (prompt.trim().to_string(), negative.trim().to_string())
        }
    }
}

fn normalize(clause: &str) -> String {
    clause
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn clauses(text: &str) -> impl Iterator<Item = &str> {
    text.split(',').map(str::trim).filter(|c| !c.is_empty())
}

fn append_clauses(base: &str, extra: &str) -> String {
    let mut seen: Vec<String> = clauses(base).map(normalize).collect();
    let mut out = base.trim().to_string();

    for clause in clauses(extra) {
        let key = normalize(clause);
        if seen.contains(&key) {
            continue;
        }
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push_str(clause);
        seen.push(key);
    }
    out
}
