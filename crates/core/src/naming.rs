//! Display names for generated images and materials.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::EntryId;

/// Default prefix for names of generated materials.
pub const DEFAULT_NAME_PREFIX: &str = "Diffusion";

/// Prompt characters kept in a name.
pub const MAX_PROMPT_CHARS: usize = 20;

/// Anything that is not a word character or a dash.
static UNSAFE_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\-]").expect("valid regex"));

/// Build `{prefix}_{id:03}_{prompt}` where the prompt part is the first
/// [`MAX_PROMPT_CHARS`] characters with spaces turned into underscores and
/// every other unsafe character dropped.
pub fn friendly_name(prefix: &str, id: EntryId, prompt: &str) -> String {
    let prompt = prompt.trim();
    let prompt = if prompt.is_empty() { "untitled" } else { prompt };

    let head: String = prompt
        .chars()
        .take(MAX_PROMPT_CHARS)
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    let clean = UNSAFE_CHARS_RE.replace_all(&head, "");

    format!("{prefix}_{id:03}_{clean}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_id_and_cleans_prompt() {
        assert_eq!(
            friendly_name("Diffusion", 7, "brick wall"),
            "Diffusion_007_brick_wall"
        );
        assert_eq!(
            friendly_name("Tex", 12, "rusty: metal/plate?"),
            "Tex_012_rusty_metalplate"
        );
    }

    #[test]
    fn truncates_to_twenty_chars() {
        assert_eq!(
            friendly_name("D", 1, "a very long prompt about mossy stones"),
            "D_001_a_very_long_prompt_a"
        );
    }

    #[test]
    fn empty_prompt_is_untitled() {
        assert_eq!(friendly_name("D", 1000, "  "), "D_1000_untitled");
    }
}
