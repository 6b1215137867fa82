//! Backend capability snapshot.
//!
//! Produced by the connection manager when it probes a backend, then
//! shared read-only (behind an `Arc`) with everything that binds jobs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::family::ModelFamily;

/// An optional generation stage that a backend may or may not offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Lora,
    Upscale,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Lora => "lora",
            Feature::Upscale => "upscale",
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a backend can do for one model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyCapability {
    pub family: ModelFamily,
    /// Installed checkpoint filenames belonging to this family.
    pub checkpoints: Vec<String>,
    pub supports_lora: bool,
    pub supports_upscale: bool,
}

impl FamilyCapability {
    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::Lora => self.supports_lora,
            Feature::Upscale => self.supports_upscale,
        }
    }
}

/// Everything detected about a connected backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// One record per family with at least one installed checkpoint,
    /// ordered by family.
    pub families: Vec<FamilyCapability>,
    /// Installed LoRA filenames.
    pub loras: Vec<String>,
    /// Installed upscale model filenames.
    pub upscalers: Vec<String>,
    /// Version string reported during the handshake, if any.
    pub backend_version: Option<String>,
}

impl Capabilities {
    /// Build a snapshot from the raw model lists of a backend.
    ///
    /// Checkpoints are grouped by [`ModelFamily::detect`]. A feature is
    /// advertised only when its loader nodes exist *and* at least one model
    /// file for it is installed.
    pub fn from_models(
        checkpoints: &[String],
        loras: Vec<String>,
        upscalers: Vec<String>,
        has_lora_node: bool,
        has_upscale_nodes: bool,
    ) -> Self {
        let supports_lora = has_lora_node && !loras.is_empty();
        let supports_upscale = has_upscale_nodes && !upscalers.is_empty();

        let mut grouped: BTreeMap<ModelFamily, Vec<String>> = BTreeMap::new();
        for ckpt in checkpoints {
            grouped
                .entry(ModelFamily::detect(ckpt))
                .or_default()
                .push(ckpt.clone());
        }

        let families = grouped
            .into_iter()
            .map(|(family, checkpoints)| FamilyCapability {
                family,
                checkpoints,
                supports_lora,
                supports_upscale,
            })
            .collect();

        Self {
            families,
            loras,
            upscalers,
            backend_version: None,
        }
    }

    pub fn family(&self, family: ModelFamily) -> Option<&FamilyCapability> {
        self.families.iter().find(|f| f.family == family)
    }

    /// Find the family record that lists `checkpoint` as installed.
    pub fn family_of_checkpoint(&self, checkpoint: &str) -> Option<&FamilyCapability> {
        self.families
            .iter()
            .find(|f| f.checkpoints.iter().any(|c| c == checkpoint))
    }

    pub fn has_lora(&self, name: &str) -> bool {
        self.loras.iter().any(|l| l == name)
    }

    pub fn has_upscaler(&self, name: &str) -> bool {
        self.upscalers.iter().any(|u| u == name)
    }

    /// All installed checkpoints across families.
    pub fn checkpoints(&self) -> impl Iterator<Item = &str> {
        self.families
            .iter()
            .flat_map(|f| f.checkpoints.iter().map(String::as_str))
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn groups_checkpoints_by_family() {
        let caps = Capabilities::from_models(
            &names(&["flux1-dev.safetensors", "v1-5.ckpt", "sd_xl_base.safetensors"]),
            vec![],
            vec![],
            true,
            true,
        );
        let families: Vec<_> = caps.families.iter().map(|f| f.family).collect();
        assert_eq!(
            families,
            vec![ModelFamily::Sd15, ModelFamily::Sdxl, ModelFamily::Flux1Dev]
        );
    }

    #[test]
    fn lora_needs_node_and_files() {
        let ckpts = names(&["v1-5.ckpt"]);
        let no_files = Capabilities::from_models(&ckpts, vec![], vec![], true, false);
        assert!(!no_files.families[0].supports(Feature::Lora));

        let no_node = Capabilities::from_models(&ckpts, names(&["a.safetensors"]), vec![], false, false);
        assert!(!no_node.families[0].supports(Feature::Lora));

        let both = Capabilities::from_models(&ckpts, names(&["a.safetensors"]), vec![], true, false);
        assert!(both.families[0].supports(Feature::Lora));
        assert!(!both.families[0].supports(Feature::Upscale));
    }

    #[test]
    fn finds_family_of_checkpoint() {
        let caps = Capabilities::from_models(
            &names(&["flux1-schnell.safetensors", "v1-5.ckpt"]),
            vec![],
            vec![],
            false,
            false,
        );
        assert_eq!(
            caps.family_of_checkpoint("flux1-schnell.safetensors").map(|f| f.family),
            Some(ModelFamily::Flux1Schnell)
        );
        assert!(caps.family_of_checkpoint("missing.ckpt").is_none());
        assert_eq!(caps.checkpoints().count(), 2);
    }
}
