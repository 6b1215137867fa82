//! Base model families and checkpoint-name detection.
//!
//! The backend only reports checkpoint filenames, so the family is
//! inferred from naming conventions used by the model distributors.

use serde::{Deserialize, Serialize};

/// A diffusion base model family. Each family needs a differently shaped
/// workflow graph (e.g. Flux routes guidance through a dedicated node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "SD1.5")]
    Sd15,
    #[serde(rename = "SDXL")]
    Sdxl,
    #[serde(rename = "FLUX.1-dev")]
    Flux1Dev,
    #[serde(rename = "FLUX.1-schnell")]
    Flux1Schnell,
}

impl ModelFamily {
    /// Every known family, in display order.
    pub const ALL: [ModelFamily; 4] = [
        ModelFamily::Sd15,
        ModelFamily::Sdxl,
        ModelFamily::Flux1Dev,
        ModelFamily::Flux1Schnell,
    ];

    /// Canonical family tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Sd15 => "SD1.5",
            ModelFamily::Sdxl => "SDXL",
            ModelFamily::Flux1Dev => "FLUX.1-dev",
            ModelFamily::Flux1Schnell => "FLUX.1-schnell",
        }
    }

    /// Exact lookup by canonical tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == tag)
    }

    pub fn is_flux(&self) -> bool {
        matches!(self, ModelFamily::Flux1Dev | ModelFamily::Flux1Schnell)
    }

    /// Infer the family from a checkpoint filename.
    ///
    /// - contains `flux` and `schnell` -> `FLUX.1-schnell`
    /// - contains `flux` -> `FLUX.1-dev`
    /// - contains `sdxl`, or `xl` delimited by `_`/`-` -> `SDXL`
    /// - anything else -> `SD1.5`
    pub fn detect(checkpoint: &str) -> Self {
        let name = checkpoint.to_lowercase();
        if name.contains("flux") {
            if name.contains("schnell") {
                ModelFamily::Flux1Schnell
            } else {
                ModelFamily::Flux1Dev
            }
        } else if name.contains("sdxl")
            || name.contains("_xl")
            || name.contains("-xl")
            || name.contains("xl_")
            || name.contains("xl-")
        {
            ModelFamily::Sdxl
        } else {
            ModelFamily::Sd15
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_flux_variants() {
        assert_eq!(ModelFamily::detect("flux1-dev-fp8.safetensors"), ModelFamily::Flux1Dev);
        assert_eq!(
            ModelFamily::detect("FLUX1-Schnell.safetensors"),
            ModelFamily::Flux1Schnell
        );
    }

    #[test]
    fn detects_sdxl() {
        assert_eq!(ModelFamily::detect("sd_xl_base_1.0.safetensors"), ModelFamily::Sdxl);
        assert_eq!(ModelFamily::detect("juggernautXL_v9.safetensors"), ModelFamily::Sdxl);
        assert_eq!(ModelFamily::detect("dreamshaper-xl-turbo.safetensors"), ModelFamily::Sdxl);
        assert_eq!(ModelFamily::detect("SDXL_lightning.ckpt"), ModelFamily::Sdxl);
    }

    #[test]
    fn falls_back_to_sd15() {
        assert_eq!(
            ModelFamily::detect("v1-5-pruned-emaonly.safetensors"),
            ModelFamily::Sd15
        );
    }

    #[test]
    fn tag_lookup_is_exact() {
        for family in ModelFamily::ALL {
            assert_eq!(ModelFamily::from_tag(family.as_str()), Some(family));
        }
        assert_eq!(ModelFamily::from_tag("flux.1-dev"), None);
    }

    #[test]
    fn serializes_as_tag() {
        let json = serde_json::to_string(&ModelFamily::Flux1Dev).unwrap();
        assert_eq!(json, "\"FLUX.1-dev\"");
    }
}
