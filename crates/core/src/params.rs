//! Generation parameters, material slider values, and their validation.
//!
//! [`GenerationInputs`] is what the host UI collects for one generate
//! action. Everything in it is validated before any network job exists.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// Defaults and limits
// ---------------------------------------------------------------------------

pub const DEFAULT_PROMPT: &str = "wood planks";
pub const DEFAULT_SAMPLER: &str = "dpmpp_2m_sde_gpu";
pub const DEFAULT_SCHEDULER: &str = "normal";
pub const DEFAULT_STEPS: u32 = 30;
pub const DEFAULT_CFG_SCALE: f64 = 5.5;
pub const DEFAULT_SIZE: u32 = 1024;
pub const DEFAULT_SEED: u64 = 42;

pub const MIN_STEPS: u32 = 1;
pub const MAX_STEPS: u32 = 150;
pub const MIN_CFG_SCALE: f64 = 0.0;
pub const MAX_CFG_SCALE: f64 = 30.0;
pub const MIN_SIZE: u32 = 64;
pub const MAX_SIZE: u32 = 4096;
pub const MIN_LORA_STRENGTH: f64 = 0.0;
pub const MAX_LORA_STRENGTH: f64 = 3.0;

/// Inclusive bounds for randomly drawn seeds.
pub const RANDOM_SEED_MIN: u64 = 1;
pub const RANDOM_SEED_MAX: u64 = 1_000_000;

/// Maximum number of texture maps in one texture-only request.
pub const MAX_TEXTURE_MAPS: usize = 8;

pub const MAX_NORMAL_STRENGTH: f64 = 10.0;
pub const MAX_EMISSION: f64 = 100.0;
pub const MIN_IOR: f64 = 1.0;
pub const MAX_IOR: f64 = 4.0;

// ---------------------------------------------------------------------------
// Sampling parameters
// ---------------------------------------------------------------------------

/// Optional LoRA stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSelection {
    /// LoRA filename as installed on the backend.
    pub name: String,
    /// Weight applied to both the model and the text encoder.
    pub strength: f64,
}

/// Optional upscale stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpscaleSelection {
    /// Upscale model filename as installed on the backend.
    pub model: String,
}

/// Sampling parameters bound into the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub checkpoint: String,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    /// Apply the quality-keyword rewrite before binding.
    #[serde(default)]
    pub enhance: bool,
    pub seed: u64,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler: String,
    pub scheduler: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub lora: Option<LoraSelection>,
    #[serde(default)]
    pub upscale: Option<UpscaleSelection>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            checkpoint: String::new(),
            prompt: DEFAULT_PROMPT.to_string(),
            negative_prompt: String::new(),
            enhance: true,
            seed: DEFAULT_SEED,
            steps: DEFAULT_STEPS,
            cfg_scale: DEFAULT_CFG_SCALE,
            sampler: DEFAULT_SAMPLER.to_string(),
            scheduler: DEFAULT_SCHEDULER.to_string(),
            width: DEFAULT_SIZE,
            height: DEFAULT_SIZE,
            lora: None,
            upscale: None,
        }
    }
}

/// How the seed is chosen at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedMode {
    /// Use [`GenerationParams::seed`] as given.
    Fixed,
    /// Draw a fresh seed in `RANDOM_SEED_MIN..=RANDOM_SEED_MAX`.
    #[default]
    Random,
}

// ---------------------------------------------------------------------------
// Output kind
// ---------------------------------------------------------------------------

/// A texture map the host can wire into a material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureMap {
    BaseColor,
    Roughness,
    Normal,
    Height,
    Metallic,
    AmbientOcclusion,
    Emission,
    Opacity,
}

impl TextureMap {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextureMap::BaseColor => "base_color",
            TextureMap::Roughness => "roughness",
            TextureMap::Normal => "normal",
            TextureMap::Height => "height",
            TextureMap::Metallic => "metallic",
            TextureMap::AmbientOcclusion => "ambient_occlusion",
            TextureMap::Emission => "emission",
            TextureMap::Opacity => "opacity",
        }
    }
}

/// What the finished images are for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputKind {
    /// One image that becomes the base of a full material with controls.
    Material,
    /// One image per requested map, applied without building controls.
    TextureOnly { maps: Vec<TextureMap> },
}

impl OutputKind {
    /// Number of images the backend is expected to produce.
    pub fn output_count(&self) -> u32 {
        match self {
            OutputKind::Material => 1,
            OutputKind::TextureOnly { maps } => maps.len() as u32,
        }
    }

    /// Map assigned to the artifact at `index`, if any.
    pub fn map_at(&self, index: usize) -> Option<TextureMap> {
        match self {
            OutputKind::Material => None,
            OutputKind::TextureOnly { maps } => maps.get(index).copied(),
        }
    }

    pub fn is_material(&self) -> bool {
        matches!(self, OutputKind::Material)
    }
}

// ---------------------------------------------------------------------------
// Material controls
// ---------------------------------------------------------------------------

/// Two-stop color ramp (positions of the black and white stops).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorRamp {
    pub black: f64,
    pub white: f64,
}

impl Default for ColorRamp {
    fn default() -> Self {
        Self {
            black: 0.0,
            white: 1.0,
        }
    }
}

/// Slider values for the material control group. Passed through to the
/// materializer exactly as bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialControls {
    pub metallic: f64,
    pub roughness: f64,
    pub normal_strength: f64,
    pub emission: f64,
    pub alpha: f64,
    pub specular: f64,
    pub ior: f64,
    pub transmission: f64,
    pub bump_ramp: ColorRamp,
    pub displacement_ramp: ColorRamp,
}

impl Default for MaterialControls {
    fn default() -> Self {
        Self {
            metallic: 0.0,
            roughness: 0.8,
            normal_strength: 0.1,
            emission: 0.0,
            alpha: 1.0,
            specular: 0.5,
            ior: 1.5,
            transmission: 0.0,
            bump_ramp: ColorRamp::default(),
            displacement_ramp: ColorRamp::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Everything the user supplies for one generate action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationInputs {
    pub params: GenerationParams,
    pub seed_mode: SeedMode,
    pub output: OutputKind,
    pub controls: MaterialControls,
    /// Free-form notes stored with the history entry.
    #[serde(default)]
    pub notes: String,
}

impl Default for GenerationInputs {
    fn default() -> Self {
        Self {
            params: GenerationParams::default(),
            seed_mode: SeedMode::default(),
            output: OutputKind::Material,
            controls: MaterialControls::default(),
            notes: String::new(),
        }
    }
}

impl GenerationInputs {
    /// Validate every user-supplied value. Fails on the first problem.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_params(&self.params)?;
        validate_output(&self.output)?;
        validate_controls(&self.controls)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    // NaN fails both comparisons and is rejected here too.
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

fn check_unit(field: &'static str, value: f64) -> Result<(), ValidationError> {
    check_range(field, value, 0.0, 1.0)
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::MissingField(field))
    } else {
        Ok(())
    }
}

/// Validate sampling parameters.
pub fn validate_params(params: &GenerationParams) -> Result<(), ValidationError> {
    require("prompt", &params.prompt)?;
    require("checkpoint", &params.checkpoint)?;
    require("sampler", &params.sampler)?;
    require("scheduler", &params.scheduler)?;

    check_range(
        "steps",
        f64::from(params.steps),
        f64::from(MIN_STEPS),
        f64::from(MAX_STEPS),
    )?;
    check_range("cfg_scale", params.cfg_scale, MIN_CFG_SCALE, MAX_CFG_SCALE)?;
    check_range(
        "width",
        f64::from(params.width),
        f64::from(MIN_SIZE),
        f64::from(MAX_SIZE),
    )?;
    check_range(
        "height",
        f64::from(params.height),
        f64::from(MIN_SIZE),
        f64::from(MAX_SIZE),
    )?;

    if let Some(lora) = &params.lora {
        require("lora.name", &lora.name)?;
        check_range(
            "lora.strength",
            lora.strength,
            MIN_LORA_STRENGTH,
            MAX_LORA_STRENGTH,
        )?;
    }
    if let Some(upscale) = &params.upscale {
        require("upscale.model", &upscale.model)?;
    }
    Ok(())
}

/// Validate the requested output kind.
pub fn validate_output(output: &OutputKind) -> Result<(), ValidationError> {
    if let OutputKind::TextureOnly { maps } = output {
        if maps.is_empty() {
            return Err(ValidationError::MissingField("texture_maps"));
        }
        check_range(
            "texture_maps",
            maps.len() as f64,
            1.0,
            MAX_TEXTURE_MAPS as f64,
        )?;
    }
    Ok(())
}

fn validate_ramp(field: &'static str, ramp: &ColorRamp) -> Result<(), ValidationError> {
    check_unit(field, ramp.black)?;
    check_unit(field, ramp.white)?;
    // The black stop may not pass the white stop.
    check_range(field, ramp.black, 0.0, ramp.white)
}

/// Validate material slider values against their documented ranges.
pub fn validate_controls(controls: &MaterialControls) -> Result<(), ValidationError> {
    check_unit("metallic", controls.metallic)?;
    check_unit("roughness", controls.roughness)?;
    check_range("normal_strength", controls.normal_strength, 0.0, MAX_NORMAL_STRENGTH)?;
    check_range("emission", controls.emission, 0.0, MAX_EMISSION)?;
    check_unit("alpha", controls.alpha)?;
    check_unit("specular", controls.specular)?;
    check_range("ior", controls.ior, MIN_IOR, MAX_IOR)?;
    check_unit("transmission", controls.transmission)?;
    validate_ramp("bump_ramp", &controls.bump_ramp)?;
    validate_ramp("displacement_ramp", &controls.displacement_ramp)
}
