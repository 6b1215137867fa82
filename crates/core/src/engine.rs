//! Template selection and binding of user inputs into job requests.

use std::collections::HashMap;

use chrono::Utc;
use rand::Rng;

use crate::capabilities::{Capabilities, Feature};
use crate::enhance::Enhancement;
use crate::error::{BindError, CapabilityMismatchError, MismatchReason, UnsupportedModelError};
use crate::family::ModelFamily;
use crate::job::{BoundParameters, JobRequest};
use crate::params::{GenerationInputs, SeedMode, RANDOM_SEED_MAX, RANDOM_SEED_MIN};
use crate::template::{SlotRole, TemplateError, TemplateFamily, WorkflowGraph, WorkflowTemplate};
use crate::types::RequestId;

/// Default subfolder for files written by the save node.
pub const DEFAULT_OUTPUT_SUBFOLDER: &str = "texforge";

/// Sampler CFG pinned when guidance is routed through a guidance node.
const GUIDED_SAMPLER_CFG: f64 = 1.0;

/// Registered templates plus the binding policy.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    exact: HashMap<ModelFamily, WorkflowTemplate>,
    generic: Option<WorkflowTemplate>,
    enhancement: Enhancement,
    output_subfolder: String,
}

impl TemplateEngine {
    /// Engine with no templates registered.
    pub fn empty() -> Self {
        Self {
            exact: HashMap::new(),
            generic: None,
            enhancement: Enhancement::default(),
            output_subfolder: DEFAULT_OUTPUT_SUBFOLDER.to_string(),
        }
    }

    /// Engine with the bundled Flux and generic templates.
    pub fn builtin() -> Result<Self, TemplateError> {
        let mut engine = Self::empty();
        engine.register(WorkflowTemplate::builtin_flux(ModelFamily::Flux1Dev)?);
        engine.register(WorkflowTemplate::builtin_flux(ModelFamily::Flux1Schnell)?);
        engine.register(WorkflowTemplate::builtin_generic()?);
        Ok(engine)
    }

    pub fn with_enhancement(mut self, enhancement: Enhancement) -> Self {
        self.enhancement = enhancement;
        self
    }

    pub fn with_output_subfolder(mut self, subfolder: impl Into<String>) -> Self {
        self.output_subfolder = subfolder.into();
        self
    }

    /// Register a template, replacing any previous one for its family.
    pub fn register(&mut self, template: WorkflowTemplate) {
        match template.family {
            TemplateFamily::Exact(family) => {
                self.exact.insert(family, template);
            }
            TemplateFamily::Generic => self.generic = Some(template),
        }
    }

    pub fn enhancement(&self) -> &Enhancement {
        &self.enhancement
    }

    /// Exact match on family, else the generic template.
    pub fn select_template(
        &self,
        family: ModelFamily,
    ) -> Result<&WorkflowTemplate, UnsupportedModelError> {
        self.exact
            .get(&family)
            .or(self.generic.as_ref())
            .ok_or_else(|| UnsupportedModelError {
                model: family.as_str().to_string(),
            })
    }

    /// Detect the family of the chosen checkpoint, select its template and
    /// bind.
    pub fn prepare(
        &self,
        inputs: &GenerationInputs,
        caps: &Capabilities,
    ) -> Result<JobRequest, BindError> {
        inputs.validate()?;
        let family = checkpoint_family(inputs, caps)?;
        let template = self.select_template(family)?;
        self.bind(template, inputs, caps)
    }

    /// Bind user inputs into a concrete job against `template`.
    ///
    /// Checks happen in order: input validation, checkpoint installed,
    /// template family matches the checkpoint, optional-stage support (template slot, backend family, installed
    /// file). A requested LoRA or upscale stage is never silently dropped.
    pub fn bind(
        &self,
        template: &WorkflowTemplate,
        inputs: &GenerationInputs,
        caps: &Capabilities,
    ) -> Result<JobRequest, BindError> {
        inputs.validate()?;
        let family = checkpoint_family(inputs, caps)?;
        if let TemplateFamily::Exact(expected) = template.family {
            if expected != family {
                return Err(UnsupportedModelError {
                    model: inputs.params.checkpoint.clone(),
                }
                .into());
            }
        }
        let params = &inputs.params;

        if let Some(lora) = &params.lora {
            check_feature(template, caps, family, Feature::Lora, &lora.name)?;
        }
        if let Some(upscale) = &params.upscale {
            check_feature(template, caps, family, Feature::Upscale, &upscale.model)?;
        }

        let (seed, seed_randomized) = match inputs.seed_mode {
            SeedMode::Fixed => (params.seed, false),
            SeedMode::Random => (
                rand::rng().random_range(RANDOM_SEED_MIN..=RANDOM_SEED_MAX),
                true,
            ),
        };

        let (effective_prompt, effective_negative) =
            self.enhancement
                .apply(params.enhance, &params.prompt, &params.negative_prompt);

        let mut bound_params = params.clone();
        bound_params.seed = seed;

        let bound = BoundParameters {
            family,
            template: template.family,
            params: bound_params,
            effective_prompt,
            effective_negative,
            output: inputs.output.clone(),
            controls: inputs.controls.clone(),
        };

        let id = RequestId::now_v7();
        let workflow = self.build_graph(template, &bound, id)?;

        tracing::debug!(
            request_id = %id,
            family = %family,
            template = %template.name,
            seed,
            outputs = bound.output.output_count(),
            "Bound generation request"
        );

        Ok(JobRequest {
            id,
            created_at: Utc::now(),
            bound,
            seed_randomized,
            workflow,
            notes: inputs.notes.clone(),
        })
    }

    fn build_graph(
        &self,
        template: &WorkflowTemplate,
        bound: &BoundParameters,
        id: RequestId,
    ) -> Result<WorkflowGraph, TemplateError> {
        let slot_id = |role: SlotRole| -> Result<String, TemplateError> {
            template
                .slot(role)
                .map(|s| s.id.clone())
                .ok_or_else(|| TemplateError::MissingSlot {
                    template: template.name.clone(),
                    role,
                })
        };
        let params = &bound.params;
        let mut graph = template.instantiate();

        let checkpoint = slot_id(SlotRole::Checkpoint)?;
        let positive = slot_id(SlotRole::PositivePrompt)?;
        let negative = slot_id(SlotRole::NegativePrompt)?;
        let latent = slot_id(SlotRole::Latent)?;
        let sampler = slot_id(SlotRole::Sampler)?;
        let decode = slot_id(SlotRole::Decode)?;
        let save = slot_id(SlotRole::Save)?;

        graph.set_input(&checkpoint, "ckpt_name", params.checkpoint.as_str())?;
        graph.set_input(&positive, "text", bound.effective_prompt.as_str())?;
        graph.set_input(&negative, "text", bound.effective_negative.as_str())?;

        graph.set_input(&latent, "width", params.width)?;
        graph.set_input(&latent, "height", params.height)?;
        graph.set_input(&latent, "batch_size", bound.output.output_count())?;

        graph.set_input(&sampler, "seed", params.seed)?;
        graph.set_input(&sampler, "steps", params.steps)?;
        graph.set_input(&sampler, "sampler_name", params.sampler.as_str())?;
        graph.set_input(&sampler, "scheduler", params.scheduler.as_str())?;

        match template.slot(SlotRole::Guidance) {
            Some(guidance) => {
                graph.set_input(&guidance.id, "guidance", params.cfg_scale)?;
                graph.set_input(&sampler, "cfg", GUIDED_SAMPLER_CFG)?;
            }
            None => graph.set_input(&sampler, "cfg", params.cfg_scale)?,
        }

        // LoRA: sampler model and both text encoders read from the loader.
        let lora_slot = template.slot(SlotRole::Lora).map(|s| s.id.clone());
        match (&params.lora, lora_slot) {
            (Some(lora), Some(lora_id)) => {
                graph.set_input(&lora_id, "lora_name", lora.name.as_str())?;
                graph.set_input(&lora_id, "strength_model", lora.strength)?;
                graph.set_input(&lora_id, "strength_clip", lora.strength)?;
                graph.link(&sampler, "model", &lora_id, 0)?;
                graph.link(&positive, "clip", &lora_id, 1)?;
                graph.link(&negative, "clip", &lora_id, 1)?;
            }
            (_, Some(lora_id)) => graph.remove_node(&lora_id),
            (_, None) => {}
        }

        // Upscale: save node reads the upscaled image.
        let loader_slot = template.slot(SlotRole::UpscaleLoader).map(|s| s.id.clone());
        let upscale_slot = template.slot(SlotRole::Upscale).map(|s| s.id.clone());
        match (&params.upscale, loader_slot, upscale_slot) {
            (Some(upscale), Some(loader_id), Some(upscale_id)) => {
                graph.set_input(&loader_id, "model_name", upscale.model.as_str())?;
                graph.link(&upscale_id, "upscale_model", &loader_id, 0)?;
                graph.link(&upscale_id, "image", &decode, 0)?;
                graph.link(&save, "images", &upscale_id, 0)?;
            }
            (_, loader_id, upscale_id) => {
                for node in [loader_id, upscale_id].into_iter().flatten() {
                    graph.remove_node(&node);
                }
                graph.link(&save, "images", &decode, 0)?;
            }
        }

        graph.set_input(&save, "filename_prefix", output_prefix(&self.output_subfolder, id))?;
        Ok(graph)
    }
}

/// Save-node filename prefix for a request.
pub fn output_prefix(subfolder: &str, id: RequestId) -> String {
    let subfolder = subfolder.trim_matches('/');
    if subfolder.is_empty() {
        format!("{id}_output")
    } else {
        format!("{subfolder}/{id}_output")
    }
}

fn checkpoint_family(
    inputs: &GenerationInputs,
    caps: &Capabilities,
) -> Result<ModelFamily, UnsupportedModelError> {
    caps.family_of_checkpoint(&inputs.params.checkpoint)
        .map(|f| f.family)
        .ok_or_else(|| UnsupportedModelError {
            model: inputs.params.checkpoint.clone(),
        })
}

fn check_feature(
    template: &WorkflowTemplate,
    caps: &Capabilities,
    family: ModelFamily,
    feature: Feature,
    model: &str,
) -> Result<(), CapabilityMismatchError> {
    let mismatch = |reason| CapabilityMismatchError {
        feature,
        family,
        reason,
    };

    if !template.accepts(feature) {
        return Err(mismatch(MismatchReason::TemplateLacksSlot));
    }
    let advertised = caps
        .family(family)
        .map(|f| f.supports(feature))
        .unwrap_or(false);
    if !advertised {
        return Err(mismatch(MismatchReason::BackendLacksFeature));
    }
    let installed = match feature {
        Feature::Lora => caps.has_lora(model),
        Feature::Upscale => caps.has_upscaler(model),
    };
    if !installed {
        return Err(mismatch(MismatchReason::ModelNotInstalled(model.to_string())));
    }
    Ok(())
}
