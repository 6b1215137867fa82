//! Parametrized workflow templates.
//!
//! A template is a ComfyUI API-format graph (node id -> `{class_type,
//! inputs}`) whose nodes are tagged with the role they play, so the engine
//! can bind values by role instead of by hard-coded node id. Templates are
//! immutable once loaded; binding works on a [`WorkflowGraph`] copy.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capabilities::Feature;
use crate::family::ModelFamily;

// ---------------------------------------------------------------------------
// Node class types
// ---------------------------------------------------------------------------

pub const CHECKPOINT_LOADER_CLASS: &str = "CheckpointLoaderSimple";
pub const LORA_LOADER_CLASS: &str = "LoraLoader";
pub const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";
pub const FLUX_GUIDANCE_CLASS: &str = "FluxGuidance";
pub const EMPTY_LATENT_CLASS: &str = "EmptyLatentImage";
pub const EMPTY_SD3_LATENT_CLASS: &str = "EmptySD3LatentImage";
pub const KSAMPLER_CLASS: &str = "KSampler";
pub const VAE_DECODE_CLASS: &str = "VAEDecode";
pub const UPSCALE_LOADER_CLASS: &str = "UpscaleModelLoader";
pub const UPSCALE_WITH_MODEL_CLASS: &str = "ImageUpscaleWithModel";
pub const SAVE_IMAGE_CLASS: &str = "SaveImage";

/// Node types every compatible backend must register.
pub const REQUIRED_CORE_NODES: &[&str] = &[
    CHECKPOINT_LOADER_CLASS,
    KSAMPLER_CLASS,
    CLIP_TEXT_ENCODE_CLASS,
    EMPTY_LATENT_CLASS,
    VAE_DECODE_CLASS,
    SAVE_IMAGE_CLASS,
];

/// Roles every template must fill.
const REQUIRED_ROLES: &[SlotRole] = &[
    SlotRole::Checkpoint,
    SlotRole::PositivePrompt,
    SlotRole::NegativePrompt,
    SlotRole::Latent,
    SlotRole::Sampler,
    SlotRole::Decode,
    SlotRole::Save,
];

/// Hops allowed when tracing sampler conditioning back to a text encoder.
const MAX_CONDITIONING_DEPTH: usize = 8;

const GENERIC_WORKFLOW: &str = include_str!("../workflows/generic.json");
const FLUX_WORKFLOW: &str = include_str!("../workflows/flux.json");

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("Workflow JSON is invalid: {0}")]
    Parse(String),

    #[error("Workflow JSON must be a non-empty object of nodes")]
    NotAnObject,

    #[error("Node '{0}' is missing required 'class_type' field")]
    MissingClassType(String),

    #[error("Template '{template}' has no {role} slot")]
    MissingSlot { template: String, role: SlotRole },

    #[error("Template '{template}' has more than one {role} slot")]
    AmbiguousSlot { template: String, role: SlotRole },

    #[error("Node '{0}' does not exist in the workflow graph")]
    UnknownNode(String),
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// What a node does in the generation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotRole {
    Checkpoint,
    Lora,
    PositivePrompt,
    NegativePrompt,
    Guidance,
    Latent,
    Sampler,
    Decode,
    UpscaleLoader,
    Upscale,
    Save,
    Other,
}

impl SlotRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotRole::Checkpoint => "checkpoint",
            SlotRole::Lora => "lora",
            SlotRole::PositivePrompt => "positive_prompt",
            SlotRole::NegativePrompt => "negative_prompt",
            SlotRole::Guidance => "guidance",
            SlotRole::Latent => "latent",
            SlotRole::Sampler => "sampler",
            SlotRole::Decode => "decode",
            SlotRole::UpscaleLoader => "upscale_loader",
            SlotRole::Upscale => "upscale",
            SlotRole::Save => "save",
            SlotRole::Other => "other",
        }
    }

    /// Role implied by the class type alone. Text encoders are resolved
    /// later from the sampler's conditioning links.
    fn from_class_type(class_type: &str) -> Self {
        match class_type {
            CHECKPOINT_LOADER_CLASS => SlotRole::Checkpoint,
            LORA_LOADER_CLASS => SlotRole::Lora,
            FLUX_GUIDANCE_CLASS => SlotRole::Guidance,
            EMPTY_LATENT_CLASS | EMPTY_SD3_LATENT_CLASS => SlotRole::Latent,
            KSAMPLER_CLASS => SlotRole::Sampler,
            VAE_DECODE_CLASS => SlotRole::Decode,
            UPSCALE_LOADER_CLASS => SlotRole::UpscaleLoader,
            UPSCALE_WITH_MODEL_CLASS => SlotRole::Upscale,
            SAVE_IMAGE_CLASS => SlotRole::Save,
            _ => SlotRole::Other,
        }
    }
}

impl std::fmt::Display for SlotRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a template, tagged with its role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSlot {
    pub id: String,
    pub class_type: String,
    pub role: SlotRole,
    pub inputs: Map<String, Value>,
}

/// Which families a template serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "family", rename_all = "snake_case")]
pub enum TemplateFamily {
    Exact(ModelFamily),
    Generic,
}

impl std::fmt::Display for TemplateFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateFamily::Exact(family) => write!(f, "{family}"),
            TemplateFamily::Generic => f.write_str("generic"),
        }
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// An immutable, role-tagged workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    pub family: TemplateFamily,
    /// Nodes ordered by numeric id.
    pub slots: Vec<NodeSlot>,
}

impl WorkflowTemplate {
    /// Parse a template from API-format workflow JSON text.
    pub fn from_json(
        name: impl Into<String>,
        family: TemplateFamily,
        json: &str,
    ) -> Result<Self, TemplateError> {
        let graph: Value =
            serde_json::from_str(json).map_err(|e| TemplateError::Parse(e.to_string()))?;
        Self::from_graph(name, family, &graph)
    }

    /// Build a template from an API-format workflow graph.
    ///
    /// Every node must carry a `class_type`. The positive and negative text
    /// encoders are identified by following the sampler's `positive` and
    /// `negative` links (through a guidance node if present).
    pub fn from_graph(
        name: impl Into<String>,
        family: TemplateFamily,
        graph: &Value,
    ) -> Result<Self, TemplateError> {
        let name = name.into();
        let obj = graph
            .as_object()
            .filter(|o| !o.is_empty())
            .ok_or(TemplateError::NotAnObject)?;

        let mut slots = Vec::with_capacity(obj.len());
        for (node_id, node) in obj {
            let class_type = node
                .get("class_type")
                .and_then(Value::as_str)
                .ok_or_else(|| TemplateError::MissingClassType(node_id.clone()))?
                .to_string();
            let inputs = node
                .get("inputs")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            slots.push(NodeSlot {
                id: node_id.clone(),
                role: SlotRole::from_class_type(&class_type),
                class_type,
                inputs,
            });
        }
        slots.sort_by(|a, b| node_order(&a.id, &b.id));

        let mut template = Self {
            name,
            family,
            slots,
        };
        template.resolve_encoders()?;
        template.check_roles()?;
        Ok(template)
    }

    /// Template for any family without a dedicated graph.
    pub fn builtin_generic() -> Result<Self, TemplateError> {
        Self::from_json("generic", TemplateFamily::Generic, GENERIC_WORKFLOW)
    }

    /// Flux graph (guidance node, SD3 latent) for the given Flux family.
    pub fn builtin_flux(family: ModelFamily) -> Result<Self, TemplateError> {
        Self::from_json("flux", TemplateFamily::Exact(family), FLUX_WORKFLOW)
    }

    pub fn slot(&self, role: SlotRole) -> Option<&NodeSlot> {
        self.slots.iter().find(|s| s.role == role)
    }

    /// Whether the graph has slots for an optional stage.
    pub fn accepts(&self, feature: Feature) -> bool {
        match feature {
            Feature::Lora => self.slot(SlotRole::Lora).is_some(),
            Feature::Upscale => {
                self.slot(SlotRole::UpscaleLoader).is_some()
                    && self.slot(SlotRole::Upscale).is_some()
            }
        }
    }

    /// Whether sampler guidance goes through a dedicated guidance node.
    pub fn routes_guidance(&self) -> bool {
        self.slot(SlotRole::Guidance).is_some()
    }

    /// Names of the user inputs this template binds.
    pub fn required_inputs(&self) -> Vec<&'static str> {
        let mut inputs = vec![
            "checkpoint",
            "prompt",
            "negative_prompt",
            "seed",
            "steps",
            "cfg_scale",
            "sampler",
            "scheduler",
            "width",
            "height",
        ];
        if self.accepts(Feature::Lora) {
            inputs.push("lora");
        }
        if self.accepts(Feature::Upscale) {
            inputs.push("upscale");
        }
        inputs
    }

    /// Fresh mutable copy of the graph for binding.
    pub fn instantiate(&self) -> WorkflowGraph {
        let nodes = self
            .slots
            .iter()
            .map(|slot| {
                let mut node = Map::new();
                node.insert("class_type".into(), Value::String(slot.class_type.clone()));
                node.insert("inputs".into(), Value::Object(slot.inputs.clone()));
                (slot.id.clone(), Value::Object(node))
            })
            .collect();
        WorkflowGraph(nodes)
    }

    // -- internals --

    fn resolve_encoders(&mut self) -> Result<(), TemplateError> {
        let Some(sampler) = self.slot(SlotRole::Sampler) else {
            return Ok(());
        };
        let positive = self.trace_encoder(sampler.inputs.get("positive"));
        let negative = self.trace_encoder(sampler.inputs.get("negative"));

        for slot in &mut self.slots {
            if Some(&slot.id) == positive.as_ref() {
                slot.role = SlotRole::PositivePrompt;
            } else if Some(&slot.id) == negative.as_ref() {
                slot.role = SlotRole::NegativePrompt;
            }
        }
        Ok(())
    }

    fn trace_encoder(&self, link: Option<&Value>) -> Option<String> {
        let mut current = link_source(link?)?;
        for _ in 0..MAX_CONDITIONING_DEPTH {
            let node = self.slots.iter().find(|s| s.id == current)?;
            match node.class_type.as_str() {
                CLIP_TEXT_ENCODE_CLASS => return Some(current),
                FLUX_GUIDANCE_CLASS => {
                    current = link_source(node.inputs.get("conditioning")?)?;
                }
                _ => return None,
            }
        }
        None
    }

    fn check_roles(&self) -> Result<(), TemplateError> {
        let mut required: Vec<SlotRole> = REQUIRED_ROLES.to_vec();
        if matches!(self.family, TemplateFamily::Exact(f) if f.is_flux()) {
            required.push(SlotRole::Guidance);
        }
        for role in required {
            if self.slot(role).is_none() {
                return Err(TemplateError::MissingSlot {
                    template: self.name.clone(),
                    role,
                });
            }
        }
        for role in [
            SlotRole::Checkpoint,
            SlotRole::Lora,
            SlotRole::Sampler,
            SlotRole::Latent,
            SlotRole::Save,
            SlotRole::Guidance,
        ] {
            if self.slots.iter().filter(|s| s.role == role).count() > 1 {
                return Err(TemplateError::AmbiguousSlot {
                    template: self.name.clone(),
                    role,
                });
            }
        }
        Ok(())
    }
}

/// Source node id of a `[node_id, output_index]` link.
fn link_source(value: &Value) -> Option<String> {
    let arr = value.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    match &arr[0] {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn node_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

// ---------------------------------------------------------------------------
// Concrete graph
// ---------------------------------------------------------------------------

/// A concrete API-format graph ready to submit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph(Map<String, Value>);

impl WorkflowGraph {
    fn inputs_mut(&mut self, node: &str) -> Result<&mut Map<String, Value>, TemplateError> {
        self.0
            .get_mut(node)
            .and_then(|n| n.as_object_mut())
            .and_then(|n| {
                n.entry("inputs")
                    .or_insert_with(|| Value::Object(Map::new()))
                    .as_object_mut()
            })
            .ok_or_else(|| TemplateError::UnknownNode(node.to_string()))
    }

    /// Set a literal input value.
    pub fn set_input(
        &mut self,
        node: &str,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(), TemplateError> {
        self.inputs_mut(node)?.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Wire `node.key` to output `output` of node `from`.
    pub fn link(
        &mut self,
        node: &str,
        key: &str,
        from: &str,
        output: u32,
    ) -> Result<(), TemplateError> {
        if !self.0.contains_key(from) {
            return Err(TemplateError::UnknownNode(from.to_string()));
        }
        let link = Value::Array(vec![Value::String(from.to_string()), Value::from(output)]);
        self.inputs_mut(node)?.insert(key.to_string(), link);
        Ok(())
    }

    /// Drop a node. Removing an absent node is a no-op.
    pub fn remove_node(&mut self, node: &str) {
        self.0.remove(node);
    }

    pub fn contains(&self, node: &str) -> bool {
        self.0.contains_key(node)
    }

    pub fn input(&self, node: &str, key: &str) -> Option<&Value> {
        self.0.get(node)?.get("inputs")?.get(key)
    }

    /// Source node id of the link stored at `node.key`, if it is a link.
    pub fn linked_from(&self, node: &str, key: &str) -> Option<String> {
        link_source(self.input(node, key)?)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// The graph as the JSON value sent in `POST /prompt`.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}
