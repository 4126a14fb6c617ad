//! Job graph representation and the graph builder.
//!
//! A ComfyUI job graph on the wire is an object keyed by node id:
//!
//! ```json
//! {
//!   "3": { "class_type": "KSampler", "inputs": { "seed": 0, "steps": 25, ... } },
//!   "5": { "class_type": "EmptyLatentImage", "inputs": { "width": 1024, ... } }
//! }
//! ```
//!
//! Internally [`JobGraph`] keeps the nodes plus a binding from each
//! [`NodeRole`] to the node ids that play it, so overrides target roles
//! rather than magic string keys. Translation to and from the wire shape
//! happens only through [`JobGraph::from_wire`] and [`JobGraph::to_wire`].

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::BuildError;
use crate::request::{JobRequest, JobSettings};
use crate::types::NodeId;

// ---------------------------------------------------------------------------
// ComfyUI node class types used for role discovery
// ---------------------------------------------------------------------------

const KSAMPLER_CLASS: &str = "KSampler";
const EMPTY_LATENT_CLASS: &str = "EmptyLatentImage";
const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";
const LOAD_LORA_CLASS: &str = "LoraLoader";

/// Conventional node ids for the prompt encoders when titles are absent.
const POSITIVE_PROMPT_NODE_ID: &str = "6";
const NEGATIVE_PROMPT_NODE_ID: &str = "7";

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// The parts of a job graph that job parameters are written into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Step count, guidance, sampler and scheduler.
    SamplerSettings,
    Seed,
    /// Latent width, height and batch size.
    Dimensions,
    PositivePrompt,
    NegativePrompt,
    LoraStrength,
}

impl NodeRole {
    pub const ALL: [NodeRole; 6] = [
        NodeRole::SamplerSettings,
        NodeRole::Seed,
        NodeRole::Dimensions,
        NodeRole::PositivePrompt,
        NodeRole::NegativePrompt,
        NodeRole::LoraStrength,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SamplerSettings => "sampler_settings",
            Self::Seed => "seed",
            Self::Dimensions => "dimensions",
            Self::PositivePrompt => "positive_prompt",
            Self::NegativePrompt => "negative_prompt",
            Self::LoraStrength => "lora_strength",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A single node: its class and literal or linked inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub class_type: String,
    pub inputs: Map<String, Value>,
    /// Display title from `_meta.title`, if any.
    pub title: Option<String>,
}

/// A parameterizable job graph.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobGraph {
    nodes: BTreeMap<NodeId, GraphNode>,
    roles: BTreeMap<NodeRole, Vec<NodeId>>,
}

impl JobGraph {
    /// Parse a wire-format graph and discover its node roles.
    ///
    /// Accepts the API shape (object keyed by node id) as well as a list of
    /// node objects carrying an `id` field, either bare or under a `nodes`
    /// key. Non-object values at the top level are treated as metadata and
    /// skipped. Nodes without `class_type` are rejected: that is the
    /// graph-editor export shape, which the server cannot execute.
    pub fn from_wire(json: &Value) -> Result<Self, BuildError> {
        let entries = normalize_entries(json)?;
        let mut nodes = BTreeMap::new();

        for (node_id, node_value) in entries {
            let Some(obj) = node_value.as_object() else {
                continue;
            };

            let class_type = match obj.get("class_type").and_then(Value::as_str) {
                Some(c) => c.to_string(),
                None if obj.contains_key("type") => {
                    return Err(BuildError::InvalidTemplate(format!(
                        "node '{node_id}' is in graph-editor export format (no 'class_type')"
                    )))
                }
                None => {
                    return Err(BuildError::InvalidTemplate(format!(
                        "node '{node_id}' is missing required 'class_type' field"
                    )))
                }
            };

            let inputs = obj
                .get("inputs")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let title = obj
                .get("_meta")
                .and_then(|m| m.get("title"))
                .and_then(Value::as_str)
                .map(str::to_string);

            nodes.insert(
                node_id,
                GraphNode {
                    class_type,
                    inputs,
                    title,
                },
            );
        }

        if nodes.is_empty() {
            return Err(BuildError::InvalidTemplate(
                "graph must contain at least one node".to_string(),
            ));
        }

        let roles = discover_roles(&nodes);
        Ok(Self { nodes, roles })
    }

    /// The built-in SDXL + LoRA text-to-image graph.
    pub fn builtin() -> Self {
        Self::from_wire(&builtin_template_json()).expect("built-in template is well-formed")
    }

    /// Serialize to the server's string-keyed wire format.
    pub fn to_wire(&self) -> Value {
        let mut out = Map::new();
        for (id, node) in &self.nodes {
            let mut obj = Map::new();
            obj.insert("inputs".to_string(), Value::Object(node.inputs.clone()));
            obj.insert("class_type".to_string(), Value::String(node.class_type.clone()));
            if let Some(title) = &node.title {
                obj.insert("_meta".to_string(), json!({ "title": title }));
            }
            out.insert(id.clone(), Value::Object(obj));
        }
        Value::Object(out)
    }

    /// Literal value of `input` on node `id`.
    pub fn input(&self, id: &str, input: &str) -> Option<&Value> {
        self.nodes.get(id).and_then(|n| n.inputs.get(input))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids bound to `role` (empty if none).
    pub fn nodes_for(&self, role: NodeRole) -> &[NodeId] {
        self.roles.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Roles with no node bound.
    pub fn missing_roles(&self) -> Vec<NodeRole> {
        NodeRole::ALL
            .into_iter()
            .filter(|r| self.nodes_for(*r).is_empty())
            .collect()
    }

    /// Bind `role` to exactly `node_id`, replacing any discovered binding.
    pub fn bind(&mut self, role: NodeRole, node_id: &str) -> Result<(), BuildError> {
        if !self.nodes.contains_key(node_id) {
            return Err(BuildError::mismatch(
                role,
                format!("node '{node_id}' does not exist in the template"),
            ));
        }
        self.roles.insert(role, vec![node_id.to_string()]);
        Ok(())
    }

    /// Write `value` into `input` on every node bound to `role`.
    ///
    /// The input must already exist on each node and must not be a link to
    /// another node's output.
    fn set_input(&mut self, role: NodeRole, input: &str, value: Value) -> Result<(), BuildError> {
        let ids = self.roles.get(&role).cloned().unwrap_or_default();
        if ids.is_empty() {
            return Err(BuildError::mismatch(role, "no node in the template plays this role"));
        }

        for id in ids {
            let node = self.nodes.get_mut(&id).ok_or_else(|| {
                BuildError::mismatch(role, format!("bound node '{id}' does not exist"))
            })?;
            match node.inputs.get_mut(input) {
                None => {
                    return Err(BuildError::mismatch(
                        role,
                        format!("node '{id}' ({}) has no input '{input}'", node.class_type),
                    ))
                }
                Some(existing) if existing.is_array() => {
                    return Err(BuildError::mismatch(
                        role,
                        format!("input '{input}' on node '{id}' is linked to another node"),
                    ))
                }
                Some(existing) => *existing = value.clone(),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Resolve `request` and apply it to a copy of `template`.
pub fn build(template: &JobGraph, request: &JobRequest) -> Result<JobGraph, BuildError> {
    let settings = request.resolve()?;
    apply_settings(template, &settings)
}

/// Apply already-resolved settings to a copy of `template`.
///
/// Every role must be bound and every targeted input must exist; a
/// partially parameterized graph is never returned.
pub fn apply_settings(template: &JobGraph, settings: &JobSettings) -> Result<JobGraph, BuildError> {
    if let Some(role) = template.missing_roles().into_iter().next() {
        return Err(BuildError::mismatch(role, "no node in the template plays this role"));
    }

    let mut graph = template.clone();
    for (role, input, value) in overrides(settings) {
        graph.set_input(role, input, value)?;
    }
    Ok(graph)
}

/// The enumerated (role, input, value) writes a job performs.
fn overrides(s: &JobSettings) -> Vec<(NodeRole, &'static str, Value)> {
    vec![
        (NodeRole::SamplerSettings, "steps", json!(s.steps)),
        (NodeRole::SamplerSettings, "cfg", json!(s.cfg_scale)),
        (NodeRole::SamplerSettings, "sampler_name", json!(s.sampler_name)),
        (NodeRole::SamplerSettings, "scheduler", json!(s.scheduler)),
        (NodeRole::Seed, "seed", json!(s.seed)),
        (NodeRole::Dimensions, "width", json!(s.width)),
        (NodeRole::Dimensions, "height", json!(s.height)),
        (NodeRole::Dimensions, "batch_size", json!(s.num_images)),
        (NodeRole::PositivePrompt, "text", json!(s.positive_prompt)),
        (NodeRole::NegativePrompt, "text", json!(s.negative_prompt)),
        (NodeRole::LoraStrength, "strength_model", json!(s.lora_strength)),
        (NodeRole::LoraStrength, "strength_clip", json!(s.lora_strength)),
    ]
}

// ---- private helpers ----

/// Flatten the accepted top-level shapes into `(node_id, node)` pairs.
fn normalize_entries(json: &Value) -> Result<Vec<(NodeId, Value)>, BuildError> {
    let list = match json {
        Value::Object(obj) => match obj.get("nodes") {
            Some(Value::Array(list)) => list,
            _ => {
                return Ok(obj
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect())
            }
        },
        Value::Array(list) => list,
        _ => {
            return Err(BuildError::InvalidTemplate(
                "graph must be a JSON object or list of nodes".to_string(),
            ))
        }
    };

    Ok(list
        .iter()
        .filter_map(|n| {
            let id = match n.get("id")? {
                Value::String(s) if !s.is_empty() => s.clone(),
                Value::Number(num) => num.to_string(),
                _ => return None,
            };
            Some((id, n.clone()))
        })
        .collect())
}

fn discover_roles(nodes: &BTreeMap<NodeId, GraphNode>) -> BTreeMap<NodeRole, Vec<NodeId>> {
    let mut roles: BTreeMap<NodeRole, Vec<NodeId>> = BTreeMap::new();
    let mut bind = |role: NodeRole, id: &NodeId| roles.entry(role).or_default().push(id.clone());

    for (id, node) in nodes {
        match node.class_type.as_str() {
            KSAMPLER_CLASS => {
                bind(NodeRole::SamplerSettings, id);
                bind(NodeRole::Seed, id);
            }
            EMPTY_LATENT_CLASS => bind(NodeRole::Dimensions, id),
            LOAD_LORA_CLASS => bind(NodeRole::LoraStrength, id),
            CLIP_TEXT_ENCODE_CLASS => {
                let title = node.title.as_deref().unwrap_or("").to_lowercase();
                if title.contains("negative") {
                    bind(NodeRole::NegativePrompt, id);
                } else if title.contains("positive") {
                    bind(NodeRole::PositivePrompt, id);
                } else if id == NEGATIVE_PROMPT_NODE_ID {
                    bind(NodeRole::NegativePrompt, id);
                } else if id == POSITIVE_PROMPT_NODE_ID {
                    bind(NodeRole::PositivePrompt, id);
                }
            }
            _ => {}
        }
    }
    roles
}

fn builtin_template_json() -> Value {
    json!({
        "3": {
            "inputs": {
                "seed": 0,
                "steps": 25,
                "cfg": 7.5,
                "sampler_name": "dpmpp_2m_sde",
                "scheduler": "karras",
                "denoise": 1.0,
                "model": ["10", 0],
                "positive": ["6", 0],
                "negative": ["7", 0],
                "latent_image": ["5", 0]
            },
            "class_type": "KSampler"
        },
        "4": {
            "inputs": { "vae_name": "sdxl_vae.safetensors" },
            "class_type": "VAELoader"
        },
        "5": {
            "inputs": { "width": 1024, "height": 1024, "batch_size": 1 },
            "class_type": "EmptyLatentImage"
        },
        "6": {
            "inputs": {
                "text": "avachar, professional photo, high quality, detailed face, sharp focus, 8k uhd, dslr, studio lighting",
                "clip": ["10", 1]
            },
            "class_type": "CLIPTextEncode",
            "_meta": { "title": "CLIP Text Encode (Positive)" }
        },
        "7": {
            "inputs": {
                "text": "ugly, deformed, blurry, low quality, noise, watermark, text, oversaturated, bad anatomy, disfigured",
                "clip": ["10", 1]
            },
            "class_type": "CLIPTextEncode",
            "_meta": { "title": "CLIP Text Encode (Negative)" }
        },
        "8": {
            "inputs": { "samples": ["3", 0], "vae": ["4", 0] },
            "class_type": "VAEDecode"
        },
        "9": {
            "inputs": { "filename_prefix": "avatar", "images": ["8", 0] },
            "class_type": "SaveImage"
        },
        "10": {
            "inputs": {
                "lora_name": "avatar_lora.safetensors",
                "strength_model": 0.85,
                "strength_clip": 0.85,
                "model": ["11", 0],
                "clip": ["11", 1]
            },
            "class_type": "LoraLoader"
        },
        "11": {
            "inputs": { "ckpt_name": "sd_xl_base_1.0.safetensors" },
            "class_type": "CheckpointLoaderSimple"
        }
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn fox_request() -> JobRequest {
        JobRequest {
            positive_prompt: Some("a fox".into()),
            steps: Some(10_i64.into()),
            seed: Some(42_i64.into()),
            output_format: Some("jpg".into()),
            ..Default::default()
        }
    }

    #[test]
    fn builtin_template_binds_every_role() {
        let graph = JobGraph::builtin();
        assert!(graph.missing_roles().is_empty());
        assert_eq!(graph.nodes_for(NodeRole::SamplerSettings), ["3".to_string()]);
        assert_eq!(graph.nodes_for(NodeRole::PositivePrompt), ["6".to_string()]);
        assert_eq!(graph.nodes_for(NodeRole::NegativePrompt), ["7".to_string()]);
        assert_eq!(graph.nodes_for(NodeRole::LoraStrength), ["10".to_string()]);
    }

    #[test]
    fn build_applies_every_override() {
        let template = JobGraph::builtin();
        let graph = build(&template, &fox_request()).unwrap();

        assert_eq!(graph.input("6", "text"), Some(&json!("a fox")));
        assert_eq!(graph.input("3", "steps"), Some(&json!(10)));
        assert_eq!(graph.input("3", "seed"), Some(&json!(42)));
        assert_eq!(graph.input("3", "cfg"), Some(&json!(7.5)));
        assert_eq!(graph.input("3", "sampler_name"), Some(&json!("dpmpp_2m_sde")));
        assert_eq!(graph.input("5", "width"), Some(&json!(1024)));
        assert_eq!(graph.input("5", "batch_size"), Some(&json!(1)));
        assert_eq!(graph.input("10", "strength_clip"), Some(&json!(0.85)));
        // Links are untouched.
        assert_eq!(graph.input("3", "model"), Some(&json!(["10", 0])));
    }

    #[test]
    fn build_does_not_mutate_template() {
        let template = JobGraph::builtin();
        let before = template.clone();
        let _ = build(&template, &fox_request()).unwrap();
        assert_eq!(template, before);
    }

    #[test]
    fn clamped_values_reach_the_graph() {
        let request = JobRequest {
            steps: Some(9999_i64.into()),
            width: Some(100_000_i64.into()),
            ..Default::default()
        };
        let graph = build(&JobGraph::builtin(), &request).unwrap();
        assert_eq!(graph.input("3", "steps"), Some(&json!(150)));
        assert_eq!(graph.input("5", "width"), Some(&json!(2048)));
    }

    #[test]
    fn template_without_lora_node_is_a_mismatch() {
        let mut json = builtin_template_json();
        json.as_object_mut().unwrap().remove("10");
        let template = JobGraph::from_wire(&json).unwrap();

        let err = build(&template, &fox_request()).unwrap_err();
        assert_matches!(
            err,
            BuildError::TemplateMismatch {
                role: NodeRole::LoraStrength,
                ..
            }
        );
    }

    #[test]
    fn missing_input_on_bound_node_is_a_mismatch() {
        let mut json = builtin_template_json();
        json["3"]["inputs"].as_object_mut().unwrap().remove("scheduler");
        let template = JobGraph::from_wire(&json).unwrap();

        let err = build(&template, &fox_request()).unwrap_err();
        assert_matches!(
            err,
            BuildError::TemplateMismatch {
                role: NodeRole::SamplerSettings,
                ..
            }
        );
    }

    #[test]
    fn linked_input_is_not_overwritten() {
        let mut json = builtin_template_json();
        json["6"]["inputs"]["text"] = json!(["12", 0]);
        let template = JobGraph::from_wire(&json).unwrap();

        let err = build(&template, &fox_request()).unwrap_err();
        assert_matches!(
            err,
            BuildError::TemplateMismatch {
                role: NodeRole::PositivePrompt,
                ..
            }
        );
    }

    #[test]
    fn binding_unknown_node_is_a_mismatch() {
        let mut graph = JobGraph::builtin();
        let err = graph.bind(NodeRole::Seed, "999").unwrap_err();
        assert_matches!(err, BuildError::TemplateMismatch { role: NodeRole::Seed, .. });
    }

    #[test]
    fn explicit_binding_redirects_override() {
        let mut json = builtin_template_json();
        json["12"] = json!({
            "inputs": { "text": "extra", "clip": ["10", 1] },
            "class_type": "CLIPTextEncode"
        });
        let mut template = JobGraph::from_wire(&json).unwrap();
        template.bind(NodeRole::PositivePrompt, "12").unwrap();

        let graph = build(&template, &fox_request()).unwrap();
        assert_eq!(graph.input("12", "text"), Some(&json!("a fox")));
        assert_ne!(graph.input("6", "text"), Some(&json!("a fox")));
    }

    #[test]
    fn prompt_roles_fall_back_to_conventional_ids() {
        let mut json = builtin_template_json();
        json["6"].as_object_mut().unwrap().remove("_meta");
        json["7"].as_object_mut().unwrap().remove("_meta");
        let graph = JobGraph::from_wire(&json).unwrap();
        assert_eq!(graph.nodes_for(NodeRole::PositivePrompt), ["6".to_string()]);
        assert_eq!(graph.nodes_for(NodeRole::NegativePrompt), ["7".to_string()]);
    }

    #[test]
    fn node_list_shape_is_normalized() {
        let json = json!({
            "nodes": [
                { "id": 5, "class_type": "EmptyLatentImage", "inputs": { "width": 512 } },
                { "id": "9", "class_type": "SaveImage", "inputs": {} }
            ]
        });
        let graph = JobGraph::from_wire(&json).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.input("5", "width"), Some(&json!(512)));
        assert_eq!(graph.nodes_for(NodeRole::Dimensions), ["5".to_string()]);
    }

    #[test]
    fn graph_editor_export_is_rejected() {
        let json = json!({ "nodes": [ { "id": 3, "type": "KSampler", "widgets_values": [] } ] });
        assert_matches!(JobGraph::from_wire(&json), Err(BuildError::InvalidTemplate(_)));
    }

    #[test]
    fn top_level_metadata_is_skipped() {
        let mut json = builtin_template_json();
        json["version"] = json!(0.4);
        let graph = JobGraph::from_wire(&json).unwrap();
        assert_eq!(graph.len(), JobGraph::builtin().len());
    }

    #[test]
    fn empty_or_scalar_graph_is_rejected() {
        assert_matches!(JobGraph::from_wire(&json!({})), Err(BuildError::InvalidTemplate(_)));
        assert_matches!(JobGraph::from_wire(&json!(42)), Err(BuildError::InvalidTemplate(_)));
    }

    #[test]
    fn wire_round_trip_preserves_titles_and_inputs() {
        let graph = JobGraph::builtin();
        let wire = graph.to_wire();
        assert_eq!(wire["6"]["_meta"]["title"], "CLIP Text Encode (Positive)");
        assert_eq!(wire["9"]["class_type"], "SaveImage");
        assert_eq!(JobGraph::from_wire(&wire).unwrap(), graph);
    }
}
