use serde::{Deserialize, Serialize};

/// Seed value meaning "pick a random seed".
pub const RANDOM_SEED: i64 = -1;

/// A named, weighted modifier applied on top of the resident base resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub name: String,
    #[serde(default = "default_overlay_weight")]
    pub weight: f32,
}

fn default_overlay_weight() -> f32 {
    1.0
}

impl Overlay {
    pub fn new(name: impl Into<String>, weight: f32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }

    /// Identity used by the resource cache: the name with any file extension
    /// stripped (`style.safetensors` -> `style`).
    pub fn id(&self) -> &str {
        overlay_id(&self.name)
    }
}

/// Strip a trailing file extension from an overlay name.
pub fn overlay_id(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Image generation knobs shared by every image request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageParams {
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub cfg_scale: Option<f32>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// [`RANDOM_SEED`] means the backend picks one.
    #[serde(default = "default_seed")]
    pub seed: i64,
}

fn default_batch_size() -> u32 {
    1
}

fn default_seed() -> i64 {
    RANDOM_SEED
}

impl Default for ImageParams {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            steps: None,
            cfg_scale: None,
            batch_size: default_batch_size(),
            seed: default_seed(),
        }
    }
}

/// Plain prompt-to-image request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub params: ImageParams,
}

/// Prompt-to-image request conditioned on a reference subject image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub params: ImageParams,
    /// Path of the subject image, relative to the backend's image directory.
    pub subject_image: String,
    pub subject_scale: f32,
}

/// Synthesis parameters carried by a task. Opaque to the dispatcher and the
/// resource cache; only backends look inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SynthesisRequest {
    TextToImage(ImageRequest),
    SubjectToImage(SubjectRequest),
}

impl SynthesisRequest {
    pub fn prompt(&self) -> &str {
        match self {
            SynthesisRequest::TextToImage(r) => &r.prompt,
            SynthesisRequest::SubjectToImage(r) => &r.prompt,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SynthesisRequest::TextToImage(_) => "text_to_image",
            SynthesisRequest::SubjectToImage(_) => "subject_to_image",
        }
    }
}

/// Immutable unit of work read from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Globally unique per submission.
    pub task_id: String,
    /// Topic the task was read from; decides its priority class.
    pub topic: String,
    pub partition: i32,
    /// Position of the message in its topic-partition.
    pub broker_offset: i64,
    /// Base configuration that must be resident before synthesis.
    pub base_resource_id: String,
    /// Requested overlays, in producer order.
    pub overlays: Vec<Overlay>,
    pub payload: SynthesisRequest,
}
