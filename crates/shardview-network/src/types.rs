//! Shared types for the inference exchange

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Operation name every submission is addressed to
pub const ASSEMBLE_OPERATION: &str = "/assemble";

/// Mesh file format shared by all fragments of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshType {
    Obj,
    Ply,
}

impl MeshType {
    /// Parse from a file extension (without the dot), ignoring case
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "obj" => Some(Self::Obj),
            "ply" => Some(Self::Ply),
            _ => None,
        }
    }

    /// Derive the mesh type from a file name such as `piece_0.obj`
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        Self::from_extension(ext)
    }

    /// Canonical extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            MeshType::Obj => "obj",
            MeshType::Ply => "ply",
        }
    }
}

impl fmt::Display for MeshType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// One uploaded mesh blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshFile {
    /// File name as supplied by the user (e.g. "piece_0.obj")
    pub name: String,
    /// Raw file contents, base64 encoded on the wire
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl MeshFile {
    /// Create a new mesh file
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Mesh type implied by the file extension, if supported
    pub fn mesh_type(&self) -> Option<MeshType> {
        MeshType::from_file_name(&self.name)
    }

    /// Size of the blob in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the blob is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Surface sampling strategy used by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleStrategy {
    #[default]
    Uniform,
    Poisson,
}

impl SampleStrategy {
    /// Parse from a settings/CLI string
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "uniform" => Ok(Self::Uniform),
            "poisson" => Ok(Self::Poisson),
            _ => Err(format!(
                "Unknown sample strategy: {s}. Valid options are: uniform, poisson"
            )),
        }
    }
}

/// Settings for one inference run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceSettings {
    /// Number of surface points sampled per fragment
    pub sample_points: u32,
    /// Diffusion steps per iteration
    pub steps: u32,
    /// Random seed forwarded to the backend
    pub seed: u64,
    /// Number of refinement iterations
    pub max_iterations: u32,
    /// Whether the backend reports one extra initialization step
    pub one_step_init: bool,
    pub sample_strategy: SampleStrategy,
    /// Optional LoRA checkpoint name, omitted when blank
    #[serde(default, skip_serializing_if = "is_blank")]
    pub lora_checkpoint: Option<String>,
    /// Optional model checkpoint name, omitted when blank
    #[serde(default, skip_serializing_if = "is_blank")]
    pub ckpt: Option<String>,
    /// Whether the backend may keep the submitted meshes
    pub data_collection: bool,
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, str::is_empty)
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            sample_points: 5000,
            steps: 20,
            seed: 42,
            max_iterations: 1,
            one_step_init: false,
            sample_strategy: SampleStrategy::Uniform,
            lora_checkpoint: None,
            ckpt: None,
            data_collection: false,
        }
    }
}

impl InferenceSettings {
    /// Number of transformation messages the backend is expected to send
    ///
    /// Saturates at `u32::MAX`; [`validate`](Self::validate) rejects settings
    /// where that would happen.
    pub fn total_steps(&self) -> u32 {
        self.checked_total_steps().unwrap_or(u32::MAX)
    }

    fn checked_total_steps(&self) -> Option<u32> {
        self.steps
            .checked_mul(self.max_iterations)?
            .checked_add(u32::from(self.one_step_init))
    }

    /// Validate the settings before submission
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_points == 0 {
            return Err("samplePoints must be positive".to_string());
        }
        if self.steps == 0 {
            return Err("steps must be positive".to_string());
        }
        if self.max_iterations == 0 {
            return Err("maxIterations must be positive".to_string());
        }
        if self.checked_total_steps().is_none() {
            return Err(format!(
                "steps ({}) times maxIterations ({}) is too large",
                self.steps, self.max_iterations
            ));
        }
        Ok(())
    }
}

/// A submission to the inference backend
///
/// Exactly one of `files` / `remote_paths` carries the fragments: uploaded
/// blobs go in `files` with an empty path list, pre-uploaded meshes go in
/// `remote_paths` with `files` unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembleRequest {
    pub operation: String,
    pub files: Option<Vec<MeshFile>>,
    pub remote_paths: Vec<String>,
    pub mesh_type: MeshType,
    pub settings: InferenceSettings,
}

impl AssembleRequest {
    /// Submission carrying the raw mesh blobs
    pub fn with_files(files: Vec<MeshFile>, mesh_type: MeshType, settings: InferenceSettings) -> Self {
        Self {
            operation: ASSEMBLE_OPERATION.to_string(),
            files: Some(files),
            remote_paths: Vec::new(),
            mesh_type,
            settings,
        }
    }

    /// Submission referencing meshes already present on the backend
    pub fn with_remote_paths(
        remote_paths: Vec<String>,
        mesh_type: MeshType,
        settings: InferenceSettings,
    ) -> Self {
        Self {
            operation: ASSEMBLE_OPERATION.to_string(),
            files: None,
            remote_paths,
            mesh_type,
            settings,
        }
    }

    /// Number of fragments in the submission
    pub fn fragment_count(&self) -> usize {
        match &self.files {
            Some(files) => files.len(),
            None => self.remote_paths.len(),
        }
    }
}

/// Lifecycle stage reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pending,
    Generating,
    Error,
    Complete,
}

impl Stage {
    /// Whether the exchange ends after this stage
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Error | Stage::Complete)
    }
}

/// Severity of a backend log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One message of the response stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum Envelope {
    /// Lifecycle record
    Status {
        stage: Stage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Data record wrapping exactly one payload
    Data { payload: Payload },
    /// Log record, not interpreted by the viewer
    Log { level: LogLevel, message: String },
}

impl Envelope {
    /// Lifecycle record without a message
    pub fn status(stage: Stage) -> Self {
        Envelope::Status {
            stage,
            message: None,
        }
    }

    /// Data record
    pub fn data(payload: Payload) -> Self {
        Envelope::Data { payload }
    }
}

/// Tagged payload of a data record, `{"type": ..., "data": ...}` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Normalization factor the backend applied to the meshes
    MeshScale(f64),
    /// Initial poses and sampled point clouds, sent once per run
    Input(InputData),
    /// Fracture-surface points per fragment
    FractureSegmentation(Vec<Vec<[f64; 3]>>),
    /// Per-fragment poses for one completed optimization step
    Transformation(TransformationData),
    /// Named evaluation metrics
    Metrics(BTreeMap<String, f64>),
}

impl Payload {
    /// Wire tag of this payload
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::MeshScale(_) => "mesh_scale",
            Payload::Input(_) => "input",
            Payload::FractureSegmentation(_) => "fracture_segmentation",
            Payload::Transformation(_) => "transformation",
            Payload::Metrics(_) => "metrics",
        }
    }
}

/// Backend's initial pose guess and sampled surface points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputData {
    /// Per-fragment translation (x, y, z)
    pub initial_translation: Vec<[f64; 3]>,
    /// Per-fragment rotation quaternion, scalar first (w, x, y, z)
    pub initial_rotation: Vec<[f64; 4]>,
    /// Per-fragment sampled surface points
    #[serde(default)]
    pub pointclouds: Vec<Vec<[f64; 3]>>,
}

impl InputData {
    /// Check the payload describes exactly `fragments` fragments
    pub fn validate(&self, fragments: usize) -> Result<(), String> {
        check_count("initial_translation", self.initial_translation.len(), fragments)?;
        check_count("initial_rotation", self.initial_rotation.len(), fragments)?;
        if !self.pointclouds.is_empty() {
            check_count("pointclouds", self.pointclouds.len(), fragments)?;
        }
        Ok(())
    }
}

/// Raw per-fragment poses reported for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationData {
    /// Per-fragment translation (x, y, z)
    pub translation: Vec<[f64; 3]>,
    /// Per-fragment rotation quaternion, scalar first (w, x, y, z)
    pub rotation: Vec<[f64; 4]>,
}

impl TransformationData {
    /// Check the payload describes exactly `fragments` fragments
    pub fn validate(&self, fragments: usize) -> Result<(), String> {
        check_count("translation", self.translation.len(), fragments)?;
        check_count("rotation", self.rotation.len(), fragments)
    }
}

fn check_count(field: &str, actual: usize, expected: usize) -> Result<(), String> {
    if actual != expected {
        return Err(format!(
            "{field} has {actual} entries but the run has {expected} fragments"
        ));
    }
    Ok(())
}
