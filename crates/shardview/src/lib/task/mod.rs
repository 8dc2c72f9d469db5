//! One reassembly run against an inference backend
//!
//! An [`AssemblyTask`] validates the uploaded fragments, opens a single
//! exchange with the backend, folds the streamed envelopes into per-step pose
//! histories and answers "where is fragment `i` at step `s`" from memory.
//!
//! Steps are addressed by an integer cursor: `-2` is the untouched input,
//! `-1` the backend's initial pose guess, and `0..n` the optimization steps
//! recorded so far.

mod error;
mod status;

pub use error::TaskError;
pub use status::{InvalidTransition, RunSignal, TaskStatus};

use crate::lib::backend::InferenceBackend;
use crate::lib::events::{EventBus, EventKind, SubscriptionId, TaskEvent};
use crate::lib::geometry::FragmentGeometry;
use crate::lib::transformation::Transformation;
use shardview_network::{
    AssembleRequest, Envelope, InferenceSettings, InputData, MeshFile, MeshType, Payload, Stage,
    TransformationData,
};
use tracing::{debug, error, info, warn};

/// Fracture segmentation is only taken from the first few recorded steps
const FRACTURE_SEGMENTATION_STEP_LIMIT: usize = 6;

/// Typed view of the step cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StepRef {
    /// `-2`: meshes as uploaded
    RawInput,
    /// `-1`: the backend's working frame
    Initial,
    /// `0..`: a recorded optimization step
    Optimized(usize),
}

impl StepRef {
    pub fn from_cursor(step: i64) -> Option<Self> {
        match step {
            -2 => Some(StepRef::RawInput),
            -1 => Some(StepRef::Initial),
            s if s >= 0 => usize::try_from(s).ok().map(StepRef::Optimized),
            _ => None,
        }
    }

    pub fn cursor(&self) -> i64 {
        match self {
            StepRef::RawInput => -2,
            StepRef::Initial => -1,
            StepRef::Optimized(s) => *s as i64,
        }
    }
}

/// Display metadata of one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentInfo {
    pub label: String,
}

/// Whether the exchange should keep being read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeFlow {
    Continue,
    Finished,
}

pub struct AssemblyTask {
    files: Vec<MeshFile>,
    remote_paths: Option<Vec<String>>,
    mesh_type: MeshType,
    fragments: Vec<FragmentInfo>,
    objects: Vec<Option<Box<dyn FragmentGeometry>>>,

    status: TaskStatus,
    total_steps: u32,
    current_step: i64,
    mesh_scale: f64,

    initial_transformations: Vec<Transformation>,
    transformations: Vec<Vec<Transformation>>,
    original_transformations: Vec<Vec<Transformation>>,
    point_clouds: Vec<Vec<[f64; 3]>>,
    fracture_surfaces: Vec<Vec<[f64; 3]>>,

    events: EventBus,
}

impl AssemblyTask {
    /// Create a task from at least two mesh files sharing one format
    pub fn new(files: Vec<MeshFile>) -> Result<Self, TaskError> {
        if files.len() < 2 {
            return Err(TaskError::InvalidInput(format!(
                "at least 2 fragments are required, got {}",
                files.len()
            )));
        }

        let mesh_type = files[0].mesh_type().ok_or_else(|| {
            TaskError::InvalidInput(format!("{} is not an .obj or .ply file", files[0].name))
        })?;
        if let Some(other) = files.iter().find(|f| f.mesh_type() != Some(mesh_type)) {
            return Err(TaskError::InvalidInput(format!(
                "{} does not match the {} format of {}",
                other.name, mesh_type, files[0].name
            )));
        }

        let fragments = files
            .iter()
            .map(|f| FragmentInfo {
                label: f.name.clone(),
            })
            .collect();
        let objects = files.iter().map(|_| None).collect();

        debug!("Created task with {} {} fragments", files.len(), mesh_type);

        Ok(Self {
            files,
            remote_paths: None,
            mesh_type,
            fragments,
            objects,
            status: TaskStatus::Init,
            total_steps: 0,
            current_step: -2,
            mesh_scale: 1.0,
            initial_transformations: Vec::new(),
            transformations: Vec::new(),
            original_transformations: Vec::new(),
            point_clouds: Vec::new(),
            fracture_surfaces: Vec::new(),
            events: EventBus::new(),
        })
    }

    /// Submit pre-uploaded paths instead of the file blobs
    ///
    /// `paths[i]` must name the same fragment as the `i`-th file.
    pub fn with_remote_paths(mut self, paths: Vec<String>) -> Result<Self, TaskError> {
        if paths.len() != self.files.len() {
            return Err(TaskError::InvalidInput(format!(
                "{} remote paths given for {} fragments",
                paths.len(),
                self.files.len()
            )));
        }
        self.remote_paths = Some(paths);
        Ok(self)
    }

    // ---- notifications -------------------------------------------------

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&TaskEvent) + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    fn emit_status(&mut self, step: Option<i64>, total_steps: Option<u32>) {
        let event = TaskEvent::StatusUpdate {
            status: self.status,
            step,
            total_steps,
        };
        self.events.emit(&event);
    }

    fn emit_step(&mut self) {
        let event = TaskEvent::Step {
            index: self.current_step,
            total_steps: self.total_steps,
        };
        self.events.emit(&event);
    }

    // ---- run -----------------------------------------------------------

    /// Run one exchange to its end and return the final status
    ///
    /// Backend and transport failures end in [`TaskStatus::Failed`] rather
    /// than an `Err`; only a rejected start is returned as an error, either
    /// [`TaskError::AlreadyRunning`] or [`TaskError::InvalidSettings`].
    pub fn start_assemble<B: InferenceBackend>(
        &mut self,
        settings: InferenceSettings,
        backend: &mut B,
    ) -> Result<TaskStatus, TaskError> {
        let request = self.begin_run(settings)?;

        let stream = match backend.submit(&request) {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_run(&format!("submission failed: {e}"));
                return Ok(self.status);
            }
        };

        for item in stream {
            match item {
                Ok(envelope) => {
                    if self.handle_envelope(envelope) == ExchangeFlow::Finished {
                        return Ok(self.status);
                    }
                }
                Err(e) => {
                    self.fail_run(&format!("exchange failed: {e}"));
                    return Ok(self.status);
                }
            }
        }

        if self.status.is_in_flight() {
            self.fail_run("exchange closed before the run finished");
        }
        Ok(self.status)
    }

    /// Reset the run state and build the submission for a new run
    pub fn begin_run(&mut self, settings: InferenceSettings) -> Result<AssembleRequest, TaskError> {
        let next = self
            .status
            .transition(RunSignal::Start)
            .map_err(|_| TaskError::AlreadyRunning(self.status))?;
        settings.validate().map_err(TaskError::InvalidSettings)?;

        self.initial_transformations.clear();
        self.transformations.clear();
        self.original_transformations.clear();
        self.point_clouds.clear();
        self.fracture_surfaces.clear();
        self.current_step = -2;
        self.total_steps = settings.total_steps();
        self.status = next;

        info!(
            "Starting assembly of {} fragments ({} steps expected)",
            self.fragment_count(),
            self.total_steps
        );
        self.emit_status(None, None);
        self.emit_step();

        Ok(match &self.remote_paths {
            Some(paths) => AssembleRequest::with_remote_paths(paths.clone(), self.mesh_type, settings),
            None => AssembleRequest::with_files(self.files.clone(), self.mesh_type, settings),
        })
    }

    /// Fold one envelope from the exchange into the task
    pub fn handle_envelope(&mut self, envelope: Envelope) -> ExchangeFlow {
        if !self.status.is_in_flight() {
            warn!("Ignoring envelope received while task is {}", self.status);
            return ExchangeFlow::Finished;
        }

        match envelope {
            Envelope::Status { stage, message } => self.handle_stage(stage, message),
            Envelope::Data { payload } => match self.handle_payload(payload) {
                Ok(()) => ExchangeFlow::Continue,
                Err(reason) => {
                    self.fail_run(&reason);
                    ExchangeFlow::Finished
                }
            },
            Envelope::Log { level, message } => {
                debug!("Backend log ({:?}): {}", level, message);
                ExchangeFlow::Continue
            }
        }
    }

    /// Mark the in-flight run as failed and notify observers
    pub fn fail_run(&mut self, reason: &str) {
        match self.status.transition(RunSignal::Fail) {
            Ok(next) => {
                error!("Assembly failed: {}", reason);
                self.status = next;
                self.emit_status(None, None);
            }
            Err(e) => warn!("Ignoring failure ({}): {}", reason, e),
        }
    }

    fn apply(&mut self, signal: RunSignal) -> bool {
        match self.status.transition(signal) {
            Ok(next) => {
                debug!("Task status {} -> {}", self.status, next);
                self.status = next;
                true
            }
            Err(e) => {
                warn!("Ignoring backend message: {}", e);
                false
            }
        }
    }

    fn handle_stage(&mut self, stage: Stage, message: Option<String>) -> ExchangeFlow {
        match stage {
            Stage::Pending => {
                if self.apply(RunSignal::Pending) {
                    self.emit_status(None, None);
                }
                ExchangeFlow::Continue
            }
            Stage::Generating => {
                if self.apply(RunSignal::Generating) {
                    self.emit_status(Some(self.current_step + 1), Some(self.total_steps));
                }
                ExchangeFlow::Continue
            }
            Stage::Error => {
                let reason = message.unwrap_or_else(|| "backend reported an error".to_string());
                self.fail_run(&reason);
                ExchangeFlow::Finished
            }
            Stage::Complete => {
                if self.apply(RunSignal::Complete) {
                    info!(
                        "Assembly complete after {} steps",
                        self.transformations.len()
                    );
                    self.emit_status(None, None);
                }
                ExchangeFlow::Finished
            }
        }
    }

    /// Malformed input or transformation data fails the run. A malformed
    /// fracture segmentation is dropped since the backend resends it.
    fn handle_payload(&mut self, payload: Payload) -> Result<(), String> {
        match payload {
            Payload::MeshScale(scale) => {
                if scale != self.mesh_scale {
                    self.set_mesh_scale(scale);
                }
            }
            Payload::Input(data) => self.record_input(data)?,
            Payload::FractureSegmentation(surfaces) => {
                if self.transformations.len() < FRACTURE_SEGMENTATION_STEP_LIMIT {
                    if surfaces.len() != self.fragment_count() {
                        warn!(
                            "Dropping fracture segmentation with {} entries for {} fragments",
                            surfaces.len(),
                            self.fragment_count()
                        );
                        return Ok(());
                    }
                    self.fracture_surfaces = surfaces;
                    let event = TaskEvent::FractureSurfaces(self.fracture_surfaces.clone());
                    self.events.emit(&event);
                } else {
                    debug!(
                        "Discarding fracture segmentation after {} steps",
                        self.transformations.len()
                    );
                }
            }
            Payload::Transformation(data) => self.record_step(data)?,
            Payload::Metrics(metrics) => {
                self.events.emit(&TaskEvent::Metrics(metrics));
            }
        }
        Ok(())
    }

    fn record_input(&mut self, data: InputData) -> Result<(), String> {
        data.validate(self.fragment_count())?;

        self.initial_transformations = data
            .initial_translation
            .iter()
            .zip(&data.initial_rotation)
            .map(|(t, r)| Transformation::from_arrays(*t, *r))
            .collect();
        self.point_clouds = data.pointclouds;
        self.current_step = -1;

        let event = TaskEvent::PointClouds(self.point_clouds.clone());
        self.events.emit(&event);
        self.emit_step();
        Ok(())
    }

    fn record_step(&mut self, data: TransformationData) -> Result<(), String> {
        if self.initial_transformations.is_empty() {
            return Err("transformation received before input".to_string());
        }
        data.validate(self.fragment_count())?;

        let raw: Vec<Transformation> = data
            .translation
            .iter()
            .zip(&data.rotation)
            .map(|(t, r)| Transformation::from_arrays(*t, *r))
            .collect();
        let normalized = raw
            .iter()
            .zip(&self.initial_transformations)
            .map(|(pose, initial)| pose.apply_transformation(&initial.inverse()))
            .collect();

        self.original_transformations.push(raw);
        self.transformations.push(normalized);
        self.current_step = self.transformations.len() as i64 - 1;
        self.emit_step();
        Ok(())
    }

    fn set_mesh_scale(&mut self, scale: f64) {
        debug!("Mesh scale {} -> {}", self.mesh_scale, scale);
        self.mesh_scale = scale;
        self.events.emit(&TaskEvent::MeshScale(scale));
    }

    // ---- geometry ------------------------------------------------------

    /// Attach the loaded geometry of one fragment
    ///
    /// Once every fragment has geometry, the mesh scale is recomputed from the
    /// largest bounding-box extent (never below 1.0). This overwrites any
    /// scale the backend reported, and a later backend value overwrites it.
    pub fn set_object<G>(&mut self, index: usize, geometry: G) -> Result<(), TaskError>
    where
        G: FragmentGeometry + 'static,
    {
        self.check_fragment(index)?;
        self.objects[index] = Some(Box::new(geometry));

        let extents: Option<Vec<f64>> = self
            .objects
            .iter()
            .map(|o| o.as_ref().map(|g| g.bounds().max_extent()))
            .collect();
        if let Some(extents) = extents {
            let scale = extents.into_iter().fold(1.0, f64::max);
            self.set_mesh_scale(scale);
        }
        Ok(())
    }

    pub fn object(&self, index: usize) -> Option<&dyn FragmentGeometry> {
        self.objects.get(index)?.as_deref()
    }

    // ---- queries -------------------------------------------------------

    fn check_fragment(&self, index: usize) -> Result<(), TaskError> {
        if index >= self.fragment_count() {
            return Err(TaskError::IndexOutOfRange(format!(
                "fragment {index} of {}",
                self.fragment_count()
            )));
        }
        Ok(())
    }

    pub fn get_mesh(&self, index: usize) -> Result<&MeshFile, TaskError> {
        self.check_fragment(index)?;
        Ok(&self.files[index])
    }

    /// Sampled surface points, empty until the backend sent them
    pub fn get_point_cloud(&self, index: usize) -> Result<&[[f64; 3]], TaskError> {
        self.check_fragment(index)?;
        Ok(self.point_clouds.get(index).map_or(&[][..], Vec::as_slice))
    }

    /// Fracture-surface points, empty until the backend sent them
    pub fn get_fracture_surface(&self, index: usize) -> Result<&[[f64; 3]], TaskError> {
        self.check_fragment(index)?;
        Ok(self
            .fracture_surfaces
            .get(index)
            .map_or(&[][..], Vec::as_slice))
    }

    /// Pose of a fragment at `step`, or at the current step when `None`
    pub fn get_transformation(
        &self,
        index: usize,
        step: Option<i64>,
    ) -> Result<Transformation, TaskError> {
        self.check_fragment(index)?;
        let step = step.unwrap_or(self.current_step);

        match StepRef::from_cursor(step) {
            Some(StepRef::RawInput) => Ok(Transformation::identity()),
            Some(StepRef::Initial) => self
                .initial_transformations
                .get(index)
                .map(Transformation::inverse)
                .ok_or_else(|| {
                    TaskError::IndexOutOfRange("no initial transformation recorded yet".to_string())
                }),
            Some(StepRef::Optimized(s)) => self
                .transformations
                .get(s)
                .map(|poses| poses[index])
                .ok_or_else(|| {
                    TaskError::IndexOutOfRange(format!(
                        "step {s} of {} recorded",
                        self.transformations.len()
                    ))
                }),
            None => Err(TaskError::IndexOutOfRange(format!("step {step}"))),
        }
    }

    /// Normalized pose history of one fragment, oldest first
    pub fn get_transformations(&self, index: usize) -> Result<Vec<Transformation>, TaskError> {
        self.check_fragment(index)?;
        Ok(self.transformations.iter().map(|poses| poses[index]).collect())
    }

    pub fn current_step(&self) -> i64 {
        self.current_step
    }

    /// Move the cursor; accepted range is `[-2, history_len - 1]`
    pub fn set_current_step(&mut self, step: i64) -> Result<(), TaskError> {
        let last = self.transformations.len() as i64 - 1;
        if !(-2..=last).contains(&step) {
            return Err(TaskError::InvalidStep { step, last });
        }
        self.current_step = step;
        self.emit_step();
        Ok(())
    }

    pub fn current_step_ref(&self) -> Option<StepRef> {
        StepRef::from_cursor(self.current_step)
    }

    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn mesh_scale(&self) -> f64 {
        self.mesh_scale
    }

    pub fn mesh_type(&self) -> MeshType {
        self.mesh_type
    }

    pub fn fragment_count(&self) -> usize {
        self.files.len()
    }

    pub fn fragments(&self) -> &[FragmentInfo] {
        &self.fragments
    }

    pub fn remote_paths(&self) -> Option<&[String]> {
        self.remote_paths.as_deref()
    }

    /// Number of recorded optimization steps
    pub fn history_len(&self) -> usize {
        self.transformations.len()
    }

    pub fn initial_transformations(&self) -> &[Transformation] {
        &self.initial_transformations
    }

    /// Raw backend poses, indexed by step then fragment
    pub fn original_transformations(&self) -> &[Vec<Transformation>] {
        &self.original_transformations
    }

    pub fn point_clouds(&self) -> &[Vec<[f64; 3]>] {
        &self.point_clouds
    }

    /// Serialize the run as a replayable JSON record
    pub fn export_json(&self, name: &str) -> Result<String, TaskError> {
        Ok(crate::lib::export::ExportRecord::from_task(self, name).to_json()?)
    }
}

impl std::fmt::Debug for AssemblyTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssemblyTask")
            .field("fragments", &self.fragments)
            .field("mesh_type", &self.mesh_type)
            .field("status", &self.status)
            .field("current_step", &self.current_step)
            .field("history_len", &self.transformations.len())
            .field("total_steps", &self.total_steps)
            .field("mesh_scale", &self.mesh_scale)
            .field("events", &self.events)
            .finish()
    }
}
