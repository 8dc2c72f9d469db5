use shardview::app::cli::Args;
use shardview::lib::settings::{InferenceDefaults, Settings};
use shardview::{
    format_metrics, AssemblyTask, EventKind, MeshGeometry, PlaybackState, TaskEvent, TaskStatus,
};
use shardview_network::{InferenceClient, MeshFile};
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

fn read_mesh_file(path: &Path) -> std::io::Result<MeshFile> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(MeshFile::new(name, std::fs::read(path)?))
}

fn log_event(event: &TaskEvent) {
    match event {
        TaskEvent::StatusUpdate {
            status,
            step,
            total_steps,
        } => info!("[{}] {}", status, status.message(*step, *total_steps)),
        TaskEvent::Step { index, total_steps } => debug!("Step {}/{}", index, total_steps),
        TaskEvent::MeshScale(scale) => info!("Mesh scale set to {:.4}", scale),
        TaskEvent::PointClouds(clouds) => info!(
            "Received {} sampled points across {} fragments",
            clouds.iter().map(Vec::len).sum::<usize>(),
            clouds.len()
        ),
        TaskEvent::FractureSurfaces(surfaces) => info!(
            "Received fracture surfaces ({} points)",
            surfaces.iter().map(Vec::len).sum::<usize>()
        ),
        TaskEvent::Metrics(metrics) => {
            for (name, value) in format_metrics(metrics) {
                info!("  {}: {}", name, value);
            }
        }
    }
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse_args();
    init_logging(args.verbose);

    let settings_dir = args.settings_dir();
    let stored = match &settings_dir {
        Some(dir) => Settings::load_from_dir(dir)?.unwrap_or_default(),
        None => Settings::default(),
    };

    let mut inference = stored.inference_settings();
    args.apply_overrides(&mut inference);
    let backend = args.backend_settings(stored.backend());

    if args.save_settings {
        match &settings_dir {
            Some(dir) => Settings {
                backend: Some(backend.clone()),
                inference: Some(InferenceDefaults::from_settings(&inference)),
            }
            .save_to_dir(dir)?,
            None => warn!("No settings directory, not saving settings"),
        }
    }

    let paths = args.fragment_paths()?;
    info!("Found {} fragment files", paths.len());
    let files = paths
        .iter()
        .map(|p| read_mesh_file(p))
        .collect::<Result<Vec<_>, _>>()?;

    // Parse the meshes up front so the scale can be resolved locally
    let geometries = MeshGeometry::load_all(&files);

    let mut task = AssemblyTask::new(files)?;
    if !args.remote_paths.is_empty() {
        task = task.with_remote_paths(args.remote_paths.clone())?;
    }
    for kind in EventKind::ALL {
        task.subscribe(kind, log_event);
    }

    for (index, geometry) in geometries.into_iter().enumerate() {
        match geometry {
            Ok(geometry) => task.set_object(index, geometry)?,
            Err(e) => warn!("No local geometry for fragment {}: {}", index, e),
        }
    }

    let mut client = InferenceClient::with_config(backend.address(), backend.client_config())?;
    let status = task.start_assemble(inference, &mut client)?;

    let state = PlaybackState::from_task(&task);
    info!(
        "Run ended {} with {} of {} steps recorded",
        status, state.recorded_steps, state.total_steps
    );

    if let Some(path) = &args.export {
        std::fs::write(path, task.export_json(&args.name)?)?;
        info!("Exported run to {:?}", path);
    }

    Ok(if status == TaskStatus::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
