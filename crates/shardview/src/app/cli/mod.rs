use crate::lib::settings::{resolve_settings_dir, BackendSettings};
use clap::Parser;
use glob::{MatchOptions, Pattern};
use shardview_network::{InferenceSettings, MeshType, SampleStrategy};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "shardview")]
#[command(
    about = "Submit fractured mesh fragments to a reassembly backend and record the poses it streams back",
    long_about = None
)]
pub struct Args {
    /// Mesh files (.obj or .ply), or a directory containing them
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// File name pattern used when a directory is given
    #[arg(long, default_value = "*")]
    pub pattern: String,

    /// Backend address (host:port)
    #[arg(short, long)]
    pub backend: Option<String>,

    /// Give up when the backend is silent for this many seconds
    #[arg(long, value_name = "SECS")]
    pub read_timeout: Option<u64>,

    /// Surface points sampled per fragment
    #[arg(long)]
    pub sample_points: Option<u32>,

    /// Diffusion steps per iteration
    #[arg(long)]
    pub steps: Option<u32>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Refinement iterations
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Ask the backend for an extra initialization step
    #[arg(long)]
    pub one_step_init: bool,

    /// Sampling strategy: 'uniform' or 'poisson'
    #[arg(long, value_parser = SampleStrategy::parse, value_name = "STRATEGY")]
    pub sample_strategy: Option<SampleStrategy>,

    #[arg(long)]
    pub lora_checkpoint: Option<String>,

    #[arg(long)]
    pub ckpt: Option<String>,

    /// Allow the backend to keep the submitted meshes
    #[arg(long)]
    pub data_collection: bool,

    /// Backend-side path of a fragment, in the same order as the files (repeatable)
    #[arg(long = "remote-path", value_name = "PATH")]
    pub remote_paths: Vec<String>,

    /// Write the recorded run as JSON to this file
    #[arg(short, long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Run name stored in the export
    #[arg(long, default_value = "assembly")]
    pub name: String,

    /// Directory holding shardview.toml (defaults to the fragment directory)
    #[arg(long, value_name = "DIR")]
    pub config: Option<PathBuf>,

    /// Store the effective backend and inference settings in shardview.toml
    #[arg(long)]
    pub save_settings: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Directory the settings file is read from and saved to
    pub fn settings_dir(&self) -> Option<PathBuf> {
        match &self.config {
            Some(dir) => Some(dir.clone()),
            None => self.paths.first().and_then(|p| resolve_settings_dir(p)),
        }
    }

    /// Apply command line overrides on top of the stored settings
    pub fn apply_overrides(&self, settings: &mut InferenceSettings) {
        if let Some(v) = self.sample_points {
            settings.sample_points = v;
        }
        if let Some(v) = self.steps {
            settings.steps = v;
        }
        if let Some(v) = self.seed {
            settings.seed = v;
        }
        if let Some(v) = self.max_iterations {
            settings.max_iterations = v;
        }
        if self.one_step_init {
            settings.one_step_init = true;
        }
        if let Some(v) = self.sample_strategy {
            settings.sample_strategy = v;
        }
        if let Some(v) = &self.lora_checkpoint {
            settings.lora_checkpoint = Some(v.clone());
        }
        if let Some(v) = &self.ckpt {
            settings.ckpt = Some(v.clone());
        }
        if self.data_collection {
            settings.data_collection = true;
        }
    }

    pub fn backend_settings(&self, stored: BackendSettings) -> BackendSettings {
        BackendSettings {
            address: self.backend.clone().or(stored.address),
            connect_timeout_secs: stored.connect_timeout_secs,
            read_timeout_secs: self.read_timeout.or(stored.read_timeout_secs),
        }
    }

    /// Expand the positional arguments into fragment files
    ///
    /// A single directory is scanned for `.obj`/`.ply` files matching
    /// `--pattern`, sorted by name. Explicit files are kept as given.
    pub fn fragment_paths(&self) -> std::io::Result<Vec<PathBuf>> {
        match self.paths.as_slice() {
            [dir] if dir.is_dir() => {
                let pattern = Pattern::new(&self.pattern).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Invalid pattern: {e}"),
                    )
                })?;
                discover_fragments(dir, &pattern)
            }
            paths => Ok(paths.to_vec()),
        }
    }
}

fn discover_fragments(dir: &Path, pattern: &Pattern) -> std::io::Result<Vec<PathBuf>> {
    let options = MatchOptions {
        case_sensitive: false,
        ..Default::default()
    };

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| {
                    MeshType::from_file_name(name).is_some()
                        && pattern.matches_with(name, options)
                })
        })
        .collect();
    files.sort();
    Ok(files)
}
