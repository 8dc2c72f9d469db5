use clap::Parser;
use shardview::ExportRecord;
use shardview_network::{
    AssembleRequest, BackendListener, Envelope, InputData, ListenerConfig, LogLevel, Payload,
    ProtocolError, ResponseWriter, Stage, TransformationData,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Inference backend stand-in that replays an exported shardview run"
)]
struct Args {
    /// Exported run (JSON written by `shardview --export`)
    record: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "9877")]
    port: u16,

    /// Delay between streamed steps in milliseconds
    #[arg(short, long, default_value = "100")]
    delay_ms: u64,

    /// Maximum message size in MB
    #[arg(short, long, default_value = "100")]
    max_size_mb: usize,

    /// Serve a single submission, then exit
    #[arg(long)]
    once: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn replay(
    record: &ExportRecord,
    request: &AssembleRequest,
    writer: &mut ResponseWriter,
    delay: Duration,
) -> Result<(), ProtocolError> {
    if request.fragment_count() != record.num_parts {
        let message = format!(
            "record {} has {} parts, submission has {}",
            record.name,
            record.num_parts,
            request.fragment_count()
        );
        writer.send_log(LogLevel::Error, message.clone())?;
        return writer.send(&Envelope::Status {
            stage: Stage::Error,
            message: Some(message),
        });
    }

    writer.send_status(Stage::Pending)?;
    writer.send_status(Stage::Generating)?;
    writer.send_payload(Payload::MeshScale(record.mesh_scale))?;

    let (initial_translation, initial_rotation) = record
        .gt_trans_rots
        .iter()
        .map(|t| split_pose(t.to_array()))
        .unzip();
    writer.send_payload(Payload::Input(InputData {
        initial_translation,
        initial_rotation,
        pointclouds: record.pointclouds.clone(),
    }))?;

    for (step, poses) in record.pred_trans_rots.iter().enumerate() {
        thread::sleep(delay);
        let (translation, rotation) = poses.iter().map(|t| split_pose(t.to_array())).unzip();
        writer.send_payload(Payload::Transformation(TransformationData {
            translation,
            rotation,
        }))?;
        writer.send_log(LogLevel::Debug, format!("replayed step {step}"))?;
    }

    let mut metrics = BTreeMap::new();
    metrics.insert("replayed_steps".to_string(), record.step_count() as f64);
    writer.send_payload(Payload::Metrics(metrics))?;
    writer.send_status(Stage::Complete)
}

fn split_pose(values: [f64; 7]) -> ([f64; 3], [f64; 4]) {
    let [tx, ty, tz, qw, qx, qy, qz] = values;
    ([tx, ty, tz], [qw, qx, qy, qz])
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let record = ExportRecord::from_json(&std::fs::read_to_string(&args.record)?)?;
    info!(
        "Replaying {} ({} parts, {} steps)",
        record.name,
        record.num_parts,
        record.step_count()
    );

    let config = ListenerConfig {
        max_message_size: args.max_size_mb * 1024 * 1024,
        ..Default::default()
    };
    let mut listener = BackendListener::bind_with_config(("0.0.0.0", args.port), config)?;
    let delay = Duration::from_millis(args.delay_ms);

    listener.run(|request, mut writer| {
        let peer = writer.peer_addr();
        let result = replay(&record, &request, &mut writer, delay)
            .map_err(|e| e.to_string())
            .and_then(|()| writer.finish().map_err(|e| e.to_string()));
        if let Err(e) = result {
            error!("Replay to {} failed: {}", peer, e);
        }
        !args.once
    })?;

    Ok(())
}
