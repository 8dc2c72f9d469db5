//! Loopback example for shardview-network
//!
//! Starts a toy backend on a local port, submits a two-fragment run to it and
//! prints every envelope that comes back.

use shardview_network::{
    AssembleRequest, BackendListener, InferenceClient, InferenceSettings, InputData, MeshFile,
    MeshType, Payload, Stage, TransformationData,
};
use std::thread;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut listener = BackendListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    println!("Backend listening on {}", addr);

    let backend = thread::spawn(move || -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (request, mut writer) = listener.accept()?;
        let fragments = request.fragment_count();

        writer.send_status(Stage::Pending)?;
        writer.send_status(Stage::Generating)?;
        writer.send_payload(Payload::Input(InputData {
            initial_translation: vec![[0.0; 3]; fragments],
            initial_rotation: vec![[1.0, 0.0, 0.0, 0.0]; fragments],
            pointclouds: Vec::new(),
        }))?;
        for step in 0..request.settings.total_steps() {
            let offset = f64::from(step) * 0.1;
            writer.send_payload(Payload::Transformation(TransformationData {
                translation: vec![[offset, 0.0, 0.0]; fragments],
                rotation: vec![[1.0, 0.0, 0.0, 0.0]; fragments],
            }))?;
        }
        writer.send_status(Stage::Complete)?;
        writer.finish()?;
        Ok(())
    });

    let settings = InferenceSettings {
        steps: 3,
        ..Default::default()
    };
    let request = AssembleRequest::with_files(
        vec![
            MeshFile::new("left.obj", b"v 0 0 0\n".to_vec()),
            MeshFile::new("right.obj", b"v 1 0 0\n".to_vec()),
        ],
        MeshType::Obj,
        settings,
    );

    let client = InferenceClient::new(addr)?;
    let mut stream = client.submit(&request)?;
    for envelope in stream.by_ref() {
        println!("{:?}", envelope?);
    }
    println!("Exchange stats: {:?}", stream.stats());

    backend
        .join()
        .map_err(|_| "backend thread panicked")?
        .map_err(|e| e.to_string())?;
    Ok(())
}
