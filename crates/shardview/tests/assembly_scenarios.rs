//! End-to-end runs of an assembly task against scripted and TCP backends

use shardview::{
    AssemblyTask, EventKind, ExportRecord, InferenceBackend, TaskError, TaskEvent, TaskStatus,
    Transformation,
};
use shardview_network::{
    AssembleRequest, BackendListener, Envelope, InferenceClient, InferenceSettings, InputData,
    MeshFile, Payload, Stage, TransformationData,
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::thread;
use thiserror::Error;

const IDENTITY_ROTATION: [f64; 4] = [1.0, 0.0, 0.0, 0.0];

#[derive(Error, Debug)]
#[error("scripted failure: {0}")]
struct ScriptError(&'static str);

/// Backend that answers every submission with a fixed script
#[derive(Default)]
struct ScriptedBackend {
    script: Vec<Result<Envelope, &'static str>>,
    refuse: Option<&'static str>,
    submissions: Vec<AssembleRequest>,
}

impl ScriptedBackend {
    fn new(script: Vec<Envelope>) -> Self {
        Self {
            script: script.into_iter().map(Ok).collect(),
            ..Default::default()
        }
    }
}

impl InferenceBackend for ScriptedBackend {
    type Error = ScriptError;
    type Stream = std::vec::IntoIter<Result<Envelope, ScriptError>>;

    fn submit(&mut self, request: &AssembleRequest) -> Result<Self::Stream, ScriptError> {
        if let Some(reason) = self.refuse {
            return Err(ScriptError(reason));
        }
        self.submissions.push(request.clone());
        let items: Vec<_> = self
            .script
            .iter()
            .map(|item| item.clone().map_err(ScriptError))
            .collect();
        Ok(items.into_iter())
    }
}

fn two_fragment_task() -> AssemblyTask {
    AssemblyTask::new(vec![
        MeshFile::new("piece_0.obj", b"v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n".to_vec()),
        MeshFile::new("piece_1.obj", b"v 0 0 1\nv 1 0 1\nv 0 1 1\nf 1 2 3\n".to_vec()),
    ])
    .expect("valid fragments")
}

fn settings(steps: u32) -> InferenceSettings {
    InferenceSettings {
        steps,
        ..Default::default()
    }
}

fn input_message() -> Envelope {
    Envelope::data(Payload::Input(InputData {
        initial_translation: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
        initial_rotation: vec![IDENTITY_ROTATION; 2],
        pointclouds: vec![vec![[0.0, 0.0, 0.0], [0.5, 0.5, 0.0]], vec![[1.0, 0.0, 0.0]]],
    }))
}

fn step_message(x: f64) -> Envelope {
    Envelope::data(Payload::Transformation(TransformationData {
        translation: vec![[x, 0.0, 0.0], [1.0 + x, 0.0, 0.0]],
        rotation: vec![IDENTITY_ROTATION; 2],
    }))
}

fn segmentation_message() -> Envelope {
    Envelope::data(Payload::FractureSegmentation(vec![
        vec![[0.1, 0.0, 0.0]],
        vec![[0.9, 0.0, 0.0]],
    ]))
}

fn record_events(task: &mut AssemblyTask, kind: EventKind) -> Rc<RefCell<Vec<TaskEvent>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    task.subscribe(kind, move |event| sink.borrow_mut().push(event.clone()));
    seen
}

fn step_indices(events: &[TaskEvent]) -> Vec<i64> {
    events
        .iter()
        .filter_map(|event| match event {
            TaskEvent::Step { index, .. } => Some(*index),
            _ => None,
        })
        .collect()
}

#[test]
fn test_two_fragment_run_completes() {
    let mut task = two_fragment_task();
    let steps = record_events(&mut task, EventKind::Step);
    let statuses = record_events(&mut task, EventKind::StatusUpdate);

    let mut backend = ScriptedBackend::new(vec![
        input_message(),
        step_message(0.0),
        step_message(0.5),
        Envelope::status(Stage::Complete),
    ]);
    let status = task.start_assemble(settings(2), &mut backend).unwrap();

    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(task.history_len(), 2);
    assert_eq!(task.current_step(), 1);
    // -2 comes from the start of the run
    assert_eq!(step_indices(&steps.borrow()), vec![-2, -1, 0, 1]);

    let last_status = statuses.borrow().last().cloned();
    assert!(matches!(
        last_status,
        Some(TaskEvent::StatusUpdate {
            status: TaskStatus::Completed,
            ..
        })
    ));

    assert_eq!(backend.submissions.len(), 1);
    assert_eq!(backend.submissions[0].fragment_count(), 2);
    assert_eq!(task.get_point_cloud(0).unwrap().len(), 2);
}

#[test]
fn test_recorded_poses_are_served_as_stored() {
    let mut task = two_fragment_task();
    let mut backend = ScriptedBackend::new(vec![
        input_message(),
        step_message(0.0),
        step_message(0.5),
        Envelope::status(Stage::Complete),
    ]);
    task.start_assemble(settings(2), &mut backend).unwrap();

    for fragment in 0..2 {
        let history = task.get_transformations(fragment).unwrap();
        for (step, pose) in history.iter().enumerate() {
            assert_eq!(
                task.get_transformation(fragment, Some(step as i64)).unwrap(),
                *pose
            );
        }
        assert_eq!(
            task.get_transformation(fragment, Some(-1)).unwrap(),
            task.initial_transformations()[fragment].inverse()
        );
        assert_eq!(
            task.get_transformation(fragment, Some(-2)).unwrap(),
            Transformation::identity()
        );
    }

    // Second fragment started at x = 1 and moved by 0.5 in the last step
    let pose = task.get_transformation(1, None).unwrap();
    assert!((pose.translation().x - 0.5).abs() < 1e-12);
}

#[test]
fn test_start_while_running_is_rejected() {
    let mut task = two_fragment_task();
    task.begin_run(settings(2)).unwrap();

    let mut backend = ScriptedBackend::new(vec![Envelope::status(Stage::Complete)]);
    let result = task.start_assemble(settings(2), &mut backend);

    assert!(matches!(result, Err(TaskError::AlreadyRunning(_))));
    assert!(backend.submissions.is_empty());
    assert_eq!(task.status(), TaskStatus::Requested);
}

#[test]
fn test_retry_after_failure() {
    let mut task = two_fragment_task();
    let mut failing = ScriptedBackend::new(vec![
        Envelope::status(Stage::Pending),
        Envelope::Status {
            stage: Stage::Error,
            message: Some("out of GPU memory".to_string()),
        },
        // Never read: the error ends the exchange
        input_message(),
    ]);
    assert_eq!(
        task.start_assemble(settings(2), &mut failing).unwrap(),
        TaskStatus::Failed
    );
    assert_eq!(task.current_step(), -2);

    let mut working = ScriptedBackend::new(vec![
        input_message(),
        step_message(0.0),
        Envelope::status(Stage::Complete),
    ]);
    assert_eq!(
        task.start_assemble(settings(1), &mut working).unwrap(),
        TaskStatus::Completed
    );
    assert_eq!(task.history_len(), 1);
}

#[test]
fn test_transport_failures_end_in_failed() {
    let mut refused = ScriptedBackend {
        refuse: Some("connection refused"),
        ..Default::default()
    };
    let mut task = two_fragment_task();
    let statuses = record_events(&mut task, EventKind::StatusUpdate);
    assert_eq!(
        task.start_assemble(settings(2), &mut refused).unwrap(),
        TaskStatus::Failed
    );
    assert!(matches!(
        statuses.borrow().last(),
        Some(TaskEvent::StatusUpdate {
            status: TaskStatus::Failed,
            ..
        })
    ));

    let mut broken = ScriptedBackend {
        script: vec![
            Ok(Envelope::status(Stage::Pending)),
            Ok(input_message()),
            Err("connection reset"),
        ],
        ..Default::default()
    };
    let mut task = two_fragment_task();
    assert_eq!(
        task.start_assemble(settings(2), &mut broken).unwrap(),
        TaskStatus::Failed
    );
    assert_eq!(task.current_step(), -1);

    let mut truncated = ScriptedBackend::new(vec![input_message(), step_message(0.0)]);
    let mut task = two_fragment_task();
    assert_eq!(
        task.start_assemble(settings(2), &mut truncated).unwrap(),
        TaskStatus::Failed
    );
    assert_eq!(task.history_len(), 1);
}

#[test]
fn test_fracture_segmentation_window() {
    let mut early = vec![input_message()];
    early.extend((0..3).map(|i| step_message(f64::from(i))));
    early.push(segmentation_message());
    early.push(Envelope::status(Stage::Complete));

    let mut task = two_fragment_task();
    let surfaces = record_events(&mut task, EventKind::FractureSurfaces);
    task.start_assemble(settings(3), &mut ScriptedBackend::new(early))
        .unwrap();
    assert_eq!(surfaces.borrow().len(), 1);
    assert_eq!(task.get_fracture_surface(1).unwrap(), &[[0.9, 0.0, 0.0]]);

    let mut late = vec![input_message()];
    late.extend((0..6).map(|i| step_message(f64::from(i))));
    late.push(segmentation_message());
    late.push(Envelope::status(Stage::Complete));

    let mut task = two_fragment_task();
    let surfaces = record_events(&mut task, EventKind::FractureSurfaces);
    let status = task
        .start_assemble(settings(6), &mut ScriptedBackend::new(late))
        .unwrap();
    assert_eq!(status, TaskStatus::Completed);
    assert!(surfaces.borrow().is_empty());
    assert!(task.get_fracture_surface(1).unwrap().is_empty());
}

#[test]
fn test_export_shape() {
    let mut task = two_fragment_task();
    let mut metrics = BTreeMap::new();
    metrics.insert("chamfer_distance".to_string(), 0.25);
    let mut backend = ScriptedBackend::new(vec![
        Envelope::data(Payload::MeshScale(3.0)),
        input_message(),
        step_message(0.0),
        step_message(0.5),
        step_message(1.0),
        Envelope::data(Payload::Metrics(metrics)),
        Envelope::status(Stage::Complete),
    ]);
    task.start_assemble(settings(3), &mut backend).unwrap();

    let json = task.export_json("demo").unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    let predicted = value["pred_trans_rots"].as_array().unwrap();
    assert_eq!(predicted.len(), 3);
    for step in predicted {
        let poses = step.as_array().unwrap();
        assert_eq!(poses.len(), 2);
        assert!(poses.iter().all(|p| p.as_array().unwrap().len() == 7));
    }
    assert_eq!(value["pieces"], "piece_0.obj,piece_1.obj");
    assert_eq!(value["mesh_scale"], 3.0);
    assert_eq!(value["removal_pieces"], "");

    // Raw poses are exported, not the normalized ones
    let record = ExportRecord::from_json(&json).unwrap();
    assert_eq!(record.pred_trans_rots[2][1].translation().x, 2.0);
    assert_eq!(task.export_json("demo").unwrap(), json);
}

#[test]
fn test_loopback_exchange() {
    let mut listener = BackendListener::bind("127.0.0.1:0").expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get address");

    let backend = thread::spawn(move || {
        let (request, mut writer) = listener.accept().expect("Failed to accept");
        writer.send_status(Stage::Pending).unwrap();
        writer.send_heartbeat().unwrap();
        writer.send_status(Stage::Generating).unwrap();
        for envelope in [input_message(), step_message(0.0), step_message(0.25)] {
            writer.send(&envelope).unwrap();
        }
        writer.send_status(Stage::Complete).unwrap();
        writer.finish().unwrap();
        request
    });

    let mut task = two_fragment_task();
    let steps = record_events(&mut task, EventKind::Step);
    let mut client = InferenceClient::new(addr).expect("Failed to create client");
    let status = task.start_assemble(settings(2), &mut client).unwrap();

    let request = backend.join().expect("Backend thread failed");
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(request.files.as_ref().map(Vec::len), Some(2));
    assert_eq!(request.settings.steps, 2);
    assert_eq!(step_indices(&steps.borrow()), vec![-2, -1, 0, 1]);
}

#[test]
fn test_loopback_disconnect_fails_run() {
    let mut listener = BackendListener::bind("127.0.0.1:0").expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get address");

    thread::spawn(move || {
        let (_request, mut writer) = listener.accept().expect("Failed to accept");
        writer.send_status(Stage::Pending).unwrap();
        // Dropped without a terminal stage or end-of-stream marker
    });

    let mut task = two_fragment_task();
    let mut client = InferenceClient::new(addr).expect("Failed to create client");
    let status = task.start_assemble(settings(2), &mut client).unwrap();
    assert_eq!(status, TaskStatus::Failed);
}
