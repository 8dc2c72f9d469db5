//! Replayable JSON record of an assembly run

use crate::lib::task::AssemblyTask;
use crate::lib::transformation::Transformation;
use serde::{Deserialize, Serialize};

/// Snapshot written by [`AssemblyTask::export_json`]
///
/// Poses are flattened to `[tx, ty, tz, qw, qx, qy, qz]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub name: String,
    pub num_parts: usize,
    /// Backend's initial pose per fragment
    pub gt_trans_rots: Vec<Transformation>,
    /// Raw backend poses, by step then fragment
    pub pred_trans_rots: Vec<Vec<Transformation>>,
    /// Reserved, always empty
    pub removal_pieces: String,
    /// Reserved, always empty
    pub redundant_pieces: String,
    /// Fragment file names, comma separated
    pub pieces: String,
    pub mesh_scale: f64,
    pub pointclouds: Vec<Vec<[f64; 3]>>,
}

impl ExportRecord {
    pub fn from_task(task: &AssemblyTask, name: &str) -> Self {
        let pieces: Vec<&str> = task.fragments().iter().map(|f| f.label.as_str()).collect();

        Self {
            name: name.to_string(),
            num_parts: task.fragment_count(),
            gt_trans_rots: task.initial_transformations().to_vec(),
            pred_trans_rots: task.original_transformations().to_vec(),
            removal_pieces: String::new(),
            redundant_pieces: String::new(),
            pieces: pieces.join(","),
            mesh_scale: task.mesh_scale(),
            pointclouds: task.point_clouds().to_vec(),
        }
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn piece_names(&self) -> Vec<&str> {
        self.pieces.split(',').filter(|p| !p.is_empty()).collect()
    }

    pub fn step_count(&self) -> usize {
        self.pred_trans_rots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn record() -> ExportRecord {
        ExportRecord {
            name: "demo".to_string(),
            num_parts: 2,
            gt_trans_rots: vec![Transformation::identity(); 2],
            pred_trans_rots: vec![vec![
                Transformation::from_arrays([1.0, 2.0, 3.0], [1.0, 0.0, 0.0, 0.0]),
                Transformation::identity(),
            ]],
            removal_pieces: String::new(),
            redundant_pieces: String::new(),
            pieces: "a.obj,b.obj".to_string(),
            mesh_scale: 1.5,
            pointclouds: Vec::new(),
        }
    }

    #[test]
    fn test_field_layout() {
        let value: Value = serde_json::from_str(&record().to_json().unwrap()).unwrap();

        assert_eq!(value["name"], json!("demo"));
        assert_eq!(value["num_parts"], json!(2));
        assert_eq!(value["removal_pieces"], json!(""));
        assert_eq!(value["redundant_pieces"], json!(""));
        assert_eq!(value["pieces"], json!("a.obj,b.obj"));
        assert_eq!(
            value["pred_trans_rots"][0][0],
            json!([1.0, 2.0, 3.0, 1.0, 0.0, 0.0, 0.0])
        );
        assert_eq!(value["gt_trans_rots"][1].as_array().unwrap().len(), 7);
    }

    #[test]
    fn test_parse_back() {
        let original = record();
        let parsed = ExportRecord::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.piece_names(), vec!["a.obj", "b.obj"]);
        assert_eq!(parsed.step_count(), 1);
    }
}
