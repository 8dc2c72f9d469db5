//! Fragment geometry and bounding boxes
//!
//! The task only needs each fragment's axis-aligned bounds to resolve a
//! fallback mesh scale. [`MeshGeometry`] reads vertex positions from the
//! uploaded OBJ/PLY blobs so the CLI can supply them.

use nalgebra::Vector3;
use ply_rs::parser::Parser;
use ply_rs::ply::{DefaultElement, Property};
use rayon::prelude::*;
use shardview_network::{MeshFile, MeshType};
use std::io::{BufReader, Cursor};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum GeometryError {
    #[error("Unsupported mesh file: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to parse OBJ {name}: {source}")]
    Obj {
        name: String,
        source: tobj::LoadError,
    },

    #[error("Failed to parse PLY {name}: {details}")]
    Ply { name: String, details: String },

    #[error("Mesh {0} has no vertices")]
    Empty(String),
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl Bounds {
    /// Empty bounds; not valid until a point is added
    pub fn empty() -> Self {
        Self {
            min: Vector3::repeat(f64::INFINITY),
            max: Vector3::repeat(f64::NEG_INFINITY),
        }
    }

    pub fn from_points<'a, I>(points: I) -> Self
    where
        I: IntoIterator<Item = &'a [f64; 3]>,
    {
        points.into_iter().fold(Self::empty(), |mut bounds, p| {
            let p = Vector3::from(*p);
            bounds.min = bounds.min.inf(&p);
            bounds.max = bounds.max.sup(&p);
            bounds
        })
    }

    pub fn is_valid(&self) -> bool {
        self.min.iter().zip(self.max.iter()).all(|(lo, hi)| lo <= hi)
    }

    /// Extent along each axis, zero for empty bounds
    pub fn size(&self) -> Vector3<f64> {
        if self.is_valid() {
            self.max - self.min
        } else {
            Vector3::zeros()
        }
    }

    /// Largest extent along any axis
    pub fn max_extent(&self) -> f64 {
        self.size().max()
    }
}

/// Geometry handle attached to a fragment once its asset is loaded
pub trait FragmentGeometry {
    fn bounds(&self) -> Bounds;
}

impl FragmentGeometry for Bounds {
    fn bounds(&self) -> Bounds {
        *self
    }
}

/// Vertex positions of one fragment mesh
#[derive(Debug, Clone)]
pub struct MeshGeometry {
    pub name: String,
    pub vertices: Vec<[f64; 3]>,
    bounds: Bounds,
}

impl FragmentGeometry for MeshGeometry {
    fn bounds(&self) -> Bounds {
        self.bounds
    }
}

impl MeshGeometry {
    pub fn from_vertices(name: impl Into<String>, vertices: Vec<[f64; 3]>) -> Self {
        let bounds = Bounds::from_points(&vertices);
        Self {
            name: name.into(),
            vertices,
            bounds,
        }
    }

    /// Parse an uploaded mesh blob, picking the format from its extension
    pub fn load(file: &MeshFile) -> Result<Self, GeometryError> {
        let mesh_type = file
            .mesh_type()
            .ok_or_else(|| GeometryError::UnsupportedFormat(file.name.clone()))?;

        let vertices = match mesh_type {
            MeshType::Obj => read_obj_vertices(file)?,
            MeshType::Ply => read_ply_vertices(file)?,
        };
        if vertices.is_empty() {
            return Err(GeometryError::Empty(file.name.clone()));
        }

        debug!("Loaded {} vertices from {}", vertices.len(), file.name);
        Ok(Self::from_vertices(file.name.clone(), vertices))
    }

    /// Parse several blobs in parallel, keeping input order
    pub fn load_all(files: &[MeshFile]) -> Vec<Result<Self, GeometryError>> {
        files.par_iter().map(Self::load).collect()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }
}

fn read_obj_vertices(file: &MeshFile) -> Result<Vec<[f64; 3]>, GeometryError> {
    let mut reader = BufReader::new(Cursor::new(file.bytes.as_slice()));
    let options = tobj::LoadOptions {
        triangulate: true,
        single_index: true,
        ..Default::default()
    };

    // Fragments are loaded without materials
    let (models, _materials) = tobj::load_obj_buf(&mut reader, &options, |_| {
        Ok(Default::default())
    })
    .map_err(|source| GeometryError::Obj {
        name: file.name.clone(),
        source,
    })?;

    Ok(models
        .iter()
        .flat_map(|model| model.mesh.positions.chunks_exact(3))
        .map(|p| [f64::from(p[0]), f64::from(p[1]), f64::from(p[2])])
        .collect())
}

fn read_ply_vertices(file: &MeshFile) -> Result<Vec<[f64; 3]>, GeometryError> {
    let ply_error = |details: String| GeometryError::Ply {
        name: file.name.clone(),
        details,
    };

    let mut reader = Cursor::new(file.bytes.as_slice());
    let parser = Parser::<DefaultElement>::new();
    let header = parser
        .read_header(&mut reader)
        .map_err(|e| ply_error(format!("header: {e}")))?;
    let payload = parser
        .read_payload(&mut reader, &header)
        .map_err(|e| ply_error(format!("payload: {e}")))?;

    let Some(elements) = payload.get("vertex") else {
        return Ok(Vec::new());
    };

    elements
        .iter()
        .map(|element| -> Result<[f64; 3], GeometryError> {
            let coord = |key: &str| {
                float_property(element, key)
                    .ok_or_else(|| ply_error(format!("vertex is missing property {key}")))
            };
            Ok([coord("x")?, coord("y")?, coord("z")?])
        })
        .collect()
}

fn float_property(element: &DefaultElement, key: &str) -> Option<f64> {
    match element.get(key)? {
        Property::Float(v) => Some(f64::from(*v)),
        Property::Double(v) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUBE_OBJ: &str = "\
v 0 0 0
v 2 0 0
v 2 1 0
v 0 1 0
v 0 0 0.5
f 1 2 3
f 1 3 4
f 1 2 5
";

    const TRIANGLE_PLY: &str = "\
ply
format ascii 1.0
element vertex 3
property float x
property float y
property float z
element face 1
property list uchar int vertex_indices
end_header
-1 0 0
1 0 0
0 3 0.25
3 0 1 2
";

    #[test]
    fn test_bounds_from_points() {
        let bounds = Bounds::from_points(&[[0.0, -1.0, 2.0], [3.0, 1.0, 2.5]]);
        assert!(bounds.is_valid());
        assert_eq!(bounds.size(), Vector3::new(3.0, 2.0, 0.5));
        assert_eq!(bounds.max_extent(), 3.0);
    }

    #[test]
    fn test_empty_bounds() {
        let bounds = Bounds::from_points(&[]);
        assert!(!bounds.is_valid());
        assert_eq!(bounds.max_extent(), 0.0);
    }

    #[test]
    fn test_load_obj() {
        let file = MeshFile::new("cube.obj", CUBE_OBJ.as_bytes().to_vec());
        let mesh = MeshGeometry::load(&file).unwrap();
        assert_eq!(mesh.bounds().max, Vector3::new(2.0, 1.0, 0.5));
        assert_eq!(mesh.bounds().max_extent(), 2.0);
    }

    #[test]
    fn test_load_ply() {
        let file = MeshFile::new("tri.PLY", TRIANGLE_PLY.as_bytes().to_vec());
        let mesh = MeshGeometry::load(&file).unwrap();
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.bounds().min, Vector3::new(-1.0, 0.0, 0.0));
        assert_eq!(mesh.bounds().max_extent(), 3.0);
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let file = MeshFile::new("piece.stl", vec![0; 4]);
        assert!(matches!(
            MeshGeometry::load(&file),
            Err(GeometryError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_load_all_keeps_order() {
        let files = vec![
            MeshFile::new("b.ply", TRIANGLE_PLY.as_bytes().to_vec()),
            MeshFile::new("a.obj", CUBE_OBJ.as_bytes().to_vec()),
            MeshFile::new("empty.obj", Vec::new()),
        ];
        let loaded = MeshGeometry::load_all(&files);

        assert_eq!(loaded[0].as_ref().unwrap().name, "b.ply");
        assert_eq!(loaded[1].as_ref().unwrap().name, "a.obj");
        assert!(matches!(loaded[2], Err(GeometryError::Empty(_))));
    }
}
