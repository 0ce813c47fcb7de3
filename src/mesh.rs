//! Surface meshes extracted from binary label masks.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use lin_alg::f32::Vec3;
use mcubes::{MarchingCubes, MeshSide};
use ndarray::Array3;
use tracing::debug;

use crate::error::{Error, Result};
use crate::volume::Volume;

const ISO_LEVEL: f32 = 0.5;
const TAUBIN_LAMBDA: f32 = 0.5;

/// Indexed triangle mesh in physical (LPS, mm) coordinates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriangleMesh {
    pub vertices: Vec<[f32; 3]>,
    pub triangles: Vec<[usize; 3]>,
}

impl TriangleMesh {
    /// Extract the boundary of the non-zero voxels of `mask` with marching
    /// cubes. `geometry` places the voxel grid in space. The mask is padded by
    /// one empty voxel on every side so surfaces touching the grid border are
    /// closed. Returns `None` when the mask is empty.
    pub fn extract_isosurface(mask: &Array3<u8>, geometry: &Volume) -> Result<Option<Self>> {
        if !mask.iter().any(|&v| v != 0) {
            return Ok(None);
        }
        let (depth, height, width) = mask.dim();
        let padded_dim = (depth + 2, height + 2, width + 2);
        let padded = Array3::from_shape_fn(padded_dim, |(z, y, x)| {
            let inside = (1..=depth).contains(&z) && (1..=height).contains(&y) && (1..=width).contains(&x);
            if inside && mask[[z - 1, y - 1, x - 1]] != 0 {
                1.0f32
            } else {
                0.0
            }
        });
        // x varies fastest
        let values: Vec<f32> = padded.iter().copied().collect();

        let (slices, rows, cols) = padded_dim;
        let grid = (cols as f32, rows as f32, slices as f32);
        let mc = MarchingCubes::new(
            (cols, rows, slices),
            grid,
            grid,
            Vec3::new_zero(),
            values,
            ISO_LEVEL,
        )
        .map_err(|e| Error::Mesh(format!("{e:?}")))?;
        let raw = mc.generate(MeshSide::OutsideOnly);

        // weld duplicated corners and map to patient space
        let mut lookup: HashMap<[i64; 3], usize> = HashMap::new();
        let mut vertices = Vec::new();
        let mut remap = Vec::with_capacity(raw.vertices.len());
        for vertex in &raw.vertices {
            let p = vertex.posit;
            let key = [
                (p.x * 1e4).round() as i64,
                (p.y * 1e4).round() as i64,
                (p.z * 1e4).round() as i64,
            ];
            let index = *lookup.entry(key).or_insert_with(|| {
                let physical = geometry.index_to_physical([
                    p.x as f64 - 1.0,
                    p.y as f64 - 1.0,
                    p.z as f64 - 1.0,
                ]);
                vertices.push([physical[0] as f32, physical[1] as f32, physical[2] as f32]);
                vertices.len() - 1
            });
            remap.push(index);
        }

        let triangles: Vec<[usize; 3]> = raw
            .indices
            .chunks_exact(3)
            .map(|tri| [remap[tri[0]], remap[tri[1]], remap[tri[2]]])
            .filter(|[a, b, c]| a != b && b != c && a != c)
            .collect();

        if triangles.is_empty() {
            return Ok(None);
        }
        let mesh = Self {
            vertices,
            triangles,
        };
        debug!(
            vertices = mesh.vertex_count(),
            triangles = mesh.triangle_count(),
            "extracted isosurface"
        );
        Ok(Some(mesh))
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    fn neighbours(&self) -> Vec<Vec<usize>> {
        let mut sets = vec![HashSet::new(); self.vertices.len()];
        for &[a, b, c] in &self.triangles {
            for (u, v) in [(a, b), (b, c), (c, a)] {
                sets[u].insert(v);
                sets[v].insert(u);
            }
        }
        sets.into_iter().map(|set| set.into_iter().collect()).collect()
    }

    /// Taubin λ/μ smoothing. `pass_band` in (0, 2) sets the cut-off; lower
    /// values smooth more. Volume is approximately preserved.
    pub fn smooth(&mut self, iterations: usize, pass_band: f32) {
        if iterations == 0 || self.vertices.is_empty() {
            return;
        }
        let pass_band = pass_band.clamp(1e-4, 1.0 / TAUBIN_LAMBDA - 1e-3);
        let mu = 1.0 / (pass_band - 1.0 / TAUBIN_LAMBDA);
        let neighbours = self.neighbours();

        for _ in 0..iterations {
            self.umbrella_step(&neighbours, TAUBIN_LAMBDA);
            self.umbrella_step(&neighbours, mu);
        }
    }

    fn umbrella_step(&mut self, neighbours: &[Vec<usize>], factor: f32) {
        let updated: Vec<[f32; 3]> = self
            .vertices
            .iter()
            .zip(neighbours)
            .map(|(&p, around)| {
                if around.is_empty() {
                    return p;
                }
                let mut mean = [0.0f32; 3];
                for &n in around {
                    for axis in 0..3 {
                        mean[axis] += self.vertices[n][axis];
                    }
                }
                let count = around.len() as f32;
                [
                    p[0] + factor * (mean[0] / count - p[0]),
                    p[1] + factor * (mean[1] / count - p[1]),
                    p[2] + factor * (mean[2] / count - p[2]),
                ]
            })
            .collect();
        self.vertices = updated;
    }

    /// Reduce the triangle count by `target_reduction` (0..1) by repeatedly
    /// collapsing the shortest edge into its midpoint.
    pub fn decimate(&mut self, target_reduction: f32) {
        if !(target_reduction > 0.0) || self.triangles.is_empty() {
            return;
        }
        let total = self.triangles.len();
        let target = ((1.0 - target_reduction.min(0.99)) * total as f32).ceil() as usize;

        let mut positions = self.vertices.clone();
        let mut triangles = self.triangles.clone();
        let mut triangle_alive = vec![true; total];
        let mut vertex_alive = vec![true; positions.len()];
        let mut versions = vec![0u32; positions.len()];
        let mut incident: Vec<Vec<usize>> = vec![Vec::new(); positions.len()];
        for (t, tri) in triangles.iter().enumerate() {
            for &v in tri {
                incident[v].push(t);
            }
        }

        let mut heap = BinaryHeap::new();
        let mut seen = HashSet::new();
        for tri in &triangles {
            for (u, v) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
                if seen.insert((u.min(v), u.max(v))) {
                    heap.push(EdgeCandidate::new(&positions, &versions, u, v));
                }
            }
        }

        let mut remaining = total;
        while remaining > target {
            let Some(edge) = heap.pop() else { break };
            let (keep, remove) = (edge.a, edge.b);
            if !vertex_alive[keep]
                || !vertex_alive[remove]
                || versions[keep] != edge.version_a
                || versions[remove] != edge.version_b
            {
                continue;
            }

            let (pa, pb) = (positions[keep], positions[remove]);
            positions[keep] = [
                (pa[0] + pb[0]) / 2.0,
                (pa[1] + pb[1]) / 2.0,
                (pa[2] + pb[2]) / 2.0,
            ];
            vertex_alive[remove] = false;
            versions[keep] += 1;

            for t in std::mem::take(&mut incident[remove]) {
                if !triangle_alive[t] {
                    continue;
                }
                if triangles[t].contains(&keep) {
                    triangle_alive[t] = false;
                    remaining -= 1;
                } else {
                    for v in triangles[t].iter_mut() {
                        if *v == remove {
                            *v = keep;
                        }
                    }
                    incident[keep].push(t);
                }
            }
            incident[keep].retain(|&t| triangle_alive[t]);

            let mut around = HashSet::new();
            for &t in &incident[keep] {
                around.extend(triangles[t].iter().copied().filter(|&v| v != keep));
            }
            for v in around {
                heap.push(EdgeCandidate::new(&positions, &versions, keep, v));
            }
        }

        // compact
        let mut new_index = vec![usize::MAX; positions.len()];
        let mut vertices = Vec::new();
        let mut kept = Vec::with_capacity(remaining);
        for (t, tri) in triangles.iter().enumerate() {
            if !triangle_alive[t] {
                continue;
            }
            let mut mapped = [0usize; 3];
            for (slot, &v) in mapped.iter_mut().zip(tri) {
                if new_index[v] == usize::MAX {
                    new_index[v] = vertices.len();
                    vertices.push(positions[v]);
                }
                *slot = new_index[v];
            }
            kept.push(mapped);
        }
        debug!(before = total, after = kept.len(), "decimated mesh");
        self.vertices = vertices;
        self.triangles = kept;
    }

    /// Write the mesh as binary STL with per-face normals.
    pub fn write_stl(&self, path: impl AsRef<Path>) -> Result<()> {
        let triangles = self.triangles.iter().map(|&[a, b, c]| {
            let (v0, v1, v2) = (self.vertices[a], self.vertices[b], self.vertices[c]);
            let edge1 = [v1[0] - v0[0], v1[1] - v0[1], v1[2] - v0[2]];
            let edge2 = [v2[0] - v0[0], v2[1] - v0[1], v2[2] - v0[2]];

            let nx = edge1[1] * edge2[2] - edge1[2] * edge2[1];
            let ny = edge1[2] * edge2[0] - edge1[0] * edge2[2];
            let nz = edge1[0] * edge2[1] - edge1[1] * edge2[0];
            let len = (nx * nx + ny * ny + nz * nz).sqrt();
            let normal = if len > 0.0 {
                [nx / len, ny / len, nz / len]
            } else {
                [0.0, 0.0, 1.0]
            };

            stl_io::Triangle {
                normal: stl_io::Normal::new(normal),
                vertices: [
                    stl_io::Vertex::new(v0),
                    stl_io::Vertex::new(v1),
                    stl_io::Vertex::new(v2),
                ],
            }
        });

        let mut file = BufWriter::new(File::create(path.as_ref())?);
        stl_io::write_stl(&mut file, triangles)?;
        Ok(())
    }
}

/// Heap entry for [`TriangleMesh::decimate`], ordered shortest first.
struct EdgeCandidate {
    length: f32,
    a: usize,
    b: usize,
    version_a: u32,
    version_b: u32,
}

impl EdgeCandidate {
    fn new(positions: &[[f32; 3]], versions: &[u32], a: usize, b: usize) -> Self {
        let (pa, pb) = (positions[a], positions[b]);
        let length = ((pa[0] - pb[0]).powi(2) + (pa[1] - pb[1]).powi(2) + (pa[2] - pb[2]).powi(2)).sqrt();
        Self {
            length,
            a,
            b,
            version_a: versions[a],
            version_b: versions[b],
        }
    }
}

impl PartialEq for EdgeCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EdgeCandidate {}

impl PartialOrd for EdgeCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EdgeCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .length
            .total_cmp(&self.length)
            .then_with(|| other.a.cmp(&self.a))
            .then_with(|| other.b.cmp(&self.b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Flat `n` x `n` grid of quads split into triangles.
    fn grid(n: usize) -> TriangleMesh {
        let mut vertices = Vec::new();
        for y in 0..=n {
            for x in 0..=n {
                vertices.push([x as f32, y as f32, 0.0]);
            }
        }
        let at = |x: usize, y: usize| y * (n + 1) + x;
        let mut triangles = Vec::new();
        for y in 0..n {
            for x in 0..n {
                triangles.push([at(x, y), at(x + 1, y), at(x + 1, y + 1)]);
                triangles.push([at(x, y), at(x + 1, y + 1), at(x, y + 1)]);
            }
        }
        TriangleMesh {
            vertices,
            triangles,
        }
    }

    fn cube_mask() -> Array3<u8> {
        let mut mask = Array3::<u8>::zeros((8, 8, 8));
        mask.slice_mut(ndarray::s![2..6, 2..6, 2..6]).fill(1);
        mask
    }

    #[test]
    fn empty_mask_has_no_surface() {
        let mask = Array3::<u8>::zeros((4, 4, 4));
        let geometry = Volume::new(Array3::zeros((4, 4, 4)), (1.0, 1.0, 1.0));
        assert!(TriangleMesh::extract_isosurface(&mask, &geometry).unwrap().is_none());
    }

    #[test]
    fn cube_surface_stays_inside_the_grid() {
        let geometry = Volume::new(Array3::zeros((8, 8, 8)), (1.0, 1.0, 1.0));
        let mesh = TriangleMesh::extract_isosurface(&cube_mask(), &geometry)
            .unwrap()
            .unwrap();
        assert!(mesh.triangle_count() > 0);
        for vertex in &mesh.vertices {
            for &c in vertex {
                assert!((-1.5..=8.5).contains(&c), "{vertex:?}");
            }
        }
    }

    #[test]
    fn smoothing_keeps_topology() {
        let mut mesh = grid(6);
        mesh.vertices[24][2] = 3.0;
        let before = mesh.clone();
        mesh.smooth(10, 0.1);
        assert_eq!(mesh.triangles, before.triangles);
        assert!(mesh.vertices[24][2] < 3.0);
    }

    #[test]
    fn decimation_reaches_target() {
        let mut mesh = grid(10);
        let total = mesh.triangle_count();
        mesh.decimate(0.5);
        assert!(mesh.triangle_count() <= total / 2);
        assert!(mesh.triangle_count() > 0);
        for tri in &mesh.triangles {
            assert!(tri.iter().all(|&v| v < mesh.vertex_count()));
        }
    }

    #[test]
    fn stl_has_one_facet_per_triangle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grid.stl");
        let mesh = grid(3);
        mesh.write_stl(&path).unwrap();
        let mut file = File::open(&path).unwrap();
        let read = stl_io::read_stl(&mut file).unwrap();
        assert_eq!(read.faces.len(), mesh.triangle_count());
    }
}
