//! Mesh geometry owned by scene nodes.

use std::rc::Rc;

use crate::error::PipelineError;
use crate::renderer::{GeometryId, GpuHandle, Renderer};
use crate::scene::DisposeMarker;

/// Vertex format shared by every geometry: position and texture coordinate.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    /// Vertex buffer layout: position at location 0, uv at location 1.
    pub const LAYOUT: wgpu::VertexBufferLayout<'static> = wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<Vertex>() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &[
            wgpu::VertexAttribute {
                offset: 0,
                shader_location: 0,
                format: wgpu::VertexFormat::Float32x3,
            },
            wgpu::VertexAttribute {
                offset: 12,
                shader_location: 1,
                format: wgpu::VertexFormat::Float32x2,
            },
        ],
    };

    pub const fn new(position: [f32; 3], uv: [f32; 2]) -> Self {
        Self { position, uv }
    }
}

/// Shape of a geometry, centred on the origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GeometryKind {
    /// A rectangle in the XY plane. A 2x2 plane covers clip space exactly.
    Plane { width: f32, height: f32 },
    /// An axis-aligned box.
    Box { width: f32, height: f32, depth: f32 },
}

impl GeometryKind {
    /// The full-screen quad used by shader passes.
    pub const FULLSCREEN_QUAD: Self = Self::Plane {
        width: 2.0,
        height: 2.0,
    };

    /// Non-indexed triangle list, counter-clockwise front faces.
    pub fn vertices(&self) -> Vec<Vertex> {
        match *self {
            Self::Plane { width, height } => {
                let (hw, hh) = (width * 0.5, height * 0.5);
                let corners = [
                    Vertex::new([-hw, -hh, 0.0], [0.0, 0.0]),
                    Vertex::new([hw, -hh, 0.0], [1.0, 0.0]),
                    Vertex::new([hw, hh, 0.0], [1.0, 1.0]),
                    Vertex::new([-hw, hh, 0.0], [0.0, 1.0]),
                ];
                [0, 1, 2, 2, 3, 0].iter().map(|&i| corners[i]).collect()
            }
            Self::Box {
                width,
                height,
                depth,
            } => {
                let (x, y, z) = (width * 0.5, height * 0.5, depth * 0.5);
                #[rustfmt::skip]
                let faces: [[[f32; 3]; 4]; 6] = [
                    [[-x, -y,  z], [ x, -y,  z], [ x,  y,  z], [-x,  y,  z]], // front
                    [[ x, -y, -z], [-x, -y, -z], [-x,  y, -z], [ x,  y, -z]], // back
                    [[-x,  y,  z], [ x,  y,  z], [ x,  y, -z], [-x,  y, -z]], // top
                    [[-x, -y, -z], [ x, -y, -z], [ x, -y,  z], [-x, -y,  z]], // bottom
                    [[ x, -y,  z], [ x, -y, -z], [ x,  y, -z], [ x,  y,  z]], // right
                    [[-x, -y, -z], [-x, -y,  z], [-x,  y,  z], [-x,  y, -z]], // left
                ];
                let uvs = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
                faces
                    .iter()
                    .flat_map(|face| {
                        [0, 1, 2, 2, 3, 0].map(|i| Vertex::new(face[i], uvs[i]))
                    })
                    .collect()
            }
        }
    }
}

/// Geometry uploaded to a renderer.
#[derive(Debug)]
pub struct Geometry {
    kind: GeometryKind,
    id: GeometryId,
    marker: DisposeMarker,
}

impl Geometry {
    pub fn new<R: Renderer + ?Sized>(
        renderer: &mut R,
        kind: GeometryKind,
    ) -> Result<Rc<Self>, PipelineError> {
        let id = renderer.create_geometry(&kind)?;
        Ok(Rc::new(Self {
            kind,
            id,
            marker: DisposeMarker::default(),
        }))
    }

    pub fn kind(&self) -> &GeometryKind {
        &self.kind
    }

    pub fn id(&self) -> GeometryId {
        self.id
    }

    pub fn is_disposed(&self) -> bool {
        self.marker.is_disposed()
    }

    /// Releases the uploaded buffers. Returns `false` if already released.
    pub fn dispose<R: Renderer + ?Sized>(&self, renderer: &mut R) -> bool {
        if !self.marker.mark() {
            return false;
        }
        renderer.release(GpuHandle::Geometry(self.id));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_is_two_triangles() {
        let verts = GeometryKind::FULLSCREEN_QUAD.vertices();
        assert_eq!(verts.len(), 6);
        assert!(verts
            .iter()
            .all(|v| v.position[0].abs() == 1.0 && v.position[1].abs() == 1.0));
        // uv passes through as (position + 1) / 2
        for v in &verts {
            assert_eq!(v.uv[0], (v.position[0] + 1.0) * 0.5);
            assert_eq!(v.uv[1], (v.position[1] + 1.0) * 0.5);
        }
    }

    #[test]
    fn box_has_six_faces() {
        let kind = GeometryKind::Box {
            width: 1.0,
            height: 2.0,
            depth: 3.0,
        };
        assert_eq!(kind.vertices().len(), 36);
    }
}
