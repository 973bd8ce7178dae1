//! The scene graph handed to a [`Renderer`](crate::Renderer).
//!
//! Scenes hold [`SceneNode`]s; nodes hold geometry, materials, owned render
//! targets and child nodes. Everything is shared through `Rc`, so one
//! geometry or child node may be reachable from several parents. Each
//! disposable object carries its own [`DisposeMarker`], which is what makes
//! disposal idempotent no matter how many paths lead to the object.
//!
//! # Example
//!
//! ```ignore
//! let quad = Geometry::new(&mut renderer, GeometryKind::Plane { width: 2.0, height: 2.0 })?;
//! let material = Material::basic("tint", Vec4::new(1.0, 0.0, 0.0, 1.0), None);
//!
//! let mut scene = Scene::new("overlay");
//! scene.add(SceneNode::new("quad").with_geometry(quad).with_material(material).build());
//! renderer.render(&scene, &Camera::fullscreen())?;
//! ```

mod geometry;
mod material;
mod node;

use std::cell::Cell;
use std::rc::Rc;

use glam::Vec3;

pub use geometry::{Geometry, GeometryKind, Vertex};
pub use material::{Material, MaterialKind, Texture};
pub use node::SceneNode;

/// Per-object "already released" flag.
///
/// The flag lives on the object rather than in a visited set, so shared
/// objects reached through different parents, or released by different
/// owners, are still released once.
#[derive(Debug, Default)]
pub struct DisposeMarker(Cell<bool>);

impl DisposeMarker {
    pub fn is_disposed(&self) -> bool {
        self.0.get()
    }

    /// Sets the flag. Returns `true` only for the first call.
    pub(crate) fn mark(&self) -> bool {
        !self.0.replace(true)
    }
}

/// Whether a reference is responsible for releasing what it points at.
#[derive(Clone, Debug)]
pub enum Ownership<T> {
    /// Released together with the holder.
    Owned(T),
    /// Kept alive by someone else; never released through this reference.
    Borrowed(T),
}

impl<T> Ownership<T> {
    pub fn get(&self) -> &T {
        match self {
            Self::Owned(v) | Self::Borrowed(v) => v,
        }
    }

    pub fn owned(&self) -> Option<&T> {
        match self {
            Self::Owned(v) => Some(v),
            Self::Borrowed(_) => None,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

/// A root container of scene nodes.
#[derive(Debug, Default)]
pub struct Scene {
    name: String,
    children: Vec<Rc<SceneNode>>,
}

impl Scene {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&mut self, node: Rc<SceneNode>) {
        self.children.push(node);
    }

    pub fn children(&self) -> &[Rc<SceneNode>] {
        &self.children
    }

    /// Detaches every root node without releasing anything.
    pub fn clear(&mut self) {
        self.children.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Visits every node that has both geometry and a material, depth first
    /// in insertion order, with its accumulated translation.
    pub fn for_each_mesh(&self, mut f: impl FnMut(&SceneNode, Vec3)) {
        fn walk(node: &SceneNode, offset: Vec3, f: &mut dyn FnMut(&SceneNode, Vec3)) {
            let offset = offset + node.translation();
            if node.geometry().is_some() && node.material().is_some() {
                f(node, offset);
            }
            for child in node.children().iter() {
                walk(child, offset, f);
            }
        }

        for node in &self.children {
            walk(node, Vec3::ZERO, &mut f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_reports_first_mark_only() {
        let marker = DisposeMarker::default();
        assert!(!marker.is_disposed());
        assert!(marker.mark());
        assert!(!marker.mark());
        assert!(marker.is_disposed());
    }

    #[test]
    fn ownership_exposes_owned_only() {
        let owned = Ownership::Owned(1);
        let borrowed = Ownership::Borrowed(2);
        assert_eq!(owned.owned(), Some(&1));
        assert_eq!(borrowed.owned(), None);
        assert_eq!(*borrowed.get(), 2);
    }

    #[test]
    fn mesh_walk_accumulates_translation() {
        let mut renderer = crate::SoftwareRenderer::new(4, 4);
        let material = Material::basic("m", glam::Vec4::ONE, None);
        let geometry = Geometry::new(
            &mut renderer,
            GeometryKind::Plane {
                width: 1.0,
                height: 1.0,
            },
        )
        .unwrap();
        let leaf = SceneNode::new("leaf")
            .at(Vec3::new(0.5, 0.0, 0.0))
            .with_geometry(geometry)
            .with_material(material)
            .build();
        let group = SceneNode::new("group")
            .at(Vec3::new(0.0, 0.25, 0.0))
            .with_child(leaf)
            .build();

        let mut scene = Scene::new("s");
        scene.add(group);

        let mut seen = Vec::new();
        scene.for_each_mesh(|node, offset| seen.push((node.name().to_string(), offset)));
        assert_eq!(seen, [("leaf".to_string(), Vec3::new(0.5, 0.25, 0.0))]);
    }
}
