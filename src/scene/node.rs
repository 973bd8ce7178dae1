//! Hierarchical scene nodes.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use glam::Vec3;

use crate::scene::{DisposeMarker, Geometry, Material};
use crate::target::RenderTarget;

/// A node of the scene graph.
///
/// Built with a consuming builder and frozen into an `Rc` by
/// [`build`](Self::build). Children can still be attached afterwards through
/// [`add_child`](Self::add_child).
#[derive(Debug, Default)]
pub struct SceneNode {
    name: String,
    translation: Vec3,
    geometry: Option<Rc<Geometry>>,
    materials: Vec<Rc<Material>>,
    targets: Vec<Rc<RenderTarget>>,
    children: RefCell<Vec<Rc<SceneNode>>>,
    no_dispose: bool,
    marker: DisposeMarker,
}

impl SceneNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn at(mut self, translation: Vec3) -> Self {
        self.translation = translation;
        self
    }

    pub fn with_geometry(mut self, geometry: Rc<Geometry>) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_material(mut self, material: Rc<Material>) -> Self {
        self.materials.push(material);
        self
    }

    pub fn with_materials(mut self, materials: impl IntoIterator<Item = Rc<Material>>) -> Self {
        self.materials.extend(materials);
        self
    }

    /// Attaches a render target the node owns and releases with itself.
    pub fn with_target(mut self, target: Rc<RenderTarget>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_child(self, child: Rc<SceneNode>) -> Self {
        self.children.borrow_mut().push(child);
        self
    }

    /// Excludes this node and its whole subtree from scene disposal.
    pub fn keep_alive(mut self) -> Self {
        self.no_dispose = true;
        self
    }

    pub fn build(self) -> Rc<Self> {
        Rc::new(self)
    }

    pub fn add_child(&self, child: Rc<SceneNode>) {
        self.children.borrow_mut().push(child);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn translation(&self) -> Vec3 {
        self.translation
    }

    pub fn geometry(&self) -> Option<&Rc<Geometry>> {
        self.geometry.as_ref()
    }

    /// The material used for drawing: the first one.
    pub fn material(&self) -> Option<&Rc<Material>> {
        self.materials.first()
    }

    pub fn materials(&self) -> &[Rc<Material>] {
        &self.materials
    }

    pub fn targets(&self) -> &[Rc<RenderTarget>] {
        &self.targets
    }

    pub fn children(&self) -> Ref<'_, Vec<Rc<SceneNode>>> {
        self.children.borrow()
    }

    pub fn no_dispose(&self) -> bool {
        self.no_dispose
    }

    pub fn is_disposed(&self) -> bool {
        self.marker.is_disposed()
    }

    pub(crate) fn marker(&self) -> &DisposeMarker {
        &self.marker
    }
}
