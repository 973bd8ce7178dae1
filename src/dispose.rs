//! Releasing the GPU resources held by a scene graph.
//!
//! [`SceneResourceDisposer`] walks a graph depth first and releases, for each
//! node: its children, its geometry, its materials (and every texture slot a
//! material owns), the render targets the node owns, and finally the node.
//! Anything flagged `no_dispose` is skipped together with what hangs off it.
//!
//! Uniform sets are never traversed. A texture bound only as a uniform is a
//! [`TextureRef`](crate::TextureRef) and belongs to whoever created it.

use std::rc::Rc;

use crate::renderer::Renderer;
use crate::scene::{Geometry, Material, Scene, SceneNode, Texture};
use crate::target::RenderTarget;

/// Everything the disposer knows how to release.
#[derive(Clone, Copy, Debug)]
pub enum Disposable<'a> {
    Geometry(&'a Geometry),
    Material(&'a Material),
    Texture(&'a Texture),
    RenderTarget(&'a RenderTarget),
    Node(&'a SceneNode),
}

/// What a disposer released so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisposeStats {
    pub nodes: usize,
    pub geometries: usize,
    pub materials: usize,
    pub textures: usize,
    pub targets: usize,
    /// Objects left alone because they were flagged `no_dispose`.
    pub skipped: usize,
}

impl DisposeStats {
    /// Number of GPU resources released.
    pub fn released(&self) -> usize {
        self.geometries + self.materials + self.textures + self.targets
    }
}

pub struct SceneResourceDisposer<'r, R: Renderer + ?Sized> {
    renderer: &'r mut R,
    stats: DisposeStats,
}

impl<'r, R: Renderer + ?Sized> SceneResourceDisposer<'r, R> {
    pub fn new(renderer: &'r mut R) -> Self {
        Self {
            renderer,
            stats: DisposeStats::default(),
        }
    }

    pub fn stats(&self) -> DisposeStats {
        self.stats
    }

    /// Releases `node` and everything below it.
    pub fn dispose_node(&mut self, node: &SceneNode) {
        self.visit(Disposable::Node(node));
    }

    /// Releases every root node not flagged `no_dispose`, then empties the
    /// scene.
    pub fn dispose_scene_graph(&mut self, scene: &mut Scene) {
        let roots: Vec<Rc<SceneNode>> = scene.children().to_vec();
        for node in &roots {
            self.visit(Disposable::Node(node));
        }
        scene.clear();
        log::debug!("disposed scene '{}': {:?}", scene.name(), self.stats);
    }

    pub fn visit(&mut self, item: Disposable<'_>) {
        match item {
            Disposable::Node(node) => {
                if node.no_dispose() {
                    log::trace!("keeping node '{}'", node.name());
                    self.stats.skipped += 1;
                    return;
                }
                if node.is_disposed() {
                    return;
                }
                let children: Vec<Rc<SceneNode>> = node.children().to_vec();
                for child in &children {
                    self.visit(Disposable::Node(child));
                }
                if let Some(geometry) = node.geometry() {
                    self.visit(Disposable::Geometry(geometry));
                }
                for material in node.materials() {
                    self.visit(Disposable::Material(material));
                }
                for target in node.targets() {
                    self.visit(Disposable::RenderTarget(target));
                }
                if node.marker().mark() {
                    self.stats.nodes += 1;
                }
            }
            Disposable::Geometry(geometry) => {
                if geometry.dispose(&mut *self.renderer) {
                    self.stats.geometries += 1;
                }
            }
            Disposable::Material(material) => {
                if material.no_dispose() {
                    self.stats.skipped += 1;
                    return;
                }
                if material.dispose(&mut *self.renderer) {
                    self.stats.materials += 1;
                }
                // owned slots outlive an earlier direct dispose of the material
                for slot in material.texture_slots() {
                    match slot.owned() {
                        Some(texture) => self.visit(Disposable::Texture(texture)),
                        None => log::trace!(
                            "material '{}' borrows its texture; leaving it",
                            material.name()
                        ),
                    }
                }
            }
            Disposable::Texture(texture) => {
                if texture.no_dispose() {
                    self.stats.skipped += 1;
                    return;
                }
                if texture.dispose(&mut *self.renderer) {
                    self.stats.textures += 1;
                }
            }
            Disposable::RenderTarget(target) => {
                if target.dispose(&mut *self.renderer) {
                    self.stats.targets += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SoftwareRenderer;
    use crate::renderer::{GpuHandle, TargetDescriptor};
    use crate::scene::{GeometryKind, Ownership};
    use crate::shader::FragmentSource;
    use crate::target::FilterMode;
    use crate::uniforms::ShaderUniformSet;
    use glam::Vec4;

    fn quad(renderer: &mut SoftwareRenderer) -> Rc<Geometry> {
        Geometry::new(renderer, GeometryKind::FULLSCREEN_QUAD).unwrap()
    }

    fn texture(renderer: &mut SoftwareRenderer) -> Rc<Texture> {
        Texture::solid(renderer, Vec4::ONE).unwrap()
    }

    #[test]
    fn releases_every_resource_once() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let geometry = quad(&mut renderer);
        let map = texture(&mut renderer);
        let material = Material::basic("m", Vec4::ONE, Some(Ownership::Owned(map.clone())));
        let target = RenderTarget::new(
            &mut renderer,
            TargetDescriptor {
                width: 4,
                height: 4,
                filter: FilterMode::Linear,
                attachments: 1,
            },
        )
        .unwrap();
        let node = SceneNode::new("n")
            .with_geometry(geometry.clone())
            .with_material(material)
            .with_target(target.clone())
            .build();
        let mut scene = Scene::new("s");
        scene.add(node.clone());

        let mut disposer = SceneResourceDisposer::new(&mut renderer);
        disposer.dispose_scene_graph(&mut scene);
        disposer.dispose_node(&node);
        let stats = disposer.stats();

        assert_eq!(
            stats,
            DisposeStats {
                nodes: 1,
                geometries: 1,
                materials: 1,
                textures: 1,
                targets: 1,
                skipped: 0,
            }
        );
        assert!(scene.is_empty());
        assert!(node.is_disposed() && geometry.is_disposed() && target.is_disposed());
        assert_eq!(renderer.release_count(GpuHandle::Texture(map.id())), 1);
        assert_eq!(renderer.live_targets(), 0);
        assert_eq!(renderer.live_textures(), 0);
        assert_eq!(renderer.live_geometries(), 0);
    }

    #[test]
    fn uniform_only_texture_survives() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let external = texture(&mut renderer);
        let material = Material::shader(
            &mut renderer,
            "sampler",
            &FragmentSource::native(|input| input.sample("tex", input.uv)),
            ShaderUniformSet::new().with("tex", external.texture_ref()),
        )
        .unwrap();
        let geometry = quad(&mut renderer);
        let mut scene = Scene::new("s");
        scene.add(
            SceneNode::new("n")
                .with_geometry(geometry)
                .with_material(material)
                .build(),
        );

        let mut disposer = SceneResourceDisposer::new(&mut renderer);
        disposer.dispose_scene_graph(&mut scene);
        assert_eq!(disposer.stats().textures, 0);
        assert_eq!(disposer.stats().materials, 1);

        assert!(!external.is_disposed());
        assert_eq!(renderer.live_textures(), 1);
        assert_eq!(renderer.live_programs(), 0);
    }

    #[test]
    fn borrowed_and_shared_textures_survive() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let borrowed = texture(&mut renderer);
        let shared =
            Texture::shared(&mut renderer, 1, 1, FilterMode::Nearest, &[Vec4::ONE]).unwrap();
        let geometry = quad(&mut renderer);
        let node = SceneNode::new("n")
            .with_geometry(geometry)
            .with_material(Material::basic(
                "a",
                Vec4::ONE,
                Some(Ownership::Borrowed(borrowed.clone())),
            ))
            .with_material(Material::basic(
                "b",
                Vec4::ONE,
                Some(Ownership::Owned(shared.clone())),
            ))
            .build();

        let mut disposer = SceneResourceDisposer::new(&mut renderer);
        disposer.dispose_node(&node);
        assert_eq!(disposer.stats().materials, 2);
        assert_eq!(disposer.stats().skipped, 1);
        assert!(!borrowed.is_disposed());
        assert!(!shared.is_disposed());
        assert_eq!(renderer.live_textures(), 2);
    }

    #[test]
    fn keep_alive_subtree_is_skipped() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let inner_geometry = quad(&mut renderer);
        let inner = SceneNode::new("inner")
            .with_geometry(inner_geometry.clone())
            .with_material(Material::basic("m", Vec4::ONE, None))
            .build();
        let kept = SceneNode::new("kept").with_child(inner).keep_alive().build();
        let dropped_geometry = quad(&mut renderer);
        let dropped = SceneNode::new("dropped")
            .with_geometry(dropped_geometry.clone())
            .build();

        let mut scene = Scene::new("s");
        scene.add(kept.clone());
        scene.add(dropped);

        let mut disposer = SceneResourceDisposer::new(&mut renderer);
        disposer.dispose_scene_graph(&mut scene);
        assert_eq!(disposer.stats().skipped, 1);

        assert!(!kept.is_disposed());
        assert!(!inner_geometry.is_disposed());
        assert!(dropped_geometry.is_disposed());
        assert_eq!(renderer.live_geometries(), 1);
    }

    #[test]
    fn shared_child_is_released_once() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let geometry = quad(&mut renderer);
        let shared = SceneNode::new("shared")
            .with_geometry(geometry.clone())
            .with_material(Material::basic("m", Vec4::ONE, None))
            .build();
        let a = SceneNode::new("a").with_child(shared.clone()).build();
        let b = SceneNode::new("b").with_child(shared.clone()).build();
        let mut scene = Scene::new("s");
        scene.add(a);
        scene.add(b);

        let mut disposer = SceneResourceDisposer::new(&mut renderer);
        disposer.dispose_scene_graph(&mut scene);
        let stats = disposer.stats();
        assert_eq!(stats.nodes, 3);
        assert_eq!(stats.geometries, 1);
        assert_eq!(stats.released(), 2);
        assert_eq!(renderer.release_count(GpuHandle::Geometry(geometry.id())), 1);
    }

    #[test]
    fn owned_texture_of_released_material_is_still_freed() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let map = texture(&mut renderer);
        let material = Material::basic("m", Vec4::ONE, Some(Ownership::Owned(map.clone())));
        assert!(material.dispose(&mut renderer));

        let mut scene = Scene::new("s");
        scene.add(SceneNode::new("n").with_material(material).build());
        let mut disposer = SceneResourceDisposer::new(&mut renderer);
        disposer.dispose_scene_graph(&mut scene);
        assert_eq!(disposer.stats().materials, 0);
        assert_eq!(disposer.stats().textures, 1);

        assert!(map.is_disposed());
        assert_eq!(renderer.live_textures(), 0);
        assert_eq!(renderer.release_count(GpuHandle::Texture(map.id())), 1);
    }

    #[test]
    fn keep_alive_material_is_skipped() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let map = texture(&mut renderer);
        let material =
            Material::basic("m", Vec4::ONE, Some(Ownership::Owned(map.clone()))).keep_alive();
        let node = SceneNode::new("n").with_material(material.clone()).build();

        let mut disposer = SceneResourceDisposer::new(&mut renderer);
        disposer.dispose_node(&node);
        assert!(node.is_disposed());
        assert!(!material.is_disposed());
        assert!(!map.is_disposed());
    }
}
