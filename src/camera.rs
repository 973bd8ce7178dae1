use glam::{Mat4, Vec3, Vec4};

/// A camera for scenes drawn by a [`Renderer`](crate::Renderer).
///
/// Full-screen passes use [`Camera::fullscreen`]: an orthographic camera
/// over the [-1, 1] square. Perspective cameras keep their aspect ratio in
/// step with the canvas through [`update_aspect`](Self::update_aspect).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Camera {
    Orthographic {
        left: f32,
        right: f32,
        top: f32,
        bottom: f32,
        near: f32,
        far: f32,
    },
    Perspective {
        position: [f32; 3],
        forward: [f32; 3],
        up: [f32; 3],
        fov: f32, // radians
        aspect: f32,
    },
}

impl Default for Camera {
    fn default() -> Self {
        Self::Perspective {
            position: [0.0, 0.0, 5.0],
            forward: [0.0, 0.0, -1.0],
            up: [0.0, 1.0, 0.0],
            fov: std::f32::consts::FRAC_PI_2, // 90 degrees
            aspect: 1.0,
        }
    }
}

impl Camera {
    /// Orthographic projection of the [-1, 1]² view volume.
    pub fn fullscreen() -> Self {
        Self::Orthographic {
            left: -1.0,
            right: 1.0,
            top: 1.0,
            bottom: -1.0,
            near: 0.1,
            far: 10.0,
        }
    }

    pub fn perspective() -> Self {
        Self::default()
    }

    pub fn is_orthographic(&self) -> bool {
        matches!(self, Self::Orthographic { .. })
    }

    pub fn at(mut self, x: f32, y: f32, z: f32) -> Self {
        if let Self::Perspective { position, .. } = &mut self {
            *position = [x, y, z];
        }
        self
    }

    pub fn looking_at(mut self, target_x: f32, target_y: f32, target_z: f32) -> Self {
        if let Self::Perspective {
            position, forward, ..
        } = &mut self
        {
            *forward = normalize([
                target_x - position[0],
                target_y - position[1],
                target_z - position[2],
            ]);
        }
        self
    }

    pub fn with_fov(mut self, fov_degrees: f32) -> Self {
        if let Self::Perspective { fov, .. } = &mut self {
            *fov = fov_degrees.to_radians();
        }
        self
    }

    /// Matches the aspect ratio to a `width` x `height` canvas. Returns
    /// `true` if the projection changed. Orthographic cameras are left alone.
    pub fn update_aspect(&mut self, width: u32, height: u32) -> bool {
        let Self::Perspective { aspect, .. } = self else {
            return false;
        };
        if width == 0 || height == 0 {
            return false;
        }
        let next = width as f32 / height as f32;
        if *aspect == next {
            return false;
        }
        *aspect = next;
        true
    }

    /// Projection from world space to clip space.
    ///
    /// Orthographic cameras look down -Z from the origin and flatten depth to
    /// a constant, so nothing is ever clipped by the near or far plane.
    pub fn clip_from_world(&self) -> Mat4 {
        match *self {
            Self::Orthographic {
                left,
                right,
                top,
                bottom,
                ..
            } => {
                let sx = 2.0 / (right - left);
                let sy = 2.0 / (top - bottom);
                Mat4::from_cols(
                    Vec4::new(sx, 0.0, 0.0, 0.0),
                    Vec4::new(0.0, sy, 0.0, 0.0),
                    Vec4::ZERO,
                    Vec4::new(
                        -(right + left) / (right - left),
                        -(top + bottom) / (top - bottom),
                        0.5,
                        1.0,
                    ),
                )
            }
            Self::Perspective {
                position,
                forward,
                up,
                fov,
                aspect,
            } => {
                let view =
                    Mat4::look_to_rh(Vec3::from(position), Vec3::from(forward), Vec3::from(up));
                Mat4::perspective_rh(fov, aspect, 0.1, 1000.0) * view
            }
        }
    }

    /// Aspect ratio, `None` for orthographic cameras.
    pub fn aspect(&self) -> Option<f32> {
        match self {
            Self::Perspective { aspect, .. } => Some(*aspect),
            Self::Orthographic { .. } => None,
        }
    }
}

fn normalize(v: [f32; 3]) -> [f32; 3] {
    let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if len > 0.0 {
        [v[0] / len, v[1] / len, v[2] / len]
    } else {
        [0.0, 0.0, 0.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_aspect_only_on_change() {
        let mut camera = Camera::perspective();
        assert!(camera.update_aspect(1600, 900));
        assert!(!camera.update_aspect(1600, 900));
        assert_eq!(camera.aspect(), Some(1600.0 / 900.0));
    }

    #[test]
    fn orthographic_ignores_aspect() {
        let mut camera = Camera::fullscreen();
        assert!(!camera.update_aspect(100, 50));
        assert_eq!(camera.aspect(), None);
    }

    #[test]
    fn fullscreen_projection_is_identity_on_xy() {
        let m = Camera::fullscreen().clip_from_world();
        let p = m * Vec4::new(-1.0, 0.5, 0.0, 1.0);
        assert_eq!((p.x, p.y, p.w), (-1.0, 0.5, 1.0));
    }

    #[test]
    fn perspective_projects_in_front_of_camera() {
        let m = Camera::perspective().clip_from_world();
        let p = m * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!(p.w > 0.0);
        assert!((p.x / p.w).abs() < 1e-6);
    }

    #[test]
    fn looking_at_normalizes() {
        let camera = Camera::perspective().at(0.0, 0.0, 0.0).looking_at(0.0, 3.0, 0.0);
        let Camera::Perspective { forward, .. } = camera else {
            panic!("expected perspective");
        };
        assert_eq!(forward, [0.0, 1.0, 0.0]);
    }
}
