//! Camera and the camera uniform block

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Perspective camera looking at a target point.
///
/// Right-handed view space with -Z forward, depth mapped to 0..1.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 200.0,
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            ..Default::default()
        }
    }

    pub fn with_fov_degrees(mut self, fov_y: f32) -> Self {
        self.fov_y = fov_y.to_radians();
        self
    }

    pub fn with_clip(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    /// Position the camera on a horizontal circle around `target`.
    pub fn orbit(&mut self, angle: f32, distance: f32, height: f32) {
        self.position = self.target
            + Vec3::new(angle.cos() * distance, height, angle.sin() * distance);
    }

    pub fn set_aspect(&mut self, width: u32, height: u32) {
        self.aspect = width.max(1) as f32 / height.max(1) as f32;
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// NDC depth of a point `distance` units in front of the camera
    pub fn ndc_depth(&self, distance: f32) -> f32 {
        let clip = self.projection_matrix() * Vec4::new(0.0, 0.0, -distance, 1.0);
        clip.z / clip.w
    }

    /// NDC depths bounding `slices` depth slices, near to far.
    ///
    /// Slices split the view distance exponentially; one slice covers the
    /// whole 0..1 depth range.
    pub fn depth_planes(&self, slices: u32) -> Vec<f32> {
        let slices = slices.max(1);
        if slices == 1 {
            return vec![0.0, 1.0];
        }
        let ratio = self.far / self.near;
        (0..=slices)
            .map(|i| match i {
                0 => 0.0,
                i if i == slices => 1.0,
                i => {
                    let distance = self.near * ratio.powf(i as f32 / slices as f32);
                    self.ndc_depth(distance)
                }
            })
            .collect()
    }

    /// Build the uniform block for a viewport of `width` x `height` pixels.
    pub fn uniform_data(&self, width: u32, height: u32) -> CameraUniform {
        let view = self.view_matrix();
        let proj = self.projection_matrix();
        CameraUniform {
            view,
            proj,
            view_proj: proj * view,
            inv_view: view.inverse(),
            inv_proj: proj.inverse(),
            position: self.position.extend(1.0),
            near_far: Vec4::new(self.near, self.far, 0.0, 0.0),
            viewport: Vec4::new(
                width as f32,
                height as f32,
                1.0 / width.max(1) as f32,
                1.0 / height.max(1) as f32,
            ),
        }
    }
}

/// Camera uniform block shared by every pipeline
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_proj: Mat4,
    pub inv_view: Mat4,
    pub inv_proj: Mat4,
    pub position: Vec4,
    /// x = near, y = far
    pub near_far: Vec4,
    /// xy = size in pixels, zw = reciprocal size
    pub viewport: Vec4,
}

const _: () = assert!(std::mem::size_of::<CameraUniform>() == 368);

impl Default for CameraUniform {
    fn default() -> Self {
        Camera::default().uniform_data(1, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_range_is_zero_to_one() {
        let camera = Camera::default();
        assert!(camera.ndc_depth(camera.near).abs() < 1e-5);
        assert!((camera.ndc_depth(camera.far) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_target_projects_to_screen_center() {
        let camera = Camera::new(Vec3::new(3.0, 4.0, 5.0), Vec3::new(0.0, 1.0, 0.0));
        let clip = camera.view_projection_matrix() * camera.target.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn test_depth_planes_increase() {
        let camera = Camera::default();
        assert_eq!(camera.depth_planes(1), vec![0.0, 1.0]);
        let planes = camera.depth_planes(4);
        assert_eq!(planes.len(), 5);
        assert!(planes.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_uniform_inverses() {
        let camera = Camera::new(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO);
        let uniform = camera.uniform_data(640, 480);
        let identity = uniform.proj * uniform.inv_proj;
        assert!(identity.abs_diff_eq(Mat4::IDENTITY, 1e-4));
        assert_eq!(uniform.viewport.x, 640.0);
    }
}
