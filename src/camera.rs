//! Eye camera model
//!
//! Per-eye projection and eye offset, fetched from the runtime once per
//! session and combined with the head pose every frame.

use glam::Mat4;

use crate::error::SessionInitError;
use crate::math::{to_affine_matrix4x4, to_matrix4x4, AffineTransform, ProjectiveMatrix};
use crate::runtime::{Eye, VrRuntime};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeView {
    pub projection: ProjectiveMatrix,
    /// Eye-to-head offset as reported by the runtime.
    pub eye_to_head: AffineTransform,
    /// Inverse of `eye_to_head`, precomputed.
    pub head_to_eye: AffineTransform,
}

impl EyeView {
    pub fn view_projection(&self, head_pose: Mat4) -> Mat4 {
        self.projection.to_mat4() * self.head_to_eye.to_mat4() * head_pose
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeViews {
    pub left: EyeView,
    pub right: EyeView,
}

impl EyeViews {
    pub fn get(&self, eye: Eye) -> &EyeView {
        match eye {
            Eye::Left => &self.left,
            Eye::Right => &self.right,
        }
    }

    /// `projection[eye] * inverse(eye_to_head[eye]) * head_pose`
    pub fn view_projection(&self, eye: Eye, head_pose: Mat4) -> Mat4 {
        self.get(eye).view_projection(head_pose)
    }
}

pub fn compute_eye_views<R: VrRuntime + ?Sized>(
    runtime: &R,
    near_clip: f32,
    far_clip: f32,
) -> Result<EyeViews, SessionInitError> {
    let view = |eye: Eye| -> Result<EyeView, SessionInitError> {
        let projection = runtime
            .projection_matrix(eye, near_clip, far_clip)
            .map_err(|source| SessionInitError::EyeView { eye, source })?;
        let eye_to_head = runtime
            .eye_to_head_transform(eye)
            .map_err(|source| SessionInitError::EyeView { eye, source })?;

        let eye_to_head = to_affine_matrix4x4(&eye_to_head);
        Ok(EyeView {
            projection: to_matrix4x4(&projection),
            eye_to_head,
            head_to_eye: eye_to_head.inverse(),
        })
    };

    Ok(EyeViews {
        left: view(Eye::Left)?,
        right: view(Eye::Right)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::testing::MockRuntime;
    use glam::Vec3;

    #[test]
    fn identity_head_pose_gives_projection_times_inverse_eye_offset() {
        let runtime = MockRuntime::new();
        let views = compute_eye_views(&runtime, 0.1, 30.0).unwrap();
        let left = views.left;

        let expected = left.projection.to_mat4() * left.eye_to_head.inverse().to_mat4();
        assert_eq!(views.view_projection(Eye::Left, Mat4::IDENTITY), expected);
        // pure: same answer on a second call
        assert_eq!(views.view_projection(Eye::Left, Mat4::IDENTITY), expected);
    }

    #[test]
    fn eye_offsets_are_mirrored() {
        let runtime = MockRuntime::new();
        let views = compute_eye_views(&runtime, 0.1, 30.0).unwrap();
        let left = views.left.eye_to_head.translation();
        let right = views.right.eye_to_head.translation();
        assert!(left.x < 0.0 && right.x > 0.0);
        assert!((left + right).abs_diff_eq(Vec3::ZERO, 1e-6));

        let round_trip = views.left.eye_to_head.to_mat4() * views.left.head_to_eye.to_mat4();
        assert!(round_trip.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn runtime_failure_is_fatal_to_startup() {
        let mut runtime = MockRuntime::new();
        runtime.fail_eye_data(Eye::Right);
        let err = compute_eye_views(&runtime, 0.1, 30.0).unwrap_err();
        assert!(matches!(
            err,
            SessionInitError::EyeView {
                eye: Eye::Right,
                source: RuntimeError::EyeData { .. }
            }
        ));
    }
}
