//! Matrix adapter
//!
//! The VR runtime hands out row-major `m[row][col]` matrices, either full 4x4
//! projections or 3x4 affine device transforms. Rendering works in glam's
//! column-major convention. The two shapes map to two distinct types so that
//! "no projective component" is a property of the type, not of the data.

use glam::{Affine3A, Mat4, Vec3, Vec3A, Vec4};

/// Row-major 3x4 transform as reported by the runtime (implicit `[0,0,0,1]` bottom row).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawMatrix34 {
    pub m: [[f32; 4]; 3],
}

/// Row-major 4x4 matrix as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawMatrix44 {
    pub m: [[f32; 4]; 4],
}

impl RawMatrix34 {
    pub const IDENTITY: Self = Self {
        m: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Lays an affine transform out the way the runtime does.
    pub fn from_affine(affine: Affine3A) -> Self {
        let x = affine.matrix3.x_axis;
        let y = affine.matrix3.y_axis;
        let z = affine.matrix3.z_axis;
        let t = affine.translation;
        Self {
            m: [
                [x.x, y.x, z.x, t.x],
                [x.y, y.y, z.y, t.y],
                [x.z, y.z, z.z, t.z],
            ],
        }
    }
}

impl RawMatrix44 {
    pub fn from_mat4(mat: Mat4) -> Self {
        // rows of a column-major matrix are the columns of its transpose
        Self {
            m: mat.transpose().to_cols_array_2d(),
        }
    }
}

/// Rotation + translation, bottom row fixed at `(0,0,0,1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform(Affine3A);

impl AffineTransform {
    pub const IDENTITY: Self = Self(Affine3A::IDENTITY);

    pub fn from_affine(affine: Affine3A) -> Self {
        Self(affine)
    }

    pub fn affine(&self) -> Affine3A {
        self.0
    }

    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from(self.0)
    }

    /// Device and eye transforms are rigid, so they are always invertible.
    ///
    /// # Panics
    /// If the linear part is singular.
    pub fn inverse(&self) -> Self {
        let det = self.0.matrix3.determinant();
        assert!(
            det != 0.0 && det.is_finite(),
            "singular device transform (determinant {det})"
        );
        Self(self.0.inverse())
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.0.transform_point3(point)
    }

    pub fn translation(&self) -> Vec3 {
        self.0.translation.into()
    }
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// A full 4x4 matrix that may carry a perspective row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectiveMatrix(Mat4);

impl ProjectiveMatrix {
    pub fn to_mat4(&self) -> Mat4 {
        self.0
    }
}

/// Converts a runtime 4x4 matrix, transposing into column-major order.
pub fn to_matrix4x4(raw: &RawMatrix44) -> ProjectiveMatrix {
    let m = &raw.m;
    ProjectiveMatrix(Mat4::from_cols(
        Vec4::new(m[0][0], m[1][0], m[2][0], m[3][0]),
        Vec4::new(m[0][1], m[1][1], m[2][1], m[3][1]),
        Vec4::new(m[0][2], m[1][2], m[2][2], m[3][2]),
        Vec4::new(m[0][3], m[1][3], m[2][3], m[3][3]),
    ))
}

/// Converts a runtime 3x4 transform; the fourth row is `(0,0,0,1)` by construction.
pub fn to_affine_matrix4x4(raw: &RawMatrix34) -> AffineTransform {
    let m = &raw.m;
    AffineTransform(Affine3A::from_cols(
        Vec3A::new(m[0][0], m[1][0], m[2][0]),
        Vec3A::new(m[0][1], m[1][1], m[2][1]),
        Vec3A::new(m[0][2], m[1][2], m[2][2]),
        Vec3A::new(m[0][3], m[1][3], m[2][3]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    fn sample_raw() -> RawMatrix34 {
        let affine = Affine3A::from_rotation_translation(
            Quat::from_euler(glam::EulerRot::YXZ, 0.4, -0.2, 0.1),
            Vec3::new(0.3, 1.6, -0.5),
        );
        RawMatrix34::from_affine(affine)
    }

    #[test]
    fn affine_conversion_transposes_and_fixes_bottom_row() {
        let raw = RawMatrix34 {
            m: [
                [1.0, 2.0, 3.0, 4.0],
                [5.0, 6.0, 7.0, 8.0],
                [9.0, 10.0, 11.0, 12.0],
            ],
        };
        let mat = to_affine_matrix4x4(&raw).to_mat4();
        for row in 0..3 {
            for col in 0..4 {
                assert_eq!(mat.col(col)[row], raw.m[row][col]);
            }
        }
        assert_eq!(mat.row(3), Vec4::new(0.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn projection_conversion_keeps_perspective_row() {
        let mut raw = RawMatrix44 { m: [[0.0; 4]; 4] };
        raw.m[0][0] = 1.2;
        raw.m[1][1] = 1.5;
        raw.m[2][2] = -1.0;
        raw.m[2][3] = -0.1;
        raw.m[3][2] = -1.0;
        let mat = to_matrix4x4(&raw).to_mat4();
        assert_eq!(mat.row(3), Vec4::new(0.0, 0.0, -1.0, 0.0));
        assert_eq!(mat.col(3).z, -0.1);
        assert_eq!(RawMatrix44::from_mat4(mat), raw);
    }

    #[test]
    fn affine_inverse_round_trips_to_identity() {
        let transform = to_affine_matrix4x4(&sample_raw());
        let product = transform.to_mat4() * transform.inverse().to_mat4();
        assert!(product.abs_diff_eq(Mat4::IDENTITY, 1e-5));
    }

    #[test]
    fn raw_layout_round_trips() {
        let raw = sample_raw();
        let back = RawMatrix34::from_affine(to_affine_matrix4x4(&raw).affine());
        assert_eq!(back, raw);
    }

    #[test]
    #[should_panic(expected = "singular")]
    fn singular_transform_is_fatal() {
        let raw = RawMatrix34 { m: [[0.0; 4]; 3] };
        let _ = to_affine_matrix4x4(&raw).inverse();
    }
}
