extern crate nalgebra as na;

pub type Point2 = na::Point2<f32>;
pub type Vector2 = na::Vector2<f32>;

/// Rigid/affine 2D transform in homogeneous form. Device and view matrices
/// are compositions of rotations and translations only.
pub type Transform2 = na::Affine2<f32>;

pub fn identity() -> Transform2 {
    Transform2::identity()
}

/// Rotation about the origin in scan-angle convention (azimuth measured from
/// the +y axis, see [`polar_to_cart`]).
pub fn rot_z(angle: f32) -> Transform2 {
    Transform2::from_matrix_unchecked(na::Rotation2::new(-angle).to_homogeneous())
}

pub fn translation(x: f32, y: f32) -> Transform2 {
    Transform2::from_matrix_unchecked(na::Matrix3::new(1., 0., x, 0., 1., y, 0., 0., 1.))
}

/// A scan sample at `angle` radians and `distance` metres.
/// x points "sideways", y "forward": a sample at angle 0 lies on the +y axis.
pub fn polar_to_cart(angle: f32, distance: f32) -> Point2 {
    Point2::new(distance * angle.sin(), distance * angle.cos())
}

/// Azimuth of a point, inverse of [`polar_to_cart`].
pub fn angle_of(p: &Point2) -> f32 {
    p.x.atan2(p.y)
}

pub fn distance(a: &Point2, b: &Point2) -> f32 {
    na::distance(a, b)
}

pub fn is_identity(m: &Transform2) -> bool {
    *m == Transform2::identity()
}

/// Flatten to the on-disk order `m00 m01 m10 m11 tx ty` (column x, column y,
/// translation), as used by the matrix file format.
pub fn to_six(m: &Transform2) -> [f32; 6] {
    let h = m.matrix();
    [h[(0, 0)], h[(1, 0)], h[(0, 1)], h[(1, 1)], h[(0, 2)], h[(1, 2)]]
}

pub fn from_six(c: &[f32; 6]) -> Transform2 {
    Transform2::from_matrix_unchecked(na::Matrix3::new(
        c[0], c[2], c[4], c[1], c[3], c[5], 0., 0., 1.,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    #[test]
    fn polar_round_trip() {
        let p = polar_to_cart(0.3, 2.0);
        assert!((angle_of(&p) - 0.3).abs() < EPS);
        assert!((distance(&p, &Point2::origin()) - 2.0).abs() < EPS);
    }

    #[test]
    fn angle_zero_is_forward() {
        let p = polar_to_cart(0.0, 1.5);
        assert!(p.x.abs() < EPS);
        assert!((p.y - 1.5).abs() < EPS);
    }

    #[test]
    fn rot_z_advances_azimuth() {
        let p = polar_to_cart(0.2, 1.0);
        let q = rot_z(0.3) * p;
        assert!((angle_of(&q) - 0.5).abs() < EPS);
    }

    #[test]
    fn six_float_round_trip() {
        let m = translation(1.5, -0.25) * rot_z(0.7);
        let m2 = from_six(&to_six(&m));
        for (a, b) in to_six(&m).iter().zip(to_six(&m2).iter()) {
            assert!((a - b).abs() < EPS);
        }
    }

    #[test]
    fn inverse_composes_to_identity() {
        let m = translation(0.5, 2.0) * rot_z(1.1);
        let p = Point2::new(0.3, 0.9);
        let q = m.inverse() * (m * p);
        assert!(distance(&p, &q) < EPS);
    }
}
