//! Screen-to-evaluation-space transforms
//!
//! Rendering happens in _screen_ coordinates (pixels, with `(0, 0)` at the
//! top-left corner of the output texture).  Expressions are evaluated in
//! _evaluation_ coordinates.  The objects in this module build the homogeneous
//! matrices that map between the two; the renderer uploads them into the
//! transform buffer.
use nalgebra::{
    Matrix3, Matrix4, Perspective3, Point2, Point3, Vector2, Vector3,
    geometry::Similarity2,
};

/// Returns a matrix mapping pixels to the ±1 square
///
/// The longer image axis spans ±1; the shorter axis is scaled to preserve
/// aspect ratio.  The Y axis is flipped, so +Y is up.
fn screen_to_world(width: u32, height: u32) -> Matrix3<f32> {
    let (w, h) = (width as f32, height as f32);
    let s = 2.0 / w.max(h);
    Matrix3::new(
        s, 0.0, -w / 2.0 * s, //
        0.0, -s, h / 2.0 * s, //
        0.0, 0.0, 1.0,
    )
}

/// Object providing a world-to-evaluation transform in 2D
///
/// The world is the ±1 square that [`screen_to_eval`](View2::screen_to_eval)
/// fits onto the image; the view then scales and translates it.
///
/// ```
/// # use nalgebra::{Point2, Vector2};
/// # use carve::view::View2;
/// let view = View2::from_center_and_scale(Vector2::new(5.0, 5.0), 2.0);
/// let m = view.screen_to_eval(128, 128);
///
/// // Top-left corner
/// let a = m.transform_point(&Point2::new(0.0, 0.0));
/// assert_eq!(a, Point2::new(3.0, 7.0));
///
/// // Bottom-right corner
/// let b = m.transform_point(&Point2::new(128.0, 128.0));
/// assert_eq!(b, Point2::new(7.0, 3.0));
/// ```
#[derive(Copy, Clone, Debug)]
pub struct View2 {
    mat: Similarity2<f32>,
}

impl Default for View2 {
    fn default() -> Self {
        Self {
            mat: Similarity2::identity(),
        }
    }
}

impl View2 {
    /// Builds a view from a center (in evaluation coordinates) and a scale
    ///
    /// The longer image axis spans `center ± scale`.
    pub fn from_center_and_scale(center: Vector2<f32>, scale: f32) -> Self {
        let mat =
            Similarity2::from_parts(center.into(), Default::default(), scale);
        Self { mat }
    }

    /// Returns the world-to-evaluation transform matrix
    pub fn world_to_eval(&self) -> Matrix3<f32> {
        self.mat.into()
    }

    /// Returns the combined screen-to-evaluation transform matrix
    pub fn screen_to_eval(&self, width: u32, height: u32) -> Matrix3<f32> {
        self.world_to_eval() * screen_to_world(width, height)
    }

    /// Transform a point from world to evaluation space
    pub fn transform_point(&self, p: &Point2<f32>) -> Point2<f32> {
        self.mat.transform_point(p)
    }

    /// Applies a translation (in evaluation units) to the view
    pub fn translate(&mut self, dt: Vector2<f32>) {
        self.mat.append_translation_mut(&dt.into());
    }

    /// Zooms the view about a particular position (in world space)
    pub fn zoom(&mut self, amount: f32, pos: Option<Point2<f32>>) {
        match pos {
            Some(before) => {
                let pos_before = self.transform_point(&before);
                self.mat.append_scaling_mut(amount);
                let pos_after = self.transform_point(&before);
                self.mat
                    .append_translation_mut(&(pos_before - pos_after).into());
            }
            None => {
                self.mat.append_scaling_mut(amount);
            }
        }
    }
}

/// Perspective camera in 3D
///
/// The screen-space depth coordinate runs from 0 at the near plane to 1 at
/// the far plane.
#[derive(Copy, Clone, Debug)]
pub struct Camera3 {
    /// Camera position, in evaluation coordinates
    pub eye: Point3<f32>,
    /// Point the camera looks at
    pub target: Point3<f32>,
    /// Up direction
    pub up: Vector3<f32>,
    /// Vertical field of view, in radians
    pub fov_y: f32,
    /// Distance to the near clipping plane
    pub near: f32,
    /// Distance to the far clipping plane
    pub far: f32,
}

impl Default for Camera3 {
    fn default() -> Self {
        Self {
            eye: Point3::new(0.0, 0.0, 48.0),
            target: Point3::origin(),
            up: Vector3::y(),
            fov_y: std::f32::consts::FRAC_PI_4,
            near: 1.0,
            far: 100.0,
        }
    }
}

impl Camera3 {
    /// Builds a camera looking at `target` from `eye`
    pub fn look_at(eye: Point3<f32>, target: Point3<f32>) -> Self {
        Self {
            eye,
            target,
            ..Self::default()
        }
    }

    /// Returns the view matrix (evaluation space to camera space)
    pub fn view(&self) -> Matrix4<f32> {
        Matrix4::look_at_rh(&self.eye, &self.target, &self.up)
    }

    /// Returns the projection matrix (camera space to clip space)
    pub fn projection(&self, aspect: f32) -> Matrix4<f32> {
        Perspective3::new(aspect, self.fov_y, self.near, self.far)
            .to_homogeneous()
    }

    /// Returns the homogeneous evaluation-to-screen transform
    ///
    /// After the perspective divide, X and Y are in pixels and Z is depth in
    /// `[0, 1]`.
    pub fn eval_to_screen(&self, width: u32, height: u32) -> Matrix4<f32> {
        let (w, h) = (width as f32, height as f32);
        #[rustfmt::skip]
        let viewport = Matrix4::new(
            w / 2.0, 0.0,      0.0, w / 2.0,
            0.0,     -h / 2.0, 0.0, h / 2.0,
            0.0,     0.0,      0.5, 0.5,
            0.0,     0.0,      0.0, 1.0,
        );
        viewport * self.projection(w / h) * self.view()
    }

    /// Returns the homogeneous screen-to-evaluation transform
    ///
    /// Returns `None` if the projection cannot be inverted
    pub fn screen_to_eval(
        &self,
        width: u32,
        height: u32,
    ) -> Option<Matrix4<f32>> {
        self.eval_to_screen(width, height).try_inverse()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn view2_corners() {
        let view = View2::from_center_and_scale(Vector2::zeros(), 16.0);
        let m = view.screen_to_eval(256, 256);
        let p = m.transform_point(&Point2::new(0.0, 0.0));
        assert_eq!(p, Point2::new(-16.0, 16.0));
        let p = m.transform_point(&Point2::new(256.0, 256.0));
        assert_eq!(p, Point2::new(16.0, -16.0));
        let p = m.transform_point(&Point2::new(128.0, 128.0));
        assert_eq!(p, Point2::new(0.0, 0.0));

        // No rotation or shear, so regions stay axis-aligned on screen
        assert_eq!(m[(0, 1)], 0.0);
        assert_eq!(m[(1, 0)], 0.0);
    }

    #[test]
    fn view2_aspect() {
        let view = View2::default();
        let m = view.screen_to_eval(256, 128);
        let p = m.transform_point(&Point2::new(0.0, 0.0));
        assert_eq!(p, Point2::new(-1.0, 0.5));
        let p = m.transform_point(&Point2::new(256.0, 128.0));
        assert_eq!(p, Point2::new(1.0, -0.5));
    }

    #[test]
    fn view2_zoom() {
        let mut view = View2::from_center_and_scale(Vector2::zeros(), 1.0);
        view.zoom(2.0, Some(Point2::new(0.5, 0.0)));
        let p = view.transform_point(&Point2::new(0.5, 0.0));
        assert_relative_eq!(p, Point2::new(0.5, 0.0));
        let p = view.transform_point(&Point2::new(1.0, 0.0));
        assert_relative_eq!(p, Point2::new(1.5, 0.0));

        view.translate(Vector2::new(1.0, 2.0));
        let p = view.transform_point(&Point2::new(0.5, 0.0));
        assert_relative_eq!(p, Point2::new(1.5, 2.0));
    }

    #[test]
    fn camera3_center() {
        let cam =
            Camera3::look_at(Point3::new(0.0, 0.0, 10.0), Point3::origin());
        let m = cam.eval_to_screen(64, 32);
        let p = m.transform_point(&Point3::origin());
        assert_relative_eq!(p.x, 32.0, epsilon = 1e-4);
        assert_relative_eq!(p.y, 16.0, epsilon = 1e-4);
        assert!(p.z > 0.0 && p.z < 1.0);

        // Nearer points have smaller depth
        let q = m.transform_point(&Point3::new(0.0, 0.0, 5.0));
        assert!(q.z < p.z);

        // +Y in evaluation space is up on screen
        let r = m.transform_point(&Point3::new(0.0, 1.0, 0.0));
        assert!(r.y < p.y);
    }

    #[test]
    fn camera3_round_trip() {
        let cam = Camera3::look_at(
            Point3::new(10.0, 5.0, 20.0),
            Point3::new(1.0, 2.0, 3.0),
        );
        let fwd = cam.eval_to_screen(100, 80);
        let inv = cam.screen_to_eval(100, 80).unwrap();
        for p in [
            Point3::new(1.0, 2.0, 3.0),
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(3.0, 1.0, 8.0),
        ] {
            let screen = fwd.transform_point(&p);
            let back = inv.transform_point(&screen);
            assert_relative_eq!(back, p, epsilon = 1e-3);
        }
    }
}
