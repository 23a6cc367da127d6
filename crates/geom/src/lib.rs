//! Basic geometry of a two-cord plotter, including conversion between
//! Cartesian drawing coordinates and cord lengths.
//!
//! The two cords hang from a pair of anchors mounted at the same height. The
//! left anchor is the absolute zero of the plotter, with `x` pointing towards
//! the right anchor and `y` pointing down. Drawing coordinates are relative to
//! the *origin*, which is wherever the pen was when the initial cord lengths
//! were measured.
//!
//! All lengths are measured in millimeters.

use thiserror::Error;

pub struct Mm;

pub type Point = euclid::Point2D<f64, Mm>;
pub type Vector = euclid::Vector2D<f64, Mm>;
pub type Len = euclid::Length<f64, Mm>;
pub type BoundingBox = euclid::Box2D<f64, Mm>;

fn square<T: core::ops::Mul<T> + Copy>(x: T) -> <T as core::ops::Mul<T>>::Output {
    x * x
}

pub trait LenExt {
    fn mm(self) -> Len;
}

impl LenExt for f64 {
    fn mm(self) -> Len {
        Len::new(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LeftRight<T> {
    pub left: T,
    pub right: T,
}

impl<T> LeftRight<T> {
    pub fn map<S>(self, mut f: impl FnMut(T) -> S) -> LeftRight<S> {
        LeftRight {
            left: f(self.left),
            right: f(self.right),
        }
    }
}

/// Lengths of the cords, from the anchors to the pen.
///
/// Left and right are measured from the point of view of the person
/// looking at the drawing surface.
pub type CordLengths = LeftRight<Len>;

impl CordLengths {
    pub fn from_mm(left: f64, right: f64) -> Self {
        LeftRight {
            left: left.mm(),
            right: right.mm(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("{name} must be positive and finite, got {value}")]
    NonPositive { name: &'static str, value: f64 },

    #[error("cord lengths must be non-negative and finite, got ({left}, {right})")]
    InvalidCord { left: f64, right: f64 },

    #[error(
        "anchor separation {separation} exceeds the sum of the cord lengths ({left} + {right})"
    )]
    TriangleInequality {
        separation: f64,
        left: f64,
        right: f64,
    },

    #[error(
        "cord lengths ({left}, {right}) differ by more than the anchor separation {separation}"
    )]
    Degenerate {
        separation: f64,
        left: f64,
        right: f64,
    },
}

/// Immutable geometric and hardware constants, shared by the planner and the
/// motor stage.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Calibration {
    /// The horizontal distance between the two anchors.
    pub anchor_separation: Len,
    /// Where the drawing origin sits, relative to the left anchor.
    pub origin: Point,
    /// How many motor steps lengthen a cord by one millimeter.
    pub steps_per_mm: f64,
    /// The maximum drawing-space distance covered by one planner step.
    pub resolution: Len,
}

pub struct CalibrationBuilder {
    anchor_separation: Len,
    steps_per_mm: f64,
    resolution: Len,
}

impl Default for CalibrationBuilder {
    fn default() -> Self {
        Self {
            anchor_separation: 620.0.mm(),
            steps_per_mm: 80.0,
            resolution: 1.0.mm(),
        }
    }
}

impl CalibrationBuilder {
    pub fn with_anchor_separation(&mut self, separation: Len) -> &mut Self {
        self.anchor_separation = separation;
        self
    }

    pub fn with_steps_per_mm(&mut self, steps: f64) -> &mut Self {
        self.steps_per_mm = steps;
        self
    }

    pub fn with_resolution(&mut self, resolution: Len) -> &mut Self {
        self.resolution = resolution;
        self
    }

    /// Builds a calibration from the measured initial cord lengths, locating
    /// the origin with the kinematic model `M`.
    pub fn build<M: KinematicModel>(
        &self,
        initial: &CordLengths,
    ) -> Result<Calibration, CalibrationError> {
        positive("anchor separation", self.anchor_separation.get())?;
        positive("steps per mm", self.steps_per_mm)?;
        positive("resolution", self.resolution.get())?;

        let (left, right) = (initial.left.get(), initial.right.get());
        if !(left.is_finite() && right.is_finite() && left >= 0.0 && right >= 0.0) {
            return Err(CalibrationError::InvalidCord { left, right });
        }

        let origin = M::calc_origin(initial, self.anchor_separation)?;
        Ok(Calibration {
            anchor_separation: self.anchor_separation,
            origin,
            steps_per_mm: self.steps_per_mm,
            resolution: self.resolution,
        })
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), CalibrationError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(CalibrationError::NonPositive { name, value })
    }
}

/// Converts between drawing-space points and cord lengths.
///
/// Implementations are pure: they depend only on the calibration they were
/// built from, so a model can be shared freely between pipeline stages.
pub trait KinematicModel: Clone + Send + Sync + 'static {
    /// Locates the origin (relative to the left anchor) from the initial cord
    /// lengths.
    fn calc_origin(
        initial: &CordLengths,
        anchor_separation: Len,
    ) -> Result<Point, CalibrationError>;

    fn calibration(&self) -> &Calibration;

    /// The cord lengths that put the pen at the drawing-space point `p`.
    fn point_to_cord_lengths(&self, p: &Point) -> CordLengths;

    /// The drawing-space point reached with the given cord lengths.
    fn cord_lengths_to_point(&self, lengths: &CordLengths) -> Point;
}

/// The simplest geometry: both cords meet at the pen, which is treated as a
/// point. The anchors and the pen form a triangle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriangleModel {
    calib: Calibration,
}

impl TriangleModel {
    pub fn new(calib: Calibration) -> Self {
        Self { calib }
    }

    // Solves the triangle with sides `left`, `right` and `separation`, returning
    // the apex relative to the left anchor.
    fn apex(separation: f64, left: f64, right: f64) -> Point {
        let x = (square(separation) + square(left) - square(right)) / (2.0 * separation);
        // Rounding can push this slightly negative when the pen is level with
        // the anchors.
        let y = (square(right) - square(separation - x)).max(0.0).sqrt();
        Point::new(x, y)
    }
}

impl KinematicModel for TriangleModel {
    fn calc_origin(
        initial: &CordLengths,
        anchor_separation: Len,
    ) -> Result<Point, CalibrationError> {
        let separation = anchor_separation.get();
        let (left, right) = (initial.left.get(), initial.right.get());

        if separation > left + right {
            return Err(CalibrationError::TriangleInequality {
                separation,
                left,
                right,
            });
        }
        if (left - right).abs() > separation {
            return Err(CalibrationError::Degenerate {
                separation,
                left,
                right,
            });
        }

        Ok(Self::apex(separation, left, right))
    }

    fn calibration(&self) -> &Calibration {
        &self.calib
    }

    fn point_to_cord_lengths(&self, p: &Point) -> CordLengths {
        let p = *p + self.calib.origin.to_vector();
        let d = self.calib.anchor_separation.get();
        CordLengths::from_mm(
            (square(p.x) + square(p.y)).sqrt(),
            (square(d - p.x) + square(p.y)).sqrt(),
        )
    }

    fn cord_lengths_to_point(&self, lengths: &CordLengths) -> Point {
        let apex = Self::apex(
            self.calib.anchor_separation.get(),
            lengths.left.get(),
            lengths.right.get(),
        );
        apex - self.calib.origin.to_vector()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn model(separation: f64, left: f64, right: f64) -> TriangleModel {
        let calib = CalibrationBuilder::default()
            .with_anchor_separation(separation.mm())
            .build::<TriangleModel>(&CordLengths::from_mm(left, right))
            .unwrap();
        TriangleModel::new(calib)
    }

    impl Arbitrary for TriangleModel {
        type Parameters = ();
        type Strategy = BoxedStrategy<TriangleModel>;

        fn arbitrary_with(_: ()) -> Self::Strategy {
            // Pick the origin directly so that the cords always form a
            // triangle with some room to move around in.
            (500.0..2000.0f64, 0.2..0.8f64, 100.0..1000.0f64)
                .prop_map(|(d, frac, y)| {
                    let x = d * frac;
                    let left = (x * x + y * y).sqrt();
                    let right = ((d - x) * (d - x) + y * y).sqrt();
                    model(d, left, right)
                })
                .boxed()
        }
    }

    #[test]
    fn origin_from_measured_cords() {
        let m = model(1000.0, 500.0, 700.0);
        let origin = m.calibration().origin;
        assert!((origin.x - 380.0).abs() < 1e-9);
        assert!((origin.y - 105600.0f64.sqrt()).abs() < 1e-9);

        // The origin is where the pen starts, so it reproduces the initial cords.
        let cords = m.point_to_cord_lengths(&Point::origin());
        assert!((cords.left.get() - 500.0).abs() < 1e-9);
        assert!((cords.right.get() - 700.0).abs() < 1e-9);
    }

    #[test]
    fn symmetric_origin() {
        let m = model(1000.0, 707.0, 707.0);
        assert!((m.calibration().origin.x - 500.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_short_cords() {
        let err = CalibrationBuilder::default()
            .with_anchor_separation(1000.0.mm())
            .build::<TriangleModel>(&CordLengths::from_mm(400.0, 500.0))
            .unwrap_err();
        assert!(matches!(err, CalibrationError::TriangleInequality { .. }));
    }

    #[test]
    fn rejects_unsolvable_cords() {
        let err = CalibrationBuilder::default()
            .with_anchor_separation(100.0.mm())
            .build::<TriangleModel>(&CordLengths::from_mm(500.0, 300.0))
            .unwrap_err();
        assert!(matches!(err, CalibrationError::Degenerate { .. }));
    }

    #[test]
    fn rejects_bad_constants() {
        let cords = CordLengths::from_mm(500.0, 700.0);
        let err = CalibrationBuilder::default()
            .with_resolution(0.0.mm())
            .build::<TriangleModel>(&cords)
            .unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::NonPositive {
                name: "resolution",
                ..
            }
        ));

        let err = CalibrationBuilder::default()
            .build::<TriangleModel>(&CordLengths::from_mm(-1.0, 700.0))
            .unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidCord { .. }));
    }

    proptest! {
        // Check that point_to_cord_lengths and cord_lengths_to_point are inverses.
        #[test]
        fn test_point_cord_inverse(m: TriangleModel, x in -100.0..100.0f64, y in -50.0..200.0f64) {
            let p = Point::new(x, y);
            let cords = m.point_to_cord_lengths(&p);
            let q = m.cord_lengths_to_point(&cords);
            prop_assert!((p.x - q.x).abs() < 1e-6);
            prop_assert!((p.y - q.y).abs() < 1e-6);
        }

        #[test]
        fn test_cord_point_inverse(m: TriangleModel, x in -100.0..100.0f64, y in -50.0..200.0f64) {
            let cords = m.point_to_cord_lengths(&Point::new(x, y));
            let round_trip = m.point_to_cord_lengths(&m.cord_lengths_to_point(&cords));
            prop_assert!((cords.left.get() - round_trip.left.get()).abs() < 1e-6);
            prop_assert!((cords.right.get() - round_trip.right.get()).abs() < 1e-6);
        }

        #[test]
        fn cords_satisfy_triangle_inequality(
            m: TriangleModel,
            x in -100.0..100.0f64,
            y in -50.0..200.0f64,
        ) {
            let cords = m.point_to_cord_lengths(&Point::new(x, y));
            let d = m.calibration().anchor_separation.get();
            prop_assert!(cords.left.get() + cords.right.get() >= d - 1e-9);
        }
    }
}
