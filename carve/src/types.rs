//! Small value types shared by the host and GPU sides
use arrayvec::ArrayVec;

/// Dimensionality of the surface being rendered
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    /// Implicit curve `f(x, y) = 0`, rendered as a filled color image
    #[default]
    TwoD,
    /// Implicit surface `f(x, y, z) = 0`, rendered as a depth image
    ThreeD,
}

impl SurfaceKind {
    /// Number of spatial axes
    pub fn dims(&self) -> usize {
        match self {
            SurfaceKind::TwoD => 2,
            SurfaceKind::ThreeD => 3,
        }
    }

    /// Size of one packed [`Region`] on the GPU, in bytes
    ///
    /// Each axis is stored as an `[f32; 2]` interval.
    pub fn region_size(&self) -> u64 {
        (self.dims() * 2 * std::mem::size_of::<f32>()) as u64
    }
}

/// Stores a closed range `[lower, upper]`
#[derive(Copy, Clone, PartialEq)]
pub struct Interval {
    lower: f32,
    upper: f32,
}

impl std::fmt::Debug for Interval {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> Result<(), std::fmt::Error> {
        f.debug_tuple("")
            .field(&self.lower)
            .field(&self.upper)
            .finish()
    }
}

impl Interval {
    /// Builds a new interval
    ///
    /// # Panics
    /// Panics if `lower > upper` or either bound is `NaN`
    #[inline]
    pub fn new(lower: f32, upper: f32) -> Self {
        assert!(upper >= lower, "invalid interval [{lower}, {upper}]");
        Self { lower, upper }
    }
    /// Returns the lower bound of the interval
    #[inline]
    pub fn lower(&self) -> f32 {
        self.lower
    }
    /// Returns the upper bound of the interval
    #[inline]
    pub fn upper(&self) -> f32 {
        self.upper
    }
    /// Returns the intersection of two intervals, or `None` if they are
    /// disjoint
    pub fn intersect(&self, other: Interval) -> Option<Interval> {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        (lower <= upper).then_some(Interval { lower, upper })
    }
}

impl From<f32> for Interval {
    fn from(f: f32) -> Self {
        Interval::new(f, f)
    }
}

impl From<[f32; 2]> for Interval {
    fn from(i: [f32; 2]) -> Interval {
        Interval::new(i[0], i[1])
    }
}

/// Axis-aligned box in evaluation space
///
/// This is the unit of adaptive subdivision.  On the GPU, a region is packed as
/// `[x.lower, x.upper, y.lower, y.upper]` for 2D surfaces and additionally
/// `[z.lower, z.upper]` for 3D surfaces.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Region {
    /// Range on the X axis
    pub x: Interval,
    /// Range on the Y axis
    pub y: Interval,
    /// Range on the Z axis (ignored for 2D surfaces)
    pub z: Interval,
}

impl Region {
    /// Builds a region from per-axis bounds
    pub fn new(
        x: impl Into<Interval>,
        y: impl Into<Interval>,
        z: impl Into<Interval>,
    ) -> Self {
        Self {
            x: x.into(),
            y: y.into(),
            z: z.into(),
        }
    }

    /// Builds a cube `[lo, hi]³`
    pub fn cube(lo: f32, hi: f32) -> Self {
        let i = Interval::new(lo, hi);
        Self { x: i, y: i, z: i }
    }

    /// Returns the packed GPU representation for the given surface kind
    pub fn words(&self, kind: SurfaceKind) -> ArrayVec<f32, 6> {
        [self.x, self.y, self.z]
            .into_iter()
            .take(kind.dims())
            .flat_map(|i| [i.lower, i.upper])
            .collect()
    }

    /// Unpacks a region from its GPU representation
    ///
    /// The Z axis is `[0, 0]` for 2D surfaces.
    ///
    /// # Panics
    /// Panics if `words` is not the expected length
    pub fn from_words(words: &[f32], kind: SurfaceKind) -> Self {
        assert_eq!(words.len(), kind.dims() * 2, "bad region length");
        let z = match kind {
            SurfaceKind::TwoD => Interval::from(0.0),
            SurfaceKind::ThreeD => Interval::new(words[4], words[5]),
        };
        Self {
            x: Interval::new(words[0], words[1]),
            y: Interval::new(words[2], words[3]),
            z,
        }
    }

    /// Returns the intersection of two regions, or `None` if it is empty
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        Some(Region {
            x: self.x.intersect(other.x)?,
            y: self.y.intersect(other.y)?,
            z: self.z.intersect(other.z)?,
        })
    }
}
