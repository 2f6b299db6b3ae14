use std::fmt;

// Shape — Declared or concrete dimensions of a parameter/array
//
// A parameter shape may be only partially known while its initialization is
// deferred. An axis of size 0 is a placeholder meaning "not inferred yet":
//
//   Shape([0, 784])  — rank 2, first axis unknown
//   Shape([10, 784]) — complete
//
// Once an axis is resolved it may never change again. `merge` implements
// that rule: same rank, and every axis that was nonzero must match.

/// N-dimensional shape. Axes of size 0 are unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Product of all dimensions. A scalar shape [] has 1 element; a shape
    /// with any unknown axis has 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// True when the shape has at least one axis and no unknown axis.
    pub fn is_complete(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|&d| d > 0)
    }

    /// Whether `other` may replace `self` without un-resolving an axis.
    pub fn is_compatible(&self, other: &Shape) -> bool {
        self.rank() == other.rank()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(&old, &new)| old == 0 || old == new)
    }

    /// Combine two partial descriptions of the same shape. Axes known in
    /// either side are kept; a disagreement on a known axis is `None`.
    pub fn merge(&self, other: &Shape) -> Option<Shape> {
        if self.rank() != other.rank() {
            return None;
        }
        let mut dims = Vec::with_capacity(self.rank());
        for (&a, &b) in self.0.iter().zip(other.0.iter()) {
            match (a, b) {
                (0, d) | (d, 0) => dims.push(d),
                (a, b) if a == b => dims.push(a),
                _ => return None,
            }
        }
        Some(Shape(dims))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}
