//! Core types for tensor shapes and element types.

use std::fmt;

/// Element type of a tensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    I32,
    I64,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 => 2,
            DataType::I64 => 8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
        };
        write!(f, "{}", name)
    }
}

/// Static tensor shape.
///
/// All dimensions are known at compile time. A rank-0 shape describes a
/// scalar value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a shape from explicit dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Self(dims)
    }

    /// The rank-0 scalar shape.
    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// All dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Extent of dimension `i`.
    ///
    /// Panics if `i` is out of range; callers are expected to stay within
    /// `rank()`.
    pub fn dim(&self, i: usize) -> usize {
        self.0[i]
    }

    /// Total number of elements.
    pub fn num_elements(&self) -> usize {
        self.0.iter().product()
    }

    /// True for rank-0 shapes.
    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// True if every dimension has extent 1 (or the shape is scalar).
    pub fn is_all_unit(&self) -> bool {
        self.0.iter().all(|&d| d == 1)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "x")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}
