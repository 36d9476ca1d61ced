//! Work extents for kernel launches.

use std::fmt;

/// An immutable extent of zero to three dimensions.
///
/// The zero-dimensional range ([`NDRange::none`]) means "not specified",
/// e.g. a local work size left to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NDRange {
    dims: usize,
    sizes: [usize; 3],
}

impl NDRange {
    pub const fn none() -> Self {
        Self { dims: 0, sizes: [0; 3] }
    }

    pub const fn d1(x: usize) -> Self {
        Self { dims: 1, sizes: [x, 1, 1] }
    }

    pub const fn d2(x: usize, y: usize) -> Self {
        Self { dims: 2, sizes: [x, y, 1] }
    }

    pub const fn d3(x: usize, y: usize, z: usize) -> Self {
        Self { dims: 3, sizes: [x, y, z] }
    }

    pub const fn dims(&self) -> usize {
        self.dims
    }

    /// Sizes of the active dimensions.
    pub fn sizes(&self) -> &[usize] {
        &self.sizes[..self.dims]
    }

    pub fn get(&self, dim: usize) -> Option<usize> {
        self.sizes().get(dim).copied()
    }

    /// Number of work items; zero for [`none`](Self::none).
    pub fn total(&self) -> usize {
        if self.dims == 0 {
            return 0;
        }
        self.sizes().iter().product()
    }

    pub const fn is_none(&self) -> bool {
        self.dims == 0
    }

    /// Smallest multiple of `multiple` that is at least `size`, or `None`
    /// if that multiple does not fit in `usize`.
    ///
    /// A zero `multiple` leaves `size` unchanged.
    pub const fn round_up(size: usize, multiple: usize) -> Option<usize> {
        if multiple == 0 {
            return Some(size);
        }
        size.div_ceil(multiple).checked_mul(multiple)
    }

    /// Pad every dimension up to a multiple of the matching `local`
    /// dimension. Dimensions `local` does not have are left as they are.
    ///
    /// `None` if any padded dimension overflows.
    #[must_use]
    pub fn padded_to(&self, local: &NDRange) -> Option<Self> {
        let mut out = *self;
        for (dim, size) in out.sizes[..out.dims].iter_mut().enumerate() {
            if let Some(granule) = local.get(dim) {
                *size = Self::round_up(*size, granule)?;
            }
        }
        Some(out)
    }
}

impl From<usize> for NDRange {
    fn from(x: usize) -> Self {
        Self::d1(x)
    }
}

impl From<(usize, usize)> for NDRange {
    fn from((x, y): (usize, usize)) -> Self {
        Self::d2(x, y)
    }
}

impl From<(usize, usize, usize)> for NDRange {
    fn from((x, y, z): (usize, usize, usize)) -> Self {
        Self::d3(x, y, z)
    }
}

impl fmt::Display for NDRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        let parts: Vec<String> = self.sizes().iter().map(ToString::to_string).collect();
        write!(f, "({})", parts.join(", "))
    }
}
