//! Typed indices for slicing batched decoder state.
//!
//! An [`Index`] selects positions along a single axis of a tensor. It is one of
//! - a literal position, which also drops the indexed axis,
//! - a strided [`Range`], which keeps the axis,
//! - an index tensor holding arbitrary positions (gather-style selection).
//!
//! Ranges are half-open when constructed but store their end inclusively, so
//! `Range::new(2, 7)` reports `end() == 6`. The [`END`] sentinel stands for "up to
//! and including the final element" and is stored as is. [`SPAN`] is the range
//! covering a whole axis.
//!
//! ```
//! use candle_asr::index::{Range, END, SPAN};
//!
//! assert_eq!(Range::until(5), Range::new(0, 5));
//! assert_eq!(Range::new(0, END), SPAN);
//! let r = Range::with_stride(2, 7, 2);
//! assert_eq!((r.start(), r.end(), r.stride()), (2, 6, 2));
//! ```
use candle::{DType, Result, Tensor};

/// Sentinel end bound meaning "through the final element of the axis".
pub const END: i64 = i64::MAX;

/// The range that selects every element of an axis.
pub const SPAN: Range = Range {
    start: 0,
    end: END,
    stride: 1,
};

/// A strided range of positions along one axis.
///
/// A negative start counts from the end of the axis, `-1` being the last element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    start: i64,
    end: i64,
    stride: i64,
}

impl Range {
    /// `[0, end)`
    pub fn until(end: i64) -> Self {
        Self::new(0, end)
    }

    /// `[start, end)` with unit stride.
    pub fn new(start: i64, end: i64) -> Self {
        Self::with_stride(start, end, 1)
    }

    /// `[start, end)` taking every `stride`-th element.
    pub fn with_stride(start: i64, end: i64, stride: i64) -> Self {
        let end = if end == END { END } else { end.saturating_sub(1) };
        Self { start, end, stride }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    /// Inclusive end, or [`END`].
    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn stride(&self) -> i64 {
        self.stride
    }

    pub fn is_span(&self) -> bool {
        *self == SPAN
    }

    /// Resolves the range against an axis of `size` elements.
    pub fn positions(&self, size: usize) -> Result<Vec<usize>> {
        if self.stride <= 0 {
            candle::bail!("range stride must be positive, got {}", self.stride)
        }
        let end = if self.end == END {
            size as i64 - 1
        } else {
            self.end
        };
        if end >= size as i64 {
            candle::bail!("range end {end} out of bounds for axis of size {size}")
        }
        if end < 0 {
            return Ok(vec![]);
        }
        let start = resolve(self.start, size)?;
        Ok((start as i64..=end)
            .step_by(self.stride as usize)
            .map(|p| p as usize)
            .collect())
    }
}

fn resolve(pos: i64, size: usize) -> Result<usize> {
    let resolved = if pos < 0 { size as i64 + pos } else { pos };
    if resolved < 0 || resolved >= size as i64 {
        candle::bail!("index {pos} out of bounds for axis of size {size}")
    }
    Ok(resolved as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Literal,
    Range,
    Tensor,
}

/// A selection along one tensor axis.
#[derive(Debug, Clone)]
pub enum Index {
    Literal(i64),
    Range(Range),
    Tensor(Tensor),
}

impl Index {
    pub fn index_type(&self) -> IndexType {
        match self {
            Self::Literal(_) => IndexType::Literal,
            Self::Range(_) => IndexType::Range,
            Self::Tensor(_) => IndexType::Tensor,
        }
    }

    pub fn is_span(&self) -> bool {
        matches!(self, Self::Range(r) if r.is_span())
    }

    /// Applies the index to axis `dim` of `xs`.
    pub fn apply(&self, xs: &Tensor, dim: usize) -> Result<Tensor> {
        let size = xs.dim(dim)?;
        match self {
            Self::Literal(pos) => {
                let pos = resolve(*pos, size)?;
                xs.narrow(dim, pos, 1)?.squeeze(dim)
            }
            Self::Range(r) if r.is_span() => Ok(xs.clone()),
            Self::Range(r) => {
                let positions = r.positions(size)?;
                if r.stride() == 1 {
                    let start = positions.first().copied().unwrap_or(0);
                    xs.narrow(dim, start, positions.len())
                } else {
                    let ids: Vec<u32> = positions.iter().map(|&p| p as u32).collect();
                    let ids = Tensor::new(ids.as_slice(), xs.device())?;
                    xs.index_select(&ids, dim)
                }
            }
            Self::Tensor(ids) => {
                let ids = match ids.dtype() {
                    DType::U8 | DType::U32 | DType::I64 => ids.flatten_all()?,
                    _ => ids.flatten_all()?.to_dtype(DType::U32)?,
                };
                xs.index_select(&ids, dim)
            }
        }
    }
}

/// Applies one index per leading axis of `xs`, like `xs(i0, i1, ...)`.
pub fn select(xs: &Tensor, indices: &[Index]) -> Result<Tensor> {
    if indices.len() > xs.rank() {
        candle::bail!(
            "{} indices given for a tensor of rank {}",
            indices.len(),
            xs.rank()
        )
    }
    // Last axis first so that literals dropping an axis do not shift the others.
    let mut xs = xs.clone();
    for (dim, index) in indices.iter().enumerate().rev() {
        xs = index.apply(&xs, dim)?;
    }
    Ok(xs)
}

impl PartialEq for Index {
    /// Literals and ranges compare structurally, index tensors by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Literal(a), Self::Literal(b)) => a == b,
            (Self::Range(a), Self::Range(b)) => a == b,
            (Self::Tensor(a), Self::Tensor(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl From<i32> for Index {
    fn from(pos: i32) -> Self {
        Self::Literal(pos as i64)
    }
}

impl From<i64> for Index {
    fn from(pos: i64) -> Self {
        Self::Literal(pos)
    }
}

impl From<usize> for Index {
    fn from(pos: usize) -> Self {
        Self::Literal(pos as i64)
    }
}

impl From<Range> for Index {
    fn from(range: Range) -> Self {
        Self::Range(range)
    }
}

impl From<Tensor> for Index {
    fn from(ids: Tensor) -> Self {
        Self::Tensor(ids)
    }
}

impl From<&Tensor> for Index {
    fn from(ids: &Tensor) -> Self {
        Self::Tensor(ids.clone())
    }
}
