//! Evaluation kernel trait and device abstraction.
//!
//! The [`EvalKernel`] trait abstracts over the execution resources that can
//! apply the implicit evaluation matrix `B` (rows = training instances,
//! columns = sparse-grid basis functions). The distributed operator in
//! `sgmv-core` never materializes `B`; it only asks a kernel to apply it, or
//! its transpose, over index ranges.
//!
//! Kernel variants form a small closed set selected at runtime through
//! [`KernelKind`] and [`create_kernel`].

use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::{Dataset, GridData};

/// Errors originating from evaluation kernels.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Backend not available: {0}")]
    Unavailable(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Range {start}..{end} is not aligned to vector width {width}")]
    Misaligned {
        start: usize,
        end: usize,
        width: usize,
    },

    #[error("Range {start}..{end} exceeds length {len}")]
    OutOfBounds { start: usize, end: usize, len: usize },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Describes the capabilities of an evaluation kernel.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub backend_type: BackendType,
    pub vector_width: usize,
    pub compute_units: Option<usize>,
}

/// The type of execution resource behind a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Cpu,
    Simd,
    Gpu,
}

/// Applies the evaluation matrix `B` or its transpose over index ranges.
///
/// Both operations *overwrite* `out`: every output index in the requested
/// range is computed exactly once from the full input range. This is what
/// lets the operator hand disjoint sub-ranges of one output vector to two
/// kernels running concurrently.
pub trait EvalKernel: Send + Sync {
    /// Return information about the device.
    fn device_info(&self) -> DeviceInfo;

    /// Number of instances processed as one unit.
    ///
    /// Instance ranges passed to [`forward`](Self::forward) and
    /// [`backward`](Self::backward) must start and end on multiples of this
    /// width, and the dataset must be padded to it.
    fn vector_width(&self) -> usize;

    /// Forward pass `B·alpha` restricted to `data_range` × `grid_range`.
    ///
    /// Writes `out[k] = Σ_{j ∈ grid_range} alpha[j] · φ_j(x_{data_range.start + k})`.
    /// `alpha` is indexed globally (length = grid size); `out` has
    /// `data_range.len()` entries.
    fn forward(
        &self,
        grid: &GridData,
        data: &Dataset,
        alpha: &[f64],
        grid_range: Range<usize>,
        data_range: Range<usize>,
        out: &mut [f64],
    ) -> Result<(), ComputeError>;

    /// Backward pass `Bᵗ·source` restricted to `grid_range` × `data_range`.
    ///
    /// Writes `out[k] = Σ_{i ∈ data_range} source[i] · φ_{grid_range.start + k}(x_i)`.
    /// `source` is indexed globally (length = padded instance count); `out`
    /// has `grid_range.len()` entries.
    fn backward(
        &self,
        grid: &GridData,
        data: &Dataset,
        source: &[f64],
        data_range: Range<usize>,
        grid_range: Range<usize>,
        out: &mut [f64],
    ) -> Result<(), ComputeError>;
}

/// Runtime selection of a kernel variant.
///
/// Deserialises from TOML as `{ kind = "scalar" }`, `{ kind = "simd", width = 8 }`
/// or `{ kind = "gpu" }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelKind {
    /// One instance at a time, parallelised over rayon.
    #[default]
    Scalar,
    /// Lane-blocked `f64x4` evaluation; `width` must be a multiple of 4.
    Simd {
        #[serde(default = "default_simd_width")]
        width: usize,
    },
    /// wgpu compute shaders (requires the `gpu` feature and an adapter).
    Gpu,
}

fn default_simd_width() -> usize {
    4
}

impl KernelKind {
    /// Every variant, with default parameters.
    pub const ALL: [KernelKind; 3] = [
        KernelKind::Scalar,
        KernelKind::Simd { width: 4 },
        KernelKind::Gpu,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            KernelKind::Scalar => "scalar",
            KernelKind::Simd { .. } => "simd",
            KernelKind::Gpu => "gpu",
        }
    }
}

/// Instantiate the kernel selected by `kind`.
///
/// `threads` bounds the rayon pool used by the CPU-side kernels; `None`
/// shares the global pool. Unavailable variants are rejected here, at
/// construction, rather than on first use.
pub fn create_kernel(
    kind: &KernelKind,
    threads: Option<usize>,
) -> Result<Arc<dyn EvalKernel>, ComputeError> {
    match *kind {
        #[cfg(feature = "cpu")]
        KernelKind::Scalar => {
            let kernel = match threads {
                Some(n) => crate::cpu::CpuKernel::with_threads(n)?,
                None => crate::cpu::CpuKernel::new(),
            };
            Ok(Arc::new(kernel))
        }
        #[cfg(not(feature = "cpu"))]
        KernelKind::Scalar => Err(ComputeError::Unavailable(
            "scalar kernel requires the `cpu` feature".into(),
        )),
        KernelKind::Simd { width } => {
            let kernel = match threads {
                Some(n) => crate::simd::SimdKernel::with_threads(width, n)?,
                None => crate::simd::SimdKernel::new(width)?,
            };
            Ok(Arc::new(kernel))
        }
        #[cfg(feature = "gpu")]
        KernelKind::Gpu => Ok(Arc::new(crate::gpu::GpuKernel::new_blocking()?)),
        #[cfg(not(feature = "gpu"))]
        KernelKind::Gpu => Err(ComputeError::Unavailable(
            "gpu kernel requires the `gpu` feature".into(),
        )),
    }
}

/// Shape and bounds checks shared by every forward implementation.
pub(crate) fn check_forward(
    grid: &GridData,
    data: &Dataset,
    alpha: &[f64],
    grid_range: &Range<usize>,
    data_range: &Range<usize>,
    out: &[f64],
) -> Result<(), ComputeError> {
    check_shapes(grid, data)?;
    if alpha.len() != grid.len() {
        return Err(ComputeError::ShapeMismatch(format!(
            "alpha has {} entries, grid has {} points",
            alpha.len(),
            grid.len()
        )));
    }
    check_range(grid_range, grid.len())?;
    check_range(data_range, data.padded_len())?;
    check_out(out, data_range.len())
}

/// Shape and bounds checks shared by every backward implementation.
pub(crate) fn check_backward(
    grid: &GridData,
    data: &Dataset,
    source: &[f64],
    data_range: &Range<usize>,
    grid_range: &Range<usize>,
    out: &[f64],
) -> Result<(), ComputeError> {
    check_shapes(grid, data)?;
    if source.len() != data.padded_len() {
        return Err(ComputeError::ShapeMismatch(format!(
            "source has {} entries, dataset has {} padded instances",
            source.len(),
            data.padded_len()
        )));
    }
    check_range(data_range, data.padded_len())?;
    check_range(grid_range, grid.len())?;
    check_out(out, grid_range.len())
}

/// Instance ranges handed to vectorised kernels must sit on lane boundaries.
pub(crate) fn check_aligned(range: &Range<usize>, width: usize) -> Result<(), ComputeError> {
    if range.start % width != 0 || range.end % width != 0 {
        return Err(ComputeError::Misaligned {
            start: range.start,
            end: range.end,
            width,
        });
    }
    Ok(())
}

fn check_shapes(grid: &GridData, data: &Dataset) -> Result<(), ComputeError> {
    if grid.dims() != data.dims() {
        return Err(ComputeError::ShapeMismatch(format!(
            "grid is {}-dimensional, dataset is {}-dimensional",
            grid.dims(),
            data.dims()
        )));
    }
    Ok(())
}

fn check_range(range: &Range<usize>, len: usize) -> Result<(), ComputeError> {
    if range.start > range.end || range.end > len {
        return Err(ComputeError::OutOfBounds {
            start: range.start,
            end: range.end,
            len,
        });
    }
    Ok(())
}

fn check_out(out: &[f64], expected: usize) -> Result<(), ComputeError> {
    if out.len() != expected {
        return Err(ComputeError::ShapeMismatch(format!(
            "output slice has {} entries, range covers {}",
            out.len(),
            expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_kind_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            kernel: KernelKind,
        }

        let w: Wrapper = toml::from_str("kernel = { kind = \"simd\", width = 8 }").unwrap();
        assert_eq!(w.kernel, KernelKind::Simd { width: 8 });

        let w: Wrapper = toml::from_str("kernel = { kind = \"simd\" }").unwrap();
        assert_eq!(w.kernel, KernelKind::Simd { width: 4 });

        let w: Wrapper = toml::from_str("kernel = { kind = \"scalar\" }").unwrap();
        assert_eq!(w.kernel, KernelKind::Scalar);
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn gpu_without_feature_is_rejected() {
        let err = create_kernel(&KernelKind::Gpu, None).err().unwrap();
        assert!(matches!(err, ComputeError::Unavailable(_)));
    }

    #[test]
    fn simd_width_must_be_lane_multiple() {
        assert!(create_kernel(&KernelKind::Simd { width: 6 }, None).is_err());
        assert!(create_kernel(&KernelKind::Simd { width: 8 }, None).is_ok());
    }
}
