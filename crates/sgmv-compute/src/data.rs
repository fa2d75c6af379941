//! Sparse-grid descriptions and padded instance data.
//!
//! A [`GridData`] stores, per grid point and dimension, the scaled level
//! `2^l` and the index `i` of the linear hat function
//! `φ(x) = Π_d max(0, 1 − |2^l_d·x_d − i_d|)`. A [`Dataset`] stores the
//! training instances, padded to a vector width so that vectorised kernels
//! never see a partial block.
//!
//! Both are immutable once built. Each construction draws a fresh
//! generation number that clones share, so device-side caches can tell
//! whether they hold the same values without reading them.

use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::{Array2, ArrayView1};

use crate::backend::ComputeError;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Round `n` up to the next multiple of `width`.
pub fn patched_size(n: usize, width: usize) -> usize {
    if width == 0 {
        return n;
    }
    n.div_ceil(width) * width
}

/// Level and index arrays of a sparse grid, one row per grid point.
#[derive(Debug, Clone)]
pub struct GridData {
    level: Array2<f64>,
    index: Array2<f64>,
    generation: u64,
}

impl PartialEq for GridData {
    fn eq(&self, other: &Self) -> bool {
        self.level == other.level && self.index == other.index
    }
}

impl GridData {
    pub fn new(level: Array2<f64>, index: Array2<f64>) -> Result<Self, ComputeError> {
        if level.dim() != index.dim() {
            return Err(ComputeError::ShapeMismatch(format!(
                "level array is {:?}, index array is {:?}",
                level.dim(),
                index.dim()
            )));
        }
        Ok(Self {
            level,
            index,
            generation: next_generation(),
        })
    }

    /// Regular sparse grid of level `level` without boundary points.
    ///
    /// Contains every hat function with level vector `l` (`l_d ≥ 1`,
    /// `|l|₁ ≤ level + dims − 1`) and odd index `1 ≤ i_d < 2^l_d`.
    pub fn regular(dims: usize, level: usize) -> Result<Self, ComputeError> {
        if dims == 0 || level == 0 {
            return Err(ComputeError::InvalidArgument(format!(
                "regular grid needs dims ≥ 1 and level ≥ 1 (got {dims}, {level})"
            )));
        }
        if level > 30 {
            return Err(ComputeError::InvalidArgument(format!(
                "grid level {level} is too deep"
            )));
        }

        let mut level_vectors = Vec::new();
        let mut current = vec![1usize; dims];
        collect_levels(0, level + dims - 1, &mut current, &mut level_vectors);

        let mut levels = Vec::new();
        let mut indices = Vec::new();
        let mut rows = 0usize;
        for lv in &level_vectors {
            // Odometer over the odd indices 1, 3, ..., 2^l − 1 of each dimension.
            let mut idx = vec![1usize; dims];
            loop {
                for d in 0..dims {
                    levels.push((1usize << lv[d]) as f64);
                    indices.push(idx[d] as f64);
                }
                rows += 1;

                let mut d = 0;
                while d < dims {
                    idx[d] += 2;
                    if idx[d] < (1usize << lv[d]) {
                        break;
                    }
                    idx[d] = 1;
                    d += 1;
                }
                if d == dims {
                    break;
                }
            }
        }

        let level = Array2::from_shape_vec((rows, dims), levels)
            .map_err(|e| ComputeError::ShapeMismatch(e.to_string()))?;
        let index = Array2::from_shape_vec((rows, dims), indices)
            .map_err(|e| ComputeError::ShapeMismatch(e.to_string()))?;
        Ok(Self {
            level,
            index,
            generation: next_generation(),
        })
    }

    /// Number of grid points.
    pub fn len(&self) -> usize {
        self.level.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dims(&self) -> usize {
        self.level.ncols()
    }

    pub fn level(&self) -> &Array2<f64> {
        &self.level
    }

    pub fn index(&self) -> &Array2<f64> {
        &self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Value of basis function `point` at `x`.
    #[inline]
    pub fn basis(&self, point: usize, x: ArrayView1<'_, f64>) -> f64 {
        let mut value = 1.0;
        for d in 0..self.dims() {
            let v = 1.0 - (self.level[[point, d]] * x[d] - self.index[[point, d]]).abs();
            if v <= 0.0 {
                return 0.0;
            }
            value *= v;
        }
        value
    }
}

fn collect_levels(dim: usize, budget: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
    let dims = current.len();
    if dim == dims {
        out.push(current.clone());
        return;
    }
    // Every remaining dimension needs at least level 1.
    let max_level = budget - (dims - dim - 1);
    for l in 1..=max_level {
        current[dim] = l;
        collect_levels(dim + 1, budget - l, current, out);
    }
}

/// Training instances padded to a vector width.
#[derive(Debug, Clone)]
pub struct Dataset {
    points: Array2<f64>,
    num_instances: usize,
    generation: u64,
}

impl PartialEq for Dataset {
    fn eq(&self, other: &Self) -> bool {
        self.num_instances == other.num_instances && self.points == other.points
    }
}

impl Dataset {
    /// Pad `points` to a multiple of `width` rows by repeating the last instance.
    pub fn padded(points: Array2<f64>, width: usize) -> Result<Self, ComputeError> {
        if width == 0 {
            return Err(ComputeError::InvalidArgument(
                "padding width must be positive".into(),
            ));
        }
        let num_instances = points.nrows();
        if num_instances == 0 {
            return Err(ComputeError::InvalidArgument("dataset is empty".into()));
        }

        let target = patched_size(num_instances, width);
        if target == num_instances {
            return Ok(Self {
                points,
                num_instances,
                generation: next_generation(),
            });
        }

        let dims = points.ncols();
        let mut padded = Array2::zeros((target, dims));
        padded
            .slice_mut(ndarray::s![..num_instances, ..])
            .assign(&points);
        let last = points.row(num_instances - 1);
        for mut row in padded.rows_mut().into_iter().skip(num_instances) {
            row.assign(&last);
        }

        Ok(Self {
            points: padded,
            num_instances,
            generation: next_generation(),
        })
    }

    /// Re-pad the true instances to a different width.
    pub fn repad(&self, width: usize) -> Result<Self, ComputeError> {
        let real = self
            .points
            .slice(ndarray::s![..self.num_instances, ..])
            .to_owned();
        Self::padded(real, width)
    }

    /// True instance count `N`.
    pub fn num_instances(&self) -> usize {
        self.num_instances
    }

    /// Row count after padding.
    pub fn padded_len(&self) -> usize {
        self.points.nrows()
    }

    pub fn dims(&self) -> usize {
        self.points.ncols()
    }

    pub fn points(&self) -> &Array2<f64> {
        &self.points
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn row(&self, i: usize) -> ArrayView1<'_, f64> {
        self.points.row(i)
    }
}
