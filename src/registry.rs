//! Construction and memoization of the constraint operators.
//!
//! Every operator depends only on the shape of the box it acts on, so sources of
//! equal size share one instance. The [`OperatorRegistry`] is an explicit object: create one
//! per application (or per test) and hand it to [`SourceBuilder::build`](crate::SourceBuilder::build).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use itertools::Itertools;
use ndarray::Array2;
use parking_lot::RwLock;

use crate::operator::LinearOperator;
use crate::{Float, lit, to_f64};

/// The 8 neighbor offsets `(dy, dx)` of a pixel, in the column order of the monotonicity weights.
pub const NEIGHBORS: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

/// Cache key of an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperatorKey {
    /// Radial monotonicity `I - W`.
    RadialMonotonic {
        /// Box shape `(height, width)`.
        shape: (usize, usize),
        /// Single best-aligned neighbor instead of a weighted average.
        use_nearest: bool,
    },
    /// Point symmetry `I - P`.
    Symmetry {
        /// Box shape `(height, width)`.
        shape: (usize, usize),
    },
    /// Differences toward the central column.
    GradientX {
        /// Box shape `(height, width)`.
        shape: (usize, usize),
    },
    /// Differences toward the central row.
    GradientY {
        /// Box shape `(height, width)`.
        shape: (usize, usize),
    },
    /// Identity.
    Identity {
        /// Vector length.
        size: usize,
    },
    /// Zero map.
    Null {
        /// Vector length.
        size: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct WeightKey {
    shape: (usize, usize),
    use_nearest: bool,
    min_gradient_bits: u64,
}

/// Pixels of a box ordered by their distance to the central peak.
#[derive(Clone, Debug, PartialEq)]
pub struct MonotonicOrder {
    /// Flat pixel indices sorted by distance, ties broken by index. The peak comes first.
    pub order: Vec<usize>,
    /// For every pixel, its neighbors that are strictly closer to the peak.
    pub closer: Vec<Vec<usize>>,
    /// Flat index of the peak.
    pub peak: usize,
}

/// Memoizing factory of the sparse constraint operators.
///
/// Entries are built once per key and never invalidated. All methods take `&self`,
/// so one registry can be shared between threads.
#[derive(Debug)]
pub struct OperatorRegistry<F> {
    operators: RwLock<HashMap<OperatorKey, Arc<LinearOperator<F>>>>,
    weights: RwLock<HashMap<WeightKey, Arc<Array2<F>>>>,
    orders: RwLock<HashMap<(usize, usize), Arc<MonotonicOrder>>>,
}

impl<F: Float> Default for OperatorRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

fn memoize<K, V>(cache: &RwLock<HashMap<K, Arc<V>>>, key: K, build: impl FnOnce() -> V) -> Arc<V>
where
    K: Eq + Hash,
{
    if let Some(value) = cache.read().get(&key) {
        return Arc::clone(value);
    }
    let value = Arc::new(build());
    Arc::clone(cache.write().entry(key).or_insert(value))
}

fn peak(shape: (usize, usize)) -> (usize, usize) {
    (shape.0 / 2, shape.1 / 2)
}

fn distance<F: Float>(y: usize, x: usize, peak: (usize, usize)) -> F {
    let dy = lit::<F>(y as f64 - peak.0 as f64);
    let dx = lit::<F>(x as f64 - peak.1 as f64);
    (dy * dy + dx * dx).sqrt()
}

/// Neighbor of `(y, x)` at `offset`, if it lies inside `shape`.
fn neighbor(
    (y, x): (usize, usize),
    offset: (isize, isize),
    shape: (usize, usize),
) -> Option<(usize, usize)> {
    let ny = y.checked_add_signed(offset.0)?;
    let nx = x.checked_add_signed(offset.1)?;
    (ny < shape.0 && nx < shape.1).then_some((ny, nx))
}

impl<F: Float> OperatorRegistry<F> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            operators: RwLock::new(HashMap::new()),
            weights: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
        }
    }

    /// Number of cached entries of all kinds.
    pub fn len(&self) -> usize {
        self.operators.read().len() + self.weights.read().len() + self.orders.read().len()
    }

    /// Whether nothing was built yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up an operator by key, building it if needed.
    pub fn get(&self, key: OperatorKey) -> Arc<LinearOperator<F>> {
        memoize(&self.operators, key, || match key {
            OperatorKey::RadialMonotonic { shape, use_nearest } => {
                self.build_radial_monotonic(shape, use_nearest)
            }
            OperatorKey::Symmetry { shape } => build_symmetry(shape),
            OperatorKey::GradientX { shape } => build_gradient(shape, Axis2::X),
            OperatorKey::GradientY { shape } => build_gradient(shape, Axis2::Y),
            OperatorKey::Identity { size } => LinearOperator::identity(size),
            OperatorKey::Null { size } => LinearOperator::null(size),
        })
    }

    /// Radial monotonicity operator `I - W` of a box.
    ///
    /// Row `p` is `x_p - Σ w_pn x_n` over the closer neighbors `n`, the peak row is `-x_peak`.
    /// For a morphology that decreases away from the box center every entry of the result is `≤ 0`.
    pub fn radial_monotonic(&self, shape: (usize, usize), use_nearest: bool) -> Arc<LinearOperator<F>> {
        self.get(OperatorKey::RadialMonotonic { shape, use_nearest })
    }

    /// Point symmetry operator `I - P` with `P` mapping pixel `i` to `N - 1 - i`.
    pub fn symmetry(&self, shape: (usize, usize)) -> Arc<LinearOperator<F>> {
        self.get(OperatorKey::Symmetry { shape })
    }

    /// Differences `x_n - x_p` with `n` the horizontal neighbor closer to the central column.
    pub fn gradient_x(&self, shape: (usize, usize)) -> Arc<LinearOperator<F>> {
        self.get(OperatorKey::GradientX { shape })
    }

    /// Differences `x_n - x_p` with `n` the vertical neighbor closer to the central row.
    pub fn gradient_y(&self, shape: (usize, usize)) -> Arc<LinearOperator<F>> {
        self.get(OperatorKey::GradientY { shape })
    }

    /// Identity of a given vector length.
    pub fn identity(&self, size: usize) -> Arc<LinearOperator<F>> {
        self.get(OperatorKey::Identity { size })
    }

    /// Zero map of a given vector length.
    pub fn null(&self, size: usize) -> Arc<LinearOperator<F>> {
        self.get(OperatorKey::Null { size })
    }

    /// Weights of the closer neighbors of every pixel, shape `(pixels, 8)`.
    ///
    /// Column `j` belongs to [`NEIGHBORS`]`[j]`. A neighbor is valid if it lies inside the box and
    /// is strictly closer to the peak; its raw weight is the cosine between the directions
    /// pixel→peak and pixel→neighbor. With `use_nearest` only the best aligned neighbor is kept, with
    /// weight `min_gradient`. Otherwise the weights of each pixel are normalized to sum 1.
    /// The row of the peak is zero.
    pub fn radial_monotonic_weights(
        &self,
        shape: (usize, usize),
        use_nearest: bool,
        min_gradient: F,
    ) -> Arc<Array2<F>> {
        let key = WeightKey {
            shape,
            use_nearest,
            min_gradient_bits: to_f64(min_gradient).to_bits(),
        };
        memoize(&self.weights, key, || {
            let (height, width) = shape;
            let center = peak(shape);
            let mut weights = Array2::zeros((height * width, NEIGHBORS.len()));

            for (y, x) in (0..height).cartesian_product(0..width) {
                if (y, x) == center {
                    continue;
                }
                let to_peak_y = lit::<F>(center.0 as f64 - y as f64);
                let to_peak_x = lit::<F>(center.1 as f64 - x as f64);
                let to_peak_norm = (to_peak_y * to_peak_y + to_peak_x * to_peak_x).sqrt();
                let own_distance = distance::<F>(y, x, center);

                let mut row = weights.row_mut(y * width + x);
                for (j, &offset) in NEIGHBORS.iter().enumerate() {
                    let Some((ny, nx)) = neighbor((y, x), offset, shape) else {
                        continue;
                    };
                    if distance::<F>(ny, nx, center) >= own_distance {
                        continue;
                    }
                    let oy = lit::<F>(offset.0 as f64);
                    let ox = lit::<F>(offset.1 as f64);
                    let offset_norm = (oy * oy + ox * ox).sqrt();
                    row[j] = (to_peak_y * oy + to_peak_x * ox) / (to_peak_norm * offset_norm);
                }

                if use_nearest {
                    let best = row
                        .iter()
                        .position_max_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                    row.fill(F::zero());
                    if let Some(best) = best {
                        row[best] = min_gradient;
                    }
                } else {
                    let total = row.sum();
                    if total > F::zero() {
                        row /= total;
                    }
                }
            }
            weights
        })
    }

    /// Pixels sorted by distance to the peak, with their strictly closer neighbors.
    pub fn monotonic_order(&self, shape: (usize, usize)) -> Arc<MonotonicOrder> {
        memoize(&self.orders, shape, || {
            let (height, width) = shape;
            let center = peak(shape);
            let distances = (0..height)
                .cartesian_product(0..width)
                .map(|(y, x)| distance::<F>(y, x, center))
                .collect_vec();

            let order = (0..height * width)
                .sorted_by(|&a, &b| {
                    distances[a]
                        .partial_cmp(&distances[b])
                        .unwrap_or(Ordering::Equal)
                        .then(a.cmp(&b))
                })
                .collect_vec();

            let closer = (0..height)
                .cartesian_product(0..width)
                .map(|(y, x)| {
                    let own = distances[y * width + x];
                    NEIGHBORS
                        .iter()
                        .filter_map(|&offset| neighbor((y, x), offset, shape))
                        .map(|(ny, nx)| ny * width + nx)
                        .filter(|&n| distances[n] < own)
                        .collect_vec()
                })
                .collect_vec();

            MonotonicOrder {
                order,
                closer,
                peak: center.0 * width + center.1,
            }
        })
    }

    fn build_radial_monotonic(&self, shape: (usize, usize), use_nearest: bool) -> LinearOperator<F> {
        let (height, width) = shape;
        let size = height * width;
        let weights = self.radial_monotonic_weights(shape, use_nearest, F::one());
        let center = peak(shape);
        let peak_index = center.0 * width + center.1;

        let mut triplets = Vec::with_capacity(size * (NEIGHBORS.len() + 1));
        for (y, x) in (0..height).cartesian_product(0..width) {
            let p = y * width + x;
            if p == peak_index {
                triplets.push((p, p, -F::one()));
                continue;
            }
            triplets.push((p, p, F::one()));
            for (j, &offset) in NEIGHBORS.iter().enumerate() {
                let weight = weights[[p, j]];
                if weight == F::zero() {
                    continue;
                }
                if let Some((ny, nx)) = neighbor((y, x), offset, shape) {
                    triplets.push((p, ny * width + nx, -weight));
                }
            }
        }
        LinearOperator::from_triplets(size, size, triplets)
    }
}

fn build_symmetry<F: Float>(shape: (usize, usize)) -> LinearOperator<F> {
    let size = shape.0 * shape.1;
    let triplets = (0..size).flat_map(|i| [(i, i, F::one()), (i, size - 1 - i, -F::one())]);
    LinearOperator::from_triplets(size, size, triplets)
}

#[derive(Clone, Copy)]
enum Axis2 {
    X,
    Y,
}

fn build_gradient<F: Float>(shape: (usize, usize), axis: Axis2) -> LinearOperator<F> {
    let (height, width) = shape;
    let size = height * width;
    let (center, stride) = match axis {
        Axis2::X => (width / 2, 1),
        Axis2::Y => (height / 2, width),
    };

    let mut triplets = Vec::with_capacity(2 * size);
    for (y, x) in (0..height).cartesian_product(0..width) {
        let p = y * width + x;
        let coordinate = match axis {
            Axis2::X => x,
            Axis2::Y => y,
        };
        let closer = match coordinate.cmp(&center) {
            Ordering::Less => p + stride,
            Ordering::Greater => p - stride,
            Ordering::Equal => continue,
        };
        triplets.push((p, p, -F::one()));
        triplets.push((p, closer, F::one()));
    }
    LinearOperator::from_triplets(size, size, triplets)
}
