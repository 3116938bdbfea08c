//! Nonlinear projection of factor vectors into a few dimensions for
//! plotting.
//!
//! [`Tsne`] is Barnes-Hut t-distributed stochastic neighbour embedding: it
//! matches perplexity-calibrated Gaussian neighbourhoods in the input space
//! with Student-t neighbourhoods in the output space by gradient descent.
//! Input affinities are kept only for the `3 * perplexity` nearest
//! neighbours of each row, and repulsion between output points is
//! approximated through a space-partitioning tree, so memory grows with
//! `rows * neighbours` rather than `rows^2`.
use std::cmp::Ordering;
use std::collections::BTreeMap;

use failure::Fail;
use ndarray::{Array2, ArrayView1};
use rand::{thread_rng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use tracing::debug;

/// Projection error types.
#[derive(Debug, Fail)]
pub enum ProjectionError {
    /// An input row contains NaN or infinity.
    #[fail(display = "Non-finite value in input row {}.", _0)]
    NonFiniteInput(usize),
    /// The perplexity is not a positive number.
    #[fail(display = "Invalid perplexity {}: must be positive.", _0)]
    InvalidPerplexity(f64),
    /// The Barnes-Hut threshold is negative or not a number.
    #[fail(display = "Invalid theta {}: must be finite and non-negative.", _0)]
    InvalidTheta(f64),
    /// The output dimensionality is unsupported.
    #[fail(display = "Invalid number of components {}: must be 1, 2 or 3.", _0)]
    InvalidComponents(usize),
}

/// Maps a set of vectors to lower-dimensional ones, row for row.
pub trait Projector {
    /// Number of output dimensions.
    fn components(&self) -> usize;
    /// Project all rows of `vectors` at once.
    fn project(&self, vectors: &Array2<f32>) -> Result<Array2<f32>, ProjectionError>;
}

/// Largest output dimensionality: every tree split creates `2^components`
/// cells.
pub const MAX_COMPONENTS: usize = 3;

const EXAGGERATION_ITERATIONS: usize = 250;
const MIN_GAIN: f64 = 0.01;
const MAX_TREE_DEPTH: usize = 32;

/// Sparse rows of `(column, value)` pairs.
type SparseRows = Vec<Vec<(usize, f64)>>;

/// Barnes-Hut t-SNE.
#[derive(Clone, Debug)]
pub struct Tsne {
    components: usize,
    perplexity: f64,
    iterations: usize,
    early_exaggeration: f64,
    theta: f64,
    seed: Option<u64>,
}

impl Default for Tsne {
    fn default() -> Self {
        Tsne {
            components: 3,
            perplexity: 30.0,
            iterations: 1000,
            early_exaggeration: 12.0,
            theta: 0.5,
            seed: None,
        }
    }
}

impl Tsne {
    /// Set the output dimensionality, at most [`MAX_COMPONENTS`].
    pub fn components(mut self, components: usize) -> Self {
        self.components = components;
        self
    }

    /// Set the perplexity, roughly the number of effective neighbours.
    pub fn perplexity(mut self, perplexity: f64) -> Self {
        self.perplexity = perplexity;
        self
    }

    /// Set the number of gradient steps.
    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the Barnes-Hut accuracy threshold. A cell is summarised by its
    /// centre of mass once its width is below `theta` times its distance;
    /// zero computes every pairwise repulsion exactly.
    pub fn theta(mut self, theta: f64) -> Self {
        self.theta = theta;
        self
    }

    /// Seed the initial layout.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn input_affinities(&self, vectors: &Array2<f32>) -> SparseRows {
        let n = vectors.nrows();
        let perplexity = self.perplexity.min((n - 1) as f64 / 3.0).max(1.0);
        let num_neighbours = ((3.0 * perplexity) as usize).clamp(1, n - 1);

        let conditional: SparseRows = nearest_neighbours(vectors, num_neighbours)
            .into_par_iter()
            .map(|neighbours| calibrate(neighbours, perplexity.ln()))
            .collect();

        symmetrize(&conditional)
    }
}

fn squared_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = f64::from(*x) - f64::from(*y);
            diff * diff
        })
        .sum()
}

fn by_distance(a: &(usize, f64), b: &(usize, f64)) -> Ordering {
    a.1.partial_cmp(&b.1)
        .unwrap_or(Ordering::Equal)
        .then(a.0.cmp(&b.0))
}

/// The `k` nearest rows of every row, closest first, with squared distances.
fn nearest_neighbours(vectors: &Array2<f32>, k: usize) -> SparseRows {
    let n = vectors.nrows();

    (0..n)
        .into_par_iter()
        .map(|i| {
            let row = vectors.row(i);
            let mut distances: Vec<(usize, f64)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (j, squared_distance(row, vectors.row(j))))
                .collect();

            if k < distances.len() {
                distances.select_nth_unstable_by(k, by_distance);
                distances.truncate(k);
            }
            distances.sort_by(by_distance);

            distances
        })
        .collect()
}

/// Gaussian conditional probabilities over `neighbours` whose entropy
/// matches `target_entropy`, found by bisection on the precision.
fn calibrate(neighbours: Vec<(usize, f64)>, target_entropy: f64) -> Vec<(usize, f64)> {
    let min_distance = neighbours
        .iter()
        .map(|&(_, distance)| distance)
        .fold(f64::INFINITY, f64::min);

    let mut weights = vec![0.0; neighbours.len()];
    let mut beta = 1.0;
    let mut beta_min = 0.0;
    let mut beta_max = f64::INFINITY;

    for _ in 0..64 {
        let mut sum = 0.0;
        let mut weighted = 0.0;

        for (weight, &(_, distance)) in weights.iter_mut().zip(&neighbours) {
            let shifted = distance - min_distance;
            *weight = (-beta * shifted).exp();
            weighted += shifted * *weight;
            sum += *weight;
        }

        let entropy = sum.ln() + beta * weighted / sum;
        let diff = entropy - target_entropy;

        if diff.abs() < 1e-5 {
            break;
        }

        if diff > 0.0 {
            beta_min = beta;
            beta = if beta_max.is_infinite() {
                beta * 2.0
            } else {
                (beta + beta_max) / 2.0
            };
        } else {
            beta_max = beta;
            beta = (beta + beta_min) / 2.0;
        }
    }

    let sum: f64 = weights.iter().sum();

    neighbours
        .iter()
        .zip(weights)
        .map(|(&(j, _), weight)| (j, weight / sum))
        .collect()
}

/// `(P + P^T) / 2n`: symmetric, summing to one.
fn symmetrize(conditional: &[Vec<(usize, f64)>]) -> SparseRows {
    let n = conditional.len();
    let mut rows: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n];

    for (i, row) in conditional.iter().enumerate() {
        for &(j, p) in row {
            *rows[i].entry(j).or_insert(0.0) += p;
            *rows[j].entry(i).or_insert(0.0) += p;
        }
    }

    let scale = 2.0 * n as f64;

    rows.into_iter()
        .map(|row| row.into_iter().map(|(j, p)| (j, p / scale)).collect())
        .collect()
}

#[derive(Clone, Debug)]
struct Cell {
    centre: Vec<f64>,
    half_width: f64,
    count: usize,
    mass: Vec<f64>,
    children: Option<usize>,
    points: Vec<usize>,
}

impl Cell {
    fn new(centre: Vec<f64>, half_width: f64) -> Self {
        let dims = centre.len();
        Cell {
            centre,
            half_width,
            count: 0,
            mass: vec![0.0; dims],
            children: None,
            points: Vec::new(),
        }
    }
}

/// A `2^dims`-ary space-partitioning tree over row-major points, each cell
/// tracking the number of points below it and their summed positions.
struct SpaceTree<'a> {
    dims: usize,
    positions: &'a [f64],
    cells: Vec<Cell>,
}

impl<'a> SpaceTree<'a> {
    fn new(positions: &'a [f64], dims: usize) -> Self {
        let n = positions.len() / dims;

        let mut min = vec![f64::INFINITY; dims];
        let mut max = vec![f64::NEG_INFINITY; dims];
        for point in positions.chunks(dims) {
            for d in 0..dims {
                min[d] = min[d].min(point[d]);
                max[d] = max[d].max(point[d]);
            }
        }

        let centre: Vec<f64> = min.iter().zip(&max).map(|(lo, hi)| (lo + hi) / 2.0).collect();
        let half_width = min
            .iter()
            .zip(&max)
            .map(|(lo, hi)| (hi - lo) / 2.0)
            .fold(0.0, f64::max)
            + 1e-5;

        let mut tree = SpaceTree {
            dims,
            positions,
            cells: vec![Cell::new(centre, half_width)],
        };

        for point in 0..n {
            tree.insert(0, point, 0);
        }

        tree
    }

    fn position(&self, point: usize) -> &'a [f64] {
        let positions = self.positions;
        &positions[point * self.dims..(point + 1) * self.dims]
    }

    fn child_offset(&self, cell: usize, point: usize) -> usize {
        self.position(point)
            .iter()
            .zip(&self.cells[cell].centre)
            .enumerate()
            .filter(|(_, (x, centre))| x > centre)
            .map(|(d, _)| 1usize << d)
            .sum()
    }

    fn subdivide(&mut self, cell: usize) -> usize {
        let first = self.cells.len();
        let centre = self.cells[cell].centre.clone();
        let quarter = self.cells[cell].half_width / 2.0;

        for child in 0..(1usize << self.dims) {
            let child_centre = centre
                .iter()
                .enumerate()
                .map(|(d, c)| if child >> d & 1 == 1 { c + quarter } else { c - quarter })
                .collect();
            self.cells.push(Cell::new(child_centre, quarter));
        }

        self.cells[cell].children = Some(first);
        first
    }

    fn insert(&mut self, mut cell: usize, point: usize, mut depth: usize) {
        let position = self.position(point);

        loop {
            let current = &mut self.cells[cell];
            current.count += 1;
            for (mass, x) in current.mass.iter_mut().zip(position) {
                *mass += x;
            }

            let children = current.children;
            let first = match children {
                Some(first) => first,
                None => {
                    if current.points.is_empty() || depth >= MAX_TREE_DEPTH {
                        current.points.push(point);
                        return;
                    }

                    let existing = std::mem::take(&mut current.points);
                    let first = self.subdivide(cell);
                    for other in existing {
                        let child = first + self.child_offset(cell, other);
                        self.insert(child, other, depth + 1);
                    }
                    first
                }
            };

            cell = first + self.child_offset(cell, point);
            depth += 1;
        }
    }

    /// Accumulates `sum w^2 (y_i - y_j)` into `force` and returns `sum w`,
    /// with `w = 1 / (1 + |y_i - y_j|^2)` over every other point `j`.
    fn repulsion(&self, point: usize, theta: f64, force: &mut [f64]) -> f64 {
        let position = self.position(point);
        let mut diff = vec![0.0; self.dims];
        let mut normalizer = 0.0;
        let mut stack = vec![0];

        while let Some(cell) = stack.pop() {
            let cell = &self.cells[cell];
            if cell.count == 0 {
                continue;
            }

            match cell.children {
                None => {
                    for &other in cell.points.iter().filter(|&&other| other != point) {
                        let mut distance = 0.0;
                        for (d, (x, y)) in position.iter().zip(self.position(other)).enumerate() {
                            diff[d] = x - y;
                            distance += diff[d] * diff[d];
                        }
                        let w = 1.0 / (1.0 + distance);
                        normalizer += w;
                        for (f, d) in force.iter_mut().zip(&diff) {
                            *f += w * w * d;
                        }
                    }
                }
                Some(first) => {
                    let count = cell.count as f64;
                    let mut distance = 0.0;
                    for (d, (x, mass)) in position.iter().zip(&cell.mass).enumerate() {
                        diff[d] = x - mass / count;
                        distance += diff[d] * diff[d];
                    }

                    let width = 2.0 * cell.half_width;
                    if width * width < theta * theta * distance {
                        let w = 1.0 / (1.0 + distance);
                        normalizer += count * w;
                        for (f, d) in force.iter_mut().zip(&diff) {
                            *f += count * w * w * d;
                        }
                    } else {
                        stack.extend(first..first + (1 << self.dims));
                    }
                }
            }
        }

        normalizer
    }
}

impl Projector for Tsne {
    fn components(&self) -> usize {
        self.components
    }

    fn project(&self, vectors: &Array2<f32>) -> Result<Array2<f32>, ProjectionError> {
        if !(self.perplexity.is_finite() && self.perplexity > 0.0) {
            return Err(ProjectionError::InvalidPerplexity(self.perplexity));
        }

        if !(self.theta.is_finite() && self.theta >= 0.0) {
            return Err(ProjectionError::InvalidTheta(self.theta));
        }

        if self.components == 0 || self.components > MAX_COMPONENTS {
            return Err(ProjectionError::InvalidComponents(self.components));
        }

        if let Some((row, _)) = vectors
            .outer_iter()
            .enumerate()
            .find(|(_, row)| row.iter().any(|x| !x.is_finite()))
        {
            return Err(ProjectionError::NonFiniteInput(row));
        }

        let n = vectors.nrows();
        let dims = self.components;

        if n < 2 {
            return Ok(Array2::zeros((n, dims)));
        }

        let affinities = self.input_affinities(vectors);

        debug!(
            rows = n,
            affinities = affinities.iter().map(|row| row.len()).sum::<usize>(),
            "t-SNE input affinities"
        );

        let mut rng = match self.seed {
            Some(seed) => XorShiftRng::seed_from_u64(seed),
            None => XorShiftRng::seed_from_u64(thread_rng().gen()),
        };

        let mut embedding: Vec<f64> = (0..n * dims)
            .map(|_| 1e-4 * rng.sample::<f64, _>(StandardNormal))
            .collect();
        let mut update = vec![0.0; n * dims];
        let mut gains: Vec<f64> = vec![1.0; n * dims];
        let mut gradient = vec![0.0; n * dims];

        let learning_rate = (n as f64 / self.early_exaggeration / 4.0).max(50.0);

        for iteration in 0..self.iterations {
            let (exaggeration, momentum) = if iteration < EXAGGERATION_ITERATIONS {
                (self.early_exaggeration, 0.5)
            } else {
                (1.0, 0.8)
            };

            let repulsive: Vec<(Vec<f64>, f64)> = {
                let tree = SpaceTree::new(&embedding, dims);
                (0..n)
                    .into_par_iter()
                    .map(|i| {
                        let mut force = vec![0.0; dims];
                        let normalizer = tree.repulsion(i, self.theta, &mut force);
                        (force, normalizer)
                    })
                    .collect()
            };
            let normalizer: f64 = repulsive.iter().map(|(_, z)| z).sum();

            for (i, (row, (force, _))) in affinities.iter().zip(&repulsive).enumerate() {
                let yi = &embedding[i * dims..(i + 1) * dims];
                let grad = &mut gradient[i * dims..(i + 1) * dims];

                for (g, f) in grad.iter_mut().zip(force) {
                    *g = -f / normalizer;
                }

                for &(j, p) in row {
                    let yj = &embedding[j * dims..(j + 1) * dims];
                    let distance: f64 = yi.iter().zip(yj).map(|(a, b)| (a - b) * (a - b)).sum();
                    let strength = exaggeration * p / (1.0 + distance);
                    for (g, (a, b)) in grad.iter_mut().zip(yi.iter().zip(yj)) {
                        *g += strength * (a - b);
                    }
                }

                for g in grad.iter_mut() {
                    *g *= 4.0;
                }
            }

            for ((gain, step), grad) in gains.iter_mut().zip(update.iter_mut()).zip(&gradient) {
                *gain = if (*grad > 0.0) != (*step > 0.0) {
                    *gain + 0.2
                } else {
                    (*gain * 0.8).max(MIN_GAIN)
                };
                *step = momentum * *step - learning_rate * *gain * *grad;
            }

            for (y, step) in embedding.iter_mut().zip(&update) {
                *y += step;
            }

            for d in 0..dims {
                let mean = embedding.iter().skip(d).step_by(dims).sum::<f64>() / n as f64;
                for y in embedding.iter_mut().skip(d).step_by(dims) {
                    *y -= mean;
                }
            }

            if iteration % 100 == 0 {
                debug!(iteration, "t-SNE step");
            }
        }

        Ok(Array2::from_shape_fn((n, dims), |(i, d)| {
            embedding[i * dims + d] as f32
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clusters(per_cluster: usize) -> Array2<f32> {
        Array2::from_shape_fn((2 * per_cluster, 6), |(row, col)| {
            let centre = if row < per_cluster { 5.0 } else { -5.0 };
            centre + ((row * 7 + col * 3) % 5) as f32 * 0.1
        })
    }

    fn distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }

    #[test]
    fn output_shape_and_determinism() {
        let data = clusters(6);
        let tsne = Tsne::default().iterations(300).seed(5);

        let first = tsne.project(&data).unwrap();
        let second = tsne.project(&data).unwrap();

        assert_eq!(first.dim(), (12, 3));
        assert_eq!(first, second);
        assert!(first.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn keeps_clusters_apart() {
        let per_cluster = 10;
        let data = clusters(per_cluster);
        let projected = Tsne::default().seed(9).project(&data).unwrap();

        let mut within = 0.0;
        let mut across = 0.0;
        let mut within_pairs = 0;
        let mut across_pairs = 0;

        for i in 0..2 * per_cluster {
            for j in (i + 1)..2 * per_cluster {
                let d = distance(projected.row(i), projected.row(j));
                if (i < per_cluster) == (j < per_cluster) {
                    within += d;
                    within_pairs += 1;
                } else {
                    across += d;
                    across_pairs += 1;
                }
            }
        }

        assert!(within / within_pairs as f32 * 2.0 < across / across_pairs as f32);
    }

    #[test]
    fn affinities_are_sparse_symmetric_and_normalised() {
        let data = clusters(40);
        let tsne = Tsne::default().perplexity(5.0);

        let affinities = tsne.input_affinities(&data);

        assert_eq!(affinities.len(), 80);
        // Each row holds its own 15 neighbours plus rows that chose it.
        assert!(affinities.iter().all(|row| row.len() >= 15 && row.len() < 79));

        let total: f64 = affinities.iter().flatten().map(|&(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-9);

        for (i, row) in affinities.iter().enumerate() {
            for &(j, p) in row {
                let back = affinities[j]
                    .iter()
                    .find(|&&(k, _)| k == i)
                    .map(|&(_, p)| p);
                assert_eq!(back, Some(p));
            }
        }
    }

    #[test]
    fn exact_tree_repulsion_matches_pairwise_sums() {
        let dims = 3;
        let mut rng = XorShiftRng::seed_from_u64(4);
        let positions: Vec<f64> = (0..50 * dims)
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        let tree = SpaceTree::new(&positions, dims);

        for i in 0..50 {
            let mut force = vec![0.0; dims];
            let normalizer = tree.repulsion(i, 0.0, &mut force);

            let mut expected_force = vec![0.0; dims];
            let mut expected_normalizer = 0.0;
            for j in (0..50).filter(|&j| j != i) {
                let diff: Vec<f64> = (0..dims)
                    .map(|d| positions[i * dims + d] - positions[j * dims + d])
                    .collect();
                let w = 1.0 / (1.0 + diff.iter().map(|x| x * x).sum::<f64>());
                expected_normalizer += w;
                for d in 0..dims {
                    expected_force[d] += w * w * diff[d];
                }
            }

            assert!((normalizer - expected_normalizer).abs() < 1e-9);
            for d in 0..dims {
                assert!((force[d] - expected_force[d]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn duplicate_points_do_not_split_forever() {
        let positions = vec![1.0; 10 * 2];
        let tree = SpaceTree::new(&positions, 2);

        let mut force = vec![0.0; 2];
        assert_eq!(tree.repulsion(0, 0.5, &mut force), 9.0);
        assert_eq!(force, vec![0.0, 0.0]);
    }

    #[test]
    fn degenerate_inputs() {
        let tsne = Tsne::default().seed(1);

        assert_eq!(tsne.project(&Array2::zeros((0, 4))).unwrap().dim(), (0, 3));
        assert_eq!(tsne.project(&Array2::ones((1, 4))).unwrap().dim(), (1, 3));

        let mut bad = Array2::ones((3, 2));
        bad[(1, 0)] = f32::NAN;
        assert!(tsne.project(&bad).is_err());

        let ones = Array2::ones((3, 2));
        assert!(Tsne::default().perplexity(0.0).project(&ones).is_err());
        assert!(Tsne::default().theta(-1.0).project(&ones).is_err());
        assert!(Tsne::default().components(0).project(&ones).is_err());
        assert!(Tsne::default().components(4).project(&ones).is_err());
    }
}
