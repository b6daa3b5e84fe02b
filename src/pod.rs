//! Local proper orthogonal decomposition via the method of snapshots, the
//! kernel every tree vertex applies to its inputs.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};

use crate::config::DegeneracyPolicy;
use crate::error::{HapodError, Result};
use crate::linalg::{symmetric_eig, vstack};
use crate::params::HapodParameters;

/// Inner product the decomposition is orthonormal against.
#[derive(Clone, Debug)]
pub enum Product {
    Euclidean,
    /// Pointwise weights, one per coordinate. Must be finite and positive.
    Diagonal(Array1<f64>),
}

impl Product {
    pub(crate) fn validate(&self, dim: usize) -> Result<()> {
        match self {
            Product::Euclidean => Ok(()),
            Product::Diagonal(weights) => {
                if weights.len() != dim {
                    return Err(HapodError::config(format!(
                        "diagonal product has {} weights for dimension {dim}",
                        weights.len(),
                    )));
                }
                if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
                    return Err(HapodError::config(
                        "diagonal product weights must be finite and positive",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Gramian of two row sets: entry (i, j) is the inner product of row i
    /// of `x` with row j of `y`.
    pub(crate) fn gram(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Array2<f64> {
        match self {
            Product::Euclidean => x.dot(&y.t()),
            Product::Diagonal(weights) => {
                let mut yw = y.to_owned();
                yw *= weights;
                x.dot(&yw.t())
            }
        }
    }

    pub(crate) fn inner(&self, u: ArrayView1<f64>, v: ArrayView1<f64>) -> f64 {
        match self {
            Product::Euclidean => u.dot(&v),
            Product::Diagonal(weights) => u
                .iter()
                .zip(v.iter())
                .zip(weights.iter())
                .map(|((a, b), w)| a * b * w)
                .sum(),
        }
    }

    pub(crate) fn norm(&self, u: ArrayView1<f64>) -> f64 {
        self.inner(u, u).max(0.0).sqrt()
    }
}

/// An orthonormal mode set with the singular values that weight it.
///
/// Modes are rows of `modes`; `svals[k]` belongs to row k and both are
/// ordered by descending singular value.
#[derive(Clone, Debug)]
pub struct Basis {
    pub modes: Array2<f64>,
    pub svals: Array1<f64>,
}

impl Basis {
    pub fn empty(dim: usize) -> Self {
        Basis {
            modes: Array2::zeros((0, dim)),
            svals: Array1::zeros(0),
        }
    }

    pub fn len(&self) -> usize {
        self.modes.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.modes.ncols()
    }

    /// Rows of `modes`, each scaled by its singular value. This is the
    /// vector set a parent vertex consumes in place of the snapshots below.
    pub(crate) fn scaled_modes(&self) -> Array2<f64> {
        let mut out = self.modes.clone();
        for (mut row, s) in out.outer_iter_mut().zip(self.svals.iter()) {
            row *= *s;
        }
        out
    }
}

/// What a vertex feeds into its POD.
pub enum PodInput<'a> {
    /// Raw snapshot vectors, one per row.
    Fresh(ArrayView2<'a, f64>),
    /// A previously computed basis merged with incoming vectors.
    Merge {
        prior: Basis,
        batch: ArrayView2<'a, f64>,
    },
}

impl PodInput<'_> {
    pub fn num_vectors(&self) -> usize {
        match self {
            PodInput::Fresh(batch) => batch.nrows(),
            PodInput::Merge { prior, batch } => prior.len() + batch.nrows(),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            PodInput::Fresh(batch) => batch.ncols(),
            PodInput::Merge { prior, batch } => {
                if prior.is_empty() {
                    batch.ncols()
                } else {
                    prior.dim()
                }
            }
        }
    }
}

/// Knobs for a single POD call. `orth_tol` bounds the acceptable
/// orthonormality defect of the result; infinity disables the check.
#[derive(Clone, Debug)]
pub struct PodOptions {
    pub orth_tol: f64,
    pub incremental_gramian: bool,
    pub degeneracy: DegeneracyPolicy,
}

impl Default for PodOptions {
    fn default() -> Self {
        PodOptions {
            orth_tol: f64::INFINITY,
            incremental_gramian: false,
            degeneracy: DegeneracyPolicy::Warn,
        }
    }
}

/// Truncated POD of `input` at one tree vertex.
///
/// `num_snaps` is the number of original snapshots below the vertex; the
/// truncation threshold is the schedule bound for `level` scaled by its
/// square root, so discarded spectral mass never exceeds the per-level
/// budget.
pub fn local_pod(
    input: PodInput<'_>,
    num_snaps: usize,
    params: &HapodParameters,
    level: usize,
    product: &Product,
    opts: &PodOptions,
) -> Result<Basis> {
    let dim = input.dim();
    product.validate(dim)?;
    if level >= params.tree_depth() {
        return Err(HapodError::config(format!(
            "pod level {level} outside tolerance schedule of depth {}",
            params.tree_depth(),
        )));
    }
    if input.num_vectors() > 0 && num_snaps == 0 {
        return Err(HapodError::config(
            "pod invoked with vectors but a zero snapshot count",
        ));
    }

    let bound = params.local_bound(level, num_snaps);

    let (stacked, gramian) = match &input {
        PodInput::Fresh(batch) => {
            let g = product.gram(*batch, *batch);
            (batch.to_owned(), g)
        }
        PodInput::Merge { prior, batch } => {
            if prior.svals.len() != prior.len() {
                return Err(HapodError::config(format!(
                    "merge input carries {} singular values for {} modes",
                    prior.svals.len(),
                    prior.len(),
                )));
            }
            if !prior.is_empty() && batch.nrows() > 0 && prior.dim() != batch.ncols() {
                return Err(HapodError::config(format!(
                    "merge input dimensions disagree: {} vs {}",
                    prior.dim(),
                    batch.ncols(),
                )));
            }
            let scaled = prior.scaled_modes();
            let stacked = vstack(&[scaled.view(), batch.view()]);
            let g = if opts.incremental_gramian {
                // Orthonormality of the prior modes gives the top-left block
                // as diag(svals^2) without touching the long vectors again.
                let m = prior.len();
                let k = batch.nrows();
                let mut g = Array2::zeros((m + k, m + k));
                for i in 0..m {
                    g[[i, i]] = prior.svals[i] * prior.svals[i];
                }
                let cross = product.gram(prior.modes.view(), *batch);
                for i in 0..m {
                    for j in 0..k {
                        let v = prior.svals[i] * cross[[i, j]];
                        g[[i, m + j]] = v;
                        g[[m + j, i]] = v;
                    }
                }
                let bb = product.gram(*batch, *batch);
                g.slice_mut(s![m.., m..]).assign(&bb);
                g
            } else {
                product.gram(stacked.view(), stacked.view())
            };
            (stacked, g)
        }
    };

    // Float noise can leave the Gramian slightly asymmetric.
    let sym = (&gramian + &gramian.t()).mapv(|x| 0.5 * x);
    let (eigvals, eigvecs) = symmetric_eig(sym.view());

    let total = eigvals.len();
    let lam_max = if total > 0 { eigvals[0].max(0.0) } else { 0.0 };
    let rank_cut = lam_max * total as f64 * f64::EPSILON;
    let budget = bound * bound;

    // Discard trailing eigenvalues while their sum stays inside the error
    // budget; numerically null directions go regardless.
    let mut keep = total;
    let mut shed = 0.0;
    while keep > 0 {
        let lam = eigvals[keep - 1].max(0.0);
        if lam <= rank_cut || shed + lam <= budget {
            shed += lam;
            keep -= 1;
        } else {
            break;
        }
    }

    let mut modes = eigvecs.slice(s![.., ..keep]).t().dot(&stacked);
    let mut svals = Array1::zeros(keep);
    for k in 0..keep {
        let sigma = eigvals[k].max(0.0).sqrt();
        svals[k] = sigma;
        let mut row = modes.row_mut(k);
        row /= sigma;
    }

    let mut basis = Basis { modes, svals };

    if opts.orth_tol.is_finite() {
        let defect = orthonormality_defect(&basis, product);
        if defect > opts.orth_tol {
            basis = reorthonormalize(basis, product);
            let repaired = orthonormality_defect(&basis, product);
            if repaired > opts.orth_tol {
                match opts.degeneracy {
                    DegeneracyPolicy::Fail => {
                        return Err(HapodError::Degenerate {
                            defect: repaired,
                            tolerance: opts.orth_tol,
                        });
                    }
                    DegeneracyPolicy::Warn => {
                        tracing::warn!(
                            "orthonormality defect {repaired:.3e} still above {:.3e} after re-orthonormalization",
                            opts.orth_tol,
                        );
                    }
                }
            }
        }
    }

    Ok(basis)
}

/// Largest entrywise deviation of the basis Gramian from the identity.
fn orthonormality_defect(basis: &Basis, product: &Product) -> f64 {
    if basis.is_empty() {
        return 0.0;
    }
    let g = product.gram(basis.modes.view(), basis.modes.view());
    let n = g.nrows();
    let mut defect = 0.0f64;
    for i in 0..n {
        for j in 0..n {
            let target = if i == j { 1.0 } else { 0.0 };
            defect = defect.max((g[[i, j]] - target).abs());
        }
    }
    defect
}

/// Two-pass modified Gram-Schmidt over the basis rows. Rows that project to
/// nothing are dropped together with their singular values.
fn reorthonormalize(basis: Basis, product: &Product) -> Basis {
    let dim = basis.dim();
    let mut rows: Vec<Array1<f64>> = Vec::with_capacity(basis.len());
    let mut svals: Vec<f64> = Vec::with_capacity(basis.len());
    for (i, row) in basis.modes.outer_iter().enumerate() {
        let mut w = row.to_owned();
        for _ in 0..2 {
            for q in &rows {
                let proj = product.inner(w.view(), q.view());
                w.scaled_add(-proj, q);
            }
        }
        let norm = product.norm(w.view());
        if norm > 1e-13 {
            w /= norm;
            rows.push(w);
            svals.push(basis.svals[i]);
        }
    }
    let mut modes = Array2::zeros((rows.len(), dim));
    for (k, row) in rows.iter().enumerate() {
        modes.row_mut(k).assign(row);
    }
    Basis {
        modes,
        svals: Array1::from_vec(svals),
    }
}
