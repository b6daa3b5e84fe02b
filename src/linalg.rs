//! Small dense kernels backing the POD: a cyclic Jacobi eigensolver for
//! symmetric Gramians, plus row stacking.

use ndarray::{s, Array1, Array2, ArrayView2};

/// Upper bound on Jacobi sweeps. The Gramians here are small and the
/// rotations converge quadratically, so this is never reached in practice.
const MAX_JACOBI_SWEEPS: usize = 64;

/// Eigendecomposition of a symmetric matrix by the cyclic Jacobi method.
///
/// Returns eigenvalues in descending order with the matching eigenvectors
/// as columns.
pub(crate) fn symmetric_eig(mat: ArrayView2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = mat.nrows();
    debug_assert_eq!(n, mat.ncols());
    let mut a = mat.to_owned();
    let mut v = Array2::<f64>::eye(n);

    if n > 1 {
        for _ in 0..MAX_JACOBI_SWEEPS {
            let scale = a
                .diag()
                .iter()
                .map(|d| d.abs())
                .fold(f64::MIN_POSITIVE, f64::max);
            let mut off = 0.0;
            for p in 0..n {
                for q in (p + 1)..n {
                    off += a[[p, q]] * a[[p, q]];
                }
            }
            if off.sqrt() <= scale * 1e-14 {
                break;
            }

            for p in 0..n - 1 {
                for q in (p + 1)..n {
                    let apq = a[[p, q]];
                    if apq.abs() <= scale * f64::EPSILON {
                        continue;
                    }
                    let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                    let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                    let c = 1.0 / (t * t + 1.0).sqrt();
                    let s = t * c;

                    for k in 0..n {
                        let akp = a[[k, p]];
                        let akq = a[[k, q]];
                        a[[k, p]] = c * akp - s * akq;
                        a[[k, q]] = s * akp + c * akq;
                    }
                    for k in 0..n {
                        let apk = a[[p, k]];
                        let aqk = a[[q, k]];
                        a[[p, k]] = c * apk - s * aqk;
                        a[[q, k]] = s * apk + c * aqk;
                    }
                    for k in 0..n {
                        let vkp = v[[k, p]];
                        let vkq = v[[k, q]];
                        v[[k, p]] = c * vkp - s * vkq;
                        v[[k, q]] = s * vkp + c * vkq;
                    }
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| {
        a[[j, j]]
            .partial_cmp(&a[[i, i]])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let eigvals = Array1::from_iter(order.iter().map(|&i| a[[i, i]]));
    let mut eigvecs = Array2::zeros((n, n));
    for (dst, &src) in order.iter().enumerate() {
        eigvecs.column_mut(dst).assign(&v.column(src));
    }
    (eigvals, eigvecs)
}

/// Stack row blocks into one matrix. Blocks with rows must agree on column
/// count; zero-row blocks are skipped.
pub(crate) fn vstack(parts: &[ArrayView2<f64>]) -> Array2<f64> {
    let ncols = parts.iter().map(|p| p.ncols()).max().unwrap_or(0);
    let nrows = parts.iter().map(|p| p.nrows()).sum();
    let mut out = Array2::zeros((nrows, ncols));
    let mut at = 0;
    for p in parts {
        if p.nrows() == 0 {
            continue;
        }
        debug_assert_eq!(p.ncols(), ncols);
        out.slice_mut(s![at..at + p.nrows(), ..]).assign(p);
        at += p.nrows();
    }
    out
}
