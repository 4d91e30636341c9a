//! Dense linear-algebra kernels needed by the evolution driver.
//!
//! The matrix exponential uses scaling and squaring with a Padé(13)
//! approximant (Higham 2005, "The Scaling and Squaring Method for the Matrix
//! Exponential Revisited").

use ndarray::{ self as nd, s };
use num_complex::Complex64 as C64;
use crate::error::{ SimError, SimResult };

// Padé(13, 13) coefficients b_0..b_13
const PADE: [f64; 14] = [
    1.0,
    0.5,
    0.12,
    1.833_333_333_333_333_4e-2,
    1.992_753_623_188_405_8e-3,
    1.630_434_782_608_696e-4,
    1.035_196_687_401_6e-5,
    5.175_983_437_008_01e-7,
    2.043_151_356_652_5e-8,
    6.306_022_705_717_593e-10,
    1.483_770_048_404_14e-11,
    2.529_153_491_597_966e-13,
    2.810_170_546_219_962_4e-15,
    1.544_049_750_670_309e-17,
];

// ||A / 2^s||_1 must stay below this for Padé(13) to reach double precision
const THETA_13: f64 = 5.37;

/// Maximum absolute column sum.
pub fn norm_1<S>(a: &nd::ArrayBase<S, nd::Ix2>) -> f64
where S: nd::Data<Elem = C64>
{
    a.columns().into_iter()
        .map(|col| col.iter().map(|x| x.norm()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Compute `exp(A)` for a square complex matrix.
pub fn matrix_exp(a: &nd::Array2<C64>) -> SimResult<nd::Array2<C64>> {
    let (n, m) = a.dim();
    if n != m {
        return Err(SimError::dims("matrix_exp", (n, n), (n, m)));
    }
    match n {
        0 => return Ok(nd::Array2::zeros((0, 0))),
        1 => return Ok(nd::array![[a[[0, 0]].exp()]]),
        _ => { },
    }
    let norm = norm_1(a);
    let s: u32
        = if norm > THETA_13 {
            (norm / THETA_13).log2().ceil() as u32
        } else {
            0
        };
    let scaled = a * C64::from(0.5_f64.powi(s as i32));
    let mut e = pade13(&scaled)?;
    for _ in 0..s {
        e = e.dot(&e);
    }
    Ok(e)
}

/// Compute the propagator `exp(-i H dt)`.
pub fn propagator(H: &nd::Array2<C64>, dt: f64) -> SimResult<nd::Array2<C64>> {
    matrix_exp(&(H * (-C64::i() * dt)))
}

fn pade13(a: &nd::Array2<C64>) -> SimResult<nd::Array2<C64>> {
    let b = |k: usize| C64::from(PADE[k]);
    let eye: nd::Array2<C64> = nd::Array2::eye(a.nrows());
    let a2 = a.dot(a);
    let a4 = a2.dot(&a2);
    let a6 = a2.dot(&a4);

    let w1 = &a6 * b(13) + &a4 * b(11) + &a2 * b(9);
    let w2
        = w1.dot(&a6) + &a6 * b(7) + &a4 * b(5) + &a2 * b(3) + &eye * b(1);
    let u = a.dot(&w2);

    let z1 = &a6 * b(12) + &a4 * b(10) + &a2 * b(8);
    let v
        = z1.dot(&a6) + &a6 * b(6) + &a4 * b(4) + &a2 * b(2) + &eye * b(0);

    solve(&(&v - &u), &(&v + &u))
}

/// Solve `A X = B` by Gaussian elimination with partial pivoting.
pub fn solve(a: &nd::Array2<C64>, b: &nd::Array2<C64>)
    -> SimResult<nd::Array2<C64>>
{
    let n = a.nrows();
    if !a.is_square() || b.nrows() != n {
        return Err(SimError::dims("solve", (n, n), (a.ncols(), b.nrows())));
    }
    let m = b.ncols();
    let mut aug: nd::Array2<C64> = nd::Array2::zeros((n, n + m));
    aug.slice_mut(s![.., ..n]).assign(a);
    aug.slice_mut(s![.., n..]).assign(b);

    for col in 0..n {
        let (piv, pmax)
            = (col..n)
            .map(|r| (r, aug[[r, col]].norm()))
            .fold((col, -1.0), |acc, x| if x.1 > acc.1 { x } else { acc });
        if pmax < 1e-300 {
            return Err(SimError::Integration(
                "singular matrix in linear solve".into()));
        }
        if piv != col {
            for j in 0..n + m {
                aug.swap([col, j], [piv, j]);
            }
        }
        let pivot = aug[[col, col]];
        for r in col + 1..n {
            let f = aug[[r, col]] / pivot;
            if f == C64::from(0.0) { continue; }
            for j in col..n + m {
                let x = aug[[col, j]];
                aug[[r, j]] -= f * x;
            }
        }
    }

    let mut x: nd::Array2<C64> = nd::Array2::zeros((n, m));
    for row in (0..n).rev() {
        let pivot = aug[[row, row]];
        for j in 0..m {
            let mut acc = aug[[row, n + j]];
            for k in row + 1..n {
                acc -= aug[[row, k]] * x[[k, j]];
            }
            x[[row, j]] = acc / pivot;
        }
    }
    Ok(x)
}

const JACOBI_MAX_SWEEPS: usize = 64;

/// Eigendecomposition of a Hermitian matrix by cyclic complex Jacobi
/// rotations.
///
/// Returns eigenvalues and a unitary whose columns are the matching
/// eigenvectors, so that `A = V diag(w) V^dag`. Only the Hermitian part of
/// `a` is used.
pub fn eigh(a: &nd::Array2<C64>) -> SimResult<(nd::Array1<f64>, nd::Array2<C64>)> {
    let (n, m) = a.dim();
    if n != m {
        return Err(SimError::dims("eigh", (n, n), (n, m)));
    }
    let mut A: nd::Array2<C64>
        = nd::Array2::from_shape_fn((n, n), |(i, j)| {
            0.5 * (a[[i, j]] + a[[j, i]].conj())
        });
    let mut V: nd::Array2<C64> = nd::Array2::eye(n);
    let total: f64 = A.iter().map(|x| x.norm_sqr()).sum::<f64>().sqrt();
    if total == 0.0 {
        return Ok((nd::Array1::zeros(n), V));
    }
    let off = |A: &nd::Array2<C64>| -> f64 {
        A.indexed_iter()
            .filter(|((i, j), _)| i != j)
            .map(|(_, x)| x.norm_sqr())
            .sum::<f64>()
            .sqrt()
    };

    let mut sweeps: usize = 0;
    while off(&A) > 1e-15 * total {
        if sweeps == JACOBI_MAX_SWEEPS {
            return Err(SimError::Integration(
                "Jacobi eigensolver did not converge".into()));
        }
        for p in 0..n {
            for q in p + 1..n {
                let apq = A[[p, q]];
                let r = apq.norm();
                if r <= 1e-300 { continue; }
                // phase rotation makes A[p, q] real, then a real Jacobi
                // rotation zeroes it
                let ph = apq / r;
                let tau = (A[[q, q]].re - A[[p, p]].re) / (2.0 * r);
                let t
                    = if tau >= 0.0 {
                        1.0 / (tau + (1.0 + tau * tau).sqrt())
                    } else {
                        -1.0 / (-tau + (1.0 + tau * tau).sqrt())
                    };
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = t * c;
                // J = [[c, s], [-s ph^*, c ph^*]] on the (p, q) block
                let jqp = -ph.conj() * s;
                let jqq = ph.conj() * c;
                for k in 0..n {
                    let (akp, akq) = (A[[k, p]], A[[k, q]]);
                    A[[k, p]] = akp * c + akq * jqp;
                    A[[k, q]] = akp * s + akq * jqq;
                    let (vkp, vkq) = (V[[k, p]], V[[k, q]]);
                    V[[k, p]] = vkp * c + vkq * jqp;
                    V[[k, q]] = vkp * s + vkq * jqq;
                }
                for k in 0..n {
                    let (apk, aqk) = (A[[p, k]], A[[q, k]]);
                    A[[p, k]] = apk * c + aqk * jqp.conj();
                    A[[q, k]] = apk * s + aqk * jqq.conj();
                }
                A[[p, q]] = C64::from(0.0);
                A[[q, p]] = C64::from(0.0);
                A[[p, p]] = C64::from(A[[p, p]].re);
                A[[q, q]] = C64::from(A[[q, q]].re);
            }
        }
        sweeps += 1;
    }
    let w: nd::Array1<f64> = A.diag().iter().map(|x| x.re).collect();
    Ok((w, V))
}

/// Principal square root of a positive semi-definite Hermitian matrix.
/// Negative eigenvalues from round-off are clipped to zero.
pub fn sqrtm_psd(a: &nd::Array2<C64>) -> SimResult<nd::Array2<C64>> {
    let (w, V) = eigh(a)?;
    let scaled: nd::Array2<C64>
        = nd::Array2::from_shape_fn(V.raw_dim(), |(i, j)| {
            V[[i, j]] * w[j].max(0.0).sqrt()
        });
    Ok(scaled.dot(&V.t().mapv(|x| x.conj())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn close(a: &nd::Array2<C64>, b: &nd::Array2<C64>, tol: f64) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).norm() < tol)
    }

    #[test]
    fn exp_of_zero_is_identity() {
        let z: nd::Array2<C64> = nd::Array2::zeros((3, 3));
        assert!(close(&matrix_exp(&z).unwrap(), &nd::Array2::eye(3), 1e-14));
    }

    #[test]
    fn pauli_x_rotation() {
        let x = nd::array![
            [C64::from(0.0), C64::from(1.0)],
            [C64::from(1.0), C64::from(0.0)],
        ];
        // exp(-i pi/2 X) = -i X
        let u = propagator(&x, PI / 2.0).unwrap();
        assert!(close(&u, &(&x * -C64::i()), 1e-12));
    }

    #[test]
    fn large_norm_is_scaled() {
        let a = nd::array![
            [C64::from(20.0), C64::from(0.0)],
            [C64::from(0.0), C64::from(-20.0)],
        ];
        let e = matrix_exp(&a).unwrap();
        assert!((e[[0, 0]].re - 20.0_f64.exp()).abs() / 20.0_f64.exp() < 1e-10);
        assert!((e[[1, 1]].re - (-20.0_f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn singular_solve_fails() {
        let a: nd::Array2<C64> = nd::Array2::zeros((2, 2));
        let b: nd::Array2<C64> = nd::Array2::eye(2);
        assert!(matches!(solve(&a, &b), Err(SimError::Integration(_))));
    }

    #[test]
    fn eigh_reconstructs_hermitian() {
        let h = nd::array![
            [C64::new(2.0, 0.0), C64::new(0.5, -1.0), C64::new(0.0, 0.3)],
            [C64::new(0.5, 1.0), C64::new(-1.0, 0.0), C64::new(0.7, 0.2)],
            [C64::new(0.0, -0.3), C64::new(0.7, -0.2), C64::new(0.4, 0.0)],
        ];
        let (w, v) = eigh(&h).unwrap();
        let vd = v.t().mapv(|x| x.conj());
        assert!(close(&vd.dot(&v), &nd::Array2::eye(3), 1e-12));
        let diag: nd::Array2<C64> = nd::Array2::from_diag(&w.mapv(C64::from));
        assert!(close(&v.dot(&diag).dot(&vd), &h, 1e-12));
        let tr: f64 = w.sum();
        assert!((tr - 1.4).abs() < 1e-12);
    }

    #[test]
    fn sqrtm_squares_back() {
        let rho = nd::array![
            [C64::new(0.6, 0.0), C64::new(0.1, 0.2)],
            [C64::new(0.1, -0.2), C64::new(0.4, 0.0)],
        ];
        let r = sqrtm_psd(&rho).unwrap();
        assert!(close(&r.dot(&r), &rho, 1e-12));
    }
}
