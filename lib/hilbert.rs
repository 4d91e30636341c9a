//! Operators and states on composite Hilbert spaces built from finite-level
//! subsystems.
//!
//! Subsystem `0` is the most significant factor in every tensor product, so
//! the composite basis index of `|a_0 a_1 ... a_{N-1}>` is
//! `sum_k a_k * prod_{j > k} d_j`.

use std::ops::Deref;
use itertools::Itertools;
use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::{ One, Zero };
use rustc_hash::FxHashSet as HashSet;
use crate::{
    error::{ SimError, SimResult },
    linalg::{ eigh, sqrtm_psd },
};

/* Operators ******************************************************************/

/// A square complex matrix tagged with the dimensions of the subsystems it
/// acts on.
///
/// The product of `dims` always equals the matrix size; every constructor
/// checks this.
#[derive(Clone, Debug, PartialEq)]
pub struct Operator {
    data: nd::Array2<C64>,
    dims: Vec<usize>,
}

impl Deref for Operator {
    type Target = nd::Array2<C64>;

    fn deref(&self) -> &Self::Target { &self.data }
}

impl AsRef<nd::Array2<C64>> for Operator {
    fn as_ref(&self) -> &nd::Array2<C64> { &self.data }
}

impl Operator {
    /// Create a new `Operator`, checking that `data` is square with size equal
    /// to the product of `dims`.
    pub fn new(data: nd::Array2<C64>, dims: Vec<usize>) -> SimResult<Self> {
        let (n, m) = data.dim();
        if n != m {
            return Err(SimError::dims("Operator::new", (n, n), (n, m)));
        }
        if dims.is_empty() || dims.iter().any(|d| *d == 0) {
            return Err(SimError::dims("Operator::new", "non-zero dims", &dims));
        }
        let size: usize = dims.iter().product();
        if size != n {
            return Err(SimError::dims("Operator::new", size, n));
        }
        Ok(Self { data, dims })
    }

    /// Create a new single-subsystem `Operator` from a square array.
    pub fn from_array(data: nd::Array2<C64>) -> SimResult<Self> {
        let n = data.nrows();
        Self::new(data, vec![n])
    }

    /// Create a new `Operator` from complex row-major entries.
    ///
    /// *Panics* if `entries.len()` is not the square of the product of `dims`.
    pub(crate) fn from_entries(dims: &[usize], entries: Vec<C64>) -> Self {
        let n: usize = dims.iter().product();
        let data
            = nd::Array2::from_shape_vec((n, n), entries)
            .expect("Operator::from_entries: bad entry count");
        Self { data, dims: dims.to_vec() }
    }

    /// Create a new `Operator` from real row-major entries.
    pub(crate) fn from_real(dims: &[usize], entries: &[f64]) -> Self {
        Self::from_entries(dims, entries.iter().map(|x| C64::from(*x)).collect())
    }

    /// The zero operator on a space with subsystem dimensions `dims`.
    pub fn zeros(dims: &[usize]) -> Self {
        let n: usize = dims.iter().product();
        Self { data: nd::Array2::zeros((n, n)), dims: dims.to_vec() }
    }

    /// The identity operator on a space with subsystem dimensions `dims`.
    pub fn eye(dims: &[usize]) -> Self {
        let n: usize = dims.iter().product();
        Self { data: nd::Array2::eye(n), dims: dims.to_vec() }
    }

    /// Return a reference to the underlying matrix.
    pub fn data(&self) -> &nd::Array2<C64> { &self.data }

    /// Consume `self`, returning the underlying matrix.
    pub fn into_data(self) -> nd::Array2<C64> { self.data }

    /// Return the subsystem dimensions.
    pub fn dims(&self) -> &[usize] { &self.dims }

    /// Return the size of the (square) matrix.
    pub fn size(&self) -> usize { self.data.nrows() }

    /// Hermitian adjoint.
    pub fn dag(&self) -> Self {
        Self {
            data: self.data.t().mapv(|a| a.conj()),
            dims: self.dims.clone(),
        }
    }

    fn check_same(&self, other: &Self, context: &str) -> SimResult<()> {
        if self.dims != other.dims {
            Err(SimError::dims(context, &self.dims, &other.dims))
        } else {
            Ok(())
        }
    }

    /// Matrix product `self * other`.
    pub fn dot(&self, other: &Self) -> SimResult<Self> {
        self.check_same(other, "Operator::dot")?;
        Ok(Self { data: self.data.dot(&other.data), dims: self.dims.clone() })
    }

    /// Sum `self + other`.
    pub fn add(&self, other: &Self) -> SimResult<Self> {
        self.check_same(other, "Operator::add")?;
        Ok(Self { data: &self.data + &other.data, dims: self.dims.clone() })
    }

    /// Difference `self - other`.
    pub fn sub(&self, other: &Self) -> SimResult<Self> {
        self.check_same(other, "Operator::sub")?;
        Ok(Self { data: &self.data - &other.data, dims: self.dims.clone() })
    }

    /// Multiply by a scalar.
    pub fn scale<A>(&self, a: A) -> Self
    where A: Into<C64>
    {
        let a: C64 = a.into();
        Self { data: &self.data * a, dims: self.dims.clone() }
    }

    /// Tensor product `self ⊗ other`; subsystem dimensions are concatenated.
    pub fn tensor(&self, other: &Self) -> Self {
        let data = nd::linalg::kron(&self.data, &other.data);
        let dims
            = self.dims.iter().chain(other.dims.iter()).copied().collect();
        Self { data, dims }
    }

    /// Tensor product of a sequence of operators, in order.
    pub fn tensor_all<'a, I>(ops: I) -> SimResult<Self>
    where I: IntoIterator<Item = &'a Operator>
    {
        let mut iter = ops.into_iter();
        let first
            = iter.next()
            .ok_or_else(|| {
                SimError::dims("Operator::tensor_all", "at least one", 0)
            })?
            .clone();
        Ok(iter.fold(first, |acc, op| acc.tensor(op)))
    }

    /// Return `true` if all elements of `self - other` are within `tol` and
    /// the dimension structures match.
    pub fn approx_eq(&self, other: &Self, tol: f64) -> bool {
        self.dims == other.dims
            && self.data.iter().zip(other.data.iter())
                .all(|(a, b)| (a - b).norm() <= tol)
    }

    /// Return `true` if `self` is Hermitian to within `tol`.
    pub fn is_hermitian(&self, tol: f64) -> bool {
        self.data.indexed_iter()
            .all(|((i, j), a)| (a - self.data[[j, i]].conj()).norm() <= tol)
    }
}

/// Compute the commutator `[A, B] = A B - B A`.
pub fn commutator<SA, SB>(
    A: &nd::ArrayBase<SA, nd::Ix2>,
    B: &nd::ArrayBase<SB, nd::Ix2>,
) -> nd::Array2<C64>
where
    SA: nd::Data<Elem = C64>,
    SB: nd::Data<Elem = C64>,
{
    A.dot(B) - B.dot(A)
}

/// Compute the anti-commutator `{A, B} = A B + B A`.
pub fn anti_commutator<SA, SB>(
    A: &nd::ArrayBase<SA, nd::Ix2>,
    B: &nd::ArrayBase<SB, nd::Ix2>,
) -> nd::Array2<C64>
where
    SA: nd::Data<Elem = C64>,
    SB: nd::Data<Elem = C64>,
{
    A.dot(B) + B.dot(A)
}

/* Embedding ******************************************************************/

fn strides(dims: &[usize]) -> Vec<usize> {
    (0..dims.len())
        .map(|k| dims[k + 1..].iter().product())
        .collect()
}

/// Place `local`, acting on the subsystems `targets` (in the given order),
/// into the composite space described by `full_dims`, with identity on every
/// other subsystem.
///
/// The first entry of `targets` is the most significant factor of `local`;
/// targets need not be contiguous or sorted. Fails if a target is out of range
/// or repeated, or if the size of `local` is not the product of the target
/// dimensions.
pub fn embed(local: &Operator, targets: &[usize], full_dims: &[usize])
    -> SimResult<Operator>
{
    if targets.is_empty() {
        return Err(SimError::dims("embed", "at least one target", targets));
    }
    let mut seen: HashSet<usize> = HashSet::default();
    for &k in targets.iter() {
        if k >= full_dims.len() || !seen.insert(k) {
            return Err(SimError::dims(
                "embed: targets",
                format!("distinct indices < {}", full_dims.len()),
                targets,
            ));
        }
    }
    let target_dims: Vec<usize>
        = targets.iter().map(|&k| full_dims[k]).collect();
    let d_loc: usize = target_dims.iter().product();
    if local.size() != d_loc {
        return Err(SimError::dims("embed", &target_dims, local.dims()));
    }

    let n: usize = full_dims.iter().product();
    let st = strides(full_dims);
    let digit = |idx: usize, k: usize| (idx / st[k]) % full_dims[k];
    let mut data: nd::Array2<C64> = nd::Array2::zeros((n, n));
    let mut base: usize;
    let mut r_loc: usize;
    let mut col: usize;
    let mut rem: usize;
    for row in 0..n {
        r_loc = 0;
        base = row;
        for &k in targets.iter() {
            r_loc = r_loc * full_dims[k] + digit(row, k);
            base -= digit(row, k) * st[k];
        }
        for c_loc in 0..d_loc {
            let a = local.data[[r_loc, c_loc]];
            if a.is_zero() { continue; }
            col = base;
            rem = c_loc;
            for (&k, &d) in targets.iter().zip(target_dims.iter()).rev() {
                col += (rem % d) * st[k];
                rem /= d;
            }
            data[[row, col]] = a;
        }
    }
    Ok(Operator { data, dims: full_dims.to_vec() })
}

/// Enumerate every rotation of `base_targets` along a chain of
/// `full_dims.len()` subsystems, shifting by multiples of `stride`.
///
/// A `stride` of zero is treated as one. The unshifted pattern always comes
/// first.
pub fn cyclic_targets(base_targets: &[usize], full_dims: &[usize], stride: usize)
    -> Vec<Vec<usize>>
{
    let n = full_dims.len();
    if n == 0 { return Vec::new(); }
    (0..n).step_by(stride.max(1))
        .map(|shift| {
            base_targets.iter().map(|t| (t + shift) % n).collect()
        })
        .collect()
}

/// Embed `local` on every rotation of `base_targets` given by
/// [`cyclic_targets`].
pub fn expand_cyclic(
    local: &Operator,
    base_targets: &[usize],
    full_dims: &[usize],
    stride: usize,
) -> SimResult<Vec<(Vec<usize>, Operator)>>
{
    cyclic_targets(base_targets, full_dims, stride).into_iter()
        .map(|targets| {
            embed(local, &targets, full_dims).map(|op| (targets, op))
        })
        .collect()
}

/* Standard operators *********************************************************/

/// Pauli X.
pub fn sigmax() -> Operator {
    Operator::from_real(&[2], &[0.0, 1.0, 1.0, 0.0])
}

/// Pauli Y.
pub fn sigmay() -> Operator {
    let i = C64::i();
    Operator {
        data: nd::array![[C64::zero(), -i], [i, C64::zero()]],
        dims: vec![2],
    }
}

/// Pauli Z, with `|0>` as the `+1` eigenstate.
pub fn sigmaz() -> Operator {
    Operator::from_real(&[2], &[1.0, 0.0, 0.0, -1.0])
}

/// Identity on an `n`-level system.
pub fn identity(n: usize) -> Operator { Operator::eye(&[n]) }

/// Lowering operator on an `n`-level system.
pub fn destroy(n: usize) -> Operator {
    let mut data: nd::Array2<C64> = nd::Array2::zeros((n, n));
    for k in 1..n {
        data[[k - 1, k]] = C64::from((k as f64).sqrt());
    }
    Operator { data, dims: vec![n] }
}

/// Raising operator on an `n`-level system.
pub fn create(n: usize) -> Operator { destroy(n).dag() }

/// Number operator on an `n`-level system.
pub fn num(n: usize) -> Operator {
    let diag: nd::Array1<C64> = (0..n).map(|k| C64::from(k as f64)).collect();
    Operator { data: nd::Array2::from_diag(&diag), dims: vec![n] }
}

/// The `k`-th basis vector of an `n`-level system.
pub fn basis(n: usize, k: usize) -> SimResult<nd::Array1<C64>> {
    if k >= n {
        return Err(SimError::InvalidState(
            format!("basis index {} out of range for dimension {}", k, n)));
    }
    Ok((0..n).map(|j| if j == k { C64::one() } else { C64::zero() }).collect())
}

/// Tensor product of a sequence of state vectors.
pub fn tensor_kets<'a, I>(kets: I) -> nd::Array1<C64>
where I: IntoIterator<Item = &'a nd::Array1<C64>>
{
    kets.into_iter()
        .fold(nd::array![C64::one()], |acc, k| {
            acc.iter().cartesian_product(k.iter())
                .map(|(a, b)| *a * *b)
                .collect()
        })
}

/// Compute the outer product `|a><b|` of two state vectors.
pub fn outer_prod(a: &nd::Array1<C64>, b: &nd::Array1<C64>)
    -> nd::Array2<C64>
{
    let na = a.len();
    let nb = b.len();
    let elems: Vec<C64>
        = a.iter().cartesian_product(b)
        .map(|(ai, bj)| *ai * bj.conj())
        .collect();
    nd::Array2::from_shape_vec((na, nb), elems)
        .expect("outer_prod: shape is na x nb by construction")
}

/* States *********************************************************************/

/// A quantum state over a composite space, either pure or mixed.
#[derive(Clone, Debug, PartialEq)]
pub enum State {
    /// Pure state vector.
    Ket(nd::Array1<C64>),
    /// Density matrix.
    Density(nd::Array2<C64>),
}

impl From<nd::Array1<C64>> for State {
    fn from(psi: nd::Array1<C64>) -> Self { Self::Ket(psi) }
}

impl From<nd::Array2<C64>> for State {
    fn from(rho: nd::Array2<C64>) -> Self { Self::Density(rho) }
}

fn vdot(a: &nd::Array1<C64>, b: &nd::Array1<C64>) -> C64 {
    a.iter().zip(b).map(|(x, y)| x.conj() * y).sum()
}

// recover a pure-state vector from a density matrix, if it is (close to) pure
fn pure_vector(rho: &nd::Array2<C64>) -> Option<nd::Array1<C64>> {
    let tr: f64 = rho.diag().iter().map(|p| p.re).sum();
    let purity: f64 = rho.dot(rho).diag().iter().map(|p| p.re).sum();
    if tr <= 0.0 || (purity - tr * tr).abs() > 1e-9 * tr * tr { return None; }
    let (k, pkk)
        = rho.diag().iter().map(|p| p.re).enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))?;
    if pkk <= 0.0 { return None; }
    let psi = rho.column(k).mapv(|a| a / (pkk * tr).sqrt());
    Some(psi)
}

// Uhlmann fidelity between two density matrices
fn uhlmann(rho: &nd::Array2<C64>, sigma: &nd::Array2<C64>) -> SimResult<f64> {
    let sr = sqrtm_psd(rho)?;
    let (w, _) = eigh(&sr.dot(sigma).dot(&sr))?;
    Ok(w.iter().map(|l| l.max(0.0).sqrt()).sum())
}

impl State {
    /// Dimension of the underlying Hilbert space.
    pub fn dim(&self) -> usize {
        match self {
            Self::Ket(psi) => psi.len(),
            Self::Density(rho) => rho.nrows(),
        }
    }

    /// Return `true` for [`Self::Ket`].
    pub fn is_ket(&self) -> bool { matches!(self, Self::Ket(_)) }

    /// Return the state vector, if pure.
    pub fn as_ket(&self) -> Option<&nd::Array1<C64>> {
        match self {
            Self::Ket(psi) => Some(psi),
            Self::Density(_) => None,
        }
    }

    /// Return the density-matrix representation.
    pub fn to_density(&self) -> nd::Array2<C64> {
        match self {
            Self::Ket(psi) => outer_prod(psi, psi),
            Self::Density(rho) => rho.clone(),
        }
    }

    /// Check that the state is square/consistent and has dimension `n`.
    pub fn check_dim(&self, n: usize, context: &str) -> SimResult<()> {
        if let Self::Density(rho) = self {
            if !rho.is_square() {
                return Err(SimError::dims(context, "square", rho.dim()));
            }
        }
        if self.dim() != n {
            return Err(SimError::dims(context, n, self.dim()));
        }
        Ok(())
    }

    /// Expectation value of `op`, real part.
    ///
    /// State vectors are normalized before evaluation; density matrices are
    /// used as given (`Tr[op rho]`).
    pub fn expect(&self, op: &Operator) -> SimResult<f64> {
        self.check_dim(op.size(), "State::expect")?;
        match self {
            Self::Ket(psi) => {
                let nrm = vdot(psi, psi).re;
                if nrm <= 0.0 {
                    return Err(SimError::InvalidState("zero norm".into()));
                }
                Ok(vdot(psi, &op.data().dot(psi)).re / nrm)
            },
            Self::Density(rho) => {
                Ok(op.data().dot(rho).diag().iter().map(|a| a.re).sum())
            },
        }
    }

    /// State fidelity: `|<a|b>|` for two pure states, `sqrt(<psi|rho|psi>)`
    /// for a pure state against a density matrix, and
    /// `Tr sqrt(sqrt(rho) sigma sqrt(rho))` for two mixed states.
    pub fn fidelity(&self, other: &State) -> SimResult<f64> {
        self.check_dim(other.dim(), "State::fidelity")?;
        fn normed(psi: &nd::Array1<C64>) -> SimResult<nd::Array1<C64>> {
            let nrm = vdot(psi, psi).re.sqrt();
            if nrm <= 0.0 {
                return Err(SimError::InvalidState("zero norm".into()));
            }
            Ok(psi / C64::from(nrm))
        }
        fn ket_rho(psi: &nd::Array1<C64>, rho: &nd::Array2<C64>)
            -> SimResult<f64>
        {
            let psi = normed(psi)?;
            Ok(vdot(&psi, &rho.dot(&psi)).re.max(0.0).sqrt())
        }
        match (self, other) {
            (Self::Ket(a), Self::Ket(b)) => {
                Ok(vdot(&normed(a)?, &normed(b)?).norm())
            },
            (Self::Ket(psi), Self::Density(rho))
            | (Self::Density(rho), Self::Ket(psi)) => ket_rho(psi, rho),
            (Self::Density(a), Self::Density(b)) => {
                if let Some(psi) = pure_vector(a) {
                    ket_rho(&psi, b)
                } else if let Some(psi) = pure_vector(b) {
                    ket_rho(&psi, a)
                } else {
                    uhlmann(a, b)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(x: f64) -> C64 { C64::from(x) }

    #[test]
    fn embed_single_target_matches_kron() {
        let dims = [2, 3, 2];
        let a = destroy(3);
        let full = embed(&a, &[1], &dims).unwrap();
        let expected = identity(2).tensor(&a).tensor(&identity(2));
        assert!(full.approx_eq(&expected, 1e-14));
    }

    #[test]
    fn embed_reversed_targets_swaps_factors() {
        let dims = [2, 2];
        let op = sigmax().tensor(&sigmaz());
        let swapped = embed(&op, &[1, 0], &dims).unwrap();
        let expected = sigmaz().tensor(&sigmax());
        assert!(swapped.approx_eq(&expected, 1e-14));
    }

    #[test]
    fn embed_rejects_wrong_size() {
        let err = embed(&destroy(3), &[0], &[2, 2]).unwrap_err();
        assert!(matches!(err, SimError::DimensionMismatch { .. }));
        let err = embed(&sigmax(), &[2], &[2, 2]).unwrap_err();
        assert!(matches!(err, SimError::DimensionMismatch { .. }));
        let err = embed(&sigmax().tensor(&sigmax()), &[0, 0], &[2, 2])
            .unwrap_err();
        assert!(matches!(err, SimError::DimensionMismatch { .. }));
    }

    #[test]
    fn cyclic_targets_rotate() {
        assert_eq!(
            cyclic_targets(&[0, 1], &[2, 2, 2], 1),
            vec![vec![0, 1], vec![1, 2], vec![2, 0]],
        );
        assert_eq!(
            cyclic_targets(&[0], &[2, 2, 2, 2], 2),
            vec![vec![0], vec![2]],
        );
    }

    #[test]
    fn operator_new_checks_dims() {
        let data: nd::Array2<C64> = nd::Array2::eye(4);
        assert!(Operator::new(data.clone(), vec![2, 2]).is_ok());
        assert!(Operator::new(data, vec![2, 3]).is_err());
    }

    #[test]
    fn ladder_operators() {
        let a = destroy(3);
        let n = create(3).dot(&a).unwrap();
        assert!(n.approx_eq(&num(3), 1e-14));
        assert_eq!(a.data()[[1, 2]], c(2.0_f64.sqrt()));
    }

    #[test]
    fn fidelity_variants() {
        let zero = State::Ket(basis(2, 0).unwrap());
        let one = State::Ket(basis(2, 1).unwrap());
        assert!((zero.fidelity(&zero).unwrap() - 1.0).abs() < 1e-14);
        assert!(zero.fidelity(&one).unwrap().abs() < 1e-14);
        let mixed = State::Density(nd::Array2::eye(2) * c(0.5));
        let f = zero.fidelity(&mixed).unwrap();
        assert!((f - 0.5_f64.sqrt()).abs() < 1e-14);
        let pure_rho = State::Density(zero.to_density());
        assert!((pure_rho.fidelity(&mixed).unwrap() - f).abs() < 1e-12);
        assert!((mixed.fidelity(&mixed).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn fidelity_between_mixed_states() {
        let diag = |p: f64| State::Density(nd::array![[c(p), c(0.0)], [c(0.0), c(1.0 - p)]]);
        let f = diag(0.75).fidelity(&diag(0.25)).unwrap();
        assert!((f - 0.75_f64.sqrt()).abs() < 1e-12);
        let f = diag(0.7).fidelity(&diag(0.7)).unwrap();
        assert!((f - 1.0).abs() < 1e-12);

        // 0.5 (I + 0.6 Y), eigenvalues 0.8 and 0.2
        let tilted = State::Density(nd::array![
            [c(0.5), C64::new(0.0, -0.3)],
            [C64::new(0.0, 0.3), c(0.5)],
        ]);
        let maximal = State::Density(nd::Array2::eye(2) * c(0.5));
        let f = maximal.fidelity(&tilted).unwrap();
        assert!((f - (0.4_f64.sqrt() + 0.1_f64.sqrt())).abs() < 1e-12);
        let ab = diag(0.7).fidelity(&tilted).unwrap();
        let ba = tilted.fidelity(&diag(0.7)).unwrap();
        assert!((ab - ba).abs() < 1e-12);
        assert!((ab - 0.930_916_782_315_405).abs() < 1e-9);
    }

    #[test]
    fn basis_rejects_out_of_range() {
        assert!(matches!(basis(2, 2), Err(SimError::InvalidState(_))));
        assert_eq!(basis(3, 2).unwrap()[2], C64::one());
    }

    #[test]
    fn expectation_values() {
        let plus = State::Ket(nd::array![c(1.0), c(1.0)]);
        assert!((plus.expect(&sigmax()).unwrap() - 1.0).abs() < 1e-14);
        let rho = State::Density(State::Ket(basis(2, 1).unwrap()).to_density());
        assert!((rho.expect(&sigmaz()).unwrap() + 1.0).abs() < 1e-14);
    }
}
