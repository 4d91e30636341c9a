//! Standard qubit gate matrices.
//!
//! Qubit `0` is the most significant factor, so `|q_0 q_1 ...>` has basis
//! index `q_0 2^(n-1) + q_1 2^(n-2) + ...`.

use std::f64::consts::FRAC_1_SQRT_2;
use num_complex::Complex64 as C64;
use num_traits::{ One, Zero };
use crate::hilbert::Operator;

// permutation matrix sending basis state `k` to `perm(k)`
fn permutation<F>(n_qubits: usize, perm: F) -> Operator
where F: Fn(usize) -> usize
{
    let n = 1 << n_qubits;
    let mut entries: Vec<C64> = vec![C64::zero(); n * n];
    for k in 0..n {
        entries[perm(k) * n + k] = C64::one();
    }
    Operator::from_entries(&vec![2; n_qubits], entries)
}

/// Controlled NOT, control on qubit 0.
pub fn cnot() -> Operator {
    permutation(2, |k| if k & 0b10 != 0 { k ^ 0b01 } else { k })
}

/// Hadamard.
pub fn snot() -> Operator {
    let h = FRAC_1_SQRT_2;
    Operator::from_real(&[2], &[h, h, h, -h])
}

/// iSWAP: swaps `|01>` and `|10>` with a phase of `i`.
pub fn iswap() -> Operator {
    let (o, l, i) = (C64::zero(), C64::one(), C64::i());
    Operator::from_entries(
        &[2, 2],
        vec![
            l, o, o, o,
            o, o, i, o,
            o, i, o, o,
            o, o, o, l,
        ],
    )
}

/// Controlled SWAP, control on qubit 0.
pub fn fredkin() -> Operator {
    permutation(3, |k| match k { 0b101 => 0b110, 0b110 => 0b101, _ => k })
}

/// Doubly-controlled NOT: flips qubit 2 iff qubits 0 and 1 are both `1`.
pub fn toffoli() -> Operator {
    permutation(3, |k| if k & 0b110 == 0b110 { k ^ 0b001 } else { k })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hilbert::{ State, basis, tensor_kets };

    fn ket(bits: &[usize]) -> ndarray::Array1<C64> {
        let kets: Vec<_> = bits.iter().map(|&b| basis(2, b).unwrap()).collect();
        tensor_kets(kets.iter())
    }

    #[test]
    fn toffoli_truth_table() {
        let u = toffoli();
        for a in 0..2 {
            for b in 0..2 {
                for c in 0..2 {
                    let out = u.data().dot(&ket(&[a, b, c]));
                    let expected = ket(&[a, b, c ^ (a & b)]);
                    let fid = State::Ket(out).fidelity(&State::Ket(expected)).unwrap();
                    assert!((fid - 1.0).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn fredkin_swaps_targets() {
        let out = fredkin().data().dot(&ket(&[1, 0, 1]));
        assert_eq!(out, ket(&[1, 1, 0]));
        let out = fredkin().data().dot(&ket(&[0, 0, 1]));
        assert_eq!(out, ket(&[0, 0, 1]));
    }

    #[test]
    fn unitary() {
        for u in [cnot(), snot(), iswap(), fredkin(), toffoli()] {
            let uu = u.dag().dot(&u).unwrap();
            assert!(uu.approx_eq(&Operator::eye(u.dims()), 1e-12));
        }
    }

    #[test]
    fn cnot_flips_target() {
        assert_eq!(cnot().data().dot(&ket(&[1, 0])), ket(&[1, 1]));
        assert_eq!(cnot().data().dot(&ket(&[0, 1])), ket(&[0, 1]));
    }
}
