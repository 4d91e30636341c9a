use ndarray as nd;
use num_complex::Complex64 as C64;
use proptest::prelude::*;
use pulse_sim::{
    hilbert::{ embed, identity, sigmax, sigmay, sigmaz },
    pulse::Interpolant,
    generator::merge_grids,
    Operator,
    Processor,
    Pulse,
    PulseHandle,
    SolverMode,
    SolverOptions,
    SplineKind,
    State,
};

fn local_op() -> impl Strategy<Value = Operator> {
    prop::collection::vec(-1.0..1.0_f64, 8)
        .prop_map(|v| {
            let data: nd::Array2<C64>
                = nd::Array2::from_shape_fn((2, 2), |(i, j)| {
                    C64::new(v[2 * (2 * i + j)], v[2 * (2 * i + j) + 1])
                });
            Operator::from_array(data).unwrap()
        })
}

fn unit_ket() -> impl Strategy<Value = nd::Array1<C64>> {
    prop::collection::vec(-1.0..1.0_f64, 4)
        .prop_filter("non-zero amplitude", |v| v.iter().any(|x| x.abs() > 1e-3))
        .prop_map(|v| {
            let psi: nd::Array1<C64>
                = nd::array![C64::new(v[0], v[1]), C64::new(v[2], v[3])];
            let nrm: f64 = psi.iter().map(|a| a.norm_sqr()).sum::<f64>().sqrt();
            psi / C64::from(nrm)
        })
}

#[derive(Clone, Debug)]
enum Edit {
    Add { op: usize, cyclic: bool },
    RemoveAt(usize),
    RemoveHandle(usize),
}

fn edits() -> impl Strategy<Value = Vec<Edit>> {
    let edit
        = prop_oneof![
            (0_usize..3, any::<bool>())
                .prop_map(|(op, cyclic)| Edit::Add { op, cyclic }),
            any::<usize>().prop_map(Edit::RemoveAt),
            any::<usize>().prop_map(Edit::RemoveHandle),
        ];
    prop::collection::vec(edit, 0..24)
}

fn sorted_grid() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.01..1.0_f64, 2..12)
        .prop_map(|steps| {
            steps.iter()
                .scan(0.0, |t, dt| { *t += dt; Some(*t) })
                .collect()
        })
}

proptest! {
    #[test]
    fn embed_pads_with_identity(op in local_op(), n in 1_usize..5, k in 0_usize..5) {
        let k = k % n;
        let factors: Vec<Operator>
            = (0..n).map(|j| if j == k { op.clone() } else { identity(2) })
            .collect();
        let expected = Operator::tensor_all(factors.iter()).unwrap();
        let found = embed(&op, &[k], &vec![2; n]).unwrap();
        prop_assert!(found.approx_eq(&expected, 1e-14));
    }

    #[test]
    fn interleaved_edits_restore_baseline(edits in edits()) {
        let dims = [2, 2, 2];
        let ops = [sigmax(), sigmay(), sigmaz()];
        let mut proc = Processor::new(3).unwrap();
        let base = proc.add_control(sigmaz(), Some(&[2]), false).unwrap();
        proc.add_control(sigmay(), Some(&[1]), false).unwrap();
        let before = proc.ctrls().unwrap();

        // pulses added on top of the baseline, in positional order
        let mut live: Vec<(PulseHandle, Operator)> = Vec::new();
        for edit in edits.iter() {
            match *edit {
                Edit::Add { op, cyclic } => {
                    let handles
                        = proc.add_control(ops[op].clone(), None, cyclic).unwrap();
                    let n_targets = if cyclic { dims.len() } else { 1 };
                    prop_assert_eq!(handles.len(), n_targets);
                    for (q, h) in handles.into_iter().enumerate() {
                        live.push((h, embed(&ops[op], &[q], &dims).unwrap()));
                    }
                },
                Edit::RemoveAt(k) if !live.is_empty() => {
                    let k = k % live.len();
                    let removed = proc.remove_pulse(&[before.len() + k]).unwrap();
                    let (_, op) = live.remove(k);
                    prop_assert_eq!(
                        removed[0].full_operator(&dims).unwrap(), Some(op));
                },
                Edit::RemoveHandle(k) if !live.is_empty() => {
                    let (h, _) = live.remove(k % live.len());
                    prop_assert!(proc.remove_pulse_handle(h).is_some());
                    prop_assert!(proc.remove_pulse_handle(h).is_none());
                },
                _ => { },
            }
            let expected: Vec<Operator>
                = before.iter().cloned()
                .chain(live.iter().map(|(_, op)| op.clone()))
                .collect();
            prop_assert_eq!(proc.ctrls().unwrap(), expected);
            for (j, (h, _)) in live.iter().enumerate() {
                prop_assert_eq!(proc.index_of(*h), Some(before.len() + j));
            }
        }

        let mut rest: Vec<usize>
            = (before.len()..before.len() + live.len()).collect();
        rest.rotate_left(live.len() / 2);
        let removed = proc.remove_pulse(&rest).unwrap();
        prop_assert_eq!(removed.len(), live.len());
        prop_assert_eq!(proc.ctrls().unwrap(), before);
        prop_assert_eq!(proc.index_of(base[0]), Some(0));
    }

    #[test]
    fn step_values_hold_between_points(grid in sorted_grid(), frac in 0.0..1.0_f64) {
        let coeff: Vec<f64> = (0..grid.len() - 1).map(|k| k as f64 + 0.5).collect();
        let pulse = Pulse::new(
            Some(sigmaz()), None, grid.clone(), coeff.clone(), SplineKind::Step);
        let interp: Interpolant = pulse.envelope().compile().unwrap();
        for k in 0..grid.len() - 1 {
            let t = grid[k] + frac * (grid[k + 1] - grid[k]);
            if t < grid[k + 1] {
                prop_assert_eq!(interp.eval(t), coeff[k]);
            }
        }
        prop_assert_eq!(interp.eval(grid[grid.len() - 1]), 0.0);
    }

    #[test]
    fn merged_grid_is_sorted_union(a in sorted_grid(), b in sorted_grid()) {
        let merged = merge_grids([nd::Array1::from(a.clone()), nd::Array1::from(b.clone())].iter());
        prop_assert!(merged.iter().zip(merged.iter().skip(1)).all(|(x, y)| x < y));
        for t in a.iter().chain(b.iter()) {
            prop_assert!(merged.iter().any(|m| (m - t).abs() <= 1e-12 * t.abs().max(1.0)));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn identity_evolution_preserves_state(
        psi0 in unit_ket(),
        grid in sorted_grid(),
        amps in prop::collection::vec(-5.0..5.0_f64, 12),
        mix in 0.0..0.9_f64,
    ) {
        let coeff: Vec<f64> = amps[..grid.len() - 1].to_vec();
        let mut proc = Processor::new(1).unwrap();
        proc.add_pulse(Pulse::new(
            Some(identity(2)), Some(vec![0]), grid, coeff, SplineKind::Step,
        ))
        .unwrap();
        let mut opts = SolverOptions::default();
        opts.store_final_state = true;

        let ket = State::Ket(psi0.clone());
        let res
            = proc.run_state(&ket, SolverMode::Deterministic, &opts, &[]).unwrap();
        let fid = res.final_state.unwrap().fidelity(&ket).unwrap();
        prop_assert!((fid - 1.0).abs() < 1e-9, "ket fidelity {}", fid);

        // mixture with the maximally mixed state, never pure
        let rho: nd::Array2<C64>
            = ket.to_density() * C64::from(mix)
            + nd::Array2::<C64>::eye(2) * C64::from(0.5 * (1.0 - mix));
        let rho = State::Density(rho);
        let res
            = proc.run_state(&rho, SolverMode::Deterministic, &opts, &[]).unwrap();
        let fid = res.final_state.unwrap().fidelity(&rho).unwrap();
        prop_assert!((fid - 1.0).abs() < 1e-9, "density fidelity {}", fid);
    }
}
