//! Tests for the Frequent Directions updater.
//!
//! Covers:
//! - parameter validation and data-error handling
//! - the buffer invariant under arbitrary streams
//! - rotate/shrink correctness for both shrink references and alpha extremes
//! - rank adaptation monotonicity
//! - inputs at extreme scales
//! - the low-rank scenario and merge-by-ingest accuracy

use approx::assert_relative_eq;
use quickcheck::{QuickCheck, TestResult};

use crate::linalg::{dot, rows_of, squared_norm, thin_svd};
use crate::sketch::{RANK_INCREMENT, ShrinkReference, SketchParams, SketchUpdater};
use crate::tests::{init, low_rank_rows, top_energy_share};

/// Relative residual ‖A − A·VₖVₖᵗ‖²_F / ‖A‖²_F using the sketch's top-k directions.
fn projection_error(data: &[Vec<f64>], sketch: &SketchUpdater, k: usize) -> f64 {
    let svd = thin_svd(sketch.working_matrix()).unwrap();
    let basis = &svd.right[..k.min(svd.right.len())];
    let mut residual = 0.0;
    let mut total = 0.0;
    for row in data {
        let captured: f64 = basis.iter().map(|v| dot(row, v).powi(2)).sum();
        let energy = squared_norm(row);
        residual += energy - captured;
        total += energy;
    }
    residual / total
}

// -------------------- Construction --------------------

#[test]
fn test_invalid_params_rejected() {
    assert!(SketchUpdater::new(SketchParams::new(0, 4)).is_err());
    assert!(SketchUpdater::new(SketchParams::new(4, 0)).is_err());
    assert!(SketchUpdater::new(SketchParams::new(4, 4).with_alpha(1.5)).is_err());
    assert!(SketchUpdater::new(SketchParams::new(4, 4).with_alpha(-0.1)).is_err());
}

#[test]
fn test_new_sketch_is_empty() {
    let fd = SketchUpdater::new(SketchParams::new(3, 5).with_seed(1)).unwrap();
    assert_eq!(fd.ell(), 3);
    assert_eq!(fd.m(), 6);
    assert_eq!(fd.next_zero_row(), 0);
    assert_eq!(fd.rows_incorporated(), 0);
    assert_eq!(fd.summary_rows(), vec![vec![0.0; 5]; 3]);
}

// -------------------- Data errors --------------------

#[test]
fn test_dimension_mismatch_writes_nothing() {
    let mut fd = SketchUpdater::new(SketchParams::new(2, 3).with_seed(1)).unwrap();
    let err = fd.ingest(&[vec![1.0, 2.0, 3.0], vec![1.0, 2.0]]);
    assert!(err.is_err());
    assert_eq!(fd.rows_incorporated(), 0);
    assert_eq!(fd.next_zero_row(), 0);
}

#[test]
fn test_non_finite_rows_dropped() {
    init();
    let mut fd = SketchUpdater::new(SketchParams::new(2, 2).with_seed(1)).unwrap();
    let accepted = fd
        .ingest(&[
            vec![1.0, 2.0],
            vec![f64::NAN, 1.0],
            vec![3.0, f64::INFINITY],
            vec![0.5, 0.5],
        ])
        .unwrap();
    assert_eq!(accepted, 2);
    assert_eq!(fd.rows_incorporated(), 2);
    assert_eq!(fd.summary_rows(), vec![vec![1.0, 2.0], vec![0.5, 0.5]]);
}

// -------------------- Buffer invariant --------------------

#[test]
fn test_rotation_triggered_when_buffer_full() {
    let mut fd = SketchUpdater::new(SketchParams::new(3, 4).with_seed(2)).unwrap();
    let rows = low_rank_rows(7, 4, 4, 0.1, 8);

    fd.ingest(&rows[..6]).unwrap();
    assert_eq!(fd.next_zero_row(), 6);
    assert_eq!(fd.rotations(), 0);

    fd.ingest(&rows[6..]).unwrap();
    assert_eq!(fd.rotations(), 1);
    assert_eq!(fd.next_zero_row(), 4);
}

#[test]
fn prop_buffer_invariant() {
    fn prop(ell: u8, d: u8, n: u8, seed: u64) -> TestResult {
        let ell = (ell % 6) as usize + 1;
        let d = (d % 7) as usize + 1;
        let rows = low_rank_rows(n as usize, d, d, 0.3, seed);

        let mut fd = SketchUpdater::new(SketchParams::new(ell, d).with_alpha(0.5).with_seed(seed))
            .unwrap();
        for row in rows {
            let was_full = fd.next_zero_row() == fd.m();
            let rotations = fd.rotations();
            fd.ingest(&[row]).unwrap();
            if fd.next_zero_row() > fd.m() {
                return TestResult::failed();
            }
            if was_full && fd.rotations() != rotations + 1 {
                return TestResult::failed();
            }
        }
        TestResult::passed()
    }

    QuickCheck::new()
        .tests(60)
        .quickcheck(prop as fn(u8, u8, u8, u64) -> TestResult);
}

// -------------------- Rotation --------------------

#[test]
fn test_rotation_orthogonal_and_descending() {
    init();
    let ell = 4;
    let mut fd = SketchUpdater::new(SketchParams::new(ell, 10).with_alpha(0.5).with_seed(3)).unwrap();
    fd.ingest(&low_rank_rows(2 * ell, 10, 10, 0.5, 21)).unwrap();
    fd.rotate().unwrap();

    let rows = fd.summary_rows();
    let norms: Vec<f64> = rows.iter().map(|r| squared_norm(r).sqrt()).collect();
    for w in norms.windows(2) {
        assert!(w[0] + 1e-10 >= w[1], "norms not descending: {:?}", norms);
    }
    for a in 0..ell {
        for b in (a + 1)..ell {
            let scale = (norms[a] * norms[b]).max(1.0);
            assert!(dot(&rows[a], &rows[b]).abs() <= 1e-8 * scale);
        }
    }
    assert_eq!(fd.next_zero_row(), ell);
    let buffer = rows_of(fd.working_matrix(), ell, fd.m());
    assert!(buffer.iter().all(|r| r.iter().all(|v| *v == 0.0)));
}

#[test]
fn test_alpha_zero_keeps_top_singular_values() {
    let ell = 3;
    let mut fd = SketchUpdater::new(SketchParams::new(ell, 6).with_seed(4)).unwrap();
    fd.ingest(&low_rank_rows(2 * ell, 6, 6, 0.5, 33)).unwrap();

    let before = fd.singular_values().unwrap();
    fd.rotate().unwrap();
    let after = fd.singular_values().unwrap();

    for i in 0..ell {
        assert_relative_eq!(after[i], before[i], epsilon = 1e-8);
    }
}

#[test]
fn test_full_shrink_zeroes_last_retained_row() {
    let ell = 3;
    let mut fd = SketchUpdater::new(SketchParams::new(ell, 6).with_alpha(1.0).with_seed(5)).unwrap();
    fd.ingest(&low_rank_rows(2 * ell, 6, 6, 0.5, 34)).unwrap();

    let before = fd.singular_values().unwrap();
    fd.rotate().unwrap();

    let rows = fd.summary_rows();
    assert!(squared_norm(&rows[ell - 1]) < 1e-20);
    let expected = (before[0].powi(2) - before[ell - 1].powi(2)).sqrt();
    assert_relative_eq!(squared_norm(&rows[0]).sqrt(), expected, epsilon = 1e-8);
}

#[test]
fn test_first_discarded_reference_keeps_last_row() {
    let ell = 3;
    let params = SketchParams::new(ell, 6)
        .with_alpha(1.0)
        .with_shrink_reference(ShrinkReference::FirstDiscarded)
        .with_seed(6);
    let mut fd = SketchUpdater::new(params).unwrap();
    fd.ingest(&low_rank_rows(2 * ell, 6, 6, 0.5, 35)).unwrap();

    let before = fd.singular_values().unwrap();
    fd.rotate().unwrap();

    let rows = fd.summary_rows();
    let expected = (before[ell - 1].powi(2) - before[ell].powi(2)).sqrt();
    assert_relative_eq!(squared_norm(&rows[ell - 1]).sqrt(), expected, epsilon = 1e-8);
    assert!(expected > 0.0);
}

#[test]
fn test_first_discarded_reference_without_discarded_values() {
    // d = ell: the SVD has no value past the retained block, so nothing shrinks
    let ell = 4;
    let params = SketchParams::new(ell, ell)
        .with_alpha(1.0)
        .with_shrink_reference(ShrinkReference::FirstDiscarded)
        .with_seed(12);
    let mut fd = SketchUpdater::new(params).unwrap();
    fd.ingest(&low_rank_rows(2 * ell, ell, ell, 0.5, 39)).unwrap();

    let before = fd.singular_values().unwrap();
    assert_eq!(before.len(), ell);
    fd.rotate().unwrap();

    assert_eq!(fd.next_zero_row(), ell);
    let after: Vec<f64> = fd.summary_rows().iter().map(|r| squared_norm(r).sqrt()).collect();
    for (a, b) in after.iter().zip(&before) {
        assert_relative_eq!(*a, *b, max_relative = 1e-8);
    }
}

#[test]
fn test_tiny_rows_survive_rotation() {
    init();
    let ell = 4;
    let rows = low_rank_rows(9, 6, 6, 0.5, 40);
    let params = SketchParams::new(ell, 6).with_alpha(0.5).with_seed(14);

    let mut unit = SketchUpdater::new(params.clone()).unwrap();
    unit.ingest(&rows).unwrap();
    let expected = unit.singular_values().unwrap();

    for scale in [1e-20, 1e-60] {
        let tiny: Vec<Vec<f64>> = rows
            .iter()
            .map(|r| r.iter().map(|v| v * scale).collect())
            .collect();
        let mut fd = SketchUpdater::new(params.clone()).unwrap();
        fd.ingest(&tiny).unwrap();

        assert_eq!(fd.rotations(), 1);
        assert_eq!(fd.next_zero_row(), unit.next_zero_row(), "scale {:e}", scale);
        let sv = fd.singular_values().unwrap();
        assert!(sv[0] > 0.0, "scale {:e}: leading singular value vanished", scale);
        assert_relative_eq!(sv[0], expected[0] * scale, max_relative = 1e-6);
    }
}

#[test]
fn test_rank_deficient_rotation_keeps_rank_rows() {
    // d = 3 < ell = 5: at most three directions exist
    let mut fd = SketchUpdater::new(SketchParams::new(5, 3).with_alpha(1.0).with_seed(7)).unwrap();
    fd.ingest(&low_rank_rows(10, 3, 3, 0.2, 36)).unwrap();
    fd.rotate().unwrap();

    assert_eq!(fd.next_zero_row(), 3);
    let rows = fd.summary_rows();
    assert!(rows[..3].iter().all(|r| squared_norm(r) > 0.0));
    assert!(rows[3..].iter().all(|r| squared_norm(r) == 0.0));

    // buffer accepts more than ell rows before the next rotation
    fd.ingest(&low_rank_rows(7, 3, 3, 0.2, 37)).unwrap();
    assert_eq!(fd.rotations(), 1);
    assert_eq!(fd.next_zero_row(), 10);
}

#[test]
fn test_flush_folds_buffer() {
    let mut fd = SketchUpdater::new(SketchParams::new(4, 5).with_seed(8)).unwrap();
    fd.ingest(&low_rank_rows(6, 5, 5, 0.5, 38)).unwrap();
    assert_eq!(fd.next_zero_row(), 6);

    fd.flush().unwrap();
    assert!(fd.next_zero_row() <= fd.ell());
    assert_eq!(fd.rotations(), 1);

    // nothing buffered beyond ell: no-op
    fd.flush().unwrap();
    assert_eq!(fd.rotations(), 1);
}

// -------------------- Rank adaptation --------------------

#[test]
fn test_rank_adaptation_monotonic() {
    init();
    let params = SketchParams::new(5, 60).with_alpha(0.2).with_rank_adapt(true).with_seed(9);
    let mut fd = SketchUpdater::new(params).unwrap();

    let mut history = vec![fd.ell()];
    for batch in 0..4 {
        fd.ingest(&low_rank_rows(100, 60, 60, 1.0, 100 + batch)).unwrap();
        history.push(fd.ell());
    }

    for w in history.windows(2) {
        assert!(w[1] >= w[0], "ell decreased: {:?}", history);
        assert_eq!((w[1] - w[0]) % RANK_INCREMENT, 0);
    }
    assert!(fd.ell() > 5, "full-rank data should force growth: {:?}", history);
    assert_eq!(fd.m(), 2 * fd.ell());
}

#[test]
fn test_rank_adaptation_needs_enough_pending_rows() {
    let params = SketchParams::new(5, 60).with_rank_adapt(true).with_seed(10);
    let mut fd = SketchUpdater::new(params).unwrap();

    // batches never exceed ell + 15 rows, so growth is never allowed
    for batch in 0..20 {
        fd.ingest(&low_rank_rows(20, 60, 60, 1.0, 200 + batch)).unwrap();
    }
    assert_eq!(fd.ell(), 5);
    assert!(!fd.growth_pending());
}

#[test]
fn test_rank_adaptation_disabled_keeps_ell() {
    let mut fd = SketchUpdater::new(SketchParams::new(5, 60).with_seed(11)).unwrap();
    fd.ingest(&low_rank_rows(300, 60, 60, 1.0, 300)).unwrap();
    assert_eq!(fd.ell(), 5);
}

#[test]
fn test_error_estimate_small_for_captured_data() {
    let mut fd = SketchUpdater::new(SketchParams::new(6, 12).with_seed(12)).unwrap();
    let rows = low_rank_rows(12, 12, 2, 0.0, 40);
    fd.ingest(&rows).unwrap();
    fd.rotate().unwrap();

    let err = fd.reconstruction_error_estimate(&rows).unwrap();
    assert!(err < 1e-6, "error {}", err);
    assert_eq!(fd.reconstruction_error_estimate(&[]).unwrap(), 0.0);
}

// -------------------- Scenarios --------------------

#[test]
fn test_low_rank_scenario_energy_share() {
    init();
    let rows = low_rank_rows(100, 8, 3, 0.05, 2024);
    let mut fd = SketchUpdater::new(SketchParams::new(5, 8).with_seed(13)).unwrap();
    fd.ingest(&rows).unwrap();
    fd.flush().unwrap();

    let share = top_energy_share(&fd.singular_values().unwrap(), 3);
    assert!(share > 0.95, "top-3 energy share {}", share);
    assert_eq!(fd.rows_incorporated(), 100);
}

#[test]
fn prop_merge_by_ingest_matches_direct() {
    fn prop(n: u8, d: u8, ell: u8, seed: u64) -> TestResult {
        let ell = (ell % 5) as usize + 4;
        let d = (d % 11) as usize + 6;
        let n = (n % 121) as usize + 40;
        let split = 1 + (seed % (n as u64 - 1)) as usize;
        let rows = low_rank_rows(n, d, 2, 0.1, seed);

        let params = SketchParams::new(ell, d).with_alpha(0.2).with_seed(seed);
        let sketch_of = |part: &[Vec<f64>]| -> SketchUpdater {
            let mut fd = SketchUpdater::new(params.clone()).unwrap();
            fd.ingest(part).unwrap();
            fd.flush().unwrap();
            fd
        };

        let direct = sketch_of(&rows);
        let mut left = sketch_of(&rows[..split]);
        let right = sketch_of(&rows[split..]);
        left.ingest_matrix(&right.summary()).unwrap();
        left.flush().unwrap();

        let e_direct = projection_error(&rows, &direct, 2);
        let e_merged = projection_error(&rows, &left, 2);
        if (e_direct - e_merged).abs() < 0.01 {
            TestResult::passed()
        } else {
            TestResult::error(format!(
                "n={} d={} ell={} split={}: direct {} vs merged {}",
                n, d, ell, split, e_direct, e_merged
            ))
        }
    }

    QuickCheck::new()
        .tests(40)
        .quickcheck(prop as fn(u8, u8, u8, u64) -> TestResult);
}
