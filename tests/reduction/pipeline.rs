use super::helpers::{run_on_grid, MatrixSource, UnitSource};
use hapod::{binary_tree_hapod, broadcast_modes, ChunkPlan, HapodConfig, SlotSpec};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[tokio::test]
async fn test_four_ranks_two_slots_exact_recovery() {
    // Every rank streams the unit vectors e_0..e_19 in 4 chunks of 5, so
    // each direction occurs 4 times across the group and the final basis
    // must hold exactly 20 modes with singular value 2.
    let reports = run_on_grid(1, 4, |grid| async move {
        let source = UnitSource::new(2, 24);
        let plan = ChunkPlan::new(19.0, 1.0, 5).unwrap();
        let specs = [
            SlotSpec::new(1e-3),
            SlotSpec::new(1e-3).with_omega(1.0),
        ];
        binary_tree_hapod(&grid, source, plan, &specs, &HapodConfig::default())
            .await
            .unwrap()
    })
    .await;

    assert_eq!(reports.len(), 4);

    // Slot 0 finishes on rank 0, slot 1 on rank 1 (rotating roots).
    let basis0 = reports[0].slots[0].basis.as_ref().unwrap();
    assert_eq!(basis0.len(), 20);
    for s in basis0.svals.iter() {
        assert!((s - 2.0).abs() < 1e-9, "singular value {s} should be 2");
    }
    assert!(reports[1].slots[0].basis.is_none());
    assert!(reports[0].slots[1].basis.is_none());
    let basis1 = reports[1].slots[1].basis.as_ref().unwrap();
    assert_eq!(basis1.len(), 20);

    assert_eq!(reports[0].slots[0].total_num_snapshots, 80);
    assert_eq!(reports[1].slots[0].total_num_snapshots, 0);

    // The basis is orthonormal and spans every streamed direction.
    let gram = basis0.modes.dot(&basis0.modes.t());
    for i in 0..20 {
        for j in 0..20 {
            let target = if i == j { 1.0 } else { 0.0 };
            assert!((gram[[i, j]] - target).abs() < 1e-10);
        }
    }
    for k in [0usize, 7, 19] {
        let mut v = Array1::<f64>::zeros(24);
        v[k] = 1.0;
        let coeffs = basis0.modes.dot(&v);
        let recon = basis0.modes.t().dot(&coeffs);
        let residual: f64 = (&v - &recon).iter().map(|x| x * x).sum();
        assert!(residual < 1e-18, "direction {k} not captured: {residual}");
    }

    // Stats land on world rank 0 for every slot, nowhere else.
    let stats0 = reports[0].slots[0].stats.as_ref().unwrap();
    assert_eq!(stats0.total_num_snapshots, 80);
    assert_eq!(stats0.num_modes, 20);
    assert_eq!(stats0.max_local_modes, 20);
    // Largest merge input: 15 carried modes plus 4 ranks x 5 vectors.
    assert_eq!(stats0.max_vectors_before_pod, 35);

    let stats1 = reports[0].slots[1].stats.as_ref().unwrap();
    assert_eq!(stats1.num_modes, 20);
    // Slot 1's merges run on rank 1, so this maximum reaches rank 0 only
    // through the stats gather.
    assert_eq!(stats1.max_vectors_before_pod, 35);
    assert!(reports[2].slots[0].stats.is_none());
    assert!(reports[1].slots[1].stats.is_none());
}

#[tokio::test]
async fn test_damped_stream_truncates_within_budget() {
    // Step k carries weight 0.9^k, so trailing directions are cheap enough
    // to shed. The discarded mass must stay below N * epsilon^2.
    let epsilon = 0.1;
    let results = run_on_grid(1, 4, move |grid| async move {
        let source = UnitSource::damped(1, 24, 0.9);
        let plan = ChunkPlan::new(19.0, 1.0, 5).unwrap();
        let report = binary_tree_hapod(
            &grid,
            source,
            plan,
            &[SlotSpec::new(epsilon)],
            &HapodConfig::default(),
        )
        .await
        .unwrap();

        report.slots[0].basis.as_ref().map(|basis| {
            // All 80 snapshots: four copies of 0.9^k e_k for k < 20.
            let mut snaps = Array2::<f64>::zeros((80, 24));
            for k in 0..20 {
                for copy in 0..4 {
                    snaps[[4 * k + copy, k]] = 0.9f64.powi(k as i32);
                }
            }
            let proj = snaps.dot(&basis.modes.t()).dot(&basis.modes);
            let err: f64 = (&snaps - &proj).iter().map(|x| x * x).sum();
            (basis.len(), err)
        })
    })
    .await;

    let (num_modes, err) = results[0].unwrap();
    assert!(results[1].is_none());
    assert!(num_modes < 20, "expected lossy compression, kept {num_modes}");
    let budget = 80.0 * epsilon * epsilon;
    assert!(
        err <= budget * (1.0 + 1e-9),
        "projection error {err} exceeds budget {budget}"
    );
}

#[tokio::test]
async fn test_random_snapshots_stay_within_budget() {
    let epsilon = 0.5;
    let results = run_on_grid(1, 2, move |grid| async move {
        let mut rng = StdRng::seed_from_u64(17 + grid.world_rank() as u64);
        let mut rows = Array2::<f64>::zeros((20, 8));
        for v in rows.iter_mut() {
            *v = rng.random_range(-1.0..1.0);
        }

        let plan = ChunkPlan::new(19.0, 1.0, 5).unwrap();
        let report = binary_tree_hapod(
            &grid,
            MatrixSource::new(rows.clone()),
            plan,
            &[SlotSpec::new(epsilon)],
            &HapodConfig::default(),
        )
        .await
        .unwrap();

        // Everyone receives the final basis and scores its own rows.
        let basis = broadcast_modes(&grid, 0, &report.slots[0]).await.unwrap();
        let proj = rows.dot(&basis.modes.t()).dot(&basis.modes);
        let err: f64 = (&rows - &proj).iter().map(|x| x * x).sum();
        (err, basis.svals.to_vec())
    })
    .await;

    let total_err: f64 = results.iter().map(|(err, _)| err).sum();
    let budget = 40.0 * epsilon * epsilon;
    assert!(
        total_err <= budget * (1.0 + 1e-9),
        "projection error {total_err} exceeds budget {budget}"
    );
    assert_eq!(results[0].1, results[1].1, "ranks disagree on the basis");
    assert!(!results[0].1.is_empty());
}
