use super::helpers::{run_on_grid, UnitSource};
use hapod::{binary_tree_hapod, broadcast_modes, ChunkPlan, HapodConfig, SlotSpec};

#[tokio::test]
async fn test_two_nodes_reduce_to_one_owner_per_slot() {
    // 2 nodes x 2 ranks. Each node root folds its group's chunks, then the
    // two roots of each slot meet across nodes; slot 0 ends on world rank 0
    // and slot 1 on world rank 1.
    let results = run_on_grid(2, 2, |grid| async move {
        let source = UnitSource::new(2, 24);
        let plan = ChunkPlan::new(19.0, 1.0, 5).unwrap();
        let specs = [SlotSpec::new(1e-3), SlotSpec::new(1e-3)];
        let report = binary_tree_hapod(&grid, source, plan, &specs, &HapodConfig::default())
            .await
            .unwrap();

        let b0 = broadcast_modes(&grid, 0, &report.slots[0]).await.unwrap();
        let b1 = broadcast_modes(&grid, 1, &report.slots[1]).await.unwrap();
        (report, b0.svals.to_vec(), b1.len())
    })
    .await;

    assert_eq!(results.len(), 4);
    let (ref report0, ref svals0, _) = results[0];

    let basis0 = report0.slots[0].basis.as_ref().unwrap();
    assert_eq!(basis0.len(), 20);
    for s in basis0.svals.iter() {
        assert!((s - 2.0).abs() < 1e-9, "singular value {s} should be 2");
    }
    assert_eq!(report0.slots[0].total_num_snapshots, 80);

    // The node 1 root shipped its basis upstream and kept nothing.
    assert!(results[2].0.slots[0].basis.is_none());
    assert_eq!(results[2].0.slots[0].total_num_snapshots, 0);
    // Slot 1 rotates to the local rank 1 roots and finishes on world rank 1.
    assert!(results[1].0.slots[1].basis.is_some());
    assert!(results[3].0.slots[1].basis.is_none());
    assert!(results[0].0.slots[1].basis.is_none());

    let stats = report0.slots[0].stats.as_ref().unwrap();
    assert_eq!(stats.total_num_snapshots, 80);
    assert_eq!(stats.num_modes, 20);
    assert_eq!(stats.max_local_modes, 20);
    // Largest input: two 20-mode bases meeting in the cross-node merge.
    assert_eq!(stats.max_vectors_before_pod, 40);
    assert!(results[1].0.slots[0].stats.is_none());

    // Broadcast hands every rank the same 20 modes.
    assert_eq!(svals0.len(), 20);
    for r in 1..4 {
        assert_eq!(&results[r].1, svals0, "rank {r} saw a different basis");
        assert_eq!(results[r].2, 20);
    }
}

#[tokio::test]
async fn test_four_node_tree_reduces_in_two_rounds() {
    let results = run_on_grid(4, 1, |grid| async move {
        let source = UnitSource::new(1, 24);
        let plan = ChunkPlan::new(19.0, 1.0, 5).unwrap();
        binary_tree_hapod(
            &grid,
            source,
            plan,
            &[SlotSpec::new(1e-3)],
            &HapodConfig::default(),
        )
        .await
        .unwrap()
    })
    .await;

    let basis = results[0].slots[0].basis.as_ref().unwrap();
    assert_eq!(basis.len(), 20);
    for s in basis.svals.iter() {
        assert!((s - 2.0).abs() < 1e-9);
    }
    assert_eq!(results[0].slots[0].total_num_snapshots, 80);
    for r in 1..4 {
        assert!(results[r].slots[0].basis.is_none(), "rank {r} kept a basis");
    }

    let stats = results[0].slots[0].stats.as_ref().unwrap();
    assert_eq!(stats.total_num_snapshots, 80);
    assert_eq!(stats.num_modes, 20);
    assert_eq!(stats.max_vectors_before_pod, 40);
}
