//! Process grid: the world communicator split into per-node groups plus
//! cross-node communicators linking ranks that share a local index.

use std::time::Duration;

use crate::comm::{ceil_log2, mesh, GroupComm};
use crate::error::{HapodError, Result};
use crate::types::Rank;

/// One rank's view of the grid. World rank `node * procs_per_node + local`
/// sits at `local` inside its node group and at `node` inside the cross
/// communicator of all ranks with the same local index.
pub struct ProcessGrid {
    world: GroupComm,
    group: GroupComm,
    cross: GroupComm,
    node_index: usize,
    procs_per_node: u32,
    num_nodes: u32,
}

impl ProcessGrid {
    /// Wire up a full grid of in-process endpoints, one per world rank.
    pub fn bootstrap_local(
        num_nodes: u32,
        procs_per_node: u32,
        timeout: Duration,
    ) -> Result<Vec<ProcessGrid>> {
        if num_nodes == 0 || procs_per_node == 0 {
            return Err(HapodError::config(format!(
                "grid needs at least one node and one rank per node, \
                 got {num_nodes} x {procs_per_node}",
            )));
        }
        let world_size = num_nodes * procs_per_node;

        let mut world_endpoints: Vec<Option<GroupComm>> =
            mesh(world_size, timeout).into_iter().map(Some).collect();
        let mut group_endpoints: Vec<Vec<Option<GroupComm>>> = (0..num_nodes)
            .map(|_| mesh(procs_per_node, timeout).into_iter().map(Some).collect())
            .collect();
        let mut cross_endpoints: Vec<Vec<Option<GroupComm>>> = (0..procs_per_node)
            .map(|_| mesh(num_nodes, timeout).into_iter().map(Some).collect())
            .collect();

        let mut grids = Vec::with_capacity(world_size as usize);
        for r in 0..world_size as usize {
            let node = r / procs_per_node as usize;
            let local = r % procs_per_node as usize;
            grids.push(ProcessGrid {
                world: world_endpoints[r]
                    .take()
                    .expect("each world endpoint used exactly once"),
                group: group_endpoints[node][local]
                    .take()
                    .expect("each group endpoint used exactly once"),
                cross: cross_endpoints[local][node]
                    .take()
                    .expect("each cross endpoint used exactly once"),
                node_index: node,
                procs_per_node,
                num_nodes,
            });
        }
        Ok(grids)
    }

    pub fn world(&self) -> &GroupComm {
        &self.world
    }

    pub fn group(&self) -> &GroupComm {
        &self.group
    }

    pub fn cross(&self) -> &GroupComm {
        &self.cross
    }

    pub fn world_rank(&self) -> Rank {
        self.world.rank()
    }

    pub fn group_rank(&self) -> Rank {
        self.group.rank()
    }

    pub fn node_index(&self) -> usize {
        self.node_index
    }

    pub fn num_nodes(&self) -> u32 {
        self.num_nodes
    }

    pub fn procs_per_node(&self) -> u32 {
        self.procs_per_node
    }

    /// Levels the cross-node reduction adds on top of the chunk levels: one
    /// for the node-local merges plus one per halving round.
    pub fn node_tree_depth(&self) -> usize {
        1 + ceil_log2(self.num_nodes) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{BasisPacket, Phase, Tag};
    use ndarray::array;

    #[test]
    fn test_bootstrap_assigns_ranks() {
        let grids = ProcessGrid::bootstrap_local(2, 3, Duration::from_secs(5)).unwrap();
        assert_eq!(grids.len(), 6);

        let g = &grids[4];
        assert_eq!(g.world_rank(), 4);
        assert_eq!(g.node_index(), 1);
        assert_eq!(g.group_rank(), 1);
        assert_eq!(g.group().size(), 3);
        assert_eq!(g.cross().rank(), 1);
        assert_eq!(g.cross().size(), 2);
        assert_eq!(g.node_tree_depth(), 2);

        assert_eq!(grids[0].node_tree_depth(), 2);
        let single = ProcessGrid::bootstrap_local(1, 2, Duration::from_secs(5)).unwrap();
        assert_eq!(single[0].node_tree_depth(), 1);
    }

    #[test]
    fn test_bootstrap_rejects_empty_grid() {
        assert!(ProcessGrid::bootstrap_local(0, 2, Duration::from_secs(5)).is_err());
        assert!(ProcessGrid::bootstrap_local(2, 0, Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn test_cross_comm_links_same_local_index() {
        let mut grids = ProcessGrid::bootstrap_local(2, 3, Duration::from_secs(5)).unwrap();
        // World ranks 1 and 4 share local index 1.
        let g4 = grids.remove(4);
        let g1 = grids.remove(1);
        let tag = Tag {
            slot: 1,
            phase: Phase::TreeRound { round: 0 },
        };

        let sender = tokio::spawn(async move {
            g4.cross().send_basis(
                0,
                tag,
                BasisPacket {
                    modes: array![[3.5]],
                    svals: array![1.0],
                    num_snaps: 2,
                },
            )
        });
        let receiver = tokio::spawn(async move { g1.cross().recv_basis(1, tag).await });

        sender.await.unwrap().unwrap();
        let got = receiver.await.unwrap().unwrap();
        assert_eq!(got.modes[[0, 0]], 3.5);
    }
}
