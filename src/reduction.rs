//! The incremental reduction itself. Every rank compresses its own chunk and
//! a rotating root folds the gathered modes in as the trajectory streams;
//! once the stream ends, a binary tree over the node roots leaves one basis
//! per slot.

use std::time::Instant;

use ndarray::Array1;

use crate::chunks::{ChunkGenerator, ChunkPlan, SnapshotSource};
use crate::comm::grid::ProcessGrid;
use crate::comm::{BasisPacket, Phase, Tag};
use crate::config::HapodConfig;
use crate::error::{HapodError, Result};
use crate::params::HapodParameters;
use crate::pod::{local_pod, Basis, PodInput, PodOptions, Product};
use crate::results::{aggregate_stats, HapodReport, SlotOutcome, SlotState};
use crate::types::{Rank, SlotId};

/// One decomposition to run: its target mean error, optionally its own
/// trade-off factor, and the inner product it is orthonormal against.
#[derive(Clone, Debug)]
pub struct SlotSpec {
    epsilon_ast: f64,
    omega: Option<f64>,
    product: Product,
}

impl SlotSpec {
    pub fn new(epsilon_ast: f64) -> SlotSpec {
        SlotSpec {
            epsilon_ast,
            omega: None,
            product: Product::Euclidean,
        }
    }

    /// Override the configured omega for this slot alone.
    pub fn with_omega(mut self, omega: f64) -> SlotSpec {
        self.omega = Some(omega);
        self
    }

    pub fn with_product(mut self, product: Product) -> SlotSpec {
        self.product = product;
        self
    }
}

/// Run the full reduction for every slot of `source` over `grid`.
///
/// All ranks call this collectively with the same plan, specs, and config.
/// The returned report holds the final basis on the vertex that finished
/// the tree (group root of the slot on node 0) and world-aggregated stats
/// on world rank 0; every other rank gets `None` in those places.
pub async fn binary_tree_hapod<S: SnapshotSource>(
    grid: &ProcessGrid,
    source: S,
    plan: ChunkPlan,
    specs: &[SlotSpec],
    config: &HapodConfig,
) -> Result<HapodReport> {
    if specs.is_empty() {
        return Err(HapodError::config("no slots to decompose"));
    }
    if specs.len() != source.num_slots() {
        return Err(HapodError::config(format!(
            "{} slot specs for a source with {} slots",
            specs.len(),
            source.num_slots(),
        )));
    }

    let tree_depth = plan.num_chunks() + grid.node_tree_depth();
    let ppn = grid.procs_per_node() as usize;

    let mut states = Vec::with_capacity(specs.len());
    for (slot, spec) in specs.iter().enumerate() {
        let omega = spec.omega.unwrap_or(config.omega);
        let params = HapodParameters::new(tree_depth, spec.epsilon_ast, omega)?;
        states.push(SlotState::new(slot, params, 0));
    }

    let regular_opts = PodOptions {
        orth_tol: config.orth_tol,
        incremental_gramian: config.incremental_gramian,
        degeneracy: config.degeneracy,
    };
    let final_opts = PodOptions {
        orth_tol: config.final_orth_tol,
        ..regular_opts.clone()
    };

    if grid.world_rank() == 0 {
        tracing::info!(
            "starting reduction: slots={}, chunks={}, tree_depth={tree_depth}, world={}",
            specs.len(),
            plan.num_chunks(),
            grid.world().size(),
        );
    }

    let mut generator = ChunkGenerator::new(source, plan);
    while !generator.is_done() {
        let batch = generator.next_batch()?;
        let chunk = batch.index;

        // Stage 1: every rank compresses its own chunk, slot by slot.
        let mut outgoing = Vec::with_capacity(specs.len());
        for (slot, mat) in batch.slots.iter().enumerate() {
            let state = &mut states[slot];
            let chunk_len = mat.nrows();
            state.contributed_snapshots += chunk_len;
            state.observe_input(chunk_len);

            let started = Instant::now();
            let local = local_pod(
                PodInput::Fresh(mat.view()),
                chunk_len,
                &state.params,
                0,
                &specs[slot].product,
                &regular_opts,
            )?;
            state.pod_time += started.elapsed();
            state.observe_modes(local.len());
            tracing::debug!(
                "rank={} slot={slot} chunk={chunk}: {chunk_len} vectors -> {} modes",
                grid.world_rank(),
                local.len(),
            );

            // The singular values are baked into the vectors for the
            // gather; the root consumes them as plain snapshots.
            outgoing.push(BasisPacket {
                modes: local.scaled_modes(),
                svals: Array1::zeros(0),
                num_snaps: chunk_len,
            });
        }

        // Everyone finishes the chunk before the roots start collecting.
        grid.group().barrier().await?;

        // Stage 2: the rotating root of each slot gathers and folds in.
        for (slot, packet) in outgoing.into_iter().enumerate() {
            let root = (slot % ppn) as Rank;
            let tag = Tag {
                slot,
                phase: Phase::ChunkGather { chunk },
            };
            let gathered = grid.group().gather_basis(root, tag, packet).await?;
            let (vectors, num_snaps) = match gathered {
                Some(g) => g,
                None => continue,
            };

            let state = &mut states[slot];
            state.total_num_snapshots += num_snaps;
            let root_of_tree = batch.is_last && grid.num_nodes() == 1;
            let opts = if root_of_tree {
                &final_opts
            } else {
                &regular_opts
            };

            let input = if chunk == 0 {
                PodInput::Fresh(vectors.view())
            } else {
                PodInput::Merge {
                    prior: std::mem::replace(&mut state.basis, Basis::empty(0)),
                    batch: vectors.view(),
                }
            };
            state.observe_input(input.num_vectors());

            let started = Instant::now();
            let merged = local_pod(
                input,
                state.total_num_snapshots,
                &state.params,
                chunk + 1,
                &specs[slot].product,
                opts,
            )?;
            state.pod_time += started.elapsed();
            state.observe_modes(merged.len());
            state.basis = merged;
        }
    }

    // Cross-node stage: the roots of each slot reduce pairwise until one
    // vertex holds the slot's basis.
    let num_chunks = plan.num_chunks();
    let mut has_final = vec![false; specs.len()];
    for (slot, spec) in specs.iter().enumerate() {
        let root = (slot % ppn) as Rank;
        if grid.group_rank() != root {
            continue;
        }
        if grid.num_nodes() == 1 {
            has_final[slot] = true;
            continue;
        }
        has_final[slot] = tree_reduce(
            grid,
            slot,
            spec,
            &mut states[slot],
            num_chunks,
            &regular_opts,
            &final_opts,
        )
        .await?;
    }

    // Epilogue: world rank 0 aggregates the per-rank diagnostics.
    let world_size = grid.world().size();
    let mut outcomes = Vec::with_capacity(specs.len());
    for (slot, state) in states.into_iter().enumerate() {
        let tag = Tag {
            slot,
            phase: Phase::Stats,
        };
        let gathered = grid
            .world()
            .gather_stats(0, tag, state.stats_packet())
            .await?;
        let stats = gathered.map(|packets| aggregate_stats(&packets, world_size));
        if let Some(s) = &stats {
            tracing::info!(
                "slot {slot} done: {} final modes from {} snapshots, largest pod input {}",
                s.num_modes,
                s.total_num_snapshots,
                s.max_vectors_before_pod,
            );
        }

        let basis = if has_final[slot] {
            Some(state.basis)
        } else {
            None
        };
        outcomes.push(SlotOutcome {
            slot,
            basis,
            total_num_snapshots: state.total_num_snapshots,
            stats,
        });
    }

    grid.world().barrier().await?;
    Ok(HapodReport { slots: outcomes })
}

/// Pairwise halving over the cross communicator. The lower index of each
/// pair receives and merges, the higher one ships its basis upstream and
/// goes quiet. Returns whether this rank ended up holding the basis.
async fn tree_reduce(
    grid: &ProcessGrid,
    slot: SlotId,
    spec: &SlotSpec,
    state: &mut SlotState,
    num_chunks: usize,
    regular_opts: &PodOptions,
    final_opts: &PodOptions,
) -> Result<bool> {
    let cross = grid.cross();
    let me = cross.rank();
    let mut active: Vec<Rank> = (0..cross.size()).collect();
    let mut round = 0usize;

    while active.len() > 1 {
        let mut next_active = Vec::with_capacity((active.len() + 1) / 2);
        let mut action = None;
        for pair in active.chunks(2) {
            next_active.push(pair[0]);
            if pair.len() == 2 {
                if me == pair[0] {
                    action = Some((pair[1], true));
                } else if me == pair[1] {
                    action = Some((pair[0], false));
                }
            }
        }
        let tag = Tag {
            slot,
            phase: Phase::TreeRound { round },
        };
        let root_of_tree = next_active.len() == 1;

        match action {
            Some((partner, true)) => {
                let packet = cross.recv_basis(partner, tag).await?;
                if packet.svals.len() != packet.modes.nrows() {
                    return Err(HapodError::CollectiveMismatch {
                        operation: "tree-merge",
                        rank: partner,
                        reason: format!(
                            "{} singular values for {} modes",
                            packet.svals.len(),
                            packet.modes.nrows(),
                        ),
                    });
                }
                let incoming = Basis {
                    modes: packet.modes,
                    svals: packet.svals,
                };
                let scaled = incoming.scaled_modes();
                state.total_num_snapshots += packet.num_snaps;
                let prior = std::mem::replace(&mut state.basis, Basis::empty(0));
                state.observe_input(prior.len() + scaled.nrows());

                let opts = if root_of_tree {
                    final_opts
                } else {
                    regular_opts
                };
                let level = num_chunks + 1 + round;
                let started = Instant::now();
                let merged = local_pod(
                    PodInput::Merge {
                        prior,
                        batch: scaled.view(),
                    },
                    state.total_num_snapshots,
                    &state.params,
                    level,
                    &spec.product,
                    opts,
                )?;
                state.pod_time += started.elapsed();
                state.observe_modes(merged.len());
                tracing::debug!(
                    "rank={} slot={slot} tree round {round}: merged to {} modes",
                    grid.world_rank(),
                    merged.len(),
                );
                state.basis = merged;
            }
            Some((partner, false)) => {
                let basis = std::mem::replace(&mut state.basis, Basis::empty(0));
                cross.send_basis(
                    partner,
                    tag,
                    BasisPacket {
                        modes: basis.modes,
                        svals: basis.svals,
                        num_snaps: state.total_num_snapshots,
                    },
                )?;
                // This vertex no longer stands for any snapshots.
                state.total_num_snapshots = 0;
            }
            None => {}
        }

        active = next_active;
        round += 1;
        if !active.contains(&me) {
            break;
        }
    }

    Ok(active.contains(&me))
}

/// Ship the final basis of `slot` from the vertex holding it to every world
/// rank. Callers pass the outcome they got back from the reduction.
pub async fn broadcast_modes(
    grid: &ProcessGrid,
    slot: SlotId,
    outcome: &SlotOutcome,
) -> Result<Basis> {
    let root = (slot % grid.procs_per_node() as usize) as Rank;
    let tag = Tag {
        slot,
        phase: Phase::Broadcast,
    };
    let payload = if grid.world_rank() == root {
        let basis = outcome
            .basis
            .as_ref()
            .ok_or_else(|| HapodError::config("broadcast root holds no final basis"))?;
        Some(BasisPacket {
            modes: basis.modes.clone(),
            svals: basis.svals.clone(),
            num_snaps: outcome.total_num_snapshots,
        })
    } else {
        None
    };
    let packet = grid.world().bcast_basis(root, tag, payload).await?;
    Ok(Basis {
        modes: packet.modes,
        svals: packet.svals,
    })
}
