//! In-process communicators. Ranks are tokio tasks wired into a full mesh
//! of channels, with the collectives the reduction tree needs layered on
//! top: gather, broadcast, barrier, and tagged point-to-point sends.

pub mod grid;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::try_join_all;
use ndarray::{Array1, Array2};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::error::{HapodError, Result};
use crate::linalg::vstack;
use crate::types::{Rank, SlotId};

/// Threshold: flat broadcast for small groups, binary tree for larger.
const TREE_BROADCAST_THRESHOLD: u32 = 4;

/// Threshold: two-phase barrier for small groups, dissemination for larger.
const DISSEMINATION_THRESHOLD: u32 = 5;

/// Integer ceiling of log2(n). Returns 0 for n <= 1.
pub(crate) fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        return 0;
    }
    u32::BITS - (n - 1).leading_zeros()
}

/// Mode set in flight between tree vertices: the vectors themselves, the
/// singular values that weight them, and the number of original snapshots
/// they stand for.
#[derive(Clone, Debug)]
pub struct BasisPacket {
    pub modes: Array2<f64>,
    pub svals: Array1<f64>,
    pub num_snaps: usize,
}

/// Per-rank diagnostics gathered to world rank 0 once a slot finishes.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsPacket {
    pub contributed_snapshots: usize,
    pub num_modes: usize,
    pub max_vectors_before_pod: usize,
    pub max_local_modes: usize,
    pub pod_seconds: f64,
}

/// Where in the reduction a message belongs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    ChunkGather { chunk: usize },
    TreeRound { round: usize },
    Stats,
    Broadcast,
}

/// Pairs a slot with its phase so interleaved slots on one communicator
/// cannot cross wires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag {
    pub slot: SlotId,
    pub phase: Phase,
}

#[derive(Debug)]
enum Message {
    Basis { tag: Tag, packet: BasisPacket },
    Stats { tag: Tag, packet: StatsPacket },
    Barrier { epoch: u64 },
    BarrierAck { epoch: u64 },
}

impl Message {
    fn describe(&self) -> String {
        match self {
            Message::Basis { tag, .. } => format!("basis {tag:?}"),
            Message::Stats { tag, .. } => format!("stats {tag:?}"),
            Message::Barrier { epoch } => format!("barrier(epoch={epoch})"),
            Message::BarrierAck { epoch } => format!("barrier-ack(epoch={epoch})"),
        }
    }
}

/// One rank's endpoint in a communicator group.
///
/// Every rank holds a sender to each peer and an inbox per peer, so
/// messages between a pair arrive in order and concurrent receives from
/// different peers never contend.
pub struct GroupComm {
    rank: Rank,
    size: u32,
    timeout: Duration,
    senders: Vec<UnboundedSender<Message>>,
    inboxes: Vec<Mutex<UnboundedReceiver<Message>>>,
    barrier_epoch: AtomicU64,
}

/// Build a fully connected in-process group of `size` endpoints.
pub(crate) fn mesh(size: u32, timeout: Duration) -> Vec<GroupComm> {
    let n = size as usize;
    let mut senders: Vec<Vec<UnboundedSender<Message>>> =
        (0..n).map(|_| Vec::with_capacity(n)).collect();
    let mut inboxes: Vec<Vec<Mutex<UnboundedReceiver<Message>>>> =
        (0..n).map(|_| Vec::with_capacity(n)).collect();
    for from in 0..n {
        for to in 0..n {
            let (tx, rx) = mpsc::unbounded_channel();
            senders[from].push(tx);
            inboxes[to].push(Mutex::new(rx));
        }
    }
    senders
        .into_iter()
        .zip(inboxes)
        .enumerate()
        .map(|(rank, (senders, inboxes))| GroupComm {
            rank: rank as Rank,
            size,
            timeout,
            senders,
            inboxes,
            barrier_epoch: AtomicU64::new(0),
        })
        .collect()
}

impl GroupComm {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn send(&self, dest: Rank, msg: Message, operation: &'static str) -> Result<()> {
        self.senders
            .get(dest as usize)
            .ok_or_else(|| HapodError::CollectiveFailed {
                operation,
                rank: dest,
                reason: "rank outside group".to_string(),
            })?
            .send(msg)
            .map_err(|_| HapodError::CollectiveFailed {
                operation,
                rank: dest,
                reason: "peer endpoint dropped".to_string(),
            })
    }

    async fn recv(&self, src: Rank, operation: &'static str) -> Result<Message> {
        let inbox = self
            .inboxes
            .get(src as usize)
            .ok_or_else(|| HapodError::CollectiveFailed {
                operation,
                rank: src,
                reason: "rank outside group".to_string(),
            })?;
        let mut inbox = inbox.lock().await;
        match tokio::time::timeout(self.timeout, inbox.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(HapodError::CollectiveFailed {
                operation,
                rank: src,
                reason: "peer endpoint dropped".to_string(),
            }),
            Err(_) => Err(HapodError::CollectiveFailed {
                operation,
                rank: src,
                reason: format!("recv timed out after {}ms", self.timeout.as_millis()),
            }),
        }
    }

    /// Send a basis to a peer. Sends never block; pairing and ordering are
    /// enforced on the receive side.
    pub fn send_basis(&self, dest: Rank, tag: Tag, packet: BasisPacket) -> Result<()> {
        self.send(dest, Message::Basis { tag, packet }, "send-basis")
    }

    /// Receive a basis from a peer, checking it belongs to `tag`.
    pub async fn recv_basis(&self, src: Rank, tag: Tag) -> Result<BasisPacket> {
        match self.recv(src, "recv-basis").await? {
            Message::Basis { tag: got, packet } if got == tag => Ok(packet),
            other => Err(HapodError::CollectiveMismatch {
                operation: "recv-basis",
                rank: src,
                reason: format!("expected basis {tag:?}, got {}", other.describe()),
            }),
        }
    }

    async fn recv_stats(&self, src: Rank, tag: Tag) -> Result<StatsPacket> {
        match self.recv(src, "recv-stats").await? {
            Message::Stats { tag: got, packet } if got == tag => Ok(packet),
            other => Err(HapodError::CollectiveMismatch {
                operation: "recv-stats",
                rank: src,
                reason: format!("expected stats {tag:?}, got {}", other.describe()),
            }),
        }
    }

    /// Gather: root collects every rank's vectors into one matrix, stacked
    /// in rank order, with the snapshot counts summed. Non-root ranks send
    /// their packet and get `None`.
    ///
    /// Uses flat gather: root posts concurrent recvs, non-root ranks send.
    pub async fn gather_basis(
        &self,
        root: Rank,
        tag: Tag,
        packet: BasisPacket,
    ) -> Result<Option<(Array2<f64>, usize)>> {
        let world = self.size;
        if world <= 1 {
            return Ok(Some((packet.modes, packet.num_snaps)));
        }
        if root >= world {
            return Err(HapodError::CollectiveFailed {
                operation: "gather-basis",
                rank: root,
                reason: "root outside group".to_string(),
            });
        }

        if self.rank != root {
            self.send_basis(root, tag, packet)?;
            return Ok(None);
        }

        let dim = packet.modes.ncols();
        let futs: Vec<_> = (0..world)
            .filter(|&r| r != root)
            .map(|r| self.recv_basis(r, tag))
            .collect();
        let received = try_join_all(futs).await?;

        let mut slots: Vec<Option<(Array2<f64>, usize)>> = (0..world).map(|_| None).collect();
        slots[root as usize] = Some((packet.modes, packet.num_snaps));
        let mut it = received.into_iter();
        for r in (0..world).filter(|&r| r != root) {
            let got = it.next().expect("one packet per non-root rank");
            if got.modes.ncols() != dim {
                return Err(HapodError::CollectiveMismatch {
                    operation: "gather-basis",
                    rank: r,
                    reason: format!(
                        "vector dimension {} does not match root's {dim}",
                        got.modes.ncols(),
                    ),
                });
            }
            slots[r as usize] = Some((got.modes, got.num_snaps));
        }

        let mut total = 0usize;
        let mut parts: Vec<Array2<f64>> = Vec::with_capacity(world as usize);
        for slot in slots {
            let (modes, count) = slot.expect("every rank slot filled");
            total += count;
            parts.push(modes);
        }
        let views: Vec<_> = parts.iter().map(|m| m.view()).collect();
        Ok(Some((vstack(&views), total)))
    }

    /// Gather per-rank diagnostics to `root`, in rank order. Non-root ranks
    /// get `None`.
    pub async fn gather_stats(
        &self,
        root: Rank,
        tag: Tag,
        packet: StatsPacket,
    ) -> Result<Option<Vec<StatsPacket>>> {
        let world = self.size;
        if world <= 1 {
            return Ok(Some(vec![packet]));
        }

        if self.rank != root {
            self.send(root, Message::Stats { tag, packet }, "gather-stats")?;
            return Ok(None);
        }

        let futs: Vec<_> = (0..world)
            .filter(|&r| r != root)
            .map(|r| self.recv_stats(r, tag))
            .collect();
        let received = try_join_all(futs).await?;

        let mut out = Vec::with_capacity(world as usize);
        let mut it = received.into_iter();
        for r in 0..world {
            if r == root {
                out.push(packet);
            } else {
                out.push(it.next().expect("one packet per non-root rank"));
            }
        }
        Ok(Some(out))
    }

    /// Broadcast a basis from `root` to every rank. The root passes
    /// `Some(packet)`, all others `None`; everyone returns the payload.
    ///
    /// Falls back to flat broadcast (root sends to all directly) for small
    /// group sizes, binary tree otherwise.
    pub async fn bcast_basis(
        &self,
        root: Rank,
        tag: Tag,
        packet: Option<BasisPacket>,
    ) -> Result<BasisPacket> {
        let world = self.size;
        if root >= world {
            return Err(HapodError::CollectiveFailed {
                operation: "broadcast",
                rank: root,
                reason: "root outside group".to_string(),
            });
        }
        if world <= 1 || world < TREE_BROADCAST_THRESHOLD {
            return self.flat_bcast(root, tag, packet).await;
        }
        self.tree_bcast(root, tag, packet).await
    }

    async fn flat_bcast(
        &self,
        root: Rank,
        tag: Tag,
        packet: Option<BasisPacket>,
    ) -> Result<BasisPacket> {
        if self.rank == root {
            let packet = root_payload(packet)?;
            for r in (0..self.size).filter(|&r| r != root) {
                self.send_basis(r, tag, packet.clone())?;
            }
            Ok(packet)
        } else {
            self.recv_basis(root, tag).await
        }
    }

    async fn tree_bcast(
        &self,
        root: Rank,
        tag: Tag,
        packet: Option<BasisPacket>,
    ) -> Result<BasisPacket> {
        let world = self.size;

        // Remap ranks so root becomes logical rank 0.
        let logical = |r: Rank| -> Rank { (r + world - root) % world };
        let physical = |l: Rank| -> Rank { (l + root) % world };
        let my_logical = logical(self.rank);

        let packet = if my_logical == 0 {
            root_payload(packet)?
        } else {
            let parent = physical((my_logical - 1) / 2);
            self.recv_basis(parent, tag).await?
        };

        for child in [2 * my_logical + 1, 2 * my_logical + 2] {
            if child < world {
                self.send_basis(physical(child), tag, packet.clone())?;
            }
        }
        Ok(packet)
    }

    /// Barrier: resolves once every rank in the group has entered.
    ///
    /// Two-phase through rank 0 for small groups, dissemination rounds for
    /// larger ones.
    pub async fn barrier(&self) -> Result<()> {
        let world = self.size;
        if world <= 1 {
            return Ok(());
        }
        if world < DISSEMINATION_THRESHOLD {
            self.two_phase_barrier().await
        } else {
            self.dissemination_barrier().await
        }
    }

    /// Phase 1: every rank sends `Barrier { epoch }` to rank 0.
    /// Phase 2: rank 0 waits for all, then acks everyone.
    async fn two_phase_barrier(&self) -> Result<()> {
        let epoch = self.barrier_epoch.fetch_add(1, Ordering::Relaxed);
        let world = self.size;

        if self.rank == 0 {
            for r in 1..world {
                match self.recv(r, "barrier").await? {
                    Message::Barrier { epoch: e } if e == epoch => {}
                    other => {
                        return Err(HapodError::CollectiveMismatch {
                            operation: "barrier",
                            rank: r,
                            reason: format!(
                                "expected barrier(epoch={epoch}), got {}",
                                other.describe(),
                            ),
                        });
                    }
                }
            }
            for r in 1..world {
                self.send(r, Message::BarrierAck { epoch }, "barrier")?;
            }
        } else {
            self.send(0, Message::Barrier { epoch }, "barrier")?;
            match self.recv(0, "barrier").await? {
                Message::BarrierAck { epoch: e } if e == epoch => {}
                other => {
                    return Err(HapodError::CollectiveMismatch {
                        operation: "barrier",
                        rank: 0,
                        reason: format!(
                            "expected barrier-ack(epoch={epoch}), got {}",
                            other.describe(),
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// In round r, rank i signals rank `(i + 2^r) % N` and waits on rank
    /// `(i - 2^r + N) % N`. After ceil(log2(N)) rounds every rank has
    /// transitively heard from every other.
    async fn dissemination_barrier(&self) -> Result<()> {
        let epoch = self.barrier_epoch.fetch_add(1, Ordering::Relaxed);
        let world = self.size;
        let rank = self.rank;
        let num_rounds = ceil_log2(world);

        for round in 0..num_rounds {
            let distance = 1u32 << round;
            let send_to = (rank + distance) % world;
            let recv_from = (rank + world - distance) % world;

            self.send(send_to, Message::Barrier { epoch }, "barrier")?;
            match self.recv(recv_from, "barrier").await? {
                Message::Barrier { epoch: e } if e == epoch => {}
                other => {
                    return Err(HapodError::CollectiveMismatch {
                        operation: "barrier",
                        rank: recv_from,
                        reason: format!(
                            "round {round} expected barrier(epoch={epoch}), got {}",
                            other.describe(),
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

fn root_payload(packet: Option<BasisPacket>) -> Result<BasisPacket> {
    packet.ok_or_else(|| HapodError::config("broadcast root called without a payload"))
}
