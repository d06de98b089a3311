//! Sync planning: turn a remote snapshot into the local one with as few
//! transferred bytes as possible
//!
//! The plan starts from `diff(remote, local)`:
//!
//! - unchanged paths become `Keep`
//! - detected moves become `Move`
//! - every other destination (added or modified path) is filled, in path
//!   order, by moving an unclaimed departing remote file with the same
//!   content, else copying a remote file that has it, else copying a file an
//!   earlier `Transfer` in this plan wrote, else a `Transfer`
//! - removed paths whose content nobody claimed become `Delete`
//!
//! Operations are then ordered over a dependency graph of content slots.
//! A slot is either the content a remote path held before the sync
//! (`Old`) or content an operation put somewhere during the sync (`New`).
//! Whoever reads a slot runs before whoever vacates it, and a path (or a
//! parent/child of it) is written only after its old content has left.
//! Cycles, such as two files swapping names, are broken by moving one slot
//! to a staging path first.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::diff::diff;
use crate::error::PlanConflict;
use crate::hash::Fingerprint;
use crate::snapshot::{FileRecord, Snapshot};

/// Prefix for temporary paths used to break rename cycles
pub const STAGE_PREFIX: &str = "__dirdiff_stage_";

/// One primitive step of a sync, applied to the remote tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Path already holds the right content
    Keep { path: PathBuf },
    /// Rename on the remote side
    Move { src: PathBuf, dst: PathBuf },
    /// Duplicate content the remote side already has
    CopyFromExisting { existing: PathBuf, dst: PathBuf },
    /// Send the bytes of a local file
    Transfer {
        local_path: PathBuf,
        dst: PathBuf,
        fingerprint: Fingerprint,
        size: u64,
        mode: u32,
    },
    Delete { path: PathBuf },
}

impl Operation {
    /// Path this operation creates or overwrites
    #[must_use]
    pub fn destination(&self) -> Option<&Path> {
        match self {
            Self::Keep { path } => Some(path.as_path()),
            Self::Move { dst, .. } | Self::CopyFromExisting { dst, .. } | Self::Transfer { dst, .. } => {
                Some(dst.as_path())
            }
            Self::Delete { .. } => None,
        }
    }

    /// Remote paths this operation touches
    #[must_use]
    pub fn remote_paths(&self) -> Vec<&Path> {
        match self {
            Self::Keep { .. } => Vec::new(),
            Self::Move { src, dst } => vec![src.as_path(), dst.as_path()],
            Self::CopyFromExisting { existing, dst } => vec![existing.as_path(), dst.as_path()],
            Self::Transfer { dst, .. } => vec![dst.as_path()],
            Self::Delete { path } => vec![path.as_path()],
        }
    }

    #[must_use]
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep { .. })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keep { path } => write!(f, "keep {}", path.display()),
            Self::Move { src, dst } => write!(f, "move {} -> {}", src.display(), dst.display()),
            Self::CopyFromExisting { existing, dst } => {
                write!(f, "copy {} -> {}", existing.display(), dst.display())
            }
            Self::Transfer { dst, size, .. } => write!(f, "send {} ({size} bytes)", dst.display()),
            Self::Delete { path } => write!(f, "delete {}", path.display()),
        }
    }
}

/// Counts per operation kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub keeps: usize,
    pub moves: usize,
    pub copies: usize,
    pub transfers: usize,
    pub deletes: usize,
    pub transfer_bytes: u64,
}

impl PlanSummary {
    pub fn add(&mut self, op: &Operation) {
        match op {
            Operation::Keep { .. } => self.keeps += 1,
            Operation::Move { .. } => self.moves += 1,
            Operation::CopyFromExisting { .. } => self.copies += 1,
            Operation::Transfer { size, .. } => {
                self.transfers += 1;
                self.transfer_bytes += size;
            }
            Operation::Delete { .. } => self.deletes += 1,
        }
    }
}

impl<'a> FromIterator<&'a Operation> for PlanSummary {
    fn from_iter<I: IntoIterator<Item = &'a Operation>>(ops: I) -> Self {
        let mut summary = Self::default();
        for op in ops {
            summary.add(op);
        }
        summary
    }
}

/// Ordered operations transforming the remote tree into the local one.
///
/// `Keep`s come first; the rest is in a safe sequential order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub operations: Vec<Operation>,
}

impl SyncPlan {
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Nothing to do on the remote side
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.operations.iter().all(Operation::is_keep)
    }

    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        self.operations.iter().collect()
    }

    /// Transfers of files larger than `limit` bytes
    pub fn transfers_over(&self, limit: u64) -> impl Iterator<Item = &Operation> {
        self.operations
            .iter()
            .filter(move |op| matches!(op, Operation::Transfer { size, .. } if *size > limit))
    }

    /// Reject plans in which two operations produce the same path
    ///
    /// # Errors
    /// Returns [`PlanConflict::SharedDestination`] naming both operations
    pub fn validate(&self) -> Result<(), PlanConflict> {
        let mut writers: HashMap<&Path, usize> = HashMap::new();
        for (i, op) in self.operations.iter().enumerate() {
            if let Some(dst) = op.destination()
                && let Some(first) = writers.insert(dst, i)
            {
                return Err(PlanConflict::SharedDestination {
                    path: dst.to_path_buf(),
                    first,
                    second: i,
                });
            }
        }
        Ok(())
    }
}

/// Content held at a path: before the sync, or put there during it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Slot {
    Old(PathBuf),
    New(PathBuf),
}

#[derive(Debug, Clone)]
struct Node {
    op: Operation,
    reads: Option<Slot>,
    vacates: Option<Slot>,
    creates: Option<PathBuf>,
}

impl Node {
    fn moved(src: Slot, dst: PathBuf) -> Self {
        let src_path = match &src {
            Slot::Old(p) | Slot::New(p) => p.clone(),
        };
        Self {
            op: Operation::Move {
                src: src_path,
                dst: dst.clone(),
            },
            reads: Some(src.clone()),
            vacates: Some(src),
            creates: Some(dst),
        }
    }

    fn copied(src: Slot, dst: PathBuf) -> Self {
        let existing = match &src {
            Slot::Old(p) | Slot::New(p) => p.clone(),
        };
        Self {
            op: Operation::CopyFromExisting {
                existing,
                dst: dst.clone(),
            },
            reads: Some(src),
            vacates: None,
            creates: Some(dst),
        }
    }

    fn transfer(record: &FileRecord) -> Self {
        Self {
            op: Operation::Transfer {
                local_path: record.path.clone(),
                dst: record.path.clone(),
                fingerprint: record.fingerprint,
                size: record.size,
                mode: record.mode,
            },
            reads: None,
            vacates: None,
            creates: Some(record.path.clone()),
        }
    }

    fn delete(slot: Slot) -> Self {
        let path = match &slot {
            Slot::Old(p) | Slot::New(p) => p.clone(),
        };
        Self {
            op: Operation::Delete { path },
            reads: None,
            vacates: Some(slot),
            creates: None,
        }
    }

    fn old_slots(&self) -> impl Iterator<Item = &Slot> {
        let vacates = self.vacates.as_ref().filter(|v| Some(*v) != self.reads.as_ref());
        self.reads
            .iter()
            .chain(vacates)
            .filter(|s| matches!(s, Slot::Old(_)))
    }

    /// Point whichever source of this operation is `Old(path)` at a staged copy
    fn redirect(&mut self, old: &Slot, stage: &Path) {
        let reads = self.reads.as_ref() == Some(old);
        let vacates = self.vacates.as_ref() == Some(old);
        if !reads && !vacates {
            return;
        }

        let staged = Slot::New(stage.to_path_buf());
        if reads {
            self.reads = Some(staged.clone());
        }
        if vacates {
            self.vacates = Some(staged);
        }
        match &mut self.op {
            Operation::Move { src: p, .. }
            | Operation::CopyFromExisting { existing: p, .. }
            | Operation::Delete { path: p } => *p = stage.to_path_buf(),
            Operation::Keep { .. } | Operation::Transfer { .. } => {}
        }
    }
}

/// Compute the plan that turns `remote` into `local`
///
/// # Errors
/// Returns a [`PlanConflict`] if two operations would write one path or a
/// dependency cycle cannot be broken
pub fn plan(local: &Snapshot, remote: &Snapshot) -> Result<SyncPlan, PlanConflict> {
    let changes = diff(remote, local);

    let keeps: Vec<Operation> = changes
        .unchanged
        .iter()
        .map(|path| Operation::Keep { path: path.clone() })
        .collect();

    let mut nodes: Vec<Node> = changes
        .moved
        .iter()
        .map(|m| Node::moved(Slot::Old(m.from.clone()), m.to.clone()))
        .collect();

    // Departing content nobody has claimed yet, lowest path first
    let mut departing: Vec<(&Path, Fingerprint)> = changes
        .removed
        .iter()
        .map(|r| (r.path.as_path(), r.fingerprint))
        .chain(changes.modified.iter().map(|m| (m.path.as_path(), m.old)))
        .collect();
    departing.sort();
    let mut pool: HashMap<Fingerprint, VecDeque<PathBuf>> = HashMap::new();
    for (path, fingerprint) in departing {
        pool.entry(fingerprint)
            .or_default()
            .push_back(path.to_path_buf());
    }

    let mut unchanged_holder: HashMap<Fingerprint, &Path> = HashMap::new();
    for path in &changes.unchanged {
        if let Some(record) = remote.get(path) {
            unchanged_holder.entry(record.fingerprint).or_insert(path);
        }
    }
    let mut any_holder: HashMap<Fingerprint, &Path> = HashMap::new();
    for record in remote.records() {
        any_holder.entry(record.fingerprint).or_insert(&record.path);
    }
    let mut transferred: HashMap<Fingerprint, PathBuf> = HashMap::new();

    let mut destinations: Vec<&FileRecord> = changes
        .added
        .iter()
        .chain(changes.modified.iter().filter_map(|m| local.get(&m.path)))
        .collect();
    destinations.sort_by(|a, b| a.path.cmp(&b.path));

    for record in destinations {
        let fingerprint = record.fingerprint;
        let dst = record.path.clone();

        if let Some(src) = pool.get_mut(&fingerprint).and_then(VecDeque::pop_front) {
            nodes.push(Node::moved(Slot::Old(src), dst));
        } else if let Some(src) = unchanged_holder
            .get(&fingerprint)
            .or_else(|| any_holder.get(&fingerprint))
        {
            nodes.push(Node::copied(Slot::Old(src.to_path_buf()), dst));
        } else if let Some(src) = transferred.get(&fingerprint) {
            nodes.push(Node::copied(Slot::New(src.clone()), dst));
        } else {
            transferred.insert(fingerprint, dst);
            nodes.push(Node::transfer(record));
        }
    }

    let removed: BTreeSet<&Path> = changes.removed.iter().map(|r| r.path.as_path()).collect();
    let mut leftovers: Vec<PathBuf> = pool
        .into_values()
        .flatten()
        .filter(|path| removed.contains(path.as_path()))
        .collect();
    leftovers.sort();
    nodes.extend(leftovers.into_iter().map(|p| Node::delete(Slot::Old(p))));

    let mut stages = StageNames::new(local, remote);
    let ordered = schedule(nodes, remote, &mut stages)?;

    let plan = SyncPlan {
        operations: keeps.into_iter().chain(ordered).collect(),
    };
    plan.validate()?;

    let summary = plan.summary();
    debug!(
        "Planned {} moves, {} copies, {} transfers ({} bytes), {} deletes, {} kept",
        summary.moves,
        summary.copies,
        summary.transfers,
        summary.transfer_bytes,
        summary.deletes,
        summary.keeps
    );
    Ok(plan)
}

/// Generates staging paths that collide with nothing in either tree
struct StageNames<'a> {
    local: &'a Snapshot,
    remote: &'a Snapshot,
    next: usize,
}

impl<'a> StageNames<'a> {
    fn new(local: &'a Snapshot, remote: &'a Snapshot) -> Self {
        Self {
            local,
            remote,
            next: 0,
        }
    }

    fn next(&mut self) -> PathBuf {
        loop {
            let candidate = PathBuf::from(format!("{STAGE_PREFIX}{}", self.next));
            self.next += 1;
            let taken = self
                .local
                .files
                .keys()
                .chain(self.remote.files.keys())
                .any(|p| p.starts_with(&candidate));
            if !taken {
                return candidate;
            }
        }
    }
}

/// Ordering constraints between nodes
struct Graph {
    pred: Vec<Vec<usize>>,
    succ: Vec<Vec<usize>>,
    /// Writers that must wait until an `Old` slot has been vacated
    waiting: HashMap<Slot, Vec<usize>>,
}

impl Graph {
    fn build(nodes: &[Node], remote: &Snapshot) -> Result<Self, PlanConflict> {
        let mut writer: HashMap<&Path, usize> = HashMap::new();
        let mut readers: HashMap<&Slot, Vec<usize>> = HashMap::new();
        let mut vacator: HashMap<&Slot, usize> = HashMap::new();

        for (i, node) in nodes.iter().enumerate() {
            if let Some(dst) = &node.creates
                && let Some(first) = writer.insert(dst, i)
            {
                return Err(PlanConflict::SharedDestination {
                    path: dst.clone(),
                    first,
                    second: i,
                });
            }
            if let Some(slot) = &node.reads {
                readers.entry(slot).or_default().push(i);
            }
            if let Some(slot) = &node.vacates {
                vacator.insert(slot, i);
            }
        }

        let mut graph = Self {
            pred: vec![Vec::new(); nodes.len()],
            succ: vec![Vec::new(); nodes.len()],
            waiting: HashMap::new(),
        };

        // Staged or transferred content exists only once its creator ran
        for (slot, users) in &readers {
            if let Slot::New(path) = slot
                && let Some(&creator) = writer.get(path.as_path())
            {
                for &user in users {
                    graph.edge(creator, user);
                }
            }
        }
        for (slot, &v) in &vacator {
            if let Slot::New(path) = slot
                && let Some(&creator) = writer.get(path.as_path())
            {
                graph.edge(creator, v);
            }
        }

        // Read before the content goes away
        for (slot, users) in &readers {
            if let Some(&v) = vacator.get(slot) {
                for &user in users.iter().filter(|&&u| u != v) {
                    graph.edge(user, v);
                }
            }
        }

        // Old content at a path, or at a parent/child of it, leaves first
        for (i, node) in nodes.iter().enumerate() {
            let Some(dst) = &node.creates else {
                continue;
            };
            for path in conflicting_remote_paths(remote, dst) {
                let slot = Slot::Old(path.to_path_buf());
                for &user in readers.get(&slot).into_iter().flatten() {
                    graph.edge(user, i);
                }
                if let Some(&v) = vacator.get(&slot) {
                    graph.edge(v, i);
                }
                graph.waiting.entry(slot).or_default().push(i);
            }
        }

        Ok(graph)
    }

    fn edge(&mut self, from: usize, to: usize) {
        self.succ[from].push(to);
        self.pred[to].push(from);
    }

    /// Kahn's algorithm, lowest index first among ready nodes.
    ///
    /// On a stall, returns the nodes that could not be scheduled.
    fn order(&self) -> Result<Vec<usize>, BTreeSet<usize>> {
        let mut indegree: Vec<usize> = self.pred.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(indegree.len());

        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &next in &self.succ[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() == indegree.len() {
            Ok(order)
        } else {
            Err((0..indegree.len()).filter(|i| indegree[*i] > 0).collect())
        }
    }

    /// Walk predecessors from the lowest stalled node until one repeats
    fn find_cycle(&self, remaining: &BTreeSet<usize>) -> Vec<usize> {
        let Some(&start) = remaining.first() else {
            return Vec::new();
        };
        let mut position: HashMap<usize, usize> = HashMap::new();
        let mut path = Vec::new();
        let mut current = start;

        loop {
            if let Some(&pos) = position.get(&current) {
                return path.split_off(pos);
            }
            position.insert(current, path.len());
            path.push(current);
            match self.pred[current]
                .iter()
                .copied()
                .filter(|p| remaining.contains(p))
                .min()
            {
                Some(p) => current = p,
                None => return Vec::new(),
            }
        }
    }

    /// The `Old` slot whose staging breaks the lowest cycle
    fn slot_to_stage(&self, nodes: &[Node], remaining: &BTreeSet<usize>) -> Option<Slot> {
        let cycle = self.find_cycle(remaining);
        // cycle[k + 1] precedes cycle[k]; the last one precedes the first
        let edges = (0..cycle.len()).map(|k| (cycle[(k + 1) % cycle.len()], cycle[k]));

        edges
            .flat_map(|(from, to)| {
                nodes[from]
                    .old_slots()
                    .filter(move |slot| self.waiting.get(*slot).is_some_and(|w| w.contains(&to)))
                    .map(move |slot| (from, slot.clone()))
            })
            .min()
            .map(|(_, slot)| slot)
    }
}

/// Remote paths whose old content must leave before `dst` is written:
/// `dst` itself, files at its parent directories, and files beneath it
fn conflicting_remote_paths<'a>(remote: &'a Snapshot, dst: &'a Path) -> Vec<&'a Path> {
    let mut paths = Vec::new();
    if remote.contains(dst) {
        paths.push(dst);
    }
    for ancestor in dst.ancestors().skip(1) {
        if ancestor.as_os_str().is_empty() {
            break;
        }
        if let Some((path, _)) = remote.files.get_key_value(ancestor) {
            paths.push(path.as_path());
        }
    }
    paths.extend(
        remote
            .files
            .range::<Path, _>((Bound::Excluded(dst), Bound::Unbounded))
            .map(|(p, _)| p.as_path())
            .take_while(|p| p.starts_with(dst)),
    );
    paths
}

fn schedule(
    mut nodes: Vec<Node>,
    remote: &Snapshot,
    stages: &mut StageNames<'_>,
) -> Result<Vec<Operation>, PlanConflict> {
    // Every staging retires one old slot for good
    let max_rounds = nodes.len() + 1;

    for _ in 0..=max_rounds {
        let graph = Graph::build(&nodes, remote)?;
        match graph.order() {
            Ok(order) => {
                return Ok(order.into_iter().map(|i| nodes[i].op.clone()).collect());
            }
            Err(remaining) => {
                let slot = graph.slot_to_stage(&nodes, &remaining).ok_or(
                    PlanConflict::UnresolvableCycle {
                        remaining: remaining.len(),
                    },
                )?;
                let stage = stages.next();
                debug!("Breaking cycle of {} operations via {}", remaining.len(), stage.display());
                stage_slot(&mut nodes, &slot, stage);
            }
        }
    }

    Err(PlanConflict::UnresolvableCycle {
        remaining: nodes.len(),
    })
}

/// Move `Old(p)` aside first and serve its readers from the staging path
fn stage_slot(nodes: &mut Vec<Node>, slot: &Slot, stage: PathBuf) {
    let had_vacator = nodes.iter().any(|n| n.vacates.as_ref() == Some(slot));
    for node in nodes.iter_mut() {
        node.redirect(slot, &stage);
    }

    nodes.push(Node::moved(slot.clone(), stage.clone()));
    if !had_vacator {
        nodes.push(Node::delete(Slot::New(stage)));
    }
}
