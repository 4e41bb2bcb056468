//! Call-tree node: one function at one position in the tree.

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::domain::{Duration, FunctionId, NodeId};
use crate::symbolization::FunctionDebugInfo;

// =============================================================================
// NODE KIND
// =============================================================================

/// Execution mode of the code a node stands for. Set once, from the first
/// frame that reaches the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Unset,
    NativeUser,
    NativeKernel,
    Managed,
}

impl NodeKind {
    fn to_raw(self) -> u8 {
        match self {
            Self::Unset => 0,
            Self::NativeUser => 1,
            Self::NativeKernel => 2,
            Self::Managed => 3,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::NativeUser,
            2 => Self::NativeKernel,
            3 => Self::Managed,
            _ => Self::Unset,
        }
    }
}

// =============================================================================
// CALL SITES
// =============================================================================

/// Weight flowing into one callee node from a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTarget {
    pub node: NodeId,
    pub weight: Duration,
}

/// A call instruction inside a node's function, identified by the RVA of
/// the frame, and the nodes it was seen calling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub rva: u64,
    /// Total weight of all targets.
    pub weight: Duration,
    pub targets: Vec<CallTarget>,
}

impl CallSite {
    #[must_use]
    pub fn new(rva: u64) -> Self {
        Self { rva, weight: Duration::ZERO, targets: Vec::new() }
    }

    pub fn add_target(&mut self, node: NodeId, weight: Duration) {
        self.weight += weight;
        match self.targets.iter_mut().find(|target| target.node == node) {
            Some(target) => target.weight += weight,
            None => self.targets.push(CallTarget { node, weight }),
        }
    }

    #[must_use]
    pub fn has_single_target(&self) -> bool {
        self.targets.len() == 1
    }
}

// =============================================================================
// NODE
// =============================================================================

#[derive(Default)]
pub(crate) struct NodeEdges {
    pub(crate) children: Vec<Arc<CallTreeNode>>,
    pub(crate) callers: Vec<Weak<CallTreeNode>>,
    pub(crate) call_sites: BTreeMap<u64, CallSite>,
}

/// A registered call-tree node.
///
/// Identity is the pair (debug info, function); the id is unique inside
/// the owning [`CallTree`](super::CallTree). Weights are atomics so samples
/// can be folded in from several threads; children, callers and call sites
/// share one per-node lock.
///
/// Children are owned (`Arc`), callers are back-edges (`Weak`). Every node
/// is also held by the tree's index, so a caller stays alive as long as the
/// tree does.
pub struct CallTreeNode {
    id: NodeId,
    function: FunctionId,
    debug_info: Arc<FunctionDebugInfo>,
    kind: AtomicU8,
    weight: AtomicU64,
    exclusive_weight: AtomicU64,
    edges: RwLock<NodeEdges>,
}

impl CallTreeNode {
    pub(crate) fn new(
        id: NodeId,
        debug_info: Arc<FunctionDebugInfo>,
        function: FunctionId,
    ) -> Self {
        Self {
            id,
            function,
            debug_info,
            kind: AtomicU8::new(NodeKind::Unset.to_raw()),
            weight: AtomicU64::new(0),
            exclusive_weight: AtomicU64::new(0),
            edges: RwLock::new(NodeEdges::default()),
        }
    }

    /// Rebuild a node from its persisted state, without edges.
    pub(crate) fn restore(
        id: NodeId,
        debug_info: Arc<FunctionDebugInfo>,
        function: FunctionId,
        kind: NodeKind,
        weight: Duration,
        exclusive_weight: Duration,
        call_sites: BTreeMap<u64, CallSite>,
    ) -> Self {
        let node = Self::new(id, debug_info, function);
        node.kind.store(kind.to_raw(), Ordering::Relaxed);
        node.weight.store(weight.0, Ordering::Relaxed);
        node.exclusive_weight.store(exclusive_weight.0, Ordering::Relaxed);
        node.edges.write().call_sites = call_sites;
        node
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn function(&self) -> FunctionId {
        self.function
    }

    #[must_use]
    pub fn debug_info(&self) -> &Arc<FunctionDebugInfo> {
        &self.debug_info
    }

    #[must_use]
    pub fn function_name(&self) -> &str {
        &self.debug_info.name
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        NodeKind::from_raw(self.kind.load(Ordering::Relaxed))
    }

    /// Set the kind unless another sample already did.
    pub fn set_kind_if_unset(&self, kind: NodeKind) {
        let _ = self.kind.compare_exchange(
            NodeKind::Unset.to_raw(),
            kind.to_raw(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Inclusive weight.
    #[must_use]
    pub fn weight(&self) -> Duration {
        Duration(self.weight.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn exclusive_weight(&self) -> Duration {
        Duration(self.exclusive_weight.load(Ordering::Relaxed))
    }

    pub fn accumulate_weight(&self, weight: Duration) {
        self.weight.fetch_add(weight.0, Ordering::Relaxed);
    }

    pub fn accumulate_exclusive_weight(&self, weight: Duration) {
        self.exclusive_weight.fetch_add(weight.0, Ordering::Relaxed);
    }

    /// Whether this node stands for `function` described by `debug_info`.
    #[must_use]
    pub fn matches(&self, debug_info: &FunctionDebugInfo, function: FunctionId) -> bool {
        self.function == function && *self.debug_info == *debug_info
    }

    // === EDGES ===

    /// Snapshot of the child list.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<CallTreeNode>> {
        self.edges.read().children.clone()
    }

    #[must_use]
    pub fn has_children(&self) -> bool {
        !self.edges.read().children.is_empty()
    }

    /// Sum of the children's inclusive and exclusive weights.
    #[must_use]
    pub fn children_weight(&self) -> (Duration, Duration) {
        let edges = self.edges.read();
        let weight = edges.children.iter().map(|child| child.weight()).sum();
        let exclusive = edges.children.iter().map(|child| child.exclusive_weight()).sum();
        (weight, exclusive)
    }

    /// Snapshot of the caller list.
    #[must_use]
    pub fn callers(&self) -> Vec<Arc<CallTreeNode>> {
        self.edges.read().callers.iter().filter_map(Weak::upgrade).collect()
    }

    /// The caller the node was created under, `None` for roots.
    #[must_use]
    pub fn caller(&self) -> Option<Arc<CallTreeNode>> {
        self.edges.read().callers.first().and_then(Weak::upgrade)
    }

    #[must_use]
    pub fn has_caller(&self, parent: &Arc<CallTreeNode>) -> bool {
        let target = Arc::downgrade(parent);
        self.edges.read().callers.iter().any(|caller| caller.ptr_eq(&target))
    }

    /// Snapshot of the call sites, ordered by RVA.
    #[must_use]
    pub fn call_sites(&self) -> Vec<CallSite> {
        self.edges.read().call_sites.values().cloned().collect()
    }

    /// Record that the frame at `rva` inside this node's function called
    /// `child` in a sample of `weight`.
    pub fn add_call_site(&self, child: &CallTreeNode, rva: u64, weight: Duration) {
        self.edges
            .write()
            .call_sites
            .entry(rva)
            .or_insert_with(|| CallSite::new(rva))
            .add_target(child.id, weight);
    }

    /// Child matching (debug info, function), created through `create` if
    /// absent. The flag is true when this call inserted the child.
    ///
    /// `create` runs under this node's write lock; the child only becomes
    /// visible in [`children`](Self::children) once it returns.
    pub(crate) fn get_or_create_child<F>(
        &self,
        debug_info: &Arc<FunctionDebugInfo>,
        function: FunctionId,
        create: F,
    ) -> (Arc<CallTreeNode>, bool)
    where
        F: FnOnce() -> Arc<CallTreeNode>,
    {
        find_or_insert(
            &self.edges,
            |edges| find_matching(&edges.children, debug_info, function),
            |edges| {
                let child = create();
                edges.children.push(Arc::clone(&child));
                child
            },
        )
    }

    /// Record `parent` as a caller unless an equal caller is present.
    pub(crate) fn add_caller(&self, parent: &Arc<CallTreeNode>) {
        let is_known = |edges: &NodeEdges| {
            edges.callers.iter().filter_map(Weak::upgrade).find(|caller| {
                caller.matches(&parent.debug_info, parent.function)
            })
        };

        find_or_insert(&self.edges, is_known, |edges| {
            edges.callers.push(Arc::downgrade(parent));
            Arc::clone(parent)
        });
    }

    /// Restore-time edge setup: nothing else can see the node yet.
    pub(crate) fn set_children(&self, children: Vec<Arc<CallTreeNode>>) {
        self.edges.write().children = children;
    }

    pub(crate) fn push_caller(&self, parent: &Arc<CallTreeNode>) {
        self.edges.write().callers.push(Arc::downgrade(parent));
    }

    pub(crate) fn call_site_map(&self) -> BTreeMap<u64, CallSite> {
        self.edges.read().call_sites.clone()
    }

    pub(crate) fn child_ids(&self) -> Vec<NodeId> {
        self.edges.read().children.iter().map(|child| child.id).collect()
    }

    // === DEBUG OUTPUT ===

    pub(crate) fn print(&self, out: &mut String, level: usize, max_depth: usize) {
        use std::fmt::Write as _;

        let indent = "    ".repeat(level);
        let _ = writeln!(
            out,
            "{indent}{}, RVA {:#x}, Id {}",
            self.debug_info.name, self.debug_info.rva, self.id.0
        );
        let _ = writeln!(out, "{indent}    weight {}", self.weight());
        let _ = writeln!(out, "{indent}    exc weight {}", self.exclusive_weight());

        let children = self.children();
        let _ = writeln!(out, "{indent}    callees: {}", children.len());

        if level + 1 < max_depth {
            for child in &children {
                child.print(out, level + 1, max_depth);
            }
        }
    }
}

impl fmt::Debug for CallTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallTreeNode")
            .field("id", &self.id)
            .field("function", &self.function)
            .field("name", &self.debug_info.name)
            .field("weight", &self.weight())
            .field("exclusive_weight", &self.exclusive_weight())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for CallTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, weight: {}, exc weight: {}",
            self.debug_info.name,
            self.weight(),
            self.exclusive_weight()
        )
    }
}

/// Linear scan by identity. Fan-out per node is usually small.
pub(crate) fn find_matching(
    nodes: &[Arc<CallTreeNode>],
    debug_info: &FunctionDebugInfo,
    function: FunctionId,
) -> Option<Arc<CallTreeNode>> {
    nodes.iter().find(|node| node.matches(debug_info, function)).cloned()
}

/// Look up under a shared lock; on a miss take the upgradable lock, look
/// again (another thread may have inserted in between) and only then
/// upgrade to exclusive and insert.
///
/// Returns the found or inserted value and whether this call inserted it.
pub(crate) fn find_or_insert<E, T, F, I>(lock: &RwLock<E>, find: F, insert: I) -> (T, bool)
where
    F: Fn(&E) -> Option<T>,
    I: FnOnce(&mut E) -> T,
{
    let existing = find(&lock.read());
    if let Some(found) = existing {
        return (found, false);
    }

    let guard = lock.upgradable_read();
    if let Some(found) = find(&guard) {
        return (found, false);
    }

    let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
    (insert(&mut guard), true)
}

// =============================================================================
// SUMMARIES
// =============================================================================

/// Weights of one function, summed over several nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub function: FunctionId,
    pub debug_info: Arc<FunctionDebugInfo>,
    pub kind: NodeKind,
    pub weight: Duration,
    pub exclusive_weight: Duration,
    /// How many nodes were folded in.
    pub instances: usize,
}

impl NodeSummary {
    pub(crate) fn empty(node: &CallTreeNode) -> Self {
        Self {
            function: node.function,
            debug_info: Arc::clone(&node.debug_info),
            kind: node.kind(),
            weight: Duration::ZERO,
            exclusive_weight: Duration::ZERO,
            instances: 0,
        }
    }

    pub(crate) fn add(&mut self, node: &CallTreeNode) {
        self.weight += node.weight();
        self.exclusive_weight += node.exclusive_weight();
        self.instances += 1;
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.debug_info.name
    }
}

/// Merge `node` into the summary with the same identity, or append one.
pub(crate) fn fold_into(summaries: &mut Vec<NodeSummary>, node: &CallTreeNode) {
    let position = summaries.iter().position(|summary| {
        summary.function == node.function && *summary.debug_info == *node.debug_info
    });

    let summary = match position {
        Some(position) => &mut summaries[position],
        None => {
            summaries.push(NodeSummary::empty(node));
            let last = summaries.len() - 1;
            &mut summaries[last]
        }
    };
    summary.add(node);
}

/// Every instance of one function merged into a single view.
///
/// Children and callers are unioned by identity with their weights summed,
/// call sites by RVA with their targets summed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedNode {
    pub function: FunctionId,
    pub debug_info: Arc<FunctionDebugInfo>,
    pub kind: NodeKind,
    pub weight: Duration,
    pub exclusive_weight: Duration,
    /// Ids of the merged nodes, heaviest first.
    pub instances: Vec<NodeId>,
    pub children: Vec<NodeSummary>,
    pub callers: Vec<NodeSummary>,
    pub call_sites: Vec<CallSite>,
}

impl CombinedNode {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.debug_info.name
    }
}
