//! The call tree: a forest of [`CallTreeNode`]s plus the indexes used to
//! answer per-function queries.

use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::node::{
    find_matching, find_or_insert, fold_into, CallSite, CallTreeNode, CombinedNode, NodeKind,
    NodeSummary,
};
use crate::domain::{Duration, ExportError, FunctionId, ModuleId, NodeId};
use crate::model::FxHashMap;
use crate::symbolization::FunctionDebugInfo;

/// Every node of the tree, by function and by id. Guarded by a lock of its
/// own, separate from the per-node locks.
#[derive(Default)]
struct NodeIndex {
    by_function: FxHashMap<FunctionId, Vec<Arc<CallTreeNode>>>,
    by_id: FxHashMap<NodeId, Arc<CallTreeNode>>,
}

/// Exclusive weight of one module summed over a subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleWeight {
    pub module: ModuleId,
    pub weight: Duration,
    /// Nodes whose function lives in the module.
    pub nodes: usize,
}

/// Aggregated call tree built during ingestion.
///
/// All mutation goes through `&self`: the tree can be shared between
/// threads that fold samples in concurrently.
pub struct CallTree {
    roots: RwLock<Vec<Arc<CallTreeNode>>>,
    index: RwLock<NodeIndex>,
    /// Last id handed out. The first node gets id 1.
    next_node_id: AtomicU64,
}

impl Default for CallTree {
    fn default() -> Self {
        Self::new()
    }
}

impl CallTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            roots: RwLock::new(Vec::new()),
            index: RwLock::new(NodeIndex::default()),
            next_node_id: AtomicU64::new(0),
        }
    }

    fn allocate_id(&self) -> NodeId {
        NodeId(self.next_node_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    // =========================================================================
    // CONSTRUCTION
    // =========================================================================

    /// The root for (debug info, function), created and registered if this
    /// is its first occurrence.
    pub fn add_root_node(
        &self,
        debug_info: &Arc<FunctionDebugInfo>,
        function: FunctionId,
    ) -> Arc<CallTreeNode> {
        let (node, _) = find_or_insert(
            &self.roots,
            |roots| find_matching(roots, debug_info, function),
            |roots| {
                let node = self.new_node(debug_info, function);
                self.register(&node);
                roots.push(Arc::clone(&node));
                node
            },
        );
        node
    }

    /// The child of `parent` for (debug info, function), created and
    /// registered if absent. A new child records `parent` as its caller.
    ///
    /// The child is indexed and linked to its caller before it is published
    /// in the parent's child list.
    pub fn add_child_node(
        &self,
        parent: &Arc<CallTreeNode>,
        debug_info: &Arc<FunctionDebugInfo>,
        function: FunctionId,
    ) -> Arc<CallTreeNode> {
        let (child, _) = parent.get_or_create_child(debug_info, function, || {
            let child = self.new_node(debug_info, function);
            child.add_caller(parent);
            self.register(&child);
            child
        });
        child
    }

    fn new_node(
        &self,
        debug_info: &Arc<FunctionDebugInfo>,
        function: FunctionId,
    ) -> Arc<CallTreeNode> {
        Arc::new(CallTreeNode::new(self.allocate_id(), Arc::clone(debug_info), function))
    }

    fn register(&self, node: &Arc<CallTreeNode>) {
        let mut index = self.index.write();
        index.by_function.entry(node.function()).or_default().push(Arc::clone(node));
        index.by_id.insert(node.id(), Arc::clone(node));
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    #[must_use]
    pub fn root_nodes(&self) -> Vec<Arc<CallTreeNode>> {
        self.roots.read().clone()
    }

    #[must_use]
    pub fn find_root_node(&self, function: FunctionId) -> Option<Arc<CallTreeNode>> {
        self.roots.read().iter().find(|root| root.function() == function).cloned()
    }

    #[must_use]
    pub fn total_root_nodes_weight(&self) -> Duration {
        self.roots.read().iter().map(|root| root.weight()).sum()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.index.read().by_id.len()
    }

    #[must_use]
    pub fn function_count(&self) -> usize {
        self.index.read().by_function.len()
    }

    #[must_use]
    pub fn find_node(&self, id: NodeId) -> Option<Arc<CallTreeNode>> {
        self.index.read().by_id.get(&id).cloned()
    }

    /// All nodes of `function`, in creation order.
    #[must_use]
    pub fn get_call_tree_nodes(&self, function: FunctionId) -> Vec<Arc<CallTreeNode>> {
        self.index.read().by_function.get(&function).cloned().unwrap_or_default()
    }

    /// All nodes of `function`, heaviest first.
    #[must_use]
    pub fn get_sorted_call_tree_nodes(&self, function: FunctionId) -> Vec<Arc<CallTreeNode>> {
        let mut nodes = self.get_call_tree_nodes(function);
        nodes.sort_by(|a, b| b.weight().cmp(&a.weight()).then(a.id().cmp(&b.id())));
        nodes
    }

    /// Sum of the weights of every node of `function`.
    #[must_use]
    pub fn get_combined_call_tree_node_weight(&self, function: FunctionId) -> Duration {
        self.get_call_tree_nodes(function).iter().map(|node| node.weight()).sum()
    }

    /// Merge every node of `function` into one view. With `parent`, only
    /// the nodes called by that node are merged. `None` when nothing
    /// matches.
    #[must_use]
    pub fn get_combined_call_tree_node(
        &self,
        function: FunctionId,
        parent: Option<&Arc<CallTreeNode>>,
    ) -> Option<CombinedNode> {
        let nodes: Vec<Arc<CallTreeNode>> = self
            .get_sorted_call_tree_nodes(function)
            .into_iter()
            .filter(|node| parent.map_or(true, |parent| node.has_caller(parent)))
            .collect();
        let first = nodes.first()?;

        let mut combined = CombinedNode {
            function,
            debug_info: Arc::clone(first.debug_info()),
            kind: first.kind(),
            weight: Duration::ZERO,
            exclusive_weight: Duration::ZERO,
            instances: Vec::with_capacity(nodes.len()),
            children: Vec::new(),
            callers: Vec::new(),
            call_sites: Vec::new(),
        };
        let mut call_sites: BTreeMap<u64, CallSite> = BTreeMap::new();

        for node in &nodes {
            combined.weight += node.weight();
            combined.exclusive_weight += node.exclusive_weight();
            combined.instances.push(node.id());

            for child in node.children() {
                fold_into(&mut combined.children, &child);
            }
            for caller in node.callers() {
                fold_into(&mut combined.callers, &caller);
            }
            for site in node.call_sites() {
                let merged = call_sites.entry(site.rva).or_insert_with(|| CallSite::new(site.rva));
                for target in &site.targets {
                    merged.add_target(target.node, target.weight);
                }
            }
        }

        combined.call_sites = call_sites.into_values().collect();
        Some(combined)
    }

    /// The node in this tree at the same position as `query` from another
    /// tree: same function at every level up to the root.
    #[must_use]
    pub fn find_matching_node(&self, query: &Arc<CallTreeNode>) -> Option<Arc<CallTreeNode>> {
        self.get_call_tree_nodes(query.function()).into_iter().find(|candidate| {
            if Arc::ptr_eq(candidate, query) {
                return true;
            }

            let mut a = Some(Arc::clone(candidate));
            let mut b = Some(Arc::clone(query));
            loop {
                match (a, b) {
                    (None, None) => return true,
                    (Some(node_a), Some(node_b)) if node_a.function() == node_b.function() => {
                        a = node_a.caller();
                        b = node_b.caller();
                    }
                    _ => return false,
                }
            }
        })
    }

    /// Callers of `node` up to its root, nearest first.
    #[must_use]
    pub fn get_backtrace(&self, node: &Arc<CallTreeNode>) -> Vec<Arc<CallTreeNode>> {
        let mut backtrace = Vec::new();
        let mut current = node.caller();

        while let Some(caller) = current {
            current = caller.caller();
            backtrace.push(caller);
        }
        backtrace
    }

    /// Functions of the whole tree, instances merged, by exclusive weight.
    #[must_use]
    pub fn get_top_functions(&self) -> Vec<NodeSummary> {
        Self::top_functions(&self.root_nodes())
    }

    /// Functions of the subtree under `node`, instances merged, by
    /// exclusive weight.
    #[must_use]
    pub fn top_functions_under(&self, node: &Arc<CallTreeNode>) -> Vec<NodeSummary> {
        Self::top_functions(std::slice::from_ref(node))
    }

    fn top_functions(start: &[Arc<CallTreeNode>]) -> Vec<NodeSummary> {
        let mut by_function: FxHashMap<(FunctionId, u64), NodeSummary> = FxHashMap::default();

        walk(start, |node| {
            by_function
                .entry((node.function(), node.debug_info().rva))
                .or_insert_with(|| NodeSummary::empty(node))
                .add(node);
        });

        let mut functions: Vec<NodeSummary> = by_function.into_values().collect();
        functions.sort_by(|a, b| {
            b.exclusive_weight
                .cmp(&a.exclusive_weight)
                .then(b.weight.cmp(&a.weight))
                .then(a.function.cmp(&b.function))
        });
        functions
    }

    /// Modules of the whole tree by summed exclusive weight.
    #[must_use]
    pub fn get_top_modules(&self) -> Vec<ModuleWeight> {
        Self::top_modules(&self.root_nodes())
    }

    #[must_use]
    pub fn top_modules_under(&self, node: &Arc<CallTreeNode>) -> Vec<ModuleWeight> {
        Self::top_modules(std::slice::from_ref(node))
    }

    fn top_modules(start: &[Arc<CallTreeNode>]) -> Vec<ModuleWeight> {
        let mut by_module: FxHashMap<ModuleId, ModuleWeight> = FxHashMap::default();

        walk(start, |node| {
            let module = node.function().module;
            let entry = by_module.entry(module).or_insert(ModuleWeight {
                module,
                weight: Duration::ZERO,
                nodes: 0,
            });
            entry.weight += node.exclusive_weight();
            entry.nodes += 1;
        });

        let mut modules: Vec<ModuleWeight> = by_module.into_values().collect();
        modules.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.module.cmp(&b.module)));
        modules
    }

    /// Indented dump of the tree, `max_depth` levels deep.
    #[must_use]
    pub fn print(&self, max_depth: usize) -> String {
        let mut out = String::new();
        for root in self.root_nodes() {
            out.push_str("Call tree root node\n");
            out.push_str("-----------------------\n");
            root.print(&mut out, 0, max_depth);
        }
        out
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    /// Snapshot for persistence. Nodes are ordered by id and functions by
    /// id, so equal trees produce equal states.
    #[must_use]
    pub fn to_state(&self) -> CallTreeState {
        // Node locks are taken after the index lock is released.
        let (all_nodes, mut function_nodes) = {
            let index = self.index.read();
            let all_nodes: Vec<Arc<CallTreeNode>> = index.by_id.values().cloned().collect();
            let function_nodes: Vec<FunctionNodes> = index
                .by_function
                .iter()
                .map(|(function, nodes)| FunctionNodes {
                    function: *function,
                    nodes: nodes.iter().map(|node| node.id()).collect(),
                })
                .collect();
            (all_nodes, function_nodes)
        };

        let mut nodes: Vec<NodeState> = all_nodes
            .iter()
            .map(|node| NodeState {
                id: node.id(),
                function: node.function(),
                debug_info: (**node.debug_info()).clone(),
                kind: node.kind(),
                weight: node.weight(),
                exclusive_weight: node.exclusive_weight(),
                children: node.child_ids(),
                call_sites: node.call_site_map().into_values().collect(),
            })
            .collect();
        nodes.sort_by_key(|node| node.id);
        function_nodes.sort_by_key(|entry| entry.function);

        CallTreeState {
            next_node_id: self.next_node_id.load(Ordering::Relaxed),
            root_node_ids: self.roots.read().iter().map(|root| root.id()).collect(),
            nodes,
            function_nodes,
        }
    }

    /// Rebuild a tree from a snapshot. Caller back-edges are not persisted
    /// and are recreated from the child lists.
    ///
    /// # Errors
    /// Returns `CorruptProfile` when the state references unknown or
    /// duplicate node ids.
    pub fn from_state(state: CallTreeState) -> Result<Self, ExportError> {
        let mut nodes: FxHashMap<NodeId, Arc<CallTreeNode>> = FxHashMap::default();
        let mut children: Vec<(NodeId, Vec<NodeId>)> = Vec::with_capacity(state.nodes.len());

        for node in state.nodes {
            if node.id.0 == 0 || node.id.0 > state.next_node_id {
                return Err(ExportError::CorruptProfile(format!("{} out of range", node.id)));
            }

            let call_sites = node.call_sites.into_iter().map(|site| (site.rva, site)).collect();
            let restored = CallTreeNode::restore(
                node.id,
                Arc::new(node.debug_info),
                node.function,
                node.kind,
                node.weight,
                node.exclusive_weight,
                call_sites,
            );

            if nodes.insert(node.id, Arc::new(restored)).is_some() {
                return Err(ExportError::CorruptProfile(format!("duplicate {}", node.id)));
            }
            if !node.children.is_empty() {
                children.push((node.id, node.children));
            }
        }

        let lookup = |id: NodeId| {
            nodes
                .get(&id)
                .cloned()
                .ok_or_else(|| ExportError::CorruptProfile(format!("unknown {id}")))
        };

        for (parent_id, child_ids) in children {
            let parent = lookup(parent_id)?;
            let child_nodes = child_ids.into_iter().map(lookup).collect::<Result<Vec<_>, _>>()?;
            for child in &child_nodes {
                child.push_caller(&parent);
            }
            parent.set_children(child_nodes);
        }

        let mut by_function = FxHashMap::default();
        for entry in state.function_nodes {
            let list = entry.nodes.into_iter().map(lookup).collect::<Result<Vec<_>, _>>()?;
            by_function.insert(entry.function, list);
        }

        let roots = state.root_node_ids.into_iter().map(lookup).collect::<Result<Vec<_>, _>>()?;

        debug!("restored call tree: {} nodes, {} roots", nodes.len(), roots.len());
        Ok(Self {
            roots: RwLock::new(roots),
            index: RwLock::new(NodeIndex { by_function, by_id: nodes }),
            next_node_id: AtomicU64::new(state.next_node_id),
        })
    }
}

/// Pre-order visit of every node reachable from `start`.
fn walk<F: FnMut(&CallTreeNode)>(start: &[Arc<CallTreeNode>], mut visit: F) {
    let mut pending: Vec<Arc<CallTreeNode>> = start.iter().rev().cloned().collect();

    while let Some(node) = pending.pop() {
        visit(&node);
        let children = node.children();
        pending.extend(children.into_iter().rev());
    }
}

impl fmt::Debug for CallTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallTree")
            .field("roots", &self.roots.read().len())
            .field("nodes", &self.node_count())
            .field("next_node_id", &self.next_node_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl fmt::Display for CallTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Root nodes: {}, Weight: {}",
            self.roots.read().len(),
            self.total_root_nodes_weight()
        )
    }
}

// =============================================================================
// PERSISTED STATE
// =============================================================================

/// Persisted form of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub id: NodeId,
    pub function: FunctionId,
    pub debug_info: FunctionDebugInfo,
    pub kind: NodeKind,
    pub weight: Duration,
    pub exclusive_weight: Duration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub call_sites: Vec<CallSite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionNodes {
    pub function: FunctionId,
    pub nodes: Vec<NodeId>,
}

/// Persisted form of a whole tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTreeState {
    pub next_node_id: u64,
    pub root_node_ids: Vec<NodeId>,
    pub nodes: Vec<NodeState>,
    pub function_nodes: Vec<FunctionNodes>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Funcs {
        infos: Vec<Arc<FunctionDebugInfo>>,
    }

    impl Funcs {
        fn new(names: &[&str]) -> Self {
            let infos = names
                .iter()
                .zip(0u64..)
                .map(|(name, i)| Arc::new(FunctionDebugInfo::new(*name, 0x1000 * (i + 1), 0x100)))
                .collect();
            Self { infos }
        }

        fn id(&self, name: &str) -> FunctionId {
            let number = self.infos.iter().position(|info| info.name == name).unwrap();
            FunctionId::new(ModuleId(1), u32::try_from(number).unwrap())
        }

        fn info(&self, name: &str) -> &Arc<FunctionDebugInfo> {
            &self.infos[self.id(name).number as usize]
        }
    }

    /// Add a root-to-leaf path, weighting every node and the leaf's
    /// exclusive weight.
    fn add_path(tree: &CallTree, funcs: &Funcs, path: &[&str], weight: u64) -> Arc<CallTreeNode> {
        let weight = Duration(weight);
        let mut node = tree.add_root_node(funcs.info(path[0]), funcs.id(path[0]));
        node.accumulate_weight(weight);

        for name in &path[1..] {
            let child = tree.add_child_node(&node, funcs.info(name), funcs.id(name));
            node.add_call_site(&child, node.debug_info().rva + 0x10, weight);
            child.accumulate_weight(weight);
            node = child;
        }
        node.accumulate_exclusive_weight(weight);
        node
    }

    #[test]
    fn test_roots_are_deduplicated() {
        let funcs = Funcs::new(&["main"]);
        let tree = CallTree::new();

        let first = tree.add_root_node(funcs.info("main"), funcs.id("main"));
        let second = tree.add_root_node(funcs.info("main"), funcs.id("main"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.id(), NodeId(1));
        assert_eq!(tree.root_nodes().len(), 1);
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn test_child_records_caller_and_index() {
        let funcs = Funcs::new(&["main", "foo"]);
        let tree = CallTree::new();
        let leaf = add_path(&tree, &funcs, &["main", "foo"], 10);

        let root = tree.find_node(NodeId(1)).unwrap();
        assert_eq!(leaf.id(), NodeId(2));
        assert!(leaf.has_caller(&root));
        assert_eq!(tree.get_call_tree_nodes(funcs.id("foo")).len(), 1);
        assert_eq!(tree.get_backtrace(&leaf).iter().map(|n| n.id()).collect::<Vec<_>>(), vec![
            NodeId(1)
        ]);
    }

    #[test]
    fn test_combined_node_conserves_weight() {
        let funcs = Funcs::new(&["main", "a", "b", "c", "f", "g"]);
        let tree = CallTree::new();
        add_path(&tree, &funcs, &["main", "a", "f"], 3);
        add_path(&tree, &funcs, &["main", "b", "f", "g"], 5);
        add_path(&tree, &funcs, &["main", "c", "f"], 7);

        let instances = tree.get_call_tree_nodes(funcs.id("f"));
        assert_eq!(instances.len(), 3);
        let individual: Duration = instances.iter().map(|node| node.weight()).sum();

        let combined = tree.get_combined_call_tree_node(funcs.id("f"), None).unwrap();
        assert_eq!(combined.weight, individual);
        assert_eq!(combined.weight, Duration(15));
        assert_eq!(combined.exclusive_weight, Duration(10));
        assert_eq!(combined.instances.len(), 3);
        assert_eq!(tree.get_combined_call_tree_node_weight(funcs.id("f")), Duration(15));

        // Three distinct callers, one child.
        assert_eq!(combined.callers.len(), 3);
        let caller_total: Duration = combined.callers.iter().map(|caller| caller.weight).sum();
        assert_eq!(caller_total, Duration(15));
        assert_eq!(combined.children.len(), 1);
        assert_eq!(combined.children[0].name(), "g");
        assert_eq!(combined.children[0].weight, Duration(5));
    }

    #[test]
    fn test_combined_node_filtered_by_parent() {
        let funcs = Funcs::new(&["main", "a", "b", "f"]);
        let tree = CallTree::new();
        add_path(&tree, &funcs, &["main", "a", "f"], 3);
        add_path(&tree, &funcs, &["main", "b", "f"], 5);

        let b = tree.get_call_tree_nodes(funcs.id("b")).remove(0);
        let combined = tree.get_combined_call_tree_node(funcs.id("f"), Some(&b)).unwrap();
        assert_eq!(combined.weight, Duration(5));
        assert_eq!(combined.instances.len(), 1);

        let main = tree.find_root_node(funcs.id("main")).unwrap();
        assert!(tree.get_combined_call_tree_node(funcs.id("f"), Some(&main)).is_none());
    }

    #[test]
    fn test_sorted_nodes_heaviest_first() {
        let funcs = Funcs::new(&["main", "a", "b", "f"]);
        let tree = CallTree::new();
        add_path(&tree, &funcs, &["main", "a", "f"], 3);
        add_path(&tree, &funcs, &["main", "b", "f"], 5);

        let weights: Vec<Duration> = tree
            .get_sorted_call_tree_nodes(funcs.id("f"))
            .iter()
            .map(|node| node.weight())
            .collect();
        assert_eq!(weights, vec![Duration(5), Duration(3)]);
    }

    #[test]
    fn test_top_functions_and_modules() {
        let funcs = Funcs::new(&["main", "a", "b", "f"]);
        let tree = CallTree::new();
        add_path(&tree, &funcs, &["main", "a", "f"], 3);
        add_path(&tree, &funcs, &["main", "b", "f"], 5);
        add_path(&tree, &funcs, &["main", "a"], 1);

        let top = tree.get_top_functions();
        assert_eq!(top[0].name(), "f");
        assert_eq!(top[0].exclusive_weight, Duration(8));
        assert_eq!(top[0].instances, 2);
        assert_eq!(top[1].name(), "a");

        let modules = tree.get_top_modules();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].weight, Duration(9));
        assert_eq!(modules[0].nodes, 5);
        assert_eq!(tree.total_root_nodes_weight(), Duration(9));
    }

    #[test]
    fn test_find_matching_node_across_trees() {
        let funcs = Funcs::new(&["main", "a", "b", "f"]);
        let first = CallTree::new();
        let second = CallTree::new();

        add_path(&first, &funcs, &["main", "a", "f"], 1);
        add_path(&first, &funcs, &["main", "b", "f"], 1);
        // Different creation order: ids differ between the trees.
        add_path(&second, &funcs, &["main", "b", "f"], 1);
        let query = add_path(&second, &funcs, &["main", "a", "f"], 1);

        let found = first.find_matching_node(&query).unwrap();
        assert_eq!(first.get_backtrace(&found)[0].function_name(), "a");
        assert_ne!(found.id(), query.id());
    }

    #[test]
    fn test_concurrent_insertion_creates_one_node() {
        let funcs = Funcs::new(&["main", "worker"]);
        let tree = CallTree::new();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        add_path(&tree, &funcs, &["main", "worker"], 1);
                    }
                });
            }
        });

        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.to_state().next_node_id, 2);
        let root = tree.find_root_node(funcs.id("main")).unwrap();
        assert_eq!(root.weight(), Duration(4000));
        assert_eq!(root.children().len(), 1);
        assert_eq!(root.children()[0].exclusive_weight(), Duration(4000));
        assert_eq!(root.children()[0].callers().len(), 1);
    }

    #[test]
    fn test_visible_child_is_indexed_and_linked() {
        let names: Vec<String> = (0..64).map(|i| format!("callee{i}")).collect();
        let mut all: Vec<&str> = vec!["main"];
        all.extend(names.iter().map(String::as_str));
        let funcs = Funcs::new(&all);
        let tree = CallTree::new();
        let root = tree.add_root_node(funcs.info("main"), funcs.id("main"));
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            for chunk in names.chunks(16) {
                let (tree, funcs, root) = (&tree, &funcs, &root);
                scope.spawn(move || {
                    for name in chunk {
                        tree.add_child_node(root, funcs.info(name), funcs.id(name));
                    }
                });
            }
            scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    for child in root.children() {
                        assert!(tree.find_node(child.id()).is_some());
                        assert!(child.has_caller(&root));
                    }
                }
            });

            while root.children().len() < names.len() {
                std::thread::yield_now();
            }
            done.store(true, Ordering::Release);
        });

        assert_eq!(tree.node_count(), names.len() + 1);
    }

    #[test]
    fn test_state_round_trip_preserves_ids() {
        let funcs = Funcs::new(&["main", "a", "b", "f"]);
        let tree = CallTree::new();
        add_path(&tree, &funcs, &["main", "a", "f"], 3);
        add_path(&tree, &funcs, &["main", "b", "f"], 5);

        let state = tree.to_state();
        let restored = CallTree::from_state(state.clone()).unwrap();

        assert_eq!(restored.to_state(), state);
        let f = restored.find_node(NodeId(3)).unwrap();
        assert_eq!(f.function_name(), "f");
        assert_eq!(f.caller().unwrap().function_name(), "a");
        assert_eq!(restored.get_call_tree_nodes(funcs.id("f")).len(), 2);

        // New nodes continue the id sequence.
        let g = restored.add_child_node(&f, funcs.info("main"), funcs.id("main"));
        assert_eq!(g.id(), NodeId(6));
    }

    #[test]
    fn test_from_state_rejects_dangling_child() {
        let funcs = Funcs::new(&["main"]);
        let tree = CallTree::new();
        add_path(&tree, &funcs, &["main"], 1);

        let mut state = tree.to_state();
        state.nodes[0].children.push(NodeId(42));
        assert!(matches!(CallTree::from_state(state), Err(ExportError::CorruptProfile(_))));
    }

    #[test]
    fn test_print_respects_depth() {
        let funcs = Funcs::new(&["main", "a", "f"]);
        let tree = CallTree::new();
        add_path(&tree, &funcs, &["main", "a", "f"], 2);

        let shallow = tree.print(1);
        assert!(shallow.contains("main"));
        assert!(!shallow.contains("    a,"));
        assert!(tree.print(8).contains("        f,"));
    }
}
