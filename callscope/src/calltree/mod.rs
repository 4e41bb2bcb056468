//! # Call Tree
//!
//! The aggregate "hot path" view of a profile. Every sample stack is folded
//! in from the outermost frame down, so each distinct call path maps to one
//! chain of nodes:
//!
//! ```text
//! samples                          tree
//! [main, foo]       10ms           main  22ms
//! [main, foo, bar]   5ms    ──►    ├── foo  15ms (self 10ms)
//! [main, baz]        7ms           │   └── bar  5ms (self 5ms)
//!                                  └── baz  7ms (self 7ms)
//! ```
//!
//! A function reached through several paths has one node per path. The
//! tree keeps an index from function to all of its nodes, which backs the
//! per-function queries ([`CallTree::get_combined_call_tree_node`],
//! [`CallTree::get_top_functions`]).
//!
//! ## Concurrency
//!
//! Nodes are shared (`Arc`) and mutated through `&self`. Weights are
//! atomics. Child/caller/call-site lists sit behind one `parking_lot`
//! `RwLock` per node, and insertion looks up under a read lock, re-checks
//! under an upgradable lock and only then upgrades to write. Node
//! registration uses a separate tree-level lock.

mod node;
mod tree;

pub use node::{CallSite, CallTarget, CallTreeNode, CombinedNode, NodeKind, NodeSummary};
pub use tree::{CallTree, CallTreeState, FunctionNodes, ModuleWeight, NodeState};
