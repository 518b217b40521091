//! Compacted suffix tree over the growing symbol sequence.
//!
//! Every node represents one observed context `seq[start..end)`; a child's
//! context extends its parent's at the front, so the parent's context is
//! always a suffix of the child's. Edges are compacted: the symbols
//! between a parent of length `lp` and a child of length `lc` are implied
//! by the child's range and matched lazily against the query. Inserting a
//! context that diverges inside an edge splits the edge, creating an
//! intermediate node whose restaurant is re-seated by the model.

use crate::restaurant::{Seating, SeatingKind};
use crate::seq::Sequence;
use crate::tree::arena::{NodeArena, NodeId};

/// One entry of a root-to-node path: the handle plus the context range,
/// captured so path consumers never re-touch the arena for geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathNode {
    pub id: NodeId,
    pub start: usize,
    pub end: usize,
}

impl PathNode {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A path from the root (empty context, first) to some node (last).
/// Context lengths are strictly increasing along it.
pub type NodePath = Vec<PathNode>;

/// What `insert` did to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertAction {
    /// The context was already present or hung below an existing node.
    NoSplit,
    /// An edge was split; the inserted node hangs below the new
    /// intermediate node, which is second-to-last on the path.
    Split,
    /// An edge was split and the inserted context *is* the intermediate
    /// node (a suffix of an existing context); it is last on the path.
    SplitSuffix,
}

/// Result of a context insertion.
#[derive(Debug)]
pub struct Insertion {
    pub path: NodePath,
    pub action: InsertAction,
    /// The node whose incoming edge was split, if any.
    pub split_child: Option<NodeId>,
}

enum WalkEnd {
    /// The query context is exactly the last node on the path.
    Exact,
    /// Matching stopped at the last node: no child extends the query.
    NoChild,
    /// Matching stopped inside the edge to `child` after `frag_len`
    /// context symbols; a split there would create a node of that length.
    MidEdge { child: NodeId, frag_len: usize },
}

struct Walk {
    path: Vec<NodeId>,
    end: WalkEnd,
}

/// The compacted context tree. Owns the node arena; the sequence is
/// supplied per call, since the tree only ever borrows it read-only.
#[derive(Debug)]
pub struct ContextTree {
    arena: NodeArena,
}

impl ContextTree {
    pub fn new(kind: SeatingKind) -> Self {
        Self {
            arena: NodeArena::new(kind),
        }
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut NodeArena {
        &mut self.arena
    }

    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    fn make_path(&self, ids: &[NodeId]) -> NodePath {
        ids.iter()
            .map(|&id| {
                let n = self.arena.node(id);
                PathNode {
                    id,
                    start: n.start,
                    end: n.end,
                }
            })
            .collect()
    }

    /// Match `seq[start..stop)` downward from the root.
    fn walk<S: Sequence + ?Sized>(&self, seq: &S, start: usize, stop: usize) -> Walk {
        debug_assert!(start <= stop && stop <= seq.len());
        let qlen = stop - start;
        let mut path = vec![self.arena.root()];
        let mut matched = 0usize;

        loop {
            if matched == qlen {
                return Walk {
                    path,
                    end: WalkEnd::Exact,
                };
            }
            let cur = *path.last().unwrap();
            let cur_len = self.arena.node(cur).len();
            let sym = seq.get(stop - matched - 1);
            let child = match self.arena.node(cur).children.get(&sym) {
                Some(&c) => c,
                None => {
                    return Walk {
                        path,
                        end: WalkEnd::NoChild,
                    }
                }
            };

            let child_node = self.arena.node(child);
            let edge_len = child_node.len() - cur_len;
            let mut k = 0usize;
            while k < edge_len && matched + k < qlen {
                let edge_sym = seq.get(child_node.end - cur_len - 1 - k);
                let query_sym = seq.get(stop - matched - 1 - k);
                if edge_sym != query_sym {
                    break;
                }
                k += 1;
            }

            if k == edge_len {
                path.push(child);
                matched += edge_len;
            } else {
                debug_assert!(k >= 1, "child key must match the first edge symbol");
                return Walk {
                    path,
                    end: WalkEnd::MidEdge {
                        child,
                        frag_len: matched + k,
                    },
                };
            }
        }
    }

    /// Path to the deepest node whose context is a suffix of
    /// `seq[start..stop)`.
    pub fn find_longest_suffix<S: Sequence + ?Sized>(
        &self,
        seq: &S,
        start: usize,
        stop: usize,
    ) -> NodePath {
        let walk = self.walk(seq, start, stop);
        self.make_path(&walk.path)
    }

    /// Like `find_longest_suffix`, but when the match ends inside an edge
    /// the returned path continues to the node below the would-be split
    /// point, and the first element reports the length the intermediate
    /// node would have. A fragment length of 0 means an exact node match.
    pub fn find_longest_suffix_virtual<S: Sequence + ?Sized>(
        &self,
        seq: &S,
        start: usize,
        stop: usize,
    ) -> (usize, NodePath) {
        let walk = self.walk(seq, start, stop);
        match walk.end {
            WalkEnd::MidEdge { child, frag_len } => {
                let mut ids = walk.path;
                ids.push(child);
                (frag_len, self.make_path(&ids))
            }
            _ => (0, self.make_path(&walk.path)),
        }
    }

    /// Path to the node whose context is exactly `seq[start..stop)`.
    /// The context must be present.
    pub fn find_node<S: Sequence + ?Sized>(&self, seq: &S, start: usize, stop: usize) -> NodePath {
        let walk = self.walk(seq, start, stop);
        let path = self.make_path(&walk.path);
        assert!(
            matches!(walk.end, WalkEnd::Exact),
            "context {}..{} not present in the tree",
            start,
            stop
        );
        debug_assert_eq!(path.last().unwrap().len(), stop - start);
        path
    }

    /// Insert the context `seq[start..stop)`, splitting an edge when the
    /// new context diverges inside one.
    pub fn insert<S: Sequence + ?Sized>(&mut self, seq: &S, start: usize, stop: usize) -> Insertion {
        let walk = self.walk(seq, start, stop);
        let mut ids = walk.path;
        match walk.end {
            WalkEnd::Exact => Insertion {
                path: self.make_path(&ids),
                action: InsertAction::NoSplit,
                split_child: None,
            },
            WalkEnd::NoChild => {
                let cur = *ids.last().unwrap();
                let matched = self.arena.node(cur).len();
                let key = seq.get(stop - matched - 1);
                let fresh = self.arena.alloc(start, stop, cur);
                self.arena.node_mut(cur).children.insert(key, fresh);
                ids.push(fresh);
                Insertion {
                    path: self.make_path(&ids),
                    action: InsertAction::NoSplit,
                    split_child: None,
                }
            }
            WalkEnd::MidEdge { child, frag_len } => {
                let cur = *ids.last().unwrap();
                let cur_len = self.arena.node(cur).len();
                let child_end = self.arena.node(child).end;

                // Intermediate node: the matched suffix of the child's
                // context.
                let mid = self.arena.alloc(child_end - frag_len, child_end, cur);
                let edge_key = seq.get(child_end - cur_len - 1);
                let child_key = seq.get(child_end - frag_len - 1);
                self.arena.node_mut(cur).children.insert(edge_key, mid);
                self.arena.node_mut(mid).children.insert(child_key, child);
                self.arena.node_mut(child).parent = Some(mid);
                ids.push(mid);

                if frag_len == stop - start {
                    Insertion {
                        path: self.make_path(&ids),
                        action: InsertAction::SplitSuffix,
                        split_child: Some(child),
                    }
                } else {
                    let key = seq.get(stop - frag_len - 1);
                    let fresh = self.arena.alloc(start, stop, mid);
                    self.arena.node_mut(mid).children.insert(key, fresh);
                    ids.push(fresh);
                    Insertion {
                        path: self.make_path(&ids),
                        action: InsertAction::Split,
                        split_child: Some(child),
                    }
                }
            }
        }
    }

    /// Iterate every root-to-node path in post-order: children before
    /// their parent, the root-only path last. Successive paths relate by
    /// sibling (equal length), ascent (one shorter), or ascent followed by
    /// a descent — the relation sweep consumers exploit to maintain
    /// aligned parameter vectors incrementally.
    pub fn dfs_paths(&self) -> DfsPathIterator<'_> {
        let mut path = vec![self.arena.root()];
        descend_leftmost(&self.arena, &mut path);
        DfsPathIterator { tree: self, path }
    }

    /// Visit every node (pre-order) together with its children's handles.
    pub fn visit_dfs_with_children<F: FnMut(NodeId, &[NodeId])>(&self, mut f: F) {
        let mut stack = vec![self.arena.root()];
        while let Some(id) = stack.pop() {
            let children: Vec<NodeId> = self.arena.node(id).children.values().copied().collect();
            f(id, &children);
            for &c in children.iter().rev() {
                stack.push(c);
            }
        }
    }

    /// Indented dump of the whole tree for diagnostics.
    pub fn render<S: Sequence + ?Sized>(&self, seq: &S) -> String {
        let mut out = String::new();
        self.visit_dfs_with_children(|id, _| {
            let n = self.arena.node(id);
            for _ in 0..n.len() {
                out.push(' ');
            }
            out.push('"');
            out.push_str(&seq.render(n.start, n.end));
            out.push('"');
            out.push(' ');
            out.push_str(&n.seating.summary());
            out.push('\n');
        });
        out
    }

    /// Borrow two distinct payloads mutably (split handling).
    pub fn seating_pair_mut(&mut self, a: NodeId, b: NodeId) -> (&mut Seating, &mut Seating) {
        self.arena.seating_pair_mut(a, b)
    }
}

fn descend_leftmost(arena: &NodeArena, path: &mut Vec<NodeId>) {
    loop {
        let cur = *path.last().unwrap();
        match arena.node(cur).children.values().next() {
            Some(&c) => path.push(c),
            None => break,
        }
    }
}

/// Post-order DFS over root-to-node paths.
pub struct DfsPathIterator<'t> {
    tree: &'t ContextTree,
    path: Vec<NodeId>,
}

impl<'t> DfsPathIterator<'t> {
    /// The current path. Empty only after the iterator is exhausted.
    pub fn current(&self) -> NodePath {
        self.tree.make_path(&self.path)
    }

    pub fn is_done(&self) -> bool {
        self.path.is_empty()
    }

    /// Move to the next path; returns false once the root-only path has
    /// been consumed.
    pub fn advance(&mut self) -> bool {
        if self.path.len() <= 1 {
            self.path.clear();
            return false;
        }
        let x = *self.path.last().unwrap();
        let parent = self.path[self.path.len() - 2];
        let mut next_sibling = None;
        let mut seen = false;
        for &cid in self.tree.arena.node(parent).children.values() {
            if seen {
                next_sibling = Some(cid);
                break;
            }
            if cid == x {
                seen = true;
            }
        }
        debug_assert!(seen, "path tail must be a child of its predecessor");
        self.path.pop();
        if let Some(s) = next_sibling {
            self.path.push(s);
            descend_leftmost(&self.tree.arena, &mut self.path);
        }
        true
    }
}
