//! Control-flow graph: blocks, typed edges, invariant checks.
//!
//! One CFG per procedure plus one for the main program. Blocks reference
//! statements by index into the owning unit's statement list; no AST nodes
//! are duplicated here. The builder lives in [`builder`].

pub mod builder;

use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

pub use builder::build_unit_cfg;

/// Index into `Cfg::blocks`.
pub type BlockId = usize;

/// Index into the owning unit's statement list.
pub type StmtRef = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockKind {
    Normal,
    LoopHeader,
    LoopBody,
    LoopIncrement,
    LoopExit,
    IfThen,
    IfElse,
    IfJoin,
    SelectCase,
    SelectJoin,
    TryBody,
    CatchHandler,
    Finally,
    SubroutineLanding,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EdgeKind {
    Fallthrough,
    Jump,
    CondTrue,
    CondFalse,
    /// i-th arm of an ON GOTO/GOSUB dispatch.
    Multiway(usize),
    /// GOSUB transfer to a subroutine entry.
    Call,
    /// RETURN transfer to a subroutine landing.
    Return,
    /// THROW transfer to a catch handler.
    Exception,
}

#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub target: BlockId,
    pub kind: EdgeKind,
    /// Selector value guarding a `Multiway` edge (`selector == guard`).
    pub guard: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BasicBlock {
    pub id: BlockId,
    pub label: String,
    pub statements: Vec<StmtRef>,
    pub edges_out: Vec<Edge>,
    pub kind: BlockKind,
    /// Last statement is a terminator (END, THROW, GOTO, RETURN, EXIT
    /// FUNCTION/SUB); such a block may have no ordinary successors.
    pub terminated: bool,
}

#[derive(Debug, Serialize)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
    pub entry: BlockId,
    pub exit: BlockId,
    /// Label name (uppercase) -> landing block.
    pub labels: HashMap<String, BlockId>,
    /// BASIC line number -> landing block.
    pub line_numbers: HashMap<u32, BlockId>,
    /// GOSUB/ON GOSUB landing blocks, indexed by landing id.
    pub landings: Vec<BlockId>,
    /// CASE statement -> the SELECT statement whose selector it tests.
    pub case_selectors: HashMap<StmtRef, StmtRef>,
    /// One entry per TRY region, for runtime handler-table bookkeeping.
    pub try_regions: Vec<TryRegion>,
}

/// Blocks and handler codes of one TRY … END TRY region.
#[derive(Debug, Clone, Serialize)]
pub struct TryRegion {
    pub body: BlockId,
    pub exit: BlockId,
    pub handlers: Vec<BlockId>,
    /// Flattened CATCH code lists, parallel to `handlers`; empty codes mean
    /// a catch-all.
    pub codes: Vec<Vec<i64>>,
}

impl Cfg {
    pub fn new() -> Self {
        let mut cfg = Cfg {
            blocks: Vec::new(),
            entry: 0,
            exit: 0,
            labels: HashMap::new(),
            line_numbers: HashMap::new(),
            landings: Vec::new(),
            case_selectors: HashMap::new(),
            try_regions: Vec::new(),
        };
        cfg.entry = cfg.new_block(BlockKind::Normal, "entry");
        cfg.exit = cfg.new_block(BlockKind::Normal, "exit");
        cfg
    }

    pub fn new_block(&mut self, kind: BlockKind, hint: &str) -> BlockId {
        let id = self.blocks.len();
        self.blocks.push(BasicBlock {
            id,
            label: format!("{}_{}", hint, id),
            statements: Vec::new(),
            edges_out: Vec::new(),
            kind,
            terminated: false,
        });
        id
    }

    pub fn add_edge(&mut self, from: BlockId, target: BlockId, kind: EdgeKind) {
        self.blocks[from].edges_out.push(Edge {
            target,
            kind,
            guard: None,
        });
    }

    pub fn add_guarded_edge(&mut self, from: BlockId, target: BlockId, kind: EdgeKind, guard: i64) {
        self.blocks[from].edges_out.push(Edge {
            target,
            kind,
            guard: Some(guard),
        });
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    /// Blocks reachable from `entry` along any edge.
    pub fn reachable(&self) -> HashSet<BlockId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.entry]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            for edge in &self.blocks[id].edges_out {
                queue.push_back(edge.target);
            }
        }
        seen
    }

    /// Reverse post-order over forward edges; the emitter walks blocks in
    /// this order so a block's operands are emitted before their uses.
    pub fn reverse_post_order(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut order = Vec::new();
        // Iterative DFS with an explicit exit-phase stack.
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited[self.entry] = true;
        while let Some(&(id, next)) = stack.last() {
            let edges = &self.blocks[id].edges_out;
            if next < edges.len() {
                stack.last_mut().expect("non-empty stack").1 += 1;
                let target = edges[next].target;
                if !visited[target] {
                    visited[target] = true;
                    stack.push((target, 0));
                }
            } else {
                order.push(id);
                stack.pop();
            }
        }
        order.reverse();
        order
    }

    /// Check the structural invariants every completed CFG must satisfy.
    pub fn verify(&self) -> Result<(), String> {
        let reachable = self.reachable();
        for block in &self.blocks {
            if !reachable.contains(&block.id) {
                continue;
            }
            let edges = &block.edges_out;
            if block.id != self.exit && edges.is_empty() && !block.terminated {
                return Err(format!(
                    "block {} has no successors and no terminator",
                    block.label
                ));
            }
            let trues = edges
                .iter()
                .filter(|e| e.kind == EdgeKind::CondTrue)
                .count();
            let falses = edges
                .iter()
                .filter(|e| e.kind == EdgeKind::CondFalse)
                .count();
            if (trues > 0 || falses > 0) && !(trues == 1 && falses == 1) {
                return Err(format!(
                    "block {} has {} true / {} false edges",
                    block.label, trues, falses
                ));
            }
            // Unconditional jumps to earlier blocks are either loop
            // back-edges (header or another block of the loop machinery) or
            // GOTOs onto an already-built landing block.
            for edge in edges {
                if edge.kind == EdgeKind::Jump
                    && edge.target <= block.id
                    && edge.target != self.exit
                {
                    let target = &self.blocks[edge.target];
                    let is_loop_back = matches!(
                        target.kind,
                        BlockKind::LoopHeader
                            | BlockKind::LoopBody
                            | BlockKind::LoopIncrement
                            | BlockKind::LoopExit
                    );
                    let is_goto_landing = self.line_numbers.values().any(|&b| b == edge.target)
                        || self.labels.values().any(|&b| b == edge.target)
                        || self.landings.contains(&edge.target);
                    if !is_loop_back && !is_goto_landing {
                        return Err(format!(
                            "back-edge {} -> {} does not target a loop header",
                            block.label, target.label
                        ));
                    }
                }
            }
        }
        // Subroutine landings are entered by RETURN only.
        for landing in &self.landings {
            for block in &self.blocks {
                for edge in &block.edges_out {
                    if edge.target == *landing && edge.kind != EdgeKind::Return {
                        return Err(format!(
                            "landing {} entered by {:?} edge",
                            self.blocks[*landing].label, edge.kind
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Human-readable dump (`-G`); parseable enough that tests re-read the
    /// block and edge counts from it.
    pub fn dump_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "cfg: {} blocks, {} edges, entry {}, exit {}",
            self.blocks.len(),
            self.blocks.iter().map(|b| b.edges_out.len()).sum::<usize>(),
            self.blocks[self.entry].label,
            self.blocks[self.exit].label,
        );
        for block in &self.blocks {
            let _ = writeln!(
                out,
                "block {} kind={:?} stmts={:?} terminated={}",
                block.label, block.kind, block.statements, block.terminated
            );
            for edge in &block.edges_out {
                let guard = edge
                    .guard
                    .map(|g| format!(" guard={}", g))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "  edge -> {} kind={:?}{}",
                    self.blocks[edge.target].label, edge.kind, guard
                );
            }
        }
        out
    }
}

impl Default for Cfg {
    fn default() -> Self {
        Cfg::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachability_and_rpo() {
        let mut cfg = Cfg::new();
        let a = cfg.new_block(BlockKind::Normal, "a");
        let b = cfg.new_block(BlockKind::Normal, "b");
        let orphan = cfg.new_block(BlockKind::Unreachable, "orphan");
        cfg.add_edge(cfg.entry, a, EdgeKind::Fallthrough);
        cfg.add_edge(a, b, EdgeKind::Jump);
        cfg.add_edge(b, cfg.exit, EdgeKind::Fallthrough);
        let reach = cfg.reachable();
        assert!(reach.contains(&a) && reach.contains(&b));
        assert!(!reach.contains(&orphan));
        let rpo = cfg.reverse_post_order();
        assert_eq!(rpo.first(), Some(&cfg.entry));
        let pos =
            |id: BlockId| rpo.iter().position(|&x| x == id).expect("block in rpo");
        assert!(pos(a) < pos(b));
    }

    #[test]
    fn verify_rejects_half_conditional_blocks() {
        let mut cfg = Cfg::new();
        let a = cfg.new_block(BlockKind::Normal, "a");
        cfg.add_edge(cfg.entry, a, EdgeKind::Fallthrough);
        cfg.add_edge(a, cfg.exit, EdgeKind::CondTrue);
        assert!(cfg.verify().is_err(), "CondTrue without CondFalse");
        cfg.add_edge(a, cfg.exit, EdgeKind::CondFalse);
        assert!(cfg.verify().is_ok());
    }

    #[test]
    fn verify_rejects_edgeless_unterminated_blocks() {
        let mut cfg = Cfg::new();
        let a = cfg.new_block(BlockKind::Normal, "a");
        cfg.add_edge(cfg.entry, a, EdgeKind::Fallthrough);
        assert!(cfg.verify().is_err());
        cfg.blocks[a].terminated = true;
        assert!(cfg.verify().is_ok());
    }

    #[test]
    fn dump_counts_match() {
        let mut cfg = Cfg::new();
        let a = cfg.new_block(BlockKind::Normal, "a");
        cfg.add_edge(cfg.entry, a, EdgeKind::Fallthrough);
        cfg.add_edge(a, cfg.exit, EdgeKind::Jump);
        let dump = cfg.dump_text();
        let first = dump.lines().next().unwrap();
        assert!(first.contains("3 blocks"));
        assert!(first.contains("2 edges"));
        let block_lines = dump.lines().filter(|l| l.starts_with("block ")).count();
        let edge_lines = dump.lines().filter(|l| l.trim_start().starts_with("edge ")).count();
        assert_eq!(block_lines, 3);
        assert_eq!(edge_lines, 2);
    }
}
