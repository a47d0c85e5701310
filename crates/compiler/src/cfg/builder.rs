//! Single-pass recursive CFG construction.
//!
//! Every builder routine follows one contract: it takes the block control
//! flows in from, creates and wires every block the construct needs
//! (including loop back-edges), and returns the unique block through which
//! control leaves normally. Ambient loop/try information is threaded
//! explicitly through a context stack; nothing lives in process state.
//!
//! Phase 0 pre-scans the unit for every GOTO/GOSUB destination and reserves
//! a landing block per target, so forward references resolve
//! deterministically, and one [`BlockKind::SubroutineLanding`] block per
//! GOSUB site, so RETURN dispatch is a fixed table.

use crate::ast::{ContinueKind, ExitKind, ExprKind, JumpTarget, StmtKind, UnOp};
use crate::cfg::{BlockId, BlockKind, Cfg, EdgeKind};
use crate::diag::{Diagnostic, ErrorKind};
use crate::semantics::Unit;
use std::collections::HashMap;
use tracing::debug;

/// Build the CFG for one unit. Construction stops at the first
/// unrecoverable error; the invariants cannot be locally repaired.
pub fn build_unit_cfg(unit: &Unit) -> Result<Cfg, Diagnostic> {
    let mut builder = CfgBuilder {
        unit,
        cfg: Cfg::new(),
        entry_points: HashMap::new(),
        target_indices: HashMap::new(),
        landing_of: HashMap::new(),
        closed: false,
        err: None,
    };
    builder.prescan();
    let mut ctx = Ctx { frames: Vec::new() };
    let full = (0, unit.statements.len());
    let end = builder.build_range(full, builder.cfg.entry, &mut ctx);
    if let Some(err) = builder.err.take() {
        return Err(err);
    }
    if !builder.closed && !builder.cfg.blocks[end].terminated {
        let exit = builder.cfg.exit;
        builder.cfg.add_edge(end, exit, EdgeKind::Fallthrough);
    }
    if let Err(msg) = builder.cfg.verify() {
        return Err(Diagnostic::error(
            0,
            ErrorKind::UnsupportedConstruct,
            format!("internal CFG invariant violated in {}: {}", unit_name(unit), msg),
        ));
    }
    debug!(
        unit = unit_name(unit),
        blocks = builder.cfg.blocks.len(),
        landings = builder.cfg.landings.len(),
        "cfg built"
    );
    Ok(builder.cfg)
}

fn unit_name(unit: &Unit) -> &str {
    if unit.is_main { "<main>" } else { &unit.name }
}

struct CfgBuilder<'a> {
    unit: &'a Unit,
    cfg: Cfg,
    /// Statement index -> pre-reserved landing block (jump-target lines,
    /// labels). Control must switch into that block at that statement.
    entry_points: HashMap<usize, BlockId>,
    /// Jump target -> statement index (for FINALLY-crossing decisions).
    target_indices: HashMap<BlockId, usize>,
    /// GOSUB/ON-GOSUB statement index -> landing id.
    landing_of: HashMap<usize, usize>,
    /// The current block ended with a control transfer; anything that
    /// follows starts a fresh (unreachable) block.
    closed: bool,
    err: Option<Diagnostic>,
}

/// Ambient context: one frame per enclosing loop or TRY region.
#[derive(Clone)]
enum Frame {
    ForLoop {
        exit: BlockId,
        increment: BlockId,
    },
    WhileLoop {
        exit: BlockId,
        header: BlockId,
    },
    DoLoop {
        exit: BlockId,
        continue_to: BlockId,
    },
    Try {
        /// (codes, handler block) per CATCH with a code list.
        handlers: Vec<(Vec<i64>, BlockId)>,
        catch_all: Option<BlockId>,
        finally_range: Option<(usize, usize)>,
        /// Statement span of the whole TRY … END TRY region.
        region: (usize, usize),
    },
}

#[derive(Clone)]
struct Ctx {
    frames: Vec<Frame>,
}

impl<'a> CfgBuilder<'a> {
    // ------------------------------------------------------------------
    // Phase 0: jump target pre-scan
    // ------------------------------------------------------------------

    fn prescan(&mut self) {
        let stmts = &self.unit.statements;

        // First statement index of every source line.
        let mut first_of_line: HashMap<u32, usize> = HashMap::new();
        for (idx, stmt) in stmts.iter().enumerate() {
            first_of_line.entry(stmt.line).or_insert(idx);
        }

        let mut reserve_line = |cfg: &mut Cfg,
                               entry_points: &mut HashMap<usize, BlockId>,
                               target_indices: &mut HashMap<BlockId, usize>,
                               line: u32| {
            if cfg.line_numbers.contains_key(&line) {
                return;
            }
            if let Some(&idx) = first_of_line.get(&line) {
                let block = cfg.new_block(BlockKind::Normal, &format!("line{}", line));
                cfg.line_numbers.insert(line, block);
                entry_points.insert(idx, block);
                target_indices.insert(block, idx);
            }
        };

        for stmt in stmts.iter() {
            let mut on_target = |cfg: &mut Cfg,
                                entry_points: &mut HashMap<usize, BlockId>,
                                target_indices: &mut HashMap<BlockId, usize>,
                                target: &JumpTarget| {
                if let JumpTarget::Line(n) = target {
                    reserve_line(cfg, entry_points, target_indices, *n);
                }
            };
            match &stmt.kind {
                StmtKind::Goto { target } | StmtKind::Gosub { target } => {
                    on_target(
                        &mut self.cfg,
                        &mut self.entry_points,
                        &mut self.target_indices,
                        target,
                    );
                }
                StmtKind::OnGoto { targets, .. } | StmtKind::OnGosub { targets, .. } => {
                    for target in targets {
                        on_target(
                            &mut self.cfg,
                            &mut self.entry_points,
                            &mut self.target_indices,
                            target,
                        );
                    }
                }
                _ => {}
            }
        }

        // Every label gets a block whether or not something jumps to it.
        for (idx, stmt) in stmts.iter().enumerate() {
            match &stmt.kind {
                StmtKind::Label { name } => {
                    let upper = name.to_ascii_uppercase();
                    let block = self
                        .cfg
                        .new_block(BlockKind::Normal, &format!("lbl_{}", upper.to_lowercase()));
                    self.cfg.labels.insert(upper, block);
                    self.entry_points.insert(idx, block);
                    self.target_indices.insert(block, idx);
                }
                StmtKind::Gosub { .. } | StmtKind::OnGosub { .. } => {
                    let landing = self.cfg.new_block(BlockKind::SubroutineLanding, "landing");
                    let id = self.cfg.landings.len();
                    self.cfg.landings.push(landing);
                    self.landing_of.insert(idx, id);
                }
                _ => {}
            }
        }
    }

    fn fail(&mut self, line: u32, message: impl Into<String>) {
        if self.err.is_none() {
            self.err = Some(Diagnostic::error(
                line,
                ErrorKind::UnsupportedConstruct,
                message,
            ));
        }
    }

    // ------------------------------------------------------------------
    // Statement dispatch
    // ------------------------------------------------------------------

    /// Build `[start, end)` into `incoming`, returning the block control
    /// flows out of (with `self.closed` set when nothing flows out).
    fn build_range(
        &mut self,
        (start, end): (usize, usize),
        incoming: BlockId,
        ctx: &mut Ctx,
    ) -> BlockId {
        let mut current = incoming;
        self.closed = false;
        let mut i = start;
        while i < end {
            if self.err.is_some() {
                return current;
            }
            // Reserved landing for a jump-target line or label: the block in
            // progress ends here and the landing takes over.
            if let Some(&landing) = self.entry_points.get(&i) {
                if !self.closed && !self.cfg.blocks[current].terminated && current != landing {
                    self.cfg.add_edge(current, landing, EdgeKind::Fallthrough);
                }
                current = landing;
                self.closed = false;
            }
            let stmt = self.unit.statements[i].clone();
            let line = stmt.line;
            match &stmt.kind {
                // Structured constructs consume their whole span.
                StmtKind::If { .. } => {
                    let (next, out) = self.build_if(i, end, current, ctx);
                    current = out;
                    i = next;
                    continue;
                }
                StmtKind::Select { .. } => {
                    let (next, out) = self.build_select(i, end, current, ctx);
                    current = out;
                    i = next;
                    continue;
                }
                StmtKind::For { .. } => {
                    let (next, out) = self.build_for(i, end, current, ctx);
                    current = out;
                    i = next;
                    continue;
                }
                StmtKind::While { .. } => {
                    let (next, out) = self.build_while(i, end, current, ctx);
                    current = out;
                    i = next;
                    continue;
                }
                StmtKind::Do { .. } => {
                    let (next, out) = self.build_do(i, end, current, ctx);
                    current = out;
                    i = next;
                    continue;
                }
                StmtKind::Repeat => {
                    let (next, out) = self.build_repeat(i, end, current, ctx);
                    current = out;
                    i = next;
                    continue;
                }
                StmtKind::Try => {
                    let (next, out) = self.build_try(i, end, current, ctx);
                    current = out;
                    i = next;
                    continue;
                }

                // Jumps and terminators.
                StmtKind::Goto { target } => {
                    self.ensure_open(&mut current);
                    let Some(target_block) = self.resolve_target(line, target) else {
                        return current;
                    };
                    let from = self.leave_through_finallys_to_block(current, ctx, target_block);
                    self.cfg.add_edge(from, target_block, EdgeKind::Jump);
                    self.closed = true;
                }
                StmtKind::Gosub { target } => {
                    self.ensure_open(&mut current);
                    self.cfg.blocks[current].statements.push(i);
                    let Some(target_block) = self.resolve_target(line, target) else {
                        return current;
                    };
                    self.cfg.add_edge(current, target_block, EdgeKind::Call);
                    // Execution resumes at the landing when the subroutine
                    // returns; building continues there with no direct edge.
                    let id = self.landing_of[&i];
                    current = self.cfg.landings[id];
                    self.closed = false;
                }
                StmtKind::Return => {
                    self.ensure_open(&mut current);
                    self.cfg.blocks[current].statements.push(i);
                    let from = self.leave_through_all_finallys(current, ctx);
                    if self.cfg.landings.is_empty() {
                        self.fail(line, "RETURN with no GOSUB landing");
                        return current;
                    }
                    let landings = self.cfg.landings.clone();
                    for landing in landings {
                        self.cfg.add_edge(from, landing, EdgeKind::Return);
                    }
                    self.closed = true;
                }
                StmtKind::OnGoto { targets, .. } => {
                    self.ensure_open(&mut current);
                    self.cfg.blocks[current].statements.push(i);
                    let targets = targets.clone();
                    let cont = self.cfg.new_block(BlockKind::Normal, "on_cont");
                    for (k, target) in targets.iter().enumerate() {
                        let Some(target_block) = self.resolve_target(line, target) else {
                            return current;
                        };
                        self.cfg.add_guarded_edge(
                            current,
                            target_block,
                            EdgeKind::Multiway(k),
                            (k + 1) as i64,
                        );
                    }
                    // Out-of-range selector falls through.
                    self.cfg.add_edge(current, cont, EdgeKind::Fallthrough);
                    current = cont;
                    self.closed = false;
                }
                StmtKind::OnGosub { targets, .. } => {
                    self.ensure_open(&mut current);
                    self.cfg.blocks[current].statements.push(i);
                    let targets = targets.clone();
                    let landing = self.cfg.landings[self.landing_of[&i]];
                    let cont = self.cfg.new_block(BlockKind::Normal, "on_cont");
                    for (k, target) in targets.iter().enumerate() {
                        let Some(target_block) = self.resolve_target(line, target) else {
                            return current;
                        };
                        self.cfg.add_guarded_edge(
                            current,
                            target_block,
                            EdgeKind::Multiway(k),
                            (k + 1) as i64,
                        );
                    }
                    self.cfg.add_edge(current, cont, EdgeKind::Fallthrough);
                    self.cfg.add_edge(landing, cont, EdgeKind::Fallthrough);
                    current = cont;
                    self.closed = false;
                }
                StmtKind::Exit { kind } => {
                    self.ensure_open(&mut current);
                    match kind {
                        ExitKind::Function | ExitKind::Sub => {
                            self.cfg.blocks[current].statements.push(i);
                            let from = self.leave_through_all_finallys(current, ctx);
                            let exit = self.cfg.exit;
                            self.cfg.add_edge(from, exit, EdgeKind::Jump);
                        }
                        _ => {
                            let Some((pos, target)) = find_exit_target(ctx, *kind) else {
                                self.fail(line, "EXIT without a matching construct");
                                return current;
                            };
                            let from = self.leave_through_finallys_above(current, ctx, pos);
                            self.cfg.add_edge(from, target, EdgeKind::Jump);
                        }
                    }
                    self.closed = true;
                }
                StmtKind::Continue { kind } => {
                    self.ensure_open(&mut current);
                    let Some((pos, target)) = find_continue_target(ctx, *kind) else {
                        self.fail(line, "CONTINUE without a matching loop");
                        return current;
                    };
                    let from = self.leave_through_finallys_above(current, ctx, pos);
                    self.cfg.add_edge(from, target, EdgeKind::Jump);
                    self.closed = true;
                }
                StmtKind::Throw { code } => {
                    self.ensure_open(&mut current);
                    self.cfg.blocks[current].statements.push(i);
                    self.build_throw(line, code_const(code), current, ctx);
                    self.closed = true;
                }
                StmtKind::End { .. } => {
                    self.ensure_open(&mut current);
                    self.cfg.blocks[current].statements.push(i);
                    self.cfg.blocks[current].terminated = true;
                    self.closed = true;
                }

                // Stray closers: the analyzer reports pairing errors, but a
                // mismatched stream must not crash the builder.
                StmtKind::ElseIf { .. }
                | StmtKind::Else
                | StmtKind::EndIf
                | StmtKind::Case { .. }
                | StmtKind::CaseElse
                | StmtKind::EndSelect
                | StmtKind::Next { .. }
                | StmtKind::Wend
                | StmtKind::Loop { .. }
                | StmtKind::Until { .. }
                | StmtKind::Catch { .. }
                | StmtKind::Finally
                | StmtKind::EndTry => {
                    self.fail(line, "statement closes a construct that is not open");
                    return current;
                }

                // Declarations with no control flow and plain statements
                // accumulate in the current block.
                StmtKind::Label { .. }
                | StmtKind::Sub { .. }
                | StmtKind::Function { .. }
                | StmtKind::EndSub
                | StmtKind::EndFunction
                | StmtKind::Type { .. }
                | StmtKind::Data { .. }
                | StmtKind::Shared { .. }
                | StmtKind::Constant { .. } => {}
                _ => {
                    self.ensure_open(&mut current);
                    self.cfg.blocks[current].statements.push(i);
                }
            }
            i += 1;
        }
        current
    }

    /// Reopen a fresh block when the previous one ended with a transfer;
    /// statements after an unconditional jump are unreachable.
    fn ensure_open(&mut self, current: &mut BlockId) {
        if self.closed || self.cfg.blocks[*current].terminated {
            *current = self.cfg.new_block(BlockKind::Unreachable, "unreachable");
            self.closed = false;
        }
    }

    fn resolve_target(&mut self, line: u32, target: &JumpTarget) -> Option<BlockId> {
        let block = match target {
            JumpTarget::Line(n) => self.cfg.line_numbers.get(n).copied(),
            JumpTarget::Name(name) => self.cfg.labels.get(&name.to_ascii_uppercase()).copied(),
        };
        if block.is_none() {
            self.fail(line, format!("unresolved jump target {}", target));
        }
        block
    }

    // ------------------------------------------------------------------
    // FINALLY routing
    // ------------------------------------------------------------------

    /// Duplicate the FINALLY bodies of every TRY frame above `keep` (the
    /// innermost first), chaining them onto `current`. Returns the block the
    /// final transfer must leave from.
    fn emit_finallys(&mut self, mut current: BlockId, ctx: &Ctx, keep: usize) -> BlockId {
        let crossed: Vec<(usize, (usize, usize))> = ctx
            .frames
            .iter()
            .enumerate()
            .skip(keep)
            .rev()
            .filter_map(|(pos, frame)| match frame {
                Frame::Try {
                    finally_range: Some(range),
                    ..
                } => Some((pos, *range)),
                _ => None,
            })
            .collect();
        for (pos, range) in crossed {
            let fin = self.cfg.new_block(BlockKind::Finally, "finally");
            self.cfg.add_edge(current, fin, EdgeKind::Fallthrough);
            // The finally body runs outside its own TRY region.
            let mut outer = Ctx {
                frames: ctx.frames[..pos].to_vec(),
            };
            current = self.build_range(range, fin, &mut outer);
        }
        self.closed = false;
        current
    }

    fn leave_through_all_finallys(&mut self, current: BlockId, ctx: &Ctx) -> BlockId {
        self.emit_finallys(current, ctx, 0)
    }

    fn leave_through_finallys_above(
        &mut self,
        current: BlockId,
        ctx: &Ctx,
        frame_pos: usize,
    ) -> BlockId {
        self.emit_finallys(current, ctx, frame_pos + 1)
    }

    /// GOTO: cross the finallys of every TRY region the target lies outside.
    fn leave_through_finallys_to_block(
        &mut self,
        current: BlockId,
        ctx: &Ctx,
        target_block: BlockId,
    ) -> BlockId {
        let target_idx = self.target_indices.get(&target_block).copied();
        let keep = match target_idx {
            Some(idx) => ctx
                .frames
                .iter()
                .rposition(|frame| match frame {
                    Frame::Try { region, .. } => region.0 <= idx && idx < region.1,
                    _ => false,
                })
                .map(|p| p + 1)
                .unwrap_or(0),
            None => 0,
        };
        self.emit_finallys(current, ctx, keep)
    }

    // ------------------------------------------------------------------
    // Loop builders
    // ------------------------------------------------------------------

    /// `FOR … NEXT`: init evaluates the bounds once, the header re-loads the
    /// induction variable and tests it with the sign-of-step predicate, the
    /// increment block owns the back-edge.
    fn build_for(
        &mut self,
        i: usize,
        end: usize,
        current: BlockId,
        ctx: &mut Ctx,
    ) -> (usize, BlockId) {
        let line = self.unit.statements[i].line;
        let Some(next_idx) = self.find_closer(i, end, for_delta) else {
            self.fail(line, "FOR without NEXT");
            return (end, current);
        };

        let mut current = current;
        self.ensure_open(&mut current);
        let init = self.cfg.new_block(BlockKind::Normal, "for_init");
        let header = self.cfg.new_block(BlockKind::LoopHeader, "for_head");
        let body = self.cfg.new_block(BlockKind::LoopBody, "for_body");
        let increment = self.cfg.new_block(BlockKind::LoopIncrement, "for_inc");
        let exit = self.cfg.new_block(BlockKind::LoopExit, "for_exit");

        self.cfg.add_edge(current, init, EdgeKind::Fallthrough);
        self.cfg.blocks[init].statements.push(i);
        self.cfg.add_edge(init, header, EdgeKind::Fallthrough);
        self.cfg.blocks[header].statements.push(i);
        self.cfg.add_edge(header, body, EdgeKind::CondTrue);
        self.cfg.add_edge(header, exit, EdgeKind::CondFalse);

        ctx.frames.push(Frame::ForLoop { exit, increment });
        let body_end = self.build_range((i + 1, next_idx), body, ctx);
        ctx.frames.pop();

        if !self.closed && !self.cfg.blocks[body_end].terminated {
            self.cfg.add_edge(body_end, increment, EdgeKind::Fallthrough);
        }
        self.cfg.blocks[increment].statements.push(i);
        self.cfg.add_edge(increment, header, EdgeKind::Jump);
        // A numbered NEXT can itself be a GOTO target.
        self.wire_marker_landing(next_idx, increment);
        self.closed = false;
        (next_idx + 1, exit)
    }

    /// Jumping to the line of a structural closer (NEXT, WEND, LOOP …)
    /// lands in the construct's continuation block.
    fn wire_marker_landing(&mut self, marker_idx: usize, continue_to: BlockId) {
        if let Some(&landing) = self.entry_points.get(&marker_idx) {
            self.cfg.add_edge(landing, continue_to, EdgeKind::Fallthrough);
        }
    }

    fn build_while(
        &mut self,
        i: usize,
        end: usize,
        current: BlockId,
        ctx: &mut Ctx,
    ) -> (usize, BlockId) {
        let line = self.unit.statements[i].line;
        let Some(wend_idx) = self.find_closer(i, end, while_delta) else {
            self.fail(line, "WHILE without WEND");
            return (end, current);
        };

        let mut current = current;
        self.ensure_open(&mut current);
        let header = self.cfg.new_block(BlockKind::LoopHeader, "while_head");
        let body = self.cfg.new_block(BlockKind::LoopBody, "while_body");
        let exit = self.cfg.new_block(BlockKind::LoopExit, "while_exit");

        self.cfg.add_edge(current, header, EdgeKind::Fallthrough);
        self.cfg.blocks[header].statements.push(i);
        self.cfg.add_edge(header, body, EdgeKind::CondTrue);
        self.cfg.add_edge(header, exit, EdgeKind::CondFalse);

        ctx.frames.push(Frame::WhileLoop { exit, header });
        let body_end = self.build_range((i + 1, wend_idx), body, ctx);
        ctx.frames.pop();

        if !self.closed && !self.cfg.blocks[body_end].terminated {
            self.cfg.add_edge(body_end, header, EdgeKind::Jump);
        }
        self.wire_marker_landing(wend_idx, header);
        self.closed = false;
        (wend_idx + 1, exit)
    }

    /// The five DO variants: pre-test, post-test, or neither, with WHILE and
    /// UNTIL senses. UNTIL never negates the condition; the true/false
    /// edges swap instead.
    fn build_do(
        &mut self,
        i: usize,
        end: usize,
        current: BlockId,
        ctx: &mut Ctx,
    ) -> (usize, BlockId) {
        let line = self.unit.statements[i].line;
        let Some(loop_idx) = self.find_closer(i, end, do_delta) else {
            self.fail(line, "DO without LOOP");
            return (end, current);
        };
        let pre_test = matches!(&self.unit.statements[i].kind, StmtKind::Do { test: Some(_) });
        let post_test = matches!(
            &self.unit.statements[loop_idx].kind,
            StmtKind::Loop { test: Some(_) }
        );

        let mut current = current;
        self.ensure_open(&mut current);
        let exit = self.cfg.new_block(BlockKind::LoopExit, "do_exit");

        if pre_test {
            let header = self.cfg.new_block(BlockKind::LoopHeader, "do_head");
            let body = self.cfg.new_block(BlockKind::LoopBody, "do_body");
            self.cfg.add_edge(current, header, EdgeKind::Fallthrough);
            self.cfg.blocks[header].statements.push(i);
            let until = matches!(
                &self.unit.statements[i].kind,
                StmtKind::Do { test: Some(t) } if t.until
            );
            if until {
                self.cfg.add_edge(header, exit, EdgeKind::CondTrue);
                self.cfg.add_edge(header, body, EdgeKind::CondFalse);
            } else {
                self.cfg.add_edge(header, body, EdgeKind::CondTrue);
                self.cfg.add_edge(header, exit, EdgeKind::CondFalse);
            }
            ctx.frames.push(Frame::DoLoop {
                exit,
                continue_to: header,
            });
            let body_end = self.build_range((i + 1, loop_idx), body, ctx);
            ctx.frames.pop();
            if !self.closed && !self.cfg.blocks[body_end].terminated {
                self.cfg.add_edge(body_end, header, EdgeKind::Jump);
            }
            self.wire_marker_landing(loop_idx, header);
        } else if post_test {
            let body = self.cfg.new_block(BlockKind::LoopHeader, "do_body");
            // The post-test condition is the loop latch.
            let test = self.cfg.new_block(BlockKind::LoopIncrement, "do_test");
            self.cfg.add_edge(current, body, EdgeKind::Fallthrough);
            ctx.frames.push(Frame::DoLoop {
                exit,
                continue_to: test,
            });
            let body_end = self.build_range((i + 1, loop_idx), body, ctx);
            ctx.frames.pop();
            if !self.closed && !self.cfg.blocks[body_end].terminated {
                self.cfg.add_edge(body_end, test, EdgeKind::Fallthrough);
            }
            self.cfg.blocks[test].statements.push(loop_idx);
            let until = matches!(
                &self.unit.statements[loop_idx].kind,
                StmtKind::Loop { test: Some(t) } if t.until
            );
            if until {
                self.cfg.add_edge(test, exit, EdgeKind::CondTrue);
                self.cfg.add_edge(test, body, EdgeKind::CondFalse);
            } else {
                self.cfg.add_edge(test, body, EdgeKind::CondTrue);
                self.cfg.add_edge(test, exit, EdgeKind::CondFalse);
            }
            self.wire_marker_landing(loop_idx, test);
        } else {
            // DO … LOOP with only EXIT DO ending it.
            let body = self.cfg.new_block(BlockKind::LoopHeader, "do_body");
            self.cfg.add_edge(current, body, EdgeKind::Fallthrough);
            ctx.frames.push(Frame::DoLoop {
                exit,
                continue_to: body,
            });
            let body_end = self.build_range((i + 1, loop_idx), body, ctx);
            ctx.frames.pop();
            if !self.closed && !self.cfg.blocks[body_end].terminated {
                self.cfg.add_edge(body_end, body, EdgeKind::Jump);
            }
            self.wire_marker_landing(loop_idx, body);
        }
        self.closed = false;
        (loop_idx + 1, exit)
    }

    /// `REPEAT … UNTIL c`: post-test; false repeats, true leaves.
    fn build_repeat(
        &mut self,
        i: usize,
        end: usize,
        current: BlockId,
        ctx: &mut Ctx,
    ) -> (usize, BlockId) {
        let line = self.unit.statements[i].line;
        let Some(until_idx) = self.find_closer(i, end, repeat_delta) else {
            self.fail(line, "REPEAT without UNTIL");
            return (end, current);
        };

        let mut current = current;
        self.ensure_open(&mut current);
        let body = self.cfg.new_block(BlockKind::LoopHeader, "repeat_body");
        let test = self.cfg.new_block(BlockKind::LoopIncrement, "repeat_test");
        let exit = self.cfg.new_block(BlockKind::LoopExit, "repeat_exit");
        self.cfg.add_edge(current, body, EdgeKind::Fallthrough);

        ctx.frames.push(Frame::DoLoop {
            exit,
            continue_to: test,
        });
        let body_end = self.build_range((i + 1, until_idx), body, ctx);
        ctx.frames.pop();

        if !self.closed && !self.cfg.blocks[body_end].terminated {
            self.cfg.add_edge(body_end, test, EdgeKind::Fallthrough);
        }
        self.cfg.blocks[test].statements.push(until_idx);
        self.cfg.add_edge(test, exit, EdgeKind::CondTrue);
        self.cfg.add_edge(test, body, EdgeKind::CondFalse);
        self.wire_marker_landing(until_idx, test);
        self.closed = false;
        (until_idx + 1, exit)
    }

    // ------------------------------------------------------------------
    // Conditional builders
    // ------------------------------------------------------------------

    fn build_if(
        &mut self,
        i: usize,
        end: usize,
        current: BlockId,
        ctx: &mut Ctx,
    ) -> (usize, BlockId) {
        let line = self.unit.statements[i].line;
        // Collect the arm markers at this nesting depth.
        let mut depth = 0usize;
        let mut markers: Vec<usize> = Vec::new(); // ElseIf/Else positions
        let mut end_idx = None;
        for (j, stmt) in self.unit.statements[i + 1..end].iter().enumerate() {
            let j = i + 1 + j;
            match &stmt.kind {
                StmtKind::If { .. } => depth += 1,
                StmtKind::EndIf => {
                    if depth == 0 {
                        end_idx = Some(j);
                        break;
                    }
                    depth -= 1;
                }
                StmtKind::ElseIf { .. } | StmtKind::Else if depth == 0 => markers.push(j),
                _ => {}
            }
        }
        let Some(end_idx) = end_idx else {
            self.fail(line, "IF without END IF");
            return (end, current);
        };

        let mut current = current;
        self.ensure_open(&mut current);
        // The first condition evaluates in the incoming block.
        self.cfg.blocks[current].statements.push(i);
        let join = self.cfg.new_block(BlockKind::IfJoin, "if_join");
        let mut joined = false;

        // Arms: (condition block or None for ELSE, body range).
        let mut cond_block = current;
        let mut boundaries = markers.clone();
        boundaries.push(end_idx);
        let mut body_start = i + 1;
        let mut pending_else = false;
        for (a, boundary) in boundaries.iter().enumerate() {
            let body_range = (body_start, *boundary);
            let arm_kind = if pending_else {
                BlockKind::IfElse
            } else {
                BlockKind::IfThen
            };
            let arm = self.cfg.new_block(arm_kind, "if_arm");
            if pending_else {
                // ELSE arm: the previous condition's false edge.
                self.cfg.add_edge(cond_block, arm, EdgeKind::CondFalse);
            } else {
                self.cfg.add_edge(cond_block, arm, EdgeKind::CondTrue);
            }
            let arm_end = self.build_range(body_range, arm, ctx);
            if !self.closed && !self.cfg.blocks[arm_end].terminated {
                self.cfg.add_edge(arm_end, join, EdgeKind::Fallthrough);
                joined = true;
            }
            self.closed = false;

            if pending_else {
                // Nothing may follow an ELSE arm.
                break;
            }
            match boundaries.get(a).copied() {
                Some(marker) if marker < end_idx => {
                    match &self.unit.statements[marker].kind {
                        StmtKind::ElseIf { .. } => {
                            let next_cond =
                                self.cfg.new_block(BlockKind::Normal, "elseif_cond");
                            self.cfg.add_edge(cond_block, next_cond, EdgeKind::CondFalse);
                            self.cfg.blocks[next_cond].statements.push(marker);
                            cond_block = next_cond;
                        }
                        StmtKind::Else => pending_else = true,
                        _ => {}
                    }
                    body_start = marker + 1;
                }
                _ => {
                    // Final condition with no ELSE: false edge to the join.
                    self.cfg.add_edge(cond_block, join, EdgeKind::CondFalse);
                    joined = true;
                    break;
                }
            }
        }

        if !joined {
            self.cfg.blocks[join].kind = BlockKind::Unreachable;
        }
        self.wire_marker_landing(end_idx, join);
        self.closed = false;
        (end_idx + 1, join)
    }

    fn build_select(
        &mut self,
        i: usize,
        end: usize,
        current: BlockId,
        ctx: &mut Ctx,
    ) -> (usize, BlockId) {
        let line = self.unit.statements[i].line;
        let mut depth = 0usize;
        let mut case_markers: Vec<usize> = Vec::new();
        let mut else_marker: Option<usize> = None;
        let mut end_idx = None;
        for (j, stmt) in self.unit.statements[i + 1..end].iter().enumerate() {
            let j = i + 1 + j;
            match &stmt.kind {
                StmtKind::Select { .. } => depth += 1,
                StmtKind::EndSelect => {
                    if depth == 0 {
                        end_idx = Some(j);
                        break;
                    }
                    depth -= 1;
                }
                StmtKind::Case { .. } if depth == 0 => case_markers.push(j),
                StmtKind::CaseElse if depth == 0 => else_marker = Some(j),
                _ => {}
            }
        }
        let Some(end_idx) = end_idx else {
            self.fail(line, "SELECT without END SELECT");
            return (end, current);
        };

        let mut current = current;
        self.ensure_open(&mut current);
        // The selector evaluates once, in the incoming block.
        self.cfg.blocks[current].statements.push(i);
        let join = self.cfg.new_block(BlockKind::SelectJoin, "select_join");
        let mut joined = false;

        let mut arm_bounds: Vec<usize> = case_markers.clone();
        if let Some(e) = else_marker {
            arm_bounds.push(e);
        }
        arm_bounds.push(end_idx);

        let mut prev_false_source = current;
        let mut prev_false_kind = EdgeKind::Fallthrough;
        for (a, &marker) in case_markers.iter().enumerate() {
            let cmp = self.cfg.new_block(BlockKind::SelectCase, "case_test");
            self.cfg.add_edge(prev_false_source, cmp, prev_false_kind);
            self.cfg.blocks[cmp].statements.push(marker);
            self.cfg.case_selectors.insert(marker, i);

            let body_range = (marker + 1, arm_bounds[a + 1]);
            let body = self.cfg.new_block(BlockKind::Normal, "case_body");
            self.cfg.add_edge(cmp, body, EdgeKind::CondTrue);
            let body_end = self.build_range(body_range, body, ctx);
            if !self.closed && !self.cfg.blocks[body_end].terminated {
                self.cfg.add_edge(body_end, join, EdgeKind::Fallthrough);
                joined = true;
            }
            self.closed = false;

            prev_false_source = cmp;
            prev_false_kind = EdgeKind::CondFalse;
        }

        // CASE ELSE arm or straight to the join.
        if let Some(else_idx) = else_marker {
            let body = self.cfg.new_block(BlockKind::Normal, "case_else");
            self.cfg.add_edge(prev_false_source, body, prev_false_kind);
            let body_end = self.build_range((else_idx + 1, end_idx), body, ctx);
            if !self.closed && !self.cfg.blocks[body_end].terminated {
                self.cfg.add_edge(body_end, join, EdgeKind::Fallthrough);
                joined = true;
            }
            self.closed = false;
        } else {
            self.cfg.add_edge(prev_false_source, join, prev_false_kind);
            joined = true;
        }

        if !joined {
            self.cfg.blocks[join].kind = BlockKind::Unreachable;
        }
        self.wire_marker_landing(end_idx, join);
        self.closed = false;
        (end_idx + 1, join)
    }

    // ------------------------------------------------------------------
    // Exception builder
    // ------------------------------------------------------------------

    fn build_try(
        &mut self,
        i: usize,
        end: usize,
        current: BlockId,
        ctx: &mut Ctx,
    ) -> (usize, BlockId) {
        let line = self.unit.statements[i].line;
        let mut depth = 0usize;
        let mut catch_markers: Vec<usize> = Vec::new();
        let mut finally_marker: Option<usize> = None;
        let mut end_idx = None;
        for (j, stmt) in self.unit.statements[i + 1..end].iter().enumerate() {
            let j = i + 1 + j;
            match &stmt.kind {
                StmtKind::Try => depth += 1,
                StmtKind::EndTry => {
                    if depth == 0 {
                        end_idx = Some(j);
                        break;
                    }
                    depth -= 1;
                }
                StmtKind::Catch { .. } if depth == 0 => catch_markers.push(j),
                StmtKind::Finally if depth == 0 => finally_marker = Some(j),
                _ => {}
            }
        }
        let Some(end_idx) = end_idx else {
            self.fail(line, "TRY without END TRY");
            return (end, current);
        };

        let body_end_idx = catch_markers
            .first()
            .copied()
            .or(finally_marker)
            .unwrap_or(end_idx);
        let finally_range = finally_marker.map(|f| (f + 1, end_idx));

        let mut current = current;
        self.ensure_open(&mut current);
        let exit = self.cfg.new_block(BlockKind::Normal, "try_exit");

        // Handler blocks exist before the body builds: THROW wires to them.
        let mut marker_blocks: Vec<BlockId> = Vec::new();
        let mut handlers: Vec<(Vec<i64>, BlockId)> = Vec::new();
        let mut catch_all: Option<BlockId> = None;
        for &marker in &catch_markers {
            let handler = self.cfg.new_block(BlockKind::CatchHandler, "catch");
            marker_blocks.push(handler);
            let StmtKind::Catch { codes } = &self.unit.statements[marker].kind else {
                continue;
            };
            if codes.is_empty() {
                if catch_all.is_none() {
                    catch_all = Some(handler);
                }
            } else {
                let codes: Vec<i64> = codes.iter().filter_map(code_const).collect();
                handlers.push((codes, handler));
            }
        }

        // Body.
        let body = self.cfg.new_block(BlockKind::TryBody, "try_body");
        self.cfg.add_edge(current, body, EdgeKind::Fallthrough);
        {
            let mut codes_by_block: Vec<Vec<i64>> = Vec::new();
            for &marker in &catch_markers {
                if let StmtKind::Catch { codes } = &self.unit.statements[marker].kind {
                    codes_by_block.push(codes.iter().filter_map(code_const).collect());
                }
            }
            self.cfg.try_regions.push(crate::cfg::TryRegion {
                body,
                exit,
                handlers: marker_blocks.clone(),
                codes: codes_by_block,
            });
        }
        ctx.frames.push(Frame::Try {
            handlers: handlers.clone(),
            catch_all,
            finally_range,
            region: (i, end_idx + 1),
        });
        let body_end = self.build_range((i + 1, body_end_idx), body, ctx);
        ctx.frames.pop();
        if !self.closed && !self.cfg.blocks[body_end].terminated {
            let from = self.finally_copy(body_end, finally_range, ctx);
            self.cfg.add_edge(from, exit, EdgeKind::Fallthrough);
        }
        self.closed = false;

        // Handlers run outside the TRY (a THROW inside a handler propagates
        // outward), but still leave through FINALLY.
        for (h, &marker) in catch_markers.iter().enumerate() {
            let handler_block = marker_blocks[h];
            let body_range = (
                marker + 1,
                catch_markers
                    .get(h + 1)
                    .copied()
                    .or(finally_marker)
                    .unwrap_or(end_idx),
            );
            let handler_end = self.build_range(body_range, handler_block, ctx);
            if !self.closed && !self.cfg.blocks[handler_end].terminated {
                let from = self.finally_copy(handler_end, finally_range, ctx);
                self.cfg.add_edge(from, exit, EdgeKind::Fallthrough);
            }
            self.closed = false;
        }

        self.wire_marker_landing(end_idx, exit);
        self.closed = false;
        (end_idx + 1, exit)
    }

    /// Build one private copy of the FINALLY body after `current`.
    fn finally_copy(
        &mut self,
        current: BlockId,
        finally_range: Option<(usize, usize)>,
        ctx: &mut Ctx,
    ) -> BlockId {
        let Some(range) = finally_range else {
            return current;
        };
        let fin = self.cfg.new_block(BlockKind::Finally, "finally");
        self.cfg.add_edge(current, fin, EdgeKind::Fallthrough);
        let out = self.build_range(range, fin, ctx);
        self.closed = false;
        out
    }

    /// THROW: an Exception edge to the innermost matching handler, running
    /// inner FINALLYs on the way; with no matching handler the block
    /// terminates into the runtime's throw stub.
    fn build_throw(&mut self, line: u32, code: Option<i64>, current: BlockId, ctx: &Ctx) {
        let _ = line;
        for (pos, frame) in ctx.frames.iter().enumerate().rev() {
            let Frame::Try {
                handlers,
                catch_all,
                ..
            } = frame
            else {
                continue;
            };
            let handler = match code {
                Some(c) => handlers
                    .iter()
                    .find(|(codes, _)| codes.contains(&c))
                    .map(|(_, b)| *b)
                    .or(*catch_all),
                // A dynamic code can only bind to a catch-all statically.
                None => *catch_all,
            };
            if let Some(handler) = handler {
                // Finallys of TRY regions between the throw and the handler
                // run first; the handler's own frame is at `pos`.
                let from = self.emit_finallys(current, ctx, pos + 1);
                self.cfg.add_edge(from, handler, EdgeKind::Exception);
                return;
            }
        }
        // No handler in this function: the runtime terminates the program.
        self.cfg.blocks[current].terminated = true;
    }

    // ------------------------------------------------------------------
    // Matching helpers
    // ------------------------------------------------------------------

    /// Index of the closer matching the opener at `i`, scanning with a
    /// per-family depth delta.
    fn find_closer(
        &self,
        i: usize,
        end: usize,
        delta: fn(&StmtKind) -> i32,
    ) -> Option<usize> {
        let mut depth = 1i32;
        for (j, stmt) in self.unit.statements[i + 1..end].iter().enumerate() {
            depth += delta(&stmt.kind);
            if depth == 0 {
                return Some(i + 1 + j);
            }
        }
        None
    }
}

fn for_delta(kind: &StmtKind) -> i32 {
    match kind {
        StmtKind::For { .. } => 1,
        StmtKind::Next { .. } => -1,
        _ => 0,
    }
}

fn while_delta(kind: &StmtKind) -> i32 {
    match kind {
        StmtKind::While { .. } => 1,
        StmtKind::Wend => -1,
        _ => 0,
    }
}

fn do_delta(kind: &StmtKind) -> i32 {
    match kind {
        StmtKind::Do { .. } => 1,
        StmtKind::Loop { .. } => -1,
        _ => 0,
    }
}

fn repeat_delta(kind: &StmtKind) -> i32 {
    match kind {
        StmtKind::Repeat => 1,
        StmtKind::Until { .. } => -1,
        _ => 0,
    }
}

fn find_exit_target(ctx: &Ctx, kind: ExitKind) -> Option<(usize, BlockId)> {
    for (pos, frame) in ctx.frames.iter().enumerate().rev() {
        match (kind, frame) {
            (ExitKind::For, Frame::ForLoop { exit, .. })
            | (ExitKind::While, Frame::WhileLoop { exit, .. })
            | (ExitKind::Do, Frame::DoLoop { exit, .. }) => return Some((pos, *exit)),
            _ => {}
        }
    }
    None
}

fn find_continue_target(ctx: &Ctx, kind: ContinueKind) -> Option<(usize, BlockId)> {
    for (pos, frame) in ctx.frames.iter().enumerate().rev() {
        match (kind, frame) {
            (ContinueKind::For, Frame::ForLoop { increment, .. }) => {
                return Some((pos, *increment));
            }
            (ContinueKind::While, Frame::WhileLoop { header, .. }) => {
                return Some((pos, *header));
            }
            (ContinueKind::Do, Frame::DoLoop { continue_to, .. }) => {
                return Some((pos, *continue_to));
            }
            _ => {}
        }
    }
    None
}

/// Constant integer value of an annotated expression, when it is one.
fn code_const(expr: &crate::ast::Expr) -> Option<i64> {
    match &expr.kind {
        ExprKind::IntLit(n) => Some(*n),
        ExprKind::Unary {
            op: UnOp::Neg,
            operand,
        } => code_const(operand).map(|n| -n),
        ExprKind::Convert { operand } => code_const(operand),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::EdgeKind;
    use crate::parser::Parser;
    use crate::semantics::{AnalyzerOptions, analyze};

    fn cfg_for(src: &str) -> Cfg {
        let (program, diags) = Parser::new(src).parse();
        assert!(!diags.has_errors(), "parse: {:?}", diags.into_vec());
        let (analyzed, diags) = analyze(program, AnalyzerOptions::default());
        let analyzed = analyzed.unwrap_or_else(|| panic!("analysis: {:?}", diags.into_vec()));
        build_unit_cfg(&analyzed.units[0]).expect("cfg builds")
    }

    fn count_kind(cfg: &Cfg, kind: BlockKind) -> usize {
        cfg.blocks.iter().filter(|b| b.kind == kind).count()
    }

    #[test]
    fn straight_line_program_is_one_block_chain() {
        let cfg = cfg_for("a = 1\nb = 2\nPRINT a + b");
        assert!(cfg.verify().is_ok());
        // entry -> exit reachable, one statement-bearing block.
        let loaded: Vec<_> = cfg
            .blocks
            .iter()
            .filter(|b| !b.statements.is_empty())
            .collect();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].statements.len(), 3);
    }

    #[test]
    fn for_loop_shape() {
        let cfg = cfg_for("DIM s AS INTEGER\ns = 0\nFOR i = 10 TO 1 STEP -1\ns = s + i\nNEXT i\nPRINT s");
        assert!(cfg.verify().is_ok());
        assert_eq!(count_kind(&cfg, BlockKind::LoopHeader), 1);
        assert_eq!(count_kind(&cfg, BlockKind::LoopIncrement), 1);
        assert_eq!(count_kind(&cfg, BlockKind::LoopExit), 1);
        // Back-edge: increment -> header, Jump.
        let header = cfg
            .blocks
            .iter()
            .find(|b| b.kind == BlockKind::LoopHeader)
            .unwrap();
        let increment = cfg
            .blocks
            .iter()
            .find(|b| b.kind == BlockKind::LoopIncrement)
            .unwrap();
        assert!(
            increment
                .edges_out
                .iter()
                .any(|e| e.target == header.id && e.kind == EdgeKind::Jump)
        );
        // Header has exactly CondTrue + CondFalse.
        assert_eq!(header.edges_out.len(), 2);
    }

    #[test]
    fn nested_for_inside_if_backedge_targets_own_header() {
        let cfg = cfg_for(
            "DIM c AS INTEGER : c = 0\nIF 1 = 1 THEN\nFOR k = 1 TO 5 : c = c + 1 : NEXT k\nEND IF\nPRINT c",
        );
        assert!(cfg.verify().is_ok());
        let header = cfg
            .blocks
            .iter()
            .find(|b| b.kind == BlockKind::LoopHeader)
            .expect("loop header");
        let increment = cfg
            .blocks
            .iter()
            .find(|b| b.kind == BlockKind::LoopIncrement)
            .unwrap();
        // The FOR's back-edge targets its own header, not the IF join.
        assert_eq!(increment.edges_out.len(), 1);
        assert_eq!(increment.edges_out[0].target, header.id);
        assert_eq!(count_kind(&cfg, BlockKind::IfJoin), 1);
    }

    #[test]
    fn while_and_do_variants() {
        let cfg = cfg_for("WHILE a < 3\na = a + 1\nWEND");
        assert!(cfg.verify().is_ok());
        assert_eq!(count_kind(&cfg, BlockKind::LoopHeader), 1);

        // DO UNTIL: edges swapped, no negation.
        let cfg = cfg_for("DO UNTIL a = 3\na = a + 1\nLOOP");
        let header = cfg
            .blocks
            .iter()
            .find(|b| b.kind == BlockKind::LoopHeader)
            .unwrap();
        let true_edge = header
            .edges_out
            .iter()
            .find(|e| e.kind == EdgeKind::CondTrue)
            .unwrap();
        assert_eq!(
            cfg.blocks[true_edge.target].kind,
            BlockKind::LoopExit,
            "UNTIL true-edge leaves the loop"
        );
    }

    #[test]
    fn multiline_if_chain() {
        let cfg = cfg_for("IF a = 1 THEN\nPRINT 1\nELSEIF a = 2 THEN\nPRINT 2\nELSE\nPRINT 3\nEND IF\nPRINT 4");
        assert!(cfg.verify().is_ok());
        assert_eq!(count_kind(&cfg, BlockKind::IfThen), 2);
        assert_eq!(count_kind(&cfg, BlockKind::IfElse), 1);
        assert_eq!(count_kind(&cfg, BlockKind::IfJoin), 1);
    }

    #[test]
    fn select_case_chain_single_join() {
        let cfg = cfg_for(
            "SELECT CASE n\nCASE 1\nPRINT 1\nCASE 2, 3\nPRINT 2\nCASE ELSE\nPRINT 0\nEND SELECT",
        );
        assert!(cfg.verify().is_ok());
        assert_eq!(count_kind(&cfg, BlockKind::SelectCase), 2);
        assert_eq!(count_kind(&cfg, BlockKind::SelectJoin), 1);
        assert_eq!(cfg.case_selectors.len(), 2);
    }

    #[test]
    fn gosub_landing_reachable_only_by_return() {
        let cfg = cfg_for("10 GOSUB 100\n20 GOSUB 100\n30 END\n100 PRINT 1\n110 RETURN");
        assert!(cfg.verify().is_ok());
        assert_eq!(cfg.landings.len(), 2);
        // RETURN fans out to both landings.
        let return_edges: usize = cfg
            .blocks
            .iter()
            .flat_map(|b| &b.edges_out)
            .filter(|e| e.kind == EdgeKind::Return)
            .count();
        assert_eq!(return_edges, 2);
    }

    #[test]
    fn on_goto_multiway_with_fallthrough() {
        let cfg = cfg_for("10 ON x GOTO 100, 200\n20 PRINT 0\n30 END\n100 PRINT 1\n110 END\n200 PRINT 2");
        assert!(cfg.verify().is_ok());
        let dispatch = cfg
            .blocks
            .iter()
            .find(|b| b.edges_out.iter().any(|e| matches!(e.kind, EdgeKind::Multiway(_))))
            .expect("dispatch block");
        let multiway: Vec<_> = dispatch
            .edges_out
            .iter()
            .filter(|e| matches!(e.kind, EdgeKind::Multiway(_)))
            .collect();
        assert_eq!(multiway.len(), 2);
        assert_eq!(multiway[0].guard, Some(1));
        assert_eq!(multiway[1].guard, Some(2));
        assert!(
            dispatch
                .edges_out
                .iter()
                .any(|e| e.kind == EdgeKind::Fallthrough),
            "out-of-range fallthrough"
        );
    }

    #[test]
    fn on_gosub_landing_not_entered_by_fallthrough() {
        let cfg = cfg_for(
            "10 x = 5\n20 ON x GOSUB 100, 200\n30 PRINT 0\n40 END\n100 PRINT 1 : RETURN\n200 PRINT 2 : RETURN",
        );
        assert!(cfg.verify().is_ok());
        assert_eq!(cfg.landings.len(), 1);
    }

    #[test]
    fn exit_and_continue_target_loop_blocks() {
        let cfg = cfg_for("FOR i = 1 TO 10\nIF i = 5 THEN\nEXIT FOR\nEND IF\nCONTINUE FOR\nNEXT i");
        assert!(cfg.verify().is_ok());
        let exit_block = cfg
            .blocks
            .iter()
            .find(|b| b.kind == BlockKind::LoopExit)
            .unwrap();
        let increment = cfg
            .blocks
            .iter()
            .find(|b| b.kind == BlockKind::LoopIncrement)
            .unwrap();
        let jumps_to = |target: BlockId| {
            cfg.blocks
                .iter()
                .flat_map(|b| &b.edges_out)
                .filter(|e| e.kind == EdgeKind::Jump && e.target == target)
                .count()
        };
        assert!(jumps_to(exit_block.id) >= 1, "EXIT FOR jumps to loop exit");
        assert!(jumps_to(increment.id) >= 1, "CONTINUE FOR jumps to increment");
    }

    #[test]
    fn try_throw_routes_to_matching_handler() {
        let cfg = cfg_for("TRY\nTHROW 5\nCATCH 5\nPRINT 1\nCATCH 9\nPRINT 2\nEND TRY");
        assert!(cfg.verify().is_ok());
        let exception_edges: Vec<_> = cfg
            .blocks
            .iter()
            .flat_map(|b| &b.edges_out)
            .filter(|e| e.kind == EdgeKind::Exception)
            .collect();
        assert_eq!(exception_edges.len(), 1);
        assert_eq!(
            cfg.blocks[exception_edges[0].target].kind,
            BlockKind::CatchHandler
        );
    }

    #[test]
    fn throw_without_handler_terminates_block() {
        let cfg = cfg_for("THROW 3");
        assert!(cfg.verify().is_ok());
        let thrower = cfg
            .blocks
            .iter()
            .find(|b| !b.statements.is_empty())
            .unwrap();
        assert!(thrower.terminated);
        assert!(thrower.edges_out.is_empty());
    }

    #[test]
    fn finally_runs_on_normal_and_handler_paths() {
        let cfg = cfg_for("TRY\nPRINT 1\nCATCH 5\nPRINT 2\nFINALLY\nPRINT 9\nEND TRY");
        assert!(cfg.verify().is_ok());
        // One finally copy for the body path, one for the handler path.
        assert_eq!(count_kind(&cfg, BlockKind::Finally), 2);
    }

    #[test]
    fn goto_into_earlier_line_forms_loop() {
        let cfg = cfg_for("10 PRINT 1\n20 GOTO 10");
        assert!(cfg.verify().is_ok());
        let jumps: usize = cfg
            .blocks
            .iter()
            .flat_map(|b| &b.edges_out)
            .filter(|e| e.kind == EdgeKind::Jump)
            .count();
        assert_eq!(jumps, 1);
    }

    #[test]
    fn code_after_goto_is_unreachable_block() {
        let cfg = cfg_for("10 GOTO 30\n20 PRINT 1\n30 PRINT 2");
        assert!(cfg.verify().is_ok());
        // Line 20 is not a jump target: it lands in an Unreachable block.
        assert!(count_kind(&cfg, BlockKind::Unreachable) >= 1);
    }
}
