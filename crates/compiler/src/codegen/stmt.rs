//! Statement lowering.
//!
//! Statements arrive through CFG blocks; control transfers themselves are
//! emitted by the terminator pass in `mod.rs`, so what remains here is the
//! data work: assignments with the string retain/release discipline, array
//! plumbing, PRINT's sign-aware widening, and the FOR loop's three roles
//! (init, predicate, increment) keyed by block kind.

use super::expr::{ExprVal, cmp_name};
use super::{Emitter, FnCtx, VarStorage, element_kind_tag, mangle_ident, return_slot_name, zero_value};
use crate::ast::{BinOp, CaseArm, Expr, JumpTarget, LValue, PrintItem, PrintSep, Stmt, StmtKind};
use crate::cfg::{BlockId, BlockKind};
use crate::diag::{Diagnostic, ErrorKind};
use crate::il::{Inst, RValue, Value};
use crate::types::{MemOp, TypeDescriptor, ValueClass};

type EmitResult<T> = Result<T, Diagnostic>;

impl<'a> Emitter<'a> {
    pub(crate) fn lower_stmt(
        &mut self,
        fx: &mut FnCtx<'_>,
        bid: BlockId,
        sidx: usize,
    ) -> EmitResult<()> {
        let stmt: Stmt = fx.unit.statements[sidx].clone();
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Let { target, value } => {
                let val = self.lower_expr(fx, value)?;
                self.store_lvalue(fx, line, target, val)
            }
            StmtKind::Dim { decls, .. } => {
                for decl in decls {
                    if decl.bounds.is_empty() {
                        continue; // scalars were prepared by prologue / runtime zeroing
                    }
                    self.lower_dim_array(fx, line, &decl.name, &decl.bounds)?;
                }
                Ok(())
            }
            StmtKind::Redim {
                preserve,
                name,
                bounds,
            } => {
                let array = self.array_pointer(fx, line, name)?;
                let buf = self.fill_bounds(fx, bounds)?;
                let helper = if *preserve {
                    "array_redim_preserve"
                } else {
                    "array_redim"
                };
                self.rt_call(
                    fx,
                    helper,
                    vec![array, Value::ConstInt(bounds.len() as i64), buf],
                );
                Ok(())
            }
            StmtKind::Erase { names } => {
                for name in names {
                    let array = self.array_pointer(fx, line, name)?;
                    self.rt_call(fx, "array_erase", vec![array]);
                    // Null the descriptor so the tidy exit cannot erase it
                    // a second time.
                    self.store_array_pointer(fx, line, name, Value::ConstInt(0))?;
                }
                Ok(())
            }
            StmtKind::Print {
                items,
                trailing_newline,
            } => self.lower_print(fx, items, *trailing_newline),
            StmtKind::Input { prompt, targets } => {
                if let Some(prompt) = prompt {
                    let sym = self.literal_symbol(prompt);
                    let p = self.rt_call_ret(fx, "string_new_utf8", vec![Value::Global(sym)]);
                    self.rt_call(fx, "basic_print_string", vec![p.clone()]);
                    self.rt_call(fx, "string_release", vec![p]);
                }
                for target in targets {
                    let desc = self.lvalue_descriptor(fx, line, target)?;
                    let val = if desc.is_string() {
                        let v = self.rt_call_ret(fx, "basic_input_string", vec![]);
                        ExprVal {
                            value: v,
                            desc,
                            fresh: true,
                        }
                    } else if desc.is_float() {
                        let v = self.rt_call_ret(fx, "basic_input_double", vec![]);
                        let c = self.convert(fx, v, TypeDescriptor::double(), desc);
                        ExprVal {
                            value: c,
                            desc,
                            fresh: false,
                        }
                    } else {
                        let v = self.rt_call_ret(fx, "basic_input_int", vec![]);
                        let c = self.convert(fx, v, TypeDescriptor::int64(), desc);
                        ExprVal {
                            value: c,
                            desc,
                            fresh: false,
                        }
                    };
                    self.store_lvalue(fx, line, target, val)?;
                }
                Ok(())
            }
            StmtKind::If { cond } | StmtKind::ElseIf { cond } => {
                let c = self.lower_condition(fx, cond)?;
                fx.cond = Some(c);
                Ok(())
            }
            StmtKind::While { cond } | StmtKind::Until { cond } => {
                let c = self.lower_condition(fx, cond)?;
                fx.cond = Some(c);
                Ok(())
            }
            StmtKind::Do { test } | StmtKind::Loop { test } => {
                if let Some(test) = test {
                    let c = self.lower_condition(fx, &test.cond)?;
                    fx.cond = Some(c);
                }
                Ok(())
            }
            StmtKind::Select { expr } => {
                let val = self.lower_expr(fx, expr)?;
                let sel = format!("sel{}", sidx);
                fx.push(Inst::Assign {
                    dest: sel.clone(),
                    class: val.desc.il_value_class(),
                    rvalue: RValue::Copy(val.value),
                });
                fx.select_temps.insert(sidx, Value::Temp(sel));
                Ok(())
            }
            StmtKind::Case { arms } => self.lower_case(fx, sidx, arms),
            StmtKind::For {
                var,
                start,
                end,
                step,
            } => self.lower_for(fx, bid, sidx, line, var, start, end, step.as_ref()),
            StmtKind::Gosub { .. } => {
                let id = fx.landing_ids[&sidx];
                self.emit_gosub_push(fx, id);
                Ok(())
            }
            StmtKind::OnGoto { selector, .. } | StmtKind::OnGosub { selector, .. } => {
                let val = self.lower_expr(fx, selector)?;
                let wide = self.convert(fx, val.value, val.desc, TypeDescriptor::int64());
                fx.on_selector = Some(wide);
                Ok(())
            }
            StmtKind::Throw { code } => {
                // Any outgoing edge means the builder routed this THROW to a
                // handler (directly or through FINALLY copies); only a
                // dead-end THROW reaches the runtime.
                if fx.cfg.blocks[bid].edges_out.is_empty() {
                    let val = self.lower_expr(fx, code)?;
                    let wide = self.convert(fx, val.value, val.desc, TypeDescriptor::int64());
                    self.rt_call(fx, "basic_throw", vec![wide]);
                }
                Ok(())
            }
            StmtKind::End { code } => {
                let value = match code {
                    Some(code) => {
                        let val = self.lower_expr(fx, code)?;
                        self.convert(fx, val.value, val.desc, TypeDescriptor::int64())
                    }
                    None => Value::ConstInt(0),
                };
                self.rt_call(fx, "basic_end", vec![value]);
                Ok(())
            }
            StmtKind::Call { name, args } => {
                let ret_is_string = self
                    .program
                    .symbols
                    .function(name)
                    .map(|s| s.ret.is_string())
                    .unwrap_or(false);
                let result = self.lower_user_call(fx, line, name, args)?;
                // A discarded string result would leak without a release.
                if let Some(value) = result
                    && ret_is_string
                {
                    self.rt_call(fx, "string_release", vec![value]);
                }
                Ok(())
            }
            StmtKind::Read { targets } => {
                for target in targets {
                    let desc = self.lvalue_descriptor(fx, line, target)?;
                    let val = if desc.is_string() {
                        let v = self.rt_call_ret(fx, "basic_data_read_string", vec![]);
                        ExprVal {
                            value: v,
                            desc,
                            fresh: true,
                        }
                    } else if desc.is_float() {
                        let v = self.rt_call_ret(fx, "basic_data_read_double", vec![]);
                        let c = self.convert(fx, v, TypeDescriptor::double(), desc);
                        ExprVal {
                            value: c,
                            desc,
                            fresh: false,
                        }
                    } else {
                        let v = self.rt_call_ret(fx, "basic_data_read_int", vec![]);
                        let c = self.convert(fx, v, TypeDescriptor::int64(), desc);
                        ExprVal {
                            value: c,
                            desc,
                            fresh: false,
                        }
                    };
                    self.store_lvalue(fx, line, target, val)?;
                }
                Ok(())
            }
            StmtKind::Restore { target } => {
                let index = match target {
                    Some(JumpTarget::Line(n)) => self
                        .program
                        .restore_points
                        .get(n)
                        .copied()
                        .unwrap_or(0) as i64,
                    _ => 0,
                };
                self.rt_call(fx, "basic_data_restore", vec![Value::ConstInt(index)]);
                Ok(())
            }
            // Control transfers the terminator pass owns, and inert tags.
            StmtKind::Goto { .. }
            | StmtKind::Return
            | StmtKind::Exit { .. }
            | StmtKind::Continue { .. }
            | StmtKind::Label { .. }
            | StmtKind::Data { .. }
            | StmtKind::Shared { .. }
            | StmtKind::Constant { .. }
            | StmtKind::Type { .. }
            | StmtKind::Sub { .. }
            | StmtKind::Function { .. }
            | StmtKind::EndSub
            | StmtKind::EndFunction => Ok(()),
            _ => Err(Diagnostic::error(
                line,
                ErrorKind::UnsupportedConstruct,
                "internal: structural marker reached the emitter",
            )),
        }
    }

    // ------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------

    fn lvalue_descriptor(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        target: &LValue,
    ) -> EmitResult<TypeDescriptor> {
        match target {
            LValue::Var(name) => {
                if !fx.unit.is_main
                    && !fx.unit.is_sub
                    && name.eq_ignore_ascii_case(&fx.unit.name)
                {
                    let sym = self.program.symbols.function(&fx.unit.name).ok_or_else(|| {
                        Diagnostic::error(line, ErrorKind::UnknownFunction, "missing function symbol")
                    })?;
                    return Ok(sym.ret);
                }
                self.storage_of(fx, name)
                    .map(|s| s.descriptor())
                    .ok_or_else(|| {
                        Diagnostic::error(
                            line,
                            ErrorKind::UndeclaredVariable,
                            format!("internal: no storage for {}", name),
                        )
                    })
            }
            LValue::Element { name, .. } => self
                .program
                .symbols
                .resolve_array(&fx.unit.name, name)
                .map(|a| a.element)
                .ok_or_else(|| {
                    Diagnostic::error(
                        line,
                        ErrorKind::UndeclaredVariable,
                        format!("internal: unknown array {}", name),
                    )
                }),
            LValue::Member { base, path } => {
                let mut desc = self
                    .storage_of(fx, base)
                    .map(|s| s.descriptor())
                    .ok_or_else(|| {
                        Diagnostic::error(
                            line,
                            ErrorKind::UndeclaredVariable,
                            format!("internal: no storage for {}", base),
                        )
                    })?;
                for field in path {
                    desc = self.record_field(line, desc, field)?.1;
                }
                Ok(desc)
            }
            LValue::Slice { name, .. } | LValue::Mid { name, .. } => self
                .storage_of(fx, name)
                .map(|s| s.descriptor())
                .ok_or_else(|| {
                    Diagnostic::error(
                        line,
                        ErrorKind::UndeclaredVariable,
                        format!("internal: no storage for {}", name),
                    )
                }),
        }
    }

    fn store_lvalue(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        target: &LValue,
        val: ExprVal,
    ) -> EmitResult<()> {
        match target {
            LValue::Var(name) => self.assign_var(fx, line, name, val),
            LValue::Element { name, indices } => {
                let desc = self
                    .program
                    .symbols
                    .resolve_array(&fx.unit.name, name)
                    .map(|a| a.element)
                    .ok_or_else(|| {
                        Diagnostic::error(
                            line,
                            ErrorKind::UndeclaredVariable,
                            format!("internal: unknown array {}", name),
                        )
                    })?;
                let addr = self.array_elem_addr(fx, line, name, indices)?;
                self.store_through(fx, desc, addr, val);
                Ok(())
            }
            LValue::Member { base, path } => {
                let (addr, desc) = self.member_lvalue_addr(fx, line, base, path)?;
                self.store_through(fx, desc, addr, val);
                Ok(())
            }
            LValue::Slice { name, lo, hi } => {
                let lo_v = self.eval_index(fx, lo)?;
                let hi_v = self.eval_index(fx, hi)?;
                self.cow_assign(fx, line, name, "string_slice_assign", lo_v, hi_v, val)
            }
            LValue::Mid { name, pos, len } => {
                let pos_v = self.eval_index(fx, pos)?;
                let len_v = self.eval_index(fx, len)?;
                self.cow_assign(fx, line, name, "string_mid_assign", pos_v, len_v, val)
            }
        }
    }

    fn eval_index(&mut self, fx: &mut FnCtx<'_>, expr: &Expr) -> EmitResult<Value> {
        let val = self.lower_expr(fx, expr)?;
        Ok(self.convert(fx, val.value, val.desc, TypeDescriptor::int64()))
    }

    /// Slice / MID$ assignment: the runtime applies copy-on-write and
    /// returns the descriptor the variable must hold afterwards. The
    /// caller's reference moves into the call, so no extra retain/release
    /// happens on the target.
    fn cow_assign(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        name: &str,
        helper: &str,
        a: Value,
        b: Value,
        repl: ExprVal,
    ) -> EmitResult<()> {
        let storage = self.storage_of(fx, name).ok_or_else(|| {
            Diagnostic::error(
                line,
                ErrorKind::UndeclaredVariable,
                format!("internal: no storage for {}", name),
            )
        })?;
        let old = self.load_storage(fx, &storage);
        let out = self.rt_call_ret(fx, helper, vec![old, a, b, repl.value.clone()]);
        self.release_if_fresh(fx, &repl);
        self.store_storage_raw(fx, &storage, out);
        Ok(())
    }

    /// `x = v` with the string ownership dance: retain named sources,
    /// release the old value, store the new one.
    fn assign_var(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        name: &str,
        val: ExprVal,
    ) -> EmitResult<()> {
        // Function return slot.
        if !fx.unit.is_main
            && !fx.unit.is_sub
            && name.eq_ignore_ascii_case(&fx.unit.name)
        {
            let sym = self.program.symbols.function(&fx.unit.name).ok_or_else(|| {
                Diagnostic::error(line, ErrorKind::UnknownFunction, "missing function symbol")
            })?;
            let slot = return_slot_name(&fx.unit.name, sym.ret);
            if sym.ret.is_string() {
                let owned = if val.fresh {
                    val.value
                } else {
                    self.rt_call_ret(fx, "string_retain", vec![val.value])
                };
                self.rt_call(fx, "string_release", vec![Value::Temp(slot.clone())]);
                fx.push(Inst::Assign {
                    dest: slot,
                    class: ValueClass::Ptr,
                    rvalue: RValue::Copy(owned),
                });
            } else {
                fx.push(Inst::Assign {
                    dest: slot,
                    class: sym.ret.il_value_class(),
                    rvalue: RValue::Copy(val.value),
                });
            }
            return Ok(());
        }

        let storage = self.storage_of(fx, name).ok_or_else(|| {
            Diagnostic::error(
                line,
                ErrorKind::UndeclaredVariable,
                format!("internal: no storage for {}", name),
            )
        })?;
        let desc = storage.descriptor();
        if desc.is_string() {
            let owned = if val.fresh {
                val.value
            } else {
                self.rt_call_ret(fx, "string_retain", vec![val.value])
            };
            let old = self.load_storage(fx, &storage);
            self.rt_call(fx, "string_release", vec![old]);
            self.store_storage_raw(fx, &storage, owned);
        } else {
            self.store_storage_raw(fx, &storage, val.value);
        }
        Ok(())
    }

    /// Typed store through an address, with the string dance for string
    /// cells.
    fn store_through(&mut self, fx: &mut FnCtx<'_>, desc: TypeDescriptor, addr: Value, val: ExprVal) {
        if desc.is_string() {
            let owned = if val.fresh {
                val.value
            } else {
                self.rt_call_ret(fx, "string_retain", vec![val.value])
            };
            let old = fx.fresh("t");
            fx.push(Inst::Assign {
                dest: old.clone(),
                class: ValueClass::Ptr,
                rvalue: RValue::Load {
                    width: MemOp::L,
                    addr: addr.clone(),
                },
            });
            self.rt_call(fx, "string_release", vec![Value::Temp(old)]);
            fx.push(Inst::Store {
                width: MemOp::L,
                value: owned,
                addr,
            });
            return;
        }
        fx.push(Inst::Store {
            width: desc.il_mem_op(),
            value: val.value,
            addr,
        });
    }

    fn load_storage(&mut self, fx: &mut FnCtx<'_>, storage: &VarStorage) -> Value {
        match storage {
            VarStorage::Temp { name, .. } => Value::Temp(name.clone()),
            VarStorage::GlobalSlot { slot, desc } => {
                let addr = self.global_slot_addr(fx, *slot);
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: desc.il_value_class(),
                    rvalue: RValue::Load {
                        width: desc.il_mem_op(),
                        addr,
                    },
                });
                Value::Temp(dest)
            }
            VarStorage::Stack { slot, desc } => {
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: desc.il_value_class(),
                    rvalue: RValue::Load {
                        width: desc.il_mem_op(),
                        addr: Value::Temp(slot.clone()),
                    },
                });
                Value::Temp(dest)
            }
            VarStorage::ByRef { ptr, desc } => {
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: desc.il_value_class(),
                    rvalue: RValue::Load {
                        width: desc.il_mem_op(),
                        addr: Value::Temp(ptr.clone()),
                    },
                });
                Value::Temp(dest)
            }
            VarStorage::Const { .. } => Value::ConstInt(0),
        }
    }

    fn store_storage_raw(&mut self, fx: &mut FnCtx<'_>, storage: &VarStorage, value: Value) {
        match storage {
            VarStorage::Temp { name, desc } => {
                fx.push(Inst::Assign {
                    dest: name.clone(),
                    class: desc.il_value_class(),
                    rvalue: RValue::Copy(value),
                });
            }
            VarStorage::GlobalSlot { slot, desc } => {
                let addr = self.global_slot_addr(fx, *slot);
                fx.push(Inst::Store {
                    width: desc.il_mem_op(),
                    value,
                    addr,
                });
            }
            VarStorage::Stack { slot, desc } => {
                fx.push(Inst::Store {
                    width: desc.il_mem_op(),
                    value,
                    addr: Value::Temp(slot.clone()),
                });
            }
            VarStorage::ByRef { ptr, desc } => {
                fx.push(Inst::Store {
                    width: desc.il_mem_op(),
                    value,
                    addr: Value::Temp(ptr.clone()),
                });
            }
            VarStorage::Const { .. } => {}
        }
    }

    fn member_lvalue_addr(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        base: &str,
        path: &[String],
    ) -> EmitResult<(Value, TypeDescriptor)> {
        let storage = self.storage_of(fx, base).ok_or_else(|| {
            Diagnostic::error(
                line,
                ErrorKind::UndeclaredVariable,
                format!("internal: no storage for {}", base),
            )
        })?;
        let VarStorage::Stack { slot, desc } = storage else {
            return Err(Diagnostic::error(
                line,
                ErrorKind::UnsupportedConstruct,
                "record variables live in procedure frames",
            ));
        };
        let mut addr = Value::Temp(slot);
        let mut desc = desc;
        for field in path {
            let (offset, field_desc) = self.record_field(line, desc, field)?;
            if offset != 0 {
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: ValueClass::Ptr,
                    rvalue: RValue::Bin {
                        op: "add",
                        lhs: addr,
                        rhs: Value::ConstInt(offset),
                    },
                });
                addr = Value::Temp(dest);
            }
            desc = field_desc;
        }
        Ok((addr, desc))
    }

    fn record_field(
        &self,
        line: u32,
        desc: TypeDescriptor,
        field: &str,
    ) -> EmitResult<(i64, TypeDescriptor)> {
        let crate::types::BaseType::UserDefined(id) = desc.base else {
            return Err(Diagnostic::error(
                line,
                ErrorKind::UnsupportedConstruct,
                "member access on a non-record value",
            ));
        };
        let (_, ty) = self.program.symbols.type_by_id(id).ok_or_else(|| {
            Diagnostic::error(line, ErrorKind::UnsupportedConstruct, "dangling record id")
        })?;
        let f = ty.field(field).ok_or_else(|| {
            Diagnostic::error(
                line,
                ErrorKind::UnsupportedConstruct,
                format!("internal: missing field {}", field),
            )
        })?;
        Ok((f.byte_offset as i64, f.descriptor))
    }

    // ------------------------------------------------------------------
    // Arrays
    // ------------------------------------------------------------------

    fn fill_bounds(&mut self, fx: &mut FnCtx<'_>, bounds: &[Expr]) -> EmitResult<Value> {
        let buf = self.dims_buffer(fx);
        for (i, bound) in bounds.iter().enumerate() {
            let v = self.eval_index(fx, bound)?;
            let addr = if i == 0 {
                buf.clone()
            } else {
                let t = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: t.clone(),
                    class: ValueClass::Ptr,
                    rvalue: RValue::Bin {
                        op: "add",
                        lhs: buf.clone(),
                        rhs: Value::ConstInt(i as i64 * 8),
                    },
                });
                Value::Temp(t)
            };
            fx.push(Inst::Store {
                width: MemOp::L,
                value: v,
                addr,
            });
        }
        Ok(buf)
    }

    fn lower_dim_array(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        name: &str,
        bounds: &[Expr],
    ) -> EmitResult<()> {
        let element = self
            .program
            .symbols
            .resolve_array(&fx.unit.name, name)
            .map(|a| a.element)
            .ok_or_else(|| {
                Diagnostic::error(
                    line,
                    ErrorKind::UndeclaredVariable,
                    format!("internal: unknown array {}", name),
                )
            })?;
        let kind = element_kind_tag(element).ok_or_else(|| {
            Diagnostic::error(
                line,
                ErrorKind::UnsupportedConstruct,
                "arrays of records are not supported",
            )
        })?;
        let buf = self.fill_bounds(fx, bounds)?;
        let array = self.rt_call_ret(
            fx,
            "array_new",
            vec![Value::ConstInt(bounds.len() as i64), buf, Value::ConstInt(kind)],
        );
        self.store_array_pointer(fx, line, name, array)
    }

    fn store_array_pointer(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        name: &str,
        value: Value,
    ) -> EmitResult<()> {
        let (_, sym) = self
            .program
            .symbols
            .resolve_array_scoped(&fx.unit.name, name)
            .ok_or_else(|| {
                Diagnostic::error(
                    line,
                    ErrorKind::UndeclaredVariable,
                    format!("internal: unknown array {}", name),
                )
            })?;
        if let Some(slot) = sym.slot_offset {
            let addr = self.global_slot_addr(fx, slot);
            fx.push(Inst::Store {
                width: MemOp::L,
                value,
                addr,
            });
        } else {
            fx.push(Inst::Assign {
                dest: format!("arr_{}", mangle_ident(name)),
                class: ValueClass::Ptr,
                rvalue: RValue::Copy(value),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // PRINT
    // ------------------------------------------------------------------

    /// Any runtime call whose signature is wider than the producing
    /// expression extends first; PRINT of a `w` value sign- or zero-extends
    /// to `l` per the source type.
    fn lower_print(
        &mut self,
        fx: &mut FnCtx<'_>,
        items: &[PrintItem],
        trailing_newline: bool,
    ) -> EmitResult<()> {
        for item in items {
            let val = self.lower_expr(fx, &item.expr)?;
            if val.desc.is_string() {
                self.rt_call(fx, "basic_print_string", vec![val.value.clone()]);
                self.release_if_fresh(fx, &val);
            } else if val.desc.is_float() {
                let wide = self.convert(fx, val.value, val.desc, TypeDescriptor::double());
                self.rt_call(fx, "basic_print_double", vec![wide]);
            } else {
                let wide = self.convert(fx, val.value, val.desc, TypeDescriptor::int64());
                self.rt_call(fx, "basic_print_int", vec![wide]);
            }
            if item.sep == Some(PrintSep::Comma) {
                self.rt_call(fx, "basic_print_tab", vec![]);
            }
        }
        if trailing_newline {
            self.rt_call(fx, "basic_print_newline", vec![]);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // SELECT CASE
    // ------------------------------------------------------------------

    fn lower_case(&mut self, fx: &mut FnCtx<'_>, sidx: usize, arms: &[CaseArm]) -> EmitResult<()> {
        let select_idx = *fx.cfg.case_selectors.get(&sidx).ok_or_else(|| {
            Diagnostic::error(
                0,
                ErrorKind::UnsupportedConstruct,
                "internal: CASE with no SELECT",
            )
        })?;
        let selector = fx.select_temps.get(&select_idx).cloned().ok_or_else(|| {
            Diagnostic::error(
                0,
                ErrorKind::UnsupportedConstruct,
                "internal: SELECT selector not yet lowered",
            )
        })?;
        let StmtKind::Select { expr } = &fx.unit.statements[select_idx].kind else {
            return Err(Diagnostic::error(
                0,
                ErrorKind::UnsupportedConstruct,
                "internal: case selector is not a SELECT",
            ));
        };
        let sel_desc = expr.descriptor();

        let mut combined: Option<Value> = None;
        for arm in arms {
            let c = self.lower_case_arm(fx, &selector, sel_desc, arm)?;
            combined = Some(match combined {
                None => c,
                Some(prev) => {
                    let dest = fx.fresh("t");
                    fx.push(Inst::Assign {
                        dest: dest.clone(),
                        class: ValueClass::W32,
                        rvalue: RValue::Bin {
                            op: "or",
                            lhs: prev,
                            rhs: c,
                        },
                    });
                    Value::Temp(dest)
                }
            });
        }
        fx.cond = combined.or(Some(Value::ConstInt(0)));
        Ok(())
    }

    fn lower_case_arm(
        &mut self,
        fx: &mut FnCtx<'_>,
        selector: &Value,
        sel_desc: TypeDescriptor,
        arm: &CaseArm,
    ) -> EmitResult<Value> {
        let class = sel_desc.il_value_class();
        let signed = sel_desc.is_signed() || sel_desc.is_float();
        let compare = |this: &mut Self,
                       fx: &mut FnCtx<'_>,
                       op: BinOp,
                       rhs: &Expr|
         -> EmitResult<Value> {
            let val = this.lower_expr(fx, rhs)?;
            if sel_desc.is_string() {
                let ord = this.rt_call_ret(
                    fx,
                    "string_compare",
                    vec![selector.clone(), val.value.clone()],
                );
                this.release_if_fresh(fx, &val);
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Cmp {
                        op: cmp_name(op, ValueClass::L64, true),
                        lhs: ord,
                        rhs: Value::ConstInt(0),
                    },
                });
                return Ok(Value::Temp(dest));
            }
            let balanced = this.convert(fx, val.value, val.desc, sel_desc);
            let dest = fx.fresh("t");
            fx.push(Inst::Assign {
                dest: dest.clone(),
                class: ValueClass::W32,
                rvalue: RValue::Cmp {
                    op: cmp_name(op, class, signed),
                    lhs: selector.clone(),
                    rhs: balanced,
                },
            });
            Ok(Value::Temp(dest))
        };
        match arm {
            CaseArm::Value(e) => compare(self, fx, BinOp::Eq, e),
            CaseArm::Is(op, e) => compare(self, fx, *op, e),
            CaseArm::Range(lo, hi) => {
                let a = compare(self, fx, BinOp::Ge, lo)?;
                let b = compare(self, fx, BinOp::Le, hi)?;
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Bin {
                        op: "and",
                        lhs: a,
                        rhs: b,
                    },
                });
                Ok(Value::Temp(dest))
            }
        }
    }

    // ------------------------------------------------------------------
    // FOR machinery
    // ------------------------------------------------------------------

    /// One FOR statement plays three roles, selected by the kind of the
    /// block it appears in: init (bounds captured once), header (the
    /// branchless sign-of-step predicate), and increment (the back-edge).
    #[allow(clippy::too_many_arguments)]
    fn lower_for(
        &mut self,
        fx: &mut FnCtx<'_>,
        bid: BlockId,
        sidx: usize,
        line: u32,
        var: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
    ) -> EmitResult<()> {
        let storage = self.storage_of(fx, var).ok_or_else(|| {
            Diagnostic::error(
                line,
                ErrorKind::UndeclaredVariable,
                format!("internal: no storage for loop variable {}", var),
            )
        })?;
        let desc = storage.descriptor();
        let class = desc.il_value_class();

        match fx.cfg.blocks[bid].kind {
            BlockKind::Normal | BlockKind::Unreachable => {
                // init: induction := start; capture limit and step once.
                let start_v = self.lower_expr(fx, start)?;
                self.store_storage_raw(fx, &storage, start_v.value);
                let end_v = self.lower_expr(fx, end)?;
                let limit = format!("for_limit{}", sidx);
                fx.push(Inst::Assign {
                    dest: limit.clone(),
                    class,
                    rvalue: RValue::Copy(end_v.value),
                });
                let step_v = match step {
                    Some(step) => self.lower_expr(fx, step)?.value,
                    None => match class {
                        ValueClass::S32 => Value::ConstSingle(1.0),
                        ValueClass::D64 => Value::ConstDouble(1.0),
                        _ => Value::ConstInt(1),
                    },
                };
                let step_temp = format!("for_step{}", sidx);
                fx.push(Inst::Assign {
                    dest: step_temp.clone(),
                    class,
                    rvalue: RValue::Copy(step_v),
                });
                fx.for_temps
                    .insert(sidx, (Value::Temp(limit), Value::Temp(step_temp)));
            }
            BlockKind::LoopHeader => {
                // Branchless predicate: positive step tests i <= limit,
                // negative step tests i >= limit.
                let (limit, step_v) = fx.for_temps.get(&sidx).cloned().ok_or_else(|| {
                    Diagnostic::error(
                        line,
                        ErrorKind::UnsupportedConstruct,
                        "internal: FOR header before its init",
                    )
                })?;
                let idx = self.load_storage(fx, &storage);
                let step_pos = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: step_pos.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Cmp {
                        op: cmp_name(BinOp::Ge, class, true),
                        lhs: step_v,
                        rhs: zero_value(class),
                    },
                });
                let up = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: up.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Cmp {
                        op: cmp_name(BinOp::Le, class, desc.is_signed() || desc.is_float()),
                        lhs: idx.clone(),
                        rhs: limit.clone(),
                    },
                });
                let down = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: down.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Cmp {
                        op: cmp_name(BinOp::Ge, class, desc.is_signed() || desc.is_float()),
                        lhs: idx,
                        rhs: limit,
                    },
                });
                let step_neg = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: step_neg.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Bin {
                        op: "xor",
                        lhs: Value::Temp(step_pos.clone()),
                        rhs: Value::ConstInt(1),
                    },
                });
                let going_up = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: going_up.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Bin {
                        op: "and",
                        lhs: Value::Temp(step_pos),
                        rhs: Value::Temp(up),
                    },
                });
                let going_down = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: going_down.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Bin {
                        op: "and",
                        lhs: Value::Temp(step_neg),
                        rhs: Value::Temp(down),
                    },
                });
                let cond = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: cond.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Bin {
                        op: "or",
                        lhs: Value::Temp(going_up),
                        rhs: Value::Temp(going_down),
                    },
                });
                fx.cond = Some(Value::Temp(cond));
            }
            BlockKind::LoopIncrement => {
                let (_, step_v) = fx.for_temps.get(&sidx).cloned().ok_or_else(|| {
                    Diagnostic::error(
                        line,
                        ErrorKind::UnsupportedConstruct,
                        "internal: FOR increment before its init",
                    )
                })?;
                let idx = self.load_storage(fx, &storage);
                let next = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: next.clone(),
                    class,
                    rvalue: RValue::Bin {
                        op: "add",
                        lhs: idx,
                        rhs: step_v,
                    },
                });
                self.store_storage_raw(fx, &storage, Value::Temp(next));
            }
            other => {
                return Err(Diagnostic::error(
                    line,
                    ErrorKind::UnsupportedConstruct,
                    format!("internal: FOR statement in a {:?} block", other),
                ));
            }
        }
        Ok(())
    }
}
