//! IL emission: walks each unit's CFG in reverse post-order and lowers
//! statements and expressions into the typed IL of [`crate::il`].
//!
//! The emitter is stateless between functions. Within a function it keeps a
//! name→temp map implied by the mangling scheme, the block in progress, a
//! per-block cache of the globals base pointer, the GOSUB landing stack,
//! and counters for unique temporaries and labels — nothing else.
//!
//! Submodules: [`expr`] lowers expressions, [`stmt`] lowers statements,
//! [`runtime`] holds the runtime ABI signature table.

pub mod runtime;

mod expr;
mod stmt;

use crate::cfg::{BlockId, Cfg, EdgeKind, build_unit_cfg};
use crate::diag::{Diagnostic, ErrorKind};
use crate::il::{
    DataDecl, DataValue, IlBlock, IlFunction, IlModule, Inst, RValue, RecordDecl, Target, Value,
};
use crate::semantics::{AnalyzedProgram, Unit};
use crate::symbols::{ConstValue, StorageClass};
use crate::types::{BaseType, MemOp, TypeAttributes, TypeDescriptor, ValueClass};
use crate::ast::{DataItem, StmtKind};
use runtime::runtime_fn;
use std::collections::{HashMap, HashSet};
use tracing::debug;

pub struct CodegenOptions {
    pub target: Target,
}

/// Lower the whole analyzed program to an IL module.
pub fn emit_program(
    program: &AnalyzedProgram,
    options: &CodegenOptions,
) -> Result<IlModule, Diagnostic> {
    let mut emitter = Emitter {
        program,
        fuse_madd: options.target.supports_fused_madd(),
        literal_ids: HashMap::new(),
        literal_texts: Vec::new(),
        module: IlModule::new(),
    };

    // Record declarations document UDT layouts, in registry id order.
    let mut type_ids: Vec<(&String, u32)> = program
        .symbols
        .type_registry
        .iter()
        .map(|(name, &id)| (name, id))
        .collect();
    type_ids.sort_by_key(|&(_, id)| id);
    for (name, _) in type_ids {
        let sym = &program.symbols.types[name];
        emitter.module.types.push(RecordDecl {
            name: name.to_lowercase(),
            fields: sym.fields.iter().map(|f| f.descriptor.il_value_class()).collect(),
        });
    }

    for unit in &program.units {
        let cfg = build_unit_cfg(unit)?;
        emitter.emit_unit(unit, &cfg)?;
    }

    emitter.flush_literals();
    emitter.emit_data_segment();
    debug!(
        functions = emitter.module.functions.len(),
        data = emitter.module.data.len(),
        "il emission finished"
    );
    Ok(emitter.module)
}

/// Where a scalar variable lives at runtime.
#[derive(Debug, Clone)]
pub(crate) enum VarStorage {
    /// 8-byte cell in the runtime global vector.
    GlobalSlot { slot: u32, desc: TypeDescriptor },
    /// Plain temporary (QBE rewrites into SSA itself).
    Temp { name: String, desc: TypeDescriptor },
    /// Stack cell: FOR induction variables and records.
    Stack { slot: String, desc: TypeDescriptor },
    /// BYREF parameter: the temporary holds a pointer.
    ByRef { ptr: String, desc: TypeDescriptor },
    /// CONST symbol folded at compile time.
    Const { value: ConstValue, desc: TypeDescriptor },
}

impl VarStorage {
    pub(crate) fn descriptor(&self) -> TypeDescriptor {
        match self {
            VarStorage::GlobalSlot { desc, .. }
            | VarStorage::Temp { desc, .. }
            | VarStorage::Stack { desc, .. }
            | VarStorage::ByRef { desc, .. }
            | VarStorage::Const { desc, .. } => *desc,
        }
    }
}

/// Per-function emission state.
pub(crate) struct FnCtx<'u> {
    pub unit: &'u Unit,
    pub cfg: &'u Cfg,
    /// Symbol-table scope: `""` for main, the uppercase name otherwise.
    pub scope: String,
    pub blocks: Vec<IlBlock>,
    pub cur: Vec<Inst>,
    temp: u32,
    label: u32,
    /// Condition value produced by the last lowered statement; consumed by
    /// the CondTrue/CondFalse terminator.
    pub cond: Option<Value>,
    /// Per-block cache of the globals base pointer.
    pub gbase: Option<Value>,
    /// SELECT statement -> evaluated selector temp.
    pub select_temps: HashMap<usize, Value>,
    /// FOR statement -> (limit temp, step temp) captured at loop entry.
    pub for_temps: HashMap<usize, (Value, Value)>,
    /// ON statement selector, consumed by the Multiway terminator.
    pub on_selector: Option<Value>,
    /// GOSUB/ON GOSUB statement -> landing id (prescan order).
    pub landing_ids: HashMap<usize, usize>,
    /// Uppercase variable name -> stack slot temp.
    pub stack_slots: HashMap<String, String>,
    /// Names used as FOR induction variables somewhere in the unit.
    pub for_index_names: HashSet<String>,
    /// String-holding temps to release in the tidy exit.
    pub local_strings: Vec<String>,
    /// Array-holding temps to erase in the tidy exit.
    pub local_arrays: Vec<String>,
    /// Main-scope string/array slots to tidy (slot, is_array).
    pub global_tidy: Vec<(u32, bool)>,
    /// Scratch buffer for array bound lists, allocated on first use.
    pub dims_buf: Option<String>,
    /// GOSUB landing-id stack: (base temp, stack-pointer temp).
    pub gosub_stack: Option<(String, String)>,
}

impl<'u> FnCtx<'u> {
    pub(crate) fn fresh(&mut self, prefix: &str) -> String {
        self.temp += 1;
        format!("{}{}", prefix, self.temp)
    }

    pub(crate) fn fresh_label(&mut self, prefix: &str) -> String {
        self.label += 1;
        format!("{}_{}", prefix, self.label)
    }

    pub(crate) fn push(&mut self, inst: Inst) {
        self.cur.push(inst);
    }
}

pub(crate) struct Emitter<'a> {
    pub program: &'a AnalyzedProgram,
    pub fuse_madd: bool,
    literal_ids: HashMap<String, usize>,
    literal_texts: Vec<String>,
    module: IlModule,
}

impl<'a> Emitter<'a> {
    // ------------------------------------------------------------------
    // Function driver
    // ------------------------------------------------------------------

    fn emit_unit(&mut self, unit: &Unit, cfg: &Cfg) -> Result<(), Diagnostic> {
        let scope = unit.name.to_ascii_uppercase();
        let mut fx = FnCtx {
            unit,
            cfg,
            scope: if unit.is_main { String::new() } else { scope },
            blocks: Vec::new(),
            cur: Vec::new(),
            temp: 0,
            label: 0,
            cond: None,
            gbase: None,
            select_temps: HashMap::new(),
            for_temps: HashMap::new(),
            on_selector: None,
            landing_ids: HashMap::new(),
            stack_slots: HashMap::new(),
            for_index_names: HashSet::new(),
            local_strings: Vec::new(),
            local_arrays: Vec::new(),
            global_tidy: Vec::new(),
            dims_buf: None,
            gosub_stack: None,
        };

        // Landing ids mirror the CFG builder's prescan order.
        let mut next_landing = 0usize;
        for (idx, stmt) in unit.statements.iter().enumerate() {
            match &stmt.kind {
                StmtKind::Gosub { .. } | StmtKind::OnGosub { .. } => {
                    fx.landing_ids.insert(idx, next_landing);
                    next_landing += 1;
                }
                StmtKind::For { var, .. } => {
                    fx.for_index_names.insert(var.to_ascii_uppercase());
                }
                _ => {}
            }
        }

        let function_sym = if unit.is_main {
            None
        } else {
            self.program.symbols.function(&unit.name).cloned()
        };

        let rpo = cfg.reverse_post_order();
        for (i, &bid) in rpo.iter().enumerate() {
            let label = cfg.blocks[bid].label.clone();
            fx.cur = Vec::new();
            fx.gbase = None;
            fx.cond = None;

            if i == 0 {
                self.emit_prologue(&mut fx, function_sym.as_ref())?;
            }
            self.emit_try_bookkeeping(&mut fx, bid);

            let stmt_refs = cfg.blocks[bid].statements.clone();
            for sidx in stmt_refs {
                self.lower_stmt(&mut fx, bid, sidx)?;
            }
            self.emit_terminator(&mut fx, bid, function_sym.as_ref())?;

            let insts = std::mem::take(&mut fx.cur);
            fx.blocks.push(IlBlock { label, insts });
        }

        let (name, export, return_class, params) = self.function_signature(unit, function_sym.as_ref());
        let temps = fx.temp;
        self.module.functions.push(IlFunction {
            name,
            export,
            return_class,
            params,
            blocks: std::mem::take(&mut fx.blocks),
            temps,
        });
        Ok(())
    }

    fn function_signature(
        &self,
        unit: &Unit,
        sym: Option<&crate::symbols::FunctionSymbol>,
    ) -> (String, bool, Option<ValueClass>, Vec<(String, ValueClass)>) {
        if unit.is_main {
            return ("main".to_string(), true, Some(ValueClass::W32), Vec::new());
        }
        let sym = sym.expect("procedure symbol");
        let params = sym
            .params
            .iter()
            .map(|p| {
                let class = if p.byref {
                    ValueClass::Ptr
                } else {
                    p.descriptor.il_value_class()
                };
                (mangle_var(&p.name, p.descriptor, p.byref), class)
            })
            .collect();
        let ret = if sym.is_sub {
            None
        } else {
            Some(sym.ret.il_value_class())
        };
        (proc_symbol(&unit.name), false, ret, params)
    }

    // ------------------------------------------------------------------
    // Prologue / tidy exit
    // ------------------------------------------------------------------

    fn emit_prologue(
        &mut self,
        fx: &mut FnCtx<'_>,
        sym: Option<&crate::symbols::FunctionSymbol>,
    ) -> Result<(), Diagnostic> {
        if fx.unit.is_main {
            self.rt_call(fx, "basic_runtime_init", vec![]);
            let count = self.program.symbols.global_count() as i64;
            self.rt_call(fx, "basic_global_init", vec![Value::ConstInt(count)]);
            if !self.program.data.is_empty() {
                let table = Value::Global("basic_data".to_string());
                let count = Value::ConstInt(self.program.data.len() as i64);
                self.rt_call(fx, "basic_data_register", vec![table, count]);
            }
        }

        // Scratch buffer for array bound/index lists (max rank 8).
        let dims = "dims_buf".to_string();
        fx.push(Inst::Assign {
            dest: dims.clone(),
            class: ValueClass::Ptr,
            rvalue: RValue::Alloc { bytes: 64 },
        });
        fx.dims_buf = Some(dims);

        // The GOSUB landing-id stack, when the unit has call sites.
        if !fx.landing_ids.is_empty() {
            let base = fx.fresh("gosub_stack");
            fx.push(Inst::Assign {
                dest: base.clone(),
                class: ValueClass::Ptr,
                rvalue: RValue::Alloc { bytes: 8 * 64 },
            });
            let sp = "gosub_sp".to_string();
            fx.push(Inst::Assign {
                dest: sp.clone(),
                class: ValueClass::L64,
                rvalue: RValue::Copy(Value::ConstInt(0)),
            });
            fx.gosub_stack = Some((base, sp));
        }

        // Locals: deterministic order.
        let mut local_names: Vec<(String, crate::symbols::VariableSymbol)> = self
            .program
            .symbols
            .variables
            .iter()
            .filter(|(key, _)| key.function == fx.scope && !fx.scope.is_empty())
            .map(|(key, sym)| (key.name.clone(), sym.clone()))
            .collect();
        local_names.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, var) in &local_names {
            let desc = var.descriptor;
            let is_param = var.storage == StorageClass::Parameter;
            let byref = desc.attrs.contains(TypeAttributes::BYREF);
            let needs_stack = self.needs_stack(fx, name, desc);

            if byref {
                continue; // the parameter temp already holds the pointer
            }
            if needs_stack {
                let slot = format!("slot_{}", mangle_ident(name));
                let bytes = if let BaseType::UserDefined(id) = desc.base {
                    self.program
                        .symbols
                        .type_by_id(id)
                        .map(|(_, t)| t.size as u64)
                        .unwrap_or(8)
                        .max(8)
                } else {
                    8
                };
                fx.push(Inst::Assign {
                    dest: slot.clone(),
                    class: ValueClass::Ptr,
                    rvalue: RValue::Alloc { bytes },
                });
                // Zero the cells.
                for off in (0..bytes).step_by(8) {
                    let addr = if off == 0 {
                        Value::Temp(slot.clone())
                    } else {
                        let a = fx.fresh("t");
                        fx.push(Inst::Assign {
                            dest: a.clone(),
                            class: ValueClass::Ptr,
                            rvalue: RValue::Bin {
                                op: "add",
                                lhs: Value::Temp(slot.clone()),
                                rhs: Value::ConstInt(off as i64),
                            },
                        });
                        Value::Temp(a)
                    };
                    fx.push(Inst::Store {
                        width: MemOp::L,
                        value: Value::ConstInt(0),
                        addr,
                    });
                }
                if is_param {
                    // Copy the incoming value into its cell.
                    let incoming = mangle_var(name, desc, false);
                    fx.push(Inst::Store {
                        width: desc.il_mem_op(),
                        value: Value::Temp(incoming),
                        addr: Value::Temp(slot.clone()),
                    });
                }
                fx.stack_slots.insert(name.clone(), slot);
                continue;
            }

            let temp = mangle_var(name, desc, false);
            if is_param {
                if desc.is_string() {
                    // The callee owns its copy of a string parameter.
                    let retained = self.rt_call_ret(fx, "string_retain", vec![Value::Temp(temp.clone())]);
                    fx.push(Inst::Assign {
                        dest: temp.clone(),
                        class: ValueClass::Ptr,
                        rvalue: RValue::Copy(retained),
                    });
                    fx.local_strings.push(temp);
                }
                continue;
            }
            let class = desc.il_value_class();
            let zero = zero_value(class);
            fx.push(Inst::Assign {
                dest: temp.clone(),
                class,
                rvalue: RValue::Copy(zero),
            });
            if desc.is_string() {
                fx.local_strings.push(temp);
            }
        }

        // Local arrays live in temps and are erased on every exit path.
        let mut local_arrays: Vec<String> = self
            .program
            .symbols
            .arrays
            .iter()
            .filter(|(key, _)| key.function == fx.scope && !fx.scope.is_empty())
            .map(|(key, _)| key.name.clone())
            .collect();
        local_arrays.sort();
        for name in local_arrays {
            let temp = format!("arr_{}", mangle_ident(&name));
            fx.push(Inst::Assign {
                dest: temp.clone(),
                class: ValueClass::Ptr,
                rvalue: RValue::Copy(Value::ConstInt(0)),
            });
            fx.local_arrays.push(temp);
        }

        // Main tidies module-level strings and arrays through their slots.
        if fx.unit.is_main {
            let mut tidy: Vec<(u32, bool)> = Vec::new();
            for (key, var) in &self.program.symbols.variables {
                if key.function.is_empty()
                    && var.descriptor.is_string()
                    && let Some(slot) = var.slot_offset
                {
                    tidy.push((slot, false));
                }
            }
            for (key, arr) in &self.program.symbols.arrays {
                if key.function.is_empty()
                    && let Some(slot) = arr.slot_offset
                {
                    tidy.push((slot, true));
                }
            }
            tidy.sort();
            fx.global_tidy = tidy;
        }

        // Function return slot starts zeroed.
        if let Some(sym) = sym
            && !sym.is_sub
        {
            let ret = return_slot_name(&fx.unit.name, sym.ret);
            fx.push(Inst::Assign {
                dest: ret,
                class: sym.ret.il_value_class(),
                rvalue: RValue::Copy(zero_value(sym.ret.il_value_class())),
            });
        }
        Ok(())
    }

    fn needs_stack(&self, fx: &FnCtx<'_>, upper_name: &str, desc: TypeDescriptor) -> bool {
        matches!(desc.base, BaseType::UserDefined(_))
            || desc.attrs.contains(TypeAttributes::LOOP_INDEX)
            || fx.for_index_names.contains(upper_name)
    }

    /// Release strings, erase arrays, then return. Every return path runs
    /// through this single tidy exit.
    fn emit_tidy_exit(
        &mut self,
        fx: &mut FnCtx<'_>,
        sym: Option<&crate::symbols::FunctionSymbol>,
    ) {
        for temp in fx.local_strings.clone() {
            self.rt_call(fx, "string_release", vec![Value::Temp(temp)]);
        }
        for temp in fx.local_arrays.clone() {
            self.erase_if_live(fx, Value::Temp(temp));
        }
        if fx.unit.is_main {
            for (slot, is_array) in fx.global_tidy.clone() {
                let addr = self.global_slot_addr(fx, slot);
                let val = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: val.clone(),
                    class: ValueClass::Ptr,
                    rvalue: RValue::Load {
                        width: MemOp::L,
                        addr,
                    },
                });
                if is_array {
                    self.erase_if_live(fx, Value::Temp(val));
                } else {
                    self.rt_call(fx, "string_release", vec![Value::Temp(val)]);
                }
            }
            self.rt_call(fx, "basic_runtime_cleanup", vec![]);
            fx.push(Inst::Ret {
                value: Some(Value::ConstInt(0)),
            });
            return;
        }
        match sym {
            Some(sym) if !sym.is_sub => {
                let ret = return_slot_name(&fx.unit.name, sym.ret);
                fx.push(Inst::Ret {
                    value: Some(Value::Temp(ret)),
                });
            }
            _ => fx.push(Inst::Ret { value: None }),
        }
    }

    /// `if (array != 0) array_erase(array)` — ERASE may already have freed
    /// and nulled it.
    fn erase_if_live(&mut self, fx: &mut FnCtx<'_>, array: Value) {
        let live = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: live.clone(),
            class: ValueClass::W32,
            rvalue: RValue::Cmp {
                op: "cnel".to_string(),
                lhs: array.clone(),
                rhs: Value::ConstInt(0),
            },
        });
        let do_it = fx.fresh_label("tidy_erase");
        let skip = fx.fresh_label("tidy_skip");
        fx.push(Inst::Jnz {
            cond: Value::Temp(live),
            if_true: do_it.clone(),
            if_false: skip.clone(),
        });
        fx.push(Inst::Label { name: do_it });
        self.rt_call(fx, "array_erase", vec![array]);
        fx.push(Inst::Jmp {
            target: skip.clone(),
        });
        fx.push(Inst::Label { name: skip });
    }

    // ------------------------------------------------------------------
    // Try-region bookkeeping
    // ------------------------------------------------------------------

    fn emit_try_bookkeeping(&mut self, fx: &mut FnCtx<'_>, bid: BlockId) {
        let regions = fx.cfg.try_regions.clone();
        for (r, region) in regions.iter().enumerate() {
            if region.body == bid {
                let table = self.try_table_symbol(fx, r, region);
                self.rt_call(fx, "basic_try_enter", vec![Value::Global(table)]);
            }
            if region.exit == bid || region.handlers.contains(&bid) {
                self.rt_call(fx, "basic_try_leave", vec![]);
            }
        }
    }

    /// Emit (once) the handler-table data for one TRY region.
    fn try_table_symbol(
        &mut self,
        fx: &FnCtx<'_>,
        index: usize,
        region: &crate::cfg::TryRegion,
    ) -> String {
        let fname = if fx.unit.is_main {
            "main".to_string()
        } else {
            proc_symbol(&fx.unit.name)
        };
        let name = format!("try_table_{}_{}", fname, index);
        if self.module.data.iter().any(|d| d.name == name) {
            return name;
        }
        let codes: Vec<i64> = region.codes.iter().flatten().copied().collect();
        let catch_all = region.codes.iter().any(|c| c.is_empty());
        let codes_name = format!("{}_codes", name);
        self.module.data.push(DataDecl {
            name: codes_name.clone(),
            items: if codes.is_empty() {
                vec![DataValue::I64(0)]
            } else {
                codes.iter().map(|&c| DataValue::I64(c)).collect()
            },
        });
        self.module.data.push(DataDecl {
            name: name.clone(),
            items: vec![
                DataValue::I64(codes.len() as i64),
                DataValue::Ref(codes_name),
                DataValue::I64(if catch_all { 1 } else { 0 }),
            ],
        });
        name
    }

    // ------------------------------------------------------------------
    // Terminators
    // ------------------------------------------------------------------

    fn emit_terminator(
        &mut self,
        fx: &mut FnCtx<'_>,
        bid: BlockId,
        sym: Option<&crate::symbols::FunctionSymbol>,
    ) -> Result<(), Diagnostic> {
        let edges = fx.cfg.blocks[bid].edges_out.clone();
        let last_stmt = fx.cfg.blocks[bid].statements.last().copied();
        let label_of = |fx: &FnCtx<'_>, id: BlockId| fx.cfg.blocks[id].label.clone();

        if edges.is_empty() {
            if bid == fx.cfg.exit {
                self.emit_tidy_exit(fx, sym);
            } else {
                // END and unhandled THROW already emitted their runtime
                // call; the block cannot be fallen out of.
                fx.push(Inst::Hlt);
            }
            return Ok(());
        }

        let trues: Vec<_> = edges.iter().filter(|e| e.kind == EdgeKind::CondTrue).collect();
        let falses: Vec<_> = edges.iter().filter(|e| e.kind == EdgeKind::CondFalse).collect();
        if let (Some(t), Some(f)) = (trues.first(), falses.first()) {
            let cond = fx.cond.take().ok_or_else(|| {
                Diagnostic::error(
                    0,
                    ErrorKind::UnsupportedConstruct,
                    "internal: conditional block produced no condition",
                )
            })?;
            let if_true = label_of(fx, t.target);
            let if_false = label_of(fx, f.target);
            fx.push(Inst::Jnz {
                cond,
                if_true,
                if_false,
            });
            return Ok(());
        }

        let multiway: Vec<_> = edges
            .iter()
            .filter(|e| matches!(e.kind, EdgeKind::Multiway(_)))
            .collect();
        if !multiway.is_empty() {
            let selector = fx.on_selector.take().ok_or_else(|| {
                Diagnostic::error(
                    0,
                    ErrorKind::UnsupportedConstruct,
                    "internal: multiway block produced no selector",
                )
            })?;
            let fallthrough = edges
                .iter()
                .find(|e| e.kind == EdgeKind::Fallthrough)
                .map(|e| label_of(fx, e.target))
                .ok_or_else(|| {
                    Diagnostic::error(
                        0,
                        ErrorKind::UnsupportedConstruct,
                        "internal: multiway block without fallthrough",
                    )
                })?;
            // ON GOSUB pushes the landing id on the taken path.
            let push_landing = last_stmt
                .filter(|&sidx| {
                    matches!(fx.unit.statements[sidx].kind, StmtKind::OnGosub { .. })
                })
                .map(|sidx| fx.landing_ids[&sidx]);
            for (k, edge) in multiway.iter().enumerate() {
                let guard = edge.guard.unwrap_or((k + 1) as i64);
                let target = label_of(fx, edge.target);
                let check_next = if k + 1 < multiway.len() {
                    fx.fresh_label("on_chk")
                } else {
                    fallthrough.clone()
                };
                let cmp = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: cmp.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Cmp {
                        op: "ceql".to_string(),
                        lhs: selector.clone(),
                        rhs: Value::ConstInt(guard),
                    },
                });
                match push_landing {
                    Some(id) => {
                        let taken = fx.fresh_label("on_take");
                        fx.push(Inst::Jnz {
                            cond: Value::Temp(cmp),
                            if_true: taken.clone(),
                            if_false: check_next.clone(),
                        });
                        fx.push(Inst::Label { name: taken });
                        self.emit_gosub_push(fx, id);
                        fx.push(Inst::Jmp { target });
                    }
                    None => {
                        fx.push(Inst::Jnz {
                            cond: Value::Temp(cmp),
                            if_true: target,
                            if_false: check_next.clone(),
                        });
                    }
                }
                if k + 1 < multiway.len() {
                    fx.push(Inst::Label { name: check_next });
                }
            }
            return Ok(());
        }

        let returns: Vec<_> = edges.iter().filter(|e| e.kind == EdgeKind::Return).collect();
        if !returns.is_empty() {
            let id = self.emit_gosub_pop(fx);
            let landings: Vec<String> = returns.iter().map(|e| label_of(fx, e.target)).collect();
            self.emit_return_dispatch(fx, &id, &landings, 0);
            return Ok(());
        }

        // Single ordinary successor (Fallthrough, Jump, Call, Exception).
        let target = label_of(fx, edges[0].target);
        fx.push(Inst::Jmp { target });
        Ok(())
    }

    /// Balanced binary dispatch over landing ids `[lo, lo+labels.len())`.
    fn emit_return_dispatch(
        &mut self,
        fx: &mut FnCtx<'_>,
        id: &Value,
        labels: &[String],
        lo: usize,
    ) {
        match labels.len() {
            0 => fx.push(Inst::Hlt),
            1 => fx.push(Inst::Jmp {
                target: labels[0].clone(),
            }),
            n => {
                let mid = n / 2;
                let cmp = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: cmp.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Cmp {
                        op: "csltl".to_string(),
                        lhs: id.clone(),
                        rhs: Value::ConstInt((lo + mid) as i64),
                    },
                });
                let left = fx.fresh_label("ret_lo");
                let right = fx.fresh_label("ret_hi");
                fx.push(Inst::Jnz {
                    cond: Value::Temp(cmp),
                    if_true: left.clone(),
                    if_false: right.clone(),
                });
                fx.push(Inst::Label { name: left });
                self.emit_return_dispatch(fx, id, &labels[..mid], lo);
                fx.push(Inst::Label { name: right });
                self.emit_return_dispatch(fx, id, &labels[mid..], lo + mid);
            }
        }
    }

    pub(crate) fn emit_gosub_push(&mut self, fx: &mut FnCtx<'_>, id: usize) {
        let Some((base, sp)) = fx.gosub_stack.clone() else {
            return;
        };
        let off = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: off.clone(),
            class: ValueClass::L64,
            rvalue: RValue::Bin {
                op: "mul",
                lhs: Value::Temp(sp.clone()),
                rhs: Value::ConstInt(8),
            },
        });
        let addr = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: addr.clone(),
            class: ValueClass::Ptr,
            rvalue: RValue::Bin {
                op: "add",
                lhs: Value::Temp(base),
                rhs: Value::Temp(off),
            },
        });
        fx.push(Inst::Store {
            width: MemOp::L,
            value: Value::ConstInt(id as i64),
            addr: Value::Temp(addr),
        });
        fx.push(Inst::Assign {
            dest: sp.clone(),
            class: ValueClass::L64,
            rvalue: RValue::Bin {
                op: "add",
                lhs: Value::Temp(sp),
                rhs: Value::ConstInt(1),
            },
        });
    }

    fn emit_gosub_pop(&mut self, fx: &mut FnCtx<'_>) -> Value {
        let Some((base, sp)) = fx.gosub_stack.clone() else {
            return Value::ConstInt(0);
        };
        fx.push(Inst::Assign {
            dest: sp.clone(),
            class: ValueClass::L64,
            rvalue: RValue::Bin {
                op: "sub",
                lhs: Value::Temp(sp.clone()),
                rhs: Value::ConstInt(1),
            },
        });
        let off = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: off.clone(),
            class: ValueClass::L64,
            rvalue: RValue::Bin {
                op: "mul",
                lhs: Value::Temp(sp.clone()),
                rhs: Value::ConstInt(8),
            },
        });
        let addr = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: addr.clone(),
            class: ValueClass::Ptr,
            rvalue: RValue::Bin {
                op: "add",
                lhs: Value::Temp(base),
                rhs: Value::Temp(off),
            },
        });
        let id = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: id.clone(),
            class: ValueClass::L64,
            rvalue: RValue::Load {
                width: MemOp::L,
                addr: Value::Temp(addr),
            },
        });
        Value::Temp(id)
    }

    // ------------------------------------------------------------------
    // Runtime calls, literals, storage
    // ------------------------------------------------------------------

    /// Emit a runtime call with the table-checked signature, discarding any
    /// result.
    pub(crate) fn rt_call(&mut self, fx: &mut FnCtx<'_>, name: &str, args: Vec<Value>) {
        let sig = runtime_fn(name);
        debug_assert_eq!(sig.args.len(), args.len(), "arity of {}", name);
        fx.push(Inst::Call {
            dest: None,
            func: name.to_string(),
            args: sig.args.iter().copied().zip(args).collect(),
        });
    }

    /// Emit a runtime call and bind its result to a fresh temp.
    pub(crate) fn rt_call_ret(&mut self, fx: &mut FnCtx<'_>, name: &str, args: Vec<Value>) -> Value {
        let sig = runtime_fn(name);
        debug_assert_eq!(sig.args.len(), args.len(), "arity of {}", name);
        let class = sig.ret.expect("runtime helper returns a value");
        let dest = fx.fresh("t");
        fx.push(Inst::Call {
            dest: Some((dest.clone(), class)),
            func: name.to_string(),
            args: sig.args.iter().copied().zip(args).collect(),
        });
        Value::Temp(dest)
    }

    /// Data symbol for a string literal, deduplicated module-wide.
    pub(crate) fn literal_symbol(&mut self, text: &str) -> String {
        let id = match self.literal_ids.get(text) {
            Some(&id) => id,
            None => {
                let id = self.literal_texts.len();
                self.literal_ids.insert(text.to_string(), id);
                self.literal_texts.push(text.to_string());
                id
            }
        };
        format!("lit{}", id)
    }

    fn flush_literals(&mut self) {
        for (id, text) in self.literal_texts.iter().enumerate() {
            self.module.data.push(DataDecl {
                name: format!("lit{}", id),
                items: vec![
                    DataValue::Bytes(text.as_bytes().to_vec()),
                    DataValue::ZeroByte,
                ],
            });
        }
    }

    /// The DATA segment: `{tag, payload}` pairs the runtime cursor walks.
    fn emit_data_segment(&mut self) {
        if self.program.data.is_empty() {
            return;
        }
        let mut items = Vec::new();
        let mut aux: Vec<DataDecl> = Vec::new();
        for (i, item) in self.program.data.iter().enumerate() {
            match item {
                DataItem::Int(v) => {
                    items.push(DataValue::I64(0));
                    items.push(DataValue::I64(*v));
                }
                DataItem::Float(x) => {
                    items.push(DataValue::I64(1));
                    items.push(DataValue::I64(x.to_bits() as i64));
                }
                DataItem::Str(s) => {
                    let name = format!("basic_data_str{}", i);
                    aux.push(DataDecl {
                        name: name.clone(),
                        items: vec![
                            DataValue::Bytes(s.as_bytes().to_vec()),
                            DataValue::ZeroByte,
                        ],
                    });
                    items.push(DataValue::I64(2));
                    items.push(DataValue::Ref(name));
                }
            }
        }
        self.module.data.extend(aux);
        self.module.data.push(DataDecl {
            name: "basic_data".to_string(),
            items,
        });
    }

    /// Globals base, loaded once per block and cached.
    pub(crate) fn global_base(&mut self, fx: &mut FnCtx<'_>) -> Value {
        if let Some(base) = &fx.gbase {
            return base.clone();
        }
        let base = self.rt_call_ret(fx, "basic_global_base", vec![]);
        fx.gbase = Some(base.clone());
        base
    }

    pub(crate) fn global_slot_addr(&mut self, fx: &mut FnCtx<'_>, slot: u32) -> Value {
        let base = self.global_base(fx);
        if slot == 0 {
            return base;
        }
        let addr = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: addr.clone(),
            class: ValueClass::Ptr,
            rvalue: RValue::Bin {
                op: "add",
                lhs: base,
                rhs: Value::ConstInt(slot as i64 * 8),
            },
        });
        Value::Temp(addr)
    }

    /// Resolve where a scalar variable lives, from the emitter's view.
    pub(crate) fn storage_of(&self, fx: &FnCtx<'_>, name: &str) -> Option<VarStorage> {
        let upper = name.to_ascii_uppercase();
        let (key, sym) = self
            .program
            .symbols
            .resolve_variable_scoped(&fx.unit.name, name)?;
        let desc = sym.descriptor;
        if sym.storage == StorageClass::Constant {
            return Some(VarStorage::Const {
                value: sym.const_value.clone().unwrap_or(ConstValue::Int(0)),
                desc,
            });
        }
        if let Some(slot) = sym.slot_offset {
            return Some(VarStorage::GlobalSlot { slot, desc });
        }
        if key.function.is_empty() {
            // A module binding without a slot can only be a constant.
            return Some(VarStorage::Const {
                value: sym.const_value.clone().unwrap_or(ConstValue::Int(0)),
                desc,
            });
        }
        if desc.attrs.contains(TypeAttributes::BYREF) {
            return Some(VarStorage::ByRef {
                ptr: mangle_var(name, desc, true),
                desc,
            });
        }
        if let Some(slot) = fx.stack_slots.get(&upper) {
            return Some(VarStorage::Stack {
                slot: slot.clone(),
                desc,
            });
        }
        Some(VarStorage::Temp {
            name: mangle_var(name, desc, false),
            desc,
        })
    }
}

/// `%var_<name>_<type>` with sigils spelled out; the uniform mangling the
/// whole emitter uses.
pub(crate) fn mangle_var(name: &str, desc: TypeDescriptor, byref: bool) -> String {
    let suffix = if byref {
        "ref"
    } else {
        match desc.il_value_class() {
            ValueClass::W32 => "w",
            ValueClass::L64 => "l",
            ValueClass::S32 => "s",
            ValueClass::D64 => "d",
            ValueClass::Ptr => "p",
        }
    };
    format!("var_{}_{}", mangle_ident(name), suffix)
}

pub(crate) fn mangle_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '$' => out.push_str("_str"),
            '%' => out.push_str("_i"),
            '#' => out.push_str("_d"),
            '!' => out.push_str("_f"),
            '&' => out.push_str("_l"),
            c if c.is_ascii_alphanumeric() || c == '_' => out.push(c.to_ascii_lowercase()),
            _ => out.push('_'),
        }
    }
    out
}

pub(crate) fn proc_symbol(name: &str) -> String {
    format!("fbc_{}", mangle_ident(name))
}

pub(crate) fn return_slot_name(fname: &str, ret: TypeDescriptor) -> String {
    format!("var_{}_ret_{}", mangle_ident(fname), match ret.il_value_class() {
        ValueClass::W32 => "w",
        ValueClass::L64 => "l",
        ValueClass::S32 => "s",
        ValueClass::D64 => "d",
        ValueClass::Ptr => "p",
    })
}

pub(crate) fn zero_value(class: ValueClass) -> Value {
    match class {
        ValueClass::S32 => Value::ConstSingle(0.0),
        ValueClass::D64 => Value::ConstDouble(0.0),
        _ => Value::ConstInt(0),
    }
}

/// Runtime element-kind tag for an array element descriptor; must agree
/// with the constants in the runtime's array module.
pub(crate) fn element_kind_tag(desc: TypeDescriptor) -> Option<i64> {
    let tag = match desc.base {
        BaseType::Byte => 0,
        BaseType::UByte => 1,
        BaseType::Short => 2,
        BaseType::UShort => 3,
        BaseType::Int32 => 4,
        BaseType::UInt32 => 5,
        BaseType::Int64 => 6,
        BaseType::UInt64 => 7,
        BaseType::Single => 8,
        BaseType::Double => 9,
        BaseType::AsciiString | BaseType::UnicodeString => 10,
        _ => return None,
    };
    Some(tag)
}
