//! Expression lowering.
//!
//! Every routine returns the produced value, its descriptor, and whether a
//! string result is fresh (owned by the expression, to be released or handed
//! over by the consumer). The semantic analyzer already balanced operand
//! types with Convert nodes; what remains here is register-class selection,
//! sign/zero extension, and the runtime calls.

use super::{Emitter, FnCtx, VarStorage, mangle_ident, proc_symbol, return_slot_name};
use crate::ast::{BinOp, Builtin, CallTarget, Expr, ExprKind, UnOp};
use crate::diag::{Diagnostic, ErrorKind};
use crate::il::{Inst, RValue, Value};
use crate::symbols::ConstValue;
use crate::types::{BaseType, MemOp, TypeDescriptor, ValueClass};

pub(crate) struct ExprVal {
    pub value: Value,
    pub desc: TypeDescriptor,
    /// The value is a string descriptor owned by this expression.
    pub fresh: bool,
}

impl ExprVal {
    fn plain(value: Value, desc: TypeDescriptor) -> Self {
        ExprVal {
            value,
            desc,
            fresh: false,
        }
    }

    fn fresh(value: Value, desc: TypeDescriptor) -> Self {
        ExprVal {
            value,
            desc,
            fresh: true,
        }
    }
}

type EmitResult<T> = Result<T, Diagnostic>;

impl<'a> Emitter<'a> {
    pub(crate) fn lower_expr(&mut self, fx: &mut FnCtx<'_>, expr: &Expr) -> EmitResult<ExprVal> {
        let desc = expr.descriptor();
        match &expr.kind {
            ExprKind::IntLit(n) => Ok(ExprVal::plain(Value::ConstInt(*n), desc)),
            ExprKind::FloatLit(x) => Ok(ExprVal::plain(Value::ConstDouble(*x), desc)),
            ExprKind::StringLit(s) => {
                let sym = self.literal_symbol(s);
                let value = self.rt_call_ret(fx, "string_new_utf8", vec![Value::Global(sym)]);
                Ok(ExprVal::fresh(value, desc))
            }
            ExprKind::Var(name) => self.lower_var(fx, expr.line, name, desc),
            ExprKind::Convert { operand } => {
                let inner = self.lower_expr(fx, operand)?;
                let value = self.convert(fx, inner.value, inner.desc, desc);
                Ok(ExprVal {
                    value,
                    desc,
                    fresh: inner.fresh,
                })
            }
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(fx, expr.line, *op, lhs, rhs, desc),
            ExprKind::Unary { op, operand } => {
                let inner = self.lower_expr(fx, operand)?;
                let class = desc.il_value_class();
                let dest = fx.fresh("t");
                let rvalue = match op {
                    UnOp::Neg => RValue::Unary {
                        op: "neg",
                        operand: inner.value,
                    },
                    UnOp::Not => RValue::Bin {
                        op: "xor",
                        lhs: inner.value,
                        rhs: Value::ConstInt(-1),
                    },
                };
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class,
                    rvalue,
                });
                Ok(ExprVal::plain(Value::Temp(dest), desc))
            }
            ExprKind::CallOrIndex { name, args, target } => {
                self.lower_call_or_index(fx, expr.line, name, args, *target, desc)
            }
            ExprKind::Member { .. } => {
                let (addr, field_desc) = self.member_addr(fx, expr)?;
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: field_desc.il_value_class(),
                    rvalue: RValue::Load {
                        width: field_desc.il_mem_op(),
                        addr,
                    },
                });
                Ok(ExprVal::plain(Value::Temp(dest), field_desc))
            }
            ExprKind::Iif {
                cond,
                then_value,
                else_value,
            } => self.lower_iif(fx, cond, then_value, else_value, desc),
        }
    }

    fn lower_var(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        name: &str,
        desc: TypeDescriptor,
    ) -> EmitResult<ExprVal> {
        // Inside `FUNCTION f`, `f` reads the return slot.
        if !fx.unit.is_main
            && !fx.unit.is_sub
            && name.eq_ignore_ascii_case(&fx.unit.name)
        {
            return Ok(ExprVal::plain(
                Value::Temp(return_slot_name(&fx.unit.name, desc)),
                desc,
            ));
        }
        let storage = self.storage_of(fx, name).ok_or_else(|| {
            Diagnostic::error(
                line,
                ErrorKind::UndeclaredVariable,
                format!("internal: no storage for {}", name),
            )
        })?;
        match storage {
            VarStorage::Temp { name, desc } => Ok(ExprVal::plain(Value::Temp(name), desc)),
            VarStorage::GlobalSlot { slot, desc } => {
                let addr = self.global_slot_addr(fx, slot);
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: desc.il_value_class(),
                    rvalue: RValue::Load {
                        width: desc.il_mem_op(),
                        addr,
                    },
                });
                Ok(ExprVal::plain(Value::Temp(dest), desc))
            }
            VarStorage::Stack { slot, desc } => {
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: desc.il_value_class(),
                    rvalue: RValue::Load {
                        width: desc.il_mem_op(),
                        addr: Value::Temp(slot),
                    },
                });
                Ok(ExprVal::plain(Value::Temp(dest), desc))
            }
            VarStorage::ByRef { ptr, desc } => {
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: desc.il_value_class(),
                    rvalue: RValue::Load {
                        width: desc.il_mem_op(),
                        addr: Value::Temp(ptr),
                    },
                });
                Ok(ExprVal::plain(Value::Temp(dest), desc))
            }
            VarStorage::Const { value, desc } => match value {
                ConstValue::Int(n) => Ok(ExprVal::plain(Value::ConstInt(n), desc)),
                ConstValue::Float(x) => Ok(ExprVal::plain(Value::ConstDouble(x), desc)),
                ConstValue::Str(s) => {
                    let sym = self.literal_symbol(&s);
                    let value = self.rt_call_ret(fx, "string_new_utf8", vec![Value::Global(sym)]);
                    Ok(ExprVal::fresh(value, desc))
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------

    /// Representation change between two annotated descriptors. Integer
    /// widening extends by SOURCE signedness; float/int moves use the §6.3
    /// conversion set.
    pub(crate) fn convert(
        &mut self,
        fx: &mut FnCtx<'_>,
        value: Value,
        from: TypeDescriptor,
        to: TypeDescriptor,
    ) -> Value {
        if from.is_string() && to.is_string() {
            // Encoding differences live in the descriptor; same pointer.
            return value;
        }
        let (fc, tc) = (from.il_value_class(), to.il_value_class());

        if from.is_integer() && to.is_integer() {
            return self.convert_int_int(fx, value, from, to);
        }
        if from.is_integer() && to.is_float() {
            // Unsigned words zero-extend first so the signed converter sees
            // the right value.
            let (src, src_class) = if fc == ValueClass::W32 && !from.is_signed() {
                let widened = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: widened.clone(),
                    class: ValueClass::L64,
                    rvalue: RValue::Unary {
                        op: "extuw",
                        operand: value,
                    },
                });
                (Value::Temp(widened), ValueClass::L64)
            } else {
                (value, fc)
            };
            let op = if src_class == ValueClass::W32 {
                "swtof"
            } else {
                "sltof"
            };
            let dest = fx.fresh("t");
            fx.push(Inst::Assign {
                dest: dest.clone(),
                class: tc,
                rvalue: RValue::Unary { op, operand: src },
            });
            return Value::Temp(dest);
        }
        if from.is_float() && to.is_integer() {
            let op = if fc == ValueClass::S32 { "stosi" } else { "dtosi" };
            let dest = fx.fresh("t");
            fx.push(Inst::Assign {
                dest: dest.clone(),
                class: if to.bit_width() == 64 {
                    ValueClass::L64
                } else {
                    ValueClass::W32
                },
                rvalue: RValue::Unary { op, operand: value },
            });
            return self.normalize_width(fx, Value::Temp(dest), to);
        }
        if from.is_float() && to.is_float() {
            if fc == tc {
                return value;
            }
            let (op, class) = if tc == ValueClass::D64 {
                ("exts", ValueClass::D64)
            } else {
                ("truncd", ValueClass::S32)
            };
            let dest = fx.fresh("t");
            fx.push(Inst::Assign {
                dest: dest.clone(),
                class,
                rvalue: RValue::Unary { op, operand: value },
            });
            return Value::Temp(dest);
        }
        value
    }

    fn convert_int_int(
        &mut self,
        fx: &mut FnCtx<'_>,
        value: Value,
        from: TypeDescriptor,
        to: TypeDescriptor,
    ) -> Value {
        let (fc, tc) = (from.il_value_class(), to.il_value_class());
        if fc == ValueClass::W32 && tc == ValueClass::L64 {
            let op = if from.is_signed() { "extsw" } else { "extuw" };
            let dest = fx.fresh("t");
            fx.push(Inst::Assign {
                dest: dest.clone(),
                class: ValueClass::L64,
                rvalue: RValue::Unary { op, operand: value },
            });
            return Value::Temp(dest);
        }
        if fc == ValueClass::L64 && tc == ValueClass::W32 {
            let dest = fx.fresh("t");
            fx.push(Inst::Assign {
                dest: dest.clone(),
                class: ValueClass::W32,
                rvalue: RValue::Copy(value),
            });
            return self.normalize_width(fx, Value::Temp(dest), to);
        }
        // Same class: re-normalize when narrowing below 32 bits.
        self.normalize_width(fx, value, to)
    }

    /// Sub-word values are kept sign-correct in their registers: narrowing
    /// to BYTE/SHORT re-extends from the low bits.
    fn normalize_width(&mut self, fx: &mut FnCtx<'_>, value: Value, to: TypeDescriptor) -> Value {
        let op = match (to.bit_width(), to.is_signed()) {
            (8, true) => "extsb",
            (8, false) => "extub",
            (16, true) => "extsh",
            (16, false) => "extuh",
            _ => return value,
        };
        let dest = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: dest.clone(),
            class: ValueClass::W32,
            rvalue: RValue::Unary { op, operand: value },
        });
        Value::Temp(dest)
    }

    // ------------------------------------------------------------------
    // Binary operators
    // ------------------------------------------------------------------

    fn lower_binary(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        desc: TypeDescriptor,
    ) -> EmitResult<ExprVal> {
        let lhs_desc = lhs.descriptor();

        // Strings: concatenation and ordering through the runtime.
        if lhs_desc.is_string() {
            let a = self.lower_expr(fx, lhs)?;
            let b = self.lower_expr(fx, rhs)?;
            if op == BinOp::Add {
                let out = self.rt_call_ret(fx, "string_concat", vec![a.value.clone(), b.value.clone()]);
                self.release_if_fresh(fx, &a);
                self.release_if_fresh(fx, &b);
                return Ok(ExprVal::fresh(out, desc));
            }
            let ord = self.rt_call_ret(fx, "string_compare", vec![a.value.clone(), b.value.clone()]);
            self.release_if_fresh(fx, &a);
            self.release_if_fresh(fx, &b);
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
            return Ok(ExprVal::plain(Value::Temp(dest), desc));
        }

        if op == BinOp::Pow {
            // a ^ b: promote to d64, call pow, convert back.
            let a = self.lower_expr(fx, lhs)?;
            let b = self.lower_expr(fx, rhs)?;
            let ad = self.convert(fx, a.value, a.desc, TypeDescriptor::double());
            let bd = self.convert(fx, b.value, b.desc, TypeDescriptor::double());
            let out = self.rt_call_ret(fx, "pow", vec![ad, bd]);
            let back = self.convert(fx, out, TypeDescriptor::double(), desc);
            return Ok(ExprVal::plain(back, desc));
        }

        if op.is_comparison() {
            let a = self.lower_expr(fx, lhs)?;
            let b = self.lower_expr(fx, rhs)?;
            let class = a.desc.il_value_class();
            let dest = fx.fresh("t");
            fx.push(Inst::Assign {
                dest: dest.clone(),
                class: ValueClass::W32,
                rvalue: RValue::Cmp {
                    op: cmp_name(op, class, a.desc.is_signed() || a.desc.is_float()),
                    lhs: a.value,
                    rhs: b.value,
                },
            });
            return Ok(ExprVal::plain(Value::Temp(dest), desc));
        }

        if op.is_logical() {
            // Bitwise form; conditional contexts take the short-circuit
            // path through lower_condition instead.
            let a = self.lower_expr(fx, lhs)?;
            let b = self.lower_expr(fx, rhs)?;
            let av = self.convert(fx, a.value, a.desc, TypeDescriptor::int32());
            let bv = self.convert(fx, b.value, b.desc, TypeDescriptor::int32());
            let dest = fx.fresh("t");
            fx.push(Inst::Assign {
                dest: dest.clone(),
                class: ValueClass::W32,
                rvalue: RValue::Bin {
                    op: match op {
                        BinOp::And => "and",
                        BinOp::Or => "or",
                        _ => "xor",
                    },
                    lhs: av,
                    rhs: bv,
                },
            });
            return Ok(ExprVal::plain(Value::Temp(dest), desc));
        }

        // Fused multiply-add: c + a*b / a*b + c / c - a*b, same class, and
        // the multiply has no other use (guaranteed by tree shape).
        if self.fuse_madd
            && matches!(op, BinOp::Add | BinOp::Sub)
            && desc.is_numeric()
        {
            if let Some(result) = self.try_fused(fx, op, lhs, rhs, desc)? {
                return Ok(result);
            }
        }

        let class = desc.il_value_class();
        let a = self.lower_expr(fx, lhs)?;
        let b = self.lower_expr(fx, rhs)?;

        let il_op: &'static str = match op {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::IntDiv => {
                if let Some(out) =
                    self.try_pow2_div(fx, &a.value, &b.value, rhs, desc)
                {
                    return Ok(ExprVal::plain(out, desc));
                }
                if desc.is_signed() { "div" } else { "udiv" }
            }
            BinOp::Mod => {
                if desc.is_signed() {
                    "rem"
                } else {
                    "urem"
                }
            }
            _ => {
                return Err(Diagnostic::error(
                    line,
                    ErrorKind::UnsupportedConstruct,
                    "operator not lowered",
                ));
            }
        };
        let dest = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: dest.clone(),
            class,
            rvalue: RValue::Bin {
                op: il_op,
                lhs: a.value,
                rhs: b.value,
            },
        });
        Ok(ExprVal::plain(Value::Temp(dest), desc))
    }

    /// `x \ 2^k` for signed x: arithmetic shift right by the sign, logical
    /// shift into the low bits, add to the dividend, then arithmetic shift
    /// by k. Truncates toward zero without a divide.
    fn try_pow2_div(
        &mut self,
        fx: &mut FnCtx<'_>,
        dividend: &Value,
        _divisor_value: &Value,
        rhs: &Expr,
        desc: TypeDescriptor,
    ) -> Option<Value> {
        if !desc.is_signed() {
            return None;
        }
        let literal = literal_int(rhs)?;
        if literal <= 0 || literal.count_ones() != 1 {
            return None;
        }
        let k = literal.trailing_zeros() as i64;
        if k == 0 {
            return Some(dividend.clone());
        }
        let class = desc.il_value_class();
        let width: i64 = if class == ValueClass::L64 { 64 } else { 32 };

        let sign = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: sign.clone(),
            class,
            rvalue: RValue::Bin {
                op: "sar",
                lhs: dividend.clone(),
                rhs: Value::ConstInt(width - 1),
            },
        });
        let bias = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: bias.clone(),
            class,
            rvalue: RValue::Bin {
                op: "shr",
                lhs: Value::Temp(sign),
                rhs: Value::ConstInt(width - k),
            },
        });
        let biased = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: biased.clone(),
            class,
            rvalue: RValue::Bin {
                op: "add",
                lhs: dividend.clone(),
                rhs: Value::Temp(bias),
            },
        });
        let out = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: out.clone(),
            class,
            rvalue: RValue::Bin {
                op: "sar",
                lhs: Value::Temp(biased),
                rhs: Value::ConstInt(k),
            },
        });
        Some(Value::Temp(out))
    }

    fn try_fused(
        &mut self,
        fx: &mut FnCtx<'_>,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        desc: TypeDescriptor,
    ) -> EmitResult<Option<ExprVal>> {
        let class = desc.il_value_class();
        let mnemonic = |sub: bool| -> &'static str {
            match (class.is_float(), sub) {
                (true, false) => "fmadd",
                (true, true) => "fmsub",
                (false, false) => "madd",
                (false, true) => "msub",
            }
        };
        // a*b + c  or  c + a*b
        let (mul_expr, other, sub) = match (op, mul_operands(lhs), mul_operands(rhs)) {
            (BinOp::Add, Some(m), _) => (m, rhs, false),
            (BinOp::Add, None, Some(m)) => (m, lhs, false),
            // c - a*b
            (BinOp::Sub, None, Some(m)) => (m, lhs, true),
            _ => return Ok(None),
        };
        let (ma, mb) = mul_expr;
        if ma.descriptor().il_value_class() != class
            || mb.descriptor().il_value_class() != class
            || other.descriptor().il_value_class() != class
        {
            return Ok(None);
        }
        let a = self.lower_expr(fx, ma)?;
        let b = self.lower_expr(fx, mb)?;
        let c = self.lower_expr(fx, other)?;
        let dest = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: dest.clone(),
            class,
            rvalue: RValue::Fused {
                op: mnemonic(sub),
                a: a.value,
                b: b.value,
                c: c.value,
            },
        });
        Ok(Some(ExprVal::plain(Value::Temp(dest), desc)))
    }

    // ------------------------------------------------------------------
    // Calls, arrays, members, builtins
    // ------------------------------------------------------------------

    fn lower_call_or_index(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        name: &str,
        args: &[Expr],
        target: CallTarget,
        desc: TypeDescriptor,
    ) -> EmitResult<ExprVal> {
        match target {
            CallTarget::ArrayElement => {
                let addr = self.array_elem_addr(fx, line, name, args)?;
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: desc.il_value_class(),
                    rvalue: RValue::Load {
                        width: desc.il_mem_op(),
                        addr,
                    },
                });
                Ok(ExprVal::plain(Value::Temp(dest), desc))
            }
            CallTarget::UserFunction => {
                let value = self.lower_user_call(fx, line, name, args)?;
                let fresh = desc.is_string();
                Ok(ExprVal {
                    value: value.unwrap_or(Value::ConstInt(0)),
                    desc,
                    fresh,
                })
            }
            CallTarget::Builtin(builtin) => self.lower_builtin(fx, builtin, &args[0], desc),
            CallTarget::Unresolved => Err(Diagnostic::error(
                line,
                ErrorKind::UnknownFunction,
                format!("internal: unresolved call {}", name),
            )),
        }
    }

    /// Call a user SUB/FUNCTION; returns the result temp for functions.
    pub(crate) fn lower_user_call(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        name: &str,
        args: &[Expr],
    ) -> EmitResult<Option<Value>> {
        let sym = self
            .program
            .symbols
            .function(name)
            .cloned()
            .ok_or_else(|| {
                Diagnostic::error(
                    line,
                    ErrorKind::UnknownFunction,
                    format!("internal: unknown procedure {}", name),
                )
            })?;
        let mut lowered: Vec<(ValueClass, Value)> = Vec::new();
        let mut fresh_strings: Vec<ExprVal> = Vec::new();
        for (arg, param) in args.iter().zip(sym.params.iter()) {
            if param.byref {
                let addr = self.byref_addr(fx, line, arg)?;
                lowered.push((ValueClass::Ptr, addr));
                continue;
            }
            let val = self.lower_expr(fx, arg)?;
            lowered.push((param.descriptor.il_value_class(), val.value.clone()));
            if val.fresh {
                fresh_strings.push(val);
            }
        }
        let dest = if sym.is_sub {
            None
        } else {
            Some((fx.fresh("t"), sym.ret.il_value_class()))
        };
        // String results transfer ownership to the caller; byval string
        // arguments stay owned here and are released after the call.
        fx.push(Inst::Call {
            dest: dest.clone(),
            func: proc_symbol(name),
            args: lowered,
        });
        for val in fresh_strings {
            self.release_if_fresh(fx, &val);
        }
        Ok(dest.map(|(name, _)| Value::Temp(name)))
    }

    /// Address of a BYREF argument. Only variables with a memory home are
    /// accepted; the analyzer has no say here because storage is an emitter
    /// concern.
    fn byref_addr(&mut self, fx: &mut FnCtx<'_>, line: u32, arg: &Expr) -> EmitResult<Value> {
        let unwrapped = unwrap_convert(arg);
        let ExprKind::Var(name) = &unwrapped.kind else {
            return Err(Diagnostic::error(
                line,
                ErrorKind::UnsupportedConstruct,
                "BYREF argument must be a variable",
            ));
        };
        match self.storage_of(fx, name) {
            Some(VarStorage::GlobalSlot { slot, .. }) => Ok(self.global_slot_addr(fx, slot)),
            Some(VarStorage::Stack { slot, .. }) => Ok(Value::Temp(slot)),
            Some(VarStorage::ByRef { ptr, .. }) => Ok(Value::Temp(ptr)),
            _ => Err(Diagnostic::error(
                line,
                ErrorKind::UnsupportedConstruct,
                format!("BYREF argument {} has no addressable storage", name),
            )),
        }
    }

    /// `a(i, j)` element address: bounds go through the scratch buffer and
    /// the runtime does the checking.
    pub(crate) fn array_elem_addr(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        name: &str,
        indices: &[Expr],
    ) -> EmitResult<Value> {
        let array = self.array_pointer(fx, line, name)?;
        let buf = self.dims_buffer(fx);
        for (i, index) in indices.iter().enumerate() {
            let val = self.lower_expr(fx, index)?;
            let v64 = self.convert(fx, val.value, val.desc, TypeDescriptor::int64());
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
                value: v64,
                addr,
            });
        }
        Ok(self.rt_call_ret(fx, "array_get_address", vec![array, buf]))
    }

    /// The descriptor pointer of an array variable.
    pub(crate) fn array_pointer(
        &mut self,
        fx: &mut FnCtx<'_>,
        line: u32,
        name: &str,
    ) -> EmitResult<Value> {
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
            let dest = fx.fresh("t");
            fx.push(Inst::Assign {
                dest: dest.clone(),
                class: ValueClass::Ptr,
                rvalue: RValue::Load {
                    width: MemOp::L,
                    addr,
                },
            });
            Ok(Value::Temp(dest))
        } else {
            Ok(Value::Temp(format!("arr_{}", mangle_ident(name))))
        }
    }

    /// Scratch buffer for index/bound lists, allocated by the prologue.
    pub(crate) fn dims_buffer(&mut self, fx: &mut FnCtx<'_>) -> Value {
        Value::Temp(
            fx.dims_buf
                .clone()
                .expect("prologue allocates the bounds scratch buffer"),
        )
    }

    pub(crate) fn member_addr(
        &mut self,
        fx: &mut FnCtx<'_>,
        expr: &Expr,
    ) -> EmitResult<(Value, TypeDescriptor)> {
        let ExprKind::Member { base, field } = &expr.kind else {
            return Err(Diagnostic::error(
                expr.line,
                ErrorKind::UnsupportedConstruct,
                "internal: member_addr on a non-member expression",
            ));
        };
        let (base_addr, base_desc) = match &base.kind {
            ExprKind::Var(name) => {
                let storage = self.storage_of(fx, name).ok_or_else(|| {
                    Diagnostic::error(
                        expr.line,
                        ErrorKind::UndeclaredVariable,
                        format!("internal: no storage for {}", name),
                    )
                })?;
                match storage {
                    VarStorage::Stack { slot, desc } => (Value::Temp(slot), desc),
                    _ => {
                        return Err(Diagnostic::error(
                            expr.line,
                            ErrorKind::UnsupportedConstruct,
                            "record variables live in procedure frames",
                        ));
                    }
                }
            }
            ExprKind::Member { .. } => self.member_addr(fx, base)?,
            _ => {
                return Err(Diagnostic::error(
                    expr.line,
                    ErrorKind::UnsupportedConstruct,
                    "member access needs a record variable",
                ));
            }
        };
        let BaseType::UserDefined(id) = base_desc.base else {
            return Err(Diagnostic::error(
                expr.line,
                ErrorKind::UnsupportedConstruct,
                "member access on a non-record value",
            ));
        };
        let (_, ty) = self.program.symbols.type_by_id(id).ok_or_else(|| {
            Diagnostic::error(
                expr.line,
                ErrorKind::UnsupportedConstruct,
                "internal: dangling record id",
            )
        })?;
        let field_sym = ty.field(field).ok_or_else(|| {
            Diagnostic::error(
                expr.line,
                ErrorKind::UnsupportedConstruct,
                format!("internal: missing field {}", field),
            )
        })?;
        let offset = field_sym.byte_offset as i64;
        let field_desc = field_sym.descriptor;
        if offset == 0 {
            return Ok((base_addr, field_desc));
        }
        let dest = fx.fresh("t");
        fx.push(Inst::Assign {
            dest: dest.clone(),
            class: ValueClass::Ptr,
            rvalue: RValue::Bin {
                op: "add",
                lhs: base_addr,
                rhs: Value::ConstInt(offset),
            },
        });
        Ok((Value::Temp(dest), field_desc))
    }

    fn lower_builtin(
        &mut self,
        fx: &mut FnCtx<'_>,
        builtin: Builtin,
        arg: &Expr,
        desc: TypeDescriptor,
    ) -> EmitResult<ExprVal> {
        let val = self.lower_expr(fx, arg)?;
        let out = match builtin {
            Builtin::Sgn => {
                let class = val.desc.il_value_class();
                let zero = super::zero_value(class);
                let pos = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: pos.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Cmp {
                        op: cmp_name(BinOp::Gt, class, true),
                        lhs: val.value.clone(),
                        rhs: zero.clone(),
                    },
                });
                let neg = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: neg.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Cmp {
                        op: cmp_name(BinOp::Lt, class, true),
                        lhs: val.value.clone(),
                        rhs: zero,
                    },
                });
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Bin {
                        op: "sub",
                        lhs: Value::Temp(pos),
                        rhs: Value::Temp(neg),
                    },
                });
                ExprVal::plain(Value::Temp(dest), desc)
            }
            Builtin::Abs => {
                if val.desc.is_float() {
                    let wide = self.convert(fx, val.value, val.desc, TypeDescriptor::double());
                    let out = self.rt_call_ret(fx, "fabs", vec![wide]);
                    let back = self.convert(fx, out, TypeDescriptor::double(), desc);
                    ExprVal::plain(back, desc)
                } else {
                    // (x ^ (x >> w-1)) - (x >> w-1)
                    let class = val.desc.il_value_class();
                    let width: i64 = if class == ValueClass::L64 { 64 } else { 32 };
                    let sign = fx.fresh("t");
                    fx.push(Inst::Assign {
                        dest: sign.clone(),
                        class,
                        rvalue: RValue::Bin {
                            op: "sar",
                            lhs: val.value.clone(),
                            rhs: Value::ConstInt(width - 1),
                        },
                    });
                    let flipped = fx.fresh("t");
                    fx.push(Inst::Assign {
                        dest: flipped.clone(),
                        class,
                        rvalue: RValue::Bin {
                            op: "xor",
                            lhs: val.value,
                            rhs: Value::Temp(sign.clone()),
                        },
                    });
                    let dest = fx.fresh("t");
                    fx.push(Inst::Assign {
                        dest: dest.clone(),
                        class,
                        rvalue: RValue::Bin {
                            op: "sub",
                            lhs: Value::Temp(flipped),
                            rhs: Value::Temp(sign),
                        },
                    });
                    ExprVal::plain(Value::Temp(dest), desc)
                }
            }
            Builtin::Int | Builtin::Fix => {
                if val.desc.is_float() {
                    let wide = self.convert(fx, val.value, val.desc, TypeDescriptor::double());
                    let func = if builtin == Builtin::Int { "floor" } else { "trunc" };
                    let out = self.rt_call_ret(fx, func, vec![wide]);
                    let back = self.convert(fx, out, TypeDescriptor::double(), desc);
                    ExprVal::plain(back, desc)
                } else {
                    ExprVal::plain(val.value, desc)
                }
            }
            Builtin::Len => {
                let out = self.rt_call_ret(fx, "string_len", vec![val.value.clone()]);
                self.release_if_fresh(fx, &val);
                let narrowed = self.convert(fx, out, TypeDescriptor::int64(), desc);
                ExprVal::plain(narrowed, desc)
            }
            Builtin::Chr => {
                let code = self.convert(fx, val.value, val.desc, TypeDescriptor::int64());
                let out = self.rt_call_ret(fx, "string_chr", vec![code]);
                ExprVal::fresh(out, desc)
            }
            Builtin::Asc => {
                let out = self.rt_call_ret(fx, "string_asc", vec![val.value.clone()]);
                self.release_if_fresh(fx, &val);
                let narrowed = self.convert(fx, out, TypeDescriptor::int64(), desc);
                ExprVal::plain(narrowed, desc)
            }
            Builtin::Str => {
                let out = if val.desc.is_float() {
                    let wide = self.convert(fx, val.value, val.desc, TypeDescriptor::double());
                    self.rt_call_ret(fx, "string_from_double", vec![wide])
                } else {
                    let wide = self.convert(fx, val.value, val.desc, TypeDescriptor::int64());
                    self.rt_call_ret(fx, "string_from_int", vec![wide])
                };
                ExprVal::fresh(out, desc)
            }
            Builtin::Val => {
                let out = self.rt_call_ret(fx, "string_to_double", vec![val.value.clone()]);
                self.release_if_fresh(fx, &val);
                ExprVal::plain(out, desc)
            }
            Builtin::Cint | Builtin::Clng | Builtin::Csng | Builtin::Cdbl => {
                let out = self.convert(fx, val.value, val.desc, desc);
                ExprVal::plain(out, desc)
            }
        };
        Ok(out)
    }

    fn lower_iif(
        &mut self,
        fx: &mut FnCtx<'_>,
        cond: &Expr,
        then_value: &Expr,
        else_value: &Expr,
        desc: TypeDescriptor,
    ) -> EmitResult<ExprVal> {
        let class = desc.il_value_class();
        let result = fx.fresh("iif");
        fx.push(Inst::Assign {
            dest: result.clone(),
            class,
            rvalue: RValue::Copy(super::zero_value(class)),
        });
        let c = self.lower_condition(fx, cond)?;
        let then_lbl = fx.fresh_label("iif_then");
        let else_lbl = fx.fresh_label("iif_else");
        let done_lbl = fx.fresh_label("iif_done");
        fx.push(Inst::Jnz {
            cond: c,
            if_true: then_lbl.clone(),
            if_false: else_lbl.clone(),
        });

        fx.push(Inst::Label { name: then_lbl });
        let tv = self.lower_expr(fx, then_value)?;
        let tv_owned = self.own_string(fx, tv, desc);
        fx.push(Inst::Assign {
            dest: result.clone(),
            class,
            rvalue: RValue::Copy(tv_owned),
        });
        fx.push(Inst::Jmp {
            target: done_lbl.clone(),
        });

        fx.push(Inst::Label { name: else_lbl });
        let ev = self.lower_expr(fx, else_value)?;
        let ev_owned = self.own_string(fx, ev, desc);
        fx.push(Inst::Assign {
            dest: result.clone(),
            class,
            rvalue: RValue::Copy(ev_owned),
        });
        fx.push(Inst::Jmp {
            target: done_lbl.clone(),
        });

        fx.push(Inst::Label { name: done_lbl });
        Ok(ExprVal {
            value: Value::Temp(result),
            desc,
            fresh: desc.is_string(),
        })
    }

    /// Make a branch value owned when the merged result is a string.
    fn own_string(&mut self, fx: &mut FnCtx<'_>, val: ExprVal, desc: TypeDescriptor) -> Value {
        if desc.is_string() && !val.fresh {
            self.rt_call_ret(fx, "string_retain", vec![val.value])
        } else {
            val.value
        }
    }

    pub(crate) fn release_if_fresh(&mut self, fx: &mut FnCtx<'_>, val: &ExprVal) {
        if val.fresh {
            self.rt_call(fx, "string_release", vec![val.value.clone()]);
        }
    }

    // ------------------------------------------------------------------
    // Conditions
    // ------------------------------------------------------------------

    /// Lower an expression used as a branch condition to a `w` value.
    /// Top-level AND/OR become short-circuit control flow here.
    pub(crate) fn lower_condition(&mut self, fx: &mut FnCtx<'_>, expr: &Expr) -> EmitResult<Value> {
        match &expr.kind {
            ExprKind::Binary {
                op: op @ (BinOp::And | BinOp::Or),
                lhs,
                rhs,
            } => {
                let result = fx.fresh("cc");
                let short = *op == BinOp::Or;
                fx.push(Inst::Assign {
                    dest: result.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Copy(Value::ConstInt(if short { 1 } else { 0 })),
                });
                let rhs_lbl = fx.fresh_label("cc_rhs");
                let done_lbl = fx.fresh_label("cc_done");
                let c = self.lower_condition(fx, lhs)?;
                let (t, f) = if short {
                    (done_lbl.clone(), rhs_lbl.clone())
                } else {
                    (rhs_lbl.clone(), done_lbl.clone())
                };
                fx.push(Inst::Jnz {
                    cond: c,
                    if_true: t,
                    if_false: f,
                });
                fx.push(Inst::Label { name: rhs_lbl });
                let r = self.lower_condition(fx, rhs)?;
                fx.push(Inst::Assign {
                    dest: result.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Copy(r),
                });
                fx.push(Inst::Jmp {
                    target: done_lbl.clone(),
                });
                fx.push(Inst::Label { name: done_lbl });
                Ok(Value::Temp(result))
            }
            ExprKind::Unary {
                op: UnOp::Not,
                operand,
            } => {
                let inner = self.lower_condition(fx, operand)?;
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Cmp {
                        op: "ceqw".to_string(),
                        lhs: inner,
                        rhs: Value::ConstInt(0),
                    },
                });
                Ok(Value::Temp(dest))
            }
            _ => {
                let val = self.lower_expr(fx, expr)?;
                self.to_bool(fx, val)
            }
        }
    }

    /// Collapse any numeric value to a `w` truth value (zero is false).
    pub(crate) fn to_bool(&mut self, fx: &mut FnCtx<'_>, val: ExprVal) -> EmitResult<Value> {
        let class = val.desc.il_value_class();
        match class {
            ValueClass::W32 => Ok(val.value),
            ValueClass::L64 | ValueClass::Ptr => {
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Cmp {
                        op: "cnel".to_string(),
                        lhs: val.value,
                        rhs: Value::ConstInt(0),
                    },
                });
                Ok(Value::Temp(dest))
            }
            ValueClass::S32 | ValueClass::D64 => {
                let (op, zero) = if class == ValueClass::S32 {
                    ("cnes", Value::ConstSingle(0.0))
                } else {
                    ("cned", Value::ConstDouble(0.0))
                };
                let dest = fx.fresh("t");
                fx.push(Inst::Assign {
                    dest: dest.clone(),
                    class: ValueClass::W32,
                    rvalue: RValue::Cmp {
                        op: op.to_string(),
                        lhs: val.value,
                        rhs: zero,
                    },
                });
                Ok(Value::Temp(dest))
            }
        }
    }
}

/// Comparison opcode for one operand class; `signed` selects the ordered
/// family for integers (floats always use the plain names).
pub(crate) fn cmp_name(op: BinOp, class: ValueClass, signed: bool) -> String {
    let letter = class.il_letter();
    let float = class.is_float();
    let base = match op {
        BinOp::Eq => "eq".to_string(),
        BinOp::Ne => "ne".to_string(),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let core = match op {
                BinOp::Lt => "lt",
                BinOp::Le => "le",
                BinOp::Gt => "gt",
                _ => "ge",
            };
            if float {
                core.to_string()
            } else if signed {
                format!("s{}", core)
            } else {
                format!("u{}", core)
            }
        }
        _ => unreachable!("not a comparison"),
    };
    format!("c{}{}", base, letter)
}

/// The `(a, b)` of a direct multiply node, if `expr` is one.
fn mul_operands(expr: &Expr) -> Option<(&Expr, &Expr)> {
    match &expr.kind {
        ExprKind::Binary {
            op: BinOp::Mul,
            lhs,
            rhs,
        } => Some((lhs, rhs)),
        _ => None,
    }
}

fn unwrap_convert(expr: &Expr) -> &Expr {
    match &expr.kind {
        ExprKind::Convert { operand } => unwrap_convert(operand),
        _ => expr,
    }
}

/// Literal integer value of an expression, looking through Convert nodes.
fn literal_int(expr: &Expr) -> Option<i64> {
    match &expr.kind {
        ExprKind::IntLit(n) => Some(*n),
        ExprKind::Convert { operand } => literal_int(operand),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_opcode_families() {
        assert_eq!(cmp_name(BinOp::Eq, ValueClass::W32, true), "ceqw");
        assert_eq!(cmp_name(BinOp::Lt, ValueClass::L64, true), "csltl");
        assert_eq!(cmp_name(BinOp::Lt, ValueClass::L64, false), "cultl");
        assert_eq!(cmp_name(BinOp::Ge, ValueClass::D64, true), "cged");
        assert_eq!(cmp_name(BinOp::Ne, ValueClass::S32, false), "cnes");
    }
}
