//! The intermediate language handed to the external backend.
//!
//! Typed SSA three-address form over five value classes (`w`, `l`, `s`,
//! `d`, with pointers travelling in `l`), rendered as text. Rendering is
//! deterministic: the same module prints byte-identically every time, which
//! the test suite relies on.

use crate::types::{MemOp, ValueClass};
use std::fmt;

/// Backend target identifiers accepted by `-t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Arm64Apple,
    Amd64Sysv,
    Amd64Apple,
    Rv64,
}

impl Target {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "arm64_apple" => Some(Target::Arm64Apple),
            "amd64_sysv" => Some(Target::Amd64Sysv),
            "amd64_apple" => Some(Target::Amd64Apple),
            "rv64" => Some(Target::Rv64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Target::Arm64Apple => "arm64_apple",
            Target::Amd64Sysv => "amd64_sysv",
            Target::Amd64Apple => "amd64_apple",
            Target::Rv64 => "rv64",
        }
    }

    /// Whether the backend lowers fused multiply-add natively.
    pub fn supports_fused_madd(self) -> bool {
        matches!(self, Target::Arm64Apple | Target::Rv64)
    }
}

/// An operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Temp(String),
    Global(String),
    ConstInt(i64),
    ConstSingle(f32),
    ConstDouble(f64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Temp(name) => write!(f, "%{}", name),
            Value::Global(name) => write!(f, "${}", name),
            Value::ConstInt(v) => write!(f, "{}", v),
            Value::ConstSingle(v) => write!(f, "s_{}", v),
            Value::ConstDouble(v) => write!(f, "d_{}", v),
        }
    }
}

fn class_letter(class: ValueClass) -> char {
    class.il_letter()
}

fn store_suffix(width: MemOp) -> &'static str {
    match width {
        MemOp::Sb | MemOp::Ub => "b",
        MemOp::Sh | MemOp::Uh => "h",
        MemOp::W => "w",
        MemOp::L => "l",
        MemOp::S => "s",
        MemOp::D => "d",
    }
}

/// Right-hand side of an assignment.
#[derive(Debug, Clone)]
pub enum RValue {
    Copy(Value),
    /// `add`, `sub`, `mul`, `div`, `udiv`, `rem`, `urem`, `and`, `or`,
    /// `xor`, `sar`, `shr`, `shl`, `neg`.
    Bin {
        op: &'static str,
        lhs: Value,
        rhs: Value,
    },
    /// Comparison producing `w`: `ceqw`, `csltl`, `cged`, …
    Cmp {
        op: String,
        lhs: Value,
        rhs: Value,
    },
    /// Typed load: `loadsb` … `loadd`.
    Load {
        width: MemOp,
        addr: Value,
    },
    /// Width/sign conversion: `extsb`, `extuw`, `swtof`, `dtosi`, `exts`,
    /// `truncd`, `cast`, `neg`.
    Unary {
        op: &'static str,
        operand: Value,
    },
    /// Fused multiply-add `a * b + c` (`madd` / `fmadd`), emitted only for
    /// backends that lower it natively.
    Fused {
        op: &'static str,
        a: Value,
        b: Value,
        c: Value,
    },
    /// Stack allocation, 8-byte aligned.
    Alloc {
        bytes: u64,
    },
}

#[derive(Debug, Clone)]
pub enum Inst {
    Assign {
        dest: String,
        class: ValueClass,
        rvalue: RValue,
    },
    Store {
        width: MemOp,
        value: Value,
        addr: Value,
    },
    /// `call $f(w %a, l %b)`, optionally assigning the result.
    Call {
        dest: Option<(String, ValueClass)>,
        func: String,
        args: Vec<(ValueClass, Value)>,
    },
    Jmp {
        target: String,
    },
    Jnz {
        cond: Value,
        if_true: String,
        if_false: String,
    },
    Ret {
        value: Option<Value>,
    },
    Hlt,
    /// An extra label inside a block (short-circuit evaluation, IIF).
    Label {
        name: String,
    },
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Assign {
                dest,
                class,
                rvalue,
            } => {
                write!(f, "\t%{} ={} ", dest, class_letter(*class))?;
                match rvalue {
                    RValue::Copy(v) => write!(f, "copy {}", v),
                    RValue::Bin { op, lhs, rhs } => write!(f, "{} {}, {}", op, lhs, rhs),
                    RValue::Cmp { op, lhs, rhs } => write!(f, "{} {}, {}", op, lhs, rhs),
                    RValue::Load { width, addr } => write!(f, "load{} {}", width.suffix(), addr),
                    RValue::Unary { op, operand } => write!(f, "{} {}", op, operand),
                    RValue::Fused { op, a, b, c } => write!(f, "{} {}, {}, {}", op, a, b, c),
                    RValue::Alloc { bytes } => write!(f, "alloc8 {}", bytes),
                }
            }
            Inst::Store { width, value, addr } => {
                write!(f, "\tstore{} {}, {}", store_suffix(*width), value, addr)
            }
            Inst::Call { dest, func, args } => {
                f.write_str("\t")?;
                if let Some((dest, class)) = dest {
                    write!(f, "%{} ={} ", dest, class_letter(*class))?;
                }
                write!(f, "call ${}(", func)?;
                for (i, (class, value)) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} {}", class_letter(*class), value)?;
                }
                f.write_str(")")
            }
            Inst::Jmp { target } => write!(f, "\tjmp @{}", target),
            Inst::Jnz {
                cond,
                if_true,
                if_false,
            } => write!(f, "\tjnz {}, @{}, @{}", cond, if_true, if_false),
            Inst::Ret { value } => match value {
                Some(v) => write!(f, "\tret {}", v),
                None => f.write_str("\tret"),
            },
            Inst::Hlt => f.write_str("\thlt"),
            Inst::Label { name } => write!(f, "@{}", name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IlBlock {
    pub label: String,
    pub insts: Vec<Inst>,
}

#[derive(Debug)]
pub struct IlFunction {
    pub name: String,
    pub export: bool,
    pub return_class: Option<ValueClass>,
    pub params: Vec<(String, ValueClass)>,
    pub blocks: Vec<IlBlock>,
    /// Number of compiler-generated temporaries; not rendered, but kept so
    /// consumers can size per-function tables without re-scanning.
    pub temps: u32,
}

impl fmt::Display for IlFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.export {
            f.write_str("export ")?;
        }
        f.write_str("function ")?;
        if let Some(class) = self.return_class {
            write!(f, "{} ", class_letter(class))?;
        }
        write!(f, "${}(", self.name)?;
        for (i, (name, class)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} %{}", class_letter(*class), name)?;
        }
        f.write_str(") {\n")?;
        for block in &self.blocks {
            writeln!(f, "@{}", block.label)?;
            for inst in &block.insts {
                writeln!(f, "{}", inst)?;
            }
        }
        f.write_str("}\n")
    }
}

/// One item of a data definition.
#[derive(Debug, Clone)]
pub enum DataValue {
    /// UTF-8 bytes of a string literal (no terminator).
    Bytes(Vec<u8>),
    /// A single zero byte (string terminator).
    ZeroByte,
    /// 64-bit integer cell.
    I64(i64),
    /// Address of another data symbol.
    Ref(String),
    /// `bytes` of zero-initialized storage.
    Zeroed(u64),
}

#[derive(Debug, Clone)]
pub struct DataDecl {
    pub name: String,
    pub items: Vec<DataValue>,
}

impl fmt::Display for DataDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data ${} = {{ ", self.name)?;
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match item {
                DataValue::Bytes(bytes) => {
                    f.write_str("b \"")?;
                    for &b in bytes {
                        match b {
                            b'"' => f.write_str("\\\"")?,
                            b'\\' => f.write_str("\\\\")?,
                            b'\n' => f.write_str("\\n")?,
                            0x20..=0x7e => write!(f, "{}", b as char)?,
                            _ => write!(f, "\\x{:02x}", b)?,
                        }
                    }
                    f.write_str("\"")
                }
                DataValue::ZeroByte => f.write_str("b 0"),
                DataValue::I64(v) => write!(f, "l {}", v),
                DataValue::Ref(name) => write!(f, "l ${}", name),
                DataValue::Zeroed(bytes) => write!(f, "z {}", bytes),
            }?;
        }
        f.write_str(" }")
    }
}

/// Named record declarations; member access is still lowered to explicit
/// pointer arithmetic, these document the layout.
#[derive(Debug, Clone)]
pub struct RecordDecl {
    pub name: String,
    pub fields: Vec<ValueClass>,
}

impl fmt::Display for RecordDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type :{} = {{ ", self.name)?;
        for (i, class) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", class_letter(*class))?;
        }
        f.write_str(" }")
    }
}

/// Zero-initialized module-level storage.
#[derive(Debug, Clone)]
pub struct GlobalDecl {
    pub name: String,
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub struct IlModule {
    pub types: Vec<RecordDecl>,
    pub globals: Vec<GlobalDecl>,
    pub data: Vec<DataDecl>,
    pub functions: Vec<IlFunction>,
}

impl fmt::Display for IlModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ty in &self.types {
            writeln!(f, "{}", ty)?;
        }
        if !self.types.is_empty() {
            writeln!(f)?;
        }
        for global in &self.globals {
            writeln!(f, "data ${} = {{ z {} }}", global.name, global.bytes)?;
        }
        for data in &self.data {
            writeln!(f, "{}", data)?;
        }
        if !(self.globals.is_empty() && self.data.is_empty()) {
            writeln!(f)?;
        }
        for (i, function) in self.functions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", function)?;
        }
        Ok(())
    }
}

impl IlModule {
    pub fn new() -> Self {
        IlModule::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueClass;

    #[test]
    fn instruction_rendering() {
        let add = Inst::Assign {
            dest: "t1".to_string(),
            class: ValueClass::W32,
            rvalue: RValue::Bin {
                op: "add",
                lhs: Value::Temp("a".to_string()),
                rhs: Value::ConstInt(2),
            },
        };
        assert_eq!(add.to_string(), "\t%t1 =w add %a, 2");

        let load = Inst::Assign {
            dest: "t2".to_string(),
            class: ValueClass::W32,
            rvalue: RValue::Load {
                width: MemOp::Sb,
                addr: Value::Temp("p".to_string()),
            },
        };
        assert_eq!(load.to_string(), "\t%t2 =w loadsb %p");

        let store = Inst::Store {
            width: MemOp::Sh,
            value: Value::ConstInt(7),
            addr: Value::Temp("p".to_string()),
        };
        assert_eq!(store.to_string(), "\tstoreh 7, %p");

        let call = Inst::Call {
            dest: Some(("r".to_string(), ValueClass::D64)),
            func: "pow".to_string(),
            args: vec![
                (ValueClass::D64, Value::ConstDouble(2.0)),
                (ValueClass::D64, Value::Temp("e".to_string())),
            ],
        };
        assert_eq!(call.to_string(), "\t%r =d call $pow(d d_2, d %e)");
    }

    #[test]
    fn pointers_travel_in_l() {
        let inst = Inst::Assign {
            dest: "p".to_string(),
            class: ValueClass::Ptr,
            rvalue: RValue::Copy(Value::Global("lit0".to_string())),
        };
        assert_eq!(inst.to_string(), "\t%p =l copy $lit0");
    }

    #[test]
    fn function_header_and_blocks() {
        let f = IlFunction {
            name: "main".to_string(),
            export: true,
            return_class: Some(ValueClass::W32),
            params: Vec::new(),
            blocks: vec![IlBlock {
                label: "start".to_string(),
                insts: vec![Inst::Ret {
                    value: Some(Value::ConstInt(0)),
                }],
            }],
            temps: 0,
        };
        assert_eq!(
            f.to_string(),
            "export function w $main() {\n@start\n\tret 0\n}\n"
        );
    }

    #[test]
    fn data_rendering_escapes() {
        let d = DataDecl {
            name: "lit0".to_string(),
            items: vec![
                DataValue::Bytes(b"say \"hi\"\n".to_vec()),
                DataValue::ZeroByte,
            ],
        };
        assert_eq!(
            d.to_string(),
            "data $lit0 = { b \"say \\\"hi\\\"\\n\", b 0 }"
        );
    }

    #[test]
    fn module_rendering_is_deterministic() {
        let build = || {
            let mut m = IlModule::new();
            m.data.push(DataDecl {
                name: "lit0".to_string(),
                items: vec![DataValue::Bytes(b"x".to_vec()), DataValue::ZeroByte],
            });
            m.functions.push(IlFunction {
                name: "main".to_string(),
                export: true,
                return_class: Some(ValueClass::W32),
                params: Vec::new(),
                blocks: vec![IlBlock {
                    label: "start".to_string(),
                    insts: vec![Inst::Ret {
                        value: Some(Value::ConstInt(0)),
                    }],
                }],
                temps: 0,
            });
            m.to_string()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn target_names_round_trip() {
        for name in ["arm64_apple", "amd64_sysv", "amd64_apple", "rv64"] {
            assert_eq!(Target::from_name(name).unwrap().name(), name);
        }
        assert!(Target::from_name("mips").is_none());
        assert!(Target::Arm64Apple.supports_fused_madd());
        assert!(!Target::Amd64Sysv.supports_fused_madd());
    }
}
