//! Type descriptors for the BASIC dialect.
//!
//! A [`TypeDescriptor`] is the product of a [`BaseType`] and a set of
//! [`TypeAttributes`] flags. Descriptors are cheap values; everything the
//! later phases need to know about a type (width, IL value class, memory
//! operation, coercion behavior) is a derived query here.

use bitflags::bitflags;
use serde::Serialize;
use std::fmt;

/// Scalar base types plus strings, user-defined records, and the two
/// non-value types the analyzer uses internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BaseType {
    Byte,
    UByte,
    Short,
    UShort,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Single,
    Double,
    AsciiString,
    UnicodeString,
    /// Record type; the id indexes the symbol table's type registry.
    UserDefined(u32),
    Void,
    Unknown,
}

bitflags! {
    /// Orthogonal attributes a descriptor may carry on top of its base.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeAttributes: u32 {
        const SIGNED     = 1 << 0;
        const ARRAY      = 1 << 1;
        const BYREF      = 1 << 2;
        const SHARED     = 1 << 3;
        const CONST      = 1 << 4;
        const LOOP_INDEX = 1 << 5;
        const UNICODE    = 1 << 6;
    }
}

// Dumps serialize attribute sets as their raw bit patterns.
impl Serialize for TypeAttributes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

/// IL value classes: the registers the backend knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueClass {
    W32,
    L64,
    S32,
    D64,
    Ptr,
}

impl ValueClass {
    /// Single-letter class used in IL text (`w`, `l`, `s`, `d`; pointers
    /// travel in `l`).
    pub fn il_letter(self) -> char {
        match self {
            ValueClass::W32 => 'w',
            ValueClass::L64 | ValueClass::Ptr => 'l',
            ValueClass::S32 => 's',
            ValueClass::D64 => 'd',
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ValueClass::S32 | ValueClass::D64)
    }
}

/// Memory-operation width and sign: suffixes for typed loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemOp {
    Sb,
    Ub,
    Sh,
    Uh,
    W,
    L,
    S,
    D,
}

impl MemOp {
    pub fn suffix(self) -> &'static str {
        match self {
            MemOp::Sb => "sb",
            MemOp::Ub => "ub",
            MemOp::Sh => "sh",
            MemOp::Uh => "uh",
            MemOp::W => "w",
            MemOp::L => "l",
            MemOp::S => "s",
            MemOp::D => "d",
        }
    }
}

/// Result of asking whether `from` may flow into `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    Identical,
    ImplicitSafe,
    ImplicitLossy,
    ExplicitRequired,
    Incompatible,
}

/// A complete type: base plus attribute flags. Two descriptors are equal
/// iff base, attributes, and (for records) id all match — `UserDefined`
/// carries its id in the base, so derived `PartialEq` is the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TypeDescriptor {
    pub base: BaseType,
    pub attrs: TypeAttributes,
}

impl TypeDescriptor {
    pub fn new(base: BaseType) -> Self {
        let mut attrs = TypeAttributes::empty();
        if matches!(
            base,
            BaseType::Byte | BaseType::Short | BaseType::Int32 | BaseType::Int64
        ) {
            attrs |= TypeAttributes::SIGNED;
        }
        if base == BaseType::UnicodeString {
            attrs |= TypeAttributes::UNICODE;
        }
        TypeDescriptor { base, attrs }
    }

    pub fn byte() -> Self {
        Self::new(BaseType::Byte)
    }
    pub fn ubyte() -> Self {
        Self::new(BaseType::UByte)
    }
    pub fn short() -> Self {
        Self::new(BaseType::Short)
    }
    pub fn ushort() -> Self {
        Self::new(BaseType::UShort)
    }
    pub fn int32() -> Self {
        Self::new(BaseType::Int32)
    }
    pub fn uint32() -> Self {
        Self::new(BaseType::UInt32)
    }
    pub fn int64() -> Self {
        Self::new(BaseType::Int64)
    }
    pub fn uint64() -> Self {
        Self::new(BaseType::UInt64)
    }
    pub fn single() -> Self {
        Self::new(BaseType::Single)
    }
    pub fn double() -> Self {
        Self::new(BaseType::Double)
    }
    pub fn string() -> Self {
        Self::new(BaseType::AsciiString)
    }
    pub fn wstring() -> Self {
        Self::new(BaseType::UnicodeString)
    }
    pub fn record(id: u32) -> Self {
        Self::new(BaseType::UserDefined(id))
    }
    pub fn void() -> Self {
        Self::new(BaseType::Void)
    }
    pub fn unknown() -> Self {
        Self::new(BaseType::Unknown)
    }

    pub fn with(mut self, attrs: TypeAttributes) -> Self {
        self.attrs |= attrs;
        self
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.base,
            BaseType::Byte
                | BaseType::UByte
                | BaseType::Short
                | BaseType::UShort
                | BaseType::Int32
                | BaseType::UInt32
                | BaseType::Int64
                | BaseType::UInt64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self.base, BaseType::Single | BaseType::Double)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_string(&self) -> bool {
        matches!(self.base, BaseType::AsciiString | BaseType::UnicodeString)
    }

    pub fn is_signed(&self) -> bool {
        self.attrs.contains(TypeAttributes::SIGNED)
    }

    pub fn is_array(&self) -> bool {
        self.attrs.contains(TypeAttributes::ARRAY)
    }

    /// Width in bits of the value as stored; strings, arrays and records are
    /// pointer-sized.
    pub fn bit_width(&self) -> u32 {
        match self.base {
            BaseType::Byte | BaseType::UByte => 8,
            BaseType::Short | BaseType::UShort => 16,
            BaseType::Int32 | BaseType::UInt32 | BaseType::Single => 32,
            BaseType::Void | BaseType::Unknown => 0,
            _ => 64,
        }
    }

    /// Which register class a value of this type travels in.
    pub fn il_value_class(&self) -> ValueClass {
        if self.is_array() {
            return ValueClass::Ptr;
        }
        match self.base {
            BaseType::Byte
            | BaseType::UByte
            | BaseType::Short
            | BaseType::UShort
            | BaseType::Int32
            | BaseType::UInt32 => ValueClass::W32,
            BaseType::Int64 | BaseType::UInt64 => ValueClass::L64,
            BaseType::Single => ValueClass::S32,
            BaseType::Double => ValueClass::D64,
            _ => ValueClass::Ptr,
        }
    }

    /// Load/store width and sign for a value of this type in memory.
    pub fn il_mem_op(&self) -> MemOp {
        if self.is_array() {
            return MemOp::L;
        }
        match self.base {
            BaseType::Byte => MemOp::Sb,
            BaseType::UByte => MemOp::Ub,
            BaseType::Short => MemOp::Sh,
            BaseType::UShort => MemOp::Uh,
            BaseType::Int32 | BaseType::UInt32 => MemOp::W,
            BaseType::Single => MemOp::S,
            BaseType::Double => MemOp::D,
            _ => MemOp::L,
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.base {
            BaseType::Byte => "BYTE",
            BaseType::UByte => "UBYTE",
            BaseType::Short => "SHORT",
            BaseType::UShort => "USHORT",
            BaseType::Int32 => "INTEGER",
            BaseType::UInt32 => "UINTEGER",
            BaseType::Int64 => "LONGINT",
            BaseType::UInt64 => "ULONGINT",
            BaseType::Single => "SINGLE",
            BaseType::Double => "DOUBLE",
            BaseType::AsciiString => "STRING",
            BaseType::UnicodeString => "WSTRING",
            BaseType::UserDefined(id) => return write!(f, "TYPE#{}", id),
            BaseType::Void => "VOID",
            BaseType::Unknown => "?",
        };
        f.write_str(name)?;
        if self.is_array() {
            f.write_str("()")?;
        }
        Ok(())
    }
}

/// How many integer bits a float's mantissa can represent exactly.
fn mantissa_bits(base: BaseType) -> u32 {
    match base {
        BaseType::Single => 24,
        BaseType::Double => 53,
        _ => 0,
    }
}

/// Decide how `from` may flow into `to`.
pub fn check_coercion(from: &TypeDescriptor, to: &TypeDescriptor) -> Coercion {
    if from == to {
        return Coercion::Identical;
    }

    // Arrays and records only flow into themselves.
    if from.is_array() || to.is_array() {
        return Coercion::Incompatible;
    }
    if matches!(from.base, BaseType::UserDefined(_)) || matches!(to.base, BaseType::UserDefined(_))
    {
        return Coercion::Incompatible;
    }

    // String to string across encodings: the runtime transcodes.
    if from.is_string() && to.is_string() {
        return Coercion::ImplicitSafe;
    }
    if from.is_string() != to.is_string() {
        return Coercion::Incompatible;
    }

    if from.is_integer() && to.is_integer() {
        let (fw, tw) = (from.bit_width(), to.bit_width());
        if fw == tw {
            // Same width, signedness differs (identical was handled above).
            return Coercion::ImplicitLossy;
        }
        if fw < tw {
            return if from.is_signed() == to.is_signed() {
                Coercion::ImplicitSafe
            } else {
                // Widening across signedness can flip the value's meaning.
                Coercion::ImplicitLossy
            };
        }
        return Coercion::ImplicitLossy;
    }

    if from.is_integer() && to.is_float() {
        return if from.bit_width() <= mantissa_bits(to.base) {
            Coercion::ImplicitSafe
        } else {
            Coercion::ImplicitLossy
        };
    }

    if from.is_float() && to.is_integer() {
        // The user must say what they mean: CINT, CLNG, INT, FIX.
        return Coercion::ExplicitRequired;
    }

    if from.is_float() && to.is_float() {
        return if to.base == BaseType::Double {
            Coercion::ImplicitSafe
        } else {
            Coercion::ImplicitLossy
        };
    }

    Coercion::Incompatible
}

/// Common type of a binary operation's operands: `Double` dominates
/// `Single`, which dominates any integer; among integers the wider wins and
/// ties break toward signed.
pub fn promote(left: &TypeDescriptor, right: &TypeDescriptor) -> TypeDescriptor {
    if left.base == BaseType::Double || right.base == BaseType::Double {
        return TypeDescriptor::double();
    }
    if left.base == BaseType::Single || right.base == BaseType::Single {
        return TypeDescriptor::single();
    }
    // Mixed string/numeric never reaches promote; the analyzer rejects it.
    let width = left.bit_width().max(right.bit_width());
    let signed = if left.bit_width() == right.bit_width() {
        left.is_signed() || right.is_signed()
    } else if left.bit_width() > right.bit_width() {
        left.is_signed()
    } else {
        right.is_signed()
    };
    match (width, signed) {
        (8, true) => TypeDescriptor::byte(),
        (8, false) => TypeDescriptor::ubyte(),
        (16, true) => TypeDescriptor::short(),
        (16, false) => TypeDescriptor::ushort(),
        (32, true) => TypeDescriptor::int32(),
        (32, false) => TypeDescriptor::uint32(),
        (_, false) => TypeDescriptor::uint64(),
        _ => TypeDescriptor::int64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_descriptors_are_identical() {
        assert_eq!(
            check_coercion(&TypeDescriptor::int32(), &TypeDescriptor::int32()),
            Coercion::Identical
        );
        // Same base, different attributes: not identical.
        let shared = TypeDescriptor::int32().with(TypeAttributes::SHARED);
        assert_ne!(TypeDescriptor::int32(), shared);
    }

    #[test]
    fn integer_widening_and_narrowing() {
        assert_eq!(
            check_coercion(&TypeDescriptor::short(), &TypeDescriptor::int64()),
            Coercion::ImplicitSafe
        );
        assert_eq!(
            check_coercion(&TypeDescriptor::int64(), &TypeDescriptor::short()),
            Coercion::ImplicitLossy
        );
        assert_eq!(
            check_coercion(&TypeDescriptor::int32(), &TypeDescriptor::uint32()),
            Coercion::ImplicitLossy
        );
    }

    #[test]
    fn float_rules() {
        assert_eq!(
            check_coercion(&TypeDescriptor::short(), &TypeDescriptor::single()),
            Coercion::ImplicitSafe
        );
        assert_eq!(
            check_coercion(&TypeDescriptor::int32(), &TypeDescriptor::single()),
            Coercion::ImplicitLossy,
            "32-bit int exceeds SINGLE's 24-bit mantissa"
        );
        assert_eq!(
            check_coercion(&TypeDescriptor::int32(), &TypeDescriptor::double()),
            Coercion::ImplicitSafe
        );
        assert_eq!(
            check_coercion(&TypeDescriptor::int64(), &TypeDescriptor::double()),
            Coercion::ImplicitLossy
        );
        assert_eq!(
            check_coercion(&TypeDescriptor::double(), &TypeDescriptor::int32()),
            Coercion::ExplicitRequired
        );
        assert_eq!(
            check_coercion(&TypeDescriptor::single(), &TypeDescriptor::double()),
            Coercion::ImplicitSafe
        );
        assert_eq!(
            check_coercion(&TypeDescriptor::double(), &TypeDescriptor::single()),
            Coercion::ImplicitLossy
        );
    }

    #[test]
    fn strings_and_records() {
        assert_eq!(
            check_coercion(&TypeDescriptor::string(), &TypeDescriptor::wstring()),
            Coercion::ImplicitSafe
        );
        assert_eq!(
            check_coercion(&TypeDescriptor::string(), &TypeDescriptor::int32()),
            Coercion::Incompatible
        );
        assert_eq!(
            check_coercion(&TypeDescriptor::record(1), &TypeDescriptor::record(2)),
            Coercion::Incompatible
        );
        assert_eq!(
            check_coercion(&TypeDescriptor::record(3), &TypeDescriptor::record(3)),
            Coercion::Identical
        );
    }

    #[test]
    fn promotion_lattice() {
        assert_eq!(
            promote(&TypeDescriptor::int32(), &TypeDescriptor::double()),
            TypeDescriptor::double()
        );
        assert_eq!(
            promote(&TypeDescriptor::single(), &TypeDescriptor::int64()),
            TypeDescriptor::single()
        );
        assert_eq!(
            promote(&TypeDescriptor::short(), &TypeDescriptor::int32()),
            TypeDescriptor::int32()
        );
        // Equal width, mixed signedness: ties break toward signed.
        assert_eq!(
            promote(&TypeDescriptor::uint32(), &TypeDescriptor::int32()),
            TypeDescriptor::int32()
        );
        assert_eq!(
            promote(&TypeDescriptor::ubyte(), &TypeDescriptor::ubyte()),
            TypeDescriptor::ubyte()
        );
    }

    #[test]
    fn value_classes_and_mem_ops() {
        assert_eq!(TypeDescriptor::int32().il_value_class(), ValueClass::W32);
        assert_eq!(TypeDescriptor::int64().il_value_class(), ValueClass::L64);
        assert_eq!(TypeDescriptor::single().il_value_class(), ValueClass::S32);
        assert_eq!(TypeDescriptor::double().il_value_class(), ValueClass::D64);
        assert_eq!(TypeDescriptor::string().il_value_class(), ValueClass::Ptr);
        assert_eq!(TypeDescriptor::byte().il_mem_op(), MemOp::Sb);
        assert_eq!(TypeDescriptor::ushort().il_mem_op(), MemOp::Uh);
        assert_eq!(TypeDescriptor::uint32().il_mem_op(), MemOp::W);
        assert_eq!(
            TypeDescriptor::int32()
                .with(TypeAttributes::ARRAY)
                .il_mem_op(),
            MemOp::L
        );
    }
}
