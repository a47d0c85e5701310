//! Symbol tables shared by the semantic analyzer, CFG builder, and emitter.
//!
//! All maps are keyed by [`ScopedKey`]: `(function_name, name)` with an
//! empty function name for module scope. The tables are populated during
//! semantic analysis and read-only afterwards.

use crate::types::{TypeAttributes, TypeDescriptor};
use serde::Serialize;
use std::collections::HashMap;

/// `(function_name, name)`; `function_name` is `""` for module scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ScopedKey {
    pub function: String,
    pub name: String,
}

impl ScopedKey {
    /// BASIC names are case-insensitive; keys normalize to uppercase.
    pub fn global(name: &str) -> Self {
        ScopedKey {
            function: String::new(),
            name: name.to_ascii_uppercase(),
        }
    }

    pub fn local(function: &str, name: &str) -> Self {
        ScopedKey {
            function: function.to_ascii_uppercase(),
            name: name.to_ascii_uppercase(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StorageClass {
    Local,
    Global,
    Parameter,
    ForIndex,
    Constant,
}

/// Compile-time constant payload for `CONST` symbols.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableSymbol {
    pub descriptor: TypeDescriptor,
    pub storage: StorageClass,
    pub const_value: Option<ConstValue>,
    /// Index into the global slot vector; `None` for non-globals.
    pub slot_offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArraySymbol {
    pub element: TypeDescriptor,
    pub rank: u32,
    pub storage: StorageClass,
    /// Slot holding the descriptor pointer; `None` for procedure-locals.
    pub slot_offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamSymbol {
    pub name: String,
    pub descriptor: TypeDescriptor,
    pub byref: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionSymbol {
    pub params: Vec<ParamSymbol>,
    pub ret: TypeDescriptor,
    pub is_sub: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldSymbol {
    pub name: String,
    pub descriptor: TypeDescriptor,
    pub byte_offset: u32,
}

/// A user-defined record type. All scalar fields and pointers are stored in
/// naturally aligned 8-byte cells.
#[derive(Debug, Clone, Serialize)]
pub struct TypeSymbol {
    pub fields: Vec<FieldSymbol>,
    pub size: u32,
}

impl TypeSymbol {
    pub fn field(&self, name: &str) -> Option<&FieldSymbol> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Default, Serialize)]
pub struct SymbolTable {
    pub variables: HashMap<ScopedKey, VariableSymbol>,
    pub arrays: HashMap<ScopedKey, ArraySymbol>,
    pub functions: HashMap<String, FunctionSymbol>,
    pub types: HashMap<String, TypeSymbol>,
    /// Monotonic id per user-defined type name.
    pub type_registry: HashMap<String, u32>,
    next_type_id: u32,
    next_global_slot: u32,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Number of global slots assigned so far.
    pub fn global_count(&self) -> u32 {
        self.next_global_slot
    }

    /// Declare a variable under `key`; returns false when the name is
    /// already taken in that scope (by a variable or an array).
    pub fn declare_variable(&mut self, key: ScopedKey, mut sym: VariableSymbol) -> bool {
        if self.variables.contains_key(&key) || self.arrays.contains_key(&key) {
            return false;
        }
        if sym.storage == StorageClass::Global {
            sym.slot_offset = Some(self.next_global_slot);
            self.next_global_slot += 1;
        }
        self.variables.insert(key, sym);
        true
    }

    pub fn declare_array(&mut self, key: ScopedKey, mut sym: ArraySymbol) -> bool {
        if self.variables.contains_key(&key) || self.arrays.contains_key(&key) {
            return false;
        }
        if sym.storage == StorageClass::Global {
            sym.slot_offset = Some(self.next_global_slot);
            self.next_global_slot += 1;
        }
        self.arrays.insert(key, sym);
        true
    }

    pub fn declare_function(&mut self, name: &str, sym: FunctionSymbol) -> bool {
        let key = name.to_ascii_uppercase();
        if self.functions.contains_key(&key) {
            return false;
        }
        self.functions.insert(key, sym);
        true
    }

    pub fn function(&self, name: &str) -> Option<&FunctionSymbol> {
        self.functions.get(&name.to_ascii_uppercase())
    }

    /// Register a record type, assigning it the next id. Field offsets are
    /// `index * 8`; total size is `fields * 8`.
    pub fn register_type(&mut self, name: &str, fields: Vec<(String, TypeDescriptor)>) -> Option<u32> {
        let key = name.to_ascii_uppercase();
        if self.type_registry.contains_key(&key) {
            return None;
        }
        let id = self.next_type_id;
        self.next_type_id += 1;
        let fields: Vec<FieldSymbol> = fields
            .into_iter()
            .enumerate()
            .map(|(i, (name, descriptor))| FieldSymbol {
                name,
                descriptor,
                byte_offset: (i as u32) * 8,
            })
            .collect();
        let size = (fields.len() as u32) * 8;
        self.types.insert(key.clone(), TypeSymbol { fields, size });
        self.type_registry.insert(key, id);
        Some(id)
    }

    pub fn type_id(&self, name: &str) -> Option<u32> {
        self.type_registry.get(&name.to_ascii_uppercase()).copied()
    }

    pub fn type_by_id(&self, id: u32) -> Option<(&String, &TypeSymbol)> {
        let name = self
            .type_registry
            .iter()
            .find(|&(_, &v)| v == id)
            .map(|(k, _)| k)?;
        self.types.get(name).map(|t| (name, t))
    }

    /// Resolve a variable reference from inside `function` (empty for the
    /// main program): function locals first, then module scope.
    pub fn resolve_variable(&self, function: &str, name: &str) -> Option<&VariableSymbol> {
        if !function.is_empty()
            && let Some(sym) = self.variables.get(&ScopedKey::local(function, name))
        {
            return Some(sym);
        }
        self.variables.get(&ScopedKey::global(name))
    }

    /// As [`resolve_variable`](Self::resolve_variable), with the scope the
    /// binding was found in (`""` for module scope).
    pub fn resolve_variable_scoped(
        &self,
        function: &str,
        name: &str,
    ) -> Option<(ScopedKey, &VariableSymbol)> {
        if !function.is_empty() {
            let key = ScopedKey::local(function, name);
            if let Some(sym) = self.variables.get(&key) {
                return Some((key, sym));
            }
        }
        let key = ScopedKey::global(name);
        self.variables.get(&key).map(|s| (key, s))
    }

    pub fn resolve_array(&self, function: &str, name: &str) -> Option<&ArraySymbol> {
        if !function.is_empty()
            && let Some(sym) = self.arrays.get(&ScopedKey::local(function, name))
        {
            return Some(sym);
        }
        self.arrays.get(&ScopedKey::global(name))
    }

    pub fn resolve_array_scoped(
        &self,
        function: &str,
        name: &str,
    ) -> Option<(ScopedKey, &ArraySymbol)> {
        if !function.is_empty() {
            let key = ScopedKey::local(function, name);
            if let Some(sym) = self.arrays.get(&key) {
                return Some((key, sym));
            }
        }
        let key = ScopedKey::global(name);
        self.arrays.get(&key).map(|s| (key, s))
    }

    /// Install a FOR induction variable, shadowing any same-named binding in
    /// the function scope. Returns the shadowed binding so the analyzer can
    /// restore it at loop exit.
    pub fn push_for_index(
        &mut self,
        function: &str,
        name: &str,
        descriptor: TypeDescriptor,
    ) -> Option<VariableSymbol> {
        let key = ScopedKey::local(function, name);
        self.variables.insert(
            key,
            VariableSymbol {
                descriptor: descriptor.with(TypeAttributes::LOOP_INDEX),
                storage: StorageClass::ForIndex,
                const_value: None,
                slot_offset: None,
            },
        )
    }

    /// Remove a FOR induction variable, restoring the binding it shadowed.
    pub fn pop_for_index(
        &mut self,
        function: &str,
        name: &str,
        shadowed: Option<VariableSymbol>,
    ) {
        let key = ScopedKey::local(function, name);
        match shadowed {
            Some(sym) => {
                self.variables.insert(key, sym);
            }
            None => {
                self.variables.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(storage: StorageClass) -> VariableSymbol {
        VariableSymbol {
            descriptor: TypeDescriptor::int32(),
            storage,
            const_value: None,
            slot_offset: None,
        }
    }

    #[test]
    fn globals_get_distinct_slots() {
        let mut t = SymbolTable::new();
        assert!(t.declare_variable(ScopedKey::global("a"), plain(StorageClass::Global)));
        assert!(t.declare_variable(ScopedKey::global("b"), plain(StorageClass::Global)));
        let a = t.resolve_variable("", "a").unwrap();
        let b = t.resolve_variable("", "b").unwrap();
        assert_eq!(a.slot_offset, Some(0));
        assert_eq!(b.slot_offset, Some(1));
        assert_eq!(t.global_count(), 2);
    }

    #[test]
    fn duplicate_names_rejected_per_scope() {
        let mut t = SymbolTable::new();
        assert!(t.declare_variable(ScopedKey::global("x"), plain(StorageClass::Global)));
        assert!(!t.declare_variable(ScopedKey::global("x"), plain(StorageClass::Global)));
        // Same name in a function scope is a different symbol.
        assert!(t.declare_variable(ScopedKey::local("f", "x"), plain(StorageClass::Local)));
    }

    #[test]
    fn locals_shadow_globals() {
        let mut t = SymbolTable::new();
        t.declare_variable(ScopedKey::global("n"), plain(StorageClass::Global));
        t.declare_variable(ScopedKey::local("f", "n"), plain(StorageClass::Parameter));
        assert_eq!(
            t.resolve_variable("f", "n").unwrap().storage,
            StorageClass::Parameter
        );
        assert_eq!(
            t.resolve_variable("", "n").unwrap().storage,
            StorageClass::Global
        );
    }

    #[test]
    fn for_index_shadows_and_restores() {
        let mut t = SymbolTable::new();
        t.declare_variable(ScopedKey::local("f", "i"), plain(StorageClass::Local));
        let shadowed = t.push_for_index("f", "i", TypeDescriptor::int32());
        assert!(shadowed.is_some());
        assert_eq!(
            t.resolve_variable("f", "i").unwrap().storage,
            StorageClass::ForIndex
        );
        t.pop_for_index("f", "i", shadowed);
        assert_eq!(
            t.resolve_variable("f", "i").unwrap().storage,
            StorageClass::Local
        );
    }

    #[test]
    fn type_registry_assigns_monotonic_ids() {
        let mut t = SymbolTable::new();
        let p = t.register_type(
            "Point",
            vec![
                ("x".to_string(), TypeDescriptor::double()),
                ("y".to_string(), TypeDescriptor::double()),
            ],
        );
        let q = t.register_type("Pair", vec![("a".to_string(), TypeDescriptor::int32())]);
        assert_eq!(p, Some(0));
        assert_eq!(q, Some(1));
        assert!(t.register_type("point", vec![]).is_none(), "case-insensitive dup");
        let (_, sym) = t.type_by_id(0).unwrap();
        assert_eq!(sym.size, 16);
        assert_eq!(sym.field("y").unwrap().byte_offset, 8);
    }
}
