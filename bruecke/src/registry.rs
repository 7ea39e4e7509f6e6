use std::collections::HashMap;

use crate::types::{CType, InfoId, TypeArena, TypeKind};

/// Declaration state behind one context: named types (builtins, typedefs
/// and record tags share one namespace), declared functions, the constants
/// namespace used by the expression evaluator, and the arena entries they
/// point into.
///
/// The whole registry is cloned before each `define` call; on a parse
/// error the clone is put back, so a failed call registers nothing.
#[derive(Debug, Clone)]
pub struct Registry {
    pub arena: TypeArena,
    types: HashMap<String, CType>,
    functions: HashMap<String, CType>,
    constants: HashMap<String, i64>,
    signatures: HashMap<String, InfoId>,
    next_anon: u32,
}

impl Registry {
    pub fn new() -> Registry {
        let mut reg = Registry {
            arena: TypeArena::new(),
            types: HashMap::new(),
            functions: HashMap::new(),
            constants: HashMap::new(),
            signatures: HashMap::new(),
            next_anon: 0,
        };

        // Fixed-width builtins. Multi-token spellings such as `unsigned
        // long` are normalized to these names by the parser, so only the
        // canonical set is registered.
        reg.builtin("void", TypeKind::Void);
        reg.builtin("bool", TypeKind::Bool);
        reg.builtin("int8_t", TypeKind::I8);
        reg.builtin("uint8_t", TypeKind::U8);
        reg.builtin("int16_t", TypeKind::I16);
        reg.builtin("uint16_t", TypeKind::U16);
        reg.builtin("int32_t", TypeKind::I32);
        reg.builtin("uint32_t", TypeKind::U32);
        reg.builtin("int64_t", TypeKind::I64);
        reg.builtin("uint64_t", TypeKind::U64);
        reg.builtin("float", TypeKind::Float);
        reg.builtin("double", TypeKind::Double);
        reg.builtin("uintptr_t", TypeKind::UIntPtr);

        // LP64 typedefs.
        reg.alias("size_t", "uint64_t");
        reg.alias("ssize_t", "int64_t");
        reg.alias("intptr_t", "int64_t");
        reg.alias("ptrdiff_t", "int64_t");
        reg.alias("wchar_t", "uint32_t");

        let mut va_list = CType::scalar(TypeKind::I8);
        va_list.pointers = 1;
        reg.register_type("va_list", va_list);

        reg
    }

    fn builtin(&mut self, name: &str, kind: TypeKind) {
        self.types.insert(name.to_string(), CType::scalar(kind));
    }

    fn alias(&mut self, name: &str, target: &str) {
        let ct = self.types[target];
        self.types.insert(name.to_string(), ct);
    }

    pub fn type_named(&self, name: &str) -> Option<CType> {
        self.types.get(name).copied()
    }

    pub fn register_type(&mut self, name: &str, ct: CType) {
        self.types.insert(name.to_string(), ct);
    }

    pub fn function_named(&self, name: &str) -> Option<CType> {
        self.functions.get(name).copied()
    }

    pub fn register_function(&mut self, name: &str, ct: CType) {
        self.functions.insert(name.to_string(), ct);
    }

    /// Unordered view of every named type, builtins included.
    pub fn type_entries(&self) -> impl Iterator<Item = (&str, CType)> {
        self.types.iter().map(|(name, ct)| (name.as_str(), *ct))
    }

    pub fn function_entries(&self) -> impl Iterator<Item = (&str, CType)> {
        self.functions.iter().map(|(name, ct)| (name.as_str(), *ct))
    }

    pub fn constant(&self, name: &str) -> Option<i64> {
        self.constants.get(name).copied()
    }

    pub fn set_constant(&mut self, name: &str, value: i64) {
        self.constants.insert(name.to_string(), value);
    }

    pub fn interned_signature(&self, signature: &str) -> Option<InfoId> {
        self.signatures.get(signature).copied()
    }

    pub fn intern_signature(&mut self, signature: String, id: InfoId) {
        self.signatures.insert(signature, id);
    }

    /// Name handed to a tagless record or enum so diagnostics can still
    /// refer to it.
    pub fn anon_name(&mut self) -> String {
        self.next_anon += 1;
        self.next_anon.to_string()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
