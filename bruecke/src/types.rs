use std::fmt;

pub const PTR_SIZE: usize = std::mem::size_of::<*const ()>();
pub const PTR_ALIGN_MASK: usize = std::mem::align_of::<*const ()>() - 1;
pub const FUNC_ALIGN_MASK: usize = PTR_ALIGN_MASK;

/// Packing mask in effect outside any `#pragma pack` directive.
pub const DEFAULT_PACK_MASK: usize = 15;

/// Deepest pointer chain a declarator may build. Bounded so the per-level
/// const bits fit in `const_mask`.
pub const MAX_INDIRECTION: u8 = 7;

/// Rounds `n` up to the alignment described by `mask` (alignment - 1).
pub fn align_up(n: usize, mask: usize) -> usize {
    (n + mask) & !mask
}

/// Base type category. The declarator wraps one of these in pointer and
/// array levels; Enum and later carry an arena handle with their layout
/// and member details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Double,
    Float,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    UIntPtr,
    Enum,
    Union,
    Struct,
    Func,
}

impl TypeKind {
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            TypeKind::Bool | TypeKind::U8 | TypeKind::U16 | TypeKind::U32 | TypeKind::U64 | TypeKind::UIntPtr
        )
    }

    pub fn is_char(self) -> bool {
        matches!(self, TypeKind::I8 | TypeKind::U8)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            TypeKind::Bool
                | TypeKind::I8
                | TypeKind::I16
                | TypeKind::I32
                | TypeKind::I64
                | TypeKind::U8
                | TypeKind::U16
                | TypeKind::U32
                | TypeKind::U64
                | TypeKind::UIntPtr
                | TypeKind::Enum
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, TypeKind::Double | TypeKind::Float)
    }

    pub fn is_record(self) -> bool {
        matches!(self, TypeKind::Union | TypeKind::Struct)
    }

    /// Kinds that carry an arena handle.
    pub fn has_info(self) -> bool {
        matches!(
            self,
            TypeKind::Enum | TypeKind::Union | TypeKind::Struct | TypeKind::Func
        )
    }

    /// Size of the base type in bytes; records answer 0 here and are
    /// resolved through their arena entry.
    pub fn size(self) -> usize {
        match self {
            TypeKind::Void => 0,
            TypeKind::Bool | TypeKind::I8 | TypeKind::U8 => 1,
            TypeKind::I16 | TypeKind::U16 => 2,
            TypeKind::Float | TypeKind::I32 | TypeKind::U32 | TypeKind::Enum => 4,
            TypeKind::Double | TypeKind::I64 | TypeKind::U64 => 8,
            TypeKind::UIntPtr | TypeKind::Func => PTR_SIZE,
            TypeKind::Union | TypeKind::Struct => 0,
        }
    }

    pub fn align_mask(self) -> usize {
        match self {
            TypeKind::Func => FUNC_ALIGN_MASK,
            TypeKind::UIntPtr => PTR_ALIGN_MASK,
            _ => self.size().saturating_sub(1),
        }
    }
}

/// Parsed calling convention. On x86-64 System V every convention uses
/// the one native sequence, but the token is kept for decorated symbol
/// lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallConv {
    #[default]
    C,
    Std,
    Fast,
}

/// Handle into the [`TypeArena`]. Two descriptors denote the same
/// aggregate, enum, or function type exactly when their handles are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoId(pub u32);

/// Compact type descriptor. Copied around freely; everything that is
/// per-type rather than per-use lives behind `info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CType {
    pub kind: TypeKind,
    pub info: Option<InfoId>,
    /// Pointer indirections including the array level when `is_array`.
    pub pointers: u8,
    /// One const bit per indirection level, shifted left at each `*`.
    pub const_mask: u8,
    pub is_array: bool,
    pub array_size: u32,
    /// Per-element (or trailing-member) stride of a variable-length type.
    pub variable_increment: u32,
    pub is_variable_array: bool,
    pub is_variable_struct: bool,
    pub variable_size_known: bool,
    /// Auto-dereferenced handle to an aggregate, produced by member access.
    pub is_reference: bool,
    pub has_var_arg: bool,
    pub is_bitfield: bool,
    pub bit_size: u8,
    pub bit_offset: u8,
    pub conv: CallConv,
}

impl Default for CType {
    fn default() -> Self {
        CType::scalar(TypeKind::Void)
    }
}

impl CType {
    pub fn scalar(kind: TypeKind) -> CType {
        CType {
            kind,
            info: None,
            pointers: 0,
            const_mask: 0,
            is_array: false,
            array_size: 0,
            variable_increment: 0,
            is_variable_array: false,
            is_variable_struct: false,
            variable_size_known: false,
            is_reference: false,
            has_var_arg: false,
            is_bitfield: false,
            bit_size: 0,
            bit_offset: 0,
            conv: CallConv::C,
        }
    }

    pub fn with_info(kind: TypeKind, info: InfoId) -> CType {
        CType {
            info: Some(info),
            ..CType::scalar(kind)
        }
    }

    /// Pointer levels above the array level; nonzero means the value is
    /// pointer-shaped (or an array of pointers).
    pub fn ptr_depth(&self) -> u8 {
        self.pointers - self.is_array as u8
    }

    pub fn is_pointer(&self) -> bool {
        self.ptr_depth() > 0
    }

    pub fn is_void_ptr(&self) -> bool {
        self.kind == TypeKind::Void && self.ptr_depth() == 1
    }

    pub fn array_len(&self) -> usize {
        if self.is_array { self.array_size as usize } else { 1 }
    }

    pub fn is_defined(&self, arena: &TypeArena) -> bool {
        match self.kind {
            TypeKind::Struct | TypeKind::Union => match self.info {
                Some(id) => arena.record(id).defined,
                None => false,
            },
            TypeKind::Enum => match self.info {
                Some(id) => arena.enum_info(id).defined,
                None => false,
            },
            _ => true,
        }
    }

    /// Size of one element of the base type.
    pub fn base_size(&self, arena: &TypeArena) -> usize {
        match self.kind {
            TypeKind::Struct | TypeKind::Union => match self.info {
                Some(id) => arena.record(id).size,
                None => 0,
            },
            kind => kind.size(),
        }
    }

    /// Alignment mask of the value as declared, pointers included.
    pub fn align_mask(&self, arena: &TypeArena) -> usize {
        if self.ptr_depth() > 0 {
            return PTR_ALIGN_MASK;
        }
        match self.kind {
            TypeKind::Struct | TypeKind::Union => match self.info {
                Some(id) => arena.record(id).align_mask,
                None => 0,
            },
            kind => kind.align_mask(),
        }
    }

    /// Stride used for array indexing and pointer arithmetic.
    pub fn element_size(&self, arena: &TypeArena) -> usize {
        if self.pointers >= 2 {
            PTR_SIZE
        } else {
            self.base_size(arena)
        }
    }

    /// Total byte size of a value of this type. `None` when the size is
    /// not computable: undefined records, variable-length types, `void`.
    pub fn byte_size(&self, arena: &TypeArena) -> Option<usize> {
        if self.ptr_depth() > 0 {
            return Some(PTR_SIZE * self.array_len());
        }
        if self.is_variable_array || self.is_variable_struct {
            return None;
        }
        if !self.is_defined(arena) {
            return None;
        }
        let base = self.base_size(arena);
        if base == 0 {
            return None;
        }
        Some(base * self.array_len())
    }

    /// Renders the C spelling of the type, e.g. `struct point*` or
    /// `unsigned short[4]`.
    pub fn name<'a>(&'a self, arena: &'a TypeArena) -> TypeName<'a> {
        TypeName { ct: self, arena }
    }
}

pub struct TypeName<'a> {
    ct: &'a CType,
    arena: &'a TypeArena,
}

impl fmt::Display for TypeName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ct = self.ct;
        match ct.kind {
            TypeKind::Enum => match ct.info {
                Some(id) => write!(f, "enum {}", self.arena.enum_info(id).name)?,
                None => write!(f, "enum")?,
            },
            TypeKind::Struct | TypeKind::Union => {
                let tag = if ct.kind == TypeKind::Struct { "struct" } else { "union" };
                match ct.info {
                    Some(id) => write!(f, "{} {}", tag, self.arena.record(id).name)?,
                    None => write!(f, "{tag}")?,
                }
            }
            TypeKind::Func => match ct.info {
                Some(id) => write!(f, "{}", self.arena.func(id).signature)?,
                None => write!(f, "function")?,
            },
            TypeKind::Void => write!(f, "void")?,
            TypeKind::Double => write!(f, "double")?,
            TypeKind::Float => write!(f, "float")?,
            TypeKind::Bool => write!(f, "bool")?,
            TypeKind::I8 => write!(f, "char")?,
            TypeKind::U8 => write!(f, "unsigned char")?,
            TypeKind::I16 => write!(f, "short")?,
            TypeKind::U16 => write!(f, "unsigned short")?,
            TypeKind::I32 => write!(f, "int")?,
            TypeKind::U32 => write!(f, "unsigned int")?,
            TypeKind::I64 => write!(f, "int64_t")?,
            TypeKind::U64 => write!(f, "uint64_t")?,
            TypeKind::UIntPtr => write!(f, "uintptr_t")?,
        }

        for _ in 0..ct.ptr_depth() {
            write!(f, "*")?;
        }

        if ct.is_array {
            if ct.is_variable_array {
                write!(f, "[?]")?;
            } else {
                write!(f, "[{}]", ct.array_size)?;
            }
        }
        Ok(())
    }
}

/// One struct or union member in declaration order. Bitfield position
/// lives in the member's own descriptor.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: Option<String>,
    pub ctype: CType,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct RecordInfo {
    pub name: String,
    pub is_union: bool,
    pub size: usize,
    pub align_mask: usize,
    pub members: Vec<Member>,
    pub defined: bool,
    /// Trailing variable-length member stride, 0 when fixed size.
    pub variable_increment: usize,
}

impl RecordInfo {
    pub fn declared(name: String, is_union: bool) -> RecordInfo {
        RecordInfo {
            name,
            is_union,
            size: 0,
            align_mask: 0,
            members: Vec::new(),
            defined: false,
            variable_increment: 0,
        }
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.name.as_deref() == Some(name))
    }

    /// Looks up a member by name, descending into anonymous inline
    /// records with their offsets rebased onto this record.
    pub fn find(&self, arena: &TypeArena, name: &str) -> Option<(CType, usize)> {
        if let Some(m) = self.member(name) {
            return Some((m.ctype, m.offset));
        }
        for m in &self.members {
            if m.name.is_none() && m.ctype.kind.is_record() && m.ctype.pointers == 0 {
                if let Some(id) = m.ctype.info {
                    if let Some((ct, off)) = arena.record(id).find(arena, name) {
                        return Some((ct, m.offset + off));
                    }
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct EnumInfo {
    pub name: String,
    pub constants: Vec<(String, i32)>,
    pub defined: bool,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Option<String>,
    pub ctype: CType,
}

#[derive(Debug, Clone)]
pub struct FuncInfo {
    pub ret: CType,
    pub params: Vec<Param>,
    /// Canonical rendering, e.g. `int (*)(char*, int)`. Identical
    /// signatures intern to one arena entry.
    pub signature: String,
}

#[derive(Debug, Clone)]
pub enum TypeInfo {
    Record(RecordInfo),
    Enum(EnumInfo),
    Func(FuncInfo),
}

/// Append-only store for aggregate, enum, and function details. Entries
/// are only mutated while the defining declaration is being completed;
/// afterwards they are frozen. Cloned wholesale to snapshot registry
/// state around a `define` call.
#[derive(Debug, Clone, Default)]
pub struct TypeArena {
    infos: Vec<TypeInfo>,
}

impl TypeArena {
    pub fn new() -> TypeArena {
        TypeArena::default()
    }

    pub fn alloc(&mut self, info: TypeInfo) -> InfoId {
        let id = InfoId(self.infos.len() as u32);
        self.infos.push(info);
        id
    }

    pub fn get(&self, id: InfoId) -> &TypeInfo {
        &self.infos[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: InfoId) -> &mut TypeInfo {
        &mut self.infos[id.0 as usize]
    }

    pub fn record(&self, id: InfoId) -> &RecordInfo {
        match self.get(id) {
            TypeInfo::Record(r) => r,
            _ => unreachable!("handle {id:?} does not name a record"),
        }
    }

    pub fn record_mut(&mut self, id: InfoId) -> &mut RecordInfo {
        match self.get_mut(id) {
            TypeInfo::Record(r) => r,
            _ => unreachable!("handle {id:?} does not name a record"),
        }
    }

    pub fn enum_info(&self, id: InfoId) -> &EnumInfo {
        match self.get(id) {
            TypeInfo::Enum(e) => e,
            _ => unreachable!("handle {id:?} does not name an enum"),
        }
    }

    pub fn enum_info_mut(&mut self, id: InfoId) -> &mut EnumInfo {
        match self.get_mut(id) {
            TypeInfo::Enum(e) => e,
            _ => unreachable!("handle {id:?} does not name an enum"),
        }
    }

    pub fn func(&self, id: InfoId) -> &FuncInfo {
        match self.get(id) {
            TypeInfo::Func(f) => f,
            _ => unreachable!("handle {id:?} does not name a function"),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (InfoId, &TypeInfo)> {
        self.infos
            .iter()
            .enumerate()
            .map(|(i, info)| (InfoId(i as u32), info))
    }
}
