use crate::error::ParseError;
use crate::lexer::{Lexer, Tok};
use crate::registry::Registry;
use crate::types::{
    align_up, CallConv, CType, EnumInfo, InfoId, Member, Param, RecordInfo, TypeInfo, TypeKind,
    DEFAULT_PACK_MASK, MAX_INDIRECTION, PTR_SIZE,
};

/// How bitfields of differing base types share storage units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitfieldPolicy {
    /// Fields share a unit while the bits fit, crossing base-type
    /// changes, as GCC and Clang lay records out on this target.
    #[default]
    Gnu,
    /// Every base-type change closes the unit, as MSVC does.
    Msvc,
}

/// Outcome of one root-level parse; `PragmaPop` unwinds a recursion
/// opened by `#pragma pack(push)`.
#[derive(Debug, PartialEq, Eq)]
pub enum RootEnd {
    End,
    PragmaPop,
}

/// Recursive-descent parser over one declaration string. Registered
/// types, functions, and constants go straight into the registry; the
/// caller snapshots the registry if it wants failed calls rolled back.
pub struct Parser<'r, 's> {
    pub(crate) lex: Lexer<'s>,
    pub(crate) reg: &'r mut Registry,
    pack_mask: usize,
    policy: BitfieldPolicy,
}

impl<'r, 's> Parser<'r, 's> {
    pub fn new(src: &'s str, reg: &'r mut Registry, policy: BitfieldPolicy) -> Parser<'r, 's> {
        Parser {
            lex: Lexer::new(src),
            reg,
            pack_mask: DEFAULT_PACK_MASK,
            policy,
        }
    }

    pub(crate) fn err(&self, message: impl Into<String>) -> ParseError {
        self.lex.error(message)
    }

    pub(crate) fn expect(&mut self, want: Tok, message: &str) -> Result<(), ParseError> {
        let tok = self.lex.require()?;
        if tok == want {
            Ok(())
        } else {
            Err(self.err(message))
        }
    }

    /// Confirms the whole input was consumed.
    pub(crate) fn expect_end(&mut self) -> Result<(), ParseError> {
        match self.lex.next()? {
            None => Ok(()),
            Some(_) => Err(self.err("unexpected tokens after the expression")),
        }
    }

    fn expect_word(&mut self, want: &str, message: &str) -> Result<(), ParseError> {
        match self.lex.require()? {
            Tok::Ident(w) if w == want => Ok(()),
            _ => Err(self.err(message)),
        }
    }

    /// Parses every declaration in the string. A stray `pack(pop)` at
    /// this level is an error.
    pub fn parse_all(&mut self) -> Result<(), ParseError> {
        match self.parse_root()? {
            RootEnd::End => Ok(()),
            RootEnd::PragmaPop => Err(self.err("pragma pop without an associated push")),
        }
    }

    fn parse_root(&mut self) -> Result<RootEnd, ParseError> {
        while let Some(tok) = self.lex.next()? {
            match tok {
                Tok::Semi => {}
                Tok::Pound => {
                    if let RootEnd::PragmaPop = self.parse_pragma()? {
                        return Ok(RootEnd::PragmaPop);
                    }
                }
                Tok::Ident(w) if w == "typedef" => self.parse_typedef()?,
                Tok::Ident(w) if w == "static" => self.parse_static_const()?,
                Tok::Ident(_) => {
                    self.lex.put_back();
                    let mut ty = self.parse_type()?;
                    let name = self.parse_declarator(&mut ty)?;

                    if !ty.kind.has_info() || ty.pointers != 0 {
                        return Err(self.err("unexpected type in root"));
                    }
                    self.expect(Tok::Semi, "missing semicolon")?;

                    // Record and enum declarations registered themselves;
                    // a named function declaration lands in the function
                    // namespace for symbol binding.
                    if ty.kind == TypeKind::Func {
                        if let Some(name) = name {
                            self.reg.register_function(&name, ty);
                        }
                    }
                }
                _ => return Err(self.err("unexpected character in declaration")),
            }
        }
        Ok(RootEnd::End)
    }

    /// `#pragma pack` directive; the `#` has been consumed.
    fn parse_pragma(&mut self) -> Result<RootEnd, ParseError> {
        self.expect_word("pragma", "unexpected preprocessor directive")?;
        self.expect_word("pack", "unexpected preprocessor directive")?;
        self.expect(Tok::OpenParen, "invalid pack directive")?;

        match self.lex.require()? {
            Tok::Num(n) => {
                if !matches!(n, 1 | 2 | 4 | 8 | 16) {
                    return Err(self.err("pack directive with invalid pack size"));
                }
                self.pack_mask = (n - 1) as usize;
                self.expect(Tok::CloseParen, "invalid pack directive")?;
            }
            Tok::CloseParen => {
                self.pack_mask = DEFAULT_PACK_MASK;
            }
            Tok::Ident(w) if w == "push" => {
                let line = self.lex.line();
                let saved = self.pack_mask;
                self.expect(Tok::CloseParen, "invalid pack directive")?;
                if self.parse_root()? != RootEnd::PragmaPop {
                    return Err(ParseError::new(
                        "reached end of string without a pragma pop to match the push",
                        line,
                    ));
                }
                self.pack_mask = saved;
            }
            Tok::Ident(w) if w == "pop" => {
                self.expect(Tok::CloseParen, "invalid pack directive")?;
                return Ok(RootEnd::PragmaPop);
            }
            _ => return Err(self.err("invalid pack directive")),
        }
        Ok(RootEnd::End)
    }

    fn parse_typedef(&mut self) -> Result<(), ParseError> {
        let base = self.parse_type()?;
        loop {
            let mut ty = base;
            let name = self.parse_declarator(&mut ty)?;

            let Some(name) = name else {
                return Err(self.err("can't have a typedef without a name"));
            };
            if ty.is_variable_array {
                return Err(self.err("can't typedef a variable length array"));
            }
            if ty.is_bitfield {
                return Err(self.err("can't typedef a bitfield"));
            }
            self.reg.register_type(&name, ty);

            match self.lex.require()? {
                Tok::Semi => break,
                Tok::Comma => {}
                _ => return Err(self.err("unexpected character in typedef")),
            }
        }
        Ok(())
    }

    /// `static const <int type> NAME = expr;` declares a named constant;
    /// the `static` has been consumed.
    fn parse_static_const(&mut self) -> Result<(), ParseError> {
        self.expect_word("const", "unexpected token after static")?;
        let mut ty = self.parse_type()?;
        let name = self.parse_declarator(&mut ty)?;

        if !ty.kind.is_integer() || ty.pointers != 0 {
            return Err(self.err("static const declarations must have an integer type"));
        }
        let Some(name) = name else {
            return Err(self.err("can't have a constant without a name"));
        };

        self.expect(Tok::Assign, "expected = after constant name")?;
        let value = self.const_expr()?;
        self.expect(Tok::Semi, "missing semicolon")?;

        self.reg.set_constant(&name, value);
        Ok(())
    }

    /// Parses a full type expression (base type plus declarator). Entry
    /// point for `sizeof(...)` inside constant expressions and for
    /// type-spec strings handed to the host operations.
    pub fn parse_type_spec(&mut self) -> Result<CType, ParseError> {
        let mut ty = self.parse_type()?;
        self.parse_declarator(&mut ty)?;
        Ok(ty)
    }

    /// Parses the base type: qualifiers, `struct`/`union`/`enum`, a
    /// builtin multi-token run, or a registered type name.
    pub(crate) fn parse_type(&mut self) -> Result<CType, ParseError> {
        let mut tok = self.lex.require()?;
        let mut constant = false;

        loop {
            match &tok {
                Tok::Ident(w) if w == "const" => {
                    constant = true;
                    tok = self.lex.require()?;
                }
                Tok::Ident(w) if w == "volatile" => {
                    tok = self.lex.require()?;
                }
                Tok::Ident(_) => break,
                _ => return Err(self.err("unexpected value before type name")),
            }
        }

        let Tok::Ident(word) = tok else { unreachable!() };

        let mut ty = match word.as_str() {
            "struct" => self.parse_record(TypeKind::Struct)?,
            "union" => self.parse_record(TypeKind::Union)?,
            "enum" => self.parse_record(TypeKind::Enum)?,
            _ => self.parse_base_name(word)?,
        };

        if constant {
            ty.const_mask |= 1;
        }

        // Trailing qualifiers before the declarator.
        while let Some(tok) = self.lex.next()? {
            match &tok {
                Tok::Ident(w) if w == "const" => ty.const_mask |= 1,
                Tok::Ident(w) if w == "volatile" => {}
                _ => {
                    self.lex.put_back();
                    break;
                }
            }
        }

        Ok(ty)
    }

    /// Decodes a builtin token run (`unsigned long long`, `short int`,
    /// ...) into its canonical fixed-width name, or falls back to a
    /// registry lookup for typedefs and plain names.
    fn parse_base_name(&mut self, first: String) -> Result<CType, ParseError> {
        const UNSIGNED: u32 = 0x01;
        const SIGNED: u32 = 0x02;
        const LONG: u32 = 0x04;
        const SHORT: u32 = 0x08;
        const INT: u32 = 0x10;
        const CHAR: u32 = 0x20;
        const LONG_LONG: u32 = 0x40;
        const INT32: u32 = 0x80;
        const DOUBLE: u32 = 0x100;
        const FLOAT: u32 = 0x200;
        const COMPLEX: u32 = 0x400;

        fn keyword_bit(word: &str, flags: u32) -> Option<u32> {
            Some(match word {
                "unsigned" => UNSIGNED,
                "signed" => SIGNED,
                "short" => SHORT,
                "char" => CHAR,
                "long" => {
                    if flags & LONG != 0 {
                        LONG_LONG
                    } else {
                        LONG
                    }
                }
                "int" => INT,
                "__int32" => INT32,
                "__int64" => LONG_LONG,
                "double" => DOUBLE,
                "float" => FLOAT,
                "complex" => COMPLEX,
                _ => return None,
            })
        }

        let mut flags = 0u32;
        let mut cur = first;

        loop {
            match keyword_bit(&cur, flags) {
                Some(bit) => {
                    flags |= bit;
                    match self.lex.next()? {
                        Some(Tok::Ident(next)) => cur = next,
                        Some(_) => {
                            self.lex.put_back();
                            break;
                        }
                        None => break,
                    }
                }
                None => {
                    if flags != 0 {
                        // Not part of the run; hand it back.
                        self.lex.put_back();
                    }
                    break;
                }
            }
        }

        let canonical = if flags & CHAR != 0 {
            // Plain char is signed on x86-64 System V.
            if flags & UNSIGNED != 0 { "uint8_t" } else { "int8_t" }
        } else if flags & INT32 != 0 {
            if flags & UNSIGNED != 0 { "uint32_t" } else { "int32_t" }
        } else if flags & COMPLEX != 0 {
            return Err(self.err("complex types are not supported"));
        } else if flags & DOUBLE != 0 {
            if flags & LONG != 0 {
                return Err(self.err("long double is not supported"));
            }
            "double"
        } else if flags & FLOAT != 0 {
            "float"
        } else if flags & LONG_LONG != 0 {
            if flags & UNSIGNED != 0 { "uint64_t" } else { "int64_t" }
        } else if flags & SHORT != 0 {
            if flags & UNSIGNED != 0 { "uint16_t" } else { "int16_t" }
        } else if flags & LONG != 0 {
            // LP64: long is 8 bytes.
            if flags & UNSIGNED != 0 { "uint64_t" } else { "int64_t" }
        } else if flags != 0 {
            if flags & UNSIGNED != 0 { "uint32_t" } else { "int32_t" }
        } else {
            cur.as_str()
        };

        match self.reg.type_named(canonical) {
            Some(ty) => Ok(ty),
            None => Err(self.err(format!("unknown type {canonical}"))),
        }
    }

    /// Declarator after the base type: pointers, arrays, function
    /// parentheses, bitfield width, convention tokens, and the declared
    /// name. Returns the name when one was present.
    pub(crate) fn parse_declarator(&mut self, ty: &mut CType) -> Result<Option<String>, ParseError> {
        let mut name: Option<String> = None;

        while let Some(tok) = self.lex.next()? {
            match tok {
                Tok::Star => {
                    if ty.pointers >= MAX_INDIRECTION {
                        return Err(self.err("too many pointer indirections"));
                    }
                    ty.pointers += 1;
                    ty.const_mask <<= 1;
                }
                Tok::Amp => {
                    return Err(self.err("C++ reference types are not supported"));
                }
                Tok::OpenParen => {
                    return self.parse_function(ty, name);
                }
                Tok::OpenSquare => {
                    if ty.pointers >= MAX_INDIRECTION {
                        return Err(self.err("too many pointer indirections"));
                    }
                    if ty.is_bitfield {
                        return Err(self.err("bitfields can not be arrays"));
                    }
                    ty.is_array = true;
                    ty.pointers += 1;

                    if ty.pointers == 1 && !ty.is_defined(&self.reg.arena) {
                        return Err(self.err("array of undefined type"));
                    }
                    if ty.is_variable_struct || ty.is_variable_array {
                        return Err(self.err("can't have an array of a variably sized type"));
                    }

                    let tok = self.lex.require()?;
                    if tok == Tok::Question {
                        ty.is_variable_array = true;
                        ty.variable_increment = if ty.pointers > 1 {
                            PTR_SIZE as u32
                        } else {
                            ty.base_size(&self.reg.arena) as u32
                        };
                    } else {
                        self.lex.put_back();
                        let asize = self.const_expr()?;
                        if asize < 0 {
                            return Err(self.err("array size can not be negative"));
                        }
                        ty.array_size = asize as u32;
                    }
                    self.expect(Tok::CloseSquare, "invalid character in array")?;
                    break;
                }
                Tok::Colon => {
                    let width = self.const_expr()?;
                    if ty.ptr_depth() > 0 || ty.is_array || !ty.kind.is_integer() {
                        return Err(self.err("bitfields must have an integer type"));
                    }
                    let max_bits = 8 * ty.kind.size() as i64;
                    if width < 0 || width > max_bits {
                        return Err(self.err("invalid bitfield width"));
                    }
                    ty.is_bitfield = true;
                    ty.bit_size = width as u8;
                }
                Tok::Ident(word) => match word.as_str() {
                    "__cdecl" => ty.conv = CallConv::C,
                    "__stdcall" => ty.conv = CallConv::Std,
                    "__fastcall" => ty.conv = CallConv::Fast,
                    "const" => ty.const_mask |= 1,
                    "volatile" => {}
                    _ => {
                        name = Some(word);
                        // A second identifier would be an unknown
                        // attribute, which is not recoverable.
                        if let Some(tok) = self.lex.next()? {
                            if matches!(tok, Tok::Ident(_)) {
                                return Err(self.err("unexpected token after name"));
                            }
                            self.lex.put_back();
                        }
                    }
                },
                _ => {
                    self.lex.put_back();
                    break;
                }
            }
        }

        // Conventions only matter on function types, which returned
        // above.
        ty.conv = CallConv::C;
        Ok(name)
    }

    /// Function declarator: the `(` has been consumed. `ty` holds the
    /// return type; it is rewritten in place into the function type.
    fn parse_function(
        &mut self,
        ty: &mut CType,
        mut name: Option<String>,
    ) -> Result<Option<String>, ParseError> {
        let mut ret = *ty;
        let conv = ret.conv;
        ret.conv = CallConv::C;

        *ty = CType::scalar(TypeKind::Func);
        ty.conv = conv;

        if name.is_none() {
            // `(* [convention] name)` inner declarator form.
            let mut tok = self.lex.require()?;
            loop {
                match tok {
                    Tok::CloseParen => break,
                    Tok::Star => ty.pointers += 1,
                    Tok::Ident(word) => match word.as_str() {
                        "__cdecl" => ty.conv = CallConv::C,
                        "__stdcall" => ty.conv = CallConv::Std,
                        "__fastcall" => ty.conv = CallConv::Fast,
                        "const" | "volatile" => {}
                        _ => {
                            name = Some(word);
                            self.expect(Tok::CloseParen, "unexpected token after name")?;
                            break;
                        }
                    },
                    _ => return Err(self.err("unexpected token in function")),
                }
                tok = self.lex.require()?;
            }

            // A single pointer level is the function type itself.
            if ty.pointers > 0 {
                ty.pointers -= 1;
            }

            self.expect(Tok::OpenParen, "unexpected token in function")?;
        }

        let (params, has_var_arg) = self.parse_params()?;

        let signature = render_signature(ty.conv, &ret, &params, has_var_arg, &self.reg.arena);
        let id = match self.reg.interned_signature(&signature) {
            Some(id) => id,
            None => {
                let id = self.reg.arena.alloc(TypeInfo::Func(crate::types::FuncInfo {
                    ret,
                    params,
                    signature: signature.clone(),
                }));
                self.reg.intern_signature(signature, id);
                id
            }
        };
        ty.info = Some(id);
        ty.has_var_arg = has_var_arg;

        Ok(name)
    }

    /// Argument list from after the opening `(` to after the closing `)`.
    fn parse_params(&mut self) -> Result<(Vec<Param>, bool), ParseError> {
        let mut params = Vec::new();
        let mut has_var_arg = false;

        loop {
            let mut tok = self.lex.require()?;
            if tok == Tok::CloseParen {
                break;
            }

            if !params.is_empty() {
                if tok != Tok::Comma {
                    return Err(self.err(format!(
                        "unexpected token in function argument {}",
                        params.len() + 1
                    )));
                }
                tok = self.lex.require()?;
            }

            match tok {
                Tok::Ellipsis => {
                    has_var_arg = true;
                    self.expect(
                        Tok::CloseParen,
                        "unexpected token after variadic marker",
                    )?;
                    break;
                }
                Tok::Ident(_) => {
                    self.lex.put_back();
                    let mut at = self.parse_type()?;
                    let pname = self.parse_declarator(&mut at)?;

                    if at.is_bitfield {
                        return Err(self.err("bitfields are not valid argument types"));
                    }

                    // Arrays decay to their element pointer.
                    at.is_array = false;

                    // C-style `f(void)` means no arguments.
                    if at.kind == TypeKind::Void && at.pointers == 0 {
                        if !params.is_empty() {
                            return Err(self.err("can't have an argument of type void"));
                        }
                        self.expect(
                            Tok::CloseParen,
                            "unexpected token in function argument 1",
                        )?;
                        break;
                    }

                    params.push(Param { name: pname, ctype: at });
                }
                _ => {
                    return Err(self.err(format!(
                        "unexpected token in function argument {}",
                        params.len() + 1
                    )));
                }
            }
        }

        Ok((params, has_var_arg))
    }

    /// `struct`/`union`/`enum` after the introducing keyword: tag,
    /// optional body, registration.
    fn parse_record(&mut self, kind: TypeKind) -> Result<CType, ParseError> {
        let mut tok = self.lex.require()?;

        let tag = match &tok {
            Tok::Ident(w) => {
                let w = w.clone();
                tok = self.lex.require()?;
                Some(w)
            }
            _ => None,
        };

        let mut ty = match &tag {
            Some(tag) => match self.reg.type_named(tag) {
                Some(prev) => {
                    if prev.kind != kind {
                        return Err(self.err(format!(
                            "type {tag} previously declared as a different type"
                        )));
                    }
                    prev
                }
                None => {
                    let id = self.declare(kind, tag.clone());
                    let ty = CType::with_info(kind, id);
                    self.reg.register_type(tag, ty);
                    ty
                }
            },
            None => {
                let anon = self.reg.anon_name();
                let id = self.declare(kind, anon.clone());
                let ty = CType::with_info(kind, id);
                self.reg.register_type(&anon, ty);
                ty
            }
        };

        if tok != Tok::OpenBrace {
            self.lex.put_back();
            return Ok(ty);
        }

        if ty.is_defined(&self.reg.arena) {
            let name = ty.name(&self.reg.arena).to_string();
            return Err(self.err(format!("redefinition of {name}")));
        }

        let id = ty.info.unwrap_or_else(|| unreachable!("record without info"));
        if kind == TypeKind::Enum {
            self.parse_enum_body(id)?;
        } else {
            self.parse_members(id, kind == TypeKind::Union)?;
            let rec = self.reg.arena.record(id);
            ty.is_variable_struct = rec.variable_increment != 0;
            ty.variable_increment = rec.variable_increment as u32;
            if let Some(tag) = &tag {
                // Re-register so later lookups see the variable flags.
                self.reg.register_type(tag, ty);
            }
        }

        Ok(ty)
    }

    fn declare(&mut self, kind: TypeKind, name: String) -> InfoId {
        let info = match kind {
            TypeKind::Enum => TypeInfo::Enum(EnumInfo {
                name,
                constants: Vec::new(),
                defined: false,
            }),
            kind => TypeInfo::Record(RecordInfo::declared(name, kind == TypeKind::Union)),
        };
        self.reg.arena.alloc(info)
    }

    /// Enumerator list from after `{` to after `}`. Every enumerator
    /// also lands in the constants namespace.
    fn parse_enum_body(&mut self, id: InfoId) -> Result<(), ParseError> {
        let mut value: i32 = -1;

        loop {
            let tok = self.lex.require()?;
            if tok == Tok::CloseBrace {
                break;
            }

            let Tok::Ident(name) = tok else {
                return Err(self.err("unexpected token in enum"));
            };

            let mut tok = self.lex.require()?;
            if tok == Tok::Assign {
                value = self.const_expr()? as i32;
                tok = self.lex.require()?;
            } else {
                value = value.wrapping_add(1);
            }

            self.reg.set_constant(&name, value as i64);
            self.reg
                .arena
                .enum_info_mut(id)
                .constants
                .push((name, value));

            match tok {
                Tok::Comma => {}
                Tok::CloseBrace => break,
                _ => return Err(self.err("unexpected token in enum")),
            }
        }

        self.reg.arena.enum_info_mut(id).defined = true;
        Ok(())
    }

    /// Member list from after `{` to after `}`: phase one collects raw
    /// members with their declarators, phase two computes the layout.
    fn parse_members(&mut self, id: InfoId, is_union: bool) -> Result<(), ParseError> {
        let mut raw: Vec<RawMember> = Vec::new();
        let mut saw_variable = false;

        loop {
            let tok = self.lex.require()?;
            if tok == Tok::CloseBrace {
                break;
            }
            self.lex.put_back();

            let base = self.parse_type()?;
            loop {
                let mut mt = base;
                let name = self.parse_declarator(&mut mt)?;

                if saw_variable {
                    return Err(self.err("can't have members after a variable sized member"));
                }
                if mt.kind == TypeKind::Void && mt.pointers == 0 {
                    return Err(self.err("member type can not be void"));
                }
                if mt.pointers == 0 && !mt.is_defined(&self.reg.arena) {
                    return Err(self.err("member type is undefined"));
                }
                if mt.is_variable_array || mt.is_variable_struct {
                    if is_union {
                        return Err(self.err("variable sized members are not supported in unions"));
                    }
                    saw_variable = true;
                }
                if mt.is_bitfield && mt.bit_size == 0 && name.is_some() {
                    return Err(self.err("zero width bitfields must be unnamed"));
                }

                raw.push(RawMember { name, ctype: mt });

                match self.lex.require()? {
                    Tok::Semi => break,
                    Tok::Comma => {}
                    _ => return Err(self.err("unexpected token in struct definition")),
                }
            }
        }

        let layout = layout_members(&raw, is_union, self.pack_mask, self.policy, &self.reg.arena);

        let rec = self.reg.arena.record_mut(id);
        rec.size = layout.size;
        rec.align_mask = layout.align_mask;
        rec.members = layout.members;
        rec.variable_increment = layout.variable_increment;
        rec.defined = true;
        Ok(())
    }
}

/// Canonical rendering of a function type, e.g. `int (*)(char*, ...)`.
/// Identical renderings intern to a single arena entry.
pub(crate) fn render_signature(
    conv: CallConv,
    ret: &CType,
    params: &[Param],
    has_var_arg: bool,
    arena: &crate::types::TypeArena,
) -> String {
    use std::fmt::Write;

    let mut sig = String::new();
    let _ = write!(sig, "{}", ret.name(arena));
    sig.push_str(match conv {
        CallConv::C => " (*)(",
        CallConv::Std => " (__stdcall *)(",
        CallConv::Fast => " (__fastcall *)(",
    });
    for (i, p) in params.iter().enumerate() {
        if i > 0 {
            sig.push_str(", ");
        }
        let _ = write!(sig, "{}", p.ctype.name(arena));
    }
    if has_var_arg {
        if !params.is_empty() {
            sig.push_str(", ");
        }
        sig.push_str("...");
    }
    sig.push(')');
    sig
}

struct RawMember {
    name: Option<String>,
    ctype: CType,
}

struct RecordLayout {
    size: usize,
    align_mask: usize,
    members: Vec<Member>,
    variable_increment: usize,
}

/// Open bitfield run while laying out adjacent bitfield members.
enum BitRun {
    /// Absolute next free bit from the start of the record.
    Gnu { bit: usize },
    /// Currently open storage unit.
    Msvc {
        unit_offset: usize,
        unit_size: usize,
        used: usize,
    },
}

/// Computes offsets, total size, and alignment for a record. Pure so the
/// packing rules can be exercised directly.
fn layout_members(
    raw: &[RawMember],
    is_union: bool,
    pack_mask: usize,
    policy: BitfieldPolicy,
    arena: &crate::types::TypeArena,
) -> RecordLayout {
    let mut size = 0usize;
    let mut align_mask = 0usize;
    let mut members = Vec::new();
    let mut variable_increment = 0usize;
    let mut run: Option<BitRun> = None;

    for m in raw {
        let ct = &m.ctype;

        if ct.is_bitfield {
            let placed = if is_union {
                let s_t = ct.kind.size();
                align_mask = align_mask.max(ct.kind.align_mask().min(pack_mask));
                size = size.max(s_t);
                Some((0, 0))
            } else {
                match policy {
                    BitfieldPolicy::Gnu => {
                        place_bitfield_gnu(ct, &mut run, &mut size, &mut align_mask, pack_mask)
                    }
                    BitfieldPolicy::Msvc => {
                        place_bitfield_msvc(ct, &mut run, &mut size, &mut align_mask, pack_mask)
                    }
                }
            };

            if let (Some((offset, bit_offset)), Some(name)) = (placed, &m.name) {
                let mut mt = *ct;
                mt.bit_offset = bit_offset as u8;
                members.push(Member {
                    name: Some(name.clone()),
                    ctype: mt,
                    offset,
                });
            }
            continue;
        }

        run = None;

        let malign = ct.align_mask(arena).min(pack_mask);
        align_mask = align_mask.max(malign);

        let msize = if ct.is_variable_array {
            variable_increment = ct.variable_increment as usize;
            0
        } else if ct.is_variable_struct {
            variable_increment = ct.variable_increment as usize;
            ct.base_size(arena)
        } else if ct.ptr_depth() > 0 {
            PTR_SIZE * ct.array_len()
        } else {
            ct.base_size(arena) * ct.array_len()
        };

        let offset = if is_union {
            size = size.max(msize);
            0
        } else {
            let offset = align_up(size, malign);
            size = offset + msize;
            offset
        };

        if m.name.is_some() || (ct.kind.is_record() && ct.pointers == 0) {
            // Named members and anonymous inline records are reachable;
            // other unnamed members only shift the layout.
            members.push(Member {
                name: m.name.clone(),
                ctype: *ct,
                offset,
            });
        }
    }

    if size == 0 {
        size = 1;
    }
    size = align_up(size, align_mask);

    RecordLayout {
        size,
        align_mask,
        members,
        variable_increment,
    }
}

/// GCC-style placement: a running bit cursor; a field moves to the next
/// aligned window of its base type only when it would cross one, and
/// packing below the base alignment removes the window rule entirely.
/// Returns the (unit byte offset, bit offset) for a placed field, `None`
/// for zero-width padding.
fn place_bitfield_gnu(
    ct: &CType,
    run: &mut Option<BitRun>,
    size: &mut usize,
    align_mask: &mut usize,
    pack_mask: usize,
) -> Option<(usize, usize)> {
    let s_t = ct.kind.size();
    let unit_bits = 8 * s_t;
    let width = ct.bit_size as usize;

    let mut bit = match run {
        Some(BitRun::Gnu { bit }) => *bit,
        _ => *size * 8,
    };

    if width == 0 {
        bit = align_up(bit, unit_bits - 1);
        *run = Some(BitRun::Gnu { bit });
        *size = (*size).max(bit.div_ceil(8));
        return None;
    }

    let packed = pack_mask < ct.kind.align_mask();
    if !packed {
        let window = bit / unit_bits * unit_bits;
        if bit + width > window + unit_bits {
            bit = window + unit_bits;
        }
    }

    let (offset, bit_offset) = if packed {
        (bit / 8, bit % 8)
    } else {
        let window = bit / unit_bits * unit_bits;
        (window / 8, bit - window)
    };

    *align_mask = (*align_mask).max(ct.kind.align_mask().min(pack_mask));
    bit += width;
    *size = (*size).max(bit.div_ceil(8));
    *run = Some(BitRun::Gnu { bit });

    Some((offset, bit_offset))
}

/// MSVC-style placement: a whole storage unit is reserved when a run
/// opens; a differing base type or an overflowing width closes it.
fn place_bitfield_msvc(
    ct: &CType,
    run: &mut Option<BitRun>,
    size: &mut usize,
    align_mask: &mut usize,
    pack_mask: usize,
) -> Option<(usize, usize)> {
    let s_t = ct.kind.size();
    let width = ct.bit_size as usize;

    if width == 0 {
        *run = None;
        return None;
    }

    if let Some(BitRun::Msvc {
        unit_offset,
        unit_size,
        used,
    }) = run
    {
        if *unit_size == s_t && *used + width <= 8 * s_t {
            let placed = (*unit_offset, *used);
            *used += width;
            return Some(placed);
        }
    }

    let malign = ct.kind.align_mask().min(pack_mask);
    *align_mask = (*align_mask).max(malign);

    let unit_offset = align_up(*size, malign);
    *size = unit_offset + s_t;
    *run = Some(BitRun::Msvc {
        unit_offset,
        unit_size: s_t,
        used: width,
    });

    Some((unit_offset, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg_with(src: &str) -> Registry {
        let mut reg = Registry::new();
        Parser::new(src, &mut reg, BitfieldPolicy::default())
            .parse_all()
            .expect("parse failed");
        reg
    }

    fn parse_err(src: &str) -> ParseError {
        let mut reg = Registry::new();
        Parser::new(src, &mut reg, BitfieldPolicy::default())
            .parse_all()
            .expect_err("parse should have failed")
    }

    fn record_of<'r>(reg: &'r Registry, name: &str) -> &'r RecordInfo {
        let ct = reg.type_named(name).expect("type not registered");
        reg.arena.record(ct.info.expect("no info"))
    }

    fn offset_of(reg: &Registry, record: &str, member: &str) -> usize {
        record_of(reg, record)
            .member(member)
            .unwrap_or_else(|| panic!("no member {member}"))
            .offset
    }

    #[test]
    fn typedef_registers_types() {
        let reg = reg_with("typedef unsigned long long u64; typedef u64 *pu64, au64[4];");
        let arena = &reg.arena;

        let u64t = reg.type_named("u64").expect("u64");
        assert_eq!(u64t.kind, TypeKind::U64);

        let p = reg.type_named("pu64").expect("pu64");
        assert_eq!(p.pointers, 1);
        assert_eq!(p.byte_size(arena), Some(8));

        let a = reg.type_named("au64").expect("au64");
        assert!(a.is_array);
        assert_eq!(a.byte_size(arena), Some(32));
    }

    #[test]
    fn builtin_token_runs_normalize() {
        let reg = reg_with(
            "typedef unsigned short us; typedef signed char sc; \
             typedef long l; typedef unsigned long long ull; typedef unsigned u;",
        );
        assert_eq!(reg.type_named("us").map(|t| t.kind), Some(TypeKind::U16));
        assert_eq!(reg.type_named("sc").map(|t| t.kind), Some(TypeKind::I8));
        assert_eq!(reg.type_named("l").map(|t| t.kind), Some(TypeKind::I64));
        assert_eq!(reg.type_named("ull").map(|t| t.kind), Some(TypeKind::U64));
        assert_eq!(reg.type_named("u").map(|t| t.kind), Some(TypeKind::U32));
    }

    #[test]
    fn struct_layout_matches_the_native_compiler() {
        #[repr(C)]
        struct Mixed {
            a: u8,
            b: u32,
            c: u16,
            d: f64,
        }

        let reg = reg_with(
            "struct mixed { uint8_t a; uint32_t b; uint16_t c; double d; };",
        );
        let rec = record_of(&reg, "mixed");

        assert_eq!(rec.size, std::mem::size_of::<Mixed>());
        assert_eq!(rec.align_mask + 1, std::mem::align_of::<Mixed>());
        assert_eq!(offset_of(&reg, "mixed", "a"), std::mem::offset_of!(Mixed, a));
        assert_eq!(offset_of(&reg, "mixed", "b"), std::mem::offset_of!(Mixed, b));
        assert_eq!(offset_of(&reg, "mixed", "c"), std::mem::offset_of!(Mixed, c));
        assert_eq!(offset_of(&reg, "mixed", "d"), std::mem::offset_of!(Mixed, d));
    }

    #[test]
    fn union_takes_the_widest_member() {
        #[repr(C)]
        union Pick {
            a: u8,
            b: u64,
            c: [u16; 3],
        }

        let reg = reg_with("union pick { uint8_t a; uint64_t b; uint16_t c[3]; };");
        let rec = record_of(&reg, "pick");

        assert_eq!(rec.size, std::mem::size_of::<Pick>());
        assert_eq!(rec.align_mask + 1, std::mem::align_of::<Pick>());
        assert_eq!(offset_of(&reg, "pick", "b"), 0);
        assert_eq!(offset_of(&reg, "pick", "c"), 0);
    }

    #[test]
    fn nested_and_anonymous_records() {
        #[repr(C)]
        struct Inner {
            x: i32,
            y: i32,
        }
        #[repr(C)]
        struct Outer {
            tag: u8,
            inner: Inner,
            z: i64,
        }

        let reg = reg_with(
            "struct inner { int x; int y; }; \
             struct outer { uint8_t tag; struct inner inner; int64_t z; }; \
             struct flat { uint8_t tag; struct { int x; int y; }; int64_t z; };",
        );

        assert_eq!(record_of(&reg, "outer").size, std::mem::size_of::<Outer>());
        assert_eq!(
            offset_of(&reg, "outer", "inner"),
            std::mem::offset_of!(Outer, inner)
        );
        assert_eq!(offset_of(&reg, "outer", "z"), std::mem::offset_of!(Outer, z));

        // Anonymous inline record members resolve through the parent
        // with rebiased offsets.
        let flat = record_of(&reg, "flat");
        assert_eq!(flat.size, std::mem::size_of::<Outer>());
        let (x, xoff) = flat.find(&reg.arena, "x").expect("x");
        assert_eq!(x.kind, TypeKind::I32);
        assert_eq!(xoff, std::mem::offset_of!(Outer, inner));
        let (_, yoff) = flat.find(&reg.arena, "y").expect("y");
        assert_eq!(yoff, std::mem::offset_of!(Outer, inner) + 4);
    }

    #[test]
    fn pragma_pack_controls_offsets() {
        #[repr(C, packed(2))]
        struct Packed {
            a: u8,
            b: u64,
        }

        let reg = reg_with(
            "#pragma pack(2)\n struct packed { uint8_t a; uint64_t b; };\n \
             #pragma pack()\n struct natural { uint8_t a; uint64_t b; };",
        );

        let packed = record_of(&reg, "packed");
        assert_eq!(packed.size, std::mem::size_of::<Packed>());
        assert_eq!(offset_of(&reg, "packed", "b"), std::mem::offset_of!(Packed, b));

        let natural = record_of(&reg, "natural");
        assert_eq!(offset_of(&reg, "natural", "b"), 8);
        assert_eq!(natural.size, 16);
    }

    #[test]
    fn pragma_push_pop_restores_the_mask() {
        let reg = reg_with(
            "#pragma pack(8)\n \
             #pragma pack(push)\n #pragma pack(1)\n \
             struct tight { uint8_t a; uint32_t b; };\n \
             #pragma pack(pop)\n \
             struct loose { uint8_t a; uint32_t b; };",
        );

        assert_eq!(record_of(&reg, "tight").size, 5);
        assert_eq!(offset_of(&reg, "tight", "b"), 1);
        assert_eq!(record_of(&reg, "loose").size, 8);
        assert_eq!(offset_of(&reg, "loose", "b"), 4);
    }

    #[test]
    fn unbalanced_pragmas_are_errors() {
        let err = parse_err("#pragma pack(pop)");
        assert!(err.message.contains("pragma pop"));

        let err = parse_err("#pragma pack(push)\n struct x { int a; };");
        assert!(err.message.contains("without a pragma pop"));

        let err = parse_err("#pragma pack(3)");
        assert!(err.message.contains("invalid pack size"));
    }

    #[test]
    fn enums_count_and_reset() {
        let reg = reg_with("enum color { RED, GREEN = 5, BLUE, BLACK = GREEN + 10, GREY };");
        assert_eq!(reg.constant("RED"), Some(0));
        assert_eq!(reg.constant("GREEN"), Some(5));
        assert_eq!(reg.constant("BLUE"), Some(6));
        assert_eq!(reg.constant("BLACK"), Some(15));
        assert_eq!(reg.constant("GREY"), Some(16));

        let ct = reg.type_named("color").expect("color");
        assert_eq!(ct.kind, TypeKind::Enum);
        assert_eq!(ct.byte_size(&reg.arena), Some(4));
    }

    #[test]
    fn static_const_int_declares_a_constant() {
        let reg = reg_with("static const int BUFSZ = 1 << 12;");
        assert_eq!(reg.constant("BUFSZ"), Some(4096));
    }

    #[test]
    fn function_declarations_register_and_intern() {
        let mut reg = Registry::new();
        Parser::new(
            "int add(int a, int b); int sub(int, int); void note(const char *fmt, ...);",
            &mut reg,
            BitfieldPolicy::default(),
        )
        .parse_all()
        .expect("parse failed");

        let add = reg.function_named("add").expect("add");
        let sub = reg.function_named("sub").expect("sub");
        assert_eq!(add.kind, TypeKind::Func);
        // Identical signatures share one interned entry.
        assert_eq!(add.info, sub.info);

        let note = reg.function_named("note").expect("note");
        assert!(note.has_var_arg);
        assert_ne!(note.info, add.info);

        let info = reg.arena.func(add.info.expect("info"));
        assert_eq!(info.signature, "int (*)(int, int)");
        assert_eq!(info.params.len(), 2);
        assert_eq!(info.params[0].name.as_deref(), Some("a"));

        let note_info = reg.arena.func(note.info.expect("info"));
        assert_eq!(note_info.signature, "void (*)(char*, ...)");
    }

    #[test]
    fn function_pointer_members_and_typedefs() {
        let reg = reg_with(
            "typedef int (*binop)(int, int); \
             struct ops { binop add; int (*cmp)(void*, void*); };",
        );

        let binop = reg.type_named("binop").expect("binop");
        assert_eq!(binop.kind, TypeKind::Func);
        assert_eq!(binop.pointers, 0);

        let rec = record_of(&reg, "ops");
        assert_eq!(rec.size, 16);
        assert_eq!(offset_of(&reg, "ops", "cmp"), 8);
    }

    #[test]
    fn variable_sized_structs() {
        let reg = reg_with("struct buf { uint32_t len; char data[?]; };");
        let ct = reg.type_named("buf").expect("buf");

        assert!(ct.is_variable_struct);
        assert_eq!(ct.variable_increment, 1);

        let rec = record_of(&reg, "buf");
        assert_eq!(rec.size, 4);
        assert_eq!(offset_of(&reg, "buf", "data"), 4);
        // Size is not computable without an element count.
        assert_eq!(ct.byte_size(&reg.arena), None);
    }

    #[test]
    fn bitfield_exemplar_packs_like_the_native_compiler() {
        let reg = reg_with(
            "struct bf { unsigned short a : 3; unsigned short b : 6; \
             unsigned short c : 5; unsigned short d : 8; };",
        );
        let rec = record_of(&reg, "bf");

        assert_eq!(rec.size, 4);
        assert_eq!(rec.align_mask, 1);

        let (a, aoff) = rec.find(&reg.arena, "a").expect("a");
        assert_eq!((aoff, a.bit_offset, a.bit_size), (0, 0, 3));
        let (b, boff) = rec.find(&reg.arena, "b").expect("b");
        assert_eq!((boff, b.bit_offset, b.bit_size), (0, 3, 6));
        let (c, coff) = rec.find(&reg.arena, "c").expect("c");
        assert_eq!((coff, c.bit_offset, c.bit_size), (0, 9, 5));
        let (d, doff) = rec.find(&reg.arena, "d").expect("d");
        assert_eq!((doff, d.bit_offset, d.bit_size), (2, 0, 8));
    }

    #[test]
    fn bitfields_mix_with_plain_members() {
        // GCC packs x and y into the int unit that begins at byte 0,
        // straight after head's bits; tail lands on the next free byte.
        let reg = reg_with(
            "struct flags { uint8_t head; unsigned x : 4; unsigned y : 20; uint8_t tail; };",
        );
        let rec = record_of(&reg, "flags");

        let (x, xoff) = rec.find(&reg.arena, "x").expect("x");
        assert_eq!((xoff, x.bit_offset), (0, 8));
        let (y, yoff) = rec.find(&reg.arena, "y").expect("y");
        assert_eq!((yoff, y.bit_offset), (0, 12));
        assert_eq!(offset_of(&reg, "flags", "tail"), 4);
        assert_eq!(rec.size, 8);
        assert_eq!(rec.align_mask, 3);
    }

    #[test]
    fn zero_width_bitfield_closes_the_unit() {
        // `int : 0` advances to the next int boundary without adding
        // int alignment to the struct itself.
        let reg = reg_with("struct split { char a : 2; int : 0; char b : 2; };");
        let rec = record_of(&reg, "split");

        let (_, boff) = rec.find(&reg.arena, "b").expect("b");
        assert_eq!(boff, 4);
        assert_eq!(rec.size, 5);
        assert_eq!(rec.align_mask, 0);
    }

    #[test]
    fn msvc_policy_closes_units_between_types() {
        let mut reg = Registry::new();
        Parser::new(
            "struct mixed { char a : 2; int b : 2; };",
            &mut reg,
            BitfieldPolicy::Msvc,
        )
        .parse_all()
        .expect("parse failed");

        // The int run opens a fresh 4-byte unit after the char unit.
        let rec = record_of(&reg, "mixed");
        let (_, boff) = rec.find(&reg.arena, "b").expect("b");
        assert_eq!(boff, 4);
        assert_eq!(rec.size, 8);
    }

    #[test]
    fn forward_declarations_complete_later() {
        let reg = reg_with(
            "struct node; \
             typedef struct node node_t; \
             struct node { struct node *next; int value; };",
        );

        // The typedef was taken before the definition; the arena handle
        // makes the completed layout visible through it.
        let alias = reg.type_named("node_t").expect("node_t");
        assert!(alias.is_defined(&reg.arena));
        assert_eq!(alias.byte_size(&reg.arena), Some(16));
        assert_eq!(offset_of(&reg, "node", "value"), 8);
    }

    #[test]
    fn declaration_errors() {
        assert!(parse_err("typedef foo bar;").message.contains("unknown type foo"));
        assert!(parse_err("struct a { int x; }; union a { int y; };")
            .message
            .contains("previously declared as a different type"));
        assert!(parse_err("struct b { int x; }; struct b { int y; };")
            .message
            .contains("redefinition"));
        assert!(parse_err("struct c { struct nope x; };")
            .message
            .contains("member type is undefined"));
        assert!(parse_err("struct d { void x; };")
            .message
            .contains("member type can not be void"));
        assert!(parse_err("struct e { char data[?]; int after; };")
            .message
            .contains("after a variable sized member"));
        assert!(parse_err("union f { char data[?]; };")
            .message
            .contains("not supported in unions"));
        assert!(parse_err("typedef int arr[-1];")
            .message
            .contains("can not be negative"));
        assert!(parse_err("struct g { int x : 33; };")
            .message
            .contains("invalid bitfield width"));
        assert!(parse_err("struct h { float f : 3; };")
            .message
            .contains("integer type"));
        assert!(parse_err("struct i { int j : 0; };")
            .message
            .contains("unnamed"));
        assert!(parse_err("int x;").message.contains("unexpected type in root"));
        assert!(parse_err("struct k { int x; }").message.contains("unexpected end"));
        assert!(parse_err("int f(int) int").message.contains("missing semicolon"));

        let err = parse_err("struct m {\n  int x;\n  flop y;\n};");
        assert_eq!(err.line, 3);
    }

    #[test]
    fn type_specs_parse_declarators() {
        let mut reg = Registry::new();
        Parser::new("struct pt { int x; int y; };", &mut reg, BitfieldPolicy::default())
            .parse_all()
            .expect("parse failed");

        let mut p = Parser::new("struct pt*", &mut reg, BitfieldPolicy::default());
        let ct = p.parse_type_spec().expect("spec");
        assert_eq!(ct.kind, TypeKind::Struct);
        assert_eq!(ct.pointers, 1);

        let mut p = Parser::new("int[8]", &mut reg, BitfieldPolicy::default());
        let ct = p.parse_type_spec().expect("spec");
        assert!(ct.is_array);
        assert_eq!(ct.byte_size(&reg.arena), Some(32));
    }
}
