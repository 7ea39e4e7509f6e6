mod consteval;
mod error;
mod jit;
mod lexer;
mod library;
mod marshal;
mod parser;
mod registry;
mod types;
mod value;

pub use error::{Error, JitError, LibraryError, MarshalError, ParseError};
pub use jit::Closure;
pub use library::Namespace;
pub use marshal::{ArithOp, TypeHooks};
pub use parser::BitfieldPolicy;
pub use registry::Registry;
pub use types::{
    CType, EnumInfo, FuncInfo, InfoId, Member, Param, RecordInfo, TypeArena, TypeInfo, TypeKind,
};
pub use value::{CData, Finalizer, Value};

use std::collections::HashMap;
use std::ptr;
use std::rc::Rc;

use crate::jit::Jit;
use crate::parser::Parser;

/// A declared function resolved to its address in a loaded library. The
/// namespace handle keeps the library mapped for as long as the binding
/// exists.
pub struct BoundFn {
    name: String,
    ctype: CType,
    addr: usize,
    #[allow(dead_code)]
    namespace: Rc<Namespace>,
}

impl BoundFn {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for BoundFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BoundFn({} @ {:#x})", self.name, self.addr)
    }
}

/// The foreign-function context: declaration registry, compiled stub
/// cache, loaded libraries, per-type hooks, and the errno slot. Every
/// host-facing operation goes through one of these; two contexts never
/// share state.
pub struct Ffi {
    registry: Registry,
    policy: BitfieldPolicy,
    jit: Jit,
    hooks: HashMap<InfoId, TypeHooks>,
    libraries: Vec<Rc<Namespace>>,
    process: Option<Rc<Namespace>>,
    errno: i32,
}

impl Ffi {
    pub fn new() -> Ffi {
        Ffi::with_policy(BitfieldPolicy::default())
    }

    pub fn with_policy(policy: BitfieldPolicy) -> Ffi {
        Ffi {
            registry: Registry::new(),
            policy,
            jit: Jit::new(),
            hooks: HashMap::new(),
            libraries: Vec::new(),
            process: None,
            errno: 0,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Parses and registers a string of C declarations. The call is
    /// atomic: on any parse error nothing is registered.
    pub fn define(&mut self, decls: &str) -> Result<(), Error> {
        let saved = self.registry.clone();
        let result = Parser::new(decls, &mut self.registry, self.policy).parse_all();
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.registry = saved;
                Err(e.into())
            }
        }
    }

    /// Parses a single type spec such as `struct point*` or `int[4]`.
    fn parse_type(&mut self, spec: &str) -> Result<CType, Error> {
        let mut parser = Parser::new(spec, &mut self.registry, self.policy);
        let ct = parser.parse_type_spec()?;
        parser.expect_end()?;
        Ok(ct)
    }

    /// Unchecked conversion in the C cast sense.
    pub fn cast(&mut self, spec: &str, v: &Value) -> Result<CData, Error> {
        let ct = self.parse_type(spec)?;
        Ok(marshal::cast(&ct, v, &self.registry.arena)?)
    }

    pub fn sizeof(&mut self, spec: &str) -> Result<usize, Error> {
        let ct = self.parse_type(spec)?;
        match ct.byte_size(&self.registry.arena) {
            Some(n) => Ok(n),
            None => Err(self.size_error(&ct).into()),
        }
    }

    /// Size of a concrete value; variable-length instances report the
    /// size they were allocated with.
    pub fn sizeof_value(&self, cd: &CData) -> usize {
        cd.ctype.byte_size(&self.registry.arena).unwrap_or(cd.len())
    }

    fn size_error(&self, ct: &CType) -> MarshalError {
        let arena = &self.registry.arena;
        if ct.is_variable_array || ct.is_variable_struct {
            MarshalError::VariableInstance {
                type_name: ct.name(arena).to_string(),
            }
        } else if ct.kind == TypeKind::Void {
            MarshalError::VoidInstance
        } else {
            MarshalError::UndefinedInstance {
                type_name: ct.name(arena).to_string(),
            }
        }
    }

    pub fn alignof(&mut self, spec: &str) -> Result<usize, Error> {
        let ct = self.parse_type(spec)?;
        Ok(ct.align_mask(&self.registry.arena) + 1)
    }

    /// Byte offset of a (possibly nested) member of a record type.
    pub fn offsetof(&mut self, spec: &str, member: &str) -> Result<usize, Error> {
        let ct = self.parse_type(spec)?;
        let arena = &self.registry.arena;
        let not_record = || MarshalError::NotIndexable {
            type_name: ct.name(arena).to_string(),
        };
        if !ct.kind.is_record() || ct.ptr_depth() > 0 || ct.is_array {
            return Err(not_record().into());
        }
        let id = match ct.info {
            Some(id) => id,
            None => return Err(not_record().into()),
        };
        let (_, off) = arena.record(id).find(arena, member).ok_or_else(|| {
            MarshalError::UnknownMember {
                type_name: ct.name(arena).to_string(),
                member: member.to_string(),
            }
        })?;
        Ok(off)
    }

    /// Nominal type test for a host value.
    pub fn istype(&mut self, spec: &str, v: &Value) -> Result<bool, Error> {
        let ct = self.parse_type(spec)?;
        Ok(marshal::istype(&ct, v))
    }

    /// Loads a dynamic library; the handle can be shared freely.
    pub fn open(&mut self, name: &str) -> Result<Rc<Namespace>, Error> {
        let ns = Rc::new(Namespace::open(name)?);
        self.libraries.push(Rc::clone(&ns));
        Ok(ns)
    }

    /// Namespace of the whole process, including everything already
    /// linked in.
    pub fn global(&mut self) -> Rc<Namespace> {
        if let Some(ns) = &self.process {
            return Rc::clone(ns);
        }
        let ns = Rc::new(Namespace::global());
        self.process = Some(Rc::clone(&ns));
        ns
    }

    /// Resolves a previously declared function inside a namespace.
    pub fn get(&mut self, ns: &Rc<Namespace>, name: &str) -> Result<BoundFn, Error> {
        let ctype = self.registry.function_named(name).ok_or_else(|| {
            LibraryError::MissingDeclaration {
                name: name.to_string(),
            }
        })?;
        let id = match ctype.info {
            Some(id) => id,
            None => unreachable!("function registered without signature info"),
        };
        let arena = &self.registry.arena;
        let bytes = library::decoration_bytes(&arena.func(id).params, arena);
        let addr = ns.address(name, ctype.conv, bytes)?;
        Ok(BoundFn {
            name: name.to_string(),
            ctype,
            addr,
            namespace: Rc::clone(ns),
        })
    }

    /// Calls a bound function with marshaled arguments.
    pub fn call(&mut self, f: &BoundFn, args: &[Value]) -> Result<Value, Error> {
        log::trace!("calling {} at {:#x}", f.name, f.addr);
        self.call_addr(&f.ctype, f.addr, args)
    }

    /// Calls a callable host value: a function-pointer cdata, or any
    /// cdata whose type carries a call hook.
    pub fn call_value(&mut self, target: &Value, args: &[Value]) -> Result<Value, Error> {
        let Value::CData(cd) = target else {
            return Err(MarshalError::NotCallable {
                type_name: target.kind_name().to_string(),
            }
            .into());
        };

        if let Some(h) = self.record_hooks(cd).and_then(|h| h.call.as_ref()) {
            if let Some(out) = h(cd, args) {
                return Ok(out);
            }
        }

        if cd.ctype.kind == TypeKind::Func {
            let addr = unsafe { (cd.value_ptr() as *const usize).read_unaligned() };
            if addr == 0 {
                return Err(MarshalError::NullPointer.into());
            }
            let ctype = cd.ctype;
            return self.call_addr(&ctype, addr, args);
        }

        Err(MarshalError::NotCallable {
            type_name: cd.ctype.name(&self.registry.arena).to_string(),
        }
        .into())
    }

    fn call_addr(&mut self, ctype: &CType, addr: usize, args: &[Value]) -> Result<Value, Error> {
        let id = match ctype.info {
            Some(id) => id,
            None => unreachable!("call through a type without signature info"),
        };
        let variadic = ctype.has_var_arg;

        let (mut arg_types, ret_ct) = {
            let info = self.registry.arena.func(id);
            let fixed: Vec<CType> = info.params.iter().map(|p| p.ctype).collect();
            (fixed, info.ret)
        };
        let fixed = arg_types.len();

        if args.len() < fixed || (!variadic && args.len() > fixed) {
            return Err(MarshalError::ArgCount {
                expected: fixed,
                given: args.len(),
                variadic,
            }
            .into());
        }

        let arena = &self.registry.arena;
        let plan;
        let stub;
        let _transient;
        if variadic {
            for v in &args[fixed..] {
                arg_types.push(marshal::promote_vararg(v, arena)?);
            }
            plan = jit::classify_call(&ret_ct, &arg_types, true, arena)?;
            let (code, entry) = self.jit.variadic_stub(&plan)?;
            stub = entry;
            _transient = Some(code);
        } else {
            plan = jit::classify_call(&ret_ct, &arg_types, false, arena)?;
            stub = self.jit.call_stub(id, &plan)?;
            _transient = None;
        }

        let mut frame = marshal::build_frame(&plan, &ret_ct, &arg_types, args, arena)?;
        let mut raw = [0u64; 2];
        unsafe { stub(frame.words.as_ptr(), raw.as_mut_ptr(), addr) };
        // capture before anything else can touch libc
        self.errno = library::read_errno();

        Ok(marshal::read_ret(&ret_ct, &plan, &raw, frame.ret.take(), arena))
    }

    /// Compiles a host function into native code callable from C. The
    /// spec must name a non-variadic function type.
    pub fn closure(
        &mut self,
        spec: &str,
        func: Box<dyn FnMut(&[Value]) -> Value>,
    ) -> Result<CData, Error> {
        let ct = self.parse_type(spec)?;
        if ct.kind != TypeKind::Func {
            return Err(MarshalError::NotCallable {
                type_name: ct.name(&self.registry.arena).to_string(),
            }
            .into());
        }
        let closure = Closure::compile(ct, &self.registry.arena, func)?;
        let mut handle = ct;
        if handle.pointers == 0 {
            handle.pointers = 1;
        }
        Ok(CData::from_closure(handle, Rc::new(closure)))
    }

    /// Reads bytes behind a string-ish value, up to `len` or the first
    /// NUL. Non-UTF-8 bytes are replaced.
    pub fn to_string(&self, v: &Value, len: Option<usize>) -> Result<String, Error> {
        let bytes = marshal::to_string_bytes(v, len, &self.registry.arena)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// memcpy with host-value endpoints. A string source without an
    /// explicit length copies its bytes plus the terminating NUL.
    pub fn copy(&mut self, dst: &Value, src: &Value, len: Option<usize>) -> Result<usize, Error> {
        let to = marshal::address_for_copy(dst)?;
        if to.is_null() {
            return Err(MarshalError::NullPointer.into());
        }

        let n = match src {
            Value::Str(s) => {
                let bytes = s.as_bytes();
                let n = len.unwrap_or(bytes.len() + 1);
                for i in 0..n {
                    let b = bytes.get(i).copied().unwrap_or(0);
                    unsafe { to.add(i).write(b) };
                }
                n
            }
            _ => {
                let from = marshal::address_for_copy(src)?;
                if from.is_null() {
                    return Err(MarshalError::NullPointer.into());
                }
                let n = len.ok_or_else(|| MarshalError::Convert {
                    index: None,
                    from: src.kind_name().to_string(),
                    to: "a sized copy".to_string(),
                })?;
                unsafe { ptr::copy_nonoverlapping(from, to, n) };
                n
            }
        };
        Ok(n)
    }

    /// memset with a host-value destination; the fill byte defaults to 0.
    pub fn fill(&mut self, dst: &Value, len: usize, byte: Option<u8>) -> Result<(), Error> {
        let to = marshal::address_for_copy(dst)?;
        if to.is_null() {
            return Err(MarshalError::NullPointer.into());
        }
        unsafe { ptr::write_bytes(to, byte.unwrap_or(0), len) };
        Ok(())
    }

    /// Errno as captured after the most recent native call. Passing a
    /// value stores it as the thread's errno and returns the previous
    /// captured value.
    pub fn errno(&mut self, set: Option<i32>) -> i32 {
        let prev = self.errno;
        if let Some(v) = set {
            library::write_errno(v);
            self.errno = v;
        }
        prev
    }

    /// Runs `hook` when the last handle to the value's allocation drops.
    pub fn register_finalizer(&self, cd: &CData, hook: Finalizer) {
        cd.on_drop(hook);
    }

    /// Installs per-type behavior overrides for a struct or union type.
    pub fn set_type_hooks(&mut self, spec: &str, hooks: TypeHooks) -> Result<(), Error> {
        let ct = self.parse_type(spec)?;
        let id = match ct.info {
            Some(id) if ct.kind.is_record() => id,
            _ => {
                return Err(MarshalError::Convert {
                    index: None,
                    from: ct.name(&self.registry.arena).to_string(),
                    to: "a struct or union".to_string(),
                }
                .into());
            }
        };
        self.hooks.insert(id, hooks);
        Ok(())
    }

    fn record_hooks(&self, cd: &CData) -> Option<&TypeHooks> {
        if !cd.ctype.kind.is_record() {
            return None;
        }
        self.hooks.get(&cd.ctype.info?)
    }

    /// Member or element read, with the type's index hook consulted
    /// first.
    pub fn index(&self, v: &Value, key: &Value) -> Result<Value, Error> {
        let Value::CData(cd) = v else {
            return Err(MarshalError::NotIndexable {
                type_name: v.kind_name().to_string(),
            }
            .into());
        };
        if let Some(h) = self.record_hooks(cd).and_then(|h| h.index.as_ref()) {
            if let Some(out) = h(cd, key) {
                return Ok(out);
            }
        }
        Ok(marshal::index(cd, key, &self.registry.arena)?)
    }

    /// Member or element write, with the type's newindex hook consulted
    /// first.
    pub fn newindex(&self, v: &Value, key: &Value, val: &Value) -> Result<(), Error> {
        let Value::CData(cd) = v else {
            return Err(MarshalError::NotIndexable {
                type_name: v.kind_name().to_string(),
            }
            .into());
        };
        if let Some(h) = self.record_hooks(cd).and_then(|h| h.newindex.as_ref()) {
            if h(cd, key, val) {
                return Ok(());
            }
        }
        Ok(marshal::newindex(cd, key, val, &self.registry.arena)?)
    }

    /// Arithmetic or comparison on host values with cdata semantics.
    /// Either operand's arith hook may take over.
    pub fn arith(&self, op: ArithOp, a: &Value, b: Option<&Value>) -> Result<Value, Error> {
        for side in [Some(a), b] {
            if let Some(Value::CData(cd)) = side {
                if let Some(h) = self.record_hooks(cd).and_then(|h| h.arith.as_ref()) {
                    if let Some(out) = h(op, a, b) {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(marshal::arith(op, a, b, &self.registry.arena)?)
    }

    /// Evaluates a C constant expression against the registered
    /// declarations (enumerators, `static const` values, `sizeof`).
    pub fn eval(&mut self, expr: &str) -> Result<i64, Error> {
        let mut parser = Parser::new(expr, &mut self.registry, self.policy);
        let v = parser.const_expr()?;
        parser.expect_end()?;
        Ok(v)
    }

    /// The NULL pointer constant as a `void*` cdata.
    pub fn null(&self) -> Value {
        let mut ct = CType::scalar(TypeKind::Void);
        ct.pointers = 1;
        Value::CData(CData::from_ptr(ct, ptr::null_mut()))
    }
}

/// The `new` operation of the host surface. It hangs off a trait rather
/// than `impl Ffi` because `Ffi::new()` is the context constructor and
/// Rust rejects two inherent items with the same name; method-call syntax
/// (`ffi.new(...)`) still resolves here with the trait in scope.
pub trait Construct {
    /// Allocates a zero-initialized value of the given type, applying the
    /// initializer when present.
    fn new(&mut self, spec: &str, init: Option<&Value>) -> Result<CData, Error>;
}

impl Construct for Ffi {
    fn new(&mut self, spec: &str, init: Option<&Value>) -> Result<CData, Error> {
        let ct = self.parse_type(spec)?;
        Ok(marshal::construct(&ct, init, &self.registry.arena)?)
    }
}

impl Default for Ffi {
    fn default() -> Self {
        Ffi::new()
    }
}
