//! Runtime code generation for the call path. A C signature is
//! classified into a [`CallPlan`], the plan is lowered to a few dozen
//! bytes by the architecture backend ([`CodeEmitter`]), and the result
//! is installed in executable memory. Call stubs are shared per
//! signature; callback trampolines are compiled per closure because the
//! closure address is baked in.

pub mod emit;
pub mod pages;
pub mod x64;

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic;
use std::ptr;

use parking_lot::Mutex;

use crate::error::JitError;
use crate::marshal;
use crate::types::{CType, InfoId, TypeArena};
use crate::value::Value;

pub use emit::{ArgSlot, CallPlan, CodeEmitter, RetPlan, X64Emitter, classify_call};
pub use pages::{CodeHeap, TransientCode};

/// Entry point of a compiled call stub. `words` is the marshaled
/// argument frame, `ret` a 16-byte buffer for the raw return registers,
/// `target` the C function to call.
pub type CallStub = unsafe extern "C" fn(*const u64, *mut u64, usize);

pub struct Jit {
    emitter: X64Emitter,
    heap: CodeHeap,
    stubs: Mutex<HashMap<InfoId, CallStub>>,
}

impl Jit {
    pub fn new() -> Jit {
        Jit {
            emitter: X64Emitter,
            heap: CodeHeap::new(),
            stubs: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the stub for an interned signature, compiling and caching
    /// it on first use.
    pub fn call_stub(&self, signature: InfoId, plan: &CallPlan) -> Result<CallStub, JitError> {
        let mut stubs = self.stubs.lock();
        if let Some(stub) = stubs.get(&signature) {
            return Ok(*stub);
        }

        let code = self.emitter.call_stub(plan);
        let entry = self.heap.install(&code)?;
        let stub = unsafe { std::mem::transmute::<*mut u8, CallStub>(entry.as_ptr()) };
        stubs.insert(signature, stub);
        log::debug!(
            "compiled call stub {:?} ({} frame words)",
            signature,
            plan.frame_words
        );
        Ok(stub)
    }

    /// Builds a one-shot stub for a variadic call. The promoted trailing
    /// arguments only exist at the call site, so the code is mapped for
    /// the duration of the call instead of entering the shared cache.
    pub fn variadic_stub(&self, plan: &CallPlan) -> Result<(TransientCode, CallStub), JitError> {
        let code = TransientCode::new(&self.emitter.call_stub(plan))?;
        let stub = unsafe { std::mem::transmute::<*const u8, CallStub>(code.entry()) };
        Ok((code, stub))
    }
}

impl Default for Jit {
    fn default() -> Self {
        Jit::new()
    }
}

/// State shared between a callback trampoline and [`callback_enter`].
/// The trampoline bakes the box address in, so the cell must never move
/// while the closure is alive.
struct ClosureCell {
    func: RefCell<Box<dyn FnMut(&[Value]) -> Value>>,
    params: Vec<CType>,
    ret: CType,
    plan: CallPlan,
    arena: TypeArena,
}

/// A host function exposed to C through a compiled trampoline. Dropping
/// the closure unmaps the trampoline; the owner must keep it alive for
/// as long as foreign code can call the pointer.
pub struct Closure {
    cell: Box<ClosureCell>,
    code: TransientCode,
}

impl Closure {
    /// Compiles a trampoline for a function type descriptor.
    pub fn compile(
        ctype: CType,
        arena: &TypeArena,
        func: Box<dyn FnMut(&[Value]) -> Value>,
    ) -> Result<Closure, JitError> {
        if ctype.has_var_arg {
            return Err(JitError::VariadicCallback);
        }
        let info = match ctype.info {
            Some(id) => arena.func(id),
            None => unreachable!("function type without signature info"),
        };

        let params: Vec<CType> = info.params.iter().map(|p| p.ctype).collect();
        let plan = classify_call(&info.ret, &params, false, arena)?;

        let cell = Box::new(ClosureCell {
            func: RefCell::new(func),
            params,
            ret: info.ret,
            plan,
            arena: arena.clone(),
        });
        let code = X64Emitter.callback(
            &cell.plan,
            &*cell as *const ClosureCell as usize,
            callback_enter as usize,
        );
        let code = TransientCode::new(&code)?;

        log::debug!("compiled callback trampoline at {:p}", code.entry());
        Ok(Closure { cell, code })
    }

    /// Address native code calls.
    pub fn entry(&self) -> *const u8 {
        self.code.entry()
    }
}

impl std::fmt::Debug for Closure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closure")
            .field("entry", &self.code.entry())
            .field("params", &self.cell.params.len())
            .finish()
    }
}

/// Called by every trampoline with the gathered argument words. Panics
/// and conversion failures must not unwind into the foreign frame; they
/// are logged and the callback returns zero.
unsafe extern "C" fn callback_enter(cell: *const ClosureCell, words: *const u64, ret: *mut u64) {
    unsafe { ptr::write_bytes(ret, 0, 2) };

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let cell = unsafe { &*cell };
        let mut args = Vec::with_capacity(cell.params.len());
        for (ct, slot) in cell.params.iter().zip(&cell.plan.arg_slots) {
            let word = unsafe { words.add(slot.word as usize) };
            args.push(unsafe { marshal::callback_arg(ct, word, &cell.arena) });
        }

        let value = (cell.func.borrow_mut())(&args);
        unsafe { marshal::callback_ret(&cell.ret, &cell.plan, &value, words, ret, &cell.arena) }
    }));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::error!("callback return value discarded: {err}"),
        Err(_) => log::error!("callback panicked; returning zero to the caller"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{BitfieldPolicy, Parser};
    use crate::registry::Registry;
    use crate::types::TypeKind;
    use std::ffi::{CString, c_char, c_int};

    extern "C" fn add3(a: i64, b: i64, c: i64) -> i64 {
        a + b + c
    }

    extern "C" fn scale(a: f64, n: i64) -> f64 {
        a * n as f64
    }

    #[repr(C)]
    #[derive(Debug, PartialEq)]
    struct Pair {
        a: i64,
        b: i64,
    }

    extern "C" fn pair_swap(p: Pair) -> Pair {
        Pair { a: p.b, b: p.a }
    }

    #[repr(C)]
    struct Triple {
        v: [i64; 3],
    }

    extern "C" fn triple_fill(x: i64) -> Triple {
        Triple { v: [x, x + 1, x + 2] }
    }

    unsafe extern "C" {
        fn snprintf(buf: *mut c_char, n: usize, fmt: *const c_char, ...) -> c_int;
    }

    fn parse(src: &str) -> Registry {
        let mut reg = Registry::new();
        Parser::new(src, &mut reg, BitfieldPolicy::default())
            .parse_all()
            .expect("parse failed");
        reg
    }

    fn i64_t() -> CType {
        CType::scalar(TypeKind::I64)
    }

    #[test]
    fn stub_calls_an_integer_function() {
        let arena = TypeArena::new();
        let plan = classify_call(&i64_t(), &[i64_t(), i64_t(), i64_t()], false, &arena)
            .expect("plan");
        let jit = Jit::new();
        let stub = jit.call_stub(InfoId(1), &plan).expect("stub");

        let words = [5u64, 30, 7];
        let mut ret = [0u64; 2];
        unsafe { stub(words.as_ptr(), ret.as_mut_ptr(), add3 as usize) };
        assert_eq!(ret[0] as i64, 42);
    }

    #[test]
    fn stub_routes_floats_through_sse() {
        let arena = TypeArena::new();
        let dbl = CType::scalar(TypeKind::Double);
        let plan = classify_call(&dbl, &[dbl, i64_t()], false, &arena).expect("plan");
        let jit = Jit::new();
        let stub = jit.call_stub(InfoId(2), &plan).expect("stub");

        let words = [3.5f64.to_bits(), 4];
        let mut ret = [0u64; 2];
        unsafe { stub(words.as_ptr(), ret.as_mut_ptr(), scale as usize) };
        assert_eq!(f64::from_bits(ret[0]), 14.0);
    }

    #[test]
    fn stub_passes_and_returns_small_records() {
        let reg = parse("struct pair { long a; long b; };");
        let pair = reg.type_named("pair").expect("type");
        let plan = classify_call(&pair, &[pair], false, &reg.arena).expect("plan");
        assert_eq!(plan.ret, RetPlan::GpPair);

        let jit = Jit::new();
        let stub = jit.call_stub(InfoId(3), &plan).expect("stub");
        let words = [11u64, 22];
        let mut ret = [0u64; 2];
        unsafe { stub(words.as_ptr(), ret.as_mut_ptr(), pair_swap as usize) };
        assert_eq!(ret[0], 22);
        assert_eq!(ret[1], 11);
    }

    #[test]
    fn stub_returns_large_records_through_hidden_pointer() {
        let reg = parse("struct triple { long v[3]; };");
        let triple = reg.type_named("triple").expect("type");
        let plan = classify_call(&triple, &[i64_t()], false, &reg.arena).expect("plan");
        assert_eq!(plan.ret, RetPlan::Memory);

        let jit = Jit::new();
        let stub = jit.call_stub(InfoId(4), &plan).expect("stub");

        let mut out = [0i64; 3];
        let words = [out.as_mut_ptr() as u64, 9];
        let mut ret = [0u64; 2];
        unsafe { stub(words.as_ptr(), ret.as_mut_ptr(), triple_fill as usize) };
        assert_eq!(out, [9, 10, 11]);
    }

    #[test]
    fn stubs_are_cached_per_signature() {
        let arena = TypeArena::new();
        let plan = classify_call(&i64_t(), &[i64_t()], false, &arena).expect("plan");
        let jit = Jit::new();

        let first = jit.call_stub(InfoId(9), &plan).expect("stub");
        let second = jit.call_stub(InfoId(9), &plan).expect("stub");
        assert_eq!(first as usize, second as usize);
    }

    #[test]
    fn variadic_stub_sets_the_sse_count() {
        let mut pchar = CType::scalar(TypeKind::I8);
        pchar.pointers = 1;
        let args = [
            pchar,
            CType::scalar(TypeKind::U64),
            pchar,
            CType::scalar(TypeKind::Double),
        ];
        let arena = TypeArena::new();
        let plan = classify_call(&CType::scalar(TypeKind::I32), &args, true, &arena)
            .expect("plan");

        let jit = Jit::new();
        let (code, stub) = jit.variadic_stub(&plan).expect("stub");
        let fmt = CString::new("%.1f").expect("fmt");
        let mut buf = [0u8; 32];
        let words = [
            buf.as_mut_ptr() as u64,
            buf.len() as u64,
            fmt.as_ptr() as u64,
            3.5f64.to_bits(),
        ];
        let mut ret = [0u64; 2];
        unsafe { stub(words.as_ptr(), ret.as_mut_ptr(), snprintf as usize) };
        drop(code);

        assert_eq!(ret[0] as i32, 3);
        assert_eq!(&buf[..4], b"3.5\0");
    }

    #[test]
    fn closures_are_callable_from_native_code() {
        let reg = parse("typedef int (*adder)(int, int);");
        let ct = reg.type_named("adder").expect("type");

        let closure = Closure::compile(
            ct,
            &reg.arena,
            Box::new(|args| {
                let a = match args[0] {
                    Value::Int(v) => v,
                    _ => 0,
                };
                let b = match args[1] {
                    Value::Int(v) => v,
                    _ => 0,
                };
                Value::Int(a + b)
            }),
        )
        .expect("closure");

        let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(closure.entry()) };
        assert_eq!(f(2, 40), 42);
        assert_eq!(f(-5, 5), 0);
    }

    #[test]
    fn closures_return_floats() {
        let reg = parse("typedef double (*doubler)(double);");
        let ct = reg.type_named("doubler").expect("type");

        let closure = Closure::compile(
            ct,
            &reg.arena,
            Box::new(|args| {
                let x = match args[0] {
                    Value::Float(v) => v,
                    _ => 0.0,
                };
                Value::Float(x * 2.0)
            }),
        )
        .expect("closure");

        let f: extern "C" fn(f64) -> f64 = unsafe { std::mem::transmute(closure.entry()) };
        assert_eq!(f(1.25), 2.5);
    }

    #[test]
    fn variadic_callbacks_are_rejected() {
        let reg = parse("typedef int (*vcb)(int, ...);");
        let ct = reg.type_named("vcb").expect("type");

        let err = Closure::compile(ct, &reg.arena, Box::new(|_| Value::Nil))
            .expect_err("must fail");
        assert_eq!(err, JitError::VariadicCallback);
    }
}
