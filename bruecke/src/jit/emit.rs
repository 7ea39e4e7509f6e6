//! System V AMD64 call planning and stub emission. Classification is a
//! pure function from a signature to a [`CallPlan`], so the register
//! assignment rules can be tested without executing anything; the
//! emitters turn a plan into straight-line machine code.
//!
//! A call stub has the shape `extern "C" fn(words: *const u64, ret: *mut
//! u64, target: usize)`: the host marshals every argument into
//! consecutive 8-byte frame words, the stub scatters them into registers
//! and outgoing stack, calls `target`, and stores the raw return
//! registers into `ret`. The target arriving as a plain argument keeps
//! the code position-independent, so one stub serves every function that
//! shares a signature.

use crate::error::JitError;
use crate::types::{CType, RecordInfo, TypeArena, TypeKind};

use super::x64::{Asm, Reg, Xmm};

pub const GP_ARGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
pub const SSE_ARGS: [Xmm; 8] = [
    Xmm::Xmm0,
    Xmm::Xmm1,
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
];

/// Class of one eightbyte of an argument or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordClass {
    Integer,
    Sse,
}

/// Where the return registers land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetPlan {
    Void,
    /// rax.
    Gp,
    /// rax, rdx.
    GpPair,
    /// xmm0.
    Sse,
    /// xmm0, xmm1.
    SsePair,
    /// rax, xmm0.
    GpSse,
    /// xmm0, rax.
    SseGp,
    /// Written by the callee through a hidden pointer in frame word 0.
    Memory,
}

/// Frame words occupied by one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSlot {
    pub word: u16,
    pub words: u16,
}

#[derive(Debug, Clone)]
pub struct CallPlan {
    /// Total marshal frame size in 8-byte words.
    pub frame_words: u16,
    /// Frame word of each argument, in declaration order.
    pub arg_slots: Vec<ArgSlot>,
    pub gp_loads: Vec<(Reg, u16)>,
    pub sse_loads: Vec<(Xmm, u16)>,
    /// Frame words copied to the outgoing stack, in pushing order.
    pub stack_words: Vec<u16>,
    pub ret: RetPlan,
    /// Words the host reads back out of the return buffer.
    pub ret_words: u16,
    /// Set al to the SSE register count before the call.
    pub variadic: bool,
}

enum TypeClass {
    Integer,
    Sse,
    Aggregate(Vec<WordClass>),
    Memory(u16),
}

/// Assigns registers, stack and frame words for a concrete signature.
pub fn classify_call(
    ret: &CType,
    args: &[CType],
    variadic: bool,
    arena: &TypeArena,
) -> Result<CallPlan, JitError> {
    let mut plan = CallPlan {
        frame_words: 0,
        arg_slots: Vec::with_capacity(args.len()),
        gp_loads: Vec::new(),
        sse_loads: Vec::new(),
        stack_words: Vec::new(),
        ret: RetPlan::Void,
        ret_words: 0,
        variadic,
    };

    let mut gp = 0usize;
    let mut sse = 0usize;
    let mut word = 0u16;

    plan.ret = classify_ret(ret, arena)?;
    plan.ret_words = match plan.ret {
        RetPlan::Void | RetPlan::Memory => 0,
        RetPlan::Gp | RetPlan::Sse => 1,
        _ => 2,
    };
    if plan.ret == RetPlan::Memory {
        // Frame word 0 carries the result buffer address.
        plan.gp_loads.push((GP_ARGS[0], 0));
        gp = 1;
        word = 1;
    }

    for (index, at) in args.iter().enumerate() {
        let cls = classify_type(at, arena).ok_or_else(|| JitError::UnsupportedArgument {
            index,
            type_name: at.name(arena).to_string(),
        })?;

        let slot = word;
        match cls {
            TypeClass::Integer => {
                word += 1;
                if gp < GP_ARGS.len() {
                    plan.gp_loads.push((GP_ARGS[gp], slot));
                    gp += 1;
                } else {
                    plan.stack_words.push(slot);
                }
            }
            TypeClass::Sse => {
                word += 1;
                if sse < SSE_ARGS.len() {
                    plan.sse_loads.push((SSE_ARGS[sse], slot));
                    sse += 1;
                } else {
                    plan.stack_words.push(slot);
                }
            }
            TypeClass::Aggregate(classes) => {
                word += classes.len() as u16;
                let need_gp = classes.iter().filter(|c| **c == WordClass::Integer).count();
                let need_sse = classes.len() - need_gp;

                // Either every eightbyte gets a register or the whole
                // aggregate goes to the stack.
                if gp + need_gp <= GP_ARGS.len() && sse + need_sse <= SSE_ARGS.len() {
                    for (k, class) in classes.iter().enumerate() {
                        match class {
                            WordClass::Integer => {
                                plan.gp_loads.push((GP_ARGS[gp], slot + k as u16));
                                gp += 1;
                            }
                            WordClass::Sse => {
                                plan.sse_loads.push((SSE_ARGS[sse], slot + k as u16));
                                sse += 1;
                            }
                        }
                    }
                } else {
                    for k in 0..classes.len() as u16 {
                        plan.stack_words.push(slot + k);
                    }
                }
            }
            TypeClass::Memory(words) => {
                word += words;
                for k in 0..words {
                    plan.stack_words.push(slot + k);
                }
            }
        }

        plan.arg_slots.push(ArgSlot {
            word: slot,
            words: word - slot,
        });
    }

    plan.frame_words = word;
    Ok(plan)
}

fn classify_ret(ret: &CType, arena: &TypeArena) -> Result<RetPlan, JitError> {
    if ret.kind == TypeKind::Void && !ret.is_pointer() {
        return Ok(RetPlan::Void);
    }

    let unsupported = || JitError::UnsupportedReturn {
        type_name: ret.name(arena).to_string(),
    };

    match classify_type(ret, arena).ok_or_else(unsupported)? {
        TypeClass::Integer => Ok(RetPlan::Gp),
        TypeClass::Sse => Ok(RetPlan::Sse),
        TypeClass::Memory(_) => Ok(RetPlan::Memory),
        TypeClass::Aggregate(classes) => match classes.as_slice() {
            [WordClass::Integer] => Ok(RetPlan::Gp),
            [WordClass::Sse] => Ok(RetPlan::Sse),
            [WordClass::Integer, WordClass::Integer] => Ok(RetPlan::GpPair),
            [WordClass::Sse, WordClass::Sse] => Ok(RetPlan::SsePair),
            [WordClass::Integer, WordClass::Sse] => Ok(RetPlan::GpSse),
            [WordClass::Sse, WordClass::Integer] => Ok(RetPlan::SseGp),
            _ => Err(unsupported()),
        },
    }
}

fn classify_type(ct: &CType, arena: &TypeArena) -> Option<TypeClass> {
    if ct.is_pointer() {
        return Some(TypeClass::Integer);
    }
    match ct.kind {
        TypeKind::Void => None,
        TypeKind::Float | TypeKind::Double => Some(TypeClass::Sse),
        TypeKind::Struct | TypeKind::Union => {
            let rec = arena.record(ct.info?);
            if !rec.defined || rec.variable_increment != 0 {
                return None;
            }
            if rec.size > 16 {
                return Some(TypeClass::Memory(rec.size.div_ceil(8) as u16));
            }
            match classify_record_words(rec, arena) {
                Some(classes) => Some(TypeClass::Aggregate(classes)),
                None => Some(TypeClass::Memory(rec.size.div_ceil(8) as u16)),
            }
        }
        _ => Some(TypeClass::Integer),
    }
}

/// Per-eightbyte classes of a small record, `None` when a misaligned
/// member forces the memory class.
fn classify_record_words(rec: &RecordInfo, arena: &TypeArena) -> Option<Vec<WordClass>> {
    let words = rec.size.div_ceil(8);
    let mut classes: Vec<Option<WordClass>> = vec![None; words];

    if !merge_record(rec, 0, &mut classes, arena) {
        return None;
    }

    // Padding-only eightbytes take the SSE class.
    Some(
        classes
            .into_iter()
            .map(|c| c.unwrap_or(WordClass::Sse))
            .collect(),
    )
}

fn merge_record(
    rec: &RecordInfo,
    base: usize,
    classes: &mut [Option<WordClass>],
    arena: &TypeArena,
) -> bool {
    for m in &rec.members {
        let at = base + m.offset;
        let ct = &m.ctype;

        if ct.is_bitfield {
            let unit = ct.kind.size();
            if at % unit != 0 {
                return false;
            }
            // Packed placement can let the run spill past the unit.
            let bits = ct.bit_offset as usize + ct.bit_size as usize;
            let span = unit.max(bits.div_ceil(8));
            merge_span(classes, at, span, WordClass::Integer);
            continue;
        }

        if ct.kind.is_record() && ct.ptr_depth() == 0 {
            let Some(id) = ct.info else { return false };
            let inner = arena.record(id);
            for i in 0..ct.array_len() {
                if !merge_record(inner, at + i * inner.size, classes, arena) {
                    return false;
                }
            }
            continue;
        }

        let elem = ct.element_size(arena);
        let class = if ct.is_pointer() || !ct.kind.is_float() {
            WordClass::Integer
        } else {
            WordClass::Sse
        };
        for i in 0..ct.array_len() {
            let offset = at + i * elem;
            if offset % elem != 0 {
                return false;
            }
            merge_span(classes, offset, elem, class);
        }
    }
    true
}

fn merge_span(classes: &mut [Option<WordClass>], offset: usize, size: usize, class: WordClass) {
    for idx in offset / 8..=(offset + size - 1) / 8 {
        classes[idx] = Some(match (classes[idx], class) {
            (Some(WordClass::Integer), _) | (_, WordClass::Integer) => WordClass::Integer,
            _ => WordClass::Sse,
        });
    }
}

fn stack_bytes(plan: &CallPlan) -> i32 {
    (plan.stack_words.len() * 8).next_multiple_of(16) as i32
}

/// Emits the call stub for `plan`.
fn emit_call_stub(plan: &CallPlan) -> Vec<u8> {
    let mut asm = Asm::new();

    // Incoming: rdi = frame words, rsi = return buffer, rdx = target.
    // The target moves to r11 before the argument registers are loaded.
    asm.push(Reg::Rbx);
    asm.mov_rr(Reg::Rbx, Reg::Rsi);
    asm.mov_rr(Reg::R10, Reg::Rdi);
    asm.mov_rr(Reg::R11, Reg::Rdx);

    let stack = stack_bytes(plan);
    if stack > 0 {
        asm.sub_ri(Reg::Rsp, stack);
    }
    for (k, &w) in plan.stack_words.iter().enumerate() {
        asm.mov_r_m(Reg::Rax, Reg::R10, w as i32 * 8);
        asm.mov_m_r(Reg::Rsp, k as i32 * 8, Reg::Rax);
    }
    for &(x, w) in &plan.sse_loads {
        asm.movq_x_m(x, Reg::R10, w as i32 * 8);
    }
    for &(r, w) in &plan.gp_loads {
        asm.mov_r_m(r, Reg::R10, w as i32 * 8);
    }

    if plan.variadic {
        asm.mov_al_imm(plan.sse_loads.len() as u8);
    }
    asm.call_r(Reg::R11);

    if stack > 0 {
        asm.add_ri(Reg::Rsp, stack);
    }

    match plan.ret {
        RetPlan::Void | RetPlan::Memory => {}
        RetPlan::Gp => asm.mov_m_r(Reg::Rbx, 0, Reg::Rax),
        RetPlan::GpPair => {
            asm.mov_m_r(Reg::Rbx, 0, Reg::Rax);
            asm.mov_m_r(Reg::Rbx, 8, Reg::Rdx);
        }
        RetPlan::Sse => asm.movq_m_x(Reg::Rbx, 0, Xmm::Xmm0),
        RetPlan::SsePair => {
            asm.movq_m_x(Reg::Rbx, 0, Xmm::Xmm0);
            asm.movq_m_x(Reg::Rbx, 8, Xmm::Xmm1);
        }
        RetPlan::GpSse => {
            asm.mov_m_r(Reg::Rbx, 0, Reg::Rax);
            asm.movq_m_x(Reg::Rbx, 8, Xmm::Xmm0);
        }
        RetPlan::SseGp => {
            asm.movq_m_x(Reg::Rbx, 0, Xmm::Xmm0);
            asm.mov_m_r(Reg::Rbx, 8, Reg::Rax);
        }
    }

    asm.pop(Reg::Rbx);
    asm.ret();
    asm.finish()
}

/// Emits a callback trampoline: native callers enter with the C ABI for
/// `plan`'s signature; the trampoline gathers the arguments into frame
/// words and calls `enter(cell, words, ret)`.
fn emit_callback(plan: &CallPlan, cell: usize, enter: usize) -> Vec<u8> {
    let mut asm = Asm::new();

    let words_bytes = plan.frame_words as i32 * 8;
    let ret_off = words_bytes;
    let frame = (words_bytes as u32 + 16).next_multiple_of(16) as i32;

    asm.push(Reg::Rbp);
    asm.mov_rr(Reg::Rbp, Reg::Rsp);
    asm.sub_ri(Reg::Rsp, frame);

    for &(r, w) in &plan.gp_loads {
        asm.mov_m_r(Reg::Rsp, w as i32 * 8, r);
    }
    for &(x, w) in &plan.sse_loads {
        asm.movq_m_x(Reg::Rsp, w as i32 * 8, x);
    }
    // Incoming stack arguments sit above the saved rbp and return
    // address.
    for (k, &w) in plan.stack_words.iter().enumerate() {
        asm.mov_r_m(Reg::Rax, Reg::Rbp, 16 + k as i32 * 8);
        asm.mov_m_r(Reg::Rsp, w as i32 * 8, Reg::Rax);
    }

    asm.mov_ri(Reg::Rdi, cell as u64);
    asm.lea(Reg::Rsi, Reg::Rsp, 0);
    asm.lea(Reg::Rdx, Reg::Rsp, ret_off);
    asm.mov_ri(Reg::R11, enter as u64);
    asm.call_r(Reg::R11);

    match plan.ret {
        RetPlan::Void => {}
        RetPlan::Gp => asm.mov_r_m(Reg::Rax, Reg::Rsp, ret_off),
        RetPlan::GpPair => {
            asm.mov_r_m(Reg::Rax, Reg::Rsp, ret_off);
            asm.mov_r_m(Reg::Rdx, Reg::Rsp, ret_off + 8);
        }
        RetPlan::Sse => asm.movq_x_m(Xmm::Xmm0, Reg::Rsp, ret_off),
        RetPlan::SsePair => {
            asm.movq_x_m(Xmm::Xmm0, Reg::Rsp, ret_off);
            asm.movq_x_m(Xmm::Xmm1, Reg::Rsp, ret_off + 8);
        }
        RetPlan::GpSse => {
            asm.mov_r_m(Reg::Rax, Reg::Rsp, ret_off);
            asm.movq_x_m(Xmm::Xmm0, Reg::Rsp, ret_off + 8);
        }
        RetPlan::SseGp => {
            asm.movq_x_m(Xmm::Xmm0, Reg::Rsp, ret_off);
            asm.mov_r_m(Reg::Rax, Reg::Rsp, ret_off + 8);
        }
        // The hidden pointer was spilled to frame word 0 and must come
        // back in rax.
        RetPlan::Memory => asm.mov_r_m(Reg::Rax, Reg::Rsp, 0),
    }

    asm.add_ri(Reg::Rsp, frame);
    asm.pop(Reg::Rbp);
    asm.ret();
    asm.finish()
}

/// One architecture's lowering of finished plans to machine code. The
/// classification above is architecture-neutral; a backend only turns a
/// [`CallPlan`] into bytes.
pub trait CodeEmitter {
    /// Stub that reads a flat word frame and performs the native call.
    fn call_stub(&self, plan: &CallPlan) -> Vec<u8>;

    /// Trampoline entered by native code with `plan`'s ABI, forwarding
    /// to `enter` with `cell` as the leading argument.
    fn callback(&self, plan: &CallPlan, cell: usize, enter: usize) -> Vec<u8>;
}

/// The x86-64 System V backend.
pub struct X64Emitter;

impl CodeEmitter for X64Emitter {
    fn call_stub(&self, plan: &CallPlan) -> Vec<u8> {
        emit_call_stub(plan)
    }

    fn callback(&self, plan: &CallPlan, cell: usize, enter: usize) -> Vec<u8> {
        emit_callback(plan, cell, enter)
    }
}
