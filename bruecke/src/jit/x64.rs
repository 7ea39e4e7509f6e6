//! Minimal x86-64 encoder for the call stubs and callback trampolines.
//! Stubs are straight-line code, so there is no branch or label
//! machinery; every helper appends one instruction.

/// General purpose registers with their hardware encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub fn enc(self) -> u8 {
        self as u8
    }

    pub fn low3(self) -> u8 {
        self.enc() & 0b111
    }

    /// True for r8-r15, which need a REX extension bit.
    pub fn high(self) -> bool {
        self.enc() >= 8
    }
}

/// SSE argument registers. Only xmm0-xmm7 carry arguments, so no REX.R
/// handling is needed for the register field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
}

impl Xmm {
    pub fn enc(self) -> u8 {
        self as u8
    }
}

#[derive(Default)]
pub struct Asm {
    code: Vec<u8>,
}

impl Asm {
    pub fn new() -> Asm {
        Asm::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn finish(self) -> Vec<u8> {
        self.code
    }

    fn byte(&mut self, b: u8) {
        self.code.push(b);
    }

    fn dword(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn qword(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// REX prefix; omitted entirely when no bit is set. The index bit is
    /// never needed because no emitted operand uses a scaled index.
    fn rex(&mut self, w: bool, r: bool, b: bool) {
        let mut rex = 0x40u8;
        if w {
            rex |= 0x08;
        }
        if r {
            rex |= 0x04;
        }
        if b {
            rex |= 0x01;
        }
        if rex != 0x40 {
            self.byte(rex);
        }
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        debug_assert!(mode < 4);
        debug_assert!(reg < 8);
        debug_assert!(rm < 8);
        self.byte(mode << 6 | reg << 3 | rm);
    }

    /// `[base + disp]` operand. rsp/r12 force a SIB byte; rbp/r13 force
    /// an explicit displacement.
    fn mem(&mut self, reg: u8, base: Reg, disp: i32) {
        debug_assert!(reg < 8);
        let base_low = base.low3();
        let need_sib = base_low == 0b100;

        let mode = if disp == 0 && base_low != 0b101 {
            0b00
        } else if i8::try_from(disp).is_ok() {
            0b01
        } else {
            0b10
        };

        self.modrm(mode, reg, if need_sib { 0b100 } else { base_low });
        if need_sib {
            self.byte(0b00_100_000 | base_low);
        }
        match mode {
            0b01 => self.byte(disp as i8 as u8),
            0b10 => self.dword(disp as u32),
            _ => {}
        }
    }

    pub fn push(&mut self, r: Reg) {
        self.rex(false, false, r.high());
        self.byte(0x50 + r.low3());
    }

    pub fn pop(&mut self, r: Reg) {
        self.rex(false, false, r.high());
        self.byte(0x58 + r.low3());
    }

    /// `mov dst, src` (64-bit).
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.high(), dst.high());
        self.byte(0x89);
        self.modrm(0b11, src.low3(), dst.low3());
    }

    /// `mov dst, imm64` (movabs).
    pub fn mov_ri(&mut self, dst: Reg, imm: u64) {
        self.rex(true, false, dst.high());
        self.byte(0xB8 + dst.low3());
        self.qword(imm);
    }

    /// `mov dst, [base + disp]` (64-bit load).
    pub fn mov_r_m(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.high(), base.high());
        self.byte(0x8B);
        self.mem(dst.low3(), base, disp);
    }

    /// `mov [base + disp], src` (64-bit store).
    pub fn mov_m_r(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex(true, src.high(), base.high());
        self.byte(0x89);
        self.mem(src.low3(), base, disp);
    }

    /// `movq xmm, [base + disp]`.
    pub fn movq_x_m(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.byte(0xF3);
        self.rex(false, false, base.high());
        self.byte(0x0F);
        self.byte(0x7E);
        self.mem(dst.enc(), base, disp);
    }

    /// `movq [base + disp], xmm`.
    pub fn movq_m_x(&mut self, base: Reg, disp: i32, src: Xmm) {
        self.byte(0x66);
        self.rex(false, false, base.high());
        self.byte(0x0F);
        self.byte(0xD6);
        self.mem(src.enc(), base, disp);
    }

    /// `lea dst, [base + disp]`.
    pub fn lea(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.high(), base.high());
        self.byte(0x8D);
        self.mem(dst.low3(), base, disp);
    }

    pub fn sub_ri(&mut self, dst: Reg, imm: i32) {
        self.rex(true, false, dst.high());
        self.byte(0x81);
        self.modrm(0b11, 5, dst.low3());
        self.dword(imm as u32);
    }

    pub fn add_ri(&mut self, dst: Reg, imm: i32) {
        self.rex(true, false, dst.high());
        self.byte(0x81);
        self.modrm(0b11, 0, dst.low3());
        self.dword(imm as u32);
    }

    /// `mov al, imm8`; the variadic convention passes the SSE register
    /// count in al.
    pub fn mov_al_imm(&mut self, v: u8) {
        self.byte(0xB0);
        self.byte(v);
    }

    pub fn call_r(&mut self, r: Reg) {
        self.rex(false, false, r.high());
        self.byte(0xFF);
        self.modrm(0b11, 2, r.low3());
    }

    pub fn ret(&mut self) {
        self.byte(0xC3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::pages::TransientCode;

    fn enc(f: impl FnOnce(&mut Asm)) -> Vec<u8> {
        let mut asm = Asm::new();
        f(&mut asm);
        asm.finish()
    }

    #[test]
    fn push_pop_encodings() {
        assert_eq!(enc(|a| a.push(Reg::Rbx)), [0x53]);
        assert_eq!(enc(|a| a.push(Reg::R12)), [0x41, 0x54]);
        assert_eq!(enc(|a| a.pop(Reg::Rbp)), [0x5D]);
    }

    #[test]
    fn mov_encodings() {
        assert_eq!(enc(|a| a.mov_rr(Reg::Rbx, Reg::Rsi)), [0x48, 0x89, 0xF3]);
        assert_eq!(
            enc(|a| a.mov_r_m(Reg::Rax, Reg::Rdi, 16)),
            [0x48, 0x8B, 0x47, 0x10]
        );
        assert_eq!(
            enc(|a| a.mov_m_r(Reg::Rsp, 8, Reg::Rax)),
            [0x48, 0x89, 0x44, 0x24, 0x08]
        );
        assert_eq!(enc(|a| a.mov_r_m(Reg::Rdi, Reg::R10, 0)), [0x49, 0x8B, 0x3A]);
        assert_eq!(
            enc(|a| a.mov_r_m(Reg::Rax, Reg::Rbp, 16)),
            [0x48, 0x8B, 0x45, 0x10]
        );
        assert_eq!(
            enc(|a| a.mov_r_m(Reg::R9, Reg::R10, 0x98)),
            [0x4D, 0x8B, 0x8A, 0x98, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            enc(|a| a.mov_ri(Reg::R11, 0x1122_3344_5566_7788)),
            [0x49, 0xBB, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn sse_and_misc_encodings() {
        assert_eq!(
            enc(|a| a.movq_x_m(Xmm::Xmm0, Reg::R10, 8)),
            [0xF3, 0x41, 0x0F, 0x7E, 0x42, 0x08]
        );
        assert_eq!(
            enc(|a| a.movq_m_x(Reg::Rbx, 0, Xmm::Xmm0)),
            [0x66, 0x0F, 0xD6, 0x03]
        );
        assert_eq!(enc(|a| a.lea(Reg::Rsi, Reg::Rsp, 0)), [0x48, 0x8D, 0x34, 0x24]);
        assert_eq!(
            enc(|a| a.sub_ri(Reg::Rsp, 32)),
            [0x48, 0x81, 0xEC, 0x20, 0x00, 0x00, 0x00]
        );
        assert_eq!(enc(|a| a.call_r(Reg::R11)), [0x41, 0xFF, 0xD3]);
        assert_eq!(enc(|a| a.mov_al_imm(2)), [0xB0, 0x02]);
        assert_eq!(enc(|a| a.ret()), [0xC3]);
    }

    #[test]
    fn encoded_identity_runs() {
        let mut asm = Asm::new();
        asm.mov_rr(Reg::Rax, Reg::Rdi);
        asm.ret();

        let code = TransientCode::new(asm.code()).expect("map");
        let f: unsafe extern "C" fn(u64) -> u64 = unsafe { std::mem::transmute(code.entry()) };
        assert_eq!(unsafe { f(0xFEED_FACE) }, 0xFEED_FACE);
    }

    #[test]
    fn encoded_stack_and_sse_roundtrip() {
        let mut asm = Asm::new();
        asm.sub_ri(Reg::Rsp, 16);
        asm.movq_m_x(Reg::Rsp, 0, Xmm::Xmm0);
        asm.movq_x_m(Xmm::Xmm0, Reg::Rsp, 0);
        asm.add_ri(Reg::Rsp, 16);
        asm.ret();

        let code = TransientCode::new(asm.code()).expect("map");
        let f: unsafe extern "C" fn(f64) -> f64 = unsafe { std::mem::transmute(code.entry()) };
        assert_eq!(unsafe { f(2.5) }, 2.5);
    }

    #[test]
    fn encoded_immediate_runs() {
        let mut asm = Asm::new();
        asm.mov_ri(Reg::Rax, 0xDEAD_BEEF);
        asm.ret();

        let code = TransientCode::new(asm.code()).expect("map");
        let f: unsafe extern "C" fn() -> u64 = unsafe { std::mem::transmute(code.entry()) };
        assert_eq!(unsafe { f() }, 0xDEAD_BEEF);
    }
}
