//! Prefix decoding and the main opcode dispatch.
//!
//! The decoder consumes `(DD|FD)* [ED | CB (disp CB)?] opcode` and then
//! dispatches on the terminal opcode with the prefix state in locals. A
//! DD/FD run collapses to its last byte; ED cancels any index prefix. In
//! 8080 mode DD/FD are one-byte no-ops and CB/ED two-byte no-ops.

use super::{Cpu, IndexReg, Step, CYCLES_PER_INSTRUCTION};
use crate::cpu::registers::{CpuMode, Reg16, Reg8};
use crate::error::CpmResult;

/// Pathological DD/FD runs are cut off after this many prefix bytes.
const MAX_PREFIX_RUN: usize = 4;

/// BC/DE/HL/SP selector from opcode bits 5-4, with HL remapped to the
/// active index register under a DD/FD prefix.
fn pair(code: u8, index: Option<IndexReg>) -> Reg16 {
    match code & 3 {
        0 => Reg16::BC,
        1 => Reg16::DE,
        2 => Cpu::index_pair(index),
        _ => Reg16::SP,
    }
}

/// PUSH/POP selector: code 3 names AF instead of SP.
fn pair_af(code: u8, index: Option<IndexReg>) -> Reg16 {
    match code & 3 {
        0 => Reg16::BC,
        1 => Reg16::DE,
        2 => Cpu::index_pair(index),
        _ => Reg16::AF,
    }
}

impl Cpu {
    /// Fetch the displacement byte and form the `(IX+d)` / `(IY+d)`
    /// effective address.
    fn indexed_addr(&mut self, ix: IndexReg) -> u16 {
        let disp = self.pull_opcode_byte() as i8;
        self.index_value(ix).wrapping_add(disp as u16)
    }

    /// Read the high or low half of the active index register for the
    /// undocumented H/L remapping.
    fn index_half(&self, ix: IndexReg, r: Reg8) -> u8 {
        let pair = self.index_value(ix);
        match r {
            Reg8::H => (pair >> 8) as u8,
            _ => pair as u8,
        }
    }

    fn set_index_half(&mut self, ix: IndexReg, r: Reg8, value: u8) {
        let pair = self.index_value(ix);
        let updated = match r {
            Reg8::H => (pair & 0x00FF) | u16::from(value) << 8,
            _ => (pair & 0xFF00) | u16::from(value),
        };
        self.set_index_value(ix, updated);
    }

    /// Execute one instruction.
    pub fn execute(&mut self) -> CpmResult<Step> {
        self.cycles += CYCLES_PER_INSTRUCTION;

        let mut index: Option<IndexReg> = None;
        let mut opcode = self.pull_opcode_byte();

        // DD/FD prefix chain: the last one wins; CB ends the chain with a
        // displacement-before-opcode encoding.
        let mut prefix_run = 0;
        while (opcode == 0xDD || opcode == 0xFD) && prefix_run < MAX_PREFIX_RUN {
            if self.mode() == CpuMode::I8080 {
                return Ok(Step::Continue);
            }
            prefix_run += 1;
            let ix = if opcode == 0xDD {
                IndexReg::Ix
            } else {
                IndexReg::Iy
            };
            index = Some(ix);
            opcode = self.pull_opcode_byte();
            if opcode == 0xCB {
                let disp = self.pull_opcode_byte() as i8;
                let cb_op = self.pull_opcode_byte();
                self.execute_indexed_cb(ix, disp, cb_op);
                return Ok(Step::Continue);
            }
        }

        match opcode {
            0xED => {
                // ED cancels any index prefix; in 8080 mode it is a
                // two-byte no-op.
                let op = self.pull_opcode_byte();
                if self.mode() == CpuMode::Z80 {
                    self.execute_ed(op);
                }
                return Ok(Step::Continue);
            }
            0xCB => {
                let op = self.pull_opcode_byte();
                if self.mode() == CpuMode::Z80 {
                    self.execute_cb(op);
                }
                return Ok(Step::Continue);
            }
            _ => {}
        }

        // ALU with the H/L/(HL) selectors under an index prefix goes
        // through the undocumented half-register / displacement forms.
        if let Some(ix) = index {
            if (0x80..=0xBF).contains(&opcode) && matches!(opcode & 7, 4 | 5 | 6) {
                self.indexed_alu(opcode, ix);
                return Ok(Step::Continue);
            }
        }

        self.execute_main(opcode, index)
    }

    fn execute_main(&mut self, opcode: u8, index: Option<IndexReg>) -> CpmResult<Step> {
        match opcode {
            0x00 => {}

            // LD rp,nn
            0x01 | 0x11 | 0x21 | 0x31 => {
                let value = self.pull_opcode_word();
                let rp = pair(opcode >> 4, index);
                self.set_reg16(rp, value);
            }

            // LD (BC/DE),A
            0x02 | 0x12 => {
                let rp = pair(opcode >> 4, None);
                let addr = self.get_reg16(rp);
                self.mem.store(addr, self.regs.a());
            }

            // INC rp
            0x03 | 0x13 | 0x23 | 0x33 => {
                let rp = pair(opcode >> 4, index);
                let value = self.get_reg16(rp).wrapping_add(1);
                self.set_reg16(rp, value);
            }

            // INC r
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let r = Reg8::from_code(opcode >> 3);
                let result = match (index, r) {
                    (Some(ix), Reg8::M) => {
                        let addr = self.indexed_addr(ix);
                        let v = self.mem.fetch(addr).wrapping_add(1);
                        self.mem.store(addr, v);
                        v
                    }
                    (Some(ix), Reg8::H | Reg8::L) => {
                        let v = self.index_half(ix, r).wrapping_add(1);
                        self.set_index_half(ix, r, v);
                        v
                    }
                    _ => {
                        let v = self.get_reg8(r).wrapping_add(1);
                        self.set_reg8(r, v);
                        v
                    }
                };
                let half = result & 0x0F == 0;
                self.regs.set_flags_from_inc_dec(result, half, true);
            }

            // DEC r
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let r = Reg8::from_code(opcode >> 3);
                let result = match (index, r) {
                    (Some(ix), Reg8::M) => {
                        let addr = self.indexed_addr(ix);
                        let v = self.mem.fetch(addr).wrapping_sub(1);
                        self.mem.store(addr, v);
                        v
                    }
                    (Some(ix), Reg8::H | Reg8::L) => {
                        let v = self.index_half(ix, r).wrapping_sub(1);
                        self.set_index_half(ix, r, v);
                        v
                    }
                    _ => {
                        let v = self.get_reg8(r).wrapping_sub(1);
                        self.set_reg8(r, v);
                        v
                    }
                };
                // The 8080 reports half-carry unless the low nibble
                // borrowed; the Z80 reports the borrow itself.
                let half = match self.mode() {
                    CpuMode::I8080 => result & 0x0F != 0x0F,
                    CpuMode::Z80 => result & 0x0F == 0x0F,
                };
                self.regs.set_flags_from_inc_dec(result, half, false);
            }

            // LD r,n
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let r = Reg8::from_code(opcode >> 3);
                match (index, r) {
                    (Some(ix), Reg8::M) => {
                        // LD (IX+d),n takes the displacement before the
                        // immediate.
                        let addr = self.indexed_addr(ix);
                        let value = self.pull_opcode_byte();
                        self.mem.store(addr, value);
                    }
                    (Some(ix), Reg8::H | Reg8::L) => {
                        let value = self.pull_opcode_byte();
                        self.set_index_half(ix, r, value);
                    }
                    _ => {
                        let value = self.pull_opcode_byte();
                        self.set_reg8(r, value);
                    }
                }
            }

            // RLCA
            0x07 => {
                let a = self.regs.a();
                let carry = a & 0x80 != 0;
                let result = a << 1 | carry as u8;
                self.regs.set_a(result);
                self.regs.set_flags_from_rotate_acc(result, carry);
            }

            // EX AF,AF'
            0x08 => {
                if self.mode() == CpuMode::Z80 {
                    self.regs.exchange_af();
                }
            }

            // ADD HL/IX/IY,rp
            0x09 | 0x19 | 0x29 | 0x39 => {
                let rp = pair(opcode >> 4, index);
                let active = Cpu::index_pair(index);
                let addend = self.get_reg16(rp);
                let base = self.get_reg16(active);
                let sum = base.wrapping_add(addend);
                self.set_reg16(active, sum);
                match self.mode() {
                    CpuMode::Z80 => self.regs.set_flags_from_add16(base, addend),
                    CpuMode::I8080 => {
                        let wide = u32::from(base) + u32::from(addend);
                        self.regs.set_carry(wide > 0xFFFF);
                    }
                }
            }

            // LD A,(BC/DE)
            0x0A | 0x1A => {
                let rp = pair(opcode >> 4, None);
                let addr = self.get_reg16(rp);
                let value = self.mem.fetch(addr);
                self.regs.set_a(value);
            }

            // DEC rp
            0x0B | 0x1B | 0x2B | 0x3B => {
                let rp = pair(opcode >> 4, index);
                let value = self.get_reg16(rp).wrapping_sub(1);
                self.set_reg16(rp, value);
            }

            // RRCA
            0x0F => {
                let a = self.regs.a();
                let carry = a & 0x01 != 0;
                let result = a >> 1 | (carry as u8) << 7;
                self.regs.set_a(result);
                self.regs.set_flags_from_rotate_acc(result, carry);
            }

            // DJNZ
            0x10 => {
                if self.mode() == CpuMode::Z80 {
                    let disp = self.pull_opcode_byte() as i8;
                    let b = self.regs.b().wrapping_sub(1);
                    self.regs.set_b(b);
                    if b != 0 {
                        self.regs.pc = self.regs.pc.wrapping_add(disp as u16);
                    }
                }
            }

            // RLA
            0x17 => {
                let a = self.regs.a();
                let carry = a & 0x80 != 0;
                let result = a << 1 | self.regs.carry_as_u8();
                self.regs.set_a(result);
                self.regs.set_flags_from_rotate_acc(result, carry);
            }

            // JR
            0x18 => {
                if self.mode() == CpuMode::Z80 {
                    let disp = self.pull_opcode_byte() as i8;
                    self.regs.pc = self.regs.pc.wrapping_add(disp as u16);
                }
            }

            // RRA
            0x1F => {
                let a = self.regs.a();
                let carry = a & 0x01 != 0;
                let result = a >> 1 | self.regs.carry_as_u8() << 7;
                self.regs.set_a(result);
                self.regs.set_flags_from_rotate_acc(result, carry);
            }

            // JR NZ/Z/NC/C
            0x20 | 0x28 | 0x30 | 0x38 => {
                if self.mode() == CpuMode::Z80 {
                    let disp = self.pull_opcode_byte() as i8;
                    let cc = (opcode >> 3) & 3;
                    if self.regs.condition(cc) {
                        self.regs.pc = self.regs.pc.wrapping_add(disp as u16);
                    }
                }
            }

            // LD (nn),HL/IX/IY
            0x22 => {
                let addr = self.pull_opcode_word();
                let value = self.get_reg16(Cpu::index_pair(index));
                self.mem.store_word(addr, value);
            }

            0x27 => self.daa(),

            // LD HL/IX/IY,(nn)
            0x2A => {
                let addr = self.pull_opcode_word();
                let value = self.mem.fetch_word(addr);
                self.set_reg16(Cpu::index_pair(index), value);
            }

            // CPL
            0x2F => {
                let result = !self.regs.a();
                self.regs.set_a(result);
                self.regs.set_flags_from_cpl(result);
            }

            // LD (nn),A
            0x32 => {
                let addr = self.pull_opcode_word();
                self.mem.store(addr, self.regs.a());
            }

            // SCF
            0x37 => {
                let a = self.regs.a();
                self.regs.set_flags_from_scf(a);
            }

            // LD A,(nn)
            0x3A => {
                let addr = self.pull_opcode_word();
                let value = self.mem.fetch(addr);
                self.regs.set_a(value);
            }

            // CCF
            0x3F => {
                let a = self.regs.a();
                self.regs.set_flags_from_ccf(a);
            }

            0x76 => return Ok(Step::Halted),

            // LD r,r'
            0x40..=0x7F => {
                let src = Reg8::from_code(opcode);
                let dst = Reg8::from_code(opcode >> 3);

                if let Some(ix) = index {
                    if src == Reg8::M || dst == Reg8::M {
                        // The non-memory side uses the real register set,
                        // not the index halves.
                        let addr = self.indexed_addr(ix);
                        if src == Reg8::M {
                            let value = self.mem.fetch(addr);
                            self.set_reg8(dst, value);
                        } else {
                            let value = self.get_reg8(src);
                            self.mem.store(addr, value);
                        }
                        return Ok(Step::Continue);
                    }
                    if matches!(src, Reg8::H | Reg8::L) || matches!(dst, Reg8::H | Reg8::L) {
                        let value = match src {
                            Reg8::H | Reg8::L => self.index_half(ix, src),
                            _ => self.get_reg8(src),
                        };
                        match dst {
                            Reg8::H | Reg8::L => self.set_index_half(ix, dst, value),
                            _ => self.set_reg8(dst, value),
                        }
                        return Ok(Step::Continue);
                    }
                }

                let value = self.get_reg8(src);
                self.set_reg8(dst, value);
            }

            // ALU A,r
            0x80..=0xBF => {
                let operand = self.get_reg8(Reg8::from_code(opcode));
                self.alu_op((opcode >> 3) & 7, operand);
            }

            // RET cc
            0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => {
                let cc = (opcode >> 3) & 7;
                if self.regs.condition(cc) {
                    let addr = self.pop_word();
                    self.regs.pc = addr;
                }
            }

            // POP rp
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let rp = pair_af(opcode >> 4, index);
                let value = self.pop_word();
                self.set_reg16(rp, value);
            }

            // JP cc,nn
            0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
                let addr = self.pull_opcode_word();
                let cc = (opcode >> 3) & 7;
                if self.regs.condition(cc) {
                    self.regs.pc = addr;
                }
            }

            // JP nn
            0xC3 => {
                let addr = self.pull_opcode_word();
                self.regs.pc = addr;
            }

            // CALL cc,nn
            0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
                let addr = self.pull_opcode_word();
                let cc = (opcode >> 3) & 7;
                if self.regs.condition(cc) {
                    let pc = self.regs.pc;
                    self.push_word(pc);
                    self.regs.pc = addr;
                }
            }

            // PUSH rp
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let rp = pair_af(opcode >> 4, index);
                let value = self.get_reg16(rp);
                self.push_word(value);
            }

            // ALU A,n
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let operand = self.pull_opcode_byte();
                self.alu_op((opcode >> 3) & 7, operand);
            }

            // RST n
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                let pc = self.regs.pc;
                self.push_word(pc);
                self.regs.pc = u16::from((opcode >> 3) & 7) * 8;
            }

            // RET
            0xC9 => {
                let addr = self.pop_word();
                self.regs.pc = addr;
            }

            // CALL nn
            0xCD => {
                let addr = self.pull_opcode_word();
                let pc = self.regs.pc;
                self.push_word(pc);
                self.regs.pc = addr;
            }

            // OUT (n),A - no port devices are attached.
            0xD3 => {
                let _port = self.pull_opcode_byte();
            }

            // EXX
            0xD9 => {
                if self.mode() == CpuMode::Z80 {
                    self.regs.exchange_main();
                }
            }

            // IN A,(n) - floating bus.
            0xDB => {
                let _port = self.pull_opcode_byte();
                self.regs.set_a(0xFF);
            }

            // EX (SP),HL/IX/IY
            0xE3 => {
                let active = Cpu::index_pair(index);
                let sp = self.regs.sp;
                let from_stack = self.mem.fetch_word(sp);
                let from_reg = self.get_reg16(active);
                self.set_reg16(active, from_stack);
                self.mem.store_word(sp, from_reg);
            }

            // JP (HL/IX/IY)
            0xE9 => {
                self.regs.pc = self.get_reg16(Cpu::index_pair(index));
            }

            // EX DE,HL/IX/IY
            0xEB => {
                let active = Cpu::index_pair(index);
                let de = self.regs.de;
                let other = self.get_reg16(active);
                self.set_reg16(active, de);
                self.regs.de = other;
            }

            0xF3 => self.disable_interrupts(),

            // LD SP,HL/IX/IY
            0xF9 => {
                self.regs.sp = self.get_reg16(Cpu::index_pair(index));
            }

            0xFB => self.enable_interrupts(),

            // Only reachable through pathological prefix runs.
            _ => return Err(self.unknown_opcode(opcode)),
        }

        Ok(Step::Continue)
    }

    /// Shared 8-bit ALU body for the register, immediate and indexed
    /// forms. `op` is opcode bits 5-3.
    fn alu_op(&mut self, op: u8, operand: u8) {
        let a = self.regs.a();
        match op {
            0 => {
                // ADD
                self.regs.set_flags_from_sum8(a, operand, false);
                self.regs.set_a(a.wrapping_add(operand));
            }
            1 => {
                // ADC
                let carry = self.regs.carry();
                self.regs.set_flags_from_sum8(a, operand, carry);
                self.regs
                    .set_a(a.wrapping_add(operand).wrapping_add(carry as u8));
            }
            2 => {
                // SUB
                self.regs.set_flags_from_diff8(a, operand, false);
                self.regs.set_a(a.wrapping_sub(operand));
            }
            3 => {
                // SBC
                let carry = self.regs.carry();
                self.regs.set_flags_from_diff8(a, operand, carry);
                self.regs
                    .set_a(a.wrapping_sub(operand).wrapping_sub(carry as u8));
            }
            4 => {
                // AND: the Z80 always sets H, the 8080 takes bit 3 of the
                // OR of the operands.
                let result = a & operand;
                let half = match self.mode() {
                    CpuMode::Z80 => true,
                    CpuMode::I8080 => (a | operand) & 0x08 != 0,
                };
                self.regs.set_a(result);
                self.regs.set_flags_from_logic8(result, false, half);
            }
            5 => {
                // XOR
                let result = a ^ operand;
                self.regs.set_a(result);
                self.regs.set_flags_from_logic8(result, false, false);
            }
            6 => {
                // OR
                let result = a | operand;
                self.regs.set_a(result);
                self.regs.set_flags_from_logic8(result, false, false);
            }
            _ => {
                // CP: X/Y come from the operand, not the difference.
                self.regs.set_flags_from_diff8(a, operand, false);
                self.regs.overwrite_xy_from(operand);
            }
        }
    }

    /// ALU forms that name IXH/IXL/IYH/IYL or `(IX+d)`/`(IY+d)`.
    fn indexed_alu(&mut self, opcode: u8, ix: IndexReg) {
        let r = Reg8::from_code(opcode);
        let operand = match r {
            Reg8::M => {
                let addr = self.indexed_addr(ix);
                self.mem.fetch(addr)
            }
            _ => self.index_half(ix, r),
        };
        self.alu_op((opcode >> 3) & 7, operand);
    }

    /// Decimal adjust, per the hardware decision table keyed on C, H, N
    /// and the accumulator nibbles.
    fn daa(&mut self) {
        let a = self.regs.a();
        let low = a & 0x0F;
        let high = a >> 4;
        let flag_c = self.regs.carry();
        let flag_h = self.regs.flags() & crate::cpu::flags::HF != 0;
        // The 8080 flag byte has no N bit, and its DAA always adjusts by
        // addition.
        let flag_n = self.mode() == CpuMode::Z80
            && self.regs.flags() & crate::cpu::flags::NF != 0;

        let diff: u8 = if flag_c {
            if low < 0x0A && !flag_h {
                0x60
            } else {
                0x66
            }
        } else if low < 0x0A {
            if high < 0x0A {
                if flag_h {
                    0x06
                } else {
                    0x00
                }
            } else if flag_h {
                0x66
            } else {
                0x60
            }
        } else if high < 0x09 {
            0x06
        } else {
            0x66
        };

        let new_c = if flag_c {
            true
        } else if low < 0x0A {
            high >= 0x0A
        } else {
            high >= 0x09
        };

        let new_h = if flag_n {
            flag_h && low < 0x06
        } else {
            low >= 0x0A
        };

        let result = if flag_n {
            a.wrapping_sub(diff)
        } else {
            a.wrapping_add(diff)
        };

        self.regs.set_a(result);
        self.regs.set_flags_from_daa(result, flag_n, new_h, new_c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::flags::{CF, HF, NF, PF, SF, XF, YF, ZF};

    fn cpu_z80(program: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(CpuMode::Z80);
        load(&mut cpu, program);
        cpu
    }

    fn cpu_8080(program: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(CpuMode::I8080);
        load(&mut cpu, program);
        cpu
    }

    fn load(cpu: &mut Cpu, program: &[u8]) {
        for (i, &b) in program.iter().enumerate() {
            cpu.mem.store(0x0100 + i as u16, b);
        }
        cpu.regs.pc = 0x0100;
        cpu.regs.sp = 0xFFF0;
    }

    fn step(cpu: &mut Cpu) -> Step {
        cpu.execute().unwrap()
    }

    #[test]
    fn register_moves() {
        // LD B,0x42 ; LD C,B ; LD (HL),C ; LD A,(HL)
        let mut cpu = cpu_z80(&[0x06, 0x42, 0x48, 0x71, 0x7E]);
        cpu.regs.hl = 0x4000;
        for _ in 0..4 {
            step(&mut cpu);
        }
        assert_eq!(cpu.regs.a(), 0x42);
        assert_eq!(cpu.mem.fetch(0x4000), 0x42);
    }

    #[test]
    fn add_and_adc_flags() {
        // ADD A,B with A=0x3A B=0xC6 -> 0x00, carry and half set.
        let mut cpu = cpu_z80(&[0x80]);
        cpu.regs.set_a(0x3A);
        cpu.regs.set_b(0xC6);
        step(&mut cpu);
        assert_eq!(cpu.regs.a(), 0x00);
        let f = cpu.regs.flags();
        assert_ne!(f & ZF, 0);
        assert_ne!(f & CF, 0);
        assert_ne!(f & HF, 0);
        assert_eq!(f & NF, 0);

        // ADC A,0x00 with the carry still set adds one.
        load(&mut cpu, &[0xCE, 0x00]);
        step(&mut cpu);
        assert_eq!(cpu.regs.a(), 0x01);
    }

    #[test]
    fn cp_takes_xy_from_operand() {
        // CP 0x28: operand bits 3 and 5 land in X/Y.
        let mut cpu = cpu_z80(&[0xFE, 0x28]);
        cpu.regs.set_a(0x50);
        step(&mut cpu);
        let f = cpu.regs.flags();
        assert_ne!(f & XF, 0);
        assert_ne!(f & YF, 0);
        assert_ne!(f & NF, 0);
        assert_eq!(f & ZF, 0);
    }

    #[test]
    fn parity_mode_split_on_sub() {
        // SUB 0x01 with A=0x00 -> 0xFF: Z80 no overflow, 8080 parity even.
        let mut z80 = cpu_z80(&[0xD6, 0x01]);
        z80.regs.set_a(0x00);
        step(&mut z80);
        assert_eq!(z80.regs.flags() & PF, 0);

        let mut i8080 = cpu_8080(&[0xD6, 0x01]);
        i8080.regs.set_a(0x00);
        step(&mut i8080);
        assert_ne!(i8080.regs.flags() & PF, 0);
    }

    #[test]
    fn push_pop_round_trips_pairs_and_flags() {
        // PUSH BC ; POP DE
        let mut cpu = cpu_z80(&[0xC5, 0xD1]);
        cpu.regs.bc = 0x1234;
        step(&mut cpu);
        step(&mut cpu);
        assert_eq!(cpu.regs.de, 0x1234);

        // PUSH AF ; POP AF in 8080 mode normalizes the flag byte.
        let mut cpu = cpu_8080(&[0xF5, 0xF1]);
        cpu.regs.set_a(0x9A);
        cpu.regs.set_flags(0xFF);
        step(&mut cpu);
        step(&mut cpu);
        assert_eq!(cpu.regs.a(), 0x9A);
        assert_eq!(cpu.regs.flags(), 0xD7); // S Z - H - P 1 C
    }

    #[test]
    fn jumps_calls_and_rst() {
        // CALL 0x0200 ; target RET
        let mut cpu = cpu_z80(&[0xCD, 0x00, 0x02]);
        cpu.mem.store(0x0200, 0xC9);
        step(&mut cpu);
        assert_eq!(cpu.regs.pc, 0x0200);
        step(&mut cpu);
        assert_eq!(cpu.regs.pc, 0x0103);

        // RST 2 pushes and jumps to 0x0010.
        load(&mut cpu, &[0xD7]);
        step(&mut cpu);
        assert_eq!(cpu.regs.pc, 0x0010);
        assert_eq!(cpu.pop_word(), 0x0101);
    }

    #[test]
    fn relative_jumps_and_djnz() {
        // JR +2 skips two bytes.
        let mut cpu = cpu_z80(&[0x18, 0x02, 0x00, 0x00, 0x76]);
        step(&mut cpu);
        assert_eq!(cpu.regs.pc, 0x0104);

        // DJNZ loops B times: LD B,3 ; loop: DJNZ loop ; HLT
        let mut cpu = cpu_z80(&[0x06, 0x03, 0x10, 0xFE, 0x76]);
        step(&mut cpu);
        let mut steps = 0;
        while step(&mut cpu) == Step::Continue {
            steps += 1;
            assert!(steps < 10);
        }
        assert_eq!(cpu.regs.b(), 0);
        assert_eq!(steps, 3);
    }

    #[test]
    fn jr_conditions() {
        // JR NZ taken when Z clear.
        let mut cpu = cpu_z80(&[0x20, 0x10]);
        cpu.regs.set_flags(0);
        step(&mut cpu);
        assert_eq!(cpu.regs.pc, 0x0112);

        // JR Z not taken when Z clear.
        let mut cpu = cpu_z80(&[0x28, 0x10]);
        cpu.regs.set_flags(0);
        step(&mut cpu);
        assert_eq!(cpu.regs.pc, 0x0102);
    }

    #[test]
    fn indexed_loads_and_stores() {
        // LD IX,0x4000 ; LD (IX+5),0x77 ; LD B,(IX+5)
        let mut cpu = cpu_z80(&[
            0xDD, 0x21, 0x00, 0x40, // LD IX,0x4000
            0xDD, 0x36, 0x05, 0x77, // LD (IX+5),0x77
            0xDD, 0x46, 0x05, // LD B,(IX+5)
        ]);
        step(&mut cpu);
        step(&mut cpu);
        step(&mut cpu);
        assert_eq!(cpu.mem.fetch(0x4005), 0x77);
        assert_eq!(cpu.regs.b(), 0x77);

        // Negative displacement.
        load(&mut cpu, &[0xFD, 0x21, 0x10, 0x40, 0xFD, 0x36, 0xFE, 0x55]);
        step(&mut cpu);
        step(&mut cpu);
        assert_eq!(cpu.mem.fetch(0x400E), 0x55);
    }

    #[test]
    fn undocumented_index_halves() {
        // LD IX,0x1234 ; LD A,IXH ; ADD A,IXL
        let mut cpu = cpu_z80(&[0xDD, 0x21, 0x34, 0x12, 0xDD, 0x7C, 0xDD, 0x85]);
        step(&mut cpu);
        step(&mut cpu);
        assert_eq!(cpu.regs.a(), 0x12);
        step(&mut cpu);
        assert_eq!(cpu.regs.a(), 0x46);

        // INC IYL wraps its half only.
        load(&mut cpu, &[0xFD, 0x2C]);
        cpu.regs.iy = 0x20FF;
        step(&mut cpu);
        assert_eq!(cpu.regs.iy, 0x2000);
    }

    #[test]
    fn ld_r_from_indexed_memory_uses_real_registers() {
        // LD H,(IX+0) must load the real H, not IXH.
        let mut cpu = cpu_z80(&[0xDD, 0x66, 0x00]);
        cpu.regs.ix = 0x4000;
        cpu.regs.hl = 0x0000;
        cpu.mem.store(0x4000, 0x99);
        step(&mut cpu);
        assert_eq!(cpu.regs.h(), 0x99);
        assert_eq!(cpu.regs.ix, 0x4000);
    }

    #[test]
    fn ex_sp_and_ex_de_hl() {
        // EX (SP),HL
        let mut cpu = cpu_z80(&[0xE3, 0xEB]);
        cpu.regs.hl = 0x1111;
        cpu.regs.de = 0x2222;
        cpu.push_word(0x3333);
        step(&mut cpu);
        assert_eq!(cpu.regs.hl, 0x3333);
        assert_eq!(cpu.mem.fetch_word(cpu.regs.sp), 0x1111);
        // EX DE,HL
        step(&mut cpu);
        assert_eq!(cpu.regs.hl, 0x2222);
        assert_eq!(cpu.regs.de, 0x3333);
    }

    #[test]
    fn add_hl_rp_flag_traffic() {
        // ADD HL,BC: 0x0FFF + 0x0001 carries out of bit 11.
        let mut cpu = cpu_z80(&[0x09]);
        cpu.regs.hl = 0x0FFF;
        cpu.regs.bc = 0x0001;
        cpu.regs.set_flags(SF | ZF | PF);
        step(&mut cpu);
        assert_eq!(cpu.regs.hl, 0x1000);
        let f = cpu.regs.flags();
        assert_ne!(f & HF, 0);
        assert_eq!(f & CF, 0);
        // S/Z/P untouched.
        assert_ne!(f & SF, 0);
        assert_ne!(f & ZF, 0);
        assert_ne!(f & PF, 0);

        // 8080 DAD only touches carry.
        let mut cpu = cpu_8080(&[0x09]);
        cpu.regs.hl = 0xFFFF;
        cpu.regs.bc = 0x0001;
        cpu.regs.set_flags(0);
        step(&mut cpu);
        assert_eq!(cpu.regs.hl, 0x0000);
        assert_ne!(cpu.regs.flags() & CF, 0);
        assert_eq!(cpu.regs.flags() & HF, 0);
    }

    #[test]
    fn daa_adjusts_bcd_addition() {
        // For every pair of two-digit BCD operands, ADD then DAA must
        // produce the BCD sum with carry on overflow past 99.
        for x in 0..100u32 {
            for y in 0..100u32 {
                let bcd = |n: u32| ((n / 10) << 4 | (n % 10)) as u8;
                let mut cpu = cpu_z80(&[0x80, 0x27]);
                cpu.regs.set_a(bcd(x));
                cpu.regs.set_b(bcd(y));
                step(&mut cpu);
                step(&mut cpu);
                let sum = x + y;
                assert_eq!(
                    cpu.regs.a(),
                    bcd(sum % 100),
                    "DAA after {x} + {y}"
                );
                assert_eq!(cpu.regs.carry(), sum > 99, "carry after {x} + {y}");
            }
        }
    }

    #[test]
    fn daa_after_subtraction_keeps_n() {
        // SUB then DAA: 0x42 - 0x13 = 0x2F, adjusted to 0x29.
        let mut cpu = cpu_z80(&[0x90, 0x27]);
        cpu.regs.set_a(0x42);
        cpu.regs.set_b(0x13);
        step(&mut cpu);
        step(&mut cpu);
        assert_eq!(cpu.regs.a(), 0x29);
        assert_ne!(cpu.regs.flags() & NF, 0);
    }

    #[test]
    fn mode_8080_treats_prefixes_as_nops() {
        // DD is a one-byte no-op; the 0x21 after it is LD HL,nn.
        let mut cpu = cpu_8080(&[0xDD, 0x21, 0x34, 0x12]);
        step(&mut cpu);
        assert_eq!(cpu.regs.pc, 0x0101);
        step(&mut cpu);
        assert_eq!(cpu.regs.hl, 0x1234);
        assert_eq!(cpu.regs.ix, 0x0000);

        // CB and ED consume exactly two bytes.
        let mut cpu = cpu_8080(&[0xCB, 0x07, 0xED, 0xB0]);
        step(&mut cpu);
        assert_eq!(cpu.regs.pc, 0x0102);
        step(&mut cpu);
        assert_eq!(cpu.regs.pc, 0x0104);
    }

    #[test]
    fn pathological_prefix_run_is_fatal() {
        let mut cpu = cpu_z80(&[0xDD, 0xDD, 0xDD, 0xDD, 0xDD, 0xDD]);
        assert!(cpu.execute().is_err());
    }

    #[test]
    fn halt_surfaces_as_step_outcome() {
        let mut cpu = cpu_z80(&[0x76]);
        assert_eq!(step(&mut cpu), Step::Halted);
    }

    #[test]
    fn ei_di_drive_the_flip_flops() {
        let mut cpu = cpu_z80(&[0xFB, 0xF3]);
        step(&mut cpu);
        assert!(cpu.regs.iff1 && cpu.regs.iff2);
        step(&mut cpu);
        assert!(!cpu.regs.iff1 && !cpu.regs.iff2);
    }
}
