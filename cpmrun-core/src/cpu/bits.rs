//! CB-prefixed bit operations: rotates, shifts, BIT, RES, SET.
//!
//! The DDCB/FDCB forms address `(IX+d)` / `(IY+d)` and, except for BIT,
//! write the result back to memory and (undocumented) to the register
//! named by the selector when it is not the `(HL)` position.

use super::{Cpu, IndexReg};
use crate::cpu::flags::{CF, HF, PF, SF, XF, YF, ZF};
use crate::cpu::registers::{CpuMode, Reg8};

impl Cpu {
    /// Rotate/shift body shared by CB and DDCB/FDCB. `kind` is opcode
    /// bits 5-3: RLC RRC RL RR SLA SRA SLL SRL.
    fn rotate_shift(&mut self, kind: u8, val: u8) -> u8 {
        let (result, carry) = match kind {
            0 => (val << 1 | val >> 7, val & 0x80 != 0),
            1 => (val >> 1 | val << 7, val & 0x01 != 0),
            2 => (val << 1 | self.regs.carry_as_u8(), val & 0x80 != 0),
            3 => (val >> 1 | self.regs.carry_as_u8() << 7, val & 0x01 != 0),
            4 => (val << 1, val & 0x80 != 0),
            5 => (val >> 1 | (val & 0x80), val & 0x01 != 0),
            // SLL is undocumented: like SLA but shifts a 1 into bit 0.
            6 => (val << 1 | 0x01, val & 0x80 != 0),
            _ => (val >> 1, val & 0x01 != 0),
        };
        self.regs.set_flags_from_rotate8(result, carry);
        result
    }

    /// BIT n flag traffic. The X/Y source differs per addressing form.
    fn bit_flags(&mut self, val: u8, bit: u8, xy_source: u8) {
        let mut f = (self.regs.flags() & CF) | HF;
        if val & (1 << bit) == 0 {
            f |= ZF | PF;
        }
        if bit == 7 && val & 0x80 != 0 {
            f |= SF;
        }
        if self.mode() == CpuMode::Z80 {
            f |= xy_source & (XF | YF);
        }
        self.regs.set_flags(f);
    }

    /// Plain CB-prefixed operation on a register or `(HL)`.
    pub(crate) fn execute_cb(&mut self, op: u8) {
        let r = Reg8::from_code(op);
        let bit = (op >> 3) & 7;
        let val = self.get_reg8(r);

        match op {
            0x00..=0x3F => {
                let result = self.rotate_shift((op >> 3) & 7, val);
                self.set_reg8(r, result);
            }
            0x40..=0x7F => {
                // BIT n,(HL) leaks the H register into X/Y.
                let xy = match r {
                    Reg8::M => self.regs.h(),
                    _ => val,
                };
                self.bit_flags(val, bit, xy);
            }
            0x80..=0xBF => self.set_reg8(r, val & !(1 << bit)),
            _ => self.set_reg8(r, val | 1 << bit),
        }
    }

    /// DDCB/FDCB operation; the displacement was consumed before the
    /// terminal opcode byte.
    pub(crate) fn execute_indexed_cb(&mut self, ix: IndexReg, disp: i8, op: u8) {
        let addr = self.index_value(ix).wrapping_add(disp as u16);
        let r = Reg8::from_code(op);
        let bit = (op >> 3) & 7;
        let val = self.mem.fetch(addr);

        match op {
            0x40..=0x7F => {
                // BIT n,(IX+d): X/Y come from the high byte of the
                // effective address.
                self.bit_flags(val, bit, (addr >> 8) as u8);
                return;
            }
            0x00..=0x3F => {
                let result = self.rotate_shift((op >> 3) & 7, val);
                self.store_indexed_cb(addr, r, result);
            }
            0x80..=0xBF => self.store_indexed_cb(addr, r, val & !(1 << bit)),
            _ => self.store_indexed_cb(addr, r, val | 1 << bit),
        }
    }

    /// Write-back for DDCB/FDCB: always to memory, and to the nominated
    /// register when the selector names one.
    fn store_indexed_cb(&mut self, addr: u16, r: Reg8, result: u8) {
        self.mem.store(addr, result);
        if r != Reg8::M {
            self.set_reg8(r, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::flags::NF;

    fn cpu_with(program: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(CpuMode::Z80);
        for (i, &b) in program.iter().enumerate() {
            cpu.mem.store(0x0100 + i as u16, b);
        }
        cpu.regs.pc = 0x0100;
        cpu.regs.sp = 0xFFF0;
        cpu
    }

    fn step(cpu: &mut Cpu) {
        cpu.execute().unwrap();
    }

    #[test]
    fn rlc_and_srl_set_carry_from_shifted_bit() {
        // RLC B
        let mut cpu = cpu_with(&[0xCB, 0x00]);
        cpu.regs.set_b(0x81);
        step(&mut cpu);
        assert_eq!(cpu.regs.b(), 0x03);
        let f = cpu.regs.flags();
        assert_ne!(f & CF, 0);
        assert_eq!(f & (HF | NF), 0);

        // SRL A
        let mut cpu = cpu_with(&[0xCB, 0x3F]);
        cpu.regs.set_a(0x01);
        step(&mut cpu);
        assert_eq!(cpu.regs.a(), 0x00);
        let f = cpu.regs.flags();
        assert_ne!(f & CF, 0);
        assert_ne!(f & ZF, 0);
    }

    #[test]
    fn sll_shifts_in_a_one() {
        // SLL C (undocumented)
        let mut cpu = cpu_with(&[0xCB, 0x31]);
        cpu.regs.set_c(0x40);
        step(&mut cpu);
        assert_eq!(cpu.regs.c(), 0x81);
        assert_eq!(cpu.regs.flags() & CF, 0);
    }

    #[test]
    fn sra_preserves_sign() {
        // SRA D
        let mut cpu = cpu_with(&[0xCB, 0x2A]);
        cpu.regs.set_d(0x81);
        step(&mut cpu);
        assert_eq!(cpu.regs.d(), 0xC0);
        assert_ne!(cpu.regs.flags() & CF, 0);
    }

    #[test]
    fn bit_sets_z_h_and_parity_together() {
        // BIT 7,B with bit clear.
        let mut cpu = cpu_with(&[0xCB, 0x78]);
        cpu.regs.set_b(0x7F);
        step(&mut cpu);
        let f = cpu.regs.flags();
        assert_ne!(f & ZF, 0);
        assert_ne!(f & PF, 0);
        assert_ne!(f & HF, 0);
        assert_eq!(f & (NF | SF), 0);

        // BIT 7,B with bit set copies S.
        let mut cpu = cpu_with(&[0xCB, 0x78]);
        cpu.regs.set_b(0x80);
        step(&mut cpu);
        let f = cpu.regs.flags();
        assert_eq!(f & ZF, 0);
        assert_ne!(f & SF, 0);
    }

    #[test]
    fn bit_xy_source_per_addressing_form() {
        // BIT 0,C: X/Y from the register value.
        let mut cpu = cpu_with(&[0xCB, 0x41]);
        cpu.regs.set_c(0x29);
        step(&mut cpu);
        assert_ne!(cpu.regs.flags() & XF, 0);
        assert_ne!(cpu.regs.flags() & YF, 0);

        // BIT 0,(HL): X/Y from the H register.
        let mut cpu = cpu_with(&[0xCB, 0x46]);
        cpu.regs.hl = 0x2840;
        cpu.mem.store(0x2840, 0x01);
        step(&mut cpu);
        assert_ne!(cpu.regs.flags() & XF, 0);
        assert_ne!(cpu.regs.flags() & YF, 0);

        // BIT 0,(IX+d): X/Y from the high byte of the effective address.
        let mut cpu = cpu_with(&[0xDD, 0xCB, 0x00, 0x46]);
        cpu.regs.ix = 0x2800;
        cpu.mem.store(0x2800, 0x01);
        step(&mut cpu);
        assert_ne!(cpu.regs.flags() & YF, 0);
        assert_eq!(cpu.regs.flags() & XF, 0);
    }

    #[test]
    fn set_and_res_on_memory() {
        // SET 3,(HL) ; RES 0,(HL)
        let mut cpu = cpu_with(&[0xCB, 0xDE, 0xCB, 0x86]);
        cpu.regs.hl = 0x4000;
        cpu.mem.store(0x4000, 0x01);
        step(&mut cpu);
        assert_eq!(cpu.mem.fetch(0x4000), 0x09);
        step(&mut cpu);
        assert_eq!(cpu.mem.fetch(0x4000), 0x08);
    }

    #[test]
    fn ddcb_writes_memory_and_register() {
        // RLC (IX+1) with the B selector copies the result into B.
        let mut cpu = cpu_with(&[0xDD, 0xCB, 0x01, 0x00]);
        cpu.regs.ix = 0x4000;
        cpu.mem.store(0x4001, 0x80);
        step(&mut cpu);
        assert_eq!(cpu.mem.fetch(0x4001), 0x01);
        assert_eq!(cpu.regs.b(), 0x01);

        // With the (HL) selector only memory is written.
        let mut cpu = cpu_with(&[0xDD, 0xCB, 0x01, 0xC6]); // SET 0,(IX+1)
        cpu.regs.ix = 0x4000;
        cpu.regs.hl = 0x1234;
        step(&mut cpu);
        assert_eq!(cpu.mem.fetch(0x4001), 0x01);
        assert_eq!(cpu.regs.hl, 0x1234);
    }
}
