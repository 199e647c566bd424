// Status flags
pub const FLAG_C: u8 = 0x01; // Carry
pub const FLAG_Z: u8 = 0x02; // Zero
pub const FLAG_I: u8 = 0x04; // Interrupt Disable
pub const FLAG_D: u8 = 0x08; // Decimal Mode (unused on NES)
pub const FLAG_B: u8 = 0x10; // Break
pub const FLAG_U: u8 = 0x20; // Unused (always 1)
pub const FLAG_V: u8 = 0x40; // Overflow
pub const FLAG_N: u8 = 0x80; // Negative

/// The CPU's view of the system. The defaults keep test buses down to a pair
/// of methods; the real [`crate::bus::Bus`] implements the whole surface.
pub trait CpuBus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, data: u8);
    /// OAM DMA stall, requested by a $4014 write.
    fn request_stall(&mut self, _cycles: u32) {}
    /// Burn one stalled cycle; true while a DMA transfer is in progress.
    fn consume_stall(&mut self) -> bool {
        false
    }
    fn irq_pending(&self) -> bool {
        false
    }
    fn ack_irq(&mut self) {}
    fn tick(&mut self, _cycles: u32) {}
    /// Force a value onto the open-bus latch.
    fn set_data_bus(&mut self, _value: u8) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Imp,
    Imm,
    Zp0,
    Zpx,
    Zpy,
    Abs,
    Abx,
    Aby,
    Ind,
    Izx,
    Izy,
    Rel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Rmw,
    Implied,
}

#[rustfmt::skip]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    // Official
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs, Clc,
    Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny, Jmp,
    Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Pla, Plp, Rol, Ror, Rti,
    Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax, Tay, Tsx, Txa, Txs, Tya,
    // Undocumented
    Slo, Rla, Sre, Rra, Sax, Lax, Dcp, Isc, Anc, Asr, Arr, Ane, Lxa, Axs,
    Sha, Shx, Shy, Shs, Lae,
    // Undocumented NOP that takes the page-cross penalty
    NopRead,
}

#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub name: &'static str,
    op: Op,
    pub mode: AddrMode,
    pub access: Access,
    pub cycles: u8,
}

const fn access_for(op: Op) -> Access {
    match op {
        Op::Sta | Op::Stx | Op::Sty | Op::Sax | Op::Sha | Op::Shx | Op::Shy | Op::Shs => {
            Access::Write
        }
        Op::Asl
        | Op::Lsr
        | Op::Rol
        | Op::Ror
        | Op::Inc
        | Op::Dec
        | Op::Slo
        | Op::Rla
        | Op::Sre
        | Op::Rra
        | Op::Dcp
        | Op::Isc => Access::Rmw,
        _ => Access::Read,
    }
}

const fn instr(name: &'static str, op: Op, mode: AddrMode, cycles: u8) -> Instr {
    Instr {
        name,
        op,
        mode,
        access: access_for(op),
        cycles,
    }
}

/// 256-entry dispatch table. Unallocated slots stay 2-cycle implied NOPs.
pub const INSTRUCTIONS: [Instr; 256] = build_table();

#[rustfmt::skip]
const fn build_table() -> [Instr; 256] {
    use AddrMode::*;
    let mut t = [Instr { name: "NOP", op: Op::Nop, mode: Imp, access: Access::Implied, cycles: 2 }; 256];

    t[0x00] = instr("BRK", Op::Brk, Imm, 7);
    t[0x01] = instr("ORA", Op::Ora, Izx, 6);
    t[0x05] = instr("ORA", Op::Ora, Zp0, 3);
    t[0x06] = instr("ASL", Op::Asl, Zp0, 5);
    t[0x08] = instr("PHP", Op::Php, Imp, 3);
    t[0x09] = instr("ORA", Op::Ora, Imm, 2);
    t[0x0A] = instr("ASL", Op::Asl, Imp, 2);
    t[0x0D] = instr("ORA", Op::Ora, Abs, 4);
    t[0x0E] = instr("ASL", Op::Asl, Abs, 6);

    t[0x10] = instr("BPL", Op::Bpl, Rel, 2);
    t[0x11] = instr("ORA", Op::Ora, Izy, 5);
    t[0x15] = instr("ORA", Op::Ora, Zpx, 4);
    t[0x16] = instr("ASL", Op::Asl, Zpx, 6);
    t[0x18] = instr("CLC", Op::Clc, Imp, 2);
    t[0x19] = instr("ORA", Op::Ora, Aby, 4);
    t[0x1D] = instr("ORA", Op::Ora, Abx, 4);
    t[0x1E] = instr("ASL", Op::Asl, Abx, 7);

    t[0x20] = instr("JSR", Op::Jsr, Abs, 6);
    t[0x21] = instr("AND", Op::And, Izx, 6);
    t[0x24] = instr("BIT", Op::Bit, Zp0, 3);
    t[0x25] = instr("AND", Op::And, Zp0, 3);
    t[0x26] = instr("ROL", Op::Rol, Zp0, 5);
    t[0x28] = instr("PLP", Op::Plp, Imp, 4);
    t[0x29] = instr("AND", Op::And, Imm, 2);
    t[0x2A] = instr("ROL", Op::Rol, Imp, 2);
    t[0x2C] = instr("BIT", Op::Bit, Abs, 4);
    t[0x2D] = instr("AND", Op::And, Abs, 4);
    t[0x2E] = instr("ROL", Op::Rol, Abs, 6);

    t[0x30] = instr("BMI", Op::Bmi, Rel, 2);
    t[0x31] = instr("AND", Op::And, Izy, 5);
    t[0x35] = instr("AND", Op::And, Zpx, 4);
    t[0x36] = instr("ROL", Op::Rol, Zpx, 6);
    t[0x38] = instr("SEC", Op::Sec, Imp, 2);
    t[0x39] = instr("AND", Op::And, Aby, 4);
    t[0x3D] = instr("AND", Op::And, Abx, 4);
    t[0x3E] = instr("ROL", Op::Rol, Abx, 7);

    t[0x40] = instr("RTI", Op::Rti, Imp, 6);
    t[0x41] = instr("EOR", Op::Eor, Izx, 6);
    t[0x45] = instr("EOR", Op::Eor, Zp0, 3);
    t[0x46] = instr("LSR", Op::Lsr, Zp0, 5);
    t[0x48] = instr("PHA", Op::Pha, Imp, 3);
    t[0x49] = instr("EOR", Op::Eor, Imm, 2);
    t[0x4A] = instr("LSR", Op::Lsr, Imp, 2);
    t[0x4C] = instr("JMP", Op::Jmp, Abs, 3);
    t[0x4D] = instr("EOR", Op::Eor, Abs, 4);
    t[0x4E] = instr("LSR", Op::Lsr, Abs, 6);

    t[0x50] = instr("BVC", Op::Bvc, Rel, 2);
    t[0x51] = instr("EOR", Op::Eor, Izy, 5);
    t[0x55] = instr("EOR", Op::Eor, Zpx, 4);
    t[0x56] = instr("LSR", Op::Lsr, Zpx, 6);
    t[0x58] = instr("CLI", Op::Cli, Imp, 2);
    t[0x59] = instr("EOR", Op::Eor, Aby, 4);
    t[0x5D] = instr("EOR", Op::Eor, Abx, 4);
    t[0x5E] = instr("LSR", Op::Lsr, Abx, 7);

    t[0x60] = instr("RTS", Op::Rts, Imp, 6);
    t[0x61] = instr("ADC", Op::Adc, Izx, 6);
    t[0x65] = instr("ADC", Op::Adc, Zp0, 3);
    t[0x66] = instr("ROR", Op::Ror, Zp0, 5);
    t[0x68] = instr("PLA", Op::Pla, Imp, 4);
    t[0x69] = instr("ADC", Op::Adc, Imm, 2);
    t[0x6A] = instr("ROR", Op::Ror, Imp, 2);
    t[0x6C] = instr("JMP", Op::Jmp, Ind, 5);
    t[0x6D] = instr("ADC", Op::Adc, Abs, 4);
    t[0x6E] = instr("ROR", Op::Ror, Abs, 6);

    t[0x70] = instr("BVS", Op::Bvs, Rel, 2);
    t[0x71] = instr("ADC", Op::Adc, Izy, 5);
    t[0x75] = instr("ADC", Op::Adc, Zpx, 4);
    t[0x76] = instr("ROR", Op::Ror, Zpx, 6);
    t[0x78] = instr("SEI", Op::Sei, Imp, 2);
    t[0x79] = instr("ADC", Op::Adc, Aby, 4);
    t[0x7D] = instr("ADC", Op::Adc, Abx, 4);
    t[0x7E] = instr("ROR", Op::Ror, Abx, 7);

    t[0x81] = instr("STA", Op::Sta, Izx, 6);
    t[0x84] = instr("STY", Op::Sty, Zp0, 3);
    t[0x85] = instr("STA", Op::Sta, Zp0, 3);
    t[0x86] = instr("STX", Op::Stx, Zp0, 3);
    t[0x88] = instr("DEY", Op::Dey, Imp, 2);
    t[0x8A] = instr("TXA", Op::Txa, Imp, 2);
    t[0x8C] = instr("STY", Op::Sty, Abs, 4);
    t[0x8D] = instr("STA", Op::Sta, Abs, 4);
    t[0x8E] = instr("STX", Op::Stx, Abs, 4);

    t[0x90] = instr("BCC", Op::Bcc, Rel, 2);
    t[0x91] = instr("STA", Op::Sta, Izy, 6);
    t[0x94] = instr("STY", Op::Sty, Zpx, 4);
    t[0x95] = instr("STA", Op::Sta, Zpx, 4);
    t[0x96] = instr("STX", Op::Stx, Zpy, 4);
    t[0x98] = instr("TYA", Op::Tya, Imp, 2);
    t[0x99] = instr("STA", Op::Sta, Aby, 5);
    t[0x9A] = instr("TXS", Op::Txs, Imp, 2);
    t[0x9D] = instr("STA", Op::Sta, Abx, 5);

    t[0xA0] = instr("LDY", Op::Ldy, Imm, 2);
    t[0xA1] = instr("LDA", Op::Lda, Izx, 6);
    t[0xA2] = instr("LDX", Op::Ldx, Imm, 2);
    t[0xA4] = instr("LDY", Op::Ldy, Zp0, 3);
    t[0xA5] = instr("LDA", Op::Lda, Zp0, 3);
    t[0xA6] = instr("LDX", Op::Ldx, Zp0, 3);
    t[0xA8] = instr("TAY", Op::Tay, Imp, 2);
    t[0xA9] = instr("LDA", Op::Lda, Imm, 2);
    t[0xAA] = instr("TAX", Op::Tax, Imp, 2);
    t[0xAC] = instr("LDY", Op::Ldy, Abs, 4);
    t[0xAD] = instr("LDA", Op::Lda, Abs, 4);
    t[0xAE] = instr("LDX", Op::Ldx, Abs, 4);

    t[0xB0] = instr("BCS", Op::Bcs, Rel, 2);
    t[0xB1] = instr("LDA", Op::Lda, Izy, 5);
    t[0xB4] = instr("LDY", Op::Ldy, Zpx, 4);
    t[0xB5] = instr("LDA", Op::Lda, Zpx, 4);
    t[0xB6] = instr("LDX", Op::Ldx, Zpy, 4);
    t[0xB8] = instr("CLV", Op::Clv, Imp, 2);
    t[0xB9] = instr("LDA", Op::Lda, Aby, 4);
    t[0xBA] = instr("TSX", Op::Tsx, Imp, 2);
    t[0xBC] = instr("LDY", Op::Ldy, Abx, 4);
    t[0xBD] = instr("LDA", Op::Lda, Abx, 4);
    t[0xBE] = instr("LDX", Op::Ldx, Aby, 4);

    t[0xC0] = instr("CPY", Op::Cpy, Imm, 2);
    t[0xC1] = instr("CMP", Op::Cmp, Izx, 6);
    t[0xC4] = instr("CPY", Op::Cpy, Zp0, 3);
    t[0xC5] = instr("CMP", Op::Cmp, Zp0, 3);
    t[0xC6] = instr("DEC", Op::Dec, Zp0, 5);
    t[0xC8] = instr("INY", Op::Iny, Imp, 2);
    t[0xC9] = instr("CMP", Op::Cmp, Imm, 2);
    t[0xCA] = instr("DEX", Op::Dex, Imp, 2);
    t[0xCC] = instr("CPY", Op::Cpy, Abs, 4);
    t[0xCD] = instr("CMP", Op::Cmp, Abs, 4);
    t[0xCE] = instr("DEC", Op::Dec, Abs, 6);

    t[0xD0] = instr("BNE", Op::Bne, Rel, 2);
    t[0xD1] = instr("CMP", Op::Cmp, Izy, 5);
    t[0xD5] = instr("CMP", Op::Cmp, Zpx, 4);
    t[0xD6] = instr("DEC", Op::Dec, Zpx, 6);
    t[0xD8] = instr("CLD", Op::Cld, Imp, 2);
    t[0xD9] = instr("CMP", Op::Cmp, Aby, 4);
    t[0xDD] = instr("CMP", Op::Cmp, Abx, 4);
    t[0xDE] = instr("DEC", Op::Dec, Abx, 7);

    t[0xE0] = instr("CPX", Op::Cpx, Imm, 2);
    t[0xE1] = instr("SBC", Op::Sbc, Izx, 6);
    t[0xE4] = instr("CPX", Op::Cpx, Zp0, 3);
    t[0xE5] = instr("SBC", Op::Sbc, Zp0, 3);
    t[0xE6] = instr("INC", Op::Inc, Zp0, 5);
    t[0xE8] = instr("INX", Op::Inx, Imp, 2);
    t[0xE9] = instr("SBC", Op::Sbc, Imm, 2);
    t[0xEA] = instr("NOP", Op::Nop, Imp, 2);
    t[0xEC] = instr("CPX", Op::Cpx, Abs, 4);
    t[0xED] = instr("SBC", Op::Sbc, Abs, 4);
    t[0xEE] = instr("INC", Op::Inc, Abs, 6);

    t[0xF0] = instr("BEQ", Op::Beq, Rel, 2);
    t[0xF1] = instr("SBC", Op::Sbc, Izy, 5);
    t[0xF5] = instr("SBC", Op::Sbc, Zpx, 4);
    t[0xF6] = instr("INC", Op::Inc, Zpx, 6);
    t[0xF8] = instr("SED", Op::Sed, Imp, 2);
    t[0xF9] = instr("SBC", Op::Sbc, Aby, 4);
    t[0xFD] = instr("SBC", Op::Sbc, Abx, 4);
    t[0xFE] = instr("INC", Op::Inc, Abx, 7);

    // Undocumented opcodes
    t[0x03] = instr("SLO", Op::Slo, Izx, 8);
    t[0x07] = instr("SLO", Op::Slo, Zp0, 5);
    t[0x0F] = instr("SLO", Op::Slo, Abs, 6);
    t[0x13] = instr("SLO", Op::Slo, Izy, 8);
    t[0x17] = instr("SLO", Op::Slo, Zpx, 6);
    t[0x1B] = instr("SLO", Op::Slo, Aby, 7);
    t[0x1F] = instr("SLO", Op::Slo, Abx, 7);

    t[0x23] = instr("RLA", Op::Rla, Izx, 8);
    t[0x27] = instr("RLA", Op::Rla, Zp0, 5);
    t[0x2F] = instr("RLA", Op::Rla, Abs, 6);
    t[0x33] = instr("RLA", Op::Rla, Izy, 8);
    t[0x37] = instr("RLA", Op::Rla, Zpx, 6);
    t[0x3B] = instr("RLA", Op::Rla, Aby, 7);
    t[0x3F] = instr("RLA", Op::Rla, Abx, 7);

    t[0x43] = instr("SRE", Op::Sre, Izx, 8);
    t[0x47] = instr("SRE", Op::Sre, Zp0, 5);
    t[0x4F] = instr("SRE", Op::Sre, Abs, 6);
    t[0x53] = instr("SRE", Op::Sre, Izy, 8);
    t[0x57] = instr("SRE", Op::Sre, Zpx, 6);
    t[0x5B] = instr("SRE", Op::Sre, Aby, 7);
    t[0x5F] = instr("SRE", Op::Sre, Abx, 7);

    t[0x63] = instr("RRA", Op::Rra, Izx, 8);
    t[0x67] = instr("RRA", Op::Rra, Zp0, 5);
    t[0x6F] = instr("RRA", Op::Rra, Abs, 6);
    t[0x73] = instr("RRA", Op::Rra, Izy, 8);
    t[0x77] = instr("RRA", Op::Rra, Zpx, 6);
    t[0x7B] = instr("RRA", Op::Rra, Aby, 7);
    t[0x7F] = instr("RRA", Op::Rra, Abx, 7);

    t[0x83] = instr("SAX", Op::Sax, Izx, 6);
    t[0x87] = instr("SAX", Op::Sax, Zp0, 3);
    t[0x8F] = instr("SAX", Op::Sax, Abs, 4);
    t[0x97] = instr("SAX", Op::Sax, Zpy, 4);

    t[0xA3] = instr("LAX", Op::Lax, Izx, 6);
    t[0xA7] = instr("LAX", Op::Lax, Zp0, 3);
    t[0xAF] = instr("LAX", Op::Lax, Abs, 4);
    t[0xB3] = instr("LAX", Op::Lax, Izy, 5);
    t[0xB7] = instr("LAX", Op::Lax, Zpy, 4);
    t[0xBF] = instr("LAX", Op::Lax, Aby, 4);

    t[0xC3] = instr("DCP", Op::Dcp, Izx, 8);
    t[0xC7] = instr("DCP", Op::Dcp, Zp0, 5);
    t[0xCF] = instr("DCP", Op::Dcp, Abs, 6);
    t[0xD3] = instr("DCP", Op::Dcp, Izy, 8);
    t[0xD7] = instr("DCP", Op::Dcp, Zpx, 6);
    t[0xDB] = instr("DCP", Op::Dcp, Aby, 7);
    t[0xDF] = instr("DCP", Op::Dcp, Abx, 7);

    t[0xE3] = instr("ISC", Op::Isc, Izx, 8);
    t[0xE7] = instr("ISC", Op::Isc, Zp0, 5);
    t[0xEB] = instr("SBC", Op::Sbc, Imm, 2);
    t[0xEF] = instr("ISC", Op::Isc, Abs, 6);
    t[0xF3] = instr("ISC", Op::Isc, Izy, 8);
    t[0xF7] = instr("ISC", Op::Isc, Zpx, 6);
    t[0xFB] = instr("ISC", Op::Isc, Aby, 7);
    t[0xFF] = instr("ISC", Op::Isc, Abx, 7);

    t[0x0B] = instr("ANC", Op::Anc, Imm, 2);
    t[0x2B] = instr("ANC", Op::Anc, Imm, 2);
    t[0x4B] = instr("ASR", Op::Asr, Imm, 2);
    t[0x6B] = instr("ARR", Op::Arr, Imm, 2);
    t[0x8B] = instr("ANE", Op::Ane, Imm, 2);
    t[0xAB] = instr("LXA", Op::Lxa, Imm, 2);
    t[0xCB] = instr("AXS", Op::Axs, Imm, 2);
    t[0x93] = instr("SHA", Op::Sha, Izy, 6);
    t[0x9F] = instr("SHA", Op::Sha, Aby, 5);
    t[0x9E] = instr("SHX", Op::Shx, Aby, 5);
    t[0x9C] = instr("SHY", Op::Shy, Abx, 5);
    t[0x9B] = instr("SHS", Op::Shs, Aby, 5);
    t[0xBB] = instr("LAE", Op::Lae, Aby, 4);

    t[0x1A] = instr("NOP", Op::Nop, Imp, 2);
    t[0x3A] = instr("NOP", Op::Nop, Imp, 2);
    t[0x5A] = instr("NOP", Op::Nop, Imp, 2);
    t[0x7A] = instr("NOP", Op::Nop, Imp, 2);
    t[0xDA] = instr("NOP", Op::Nop, Imp, 2);
    t[0xFA] = instr("NOP", Op::Nop, Imp, 2);

    t[0x80] = instr("NOP", Op::NopRead, Imm, 2);
    t[0x82] = instr("NOP", Op::NopRead, Imm, 2);
    t[0x89] = instr("NOP", Op::NopRead, Imm, 2);
    t[0xC2] = instr("NOP", Op::NopRead, Imm, 2);
    t[0xE2] = instr("NOP", Op::NopRead, Imm, 2);

    t[0x04] = instr("NOP", Op::NopRead, Zp0, 3);
    t[0x44] = instr("NOP", Op::NopRead, Zp0, 3);
    t[0x64] = instr("NOP", Op::NopRead, Zp0, 3);

    t[0x14] = instr("NOP", Op::NopRead, Zpx, 4);
    t[0x34] = instr("NOP", Op::NopRead, Zpx, 4);
    t[0x54] = instr("NOP", Op::NopRead, Zpx, 4);
    t[0x74] = instr("NOP", Op::NopRead, Zpx, 4);
    t[0xD4] = instr("NOP", Op::NopRead, Zpx, 4);
    t[0xF4] = instr("NOP", Op::NopRead, Zpx, 4);

    t[0x0C] = instr("NOP", Op::NopRead, Abs, 4);
    t[0x1C] = instr("NOP", Op::NopRead, Abx, 4);
    t[0x3C] = instr("NOP", Op::NopRead, Abx, 4);
    t[0x5C] = instr("NOP", Op::NopRead, Abx, 4);
    t[0x7C] = instr("NOP", Op::NopRead, Abx, 4);
    t[0xDC] = instr("NOP", Op::NopRead, Abx, 4);
    t[0xFC] = instr("NOP", Op::NopRead, Abx, 4);

    t
}

#[derive(Debug, Clone)]
pub struct Cpu {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub pc: u16,
    pub status: u8,
    pub cycle_counter: u64,
    // Decode scratch
    opcode: u8,
    fetched: u8,
    addr_abs: u16,
    addr_rel: u16,
    base_high: u8,
    branch_extra: u8,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFD,
            pc: 0,
            status: FLAG_U | FLAG_I,
            cycle_counter: 0,
            opcode: 0,
            fetched: 0,
            addr_abs: 0,
            addr_rel: 0,
            base_high: 0,
            branch_extra: 0,
        }
    }

    pub fn reset(&mut self, bus: &mut dyn CpuBus) {
        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.sp = 0xFD;
        self.status = FLAG_U | FLAG_I;
        self.pc = self.read_word(bus, 0xFFFC);
    }

    pub fn nmi(&mut self, bus: &mut dyn CpuBus) {
        self.push(bus, (self.pc >> 8) as u8);
        self.push(bus, self.pc as u8);
        self.push_status(bus, false);
        self.set_flag(FLAG_I, true);
        self.pc = self.read_word(bus, 0xFFFA);
    }

    pub fn irq(&mut self, bus: &mut dyn CpuBus) {
        if self.flag(FLAG_I) {
            return;
        }
        self.push(bus, (self.pc >> 8) as u8);
        self.push(bus, self.pc as u8);
        self.push_status(bus, false);
        self.set_flag(FLAG_I, true);
        self.pc = self.read_word(bus, 0xFFFE);
    }

    /// Run one instruction (or one DMA stall cycle) and return the cycles it
    /// took. The bus IRQ line is sampled at the instruction boundary.
    pub fn step(&mut self, bus: &mut dyn CpuBus) -> u32 {
        if bus.consume_stall() {
            self.cycle_counter += 1;
            bus.tick(1);
            return 1;
        }

        self.opcode = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);

        let instr = INSTRUCTIONS[self.opcode as usize];
        let addr_extra = self.resolve_address(instr.mode, bus);
        let op_extra = self.operate(instr.op, bus);
        // The page-cross penalty only applies when both the addressing mode
        // crossed a page and the operation is penalty-eligible (reads).
        let mut cycles = u32::from(instr.cycles) + u32::from(addr_extra & op_extra);
        cycles += u32::from(self.branch_extra);
        self.branch_extra = 0;
        self.cycle_counter += u64::from(cycles);
        self.status |= FLAG_U;

        if bus.irq_pending() && !self.flag(FLAG_I) {
            bus.ack_irq();
            self.irq(bus);
        }
        bus.tick(cycles);
        cycles
    }

    // Bus access

    fn write(&mut self, bus: &mut dyn CpuBus, addr: u16, data: u8) {
        if addr == 0x4014 {
            bus.request_stall(513 + (self.cycle_counter & 1) as u32);
        }
        bus.write(addr, data);
    }

    fn read_word(&self, bus: &mut dyn CpuBus, addr: u16) -> u16 {
        let lo = bus.read(addr) as u16;
        let hi = bus.read(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    // Stack

    fn push(&mut self, bus: &mut dyn CpuBus, value: u8) {
        self.write(bus, 0x0100 | self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pop(&mut self, bus: &mut dyn CpuBus) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(0x0100 | self.sp as u16)
    }

    fn push_status(&mut self, bus: &mut dyn CpuBus, set_break: bool) {
        let mut flags = self.status | FLAG_U;
        if set_break {
            flags |= FLAG_B;
        } else {
            flags &= !FLAG_B;
        }
        self.push(bus, flags);
    }

    // Flags

    fn flag(&self, flag: u8) -> bool {
        self.status & flag != 0
    }

    fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.status |= flag;
        } else {
            self.status &= !flag;
        }
    }

    fn set_zn(&mut self, value: u8) {
        self.set_flag(FLAG_Z, value == 0);
        self.set_flag(FLAG_N, value & 0x80 != 0);
    }

    // Addressing

    fn cur_mode(&self) -> AddrMode {
        INSTRUCTIONS[self.opcode as usize].mode
    }

    fn cur_access(&self) -> Access {
        INSTRUCTIONS[self.opcode as usize].access
    }

    /// The unstable store group keeps the original high byte when indexing
    /// carries out of the low byte.
    fn unstable_store(&self) -> bool {
        matches!(self.opcode, 0x93 | 0x9F | 0x9B | 0x9C | 0x9E)
    }

    fn fetch(&mut self, bus: &mut dyn CpuBus) -> u8 {
        if self.cur_mode() != AddrMode::Imp {
            self.fetched = bus.read(self.addr_abs);
        }
        self.fetched
    }

    fn implied_dummy_read(&mut self, bus: &mut dyn CpuBus) {
        let _ = bus.read(self.pc);
    }

    fn resolve_address(&mut self, mode: AddrMode, bus: &mut dyn CpuBus) -> u8 {
        match mode {
            AddrMode::Imp => {
                self.fetched = self.a;
                0
            }
            AddrMode::Imm => {
                self.addr_abs = self.pc;
                self.pc = self.pc.wrapping_add(1);
                0
            }
            AddrMode::Zp0 => {
                self.addr_abs = bus.read(self.pc) as u16;
                self.pc = self.pc.wrapping_add(1);
                0
            }
            AddrMode::Zpx => {
                let base = bus.read(self.pc);
                self.pc = self.pc.wrapping_add(1);
                self.addr_abs = base.wrapping_add(self.x) as u16;
                0
            }
            AddrMode::Zpy => {
                let base = bus.read(self.pc);
                self.pc = self.pc.wrapping_add(1);
                self.addr_abs = base.wrapping_add(self.y) as u16;
                0
            }
            AddrMode::Abs => {
                let lo = bus.read(self.pc) as u16;
                self.pc = self.pc.wrapping_add(1);
                let hi = bus.read(self.pc) as u16;
                self.pc = self.pc.wrapping_add(1);
                self.base_high = hi as u8;
                self.addr_abs = (hi << 8) | lo;
                0
            }
            AddrMode::Abx => self.absolute_indexed(bus, self.x),
            AddrMode::Aby => self.absolute_indexed(bus, self.y),
            AddrMode::Ind => {
                let ptr_lo = bus.read(self.pc) as u16;
                self.pc = self.pc.wrapping_add(1);
                let ptr_hi = bus.read(self.pc) as u16;
                self.pc = self.pc.wrapping_add(1);
                let ptr = (ptr_hi << 8) | ptr_lo;
                let lo = bus.read(ptr) as u16;
                // The indirect fetch never carries into the high byte.
                let hi = bus.read((ptr & 0xFF00) | (ptr as u8).wrapping_add(1) as u16) as u16;
                self.addr_abs = (hi << 8) | lo;
                0
            }
            AddrMode::Izx => {
                let t = bus.read(self.pc);
                self.pc = self.pc.wrapping_add(1);
                let lo = bus.read(t.wrapping_add(self.x) as u16) as u16;
                let hi = bus.read(t.wrapping_add(self.x).wrapping_add(1) as u16) as u16;
                self.addr_abs = (hi << 8) | lo;
                0
            }
            AddrMode::Izy => {
                let t = bus.read(self.pc);
                self.pc = self.pc.wrapping_add(1);
                let lo = bus.read(t as u16);
                let hi = bus.read(t.wrapping_add(1) as u16);
                self.base_high = hi;
                self.indexed_effective(bus, lo, hi, self.y)
            }
            AddrMode::Rel => {
                self.addr_rel = bus.read(self.pc) as u16;
                self.pc = self.pc.wrapping_add(1);
                if self.addr_rel & 0x80 != 0 {
                    self.addr_rel |= 0xFF00;
                }
                0
            }
        }
    }

    fn absolute_indexed(&mut self, bus: &mut dyn CpuBus, index: u8) -> u8 {
        let lo = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        let hi = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        self.base_high = hi;
        self.indexed_effective(bus, lo, hi, index)
    }

    /// Shared ABX/ABY/IZY tail: effective address, the dummy read at the
    /// pre-fixup address, and the page-cross penalty for reads.
    fn indexed_effective(&mut self, bus: &mut dyn CpuBus, lo: u8, hi: u8, index: u8) -> u8 {
        let base = (hi as u16) << 8 | lo as u16;
        self.addr_abs = if self.unstable_store() {
            // Keep the un-incremented high byte; the carry is lost.
            (self.base_high as u16) << 8 | lo.wrapping_add(index) as u16
        } else {
            base.wrapping_add(index as u16)
        };
        let page_cross = (self.addr_abs & 0xFF00) != (base & 0xFF00);
        let access = self.cur_access();
        if matches!(access, Access::Write | Access::Rmw) || (access == Access::Read && page_cross) {
            let _ = bus.read((base & 0xFF00) | (self.addr_abs & 0x00FF));
        }
        u8::from(access == Access::Read && page_cross)
    }

    // Operations

    fn operate(&mut self, op: Op, bus: &mut dyn CpuBus) -> u8 {
        match op {
            Op::Adc => {
                let value = self.fetch(bus);
                self.adc_with(value);
                1
            }
            Op::And => {
                self.a &= self.fetch(bus);
                self.set_zn(self.a);
                1
            }
            Op::Asl => {
                let value = self.rmw_fetch(bus);
                self.set_flag(FLAG_C, value & 0x80 != 0);
                let result = value << 1;
                self.set_zn(result);
                self.rmw_store(bus, result);
                0
            }
            Op::Bcc => self.branch(bus, !self.flag(FLAG_C)),
            Op::Bcs => self.branch(bus, self.flag(FLAG_C)),
            Op::Beq => self.branch(bus, self.flag(FLAG_Z)),
            Op::Bit => {
                let value = self.fetch(bus);
                self.set_flag(FLAG_Z, self.a & value == 0);
                self.set_flag(FLAG_V, value & 0x40 != 0);
                self.set_flag(FLAG_N, value & 0x80 != 0);
                0
            }
            Op::Bmi => self.branch(bus, self.flag(FLAG_N)),
            Op::Bne => self.branch(bus, !self.flag(FLAG_Z)),
            Op::Bpl => self.branch(bus, !self.flag(FLAG_N)),
            Op::Brk => {
                self.implied_dummy_read(bus);
                // A second padding byte is skipped beyond the one the
                // immediate operand consumed.
                self.pc = self.pc.wrapping_add(1);
                self.push(bus, (self.pc >> 8) as u8);
                self.push(bus, self.pc as u8);
                self.push_status(bus, true);
                self.set_flag(FLAG_I, true);
                self.pc = self.read_word(bus, 0xFFFE);
                0
            }
            Op::Bvc => self.branch(bus, !self.flag(FLAG_V)),
            Op::Bvs => self.branch(bus, self.flag(FLAG_V)),
            Op::Clc => {
                self.implied_dummy_read(bus);
                self.set_flag(FLAG_C, false);
                0
            }
            Op::Cld => {
                self.implied_dummy_read(bus);
                self.set_flag(FLAG_D, false);
                0
            }
            Op::Cli => {
                self.implied_dummy_read(bus);
                self.set_flag(FLAG_I, false);
                0
            }
            Op::Clv => {
                self.implied_dummy_read(bus);
                self.set_flag(FLAG_V, false);
                0
            }
            Op::Cmp => {
                let value = self.fetch(bus);
                self.compare(self.a, value);
                1
            }
            Op::Cpx => {
                let value = self.fetch(bus);
                self.compare(self.x, value);
                0
            }
            Op::Cpy => {
                let value = self.fetch(bus);
                self.compare(self.y, value);
                0
            }
            Op::Dec => {
                let value = self.rmw_fetch(bus);
                let result = value.wrapping_sub(1);
                self.set_zn(result);
                self.rmw_store(bus, result);
                0
            }
            Op::Dex => {
                self.implied_dummy_read(bus);
                self.x = self.x.wrapping_sub(1);
                self.set_zn(self.x);
                0
            }
            Op::Dey => {
                self.implied_dummy_read(bus);
                self.y = self.y.wrapping_sub(1);
                self.set_zn(self.y);
                0
            }
            Op::Eor => {
                self.a ^= self.fetch(bus);
                self.set_zn(self.a);
                1
            }
            Op::Inc => {
                let value = self.rmw_fetch(bus);
                let result = value.wrapping_add(1);
                self.set_zn(result);
                self.rmw_store(bus, result);
                0
            }
            Op::Inx => {
                self.implied_dummy_read(bus);
                self.x = self.x.wrapping_add(1);
                self.set_zn(self.x);
                0
            }
            Op::Iny => {
                self.implied_dummy_read(bus);
                self.y = self.y.wrapping_add(1);
                self.set_zn(self.y);
                0
            }
            Op::Jmp => {
                self.pc = self.addr_abs;
                0
            }
            Op::Jsr => {
                self.pc = self.pc.wrapping_sub(1);
                self.push(bus, (self.pc >> 8) as u8);
                self.push(bus, self.pc as u8);
                self.pc = self.addr_abs;
                // Hardware leaves the target high byte on the data lines.
                bus.set_data_bus((self.addr_abs >> 8) as u8);
                0
            }
            Op::Lda => {
                self.a = self.fetch(bus);
                self.set_zn(self.a);
                1
            }
            Op::Ldx => {
                self.x = self.fetch(bus);
                self.set_zn(self.x);
                1
            }
            Op::Ldy => {
                self.y = self.fetch(bus);
                self.set_zn(self.y);
                1
            }
            Op::Lsr => {
                let value = self.rmw_fetch(bus);
                self.set_flag(FLAG_C, value & 0x01 != 0);
                let result = value >> 1;
                self.set_zn(result);
                self.rmw_store(bus, result);
                0
            }
            Op::Nop => {
                self.implied_dummy_read(bus);
                if self.cur_mode() != AddrMode::Imp {
                    let _ = self.fetch(bus);
                }
                0
            }
            Op::NopRead => {
                self.implied_dummy_read(bus);
                if self.cur_mode() != AddrMode::Imp {
                    let _ = self.fetch(bus);
                }
                1
            }
            Op::Ora => {
                self.a |= self.fetch(bus);
                self.set_zn(self.a);
                1
            }
            Op::Pha => {
                self.implied_dummy_read(bus);
                self.push(bus, self.a);
                0
            }
            Op::Php => {
                self.implied_dummy_read(bus);
                self.push_status(bus, true);
                0
            }
            Op::Pla => {
                self.implied_dummy_read(bus);
                self.a = self.pop(bus);
                self.set_zn(self.a);
                0
            }
            Op::Plp => {
                self.implied_dummy_read(bus);
                self.status = self.pop(bus);
                self.set_flag(FLAG_U, true);
                0
            }
            Op::Rol => {
                let value = self.rmw_fetch(bus);
                let carry = u8::from(self.flag(FLAG_C));
                self.set_flag(FLAG_C, value & 0x80 != 0);
                let result = (value << 1) | carry;
                self.set_zn(result);
                self.rmw_store(bus, result);
                0
            }
            Op::Ror => {
                let value = self.rmw_fetch(bus);
                let carry = u8::from(self.flag(FLAG_C)) << 7;
                self.set_flag(FLAG_C, value & 0x01 != 0);
                let result = (value >> 1) | carry;
                self.set_zn(result);
                self.rmw_store(bus, result);
                0
            }
            Op::Rti => {
                self.implied_dummy_read(bus);
                self.status = self.pop(bus);
                self.set_flag(FLAG_U, true);
                let lo = self.pop(bus) as u16;
                let hi = self.pop(bus) as u16;
                self.pc = (hi << 8) | lo;
                0
            }
            Op::Rts => {
                self.implied_dummy_read(bus);
                let lo = self.pop(bus) as u16;
                let hi = self.pop(bus) as u16;
                self.pc = ((hi << 8) | lo).wrapping_add(1);
                0
            }
            Op::Sbc => {
                let value = self.fetch(bus);
                self.sbc_with(value);
                1
            }
            Op::Sec => {
                self.implied_dummy_read(bus);
                self.set_flag(FLAG_C, true);
                0
            }
            Op::Sed => {
                self.implied_dummy_read(bus);
                self.set_flag(FLAG_D, true);
                0
            }
            Op::Sei => {
                self.implied_dummy_read(bus);
                self.set_flag(FLAG_I, true);
                0
            }
            Op::Sta => {
                self.write(bus, self.addr_abs, self.a);
                0
            }
            Op::Stx => {
                self.write(bus, self.addr_abs, self.x);
                0
            }
            Op::Sty => {
                self.write(bus, self.addr_abs, self.y);
                0
            }
            Op::Tax => {
                self.implied_dummy_read(bus);
                self.x = self.a;
                self.set_zn(self.x);
                0
            }
            Op::Tay => {
                self.implied_dummy_read(bus);
                self.y = self.a;
                self.set_zn(self.y);
                0
            }
            Op::Tsx => {
                self.implied_dummy_read(bus);
                self.x = self.sp;
                self.set_zn(self.x);
                0
            }
            Op::Txa => {
                self.implied_dummy_read(bus);
                self.a = self.x;
                self.set_zn(self.a);
                0
            }
            Op::Txs => {
                self.implied_dummy_read(bus);
                self.sp = self.x;
                0
            }
            Op::Tya => {
                self.implied_dummy_read(bus);
                self.a = self.y;
                self.set_zn(self.a);
                0
            }

            // Undocumented opcodes
            Op::Slo => {
                let value = self.rmw_fetch(bus);
                self.set_flag(FLAG_C, value & 0x80 != 0);
                let result = value << 1;
                self.rmw_store(bus, result);
                self.a |= result;
                self.set_zn(self.a);
                0
            }
            Op::Rla => {
                let value = self.rmw_fetch(bus);
                let carry = u8::from(self.flag(FLAG_C));
                self.set_flag(FLAG_C, value & 0x80 != 0);
                let result = (value << 1) | carry;
                self.rmw_store(bus, result);
                self.a &= result;
                self.set_zn(self.a);
                0
            }
            Op::Sre => {
                let value = self.rmw_fetch(bus);
                self.set_flag(FLAG_C, value & 0x01 != 0);
                let result = value >> 1;
                self.rmw_store(bus, result);
                self.a ^= result;
                self.set_zn(self.a);
                0
            }
            Op::Rra => {
                let value = self.rmw_fetch(bus);
                let carry = u8::from(self.flag(FLAG_C)) << 7;
                self.set_flag(FLAG_C, value & 0x01 != 0);
                let result = (value >> 1) | carry;
                self.rmw_store(bus, result);
                self.adc_with(result);
                0
            }
            Op::Sax => {
                self.write(bus, self.addr_abs, self.a & self.x);
                0
            }
            Op::Lax => {
                let value = self.fetch(bus);
                self.a = value;
                self.x = value;
                self.set_zn(value);
                1
            }
            Op::Dcp => {
                let value = self.rmw_fetch(bus);
                let result = value.wrapping_sub(1);
                self.rmw_store(bus, result);
                self.compare(self.a, result);
                0
            }
            Op::Isc => {
                let value = self.rmw_fetch(bus);
                let result = value.wrapping_add(1);
                self.rmw_store(bus, result);
                self.sbc_with(result);
                0
            }
            Op::Anc => {
                self.a &= self.fetch(bus);
                self.set_zn(self.a);
                self.set_flag(FLAG_C, self.a & 0x80 != 0);
                0
            }
            Op::Asr => {
                self.a &= self.fetch(bus);
                self.set_flag(FLAG_C, self.a & 0x01 != 0);
                self.a >>= 1;
                self.set_zn(self.a);
                0
            }
            Op::Arr => {
                self.a &= self.fetch(bus);
                let carry = u8::from(self.flag(FLAG_C)) << 7;
                self.a = (self.a >> 1) | carry;
                self.set_zn(self.a);
                self.set_flag(FLAG_C, self.a & 0x40 != 0);
                self.set_flag(FLAG_V, ((self.a >> 5) ^ (self.a >> 6)) & 0x01 != 0);
                0
            }
            Op::Ane => {
                let value = self.fetch(bus);
                self.a = (self.a | 0xEE) & self.x & value;
                self.set_zn(self.a);
                0
            }
            Op::Lxa => {
                let value = self.fetch(bus);
                self.a = (self.a | 0xEE) & value;
                self.x = self.a;
                self.set_zn(self.a);
                0
            }
            Op::Axs => {
                let value = self.fetch(bus);
                let masked = self.a & self.x;
                self.set_flag(FLAG_C, masked >= value);
                self.x = masked.wrapping_sub(value);
                self.set_zn(self.x);
                0
            }
            Op::Sha => {
                let high = (self.addr_abs >> 8) as u8;
                self.write(bus, self.addr_abs, self.a & self.x & high.wrapping_add(1));
                0
            }
            Op::Shx => {
                let high = (self.addr_abs >> 8) as u8;
                self.write(bus, self.addr_abs, self.x & high.wrapping_add(1));
                0
            }
            Op::Shy => {
                let high = (self.addr_abs >> 8) as u8;
                self.write(bus, self.addr_abs, self.y & high.wrapping_add(1));
                0
            }
            Op::Shs => {
                self.sp = self.a & self.x;
                let high = (self.addr_abs >> 8) as u8;
                self.write(bus, self.addr_abs, self.sp & high.wrapping_add(1));
                0
            }
            Op::Lae => {
                let value = self.fetch(bus) & self.sp;
                self.a = value;
                self.x = value;
                self.sp = value;
                self.set_zn(value);
                1
            }
        }
    }

    // Shared operation tails

    /// Fetch for a read-modify-write op, writing the original value straight
    /// back (the double write is observable through MMIO).
    fn rmw_fetch(&mut self, bus: &mut dyn CpuBus) -> u8 {
        if self.cur_mode() == AddrMode::Imp {
            self.implied_dummy_read(bus);
            return self.a;
        }
        let value = bus.read(self.addr_abs);
        self.fetched = value;
        self.write(bus, self.addr_abs, value);
        value
    }

    fn rmw_store(&mut self, bus: &mut dyn CpuBus, result: u8) {
        if self.cur_mode() == AddrMode::Imp {
            self.a = result;
        } else {
            self.write(bus, self.addr_abs, result);
        }
    }

    fn adc_with(&mut self, value: u8) {
        let sum = self.a as u16 + value as u16 + u16::from(self.flag(FLAG_C));
        self.set_flag(FLAG_C, sum > 0xFF);
        self.set_flag(
            FLAG_V,
            (!(self.a as u16 ^ value as u16) & (self.a as u16 ^ sum)) & 0x80 != 0,
        );
        self.a = sum as u8;
        self.set_zn(self.a);
    }

    fn sbc_with(&mut self, value: u8) {
        let inv = value ^ 0xFF;
        let sum = self.a as u16 + inv as u16 + u16::from(self.flag(FLAG_C));
        self.set_flag(FLAG_C, sum & 0xFF00 != 0);
        self.set_flag(
            FLAG_V,
            (sum ^ self.a as u16) & (sum ^ inv as u16) & 0x80 != 0,
        );
        self.a = sum as u8;
        self.set_zn(self.a);
    }

    fn compare(&mut self, register: u8, value: u8) {
        self.set_flag(FLAG_C, register >= value);
        self.set_zn(register.wrapping_sub(value));
    }

    /// Taken branches cost one extra cycle, two when crossing a page, with
    /// dummy reads at the next instruction byte and the pre-fixup address.
    fn branch(&mut self, bus: &mut dyn CpuBus, condition: bool) -> u8 {
        if condition {
            let _ = bus.read(self.pc);
            let old_pc = self.pc;
            self.pc = self.pc.wrapping_add(self.addr_rel);
            if (self.pc & 0xFF00) != (old_pc & 0xFF00) {
                let _ = bus.read((old_pc & 0xFF00) | (self.pc & 0x00FF));
                self.branch_extra = 2;
            } else {
                self.branch_extra = 1;
            }
        }
        0
    }
}
