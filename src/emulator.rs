use log::debug;

use crate::bus::Bus;
use crate::cartridge::{Cartridge, CartridgeError};
use crate::controller::Button;
use crate::cpu::Cpu;

pub const FRAME_WIDTH: usize = crate::ppu::WIDTH;
pub const FRAME_HEIGHT: usize = crate::ppu::HEIGHT;

/// The console: CPU plus bus, and the outer frame loop. One call to
/// [`Emulator::step_frame`] produces one 256x240 video frame; audio is pulled
/// separately through the APU sample producers.
pub struct Emulator {
    cpu: Cpu,
    bus: Bus,
    has_cart: bool,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Emulator {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            bus: Bus::new(),
            has_cart: false,
        }
    }

    /// Parse and insert a cartridge, then reset. On error the previous
    /// cartridge is gone and the emulator is left empty.
    pub fn load_rom(&mut self, bytes: &[u8]) -> Result<(), CartridgeError> {
        self.bus.cartridge = None;
        self.has_cart = false;
        let cart = Cartridge::load(bytes)?;
        self.bus.insert_cartridge(cart);
        self.has_cart = true;
        self.reset();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.cpu.reset(&mut self.bus);
        self.bus.apu.reset();
    }

    /// Run until the PPU reports the frame complete. Each CPU step feeds the
    /// PPU three dots per cycle; an NMI raised during a dot is serviced
    /// before the next instruction.
    pub fn step_frame(&mut self) {
        if !self.has_cart {
            return;
        }
        self.bus.ppu.reset_frame();
        while !self.bus.ppu.frame_complete {
            let cycles = self.cpu.step(&mut self.bus);
            for _ in 0..cycles * 3 {
                self.bus.ppu_tick();
                if self.bus.ppu.nmi_requested {
                    debug!(
                        "NMI at scanline {} cycle {}",
                        self.bus.ppu.scanline, self.bus.ppu.cycle
                    );
                    self.cpu.nmi(&mut self.bus);
                }
            }
        }
    }

    pub fn framebuffer(&self) -> &[u32] {
        self.bus.ppu.frame()
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        self.bus.controller.set_button(button, pressed);
    }

    /// One mixed, filtered audio sample at the given rate. No-op (silence)
    /// without a cartridge.
    pub fn apu_next_sample(&mut self, sample_rate: f64) -> f32 {
        if !self.has_cart {
            return 0.0;
        }
        self.bus.apu.next_sample(sample_rate)
    }

    /// Fill `out` with samples, advancing the APU clock by the matching
    /// number of CPU cycles.
    pub fn apu_fill_buffer(&mut self, sample_rate: f64, out: &mut [f32]) {
        if !self.has_cart {
            out.fill(0.0);
            return;
        }
        self.bus.apu_fill_buffer(sample_rate, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBus;

    /// Build an NROM image whose PRG starts at $C000 (one 16 KiB bank,
    /// mirrored at $8000).
    fn nrom_with_program(program: &[u8], reset: u16, nmi: u16) -> Vec<u8> {
        let mut rom = vec![0x4E, 0x45, 0x53, 0x1A, 1, 1, 0, 0];
        rom.resize(16, 0);
        let mut prg = vec![0u8; 0x4000];
        prg[..program.len()].copy_from_slice(program);
        // Vectors live at the top of the bank ($FFFA/$FFFC map to $3FFA/$3FFC).
        prg[0x3FFA] = nmi as u8;
        prg[0x3FFB] = (nmi >> 8) as u8;
        prg[0x3FFC] = reset as u8;
        prg[0x3FFD] = (reset >> 8) as u8;
        rom.extend_from_slice(&prg);
        rom.resize(rom.len() + 0x2000, 0);
        rom
    }

    fn mmc1_image(prg_banks: u8) -> Vec<u8> {
        let mut rom = vec![0x4E, 0x45, 0x53, 0x1A, prg_banks, 1, 1 << 4, 0];
        rom.resize(16, 0);
        for bank in 0..prg_banks {
            let mut chunk = vec![bank; 0x4000];
            if bank == prg_banks - 1 {
                // Reset vector in the fixed last bank: $C000.
                chunk[0x3FFC] = 0x00;
                chunk[0x3FFD] = 0xC0;
            }
            rom.extend_from_slice(&chunk);
        }
        rom.resize(rom.len() + 0x2000, 0);
        rom
    }

    #[test]
    fn step_frame_without_rom_is_a_noop() {
        let mut emu = Emulator::new();
        emu.step_frame();
        assert!(emu.framebuffer().iter().all(|&p| p == 0));
        assert_eq!(emu.apu_next_sample(44_100.0), 0.0);
    }

    #[test]
    fn load_rom_rejects_garbage_and_leaves_emulator_empty() {
        let mut emu = Emulator::new();
        assert!(emu.load_rom(&[0u8; 4]).is_err());
        emu.step_frame(); // must not panic
    }

    #[test]
    fn reset_vector_dispatch_through_loaded_rom() {
        // Program: JMP $C000 (spin).
        let rom = nrom_with_program(&[0x4C, 0x00, 0xC0], 0xC000, 0xC000);
        let mut emu = Emulator::new();
        emu.load_rom(&rom).unwrap();
        assert_eq!(emu.cpu.pc, 0xC000);
        assert_eq!(emu.cpu.sp, 0xFD);
        assert_eq!(emu.cpu.status, 0x24);
    }

    #[test]
    fn frame_loop_runs_a_full_frame() {
        let rom = nrom_with_program(&[0x4C, 0x00, 0xC0], 0xC000, 0xC000);
        let mut emu = Emulator::new();
        emu.load_rom(&rom).unwrap();
        emu.step_frame();
        assert_eq!(emu.framebuffer().len(), FRAME_WIDTH * FRAME_HEIGHT);
        // The CPU ran roughly a frame's worth of cycles (29780 +/- one
        // instruction).
        let cycles = emu.cpu.cycle_counter;
        assert!((29_700..30_000).contains(&cycles), "cycles = {cycles}");
    }

    #[test]
    fn vblank_nmi_fires_exactly_once_per_frame() {
        // Reset routine: LDA #$80, STA $2000, then INC $00 forever.
        // NMI handler: INC $01, RTI.
        let program = [
            0xA9, 0x80, // LDA #$80
            0x8D, 0x00, 0x20, // STA $2000
            0xE6, 0x00, // loop: INC $00
            0x4C, 0x05, 0xC0, // JMP loop
        ];
        let nmi_handler = [0xE6, 0x01, 0x40]; // INC $01, RTI
        let mut rom = nrom_with_program(&program, 0xC000, 0xC100);
        // Place the NMI handler at $C100 (PRG offset 0x100).
        rom[16 + 0x100..16 + 0x100 + nmi_handler.len()].copy_from_slice(&nmi_handler);

        let mut emu = Emulator::new();
        emu.load_rom(&rom).unwrap();
        emu.step_frame();
        let nmi_count = CpuBus::read(&mut emu.bus, 0x0001);
        assert_eq!(nmi_count, 1);

        emu.step_frame();
        let nmi_count = CpuBus::read(&mut emu.bus, 0x0001);
        assert_eq!(nmi_count, 2);

        // VBlank flag reads clear it.
        let status = emu.bus.ppu.cpu_read(0x2002, None);
        let _ = status;
        let status = emu.bus.ppu.cpu_read(0x2002, None);
        assert_eq!(status & 0x80, 0);
    }

    #[test]
    fn mmc1_prg_mode_3_bank_switch_end_to_end() {
        let mut emu = Emulator::new();
        emu.load_rom(&mmc1_image(8)).unwrap();
        // Five zero writes to $E000 latch prgBank = 0.
        for _ in 0..5 {
            CpuBus::write(&mut emu.bus, 0xE000, 0x00);
        }
        assert_eq!(CpuBus::read(&mut emu.bus, 0x8000), 0);
        assert_eq!(CpuBus::read(&mut emu.bus, 0x9000), 0);
        // $C000-$FFFF stays pinned to the last bank (which holds the
        // vectors, so probe below them).
        assert_eq!(CpuBus::read(&mut emu.bus, 0xC123), 7);

        // Switch the low window to bank 2.
        for i in 0..5 {
            CpuBus::write(&mut emu.bus, 0xE000, (0x02 >> i) & 0x01);
        }
        assert_eq!(CpuBus::read(&mut emu.bus, 0x8000), 2);
        assert_eq!(CpuBus::read(&mut emu.bus, 0xC123), 7);
    }

    #[test]
    fn sprite_zero_hit_sets_and_clears_with_frame_boundaries() {
        // Background tile 1 is solid color 1; sprite 0 sits at (100, 32)
        // over it. CHR-RAM image so the test can draw its own patterns.
        let mut rom = vec![0x4E, 0x45, 0x53, 0x1A, 1, 0, 0, 0];
        rom.resize(16, 0);
        let mut prg = vec![0u8; 0x4000];
        prg[0] = 0x4C; // JMP $C000
        prg[1] = 0x00;
        prg[2] = 0xC0;
        prg[0x3FFC] = 0x00;
        prg[0x3FFD] = 0xC0;
        rom.extend_from_slice(&prg);

        let mut emu = Emulator::new();
        emu.load_rom(&rom).unwrap();

        // Solid tile 1 in CHR-RAM (plane 0 all ones).
        if let Some(cart) = emu.bus.cartridge.as_mut() {
            for row in 0..8 {
                cart.ppu_write(0x0010 + row, 0xFF);
            }
        }
        // Fill the first nametable with tile 1.
        for i in 0..0x3C0u16 {
            emu.bus.ppu.cpu_write(0x2006, (0x2000u16 + i >> 8) as u8, None);
            emu.bus.ppu.cpu_write(0x2006, (0x2000u16 + i) as u8, None);
            emu.bus.ppu.cpu_write(0x2007, 0x01, None);
        }
        // Sprite 0: Y=31 (drawn at 32), tile 1, X=100.
        emu.bus.ppu.oam[0] = 31;
        emu.bus.ppu.oam[1] = 0x01;
        emu.bus.ppu.oam[2] = 0x00;
        emu.bus.ppu.oam[3] = 100;
        // Enable background and sprites.
        emu.bus.ppu.cpu_write(0x2001, 0x18, None);

        // Drive dots up to just past the overlap scanline and observe the
        // flag while the frame is still in flight.
        while !(emu.bus.ppu.scanline == 34 && emu.bus.ppu.cycle == 1) {
            emu.bus.ppu_tick();
        }
        assert_eq!(emu.bus.ppu.status & 0x40, 0x40);

        // Scanline 261 dot 1 clears it again.
        while !(emu.bus.ppu.scanline == 261 && emu.bus.ppu.cycle == 2) {
            emu.bus.ppu_tick();
        }
        assert_eq!(emu.bus.ppu.status & 0x40, 0);
    }

    #[test]
    fn controller_buttons_reach_the_cpu_visible_port() {
        let rom = nrom_with_program(&[0x4C, 0x00, 0xC0], 0xC000, 0xC000);
        let mut emu = Emulator::new();
        emu.load_rom(&rom).unwrap();
        emu.set_button(Button::A, true);
        emu.set_button(Button::START, true);
        CpuBus::write(&mut emu.bus, 0x4016, 1);
        CpuBus::write(&mut emu.bus, 0x4016, 0);
        let bits: Vec<u8> = (0..8)
            .map(|_| CpuBus::read(&mut emu.bus, 0x4016) & 1)
            .collect();
        assert_eq!(bits, vec![1, 0, 0, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn apu_fill_buffer_produces_samples_with_rom_loaded() {
        let rom = nrom_with_program(&[0x4C, 0x00, 0xC0], 0xC000, 0xC000);
        let mut emu = Emulator::new();
        emu.load_rom(&rom).unwrap();
        // Kick pulse 1 into constant max volume.
        CpuBus::write(&mut emu.bus, 0x4015, 0x01);
        CpuBus::write(&mut emu.bus, 0x4000, 0x3F); // duty 0, constant volume 15
        CpuBus::write(&mut emu.bus, 0x4002, 0xFD); // timer low
        CpuBus::write(&mut emu.bus, 0x4003, 0x08); // timer high + length
        let mut out = [0.0f32; 512];
        emu.apu_fill_buffer(44_100.0, &mut out);
        assert!(out.iter().any(|&s| s > 0.0));
    }
}
