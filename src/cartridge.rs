use log::{debug, info};
use thiserror::Error;

const PRG_BANK_SIZE: usize = 16 * 1024;
const CHR_BANK_SIZE: usize = 8 * 1024;
const TRAINER_SIZE: usize = 512;

#[derive(Error, Debug)]
pub enum CartridgeError {
    #[error("invalid iNES header")]
    InvalidHeader,
    #[error("unsupported mapper: {0}")]
    UnsupportedMapper(u8),
    #[error("ROM image truncated")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
}

/// Mapper-specific register state. A cartridge carries exactly one variant,
/// chosen at load time.
#[derive(Debug, Clone)]
pub enum Mapper {
    Nrom(Nrom),
    Mmc1(Mmc1),
    Cnrom(Cnrom),
}

#[derive(Debug, Clone)]
pub struct Nrom {
    pub prg_banks: u8,
    pub chr_banks: u8,
}

#[derive(Debug, Clone)]
pub struct Mmc1 {
    pub shift: u8,
    pub shift_count: u8,
    pub control: u8,
    pub chr_bank0: u8,
    pub chr_bank1: u8,
    pub prg_bank: u8,
}

impl Mmc1 {
    fn new() -> Self {
        Self {
            shift: 0x10,
            shift_count: 0,
            control: 0x0C, // PRG mode 3, CHR mode 0
            chr_bank0: 0,
            chr_bank1: 0,
            prg_bank: 0,
        }
    }

    fn reset_shift(&mut self) {
        self.shift = 0x10;
        self.shift_count = 0;
    }
}

#[derive(Debug, Clone)]
pub struct Cnrom {
    pub chr_bank: u8,
}

/// Mask when the bank count is a power of two, modulo otherwise.
fn normalize_bank(bank: u8, bank_count: usize) -> usize {
    if bank_count == 0 {
        0
    } else if bank_count.is_power_of_two() {
        bank as usize & (bank_count - 1)
    } else {
        bank as usize % bank_count
    }
}

pub struct Cartridge {
    pub prg: Vec<u8>,
    pub chr: Vec<u8>,
    pub mapper_id: u8,
    pub has_chr_ram: bool,
    pub mirroring: Mirroring,
    pub mapper: Mapper,
}

impl Cartridge {
    /// Parse an iNES image. CHR-less images get 8 KiB of zeroed CHR-RAM.
    pub fn load(data: &[u8]) -> Result<Self, CartridgeError> {
        if data.len() < 16 || data[0..4] != [0x4E, 0x45, 0x53, 0x1A] {
            return Err(CartridgeError::InvalidHeader);
        }

        let prg_banks = data[4];
        let chr_banks = data[5];
        let flags6 = data[6];
        let flags7 = data[7];

        let mapper_id = (flags7 & 0xF0) | (flags6 >> 4);
        let mirroring = if flags6 & 0x01 == 0 {
            Mirroring::Horizontal
        } else {
            Mirroring::Vertical
        };

        let mapper = match mapper_id {
            0 => Mapper::Nrom(Nrom {
                prg_banks,
                chr_banks,
            }),
            1 => Mapper::Mmc1(Mmc1::new()),
            3 => Mapper::Cnrom(Cnrom { chr_bank: 0 }),
            id => return Err(CartridgeError::UnsupportedMapper(id)),
        };

        let mut offset = 16;
        if flags6 & 0x04 != 0 {
            offset += TRAINER_SIZE;
        }

        let prg_size = prg_banks as usize * PRG_BANK_SIZE;
        let chr_size = chr_banks as usize * CHR_BANK_SIZE;
        if data.len() < offset + prg_size + chr_size {
            return Err(CartridgeError::Truncated);
        }

        let prg = data[offset..offset + prg_size].to_vec();
        let has_chr_ram = chr_size == 0;
        let chr = if has_chr_ram {
            vec![0; CHR_BANK_SIZE]
        } else {
            data[offset + prg_size..offset + prg_size + chr_size].to_vec()
        };

        info!(
            "loaded cartridge: mapper {}, {} KiB PRG, {} KiB CHR{}, {:?} mirroring",
            mapper_id,
            prg.len() / 1024,
            chr.len() / 1024,
            if has_chr_ram { " (RAM)" } else { "" },
            mirroring
        );

        Ok(Self {
            prg,
            chr,
            mapper_id,
            has_chr_ram,
            mirroring,
            mapper,
        })
    }

    fn prg_bank_count(&self) -> usize {
        self.prg.len() / PRG_BANK_SIZE
    }

    fn chr_bank_count(&self) -> usize {
        self.chr.len() / CHR_BANK_SIZE
    }

    /// CPU-side read. `None` means the address is outside the mapper's range
    /// and the bus should decode it instead.
    pub fn cpu_read(&self, addr: u16) -> Option<u8> {
        match &self.mapper {
            Mapper::Nrom(m) => {
                let mapped = nrom_cpu_map(m, addr)?;
                Some(self.prg[mapped])
            }
            Mapper::Mmc1(m) => {
                if addr < 0x8000 {
                    return None;
                }
                let prg_mode = (m.control >> 2) & 0x03;
                let bank_count = self.prg_bank_count();
                let bank = (m.prg_bank & 0x0F) as usize;
                let mapped = match prg_mode {
                    0 | 1 => {
                        // 32 KiB bank, low bit of the register ignored
                        let bank32 = bank & 0x0E;
                        if addr < 0xC000 {
                            bank32 * PRG_BANK_SIZE + (addr as usize - 0x8000)
                        } else {
                            (bank32 + 1) * PRG_BANK_SIZE + (addr as usize - 0xC000)
                        }
                    }
                    2 => {
                        if addr < 0xC000 {
                            addr as usize - 0x8000
                        } else {
                            (bank % bank_count) * PRG_BANK_SIZE + (addr as usize - 0xC000)
                        }
                    }
                    _ => {
                        if addr < 0xC000 {
                            (bank % bank_count) * PRG_BANK_SIZE + (addr as usize - 0x8000)
                        } else {
                            (bank_count - 1) * PRG_BANK_SIZE + (addr as usize - 0xC000)
                        }
                    }
                };
                self.prg.get(mapped).copied()
            }
            Mapper::Cnrom(_) => {
                if addr < 0x8000 {
                    return None;
                }
                let mapped = if self.prg.len() == PRG_BANK_SIZE {
                    (addr & 0x3FFF) as usize
                } else {
                    addr as usize - 0x8000
                };
                self.prg.get(mapped).copied()
            }
        }
    }

    /// CPU-side write. Returns true when the mapper consumed the address;
    /// bank and control registers latch here.
    pub fn cpu_write(&mut self, addr: u16, data: u8) -> bool {
        match &mut self.mapper {
            Mapper::Nrom(m) => nrom_cpu_map(m, addr).is_some(),
            Mapper::Mmc1(m) => {
                if addr < 0x8000 {
                    return false;
                }
                if data & 0x80 != 0 {
                    m.reset_shift();
                    m.control |= 0x0C;
                    return true;
                }
                // LSB-first serial load; five writes latch one register.
                m.shift = (m.shift >> 1) | ((data & 0x01) << 4);
                m.shift_count += 1;
                if m.shift_count == 5 {
                    let value = m.shift;
                    match (addr >> 13) & 0x03 {
                        0 => {
                            m.control = value;
                            // Single-screen modes collapse to vertical.
                            self.mirroring = if value & 0x03 == 3 {
                                Mirroring::Horizontal
                            } else {
                                Mirroring::Vertical
                            };
                        }
                        1 => m.chr_bank0 = value,
                        2 => m.chr_bank1 = value,
                        _ => m.prg_bank = value,
                    }
                    debug!("MMC1 latched register {} = {value:#04X}", (addr >> 13) & 3);
                    m.reset_shift();
                }
                true
            }
            Mapper::Cnrom(m) => {
                if addr < 0x8000 {
                    return false;
                }
                let count = self.chr.len() / CHR_BANK_SIZE;
                m.chr_bank = normalize_bank(data, count) as u8;
                debug!("CNROM CHR bank -> {}", m.chr_bank);
                true
            }
        }
    }

    /// PPU-side read of the pattern area.
    pub fn ppu_read(&self, addr: u16) -> Option<u8> {
        let mapped = self.ppu_map(addr)?;
        self.chr.get(mapped).copied()
    }

    /// PPU-side write; consumes only when the pattern area is CHR-RAM.
    pub fn ppu_write(&mut self, addr: u16, data: u8) -> bool {
        if !self.has_chr_ram {
            return false;
        }
        match self.ppu_map(addr) {
            Some(mapped) if mapped < self.chr.len() => {
                self.chr[mapped] = data;
                true
            }
            _ => false,
        }
    }

    fn ppu_map(&self, addr: u16) -> Option<usize> {
        if addr >= 0x2000 {
            return None;
        }
        let addr = addr as usize;
        match &self.mapper {
            Mapper::Nrom(_) => Some(addr),
            Mapper::Mmc1(m) => {
                let chr_mode = (m.control >> 4) & 0x01;
                let mapped = if chr_mode == 0 {
                    (m.chr_bank0 as usize & 0x1E) * 0x1000 + addr
                } else if addr < 0x1000 {
                    m.chr_bank0 as usize * 0x1000 + addr
                } else {
                    m.chr_bank1 as usize * 0x1000 + (addr - 0x1000)
                };
                (mapped < self.chr.len()).then_some(mapped)
            }
            Mapper::Cnrom(m) => {
                let bank = normalize_bank(m.chr_bank, self.chr_bank_count());
                let mapped = bank * CHR_BANK_SIZE + addr;
                (mapped < self.chr.len()).then_some(mapped)
            }
        }
    }
}

fn nrom_cpu_map(mapper: &Nrom, addr: u16) -> Option<usize> {
    if addr < 0x8000 {
        return None;
    }
    if mapper.prg_banks > 1 {
        Some((addr & 0x7FFF) as usize)
    } else {
        Some((addr & 0x3FFF) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_rom(mapper: u8, prg_banks: u8, chr_banks: u8) -> Vec<u8> {
        let mut rom = vec![0x4E, 0x45, 0x53, 0x1A, prg_banks, chr_banks, mapper << 4, 0];
        rom.resize(16, 0);
        let prg = prg_banks as usize * PRG_BANK_SIZE;
        let chr = chr_banks as usize * CHR_BANK_SIZE;
        // Tag each 16 KiB PRG bank and each 8 KiB CHR bank with its index.
        for i in 0..prg {
            rom.push((i / PRG_BANK_SIZE) as u8);
        }
        for i in 0..chr {
            rom.push(0x80 | (i / CHR_BANK_SIZE) as u8);
        }
        rom
    }

    #[test]
    fn rejects_bad_magic() {
        let mut rom = build_rom(0, 1, 1);
        rom[0] = 0x00;
        assert!(matches!(
            Cartridge::load(&rom),
            Err(CartridgeError::InvalidHeader)
        ));
    }

    #[test]
    fn rejects_truncated_image() {
        let mut rom = build_rom(0, 2, 1);
        rom.truncate(rom.len() - 1);
        assert!(matches!(
            Cartridge::load(&rom),
            Err(CartridgeError::Truncated)
        ));
    }

    #[test]
    fn rejects_unsupported_mapper() {
        let rom = build_rom(4, 1, 1);
        assert!(matches!(
            Cartridge::load(&rom),
            Err(CartridgeError::UnsupportedMapper(4))
        ));
    }

    #[test]
    fn trainer_is_skipped() {
        let mut rom = build_rom(0, 1, 1);
        rom[6] |= 0x04;
        rom.splice(16..16, std::iter::repeat(0xEE).take(TRAINER_SIZE));
        let cart = Cartridge::load(&rom).unwrap();
        assert_eq!(cart.prg[0], 0);
        assert_eq!(cart.chr[0], 0x80);
    }

    #[test]
    fn zero_chr_banks_allocates_chr_ram() {
        let rom = build_rom(0, 1, 0);
        let mut cart = Cartridge::load(&rom).unwrap();
        assert!(cart.has_chr_ram);
        assert_eq!(cart.chr.len(), CHR_BANK_SIZE);
        assert!(cart.ppu_write(0x0123, 0x42));
        assert_eq!(cart.ppu_read(0x0123), Some(0x42));
    }

    #[test]
    fn chr_rom_ignores_ppu_writes() {
        let rom = build_rom(0, 1, 1);
        let mut cart = Cartridge::load(&rom).unwrap();
        assert!(!cart.ppu_write(0x0000, 0x42));
        assert_eq!(cart.ppu_read(0x0000), Some(0x80));
    }

    #[test]
    fn nrom_16k_mirrors_upper_half() {
        let rom = build_rom(0, 1, 1);
        let cart = Cartridge::load(&rom).unwrap();
        assert_eq!(cart.cpu_read(0x8000), cart.cpu_read(0xC000));
        assert_eq!(cart.cpu_read(0x7FFF), None);
    }

    #[test]
    fn nrom_32k_is_flat() {
        let mut rom = build_rom(0, 2, 1);
        // Distinguish the two banks at their first byte.
        let base = 16;
        rom[base] = 0xAA;
        rom[base + PRG_BANK_SIZE] = 0xBB;
        let cart = Cartridge::load(&rom).unwrap();
        assert_eq!(cart.cpu_read(0x8000), Some(0xAA));
        assert_eq!(cart.cpu_read(0xC000), Some(0xBB));
    }

    fn mmc1_serial_write(cart: &mut Cartridge, addr: u16, value: u8) {
        for i in 0..5 {
            cart.cpu_write(addr, (value >> i) & 0x01);
        }
    }

    #[test]
    fn mmc1_five_writes_latch_one_register() {
        let rom = build_rom(1, 8, 2);
        let mut cart = Cartridge::load(&rom).unwrap();
        mmc1_serial_write(&mut cart, 0xE000, 0x03);
        let Mapper::Mmc1(m) = &cart.mapper else {
            panic!("expected MMC1");
        };
        assert_eq!(m.prg_bank, 0x03);
        assert_eq!(m.shift, 0x10);
        assert_eq!(m.shift_count, 0);
    }

    #[test]
    fn mmc1_reset_bit_forces_prg_mode_3() {
        let rom = build_rom(1, 8, 2);
        let mut cart = Cartridge::load(&rom).unwrap();
        // Put the mapper in PRG mode 0 first.
        mmc1_serial_write(&mut cart, 0x8000, 0x00);
        cart.cpu_write(0x8000, 0x01);
        cart.cpu_write(0x8000, 0x80);
        let Mapper::Mmc1(m) = &cart.mapper else {
            panic!("expected MMC1");
        };
        assert_eq!(m.control & 0x0C, 0x0C);
        assert_eq!(m.shift, 0x10);
        assert_eq!(m.shift_count, 0);
    }

    #[test]
    fn mmc1_prg_mode_3_fixes_last_bank() {
        let rom = build_rom(1, 8, 2);
        let mut cart = Cartridge::load(&rom).unwrap();
        mmc1_serial_write(&mut cart, 0xE000, 0x00);
        assert_eq!(cart.cpu_read(0x8000), Some(0)); // switchable bank 0
        assert_eq!(cart.cpu_read(0xC000), Some(7)); // fixed last bank
        mmc1_serial_write(&mut cart, 0xE000, 0x02);
        assert_eq!(cart.cpu_read(0x8000), Some(2));
        assert_eq!(cart.cpu_read(0xC000), Some(7));
    }

    #[test]
    fn mmc1_control_sets_mirroring() {
        let rom = build_rom(1, 2, 2);
        let mut cart = Cartridge::load(&rom).unwrap();
        mmc1_serial_write(&mut cart, 0x8000, 0x03 | 0x0C);
        assert_eq!(cart.mirroring, Mirroring::Horizontal);
        mmc1_serial_write(&mut cart, 0x8000, 0x02 | 0x0C);
        assert_eq!(cart.mirroring, Mirroring::Vertical);
        // Single-screen modes collapse to vertical.
        mmc1_serial_write(&mut cart, 0x8000, 0x0C);
        assert_eq!(cart.mirroring, Mirroring::Vertical);
    }

    #[test]
    fn cnrom_latches_masked_chr_bank() {
        let rom = build_rom(3, 2, 4);
        let mut cart = Cartridge::load(&rom).unwrap();
        assert_eq!(cart.ppu_read(0x0000), Some(0x80));
        cart.cpu_write(0x8000, 0x02);
        assert_eq!(cart.ppu_read(0x0000), Some(0x82));
        // Four banks: bank select wraps with a power-of-two mask.
        cart.cpu_write(0x8000, 0x05);
        assert_eq!(cart.ppu_read(0x0000), Some(0x81));
    }

    #[test]
    fn cnrom_non_power_of_two_uses_modulo() {
        let rom = build_rom(3, 2, 3);
        let mut cart = Cartridge::load(&rom).unwrap();
        cart.cpu_write(0x8000, 0x04);
        assert_eq!(cart.ppu_read(0x0000), Some(0x81));
    }
}
