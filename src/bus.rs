use crate::apu::Apu;
use crate::cartridge::Cartridge;
use crate::controller::Controller;
use crate::cpu::CpuBus;
use crate::ppu::Ppu;

/// CPU address-space multiplexer. Owns the PPU, APU, controller and the
/// cartridge; the CPU drives it through [`CpuBus`].
pub struct Bus {
    pub ppu: Ppu,
    pub apu: Apu,
    pub controller: Controller,
    pub cartridge: Option<Cartridge>,

    cpu_ram: [u8; 0x800],
    prg_ram: [u8; 0x2000],
    data_bus: u8,

    irq_pending: bool,
    stall_cycles: u32,

    dma_active: bool,
    dma_page: u8,
    dma_index: u16,
    dma_cycle: u32,
    dma_data: u8,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            ppu: Ppu::new(),
            apu: Apu::new(),
            controller: Controller::new(),
            cartridge: None,
            cpu_ram: [0; 0x800],
            prg_ram: [0; 0x2000],
            data_bus: 0,
            irq_pending: false,
            stall_cycles: 0,
            dma_active: false,
            dma_page: 0,
            dma_index: 0,
            dma_cycle: 0,
            dma_data: 0,
        }
    }

    pub fn insert_cartridge(&mut self, cart: Cartridge) {
        self.ppu.set_mirroring(cart.mirroring);
        self.cartridge = Some(cart);
    }

    /// Advance the PPU one dot.
    pub fn ppu_tick(&mut self) {
        let Bus { ppu, cartridge, .. } = self;
        ppu.tick(cartridge.as_ref());
    }

    /// DMC sample fetches bypass the open-bus latch: RAM, PRG-RAM and the
    /// cartridge are visible, everything else reads zero.
    fn dmc_read(cpu_ram: &[u8; 0x800], prg_ram: &[u8; 0x2000], cart: Option<&Cartridge>, addr: u16) -> u8 {
        if let Some(value) = cart.and_then(|c| c.cpu_read(addr)) {
            return value;
        }
        match addr {
            0x0000..=0x1FFF => cpu_ram[(addr & 0x07FF) as usize],
            0x6000..=0x7FFF => prg_ram[(addr & 0x1FFF) as usize],
            _ => 0,
        }
    }

    /// Fill the audio buffer directly from the bus, so DMC fetches can see
    /// cartridge memory.
    pub fn apu_fill_buffer(&mut self, sample_rate: f64, out: &mut [f32]) {
        let Bus {
            apu,
            cpu_ram,
            prg_ram,
            cartridge,
            ..
        } = self;
        let cart = cartridge.as_ref();
        apu.fill_buffer(sample_rate, out, |addr| {
            Self::dmc_read(cpu_ram, prg_ram, cart, addr)
        });
    }

    fn step_dma(&mut self) {
        if !self.dma_active {
            return;
        }
        if self.dma_cycle % 2 == 0 {
            let addr = (self.dma_page as u16) << 8 | self.dma_index;
            self.dma_data = self.read(addr);
        } else {
            self.ppu.dma_write_oam(self.dma_data);
            self.dma_index += 1;
            if self.dma_index == 256 {
                self.dma_active = false;
            }
        }
        self.dma_cycle += 1;
    }

    fn start_dma(&mut self, page: u8) {
        self.dma_active = true;
        self.dma_page = page;
        self.dma_index = 0;
        self.dma_cycle = 0;
    }
}

impl CpuBus for Bus {
    fn read(&mut self, addr: u16) -> u8 {
        // The cartridge claims its ranges before anything else decodes.
        if let Some(cart) = &self.cartridge {
            if let Some(value) = cart.cpu_read(addr) {
                self.data_bus = value;
                return value;
            }
        }

        let value = match addr {
            0x0000..=0x1FFF => self.cpu_ram[(addr & 0x07FF) as usize],
            0x2000..=0x3FFF => {
                let reg = 0x2000 + (addr & 0x0007);
                let Bus { ppu, cartridge, .. } = self;
                ppu.cpu_read(reg, cartridge.as_ref())
            }
            0x4015 => self.apu.read_status(),
            0x4016 => {
                let bit = self.controller.read();
                (self.data_bus & 0xE0) | (bit & 0x01)
            }
            0x6000..=0x7FFF => self.prg_ram[(addr & 0x1FFF) as usize],
            // $4000-$4013, $4014, $4017 and unmapped space read open bus.
            _ => self.data_bus,
        };
        self.data_bus = value;
        value
    }

    fn write(&mut self, addr: u16, data: u8) {
        self.data_bus = data;

        if let Some(cart) = &mut self.cartridge {
            if cart.cpu_write(addr, data) {
                return;
            }
        }

        match addr {
            0x0000..=0x1FFF => self.cpu_ram[(addr & 0x07FF) as usize] = data,
            0x2000..=0x3FFF => {
                let reg = 0x2000 + (addr & 0x0007);
                let Bus { ppu, cartridge, .. } = self;
                ppu.cpu_write(reg, data, cartridge.as_mut());
            }
            0x4014 => self.start_dma(data),
            0x4016 => self.controller.write(data),
            0x4000..=0x4013 | 0x4015 | 0x4017 => {
                self.apu.cpu_write(addr, data);
                if addr == 0x4017 {
                    // The IRQ line level tracks bit 6 of every $4017 write.
                    self.irq_pending = data & 0x40 == 0;
                }
            }
            0x6000..=0x7FFF => self.prg_ram[(addr & 0x1FFF) as usize] = data,
            _ => {}
        }
    }

    fn request_stall(&mut self, cycles: u32) {
        if cycles > self.stall_cycles {
            self.stall_cycles = cycles;
        }
    }

    fn consume_stall(&mut self) -> bool {
        if self.stall_cycles > 0 {
            self.stall_cycles -= 1;
            self.step_dma();
            true
        } else {
            false
        }
    }

    fn irq_pending(&self) -> bool {
        self.irq_pending
    }

    fn ack_irq(&mut self) {
        self.irq_pending = false;
    }

    fn tick(&mut self, cycles: u32) {
        let Bus {
            apu,
            cpu_ram,
            prg_ram,
            cartridge,
            ..
        } = self;
        let cart = cartridge.as_ref();
        apu.step(cycles, |addr| Self::dmc_read(cpu_ram, prg_ram, cart, addr));
    }

    fn set_data_bus(&mut self, value: u8) {
        self.data_bus = value;
    }
}
