pub mod apu;
pub mod bus;
pub mod cartridge;
pub mod controller;
pub mod cpu;
pub mod emulator;
pub mod ppu;

pub use apu::Apu;
pub use bus::Bus;
pub use cartridge::{Cartridge, CartridgeError, Mirroring};
pub use controller::{Button, Controller};
pub use cpu::{Cpu, CpuBus};
pub use emulator::{Emulator, FRAME_HEIGHT, FRAME_WIDTH};
pub use ppu::{Ppu, NES_PALETTE};
