//! A flat guest memory map for tests and benches: 64 KiB of RAM at the
//! bottom of the address space and 2 MiB of ROM at 0x08000000. Writes to
//! ROM and accesses outside both regions are ignored; reads come back as
//! zero (there is no open-bus model here).

use crate::memory::{Bus, Memory};

const RAM_BASE: u32 = 0;
const RAM_SIZE: u32 = 0x1_0000;
const ROM_BASE: u32 = 0x0800_0000;
const ROM_SIZE: u32 = 0x20_0000;

pub(crate) struct TestMemory {
    ram: Vec<u8>,
    rom: Vec<u8>,
}

impl TestMemory {
    pub(crate) fn new() -> TestMemory {
        TestMemory {
            ram: vec![0; RAM_SIZE as usize],
            rom: vec![0; ROM_SIZE as usize],
        }
    }

    fn slot(&self, address: u32) -> Option<(&[u8], usize)> {
        if (RAM_BASE..RAM_BASE + RAM_SIZE).contains(&address) {
            Some((&self.ram, (address - RAM_BASE) as usize))
        } else if (ROM_BASE..ROM_BASE + ROM_SIZE).contains(&address) {
            Some((&self.rom, (address - ROM_BASE) as usize))
        } else {
            None
        }
    }

    // Seeding helpers for tests.

    pub(crate) fn write_rom_32(&mut self, address: u32, value: u32) {
        let offset = (address - ROM_BASE) as usize;
        self.rom[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn write_rom_16(&mut self, address: u32, value: u16) {
        let offset = (address - ROM_BASE) as usize;
        self.rom[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn write_rom_bytes(&mut self, address: u32, bytes: &[u8]) {
        let offset = (address - ROM_BASE) as usize;
        self.rom[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn write_ram_32(&mut self, address: u32, value: u32) {
        let offset = (address - RAM_BASE) as usize;
        self.ram[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl Memory for TestMemory {
    fn read_8(&mut self, address: u32, bus: Bus) -> u8 {
        self.fast_read_8(address, bus).unwrap_or(0)
    }

    fn read_16(&mut self, address: u32, bus: Bus) -> u16 {
        self.fast_read_16(address, bus).unwrap_or(0)
    }

    fn read_32(&mut self, address: u32, bus: Bus) -> u32 {
        self.fast_read_32(address, bus).unwrap_or(0)
    }

    fn write_8(&mut self, address: u32, value: u8, _bus: Bus) {
        if (RAM_BASE..RAM_BASE + RAM_SIZE).contains(&address) {
            self.ram[(address - RAM_BASE) as usize] = value;
        }
    }

    fn write_16(&mut self, address: u32, value: u16, _bus: Bus) {
        let address = address & !1;
        if (RAM_BASE..RAM_BASE + RAM_SIZE).contains(&address) {
            let offset = (address - RAM_BASE) as usize;
            self.ram[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn write_32(&mut self, address: u32, value: u32, _bus: Bus) {
        let address = address & !3;
        if (RAM_BASE..RAM_BASE + RAM_SIZE).contains(&address) {
            let offset = (address - RAM_BASE) as usize;
            self.ram[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn fast_read_8(&self, address: u32, _bus: Bus) -> Option<u8> {
        let (bytes, offset) = self.slot(address)?;
        Some(bytes[offset])
    }

    fn fast_read_16(&self, address: u32, _bus: Bus) -> Option<u16> {
        let (bytes, offset) = self.slot(address & !1)?;
        Some(u16::from_le_bytes([bytes[offset], bytes[offset + 1]]))
    }

    fn fast_read_32(&self, address: u32, _bus: Bus) -> Option<u32> {
        let (bytes, offset) = self.slot(address & !3)?;
        Some(u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]))
    }
}
