//! 16-address memory bus.
//!
//! Address decode order: the three terminal ports, then ROM
//! (`0..rom_size`), then RAM (`rom_size..rom_size + ram_size`, rebased to
//! 0). Anything else reads as `0000` and swallows writes.

use tracing::trace;

use crate::component::Component;
use crate::components::memory::ram::Ram16x4;
use crate::components::memory::rom::Rom16x4;
use crate::components::terminal::Terminal;
use crate::error::{EmuError, Result};
use crate::system_config::{MemoryConfig, ADDRESS_SPACE};
use crate::types::Nibble;

/// Something that can sit on the bus.
pub trait MemoryDevice: Component {
    fn read(&mut self, addr: Nibble) -> Nibble;
    /// `clock` marks a write pulse from the CPU.
    fn write(&mut self, addr: Nibble, data: Nibble, clock: bool);
    /// Clock-tick hook, for devices that have one.
    fn as_syncable(&mut self) -> Option<&mut dyn Syncable> {
        None
    }
}

/// Reacts to the end of a clock cycle.
pub trait Syncable {
    fn sync(&mut self);
}

/// Resolved bus layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMap {
    pub rom_size: usize,
    pub ram_size: usize,
    pub key_status: Nibble,
    pub key_data: Nibble,
    pub char_out: Nibble,
}

impl MemoryMap {
    pub fn from_config(config: &MemoryConfig) -> Result<Self> {
        if config.rom_size.checked_add(config.ram_size).map_or(true, |cells| cells > ADDRESS_SPACE) {
            return Err(EmuError::Config(format!(
                "{} ROM + {} RAM cells do not fit on the bus",
                config.rom_size, config.ram_size
            )));
        }
        let port = |value: u8| {
            Nibble::from_u8(value).ok_or_else(|| EmuError::Config(format!("device port {value} is outside the bus")))
        };
        Ok(Self {
            rom_size: config.rom_size,
            ram_size: config.ram_size,
            key_status: port(config.key_status_port)?,
            key_data: port(config.key_data_port)?,
            char_out: port(config.char_out_port)?,
        })
    }

    /// Addresses backed by ROM or RAM cells.
    pub fn span(&self) -> usize {
        self.rom_size + self.ram_size
    }

    fn decode(&self, addr: Nibble) -> Region {
        let index = addr.index();
        if addr == self.key_status {
            Region::KeyStatus
        } else if addr == self.key_data {
            Region::KeyData
        } else if addr == self.char_out {
            Region::CharOut
        } else if index < self.rom_size {
            Region::Rom(addr)
        } else if index < self.span() {
            Region::Ram(Nibble::from_low_bits((index - self.rom_size) as u8))
        } else {
            Region::Unmapped
        }
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self {
            rom_size: 0,
            ram_size: 13,
            key_status: Nibble::from_low_bits(13),
            key_data: Nibble::from_low_bits(14),
            char_out: Nibble::from_low_bits(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    KeyStatus,
    KeyData,
    CharOut,
    Rom(Nibble),
    Ram(Nibble),
    Unmapped,
}

/// Bus traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub reads: u64,
    pub writes: u64,
    pub fetches: u64,
}

pub struct MemoryBus {
    map: MemoryMap,
    rom: Rom16x4,
    ram: Ram16x4,
    terminal: Terminal,
    stats: BusStats,
}

impl MemoryBus {
    pub fn new(map: MemoryMap) -> Self {
        Self {
            map,
            rom: Rom16x4::new("ROM", map.rom_size),
            ram: Ram16x4::new("RAM", map.ram_size),
            terminal: Terminal::new("TERMINAL"),
            stats: BusStats::default(),
        }
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    /// Device behind `region` plus the address it sees.
    fn route(&mut self, region: Region) -> Option<(&mut dyn MemoryDevice, Nibble)> {
        match region {
            Region::KeyStatus => Some((&mut self.terminal as &mut dyn MemoryDevice, Terminal::STATUS_PORT)),
            Region::KeyData | Region::CharOut => Some((&mut self.terminal as &mut dyn MemoryDevice, Terminal::DATA_PORT)),
            Region::Rom(offset) => Some((&mut self.rom as &mut dyn MemoryDevice, offset)),
            Region::Ram(offset) => Some((&mut self.ram as &mut dyn MemoryDevice, offset)),
            Region::Unmapped => None,
        }
    }

    pub fn read(&mut self, addr: Nibble) -> Nibble {
        self.stats.reads += 1;
        let value = match self.map.decode(addr) {
            // write-only port
            Region::CharOut => Nibble::ZERO,
            region => self
                .route(region)
                .map(|(device, local)| device.read(local))
                .unwrap_or(Nibble::ZERO),
        };
        trace!(%addr, %value, "bus read");
        value
    }

    pub fn write(&mut self, addr: Nibble, data: Nibble, clock: bool) {
        self.stats.writes += 1;
        trace!(%addr, %data, "bus write");
        match self.map.decode(addr) {
            // read-only port
            Region::KeyData => {}
            region => {
                if let Some((device, local)) = self.route(region) {
                    device.write(local, data, clock);
                }
            }
        }
    }

    /// Instruction fetch: ROM and RAM cells only, anything else is a no-op
    /// word. Never touches device ports.
    pub fn fetch(&mut self, addr: Nibble) -> Nibble {
        self.stats.fetches += 1;
        self.peek(addr)
    }

    /// Side-effect free read of ROM/RAM contents.
    pub fn peek(&self, addr: Nibble) -> Nibble {
        match self.map.decode(addr) {
            Region::Rom(offset) => self.rom.peek(offset),
            Region::Ram(offset) => self.ram.peek(offset),
            _ => Nibble::ZERO,
        }
    }

    /// End of a clock cycle for every device that cares.
    pub fn sync(&mut self) {
        let devices: [&mut dyn MemoryDevice; 3] = [&mut self.rom, &mut self.ram, &mut self.terminal];
        for device in devices {
            if let Some(syncable) = device.as_syncable() {
                syncable.sync();
            }
        }
    }

    /// Contents of all 16 addresses, device ports read as zero.
    pub fn snapshot(&self) -> [Nibble; ADDRESS_SPACE] {
        std::array::from_fn(|i| self.peek(Nibble::from_low_bits(i as u8)))
    }

    /// Replaces ROM and RAM contents directly, bypassing write protection
    /// and write-enable.
    pub fn restore(&mut self, image: &[Nibble; ADDRESS_SPACE]) {
        for (i, &word) in image.iter().enumerate() {
            match self.map.decode(Nibble::from_low_bits(i as u8)) {
                Region::Rom(offset) => self.rom.load_word(offset, word),
                Region::Ram(offset) => self.ram.load_word(offset, word),
                _ => {}
            }
        }
    }

    pub fn load_rom(&mut self, words: &[Nibble]) -> Result<()> {
        self.rom.load(words)
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn terminal_mut(&mut self) -> &mut Terminal {
        &mut self.terminal
    }

    pub fn ram(&self) -> &Ram16x4 {
        &self.ram
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    /// Clears RAM and the terminal. ROM keeps its image.
    pub fn reset(&mut self) {
        self.ram.reset();
        self.terminal.reset();
    }
}
