use crate::bus::{MemoryDevice, Syncable};
use crate::component::Component;
use crate::components::registers::Register4;
use crate::types::Nibble;

/// Up to 16 cells of 4-bit RAM built from flip-flop registers.
///
/// A write pulse (`clock == true`) raises write-enable and latches the
/// data. Enable stays high until the next [`Syncable::sync`], so one write
/// pulse covers a single clock cycle.
pub struct Ram16x4 {
    name: String,
    cells: Vec<Register4>,
    write_enable: bool,
}

impl Ram16x4 {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            cells: vec![Register4::new(); size],
            write_enable: false,
        }
    }

    pub fn size(&self) -> usize {
        self.cells.len()
    }

    pub fn write_enabled(&self) -> bool {
        self.write_enable
    }

    pub fn peek(&self, offset: Nibble) -> Nibble {
        self.cells
            .get(offset.index())
            .map(Register4::output)
            .unwrap_or(Nibble::ZERO)
    }

    /// Direct cell load used by state restore.
    pub fn load_word(&mut self, offset: Nibble, word: Nibble) {
        if let Some(cell) = self.cells.get_mut(offset.index()) {
            cell.write(word);
        }
    }
}

impl Component for Ram16x4 {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        for cell in &mut self.cells {
            cell.clear();
        }
        self.write_enable = false;
    }
}

impl MemoryDevice for Ram16x4 {
    fn read(&mut self, addr: Nibble) -> Nibble {
        self.peek(addr)
    }

    fn write(&mut self, addr: Nibble, data: Nibble, clock: bool) {
        if clock {
            self.write_enable = true;
        }
        if !self.write_enable {
            return;
        }
        if let Some(cell) = self.cells.get_mut(addr.index()) {
            cell.write(data);
        }
    }

    fn as_syncable(&mut self) -> Option<&mut dyn Syncable> {
        Some(self)
    }
}

impl Syncable for Ram16x4 {
    fn sync(&mut self) {
        self.write_enable = false;
    }
}
