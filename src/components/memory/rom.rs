use tracing::warn;

use crate::bus::MemoryDevice;
use crate::component::Component;
use crate::error::{EmuError, Result};
use crate::types::Nibble;

/// Read-only program store of up to 16 words.
pub struct Rom16x4 {
    name: String,
    words: Vec<Nibble>,
}

impl Rom16x4 {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            words: vec![Nibble::ZERO; size],
        }
    }

    pub fn size(&self) -> usize {
        self.words.len()
    }

    /// Programs the ROM from offset 0. Remaining words are cleared.
    pub fn load(&mut self, image: &[Nibble]) -> Result<()> {
        if image.len() > self.words.len() {
            return Err(EmuError::Config(format!(
                "image of {} words does not fit {} ({} words)",
                image.len(),
                self.name,
                self.words.len()
            )));
        }
        self.words.fill(Nibble::ZERO);
        self.words[..image.len()].copy_from_slice(image);
        Ok(())
    }

    /// Programming path used by state restore.
    pub fn load_word(&mut self, offset: Nibble, word: Nibble) {
        if let Some(slot) = self.words.get_mut(offset.index()) {
            *slot = word;
        }
    }

    pub fn peek(&self, offset: Nibble) -> Nibble {
        self.words.get(offset.index()).copied().unwrap_or(Nibble::ZERO)
    }
}

impl Component for Rom16x4 {
    fn name(&self) -> &str {
        &self.name
    }

    // Contents survive reset.
    fn reset(&mut self) {}
}

impl MemoryDevice for Rom16x4 {
    fn read(&mut self, addr: Nibble) -> Nibble {
        self.peek(addr)
    }

    fn write(&mut self, addr: Nibble, data: Nibble, _clock: bool) {
        warn!(rom = %self.name, %addr, %data, "write to ROM ignored");
    }
}
