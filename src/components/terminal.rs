use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::bus::MemoryDevice;
use crate::component::Component;
use crate::types::Nibble;

pub const SCREEN_WIDTH: usize = 80;
pub const SCREEN_HEIGHT: usize = 25;

const CARRIAGE_RETURN: u8 = 0x0D;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7F;

/// Keystrokes waiting for the CPU. Clones share the same queue, so the
/// capture thread and the bus see one buffer.
#[derive(Debug, Clone, Default)]
pub struct KeyBuffer(Arc<Mutex<VecDeque<u8>>>);

impl KeyBuffer {
    fn queue(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, byte: u8) {
        self.queue().push_back(byte);
    }

    pub fn push_str(&self, text: &str) {
        self.queue().extend(text.bytes());
    }

    pub fn pop(&self) -> Option<u8> {
        self.queue().pop_front()
    }

    pub fn has_key(&self) -> bool {
        !self.queue().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    pub fn clear(&self) {
        self.queue().clear();
    }
}

/// 80x25 character screen with a linear cursor.
#[derive(Debug, Clone)]
pub struct ScreenBuffer {
    cells: Vec<u8>,
    cursor: usize,
}

impl Default for ScreenBuffer {
    fn default() -> Self {
        Self {
            cells: vec![b' '; SCREEN_WIDTH * SCREEN_HEIGHT],
            cursor: 0,
        }
    }
}

impl ScreenBuffer {
    /// Writes one byte, handling CR and backspace/delete. Other
    /// non-printable bytes are dropped.
    pub fn put(&mut self, byte: u8) {
        match byte {
            CARRIAGE_RETURN | b'\n' => self.newline(),
            BACKSPACE | DELETE => self.backspace(),
            0x20..=0x7E => {
                if self.cursor >= self.cells.len() {
                    self.scroll();
                }
                self.cells[self.cursor] = byte;
                self.cursor += 1;
            }
            _ => {}
        }
    }

    fn newline(&mut self) {
        self.cursor = (self.cursor / SCREEN_WIDTH + 1) * SCREEN_WIDTH;
        if self.cursor >= self.cells.len() {
            self.scroll();
        }
    }

    fn backspace(&mut self) {
        if self.cursor > 0 {
            self.cursor -= 1;
            self.cells[self.cursor] = b' ';
        }
    }

    /// Drops the top row and blanks the bottom one.
    fn scroll(&mut self) {
        self.cells.copy_within(SCREEN_WIDTH.., 0);
        let last_row = self.cells.len() - SCREEN_WIDTH;
        self.cells[last_row..].fill(b' ');
        self.cursor = self.cursor.saturating_sub(SCREEN_WIDTH);
    }

    pub fn clear(&mut self) {
        self.cells.fill(b' ');
        self.cursor = 0;
    }

    /// Rows with trailing blanks trimmed.
    pub fn lines(&self) -> Vec<String> {
        self.cells
            .chunks(SCREEN_WIDTH)
            .map(|row| String::from_utf8_lossy(row).trim_end().to_string())
            .collect()
    }

    /// Returns: (column, row)
    pub fn cursor(&self) -> (usize, usize) {
        (self.cursor % SCREEN_WIDTH, self.cursor / SCREEN_WIDTH)
    }
}

/// Keyboard/display peripheral.
///
/// Local ports: [`Terminal::DATA_PORT`] reads the next key (low nibble,
/// `0000` when empty) and writes a character, shown as a hex digit.
/// [`Terminal::STATUS_PORT`] reads `[key available, input mode, 0, 0]`;
/// writing it sets echo (bit 0) and input mode (bit 1). With echo on,
/// keys consumed by the CPU are mirrored on the screen.
pub struct Terminal {
    name: String,
    screen: ScreenBuffer,
    keys: KeyBuffer,
    echo: bool,
    input_mode: bool,
}

impl Terminal {
    pub const DATA_PORT: Nibble = Nibble::ZERO;
    pub const STATUS_PORT: Nibble = Nibble::ONE;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            screen: ScreenBuffer::default(),
            keys: KeyBuffer::default(),
            echo: false,
            input_mode: true,
        }
    }

    /// Handle for producers of keystrokes.
    pub fn key_buffer(&self) -> KeyBuffer {
        self.keys.clone()
    }

    pub fn echo(&self) -> bool {
        self.echo
    }

    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    pub fn screen(&self) -> &ScreenBuffer {
        &self.screen
    }

    pub fn screen_lines(&self) -> Vec<String> {
        self.screen.lines()
    }

    pub fn write_char(&mut self, byte: u8) {
        self.screen.put(byte);
    }

    /// Feeds every byte from `reader` into the key buffer until EOF or a
    /// read error. The thread blocks on input.
    pub fn spawn_capture<R>(&self, reader: R) -> io::Result<JoinHandle<()>>
    where
        R: Read + Send + 'static,
    {
        let keys = self.key_buffer();
        thread::Builder::new().name("terminal-input".to_string()).spawn(move || {
            for byte in reader.bytes() {
                match byte {
                    Ok(byte) => keys.push(byte),
                    Err(e) => {
                        debug!(error = %e, "terminal input closed");
                        break;
                    }
                }
            }
        })
    }
}

impl Component for Terminal {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        self.screen.clear();
        self.keys.clear();
    }
}

impl MemoryDevice for Terminal {
    fn read(&mut self, addr: Nibble) -> Nibble {
        if addr == Self::DATA_PORT {
            let Some(key) = self.keys.pop() else {
                return Nibble::ZERO;
            };
            if self.echo {
                self.screen.put(key);
            }
            Nibble::from_low_bits(key)
        } else if addr == Self::STATUS_PORT {
            Nibble::from_bits([self.keys.has_key(), self.input_mode, false, false])
        } else {
            Nibble::ZERO
        }
    }

    fn write(&mut self, addr: Nibble, data: Nibble, clock: bool) {
        if !clock {
            return;
        }
        if addr == Self::DATA_PORT {
            let digit = char::from_digit(u32::from(data.value()), 16).unwrap_or('?');
            self.screen.put(digit.to_ascii_uppercase() as u8);
        } else if addr == Self::STATUS_PORT {
            self.echo = data.bit(0);
            self.input_mode = data.bit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_key_read_consumes_and_truncates() {
        let mut terminal = Terminal::new("T");
        terminal.key_buffer().push(0x37);
        assert_eq!(terminal.read(Terminal::STATUS_PORT), Nibble::from_bits([true, true, false, false]));
        assert_eq!(terminal.read(Terminal::DATA_PORT), Nibble::from_low_bits(7));
        assert_eq!(terminal.read(Terminal::DATA_PORT), Nibble::ZERO);
    }

    #[test]
    fn test_char_writes_show_hex_digits() {
        let mut terminal = Terminal::new("T");
        terminal.write(Terminal::DATA_PORT, Nibble::from_low_bits(12), true);
        terminal.write(Terminal::DATA_PORT, Nibble::from_low_bits(3), true);
        terminal.write(Terminal::DATA_PORT, Nibble::from_low_bits(3), false);
        assert_eq!(terminal.screen_lines()[0], "C3");
    }

    #[test]
    fn test_echo_mirrors_consumed_keys() {
        let mut terminal = Terminal::new("T");
        terminal.write(Terminal::STATUS_PORT, Nibble::from_bits([true, true, false, false]), true);
        assert!(terminal.echo());
        terminal.key_buffer().push_str("hi");
        terminal.read(Terminal::DATA_PORT);
        terminal.read(Terminal::DATA_PORT);
        assert_eq!(terminal.screen_lines()[0], "hi");
    }

    #[test]
    fn test_control_characters() {
        let mut screen = ScreenBuffer::default();
        for byte in b"ab\x7fc\rd" {
            screen.put(*byte);
        }
        let lines = screen.lines();
        assert_eq!(lines[0], "ac");
        assert_eq!(lines[1], "d");
        assert_eq!(screen.cursor(), (1, 1));
    }

    #[test]
    fn test_screen_scrolls_at_bottom() {
        let mut screen = ScreenBuffer::default();
        screen.put(b'x');
        for _ in 0..SCREEN_HEIGHT {
            screen.put(b'\n');
        }
        screen.put(b'y');
        let lines = screen.lines();
        assert_eq!(lines[0], "");
        assert_eq!(lines[SCREEN_HEIGHT - 1], "y");
    }

    #[test]
    fn test_capture_thread_fills_buffer() {
        let terminal = Terminal::new("T");
        let handle = terminal.spawn_capture(Cursor::new(b"key".to_vec())).unwrap();
        handle.join().unwrap();
        assert_eq!(terminal.key_buffer().len(), 3);
        assert_eq!(terminal.key_buffer().pop(), Some(b'k'));
    }
}
