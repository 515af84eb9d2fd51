pub mod alu;
pub mod clock;
pub mod interrupts;
pub mod memory;
pub mod pipeline;
pub mod registers;
pub mod terminal;
