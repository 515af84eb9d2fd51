pub mod ram;
pub mod rom;
