pub mod generic_clock;
