pub mod cpu_context;
pub mod datapath;
pub mod runner;
pub mod state;
