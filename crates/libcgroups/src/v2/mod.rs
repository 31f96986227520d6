mod controller;
mod cpu;
mod freezer;
mod io;
pub mod manager;
mod memory;
mod pids;
pub mod util;
