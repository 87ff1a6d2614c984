pub mod cli;
pub mod io;
pub mod mapping;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
