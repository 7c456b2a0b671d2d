//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod address;
mod bitmap;
mod error;

pub use address::Address;
pub use bitmap::Bitmap;
pub use error::PaxosError;
pub use print::logger_init;
