mod capture;
mod error;
mod format;

pub use capture::{Camera, Controls, Ps3Eye};
pub use error::{Error, Result};
pub use format::Format;

pub const VENDOR_ID: u16 = 0x1415;
pub const PRODUCT_ID: u16 = 0x2000;
