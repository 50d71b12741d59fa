//! # The Panda Crate
//! Host-side driver for the comma.ai panda. It talks to the device over USB or SPI, packs and unpacks its CAN
//! buffers, configures the safety model and reads health. Firmware can be flashed through the bootstub and a broken
//! bootstub can be recovered through the ST bootloader.
//!
//! ## Async CAN Example
//!
//! The following opens the first panda on the system, and then receives all frames.
//!
//! ```rust,no_run
//! use panda::StreamExt;
//! async fn can_example() {
//!     let adapter = panda::can::get_adapter().unwrap();
//!     let mut stream = adapter.recv();
//!
//!     while let Some(frame) = stream.next().await {
//!         let id: u32 = frame.id.into();
//!         println!("[{}]\t0x{:x}\t{}", frame.bus, id, hex::encode(frame.data));
//!     }
//! }
//! ```
//!
//! ## Flashing Example
//!
//! ```rust,no_run
//! fn flash_example() -> panda::Result<()> {
//!     let mut panda = panda::Panda::new()?;
//!     println!("{} running {}", panda.hw_type(), panda.get_version()?);
//!     panda.flash(None, true)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Supported transports
//!  - USB (all platforms, using [rusb](https://github.com/a1ien/rusb))
//!  - SPI (Linux only, using spidev)
//!

pub mod can;
pub mod dfu;
pub mod error;
pub mod logging;
pub mod panda;
pub mod transport;

pub use crate::error::Error;
pub use crate::panda::Panda;
pub type Result<T> = std::result::Result<T, Error>;

pub use tokio_stream::{Stream, StreamExt, Timeout};
