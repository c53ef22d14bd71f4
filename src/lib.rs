//! usbdirect -- cross-platform USB host access from Rust.
//!
//! Every transfer, synchronous or not, is submitted asynchronously to the OS. A single background
//! thread per process collects the completions (epoll on Linux, a CFRunLoop on macOS, an I/O
//! completion port on Windows) and hands each one back to whoever is waiting for it.

pub use device::{Device, DeviceInformation, DeviceSelector};
pub use error::{Error, UsbResult};
pub use host::{all_devices, device, devices, open, Host};
pub use request::{ControlRequest, Direction};
pub use stream::{EndpointReader, EndpointWriter};
pub use transfer::Transfer;

#[cfg(feature = "async")]
pub use futures::UsbFuture;

#[cfg(feature = "callbacks")]
pub use callbacks::AsyncCallback;

pub mod backend;
pub mod convenience;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod host;
pub mod request;
pub mod stream;
pub mod transfer;

mod engine;

#[cfg(feature = "async")]
pub mod futures;

#[cfg(feature = "callbacks")]
pub mod callbacks;
