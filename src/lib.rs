//! A user-space USB/IP server exposing synthetic USB devices to a local
//! USB/IP client driver.
//!
//! The core is protocol-and-device-model only: [`instance`] runs the
//! accept/dispatch event loop, [`registry`] and [`device`] hold the virtual
//! bus/device tree, [`dispatcher`] speaks the wire protocol, and [`wire`]
//! is the byte-level codec for it. [`hid`] and [`xpad`] are concrete
//! profiles built on that core; an application wires up its own profile the
//! same way.

pub mod attach;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod hid;
pub mod instance;
pub mod registry;
pub mod request;
#[cfg(feature = "dev-hooks")]
pub mod test_device;
pub mod wire;
pub mod xpad;

pub use error::{AttachError, AttachStage, ServerError};
pub use instance::{Instance, InstanceConfig};
pub use registry::Registry;
