//! USB transport for locally attached cameras

pub mod device;
pub mod transport;

pub use transport::UsbTransport;
