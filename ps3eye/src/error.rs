use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A control or bulk transfer failed at the USB layer.
    #[error("usb transport error: {0}")]
    Transport(#[from] rusb::Error),

    /// libusb refused to queue an asynchronous bulk transfer.
    #[error("could not submit bulk transfer (libusb error {0})")]
    Submit(i32),

    /// The API was driven out of order; nothing was sent to the device.
    #[error("usage error: {0}")]
    Usage(&'static str),

    #[error("no PS3 Eye found at index {0}")]
    DeviceNotFound(usize),

    #[error("device has no bulk input endpoint")]
    NoBulkEndpoint,

    #[error("register script {name} is malformed at line {line}")]
    Script { name: &'static str, line: usize },

    #[error("could not spawn capture thread: {0}")]
    Thread(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
