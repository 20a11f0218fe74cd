pub mod records;
pub mod usbmux;
