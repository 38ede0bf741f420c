//! QDB gadget library
//!
//! Device side of the debug bridge. Configures a FunctionFS USB function
//! with the QDB interface and bridges its two bulk endpoints to an
//! in-process byte stream: a reader worker pulls chunks off the OUT
//! endpoint, a writer worker pushes buffers to the IN endpoint, and the
//! facade talks to both through thread-safe queues.

pub mod descriptors;
pub mod gadget;

pub use descriptors::{descriptors_blob, strings_blob};
pub use gadget::{FUNCTIONFS_DIR, GadgetError, READ_BUFFER_SIZE, UsbGadget};
