//! Built-in request handlers for commands the packager sends to the app.

pub mod file_io;

pub use file_io::{FileIoHandler, FILE_IDLE_TIMEOUT, FILE_IO_METHODS};
