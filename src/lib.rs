//! Host-side protocol engine for Marlin-style 3D printers.
//!
//! A [`Printer`] owns one transport, a reader task that frames and parses
//! inbound lines, and at most one writer: a credit-throttled streamed print or
//! the SD upload worker.

pub mod communication;
pub mod config;
pub mod file_manager;
pub mod flow_control;
pub mod gcode;
pub mod print_job;
pub mod printer;
pub mod registry;
pub mod state;
pub mod transport;
pub mod upload;
pub mod writer;

pub use communication::{HistoryEntry, PrinterEvent};
pub use config::{Config, ConfigError, ProtocolConfig};
pub use print_job::{PrintProgress, StatusReport};
pub use printer::{Printer, PrinterError};
pub use registry::PrinterRegistry;
pub use state::PrinterStatus;
pub use upload::UploadJob;
