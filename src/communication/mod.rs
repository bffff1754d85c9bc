pub mod event_system;
pub mod framer;
pub mod history;
pub mod parser;

pub use event_system::{EventBus, PrinterEvent};
pub use framer::{LineFramer, line_stream};
pub use history::{CommandHistory, Direction, HistoryEntry};
pub use parser::{Anomaly, Response, ResponseParser};
