//! Pull-model byte transfer from one producer into any number of sinks.
//!
//! Data flow:
//! ```text
//!                 produce_more()                 ┌─► writer task ─► file / pipe
//! Producer ◄──── DataPull (session task) ─ write ┼─► writer task ─► child stdin
//!                     ▲                          └─► writer task ─► tcp socket
//!                     └──────── accepted bytes / failures / hang-ups ◄──┘
//! ```
//!
//! The producer is only asked for more data once every running sink has
//! fewer pending bytes than the configured low-water mark.

pub mod config;
pub mod event;
pub mod file;
pub mod producer;
pub mod pull;
pub mod reader;
pub mod sink;

mod registry;
mod state;

pub use config::PullConfig;
pub use event::{PullEvent, PullReport};
pub use producer::{Producer, Transfer};
pub use pull::DataPull;
pub use sink::{ProcessExit, SinkHandle, SinkId, SinkKind};
