//! Dispatch engine core.
//!
//! Requests enter through the local REPL or the remote listener, get an id
//! from the [`RequestCorrelator`], and run through the [`Dispatcher`]:
//! generate, gate, execute, analyze, report. Finished records are delivered
//! to their origin and appended to history exactly once.

pub mod cli;
pub mod correlator;
pub mod dispatch;
pub mod listener;
pub mod logging;
pub mod realtime_db;
pub mod remote;
pub mod session;
pub mod status;

pub use correlator::{Completion, CorrelationError, LocalDelivery, RequestCorrelator, ResultSink};
pub use dispatch::{Confirmer, DispatchError, Dispatcher, CANCELLED_REASON};
pub use listener::{ListenerSummary, RemoteListener};
pub use realtime_db::RealtimeDbRemote;
pub use remote::{ChannelCommandSource, CommandSource, RemoteCommand, RemoteError};
pub use session::{CommandHistoryEntry, Session, SessionStats};
pub use status::{MemoryStatusSink, NullStatusSink, StatusError, StatusSink, StatusSnapshot};
