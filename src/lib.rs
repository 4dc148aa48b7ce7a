//! echo-dispatch: one TCP echo service, four ways to dispatch connections.
//!
//! - `Iterative`: serve each connection on the accepting thread, one at a time
//! - `PerProcess`: fork a child for every accepted connection
//! - `PerThread`: spawn a detached thread for every accepted connection
//! - `HybridPool(n)`: fork `n` accepting processes, each spawning a thread
//!   per connection
//!
//! The echo loop itself is identical across strategies; only the dispatch
//! layer differs.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod reaper;
pub mod session;
pub mod trace;
pub mod worker;

pub use config::Config;
pub use dispatcher::{accept_loop, Acceptor, Dispatcher, Strategy};
pub use error::SetupError;
pub use reaper::Reaper;
pub use session::{Connection, SessionOptions, SessionOutcome};
pub use worker::{InlineWorker, Slot, ThreadWorker, WorkerGroup, WorkerHandle, WorkerUnit};
