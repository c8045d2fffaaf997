//! Event dispatcher built on the `reliability` stores.
//!
//! Reads events, drops duplicates, retries failing deliveries with backoff
//! and parks exhausted ones in the dead-letter store. Recurring commands run
//! under schedule locks.

pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod scheduler;

pub use command::CommandHandler;
pub use config::{DedupSettings, DispatcherAppConfig, HandlerConfig, LockSettings, ScheduleConfig};
pub use dispatcher::{DispatchOutcome, EventDispatcher, RedeliveryOutcome};
pub use error::{DispatcherError, Result};
pub use event::{EventHandler, InboundEvent, parse_event_line};
pub use scheduler::ScheduleRunner;
