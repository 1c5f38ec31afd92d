//! Infrastructure layer: command dispatch, broker backends, configuration.

pub mod broker;
pub mod config;
pub mod dispatcher;

pub use broker::connect;
pub use config::{ConfigError, RelayConfig};
pub use dispatcher::{
    CommandDispatcher, CommandHandler, DispatchError, DispatchOutcome, DispatchTable,
    DispatcherConfig, DispatcherHandle, DispatcherStats,
};
