//! Process lifecycle: bootstrap, a fail-fast task group sharing one cancellable context,
//! signal handling with a grace period, and time-bounded shutdown functions that run once
//! every task has returned.

mod bootstrap;
mod config;
mod consumer;
mod context;
mod delayed;
mod error;
mod graceful;
mod group;
mod http;
mod metrics;
pub mod probes;
mod shutdown;
mod signals;
mod task;

pub use bootstrap::run_bootstrap;
pub use config::{EnvMsDuration, LifecycleConfig, ParseEnvMsDurationError};
pub use consumer::consume_until_stopped;
pub use context::{CancelHandle, CancelOnDrop, Context};
pub use error::{AggregateError, BoxError, ContextError, Failure, LifecycleError, Panicked};
pub use graceful::GracefulCancel;
pub use group::{GracePeriod, Group, GroupBuilder, GroupOptions};
pub use http::HttpServer;
pub use shutdown::shutdown;
pub use signals::{
    default_action, exit_process, DefaultAction, ForceExit, HandlerState, ShutdownSignal,
    SignalSender, SignalSubscription, FORCE_EXIT_CODE,
};
pub use task::TaskFn;
