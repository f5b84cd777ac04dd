//! Duesledger - recurring dues billing for membership organizations
//!
//! Duesledger bills members of many organizations from one deployment:
//! fee calculation with optional pass-through, gap-free invoice numbering,
//! anniversary-anchored billing dates, escalating payment reminders and an
//! idempotent settlement procedure that drives the membership lifecycle.
//!
//! # Features
//!
//! - **Fees**: processor and platform fees in exact decimal math
//! - **Invoices**: per-organization, per-month atomic sequences
//! - **Reminders**: configurable day offsets with review escalation
//! - **Settlement**: safe to retry, reports partial failures explicitly
//! - **Scheduler**: timer-driven billing and reminder passes
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use duesledger::{BillingScheduler, ConfigBuilder};
//! use duesledger::billing::InMemoryBillingStore;
//!
//! #[tokio::main]
//! async fn main() -> duesledger::Result<()> {
//!     // Initialize logging
//!     duesledger::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let store = InMemoryBillingStore::new();
//!
//!     let (scheduler, shutdown_rx) = BillingScheduler::new(store, &config)?;
//!     scheduler.start(shutdown_rx).await;
//!     Ok(())
//! }
//! ```

pub mod billing;
mod config;
mod error;
pub mod scheduler;
pub mod utils;

// Re-exports for public API
pub use config::{Config, ConfigBuilder, LoggingConfig, SchedulerConfig};
pub use error::{DuesError, Result};
pub use scheduler::{BillingScheduler, OrganizationPass};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main()
/// before starting the scheduler.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "duesledger=debug")
/// - `DUESLEDGER_LOG_JSON`: Set to "true" for JSON formatted logs
///
/// # Example
///
/// ```rust,no_run
///
/// #[tokio::main]
/// async fn main() {
///     duesledger::init_tracing();
///     // ... rest of your service
/// }
/// ```
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("DUESLEDGER_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
