//! Tracing setup.
//!
//! One fmt subscriber for the whole process; the level comes from the
//! configuration unless `RUST_LOG` overrides it. Query-scoped events carry
//! the query id as a structured field, so a single id can be followed
//! through parse, plan, connector calls and completion.

use crate::config::LogLevel;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init(level: LogLevel) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("fedsql={}", level.as_filter())));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}
