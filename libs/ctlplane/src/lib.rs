//! # ctlplane - service context for the control-plane API
//!
//! Request handlers receive a [`ServiceContext`] built once at startup. It
//! holds the persistence handle, the transaction runner derived from it, the
//! IPAM client, the feature flags and the base logger.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ctlplane::{Database, FeatureFlags, Logger, ServiceContext};
//!
//! let cx = ctlplane::telemetry::current_context();
//! let db = Database::connect(&dsn, &pool_cfg).await?;
//! let api = ServiceContext::new(&cx, Logger::new("api"), db, ipam, Arc::new(FeatureFlags::default()))?;
//!
//! // per request
//! let log = api.logger(&ctlplane::telemetry::extract_context(request.headers()));
//! ctlplane::log_info!(log, "listing devices");
//! ```

pub mod database;
pub mod fflags;
pub mod ipam;
pub mod service_context;
pub mod telemetry;

#[cfg(test)]
mod test_support;

#[doc(hidden)]
pub mod __private {
    pub use tracing;
}

pub use database::{Database, DbError, Driver, Transactor, TxError, TxPolicy};
pub use fflags::{FeatureFlags, FlagError};
pub use ipam::{Ipam, IpamClient, IpamError};
pub use service_context::ServiceContext;
pub use telemetry::{Logger, TraceIds};
