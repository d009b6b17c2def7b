//! The long-lived context request handlers are built around.

use std::sync::Arc;

use opentelemetry::trace::Tracer;
use opentelemetry::{global, Context};
use uuid::Uuid;

use crate::database::{Database, DbError, Transactor};
use crate::fflags::FeatureFlags;
use crate::ipam::Ipam;
use crate::telemetry::{Logger, SpanGuard};

pub struct ServiceContext {
    logger: Logger,
    db: Database,
    ipam: Arc<dyn Ipam>,
    default_zone_id: Uuid,
    fflags: Arc<FeatureFlags>,
    transaction: Transactor,
}

impl ServiceContext {
    pub const TRACER_NAME: &'static str = "ctlplane::service_context";
    pub const SPAN_NAME: &'static str = "ServiceContext::new";

    /// Assemble the context, tracing construction under the caller's span.
    ///
    /// Fails only when no transaction runner can be derived from `db`; that
    /// error is returned unchanged.
    pub fn new(
        cx: &Context,
        logger: Logger,
        db: Database,
        ipam: Arc<dyn Ipam>,
        fflags: Arc<FeatureFlags>,
    ) -> Result<Self, DbError> {
        let tracer = global::tracer(Self::TRACER_NAME);
        Self::new_with_tracer(&tracer, cx, logger, db, ipam, fflags)
    }

    pub fn new_with_tracer<T: Tracer>(
        tracer: &T,
        cx: &Context,
        logger: Logger,
        db: Database,
        ipam: Arc<dyn Ipam>,
        fflags: Arc<FeatureFlags>,
    ) -> Result<Self, DbError> {
        let _span = SpanGuard::start(tracer, Self::SPAN_NAME, cx);

        let transaction = db.transaction_fn()?;

        Ok(Self {
            logger,
            db,
            ipam,
            default_zone_id: Uuid::nil(),
            fflags,
            transaction,
        })
    }

    /// Base logger decorated with the trace and span ids active in `cx`.
    pub fn logger(&self, cx: &Context) -> Logger {
        self.logger.with_trace(cx)
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn ipam(&self) -> &Arc<dyn Ipam> {
        &self.ipam
    }

    pub fn default_zone_id(&self) -> Uuid {
        self.default_zone_id
    }

    pub fn fflags(&self) -> &FeatureFlags {
        &self.fflags
    }

    pub fn transaction(&self) -> &Transactor {
        &self.transaction
    }
}
