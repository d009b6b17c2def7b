//! OpenTelemetry pipeline setup.
//!
//! Spans are exported over OTLP (gRPC or HTTP) and bridged into `tracing`
//! through the layer returned by [`init_tracing`].

use ctlplane_bootstrap::{OtelLayer, TracingConfig};

#[cfg(feature = "otel")]
use std::sync::OnceLock;

#[cfg(feature = "otel")]
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
#[cfg(feature = "otel")]
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig, WithTonicConfig};
#[cfg(feature = "otel")]
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{Sampler, SdkTracerProvider},
    Resource,
};
#[cfg(feature = "otel")]
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};

#[cfg(feature = "otel")]
const DEFAULT_SERVICE_NAME: &str = "ctlplane";
#[cfg(feature = "otel")]
const DEFAULT_GRPC_ENDPOINT: &str = "http://127.0.0.1:4317";

#[cfg(feature = "otel")]
static PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Build the OTLP pipeline, install it globally and return the bridge layer.
///
/// Returns `Ok(None)` when tracing is disabled in config.
#[cfg(feature = "otel")]
pub fn init_tracing(cfg: &TracingConfig) -> anyhow::Result<Option<OtelLayer>> {
    if !cfg.enabled {
        return Ok(None);
    }

    let w3c = cfg
        .propagation
        .as_ref()
        .and_then(|p| p.w3c_trace_context)
        .unwrap_or(true);
    if w3c {
        global::set_text_map_propagator(TraceContextPropagator::new());
    }

    let service_name = cfg.service_name.as_deref().unwrap_or(DEFAULT_SERVICE_NAME);
    tracing::info!(service_name, "building OpenTelemetry layer");

    let mut attrs = vec![KeyValue::new("service.name", service_name.to_string())];
    if let Some(resource_map) = &cfg.resource {
        for (k, v) in resource_map {
            attrs.push(KeyValue::new(k.clone(), v.clone()));
        }
    }
    let resource = Resource::builder_empty().with_attributes(attrs).build();

    let exporter = build_exporter(cfg)?;
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(sampler_from_cfg(cfg))
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(DEFAULT_SERVICE_NAME);
    if PROVIDER.set(provider).is_err() {
        tracing::warn!("tracer provider already initialized; keeping the first one for shutdown");
    }

    Ok(Some(tracing_opentelemetry::OpenTelemetryLayer::new(tracer)))
}

#[cfg(not(feature = "otel"))]
pub fn init_tracing(cfg: &TracingConfig) -> anyhow::Result<Option<OtelLayer>> {
    if cfg.enabled {
        tracing::info!("tracing requested but the otel feature is disabled");
    }
    Ok(None)
}

#[cfg(feature = "otel")]
fn sampler_from_cfg(cfg: &TracingConfig) -> Sampler {
    match cfg.sampler.as_ref().and_then(|s| s.strategy.as_deref()) {
        Some("always_off") => Sampler::AlwaysOff,
        Some("always_on") => Sampler::AlwaysOn,
        Some("parentbased_ratio") => {
            let ratio = cfg.sampler.as_ref().and_then(|s| s.ratio).unwrap_or(0.1);
            Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio)))
        }
        _ => Sampler::ParentBased(Box::new(Sampler::AlwaysOn)),
    }
}

#[cfg(feature = "otel")]
fn exporter_target(cfg: &TracingConfig) -> (&str, String) {
    cfg.exporter
        .as_ref()
        .map(|e| {
            (
                e.kind.as_deref().unwrap_or("otlp_grpc"),
                e.endpoint
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GRPC_ENDPOINT.into()),
            )
        })
        .unwrap_or(("otlp_grpc", DEFAULT_GRPC_ENDPOINT.into()))
}

// The builder is type-state: the transport has to be picked inside each branch.
#[cfg(feature = "otel")]
fn build_exporter(cfg: &TracingConfig) -> anyhow::Result<opentelemetry_otlp::SpanExporter> {
    let (kind, endpoint) = exporter_target(cfg);
    let timeout = cfg
        .exporter
        .as_ref()
        .and_then(|e| e.timeout_ms)
        .map(std::time::Duration::from_millis);
    tracing::info!(kind, %endpoint, "OTLP exporter config");

    let exporter = if kind == "otlp_http" {
        let mut b = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(endpoint);
        if let Some(t) = timeout {
            b = b.with_timeout(t);
        }
        if let Some(h) = headers_from_cfg_and_env(cfg) {
            b = b.with_headers(h);
        }
        b.build()
            .map_err(|e| anyhow::anyhow!("otlp http exporter build failed: {e}"))?
    } else {
        let mut b = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint);
        if let Some(t) = timeout {
            b = b.with_timeout(t);
        }
        if let Some(md) = metadata_from_headers(headers_from_cfg_and_env(cfg)) {
            b = b.with_metadata(md);
        }
        b.build()
            .map_err(|e| anyhow::anyhow!("otlp grpc exporter build failed: {e}"))?
    };
    Ok(exporter)
}

/// Config headers, overridden by `OTEL_EXPORTER_OTLP_HEADERS` (`k=v,k2=v2`).
#[cfg(feature = "otel")]
fn headers_from_cfg_and_env(
    cfg: &TracingConfig,
) -> Option<std::collections::HashMap<String, String>> {
    let mut out = cfg
        .exporter
        .as_ref()
        .and_then(|e| e.headers.clone())
        .unwrap_or_default();

    if let Ok(env_hdrs) = std::env::var("OTEL_EXPORTER_OTLP_HEADERS") {
        out.extend(parse_header_list(&env_hdrs));
    }

    (!out.is_empty()).then_some(out)
}

#[cfg(feature = "otel")]
fn parse_header_list(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(feature = "otel")]
fn metadata_from_headers(
    headers: Option<std::collections::HashMap<String, String>>,
) -> Option<MetadataMap> {
    let mut md = MetadataMap::new();
    for (k, v) in headers.unwrap_or_default() {
        match (MetadataKey::from_bytes(k.as_bytes()), MetadataValue::try_from(v.as_str())) {
            (Ok(key), Ok(val)) => {
                md.insert(key, val);
            }
            _ => tracing::warn!(header = %k, "skipping invalid gRPC metadata header"),
        }
    }
    (!md.is_empty()).then_some(md)
}

/// Flush and stop the provider installed by [`init_tracing`], if any.
#[cfg(feature = "otel")]
pub fn shutdown_tracing() {
    let Some(provider) = PROVIDER.get() else {
        return;
    };
    if let Err(e) = provider.shutdown() {
        tracing::warn!(error = %e, "tracer provider shutdown failed");
    } else {
        tracing::info!("tracer provider shut down");
    }
}

#[cfg(not(feature = "otel"))]
pub fn shutdown_tracing() {}

/// Export a single span through a throwaway pipeline to check the collector
/// is reachable.
#[cfg(feature = "otel")]
pub async fn otel_connectivity_probe(cfg: &TracingConfig) -> anyhow::Result<()> {
    use opentelemetry::trace::{Span as _, Tracer as _};

    let service_name = cfg
        .service_name
        .clone()
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.into());
    let resource = Resource::builder_empty()
        .with_attributes([KeyValue::new("service.name", service_name)])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(build_exporter(cfg)?)
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("connectivity_probe");
    let mut span = tracer.start("otel_connectivity_probe");
    span.end();

    if let Err(e) = provider.force_flush() {
        tracing::warn!(error = %e, "force_flush failed during OTLP connectivity probe");
    }
    provider
        .shutdown()
        .map_err(|e| anyhow::anyhow!("shutdown failed: {e}"))?;

    tracing::info!("OTLP connectivity probe exported a test span");
    Ok(())
}

#[cfg(not(feature = "otel"))]
pub async fn otel_connectivity_probe(_cfg: &TracingConfig) -> anyhow::Result<()> {
    tracing::info!("OTLP connectivity probe skipped (otel feature disabled)");
    Ok(())
}
