use std::{collections::HashMap, time::Duration};

use anyhow::{anyhow, bail};
use log::info;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::{metrics::SdkMeterProvider, Resource};

/// Resource built from `OTEL_SERVICE_NAME` and `OTEL_RESOURCE_ATTRIBUTES`
/// (`k=v,k=v`); `service.name` falls back to "sluice".
pub fn resource_from_env() -> Resource {
    let service_name = dotenvy::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "sluice".into());
    let mut attributes = vec![KeyValue::new("service.name", service_name)];
    if let Ok(instance) = dotenvy::var("OTEL_SERVICE_INSTANCE_ID") {
        attributes.push(KeyValue::new("service.instance.id", instance));
    }
    if let Ok(extra) = dotenvy::var("OTEL_RESOURCE_ATTRIBUTES") {
        for (key, value) in parse_pairs(&extra) {
            if !attributes.iter().any(|kv| kv.key.as_str() == key) {
                attributes.push(KeyValue::new(key, value));
            }
        }
    }
    Resource::builder().with_attributes(attributes).build()
}

/// Splits `a=1, b=2` into trimmed, non-empty pairs.
fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .collect()
}

fn build_metric_exporter() -> anyhow::Result<opentelemetry_otlp::MetricExporter> {
    let endpoint = dotenvy::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4318/v1/metrics".into());
    let protocol = match dotenvy::var("OTEL_EXPORTER_OTLP_PROTOCOL")
        .unwrap_or_else(|_| "http/protobuf".into())
        .to_lowercase()
        .as_str()
    {
        "http/protobuf" => Protocol::HttpBinary,
        "http/json" => Protocol::HttpJson,
        other => bail!("unsupported OTEL_EXPORTER_OTLP_PROTOCOL: {other}"),
    };
    let timeout = dotenvy::var("OTEL_EXPORTER_OTLP_TIMEOUT")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(3));
    let headers: HashMap<String, String> = dotenvy::var("OTEL_EXPORTER_OTLP_HEADERS")
        .map(|raw| parse_pairs(&raw).into_iter().collect())
        .unwrap_or_default();

    info!("Sending metrics to {endpoint}");
    opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(protocol)
        .with_endpoint(endpoint)
        .with_timeout(timeout)
        .with_headers(headers)
        .build()
        .map_err(|err| anyhow!("failed to build OTLP metric exporter: {err}"))
}

/// Installs a periodic OTLP exporter as the global meter provider.
pub fn init_meter() -> anyhow::Result<SdkMeterProvider> {
    let exporter = build_metric_exporter()?;
    #[allow(unused_mut)]
    let mut builder = SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource_from_env());

    #[cfg(feature = "verbose")]
    {
        builder = builder
            .with_periodic_exporter(opentelemetry_stdout::MetricExporter::builder().build());
    }

    let provider = builder.build();
    global::set_meter_provider(provider.clone());
    Ok(provider)
}
