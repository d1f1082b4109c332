//! Process telemetry for the splitsight binaries
//!
//! Logs go out as JSON lines through `tracing`. When telemetry is enabled,
//! in-process OpenTelemetry meter and tracer providers are installed so the
//! instruments in `orchestrator::telemetry` and the `#[instrument]` spans
//! record somewhere; with it disabled the global no-op providers stay.
//!
//! Environment variables:
//! - OTEL_SERVICE_NAME (default: the binary's name)
//! - SPLITSIGHT_TELEMETRY_ENABLED (default: true)
//! - SPLITSIGHT_TELEMETRY_RUN_ID (default: unset)
//! - SPLITSIGHT_TRACE_SAMPLE_RATIO (default: 1.0)

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use std::sync::OnceLock;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

static SERVICE_NAME: OnceLock<String> = OnceLock::new();
static RUN_ID: OnceLock<String> = OnceLock::new();

/// Service label for `metrics` series; `"unknown"` before init.
pub fn service() -> &'static str {
    SERVICE_NAME.get().map(String::as_str).unwrap_or("unknown")
}

/// Run label for `metrics` series, so load-test runs can be told apart.
pub fn run_id() -> &'static str {
    RUN_ID.get().map(String::as_str).unwrap_or("none")
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub service_name: String,
    pub run_id: Option<String>,
    /// Fraction of root traces kept; children follow their parent
    pub trace_sample_ratio: f64,
    pub log_level: Level,
}

impl TelemetrySettings {
    pub fn from_env(default_service_name: &str, log_level: &str) -> Result<Self> {
        Self::from_lookup(default_service_name, log_level, |name| {
            std::env::var(name).ok()
        })
    }

    /// Settings read through `lookup` instead of the process environment.
    pub fn from_lookup(
        default_service_name: &str,
        log_level: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let read = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let enabled = match read("SPLITSIGHT_TELEMETRY_ENABLED") {
            None => true,
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(Error::Config(format!(
                        "SPLITSIGHT_TELEMETRY_ENABLED must be true or false, got '{raw}'"
                    )))
                }
            },
        };

        let trace_sample_ratio = match read("SPLITSIGHT_TRACE_SAMPLE_RATIO") {
            None => 1.0,
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|r| (0.0..=1.0).contains(r))
                .ok_or_else(|| {
                    Error::Config(format!(
                        "SPLITSIGHT_TRACE_SAMPLE_RATIO must be within [0, 1], got '{raw}'"
                    ))
                })?,
        };

        Ok(Self {
            enabled,
            service_name: read("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| default_service_name.to_string()),
            run_id: read("SPLITSIGHT_TELEMETRY_RUN_ID"),
            trace_sample_ratio,
            log_level: log_level
                .trim()
                .parse::<Level>()
                .map_err(|_| Error::Config(format!("invalid log level '{log_level}'")))?,
        })
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new("service.name", self.service_name.clone()),
            KeyValue::new("service.namespace", "splitsight"),
        ];
        if let Some(run_id) = &self.run_id {
            attributes.push(KeyValue::new("splitsight.run_id", run_id.clone()));
        }
        Resource::default().merge(&Resource::new(attributes))
    }

    fn sampler(&self) -> Sampler {
        let root = if self.trace_sample_ratio >= 1.0 {
            Sampler::AlwaysOn
        } else {
            Sampler::TraceIdRatioBased(self.trace_sample_ratio)
        };
        Sampler::ParentBased(Box::new(root))
    }
}

/// Keeps the providers alive; dropping it flushes and shuts them down.
pub struct Telemetry {
    settings: TelemetrySettings,
    providers: Option<(TracerProvider, SdkMeterProvider)>,
}

impl Telemetry {
    /// Install logging and, when enabled, the OpenTelemetry providers.
    ///
    /// `RUST_LOG`, when set, overrides `log_level`.
    pub fn init_for_component(default_service_name: &str, log_level: &str) -> Result<Self> {
        let settings = TelemetrySettings::from_env(default_service_name, log_level)?;

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(settings.log_level.as_str().to_ascii_lowercase())
        });
        FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .map_err(|e| Error::Config(format!("failed to install log subscriber: {e}")))?;

        let _ = SERVICE_NAME.set(settings.service_name.clone());
        if let Some(run_id) = &settings.run_id {
            let _ = RUN_ID.set(run_id.clone());
        }

        let providers = settings.enabled.then(|| {
            let resource = settings.resource();
            let tracer_provider = TracerProvider::builder()
                .with_config(
                    trace::Config::default()
                        .with_sampler(settings.sampler())
                        .with_resource(resource.clone()),
                )
                .build();
            let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
            let _ = global::set_tracer_provider(tracer_provider.clone());
            global::set_meter_provider(meter_provider.clone());
            global::set_text_map_propagator(TraceContextPropagator::new());
            (tracer_provider, meter_provider)
        });

        info!(
            service_name = %settings.service_name,
            enabled = settings.enabled,
            run_id = settings.run_id.as_deref().unwrap_or("none"),
            trace_sample_ratio = settings.trace_sample_ratio,
            "Telemetry initialized"
        );

        Ok(Self {
            settings,
            providers,
        })
    }

    pub fn settings(&self) -> &TelemetrySettings {
        &self.settings
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some((tracer_provider, meter_provider)) = self.providers.take() {
            let _ = meter_provider.shutdown();
            let _ = tracer_provider.shutdown();
        }
    }
}
