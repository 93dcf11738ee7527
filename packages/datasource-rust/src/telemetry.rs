//! Process-wide tracing setup for binaries embedding the data layer.
//!
//! The library itself only emits `tracing` events; hosts call
//! [`init_tracing`] once at startup.

use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter` (e.g. `"info"` or
/// `"apex_datasource=debug"`). With `json` set, events are written as JSON
/// lines carrying the current span (correlation id, source, operation).
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(json: bool, default_filter: &str) -> Result<()> {
    let registry = Registry::default().with(filter(default_filter));

    if json {
        registry
            .with(json_layer())
            .try_init()
            .context("failed to initialize tracing subscriber")?;
    } else {
        registry
            .with(text_layer())
            .try_init()
            .context("failed to initialize tracing subscriber")?;
    }

    Ok(())
}

fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

fn json_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_level(true)
}

fn text_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer().with_target(true).with_thread_names(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_fails_instead_of_panicking() {
        // Either this call or one from a parallel test installs the subscriber;
        // any later call must report an error.
        let _ = init_tracing(false, "warn");
        assert!(init_tracing(true, "warn").is_err());
    }
}
