use crate::Environment;
use tracing::{debug, info};
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install color-eyre for binaries that return `eyre::Result` from main.
///
/// Safe to call more than once.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Initialize the global subscriber with an `ErrorLayer` for span traces.
///
/// - **Production** (`APP_ENV=production`): flattened JSON lines, default
///   filter `info`
/// - **Development**: pretty output, default filter `debug`
///
/// `RUST_LOG` overrides the default filter. Calling this twice is harmless;
/// the second call leaves the first subscriber in place.
pub fn init_tracing(environment: &Environment) {
    let is_production = environment.is_production();
    let default_level = if is_production { "info" } else { "debug" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Exactly one of the two formatters is active.
    let json = is_production.then(|| {
        fmt::layer()
            .json()
            .with_target(false)
            .flatten_event(true)
    });
    let pretty = (!is_production).then(|| fmt::layer().pretty().with_target(true));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .with(ErrorLayer::default())
        .try_init()
        .is_ok();

    if installed {
        info!(?environment, default_level, "Tracing initialized");
    } else {
        debug!("Tracing already initialized, skipping re-initialization");
    }
}
