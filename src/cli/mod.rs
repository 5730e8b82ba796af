pub mod config;
pub mod run;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the fmt subscriber. `RUST_LOG` overrides the debug switch.
pub fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "replay_cache=debug"
    } else {
        "replay_cache=warn"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
