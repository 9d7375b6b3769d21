//! Console logging.
//!
//! Logs go to stderr so stdout stays reserved for call results. The filter is
//! read from `RUST_LOG` and defaults to `info`; the call engine's own events
//! are compiled in with the `tracing` feature.
//!
//! ```bash
//! RUST_LOG=rpcprobe_core=debug rpcprobe --call helloworld.Greeter/SayHello -d '{}'
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_telemetry() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        )
        .try_init()?;
    Ok(())
}
