//! Tracing subscriber setup for the `ferry` smoke-test binary.

use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{Layer as _, layer::SubscriberExt as _};

/// Build (but do not install) the process-wide tracing subscriber.
///
/// Verbosity is controlled by the `FERRY_LOG` environment variable (standard
/// `tracing-subscriber` `EnvFilter` syntax), falling back to `info` when
/// unset.
pub fn make_logger<W>(writer: W) -> impl tracing::Subscriber
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(writer)
                .with_filter(
                    tracing_subscriber::EnvFilter::builder()
                        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                        .with_env_var("FERRY_LOG")
                        .from_env_lossy(),
                ),
        )
}
