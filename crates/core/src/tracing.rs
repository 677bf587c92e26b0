#[cfg(feature = "trace")]
pub(crate) mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{Layer, Registry};

    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let default_filter = level.unwrap_or(default_filter);
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_filter.into())
            .from_env_lossy();

        use tracing_subscriber::layer::SubscriberExt;

        let disabled_logs = std::env::var("PEERWATCH_DISABLE_LOGS").is_ok();
        if disabled_logs {
            return Ok(());
        }
        let to_stderr = std::env::var("PEERWATCH_LOG_TO_STDERR").is_ok();
        let use_json = std::env::var("PEERWATCH_LOG_FORMAT")
            .map(|v| v.to_lowercase() == "json")
            .unwrap_or(false);
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = match (use_json, to_stderr) {
            (true, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (true, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
            (false, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}
