use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset: engine and binary at info,
/// request traces at info, everything else (hyper, html5ever, ...) at warn.
const DEFAULT_FILTER: &str = "warn,novelforge=info,novelforge_app=info,tower_http=info";

pub fn init() -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER)
            .map_err(|err| anyhow::anyhow!("parse default log filter: {err}"))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("install tracing subscriber: {err}"))?;

    Ok(())
}
