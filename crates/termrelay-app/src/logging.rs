use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "termrelay=info,termrelay_terminal=info,tower_http=info";
const VERBOSE_FILTER: &str = "termrelay=debug,termrelay_terminal=debug,tower_http=debug";

/// Install the global tracing subscriber. `RUST_LOG` overrides the defaults.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
