//! Logging initialization (`spec.md` §6 `logging.redactionLevel`), playing
//! the role the teacher gives `trogging`.

use crate::config::LoggingConfig;
use observability_deps::tracing;
use observability_deps::tracing::Subscriber;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber. Must be called once, before any
/// other module logs anything (`spec.md` §4.7's startup sequence logs from
/// step 1 onward).
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt::Subscriber::builder().with_env_filter(filter);

    if config.json {
        builder.json().finish().init_or_warn();
    } else {
        builder.finish().init_or_warn();
    }
}

trait InitOrWarn {
    fn init_or_warn(self);
}

impl<S> InitOrWarn for S
where
    S: Subscriber + Send + Sync + 'static,
{
    fn init_or_warn(self) {
        if tracing::subscriber::set_global_default(self).is_err() {
            eprintln!("global tracing subscriber already set; ignoring duplicate init");
        }
    }
}
