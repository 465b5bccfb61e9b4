use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global tracing subscriber. Safe to call more than once; later
/// calls are ignored (matters for tests that share a process).
pub fn init() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}
