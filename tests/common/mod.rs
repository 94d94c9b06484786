use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Counts WARN and ERROR events across every thread.
#[derive(Clone, Default)]
pub struct EventCounter {
    warnings: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

impl EventCounter {
    /// Installs the counter as the global subscriber. Call once per test
    /// binary.
    pub fn install() -> Self {
        let counter = Self::default();
        let subscriber = tracing_subscriber::registry().with(counter.clone());
        tracing::subscriber::set_global_default(subscriber)
            .expect("global subscriber already installed");
        counter
    }

    pub fn warnings(&self) -> usize {
        self.warnings.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for EventCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        match *event.metadata().level() {
            Level::ERROR => {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
            Level::WARN => {
                self.warnings.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}
