//! Composable test fixtures using rstest.
//!
//! ```text
//! cloud ─────────┐
//! fast_retry ────┼──▶ reconcilers under test
//! deploy_config ─┘
//! capture_logs (per test, thread-local)
//! ```
//!
//! Tests run on the current-thread runtime, so a thread-local subscriber
//! sees every event a test produces.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rstest::fixture;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use crate::config::DeployConfig;
use crate::retry::RetryPolicy;
use crate::transport::MemoryCloud;

/// An empty in-memory provider.
#[fixture]
pub fn cloud() -> Arc<MemoryCloud> {
    Arc::new(MemoryCloud::new())
}

/// Short waits so paused-clock tests finish in few steps.
#[fixture]
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(40))
}

/// Project `greek/mu` in environment `qa`, with the account pinned.
#[fixture]
pub fn deploy_config() -> DeployConfig {
    let config = r#"
        environment = "qa"

        [project]
        org = "greek"
        name = "mu"

        [aws]
        account_id = "123456789012"

        [retry]
        attempts = 5
        initial_delay_ms = 10
        max_delay_ms = 40
    "#;
    toml::from_str(config).expect("fixture config parses")
}

/// Log messages recorded while the guard is alive.
pub struct CapturedLogs {
    _guard: DefaultGuard,
    messages: Arc<Mutex<Vec<String>>>,
}

impl CapturedLogs {
    /// Every message at INFO or above, in emission order.
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether `message` was logged exactly.
    pub fn contains(&self, message: &str) -> bool {
        self.messages().iter().any(|m| m == message)
    }
}

/// Record log messages for the rest of the test.
pub fn capture_logs() -> CapturedLogs {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let layer = CaptureLayer {
        messages: messages.clone(),
    };
    let guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));
    CapturedLogs {
        _guard: guard,
        messages,
    }
}

struct CaptureLayer {
    messages: Arc<Mutex<Vec<String>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() > Level::INFO {
            return;
        }
        let mut visitor = MessageVisitor(None);
        event.record(&mut visitor);
        if let Some(message) = visitor.0 {
            self.messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message);
        }
    }
}

struct MessageVisitor(Option<String>);

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0 = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}
