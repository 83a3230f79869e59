use crate::auth::Auth;
use crate::error::ProxyError;
use chrono::{DateTime, Utc};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Normalized token counts for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct UsageDetail {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cached: u64,
    pub total: u64,
}

impl UsageDetail {
    /// Fill in `total` when the upstream omitted it but reported components.
    pub fn aggregated(mut self) -> Self {
        if self.total == 0 && (self.input | self.output | self.reasoning) != 0 {
            self.total = self.input + self.output + self.reasoning;
        }
        self
    }

    pub fn is_zero(&self) -> bool {
        self.input == 0
            && self.output == 0
            && self.reasoning == 0
            && self.cached == 0
            && self.total == 0
    }
}

/// One usage record, published at most once per request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    /// Client-facing schema the request arrived in.
    pub source: String,
    pub api_key: String,
    pub auth_id: String,
    pub auth_index: i32,
    pub requested_at: DateTime<Utc>,
    pub failed: bool,
    pub detail: UsageDetail,
}

/// Consumer of usage records. Handlers run on the dispatcher task; panics
/// are recovered and logged.
pub trait UsagePlugin: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, record: &UsageRecord);
}

/// Bounded FIFO queue with a single dispatcher task fanning records out to
/// every registered plugin.
pub struct UsageQueue {
    tx: mpsc::Sender<UsageRecord>,
    plugins: Arc<RwLock<Vec<Arc<dyn UsagePlugin>>>>,
}

impl UsageQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<UsageRecord>(capacity);
        let plugins: Arc<RwLock<Vec<Arc<dyn UsagePlugin>>>> = Arc::new(RwLock::new(Vec::new()));

        let dispatch_plugins = plugins.clone();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let snapshot: Vec<_> = match dispatch_plugins.read() {
                    Ok(p) => p.clone(),
                    Err(_) => continue,
                };
                for plugin in snapshot {
                    let result = catch_unwind(AssertUnwindSafe(|| plugin.handle(&record)));
                    if result.is_err() {
                        tracing::error!(
                            plugin = plugin.name(),
                            model = %record.model,
                            "usage plugin panicked; dispatcher continues"
                        );
                    }
                }
            }
        });

        Arc::new(Self { tx, plugins })
    }

    pub fn register_plugin(&self, plugin: Arc<dyn UsagePlugin>) {
        if let Ok(mut plugins) = self.plugins.write() {
            plugins.push(plugin);
        }
    }

    fn enqueue(&self, record: UsageRecord) {
        if let Err(e) = self.tx.try_send(record) {
            tracing::warn!("usage queue full, dropping record: {e}");
        }
    }
}

/// Per-request reporter carrying a one-shot latch: across
/// `publish_success`, `publish_failure` and `ensure_published`, at most one
/// record reaches the queue.
pub struct UsageReporter {
    queue: Arc<UsageQueue>,
    published: AtomicBool,
    provider: String,
    model: String,
    source: String,
    api_key: String,
    auth_id: String,
    auth_index: i32,
    requested_at: DateTime<Utc>,
}

impl UsageReporter {
    pub fn new(
        queue: Arc<UsageQueue>,
        provider: &str,
        model: &str,
        source: &str,
        auth: &Auth,
    ) -> Self {
        Self {
            queue,
            published: AtomicBool::new(false),
            provider: provider.to_string(),
            model: model.to_string(),
            source: source.to_string(),
            api_key: auth.api_key().unwrap_or_default().to_string(),
            auth_id: auth.id.clone(),
            auth_index: auth.index,
            requested_at: Utc::now(),
        }
    }

    fn claim(&self) -> bool {
        !self.published.swap(true, Ordering::SeqCst)
    }

    fn record(&self, detail: UsageDetail, failed: bool) -> UsageRecord {
        UsageRecord {
            provider: self.provider.clone(),
            model: self.model.clone(),
            source: self.source.clone(),
            api_key: self.api_key.clone(),
            auth_id: self.auth_id.clone(),
            auth_index: self.auth_index,
            requested_at: self.requested_at,
            failed,
            detail,
        }
    }

    /// Publish a successful-request record. Zero-only details are
    /// suppressed without consuming the latch, so `ensure_published` can
    /// still emit the mandatory minimal record later.
    pub fn publish_success(&self, detail: UsageDetail) {
        let detail = detail.aggregated();
        if detail.is_zero() {
            return;
        }
        if self.claim() {
            self.queue.enqueue(self.record(detail, false));
        }
    }

    pub fn publish_failure(&self) {
        if self.claim() {
            self.queue.enqueue(self.record(UsageDetail::default(), true));
        }
    }

    /// Emit a minimal zero record when no usage was observed for this
    /// request.
    pub fn ensure_published(&self) {
        if self.claim() {
            self.queue.enqueue(self.record(UsageDetail::default(), false));
        }
    }

    /// Deferred failure inspection: publishes a failure record iff the
    /// execution result is an error.
    pub fn track_failure<T>(&self, result: &Result<T, ProxyError>) {
        if result.is_err() {
            self.publish_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Capture {
        records: Mutex<Vec<UsageRecord>>,
    }

    impl UsagePlugin for Capture {
        fn name(&self) -> &str {
            "capture"
        }
        fn handle(&self, record: &UsageRecord) {
            self.records.lock().unwrap().push(record.clone());
        }
    }

    struct Panicker;

    impl UsagePlugin for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }
        fn handle(&self, _record: &UsageRecord) {
            panic!("plugin bug");
        }
    }

    fn reporter(queue: Arc<UsageQueue>) -> UsageReporter {
        let auth = Auth {
            id: "auth-1".into(),
            ..Default::default()
        };
        UsageReporter::new(queue, "gemini", "gemini-2.5-pro", "openai", &auth)
    }

    #[tokio::test]
    async fn test_publish_at_most_once() {
        let queue = UsageQueue::new(16);
        let capture = Arc::new(Capture {
            records: Mutex::new(Vec::new()),
        });
        queue.register_plugin(capture.clone());

        let r = reporter(queue.clone());
        r.publish_success(UsageDetail {
            input: 10,
            output: 5,
            ..Default::default()
        });
        r.publish_failure();
        r.ensure_published();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let records = capture.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].failed);
        assert_eq!(records[0].detail.total, 15);
    }

    #[tokio::test]
    async fn test_zero_success_suppressed_until_ensure() {
        let queue = UsageQueue::new(16);
        let capture = Arc::new(Capture {
            records: Mutex::new(Vec::new()),
        });
        queue.register_plugin(capture.clone());

        let r = reporter(queue.clone());
        r.publish_success(UsageDetail::default());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(capture.records.lock().unwrap().is_empty());

        r.ensure_published();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let records = capture.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].detail.is_zero());
    }

    #[tokio::test]
    async fn test_track_failure_only_on_error() {
        let queue = UsageQueue::new(16);
        let capture = Arc::new(Capture {
            records: Mutex::new(Vec::new()),
        });
        queue.register_plugin(capture.clone());

        let ok = reporter(queue.clone());
        ok.track_failure(&Ok::<(), ProxyError>(()));

        let failed = reporter(queue.clone());
        failed.track_failure::<()>(&Err(ProxyError::upstream(500, "boom")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let records = capture.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].failed);
    }

    #[tokio::test]
    async fn test_plugin_panic_does_not_kill_dispatcher() {
        let queue = UsageQueue::new(16);
        let capture = Arc::new(Capture {
            records: Mutex::new(Vec::new()),
        });
        queue.register_plugin(Arc::new(Panicker));
        queue.register_plugin(capture.clone());

        let r = reporter(queue.clone());
        r.publish_success(UsageDetail {
            input: 1,
            ..Default::default()
        });
        let r2 = reporter(queue.clone());
        r2.publish_success(UsageDetail {
            input: 2,
            ..Default::default()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(capture.records.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_detail_aggregation() {
        let d = UsageDetail {
            input: 10,
            output: 4,
            reasoning: 2,
            ..Default::default()
        }
        .aggregated();
        assert_eq!(d.total, 16);

        let d = UsageDetail {
            input: 10,
            output: 4,
            total: 20,
            ..Default::default()
        }
        .aggregated();
        assert_eq!(d.total, 20);
    }
}
