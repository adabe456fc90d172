//! Bounded-concurrency batch scheduler for pending content units

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::core::cache::{Fingerprint, SmartCache};
use crate::core::client::TranslationBackend;
use crate::core::errors::{PipelineError, Result, TranslateError};
use crate::core::models::{
    BatchProgress, BatchSummary, ContentUnit, Glossary, RetryPolicy, UnitFailure,
};
use crate::core::rate_limit::RateLimiter;
use crate::core::store::MappingStore;

/// Cooperative cancellation handle shared between caller and workers
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop pulling new jobs and abandon in-flight calls
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-run parameters
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub target_lang: String,
    pub glossary: Glossary,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

enum UnitOutcome {
    /// Resolved by a fresh backend call
    Translated(String),
    /// Resolved from the cache or by joining another unit's call
    CacheHit(String),
    Failed(TranslateError),
}

/// Drives resolution of all pending units to completion under bounded
/// concurrency, rate limiting, and the retry policy.
///
/// A single unit's permanent failure is recorded and the batch continues;
/// only storage failures abort the whole run.
pub struct BatchScheduler {
    backend: Arc<dyn TranslationBackend>,
    cache: Arc<SmartCache>,
    store: Arc<MappingStore>,
    limiter: Arc<RateLimiter>,
    progress_tx: watch::Sender<BatchProgress>,
}

impl BatchScheduler {
    pub fn new(
        backend: Arc<dyn TranslationBackend>,
        cache: Arc<SmartCache>,
        store: Arc<MappingStore>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let (progress_tx, _) = watch::channel(BatchProgress::default());
        Self {
            backend,
            cache,
            store,
            limiter,
            progress_tx,
        }
    }

    /// Subscribe to live progress; callers pull at their own pace
    pub fn progress(&self) -> watch::Receiver<BatchProgress> {
        self.progress_tx.subscribe()
    }

    /// Translate every pending unit, returning the batch result summary
    pub async fn run(&self, options: BatchOptions, cancel: CancelToken) -> Result<BatchSummary> {
        let pending = self.store.pending_units();
        let total = pending.len();
        info!(
            "batch start: {} pending unit(s), concurrency {}",
            total, options.concurrency
        );

        let summary = Arc::new(Mutex::new(BatchSummary {
            total,
            ..Default::default()
        }));
        self.progress_tx.send_replace(BatchProgress {
            total,
            ..Default::default()
        });

        if total == 0 {
            return Ok(Arc::try_unwrap(summary).map_err(|_| unreachable_poisoned())?.into_inner().unwrap());
        }

        let queue: Arc<Mutex<VecDeque<ContentUnit>>> =
            Arc::new(Mutex::new(pending.into_iter().collect()));
        let options = Arc::new(options);
        let fatal: Arc<Mutex<Option<PipelineError>>> = Arc::new(Mutex::new(None));

        let workers = options.concurrency.clamp(1, total);
        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let backend = self.backend.clone();
            let cache = self.cache.clone();
            let store = self.store.clone();
            let limiter = self.limiter.clone();
            let queue = queue.clone();
            let options = options.clone();
            let cancel = cancel.clone();
            let summary = summary.clone();
            let fatal = fatal.clone();
            let progress_tx = self.progress_tx.clone();

            set.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let unit = match queue.lock().unwrap().pop_front() {
                        Some(unit) => unit,
                        None => break,
                    };

                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("worker {} abandoning unit {}", worker_id, unit.content_id);
                            break;
                        }
                        outcome = resolve_unit(&*backend, &cache, &limiter, &options, &unit) => outcome,
                    };

                    let translated = match &outcome {
                        UnitOutcome::Translated(text) | UnitOutcome::CacheHit(text) => {
                            Some(text.clone())
                        }
                        UnitOutcome::Failed(_) => None,
                    };

                    if let Some(text) = translated {
                        if let Err(e) =
                            store.update_content_unit(&unit.content_id, &text, Utc::now())
                        {
                            // Storage failures threaten mapping consistency;
                            // stop the whole batch and surface verbatim.
                            warn!("aborting batch, store update failed: {}", e);
                            *fatal.lock().unwrap() = Some(e);
                            cancel.cancel();
                            break;
                        }
                    }

                    {
                        let mut summary = summary.lock().unwrap();
                        match outcome {
                            UnitOutcome::Translated(_) => summary.succeeded += 1,
                            UnitOutcome::CacheHit(_) => summary.cache_hits += 1,
                            UnitOutcome::Failed(e) => {
                                warn!("unit {} failed: {}", unit.content_id, e);
                                summary.failed.push(UnitFailure {
                                    content_id: unit.content_id.clone(),
                                    kind: e.kind().to_string(),
                                    message: e.to_string(),
                                });
                            }
                        }
                        progress_tx.send_replace(BatchProgress {
                            total,
                            completed: summary.resolved(),
                            failed: summary.failed.len(),
                        });
                    }
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                return Err(PipelineError::ConfigError {
                    message: format!("worker task panicked: {}", e),
                });
            }
        }

        if let Some(e) = fatal.lock().unwrap().take() {
            return Err(e);
        }

        let mut summary = Arc::try_unwrap(summary)
            .map_err(|_| unreachable_poisoned())?
            .into_inner()
            .unwrap();
        summary.cancelled = cancel.is_cancelled();

        info!(
            "batch done: {} translated, {} from cache, {} failed{}",
            summary.succeeded,
            summary.cache_hits,
            summary.failed.len(),
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        Ok(summary)
    }
}

fn unreachable_poisoned() -> PipelineError {
    PipelineError::ConfigError {
        message: "batch summary lock poisoned".to_string(),
    }
}

/// Resolve one unit through the cache's single-flight contract
async fn resolve_unit(
    backend: &dyn TranslationBackend,
    cache: &SmartCache,
    limiter: &RateLimiter,
    options: &BatchOptions,
    unit: &ContentUnit,
) -> UnitOutcome {
    let key = Fingerprint::compute(
        &unit.original_text,
        &options.target_lang,
        &options.glossary.version,
    );

    let ran_backend = AtomicBool::new(false);
    let result = cache
        .resolve(&key, || {
            ran_backend.store(true, Ordering::SeqCst);
            translate_with_retry(
                backend,
                limiter,
                &options.retry,
                &unit.original_text,
                &options.target_lang,
                &options.glossary,
            )
        })
        .await;

    match result {
        Ok(text) => {
            cache.record_reference(&key);
            if ran_backend.load(Ordering::SeqCst) {
                UnitOutcome::Translated(text)
            } else {
                UnitOutcome::CacheHit(text)
            }
        }
        Err(e) => UnitOutcome::Failed(e),
    }
}

/// One external call per attempt, rate-limited, with exponential backoff on
/// transient failures. Permanent failures surface immediately.
async fn translate_with_retry(
    backend: &dyn TranslationBackend,
    limiter: &RateLimiter,
    retry: &RetryPolicy,
    text: &str,
    target_lang: &str,
    glossary: &Glossary,
) -> std::result::Result<String, TranslateError> {
    let mut last_error = None;

    for attempt in 1..=retry.max_attempts {
        limiter.acquire().await;

        match backend.translate(text, target_lang, glossary).await {
            Ok(translation) => {
                if attempt > 1 {
                    debug!("translated after {} attempts", attempt);
                }
                return Ok(translation);
            }
            Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                let delay = match &e {
                    TranslateError::Transient {
                        retry_after: Some(secs),
                        ..
                    } => std::time::Duration::from_secs(*secs),
                    _ => retry.delay_for(attempt),
                };
                debug!("attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                last_error = Some(e);
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or(TranslateError::Permanent {
        message: "retry loop exhausted without an attempt".to_string(),
    }))
}
