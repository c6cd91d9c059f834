//! Posting into Discord channels through per-channel webhooks.
//!
//! Each channel has one slot guarded by its own async mutex. The slot lock
//! is held for the whole of a delivery, which gives single-creator
//! semantics for the webhook, keeps posts to one channel in order, and makes
//! every sender to a rate-limited channel wait out its cool-down. Unrelated
//! channels never contend.

use async_trait::async_trait;
use kavex_db::{Database, DeliveryEndpoint};
use scc::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What to post: who it appears to be from, and the (already escaped) body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presentation {
    pub username: String,
    pub avatar_url: Option<String>,
    pub content: String,
}

/// Failure of a single webhook call, classified by what it means for retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PostError {
    #[error("webhook no longer exists")]
    TargetMissing,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("missing permission")]
    Forbidden,

    #[error("channel no longer exists")]
    ChannelMissing,

    #[error("transient failure: {0}")]
    Transient(String),
}

/// The Discord operations delivery needs.
#[async_trait]
pub trait WebhookApi: Send + Sync {
    /// Create a webhook in `channel_id` and return its execute URL.
    async fn create(&self, channel_id: u64, name: &str) -> Result<DeliveryEndpoint, PostError>;

    async fn execute(
        &self,
        endpoint: &DeliveryEndpoint,
        presentation: &Presentation,
    ) -> Result<(), PostError>;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("the bot lacks permission to manage webhooks or post in this channel")]
    Forbidden,

    #[error("the channel no longer exists")]
    ChannelMissing,

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: PostError },
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub webhook_name: String,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub rate_limit_fallback: Duration,
}

impl From<&crate::config::Config> for DeliveryConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            webhook_name: config.webhook_name.clone(),
            max_retries: config.delivery_max_retries,
            base_backoff: config.delivery_backoff,
            max_backoff: config.delivery_max_backoff,
            rate_limit_fallback: config.rate_limit_fallback,
        }
    }
}

#[derive(Default)]
struct Slot {
    target: Option<DeliveryEndpoint>,
    /// Whether the store has been consulted for a persisted endpoint.
    loaded: bool,
    cooldown_until: Option<Instant>,
}

pub struct Delivery {
    api: Arc<dyn WebhookApi>,
    db: Database,
    config: DeliveryConfig,
    slots: HashMap<u64, Arc<Mutex<Slot>>>,
    recreations: AtomicU64,
}

impl Delivery {
    pub fn new(api: Arc<dyn WebhookApi>, db: Database, config: DeliveryConfig) -> Self {
        Self {
            api,
            db,
            config,
            slots: HashMap::new(),
            recreations: AtomicU64::new(0),
        }
    }

    /// Post `presentation` into `channel_id`.
    ///
    /// A deleted webhook is recreated at most once per call. Rate limits and
    /// transient failures are retried with backoff up to the configured
    /// ceiling; permission and missing-channel failures are not retried.
    pub async fn deliver(
        &self,
        channel_id: u64,
        presentation: &Presentation,
    ) -> Result<(), DeliveryError> {
        let slot = self.slot(channel_id).await;
        let mut slot = slot.lock().await;

        let mut recreated = false;
        let mut failures = 0u32;

        loop {
            if let Some(until) = slot.cooldown_until.take() {
                debug!(channel_id, "waiting out rate limit");
                tokio::time::sleep_until(until).await;
            }

            let result = match self.resolve(channel_id, &mut slot).await {
                Ok(endpoint) => self.api.execute(&endpoint, presentation).await,
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            match &err {
                PostError::TargetMissing if !recreated => {
                    recreated = true;
                    self.recreations.fetch_add(1, Ordering::Relaxed);
                    info!(channel_id, "webhook was deleted, recreating");
                    self.invalidate(channel_id, &mut slot).await;
                    continue;
                }
                PostError::Forbidden => {
                    warn!(channel_id, "missing permission to deliver");
                    return Err(DeliveryError::Forbidden);
                }
                PostError::ChannelMissing => {
                    warn!(channel_id, "channel is gone");
                    self.invalidate(channel_id, &mut slot).await;
                    return Err(DeliveryError::ChannelMissing);
                }
                PostError::RateLimited { retry_after } => {
                    let wait = (*retry_after).unwrap_or(self.config.rate_limit_fallback);
                    slot.cooldown_until = Some(Instant::now() + wait);
                    debug!(channel_id, wait_ms = wait.as_millis() as u64, "rate limited");
                }
                PostError::TargetMissing | PostError::Transient(_) => {}
            }

            failures += 1;
            if failures > self.config.max_retries {
                warn!(channel_id, attempts = failures, error = %err, "delivery failed");
                return Err(DeliveryError::Exhausted {
                    attempts: failures,
                    last: err,
                });
            }

            if !matches!(err, PostError::RateLimited { .. }) {
                let backoff = self.backoff(failures);
                debug!(
                    channel_id,
                    attempt = failures,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "retrying delivery"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }

    /// Drop the cached webhook for a channel (the link was removed).
    ///
    /// The slot itself stays in place so that a delivery already holding its
    /// lock and one waiting on it keep sharing the same mutex.
    pub async fn forget(&self, channel_id: u64) {
        let Some(slot) = self
            .slots
            .read_async(&channel_id, |_, slot| slot.clone())
            .await
        else {
            return;
        };
        let mut slot = slot.lock().await;
        slot.target = None;
        slot.loaded = false;
        debug!(channel_id, "forgot delivery target");
    }

    /// Number of webhook recreations after external deletion.
    pub fn recreations(&self) -> u64 {
        self.recreations.load(Ordering::Relaxed)
    }

    async fn slot(&self, channel_id: u64) -> Arc<Mutex<Slot>> {
        self.slots
            .entry_async(channel_id)
            .await
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .get()
            .clone()
    }

    /// Cached endpoint, else the persisted one, else a newly created one.
    async fn resolve(
        &self,
        channel_id: u64,
        slot: &mut Slot,
    ) -> Result<DeliveryEndpoint, PostError> {
        if let Some(endpoint) = &slot.target {
            return Ok(endpoint.clone());
        }

        if !slot.loaded {
            slot.loaded = true;
            match self.db.get_link_by_channel(channel_id).await {
                Ok(Some(link)) => {
                    if let Some(endpoint) = link.delivery_endpoint {
                        slot.target = Some(endpoint.clone());
                        return Ok(endpoint);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(channel_id, error = %e, "could not load stored webhook"),
            }
        }

        let endpoint = self
            .api
            .create(channel_id, &self.config.webhook_name)
            .await
            .map_err(|e| match e {
                // a 404 on create means the channel itself is gone
                PostError::TargetMissing => PostError::ChannelMissing,
                other => other,
            })?;
        info!(channel_id, "created webhook");

        if let Err(e) = self
            .db
            .set_delivery_endpoint(channel_id, Some(endpoint.clone()))
            .await
        {
            warn!(channel_id, error = %e, "could not persist webhook");
        }
        slot.target = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn invalidate(&self, channel_id: u64, slot: &mut Slot) {
        slot.target = None;
        slot.loaded = true;
        if let Err(e) = self.db.set_delivery_endpoint(channel_id, None).await {
            warn!(channel_id, error = %e, "could not clear stored webhook");
        }
    }

    /// Exponential backoff with jitter in [50%, 100%] of the nominal delay.
    fn backoff(&self, attempt: u32) -> Duration {
        let nominal = self
            .config
            .base_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
            .min(self.config.max_backoff);
        let half = nominal.as_millis() as u64 / 2;
        let jitter = if half == 0 {
            0
        } else {
            rand::random::<u64>() % (half + 1)
        };
        Duration::from_millis(half + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Scripted webhook API: pops one canned result per execute call.
    #[derive(Default)]
    struct ScriptedWebhooks {
        creates: AtomicU64,
        executes: StdMutex<Vec<(String, Presentation)>>,
        script: StdMutex<VecDeque<Result<(), PostError>>>,
        create_error: StdMutex<Option<PostError>>,
        create_delay: Duration,
    }

    impl ScriptedWebhooks {
        fn with_script(script: Vec<Result<(), PostError>>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                ..Default::default()
            })
        }

        fn creates(&self) -> u64 {
            self.creates.load(Ordering::SeqCst)
        }

        fn executed(&self) -> Vec<(String, Presentation)> {
            self.executes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WebhookApi for ScriptedWebhooks {
        async fn create(&self, channel_id: u64, _name: &str) -> Result<DeliveryEndpoint, PostError> {
            if let Some(err) = self.create_error.lock().unwrap().clone() {
                return Err(err);
            }
            let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.create_delay.is_zero() {
                tokio::time::sleep(self.create_delay).await;
            }
            Ok(DeliveryEndpoint::new(format!(
                "https://discord.test/api/webhooks/{channel_id}/hook{n}"
            )))
        }

        async fn execute(
            &self,
            endpoint: &DeliveryEndpoint,
            presentation: &Presentation,
        ) -> Result<(), PostError> {
            let result = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                self.executes
                    .lock()
                    .unwrap()
                    .push((endpoint.as_str().to_string(), presentation.clone()));
            }
            result
        }
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig {
            webhook_name: "Test Link".to_string(),
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            rate_limit_fallback: Duration::from_millis(500),
        }
    }

    async fn setup(api: Arc<ScriptedWebhooks>) -> (Database, Delivery) {
        let db = Database::open_in_memory().await.unwrap();
        db.upsert_link(1, 10, crate::helpers::hash_token("abc", ""), 100)
            .await
            .unwrap();
        let delivery = Delivery::new(api, db.clone(), config());
        (db, delivery)
    }

    fn hello() -> Presentation {
        Presentation {
            username: "Notch".to_string(),
            avatar_url: None,
            content: "hi".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_delivery_creates_and_persists_webhook() {
        // GIVEN: a link with no webhook yet
        let api = ScriptedWebhooks::with_script(vec![]);
        let (db, delivery) = setup(api.clone()).await;

        // WHEN: two messages are delivered
        delivery.deliver(10, &hello()).await.unwrap();
        delivery.deliver(10, &hello()).await.unwrap();

        // THEN: one webhook was created, reused, and stored on the link
        assert_eq!(api.creates(), 1);
        assert_eq!(api.executed().len(), 2);
        let link = db.get_link_by_channel(10).await.unwrap().unwrap();
        assert_eq!(
            link.delivery_endpoint.unwrap().as_str(),
            "https://discord.test/api/webhooks/10/hook1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stored_webhook_is_reused() {
        let api = ScriptedWebhooks::with_script(vec![]);
        let (db, delivery) = setup(api.clone()).await;
        db.set_delivery_endpoint(10, Some(DeliveryEndpoint::new("https://discord.test/stored")))
            .await
            .unwrap();

        delivery.deliver(10, &hello()).await.unwrap();

        assert_eq!(api.creates(), 0);
        assert_eq!(api.executed()[0].0, "https://discord.test/stored");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_target_recreated_once() {
        // GIVEN: the webhook reports deleted twice, then works
        let api = ScriptedWebhooks::with_script(vec![
            Err(PostError::TargetMissing),
            Err(PostError::TargetMissing),
            Ok(()),
        ]);
        let (db, delivery) = setup(api.clone()).await;

        // WHEN: one message is delivered
        let result = delivery.deliver(10, &hello()).await;

        // THEN: the caller sees success and exactly one recreation happened
        assert!(result.is_ok());
        assert_eq!(delivery.recreations(), 1);
        assert_eq!(api.creates(), 2);
        let link = db.get_link_by_channel(10).await.unwrap().unwrap();
        assert_eq!(
            link.delivery_endpoint.unwrap().as_str(),
            "https://discord.test/api/webhooks/10/hook2"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_retries() {
        let api = ScriptedWebhooks::with_script(vec![
            Err(PostError::Transient("502".to_string()));
            10
        ]);
        let (_db, delivery) = setup(api.clone()).await;

        let err = delivery.deliver(10, &hello()).await.unwrap_err();

        match err {
            DeliveryError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 4);
                assert_eq!(last, PostError::Transient("502".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(api.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_is_not_retried() {
        let api = ScriptedWebhooks::with_script(vec![Err(PostError::Forbidden), Ok(())]);
        let (_db, delivery) = setup(api.clone()).await;

        let err = delivery.deliver(10, &hello()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Forbidden));

        // the scripted Ok was never consumed by a retry
        delivery.deliver(10, &hello()).await.unwrap();
        assert_eq!(api.executed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_forbidden_surfaces() {
        let api = ScriptedWebhooks::with_script(vec![]);
        *api.create_error.lock().unwrap() = Some(PostError::Forbidden);
        let (_db, delivery) = setup(api.clone()).await;

        let err = delivery.deliver(10, &hello()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Forbidden));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_cooldown_is_honored() {
        // GIVEN: the first post is rate limited for 2 seconds
        let api = ScriptedWebhooks::with_script(vec![
            Err(PostError::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
            }),
            Ok(()),
        ]);
        let (_db, delivery) = setup(api.clone()).await;
        let started = Instant::now();

        // WHEN: delivering
        delivery.deliver(10, &hello()).await.unwrap();

        // THEN: the retry waited out the cool-down
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(api.executed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_first_deliveries_create_once() {
        let api = ScriptedWebhooks::with_script(vec![]);
        let (_db, delivery) = setup(api.clone()).await;

        let (msg_a, msg_b) = (hello(), hello());
        let (a, b) = tokio::join!(delivery.deliver(10, &msg_a), delivery.deliver(10, &msg_b));

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(api.creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_drops_cached_target() {
        let api = ScriptedWebhooks::with_script(vec![]);
        let (db, delivery) = setup(api.clone()).await;
        delivery.deliver(10, &hello()).await.unwrap();

        // the stored endpoint is gone too, as after an unlink
        db.set_delivery_endpoint(10, None).await.unwrap();
        delivery.forget(10).await;
        delivery.deliver(10, &hello()).await.unwrap();

        assert_eq!(api.creates(), 2);
    }

    #[tokio::test]
    async fn test_forget_during_first_delivery_keeps_single_creator() {
        // GIVEN: a first delivery that is still creating the webhook
        let api = Arc::new(ScriptedWebhooks {
            create_delay: Duration::from_millis(200),
            ..Default::default()
        });
        let (_db, delivery) = setup(api.clone()).await;
        let delivery = Arc::new(delivery);
        let first = tokio::spawn({
            let delivery = delivery.clone();
            async move { delivery.deliver(10, &hello()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // WHEN: the cached target is forgotten and a second delivery starts
        let forget = tokio::spawn({
            let delivery = delivery.clone();
            async move { delivery.forget(10).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        delivery.deliver(10, &hello()).await.unwrap();

        // THEN: the second delivery waited its turn and reused the stored webhook
        first.await.unwrap().unwrap();
        forget.await.unwrap();
        assert_eq!(api.creates(), 1);
        assert_eq!(api.executed().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_without_hint_uses_fallback() {
        // GIVEN: a 429 that carries no retry-after
        let api = ScriptedWebhooks::with_script(vec![
            Err(PostError::RateLimited { retry_after: None }),
            Ok(()),
        ]);
        let (_db, delivery) = setup(api.clone()).await;
        let started = Instant::now();

        // WHEN: delivering
        delivery.deliver(10, &hello()).await.unwrap();

        // THEN: the configured fallback cool-down was waited out
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(api.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_backoff_is_capped_and_jittered() {
        let api = ScriptedWebhooks::with_script(vec![]);
        let (_db, delivery) = setup(api).await;
        for attempt in 1..=10 {
            let b = delivery.backoff(attempt).as_millis() as u64;
            let nominal = (100u64 << (attempt - 1)).min(1000);
            assert!(b >= nominal / 2, "attempt {attempt}: {b}ms");
            assert!(b <= nominal, "attempt {attempt}: {b}ms");
        }
    }
}
