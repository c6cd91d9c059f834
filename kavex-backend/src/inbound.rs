//! Game → Discord routing.

use crate::delivery::{Delivery, DeliveryError, Presentation};
use crate::formatting::{self, AvatarResolver};
use crate::protocol::GameEvent;
use crate::registry::LinkRef;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct InboundRouter {
    delivery: Arc<Delivery>,
    avatars: AvatarResolver,
}

impl InboundRouter {
    pub fn new(delivery: Arc<Delivery>, avatars: AvatarResolver) -> Self {
        Self { delivery, avatars }
    }

    /// How a game event looks in Discord.
    pub fn present(&self, link: &LinkRef, event: &GameEvent) -> Presentation {
        match event {
            GameEvent::Chat {
                player,
                player_uuid,
                message,
            } => Presentation {
                username: formatting::webhook_username(player),
                avatar_url: self.avatars.resolve(player, player_uuid.as_deref()),
                content: formatting::safe_content(message),
            },
            GameEvent::Join { player, .. } => notice(link, formatting::join_notice(player)),
            GameEvent::Quit { player, .. } => notice(link, formatting::quit_notice(player)),
            GameEvent::Death { death_message, .. } => {
                notice(link, formatting::death_notice(death_message))
            }
        }
    }

    /// Deliver a game event into the link's channel.
    pub async fn route(&self, link: &LinkRef, event: &GameEvent) -> Result<(), DeliveryError> {
        let presentation = self.present(link, event);
        self.delivery.deliver(link.channel_id, &presentation).await
    }

    /// Post a system notice ("server connected", ...) under the server's name.
    pub async fn announce(&self, link: &LinkRef, text: String) -> Result<(), DeliveryError> {
        self.delivery
            .deliver(link.channel_id, &notice(link, text))
            .await
    }

    /// Start the ordered delivery worker for one session. `greeting`, if
    /// given, is announced before any queued event.
    pub fn spawn_worker(
        self: &Arc<Self>,
        link: LinkRef,
        capacity: usize,
        greeting: Option<String>,
    ) -> InboundQueue {
        let (tx, mut rx) = mpsc::channel::<GameEvent>(capacity.max(1));
        let router = self.clone();
        let task = tokio::spawn(async move {
            if let Some(text) = greeting {
                if let Err(e) = router.announce(&link, text).await {
                    warn!(channel_id = link.channel_id, error = %e, "dropped connection notice");
                }
            }
            while let Some(event) = rx.recv().await {
                if let Err(e) = router.route(&link, &event).await {
                    // dropped; the session keeps running
                    warn!(channel_id = link.channel_id, error = %e, "dropped game event");
                }
            }
            debug!(channel_id = link.channel_id, "inbound worker finished");
        });
        InboundQueue { tx, task }
    }
}

fn notice(link: &LinkRef, text: String) -> Presentation {
    Presentation {
        username: formatting::webhook_username(&link.server_name),
        avatar_url: None,
        content: formatting::truncate_chars(&text, formatting::MAX_CONTENT_LEN),
    }
}

/// Bounded, in-order queue of game events awaiting delivery for one session.
pub struct InboundQueue {
    tx: mpsc::Sender<GameEvent>,
    task: JoinHandle<()>,
}

impl InboundQueue {
    /// Enqueue without waiting. Returns false (and drops the event) when the
    /// queue is full.
    pub fn push(&self, event: GameEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }

    /// Cancel pending and in-flight deliveries for this session.
    pub fn cancel(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryConfig, PostError, WebhookApi};
    use async_trait::async_trait;
    use kavex_db::{Database, DeliveryEndpoint, TokenHash};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        posts: Mutex<Vec<Presentation>>,
    }

    #[async_trait]
    impl WebhookApi for Recorder {
        async fn create(&self, channel_id: u64, _name: &str) -> Result<DeliveryEndpoint, PostError> {
            Ok(DeliveryEndpoint::new(format!("https://discord.test/{channel_id}")))
        }

        async fn execute(
            &self,
            _endpoint: &DeliveryEndpoint,
            presentation: &Presentation,
        ) -> Result<(), PostError> {
            self.posts.lock().unwrap().push(presentation.clone());
            Ok(())
        }
    }

    fn link() -> LinkRef {
        LinkRef {
            guild_id: 1,
            channel_id: 10,
            token_hash: TokenHash::from("b".repeat(64).as_str()).unwrap(),
            server_name: "Survival".to_string(),
        }
    }

    async fn router() -> (Arc<Recorder>, Arc<InboundRouter>) {
        let db = Database::open_in_memory().await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let config = DeliveryConfig {
            webhook_name: "Test".to_string(),
            max_retries: 1,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            rate_limit_fallback: Duration::from_millis(1),
        };
        let delivery = Arc::new(Delivery::new(recorder.clone(), db, config));
        let router = InboundRouter::new(
            delivery,
            AvatarResolver::new("https://crafatar.com/avatars/{uuid}"),
        );
        (recorder, Arc::new(router))
    }

    #[tokio::test]
    async fn test_chat_presentation() {
        let (_recorder, router) = router().await;
        let event = GameEvent::Chat {
            player: "Notch".to_string(),
            player_uuid: Some("069a79f444e94726a5befca90e38aaf5".to_string()),
            message: "hi @everyone".to_string(),
        };

        let p = router.present(&link(), &event);

        assert_eq!(p.username, "Notch");
        assert_eq!(
            p.avatar_url.as_deref(),
            Some("https://crafatar.com/avatars/069a79f444e94726a5befca90e38aaf5")
        );
        assert_eq!(p.content, "hi @\u{200B}everyone");
    }

    #[tokio::test]
    async fn test_system_notices_use_server_name() {
        let (_recorder, router) = router().await;
        let join = router.present(
            &link(),
            &GameEvent::Join {
                player: "Notch".to_string(),
                player_uuid: None,
            },
        );
        assert_eq!(join.username, "Survival");
        assert_eq!(join.avatar_url, None);
        assert_eq!(join.content, "➡️ **Notch** joined the game.");

        let death = router.present(
            &link(),
            &GameEvent::Death {
                player: "Notch".to_string(),
                player_uuid: None,
                death_message: "Notch hit the ground too hard".to_string(),
            },
        );
        assert_eq!(death.content, "💀 Notch hit the ground too hard");
    }

    #[tokio::test]
    async fn test_worker_delivers_in_order() {
        // GIVEN: a worker for channel 10
        let (recorder, router) = router().await;
        let queue = router.spawn_worker(link(), 8, Some("hello".to_string()));

        // WHEN: three events are queued
        for n in 0..3 {
            assert!(queue.push(GameEvent::Chat {
                player: "Notch".to_string(),
                player_uuid: None,
                message: format!("msg {n}"),
            }));
        }

        // THEN: they arrive in order, after the greeting
        for _ in 0..100 {
            if recorder.posts.lock().unwrap().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let contents: Vec<String> = recorder
            .posts
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.content.clone())
            .collect();
        assert_eq!(contents, vec!["hello", "msg 0", "msg 1", "msg 2"]);
        queue.cancel();
    }
}
