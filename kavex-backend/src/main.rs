mod discord_commands;
use anyhow::Context as _;
use kavex_backend::config::Config;
use kavex_backend::discord::{SerenityWebhooks, channel_message};
use kavex_backend::helpers::now;
use kavex_backend::{AppState, create_app};
use kavex_db::Database;
use poise::{Framework, FrameworkOptions, serenity_prelude as serenity};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

type Context<'a> = poise::Context<'a, crate::Data, crate::discord_commands::Error>;

pub(crate) struct Data {
    pub(crate) state: Arc<AppState>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for structured logging; RUST_LOG wins when set
    #[cfg(debug_assertions)]
    let default_level = "debug";
    #[cfg(not(debug_assertions))]
    let default_level = "info";

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();
    tracing::info!("Starting Kavex bridge...");

    // Load configuration from environment variables or use defaults
    let config = Config::from_env()?;
    let discord_token = config.require_discord_token()?.to_string();
    tracing::info!(
        "Configuration: bind={}, ws_path={}, db_path={}, heartbeat_timeout={}s, max_frame={}KB",
        config.bind_addr(),
        config.ws_path,
        config.database_path,
        config.heartbeat_timeout.as_secs(),
        config.max_frame_bytes / 1024,
    );
    tracing::info!(
        "Delivery: retries={}, backoff={}ms..{}ms, queue={}",
        config.delivery_max_retries,
        config.delivery_backoff.as_millis(),
        config.delivery_max_backoff.as_millis(),
        config.session_queue_capacity,
    );
    if config.token_pepper.is_empty() {
        tracing::warn!("MC_TOKEN_PEPPER is empty; token hashes are unpeppered");
    }

    let db = Database::open(&config.database_path)
        .await
        .context("opening link store")?;
    // No session survives a restart
    db.mark_all_disconnected(now()).await?;

    let http = Arc::new(serenity::Http::new(&discord_token));
    let state = AppState::new(
        config.clone(),
        db,
        Arc::new(SerenityWebhooks::new(http)),
    );
    let sweeper = state.spawn_sweeper();

    let app = create_app(state.clone());
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Bridge listening on {}{}", addr, config.ws_path);

    // read messages in bound channels; role data comes from the guild cache
    let intents = serenity::GatewayIntents::GUILDS
        | serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT;

    let framework_state = state.clone();
    let framework = Framework::builder()
        .options(FrameworkOptions {
            commands: vec![discord_commands::minecraft()],
            event_handler: |ctx, event, _framework, data| {
                Box::pin(async move {
                    if let serenity::FullEvent::Message { new_message } = event {
                        if let Some(message) = channel_message(ctx, new_message) {
                            let outcome = data.state.outbound.route(&message).await;
                            tracing::trace!(
                                channel_id = message.channel_id,
                                ?outcome,
                                "discord message routed"
                            );
                        }
                    }
                    Ok(())
                })
            },
            pre_command: |ctx| {
                Box::pin(async move {
                    tracing::info!(
                        "Executing command '{}' by user '{}'",
                        ctx.command().qualified_name,
                        ctx.author().name
                    );
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    tracing::info!(
                        "Finished command '{}' by user '{}'",
                        ctx.command().qualified_name,
                        ctx.author().name
                    );
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(Data {
                    state: framework_state,
                })
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .context("creating Discord client")?;

    tokio::select! {
        result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()) => {
            if let Err(e) = result {
                tracing::error!("Axum server error: {}", e);
            }
        }
        result = client.start() => {
            if let Err(e) = result {
                tracing::error!("Discord client error: {:?}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    sweeper.abort();
    client.shard_manager.shutdown_all().await;
    Ok(())
}
