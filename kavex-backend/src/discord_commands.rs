use crate::Context;
use kavex_backend::admin::{AdminError, StatusReport};
use kavex_backend::helpers::{format_elapsed, now, short_hash};
use kavex_db::{LinkStatus, LinkUpsert};
use poise::CreateReply;
use poise::command;
use poise::serenity_prelude::{self as serenity, CreateEmbed, CreateEmbedFooter};

pub(crate) type Error = Box<dyn std::error::Error + Send + Sync>;

const EMBED_COLOR: u32 = 0x5865F2;

/// Bridge a Minecraft server with a Discord channel
#[command(
    slash_command,
    subcommands("connect", "disconnect", "status", "debug_hash", "debug_links", "test_send"),
    subcommand_required,
    required_permissions = "ADMINISTRATOR",
    guild_only
)]
pub async fn minecraft(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Link a channel to the Minecraft server holding this plugin token
#[command(
    slash_command,
    required_permissions = "ADMINISTRATOR",
    guild_only,
    ephemeral
)]
pub async fn connect(
    ctx: Context<'_>,
    #[description = "Token from the plugin's config"] token: String,
    #[description = "Channel to bridge (defaults to this one)"] channel: Option<
        serenity::GuildChannel,
    >,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let channel_id = target_channel(&ctx, channel);

    let text = match ctx.data().state.admin.connect(guild_id, channel_id, &token).await {
        Ok(LinkUpsert::Created(link)) => format!(
            "✅ Linked <#{}>. Start the server; it will appear as connected once the plugin authenticates.\nStored hash: `{}`",
            channel_id,
            link.short_hash()
        ),
        Ok(LinkUpsert::Unchanged(_)) => format!("ℹ️ <#{channel_id}> is already linked with this token."),
        Ok(LinkUpsert::Rekeyed(link)) => format!(
            "🔁 Replaced the token for <#{}>. Update the plugin config to the new token.\nStored hash: `{}`",
            channel_id,
            link.short_hash()
        ),
        Err(e) => describe(e),
    };
    reply(&ctx, text).await
}

/// Unlink a channel and drop its live connection
#[command(
    slash_command,
    required_permissions = "ADMINISTRATOR",
    guild_only,
    ephemeral
)]
pub async fn disconnect(
    ctx: Context<'_>,
    #[description = "Linked channel (defaults to this one)"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;
    let channel_id = target_channel(&ctx, channel);

    let text = match ctx.data().state.admin.disconnect(guild_id, channel_id).await {
        Ok(true) => format!("🔌 <#{channel_id}> is no longer linked."),
        Ok(false) => format!("ℹ️ <#{channel_id}> was not linked."),
        Err(e) => describe(e),
    };
    reply(&ctx, text).await
}

/// Show the connection status of a linked channel
#[command(
    slash_command,
    required_permissions = "ADMINISTRATOR",
    guild_only,
    ephemeral
)]
pub async fn status(
    ctx: Context<'_>,
    #[description = "Linked channel (defaults to this one)"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let channel_id = target_channel(&ctx, channel);

    match ctx.data().state.admin.status(channel_id).await {
        Ok(report) => {
            ctx.send(CreateReply::default().embed(status_embed(&report)).ephemeral(true))
                .await?;
            Ok(())
        }
        Err(e) => reply(&ctx, describe(e)).await,
    }
}

fn status_embed(report: &StatusReport) -> CreateEmbed {
    let icon = match report.status {
        LinkStatus::Connected => "🟢",
        LinkStatus::Disconnected => "🔴",
        LinkStatus::Error => "⚠️",
    };
    let last_seen = report
        .last_seen_at
        .map(|at| format!("{} ago", format_elapsed(now() - at)))
        .unwrap_or_else(|| "never".to_string());

    CreateEmbed::default()
        .title(format!("{} {}", icon, report.server_name))
        .field("Channel", format!("<#{}>", report.channel_id), true)
        .field("Status", report.status.to_string(), true)
        .field(
            "Session",
            if report.session_active { "live" } else { "none" },
            true,
        )
        .field("Last seen", last_seen, true)
        .color(EMBED_COLOR)
}

/// Show the stored token hash, optionally checking a token against it
#[command(
    slash_command,
    required_permissions = "ADMINISTRATOR",
    guild_only,
    ephemeral
)]
pub async fn debug_hash(
    ctx: Context<'_>,
    #[description = "Token to compare (never shown)"] token: Option<String>,
    #[description = "Linked channel (defaults to this one)"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let channel_id = target_channel(&ctx, channel);

    let text = match ctx
        .data()
        .state
        .admin
        .debug_hash(channel_id, token.as_deref())
        .await
    {
        Ok(report) => {
            let mut text = format!("Stored hash for <#{}>:\n`{}`", channel_id, report.token_hash);
            match report.matches {
                Some(true) => text.push_str("\n✅ The supplied token matches."),
                Some(false) => text.push_str("\n❌ The supplied token does not match."),
                None => {}
            }
            text
        }
        Err(e) => describe(e),
    };
    reply(&ctx, text).await
}

/// List every linked channel in this server
#[command(
    slash_command,
    required_permissions = "ADMINISTRATOR",
    guild_only,
    ephemeral
)]
pub async fn debug_links(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = guild_id(&ctx)?;

    let links = match ctx.data().state.admin.debug_links(guild_id).await {
        Ok(links) => links,
        Err(e) => return reply(&ctx, describe(e)).await,
    };

    let embed = CreateEmbed::default()
        .title("Linked Minecraft Servers")
        .color(EMBED_COLOR)
        .footer(CreateEmbedFooter::new("Hashes are truncated; raw tokens are never stored"));
    let embed = if links.is_empty() {
        embed.description("No channels linked yet.")
    } else {
        let list: String = links
            .iter()
            .map(|l| {
                format!(
                    "- <#{}> `{}` {} ({})",
                    l.channel_id,
                    short_hash(&l.token_hash),
                    l.server_name.as_deref().unwrap_or("Minecraft"),
                    l.status
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        embed.description(list)
    };
    ctx.send(CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

/// Post a test message through the bridge's webhook
#[command(
    slash_command,
    required_permissions = "ADMINISTRATOR",
    guild_only,
    ephemeral
)]
pub async fn test_send(
    ctx: Context<'_>,
    #[description = "Linked channel (defaults to this one)"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let channel_id = target_channel(&ctx, channel);
    ctx.defer_ephemeral().await?;

    let text = match ctx.data().state.admin.test_send(channel_id).await {
        Ok(()) => format!("✅ Delivered a test message to <#{channel_id}>."),
        Err(e) => describe(e),
    };
    reply(&ctx, text).await
}

fn guild_id(ctx: &Context<'_>) -> Result<u64, Error> {
    Ok(ctx
        .guild_id()
        .ok_or("This command can only be used in a server")?
        .get())
}

fn target_channel(ctx: &Context<'_>, channel: Option<serenity::GuildChannel>) -> u64 {
    channel.map(|c| c.id).unwrap_or_else(|| ctx.channel_id()).get()
}

/// User-facing text for an administrative failure.
fn describe(err: AdminError) -> String {
    match err {
        AdminError::Store(e) => {
            tracing::error!(error = %e, "link store error during command");
            "❌ Something went wrong on our side. Please try again later.".to_string()
        }
        other => format!("❌ {other}"),
    }
}

async fn reply(ctx: &Context<'_>, text: String) -> Result<(), Error> {
    ctx.send(CreateReply::default().content(text).ephemeral(true))
        .await?;
    Ok(())
}
