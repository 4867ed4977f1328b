use serenity::{
    framework::standard::{macros::command, CommandResult},
    model::prelude::*,
    prelude::*,
};

use crate::{
    events::leaderboard_poster::{leaderboard_channels, post_leaderboard},
    extensions::*,
    utils::render,
};

#[command]
#[owners_only]
#[aliases("status")]
#[description = "Shows service counters and table sizes"]
async fn health(ctx: &Context, msg: &Message) -> CommandResult {
    let service = match ctx.get_service().await {
        Some(service) => service,
        None => {
            msg.reply(ctx, "The activity service is not running").await?;
            return Ok(());
        }
    };
    let metrics = service.metrics();
    match service.database().table_counts().await {
        Ok(tables) => {
            msg.channel_id
                .send_message(&ctx.http, |m| {
                    m.embed(|e| render::health_embed(e, &metrics, &tables))
                })
                .await?;
        }
        Err(e) => {
            error!("Could not count table rows: {}", e);
            msg.reply(ctx, format!("The store is unavailable: {}", e))
                .await?;
        }
    }
    Ok(())
}

#[command]
#[owners_only]
#[aliases("update")]
#[description = "Drops cached rankings and reposts the leaderboards"]
async fn refresh(ctx: &Context, msg: &Message) -> CommandResult {
    let (service, config) = match (ctx.get_service().await, ctx.get_config().await) {
        (Some(service), Some(config)) => (service, config),
        _ => {
            msg.reply(ctx, "The activity service is not running").await?;
            return Ok(());
        }
    };
    let dropped = service.refresh_rankings();
    let channels = leaderboard_channels(&config);
    for (kind, channel) in &channels {
        post_leaderboard(ctx.http.clone(), service.clone(), *kind, *channel).await;
    }
    info!(
        "{} refreshed the leaderboards ({} cached rankings dropped)",
        msg.author.name, dropped
    );
    msg.reply(ctx, format!("Reposted {} leaderboards", channels.len()))
        .await?;
    Ok(())
}
