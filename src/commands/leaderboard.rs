use serenity::{
    framework::standard::{macros::command, Args, CommandResult},
    model::prelude::*,
    prelude::*,
};

use super::owner::*;
use crate::{extensions::*, models::LeaderboardKind, utils::render};

const UNAVAILABLE: &str = "Activity data is unavailable right now, try again later.";

#[command]
#[aliases("lb")]
#[sub_commands(health, refresh)]
#[description = "Shows the message or voice leaderboard"]
#[usage = "[messages|voice] [size]"]
async fn leaderboard(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let service = match ctx.get_service().await {
        Some(service) => service,
        None => {
            msg.reply(ctx, UNAVAILABLE).await?;
            return Ok(());
        }
    };
    let kind = args
        .single::<LeaderboardKind>()
        .unwrap_or(LeaderboardKind::Messages);
    let size = args
        .single::<usize>()
        .unwrap_or_else(|_| service.default_leaderboard_size());

    match service.get_leaderboard(kind, size).await {
        Ok(board) => {
            msg.channel_id
                .send_message(&ctx.http, |m| {
                    m.embed(|e| render::leaderboard_embed(e, &board))
                })
                .await?;
        }
        Err(e) => {
            error!("Leaderboard command failed: {}", e);
            msg.reply(ctx, UNAVAILABLE).await?;
        }
    }
    Ok(())
}

#[command]
#[description = "Shows your activity, or that of the mentioned member"]
#[usage = "[@member]"]
async fn stats(ctx: &Context, msg: &Message) -> CommandResult {
    let service = match ctx.get_service().await {
        Some(service) => service,
        None => {
            msg.reply(ctx, UNAVAILABLE).await?;
            return Ok(());
        }
    };
    let user = msg.mentions.first().unwrap_or(&msg.author);

    match service.actor_stats(user.id.0).await {
        Ok(stats) => {
            msg.channel_id
                .send_message(&ctx.http, |m| {
                    m.embed(|e| render::stats_embed(e, &user.name, &stats))
                })
                .await?;
        }
        Err(e) => {
            error!("Stats command failed for {}: {}", user.id, e);
            msg.reply(ctx, UNAVAILABLE).await?;
        }
    }
    Ok(())
}
