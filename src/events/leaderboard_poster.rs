use std::sync::Arc;

use serenity::{http::Http, model::id::ChannelId};

use crate::{config::Config, models::LeaderboardKind, service::ActivityService, utils::render};

pub fn message_setting_key(kind: LeaderboardKind) -> String {
    format!("{}_leaderboard_message", kind)
}

/// Boards that have a channel to be posted in.
pub fn leaderboard_channels(config: &Config) -> Vec<(LeaderboardKind, ChannelId)> {
    LeaderboardKind::ALL
        .into_iter()
        .filter_map(|kind| {
            let channel = match kind {
                LeaderboardKind::Messages => config.message_channel_id,
                LeaderboardKind::Voice => config.voice_channel_id,
            };
            channel.map(|id| (kind, ChannelId(id)))
        })
        .collect()
}

/// Replaces the previously posted leaderboard in `channel` with a fresh one.
pub async fn post_leaderboard(
    http: Arc<Http>,
    service: Arc<ActivityService>,
    kind: LeaderboardKind,
    channel: ChannelId,
) {
    if let Err(e) = replace_leaderboard(&http, &service, kind, channel).await {
        error!("Could not post the {} leaderboard: {:#}", kind, e);
    }
}

async fn replace_leaderboard(
    http: &Arc<Http>,
    service: &ActivityService,
    kind: LeaderboardKind,
    channel: ChannelId,
) -> anyhow::Result<()> {
    let board = service
        .get_leaderboard(kind, service.default_leaderboard_size())
        .await?;
    let key = message_setting_key(kind);

    if let Some(previous) = service.database().get_setting(&key).await? {
        match previous.parse::<u64>() {
            Ok(id) => {
                if let Err(e) = channel.delete_message(http, id).await {
                    warn!("Could not delete old {} leaderboard {}: {}", kind, id, e);
                }
            }
            Err(_) => warn!("Ignoring malformed message id {:?} in {}", previous, key),
        }
    }

    let posted = channel
        .send_message(http, |m| m.embed(|e| render::leaderboard_embed(e, &board)))
        .await?;
    service
        .database()
        .set_setting(&key, &posted.id.0.to_string())
        .await?;
    info!("Posted {} leaderboard as message {}", kind, posted.id);
    Ok(())
}
