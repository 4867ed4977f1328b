pub mod leaderboard_poster;

use std::sync::Arc;

use chrono::Utc;
use clokwerk::{AsyncScheduler, TimeUnits};
use serenity::{
    async_trait,
    http::Http,
    model::{
        channel::Message,
        gateway::Ready,
        guild::Guild,
        id::GuildId,
        voice::VoiceState,
    },
    prelude::*,
};

use crate::{
    config::Config,
    events::leaderboard_poster::{leaderboard_channels, post_leaderboard},
    extensions::ClientContextExt,
    models::{ActivityEvent, VoiceEventKind},
    service::{ActivityService, RecordOutcome},
};

pub struct Handler {
    guild_id: Option<GuildId>,
}

impl Handler {
    pub fn new(guild_id: Option<u64>) -> Self {
        Handler {
            guild_id: guild_id.map(GuildId),
        }
    }

    fn accepts(&self, guild_id: Option<GuildId>) -> bool {
        match self.guild_id {
            Some(target) => guild_id == Some(target),
            None => guild_id.is_some(),
        }
    }
}

/// Join/leave transitions for a change of voice channel. Moving between two
/// channels ends one session and starts another.
pub fn voice_transitions<T: PartialEq>(
    before: Option<T>,
    after: Option<T>,
) -> Vec<VoiceEventKind> {
    match (before, after) {
        (None, Some(_)) => vec![VoiceEventKind::Join],
        (Some(_), None) => vec![VoiceEventKind::Leave],
        (Some(a), Some(b)) if a != b => vec![VoiceEventKind::Leave, VoiceEventKind::Join],
        _ => Vec::new(),
    }
}

fn is_bot(state: &VoiceState) -> bool {
    state.member.as_ref().map_or(false, |m| m.user.bot)
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("Connected as {}", ready.user.name);
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot || !self.accepts(msg.guild_id) {
            return;
        }
        let service = match ctx.get_service().await {
            Some(service) => service,
            None => return,
        };
        let _ = service
            .handle_event(ActivityEvent::message(msg.author.id.0, Utc::now()))
            .await;
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        if is_bot(&new) || !self.accepts(new.guild_id) {
            return;
        }
        let service = match ctx.get_service().await {
            Some(service) => service,
            None => return,
        };
        let now = Utc::now();
        let before = old.and_then(|state| state.channel_id);
        for kind in voice_transitions(before, new.channel_id) {
            let _ = service
                .handle_event(ActivityEvent::voice(new.user_id.0, kind, now))
                .await;
        }
    }

    /// Members already in voice when the bot connects get a session from now,
    /// since sessions from before a restart are forfeited.
    async fn guild_create(&self, ctx: Context, guild: Guild, _is_new: bool) {
        if !self.accepts(Some(guild.id)) {
            return;
        }
        let service = match ctx.get_service().await {
            Some(service) => service,
            None => return,
        };
        let now = Utc::now();
        let mut seeded = 0;
        for state in guild.voice_states.values() {
            if state.channel_id.is_none() || is_bot(state) {
                continue;
            }
            let event = ActivityEvent::voice(state.user_id.0, VoiceEventKind::Join, now);
            if let Ok(RecordOutcome::Recorded) = service.handle_event(event).await {
                seeded += 1;
            }
        }
        info!("Seeded {} voice sessions in {}", seeded, guild.name);
    }
}

pub fn setup_schedulers(
    scheduler: &mut AsyncScheduler,
    http: Arc<Http>,
    service: Arc<ActivityService>,
    config: &Config,
) {
    let every = (config.update_interval.as_secs() as u32).seconds();
    let channels = leaderboard_channels(config);
    if channels.is_empty() {
        info!("No leaderboard channels configured, nothing will be posted");
    }
    for (kind, channel) in channels {
        let http_clone = http.clone();
        let service_clone = service.clone();
        scheduler.every(every).run(move || {
            let inner_http_clone = http_clone.clone();
            let inner_service_clone = service_clone.clone();
            async move {
                post_leaderboard(inner_http_clone, inner_service_clone, kind, channel).await;
            }
        });
    }
}
