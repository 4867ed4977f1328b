use std::time::Duration;

use serenity::{builder::CreateEmbed, utils::Color};

use crate::{
    database::activity::TableCounts,
    models::{ActorStats, Leaderboard, LeaderboardKind},
    service::MetricsSnapshot,
};

const EMBED_COLOR: (u8, u8, u8) = (0x57, 0x11, 0x73);
const EMPTY_BOARD: &str = "No activity data available yet";

pub fn format_voice_time(time: Duration) -> String {
    let secs = time.as_secs();
    format!("{}h {}m", secs / 3600, secs % 3600 / 60)
}

pub fn format_metric(kind: LeaderboardKind, value: u64) -> String {
    match kind {
        LeaderboardKind::Messages => format!("{} messages", value),
        LeaderboardKind::Voice => format_voice_time(Duration::from_secs(value)),
    }
}

pub fn title(kind: LeaderboardKind) -> &'static str {
    match kind {
        LeaderboardKind::Messages => "Message Leaderboard",
        LeaderboardKind::Voice => "Voice Activity Leaderboard",
    }
}

pub fn leaderboard_lines(board: &Leaderboard) -> String {
    if board.entries.is_empty() {
        return EMPTY_BOARD.to_string();
    }
    board
        .entries
        .iter()
        .map(|entry| {
            format!(
                "{}. <@{}> — **{}**",
                entry.rank,
                entry.actor_id,
                format_metric(board.kind, entry.metric_value)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn footer(board: &Leaderboard) -> String {
    let updated = chrono::Utc::now().format("%H:%M UTC");
    if board.stale {
        format!("Last updated {} (stale)", updated)
    } else {
        format!("Last updated {}", updated)
    }
}

pub fn leaderboard_embed<'a>(e: &'a mut CreateEmbed, board: &Leaderboard) -> &'a mut CreateEmbed {
    let (r, g, b) = EMBED_COLOR;
    e.title(title(board.kind))
        .description(leaderboard_lines(board))
        .color(Color::from_rgb(r, g, b))
        .footer(|f| f.text(footer(board)))
}

fn rank_text(rank: Option<usize>) -> String {
    rank.map(|r| format!("#{}", r))
        .unwrap_or_else(|| "unranked".to_string())
}

pub fn stats_fields(stats: &ActorStats) -> Vec<(String, String)> {
    let mut fields = vec![
        (
            "Messages".to_string(),
            format!("{} ({})", stats.messages, rank_text(stats.message_rank)),
        ),
        (
            "Voice time".to_string(),
            format!(
                "{} ({})",
                format_voice_time(stats.voice_time),
                rank_text(stats.voice_rank)
            ),
        ),
    ];
    if let Some(session) = stats.current_session {
        fields.push(("In voice for".to_string(), format_voice_time(session)));
    }
    fields
}

pub fn stats_embed<'a>(
    e: &'a mut CreateEmbed,
    name: &str,
    stats: &ActorStats,
) -> &'a mut CreateEmbed {
    let (r, g, b) = EMBED_COLOR;
    e.title(format!("Activity of {}", name))
        .color(Color::from_rgb(r, g, b));
    for (field, value) in stats_fields(stats) {
        e.field(field, value, true);
    }
    e
}

pub fn health_fields(metrics: &MetricsSnapshot, tables: &TableCounts) -> Vec<(String, String)> {
    let cache = &metrics.cache;
    let store = &metrics.store;
    vec![
        (
            "Events".to_string(),
            format!(
                "{} messages, {} voice updates\n{} throttled, {} invalid",
                metrics.messages_tracked,
                metrics.voice_updates,
                metrics.throttled,
                metrics.invalid_events
            ),
        ),
        (
            "Reads".to_string(),
            format!(
                "{} leaderboard reads, {} stale",
                metrics.leaderboard_reads, metrics.stale_reads
            ),
        ),
        (
            "Cache".to_string(),
            format!(
                "{}/{} entries, {:.0}% hits\n{} evicted, {} expired",
                cache.size,
                cache.capacity,
                cache.hit_rate * 100.0,
                cache.evictions,
                cache.expired_cleanups
            ),
        ),
        (
            "Write queue".to_string(),
            format!(
                "{} pending, {} batches flushed, {} dropped\n{} rows written, {} retries",
                store.pending_ops,
                store.flushed_batches,
                store.dropped_batches,
                store.rows_written,
                store.flush_retries
            ),
        ),
        (
            "Tables".to_string(),
            format!(
                "{} message rows, {} voice rows, {} settings",
                tables.messages, tables.voice, tables.settings
            ),
        ),
        (
            "Live".to_string(),
            format!(
                "{} in voice, {} rate limited actors, {} resets",
                metrics.active_voice_sessions, metrics.rate_limited_actors, metrics.resets
            ),
        ),
    ]
}

pub fn health_embed<'a>(
    e: &'a mut CreateEmbed,
    metrics: &MetricsSnapshot,
    tables: &TableCounts,
) -> &'a mut CreateEmbed {
    let (r, g, b) = EMBED_COLOR;
    e.title("Leaderboard health").color(Color::from_rgb(r, g, b));
    for (field, value) in health_fields(metrics, tables) {
        e.field(field, value, false);
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::CacheStats, database::StoreStats, models::LeaderboardEntry};

    #[test]
    fn voice_time_in_hours_and_minutes() {
        assert_eq!(format_voice_time(Duration::from_secs(0)), "0h 0m");
        assert_eq!(format_voice_time(Duration::from_secs(120)), "0h 2m");
        assert_eq!(
            format_voice_time(Duration::from_secs(3 * 3600 + 25 * 60 + 59)),
            "3h 25m"
        );
    }

    #[test]
    fn renders_rank_lines() {
        let board = Leaderboard {
            kind: LeaderboardKind::Voice,
            entries: vec![
                LeaderboardEntry {
                    rank: 1,
                    actor_id: 42,
                    metric_value: 7200,
                },
                LeaderboardEntry {
                    rank: 2,
                    actor_id: 7,
                    metric_value: 120,
                },
            ],
            stale: true,
        };
        assert_eq!(
            leaderboard_lines(&board),
            "1. <@42> — **2h 0m**\n2. <@7> — **0h 2m**"
        );
        assert!(footer(&board).ends_with("(stale)"));
    }

    #[test]
    fn empty_board_has_placeholder() {
        let board = Leaderboard::empty(LeaderboardKind::Messages);
        assert_eq!(leaderboard_lines(&board), EMPTY_BOARD);
        assert!(!footer(&board).contains("stale"));
    }

    #[test]
    fn stats_show_open_session() {
        let stats = ActorStats {
            actor_id: 1,
            messages: 3,
            voice_time: Duration::from_secs(120),
            current_session: Some(Duration::from_secs(3600)),
            message_rank: Some(2),
            voice_rank: None,
        };
        let fields = stats_fields(&stats);
        assert_eq!(fields[0].1, "3 (#2)");
        assert_eq!(fields[1].1, "0h 2m (unranked)");
        assert_eq!(fields[2], ("In voice for".to_string(), "1h 0m".to_string()));
    }

    #[test]
    fn health_lists_counters_and_tables() {
        let metrics = MetricsSnapshot {
            messages_tracked: 12,
            voice_updates: 4,
            throttled: 3,
            invalid_events: 1,
            leaderboard_reads: 9,
            stale_reads: 2,
            resets: 1,
            active_voice_sessions: 5,
            rate_limited_actors: 6,
            cache: CacheStats {
                size: 3,
                capacity: 100,
                hits: 3,
                misses: 1,
                evictions: 0,
                expired_cleanups: 2,
                hit_rate: 0.75,
            },
            store: StoreStats {
                pending_ops: 7,
                flushed_batches: 2,
                dropped_batches: 0,
                rows_written: 11,
                flush_retries: 1,
            },
        };
        let tables = TableCounts {
            messages: 8,
            voice: 3,
            settings: 2,
        };
        let fields = health_fields(&metrics, &tables);
        let names: Vec<&str> = fields.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Events", "Reads", "Cache", "Write queue", "Tables", "Live"]
        );
        assert_eq!(fields[0].1, "12 messages, 4 voice updates\n3 throttled, 1 invalid");
        assert_eq!(fields[2].1, "3/100 entries, 75% hits\n0 evicted, 2 expired");
        assert_eq!(fields[4].1, "8 message rows, 3 voice rows, 2 settings");
        assert_eq!(fields[5].1, "5 in voice, 6 rate limited actors, 1 resets");
    }
}
