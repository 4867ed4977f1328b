table! {
    messages (actor_id) {
        actor_id -> BigInt,
        count -> BigInt,
    }
}

table! {
    voice (actor_id) {
        actor_id -> BigInt,
        total_time -> BigInt,
        session_start -> Nullable<Timestamp>,
    }
}

table! {
    settings (key) {
        key -> Text,
        value -> Text,
    }
}

allow_tables_to_appear_in_same_query!(messages, voice, settings,);

/// Applied on every startup.
pub const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS messages (
    actor_id BIGINT PRIMARY KEY NOT NULL,
    count BIGINT NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS voice (
    actor_id BIGINT PRIMARY KEY NOT NULL,
    total_time BIGINT NOT NULL DEFAULT 0,
    session_start TIMESTAMP
);
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_count ON messages(count DESC);
CREATE INDEX IF NOT EXISTS idx_voice_time ON voice(total_time DESC);
CREATE INDEX IF NOT EXISTS idx_voice_session ON voice(session_start);
";
