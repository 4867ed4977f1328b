use diesel::prelude::*;

use super::Database;
use crate::{error::StoreError, models::Setting, schema::settings};

impl Database {
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.run(move |conn| {
            settings::table
                .find(key)
                .select(settings::value)
                .first::<String>(conn)
                .optional()
        })
        .await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let setting = Setting {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.run(move |conn| {
            diesel::replace_into(settings::table)
                .values(&setting)
                .execute(conn)
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::database::test_support::temp_database;

    #[tokio::test]
    async fn settings_round_trip_and_overwrite() {
        let (_dir, db) = temp_database();
        assert_eq!(db.get_setting("voice_leaderboard_message").await.unwrap(), None);

        db.set_setting("voice_leaderboard_message", "123").await.unwrap();
        db.set_setting("voice_leaderboard_message", "456").await.unwrap();
        assert_eq!(
            db.get_setting("voice_leaderboard_message").await.unwrap(),
            Some("456".to_string())
        );
        assert_eq!(db.table_counts().await.unwrap().settings, 1);
    }
}
