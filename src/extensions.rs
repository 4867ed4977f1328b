use std::sync::Arc;

use serenity::{async_trait, client, prelude::TypeMapKey};

use crate::{config::Config, service::ActivityService};

impl TypeMapKey for ActivityService {
    type Value = Arc<ActivityService>;
}

impl TypeMapKey for Config {
    type Value = Arc<Config>;
}

#[async_trait]
pub trait ClientContextExt {
    async fn get_service(&self) -> Option<Arc<ActivityService>>;
    async fn get_config(&self) -> Option<Arc<Config>>;
}

#[async_trait]
impl ClientContextExt for client::Context {
    async fn get_service(&self) -> Option<Arc<ActivityService>> {
        self.data.read().await.get::<ActivityService>().cloned()
    }

    async fn get_config(&self) -> Option<Arc<Config>> {
        self.data.read().await.get::<Config>().cloned()
    }
}

#[async_trait]
impl ClientContextExt for client::Client {
    async fn get_service(&self) -> Option<Arc<ActivityService>> {
        self.data.read().await.get::<ActivityService>().cloned()
    }

    async fn get_config(&self) -> Option<Arc<Config>> {
        self.data.read().await.get::<Config>().cloned()
    }
}
