pub mod cache;
pub mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod extensions;
pub mod models;
pub mod rate_limiter;
pub mod schema;
pub mod service;
pub mod tasks;
pub mod utils;
pub mod voice;

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate diesel;

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use clokwerk::AsyncScheduler;
use serenity::{framework::standard::StandardFramework, http::Http, model::id::UserId, prelude::*};
use tracing_subscriber::EnvFilter;

use crate::{
    commands::GENERAL_GROUP,
    config::Config,
    database::Database,
    events::{setup_schedulers, Handler},
    service::ActivityService,
    tasks::BackgroundTasks,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    debug!("Loaded {:?}", config);

    let db = Database::new(&config.store)?;
    let service = Arc::new(ActivityService::new(db, &config));
    service.recover().await?;
    if let Err(e) = service.run_reset_cycle(Utc::now()).await {
        warn!("Startup reset check failed: {}", e);
    }

    let tasks = BackgroundTasks::spawn(service.clone(), &config.tasks);
    info!("Background tasks running: {}", tasks.running().join(", "));

    let owners = fetch_owners(&Http::new(&config.discord_token)).await;
    let framework = StandardFramework::new()
        .configure(|c| c.owners(owners).prefix("!"))
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(Handler::new(config.guild_id))
        .framework(framework)
        .await?;

    {
        let mut data = client.data.write().await;
        data.insert::<ActivityService>(service.clone());
        data.insert::<Config>(Arc::new(config.clone()));
    }

    let mut scheduler = AsyncScheduler::new();
    setup_schedulers(
        &mut scheduler,
        client.cache_and_http.http.clone(),
        service.clone(),
        &config,
    );
    let scheduler_handle = tokio::spawn(async move {
        loop {
            scheduler.run_pending().await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    });

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not register ctrl+c handler: {}", e);
            return;
        }
        info!("Shutting down");
        shard_manager.lock().await.shutdown_all().await;
    });

    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    scheduler_handle.abort();
    tasks
        .shutdown(&service, config.tasks.drain_timeout)
        .await;
    Ok(())
}

/// The application owner, or the team owner for team-owned applications.
/// Without it the owner-only commands stay locked.
async fn fetch_owners(http: &Http) -> HashSet<UserId> {
    let mut owners = HashSet::new();
    match http.get_current_application_info().await {
        Ok(info) => {
            match info.team {
                Some(team) => owners.insert(team.owner_user_id),
                None => owners.insert(info.owner.id),
            };
        }
        Err(e) => warn!("Could not fetch application owners: {}", e),
    }
    owners
}
