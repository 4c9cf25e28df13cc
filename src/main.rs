use std::sync::Arc;

use dotenvy::dotenv;
use serenity::{
    async_trait,
    client::{Client, Context, EventHandler},
    framework::StandardFramework,
    model::gateway::Ready,
    model::prelude::VoiceState,
    prelude::GatewayIntents,
};
use songbird::{SerenityInit, Songbird};
use tracing::info;

use crate::backend::SongbirdBackend;
use crate::commands::GENERAL_GROUP;
use crate::config::Config;
use crate::engine::Player;
use crate::queue::QueueStore;
use crate::resolver::{ResolverGateway, YtDlpResolver};

mod backend;
mod commands;
mod config;
mod engine;
mod error;
mod queue;
mod resolver;
mod track;

pub struct PlayerKey;

impl serenity::prelude::TypeMapKey for PlayerKey {
    type Value = Arc<Player>;
}

pub struct ResolverKey;

impl serenity::prelude::TypeMapKey for ResolverKey {
    type Value = Arc<ResolverGateway>;
}

pub struct BotDataMap;

pub struct BotData {
    pub id: u64,
}

impl serenity::prelude::TypeMapKey for BotDataMap {
    type Value = BotData;
}

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        let bot_data = BotData { id: ready.user.id.0 };
        let data = &mut ctx.data.write().await;
        data.insert::<BotDataMap>(bot_data);
    }

    async fn voice_state_update(&self, ctx: Context, _: Option<VoiceState>, new: VoiceState) {
        // Only interested in the bot itself losing its voice connection
        // (kicked, channel deleted): that guild's pipeline gets reset.
        if new.channel_id.is_some() {
            return;
        }

        let bot_id: Option<u64>;

        {
            let data = ctx.data.read().await;
            bot_id = data.get::<BotDataMap>().map(|data| data.id);
        }

        if let (Some(bot_id), Some(guild_id)) = (bot_id, new.guild_id) {
            if bot_id == new.user_id.0 {
                info!("Bot was disconnected from voice in guild {}", guild_id.0);

                let player = {
                    let data = ctx.data.read().await;
                    data.get::<PlayerKey>().cloned()
                };

                if let Some(player) = player {
                    player.reset(guild_id.0);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv().expect(".env file not found");

    tracing_subscriber::fmt::init();

    let config = Config::from_env().expect("Expected a token in the environment");

    let framework = StandardFramework::new()
        .configure(|c| c.prefix(&config.prefix))
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let manager = Songbird::serenity();

    let mut client = Client::builder(&config.token, intents)
        .event_handler(Handler)
        .framework(framework)
        .register_songbird_with(manager.clone())
        .await
        .expect("Err creating client");

    let backend = Arc::new(SongbirdBackend::new(
        manager,
        client.cache_and_http.http.clone(),
    ));
    let player = Arc::new(Player::new(backend, Arc::new(QueueStore::new())));
    let resolver = Arc::new(ResolverGateway::new(
        Arc::new(YtDlpResolver),
        config.resolve_timeout,
    ));

    {
        let mut data = client.data.write().await;
        data.insert::<PlayerKey>(player);
        data.insert::<ResolverKey>(resolver);
    }

    tokio::spawn(async move {
        let _ = client
            .start()
            .await
            .map_err(|why| info!("Client ended: {why:?}"));
    });

    tokio::signal::ctrl_c().await.expect("Control-C interruption failed!");

    info!("Received Ctrl-C, shutting down.");
}
