mod app_config;
mod builtin_commands;
mod command_resolver;
mod error;
mod event;
mod event_handler;
mod member_store;
mod moderation;
mod platform;
mod policy;
mod runtime_state;
mod scheduler;

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context as _;
use log::LevelFilter;
use serenity::gateway::GatewayError;
use serenity::http::Http;
use serenity::prelude::*;
use tokio::sync::watch;

use app_config::AppConfig;
use command_resolver::CommandRegistry;
use error::BotError;
use event_handler::Handler;
use member_store::MemberStore;
use platform::SerenityPlatform;
use policy::PolicyStore;
use runtime_state::{RuntimeState, Services};
use scheduler::{spawn_periodic, TemporalModeration};

/// ログ設定ファイル
const LOG_CONFIG_PATH: &str = "bot/log4rs.yml";

#[tokio::main]
async fn main() {
    if let Err(why) = run().await {
        log::error!("Botを終了します: {}", why);
        eprintln!("Botを終了します: {:?}", why);
        std::process::exit(why.exit_code());
    }
}

/// ロガーを初期化する。設定ファイルが無ければコンソールに出す
fn init_logger(level: &str) -> anyhow::Result<()> {
    if Path::new(LOG_CONFIG_PATH).exists() {
        log4rs::init_file(LOG_CONFIG_PATH, Default::default())
            .context("ログ設定ファイルの読み込みに失敗")?;
        return Ok(());
    }

    use log4rs::append::console::ConsoleAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {t} - {m}{n}",
        )))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))
        .context("ログ設定の作成に失敗")?;
    log4rs::init_config(config).context("ロガーの初期化に失敗")?;
    Ok(())
}

async fn run() -> Result<(), BotError> {
    // 設定ファイルを読み込む
    let app_config =
        AppConfig::load_config().map_err(|why| BotError::Config(format!("{:?}", why)))?;
    init_logger(&app_config.log_level).map_err(|why| BotError::Config(format!("{:?}", why)))?;
    if app_config.dev_mode {
        log::warn!("開発モードで起動します (自動保存は無効)");
    }

    let basedir = Path::new(&app_config.storage.basedir);
    let policy = PolicyStore::open(basedir.join("policy.json"))
        .map_err(|why| BotError::Config(format!("{:#}", why)))?;
    let members = MemberStore::new(&app_config.storage.basedir)?;

    // Login with a bot token from the environment
    let token = env::var("DISCORD_TOKEN")
        .map_err(|_| BotError::Config("環境変数 DISCORD_TOKEN がありません".to_string()))?;

    let http = Arc::new(Http::new(&token));
    let platform = SerenityPlatform::new(http, app_config.request_timeout(), app_config.dev_mode);
    let services = Services {
        app_config: Arc::new(app_config),
        policy: Arc::new(policy),
        members: Arc::new(members),
        platform: Arc::new(platform),
        state: Arc::new(RuntimeState::new()),
    };
    let handler = Handler::new(services.clone(), CommandRegistry::with_builtins());

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_BANS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;
    let mut client = Client::builder(&token, intents)
        .event_handler(handler)
        // 削除ログで本文を出すためにメッセージをキャッシュする
        .cache_settings(|settings| settings.max_messages(500))
        .await
        .map_err(|why| BotError::Transport(format!("クライアントの作成に失敗: {:?}", why)))?;

    // 定期処理
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let unbanner = Arc::new(TemporalModeration::new(
        services.clone(),
        services.app_config.discord.guilds.clone(),
        services.app_config.unban_call_delay(),
    ));
    // 間隔は周回ごとにポリシーから読むので reload で変更できる
    let unban_policy = services.policy.clone();
    let unban_task = spawn_periodic(
        "一時BANの自動解除",
        move || {
            let policy = unban_policy.clone();
            async move {
                let interval = policy.read().await.unban_interval();
                interval
            }
        },
        shutdown_rx.clone(),
        move || {
            let unbanner = unbanner.clone();
            async move {
                unbanner.run_cycle().await;
            }
        },
    );
    let autosave_policy = services.policy.clone();
    let autosave_services = services.clone();
    let autosave_task = spawn_periodic(
        "自動保存",
        move || {
            let policy = autosave_policy.clone();
            async move {
                let interval = policy.read().await.autosave_interval();
                interval
            }
        },
        shutdown_rx,
        move || {
            let services = autosave_services.clone();
            async move {
                scheduler::autosave(&services).await;
            }
        },
    );

    // Ctrl+Cで全シャードを止める
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(why) = tokio::signal::ctrl_c().await {
            log::error!("Ctrl+Cの待機に失敗: {:?}", why);
            return;
        }
        log::info!("終了シグナルを受信");
        shard_manager.lock().await.shutdown_all().await;
    });

    let result = client.start().await;

    // 定期処理は実行中の周回が終わってから止まる
    let _ = shutdown_tx.send(true);
    for task in [unban_task, autosave_task] {
        if let Err(why) = task.await {
            log::error!("定期処理の終了に失敗: {:?}", why);
        }
    }
    if !services.app_config.dev_mode {
        if let Err(why) = services.policy.save().await {
            log::error!("終了時の保存に失敗: {:?}", why);
        }
    }

    match result {
        Ok(()) => {
            log::info!("Botを終了しました");
            Ok(())
        }
        Err(serenity::Error::Gateway(GatewayError::InvalidAuthentication)) => Err(BotError::Auth(
            "トークンが無効です".to_string(),
        )),
        Err(why) => Err(BotError::Transport(format!(
            "クライアントの実行中にエラー: {:?}",
            why
        ))),
    }
}
