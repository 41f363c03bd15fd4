use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono_tz::Tz;
use config::Config;
use serenity::model::id::{ChannelId, GuildId};

/// Discordの設定
#[derive(Debug, Default, serde::Deserialize, PartialEq, Clone)]
pub struct DiscordConfig {
    /// 参加/退出ログを流すチャンネルID
    pub log_channel: ChannelId,
    /// 編集/削除/フィルターのログを流すチャンネルID
    pub mod_channel: ChannelId,
    /// 一時BANの解除を監視するギルドID
    #[serde(default)]
    pub guilds: Vec<GuildId>,
}

/// 保存先の設定
#[derive(Debug, serde::Deserialize, PartialEq, Clone)]
pub struct StorageConfig {
    /// データベースとポリシーファイルを置くディレクトリ
    pub basedir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            basedir: "bot".to_string(),
        }
    }
}

/// アプリケーションの設定
#[derive(Debug, serde::Deserialize, PartialEq, Clone)]
pub struct AppConfig {
    /// Discordの設定
    pub discord: DiscordConfig,
    /// 保存先の設定
    #[serde(default)]
    pub storage: StorageConfig,
    /// 開発モード (自動保存しない、送信内容に印を付ける)
    #[serde(default)]
    pub dev_mode: bool,
    /// ログレベル
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Discord APIを呼ぶときのタイムアウト秒数
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// BAN解除の合間に待つミリ秒数
    #[serde(default = "default_unban_call_delay_ms")]
    pub unban_call_delay_ms: u64,
    /// ログに出す時刻のタイムゾーン
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_unban_call_delay_ms() -> u64 {
    500
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            discord: DiscordConfig::default(),
            storage: StorageConfig::default(),
            dev_mode: false,
            log_level: default_log_level(),
            request_timeout_secs: default_request_timeout_secs(),
            unban_call_delay_ms: default_unban_call_delay_ms(),
            timezone: default_timezone(),
        }
    }
}

impl AppConfig {
    /// 設定を読み込む
    pub fn load_config() -> Result<AppConfig> {
        Self::load_config_from("bot/config.toml")
    }

    /// 指定されたファイルと環境変数から設定を読み込む
    pub fn load_config_from(path: &str) -> Result<AppConfig> {
        let config = Config::builder()
            .add_source(config::File::with_name(path))
            // Eg.. `APP_DEV_MODE=true ./target/app` would set the `dev_mode` key
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()
            .with_context(|| format!("設定ファイルの読み込みに失敗: {}", path))?;
        // 設定ファイルをパース
        let app_config = config
            .try_deserialize::<AppConfig>()
            .context("設定ファイルのパースに失敗")?;
        Ok(app_config)
    }

    /// 表示用のタイムゾーン (不正な名前はUTC扱い)
    pub fn tz(&self) -> Tz {
        self.timezone.parse::<Tz>().unwrap_or_else(|why| {
            log::warn!("タイムゾーン {} は無効なのでUTCを使います: {}", self.timezone, why);
            Tz::UTC
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn unban_call_delay(&self) -> Duration {
        Duration::from_millis(self.unban_call_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_toml_and_fills_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[discord]\nlog_channel = 10\nmod_channel = 11\nguilds = [20]\n\n[storage]\nbasedir = \"/tmp/petal\""
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load_config_from(&path).unwrap();

        assert_eq!(config.discord.log_channel, ChannelId(10));
        assert_eq!(config.discord.mod_channel, ChannelId(11));
        assert_eq!(config.discord.guilds, vec![GuildId(20)]);
        assert_eq!(config.storage.basedir, "/tmp/petal");
        assert!(!config.dev_mode);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.unban_call_delay(), Duration::from_millis(500));
    }

    #[test]
    fn invalid_timezone_falls_back_to_utc() {
        let config = AppConfig {
            timezone: "Not/AZone".to_string(),
            ..Default::default()
        };
        assert_eq!(config.tz(), Tz::UTC);

        let config = AppConfig {
            timezone: "Asia/Tokyo".to_string(),
            ..Default::default()
        };
        assert_eq!(config.tz(), Tz::Asia__Tokyo);
    }
}
