use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serenity::model::id::{ChannelId, GuildId, RoleId, UserId};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// 無視チャンネルでどこまで処理を飛ばすか
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoredChannelMode {
    /// ワードフィルターだけ飛ばす
    FilterOnly,
    /// ワードフィルターもロール付与も飛ばす
    All,
}

impl Default for IgnoredChannelMode {
    fn default() -> Self {
        IgnoredChannelMode::FilterOnly
    }
}

/// 特定チャンネルで合言葉を書いた人にロールを付与するルール
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RoleGrantRule {
    /// 監視するチャンネル
    pub channel: ChannelId,
    /// メッセージの先頭にマッチさせる正規表現
    pub regex: String,
    /// 大文字小文字を区別しない
    #[serde(default)]
    pub ignore_case: bool,
    /// 付与するロール
    pub role: RoleId,
    /// 付与時に返すメッセージ
    pub response: String,
}

/// 統計
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Stats {
    /// 実行されたコマンドの数
    pub command_count: u64,
}

/// 管理コマンドで書き換えられる運用ポリシー
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub prefix: String,
    pub word_filter: BTreeSet<String>,
    pub ignored_channels: BTreeSet<ChannelId>,
    pub ignored_servers: BTreeSet<GuildId>,
    pub ignored_channel_mode: IgnoredChannelMode,
    pub role_grant: Option<RoleGrantRule>,
    /// 別名 → 本来のコマンド名
    pub aliases: BTreeMap<String, String>,
    /// カスタムコマンド名 → 応答テンプレート
    pub custom_commands: BTreeMap<String, String>,
    pub blacklist: BTreeSet<UserId>,
    /// 参加時にDMで送る文 (空なら送らない)
    pub welcome_message: Option<String>,
    pub allow_direct_messages: bool,
    pub moderator_roles: BTreeSet<RoleId>,
    pub admins: BTreeSet<UserId>,
    /// `ac` フラグを立てたユーザーの応答に付け足す文
    pub auto_content_suffix: String,
    pub autosave_interval_secs: u64,
    pub unban_interval_secs: u64,
    pub stats: Stats,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            prefix: "!".to_string(),
            word_filter: BTreeSet::new(),
            ignored_channels: BTreeSet::new(),
            ignored_servers: BTreeSet::new(),
            ignored_channel_mode: IgnoredChannelMode::default(),
            role_grant: None,
            aliases: BTreeMap::new(),
            custom_commands: BTreeMap::new(),
            blacklist: BTreeSet::new(),
            welcome_message: None,
            allow_direct_messages: true,
            moderator_roles: BTreeSet::new(),
            admins: BTreeSet::new(),
            auto_content_suffix: String::new(),
            autosave_interval_secs: 300,
            unban_interval_secs: 60,
            stats: Stats::default(),
        }
    }
}

impl PolicyConfig {
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs.max(1))
    }

    pub fn unban_interval(&self) -> Duration {
        Duration::from_secs(self.unban_interval_secs.max(1))
    }
}

/// ポリシーの保持と永続化
pub struct PolicyStore {
    /// 保存先のJSONファイル
    path: PathBuf,
    /// 現在のポリシー
    inner: RwLock<PolicyConfig>,
}

impl PolicyStore {
    /// ファイルから読み込む。無ければ既定値で作る
    pub fn open(path: impl AsRef<Path>) -> Result<PolicyStore> {
        let path = path.as_ref().to_path_buf();
        let policy = if path.exists() {
            Self::read_file(&path)?
        } else {
            log::warn!(
                "ポリシーファイル {} が無いので既定値で起動します",
                path.display()
            );
            PolicyConfig::default()
        };
        Ok(Self::with_policy(path, policy))
    }

    /// 任意のポリシーで初期化する
    pub fn with_policy(path: impl AsRef<Path>, policy: PolicyConfig) -> PolicyStore {
        PolicyStore {
            path: path.as_ref().to_path_buf(),
            inner: RwLock::new(policy),
        }
    }

    fn read_file(path: &Path) -> Result<PolicyConfig> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("ポリシーファイルの読み込みに失敗: {}", path.display()))?;
        let policy = serde_json::from_str::<PolicyConfig>(&text)
            .with_context(|| format!("ポリシーファイルのパースに失敗: {}", path.display()))?;
        Ok(policy)
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, PolicyConfig> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, PolicyConfig> {
        self.inner.write().await
    }

    /// 現在のポリシーの複製
    #[cfg(test)]
    pub async fn snapshot(&self) -> PolicyConfig {
        self.inner.read().await.clone()
    }

    /// ファイルへ書き出す
    pub async fn save(&self) -> Result<()> {
        let text = {
            let policy = self.inner.read().await;
            serde_json::to_string_pretty(&*policy).context("ポリシーのシリアライズに失敗")?
        };
        tokio::fs::write(&self.path, text)
            .await
            .with_context(|| format!("ポリシーファイルの書き込みに失敗: {}", self.path.display()))?;
        Ok(())
    }

    /// ファイルから読み直す。失敗したときは今のポリシーを保つ
    pub async fn reload(&self) -> Result<()> {
        let policy = Self::read_file(&self.path)?;
        *self.inner.write().await = policy;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_policy() -> PolicyConfig {
        let mut policy = PolicyConfig::default();
        policy.prefix = "?".to_string();
        policy.word_filter.insert("badword".to_string());
        policy.word_filter.insert("worse".to_string());
        policy.ignored_channels.insert(ChannelId(5));
        policy.aliases.insert("p".to_string(), "ping".to_string());
        policy
            .custom_commands
            .insert("rules".to_string(), "read the rules, {user}".to_string());
        policy.blacklist.insert(UserId(99));
        policy.role_grant = Some(RoleGrantRule {
            channel: ChannelId(7),
            regex: "^agree$".to_string(),
            ignore_case: true,
            role: RoleId(8),
            response: "welcome".to_string(),
        });
        policy
    }

    #[tokio::test]
    async fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");

        let store = PolicyStore::with_policy(&path, sample_policy());
        store.save().await.unwrap();

        let reopened = PolicyStore::open(&path).unwrap();
        let policy = reopened.snapshot().await;
        assert_eq!(policy.aliases, sample_policy().aliases);
        assert_eq!(policy.custom_commands, sample_policy().custom_commands);
        assert_eq!(policy.word_filter, sample_policy().word_filter);
        assert_eq!(policy, sample_policy());
    }

    #[tokio::test]
    async fn reload_picks_up_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let store = PolicyStore::with_policy(&path, PolicyConfig::default());
        store.save().await.unwrap();

        std::fs::write(&path, r#"{"prefix": "$", "word_filter": ["nope"]}"#).unwrap();
        store.reload().await.unwrap();

        let policy = store.read().await;
        assert_eq!(policy.prefix, "$");
        assert!(policy.word_filter.contains("nope"));
        assert!(policy.allow_direct_messages);
    }

    #[tokio::test]
    async fn broken_file_keeps_current_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let store = PolicyStore::with_policy(&path, sample_policy());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(store.reload().await.is_err());
        assert_eq!(store.read().await.prefix, "?");
    }

    #[test]
    fn broken_file_fails_to_open_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, "{ not json").unwrap();

        let why = format!("{:#}", PolicyStore::open(&path).err().unwrap());
        assert!(why.contains("ポリシーファイルのパースに失敗"));
        assert!(why.contains("policy.json"));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::open(dir.path().join("absent.json")).unwrap();
        let policy = store.inner.try_read().unwrap();
        assert_eq!(policy.prefix, "!");
    }
}
