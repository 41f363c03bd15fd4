use anyhow::{Context as _, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::lock::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use serenity::model::id::{ChannelId, GuildId, UserId};

/// メンバーのレコード
#[derive(Debug, Default, serde::Serialize, serde::Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct MemberRecord {
    /// 過去の名前 (古い順)
    pub aliases: Vec<String>,
    /// 発言したことのあるギルド
    pub servers: BTreeSet<GuildId>,
    pub last_active: Option<DateTime<Utc>>,
    pub last_message: Option<DateTime<Utc>>,
    pub last_command: Option<DateTime<Utc>>,
    pub last_message_channel: Option<ChannelId>,
    pub message_count: u64,
    /// 一時BANの期限 (UNIX秒)
    pub ban_expires: Option<i64>,
    /// その他の属性 (`ac` など)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MemberRecord {
    /// 最新の名前
    pub fn current_alias(&self) -> Option<&str> {
        self.aliases.last().map(String::as_str)
    }
}

/// 更新の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// ギルドへの参加
    Join,
    /// 通常のメッセージ (発言数を数える)
    Message,
    /// コマンドの実行
    Command,
}

/// 部分的な更新内容
#[derive(Debug, Default, Clone)]
pub struct MemberUpdate {
    /// 現在の表示名
    pub name: Option<String>,
    pub guild: Option<GuildId>,
    pub channel: Option<ChannelId>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl MemberRecord {
    fn apply(&mut self, update: &MemberUpdate, kind: UpdateKind) {
        if let Some(name) = &update.name {
            if self.current_alias() != Some(name.as_str()) {
                self.aliases.push(name.clone());
            }
        }
        if let Some(guild) = update.guild {
            self.servers.insert(guild);
        }
        if let Some(channel) = update.channel {
            self.last_message_channel = Some(channel);
        }
        if let Some(timestamp) = update.timestamp {
            self.last_active = Some(timestamp);
            match kind {
                UpdateKind::Message => self.last_message = Some(timestamp),
                UpdateKind::Command => self.last_command = Some(timestamp),
                UpdateKind::Join => (),
            }
        }
        if kind == UpdateKind::Message {
            self.message_count += 1;
        }
    }
}

/// メンバー情報の管理クラス
pub struct MemberStore {
    /// sql接続情報
    conn: Arc<Mutex<Connection>>,
    /// メンバーごとの更新ロック (更新中のメンバーの分だけ持つ)
    locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl MemberStore {
    /// データベースを初期化する
    pub fn new(basedir: &str) -> Result<MemberStore> {
        let conn = Connection::open(format!("{}/members.db", basedir))
            .context("メンバーデータベースのオープンに失敗")?;
        Self::with_connection(conn)
    }

    /// メモリ上のデータベースで初期化する
    #[cfg(test)]
    pub fn in_memory() -> Result<MemberStore> {
        let conn = Connection::open_in_memory().context("メンバーデータベースのオープンに失敗")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<MemberStore> {
        // テーブルを作成
        conn.execute(
            "CREATE TABLE IF NOT EXISTS members (
                user_id     VARCHAR(20) PRIMARY KEY,
                record      TEXT        NOT NULL,
                updated_at  TIMESTAMP   NOT NULL
            )",
            params!(),
        )
        .context("メンバーデータベースの作成に失敗")?;

        Ok(MemberStore {
            conn: Arc::new(Mutex::new(conn)),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// メンバー単位のロックを取得する
    async fn member_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 他に待っている人がいなければロックを片付ける
    async fn release_member_lock(&self, user_id: UserId, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // マップと手元の2つだけなら誰も使っていない
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&user_id);
        }
    }

    async fn load(&self, user_id: UserId) -> Result<Option<MemberRecord>> {
        let record: Option<String> = self
            .conn
            .lock()
            .await
            .query_row(
                "SELECT record FROM members WHERE user_id = ?1",
                params!(user_id.to_string()),
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("メンバーデータベースの読み込みに失敗: {}", user_id))?;

        match record {
            Some(record) => {
                let record = serde_json::from_str::<MemberRecord>(&record)
                    .with_context(|| format!("メンバーレコードのパースに失敗: {}", user_id))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn store(&self, user_id: UserId, record: &MemberRecord) -> Result<()> {
        let text = serde_json::to_string(record)
            .with_context(|| format!("メンバーレコードのシリアライズに失敗: {}", user_id))?;
        self.conn
            .lock()
            .await
            .execute(
                "REPLACE INTO members (user_id, record, updated_at) VALUES (?1, ?2, ?3)",
                params!(user_id.to_string(), text, Utc::now().timestamp()),
            )
            .with_context(|| format!("メンバーデータベースへの書き込みに失敗: {}", user_id))?;
        Ok(())
    }

    /// メンバーのレコードを取得する
    pub async fn get_member(&self, user_id: UserId) -> Result<Option<MemberRecord>> {
        self.load(user_id).await
    }

    /// メンバーの属性を1つ取得する
    pub async fn get_attribute(&self, user_id: UserId, key: &str) -> Result<Option<Value>> {
        let record = match self.load(user_id).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let value = serde_json::to_value(record).context("メンバーレコードの変換に失敗")?;
        Ok(value.get(key).filter(|v| !v.is_null()).cloned())
    }

    /// メンバーを更新する。新しく作られたときは true を返す
    pub async fn update_member(
        &self,
        user_id: UserId,
        update: &MemberUpdate,
        kind: UpdateKind,
    ) -> Result<bool> {
        let lock = self.member_lock(user_id).await;
        let result = async {
            let _guard = lock.lock().await;
            let existing = self.load(user_id).await?;
            let created = existing.is_none();
            let mut record = existing.unwrap_or_default();
            record.apply(update, kind);
            self.store(user_id, &record).await?;
            Ok::<_, anyhow::Error>(created)
        }
        .await;
        self.release_member_lock(user_id, lock).await;

        let created = result?;
        log::debug!("メンバー {} を更新 ({:?})", user_id, kind);
        Ok(created)
    }

    /// 任意の属性を設定する
    pub async fn set_attribute(&self, user_id: UserId, key: &str, value: Value) -> Result<()> {
        let lock = self.member_lock(user_id).await;
        let result = async {
            let _guard = lock.lock().await;
            let record = self.load(user_id).await?.unwrap_or_default();
            let mut fields =
                match serde_json::to_value(record).context("メンバーレコードの変換に失敗")? {
                    Value::Object(fields) => fields,
                    _ => Map::new(),
                };
            fields.insert(key.to_string(), value);
            let record = serde_json::from_value::<MemberRecord>(Value::Object(fields))
                .with_context(|| format!("属性 {} の値が不正", key))?;
            self.store(user_id, &record).await
        }
        .await;
        self.release_member_lock(user_id, lock).await;
        result
    }

    /// 一時BANの期限を設定/解除する
    pub async fn set_ban_expiry(&self, user_id: UserId, expires: Option<i64>) -> Result<()> {
        let lock = self.member_lock(user_id).await;
        let result = async {
            let _guard = lock.lock().await;
            let mut record = self.load(user_id).await?.unwrap_or_default();
            record.ban_expires = expires;
            self.store(user_id, &record).await
        }
        .await;
        self.release_member_lock(user_id, lock).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message_update(name: &str, guild: u64, channel: u64) -> MemberUpdate {
        MemberUpdate {
            name: Some(name.to_string()),
            guild: Some(GuildId(guild)),
            channel: Some(ChannelId(channel)),
            timestamp: Utc.timestamp_opt(1_600_000_000, 0).single(),
        }
    }

    #[tokio::test]
    async fn first_update_creates_record() {
        let store = MemberStore::in_memory().unwrap();
        let user = UserId(1);

        assert!(store
            .update_member(user, &message_update("alice", 10, 20), UpdateKind::Message)
            .await
            .unwrap());
        assert!(!store
            .update_member(user, &message_update("alice", 10, 20), UpdateKind::Message)
            .await
            .unwrap());

        let record = store.get_member(user).await.unwrap().unwrap();
        assert_eq!(record.message_count, 2);
        assert_eq!(record.aliases, vec!["alice".to_string()]);
        assert_eq!(record.last_message_channel, Some(ChannelId(20)));
        assert!(record.servers.contains(&GuildId(10)));
    }

    #[tokio::test]
    async fn aliases_keep_history() {
        let store = MemberStore::in_memory().unwrap();
        let user = UserId(1);
        for name in ["alice", "bob", "bob", "alice"] {
            store
                .update_member(user, &message_update(name, 10, 20), UpdateKind::Message)
                .await
                .unwrap();
        }
        let record = store.get_member(user).await.unwrap().unwrap();
        assert_eq!(record.aliases, vec!["alice", "bob", "alice"]);
    }

    #[tokio::test]
    async fn command_update_does_not_count_messages() {
        let store = MemberStore::in_memory().unwrap();
        let user = UserId(1);
        store
            .update_member(user, &message_update("alice", 10, 20), UpdateKind::Message)
            .await
            .unwrap();
        store
            .update_member(user, &message_update("alice", 11, 21), UpdateKind::Command)
            .await
            .unwrap();

        let record = store.get_member(user).await.unwrap().unwrap();
        assert_eq!(record.message_count, 1);
        assert!(record.last_command.is_some());
        assert_eq!(record.last_message_channel, Some(ChannelId(21)));
        assert_eq!(record.servers.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_messages_are_all_counted() {
        let store = Arc::new(MemberStore::in_memory().unwrap());
        let mut tasks = Vec::new();
        for user in 1..=4u64 {
            for _ in 0..25 {
                let store = store.clone();
                tasks.push(tokio::spawn(async move {
                    store
                        .update_member(
                            UserId(user),
                            &message_update("someone", 10, 20),
                            UpdateKind::Message,
                        )
                        .await
                        .unwrap();
                }));
            }
        }
        for task in tasks {
            task.await.unwrap();
        }
        for user in 1..=4u64 {
            let record = store.get_member(UserId(user)).await.unwrap().unwrap();
            assert_eq!(record.message_count, 25);
        }
        assert!(store.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn member_locks_are_released() {
        let store = MemberStore::in_memory().unwrap();
        for user in 1..=50u64 {
            store
                .update_member(UserId(user), &message_update("someone", 10, 20), UpdateKind::Message)
                .await
                .unwrap();
        }
        store.set_attribute(UserId(1), "ac", Value::Bool(true)).await.unwrap();
        store.set_ban_expiry(UserId(2), Some(42)).await.unwrap();
        // 失敗した更新でも残らない
        assert!(store
            .set_attribute(UserId(3), "message_count", Value::from("many"))
            .await
            .is_err());
        assert!(store.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn attributes_round_trip() {
        let store = MemberStore::in_memory().unwrap();
        let user = UserId(3);
        assert_eq!(store.get_attribute(user, "ac").await.unwrap(), None);

        store.set_attribute(user, "ac", Value::Bool(true)).await.unwrap();
        assert_eq!(
            store.get_attribute(user, "ac").await.unwrap(),
            Some(Value::Bool(true))
        );

        store.set_ban_expiry(user, Some(42)).await.unwrap();
        assert_eq!(
            store.get_attribute(user, "ban_expires").await.unwrap(),
            Some(Value::from(42))
        );
        store.set_ban_expiry(user, None).await.unwrap();
        assert_eq!(store.get_attribute(user, "ban_expires").await.unwrap(), None);
        // 他の属性は残る
        assert_eq!(
            store.get_attribute(user, "ac").await.unwrap(),
            Some(Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn known_attribute_with_wrong_type_is_rejected() {
        let store = MemberStore::in_memory().unwrap();
        let result = store
            .set_attribute(UserId(3), "message_count", Value::from("many"))
            .await;
        assert!(result.is_err());
    }
}
