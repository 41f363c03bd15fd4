use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serenity::async_trait;
use serenity::http::Http;
use serenity::model::id::{ChannelId, GuildId, RoleId, UserId};

use crate::error::BotError;

/// 埋め込みメッセージの内容
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RichMessage {
    pub title: String,
    pub description: String,
    pub colour: u32,
    pub author: Option<String>,
    pub thumbnail: Option<String>,
    /// (名前, 値, インライン)
    pub fields: Vec<(String, String, bool)>,
}

impl RichMessage {
    pub fn new(title: impl Into<String>, description: impl Into<String>, colour: u32) -> Self {
        RichMessage {
            title: title.into(),
            description: description.into(),
            colour,
            ..Default::default()
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push((name.into(), value.into(), inline));
        self
    }

    pub fn thumbnail(mut self, url: Option<String>) -> Self {
        self.thumbnail = url;
        self
    }

    pub fn author(mut self, name: impl Into<String>) -> Self {
        self.author = Some(name.into());
        self
    }
}

/// BANされているユーザー
#[derive(Debug, Clone, PartialEq)]
pub struct BannedUser {
    pub id: UserId,
    pub name: String,
}

/// Botがプラットフォームに対して行える操作
#[async_trait]
pub trait Platform: Send + Sync {
    async fn send_message(&self, channel: ChannelId, text: &str) -> Result<(), BotError>;
    async fn send_rich_message(&self, channel: ChannelId, message: &RichMessage)
        -> Result<(), BotError>;
    async fn send_direct_message(&self, user: UserId, text: &str) -> Result<(), BotError>;
    async fn grant_role(&self, guild: GuildId, user: UserId, role: RoleId)
        -> Result<(), BotError>;
    async fn ban(&self, guild: GuildId, user: UserId, reason: &str) -> Result<(), BotError>;
    async fn unban(&self, guild: GuildId, user: UserId) -> Result<(), BotError>;
    async fn list_bans(&self, guild: GuildId) -> Result<Vec<BannedUser>, BotError>;
}

/// serenityのHTTPクライアントを使った実装
pub struct SerenityPlatform {
    http: Arc<Http>,
    /// API呼び出しのタイムアウト
    timeout: Duration,
    /// 開発モードでは送信内容に印を付ける
    dev_mode: bool,
}

impl SerenityPlatform {
    pub fn new(http: Arc<Http>, timeout: Duration, dev_mode: bool) -> Self {
        Self {
            http,
            timeout,
            dev_mode,
        }
    }

    /// タイムアウト付きで呼び出し、失敗を Transport エラーにする
    async fn call<T, F>(&self, what: &str, fut: F) -> Result<T, BotError>
    where
        F: Future<Output = serenity::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(why)) => Err(BotError::Transport(format!("{}: {}", what, why))),
            Err(_) => Err(BotError::Transport(format!("{}: タイムアウト", what))),
        }
    }

    fn decorate(&self, text: &str) -> String {
        if self.dev_mode {
            format!("[DEV]  {}  [DEV]", text)
        } else {
            text.to_string()
        }
    }
}

#[async_trait]
impl Platform for SerenityPlatform {
    async fn send_message(&self, channel: ChannelId, text: &str) -> Result<(), BotError> {
        let text = self.decorate(text);
        self.call(
            &format!("メッセージの送信 ({})", channel),
            channel.say(&*self.http, text),
        )
        .await
        .map(|_| ())
    }

    async fn send_rich_message(
        &self,
        channel: ChannelId,
        message: &RichMessage,
    ) -> Result<(), BotError> {
        let mut message = message.clone();
        if self.dev_mode {
            message = message.field("DEV", "DEV", false);
        }
        let send = channel.send_message(&*self.http, |m| {
            m.embed(|e| {
                e.title(&message.title);
                e.description(&message.description);
                e.colour(message.colour);
                if let Some(author) = &message.author {
                    e.author(|a| a.name(author));
                }
                if let Some(thumbnail) = &message.thumbnail {
                    e.thumbnail(thumbnail);
                }
                for (name, value, inline) in &message.fields {
                    e.field(name, value, *inline);
                }
                e
            })
        });
        self.call(&format!("埋め込みの送信 ({})", channel), send)
            .await
            .map(|_| ())
    }

    async fn send_direct_message(&self, user: UserId, text: &str) -> Result<(), BotError> {
        let text = self.decorate(text);
        let recipient = serde_json::json!({ "recipient_id": user.0.to_string() });
        let private = self
            .call(
                &format!("DMチャンネルの作成 ({})", user),
                self.http.create_private_channel(&recipient),
            )
            .await?;
        self.call(
            &format!("DMの送信 ({})", user),
            private.id.say(&*self.http, text),
        )
        .await
        .map(|_| ())
    }

    async fn grant_role(
        &self,
        guild: GuildId,
        user: UserId,
        role: RoleId,
    ) -> Result<(), BotError> {
        self.call(
            &format!("ロールの付与 ({} -> {})", role, user),
            self.http.add_member_role(guild.0, user.0, role.0, None),
        )
        .await
    }

    async fn ban(&self, guild: GuildId, user: UserId, reason: &str) -> Result<(), BotError> {
        self.call(
            &format!("BAN ({})", user),
            guild.ban_with_reason(&*self.http, user, 0, reason),
        )
        .await
    }

    async fn unban(&self, guild: GuildId, user: UserId) -> Result<(), BotError> {
        self.call(
            &format!("BAN解除 ({})", user),
            guild.unban(&*self.http, user),
        )
        .await
    }

    async fn list_bans(&self, guild: GuildId) -> Result<Vec<BannedUser>, BotError> {
        let bans = self
            .call(&format!("BAN一覧の取得 ({})", guild), guild.bans(&*self.http))
            .await?;
        Ok(bans
            .into_iter()
            .map(|ban| BannedUser {
                id: ban.user.id,
                name: ban.user.name,
            })
            .collect())
    }
}
