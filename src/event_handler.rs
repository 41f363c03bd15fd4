use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use serenity::async_trait;
use serenity::model::channel::Message;
use serenity::model::event::MessageUpdateEvent;
use serenity::model::gateway::Ready;
use serenity::model::guild::Member;
use serenity::model::id::{ChannelId, GuildId, MessageId, RoleId};
use serenity::model::user::User;
use serenity::model::voice::VoiceState;
use serenity::prelude::*;

use crate::command_resolver::{resolve, CommandRegistry, Resolution};
use crate::event::{classify, Author, BotEvent, GatewayEvent, MemberPayload, MessagePayload};
use crate::member_store::{MemberUpdate, UpdateKind};
use crate::moderation::{evaluate, Alert, Intent};
use crate::platform::RichMessage;
use crate::policy::PolicyConfig;
use crate::runtime_state::Services;

/// 新しいアカウントとして警告する日数
const NEW_ACCOUNT_DAYS: i64 = 7;

/// イベント受信リスナー
pub struct Handler {
    /// 共有の状態
    services: Services,
    /// 組み込みコマンド
    registry: CommandRegistry,
}

impl Handler {
    /// コンストラクタ
    pub fn new(services: Services, registry: CommandRegistry) -> Self {
        Self { services, registry }
    }

    /// 分類済みのイベントを処理する
    pub async fn dispatch(&self, event: BotEvent) {
        match event {
            BotEvent::MessageReceived(msg) => self.on_message(msg).await,
            BotEvent::MemberJoined(member) => self.on_member_joined(member).await,
            BotEvent::MemberLeft { guild_id, user } => self.on_member_left(guild_id, user).await,
            BotEvent::MessageEdited { before, after } => {
                self.on_message_edited(before, after).await
            }
            BotEvent::MessageDeleted {
                channel_id,
                message_id,
                guild_id,
                message,
            } => {
                self.on_message_deleted(channel_id, message_id, guild_id, message)
                    .await
            }
            BotEvent::MemberUpdated {
                guild_id,
                user,
                before_name,
                after_name,
                gained_roles,
                lost_roles,
            } => {
                self.on_member_updated(guild_id, user, before_name, after_name, gained_roles, lost_roles)
                    .await
            }
            BotEvent::VoiceStateChanged {
                guild_id,
                user_id,
                before_channel,
                after_channel,
            } => {
                if before_channel != after_channel {
                    log::debug!(
                        "ボイスチャンネルの移動 ({:?}): {} {:?} -> {:?}",
                        guild_id,
                        user_id,
                        before_channel,
                        after_channel
                    );
                }
            }
        }
    }

    /// ゲートウェイのイベントを分類して処理する
    async fn handle(&self, event: GatewayEvent) {
        if let Some(event) = classify(event) {
            self.dispatch(event).await;
        }
    }

    /// メッセージを受信した時の処理
    async fn on_message(&self, msg: MessagePayload) {
        // DM以外はコマンドかどうかに関わらず記録する
        if !msg.is_direct() {
            let update = MemberUpdate {
                name: Some(msg.author.name.clone()),
                guild: msg.guild_id,
                channel: Some(msg.channel_id),
                timestamp: Some(msg.timestamp),
            };
            if let Err(why) = self
                .services
                .members
                .update_member(msg.author.id, &update, UpdateKind::Message)
                .await
            {
                log::error!("メンバー情報の更新に失敗: {:?}", why);
            }
        }

        // Botの投稿を無視
        if msg.author.bot {
            return;
        }

        let (intents, bare_prefix, allow_direct) = {
            let policy = self.services.policy.read().await;
            (
                evaluate(&msg, &policy),
                msg.content.trim() == policy.prefix,
                policy.allow_direct_messages,
            )
        };
        if bare_prefix {
            return;
        }
        if intents.contains(&Intent::RejectSilently) {
            log::debug!("ブラックリストのユーザーを無視: {}", msg.author.id);
            return;
        }

        // ロールを付与したメッセージはコマンドとして扱わない
        if self.execute_intents(&msg, intents).await {
            return;
        }

        if msg.is_direct() && !allow_direct {
            self.send(
                msg.channel_id,
                "スタッフの設定により、現在DMには応答していません",
            )
            .await;
            return;
        }

        match resolve(&self.registry, &self.services, &msg).await {
            Ok(Resolution::NoCommand) => (),
            Ok(Resolution::Handled(Some(reply))) => self.reply(&msg, reply).await,
            Ok(Resolution::Handled(None)) => (),
            Err(why) => {
                log::error!(
                    "コマンドの実行に失敗 [{}] [{}] [{}]: {:?}",
                    msg.channel_id,
                    msg.author.tag(),
                    msg.content,
                    why
                );
            }
        }
    }

    /// 判定結果を実行する。ロールを付与したときは true
    async fn execute_intents(&self, msg: &MessagePayload, intents: Vec<Intent>) -> bool {
        let mut granted = false;
        for intent in intents {
            match intent {
                Intent::LogAlert(alert) => self.alert(alert).await,
                Intent::SendResponse { channel, text } => self.send(channel, &text).await,
                Intent::GrantRole { guild, user, role } => {
                    match self.services.platform.grant_role(guild, user, role).await {
                        Ok(()) => {
                            log::info!("{} ({}) にロール {} を付与", msg.author.tag(), user, role);
                            granted = true;
                        }
                        Err(why) => {
                            self.alert(Alert::RoleGrantFailed {
                                user,
                                channel: msg.channel_id,
                                reason: why.to_string(),
                            })
                            .await;
                            self.send(
                                msg.channel_id,
                                "ロールの付与中に問題が発生しました。スタッフに連絡してください",
                            )
                            .await;
                        }
                    }
                }
                Intent::RejectSilently => (),
            }
        }
        granted
    }

    /// 発言者への返信。`ac` を有効にしている人には定型文を付ける
    async fn reply(&self, msg: &MessagePayload, mut text: String) {
        let auto_content = match self.services.members.get_attribute(msg.author.id, "ac").await {
            Ok(value) => value.and_then(|v| v.as_bool()).unwrap_or(false),
            Err(why) => {
                log::warn!("ac 属性の取得に失敗: {:?}", why);
                false
            }
        };
        if auto_content {
            let suffix = self.services.policy.read().await.auto_content_suffix.clone();
            if !suffix.is_empty() {
                text.push_str(", ");
                text.push_str(&suffix);
            }
        }
        self.send(msg.channel_id, &text).await;
    }

    /// メッセージを送る。失敗はログに出すだけ
    async fn send(&self, channel: ChannelId, text: &str) {
        if let Err(why) = self.services.platform.send_message(channel, text).await {
            log::error!("メッセージの送信に失敗: {}", why);
        }
    }

    /// 埋め込みを送る。失敗はログに出すだけ
    async fn send_rich(&self, channel: ChannelId, message: RichMessage) {
        if let Err(why) = self.services.platform.send_rich_message(channel, &message).await {
            log::error!("埋め込みの送信に失敗 ({}): {}", message.title, why);
        }
    }

    /// モデレーター向けの通知
    async fn alert(&self, alert: Alert) {
        let mod_channel = self.services.app_config.discord.mod_channel;
        let message = match alert {
            Alert::WordFilterHit {
                author,
                author_id,
                avatar_url,
                channel,
                guild,
                content,
                word,
                timestamp,
            } => {
                log::info!("禁止ワード {} を検出: {} ({})", word, author, author_id);
                RichMessage::new("禁止ワード検出", "禁止ワードが含まれていました", 0x9f00ff)
                    .author(author.clone())
                    .field("投稿者", author, true)
                    .field("チャンネル", format!("<#{}>", channel), true)
                    .field(
                        "サーバー",
                        guild.map(|g| g.to_string()).unwrap_or_else(|| "DM".to_string()),
                        true,
                    )
                    .field("内容", content, false)
                    .field("検出した単語", word, false)
                    .field("時刻", self.format_time(timestamp), true)
                    .thumbnail(avatar_url)
            }
            Alert::RoleGrantFailed {
                user,
                channel,
                reason,
            } => {
                log::error!("ロールの付与に失敗 ({}): {}", user, reason);
                RichMessage::new("ロール付与の失敗", format!("<@{}> へのロール付与に失敗しました", user), 0xff0000)
                    .field("チャンネル", format!("<#{}>", channel), true)
                    .field("理由", reason, false)
            }
        };
        self.send_rich(mod_channel, message).await;
    }

    fn format_time(&self, time: DateTime<Utc>) -> String {
        time.with_timezone(&self.services.app_config.tz())
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    /// メンバーが参加した時の処理
    async fn on_member_joined(&self, member: MemberPayload) {
        let log_channel = self.services.app_config.discord.log_channel;

        // 歓迎メッセージをDMで送る
        let welcome = self.services.policy.read().await.welcome_message.clone();
        let dm_note = match welcome.filter(|text| !text.is_empty()) {
            Some(text) => match self
                .services
                .platform
                .send_direct_message(member.user.id, &text)
                .await
            {
                Ok(()) => Some("歓迎のDMを送信しました"),
                Err(why) => {
                    log::warn!("歓迎のDMの送信に失敗 ({}): {}", member.user.id, why);
                    Some("歓迎のDMを送信できませんでした")
                }
            },
            None => None,
        };

        if self.services.state.is_log_locked() {
            return;
        }

        let previous = match self.services.members.get_member(member.user.id).await {
            Ok(record) => record.and_then(|r| r.current_alias().map(str::to_string)),
            Err(why) => {
                log::error!("メンバー情報の取得に失敗: {:?}", why);
                None
            }
        };
        let update = MemberUpdate {
            name: Some(member.user.name.clone()),
            guild: Some(member.guild_id),
            channel: None,
            timestamp: None,
        };
        let created = match self
            .services
            .members
            .update_member(member.user.id, &update, UpdateKind::Join)
            .await
        {
            Ok(created) => created,
            Err(why) => {
                log::error!("メンバー情報の更新に失敗: {:?}", why);
                false
            }
        };

        let embed = if created {
            RichMessage::new(
                "メンバー参加",
                format!("新しいメンバーが {} に参加しました", member.guild_id),
                0x00ff00,
            )
        } else {
            let previous = match previous {
                Some(previous) => previous,
                None => return,
            };
            RichMessage::new(
                "メンバー再参加",
                format!("{} が {} として再参加しました", previous, member.user.name),
                0x00ff00,
            )
        };
        let embed = embed
            .thumbnail(member.user.avatar_url.clone())
            .field("名前", member.user.name.clone(), true)
            .field("ID", member.user.id.to_string(), true)
            .field("識別子", format!("{:04}", member.user.discriminator), true)
            .field(
                "参加日時",
                member
                    .joined_at
                    .map(|t| self.format_time(t))
                    .unwrap_or_else(|| "-".to_string()),
                true,
            )
            .field("アカウント作成日時", self.format_time(member.user.created_at), true);
        self.send_rich(log_channel, embed).await;

        if let Some(note) = dm_note {
            self.send(log_channel, note).await;
        }
        if is_new_account(member.user.created_at, Utc::now()) {
            self.send(
                log_channel,
                &format!(
                    "このアカウントは作成から{}日未満です",
                    NEW_ACCOUNT_DAYS
                ),
            )
            .await;
        }
    }

    /// メンバーが退出した時の処理
    async fn on_member_left(&self, guild_id: GuildId, user: Author) {
        if self.services.state.is_log_locked() {
            return;
        }
        let embed = RichMessage::new(
            "メンバー退出",
            format!("メンバーが {} から退出しました", guild_id),
            0xff0000,
        )
        .thumbnail(user.avatar_url.clone())
        .field("名前", user.name.clone(), true)
        .field("ID", user.id.to_string(), true)
        .field("識別子", format!("{:04}", user.discriminator), true)
        .field("時刻", self.format_time(Utc::now()), true);
        self.send_rich(self.services.app_config.discord.log_channel, embed)
            .await;
    }

    /// メッセージが編集された時の処理
    async fn on_message_edited(&self, before: MessagePayload, after: MessagePayload) {
        if self.services.state.is_log_locked() {
            return;
        }
        if !should_log_edit(&before, &after, &*self.services.policy.read().await) {
            return;
        }
        let embed = RichMessage::new(
            "メッセージ編集",
            format!("{} がメッセージを編集しました", before.author.tag()),
            0xae00fe,
        )
        .field(
            "サーバー",
            before.guild_id.map(|g| g.to_string()).unwrap_or_default(),
            true,
        )
        .field("チャンネル", format!("<#{}>", before.channel_id), true)
        .field("編集前", before.content, false)
        .field("編集後", after.content, false)
        .field("時刻", self.format_time(Utc::now()), false);
        self.send_rich(self.services.app_config.discord.mod_channel, embed)
            .await;
    }

    /// メッセージが削除された時の処理
    async fn on_message_deleted(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        guild_id: Option<GuildId>,
        message: Option<MessagePayload>,
    ) {
        if self.services.state.is_log_locked() {
            return;
        }
        if !should_log_delete(channel_id, guild_id, &*self.services.policy.read().await) {
            return;
        }
        let (description, content, created) = match &message {
            Some(msg) => (
                format!("{} のメッセージが削除されました", msg.author.tag()),
                msg.content.clone(),
                self.format_time(msg.timestamp),
            ),
            None => (
                format!("メッセージ {} が削除されました", message_id),
                "(キャッシュに無いため不明)".to_string(),
                "-".to_string(),
            ),
        };
        let embed = RichMessage::new("メッセージ削除", description, 0xfc00a2)
            .field(
                "サーバー",
                guild_id.map(|g| g.to_string()).unwrap_or_default(),
                true,
            )
            .field("チャンネル", format!("<#{}>", channel_id), true)
            .field("内容", content, false)
            .field("投稿日時", created, true)
            .field("時刻", self.format_time(Utc::now()), true);
        self.send_rich(self.services.app_config.discord.mod_channel, embed)
            .await;
    }

    /// メンバーのロールや名前が変わった時の処理
    async fn on_member_updated(
        &self,
        guild_id: GuildId,
        user: Author,
        before_name: String,
        after_name: String,
        gained_roles: Vec<RoleId>,
        lost_roles: Vec<RoleId>,
    ) {
        if self.services.state.is_log_locked() {
            return;
        }
        let mod_channel = self.services.app_config.discord.mod_channel;

        let changes = gained_roles
            .iter()
            .map(|role| ("付与", *role))
            .chain(lost_roles.iter().map(|role| ("剥奪", *role)));
        for (change, role) in changes {
            let embed = RichMessage::new(
                format!("({}) ロール{}", guild_id, change),
                format!("{} のロールが{}されました", user.tag(), change),
                0x0093c3,
            )
            .field("ロール", format!("<@&{}>", role), true)
            .field("時刻", self.format_time(Utc::now()), true);
            self.send_rich(mod_channel, embed).await;
        }

        if before_name != after_name {
            let embed = RichMessage::new(
                "名前の変更",
                format!("{} が名前を {} に変更しました", before_name, after_name),
                0x34f3ad,
            )
            .field("時刻", self.format_time(Utc::now()), true);
            self.send_rich(mod_channel, embed).await;
        }
    }
}

/// 編集ログを出すかどうか
pub fn should_log_edit(before: &MessagePayload, after: &MessagePayload, policy: &PolicyConfig) -> bool {
    if before.is_direct() {
        return false;
    }
    if before
        .guild_id
        .map_or(false, |guild| policy.ignored_servers.contains(&guild))
        || policy.ignored_channels.contains(&before.channel_id)
    {
        return false;
    }
    !before.content.is_empty() && !after.content.is_empty() && before.content != after.content
}

/// 削除ログを出すかどうか
pub fn should_log_delete(channel_id: ChannelId, guild_id: Option<GuildId>, policy: &PolicyConfig) -> bool {
    match guild_id {
        None => false,
        Some(guild) => {
            !policy.ignored_servers.contains(&guild) && !policy.ignored_channels.contains(&channel_id)
        }
    }
}

/// 編集後のメッセージを取り直す必要があるか。編集前が無い編集は記録しない
pub fn needs_refetch<T>(old: &Option<T>, new: &Option<T>) -> bool {
    old.is_some() && new.is_none()
}

/// 作成から日が浅いアカウントか
pub fn is_new_account(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - created_at < Duration::days(NEW_ACCOUNT_DAYS)
}

#[async_trait]
impl EventHandler for Handler {
    /// 準備完了時に呼ばれる
    async fn ready(&self, _ctx: Context, data_about_bot: Ready) {
        log::info!(
            "{}#{:04} ({}) としてログインしました",
            data_about_bot.user.name,
            data_about_bot.user.discriminator,
            data_about_bot.user.id
        );
        log::info!("プレフィックス: {}", self.services.policy.read().await.prefix);
    }

    /// メッセージが送信された時に呼び出される
    async fn message(&self, _ctx: Context, msg: Message) {
        self.handle(GatewayEvent::MessageCreate(msg)).await;
    }

    // メッセージが更新された時に呼び出される
    async fn message_update(
        &self,
        ctx: Context,
        old_if_available: Option<Message>,
        new: Option<Message>,
        event: MessageUpdateEvent,
    ) {
        // 編集前が無ければ記録できないので取得もしない
        if old_if_available.is_none() {
            return;
        }
        let new = if needs_refetch(&old_if_available, &new) {
            // キャッシュに無ければメッセージIDから取得
            match event.channel_id.message(&ctx, event.id).await {
                Ok(message) => Some(message),
                Err(why) => {
                    log::warn!("編集されたメッセージの取得に失敗: {:?}", why);
                    None
                }
            }
        } else {
            new
        };
        self.handle(GatewayEvent::MessageUpdate {
            old: old_if_available,
            new,
        })
        .await;
    }

    /// メッセージが削除された時に呼び出される
    async fn message_delete(
        &self,
        ctx: Context,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        guild_id: Option<GuildId>,
    ) {
        let cached = ctx.cache.message(channel_id, deleted_message_id);
        self.handle(GatewayEvent::MessageDelete {
            channel_id,
            message_id: deleted_message_id,
            guild_id,
            cached,
        })
        .await;
    }

    /// メンバーが参加した時に呼び出される
    async fn guild_member_addition(&self, _ctx: Context, new_member: Member) {
        self.handle(GatewayEvent::MemberAdd(new_member)).await;
    }

    /// メンバーが退出した時に呼び出される
    async fn guild_member_removal(
        &self,
        _ctx: Context,
        guild_id: GuildId,
        user: User,
        _member_data_if_available: Option<Member>,
    ) {
        self.handle(GatewayEvent::MemberRemove { guild_id, user })
            .await;
    }

    /// メンバー情報が更新された時に呼び出される
    async fn guild_member_update(&self, _ctx: Context, old_if_available: Option<Member>, new: Member) {
        self.handle(GatewayEvent::MemberUpdate {
            old: old_if_available,
            new,
        })
        .await;
    }

    /// ボイスチャンネルの状態が変わった時に呼び出される
    async fn voice_state_update(&self, _ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        self.handle(GatewayEvent::VoiceStateUpdate { old, new }).await;
    }

    /// serenityが知らないイベント
    async fn unknown(&self, _ctx: Context, name: String, _raw: Value) {
        self.handle(GatewayEvent::Unknown { name }).await;
    }
}
