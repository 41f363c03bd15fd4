use chrono::{DateTime, TimeZone, Utc};
use serenity::model::channel::Message;
use serenity::model::guild::Member;
use serenity::model::id::{ChannelId, GuildId, MessageId, RoleId, UserId};
use serenity::model::user::User;
use serenity::model::voice::VoiceState;
use serenity::model::Timestamp;

/// 発言者/メンバーの情報
#[derive(Debug, Clone, PartialEq)]
pub struct Author {
    pub id: UserId,
    pub name: String,
    pub discriminator: u16,
    pub bot: bool,
    pub avatar_url: Option<String>,
    /// ギルド内で持っているロール (DMでは空)
    pub roles: Vec<RoleId>,
    /// アカウントの作成日時
    pub created_at: DateTime<Utc>,
}

impl Author {
    pub fn from_user(user: &User, roles: Vec<RoleId>) -> Author {
        Author {
            id: user.id,
            name: user.name.clone(),
            discriminator: user.discriminator,
            bot: user.bot,
            avatar_url: user.avatar_url(),
            roles,
            created_at: to_utc(user.created_at()),
        }
    }

    /// `name#1234` 形式
    pub fn tag(&self) -> String {
        format!("{}#{:04}", self.name, self.discriminator)
    }

    pub fn has_role(&self, role: RoleId) -> bool {
        self.roles.contains(&role)
    }
}

/// 受信したメッセージ
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePayload {
    pub id: MessageId,
    pub author: Author,
    pub channel_id: ChannelId,
    /// DMのときは None
    pub guild_id: Option<GuildId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl MessagePayload {
    pub fn from_message(msg: &Message) -> MessagePayload {
        let roles = msg
            .member
            .as_ref()
            .map(|member| member.roles.clone())
            .unwrap_or_default();
        MessagePayload {
            id: msg.id,
            author: Author::from_user(&msg.author, roles),
            channel_id: msg.channel_id,
            guild_id: msg.guild_id,
            content: msg.content.clone(),
            timestamp: to_utc(msg.timestamp),
        }
    }

    /// DMかどうか
    pub fn is_direct(&self) -> bool {
        self.guild_id.is_none()
    }
}

/// 参加したメンバー
#[derive(Debug, Clone, PartialEq)]
pub struct MemberPayload {
    pub guild_id: GuildId,
    pub user: Author,
    pub joined_at: Option<DateTime<Utc>>,
}

impl MemberPayload {
    pub fn from_member(member: &Member) -> MemberPayload {
        MemberPayload {
            guild_id: member.guild_id,
            user: Author::from_user(&member.user, member.roles.clone()),
            joined_at: member.joined_at.map(to_utc),
        }
    }
}

/// 正規化したイベント
#[derive(Debug, Clone, PartialEq)]
pub enum BotEvent {
    MessageReceived(MessagePayload),
    MemberJoined(MemberPayload),
    MemberLeft {
        guild_id: GuildId,
        user: Author,
    },
    MessageEdited {
        before: MessagePayload,
        after: MessagePayload,
    },
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
        guild_id: Option<GuildId>,
        /// キャッシュに残っていた削除前のメッセージ
        message: Option<MessagePayload>,
    },
    MemberUpdated {
        guild_id: GuildId,
        user: Author,
        before_name: String,
        after_name: String,
        gained_roles: Vec<RoleId>,
        lost_roles: Vec<RoleId>,
    },
    VoiceStateChanged {
        guild_id: Option<GuildId>,
        user_id: UserId,
        before_channel: Option<ChannelId>,
        after_channel: Option<ChannelId>,
    },
}

/// ゲートウェイから届いたイベント (serenityのコールバック引数そのまま)
#[derive(Debug)]
pub enum GatewayEvent {
    MessageCreate(Message),
    MessageUpdate {
        old: Option<Message>,
        new: Option<Message>,
    },
    MessageDelete {
        channel_id: ChannelId,
        message_id: MessageId,
        guild_id: Option<GuildId>,
        cached: Option<Message>,
    },
    MemberAdd(Member),
    MemberRemove {
        guild_id: GuildId,
        user: User,
    },
    MemberUpdate {
        old: Option<Member>,
        new: Member,
    },
    VoiceStateUpdate {
        old: Option<VoiceState>,
        new: VoiceState,
    },
    /// serenityが解釈できなかったイベント
    Unknown { name: String },
}

/// ゲートウェイのイベントを分類する。扱えないイベントは None
pub fn classify(event: GatewayEvent) -> Option<BotEvent> {
    match event {
        GatewayEvent::MessageCreate(msg) => {
            Some(BotEvent::MessageReceived(MessagePayload::from_message(&msg)))
        }
        GatewayEvent::MessageUpdate { old, new } => match (old, new) {
            // 編集前の内容が分からなければ比較できない
            (Some(old), Some(new)) => Some(BotEvent::MessageEdited {
                before: MessagePayload::from_message(&old),
                after: MessagePayload::from_message(&new),
            }),
            _ => None,
        },
        GatewayEvent::MessageDelete {
            channel_id,
            message_id,
            guild_id,
            cached,
        } => Some(BotEvent::MessageDeleted {
            channel_id,
            message_id,
            guild_id,
            message: cached.as_ref().map(MessagePayload::from_message),
        }),
        GatewayEvent::MemberAdd(member) => {
            Some(BotEvent::MemberJoined(MemberPayload::from_member(&member)))
        }
        GatewayEvent::MemberRemove { guild_id, user } => Some(BotEvent::MemberLeft {
            guild_id,
            user: Author::from_user(&user, Vec::new()),
        }),
        GatewayEvent::MemberUpdate { old, new } => {
            let old = old?;
            let (gained_roles, lost_roles) = role_diff(&old.roles, &new.roles);
            Some(BotEvent::MemberUpdated {
                guild_id: new.guild_id,
                user: Author::from_user(&new.user, new.roles.clone()),
                before_name: old.display_name().to_string(),
                after_name: new.display_name().to_string(),
                gained_roles,
                lost_roles,
            })
        }
        GatewayEvent::VoiceStateUpdate { old, new } => Some(BotEvent::VoiceStateChanged {
            guild_id: new.guild_id,
            user_id: new.user_id,
            before_channel: old.and_then(|old| old.channel_id),
            after_channel: new.channel_id,
        }),
        GatewayEvent::Unknown { name } => {
            log::trace!("未対応のイベントを無視: {}", name);
            None
        }
    }
}

/// ロールの増減を (増えた, 減った) で返す
pub fn role_diff(before: &[RoleId], after: &[RoleId]) -> (Vec<RoleId>, Vec<RoleId>) {
    let gained = after
        .iter()
        .filter(|role| !before.contains(role))
        .copied()
        .collect();
    let lost = before
        .iter()
        .filter(|role| !after.contains(role))
        .copied()
        .collect();
    (gained, lost)
}

/// serenityの時刻をchronoへ
pub fn to_utc(timestamp: Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(timestamp.unix_timestamp(), 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// テスト用の発言者
    pub fn author(id: u64, name: &str) -> Author {
        Author {
            id: UserId(id),
            name: name.to_string(),
            discriminator: 1,
            bot: false,
            avatar_url: None,
            roles: Vec::new(),
            created_at: Utc.timestamp_opt(1_500_000_000, 0).unwrap(),
        }
    }

    /// テスト用のギルド内メッセージ
    pub fn guild_message(author_id: u64, channel: u64, content: &str) -> MessagePayload {
        MessagePayload {
            id: MessageId(1000),
            author: author(author_id, "tester"),
            channel_id: ChannelId(channel),
            guild_id: Some(GuildId(1)),
            content: content.to_string(),
            timestamp: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn unknown_events_are_dropped() {
        assert_eq!(
            classify(GatewayEvent::Unknown {
                name: "GUILD_SOUNDBOARD_SOUND_CREATE".to_string()
            }),
            None
        );
    }

    #[test]
    fn edit_without_cached_original_is_dropped() {
        assert_eq!(
            classify(GatewayEvent::MessageUpdate {
                old: None,
                new: None
            }),
            None
        );
    }

    #[test]
    fn delete_without_cache_keeps_ids() {
        let event = classify(GatewayEvent::MessageDelete {
            channel_id: ChannelId(2),
            message_id: MessageId(3),
            guild_id: Some(GuildId(4)),
            cached: None,
        });
        assert_eq!(
            event,
            Some(BotEvent::MessageDeleted {
                channel_id: ChannelId(2),
                message_id: MessageId(3),
                guild_id: Some(GuildId(4)),
                message: None,
            })
        );
    }

    #[test]
    fn role_diff_reports_both_directions() {
        let (gained, lost) = role_diff(&[RoleId(1), RoleId(2)], &[RoleId(2), RoleId(3)]);
        assert_eq!(gained, vec![RoleId(3)]);
        assert_eq!(lost, vec![RoleId(1)]);
    }

    #[test]
    fn tag_pads_discriminator() {
        assert_eq!(author(1, "alice").tag(), "alice#0001");
        assert!(guild_message(1, 2, "hi").author.roles.is_empty());
        assert!(!guild_message(1, 2, "hi").is_direct());
    }
}
