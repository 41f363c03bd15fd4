use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serenity::model::id::{ChannelId, GuildId, RoleId, UserId};

use crate::event::MessagePayload;
use crate::policy::{IgnoredChannelMode, PolicyConfig};

/// モデレーターへ通知する内容
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    /// 禁止ワードを検出
    WordFilterHit {
        author: String,
        author_id: UserId,
        avatar_url: Option<String>,
        channel: ChannelId,
        guild: Option<GuildId>,
        content: String,
        word: String,
        timestamp: DateTime<Utc>,
    },
    /// ロール付与に失敗
    RoleGrantFailed {
        user: UserId,
        channel: ChannelId,
        reason: String,
    },
}

/// 判定結果として要求する副作用
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    LogAlert(Alert),
    GrantRole {
        guild: GuildId,
        user: UserId,
        role: RoleId,
    },
    SendResponse {
        channel: ChannelId,
        text: String,
    },
    /// 以降の処理をせずに黙って無視する
    RejectSilently,
}

/// メッセージをポリシーに照らして判定する
pub fn evaluate(msg: &MessagePayload, policy: &PolicyConfig) -> Vec<Intent> {
    if policy.blacklist.contains(&msg.author.id) {
        return vec![Intent::RejectSilently];
    }

    let mut intents = Vec::new();
    let ignored = policy.ignored_channels.contains(&msg.channel_id);

    if !ignored {
        if let Some(alert) = check_word_filter(msg, policy) {
            intents.push(Intent::LogAlert(alert));
        }
    }

    if !(ignored && policy.ignored_channel_mode == IgnoredChannelMode::All) {
        intents.extend(check_role_grant(msg, policy));
    }

    intents
}

/// 最初に見つかった禁止ワードだけを報告する
fn check_word_filter(msg: &MessagePayload, policy: &PolicyConfig) -> Option<Alert> {
    let word = msg
        .content
        .split_whitespace()
        .find(|token| policy.word_filter.contains(*token))?;

    Some(Alert::WordFilterHit {
        author: msg.author.tag(),
        author_id: msg.author.id,
        avatar_url: msg.author.avatar_url.clone(),
        channel: msg.channel_id,
        guild: msg.guild_id,
        content: msg.content.clone(),
        word: word.to_string(),
        timestamp: msg.timestamp,
    })
}

fn check_role_grant(msg: &MessagePayload, policy: &PolicyConfig) -> Vec<Intent> {
    let rule = match &policy.role_grant {
        Some(rule) => rule,
        None => return Vec::new(),
    };
    if msg.channel_id != rule.channel || msg.author.has_role(rule.role) {
        return Vec::new();
    }

    let guild = match msg.guild_id {
        Some(guild) => guild,
        None => return Vec::new(),
    };

    let regex = match RegexBuilder::new(&rule.regex)
        .case_insensitive(rule.ignore_case)
        .build()
    {
        Ok(regex) => regex,
        Err(why) => {
            return vec![Intent::LogAlert(Alert::RoleGrantFailed {
                user: msg.author.id,
                channel: msg.channel_id,
                reason: format!("ロール付与の正規表現が不正: {}", why),
            })];
        }
    };

    // 全体一致ではなく先頭からのマッチ
    let matched = regex
        .find(&msg.content)
        .map_or(false, |found| found.start() == 0);
    if !matched {
        return Vec::new();
    }

    vec![
        Intent::SendResponse {
            channel: msg.channel_id,
            text: rule.response.clone(),
        },
        Intent::GrantRole {
            guild,
            user: msg.author.id,
            role: rule.role,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::guild_message;
    use crate::policy::RoleGrantRule;

    fn filter_policy() -> PolicyConfig {
        let mut policy = PolicyConfig::default();
        policy.word_filter.insert("badword".to_string());
        policy.word_filter.insert("worse".to_string());
        policy
    }

    fn grant_policy(regex: &str, ignore_case: bool) -> PolicyConfig {
        let mut policy = PolicyConfig::default();
        policy.role_grant = Some(RoleGrantRule {
            channel: ChannelId(50),
            regex: regex.to_string(),
            ignore_case,
            role: RoleId(60),
            response: "welcome aboard".to_string(),
        });
        policy
    }

    #[test]
    fn single_alert_for_filtered_word() {
        let msg = guild_message(1, 2, "hello badword world");
        let intents = evaluate(&msg, &filter_policy());
        assert_eq!(intents.len(), 1);
        match &intents[0] {
            Intent::LogAlert(Alert::WordFilterHit { word, content, .. }) => {
                assert_eq!(word, "badword");
                assert_eq!(content, "hello badword world");
            }
            other => panic!("unexpected intent: {:?}", other),
        }
    }

    #[test]
    fn first_match_wins() {
        let msg = guild_message(1, 2, "worse badword");
        let intents = evaluate(&msg, &filter_policy());
        assert_eq!(intents.len(), 1);
        assert!(matches!(
            &intents[0],
            Intent::LogAlert(Alert::WordFilterHit { word, .. }) if word == "worse"
        ));
    }

    #[test]
    fn clean_message_and_case_sensitivity() {
        assert!(evaluate(&guild_message(1, 2, "hello world"), &filter_policy()).is_empty());
        assert!(evaluate(&guild_message(1, 2, "BADWORD"), &filter_policy()).is_empty());
        assert!(evaluate(&guild_message(1, 2, "badwords"), &filter_policy()).is_empty());
    }

    #[test]
    fn ignored_channel_skips_filter() {
        let mut policy = filter_policy();
        policy.ignored_channels.insert(ChannelId(2));
        assert!(evaluate(&guild_message(1, 2, "badword"), &policy).is_empty());
    }

    #[test]
    fn blacklisted_author_is_rejected() {
        let mut policy = filter_policy();
        policy.blacklist.insert(UserId(1));
        assert_eq!(
            evaluate(&guild_message(1, 2, "badword"), &policy),
            vec![Intent::RejectSilently]
        );
    }

    #[test]
    fn role_granted_on_trigger() {
        let intents = evaluate(&guild_message(7, 50, "agree"), &grant_policy("^agree$", false));
        assert_eq!(
            intents,
            vec![
                Intent::SendResponse {
                    channel: ChannelId(50),
                    text: "welcome aboard".to_string(),
                },
                Intent::GrantRole {
                    guild: GuildId(1),
                    user: UserId(7),
                    role: RoleId(60),
                },
            ]
        );
    }

    #[test]
    fn no_grant_when_role_already_held() {
        let mut msg = guild_message(7, 50, "agree");
        msg.author.roles.push(RoleId(60));
        assert!(evaluate(&msg, &grant_policy("^agree$", false)).is_empty());
    }

    #[test]
    fn no_grant_in_other_channels_or_without_match() {
        let policy = grant_policy("^agree$", false);
        assert!(evaluate(&guild_message(7, 51, "agree"), &policy).is_empty());
        assert!(evaluate(&guild_message(7, 50, "disagree"), &policy).is_empty());
        assert!(evaluate(&guild_message(7, 50, "AGREE"), &policy).is_empty());
        assert_eq!(
            evaluate(&guild_message(7, 50, "AGREE"), &grant_policy("^agree$", true)).len(),
            2
        );
    }

    #[test]
    fn trigger_is_a_prefix_match() {
        let policy = grant_policy("i agree", false);
        assert_eq!(
            evaluate(&guild_message(7, 50, "i agree to the rules"), &policy).len(),
            2
        );
        assert!(evaluate(&guild_message(7, 50, "well, i agree"), &policy).is_empty());
    }

    #[test]
    fn bad_regex_becomes_alert() {
        let intents = evaluate(&guild_message(7, 50, "agree"), &grant_policy("(agree", false));
        assert_eq!(intents.len(), 1);
        assert!(matches!(
            &intents[0],
            Intent::LogAlert(Alert::RoleGrantFailed { user, .. }) if *user == UserId(7)
        ));
    }

    #[test]
    fn filter_and_grant_are_independent() {
        let mut policy = grant_policy("agree", false);
        policy.word_filter.insert("badword".to_string());
        let intents = evaluate(&guild_message(7, 50, "agree badword"), &policy);
        assert_eq!(intents.len(), 3);
        assert!(matches!(intents[0], Intent::LogAlert(_)));
        assert!(matches!(intents[2], Intent::GrantRole { .. }));
    }

    #[test]
    fn ignore_mode_all_skips_grant_too() {
        let mut policy = grant_policy("agree", false);
        policy.ignored_channels.insert(ChannelId(50));
        assert_eq!(evaluate(&guild_message(7, 50, "agree"), &policy).len(), 2);

        policy.ignored_channel_mode = IgnoredChannelMode::All;
        assert!(evaluate(&guild_message(7, 50, "agree"), &policy).is_empty());
    }
}
