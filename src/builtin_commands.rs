use anyhow::Context as _;
use chrono::{Duration, TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use serenity::model::id::UserId;

use crate::command_resolver::{
    CommandContext, CommandDescriptor, CommandRegistry, CommandResult, Permission,
};

/// 組み込みコマンドを登録する
pub fn register_all(registry: &mut CommandRegistry) {
    let builtins: Vec<CommandDescriptor> = vec![
        CommandDescriptor {
            name: "help",
            help: "コマンドの一覧、または指定したコマンドの使い方を表示します",
            usage: "help [コマンド]",
            permission: Permission::Everyone,
            guild_only: false,
            invoke: help,
        },
        CommandDescriptor {
            name: "ping",
            help: "Botが応答するか確認します",
            usage: "ping",
            permission: Permission::Everyone,
            guild_only: false,
            invoke: ping,
        },
        CommandDescriptor {
            name: "stats",
            help: "Botの統計を表示します",
            usage: "stats",
            permission: Permission::Everyone,
            guild_only: false,
            invoke: stats,
        },
        CommandDescriptor {
            name: "info",
            help: "メンバーの記録を表示します",
            usage: "info [ユーザー]",
            permission: Permission::Everyone,
            guild_only: false,
            invoke: info,
        },
        CommandDescriptor {
            name: "ac",
            help: "自分への返信に定型文を付けるかどうかを切り替えます",
            usage: "ac",
            permission: Permission::Everyone,
            guild_only: false,
            invoke: auto_content,
        },
        CommandDescriptor {
            name: "lock",
            help: "参加/退出/編集などのログ出力を止める、または再開します",
            usage: "lock",
            permission: Permission::Moderator,
            guild_only: false,
            invoke: lock,
        },
        CommandDescriptor {
            name: "reload",
            help: "ポリシーファイルを読み直します",
            usage: "reload",
            permission: Permission::Admin,
            guild_only: false,
            invoke: reload,
        },
        CommandDescriptor {
            name: "save",
            help: "ポリシーをファイルに保存します",
            usage: "save",
            permission: Permission::Admin,
            guild_only: false,
            invoke: save,
        },
        CommandDescriptor {
            name: "alias",
            help: "コマンドに別名を付けます",
            usage: "alias <別名> <コマンド>",
            permission: Permission::Admin,
            guild_only: false,
            invoke: alias,
        },
        CommandDescriptor {
            name: "unalias",
            help: "別名を削除します",
            usage: "unalias <別名>",
            permission: Permission::Admin,
            guild_only: false,
            invoke: unalias,
        },
        CommandDescriptor {
            name: "addcommand",
            help: "カスタムコマンドを追加します ({user} {mention} {channel} {args} が使えます)",
            usage: "addcommand <名前> <応答>",
            permission: Permission::Moderator,
            guild_only: false,
            invoke: add_command,
        },
        CommandDescriptor {
            name: "delcommand",
            help: "カスタムコマンドを削除します",
            usage: "delcommand <名前>",
            permission: Permission::Moderator,
            guild_only: false,
            invoke: del_command,
        },
        CommandDescriptor {
            name: "filter",
            help: "禁止ワードを追加/削除/一覧表示します",
            usage: "filter <add|remove|list> [単語]",
            permission: Permission::Moderator,
            guild_only: false,
            invoke: filter,
        },
        CommandDescriptor {
            name: "blacklist",
            help: "Botを使えないユーザーを追加/削除します",
            usage: "blacklist <add|remove> <ユーザー>",
            permission: Permission::Admin,
            guild_only: false,
            invoke: blacklist,
        },
        CommandDescriptor {
            name: "ban",
            help: "ユーザーを無期限でBANします",
            usage: "ban <ユーザー> [理由]",
            permission: Permission::Moderator,
            guild_only: true,
            invoke: ban,
        },
        CommandDescriptor {
            name: "tempban",
            help: "ユーザーを指定した時間だけBANします",
            usage: "tempban <ユーザー> <時間> [理由]",
            permission: Permission::Moderator,
            guild_only: true,
            invoke: temp_ban,
        },
        CommandDescriptor {
            name: "unban",
            help: "ユーザーのBANを解除します",
            usage: "unban <ユーザー>",
            permission: Permission::Moderator,
            guild_only: true,
            invoke: unban,
        },
    ];

    for descriptor in builtins {
        registry.register(descriptor);
    }
}

/// `<@123>` `<@!123>` `123` のどれかからユーザーIDを取り出す
pub fn parse_user(arg: &str) -> Option<UserId> {
    let id = arg
        .trim_start_matches("<@")
        .trim_start_matches('!')
        .trim_end_matches('>');
    id.parse::<u64>().ok().map(UserId)
}

fn help<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let prefix = ctx.services.policy.read().await.prefix.clone();
        if let Some(name) = ctx.invocation.args.first() {
            let reply = match ctx.registry.get(name).filter(|c| !c.help.is_empty()) {
                Some(command) => format!("`{}{}`\n{}", prefix, command.usage, command.help),
                None => format!("コマンド {} はありません", name),
            };
            return Ok(Some(reply));
        }
        let lines = ctx
            .registry
            .enabled()
            .map(|command| format!("`{}{}` - {}", prefix, command.name, command.help))
            .collect::<Vec<_>>();
        Ok(Some(lines.join("\n")))
    }
    .boxed()
}

fn ping<'a>(_ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move { Ok(Some("Pong!".to_string())) }.boxed()
}

fn stats<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let policy = ctx.services.policy.read().await;
        Ok(Some(format!(
            "実行されたコマンド: {}\n別名: {}\nカスタムコマンド: {}\n禁止ワード: {}",
            policy.stats.command_count,
            policy.aliases.len(),
            policy.custom_commands.len(),
            policy.word_filter.len(),
        )))
    }
    .boxed()
}

fn info<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let user = match ctx.invocation.args.first() {
            Some(arg) => match parse_user(arg) {
                Some(user) => user,
                None => return Ok(Some(format!("{} はユーザーとして解釈できません", arg))),
            },
            None => ctx.invocation.author.id,
        };
        let record = match ctx.services.members.get_member(user).await? {
            Some(record) => record,
            None => return Ok(Some(format!("{} の記録はありません", user))),
        };

        let tz = ctx.services.app_config.tz();
        let last_active = record
            .last_active
            .map(|t| t.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut lines = vec![
            format!("名前の履歴: {}", record.aliases.join(", ")),
            format!("発言数: {}", record.message_count),
            format!("最終発言: {}", last_active),
        ];
        if let Some(expires) = record.ban_expires {
            if let Some(expires) = Utc.timestamp_opt(expires, 0).single() {
                lines.push(format!(
                    "BAN期限: {}",
                    expires.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S")
                ));
            }
        }
        Ok(Some(lines.join("\n")))
    }
    .boxed()
}

fn auto_content<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let user = ctx.invocation.author.id;
        let members = &ctx.services.members;
        let enabled = members
            .get_attribute(user, "ac")
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        members.set_attribute(user, "ac", Value::Bool(!enabled)).await?;
        Ok(Some(if enabled {
            "定型文をオフにしました".to_string()
        } else {
            "定型文をオンにしました".to_string()
        }))
    }
    .boxed()
}

fn lock<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let locked = ctx.services.state.toggle_log_lock();
        Ok(Some(if locked {
            "ログ出力を停止しました".to_string()
        } else {
            "ログ出力を再開しました".to_string()
        }))
    }
    .boxed()
}

fn reload<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        ctx.services.policy.reload().await?;
        Ok(Some("ポリシーを読み直しました".to_string()))
    }
    .boxed()
}

fn save<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        ctx.services.policy.save().await?;
        Ok(Some("ポリシーを保存しました".to_string()))
    }
    .boxed()
}

fn alias<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let (name, target) = match ctx.invocation.args.as_slice() {
            [name, target, ..] => (name.clone(), target.clone()),
            _ => return Ok(Some("使い方: alias <別名> <コマンド>".to_string())),
        };
        if ctx.registry.get(&name).is_some() {
            return Ok(Some(format!("{} は組み込みコマンドの名前です", name)));
        }
        if ctx.registry.get(&target).is_none() {
            return Ok(Some(format!("コマンド {} はありません", target)));
        }
        ctx.services
            .policy
            .write()
            .await
            .aliases
            .insert(name.clone(), target.clone());
        Ok(Some(format!("{} を {} の別名にしました", name, target)))
    }
    .boxed()
}

fn unalias<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let name = match ctx.invocation.args.first() {
            Some(name) => name,
            None => return Ok(Some("使い方: unalias <別名>".to_string())),
        };
        let removed = ctx.services.policy.write().await.aliases.remove(name);
        Ok(Some(match removed {
            Some(_) => format!("別名 {} を削除しました", name),
            None => format!("別名 {} はありません", name),
        }))
    }
    .boxed()
}

fn add_command<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let name = match ctx.invocation.args.first() {
            Some(name) => name.clone(),
            None => return Ok(Some("使い方: addcommand <名前> <応答>".to_string())),
        };
        let response = ctx.invocation.raw_rest(1);
        if response.is_empty() {
            return Ok(Some("応答が空です".to_string()));
        }
        if ctx.registry.get(&name).is_some() {
            return Ok(Some(format!("{} は組み込みコマンドの名前です", name)));
        }
        ctx.services
            .policy
            .write()
            .await
            .custom_commands
            .insert(name.clone(), response);
        Ok(Some(format!("カスタムコマンド {} を登録しました", name)))
    }
    .boxed()
}

fn del_command<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let name = match ctx.invocation.args.first() {
            Some(name) => name,
            None => return Ok(Some("使い方: delcommand <名前>".to_string())),
        };
        let removed = ctx.services.policy.write().await.custom_commands.remove(name);
        Ok(Some(match removed {
            Some(_) => format!("カスタムコマンド {} を削除しました", name),
            None => format!("カスタムコマンド {} はありません", name),
        }))
    }
    .boxed()
}

fn filter<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let action = ctx.invocation.args.first().map(String::as_str);
        // 禁止ワードは大文字小文字を区別する
        let word = ctx.invocation.raw_args.get(1).cloned();
        let mut policy = ctx.services.policy.write().await;
        let reply = match (action, word) {
            (Some("add"), Some(word)) => {
                policy.word_filter.insert(word.clone());
                format!("禁止ワード {} を追加しました", word)
            }
            (Some("remove"), Some(word)) => {
                if policy.word_filter.remove(&word) {
                    format!("禁止ワード {} を削除しました", word)
                } else {
                    format!("禁止ワード {} は登録されていません", word)
                }
            }
            (Some("list"), _) => {
                if policy.word_filter.is_empty() {
                    "禁止ワードはありません".to_string()
                } else {
                    policy
                        .word_filter
                        .iter()
                        .map(String::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                }
            }
            _ => "使い方: filter <add|remove|list> [単語]".to_string(),
        };
        Ok(Some(reply))
    }
    .boxed()
}

fn blacklist<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let args = &ctx.invocation.args;
        let (action, user) = match (args.first(), args.get(1).and_then(|a| parse_user(a))) {
            (Some(action), Some(user)) => (action.as_str(), user),
            _ => return Ok(Some("使い方: blacklist <add|remove> <ユーザー>".to_string())),
        };
        let mut policy = ctx.services.policy.write().await;
        let reply = match action {
            "add" => {
                policy.blacklist.insert(user);
                format!("<@{}> をブラックリストに追加しました", user)
            }
            "remove" => {
                policy.blacklist.remove(&user);
                format!("<@{}> をブラックリストから削除しました", user)
            }
            _ => "使い方: blacklist <add|remove> <ユーザー>".to_string(),
        };
        Ok(Some(reply))
    }
    .boxed()
}

fn ban<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let guild = ctx.invocation.guild_id.context("サーバー外でのBAN")?;
        let user = match ctx.invocation.args.first().and_then(|a| parse_user(a)) {
            Some(user) => user,
            None => return Ok(Some("使い方: ban <ユーザー> [理由]".to_string())),
        };
        let reason = ctx.invocation.raw_rest(1);
        ctx.services.platform.ban(guild, user, &reason).await?;
        // 無期限なので自動解除の対象から外す
        ctx.services.members.set_ban_expiry(user, None).await?;
        log::info!("{} が {} をBAN: {}", ctx.invocation.author.tag(), user, reason);
        Ok(Some(format!("<@{}> をBANしました", user)))
    }
    .boxed()
}

const TEMPBAN_USAGE: &str = "使い方: tempban <ユーザー> <時間> [理由]";

fn temp_ban<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let guild = ctx.invocation.guild_id.context("サーバー外でのBAN")?;
        let args = &ctx.invocation.args;
        let user = args.first().and_then(|a| parse_user(a));
        let hours = args.get(1).and_then(|a| a.parse::<i64>().ok()).filter(|h| *h > 0);
        // 期限が表せない時間は使い方の誤りとして扱う
        let expires = hours
            .and_then(Duration::try_hours)
            .and_then(|delta| Utc::now().checked_add_signed(delta));
        let (user, hours, expires) = match (user, hours, expires) {
            (Some(user), Some(hours), Some(expires)) => (user, hours, expires),
            _ => return Ok(Some(TEMPBAN_USAGE.to_string())),
        };
        let reason = ctx.invocation.raw_rest(2);

        ctx.services.platform.ban(guild, user, &reason).await?;
        ctx.services
            .members
            .set_ban_expiry(user, Some(expires.timestamp()))
            .await?;
        log::info!(
            "{} が {} を {} 時間BAN: {}",
            ctx.invocation.author.tag(),
            user,
            hours,
            reason
        );
        Ok(Some(format!("<@{}> を {} 時間BANしました", user, hours)))
    }
    .boxed()
}

fn unban<'a>(ctx: &'a CommandContext<'a>) -> BoxFuture<'a, CommandResult> {
    async move {
        let guild = ctx.invocation.guild_id.context("サーバー外でのBAN解除")?;
        let user = match ctx.invocation.args.first().and_then(|a| parse_user(a)) {
            Some(user) => user,
            None => return Ok(Some("使い方: unban <ユーザー>".to_string())),
        };
        ctx.services.platform.unban(guild, user).await?;
        ctx.services.members.set_ban_expiry(user, None).await?;
        Ok(Some(format!("<@{}> のBANを解除しました", user)))
    }
    .boxed()
}
