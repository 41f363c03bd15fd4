use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serenity::model::id::{ChannelId, GuildId};

use crate::error::BotError;
use crate::event::{Author, MessagePayload};
use crate::member_store::{MemberUpdate, UpdateKind};
use crate::policy::PolicyConfig;
use crate::runtime_state::Services;

/// コマンドの戻り値 (返信する文。None なら黙る)
pub type CommandResult = anyhow::Result<Option<String>>;

/// コマンドの実体
pub type CommandFn = for<'a> fn(&'a CommandContext<'a>) -> BoxFuture<'a, CommandResult>;

/// 実行に必要な権限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Everyone,
    /// モデレーターロール持ちか管理者
    Moderator,
    /// 管理者のみ
    Admin,
}

/// 登録されたコマンド
pub struct CommandDescriptor {
    pub name: &'static str,
    /// 説明。空のコマンドは無効扱い
    pub help: &'static str,
    pub usage: &'static str,
    pub permission: Permission,
    /// サーバー内でのみ実行できる
    pub guild_only: bool,
    pub invoke: CommandFn,
}

/// 組み込みコマンドの一覧
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<&'static str, CommandDescriptor>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 組み込みコマンドを全部登録したもの
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin_commands::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, descriptor: CommandDescriptor) {
        if self.commands.insert(descriptor.name, descriptor).is_some() {
            log::warn!("同名のコマンドを上書きしました");
        }
    }

    pub fn get(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(name)
    }

    /// 説明の付いた (有効な) コマンド
    pub fn enabled(&self) -> impl Iterator<Item = &CommandDescriptor> {
        self.commands.values().filter(|command| !command.help.is_empty())
    }
}

/// 1回分のコマンド呼び出し
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub raw_content: String,
    pub author: Author,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub timestamp: DateTime<Utc>,
    /// 小文字化したコマンド名 (別名解決前)
    pub name: String,
    /// 小文字化した引数
    pub args: Vec<String>,
    /// 大文字小文字を保った引数
    pub raw_args: Vec<String>,
}

impl Invocation {
    /// プレフィックスで始まっていなければ None
    pub fn parse(msg: &MessagePayload, prefix: &str) -> Option<Invocation> {
        let content = msg.content.trim();
        if prefix.is_empty() || !content.starts_with(prefix) {
            return None;
        }
        let body = content[prefix.len()..].trim();
        let mut raw_tokens = body.split_whitespace();
        let name = raw_tokens.next()?.to_lowercase();
        let raw_args: Vec<String> = raw_tokens.map(str::to_string).collect();
        let args = raw_args.iter().map(|arg| arg.to_lowercase()).collect();

        Some(Invocation {
            raw_content: msg.content.clone(),
            author: msg.author.clone(),
            channel_id: msg.channel_id,
            guild_id: msg.guild_id,
            timestamp: msg.timestamp,
            name,
            args,
            raw_args,
        })
    }

    /// 先頭 n 個を除いた引数を元の大文字小文字のまま連結する
    pub fn raw_rest(&self, skip: usize) -> String {
        self.raw_args
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_direct(&self) -> bool {
        self.guild_id.is_none()
    }
}

/// コマンドに渡す文脈
pub struct CommandContext<'a> {
    pub invocation: Invocation,
    pub services: &'a Services,
    pub registry: &'a CommandRegistry,
}

/// 解決結果
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// コマンドではなかった
    NoCommand,
    /// 処理した (返信があれば Some)
    Handled(Option<String>),
}

/// メッセージをコマンドとして解決し、実行する
pub async fn resolve(
    registry: &CommandRegistry,
    services: &Services,
    msg: &MessagePayload,
) -> Result<Resolution, BotError> {
    // コマンドの実行中にポリシーを書き換えられるよう、読み取りロックは先に手放す
    let (invocation, alias, template) = {
        let policy = services.policy.read().await;
        let invocation = match Invocation::parse(msg, &policy.prefix) {
            Some(invocation) => invocation,
            None => return Ok(Resolution::NoCommand),
        };
        let alias = policy.aliases.get(&invocation.name).cloned();
        let template = policy.custom_commands.get(&invocation.name).cloned();
        (invocation, alias, template)
    };

    if let Some(command) = registry.get(&invocation.name) {
        if command.help.is_empty() {
            log::warn!(
                "説明の無いコマンド {} は無効として無視します",
                command.name
            );
            return Ok(Resolution::NoCommand);
        }
        return run(registry, services, command, invocation).await;
    }

    if let Some(canonical) = alias {
        return match registry.get(&canonical) {
            Some(command) => run(registry, services, command, invocation).await,
            None => {
                let why = BotError::Config(format!(
                    "別名 {} の参照先 {} が存在しません",
                    invocation.name, canonical
                ));
                log::error!("{}", why);
                Ok(Resolution::NoCommand)
            }
        };
    }

    if let Some(template) = template {
        log::info!(
            "[{}] [{}] [{}] [custom:{}]",
            invocation.channel_id,
            invocation.author.tag(),
            invocation.author.id,
            invocation.name
        );
        return Ok(Resolution::Handled(Some(render_template(
            &template,
            &invocation,
        ))));
    }

    Ok(Resolution::NoCommand)
}

/// 権限があるか
pub fn is_permitted(permission: Permission, author: &Author, policy: &PolicyConfig) -> bool {
    let admin = policy.admins.contains(&author.id);
    match permission {
        Permission::Everyone => true,
        Permission::Admin => admin,
        Permission::Moderator => {
            admin
                || author
                    .roles
                    .iter()
                    .any(|role| policy.moderator_roles.contains(role))
        }
    }
}

async fn run(
    registry: &CommandRegistry,
    services: &Services,
    command: &CommandDescriptor,
    invocation: Invocation,
) -> Result<Resolution, BotError> {
    if command.guild_only && invocation.is_direct() {
        return Ok(Resolution::Handled(Some(
            "このコマンドはサーバー内でのみ使えます".to_string(),
        )));
    }
    let permitted = is_permitted(
        command.permission,
        &invocation.author,
        &*services.policy.read().await,
    );
    if !permitted {
        log::info!(
            "{} ({}) には {} を実行する権限がありません",
            invocation.author.tag(),
            invocation.author.id,
            command.name
        );
        return Ok(Resolution::Handled(Some(
            "このコマンドを実行する権限がありません".to_string(),
        )));
    }

    log::info!(
        "[{}] [{}] [{}] [{}]",
        invocation.channel_id,
        invocation.author.tag(),
        invocation.author.id,
        invocation.raw_content.trim()
    );

    let ctx = CommandContext {
        invocation,
        services,
        registry,
    };
    let response = (command.invoke)(&ctx)
        .await
        .map_err(|cause| BotError::CommandExecution {
            command: command.name.to_string(),
            cause,
        })?;

    services.policy.write().await.stats.command_count += 1;

    let invocation = &ctx.invocation;
    if let Some(guild) = invocation.guild_id {
        let update = MemberUpdate {
            name: Some(invocation.author.name.clone()),
            guild: Some(guild),
            channel: Some(invocation.channel_id),
            timestamp: Some(invocation.timestamp),
        };
        services
            .members
            .update_member(invocation.author.id, &update, UpdateKind::Command)
            .await?;
    }

    Ok(Resolution::Handled(response))
}

/// カスタムコマンドの応答を組み立てる (置換のみ)
pub fn render_template(template: &str, invocation: &Invocation) -> String {
    template
        .replace("{user}", &invocation.author.name)
        .replace("{mention}", &format!("<@{}>", invocation.author.id))
        .replace("{channel}", &format!("<#{}>", invocation.channel_id))
        .replace("{args}", &invocation.raw_rest(0))
}
