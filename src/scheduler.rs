use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serenity::model::id::{GuildId, UserId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::runtime_state::Services;

/// BANの期限の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanDecision {
    /// 期限なし (このループでは扱わない)
    Permanent,
    /// 期限切れ
    Expired,
    /// 残り秒数
    Remaining(i64),
}

/// 保存された期限と現在時刻を比べる
pub fn decide(ban_expires: Option<i64>, now: i64) -> BanDecision {
    match ban_expires {
        None => BanDecision::Permanent,
        Some(expires) if expires <= now => BanDecision::Expired,
        Some(expires) => BanDecision::Remaining(expires - now),
    }
}

/// 一定間隔で処理を繰り返すタスクを起動する
///
/// 間隔は周回ごとに `period` から読み直すので、ポリシーの再読み込みが次の待ち時間から効く。
/// 停止シグナルは周回の合間にだけ見るので、実行中の周回は最後まで走る。
pub fn spawn_periodic<P, PFut, F, Fut>(
    name: &'static str,
    mut period: P,
    mut shutdown: watch::Receiver<bool>,
    mut cycle: F,
) -> JoinHandle<()>
where
    P: FnMut() -> PFut + Send + 'static,
    PFut: Future<Output = Duration> + Send,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut current = period().await;
        log::info!("{} を開始 (間隔: {:?})", name, current);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = sleep(current) => cycle().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break; // 送信側が消えた
                    }
                    continue;
                }
            }
            let next = period().await;
            if next != current {
                log::info!("{} の間隔を変更: {:?} -> {:?}", name, current, next);
                current = next;
            }
        }
        log::info!("{} を停止", name);
    })
}

/// 一時BANの自動解除
pub struct TemporalModeration {
    services: Services,
    /// 監視するギルド
    guilds: Vec<GuildId>,
    /// メンバーごとのAPI呼び出しの間隔
    call_delay: Duration,
}

impl TemporalModeration {
    pub fn new(services: Services, guilds: Vec<GuildId>, call_delay: Duration) -> Self {
        Self {
            services,
            guilds,
            call_delay,
        }
    }

    /// 全ギルドを1周する
    pub async fn run_cycle(&self) -> Vec<(GuildId, UserId)> {
        let now = Utc::now().timestamp();
        log::debug!("一時BANの確認 (現在: {})", now);
        let mut unbanned = Vec::new();
        for guild in &self.guilds {
            for user in self.scan_guild(*guild, now).await {
                unbanned.push((*guild, user));
            }
        }
        unbanned
    }

    /// 1つのギルドのBAN一覧を確認し、期限切れを解除する
    pub async fn scan_guild(&self, guild: GuildId, now: i64) -> Vec<UserId> {
        let bans = match self.services.platform.list_bans(guild).await {
            Ok(bans) => bans,
            Err(why) => {
                log::error!("BAN一覧の取得に失敗 ({}): {}", guild, why);
                return Vec::new();
            }
        };

        let mut unbanned = Vec::new();
        for banned in bans {
            let expires = match self
                .services
                .members
                .get_attribute(banned.id, "ban_expires")
                .await
            {
                Ok(value) => value.and_then(|v| v.as_i64()),
                Err(why) => {
                    log::error!("BAN期限の読み込みに失敗 ({}): {:?}", banned.id, why);
                    continue;
                }
            };

            match decide(expires, now) {
                BanDecision::Permanent => continue,
                BanDecision::Expired => {
                    log::info!("{} の期限 {} は {} を過ぎています", banned.id, expires.unwrap_or_default(), now);
                    match self.services.platform.unban(guild, banned.id).await {
                        Ok(()) => {
                            if let Err(why) =
                                self.services.members.set_ban_expiry(banned.id, None).await
                            {
                                log::error!("BAN期限の消去に失敗 ({}): {:?}", banned.id, why);
                            }
                            log::info!("{} ({}) のBANを解除", banned.name, banned.id);
                            unbanned.push(banned.id);
                        }
                        Err(why) => log::error!("BAN解除に失敗 ({}): {}", banned.id, why),
                    }
                }
                BanDecision::Remaining(secs) => {
                    log::debug!("{} ({}) は残り {} 秒", banned.name, banned.id, secs);
                }
            }
            sleep(self.call_delay).await;
        }
        unbanned
    }
}

/// ポリシーを保存する1周分
pub async fn autosave(services: &Services) {
    if services.app_config.dev_mode {
        return;
    }
    match services.policy.save().await {
        Ok(()) => log::debug!("ポリシーを自動保存"),
        Err(why) => log::error!("ポリシーの自動保存に失敗: {:?}", why),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyConfig;
    use crate::runtime_state::tests::services;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn decisions_follow_expiry() {
        let now = 1_000_000;
        assert_eq!(decide(Some(now - 1), now), BanDecision::Expired);
        assert_eq!(decide(Some(now), now), BanDecision::Expired);
        assert_eq!(decide(Some(now + 3600), now), BanDecision::Remaining(3600));
        assert_eq!(decide(None, now), BanDecision::Permanent);
    }

    #[tokio::test]
    async fn only_expired_bans_are_lifted() {
        let (services, platform, _dir) = services(PolicyConfig::default());
        let guild = GuildId(1);
        let now = Utc::now().timestamp();
        for user in [10, 11, 12] {
            services.platform.ban(guild, UserId(user), "").await.unwrap();
        }
        services.members.set_ban_expiry(UserId(10), Some(now - 1)).await.unwrap();
        services.members.set_ban_expiry(UserId(11), Some(now + 3600)).await.unwrap();

        let scanner = TemporalModeration::new(services.clone(), vec![guild], Duration::ZERO);
        assert_eq!(scanner.run_cycle().await, vec![(guild, UserId(10))]);
        assert_eq!(platform.banned_ids(guild), vec![UserId(11), UserId(12)]);
        assert_eq!(
            services.members.get_attribute(UserId(10), "ban_expires").await.unwrap(),
            None
        );

        // 次の周回では同じメンバーを解除しない
        assert!(scanner.run_cycle().await.is_empty());
        assert_eq!(platform.unbanned.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_expiry_is_not_reused() {
        let (services, platform, _dir) = services(PolicyConfig::default());
        let guild = GuildId(1);
        let now = Utc::now().timestamp();
        services.platform.ban(guild, UserId(10), "").await.unwrap();
        services.members.set_ban_expiry(UserId(10), Some(now - 10)).await.unwrap();

        let scanner = TemporalModeration::new(services.clone(), vec![guild], Duration::ZERO);
        scanner.run_cycle().await;

        // 再度無期限でBANされても、古い期限で解除されない
        services.platform.ban(guild, UserId(10), "").await.unwrap();
        assert!(scanner.run_cycle().await.is_empty());
        assert_eq!(platform.banned_ids(guild), vec![UserId(10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = spawn_periodic("test", || async { Duration::from_secs(1) }, rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_follows_reloaded_interval() {
        let (services, _platform, _dir) = services(PolicyConfig {
            unban_interval_secs: 1,
            ..PolicyConfig::default()
        });
        let (tx, rx) = watch::channel(false);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let policy = services.policy.clone();
        let handle = spawn_periodic(
            "test",
            move || {
                let policy = policy.clone();
                async move {
                    let interval = policy.read().await.unban_interval();
                    interval
                }
            },
            rx,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // 待機中の周回は古い間隔のまま、その次から新しい間隔になる
        services.policy.write().await.unban_interval_secs = 10;
        sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn autosave_writes_policy_unless_dev_mode() {
        let (services, _platform, dir) = services(PolicyConfig::default());
        autosave(&services).await;
        assert!(dir.path().join("policy.json").exists());

        let (mut dev, _platform, dev_dir) = self::services(PolicyConfig::default());
        let mut config = (*dev.app_config).clone();
        config.dev_mode = true;
        dev.app_config = Arc::new(config);
        autosave(&dev).await;
        assert!(!dev_dir.path().join("policy.json").exists());
    }
}
