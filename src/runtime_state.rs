use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::app_config::AppConfig;
use crate::member_store::MemberStore;
use crate::platform::Platform;
use crate::policy::PolicyStore;

/// プロセス単位の実行時状態 (永続化しない)
#[derive(Debug, Default)]
pub struct RuntimeState {
    /// 参加/退出/編集などのログ出力を止める
    log_lock: AtomicBool,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// ログ出力が止められているか
    pub fn is_log_locked(&self) -> bool {
        self.log_lock.load(Ordering::SeqCst)
    }

    /// ログロックを反転し、反転後の値を返す
    pub fn toggle_log_lock(&self) -> bool {
        !self.log_lock.fetch_xor(true, Ordering::SeqCst)
    }
}

/// ハンドラー、コマンド、定期処理が共有するもの
#[derive(Clone)]
pub struct Services {
    pub app_config: Arc<AppConfig>,
    pub policy: Arc<PolicyStore>,
    pub members: Arc<MemberStore>,
    pub platform: Arc<dyn Platform>,
    pub state: Arc<RuntimeState>,
}
