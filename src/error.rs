/// Botのエラー分類
///
/// イベント単位のエラーはすべてログに出して握りつぶす。致命的なのは起動時の `Auth` のみ。
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// Discordへの送信やBAN等の操作に失敗
    #[error("プラットフォーム操作に失敗: {0}")]
    Transport(String),

    /// 設定値が不正または欠落している
    #[error("設定エラー: {0}")]
    Config(String),

    /// コマンドの実行中にエラーが発生
    #[error("コマンド {command} の実行に失敗: {cause:#}")]
    CommandExecution {
        command: String,
        #[source]
        cause: anyhow::Error,
    },

    /// トークンが無効
    #[error("認証に失敗: {0}")]
    Auth(String),

    /// メンバー情報の読み書きに失敗
    #[error("ストレージエラー: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl BotError {
    /// 起動時に終了コードとして使う値
    pub fn exit_code(&self) -> i32 {
        match self {
            BotError::Auth(_) => 401,
            _ => 1,
        }
    }
}
