//! ターゲットとコントローラの間のメッセージ
//!
//! 1メッセージを1行のJSONとして送ります。

use serde::{Deserialize, Serialize};

/// スコープの状態通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "act", rename_all = "lowercase")]
pub enum ScopeReport {
    /// 停止してコマンド待ちに入った
    Enter,
    /// 式の評価結果
    Result { result: String },
    /// コマンド待ちを抜けた
    Quit,
}

/// ログの重要度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// ターゲット → コントローラ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetMessage {
    Scope(ScopeReport),
    Log {
        level: LogLevel,
        text: String,
    },
    /// スコープ外での評価結果
    Exec {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// ペイロードの読み込み完了
    Loaded,
    Error {
        message: String,
    },
}

/// コントローラ → ターゲット
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControllerMessage {
    /// 停止中のスコープへのコマンド（`c` `ni`または式）
    Scope { code: String },
    /// スコープ外で式を評価する
    Exec { id: u64, code: String },
    /// ペイロードを読み込む
    Load { path: String },
    /// ペイロードを取り外す
    Unload,
    /// 起動時のゲートを開けて実行を再開させる
    Resume,
}

/// メッセージを1行にエンコードする（末尾の改行を含む）
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// 1行をメッセージにデコードする
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_messages_wire_shape() {
        assert_eq!(
            serde_json::to_value(TargetMessage::Scope(ScopeReport::Enter)).unwrap(),
            json!({"type": "scope", "act": "enter"})
        );
        assert_eq!(
            serde_json::to_value(TargetMessage::Scope(ScopeReport::Result {
                result: "2".to_string()
            }))
            .unwrap(),
            json!({"type": "scope", "act": "result", "result": "2"})
        );
        assert_eq!(
            serde_json::to_value(TargetMessage::Scope(ScopeReport::Quit)).unwrap(),
            json!({"type": "scope", "act": "quit"})
        );
        assert_eq!(
            serde_json::to_value(ControllerMessage::Scope {
                code: "1+1".to_string()
            })
            .unwrap(),
            json!({"type": "scope", "code": "1+1"})
        );
    }

    #[test]
    fn test_decode_scope_report() {
        let message: TargetMessage =
            decode_line("{\"type\":\"scope\",\"act\":\"result\",\"result\":\"0x10\"}\n").unwrap();
        assert_eq!(
            message,
            TargetMessage::Scope(ScopeReport::Result {
                result: "0x10".to_string()
            })
        );
    }

    #[test]
    fn test_exec_reply_omits_missing_fields() {
        let line = encode_line(&TargetMessage::Exec {
            id: 3,
            result: None,
            error: Some("EvalError: boom".to_string()),
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        assert!(!line.contains("result"));

        let decoded: TargetMessage = decode_line(&line).unwrap();
        assert!(matches!(decoded, TargetMessage::Exec { id: 3, result: None, .. }));
    }

    #[test]
    fn test_unit_controller_messages() {
        let message: ControllerMessage = decode_line("{\"type\":\"resume\"}").unwrap();
        assert_eq!(message, ControllerMessage::Resume);
        assert!(decode_line::<ControllerMessage>("{\"type\":\"bogus\"}").is_err());
    }
}
