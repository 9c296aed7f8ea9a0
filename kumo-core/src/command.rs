//! REPLコマンド

/// `.help`で表示する一覧
pub const HELP: &str = "\
.sessions                 list attached sessions
.switch <pid>             make <pid> the current session
.attach <pid|name>        attach to a running process
.spawn <program> [args]   spawn a process and attach
.inject <target> [args]   attach (or spawn), compile, load and resume
.compile                  build the payload
.load                     load the built payload into the current session
.reload                   rebuild and reload into every session
.resume                   release a spawned process
.watch [off]              rebuild on source change
.detach [pid]             detach from a session
.kill [pid]               kill a process
.help                     show this help
.quit                     detach from everything and exit
<expr>                    evaluate (c / ni continue or step inside a scope)";

/// REPLコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// セッション一覧
    Sessions,
    /// 現在のセッションを切り替え
    Switch(i32),
    Attach(String),
    Spawn { program: String, args: Vec<String> },
    Inject { target: String, args: Vec<String> },
    Compile,
    Load,
    Reload,
    Resume,
    /// ソース監視の開始（true）・停止（false）
    Watch(bool),
    Detach(Option<i32>),
    Kill(Option<i32>),
    Help,
    Quit,
    /// 式の評価
    Eval(String),
}

impl Command {
    /// 入力行をパースする
    ///
    /// `.`で始まらない行はすべて式として扱います。
    /// 空行と不正なコマンドはNoneです。
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        if !input.starts_with('.') {
            return Some(Command::Eval(input.to_string()));
        }

        let parts: Vec<&str> = input.split_whitespace().collect();
        let rest = || parts[1..].iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let pid = |i: usize| parts.get(i).and_then(|s| s.parse::<i32>().ok());

        match parts[0] {
            ".sessions" | ".ls" => Some(Command::Sessions),
            ".switch" => pid(1).map(Command::Switch),
            ".attach" => parts.get(1).map(|t| Command::Attach(t.to_string())),
            ".spawn" => {
                let mut args = rest();
                if args.is_empty() {
                    return None;
                }
                let program = args.remove(0);
                Some(Command::Spawn { program, args })
            }
            ".inject" => {
                let mut args = rest();
                if args.is_empty() {
                    return None;
                }
                let target = args.remove(0);
                Some(Command::Inject { target, args })
            }
            ".compile" => Some(Command::Compile),
            ".load" => Some(Command::Load),
            ".reload" => Some(Command::Reload),
            ".resume" => Some(Command::Resume),
            ".watch" => match parts.get(1) {
                None | Some(&"on") => Some(Command::Watch(true)),
                Some(&"off") => Some(Command::Watch(false)),
                Some(_) => None,
            },
            ".detach" => match parts.get(1) {
                None => Some(Command::Detach(None)),
                Some(_) => pid(1).map(|p| Command::Detach(Some(p))),
            },
            ".kill" => match parts.get(1) {
                None => Some(Command::Kill(None)),
                Some(_) => pid(1).map(|p| Command::Kill(Some(p))),
            },
            ".help" | ".h" | ".?" => Some(Command::Help),
            ".quit" | ".q" | ".exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse(".sessions"), Some(Command::Sessions));
        assert_eq!(Command::parse(".switch 42"), Some(Command::Switch(42)));
        assert_eq!(Command::parse(".switch x"), None);
        assert_eq!(
            Command::parse(".attach nginx"),
            Some(Command::Attach("nginx".to_string()))
        );
        assert_eq!(
            Command::parse(".spawn ./app -v 3"),
            Some(Command::Spawn {
                program: "./app".to_string(),
                args: vec!["-v".to_string(), "3".to_string()],
            })
        );
        assert_eq!(Command::parse(".spawn"), None);
        assert_eq!(Command::parse(".watch"), Some(Command::Watch(true)));
        assert_eq!(Command::parse(".watch off"), Some(Command::Watch(false)));
        assert_eq!(Command::parse(".detach"), Some(Command::Detach(None)));
        assert_eq!(Command::parse(".kill 7"), Some(Command::Kill(Some(7))));
        assert_eq!(Command::parse(".q"), Some(Command::Quit));
        assert_eq!(Command::parse(".bogus"), None);
    }

    #[test]
    fn test_parse_expressions() {
        assert_eq!(Command::parse("   "), None);
        assert_eq!(Command::parse(" c "), Some(Command::Eval("c".to_string())));
        assert_eq!(
            Command::parse("sym(rip) + 1"),
            Some(Command::Eval("sym(rip) + 1".to_string()))
        );
    }
}
