//! Terminal surface: one command per stdin line.

use std::path::PathBuf;

use beam_core::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Peers,
    Connect(PeerId),
    /// Send a file; empty peer list means every live peer.
    Send { path: PathBuf, peers: Vec<PeerId> },
    Transfers,
    Quit,
    Chat(String),
    Help,
}

/// Parse one input line. Blank lines yield None; unknown slash commands yield an error message.
pub fn parse(line: &str) -> Option<Result<Command, String>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Ok(Command::Chat(line.to_string())));
    }
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let result = match verb {
        "/peers" => Ok(Command::Peers),
        "/transfers" => Ok(Command::Transfers),
        "/quit" | "/exit" => Ok(Command::Quit),
        "/help" => Ok(Command::Help),
        "/connect" => match parts.next() {
            Some(peer) => Ok(Command::Connect(PeerId::from(peer))),
            None => Err("usage: /connect <peer>".to_string()),
        },
        "/send" => match parts.next() {
            Some(path) => Ok(Command::Send {
                path: PathBuf::from(path),
                peers: parts.map(PeerId::from).collect(),
            }),
            None => Err("usage: /send <path> [peer...]".to_string()),
        },
        other => Err(format!("unknown command {other}; try /help")),
    };
    Some(result)
}

pub const HELP: &str = "\
/peers                 list known and connected peers
/connect <peer>        open a direct channel
/send <path> [peer...] send a file (default: every connected peer)
/transfers             list transfers
/quit                  leave
anything else          chat with every connected peer";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_chat() {
        assert_eq!(parse("  hello there "), Some(Ok(Command::Chat("hello there".into()))));
        assert_eq!(parse("   "), None);
    }

    #[test]
    fn send_with_and_without_peers() {
        assert_eq!(
            parse("/send notes.txt"),
            Some(Ok(Command::Send {
                path: "notes.txt".into(),
                peers: vec![]
            }))
        );
        assert_eq!(
            parse("/send a.bin brave-otter-1a2b calm-heron-0f0f"),
            Some(Ok(Command::Send {
                path: "a.bin".into(),
                peers: vec![PeerId::from("brave-otter-1a2b"), PeerId::from("calm-heron-0f0f")]
            }))
        );
    }

    #[test]
    fn malformed_commands_explain_usage() {
        assert!(matches!(parse("/connect"), Some(Err(_))));
        assert!(matches!(parse("/send"), Some(Err(_))));
        assert!(matches!(parse("/dance"), Some(Err(_))));
        assert_eq!(parse("/connect x"), Some(Ok(Command::Connect(PeerId::from("x")))));
    }
}
