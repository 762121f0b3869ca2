/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Send(&'a str),
    ListChats,
    /// 1-based position in the chat list.
    Open(usize),
    Retry,
    Help,
    Quit,
    Unknown(&'a str),
}

pub const HELP: &str = "/chats  list conversations\n/open N  switch to conversation N\n/retry  resend the last failed message\n/quit  leave";

pub fn parse(line: &str) -> Command<'_> {
    let Some(rest) = line.trim_end_matches(['\r', '\n']).strip_prefix('/') else {
        return Command::Send(line.trim_end_matches(['\r', '\n']));
    };
    let mut words = rest.split_whitespace();
    match (words.next(), words.next()) {
        (Some("chats"), None) => Command::ListChats,
        (Some("open"), Some(position)) => match position.parse::<usize>() {
            Ok(position) if position > 0 => Command::Open(position),
            _ => Command::Unknown(line),
        },
        (Some("retry"), None) => Command::Retry,
        (Some("help"), None) => Command::Help,
        (Some("quit" | "exit"), None) => Command::Quit,
        _ => Command::Unknown(line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_sent_verbatim() {
        assert_eq!(parse("  hi there \n"), Command::Send("  hi there "));
        assert_eq!(parse(""), Command::Send(""));
    }

    #[test]
    fn slash_commands_are_recognised() {
        assert_eq!(parse("/chats"), Command::ListChats);
        assert_eq!(parse("/open 2"), Command::Open(2));
        assert_eq!(parse("/retry"), Command::Retry);
        assert_eq!(parse("/exit"), Command::Quit);
        assert_eq!(parse("/open 0"), Command::Unknown("/open 0"));
        assert_eq!(parse("/dance"), Command::Unknown("/dance"));
    }
}
