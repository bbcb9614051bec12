//! Slash commands
//!
//! Lines starting with `/` are commands; anything else is a chat message.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand {
    /// Archive the conversation and start fresh
    New,
    /// Drop the conversation without archiving
    Clear,
    Older,
    Newer,
    /// Attach an image file to the next message
    Image,
    /// Attach the clipboard image to the next message
    Paste,
    /// Copy the last reply
    Copy,
    Key,
    Url,
    Model,
    /// List archived transcripts
    History,
    Help,
    Quit,
}

impl ChatCommand {
    pub fn all() -> &'static [ChatCommand] {
        &[
            ChatCommand::New,
            ChatCommand::Clear,
            ChatCommand::Older,
            ChatCommand::Newer,
            ChatCommand::Image,
            ChatCommand::Paste,
            ChatCommand::Copy,
            ChatCommand::Key,
            ChatCommand::Url,
            ChatCommand::Model,
            ChatCommand::History,
            ChatCommand::Help,
            ChatCommand::Quit,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChatCommand::New => "new",
            ChatCommand::Clear => "clear",
            ChatCommand::Older => "older",
            ChatCommand::Newer => "newer",
            ChatCommand::Image => "image",
            ChatCommand::Paste => "paste",
            ChatCommand::Copy => "copy",
            ChatCommand::Key => "key",
            ChatCommand::Url => "url",
            ChatCommand::Model => "model",
            ChatCommand::History => "history",
            ChatCommand::Help => "help",
            ChatCommand::Quit => "quit",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ChatCommand::New => "archive this conversation and start a new one",
            ChatCommand::Clear => "clear this conversation without archiving",
            ChatCommand::Older => "open the next older archived conversation",
            ChatCommand::Newer => "open the next newer archived conversation",
            ChatCommand::Image => "attach an image file to the next message",
            ChatCommand::Paste => "attach the clipboard image to the next message",
            ChatCommand::Copy => "copy the last reply to the clipboard",
            ChatCommand::Key => "list API keys, or select one by number",
            ChatCommand::Url => "list base URLs, or select one by number",
            ChatCommand::Model => "list models, or select one by number",
            ChatCommand::History => "list archived conversations",
            ChatCommand::Help => "show this help",
            ChatCommand::Quit => "exit",
        }
    }

    /// Usage hint for the argument, if the command takes one
    pub fn argument(&self) -> Option<&'static str> {
        match self {
            ChatCommand::Image => Some("<path>"),
            ChatCommand::Key | ChatCommand::Url | ChatCommand::Model => Some("[n]"),
            _ => None,
        }
    }

    pub fn matches(prefix: &str) -> Vec<ChatCommand> {
        let prefix = prefix.to_lowercase();
        Self::all()
            .iter()
            .filter(|cmd| cmd.name().starts_with(&prefix))
            .copied()
            .collect()
    }

    pub fn parse(name: &str) -> Option<ChatCommand> {
        let name = name.to_lowercase();
        match name.as_str() {
            "exit" | "q" => return Some(ChatCommand::Quit),
            "?" => return Some(ChatCommand::Help),
            _ => {}
        }
        Self::all().iter().find(|cmd| cmd.name() == name).copied()
    }
}

impl fmt::Display for ChatCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Command(ChatCommand, String),
    Unknown(String),
    /// `//text` sends `/text` as a message
    Literal(String),
}

/// Parse a command line. Returns `None` for ordinary messages.
pub fn parse_command(input: &str) -> Option<ParsedCommand> {
    let rest = input.trim().strip_prefix('/')?;
    if rest.starts_with('/') {
        return Some(ParsedCommand::Literal(rest.to_string()));
    }
    let (cmd_name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim().to_string()),
        None => (rest, String::new()),
    };

    match ChatCommand::parse(cmd_name) {
        Some(cmd) => Some(ParsedCommand::Command(cmd, args)),
        None => Some(ParsedCommand::Unknown(cmd_name.to_string())),
    }
}

/// Help text listing every command
pub fn help_text() -> String {
    let mut out = String::new();
    for cmd in ChatCommand::all() {
        let usage = match cmd.argument() {
            Some(arg) => format!("{cmd} {arg}"),
            None => cmd.to_string(),
        };
        out.push_str(&format!("  {:<16} {}\n", usage, cmd.description()));
    }
    out.push_str(&format!("  {:<16} {}\n", "//text", "Send /text as a message"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names() {
        assert_eq!(ChatCommand::New.name(), "new");
        assert_eq!(ChatCommand::Older.to_string(), "/older");
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("/new"),
            Some(ParsedCommand::Command(ChatCommand::New, String::new()))
        );
        assert_eq!(
            parse_command("  /image  /tmp/cat.png "),
            Some(ParsedCommand::Command(
                ChatCommand::Image,
                "/tmp/cat.png".to_string()
            ))
        );
        assert_eq!(
            parse_command("/MODEL 2"),
            Some(ParsedCommand::Command(ChatCommand::Model, "2".to_string()))
        );
        assert_eq!(
            parse_command("/frobnicate"),
            Some(ParsedCommand::Unknown("frobnicate".to_string()))
        );
        assert_eq!(parse_command("hello /new"), None);
    }

    #[test]
    fn test_aliases() {
        assert_eq!(ChatCommand::parse("exit"), Some(ChatCommand::Quit));
        assert_eq!(ChatCommand::parse("?"), Some(ChatCommand::Help));
    }

    #[test]
    fn test_matches_prefix() {
        let matches = ChatCommand::matches("c");
        assert_eq!(matches, vec![ChatCommand::Clear, ChatCommand::Copy]);
    }

    #[test]
    fn test_help_lists_every_command() {
        let help = help_text();
        for cmd in ChatCommand::all() {
            assert!(help.contains(&cmd.to_string()));
        }
        assert!(help.contains("//text"));
    }

    #[test]
    fn test_double_slash_is_literal_message() {
        assert_eq!(
            parse_command("//etc/hosts is missing"),
            Some(ParsedCommand::Literal("/etc/hosts is missing".to_string()))
        );
        assert_eq!(
            parse_command("  //new  "),
            Some(ParsedCommand::Literal("/new".to_string()))
        );
        assert_eq!(
            parse_command("///"),
            Some(ParsedCommand::Literal("//".to_string()))
        );
        // A single slash still names a command
        assert_eq!(
            parse_command("/new"),
            Some(ParsedCommand::Command(ChatCommand::New, String::new()))
        );
    }
}
