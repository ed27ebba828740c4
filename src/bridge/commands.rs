//! Control-channel command grammar.

use super::platform::ChannelHandle;
use once_cell::sync::Lazy;
use regex::Regex;

static CHANNEL_MENTION: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"<#(\d+)>").ok());

pub const HELP_TEXT: &str = "\
Commands:
`start <number with country code or name>`: Starts a new conversation.
`list`: Lists existing chats.
`list <chat name to search>`: Finds chats that contain the given argument.
`addToWhitelist <channel mention>` (or `whitelist add`): Adds the specified conversation to the whitelist.
`removeFromWhitelist <channel mention>` (or `whitelist remove`): Removes the specified conversation from the whitelist.
`listWhitelist` (or `whitelist list`): Lists all whitelisted conversations.
`enableDCPrefix` / `disableDCPrefix`: Prepend your Discord nickname to messages sent to WhatsApp.
`enableWAPrefix` / `disableWAPrefix`: Prepend the sender's name to group messages relayed to Discord.
`resync`: Re-reads contacts and groups from WhatsApp.
`status`: Shows the WhatsApp session state.
`ping`: Replies with pong.
`help`: Shows this message.";

/// Who `start` should open a conversation with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartTarget {
    /// Phone number, already expanded to a remote ID.
    Number(String),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(StartTarget),
    List(Option<String>),
    WhitelistAdd(Vec<ChannelHandle>),
    WhitelistRemove(Vec<ChannelHandle>),
    WhitelistList,
    SetDiscordPrefix(bool),
    SetGroupPrefix(bool),
    Resync,
    Status,
    Ping,
    Help,
    /// Known command with missing or malformed arguments.
    Usage(&'static str),
    Unknown(String),
}

impl Command {
    /// Parse a control-channel message. The command word is case-insensitive.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        let (word, rest) = match input.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (input, ""),
        };

        match word.to_lowercase().as_str() {
            "start" => parse_start(rest),
            "list" => Self::List(Some(rest.to_string()).filter(|r| !r.is_empty())),
            "addtowhitelist" => mentions(rest, Self::WhitelistAdd, "addToWhitelist <channel mention>"),
            "removefromwhitelist" => mentions(
                rest,
                Self::WhitelistRemove,
                "removeFromWhitelist <channel mention>",
            ),
            "listwhitelist" => Self::WhitelistList,
            "whitelist" => parse_whitelist(rest),
            "enabledcprefix" => Self::SetDiscordPrefix(true),
            "disabledcprefix" => Self::SetDiscordPrefix(false),
            "enablewaprefix" => Self::SetGroupPrefix(true),
            "disablewaprefix" => Self::SetGroupPrefix(false),
            "resync" => Self::Resync,
            "status" => Self::Status,
            "ping" => Self::Ping,
            "help" => Self::Help,
            _ => Self::Unknown(word.to_string()),
        }
    }
}

fn parse_start(rest: &str) -> Command {
    if rest.is_empty() {
        return Command::Usage("start <number with country code or name>");
    }
    let number: String = rest
        .strip_prefix('+')
        .unwrap_or(rest)
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect();
    if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
        Command::Start(StartTarget::Number(format!("{number}@s.whatsapp.net")))
    } else {
        Command::Start(StartTarget::Name(rest.to_string()))
    }
}

fn parse_whitelist(rest: &str) -> Command {
    let (sub, args) = match rest.split_once(char::is_whitespace) {
        Some((sub, args)) => (sub, args),
        None => (rest, ""),
    };
    match sub.to_lowercase().as_str() {
        "add" => mentions(args, Command::WhitelistAdd, "whitelist add <channel mention>"),
        "remove" => mentions(args, Command::WhitelistRemove, "whitelist remove <channel mention>"),
        "list" | "" => Command::WhitelistList,
        _ => Command::Usage("whitelist <add|remove|list> [channel mention]"),
    }
}

fn mentions(
    text: &str,
    build: fn(Vec<ChannelHandle>) -> Command,
    usage: &'static str,
) -> Command {
    let Some(pattern) = CHANNEL_MENTION.as_ref() else {
        return Command::Usage(usage);
    };
    let channels: Vec<ChannelHandle> = pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .map(ChannelHandle)
        .collect();
    if channels.is_empty() {
        Command::Usage(usage)
    } else {
        build(channels)
    }
}
