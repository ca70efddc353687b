//! Operator command parsing.
//!
//! Block numbers are 0-based, matching the block indices shown by `/blocks`.

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Help,
    /// List configured blocks.
    Blocks,
    /// Show the prompts of one block.
    Block { index: usize },
    /// Every participant's answers.
    Results,
    /// One participant's answers.
    Answers { identity: String },
    /// Force-activate a block for everyone, or for one participant.
    RunBlock {
        index: usize,
        identity: Option<String>,
    },
    /// Poem status, for one team or all.
    Poems { team: Option<String> },
    /// End the event now.
    Finish,
    /// Push the answers to the configured sinks.
    Export,
    /// Recognized command with bad arguments.
    Usage { usage: &'static str },
}

impl AdminCommand {
    /// Parse `text` as an operator command. Returns `None` for anything that
    /// isn't one, so ordinary input falls through to the quest flow.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if !trimmed.starts_with('/') {
            return None;
        }
        let mut parts = trimmed.split_whitespace();
        let head = parts.next()?.to_lowercase();
        // Telegram appends @botname to commands in groups.
        let name = head.split('@').next().unwrap_or(&head);
        let args: Vec<&str> = parts.collect();

        let command = match name {
            "/help_admin" => Self::Help,
            "/blocks" | "/quiz_list" => Self::Blocks,
            "/block" => parse_block(&args),
            "/results" => Self::Results,
            "/answers" => match args.as_slice() {
                [identity] => Self::Answers {
                    identity: identity.to_string(),
                },
                _ => Self::Usage {
                    usage: "/answers <participant id>",
                },
            },
            "/run_block" => parse_run_block(&args),
            "/poems" => Self::Poems {
                team: args.first().map(|t| t.to_string()),
            },
            "/finish" => Self::Finish,
            "/export" => Self::Export,
            _ => return None,
        };
        Some(command)
    }
}

/// `/block <n>`
fn parse_block(args: &[&str]) -> AdminCommand {
    match args {
        [n] => match n.parse() {
            Ok(index) => AdminCommand::Block { index },
            Err(_) => AdminCommand::Usage {
                usage: "/block <block number>",
            },
        },
        _ => AdminCommand::Usage {
            usage: "/block <block number>",
        },
    }
}

/// `/run_block <n> [participant id]`
fn parse_run_block(args: &[&str]) -> AdminCommand {
    const USAGE: &str = "/run_block <block number> [participant id]";
    let Some(index) = args.first().and_then(|n| n.parse().ok()) else {
        return AdminCommand::Usage { usage: USAGE };
    };
    match args.len() {
        1 => AdminCommand::RunBlock {
            index,
            identity: None,
        },
        2 => AdminCommand::RunBlock {
            index,
            identity: Some(args[1].to_string()),
        },
        _ => AdminCommand::Usage { usage: USAGE },
    }
}

/// Help text for `/help_admin`.
pub fn help_text() -> String {
    "👩‍💼 Operator commands:\n\n\
     /blocks — list blocks\n\
     /block N — prompts of block N\n\
     /results — all recorded answers\n\
     /answers ID — one participant's answers\n\
     /run_block N [ID] — open block N for everyone or one participant\n\
     /poems [TEAM] — team poem status\n\
     /finish — end the event now\n\
     /export — push answers to the export sinks\n\
     /help_admin — this list"
        .to_string()
}
