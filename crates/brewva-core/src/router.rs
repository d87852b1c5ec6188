//! Command router: one input string in, one typed intent out.
//!
//! Commands start with `/`; `@agent` mentions are recognized without one.
//! Anything else is plain conversation and returns `None` so the caller can
//! route it to the focused agent. Validation failures come back as
//! `Intent::Error` with stable messages.

use brewva_registry::{fold_agent_id, is_valid_agent_id};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    NewAgent {
        agent_id: String,
        model: Option<String>,
    },
    Run {
        agent_ids: Vec<String>,
        task: String,
    },
    Discuss {
        agent_ids: Vec<String>,
        topic: String,
        max_rounds: Option<u32>,
    },
    RouteAgent {
        agent_id: String,
        task: String,
        via_mention: bool,
    },
    Focus {
        agent_id: String,
    },
    DeleteAgent {
        agent_id: String,
    },
    List,
    Error {
        message: String,
    },
}

const USAGE_NEW_AGENT: &str = "Usage: /new-agent <name> [model=<model>]";
const USAGE_RUN: &str = "Usage: /run @a,@b <task>";
const USAGE_DISCUSS: &str = "Usage: /discuss @a,@b <topic>";
const USAGE_FOCUS: &str = "Usage: /focus @agent";
const USAGE_DELETE: &str = "Usage: /delete-agent @agent";
const USAGE_MENTION: &str = "Usage: @agent <task>";

fn error(message: impl Into<String>) -> Option<Intent> {
    Some(Intent::Error {
        message: message.into(),
    })
}

/// Parse one inbound message. `None` means plain text with no command or
/// mention in it.
pub fn parse_intent(input: &str) -> Option<Intent> {
    let trimmed = input.trim();
    if let Some(rest) = trimmed.strip_prefix('@') {
        return parse_mention(rest);
    }
    if trimmed.starts_with('/') {
        return parse_command(trimmed);
    }
    None
}

fn parse_command(trimmed: &str) -> Option<Intent> {
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    let cmd = tokens[0].to_lowercase();
    let rest = &tokens[1..];

    match cmd.as_str() {
        "/new-agent" => parse_new_agent(rest),
        "/run" => parse_run(rest),
        "/discuss" => parse_discuss(rest),
        "/focus" => parse_focus(rest),
        "/delete-agent" => parse_delete_agent(rest),
        "/list" => Some(Intent::List),
        _ => error(format!("unknown_command:{}", &cmd[1..])),
    }
}

fn parse_mention(after_at: &str) -> Option<Intent> {
    let mut parts = after_at.split_whitespace();
    let first = parts.next().unwrap_or("");
    let agent_id = fold_agent_id(first.trim_end_matches(','));
    if !is_valid_agent_id(&agent_id) {
        return error(USAGE_MENTION);
    }
    let task = parts.collect::<Vec<_>>().join(" ");
    if task.is_empty() {
        return error(USAGE_MENTION);
    }
    Some(Intent::RouteAgent {
        agent_id,
        task,
        via_mention: true,
    })
}

fn parse_new_agent(rest: &[&str]) -> Option<Intent> {
    let mut name: Option<String> = None;
    let mut model: Option<String> = None;

    let mut i = 0;
    while i < rest.len() {
        let token = rest[i];
        let lower = token.to_lowercase();
        if lower.starts_with("model=") {
            let value = &token["model=".len()..];
            if !value.is_empty() {
                model = Some(value.to_string());
            }
        } else if lower.starts_with("name=") {
            name = Some(token["name=".len()..].trim_end_matches(',').to_string());
        } else if lower == "name"
            && rest
                .get(i + 1)
                .map(|t| t.eq_ignore_ascii_case("is"))
                .unwrap_or(false)
        {
            if let Some(value) = rest.get(i + 2) {
                name = Some(value.trim_end_matches(',').to_string());
            }
            i += 2;
        } else if name.is_none() {
            name = Some(token.trim_end_matches(',').to_string());
        }
        i += 1;
    }

    let Some(name) = name else {
        return error(USAGE_NEW_AGENT);
    };
    let agent_id = fold_agent_id(&name);
    if !is_valid_agent_id(&agent_id) {
        return error(USAGE_NEW_AGENT);
    }
    Some(Intent::NewAgent { agent_id, model })
}

/// Consume a leading `@a,@b` agent list from the tokens. A list continues
/// across tokens only while the previous token ends with a comma, so
/// `@a, @b task` works and `@a task` stops after one agent.
fn parse_agent_list(tokens: &[&str]) -> Option<(Vec<String>, usize)> {
    let mut agents = Vec::new();
    let mut consumed = 0;

    while consumed < tokens.len() {
        if consumed > 0 && !tokens[consumed - 1].ends_with(',') {
            break;
        }
        let token = tokens[consumed];
        if !token.starts_with('@') {
            break;
        }
        for piece in token.split(',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let id = piece.strip_prefix('@')?;
            let folded = fold_agent_id(id);
            if !is_valid_agent_id(&folded) {
                return None;
            }
            agents.push(folded);
        }
        consumed += 1;
    }

    if agents.is_empty() {
        None
    } else {
        Some((agents, consumed))
    }
}

fn parse_run(rest: &[&str]) -> Option<Intent> {
    let Some((agent_ids, consumed)) = parse_agent_list(rest) else {
        return error(USAGE_RUN);
    };
    let task = rest[consumed..].join(" ");
    if task.is_empty() {
        return error(USAGE_RUN);
    }
    Some(Intent::Run { agent_ids, task })
}

fn parse_discuss(rest: &[&str]) -> Option<Intent> {
    let Some((agent_ids, consumed)) = parse_agent_list(rest) else {
        return error(USAGE_DISCUSS);
    };

    let mut max_rounds: Option<u32> = None;
    let mut topic_tokens: Vec<&str> = Vec::new();
    for token in &rest[consumed..] {
        let lower = token.to_lowercase();
        if let Some(value) = lower.strip_prefix("maxrounds=") {
            if let Ok(rounds) = value.parse::<u32>() {
                max_rounds = Some(rounds);
                continue;
            }
        }
        topic_tokens.push(token);
    }

    let topic = topic_tokens.join(" ");
    if topic.is_empty() {
        return error(USAGE_DISCUSS);
    }
    Some(Intent::Discuss {
        agent_ids,
        topic,
        max_rounds,
    })
}

fn parse_focus(rest: &[&str]) -> Option<Intent> {
    let Some(first) = rest.first() else {
        return error(USAGE_FOCUS);
    };
    let Some(id) = first.strip_prefix('@') else {
        return error(USAGE_FOCUS);
    };
    let agent_id = fold_agent_id(id.trim_end_matches(','));
    if !is_valid_agent_id(&agent_id) {
        return error(USAGE_FOCUS);
    }
    Some(Intent::Focus { agent_id })
}

fn parse_delete_agent(rest: &[&str]) -> Option<Intent> {
    let Some(first) = rest.first() else {
        return error(USAGE_DELETE);
    };
    let raw = first.strip_prefix('@').unwrap_or(first);
    let agent_id = fold_agent_id(raw.trim_end_matches(','));
    if !is_valid_agent_id(&agent_id) {
        return error(USAGE_DELETE);
    }
    Some(Intent::DeleteAgent { agent_id })
}
