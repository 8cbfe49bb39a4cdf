//! Rule-file command parsing.
//!
//! One line holds one command: a verb (`-A`, `-I`, ...), its chain/index
//! operands and, for rule-carrying verbs, the match flags. Text after `#`
//! is a comment. The flag grammar is permissive: unknown flags and
//! unsupported match modules are skipped.

use crate::error::ParseError;
use crate::rule::{Action, Rule, Verdict};
use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

static VERB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:^|\s)(-[PNFAIDR]|--policy|--new-chain|--flush|--append|--insert|--delete|--replace)(?:\s|$)",
    )
    .expect("verb pattern is valid")
});

static CHAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9_-]{2,}$").expect("chain pattern is valid"));

static LOG_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"--log-prefix\s+(?:"([^"]*)"|(\S+))"#).expect("log prefix pattern is valid")
});

/// Built-in targets; any other `-j` operand names a chain to jump to
const ACCEPT_TARGET: &str = "ACCEPT";
const DROP_TARGET: &str = "DROP";
const REJECT_TARGET: &str = "REJECT";
const LOG_TARGET: &str = "LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Policy,
    NewChain,
    Flush,
    Append,
    Insert,
    Delete,
    Replace,
}

impl Verb {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "-P" | "--policy" => Some(Self::Policy),
            "-N" | "--new-chain" => Some(Self::NewChain),
            "-F" | "--flush" => Some(Self::Flush),
            "-A" | "--append" => Some(Self::Append),
            "-I" | "--insert" => Some(Self::Insert),
            "-D" | "--delete" => Some(Self::Delete),
            "-R" | "--replace" => Some(Self::Replace),
            _ => None,
        }
    }

    pub fn flag(&self) -> &'static str {
        match self {
            Self::Policy => "-P",
            Self::NewChain => "-N",
            Self::Flush => "-F",
            Self::Append => "-A",
            Self::Insert => "-I",
            Self::Delete => "-D",
            Self::Replace => "-R",
        }
    }
}

/// A parsed rule-file line. Positions are 1-based, as written in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    NewChain { chain: String },
    SetPolicy { chain: String, policy: Verdict },
    /// Flush one chain, or every chain when `chain` is `None`
    Flush { chain: Option<String> },
    Append { chain: String, rule: Rule },
    Insert { chain: String, position: usize, rule: Rule },
    DeleteAt { chain: String, position: usize },
    DeleteMatching { chain: String, rule: Rule },
    Replace { chain: String, position: usize, rule: Rule },
}

impl Command {
    /// Parse one line of a rule file.
    ///
    /// Returns `Ok(None)` for blank/comment-only lines and lines without a
    /// verb; those are skipped without a diagnostic.
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let line = strip_comment(line);
        if line.is_empty() {
            return Ok(None);
        }

        let Some(verb_match) = VERB_RE.captures(line).and_then(|caps| caps.get(1)) else {
            return Ok(None);
        };
        let Some(verb) = Verb::from_token(verb_match.as_str()) else {
            return Ok(None);
        };

        let text = &line[verb_match.start()..];
        let operands: Vec<&str> = text.split_whitespace().skip(1).collect();

        let command = match verb {
            Verb::Flush => match operands.first() {
                Some(token) => Self::Flush {
                    chain: Some(chain_name(token)?),
                },
                None => Self::Flush { chain: None },
            },
            Verb::NewChain => Self::NewChain {
                chain: required_chain(verb, &operands)?,
            },
            Verb::Policy => {
                let chain = required_chain(verb, &operands)?;
                let policy = operands.get(1).ok_or(ParseError::MissingPolicy)?.parse()?;
                Self::SetPolicy { chain, policy }
            }
            Verb::Append => Self::Append {
                chain: required_chain(verb, &operands)?,
                rule: parse_rule(text)?,
            },
            Verb::Insert => {
                let chain = required_chain(verb, &operands)?;
                // iptables inserts at the head when no index is given
                let position = match operands.get(1) {
                    Some(token) if is_index(token) => parse_index(token)?,
                    _ => 1,
                };
                Self::Insert {
                    chain,
                    position,
                    rule: parse_rule(text)?,
                }
            }
            Verb::Delete => {
                let chain = required_chain(verb, &operands)?;
                match operands.get(1) {
                    Some(token) if is_index(token) => Self::DeleteAt {
                        chain,
                        position: parse_index(token)?,
                    },
                    _ => Self::DeleteMatching {
                        chain,
                        rule: parse_rule(text)?,
                    },
                }
            }
            Verb::Replace => {
                let chain = required_chain(verb, &operands)?;
                let position = match operands.get(1) {
                    Some(token) if is_index(token) => parse_index(token)?,
                    _ => return Err(ParseError::MissingIndex { verb: verb.flag() }),
                };
                Self::Replace {
                    chain,
                    position,
                    rule: parse_rule(text)?,
                }
            }
        };

        Ok(Some(command))
    }

    pub fn verb(&self) -> Verb {
        match self {
            Self::NewChain { .. } => Verb::NewChain,
            Self::SetPolicy { .. } => Verb::Policy,
            Self::Flush { .. } => Verb::Flush,
            Self::Append { .. } => Verb::Append,
            Self::Insert { .. } => Verb::Insert,
            Self::DeleteAt { .. } | Self::DeleteMatching { .. } => Verb::Delete,
            Self::Replace { .. } => Verb::Replace,
        }
    }
}

/// Parse the match flags and target of a rule command such as
/// `-A INPUT -p tcp --dport 22 -j DROP`.
///
/// The first two tokens (verb and chain) are not inspected. Fails only when
/// the line has fewer than 3 tokens or names an unsupported protocol.
pub fn parse_rule(line: &str) -> Result<Rule, ParseError> {
    let line = strip_comment(line);
    let token_count = line.split_whitespace().count();
    if token_count < 3 {
        return Err(ParseError::TooShort(token_count));
    }

    // the prefix may contain spaces or flag-like words, so take it out before tokenizing
    let (body, log_prefix) = split_log_prefix(line);
    let tokens: Vec<&str> = body.split_whitespace().collect();

    let mut rule = Rule::new();
    let mut i = 2;
    while i < tokens.len() {
        let value = tokens.get(i + 1).copied();
        match (tokens[i], value) {
            ("-p" | "--protocol", Some(proto)) => {
                rule.protocol = proto.parse()?;
                i += 2;
            }
            ("-s" | "--source", Some(addr)) => {
                rule.src_addr = Some(addr.to_string());
                i += 2;
            }
            ("-d" | "--destination", Some(addr)) => {
                rule.dst_addr = Some(addr.to_string());
                i += 2;
            }
            ("--sport" | "--source-port", Some(port)) => {
                rule.src_port = Some(port.to_string());
                i += 2;
            }
            ("--dport" | "--destination-port", Some(port)) => {
                rule.dst_port = Some(port.to_string());
                i += 2;
            }
            ("-i" | "--in-interface", Some(iface)) => {
                rule.in_interface = Some(iface.to_string());
                i += 2;
            }
            ("-o" | "--out-interface", Some(iface)) => {
                rule.out_interface = Some(iface.to_string());
                i += 2;
            }
            ("-j" | "--jump", Some(target)) => {
                rule.action = Some(resolve_target(target, log_prefix.as_deref()));
                i += 2;
            }
            ("-m" | "--match", Some(module)) => {
                if module == "conntrack" && wants_established(&tokens[i + 2..]) {
                    rule.require_established = true;
                    i += 4;
                } else {
                    i += 2;
                }
            }
            _ => i += 1,
        }
    }

    Ok(rule)
}

/// Drop everything after `#` and surrounding whitespace
pub fn strip_comment(line: &str) -> &str {
    line.split('#').next().unwrap_or_default().trim()
}

fn split_log_prefix(line: &str) -> (Cow<'_, str>, Option<String>) {
    let Some(caps) = LOG_PREFIX_RE.captures(line) else {
        return (Cow::Borrowed(line), None);
    };
    let prefix = caps
        .get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string());
    (LOG_PREFIX_RE.replace(line, " "), prefix)
}

fn resolve_target(target: &str, log_prefix: Option<&str>) -> Action {
    match target {
        ACCEPT_TARGET => Action::Accept,
        DROP_TARGET => Action::Drop,
        REJECT_TARGET => Action::Reject,
        LOG_TARGET => Action::Log {
            prefix: log_prefix.unwrap_or_default().to_string(),
        },
        chain => Action::Jump {
            target: chain.to_string(),
        },
    }
}

/// `--ctstate ESTABLISHED` (possibly within a comma list) following `-m conntrack`
fn wants_established(rest: &[&str]) -> bool {
    match rest {
        ["--ctstate", states, ..] => states.split(',').any(|state| state == "ESTABLISHED"),
        _ => false,
    }
}

fn required_chain(verb: Verb, operands: &[&str]) -> Result<String, ParseError> {
    let token = operands
        .first()
        .ok_or(ParseError::MissingChain { verb: verb.flag() })?;
    chain_name(token)
}

/// Chain identifiers are upper-case tokens of at least 3 characters
fn chain_name(token: &str) -> Result<String, ParseError> {
    if CHAIN_RE.is_match(token) {
        Ok(token.to_string())
    } else {
        Err(ParseError::InvalidChainName(token.to_string()))
    }
}

fn is_index(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

fn parse_index(token: &str) -> Result<usize, ParseError> {
    token
        .parse()
        .map_err(|_| ParseError::InvalidIndex(token.to_string()))
}
