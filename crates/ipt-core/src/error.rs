use thiserror::Error;

/// Errors produced while turning a line of rule text into a command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("rule needs at least 3 tokens, found {0}")]
    TooShort(usize),

    #[error("{verb} is missing a chain name")]
    MissingChain { verb: &'static str },

    #[error("invalid chain name '{0}'")]
    InvalidChainName(String),

    #[error("{verb} requires a rule index")]
    MissingIndex { verb: &'static str },

    #[error("invalid rule index '{0}'")]
    InvalidIndex(String),

    #[error("-P is missing a policy")]
    MissingPolicy,

    #[error("invalid policy '{0}', expected ACCEPT or DROP")]
    InvalidPolicy(String),

    #[error("unsupported protocol '{0}'")]
    UnsupportedProtocol(String),
}

/// Errors raised against the table itself: lookups and chain traversal
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("chain {0} does not exist")]
    UnknownChain(String),

    #[error("chain {0} already exists")]
    ChainExists(String),

    #[error("chain {from} jumps to {target}, which does not exist")]
    UnknownJumpTarget { from: String, target: String },

    #[error("jump cycle detected: {}", path.join(" -> "))]
    JumpCycle { path: Vec<String> },

    #[error("jump depth limit of {limit} exceeded entering chain {chain}")]
    JumpDepthExceeded { chain: String, limit: usize },
}

impl EngineError {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownChain(_) => "unknown_chain",
            Self::ChainExists(_) => "chain_exists",
            Self::UnknownJumpTarget { .. } => "unknown_jump_target",
            Self::JumpCycle { .. } => "jump_cycle",
            Self::JumpDepthExceeded { .. } => "jump_depth_exceeded",
        }
    }
}
