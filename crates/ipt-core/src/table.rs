//! Chains by name plus established-connection state.
//!
//! Rule loading mutates the table (`&mut self`); evaluation only reads the
//! chains and writes to the connection tracker, so a loaded table can be
//! shared between threads.

use crate::chain::Chain;
use crate::conntrack::{ConnTrack, FlowKey};
use crate::error::{EngineError, ParseError};
use crate::packet::PacketView;
use crate::parser::Command;
use crate::rule::{Action, Verdict};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOptions {
    /// Maximum number of nested jumps below the evaluated chain
    pub max_jump_depth: usize,
    /// Verdict when the evaluated chain ends without a policy and nothing matched
    pub implicit_policy: Verdict,
    /// Bound on tracked flows; `None` keeps every flow
    pub conntrack_capacity: Option<usize>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            max_jump_depth: 32,
            implicit_policy: Verdict::Accept,
            conntrack_capacity: None,
        }
    }
}

/// Why a rule-file line was not applied
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Reference(#[from] EngineError),
}

impl SkipReason {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::Reference(_) => "reference",
        }
    }
}

#[derive(Debug)]
pub struct SkippedLine {
    /// 1-based line number in the source
    pub line: usize,
    pub text: String,
    pub reason: SkipReason,
}

/// Outcome of loading a rule source
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Commands that changed the table
    pub applied: usize,
    /// Commands that were valid but had no effect (out-of-range index, no matching rule)
    pub unchanged: usize,
    pub skipped: Vec<SkippedLine>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// A LOG rule that matched during evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub chain: String,
    /// 1-based position of the LOG rule in its chain
    pub position: usize,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub logs: Vec<LogRecord>,
}

#[derive(Debug)]
pub struct Table {
    chains: HashMap<String, Chain>,
    conntrack: ConnTrack,
    options: TableOptions,
}

impl Table {
    pub fn new() -> Self {
        Self::with_options(TableOptions::default())
    }

    pub fn with_options(options: TableOptions) -> Self {
        let conntrack = match options.conntrack_capacity {
            Some(capacity) => ConnTrack::with_capacity_limit(capacity),
            None => ConnTrack::new(),
        };
        Self {
            chains: HashMap::new(),
            conntrack,
            options,
        }
    }

    pub fn add_chain(&mut self, chain: Chain) -> Result<(), EngineError> {
        if self.chains.contains_key(chain.name()) {
            return Err(EngineError::ChainExists(chain.name().to_string()));
        }
        self.chains.insert(chain.name().to_string(), chain);
        Ok(())
    }

    pub fn get_chain_by_name(&self, name: &str) -> Option<&Chain> {
        self.chains.get(name)
    }

    /// All chains, sorted by name
    pub fn chains(&self) -> Vec<&Chain> {
        let mut chains: Vec<&Chain> = self.chains.values().collect();
        chains.sort_by(|a, b| a.name().cmp(b.name()));
        chains
    }

    pub fn conntrack(&self) -> &ConnTrack {
        &self.conntrack
    }

    /// Membership test on a `src_addr src_port dst_addr dst_port` token
    pub fn is_established_connection(&self, flow_key: &str) -> bool {
        self.conntrack.contains(flow_key)
    }

    fn chain_for_update(&mut self, name: &str) -> Result<&mut Chain, EngineError> {
        self.chains
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownChain(name.to_string()))
    }

    /// Apply one parsed command. Returns whether the table changed.
    pub fn apply(&mut self, command: Command) -> Result<bool, EngineError> {
        match command {
            Command::NewChain { chain } => {
                self.add_chain(Chain::new(chain))?;
                Ok(true)
            }
            Command::SetPolicy { chain, policy } => {
                self.chain_for_update(&chain)?.set_default_policy(policy);
                Ok(true)
            }
            Command::Flush { chain: None } => {
                for chain in self.chains.values_mut() {
                    chain.flush();
                }
                Ok(true)
            }
            Command::Flush { chain: Some(chain) } => {
                self.chain_for_update(&chain)?.flush();
                Ok(true)
            }
            Command::Append { chain, rule } => {
                self.chain_for_update(&chain)?.append_rule(rule);
                Ok(true)
            }
            Command::Insert {
                chain,
                position,
                rule,
            } => {
                let chain = self.chain_for_update(&chain)?;
                Ok(match position.checked_sub(1) {
                    Some(index) => chain.insert_at_index(rule, index),
                    None => false,
                })
            }
            Command::DeleteAt { chain, position } => {
                let chain = self.chain_for_update(&chain)?;
                Ok(match position.checked_sub(1) {
                    Some(index) => chain.delete_at_index(index),
                    None => false,
                })
            }
            Command::DeleteMatching { chain, rule } => {
                Ok(self.chain_for_update(&chain)?.delete_matching_rule(&rule))
            }
            Command::Replace {
                chain,
                position,
                rule,
            } => {
                let chain = self.chain_for_update(&chain)?;
                Ok(match position.checked_sub(1) {
                    Some(index) => chain.replace_at_index(rule, index),
                    None => false,
                })
            }
        }
    }

    /// Load commands from a rule file, one per line
    pub fn load_rules(&mut self, path: impl AsRef<Path>) -> Result<LoadReport> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading rules");

        let file =
            File::open(path).with_context(|| format!("Failed to open rules file {:?}", path))?;
        self.load_rules_from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to load rules from {:?}", path))
    }

    /// Load commands from any line source. Stops at the first read error;
    /// lines before it stay applied.
    pub fn load_rules_from_reader<R: BufRead>(&mut self, reader: R) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read line {}", idx + 1))?;
            self.load_line(idx + 1, &line, &mut report);
        }
        Ok(report)
    }

    pub fn load_rules_from_str(&mut self, text: &str) -> LoadReport {
        let mut report = LoadReport::default();
        for (idx, line) in text.lines().enumerate() {
            self.load_line(idx + 1, line, &mut report);
        }
        report
    }

    fn load_line(&mut self, line_no: usize, line: &str, report: &mut LoadReport) {
        let command = match Command::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return,
            Err(err) => {
                warn!(line = line_no, error = %err, "skipping malformed rule line");
                report.skipped.push(SkippedLine {
                    line: line_no,
                    text: line.to_string(),
                    reason: err.into(),
                });
                return;
            }
        };

        let verb = command.verb();
        match self.apply(command) {
            Ok(true) => report.applied += 1,
            Ok(false) => {
                debug!(line = line_no, verb = verb.flag(), "command had no effect");
                report.unchanged += 1;
            }
            Err(err) => {
                warn!(line = line_no, verb = verb.flag(), error = %err, "skipping rule line");
                report.skipped.push(SkippedLine {
                    line: line_no,
                    text: line.to_string(),
                    reason: err.into(),
                });
            }
        }
    }

    /// Evaluate `chain_name` against a packet.
    ///
    /// An ACCEPT on a packet with network and transport layers records its
    /// flow as established. Traversal errors (missing jump target, cycle,
    /// depth limit) abort the walk without touching connection state.
    pub fn evaluate<P: PacketView + ?Sized>(
        &self,
        chain_name: &str,
        packet: &P,
    ) -> Result<Evaluation, EngineError> {
        let chain = self
            .chains
            .get(chain_name)
            .ok_or_else(|| EngineError::UnknownChain(chain_name.to_string()))?;

        let mut path = vec![chain_name.to_string()];
        let mut logs = Vec::new();
        let verdict = self
            .walk(chain, packet, &mut path, &mut logs)?
            .unwrap_or(self.options.implicit_policy);

        if verdict == Verdict::Accept {
            if let Some(key) = FlowKey::from_packet(packet) {
                if self.conntrack.record(&key) {
                    debug!(flow = %key, "recorded established connection");
                }
            }
        }

        Ok(Evaluation { verdict, logs })
    }

    /// Evaluate and return only the verdict; traversal errors are logged and yield DROP
    pub fn process_chain<P: PacketView + ?Sized>(&self, chain_name: &str, packet: &P) -> Verdict {
        match self.evaluate(chain_name, packet) {
            Ok(evaluation) => evaluation.verdict,
            Err(err) => {
                error!(chain = chain_name, kind = err.kind(), error = %err, "evaluation aborted");
                Verdict::Drop
            }
        }
    }

    /// Walk one chain. `None` means the packet fell off the end of a chain
    /// without a default policy; a jumping caller then resumes after the jump.
    fn walk<P: PacketView + ?Sized>(
        &self,
        chain: &Chain,
        packet: &P,
        path: &mut Vec<String>,
        logs: &mut Vec<LogRecord>,
    ) -> Result<Option<Verdict>, EngineError> {
        for (idx, rule) in chain.rules().iter().enumerate() {
            if !rule.matches(packet, &self.conntrack) {
                continue;
            }

            match &rule.action {
                Some(Action::Accept) => return Ok(Some(Verdict::Accept)),
                Some(Action::Drop) | Some(Action::Reject) => return Ok(Some(Verdict::Drop)),
                Some(Action::Log { prefix }) => {
                    let flow = FlowKey::from_packet(packet).map(|key| key.token());
                    info!(
                        target: "iptsim::log",
                        prefix = %prefix,
                        chain = chain.name(),
                        rule = idx + 1,
                        flow = flow.as_deref().unwrap_or("-"),
                        "packet logged"
                    );
                    logs.push(LogRecord {
                        chain: chain.name().to_string(),
                        position: idx + 1,
                        prefix: prefix.clone(),
                    });
                }
                Some(Action::Jump { target }) => {
                    let next = self.chains.get(target.as_str()).ok_or_else(|| {
                        EngineError::UnknownJumpTarget {
                            from: chain.name().to_string(),
                            target: target.clone(),
                        }
                    })?;
                    if path.iter().any(|visited| visited == target) {
                        let mut cycle = path.clone();
                        cycle.push(target.clone());
                        return Err(EngineError::JumpCycle { path: cycle });
                    }
                    if path.len() > self.options.max_jump_depth {
                        return Err(EngineError::JumpDepthExceeded {
                            chain: target.clone(),
                            limit: self.options.max_jump_depth,
                        });
                    }

                    path.push(target.clone());
                    let verdict = self.walk(next, packet, path, logs)?;
                    path.pop();

                    match verdict {
                        Some(verdict) => return Ok(Some(verdict)),
                        None => debug!(
                            chain = chain.name(),
                            target = target.as_str(),
                            "returned from chain without policy"
                        ),
                    }
                }
                None => {
                    warn!(
                        chain = chain.name(),
                        rule = idx + 1,
                        "rule has no action and its chain has no default policy, ignoring"
                    );
                }
            }
        }

        Ok(chain.default_policy())
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}
