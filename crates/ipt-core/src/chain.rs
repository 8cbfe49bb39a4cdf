use crate::rule::{Action, Rule, Verdict};

/// Ordered list of rules with a fallback policy.
///
/// Indices are 0-based. Out-of-range indices are no-ops, never errors; the
/// mutating operations return whether the chain changed. Valid positions are
/// `0..=len` for insertion and `0..len` for delete/replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    name: String,
    rules: Vec<Rule>,
    default_policy: Option<Verdict>,
}

impl Chain {
    /// Empty chain without a default policy, as created by `-N`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
            default_policy: None,
        }
    }

    pub fn with_policy(name: impl Into<String>, policy: Verdict) -> Self {
        Self {
            default_policy: Some(policy),
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn default_policy(&self) -> Option<Verdict> {
        self.default_policy
    }

    /// Change the policy used for future insertions and fallback; existing rules keep their action
    pub fn set_default_policy(&mut self, policy: Verdict) {
        self.default_policy = Some(policy);
    }

    // an unset action is resolved once, here, against the current default policy
    fn resolve_action(&self, rule: &mut Rule) {
        if rule.action.is_none() {
            rule.action = self.default_policy.map(Action::from);
        }
    }

    pub fn append_rule(&mut self, mut rule: Rule) {
        self.resolve_action(&mut rule);
        self.rules.push(rule);
    }

    /// Insert before the rule currently at `index`; `index == len` appends
    pub fn insert_at_index(&mut self, mut rule: Rule, index: usize) -> bool {
        if index > self.rules.len() {
            tracing::debug!(chain = %self.name, index, len = self.rules.len(), "insert index out of range");
            return false;
        }
        self.resolve_action(&mut rule);
        self.rules.insert(index, rule);
        true
    }

    pub fn delete_at_index(&mut self, index: usize) -> bool {
        if index >= self.rules.len() {
            tracing::debug!(chain = %self.name, index, len = self.rules.len(), "delete index out of range");
            return false;
        }
        self.rules.remove(index);
        true
    }

    /// Remove the first rule structurally equal to `rule`
    pub fn delete_matching_rule(&mut self, rule: &Rule) -> bool {
        match self.rules.iter().position(|r| r.matches_rule(rule)) {
            Some(index) => {
                self.rules.remove(index);
                true
            }
            None => {
                tracing::debug!(chain = %self.name, rule = %rule, "no rule equal to delete target");
                false
            }
        }
    }

    pub fn replace_at_index(&mut self, mut rule: Rule, index: usize) -> bool {
        if index >= self.rules.len() {
            tracing::debug!(chain = %self.name, index, len = self.rules.len(), "replace index out of range");
            return false;
        }
        self.resolve_action(&mut rule);
        self.rules[index] = rule;
        true
    }

    /// Remove all rules; the default policy is kept
    pub fn flush(&mut self) {
        self.rules.clear();
    }

    /// Overwrite the action of every present rule with `policy`.
    ///
    /// The default policy applied to later insertions is not touched.
    pub fn change_policy(&mut self, policy: Verdict) {
        for rule in &mut self.rules {
            rule.action = Some(Action::from(policy));
        }
    }
}
