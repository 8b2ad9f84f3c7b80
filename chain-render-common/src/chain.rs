use serde::Serialize;

use crate::{Action, MatchCriteria};

/// A concrete filter rule: match, optional action, comments.
///
/// A rule without an action only carries its comments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ChainRule {
    pub match_criteria: MatchCriteria,
    pub action: Option<Action>,
    pub comments: Vec<String>,
}

impl ChainRule {
    pub fn new(match_criteria: MatchCriteria, action: Action) -> Self {
        Self {
            match_criteria,
            action: Some(action),
            comments: Vec::new(),
        }
    }

    /// A rule matching every packet.
    pub fn always(action: Action) -> Self {
        Self::new(MatchCriteria::new(), action)
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comments.push(comment.into());
        self
    }

    pub fn with_comments(self, comments: Vec<String>) -> Self {
        Self { comments, ..self }
    }
}

/// A named, ordered list of rules.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Chain {
    pub name: String,
    pub rules: Vec<ChainRule>,
}

impl Chain {
    pub fn new(name: impl Into<String>, rules: Vec<ChainRule>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }
}
