//! Batches runs of same-selector policies into shared chains.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chain_render_common::{Action, Chain, ChainRule, MatchCriteria};
use serde::Serialize;
use sha2::{Digest, Sha224};

use crate::{
    nflog::RuleDirection, policy_chain_name, rule::is_staged_name, PolicyId, Renderer,
    POLICY_GROUP_INBOUND_PFX, POLICY_GROUP_OUTBOUND_PFX, POLICY_INBOUND_PFX, POLICY_OUTBOUND_PFX,
};

/// A group chain returns early on a verdict at most every this many jumps.
const RETURN_STRIDE: usize = 5;

/// Consecutive policies of one tier and direction sharing a selector.
///
/// Same selector means same set of endpoints, so the group can be jumped to as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyGroup {
    tier: String,
    direction: RuleDirection,
    policy_names: Vec<String>,
    selector: String,
    unique_id: String,
}

impl PolicyGroup {
    pub fn new(
        tier: impl Into<String>,
        direction: RuleDirection,
        policy_names: Vec<String>,
        selector: impl Into<String>,
    ) -> Self {
        let tier = tier.into();
        let selector = selector.into();
        let unique_id = compute_unique_id(&tier, direction, &policy_names, &selector);
        Self {
            tier,
            direction,
            policy_names,
            selector,
            unique_id,
        }
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }

    pub fn direction(&self) -> RuleDirection {
        self.direction
    }

    pub fn policy_names(&self) -> &[String] {
        &self.policy_names
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Stable hash of everything that defines the group.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Single-policy groups jump straight to the policy chain.
    pub fn should_be_inlined(&self) -> bool {
        self.policy_names.len() <= 1
    }

    pub fn has_non_staged_policies(&self) -> bool {
        self.policy_names.iter().any(|name| !is_staged_name(name))
    }

    /// The chain an endpoint chain jumps to for this group.
    pub fn chain_name(&self, max_len: usize) -> String {
        match self.policy_names.as_slice() {
            [name] => self.policy_chain_name(name, max_len),
            _ => {
                let prefix = match self.direction {
                    RuleDirection::Ingress => POLICY_GROUP_INBOUND_PFX,
                    RuleDirection::Egress => POLICY_GROUP_OUTBOUND_PFX,
                };
                let mut name = format!("{prefix}{}", self.unique_id);
                name.truncate(max_len);
                name
            }
        }
    }

    fn policy_chain_name(&self, policy_name: &str, max_len: usize) -> String {
        let prefix = match self.direction {
            RuleDirection::Ingress => POLICY_INBOUND_PFX,
            RuleDirection::Egress => POLICY_OUTBOUND_PFX,
        };
        policy_chain_name(prefix, &PolicyId::new(&self.tier, policy_name), max_len)
    }
}

// Every field is newline terminated so ("aaa", "bbb") and ("aaab", "bb") differ.
fn compute_unique_id(
    tier: &str,
    direction: RuleDirection,
    policy_names: &[String],
    selector: &str,
) -> String {
    let mut hasher = Sha224::new();
    for field in [tier, selector, direction.as_str()] {
        hasher.update(field.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(policy_names.len().to_string().as_bytes());
    hasher.update(b"\n");
    for name in policy_names {
        hasher.update(name.as_bytes());
        hasher.update(b"\n");
    }
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Policy groups of one tier, per direction, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TierPolicyGroups {
    pub name: String,
    pub ingress: Vec<PolicyGroup>,
    pub egress: Vec<PolicyGroup>,
}

impl TierPolicyGroups {
    pub(crate) fn groups(&self, direction: RuleDirection) -> &[PolicyGroup] {
        match direction {
            RuleDirection::Ingress => &self.ingress,
            RuleDirection::Egress => &self.egress,
        }
    }
}

/// Splits ordered `(policy name, selector)` pairs into maximal runs with equal selectors.
pub fn group_policies(
    tier: &str,
    direction: RuleDirection,
    policies: &[(&str, &str)],
) -> Vec<PolicyGroup> {
    let mut groups = Vec::new();
    let mut names: Vec<String> = Vec::new();
    let mut current_selector: Option<&str> = None;
    for &(name, selector) in policies {
        if current_selector.map_or(false, |current| current != selector) {
            groups.push(PolicyGroup::new(
                tier,
                direction,
                std::mem::take(&mut names),
                current_selector.unwrap_or_default(),
            ));
        }
        current_selector = Some(selector);
        names.push(name.to_string());
    }
    if let Some(selector) = current_selector {
        groups.push(PolicyGroup::new(tier, direction, names, selector));
    }
    groups
}

impl Renderer {
    /// The shared chain of a multi-policy group.
    ///
    /// Each jump after the first is skipped once an earlier policy set accept or pass,
    /// and every [RETURN_STRIDE] jumps the chain returns on a verdict, but only if a
    /// non-staged policy since the last return could have set one.
    pub fn policy_group_to_chain(&self, group: &PolicyGroup) -> Chain {
        let marks = &self.config.marks;
        let verdict = marks.accept | marks.pass;
        let mut rules = Vec::new();
        let mut verdict_possible = false;
        for (index, name) in group.policy_names.iter().enumerate() {
            let at_stride = index % RETURN_STRIDE == 0;
            if index > 0 && at_stride && verdict_possible {
                rules.push(
                    ChainRule::new(MatchCriteria::new().mark_not_clear(verdict), Action::Return)
                        .with_comment("Return on verdict"),
                );
                verdict_possible = false;
            }
            let match_criteria = if at_stride {
                MatchCriteria::new()
            } else {
                MatchCriteria::new().mark_clear(verdict)
            };
            rules.push(ChainRule::new(
                match_criteria,
                Action::jump(group.policy_chain_name(name, self.max_chain_name_length)),
            ));
            if !is_staged_name(name) {
                verdict_possible = true;
            }
        }
        Chain::new(group.chain_name(self.max_chain_name_length), rules)
    }
}
