
use chain_render_common::{Action, ChainRule, MatchCriteria};

use crate::{
    config::{
        AllowAction, Config, DnsPolicyMode, EndpointToHostAction, FilterDenyAction,
        ServiceLoopPrevention,
    },
    Error, IpSetNamer, Result,
};

const DROP_LOG_PREFIX: &str = "calico-drop";

/// Renders policy, endpoint and static chains for one validated [Config].
///
/// Construction does all validation; every render method afterwards is infallible and
/// depends on nothing but its arguments and the config.
#[derive(Debug, Clone)]
pub struct Renderer {
    pub(crate) config: Config,
    pub(crate) ip_sets: IpSetNamer,
    pub(crate) max_chain_name_length: usize,
    /// Every mark bit the static chains may clear in one go.
    pub(crate) all_mark_bits: u32,
    deny_action: Action,
    drop_rules: Vec<ChainRule>,
    nfqueue_rule: Option<ChainRule>,
    filter_allow_action: Action,
    mangle_allow_action: Action,
    input_accept_actions: Vec<Action>,
    block_cidr_action: Option<Action>,
}

impl Renderer {
    pub fn new(config: Config) -> Result<Self> {
        config
            .marks
            .validate(|field| config.mark_requirement(field))?;

        let marks = &config.marks;
        if marks.dns_policy != 0
            && config.dns_policy_mode == DnsPolicyMode::DelayDeniedPacket
            && config.dns_policy_nfqueue_id == 0
        {
            return Err(Error::DnsNfqueueIdUnset);
        }
        let bad_failsafe = config
            .failsafe_inbound_host_ports
            .iter()
            .chain(&config.failsafe_outbound_host_ports)
            .any(|entry| entry.port == 0);
        if bad_failsafe {
            return Err(Error::InvalidPort);
        }
        if let Some(range) = config.nat_port_range {
            if !range.is_valid() {
                return Err(Error::InvalidPort);
            }
        }

        let deny_action = match config.filter_deny_action {
            FilterDenyAction::Drop => Action::Drop,
            FilterDenyAction::Reject => Action::Reject,
        };
        tracing::info!(action = ?deny_action, "Packets denied by policy will be");

        let mut drop_rules = Vec::new();
        if config.action_on_drop.logs() {
            let prefix = if config.include_drop_action_in_prefix {
                format!("{DROP_LOG_PREFIX} {}", config.action_on_drop.as_ref())
            } else {
                DROP_LOG_PREFIX.to_string()
            };
            drop_rules.push(ChainRule::always(Action::log(prefix)));
        }
        let mut nfqueue_rule = None;
        if config.action_on_drop.accepts() {
            tracing::warn!(
                action_on_drop = ?config.action_on_drop,
                "Policy drops are overridden: packets will be accepted"
            );
            drop_rules.push(ChainRule::always(Action::Accept));
        } else {
            if config.dns_policy_mode == DnsPolicyMode::DelayDeniedPacket && marks.dns_policy != 0
            {
                nfqueue_rule = Some(ChainRule::new(
                    MatchCriteria::new()
                        .mark_single_bit_set(marks.dns_policy)
                        .not_mark_matches_with_mask(
                            marks.skip_dns_policy_nfqueue,
                            marks.skip_dns_policy_nfqueue,
                        ),
                    Action::Nfqueue {
                        queue: config.dns_policy_nfqueue_id,
                    },
                ));
            }
            drop_rules.push(ChainRule::always(deny_action.clone()));
        }

        let input_accept_actions = match config.endpoint_to_host_action {
            EndpointToHostAction::Drop => drop_rules
                .iter()
                .filter_map(|rule| rule.action.clone())
                .collect(),
            EndpointToHostAction::Reject => vec![Action::Reject],
            EndpointToHostAction::Accept => vec![Action::Accept],
            EndpointToHostAction::Return => vec![Action::Return],
        };
        tracing::info!(
            action = ?config.endpoint_to_host_action,
            "Workload to host packets will be"
        );

        let allow = |action: AllowAction| match action {
            AllowAction::Accept => Action::Accept,
            AllowAction::Return => Action::Return,
        };
        let filter_allow_action = allow(config.filter_allow_action);
        let mangle_allow_action = allow(config.mangle_allow_action);
        tracing::info!(
            filter = ?filter_allow_action,
            mangle = ?mangle_allow_action,
            "Packets allowed by policy will be"
        );

        let block_cidr_action = match config.service_loop_prevention {
            ServiceLoopPrevention::Drop => Some(Action::Drop),
            ServiceLoopPrevention::Reject => Some(Action::Reject),
            ServiceLoopPrevention::Disabled => None,
        };

        Ok(Self {
            ip_sets: IpSetNamer::new(config.ip_set_prefix.clone()),
            max_chain_name_length: config.backend.max_chain_name_length(),
            all_mark_bits: marks.accept
                | marks.pass
                | marks.scratch0
                | marks.scratch1
                | marks.ipsec
                | marks.dns_policy,
            deny_action,
            drop_rules,
            nfqueue_rule,
            filter_allow_action,
            mangle_allow_action,
            input_accept_actions,
            block_cidr_action,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn deny_action(&self) -> &Action {
        &self.deny_action
    }

    pub(crate) fn filter_allow_action(&self) -> &Action {
        &self.filter_allow_action
    }

    pub(crate) fn mangle_allow_action(&self) -> &Action {
        &self.mangle_allow_action
    }

    pub(crate) fn block_cidr_action(&self) -> Option<&Action> {
        self.block_cidr_action.as_ref()
    }

    /// The configured drop sequence, each rule gated on `match_criteria` and carrying
    /// `comments` in place of its own.
    pub(crate) fn drop_rules(
        &self,
        match_criteria: MatchCriteria,
        comments: &[&str],
    ) -> Vec<ChainRule> {
        self.drop_rules
            .iter()
            .map(|rule| ChainRule {
                match_criteria: match_criteria.clone().combine(rule.match_criteria.clone()),
                action: rule.action.clone(),
                comments: comments.iter().map(|c| c.to_string()).collect(),
            })
            .collect()
    }

    /// Queue-to-userspace rule that holds back denied packets until DNS policy has caught
    /// up, if that mode is on.
    pub(crate) fn nfqueue_rule(
        &self,
        match_criteria: MatchCriteria,
        comment: Option<&str>,
    ) -> Option<ChainRule> {
        self.nfqueue_rule.as_ref().map(|base| {
            let rule = ChainRule {
                match_criteria: base.match_criteria.clone().combine(match_criteria),
                action: base.action.clone(),
                comments: Vec::new(),
            };
            match comment {
                Some(comment) => rule.with_comment(comment),
                None => rule,
            }
        })
    }

    pub(crate) fn input_accept_rules(&self, comment: &str) -> Vec<ChainRule> {
        self.input_accept_actions
            .iter()
            .map(|action| ChainRule::always(action.clone()).with_comment(comment))
            .collect()
    }

    pub(crate) fn deny_name(&self) -> &'static str {
        match self.config.filter_deny_action {
            FilterDenyAction::Drop => "Drop",
            FilterDenyAction::Reject => "Reject",
        }
    }
}
