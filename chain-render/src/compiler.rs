//! Compiles [Rule]s into concrete chain rules.
//!
//! A rule is the AND of its match lists and each list is an OR of its entries. Whatever
//! fits in a single backend rule is inlined. Lists that need a real OR become blocks
//! that are evaluated through two scratch mark bits:
//!
//! * scratch0 accumulates "every block so far matched",
//! * scratch1 holds "the current block matched" for second and later positive blocks.
//!
//! Negative blocks clear scratch0 on any hit. The final rule then requires scratch0 on
//! top of the inlined criteria.

use chain_render_common::{mark, split_port_list, Action, Chain, ChainRule, IpVersion, MatchCriteria};

use crate::{
    cidr::IpFamily,
    config::DnsPolicyMode,
    nflog::{NflogPrefix, NflogVerdict, RuleDirection, RuleOwner},
    policy_chain_name, profile_chain_name, Policy, PolicyId, Profile, ProfileId, Renderer, Rule,
    RuleAction, POLICY_INBOUND_PFX, POLICY_OUTBOUND_PFX, PROFILE_INBOUND_PFX, PROFILE_OUTBOUND_PFX,
};

/// Who owns a rule list and how it is rendered.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RuleContext<'a> {
    pub(crate) owner: RuleOwner,
    pub(crate) direction: RuleDirection,
    /// Policy or profile name, used in NFLOG prefixes.
    pub(crate) name: &'a str,
    pub(crate) untracked: bool,
    pub(crate) staged: bool,
}

/// An OR of match entries.
#[derive(Debug)]
struct Block {
    entries: Vec<MatchCriteria>,
    negated: bool,
}

impl Renderer {
    /// Inbound and outbound chains of a policy, in that order.
    pub fn policy_to_chains(
        &self,
        id: &PolicyId,
        policy: &Policy,
        ip_version: IpVersion,
    ) -> Vec<Chain> {
        let staged = id.is_staged();
        [
            (RuleDirection::Ingress, &policy.inbound_rules, POLICY_INBOUND_PFX),
            (RuleDirection::Egress, &policy.outbound_rules, POLICY_OUTBOUND_PFX),
        ]
        .into_iter()
        .map(|(direction, rules, prefix)| {
            let ctx = RuleContext {
                owner: RuleOwner::Policy,
                direction,
                name: &id.name,
                untracked: policy.untracked,
                staged,
            };
            Chain::new(
                policy_chain_name(prefix, id, self.max_chain_name_length),
                self.owned_rules(rules, ip_version, &ctx),
            )
        })
        .collect()
    }

    /// Inbound and outbound chains of a profile, in that order.
    pub fn profile_to_chains(
        &self,
        id: &ProfileId,
        profile: &Profile,
        ip_version: IpVersion,
    ) -> Vec<Chain> {
        [
            (RuleDirection::Ingress, &profile.inbound_rules, PROFILE_INBOUND_PFX),
            (RuleDirection::Egress, &profile.outbound_rules, PROFILE_OUTBOUND_PFX),
        ]
        .into_iter()
        .map(|(direction, rules, prefix)| {
            let ctx = RuleContext {
                owner: RuleOwner::Profile,
                direction,
                name: &id.name,
                untracked: false,
                staged: false,
            };
            Chain::new(
                profile_chain_name(prefix, id, self.max_chain_name_length),
                self.owned_rules(rules, ip_version, &ctx),
            )
        })
        .collect()
    }

    fn owned_rules(
        &self,
        rules: &[Rule],
        ip_version: IpVersion,
        ctx: &RuleContext,
    ) -> Vec<ChainRule> {
        let mut chain_rules = self.rules_to_chain_rules(rules, ip_version, ctx);
        if ctx.staged {
            chain_rules.push(ChainRule::always(Action::nflog(
                ctx.direction.nflog_group(),
                NflogPrefix::StagedEndOfPolicy {
                    direction: ctx.direction,
                    name: ctx.name,
                }
                .render(),
            )));
        }
        // A trailing return is a no-op whatever it matches.
        while matches!(
            chain_rules.last(),
            Some(ChainRule {
                action: Some(Action::Return),
                ..
            })
        ) {
            chain_rules.pop();
        }
        if chain_rules.is_empty() {
            chain_rules.push(ChainRule::default());
        }
        chain_rules[0].comments.insert(
            0,
            format!(
                "{} {} {}",
                ctx.owner.as_str(),
                ctx.name,
                ctx.direction.as_str()
            ),
        );
        chain_rules
    }

    /// Compiles a whole rule list.
    ///
    /// If any rule is for the other IP version, or mentions a CIDR of the other family,
    /// the whole list compiles to nothing: the enclosing chain's default then decides.
    pub(crate) fn rules_to_chain_rules(
        &self,
        rules: &[Rule],
        ip_version: IpVersion,
        ctx: &RuleContext,
    ) -> Vec<ChainRule> {
        if let Some(reason) = skip_reason(rules, ip_version) {
            tracing::debug!(
                owner = ctx.owner.as_str(),
                name = ctx.name,
                %ip_version,
                reason,
                "Skipping rule list"
            );
            return Vec::new();
        }
        rules
            .iter()
            .enumerate()
            .flat_map(|(index, rule)| self.rule_to_chain_rules(rule, ip_version, index, ctx))
            .collect()
    }

    fn rule_to_chain_rules(
        &self,
        rule: &Rule,
        ip_version: IpVersion,
        index: usize,
        ctx: &RuleContext,
    ) -> Vec<ChainRule> {
        let names = |ids: &[String]| -> Vec<String> {
            ids.iter()
                .map(|id| self.ip_sets.name_for(id, ip_version))
                .collect()
        };
        let with_protocol = |m: MatchCriteria| match &rule.protocol {
            Some(p) => m.protocol(p.to_string()),
            None => m,
        };

        let src_port_chunks = split_port_list(&rule.src_ports);
        let src_named = names(&rule.src_named_port_ip_set_ids);
        let dst_port_chunks = split_port_list(&rule.dst_ports);
        let dst_named = names(&rule.dst_named_port_ip_set_ids);

        let dst_sets = names(&rule.dst_ip_set_ids);
        let domain_sets = names(&rule.dst_domain_ip_set_ids);
        let mut dst_set_entries = Vec::new();
        if !dst_sets.is_empty() {
            dst_set_entries.push(
                dst_sets
                    .iter()
                    .fold(MatchCriteria::new(), |m, set| m.dest_ip_set(set.clone())),
            );
        }
        dst_set_entries.extend(
            domain_sets
                .iter()
                .map(|set| MatchCriteria::new().dest_ip_set(set.clone())),
        );

        let mut blocks = Vec::new();

        let src_ports_block = src_port_chunks.len() + src_named.len() > 1;
        if src_ports_block {
            blocks.push(Block {
                entries: src_port_chunks
                    .iter()
                    .map(|chunk| with_protocol(MatchCriteria::new()).source_ports(chunk.clone()))
                    .chain(
                        src_named
                            .iter()
                            .map(|set| MatchCriteria::new().source_ip_port_set(set.clone())),
                    )
                    .collect(),
                negated: false,
            });
        }
        let dst_ports_block = dst_port_chunks.len() + dst_named.len() > 1;
        if dst_ports_block {
            blocks.push(Block {
                entries: dst_port_chunks
                    .iter()
                    .map(|chunk| with_protocol(MatchCriteria::new()).dest_ports(chunk.clone()))
                    .chain(
                        dst_named
                            .iter()
                            .map(|set| MatchCriteria::new().dest_ip_port_set(set.clone())),
                    )
                    .collect(),
                negated: false,
            });
        }
        let src_nets_block = rule.src_net.len() > 1;
        if src_nets_block {
            blocks.push(Block {
                entries: rule
                    .src_net
                    .iter()
                    .map(|net| MatchCriteria::new().source_net(net.to_string()))
                    .collect(),
                negated: false,
            });
        }
        let dst_nets_block = rule.dst_net.len() > 1;
        if dst_nets_block {
            blocks.push(Block {
                entries: rule
                    .dst_net
                    .iter()
                    .map(|net| MatchCriteria::new().dest_net(net.to_string()))
                    .collect(),
                negated: false,
            });
        }
        let dst_sets_block = dst_set_entries.len() > 1;
        if dst_sets_block {
            blocks.push(Block {
                entries: dst_set_entries.clone(),
                negated: false,
            });
        }
        // Only one positive and one negated address fit in a single rule.
        let not_src_nets_block = rule.not_src_net.len() > 1
            || (rule.not_src_net.len() == 1 && rule.src_net.len() == 1);
        if not_src_nets_block {
            blocks.push(Block {
                entries: rule
                    .not_src_net
                    .iter()
                    .map(|net| MatchCriteria::new().source_net(net.to_string()))
                    .collect(),
                negated: true,
            });
        }
        let not_dst_nets_block = rule.not_dst_net.len() > 1
            || (rule.not_dst_net.len() == 1 && rule.dst_net.len() == 1);
        if not_dst_nets_block {
            blocks.push(Block {
                entries: rule
                    .not_dst_net
                    .iter()
                    .map(|net| MatchCriteria::new().dest_net(net.to_string()))
                    .collect(),
                negated: true,
            });
        }

        let mut m = MatchCriteria::new();
        if let Some(p) = &rule.protocol {
            m = m.protocol(p.to_string());
        }
        if let Some(p) = &rule.not_protocol {
            m = m.not_protocol(p.to_string());
        }

        if !src_nets_block {
            if let Some(net) = rule.src_net.first() {
                m = m.source_net(net.to_string());
            }
        }
        for set in names(&rule.src_ip_set_ids) {
            m = m.source_ip_set(set);
        }
        if !src_ports_block {
            if let Some(chunk) = src_port_chunks.first() {
                m = m.source_ports(chunk.clone());
            }
            if let Some(set) = src_named.first() {
                m = m.source_ip_port_set(set.clone());
            }
        }

        if !dst_nets_block {
            if let Some(net) = rule.dst_net.first() {
                m = m.dest_net(net.to_string());
            }
        }
        if !dst_sets_block {
            if let Some(entry) = dst_set_entries.first() {
                m = m.combine(entry.clone());
            }
        }
        if !dst_ports_block {
            if let Some(chunk) = dst_port_chunks.first() {
                m = m.dest_ports(chunk.clone());
            }
            if let Some(set) = dst_named.first() {
                m = m.dest_ip_port_set(set.clone());
            }
        }

        if let Some(icmp) = rule.icmp {
            m = m.icmp(ip_version.is_v6(), icmp.icmp_type, icmp.code);
        }

        if !not_src_nets_block {
            if let Some(net) = rule.not_src_net.first() {
                m = m.not_source_net(net.to_string());
            }
        }
        for set in names(&rule.not_src_ip_set_ids) {
            m = m.not_source_ip_set(set);
        }
        for chunk in split_port_list(&rule.not_src_ports) {
            m = m.not_source_ports(chunk);
        }
        for set in names(&rule.not_src_named_port_ip_set_ids) {
            m = m.not_source_ip_port_set(set);
        }

        if !not_dst_nets_block {
            if let Some(net) = rule.not_dst_net.first() {
                m = m.not_dest_net(net.to_string());
            }
        }
        for set in names(&rule.not_dst_ip_set_ids) {
            m = m.not_dest_ip_set(set);
        }
        for chunk in split_port_list(&rule.not_dst_ports) {
            m = m.not_dest_ports(chunk);
        }
        for set in names(&rule.not_dst_named_port_ip_set_ids) {
            m = m.not_dest_ip_port_set(set);
        }

        if let Some(icmp) = rule.not_icmp {
            m = m.not_icmp(ip_version.is_v6(), icmp.icmp_type, icmp.code);
        }

        let mut chain_rules = self.block_rules(&blocks);
        if !blocks.is_empty() {
            m = m.mark_single_bit_set(self.config.marks.scratch0);
        }
        chain_rules.extend(self.action_rules(rule, m, index, ctx));

        let marks = &self.config.marks;
        if !domain_sets.is_empty()
            && self.config.dns_policy_mode == DnsPolicyMode::DelayDeniedPacket
            && marks.dns_policy != 0
            && !ctx.staged
            && rule.action != RuleAction::Log
        {
            chain_rules.push(ChainRule::always(mark::set(marks.dns_policy)));
        }

        if !rule.annotations.is_empty() {
            let comments: Vec<String> = rule
                .annotations
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            for chain_rule in &mut chain_rules {
                chain_rule.comments.extend(comments.iter().cloned());
            }
        }
        chain_rules
    }

    /// Mark bookkeeping that evaluates `blocks` into scratch0.
    fn block_rules(&self, blocks: &[Block]) -> Vec<ChainRule> {
        let marks = &self.config.marks;
        let (s0, s1) = (marks.scratch0, marks.scratch1);
        let mut chain_rules = Vec::new();
        let Some(first) = blocks.first() else {
            return chain_rules;
        };
        // Positive blocks always come first, so a negated first block means they all are.
        let start = if first.negated { s0 } else { 0 };
        chain_rules.push(ChainRule::always(mark::set_masked(start, s0 | s1)));

        let mut seen_positive = false;
        let mut subsequent = 0;
        for block in blocks {
            if block.negated {
                chain_rules.extend(
                    block
                        .entries
                        .iter()
                        .map(|entry| ChainRule::new(entry.clone(), mark::clear(s0))),
                );
            } else if !seen_positive {
                seen_positive = true;
                chain_rules.extend(
                    block
                        .entries
                        .iter()
                        .map(|entry| ChainRule::new(entry.clone(), mark::set(s0))),
                );
            } else {
                if subsequent > 0 {
                    chain_rules.push(ChainRule::always(mark::clear(s1)));
                }
                subsequent += 1;
                chain_rules.extend(
                    block
                        .entries
                        .iter()
                        .map(|entry| ChainRule::new(entry.clone(), mark::set(s1))),
                );
                chain_rules.push(ChainRule::new(
                    MatchCriteria::new().mark_clear(s1),
                    mark::clear(s0),
                ));
            }
        }
        chain_rules
    }

    /// Verdict and logging rules for a rule whose criteria are `m`.
    fn action_rules(
        &self,
        rule: &Rule,
        m: MatchCriteria,
        index: usize,
        ctx: &RuleContext,
    ) -> Vec<ChainRule> {
        let marks = &self.config.marks;
        let group = ctx.direction.nflog_group();
        let prefix = |verdict| {
            NflogPrefix::Rule {
                verdict,
                owner: ctx.owner,
                direction: ctx.direction,
                index,
                name: ctx.name,
            }
            .render()
        };
        let verdict = match rule.action {
            RuleAction::Log => {
                let log_prefix = rule
                    .log_prefix
                    .clone()
                    .unwrap_or_else(|| self.config.log_prefix.clone());
                return vec![ChainRule::new(m, Action::log(log_prefix))];
            }
            RuleAction::Allow => NflogVerdict::Allow,
            RuleAction::Pass => NflogVerdict::Pass,
            RuleAction::Deny => NflogVerdict::Deny,
        };

        if ctx.staged {
            return vec![
                ChainRule::new(m.clone(), Action::nflog(group, prefix(verdict))),
                ChainRule::new(m, Action::Return),
            ];
        }

        match rule.action {
            RuleAction::Allow | RuleAction::Pass => {
                let bit = if rule.action == RuleAction::Allow {
                    marks.accept
                } else {
                    marks.pass
                };
                vec![
                    ChainRule::new(m, mark::set(bit)),
                    ChainRule::new(mark::is_set(bit), Action::nflog(group, prefix(verdict))),
                    ChainRule::new(mark::is_set(bit), Action::Return),
                ]
            }
            _ => {
                let mut chain_rules = vec![ChainRule::new(m, mark::set(marks.drop))];
                if !ctx.untracked {
                    chain_rules.extend(self.nfqueue_rule(mark::is_set(marks.drop), None));
                } else {
                    chain_rules.push(ChainRule::new(mark::is_set(marks.drop), Action::NoTrack));
                }
                chain_rules.push(ChainRule::new(
                    mark::is_set(marks.drop),
                    Action::nflog(group, prefix(verdict)),
                ));
                chain_rules.extend(self.drop_rules(mark::is_set(marks.drop), &[]));
                chain_rules
            }
        }
    }
}

fn skip_reason(rules: &[Rule], ip_version: IpVersion) -> Option<&'static str> {
    for rule in rules {
        if rule.ip_version.map_or(false, |v| v != ip_version) {
            return Some("rule is for the other IP version");
        }
        if rule.all_nets().any(|net| !net.is_version(ip_version)) {
            return Some("rule has a CIDR of the other IP family");
        }
    }
    None
}
