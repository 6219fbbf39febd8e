// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Matching-engine rules.
//!
//! The matching engine views a packet as a sequence of big-endian 32-bit
//! words, starting at the Ethernet header. A rule selects one word, masks it
//! and checks the result against an inclusive range. A rule set holds four
//! rules: the first three decide whether the packet goes to the accelerator
//! (combined with AND or OR), the fourth marks the end of a message.

use crate::regs::RULES_PER_RULESET;
use crate::slmp::{SlmpFlags, SLMP_PORT};

/// One field comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchRule {
    /// Index of the 32-bit packet word to inspect.
    pub field_index: u32,
    pub mask: u32,
    pub start: u32,
    pub end: u32,
}

impl MatchRule {
    /// Rule that every packet satisfies.
    pub const ALWAYS_TRUE: Self = Self::new(0, 0, 0, 0);
    /// Rule that no packet satisfies.
    pub const ALWAYS_FALSE: Self = Self::new(0, 0, 1, 0);

    pub const fn new(field_index: u32, mask: u32, start: u32, end: u32) -> Self {
        Self {
            field_index,
            mask,
            start,
            end,
        }
    }

    /// Masked field equals `value`.
    pub const fn equals(field_index: u32, mask: u32, value: u32) -> Self {
        Self::new(field_index, mask, value, value)
    }

    /// EtherType is IPv4.
    pub const fn ipv4() -> Self {
        Self::equals(3, 0xffff_0000, 0x0800_0000)
    }

    /// IPv4 protocol number.
    pub const fn ip_proto(proto: u8) -> Self {
        Self::equals(5, 0xff, proto as u32)
    }

    /// UDP destination port (no IP options).
    pub const fn udp_dport(port: u16) -> Self {
        Self::equals(9, 0xffff_0000, (port as u32) << 16)
    }

    /// SLMP header has the end-of-message flag set.
    pub const fn slmp_eom() -> Self {
        let eom = SlmpFlags::EOM.bits() as u32;
        Self::equals(10, eom, eom)
    }

    #[inline]
    pub fn matches(&self, field: u32) -> bool {
        (self.start..=self.end).contains(&(field & self.mask))
    }

    /// Evaluate against a packet. Words past the end of the packet read as
    /// zero.
    pub fn matches_packet(&self, packet: &[u8]) -> bool {
        self.matches(packet_word(packet, self.field_index))
    }
}

fn packet_word(packet: &[u8], index: u32) -> u32 {
    let mut word = [0u8; 4];
    let start = index as usize * 4;
    if let Some(bytes) = packet.get(start..) {
        let n = bytes.len().min(4);
        word[..n].copy_from_slice(&bytes[..n]);
    }
    u32::from_be_bytes(word)
}

/// How the three match rules combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MatchMode {
    #[default]
    And,
    Or,
}

impl MatchMode {
    /// Value of the `me_mode` register.
    pub const fn register_value(self) -> u32 {
        match self {
            MatchMode::And => 0,
            MatchMode::Or => 1,
        }
    }
}

/// A complete matching-engine slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleSet {
    pub rules: [MatchRule; RULES_PER_RULESET],
    pub mode: MatchMode,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::bypass()
    }
}

impl RuleSet {
    pub const fn new(rules: [MatchRule; RULES_PER_RULESET], mode: MatchMode) -> Self {
        Self { rules, mode }
    }

    /// Matches nothing; traffic bypasses the accelerator.
    pub const fn bypass() -> Self {
        Self::new([MatchRule::ALWAYS_FALSE; RULES_PER_RULESET], MatchMode::And)
    }

    /// Matches every packet, each one a complete message.
    pub const fn match_all() -> Self {
        Self::new([MatchRule::ALWAYS_TRUE; RULES_PER_RULESET], MatchMode::And)
    }

    /// Every IPv4 UDP packet, never end of message.
    pub const fn udp() -> Self {
        Self::new(
            [
                MatchRule::ipv4(),
                MatchRule::ip_proto(17),
                MatchRule::ALWAYS_TRUE,
                MatchRule::ALWAYS_FALSE,
            ],
            MatchMode::And,
        )
    }

    /// SLMP traffic; the EOM flag ends a message.
    pub const fn slmp() -> Self {
        Self::new(
            [
                MatchRule::ipv4(),
                MatchRule::ip_proto(17),
                MatchRule::udp_dport(SLMP_PORT),
                MatchRule::slmp_eom(),
            ],
            MatchMode::And,
        )
    }

    /// Rules that decide whether a packet matches.
    pub fn match_rules(&self) -> &[MatchRule] {
        &self.rules[..RULES_PER_RULESET - 1]
    }

    /// Rule that marks the end of a message.
    pub fn eom_rule(&self) -> &MatchRule {
        &self.rules[RULES_PER_RULESET - 1]
    }

    /// Reference model of the matching engine.
    ///
    /// Returns `None` if the packet does not match, else whether it ends a
    /// message.
    pub fn classify(&self, packet: &[u8]) -> Option<bool> {
        let mut results = self.match_rules().iter().map(|r| r.matches_packet(packet));
        let matched = match self.mode {
            MatchMode::And => results.all(|m| m),
            MatchMode::Or => results.any(|m| m),
        };
        matched.then(|| self.eom_rule().matches_packet(packet))
    }
}

/// First slot whose rule set matches the packet, with its EOM bit.
pub fn classify_packet(rulesets: &[RuleSet], packet: &[u8]) -> Option<(usize, bool)> {
    rulesets
        .iter()
        .enumerate()
        .find_map(|(slot, rs)| rs.classify(packet).map(|eom| (slot, eom)))
}
