//! Heuristics for pairing unmapped remote changelists with local groups.
//!
//! Strategies run strictest first, and each one is tried against every
//! remaining remote before the next strategy gets a turn. A loose strategy
//! therefore never takes a local group that a strict one would have paired
//! with a remote further down the list.

use std::collections::BTreeSet;

use regex::Regex;

use crate::identity::{LocalGroup, LocalGroupId, RemoteChangelistId, RemoteChangelistSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Same name (case-sensitive) and same comment.
    Exact,
    /// Same name, case-sensitive.
    CasedName,
    /// Same name, ignoring case.
    Name,
    /// `<name> (n)`, a previously disambiguated duplicate.
    NameNumbered,
    /// `(@<number>)`.
    Numbered,
    /// `@<number>`, optionally followed by ` (n)`.
    NumberedIndexed,
    /// `@<number>` surrounded by non-word characters.
    ChangedNumber,
}

/// Every strategy, strictest first.
pub const MATCH_CHAIN: [MatchStrategy; 7] = [
    MatchStrategy::Exact,
    MatchStrategy::CasedName,
    MatchStrategy::Name,
    MatchStrategy::NameNumbered,
    MatchStrategy::Numbered,
    MatchStrategy::NumberedIndexed,
    MatchStrategy::ChangedNumber,
];

/// A remote changelist reduced to what the strategies compare against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchTarget {
    pub remote: RemoteChangelistId,
    pub name: String,
    pub comment: String,
}

impl MatchTarget {
    pub fn from_snapshot(snapshot: &RemoteChangelistSnapshot, default_name: &str) -> Self {
        let parts = snapshot.parts(default_name);
        Self {
            remote: snapshot.id.clone(),
            name: parts.name,
            comment: parts.comment,
        }
    }
}

/// A remote changelist paired with a local group by one strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub remote: RemoteChangelistId,
    pub local: LocalGroupId,
    pub strategy: MatchStrategy,
}

/// Result of running the whole chain.
#[derive(Debug, Default)]
pub struct ChainOutcome {
    pub claims: Vec<Claim>,
    /// Targets no strategy could pair, in their original order
    pub unmatched: Vec<MatchTarget>,
}

impl MatchStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            MatchStrategy::Exact => "exact",
            MatchStrategy::CasedName => "cased-name",
            MatchStrategy::Name => "name",
            MatchStrategy::NameNumbered => "name-numbered",
            MatchStrategy::Numbered => "numbered",
            MatchStrategy::NumberedIndexed => "numbered-indexed",
            MatchStrategy::ChangedNumber => "changed-number",
        }
    }

    /// First local group in `pool` this strategy pairs with `target`.
    pub fn find<'a>(&self, target: &MatchTarget, pool: &[&'a LocalGroup]) -> Option<&'a LocalGroup> {
        let number = target.remote.number.to_string();
        match self {
            MatchStrategy::Exact => pool
                .iter()
                .find(|group| {
                    group.name.trim() == target.name && group.comment.trim() == target.comment
                })
                .copied(),
            MatchStrategy::CasedName => pool
                .iter()
                .find(|group| group.name.trim() == target.name)
                .copied(),
            MatchStrategy::Name => {
                let wanted = target.name.to_lowercase();
                pool.iter()
                    .find(|group| group.name.trim().to_lowercase() == wanted)
                    .copied()
            }
            MatchStrategy::NameNumbered => find_by_pattern(
                &format!(r"(?i)^{}\s+\(\d+\)$", regex::escape(&target.name)),
                pool,
            ),
            MatchStrategy::Numbered => {
                let wanted = format!("(@{})", number);
                pool.iter()
                    .find(|group| group.name.trim() == wanted)
                    .copied()
            }
            MatchStrategy::NumberedIndexed => find_by_pattern(
                &format!(r"^@{}(\s+\(\d+\))?$", regex::escape(&number)),
                pool,
            ),
            // Whole-name match: the name must be nothing but the id token and
            // its delimiters.
            MatchStrategy::ChangedNumber => find_by_pattern(
                &format!(r"^(?:\W@{}(?:\W|$))$", regex::escape(&number)),
                pool,
            ),
        }
    }

    /// Pair as many `targets` as possible with groups from `pool`, in target
    /// order. No group is claimed twice.
    pub fn claim(&self, targets: &[&MatchTarget], pool: &[&LocalGroup]) -> Vec<Claim> {
        let mut taken: BTreeSet<&LocalGroupId> = BTreeSet::new();
        let mut claims = Vec::new();

        for target in targets {
            let available: Vec<&LocalGroup> = pool
                .iter()
                .filter(|group| !taken.contains(&group.id))
                .copied()
                .collect();
            if let Some(group) = self.find(target, &available) {
                taken.insert(&group.id);
                claims.push(Claim {
                    remote: target.remote.clone(),
                    local: group.id.clone(),
                    strategy: *self,
                });
            }
        }

        claims
    }
}

fn find_by_pattern<'a>(pattern: &str, pool: &[&'a LocalGroup]) -> Option<&'a LocalGroup> {
    let regex = match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(e) => {
            tracing::warn!("Skipping changelist match pattern {:?}: {}", pattern, e);
            return None;
        }
    };
    pool.iter()
        .find(|group| regex.is_match(group.name.trim()))
        .copied()
}

/// Run every strategy in [`MATCH_CHAIN`] order, shrinking both the targets
/// and the pool after each one.
pub fn run_chain(targets: &[MatchTarget], pool: &[LocalGroup]) -> ChainOutcome {
    let mut remaining: Vec<&MatchTarget> = targets.iter().collect();
    let mut available: Vec<&LocalGroup> = pool.iter().collect();
    let mut claims = Vec::new();

    for strategy in MATCH_CHAIN {
        if remaining.is_empty() || available.is_empty() {
            break;
        }
        let claimed = strategy.claim(&remaining, &available);
        if claimed.is_empty() {
            continue;
        }

        let claimed_remotes: BTreeSet<&RemoteChangelistId> =
            claimed.iter().map(|claim| &claim.remote).collect();
        let claimed_locals: BTreeSet<&LocalGroupId> =
            claimed.iter().map(|claim| &claim.local).collect();
        remaining.retain(|target| !claimed_remotes.contains(&target.remote));
        available.retain(|group| !claimed_locals.contains(&group.id));

        for claim in &claimed {
            tracing::debug!(
                "Matched {} to local group {} ({})",
                claim.remote,
                claim.local,
                strategy.label()
            );
        }
        claims.extend(claimed);
    }

    ChainOutcome {
        claims,
        unmatched: remaining.into_iter().cloned().collect(),
    }
}
