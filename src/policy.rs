//! # Policy Database
//!
//! Decides the three access questions of the bus: may a connection SEE a
//! name, TALK to a name's owner, OWN a name. Rules are grant tuples of
//! `(name, principal, access)`; access levels are ordered (owning implies
//! talking implies seeing) and names may carry a trailing `.*` wildcard.
//!
//! Decision order: exact-name rules beat wildcard rules, longer wildcard
//! prefixes beat shorter ones, and within one name class a user rule beats
//! a group rule beats a world rule. The most specific applicable rule
//! determines the granted level; the request succeeds when that level
//! covers the wanted access.
//!
//! A small per-principal cache memoizes decisions. The rule set is kept
//! under a reader/writer lock; the cache under its own mutex so read-mostly
//! evaluation does not serialize on memoization.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::item::Creds;

/// Access levels, weakest to strongest. A grant of a stronger level
/// implies every weaker one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Access {
    See,
    Talk,
    Own,
}

/// Who a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    World,
    Group(u32),
    User(u32),
}

/// One grant tuple. `name` may end in `.*` to cover a subtree.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub name: String,
    pub principal: Principal,
    pub access: Access,
}

#[derive(Debug, Default)]
struct RuleSet {
    /// Exact-name rules.
    exact: HashMap<String, Vec<(Principal, Access)>>,
    /// Wildcard rules keyed by prefix (the part before `.*`), sorted by
    /// descending prefix length so the first hit is the most specific.
    wildcard: Vec<(String, Vec<(Principal, Access)>)>,
}

impl RuleSet {
    fn build(rules: Vec<PolicyRule>) -> Self {
        let mut exact: HashMap<String, Vec<(Principal, Access)>> = HashMap::new();
        let mut wildcard: HashMap<String, Vec<(Principal, Access)>> = HashMap::new();
        for rule in rules {
            match rule.name.strip_suffix(".*") {
                Some(prefix) => wildcard
                    .entry(prefix.to_owned())
                    .or_default()
                    .push((rule.principal, rule.access)),
                None => exact
                    .entry(rule.name)
                    .or_default()
                    .push((rule.principal, rule.access)),
            }
        }
        let mut wildcard: Vec<_> = wildcard.into_iter().collect();
        wildcard.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        RuleSet { exact, wildcard }
    }

    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }

    /// The granted level of the most specific rule applying to
    /// `(creds, name)`, walking name classes most-specific first.
    fn granted(&self, creds: &Creds, name: &str) -> Option<Access> {
        if let Some(rules) = self.exact.get(name) {
            if let Some(access) = best_principal_grant(rules, creds) {
                return Some(access);
            }
        }
        for (prefix, rules) in &self.wildcard {
            let covers = name == prefix
                || (name.len() > prefix.len()
                    && name.starts_with(prefix.as_str())
                    && name.as_bytes()[prefix.len()] == b'.');
            if covers {
                if let Some(access) = best_principal_grant(rules, creds) {
                    return Some(access);
                }
            }
        }
        None
    }
}

/// Within one name class: user rule beats group rule beats world rule.
fn best_principal_grant(rules: &[(Principal, Access)], creds: &Creds) -> Option<Access> {
    let mut world = None;
    let mut group = None;
    let mut user = None;
    for (principal, access) in rules {
        let slot = match principal {
            Principal::User(uid) if *uid == creds.uid => &mut user,
            Principal::Group(gid) if *gid == creds.gid => &mut group,
            Principal::World => &mut world,
            _ => continue,
        };
        // Several rules of one specificity: the strongest grant wins.
        if slot.map_or(true, |prev| *access > prev) {
            *slot = Some(*access);
        }
    }
    user.or(group).or(world)
}

type CacheKey = (u32, u32, String, Access);

/// A SEE/TALK/OWN rule database with a per-principal decision cache.
#[derive(Debug, Default)]
pub struct PolicyDb {
    rules: RwLock<RuleSet>,
    cache: Mutex<HashMap<CacheKey, bool>>,
}

impl PolicyDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a database from initial rules.
    pub fn with_rules(rules: Vec<PolicyRule>) -> Self {
        let db = Self::new();
        db.set_rules(rules);
        db
    }

    /// Replace the rule set (policy-holder update). Cached decisions are
    /// invalidated wholesale.
    pub fn set_rules(&self, rules: Vec<PolicyRule>) {
        *self.rules.write() = RuleSet::build(rules);
        self.cache.lock().clear();
    }

    /// True when no rule was ever installed; callers fall through to the
    /// next database in the endpoint chain.
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Drop every memoized decision. Called when any connection
    /// disconnects or a name changes hands, since either event can change
    /// what a principal may reach.
    pub fn purge_cache(&self) {
        self.cache.lock().clear();
    }

    /// Decide `wanted` access to `name` for the given principal.
    pub fn check(&self, creds: &Creds, name: &str, wanted: Access) -> Result<()> {
        let key = (creds.uid, creds.gid, name.to_owned(), wanted);
        if let Some(&granted) = self.cache.lock().get(&key) {
            return if granted {
                Ok(())
            } else {
                Err(Error::PermissionDenied)
            };
        }
        let granted = self
            .rules
            .read()
            .granted(creds, name)
            .map(|level| level >= wanted)
            .unwrap_or(false);
        self.cache.lock().insert(key, granted);
        if granted {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// TALK decision against a destination owning `names`: any owned name
    /// granting talk suffices.
    pub fn check_talk_any(&self, creds: &Creds, names: &[String]) -> Result<()> {
        for name in names {
            if self.check(creds, name, Access::Talk).is_ok() {
                return Ok(());
            }
        }
        Err(Error::PermissionDenied)
    }
}
