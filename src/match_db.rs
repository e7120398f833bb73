//! # Match Database
//!
//! Per-connection subscription rules deciding which broadcasts and engine
//! notifications a connection receives. A rule is a conjunction of items;
//! a message is delivered when any rule matches. Evaluation runs under a
//! reader lock and short-circuits on the first success.

use parking_lot::RwLock;

use crate::bloom::BloomFilter;
use crate::error::{Error, Result};
use crate::item::NotifyKind;

/// One conjunct of a match rule.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchItem {
    /// Sender connection id must equal this id.
    SenderId(u64),
    /// Sender must own this well-known name at delivery time.
    SenderName(String),
    /// Message bloom filter must contain this mask
    /// (`filter & mask == mask`).
    BloomMask(Vec<u8>),
    /// Matches engine notifications of this kind instead of user messages.
    Notification(NotifyKind),
}

/// A subscription rule: all items must hold for the rule to match.
#[derive(Debug, Clone)]
pub struct MatchRule {
    /// Caller-chosen handle used for removal.
    pub cookie: u64,
    pub items: Vec<MatchItem>,
}

impl MatchRule {
    fn notify_kinds(&self) -> impl Iterator<Item = NotifyKind> + '_ {
        self.items.iter().filter_map(|item| match item {
            MatchItem::Notification(kind) => Some(*kind),
            _ => None,
        })
    }

    fn is_notify_rule(&self) -> bool {
        self.notify_kinds().next().is_some()
    }

    fn matches_user(&self, src_id: u64, src_names: &[String], bloom: Option<&BloomFilter>) -> bool {
        self.items.iter().all(|item| match item {
            MatchItem::SenderId(id) => *id == src_id,
            MatchItem::SenderName(name) => src_names.iter().any(|n| n == name),
            MatchItem::BloomMask(mask) => {
                bloom.map(|filter| filter.contains_mask(mask)).unwrap_or(false)
            }
            MatchItem::Notification(_) => false,
        })
    }
}

/// The rule set of one connection.
#[derive(Debug, Default)]
pub struct MatchDb {
    rules: RwLock<Vec<MatchRule>>,
}

impl MatchDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule. An empty item list is refused; it would match
    /// nothing and only hide a caller bug.
    pub fn add(&self, rule: MatchRule) -> Result<()> {
        if rule.items.is_empty() {
            return Err(Error::InvalidArgument("empty match rule"));
        }
        self.rules.write().push(rule);
        Ok(())
    }

    /// Remove every rule registered under `cookie`.
    pub fn remove(&self, cookie: u64) -> Result<()> {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|rule| rule.cookie != cookie);
        if rules.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Does any rule accept this user broadcast?
    pub fn matches_user(
        &self,
        src_id: u64,
        src_names: &[String],
        bloom: Option<&BloomFilter>,
    ) -> bool {
        self.rules
            .read()
            .iter()
            .filter(|rule| !rule.is_notify_rule())
            .any(|rule| rule.matches_user(src_id, src_names, bloom))
    }

    /// Does any rule subscribe to this notification kind?
    ///
    /// Notification rules match on kind alone; bloom masks and sender
    /// constraints do not apply to engine-originated messages.
    pub fn matches_notify(&self, kind: NotifyKind) -> bool {
        self.rules
            .read()
            .iter()
            .any(|rule| rule.notify_kinds().any(|k| k == kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::BloomParams;

    /// Rules are conjunctions: every item must hold.
    #[test]
    fn rule_items_are_conjoined() {
        let db = MatchDb::new();
        db.add(MatchRule {
            cookie: 1,
            items: vec![
                MatchItem::SenderId(7),
                MatchItem::SenderName("com.example.A".into()),
            ],
        })
        .unwrap();

        let names = vec!["com.example.A".to_owned()];
        assert!(db.matches_user(7, &names, None));
        assert!(!db.matches_user(8, &names, None));
        assert!(!db.matches_user(7, &[], None));
    }

    /// Bloom masks follow the containment test against the message filter.
    #[test]
    fn bloom_mask_matching() {
        let params = BloomParams::default();
        let mask = BloomFilter::from_keys(&params, &["a.b"]);
        let db = MatchDb::new();
        db.add(MatchRule {
            cookie: 1,
            items: vec![MatchItem::BloomMask(mask.0.clone())],
        })
        .unwrap();

        let matching = BloomFilter::from_keys(&params, &["a.b", "c.d"]);
        let other = BloomFilter::from_keys(&params, &["c.d"]);
        assert!(db.matches_user(1, &[], Some(&matching)));
        assert!(!db.matches_user(1, &[], Some(&other)));
        // A mask rule never matches a message without a filter.
        assert!(!db.matches_user(1, &[], None));
    }

    /// Notification rules match by kind and nothing else; user rules never
    /// match notifications.
    #[test]
    fn notification_rules() {
        let db = MatchDb::new();
        db.add(MatchRule {
            cookie: 1,
            items: vec![MatchItem::Notification(NotifyKind::NameChange)],
        })
        .unwrap();

        assert!(db.matches_notify(NotifyKind::NameChange));
        assert!(!db.matches_notify(NotifyKind::IdAdd));
        assert!(!db.matches_user(1, &[], None));
    }

    /// Removal is keyed by cookie and reports missing cookies.
    #[test]
    fn remove_by_cookie() {
        let db = MatchDb::new();
        db.add(MatchRule {
            cookie: 9,
            items: vec![MatchItem::SenderId(1)],
        })
        .unwrap();
        assert!(db.remove(9).is_ok());
        assert!(matches!(db.remove(9), Err(Error::NotFound)));
    }

    /// Determinism: adding unrelated rules never un-matches a message.
    #[test]
    fn match_survives_unrelated_rules() {
        let db = MatchDb::new();
        db.add(MatchRule {
            cookie: 1,
            items: vec![MatchItem::SenderId(7)],
        })
        .unwrap();
        assert!(db.matches_user(7, &[], None));
        db.add(MatchRule {
            cookie: 2,
            items: vec![MatchItem::SenderName("x.y".into())],
        })
        .unwrap();
        assert!(db.matches_user(7, &[], None));
    }
}
