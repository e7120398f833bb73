//! # Well-Known Name Registry
//!
//! Bus-wide ownership of human-readable names. Every effective ownership
//! transition stamps a fresh bus-global name-id, so downstream consumers
//! can detect handovers. Entries keep a FIFO of waiters that asked to
//! queue for ownership, and remember the activator connection that holds
//! the name as a placeholder until an implementor claims it.
//!
//! All entry state is mutated under the registry lock. The registry never
//! touches connection queues itself; ownership transitions that require
//! moving queued messages between pools are reported back to the caller as
//! handoffs, to be applied under the connection locks (which order after
//! the registry lock).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::item::{NameTransition, NotifyKind};
use crate::util::validate_well_known_name;

/// Flags accepted by name acquisition.
pub mod name_flags {
    /// Take the name from a holder that allowed replacement.
    pub const REPLACE_EXISTING: u64 = 1 << 0;
    /// Remembered on the entry; later acquirers may replace the holder.
    pub const ALLOW_REPLACEMENT: u64 = 1 << 1;
    /// On conflict, wait in the entry's FIFO instead of failing.
    pub const QUEUE: u64 = 1 << 2;
    /// The entry is held by an activator placeholder. Only valid at
    /// connection creation.
    pub const ACTIVATOR: u64 = 1 << 3;
}

/// How an acquisition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    InQueue,
    AlreadyOwner,
}

/// An ownership transition to announce on the bus.
#[derive(Debug, Clone)]
pub struct NameEvent {
    pub kind: NotifyKind,
    pub transition: NameTransition,
}

/// Queued messages that must move between receive pools because a name
/// changed hands between an activator and an implementor.
#[derive(Debug)]
pub struct Handoff {
    pub from: Arc<Connection>,
    pub to: Arc<Connection>,
    /// The name-id stamped on the queued entries to be moved.
    pub name_id: u64,
}

/// Effects of a registry operation, applied by the caller after the
/// registry lock is dropped.
#[derive(Debug, Default)]
pub struct RegistryEffects {
    pub events: Vec<NameEvent>,
    pub handoffs: Vec<Handoff>,
}

#[derive(Debug)]
struct Waiter {
    conn: Weak<Connection>,
    conn_id: u64,
    flags: u64,
}

#[derive(Debug)]
struct NameEntry {
    name_id: u64,
    /// The current holder's acquisition flags.
    flags: u64,
    owner: Weak<Connection>,
    owner_id: u64,
    /// The activator that backs this name, when one exists. While the
    /// activator itself holds the name, `owner` points at it too.
    activator: Option<(Weak<Connection>, u64)>,
    waiters: VecDeque<Waiter>,
}

/// The destination a name currently routes to.
#[derive(Debug)]
pub struct ResolvedName {
    pub owner: Arc<Connection>,
    pub owner_id: u64,
    pub name_id: u64,
    /// True while the placeholder owner is an activator.
    pub activator_held: bool,
}

/// A snapshot row for name enumeration.
#[derive(Debug, Clone)]
pub struct NameInfo {
    pub name: String,
    pub name_id: u64,
    pub owner_id: u64,
    pub flags: u64,
    pub queued: Vec<u64>,
}

/// Bus-wide well-known-name ownership.
#[derive(Debug, Default)]
pub struct NameRegistry {
    entries: Mutex<HashMap<String, NameEntry>>,
    name_seq: AtomicU64,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_name_id(&self) -> u64 {
        self.name_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Acquire `name` for `conn`.
    pub fn acquire(
        &self,
        conn: &Arc<Connection>,
        name: &str,
        flags: u64,
    ) -> Result<(AcquireOutcome, RegistryEffects)> {
        validate_well_known_name(name)?;
        let mut effects = RegistryEffects::default();
        let mut entries = self.entries.lock();

        if !entries.contains_key(name) {
            // Free: claim it outright.
            let name_id = self.next_name_id();
            let activator = if flags & name_flags::ACTIVATOR != 0 {
                Some((Arc::downgrade(conn), conn.id()))
            } else {
                None
            };
            entries.insert(
                name.to_owned(),
                NameEntry {
                    name_id,
                    flags,
                    owner: Arc::downgrade(conn),
                    owner_id: conn.id(),
                    activator,
                    waiters: VecDeque::new(),
                },
            );
            conn.add_owned_name(name);
            debug!(name, owner = conn.id(), "name acquired");
            effects.events.push(NameEvent {
                kind: NotifyKind::NameAdd,
                transition: NameTransition {
                    name: name.to_owned(),
                    old_id: 0,
                    new_id: conn.id(),
                },
            });
            return Ok((AcquireOutcome::Acquired, effects));
        }
        let Some(entry) = entries.get_mut(name) else {
            return Err(Error::NotFound);
        };

        if entry.owner_id == conn.id() {
            // Refresh the holder's flags; replacement permission may change.
            entry.flags = (entry.flags & name_flags::ACTIVATOR)
                | (flags & !name_flags::ACTIVATOR);
            return Ok((AcquireOutcome::AlreadyOwner, effects));
        }

        let activator_held = entry.flags & name_flags::ACTIVATOR != 0;
        if activator_held && flags & name_flags::ACTIVATOR == 0 {
            // An implementor claims the activated name: pending messages
            // move from the activator to the implementor.
            let old_owner_id = entry.owner_id;
            let old_name_id = entry.name_id;
            if let Some(activator) = entry.owner.upgrade() {
                effects.handoffs.push(Handoff {
                    from: activator,
                    to: Arc::clone(conn),
                    name_id: old_name_id,
                });
            }
            if let Some(activator) = entry.activator.as_ref().and_then(|(w, _)| w.upgrade()) {
                activator.remove_owned_name(name);
            }
            entry.owner = Arc::downgrade(conn);
            entry.owner_id = conn.id();
            entry.flags = flags & !name_flags::ACTIVATOR;
            entry.name_id = self.next_name_id();
            conn.add_owned_name(name);
            debug!(name, from = old_owner_id, to = conn.id(), "activator handoff");
            effects.events.push(NameEvent {
                kind: NotifyKind::NameChange,
                transition: NameTransition {
                    name: name.to_owned(),
                    old_id: old_owner_id,
                    new_id: conn.id(),
                },
            });
            return Ok((AcquireOutcome::Acquired, effects));
        }

        if flags & name_flags::REPLACE_EXISTING != 0
            && entry.flags & name_flags::ALLOW_REPLACEMENT != 0
        {
            let old_owner_id = entry.owner_id;
            let old_flags = entry.flags;
            let old_owner = entry.owner.upgrade();
            if let Some(old) = old_owner.as_ref() {
                old.remove_owned_name(name);
                // A displaced holder that queued originally keeps seniority
                // at the head of the waiter line; one that did not is out.
                if old_flags & name_flags::QUEUE != 0 {
                    entry.waiters.push_front(Waiter {
                        conn: Arc::downgrade(old),
                        conn_id: old_owner_id,
                        flags: old_flags,
                    });
                }
            }
            entry.owner = Arc::downgrade(conn);
            entry.owner_id = conn.id();
            entry.flags = flags;
            entry.name_id = self.next_name_id();
            conn.add_owned_name(name);
            debug!(name, from = old_owner_id, to = conn.id(), "name replaced");
            effects.events.push(NameEvent {
                kind: NotifyKind::NameChange,
                transition: NameTransition {
                    name: name.to_owned(),
                    old_id: old_owner_id,
                    new_id: conn.id(),
                },
            });
            return Ok((AcquireOutcome::Acquired, effects));
        }

        if flags & name_flags::QUEUE != 0 {
            entry.waiters.push_back(Waiter {
                conn: Arc::downgrade(conn),
                conn_id: conn.id(),
                flags,
            });
            return Ok((AcquireOutcome::InQueue, effects));
        }

        Err(Error::AlreadyExists)
    }

    /// Release `name` held (or waited for) by `conn`.
    pub fn release(&self, conn: &Arc<Connection>, name: &str) -> Result<RegistryEffects> {
        let mut entries = self.entries.lock();
        let mut effects = RegistryEffects::default();
        let is_owner = match entries.get(name) {
            None => return Err(Error::NotFound),
            Some(entry) => entry.owner_id == conn.id(),
        };
        if is_owner {
            self.transition_from(&mut entries, name, conn, &mut effects);
            conn.remove_owned_name(name);
            return Ok(effects);
        }
        let Some(entry) = entries.get_mut(name) else {
            return Err(Error::NotFound);
        };
        let before = entry.waiters.len();
        entry.waiters.retain(|w| w.conn_id != conn.id());
        if entry.waiters.len() == before {
            return Err(Error::PermissionDenied);
        }
        Ok(effects)
    }

    /// Apply the owner-departure transition for `name`. The owner slot is
    /// handed to the first live waiter, else back to a surviving
    /// activator, else the entry is removed.
    fn transition_from(
        &self,
        entries: &mut HashMap<String, NameEntry>,
        name: &str,
        old_owner: &Arc<Connection>,
        effects: &mut RegistryEffects,
    ) {
        let old_owner_id = old_owner.id();
        let Some(entry) = entries.get_mut(name) else {
            return;
        };
        let old_name_id = entry.name_id;

        // Promote the first waiter that is still alive.
        while let Some(waiter) = entry.waiters.pop_front() {
            if let Some(next) = waiter.conn.upgrade() {
                if next.is_active() {
                    entry.owner = waiter.conn;
                    entry.owner_id = waiter.conn_id;
                    entry.flags = waiter.flags & !name_flags::ACTIVATOR;
                    entry.name_id = self.next_name_id();
                    next.add_owned_name(name);
                    effects.events.push(NameEvent {
                        kind: NotifyKind::NameChange,
                        transition: NameTransition {
                            name: name.to_owned(),
                            old_id: old_owner_id,
                            new_id: waiter.conn_id,
                        },
                    });
                    return;
                }
            }
        }

        // Fall back to the activator, moving pending messages back to it.
        if let Some((weak, activator_id)) = entry.activator.clone() {
            if activator_id != old_owner_id {
                if let Some(activator) = weak.upgrade() {
                    if activator.is_active() {
                        entry.owner = weak;
                        entry.owner_id = activator_id;
                        entry.flags |= name_flags::ACTIVATOR;
                        entry.name_id = self.next_name_id();
                        activator.add_owned_name(name);
                        effects.handoffs.push(Handoff {
                            from: Arc::clone(old_owner),
                            to: activator,
                            name_id: old_name_id,
                        });
                        effects.events.push(NameEvent {
                            kind: NotifyKind::NameChange,
                            transition: NameTransition {
                                name: name.to_owned(),
                                old_id: old_owner_id,
                                new_id: activator_id,
                            },
                        });
                        return;
                    }
                }
            }
        }

        entries.remove(name);
        effects.events.push(NameEvent {
            kind: NotifyKind::NameRemove,
            transition: NameTransition {
                name: name.to_owned(),
                old_id: old_owner_id,
                new_id: 0,
            },
        });
    }

    /// Release every name `conn` owns or waits for. Called on disconnect.
    pub fn remove_by_conn(&self, conn: &Arc<Connection>) -> RegistryEffects {
        let mut entries = self.entries.lock();
        let mut effects = RegistryEffects::default();

        let names: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.owner_id == conn.id())
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            // A dying activator takes its placeholder role with it.
            if let Some(entry) = entries.get_mut(&name) {
                if entry
                    .activator
                    .as_ref()
                    .map(|(_, id)| *id == conn.id())
                    .unwrap_or(false)
                {
                    entry.activator = None;
                }
            }
            self.transition_from(&mut entries, &name, conn, &mut effects);
            conn.remove_owned_name(&name);
        }

        for entry in entries.values_mut() {
            entry.waiters.retain(|w| w.conn_id != conn.id());
            if entry
                .activator
                .as_ref()
                .map(|(_, id)| *id == conn.id())
                .unwrap_or(false)
            {
                entry.activator = None;
            }
        }
        effects
    }

    /// Resolve a name to its current destination.
    pub fn resolve(&self, name: &str) -> Result<ResolvedName> {
        let entries = self.entries.lock();
        let entry = entries.get(name).ok_or(Error::NotFound)?;
        let owner = entry.owner.upgrade().ok_or(Error::NotFound)?;
        Ok(ResolvedName {
            owner,
            owner_id: entry.owner_id,
            name_id: entry.name_id,
            activator_held: entry.flags & name_flags::ACTIVATOR != 0,
        })
    }

    /// Does any entry name this connection as its owner?
    pub fn owns_any(&self, conn_id: u64) -> bool {
        self.entries
            .lock()
            .values()
            .any(|entry| entry.owner_id == conn_id)
    }

    /// Snapshot every entry for enumeration.
    pub fn snapshot(&self) -> Vec<NameInfo> {
        self.entries
            .lock()
            .iter()
            .map(|(name, entry)| NameInfo {
                name: name.clone(),
                name_id: entry.name_id,
                owner_id: entry.owner_id,
                flags: entry.flags,
                queued: entry.waiters.iter().map(|w| w.conn_id).collect(),
            })
            .collect()
    }
}
