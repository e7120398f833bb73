//! # Domains
//!
//! The root of the object hierarchy: a namespace of buses plus the
//! domain-global sequence counters and per-user accounting. Buses are
//! created through the domain so connection and bus quotas can be charged
//! against the creating uid.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::bloom::BloomParams;
use crate::bus::{Bus, BusLimits};
use crate::endpoint::process_creds;
use crate::error::{Error, Quota, Result};
use crate::item::Creds;
use crate::meta::{attach, Metadata};
use crate::policy::PolicyRule;
use crate::util::validate_bus_name;

/// Per-user object quotas on one domain.
#[derive(Debug, Clone, Copy)]
pub struct DomainLimits {
    pub max_connections_per_user: usize,
    pub max_buses_per_user: usize,
}

impl Default for DomainLimits {
    fn default() -> Self {
        DomainLimits {
            max_connections_per_user: crate::limits::MAX_CONNECTIONS_PER_USER,
            max_buses_per_user: crate::limits::MAX_BUSES_PER_USER,
        }
    }
}

/// Bus creation parameters.
#[derive(Debug, Clone)]
pub struct BusCreateRequest {
    /// Must begin with `"<uid>-"`, the creator's uid in decimal.
    pub name: String,
    pub bloom: BloomParams,
    pub limits: BusLimits,
    /// Impersonated creator credentials; defaults to the calling process.
    pub creator: Option<Creds>,
    /// Initial policy rules of the bus database.
    pub policy: Vec<PolicyRule>,
}

impl Default for BusCreateRequest {
    fn default() -> Self {
        BusCreateRequest {
            name: String::new(),
            bloom: BloomParams::default(),
            limits: BusLimits::default(),
            creator: None,
            policy: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct UserRecord {
    connections: usize,
    buses: usize,
}

/// Top-level namespace for buses.
#[derive(Debug)]
pub struct Domain {
    limits: DomainLimits,
    /// Domain-global message sequence, shared with every bus.
    msg_seq: Arc<AtomicU64>,
    bus_seq: AtomicU64,
    buses: Mutex<HashMap<String, Arc<Bus>>>,
    users: Mutex<HashMap<u32, UserRecord>>,
    disconnected: AtomicBool,
}

impl Domain {
    pub fn new() -> Arc<Domain> {
        Self::with_limits(DomainLimits::default())
    }

    pub fn with_limits(limits: DomainLimits) -> Arc<Domain> {
        Arc::new(Domain {
            limits,
            msg_seq: Arc::new(AtomicU64::new(0)),
            bus_seq: AtomicU64::new(0),
            buses: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub(crate) fn msg_seq(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.msg_seq)
    }

    /// The number of buses ever created here.
    pub fn bus_count_total(&self) -> u64 {
        self.bus_seq.load(Ordering::Acquire)
    }

    /// Create a bus and its default endpoint.
    pub fn create_bus(self: &Arc<Self>, req: BusCreateRequest) -> Result<Arc<Bus>> {
        if self.is_disconnected() {
            return Err(Error::Shutdown);
        }
        req.bloom.validate()?;
        let creator = req.creator.unwrap_or_else(process_creds);
        validate_bus_name(&req.name, creator.uid)?;

        {
            let mut users = self.users.lock();
            let record = users.entry(creator.uid).or_default();
            if record.buses >= self.limits.max_buses_per_user {
                return Err(Error::QuotaExceeded(Quota::Buses));
            }
            record.buses += 1;
        }

        let mut buses = self.buses.lock();
        if buses.contains_key(&req.name) {
            self.release_bus(creator.uid);
            return Err(Error::AlreadyExists);
        }

        let creator_meta = match req.creator {
            Some(imp) => Metadata::from_impersonated(imp, None),
            None => {
                let mut meta = Metadata::new();
                meta.collect(attach::ALL);
                meta
            }
        };

        self.bus_seq.fetch_add(1, Ordering::AcqRel);
        let bus = Bus::create(
            self,
            req.name.clone(),
            req.bloom,
            req.limits,
            creator,
            creator_meta,
            req.policy,
        );
        buses.insert(req.name, Arc::clone(&bus));
        Ok(bus)
    }

    /// Look up a bus by name.
    pub fn bus(&self, name: &str) -> Option<Arc<Bus>> {
        self.buses.lock().get(name).cloned()
    }

    /// Drop a disconnected bus from the namespace. The bus object stays
    /// alive while external references exist, but its name is free again.
    pub fn remove_bus(&self, name: &str) -> Result<()> {
        let bus = self.buses.lock().remove(name).ok_or(Error::NotFound)?;
        bus.disconnect();
        self.release_bus(bus.creator_uid());
        Ok(())
    }

    /// Tear the domain down: every bus detaches first, then the namespace
    /// closes. A second call is a no-op.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("domain disconnecting");
        let buses: Vec<Arc<Bus>> = {
            let mut map = self.buses.lock();
            let all = map.values().cloned().collect();
            map.clear();
            all
        };
        for bus in buses {
            bus.disconnect();
            self.release_bus(bus.creator_uid());
        }
    }

    pub(crate) fn charge_connection(&self, uid: u32) -> Result<()> {
        let mut users = self.users.lock();
        let record = users.entry(uid).or_default();
        if record.connections >= self.limits.max_connections_per_user {
            return Err(Error::QuotaExceeded(Quota::Connections));
        }
        record.connections += 1;
        Ok(())
    }

    pub(crate) fn release_connection(&self, uid: u32) {
        let mut users = self.users.lock();
        if let Some(record) = users.get_mut(&uid) {
            record.connections = record.connections.saturating_sub(1);
        }
    }

    fn release_bus(&self, uid: u32) {
        let mut users = self.users.lock();
        if let Some(record) = users.get_mut(&uid) {
            record.buses = record.buses.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(uid: u32, stem: &str) -> String {
        format!("{}-{}", uid, stem)
    }

    /// Bus names carry the creator uid prefix; the domain refuses others.
    #[test]
    fn bus_name_prefix_enforced() {
        let domain = Domain::new();
        let creds = process_creds();
        let ok = domain.create_bus(BusCreateRequest {
            name: named(creds.uid, "system"),
            ..Default::default()
        });
        assert!(ok.is_ok());

        let bad = domain.create_bus(BusCreateRequest {
            name: "99999-system".into(),
            ..Default::default()
        });
        assert!(matches!(bad, Err(Error::InvalidArgument(_))) || creds.uid == 99999);
    }

    /// Duplicate bus names are refused and do not leak quota.
    #[test]
    fn duplicate_bus_names() {
        let domain = Domain::new();
        let creds = process_creds();
        let name = named(creds.uid, "dup");
        domain
            .create_bus(BusCreateRequest {
                name: name.clone(),
                ..Default::default()
            })
            .unwrap();
        let again = domain.create_bus(BusCreateRequest {
            name,
            ..Default::default()
        });
        assert!(matches!(again, Err(Error::AlreadyExists)));
    }

    /// The per-user bus quota counts live buses only.
    #[test]
    fn bus_quota_per_user() {
        let domain = Domain::with_limits(DomainLimits {
            max_connections_per_user: 16,
            max_buses_per_user: 2,
        });
        let uid = 4242;
        let creator = Creds {
            uid,
            gid: uid,
            pid: 1,
            tid: 1,
        };
        for stem in ["a.one", "a.two"] {
            domain
                .create_bus(BusCreateRequest {
                    name: named(uid, stem),
                    creator: Some(creator),
                    ..Default::default()
                })
                .unwrap();
        }
        let third = domain.create_bus(BusCreateRequest {
            name: named(uid, "a.three"),
            creator: Some(creator),
            ..Default::default()
        });
        assert!(matches!(third, Err(Error::QuotaExceeded(Quota::Buses))));

        domain.remove_bus(&named(uid, "a.one")).unwrap();
        assert!(domain
            .create_bus(BusCreateRequest {
                name: named(uid, "a.three"),
                creator: Some(creator),
                ..Default::default()
            })
            .is_ok());
    }

    /// Domain disconnect cascades to buses and is idempotent.
    #[test]
    fn disconnect_cascades_and_is_idempotent() {
        let domain = Domain::new();
        let creds = process_creds();
        let bus = domain
            .create_bus(BusCreateRequest {
                name: named(creds.uid, "down"),
                ..Default::default()
            })
            .unwrap();
        domain.disconnect();
        assert!(bus.is_disconnected());
        assert!(domain.bus(&named(creds.uid, "down")).is_none());
        // Second disconnect on a dead domain is a no-op.
        domain.disconnect();
        assert!(matches!(
            domain.create_bus(BusCreateRequest::default()),
            Err(Error::Shutdown)
        ));
    }
}
