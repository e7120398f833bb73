//! # Endpoints
//!
//! An endpoint is an access point to a bus. The default endpoint (named
//! `bus`) is created with the bus itself; additional custom endpoints
//! carry their own policy database, which is authoritative for
//! connections attached through them and masks denials as NotFound.
//!
//! `hello` is the registration command: it validates the requested role,
//! charges the per-user connection quota, snapshots credentials and
//! attaches a new connection to the bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bloom::BloomParams;
use crate::bus::Bus;
use crate::connection::{apply_registry_effects, Connection, Role};
use crate::error::{Error, Result};
use crate::item::{Creds, Item};
use crate::meta::{attach, Metadata};
use crate::names::name_flags;
use crate::policy::{PolicyDb, PolicyRule};
use crate::util::validate_well_known_name;

/// External access control triple of an endpoint. The core records it;
/// enforcement belongs to the transport that exposes the node.
#[derive(Debug, Clone, Copy)]
pub struct EndpointPermissions {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl Default for EndpointPermissions {
    fn default() -> Self {
        EndpointPermissions {
            uid: 0,
            gid: 0,
            mode: 0o666,
        }
    }
}

/// Registration request for a new connection.
#[derive(Debug, Clone)]
pub struct HelloRequest {
    pub role: Role,
    /// Metadata fields this connection wants attached to its inbound
    /// messages.
    pub attach_flags: u64,
    pub pool_size: usize,
    pub accept_fds: bool,
    /// Required for activators (the held name) and policy holders (the
    /// name the rules belong to).
    pub name: Option<String>,
    /// Initial rules of a policy holder.
    pub policy: Vec<PolicyRule>,
    /// Impersonated credentials; privileged callers only.
    pub impersonate: Option<Creds>,
    pub seclabel: Option<String>,
    pub description: Option<String>,
}

impl Default for HelloRequest {
    fn default() -> Self {
        HelloRequest {
            role: Role::Ordinary,
            attach_flags: 0,
            pool_size: crate::limits::DEFAULT_POOL_SIZE,
            accept_fds: true,
            name: None,
            policy: Vec::new(),
            impersonate: None,
            seclabel: None,
            description: None,
        }
    }
}

/// What a fresh connection learns about its bus.
#[derive(Debug, Clone)]
pub struct HelloReply {
    pub id: u64,
    pub bus_id: [u8; 16],
    pub bloom: BloomParams,
    pub bus_name: String,
}

/// A (potentially policy-bearing) access point to a bus.
#[derive(Debug)]
pub struct Endpoint {
    name: String,
    perms: EndpointPermissions,
    /// Present on custom endpoints only.
    policy: Option<PolicyDb>,
    bus: Weak<Bus>,
    conns: Mutex<Vec<Weak<Connection>>>,
    disconnected: AtomicBool,
}

impl Endpoint {
    pub(crate) fn new(
        name: String,
        perms: EndpointPermissions,
        policy: Option<PolicyDb>,
        bus: Weak<Bus>,
    ) -> Arc<Endpoint> {
        Arc::new(Endpoint {
            name,
            perms,
            policy,
            bus,
            conns: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn permissions(&self) -> EndpointPermissions {
        self.perms
    }

    /// A custom endpoint carries its own policy database.
    pub fn is_custom(&self) -> bool {
        self.policy.is_some()
    }

    pub(crate) fn custom_policy(&self) -> Option<&PolicyDb> {
        self.policy.as_ref()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Register a new connection through this endpoint.
    pub fn hello(self: &Arc<Self>, req: HelloRequest) -> Result<(Arc<Connection>, HelloReply)> {
        let bus = self.bus.upgrade().ok_or(Error::Shutdown)?;
        if self.is_disconnected() || bus.is_disconnected() {
            return Err(Error::Shutdown);
        }
        if req.attach_flags & !attach::ALL != 0 {
            return Err(Error::InvalidArgument("unknown attach flag"));
        }

        // Role/name consistency.
        match req.role {
            Role::Activator | Role::PolicyHolder => {
                let name = req
                    .name
                    .as_deref()
                    .ok_or(Error::InvalidArgument("role requires a name"))?;
                validate_well_known_name(name)?;
            }
            Role::Ordinary | Role::Monitor => {
                if req.name.is_some() {
                    return Err(Error::InvalidArgument("role takes no name"));
                }
            }
        }
        if !req.policy.is_empty() && req.role != Role::PolicyHolder {
            return Err(Error::InvalidArgument("policy items need a policy holder"));
        }

        // Privileged-only requests: special roles and impersonation.
        let caller_privileged = bus.process_is_privileged();
        if req.role != Role::Ordinary && !caller_privileged {
            return Err(Error::PermissionDenied);
        }
        if req.impersonate.is_some() && !caller_privileged {
            return Err(Error::PermissionDenied);
        }

        // Effective principal of the new connection.
        let creds = match req.impersonate {
            Some(creds) => creds,
            None => process_creds(),
        };
        let privileged = creds.uid == 0 || creds.uid == bus.creator_uid();

        let (meta, owner_meta) = match req.impersonate {
            Some(imp) => {
                let owner = Metadata::from_impersonated(imp, req.seclabel.clone());
                (owner.duplicate(), Some(owner))
            }
            None => {
                let mut meta = Metadata::new();
                meta.collect(attach::ALL);
                (meta, None)
            }
        };

        let domain = bus.domain().ok_or(Error::Shutdown)?;
        domain.charge_connection(creds.uid)?;

        let id = bus.next_conn_id();
        let conn = match Connection::new(
            id,
            req.role,
            Arc::downgrade(&bus),
            Arc::downgrade(self),
            creds,
            privileged,
            meta,
            owner_meta,
            req.pool_size,
            req.attach_flags,
            req.accept_fds,
            req.description.clone(),
        ) {
            Ok(conn) => conn,
            Err(err) => {
                domain.release_connection(creds.uid);
                return Err(err);
            }
        };

        if let Err(err) = bus.insert_conn(&conn) {
            domain.release_connection(creds.uid);
            return Err(err);
        }
        self.conns.lock().push(Arc::downgrade(&conn));

        // Role-specific registration: an activator is born holding its
        // name; a policy holder installs its rules.
        let post_insert = match req.role {
            Role::Activator => {
                let name = req.name.as_deref().unwrap_or_default();
                let owned = if privileged {
                    Ok(())
                } else {
                    bus.policy()
                        .check(&creds, name, crate::policy::Access::Own)
                };
                owned.and_then(|_| {
                    bus.registry()
                        .acquire(&conn, name, name_flags::ACTIVATOR)
                        .map(|(_, effects)| apply_registry_effects(&bus, effects))
                })
            }
            Role::PolicyHolder => {
                let name = req.name.as_deref().unwrap_or_default();
                if req
                    .policy
                    .iter()
                    .all(|rule| rule.name == name || covers_subtree(name, &rule.name))
                {
                    bus.update_holder_policy(conn.id(), req.policy.clone());
                    Ok(())
                } else {
                    Err(Error::InvalidArgument("policy rule outside held name"))
                }
            }
            _ => Ok(()),
        };
        if let Err(err) = post_insert {
            bus.remove_conn(conn.id());
            domain.release_connection(creds.uid);
            return Err(err);
        }

        if req.role != Role::Monitor {
            bus.queue_notification(None, Item::IdAdd(conn.id()));
        }
        bus.flush_notifications();
        info!(conn = conn.id(), role = ?req.role, ep = %self.name, "connection registered");

        let reply = HelloReply {
            id: conn.id(),
            bus_id: bus.id128(),
            bloom: bus.bloom_params(),
            bus_name: bus.name().to_owned(),
        };
        Ok((conn, reply))
    }

    /// Detach this endpoint: every connection attached through it is
    /// disconnected. The default endpoint is torn down by the bus itself.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(ep = %self.name, "endpoint disconnecting");
        let conns: Vec<Arc<Connection>> = {
            let mut list = self.conns.lock();
            let alive = list.iter().filter_map(Weak::upgrade).collect();
            list.clear();
            alive
        };
        for conn in conns {
            let _ = conn.disconnect();
        }
    }
}

fn covers_subtree(held: &str, rule_name: &str) -> bool {
    rule_name
        .strip_suffix(".*")
        .map(|prefix| prefix == held || prefix.starts_with(&format!("{}.", held)))
        .unwrap_or_else(|| rule_name.starts_with(&format!("{}.", held)))
}

pub(crate) fn process_creds() -> Creds {
    // SAFETY: plain syscalls without arguments or memory access.
    unsafe {
        Creds {
            uid: libc::getuid(),
            gid: libc::getgid(),
            pid: libc::getpid() as u32,
            tid: libc::syscall(libc::SYS_gettid) as u32,
        }
    }
}
