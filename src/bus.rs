//! # Buses
//!
//! A bus is a named container of endpoints and connections: it owns the
//! connection hash, the name registry, the policy database, the bloom
//! geometry, the pending-notification list and the reply-deadline worker.
//! Broadcast fan-out and monitor mirroring live here because both are
//! walks over the connection hash.
//!
//! ## Locking
//!
//! The connection hash is a reader/writer lock: broadcasts and lookups
//! read, registration and disconnect write. The notification list is a
//! leaf mutex: it may be taken while holding a connection lock, and the
//! flush path drops it before delivering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::bloom::BloomParams;
use crate::connection::{deliver_broadcast, enqueue, may_broadcast, Connection, Kmsg, Role};
use crate::domain::Domain;
use crate::endpoint::{Endpoint, EndpointPermissions};
use crate::error::{Error, Result};
use crate::item::{Creds, Item, KERNEL_ID};
use crate::meta::Metadata;
use crate::names::NameRegistry;
use crate::policy::{PolicyDb, PolicyRule};
use crate::reply::ReplyWorker;
use crate::util::monotonic_ns;

/// Per-bus delivery quotas; privileged senders bypass them.
#[derive(Debug, Clone, Copy)]
pub struct BusLimits {
    /// Total messages queued on one connection.
    pub max_msgs: usize,
    /// Messages queued on one connection from one sending uid.
    pub max_msgs_per_user: usize,
    /// Outbound requests awaiting reply per connection.
    pub max_requests_pending: usize,
}

impl Default for BusLimits {
    fn default() -> Self {
        BusLimits {
            max_msgs: crate::limits::MAX_MSGS,
            max_msgs_per_user: crate::limits::MAX_MSGS_PER_USER,
            max_requests_pending: crate::limits::MAX_REQUESTS_PENDING,
        }
    }
}

/// A named message bus.
#[derive(Debug)]
pub struct Bus {
    name: String,
    id128: [u8; 16],
    bloom: BloomParams,
    creator: Creds,
    creator_meta: Metadata,
    limits: BusLimits,
    domain: Weak<Domain>,
    /// Domain-global message sequence counter, shared by every bus.
    msg_seq: Arc<AtomicU64>,
    registry: NameRegistry,
    policy: PolicyDb,
    /// Rules installed at creation, kept for policy rebuilds.
    base_policy: Mutex<Vec<PolicyRule>>,
    /// Rules contributed by live policy holders, keyed by holder id.
    holder_policy: Mutex<HashMap<u64, Vec<PolicyRule>>>,
    conns: RwLock<HashMap<u64, Arc<Connection>>>,
    eps: Mutex<Vec<Arc<Endpoint>>>,
    /// Pending engine notifications: `(target id, payload item)`.
    notify_list: Mutex<Vec<(Option<u64>, Item)>>,
    conn_seq: AtomicU64,
    reply_worker: Mutex<Option<ReplyWorker>>,
    disconnected: AtomicBool,
}

impl Bus {
    pub(crate) fn create(
        domain: &Arc<Domain>,
        name: String,
        bloom: BloomParams,
        limits: BusLimits,
        creator: Creds,
        creator_meta: Metadata,
        base_policy: Vec<PolicyRule>,
    ) -> Arc<Bus> {
        let bus = Arc::new(Bus {
            name,
            id128: *Uuid::new_v4().as_bytes(),
            bloom,
            creator,
            creator_meta,
            limits,
            domain: Arc::downgrade(domain),
            msg_seq: domain.msg_seq(),
            registry: NameRegistry::new(),
            policy: PolicyDb::with_rules(base_policy.clone()),
            base_policy: Mutex::new(base_policy),
            holder_policy: Mutex::new(HashMap::new()),
            conns: RwLock::new(HashMap::new()),
            eps: Mutex::new(Vec::new()),
            notify_list: Mutex::new(Vec::new()),
            conn_seq: AtomicU64::new(0),
            reply_worker: Mutex::new(None),
            disconnected: AtomicBool::new(false),
        });

        // The default endpoint is created together with the bus and owned
        // by it.
        let default_ep = Endpoint::new(
            "bus".to_owned(),
            EndpointPermissions::default(),
            None,
            Arc::downgrade(&bus),
        );
        bus.eps.lock().push(default_ep);

        *bus.reply_worker.lock() = Some(ReplyWorker::spawn(Arc::downgrade(&bus)));
        info!(bus = %bus.name, "bus created");
        bus
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The random 128-bit bus identity handed out at hello.
    pub fn id128(&self) -> [u8; 16] {
        self.id128
    }

    pub fn bloom_params(&self) -> BloomParams {
        self.bloom
    }

    pub fn limits(&self) -> BusLimits {
        self.limits
    }

    pub fn creator_uid(&self) -> u32 {
        self.creator.uid
    }

    pub(crate) fn creator_meta(&self) -> &Metadata {
        &self.creator_meta
    }

    pub(crate) fn domain(&self) -> Option<Arc<Domain>> {
        self.domain.upgrade()
    }

    pub fn registry(&self) -> &NameRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &PolicyDb {
        &self.policy
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Is the calling process privileged relative to this bus?
    pub fn process_is_privileged(&self) -> bool {
        // SAFETY: no arguments, no memory access.
        let euid = unsafe { libc::geteuid() };
        euid == 0 || euid == self.creator.uid
    }

    /// The default endpoint, for ordinary registration.
    pub fn default_endpoint(&self) -> Arc<Endpoint> {
        Arc::clone(&self.eps.lock()[0])
    }

    /// Create a custom endpoint with its own policy database.
    pub fn create_endpoint(
        self: &Arc<Self>,
        name: &str,
        perms: EndpointPermissions,
        policy: Vec<PolicyRule>,
    ) -> Result<Arc<Endpoint>> {
        if self.is_disconnected() {
            return Err(Error::Shutdown);
        }
        if name.is_empty() || name == "bus" {
            return Err(Error::InvalidArgument("reserved endpoint name"));
        }
        let mut eps = self.eps.lock();
        if eps.iter().any(|ep| ep.name() == name) {
            return Err(Error::AlreadyExists);
        }
        let ep = Endpoint::new(
            name.to_owned(),
            perms,
            Some(PolicyDb::with_rules(policy)),
            Arc::downgrade(self),
        );
        eps.push(Arc::clone(&ep));
        debug!(bus = %self.name, ep = name, "custom endpoint created");
        Ok(ep)
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.msg_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        // Ids are unique across the bus's lifetime and never reused;
        // KERNEL_ID stays reserved.
        self.conn_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn insert_conn(&self, conn: &Arc<Connection>) -> Result<()> {
        let mut conns = self.conns.write();
        // Re-checked under the writer lock: a disconnected bus accepts no
        // new connections.
        if self.is_disconnected() {
            return Err(Error::Shutdown);
        }
        conns.insert(conn.id(), Arc::clone(conn));
        Ok(())
    }

    pub(crate) fn remove_conn(&self, id: u64) {
        self.conns.write().remove(&id);
    }

    pub fn conn_by_id(&self, id: u64) -> Option<Arc<Connection>> {
        if id == KERNEL_ID {
            return None;
        }
        self.conns.read().get(&id).cloned()
    }

    /// Snapshot of all live connections, for walks that must not hold the
    /// hash lock while taking connection locks.
    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.conns.read().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.conns.read().len()
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    /// Broadcast fan-out: deliver to every eligible ordinary receiver,
    /// swallowing per-receiver failures, then mirror to monitors.
    pub(crate) fn broadcast(self: &Arc<Self>, src: &Arc<Connection>, kmsg: &mut Kmsg) {
        for dst in self.connections() {
            if dst.id() == src.id() || dst.role() != Role::Ordinary {
                continue;
            }
            if !dst
                .match_db()
                .matches_user(src.id(), &src.owned_names(), kmsg.bloom())
            {
                continue;
            }
            if !may_broadcast(self, src, &dst) {
                continue;
            }
            if let Err(err) = deliver_broadcast(self, &dst, kmsg) {
                trace!(dst = dst.id(), ?err, "broadcast receiver skipped");
            }
        }
        self.mirror_to_monitors(kmsg);
    }

    /// Eavesdropping: every monitor receives a copy, bypassing policy and
    /// match evaluation. Failures are swallowed.
    pub(crate) fn mirror_to_monitors(self: &Arc<Self>, kmsg: &mut Kmsg) {
        for monitor in self.connections() {
            if monitor.role() != Role::Monitor {
                continue;
            }
            if let Err(err) = deliver_broadcast(self, &monitor, kmsg) {
                trace!(monitor = monitor.id(), ?err, "monitor copy dropped");
            }
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Queue an engine-origin notification. Targeted entries are
    /// delivered to one connection; untargeted ones to every subscriber
    /// whose match database requests the kind.
    pub(crate) fn queue_notification(&self, target: Option<u64>, item: Item) {
        self.notify_list.lock().push((target, item));
    }

    /// Flush pending notifications. Called at the defined points (after
    /// send, receive, name operations and disconnect) so notification
    /// delivery never reenters the path that produced it.
    pub(crate) fn flush_notifications(self: &Arc<Self>) {
        loop {
            let pending: Vec<(Option<u64>, Item)> = {
                let mut list = self.notify_list.lock();
                if list.is_empty() {
                    return;
                }
                list.drain(..).collect()
            };
            for (target, item) in pending {
                let Some(kind) = item.notify_kind() else {
                    continue;
                };
                let seq = self.next_seq();
                let mut kmsg = Kmsg::notification(seq, item);
                match target {
                    Some(id) => {
                        if let Some(dst) = self.conn_by_id(id) {
                            if let Err(err) = enqueue(self, &dst, &kmsg, 0, None) {
                                debug!(dst = id, ?err, "notification dropped");
                            }
                        }
                    }
                    None => {
                        for dst in self.connections() {
                            let wanted = match dst.role() {
                                Role::Monitor => true,
                                Role::PolicyHolder => false,
                                _ => dst.match_db().matches_notify(kind),
                            };
                            if !wanted {
                                continue;
                            }
                            if let Err(err) = deliver_broadcast(self, &dst, &mut kmsg) {
                                debug!(dst = dst.id(), ?err, "notification dropped");
                            }
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Reply deadlines
    // ------------------------------------------------------------------

    pub(crate) fn rearm_reply_worker(&self) {
        if let Some(worker) = self.reply_worker.lock().as_ref() {
            worker.rearm();
        }
    }

    /// One sweep over every connection's reply list: expire overdue
    /// asynchronous trackers and report the nearest remaining deadline.
    pub(crate) fn sweep_reply_deadlines(self: &Arc<Self>) -> Option<u64> {
        let now = monotonic_ns();
        let mut next: Option<u64> = None;
        let mut notify = Vec::new();
        let mut dec = Vec::new();
        for conn in self.connections() {
            if let Some(deadline) = conn.sweep_replies(now, &mut notify, &mut dec) {
                next = Some(next.map_or(deadline, |n: u64| n.min(deadline)));
            }
        }
        for waiter in dec {
            if let Some(conn) = self.conn_by_id(waiter) {
                conn.note_request_finished();
            }
        }
        for (target, item) in notify {
            self.queue_notification(target, item);
        }
        self.flush_notifications();
        next
    }

    // ------------------------------------------------------------------
    // Policy holders
    // ------------------------------------------------------------------

    /// Replace the rules contributed by one policy holder and rebuild the
    /// merged database. An empty rule set removes the holder.
    pub(crate) fn update_holder_policy(&self, holder_id: u64, rules: Vec<PolicyRule>) {
        let mut holders = self.holder_policy.lock();
        if rules.is_empty() {
            holders.remove(&holder_id);
        } else {
            holders.insert(holder_id, rules);
        }
        let mut merged = self.base_policy.lock().clone();
        for holder_rules in holders.values() {
            merged.extend(holder_rules.iter().cloned());
        }
        self.policy.set_rules(merged);
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Disconnect the bus: no new endpoints or connections, every live
    /// connection is torn down, the deadline worker stops. A second call
    /// is a no-op.
    pub fn disconnect(self: &Arc<Self>) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(bus = %self.name, "bus disconnecting");
        for ep in self.eps.lock().iter() {
            // Marks endpoints closed; connection teardown follows below
            // so connections attached to the default endpoint are covered
            // too.
            if ep.is_custom() {
                ep.disconnect();
            }
        }
        for conn in self.connections() {
            let _ = conn.disconnect();
        }
        if let Some(mut worker) = self.reply_worker.lock().take() {
            worker.shutdown();
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        if let Some(mut worker) = self.reply_worker.lock().take() {
            worker.shutdown();
        }
    }
}
