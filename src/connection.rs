//! # Connections
//!
//! A connection is an attached participant on a bus: it owns a receive
//! pool, a priority queue of inbound entries, a match database, a
//! credential snapshot and the reply trackers of requests it still owes
//! answers to. This module also carries the send and receive pipelines,
//! since both are defined by what they do to connection state.
//!
//! ## Lifecycle
//!
//! ```text
//! New ──registration──► Active ──disconnect/cascade──► Disconnecting ──drain──► Dead
//! ```
//!
//! The Disconnecting→Dead edge is the active-reference gate: disconnect
//! closes the gate and waits until every in-flight operation on the
//! connection has returned before tearing resources down.
//!
//! ## Send pipeline (unicast)
//!
//! stamp seq → build metadata → resolve destination → policy → reply
//! tracking → allocate slice in the receiver's pool → link into the
//! receiver's queue → wake receiver → mirror to monitors → flush
//! notifications. Broadcasts fan out per receiver with all failures
//! swallowed; synchronous replies bypass the queue and complete the
//! waiter's tracker directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::bloom::BloomFilter;
use crate::bus::Bus;
use crate::endpoint::Endpoint;
use crate::error::{Error, Quota, Result};
use crate::gate::ActiveGate;
use crate::item::{DeliveredMessage, Item, Message, NotifyKind, BROADCAST_ID, KERNEL_ID};
use crate::item::Creds;
use crate::match_db::{MatchDb, MatchRule};
use crate::meta::{attach, Metadata};
use crate::names::{name_flags, AcquireOutcome, Handoff, RegistryEffects};
use crate::policy::{Access, PolicyRule};
use crate::pool::Pool;
use crate::queue::{MsgQueue, QueueEntry};
use crate::reply::{ReplyDelivery, ReplyTracker, FAIL_BROKEN_PIPE, FAIL_CANCELLED};

/// The mutually exclusive roles a connection can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends and receives messages, may own names.
    Ordinary,
    /// Receives a copy of all bus traffic; invisible to policy and
    /// unaddressable.
    Monitor,
    /// Placeholder owner of one name; receives until an implementor
    /// claims the name.
    Activator,
    /// Holds policy rules for names it does not implement; no messaging.
    PolicyHolder,
}

/// What `recv` should do with the entry it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    /// Deliver: install handles, publish the slice, unlink the entry.
    Take,
    /// Report the slice offset but keep the entry queued.
    Peek,
    /// Discard the entry, resolving any reply tracker it carried.
    Drop,
}

/// Receive command.
#[derive(Debug, Clone, Copy)]
pub struct RecvCmd {
    /// Must be zero on input; the reply carries the real offset.
    pub offset: usize,
    /// Priority floor, consulted when `use_priority` is set.
    pub priority: i64,
    pub use_priority: bool,
    pub mode: RecvMode,
}

impl Default for RecvCmd {
    fn default() -> Self {
        RecvCmd {
            offset: 0,
            priority: 0,
            use_priority: false,
            mode: RecvMode::Take,
        }
    }
}

/// Receive result: where the message landed in the caller's pool.
#[derive(Debug, Clone)]
pub struct RecvReply {
    pub offset: usize,
    pub size: usize,
    /// Handle tokens installed into the caller's handle table.
    pub fds: Vec<u64>,
}

/// Send result; synchronous sends carry the reply's location.
#[derive(Debug, Clone, Default)]
pub struct SendReply {
    pub reply: Option<ReplyDelivery>,
}

/// Target selector for connection information queries.
#[derive(Debug, Clone)]
pub enum InfoQuery {
    Id(u64),
    Name(String),
}

/// Connection mutation command.
#[derive(Debug, Clone)]
pub enum UpdateCmd {
    /// New attach-flag set (ordinary and monitor connections).
    AttachFlags(u64),
    /// Replacement policy rules (policy holders).
    Policy(Vec<PolicyRule>),
}

/// Filter flags for name enumeration.
pub mod list_flags {
    /// Connections without well-known names, listed by id.
    pub const UNIQUE: u64 = 1 << 0;
    /// Well-known names with live implementors.
    pub const NAMES: u64 = 1 << 1;
    /// Names currently parked on activators.
    pub const ACTIVATORS: u64 = 1 << 2;
    /// Include each name's waiter queue.
    pub const QUEUED: u64 = 1 << 3;
}

/// One row of a name enumeration, decoded from the caller's pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameListEntry {
    pub id: u64,
    pub name: Option<String>,
    pub flags: u64,
    pub queued: Vec<u64>,
}

/// The record `name_list` places in the caller's pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameListRecord {
    pub entries: Vec<NameListEntry>,
}

/// The record `conn_info` and `bus_creator_info` place in the caller's
/// pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnInfoRecord {
    pub id: u64,
    pub meta: Vec<Item>,
}

/// State guarded by the connection lock (innermost in the lock order).
#[derive(Debug)]
pub(crate) struct ConnState {
    /// Cleared at the start of disconnect; refuses new enqueues.
    live: bool,
    pool: Pool,
    queue: MsgQueue,
    attach_flags: u64,
    accept_fds: bool,
    /// Requests this connection owes replies to.
    reply_list: Vec<Arc<ReplyTracker>>,
    /// Lazily materialized per-sender-uid queue accounting.
    msg_users: Option<HashMap<u32, usize>>,
    /// Handle tokens installed by receives.
    handles: Vec<u64>,
}

/// An attached participant on a bus.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    role: Role,
    description: Option<String>,
    bus: Weak<Bus>,
    ep: Weak<Endpoint>,
    creds: Creds,
    /// Privileged relative to the bus (root or the bus creator's uid).
    privileged: bool,
    meta: Metadata,
    owner_meta: Option<Metadata>,
    match_db: MatchDb,
    gate: ActiveGate,
    names: Mutex<Vec<String>>,
    /// Outbound requests still awaiting replies, for the pending cap.
    requests_pending: AtomicUsize,
    state: Mutex<ConnState>,
    queue_cond: Condvar,
}

/// Deferred effects collected under locks and applied after they drop, so
/// no path ever takes the bus hash lock while holding a connection lock.
#[derive(Default)]
struct PostEffects {
    /// Waiter ids whose pending-request count must drop by one.
    dec_pending: Vec<u64>,
    /// Targeted notifications: `(target conn id, item)`.
    notify: Vec<(Option<u64>, Item)>,
}

impl PostEffects {
    fn apply(self, bus: &Bus) {
        for waiter in self.dec_pending {
            if let Some(conn) = bus.conn_by_id(waiter) {
                conn.requests_pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        for (target, item) in self.notify {
            bus.queue_notification(target, item);
        }
    }
}

/// A routed message while it travels the pipeline. The metadata buffer
/// grows monotonically as receivers request fields; each receiver decodes
/// only its own filtered view.
pub(crate) struct Kmsg {
    seq: u64,
    src_id: u64,
    src_names: Vec<String>,
    cookie: u64,
    cookie_reply: u64,
    priority: i64,
    bloom: Option<BloomFilter>,
    payload: Vec<Item>,
    fds: Vec<u64>,
    meta: Metadata,
    sender_uid: u32,
    sender_privileged: bool,
    description: Option<String>,
}

impl Kmsg {
    fn from_user(src: &Connection, seq: u64, msg: &Message) -> Kmsg {
        // An impersonated snapshot is duplicated and only ever extended
        // with names and the description; otherwise start empty and
        // collect per receiver.
        let meta = match &src.owner_meta {
            Some(owner) => owner.duplicate(),
            None => Metadata::new(),
        };
        Kmsg {
            seq,
            src_id: src.id,
            src_names: src.owned_names(),
            cookie: msg.cookie,
            cookie_reply: msg.cookie_reply,
            priority: msg.priority,
            bloom: msg.bloom.clone(),
            payload: msg.items.clone(),
            fds: msg.fd_tokens(),
            meta,
            sender_uid: src.creds.uid,
            sender_privileged: src.privileged,
            description: src.description.clone(),
        }
    }

    pub(crate) fn notification(seq: u64, item: Item) -> Kmsg {
        Kmsg {
            seq,
            src_id: KERNEL_ID,
            src_names: Vec::new(),
            cookie: 0,
            cookie_reply: 0,
            priority: 0,
            bloom: None,
            payload: vec![item],
            fds: Vec::new(),
            meta: Metadata::new(),
            sender_uid: 0,
            sender_privileged: true,
            description: None,
        }
    }

    pub(crate) fn notify_kind(&self) -> Option<NotifyKind> {
        self.payload.first().and_then(Item::notify_kind)
    }

    pub(crate) fn bloom(&self) -> Option<&BloomFilter> {
        self.bloom.as_ref()
    }

    fn is_kernel(&self) -> bool {
        self.src_id == KERNEL_ID
    }

    /// Grow the shared metadata buffer by the receiver's requested fields.
    fn grow_meta(&mut self, attach_flags: u64) {
        if self.is_kernel() {
            return;
        }
        self.meta.collect(attach_flags);
        self.meta.collect_names(attach_flags, &self.src_names);
        self.meta
            .collect_description(attach_flags, self.description.as_deref());
    }

    fn delivered_for(
        &self,
        dst_id: u64,
        dst_name_id: u64,
        attach_flags: u64,
        same_ns: bool,
    ) -> DeliveredMessage {
        DeliveredMessage {
            seq: self.seq,
            src_id: self.src_id,
            dst_id,
            cookie: self.cookie,
            cookie_reply: self.cookie_reply,
            priority: self.priority,
            dst_name_id,
            payload: self.payload.clone(),
            meta: self.meta.filtered(attach_flags, same_ns),
            fds: self.fds.clone(),
        }
    }
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        role: Role,
        bus: Weak<Bus>,
        ep: Weak<Endpoint>,
        creds: Creds,
        privileged: bool,
        meta: Metadata,
        owner_meta: Option<Metadata>,
        pool_size: usize,
        attach_flags: u64,
        accept_fds: bool,
        description: Option<String>,
    ) -> Result<Arc<Connection>> {
        Ok(Arc::new(Connection {
            id,
            role,
            description,
            bus,
            ep,
            creds,
            privileged,
            meta,
            owner_meta,
            match_db: MatchDb::new(),
            gate: ActiveGate::new(),
            names: Mutex::new(Vec::new()),
            requests_pending: AtomicUsize::new(0),
            state: Mutex::new(ConnState {
                live: true,
                pool: Pool::new(pool_size)?,
                queue: MsgQueue::new(),
                attach_flags,
                accept_fds,
                reply_list: Vec::new(),
                msg_users: None,
                handles: Vec::new(),
            }),
            queue_cond: Condvar::new(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn creds(&self) -> Creds {
        self.creds
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Live and not yet disconnecting.
    pub fn is_active(&self) -> bool {
        !self.gate.is_closed()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Names currently owned, oldest first.
    pub fn owned_names(&self) -> Vec<String> {
        self.names.lock().clone()
    }

    pub(crate) fn add_owned_name(&self, name: &str) {
        let mut names = self.names.lock();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_owned());
        }
    }

    pub(crate) fn remove_owned_name(&self, name: &str) {
        self.names.lock().retain(|n| n != name);
    }

    fn bus(&self) -> Result<Arc<Bus>> {
        self.bus.upgrade().ok_or(Error::Shutdown)
    }

    /// The endpoint this connection is attached through, when it carries
    /// a custom policy database.
    fn custom_endpoint(&self) -> Option<Arc<Endpoint>> {
        self.ep.upgrade().filter(|ep| ep.is_custom())
    }

    // ------------------------------------------------------------------
    // Send pipeline
    // ------------------------------------------------------------------

    /// Route one message. Synchronous requests block until the reply,
    /// deadline, cancellation or peer death resolves them.
    pub fn send(self: &Arc<Self>, msg: Message) -> Result<SendReply> {
        msg.validate()?;
        let bus = self.bus()?;
        let _active = self.gate.acquire().ok_or(Error::ConnectionReset)?;
        if self.role != Role::Ordinary {
            return Err(Error::PermissionDenied);
        }

        let seq = bus.next_seq();
        let mut kmsg = Kmsg::from_user(self, seq, &msg);

        if msg.dst_id == Some(BROADCAST_ID) && msg.dst_name.is_none() {
            bus.broadcast(self, &mut kmsg);
            bus.flush_notifications();
            return Ok(SendReply::default());
        }

        // Resolve the destination, name first.
        let (dst, dst_name_id) = if let Some(name) = &msg.dst_name {
            let resolved = bus.registry().resolve(name)?;
            if let Some(dst_id) = msg.dst_id {
                if dst_id != resolved.owner_id {
                    return Err(Error::IdMismatch);
                }
            }
            if resolved.activator_held && msg.no_auto_start {
                return Err(Error::AddressNotAvailable);
            }
            (resolved.owner, resolved.name_id)
        } else {
            let dst_id = msg.dst_id.ok_or(Error::InvalidMessage("no destination"))?;
            let dst = bus.conn_by_id(dst_id).ok_or(Error::NotFound)?;
            // Monitors, activators and policy holders are not addressable
            // by id; their existence is not surfaced either.
            if dst.role != Role::Ordinary {
                return Err(Error::NotFound);
            }
            (dst, 0)
        };

        let result = self.send_unicast(&bus, dst, dst_name_id, &msg, &mut kmsg);
        bus.flush_notifications();
        result
    }

    fn send_unicast(
        self: &Arc<Self>,
        bus: &Arc<Bus>,
        dst: Arc<Connection>,
        dst_name_id: u64,
        msg: &Message,
        kmsg: &mut Kmsg,
    ) -> Result<SendReply> {
        // A reply consumes the tracker that authorized it and bypasses the
        // talk check. An interrupted synchronous tracker stays linked so
        // the restarted waiter can still find it; its pending slot is then
        // retired by the deadline sweep instead of here.
        let consumed = if msg.cookie_reply != 0 {
            let consumed = self.take_owed_tracker(dst.id(), msg.cookie_reply);
            if let Some((_, unlinked)) = &consumed {
                if *unlinked {
                    dst.note_request_finished();
                } else {
                    // Left linked for a possible restart; the sweep reaps
                    // it once resolved.
                    bus.rearm_reply_worker();
                }
            }
            consumed.map(|(tracker, _)| tracker)
        } else {
            None
        };

        if consumed.is_none() {
            check_talk(bus, self, &dst)?;
        }

        // Arm a tracker for an expected reply, or resume an interrupted
        // one so a restarted call finds its place again.
        let (tracker, resumed) = if msg.expect_reply {
            let (tracker, resumed) = self.arm_reply_tracker(bus, &dst, dst_name_id, msg)?;
            (Some(tracker), resumed)
        } else {
            (None, false)
        };

        // A resumed call's request is already queued (or answered); only
        // the wait is repeated.
        if resumed {
            let tracker = tracker.ok_or(Error::InvalidMessage("sync send without tracker"))?;
            return self.wait_sync_reply(&dst, tracker);
        }

        kmsg.grow_meta(dst_attach_flags(&dst));

        if let Some(consumed) = &consumed {
            if consumed.sync {
                // Synchronous reply: deliver straight into the waiter's
                // tracker, never touching the queue.
                self.deliver_sync_reply(&dst, consumed, kmsg)?;
                bus.mirror_to_monitors(kmsg);
                return Ok(SendReply::default());
            }
        }

        if let Err(err) = enqueue(bus, &dst, kmsg, dst_name_id, tracker.clone()) {
            if let Some(tracker) = tracker {
                self.requests_pending.fetch_sub(1, Ordering::AcqRel);
                drop(tracker);
            }
            return Err(err);
        }
        if tracker.is_some() {
            bus.rearm_reply_worker();
        }
        bus.mirror_to_monitors(kmsg);

        if msg.sync {
            let tracker = tracker.ok_or(Error::InvalidMessage("sync send without tracker"))?;
            return self.wait_sync_reply(&dst, tracker);
        }
        Ok(SendReply::default())
    }

    /// Find the tracker in our reply list matching the waiter and cookie
    /// of an outgoing reply. Unlinks it unless it belongs to an
    /// interrupted synchronous waiter (those must stay findable for
    /// restart; the sweep reaps them once resolved). The bool reports
    /// whether the tracker was unlinked.
    fn take_owed_tracker(&self, waiter_id: u64, cookie: u64) -> Option<(Arc<ReplyTracker>, bool)> {
        let mut st = self.state.lock();
        let idx = st
            .reply_list
            .iter()
            .position(|t| t.waiter_id == waiter_id && t.cookie == cookie && !t.is_resolved())?;
        let tracker = Arc::clone(&st.reply_list[idx]);
        if tracker.sync && tracker.is_interrupted() {
            return Some((tracker, false));
        }
        st.reply_list.remove(idx);
        Some((tracker, true))
    }

    fn arm_reply_tracker(
        self: &Arc<Self>,
        bus: &Arc<Bus>,
        dst: &Arc<Connection>,
        dst_name_id: u64,
        msg: &Message,
    ) -> Result<(Arc<ReplyTracker>, bool)> {
        // A restarted synchronous call re-binds to its still-linked
        // tracker instead of arming a second one; a reply that arrived
        // while the waiter was interrupted is waiting in it.
        if msg.sync {
            let dst_state = dst.state.lock();
            if let Some(existing) = dst_state
                .reply_list
                .iter()
                .find(|t| t.sync && t.waiter_id == self.id && t.cookie == msg.cookie)
            {
                existing.resume();
                return Ok((Arc::clone(existing), true));
            }
        }
        let limit = bus.limits().max_requests_pending;
        if !self.privileged && self.requests_pending.load(Ordering::Acquire) >= limit {
            return Err(Error::QuotaExceeded(Quota::RequestsPending));
        }
        self.requests_pending.fetch_add(1, Ordering::AcqRel);
        Ok((
            Arc::new(ReplyTracker::new(
                dst.id(),
                self.id,
                msg.cookie,
                dst_name_id,
                msg.timeout_ns,
                msg.sync,
            )),
            false,
        ))
    }

    fn deliver_sync_reply(
        &self,
        dst: &Arc<Connection>,
        tracker: &Arc<ReplyTracker>,
        kmsg: &Kmsg,
    ) -> Result<()> {
        let outcome = {
            let mut st = dst.state.lock();
            if !st.live {
                Err(Error::ConnectionReset)
            } else if !kmsg.fds.is_empty() && !st.accept_fds {
                Err(Error::HandlesRefused)
            } else {
                let same_ns = kmsg.meta.ns_eq(&dst.meta);
                let record =
                    kmsg.delivered_for(dst.id, tracker.name_id, st.attach_flags, same_ns);
                record.to_bytes().and_then(|bytes| {
                    let slice = st.pool.alloc(bytes.len())?;
                    st.pool.copy(slice, 0, &bytes)?;
                    st.pool.publish(slice)?;
                    st.pool.flush();
                    st.handles.extend_from_slice(&kmsg.fds);
                    Ok(ReplyDelivery {
                        offset: slice.offset(),
                        size: slice.size(),
                        fds: kmsg.fds.clone(),
                    })
                })
            }
        };
        match outcome {
            Ok(delivery) => {
                if !tracker.complete_delivered(delivery) {
                    // The waiter gave up in the meantime.
                    trace!(waiter = tracker.waiter_id, "sync reply raced waiter teardown");
                }
                Ok(())
            }
            Err(err) => {
                // The reply cannot land; the waiter must not sit out its
                // full deadline for an answer that will never come.
                tracker.complete_failed(&FAIL_BROKEN_PIPE);
                Err(err)
            }
        }
    }

    fn wait_sync_reply(
        self: &Arc<Self>,
        dst: &Arc<Connection>,
        tracker: Arc<ReplyTracker>,
    ) -> Result<SendReply> {
        match tracker.wait() {
            Ok(delivery) => Ok(SendReply {
                reply: Some(delivery),
            }),
            Err(Error::Interrupted) => Err(Error::Interrupted),
            Err(err) => {
                // Timeout, cancellation or peer death: the tracker is
                // finished; drop it from the replier's list if it is
                // still linked.
                if dst.drop_tracker(&tracker) {
                    self.requests_pending.fetch_sub(1, Ordering::AcqRel);
                }
                Err(err)
            }
        }
    }

    /// Unlink a specific tracker from our reply list. Returns whether it
    /// was still linked.
    fn drop_tracker(&self, tracker: &Arc<ReplyTracker>) -> bool {
        let mut st = self.state.lock();
        let before = st.reply_list.len();
        st.reply_list.retain(|t| !Arc::ptr_eq(t, tracker));
        st.reply_list.len() != before
    }

    // ------------------------------------------------------------------
    // Receive pipeline
    // ------------------------------------------------------------------

    /// Pick up the next queued message according to `cmd`.
    pub fn recv(&self, cmd: RecvCmd) -> Result<RecvReply> {
        if cmd.offset != 0 {
            return Err(Error::InvalidArgument("input offset must be zero"));
        }
        let bus = self.bus()?;
        let _active = self.gate.acquire().ok_or(Error::ConnectionReset)?;
        if self.role == Role::PolicyHolder {
            return Err(Error::PermissionDenied);
        }

        let mut effects = PostEffects::default();
        let reply = {
            let mut st = self.state.lock();
            let key = st.queue.peek(cmd.priority, cmd.use_priority)?;
            match cmd.mode {
                RecvMode::Peek => {
                    let Some(entry) = st.queue.get(key) else {
                        return Err(Error::Empty);
                    };
                    let slice = entry.slice;
                    st.pool.publish(slice)?;
                    st.pool.flush();
                    RecvReply {
                        offset: slice.offset(),
                        size: slice.size(),
                        fds: Vec::new(),
                    }
                }
                RecvMode::Drop => {
                    let Some(entry) = st.queue.remove(key) else {
                        return Err(Error::Empty);
                    };
                    decrement_user_count(&mut st, entry.sender_uid);
                    if let Some(tracker) = &entry.reply {
                        resolve_dead_request(&mut st, tracker, &mut effects);
                    }
                    free_entry_slice(&mut st, &entry);
                    RecvReply {
                        offset: 0,
                        size: 0,
                        fds: Vec::new(),
                    }
                }
                RecvMode::Take => {
                    let Some(entry) = st.queue.remove(key) else {
                        return Err(Error::Empty);
                    };
                    decrement_user_count(&mut st, entry.sender_uid);
                    let slice = entry.slice;
                    st.pool.publish(slice)?;
                    st.pool.flush();
                    st.handles.extend_from_slice(&entry.fds);
                    RecvReply {
                        offset: slice.offset(),
                        size: slice.size(),
                        fds: entry.fds.clone(),
                    }
                }
            }
        };
        effects.apply(&bus);
        bus.flush_notifications();
        Ok(reply)
    }

    /// Block until a message is queued or `timeout` elapses. The receive
    /// call itself never blocks; waiting is the caller's explicit opt-in.
    pub fn wait_for_message(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if !st.queue.is_empty() {
                return true;
            }
            if !st.live {
                return false;
            }
            if self.queue_cond.wait_until(&mut st, deadline).timed_out() {
                return !st.queue.is_empty();
            }
        }
    }

    /// Copy a published slice out of the pool.
    pub fn read_slice(&self, offset: usize) -> Result<Vec<u8>> {
        let st = self.state.lock();
        st.pool.read(offset).map(<[u8]>::to_vec)
    }

    /// Release a received message by its offset handle.
    pub fn free_slice(&self, offset: usize) -> Result<()> {
        let mut st = self.state.lock();
        st.pool.free(offset)
    }

    /// Handle tokens installed by receives so far, in delivery order.
    pub fn installed_handles(&self) -> Vec<u64> {
        self.state.lock().handles.clone()
    }

    // ------------------------------------------------------------------
    // Reply cancellation and deadline sweeping
    // ------------------------------------------------------------------

    /// Cancel an in-flight request this connection made, by cookie.
    pub fn cancel(&self, cookie: u64) -> Result<()> {
        let bus = self.bus()?;
        let _active = self.gate.acquire().ok_or(Error::ConnectionReset)?;
        for conn in bus.connections() {
            if conn.id == self.id {
                continue;
            }
            let mut st = conn.state.lock();
            let Some(idx) = st
                .reply_list
                .iter()
                .position(|t| t.waiter_id == self.id && t.cookie == cookie)
            else {
                continue;
            };
            let tracker = st.reply_list.remove(idx);
            drop(st);
            tracker.complete_failed(&FAIL_CANCELLED);
            self.requests_pending.fetch_sub(1, Ordering::AcqRel);
            debug!(cookie, replier = conn.id, "request cancelled");
            return Ok(());
        }
        Err(Error::NotFound)
    }

    /// Interrupt this connection's blocked synchronous request, by
    /// cookie. The wait returns `Interrupted`, but the tracker stays
    /// linked: a repeated send with the same cookie resumes the wait, and
    /// a reply arriving in between is kept for that restart.
    pub fn interrupt(&self, cookie: u64) -> Result<()> {
        let bus = self.bus()?;
        for conn in bus.connections() {
            if conn.id == self.id {
                continue;
            }
            let st = conn.state.lock();
            if let Some(tracker) = st
                .reply_list
                .iter()
                .find(|t| t.sync && t.waiter_id == self.id && t.cookie == cookie)
            {
                tracker.interrupt();
                return Ok(());
            }
        }
        Err(Error::NotFound)
    }

    /// One of this connection's outbound requests was resolved elsewhere.
    pub(crate) fn note_request_finished(&self) {
        self.requests_pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Sweep expired trackers in our reply list. Returns the nearest
    /// remaining deadline.
    pub(crate) fn sweep_replies(
        &self,
        now: u64,
        effects_out: &mut Vec<(Option<u64>, Item)>,
        dec_out: &mut Vec<u64>,
    ) -> Option<u64> {
        let mut next: Option<u64> = None;
        let track = |deadline: u64, next: &mut Option<u64>| {
            *next = Some(next.map_or(deadline, |n: u64| n.min(deadline)));
        };
        let mut st = self.state.lock();
        st.reply_list.retain(|tracker| {
            if tracker.sync {
                // Interrupted waiters stay linked until their deadline so
                // a restarted call can resume them; everything else about
                // synchronous timing is the waiter's own timed wait.
                if tracker.is_interrupted() {
                    if tracker.deadline_ns() <= now {
                        dec_out.push(tracker.waiter_id);
                        return false;
                    }
                    track(tracker.deadline_ns(), &mut next);
                    return true;
                }
                if tracker.is_resolved() {
                    dec_out.push(tracker.waiter_id);
                    return false;
                }
                return true;
            }
            if tracker.is_resolved() {
                dec_out.push(tracker.waiter_id);
                return false;
            }
            if tracker.deadline_ns() <= now {
                effects_out.push((
                    Some(tracker.waiter_id),
                    Item::ReplyTimeout {
                        cookie: tracker.cookie,
                    },
                ));
                dec_out.push(tracker.waiter_id);
                return false;
            }
            track(tracker.deadline_ns(), &mut next);
            true
        });
        next
    }

    // ------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------

    /// Acquire a well-known name.
    pub fn name_acquire(self: &Arc<Self>, name: &str, flags: u64) -> Result<AcquireOutcome> {
        let bus = self.bus()?;
        let _active = self.gate.acquire().ok_or(Error::ConnectionReset)?;
        if self.role != Role::Ordinary {
            return Err(Error::PermissionDenied);
        }
        if flags & name_flags::ACTIVATOR != 0 {
            return Err(Error::InvalidArgument(
                "activator names are fixed at creation",
            ));
        }
        if !self.privileged {
            bus.policy().check(&self.creds, name, Access::Own)?;
        }
        let (outcome, effects) = bus.registry().acquire(self, name, flags)?;
        apply_registry_effects(&bus, effects);
        bus.policy().purge_cache();
        bus.flush_notifications();
        Ok(outcome)
    }

    /// Release a well-known name; ownership transfers to the first waiter
    /// or back to the name's activator.
    pub fn name_release(self: &Arc<Self>, name: &str) -> Result<()> {
        let bus = self.bus()?;
        let _active = self.gate.acquire().ok_or(Error::ConnectionReset)?;
        let effects = bus.registry().release(self, name)?;
        apply_registry_effects(&bus, effects);
        bus.policy().purge_cache();
        bus.flush_notifications();
        Ok(())
    }

    /// Enumerate names into the caller's pool; returns the slice offset.
    pub fn name_list(&self, flags: u64) -> Result<usize> {
        let bus = self.bus()?;
        let _active = self.gate.acquire().ok_or(Error::ConnectionReset)?;
        let mut entries = Vec::new();
        if flags & list_flags::UNIQUE != 0 {
            for conn in bus.connections() {
                if conn.role == Role::Ordinary {
                    entries.push(NameListEntry {
                        id: conn.id,
                        name: None,
                        flags: 0,
                        queued: Vec::new(),
                    });
                }
            }
        }
        for info in bus.registry().snapshot() {
            let is_activator = info.flags & name_flags::ACTIVATOR != 0;
            let wanted = (is_activator && flags & list_flags::ACTIVATORS != 0)
                || (!is_activator && flags & list_flags::NAMES != 0);
            if !wanted {
                continue;
            }
            entries.push(NameListEntry {
                id: info.owner_id,
                name: Some(info.name),
                flags: info.flags,
                queued: if flags & list_flags::QUEUED != 0 {
                    info.queued
                } else {
                    Vec::new()
                },
            });
        }
        let record = NameListRecord { entries };
        self.publish_record(
            &bincode::serialize(&record)
                .map_err(|_| Error::InvalidMessage("serialization failed"))?,
        )
    }

    // ------------------------------------------------------------------
    // Information queries
    // ------------------------------------------------------------------

    /// Look up a connection and render its metadata into the caller's
    /// pool.
    pub fn conn_info(&self, query: InfoQuery, attach_flags: u64) -> Result<usize> {
        let bus = self.bus()?;
        let _active = self.gate.acquire().ok_or(Error::ConnectionReset)?;
        let target = match &query {
            InfoQuery::Id(id) => bus.conn_by_id(*id).ok_or(Error::NotFound)?,
            InfoQuery::Name(name) => {
                if !self.privileged {
                    check_see(&bus, self, name)?;
                }
                bus.registry().resolve(name)?.owner
            }
        };
        let mut meta = target.meta.duplicate();
        meta.collect_names(attach_flags, &target.owned_names());
        meta.collect_description(attach_flags, target.description());
        let same_ns = meta.ns_eq(&self.meta);
        let record = ConnInfoRecord {
            id: target.id,
            meta: meta.filtered(attach_flags, same_ns),
        };
        self.publish_record(
            &bincode::serialize(&record)
                .map_err(|_| Error::InvalidMessage("serialization failed"))?,
        )
    }

    /// Render the bus creator's metadata into the caller's pool.
    pub fn bus_creator_info(&self, attach_flags: u64) -> Result<usize> {
        let bus = self.bus()?;
        let _active = self.gate.acquire().ok_or(Error::ConnectionReset)?;
        let creator_meta = bus.creator_meta();
        let same_ns = creator_meta.ns_eq(&self.meta);
        let record = ConnInfoRecord {
            id: KERNEL_ID,
            meta: creator_meta.filtered(attach_flags, same_ns),
        };
        self.publish_record(
            &bincode::serialize(&record)
                .map_err(|_| Error::InvalidMessage("serialization failed"))?,
        )
    }

    fn publish_record(&self, bytes: &[u8]) -> Result<usize> {
        let mut st = self.state.lock();
        let slice = st.pool.alloc(bytes.len())?;
        st.pool.copy(slice, 0, bytes)?;
        st.pool.publish(slice)?;
        st.pool.flush();
        Ok(slice.offset())
    }

    // ------------------------------------------------------------------
    // Matches and updates
    // ------------------------------------------------------------------

    /// Register a broadcast/notification subscription rule.
    pub fn match_add(&self, rule: MatchRule) -> Result<()> {
        let _active = self.gate.acquire().ok_or(Error::ConnectionReset)?;
        self.match_db.add(rule)
    }

    /// Remove subscription rules by cookie.
    pub fn match_remove(&self, cookie: u64) -> Result<()> {
        let _active = self.gate.acquire().ok_or(Error::ConnectionReset)?;
        self.match_db.remove(cookie)
    }

    pub(crate) fn match_db(&self) -> &MatchDb {
        &self.match_db
    }

    /// Mutate connection-local attach flags, or the policy rules a policy
    /// holder maintains.
    pub fn update(&self, cmd: UpdateCmd) -> Result<()> {
        let bus = self.bus()?;
        let _active = self.gate.acquire().ok_or(Error::ConnectionReset)?;
        match cmd {
            UpdateCmd::AttachFlags(flags) => {
                if !matches!(self.role, Role::Ordinary | Role::Monitor) {
                    return Err(Error::PermissionDenied);
                }
                if flags & !attach::ALL != 0 {
                    return Err(Error::InvalidArgument("unknown attach flag"));
                }
                self.state.lock().attach_flags = flags;
                Ok(())
            }
            UpdateCmd::Policy(rules) => {
                if self.role != Role::PolicyHolder {
                    return Err(Error::PermissionDenied);
                }
                bus.update_holder_policy(self.id, rules);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Voluntary disconnect. Refused while the receive queue still holds
    /// messages.
    pub fn byebye(self: &Arc<Self>) -> Result<()> {
        {
            let st = self.state.lock();
            if !st.live {
                return Err(Error::AlreadyDone);
            }
            if !st.queue.is_empty() {
                return Err(Error::Busy);
            }
        }
        self.disconnect()
    }

    /// Forced teardown, the path the transport layer takes when the
    /// external handle closes. Idempotent: the second caller observes
    /// `AlreadyDone`.
    pub fn disconnect(self: &Arc<Self>) -> Result<()> {
        let bus = self.bus()?;
        if !self.gate.begin_close() {
            return Err(Error::AlreadyDone);
        }
        debug!(conn = self.id, "disconnecting");

        // Stop new enqueues and wake parked receivers before waiting out
        // in-flight operations.
        {
            let mut st = self.state.lock();
            st.live = false;
        }
        self.queue_cond.notify_all();
        self.gate.wait_drained();

        // Out of the bus hash, endpoint list and monitor list.
        bus.remove_conn(self.id);
        if let Some(domain) = bus.domain() {
            domain.release_connection(self.creds.uid);
        }

        // Release names; queued messages ride back to activators.
        let effects = bus.registry().remove_by_conn(self);
        apply_registry_effects(&bus, effects);

        // Drain the receive queue: requests that were never picked up
        // resolve their trackers as dead.
        let mut post = PostEffects::default();
        {
            let mut st = self.state.lock();
            while let Some(entry) = st.queue.pop_front() {
                decrement_user_count(&mut st, entry.sender_uid);
                if let Some(tracker) = &entry.reply {
                    resolve_dead_request(&mut st, tracker, &mut post);
                }
                free_entry_slice(&mut st, &entry);
            }
            // Drain the reply list: requests already received but never
            // answered.
            let owed: Vec<_> = st.reply_list.drain(..).collect();
            for tracker in owed {
                post.dec_pending.push(tracker.waiter_id);
                if tracker.sync {
                    tracker.complete_failed(&FAIL_BROKEN_PIPE);
                } else {
                    tracker.complete_failed(&FAIL_BROKEN_PIPE);
                    post.notify.push((
                        Some(tracker.waiter_id),
                        Item::ReplyDead {
                            cookie: tracker.cookie,
                        },
                    ));
                }
            }
        }
        post.apply(&bus);

        // Policy caches may hold decisions about this principal.
        bus.policy().purge_cache();
        bus.update_holder_policy(self.id, Vec::new());

        // Departure notification goes out after every reply-dead above.
        if self.role != Role::Monitor {
            bus.queue_notification(None, Item::IdRemove(self.id));
        }
        bus.flush_notifications();
        Ok(())
    }
}

fn dst_attach_flags(dst: &Connection) -> u64 {
    dst.state.lock().attach_flags
}

/// Resolve the tracker of a request that will never be answered because
/// its queue entry is being discarded.
fn resolve_dead_request(
    st: &mut ConnState,
    tracker: &Arc<ReplyTracker>,
    effects: &mut PostEffects,
) {
    let before = st.reply_list.len();
    st.reply_list.retain(|t| !Arc::ptr_eq(t, tracker));
    if st.reply_list.len() == before {
        // Already unlinked by a racing path; nothing left to resolve.
        return;
    }
    effects.dec_pending.push(tracker.waiter_id);
    if tracker.sync {
        tracker.complete_failed(&FAIL_BROKEN_PIPE);
    } else {
        tracker.complete_failed(&FAIL_BROKEN_PIPE);
        effects.notify.push((
            Some(tracker.waiter_id),
            Item::ReplyDead {
                cookie: tracker.cookie,
            },
        ));
    }
}

fn free_entry_slice(st: &mut ConnState, entry: &QueueEntry) {
    // Peeked entries were already published; untouched ones were not.
    if st.pool.free(entry.slice.offset()).is_err() {
        if let Err(err) = st.pool.free_private(entry.slice) {
            warn!(?err, "leaking a queue slice");
        }
    }
}

fn decrement_user_count(st: &mut ConnState, uid: u32) {
    if let Some(users) = st.msg_users.as_mut() {
        if let Some(count) = users.get_mut(&uid) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                users.remove(&uid);
            }
        }
    }
}

/// TALK authorization for a unicast: the custom endpoint policy is
/// consulted first and its denial is fatal (masked as NotFound so
/// existence does not leak); then the implicit grants; then the bus
/// database.
fn check_talk(bus: &Arc<Bus>, src: &Connection, dst: &Connection) -> Result<()> {
    let dst_names = dst.owned_names();
    if let Some(ep) = src.custom_endpoint() {
        if let Some(db) = ep.custom_policy() {
            db.check_talk_any(&src.creds(), &dst_names)
                .map_err(|_| Error::NotFound)?;
        }
    }
    if src.is_privileged() || src.creds().uid == dst.creds().uid {
        return Ok(());
    }
    bus.policy().check_talk_any(&src.creds(), &dst_names)
}

/// SEE authorization for name queries. A custom endpoint's database is
/// authoritative and its denial masquerades as NotFound.
fn check_see(bus: &Arc<Bus>, conn: &Connection, name: &str) -> Result<()> {
    if let Some(ep) = conn.custom_endpoint() {
        if let Some(db) = ep.custom_policy() {
            return db
                .check(&conn.creds(), name, Access::See)
                .map_err(|_| Error::NotFound);
        }
    }
    bus.policy().check(&conn.creds(), name, Access::See)
}

/// Enqueue one message into `dst`: validate liveness, handle acceptance
/// and quotas, allocate and fill a pool slice, link the entry, wake the
/// receiver.
pub(crate) fn enqueue(
    bus: &Arc<Bus>,
    dst: &Arc<Connection>,
    kmsg: &Kmsg,
    dst_name_id: u64,
    reply: Option<Arc<ReplyTracker>>,
) -> Result<()> {
    let limits = bus.limits();
    let mut st = dst.state.lock();
    if !st.live {
        return Err(Error::ConnectionReset);
    }
    if !kmsg.fds.is_empty() && !st.accept_fds {
        return Err(Error::HandlesRefused);
    }

    if !kmsg.sender_privileged {
        if st.queue.len() >= limits.max_msgs {
            return Err(Error::QuotaExceeded(Quota::Messages));
        }
        // Per-user accounting materializes only once the queue length
        // first crosses the per-user bound; the scan seeds every sender
        // with its true backlog.
        if st.msg_users.is_none() && st.queue.len() >= limits.max_msgs_per_user {
            let mut users: HashMap<u32, usize> = HashMap::new();
            for entry in st.queue.iter() {
                *users.entry(entry.sender_uid).or_insert(0) += 1;
            }
            st.msg_users = Some(users);
        }
        if let Some(users) = st.msg_users.as_ref() {
            let count = users.get(&kmsg.sender_uid).copied().unwrap_or(0);
            if count >= limits.max_msgs_per_user {
                return Err(Error::QuotaExceeded(Quota::MessagesPerUser));
            }
        }
    }

    let same_ns = kmsg.meta.ns_eq(&dst.meta);
    let record = kmsg.delivered_for(dst.id, dst_name_id, st.attach_flags, same_ns);
    let bytes = record.to_bytes()?;
    let slice = st.pool.alloc(bytes.len())?;
    st.pool.copy(slice, 0, &bytes)?;

    if let Some(tracker) = &reply {
        st.reply_list.push(Arc::clone(tracker));
    }
    if !kmsg.sender_privileged {
        if let Some(users) = st.msg_users.as_mut() {
            *users.entry(kmsg.sender_uid).or_insert(0) += 1;
        }
    }
    st.queue.add(QueueEntry {
        slice,
        src_id: kmsg.src_id,
        sender_uid: kmsg.sender_uid,
        cookie: kmsg.cookie,
        priority: kmsg.priority,
        seq: kmsg.seq,
        dst_name_id,
        fds: kmsg.fds.clone(),
        reply,
    });
    drop(st);
    dst.queue_cond.notify_all();
    trace!(dst = dst.id, seq = kmsg.seq, "message enqueued");
    Ok(())
}

/// Apply name-registry effects after the registry lock has been dropped:
/// move retargeted queue entries between pools and queue the ownership
/// notifications.
pub(crate) fn apply_registry_effects(bus: &Arc<Bus>, effects: RegistryEffects) {
    for handoff in effects.handoffs {
        apply_handoff(&handoff);
    }
    for event in effects.events {
        let item = match event.kind {
            NotifyKind::NameAdd => Item::NameAdd(event.transition),
            NotifyKind::NameRemove => Item::NameRemove(event.transition),
            _ => Item::NameChange(event.transition),
        };
        bus.queue_notification(None, item);
    }
}

fn apply_handoff(handoff: &Handoff) {
    let Handoff { from, to, name_id } = handoff;
    if from.id() == to.id() {
        return;
    }
    // Two connection locks: order by id so concurrent handoffs cannot
    // deadlock.
    let (first, second) = if from.id() < to.id() {
        (&**from, &**to)
    } else {
        (&**to, &**from)
    };
    let mut first_st = first.state.lock();
    let mut second_st = second.state.lock();
    let (from_st, to_st) = if from.id() < to.id() {
        (&mut *first_st, &mut *second_st)
    } else {
        (&mut *second_st, &mut *first_st)
    };

    let keys: Vec<_> = from_st
        .queue
        .iter()
        .filter(|entry| entry.dst_name_id == *name_id)
        .map(QueueEntry::key)
        .collect();
    for key in keys {
        let Some(entry) = from_st.queue.remove(key) else {
            continue;
        };
        decrement_user_count(from_st, entry.sender_uid);
        match from_st.pool.move_to(entry.slice, &mut to_st.pool) {
            Ok(slice) => {
                to_st.queue.add(QueueEntry { slice, ..entry });
            }
            Err(err) => {
                // Destination pool full: the message is dropped, the same
                // as any per-receiver delivery failure.
                warn!(?err, "dropping a message during name handoff");
                free_entry_slice(from_st, &entry);
            }
        }
    }
    drop(first_st);
    drop(second_st);
    to.queue_cond.notify_all();
}

/// Broadcast-eligibility for one receiver: endpoint visibility, the
/// publisher/subscriber talk asymmetry, then name visibility.
pub(crate) fn may_broadcast(bus: &Arc<Bus>, src: &Connection, dst: &Connection) -> bool {
    let src_names = src.owned_names();
    let dst_names = dst.owned_names();

    if let Some(ep) = dst.custom_endpoint() {
        if let Some(db) = ep.custom_policy() {
            if db.check_talk_any(&src.creds(), &dst_names).is_err() {
                return false;
            }
        }
    }

    let talk_ok = src.is_privileged()
        || src.creds().uid == dst.creds().uid
        || (!src_names.is_empty() && dst_names.is_empty())
        || bus.policy().check_talk_any(&src.creds(), &dst_names).is_ok();
    if !talk_ok {
        return false;
    }

    // The receiver must be allowed to see at least one of the sender's
    // names, when the sender has any.
    if src_names.is_empty() || dst.is_privileged() || dst.creds().uid == src.creds().uid {
        return true;
    }
    src_names
        .iter()
        .any(|name| bus.policy().check(&dst.creds(), name, Access::See).is_ok())
}

/// Deliver `kmsg` to one fan-out receiver; failures are reported for
/// logging but never propagate.
pub(crate) fn deliver_broadcast(
    bus: &Arc<Bus>,
    dst: &Arc<Connection>,
    kmsg: &mut Kmsg,
) -> Result<()> {
    kmsg.grow_meta(dst_attach_flags(dst));
    enqueue(bus, dst, kmsg, 0, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BusCreateRequest, Domain};
    use crate::endpoint::{process_creds, HelloRequest};

    fn setup() -> (Arc<crate::domain::Domain>, Arc<Bus>) {
        let domain = Domain::new();
        let creds = process_creds();
        let bus = domain
            .create_bus(BusCreateRequest {
                name: format!("{}-conntest", creds.uid),
                ..Default::default()
            })
            .unwrap();
        (domain, bus)
    }

    fn hello(bus: &Arc<Bus>) -> Arc<Connection> {
        bus.default_endpoint().hello(HelloRequest::default()).unwrap().0
    }

    fn payload_msg(dst: u64, cookie: u64, bytes: &[u8]) -> Message {
        Message {
            dst_id: Some(dst),
            cookie,
            items: vec![Item::PayloadVec(bytes.to_vec())],
            ..Default::default()
        }
    }

    /// A basic unicast lands in the receiver's pool with source id and
    /// cookie intact, and the queue drains on receive.
    #[test]
    fn unicast_lands_in_pool() {
        let (_domain, bus) = setup();
        let a = hello(&bus);
        let b = hello(&bus);

        a.send(payload_msg(b.id(), 7, b"hi")).unwrap();
        assert_eq!(b.queue_len(), 1);

        let got = b.recv(RecvCmd::default()).unwrap();
        let record = DeliveredMessage::from_bytes(&b.read_slice(got.offset).unwrap()).unwrap();
        assert_eq!(record.src_id, a.id());
        assert_eq!(record.cookie, 7);
        assert_eq!(record.payload, vec![Item::PayloadVec(b"hi".to_vec())]);
        assert_eq!(b.queue_len(), 0);
        b.free_slice(got.offset).unwrap();
    }

    /// Receive on an empty queue reports Empty rather than blocking.
    #[test]
    fn recv_empty_queue() {
        let (_domain, bus) = setup();
        let a = hello(&bus);
        assert!(matches!(a.recv(RecvCmd::default()), Err(Error::Empty)));
    }

    /// Priority bands deliver high-first, FIFO within a band.
    #[test]
    fn recv_priority_order() {
        let (_domain, bus) = setup();
        let a = hello(&bus);
        let b = hello(&bus);
        for (cookie, priority) in [(1u64, 0i64), (2, 5), (3, 5), (4, -2)] {
            let mut msg = payload_msg(b.id(), cookie, b"x");
            msg.priority = priority;
            a.send(msg).unwrap();
        }
        let mut cookies = Vec::new();
        while let Ok(got) = b.recv(RecvCmd::default()) {
            let record =
                DeliveredMessage::from_bytes(&b.read_slice(got.offset).unwrap()).unwrap();
            cookies.push(record.cookie);
        }
        assert_eq!(cookies, vec![2, 3, 1, 4]);
    }

    /// Peek reports the head without consuming it; drop discards it.
    #[test]
    fn peek_then_drop() {
        let (_domain, bus) = setup();
        let a = hello(&bus);
        let b = hello(&bus);
        a.send(payload_msg(b.id(), 9, b"peeked")).unwrap();

        let peeked = b
            .recv(RecvCmd {
                mode: RecvMode::Peek,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(b.queue_len(), 1);
        assert!(b.read_slice(peeked.offset).is_ok());

        b.recv(RecvCmd {
            mode: RecvMode::Drop,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(b.queue_len(), 0);
    }

    /// Monitors are invisible to id addressing.
    #[test]
    fn monitor_not_addressable() {
        let (_domain, bus) = setup();
        let a = hello(&bus);
        let (monitor, _) = bus
            .default_endpoint()
            .hello(HelloRequest {
                role: Role::Monitor,
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(
            a.send(payload_msg(monitor.id(), 1, b"x")),
            Err(Error::NotFound)
        ));
    }

    /// Handle tokens ride along when the receiver accepts them and are
    /// refused otherwise.
    #[test]
    fn handle_transfer_and_refusal() {
        let (_domain, bus) = setup();
        let a = hello(&bus);
        let b = hello(&bus);
        let (no_fds, _) = bus
            .default_endpoint()
            .hello(HelloRequest {
                accept_fds: false,
                ..Default::default()
            })
            .unwrap();

        let mut msg = payload_msg(b.id(), 1, b"x");
        msg.items.push(Item::Fds(vec![41, 42]));
        a.send(msg).unwrap();
        let got = b.recv(RecvCmd::default()).unwrap();
        assert_eq!(got.fds, vec![41, 42]);
        assert_eq!(b.installed_handles(), vec![41, 42]);

        let mut refused = payload_msg(no_fds.id(), 2, b"x");
        refused.items.push(Item::Fds(vec![7]));
        assert!(matches!(
            a.send(refused),
            Err(Error::HandlesRefused)
        ));
    }

    /// ByeBye: refused while the queue holds messages, idempotence error
    /// on repetition.
    #[test]
    fn byebye_semantics() {
        let (_domain, bus) = setup();
        let a = hello(&bus);
        let b = hello(&bus);
        a.send(payload_msg(b.id(), 1, b"x")).unwrap();
        assert!(matches!(b.byebye(), Err(Error::Busy)));

        let got = b.recv(RecvCmd::default()).unwrap();
        b.free_slice(got.offset).unwrap();
        b.byebye().unwrap();
        assert!(matches!(b.byebye(), Err(Error::AlreadyDone)));
        assert!(matches!(
            a.send(payload_msg(b.id(), 2, b"x")),
            Err(Error::NotFound)
        ));
    }

    /// Requested metadata is attached per the receiver's flags.
    #[test]
    fn metadata_attached_per_receiver() {
        let (_domain, bus) = setup();
        let a = hello(&bus);
        let (b, _) = bus
            .default_endpoint()
            .hello(HelloRequest {
                attach_flags: attach::CREDS | attach::TIMESTAMP,
                ..Default::default()
            })
            .unwrap();

        a.send(payload_msg(b.id(), 3, b"meta")).unwrap();
        let got = b.recv(RecvCmd::default()).unwrap();
        let record = DeliveredMessage::from_bytes(&b.read_slice(got.offset).unwrap()).unwrap();
        assert!(record.meta.iter().any(|i| matches!(i, Item::Creds(_))));
        assert!(record
            .meta
            .iter()
            .any(|i| matches!(i, Item::Timestamp { .. })));
        assert!(!record.meta.iter().any(|i| matches!(i, Item::Exe(_))));
    }

    /// conn_info renders the target's identity into the caller's pool.
    #[test]
    fn conn_info_round_trip() {
        let (_domain, bus) = setup();
        let a = hello(&bus);
        let b = hello(&bus);
        let offset = a
            .conn_info(InfoQuery::Id(b.id()), attach::CREDS)
            .unwrap();
        let record: ConnInfoRecord =
            bincode::deserialize(&a.read_slice(offset).unwrap()).unwrap();
        assert_eq!(record.id, b.id());
        assert!(record.meta.iter().any(|i| matches!(i, Item::Creds(_))));
    }

    /// The sequence stamp increases monotonically across messages.
    #[test]
    fn seq_is_monotonic() {
        let (_domain, bus) = setup();
        let a = hello(&bus);
        let b = hello(&bus);
        let mut last = 0;
        for cookie in 1..=4u64 {
            a.send(payload_msg(b.id(), cookie, b"s")).unwrap();
            let got = b.recv(RecvCmd::default()).unwrap();
            let record =
                DeliveredMessage::from_bytes(&b.read_slice(got.offset).unwrap()).unwrap();
            assert!(record.seq > last);
            last = record.seq;
        }
    }
}
