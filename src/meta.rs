//! # Metadata Collector
//!
//! Snapshots sender credentials and identity into an immutable, ordered
//! item stream. Receivers opt into fields with attach flags; a message's
//! metadata buffer grows monotonically as receivers request fields during
//! fan-out, and every receiver sees only its own filtered view.
//!
//! Collection reads the calling process's state at call time. When a
//! connection was created on behalf of another principal (impersonation by
//! a privileged caller), the impersonated snapshot is duplicated instead
//! and may only be extended with owned names and the connection
//! description.

use std::fs;

use crate::item::{Audit, Caps, Creds, Item};
use crate::util::{current_timestamp_ns, monotonic_ns};

/// Attach flags: one bit per collectible metadata field.
pub mod attach {
    pub const TIMESTAMP: u64 = 1 << 0;
    pub const CREDS: u64 = 1 << 1;
    pub const PID_COMM: u64 = 1 << 2;
    pub const TID_COMM: u64 = 1 << 3;
    pub const EXE: u64 = 1 << 4;
    pub const CMDLINE: u64 = 1 << 5;
    pub const CGROUP: u64 = 1 << 6;
    pub const CAPS: u64 = 1 << 7;
    pub const SECLABEL: u64 = 1 << 8;
    pub const AUDIT: u64 = 1 << 9;
    pub const NAMES: u64 = 1 << 10;
    pub const CONN_DESCRIPTION: u64 = 1 << 11;

    /// Every collectible field.
    pub const ALL: u64 = (1 << 12) - 1;

    /// Fields that reveal the principal's identity. These are withheld
    /// from readers in a different pid or user namespace.
    pub const IDENTITY: u64 =
        CREDS | PID_COMM | TID_COMM | EXE | CMDLINE | CGROUP | CAPS | SECLABEL | AUDIT;
}

/// Pid- and user-namespace identity captured with a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NsIds {
    pid_ns: u64,
    user_ns: u64,
}

fn read_ns_id(which: &str) -> u64 {
    // The link target looks like "pid:[4026531836]".
    let path = format!("/proc/self/ns/{}", which);
    fs::read_link(path)
        .ok()
        .and_then(|target| {
            let s = target.to_string_lossy().into_owned();
            let inner = s.split('[').nth(1)?.trim_end_matches(']').to_owned();
            inner.parse().ok()
        })
        .unwrap_or(0)
}

impl NsIds {
    fn current() -> Self {
        NsIds {
            pid_ns: read_ns_id("pid"),
            user_ns: read_ns_id("user"),
        }
    }
}

fn current_creds() -> Creds {
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

fn read_proc_string(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim_end_matches('\n').to_owned())
}

fn read_caps() -> Caps {
    let mut caps = Caps::default();
    if let Ok(status) = fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            let mut parse = |prefix: &str| -> Option<u64> {
                let rest = line.strip_prefix(prefix)?;
                u64::from_str_radix(rest.trim(), 16).ok()
            };
            if let Some(v) = parse("CapEff:") {
                caps.effective = v;
            } else if let Some(v) = parse("CapPrm:") {
                caps.permitted = v;
            } else if let Some(v) = parse("CapInh:") {
                caps.inheritable = v;
            }
        }
    }
    caps
}

/// An immutable credential/identity item buffer.
///
/// Items are appended exactly once per field; already-collected fields are
/// never re-read, so a buffer shared across a broadcast fan-out stays
/// coherent while it grows.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Attach-flag bits of the fields present in `items`.
    collected: u64,
    /// Collected fields, each tagged with its attach-flag bit.
    items: Vec<(u64, Item)>,
    ns: NsIds,
    /// Set for impersonated snapshots: only names and description may be
    /// appended after duplication.
    restricted: bool,
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

impl Metadata {
    /// An empty buffer bound to the calling process's namespaces.
    pub fn new() -> Self {
        Metadata {
            collected: 0,
            items: Vec::new(),
            ns: NsIds::current(),
            restricted: false,
        }
    }

    /// Seed a buffer from impersonated credentials supplied at hello by a
    /// privileged caller. The result is restricted: later collection only
    /// accepts owned names and the connection description.
    pub fn from_impersonated(creds: Creds, seclabel: Option<String>) -> Self {
        let mut items = vec![(attach::CREDS, Item::Creds(creds))];
        let mut collected = attach::CREDS;
        if let Some(label) = seclabel {
            items.push((attach::SECLABEL, Item::Seclabel(label)));
            collected |= attach::SECLABEL;
        }
        Metadata {
            collected,
            items,
            ns: NsIds::current(),
            restricted: true,
        }
    }

    /// Duplicate for per-message use; the restriction bit survives.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Attach-flag bits of the collected fields.
    pub fn collected(&self) -> u64 {
        self.collected
    }

    /// The credentials item, when collected.
    pub fn creds(&self) -> Option<Creds> {
        self.items.iter().find_map(|(_, item)| match item {
            Item::Creds(creds) => Some(*creds),
            _ => None,
        })
    }

    fn push(&mut self, flag: u64, item: Item) {
        if self.collected & flag == 0 {
            self.items.push((flag, item));
            self.collected |= flag;
        }
    }

    /// Snapshot the requested fields that are still missing.
    ///
    /// Restricted buffers ignore every snapshot field; names and the
    /// description arrive through [`Metadata::collect_names`] and
    /// [`Metadata::collect_description`] instead.
    pub fn collect(&mut self, flags: u64) {
        if self.restricted {
            return;
        }
        let wanted = flags & !self.collected;
        if wanted & attach::TIMESTAMP != 0 {
            self.push(
                attach::TIMESTAMP,
                Item::Timestamp {
                    monotonic_ns: monotonic_ns(),
                    realtime_ns: current_timestamp_ns(),
                },
            );
        }
        if wanted & attach::CREDS != 0 {
            self.push(attach::CREDS, Item::Creds(current_creds()));
        }
        if wanted & attach::PID_COMM != 0 {
            if let Some(comm) = read_proc_string("/proc/self/comm") {
                self.push(attach::PID_COMM, Item::PidComm(comm));
            }
        }
        if wanted & attach::TID_COMM != 0 {
            if let Some(comm) = read_proc_string("/proc/self/comm") {
                self.push(attach::TID_COMM, Item::TidComm(comm));
            }
        }
        if wanted & attach::EXE != 0 {
            if let Ok(path) = fs::read_link("/proc/self/exe") {
                self.push(attach::EXE, Item::Exe(path.to_string_lossy().into_owned()));
            }
        }
        if wanted & attach::CMDLINE != 0 {
            if let Ok(raw) = fs::read_to_string("/proc/self/cmdline") {
                let args = raw
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect();
                self.push(attach::CMDLINE, Item::Cmdline(args));
            }
        }
        if wanted & attach::CGROUP != 0 {
            if let Some(line) = read_proc_string("/proc/self/cgroup")
                .and_then(|s| s.lines().next().map(str::to_owned))
            {
                self.push(attach::CGROUP, Item::Cgroup(line));
            }
        }
        if wanted & attach::CAPS != 0 {
            self.push(attach::CAPS, Item::Caps(read_caps()));
        }
        if wanted & attach::SECLABEL != 0 {
            if let Some(label) = read_proc_string("/proc/self/attr/current") {
                let label = label.trim_end_matches('\0').to_owned();
                if !label.is_empty() {
                    self.push(attach::SECLABEL, Item::Seclabel(label));
                }
            }
        }
        if wanted & attach::AUDIT != 0 {
            let loginuid = read_proc_string("/proc/self/loginuid")
                .and_then(|s| s.parse().ok())
                .unwrap_or(u32::MAX);
            let sessionid = read_proc_string("/proc/self/sessionid")
                .and_then(|s| s.parse().ok())
                .unwrap_or(u32::MAX);
            self.push(attach::AUDIT, Item::Audit(Audit { loginuid, sessionid }));
        }
    }

    /// Record the sender's owned names; allowed on restricted buffers.
    pub fn collect_names(&mut self, flags: u64, names: &[String]) {
        if flags & attach::NAMES != 0 {
            self.push(attach::NAMES, Item::OwnedNames(names.to_vec()));
        }
    }

    /// Record the connection description; allowed on restricted buffers.
    pub fn collect_description(&mut self, flags: u64, description: Option<&str>) {
        if flags & attach::CONN_DESCRIPTION != 0 {
            if let Some(desc) = description {
                self.push(attach::CONN_DESCRIPTION, Item::ConnDescription(desc.to_owned()));
            }
        }
    }

    /// Two buffers are namespace-equal when their captured pid- and
    /// user-namespace identities coincide.
    pub fn ns_eq(&self, other: &Metadata) -> bool {
        self.ns == other.ns
    }

    /// The reader's view: collected items restricted to `flags`, with
    /// identity-bearing items withheld from cross-namespace readers.
    pub fn filtered(&self, flags: u64, same_ns: bool) -> Vec<Item> {
        let mut visible = flags;
        if !same_ns {
            visible &= !attach::IDENTITY;
        }
        self.items
            .iter()
            .filter(|(flag, _)| flag & visible != 0)
            .map(|(_, item)| item.clone())
            .collect()
    }
}
