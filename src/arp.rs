//! Address resolution (RFC 826).
//!
//! A cache of IPv4 → MAC mappings plus the retry/timeout state
//! machine around it. Each entry is either incomplete (a resolution
//! request is in flight, at most one outbound packet parked on it) or
//! resolved (valid link address with an expiry deadline, unless
//! static). Timer-driven behavior hangs on one clock callout per
//! entry: retries while incomplete, refresh-or-discard on expiry.
//!
//! `resolve` never blocks. It reports `WouldBlock` while resolution is
//! in flight and `Unreachable` once the retry budget is spent; the
//! caller owns the backoff policy.
//!
//! The pending slot holds a single packet. A newer packet displaces
//! (and discards) an older one: bounded memory per entry, at the cost
//! of losing the displaced frame. Known lossy, and intentional.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::clock::{CalloutId, Clock};
use crate::ethernet::{build_ethernet_frame, EthAddr, ETHERTYPE_ARP, ETH_HEADER_LEN};
use crate::ipv4::Ipv4Addr;
use crate::pkt::PktBuf;
use crate::sync::{LockFlags, Mutex, RwLock};

// ============================================================================
// Wire Constants (RFC 826)
// ============================================================================

/// Hardware type: Ethernet.
pub const HTYPE_ETHERNET: u16 = 1;

/// Protocol type: IPv4.
pub const PTYPE_IPV4: u16 = 0x0800;

/// Hardware address length: Ethernet MAC.
pub const HLEN_ETHERNET: u8 = 6;

/// Protocol address length: IPv4.
pub const PLEN_IPV4: u8 = 4;

/// Operation: request.
pub const OPCODE_REQUEST: u16 = 1;

/// Operation: reply.
pub const OPCODE_REPLY: u16 = 2;

/// ARP packet size for Ethernet/IPv4.
pub const ARP_PACKET_LEN: usize = 28;

// ============================================================================
// Configuration
// ============================================================================

/// ARP engine tunables.
#[derive(Debug, Clone, Copy)]
pub struct ArpConfig {
    /// Lifetime of a resolved, non-static entry.
    pub ttl_ms: u64,
    /// Interval between resolution requests for an incomplete entry.
    pub retry_ms: u64,
    /// Resolution requests sent before an address is declared
    /// unreachable.
    pub max_retries: u32,
    /// A cache hit this close to expiry triggers an opportunistic
    /// refresh request without blocking the caller.
    pub refresh_margin_ms: u64,
}

impl Default for ArpConfig {
    fn default() -> Self {
        ArpConfig {
            ttl_ms: 20 * 60 * 1000,
            retry_ms: 1000,
            max_retries: 5,
            refresh_margin_ms: 60_000,
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// ARP operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request,
    Reply,
}

impl ArpOp {
    pub fn from_raw(op: u16) -> Option<Self> {
        match op {
            OPCODE_REQUEST => Some(ArpOp::Request),
            OPCODE_REPLY => Some(ArpOp::Reply),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            ArpOp::Request => OPCODE_REQUEST,
            ArpOp::Reply => OPCODE_REPLY,
        }
    }
}

/// Parsed ARP packet for Ethernet/IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub sender_hw: EthAddr,
    pub sender_ip: Ipv4Addr,
    pub target_hw: EthAddr,
    pub target_ip: Ipv4Addr,
    pub op: ArpOp,
}

/// Errors from ARP processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpError {
    /// Packet is too short.
    Truncated,
    /// Hardware type is not Ethernet.
    InvalidHardwareType,
    /// Protocol type is not IPv4.
    InvalidProtocolType,
    /// Address lengths are not 6/4.
    InvalidAddressLength,
    /// Unknown operation code.
    InvalidOpcode,
    /// Sender address is broadcast/multicast/zero.
    InvalidSender,
    /// Update would rebind an established or static mapping.
    CacheConflict,
}

/// Parse an ARP packet from an Ethernet payload.
///
/// Validates the fixed fields and rejects senders that cannot be a
/// real host (broadcast/multicast/zero MAC, unspecified IP).
pub fn parse_arp(buf: &[u8]) -> Result<ArpPacket, ArpError> {
    if buf.len() < ARP_PACKET_LEN {
        return Err(ArpError::Truncated);
    }

    let htype = u16::from_be_bytes([buf[0], buf[1]]);
    if htype != HTYPE_ETHERNET {
        return Err(ArpError::InvalidHardwareType);
    }
    let ptype = u16::from_be_bytes([buf[2], buf[3]]);
    if ptype != PTYPE_IPV4 {
        return Err(ArpError::InvalidProtocolType);
    }
    if buf[4] != HLEN_ETHERNET || buf[5] != PLEN_IPV4 {
        return Err(ArpError::InvalidAddressLength);
    }
    let op = ArpOp::from_raw(u16::from_be_bytes([buf[6], buf[7]])).ok_or(ArpError::InvalidOpcode)?;

    let mut sender_hw = [0u8; 6];
    sender_hw.copy_from_slice(&buf[8..14]);
    let sender_hw = EthAddr(sender_hw);
    let sender_ip = Ipv4Addr([buf[14], buf[15], buf[16], buf[17]]);
    let mut target_hw = [0u8; 6];
    target_hw.copy_from_slice(&buf[18..24]);
    let target_hw = EthAddr(target_hw);
    let target_ip = Ipv4Addr([buf[24], buf[25], buf[26], buf[27]]);

    if sender_hw.is_broadcast() || sender_hw.is_multicast() || sender_hw == EthAddr::ZERO {
        return Err(ArpError::InvalidSender);
    }
    if sender_ip.is_unspecified() {
        return Err(ArpError::InvalidSender);
    }

    Ok(ArpPacket {
        sender_hw,
        sender_ip,
        target_hw,
        target_ip,
        op,
    })
}

/// Serialize an ARP packet into its 28-byte wire form.
pub fn serialize_arp(pkt: &ArpPacket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ARP_PACKET_LEN);
    buf.extend_from_slice(&HTYPE_ETHERNET.to_be_bytes());
    buf.extend_from_slice(&PTYPE_IPV4.to_be_bytes());
    buf.push(HLEN_ETHERNET);
    buf.push(PLEN_IPV4);
    buf.extend_from_slice(&pkt.op.to_raw().to_be_bytes());
    buf.extend_from_slice(&pkt.sender_hw.0);
    buf.extend_from_slice(&pkt.sender_ip.octets());
    buf.extend_from_slice(&pkt.target_hw.0);
    buf.extend_from_slice(&pkt.target_ip.octets());
    buf
}

/// Build a broadcast ARP request frame for `target_ip`.
pub fn build_arp_request(our_mac: EthAddr, our_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let pkt = ArpPacket {
        sender_hw: our_mac,
        sender_ip: our_ip,
        target_hw: EthAddr::ZERO,
        target_ip,
        op: ArpOp::Request,
    };
    build_ethernet_frame(EthAddr::BROADCAST, our_mac, ETHERTYPE_ARP, &serialize_arp(&pkt))
}

/// Build a unicast ARP reply frame.
pub fn build_arp_reply(
    our_mac: EthAddr,
    our_ip: Ipv4Addr,
    target_mac: EthAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let pkt = ArpPacket {
        sender_hw: our_mac,
        sender_ip: our_ip,
        target_hw: target_mac,
        target_ip,
        op: ArpOp::Reply,
    };
    build_ethernet_frame(target_mac, our_mac, ETHERTYPE_ARP, &serialize_arp(&pkt))
}

/// Build a gratuitous ARP announcement (sender IP == target IP).
pub fn build_gratuitous_arp(our_mac: EthAddr, our_ip: Ipv4Addr) -> Vec<u8> {
    let pkt = ArpPacket {
        sender_hw: our_mac,
        sender_ip: our_ip,
        target_hw: EthAddr::ZERO,
        target_ip: our_ip,
        op: ArpOp::Request,
    };
    build_ethernet_frame(EthAddr::BROADCAST, our_mac, ETHERTYPE_ARP, &serialize_arp(&pkt))
}

// ============================================================================
// Statistics
// ============================================================================

/// ARP statistics.
#[derive(Debug, Default)]
pub struct ArpStats {
    /// ARP packets received.
    pub rx_packets: AtomicU64,
    /// Requests received.
    pub rx_requests: AtomicU64,
    /// Replies received.
    pub rx_replies: AtomicU64,
    /// Packets dropped by parse/validation.
    pub rx_errors: AtomicU64,
    /// Resolution requests sent.
    pub tx_requests: AtomicU64,
    /// Replies sent.
    pub tx_replies: AtomicU64,
    /// `resolve` hits on a valid entry.
    pub cache_hits: AtomicU64,
    /// `resolve` calls that found no valid mapping.
    pub cache_misses: AtomicU64,
    /// Entries that reached the resolved state.
    pub resolved: AtomicU64,
    /// Resolved entries that passed their expiry.
    pub expired: AtomicU64,
    /// Incomplete entries discarded after the retry budget.
    pub retries_exhausted: AtomicU64,
    /// Pending packets displaced by a newer one.
    pub pending_replaced: AtomicU64,
    /// Pending packets handed to the link on resolution.
    pub pending_flushed: AtomicU64,
    /// Pending packets discarded (entry discarded or unreachable).
    pub pending_dropped: AtomicU64,
    /// Updates rejected to protect an established or static mapping.
    pub conflicts: AtomicU64,
}

macro_rules! inc {
    ($field:expr) => {
        $field.fetch_add(1, Ordering::Relaxed)
    };
}

// ============================================================================
// Cache Entry
// ============================================================================

/// Resolution state of one cache entry.
#[derive(Debug)]
pub enum ArpState {
    /// Resolution in flight. `retries` counts requests already sent.
    Incomplete {
        retries: u32,
        pending: Option<PktBuf>,
    },
    /// Valid mapping until `expires_at_ms` (ignored for static
    /// entries).
    Resolved { mac: EthAddr, expires_at_ms: u64 },
}

#[derive(Debug)]
struct ArpEntry {
    ip: Ipv4Addr,
    is_static: bool,
    state: ArpState,
    callout: Option<CalloutId>,
    /// Last opportunistic refresh, to keep a hot entry from spamming
    /// requests once it enters the refresh margin.
    last_refresh_ms: u64,
}

/// Outcome of a `resolve` call.
#[derive(Debug, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Valid link address.
    Resolved(EthAddr),
    /// Resolution in flight; the packet (if any) is parked on the
    /// entry.
    WouldBlock,
    /// Retry budget spent; host-unreachable class failure.
    Unreachable,
}

/// Result of processing an inbound ARP packet.
#[derive(Debug)]
pub enum ArpResult {
    /// Packet was consumed; nothing to send.
    Handled,
    /// A reply frame must be transmitted.
    Reply(Vec<u8>),
    /// Packet was dropped with the given reason.
    Dropped(ArpError),
}

// ============================================================================
// Engine
// ============================================================================

/// Frame sink for engine-originated traffic (requests, flushed
/// pending packets); wired to the link driver's transmit path.
pub type ArpTxHook = Box<dyn Fn(PktBuf) + Send + Sync>;

/// The address-resolution engine for one interface.
///
/// Structural changes (insert/remove) take the table lock; content
/// updates take the per-entry lock, so lookups on different entries
/// proceed concurrently. Lock order is table, then entry; nothing is
/// sent on the wire while an entry lock is held.
pub struct ArpEngine {
    our_ip: Ipv4Addr,
    our_mac: EthAddr,
    cfg: ArpConfig,
    clock: Arc<Clock>,
    table: RwLock<HashMap<Ipv4Addr, Arc<Mutex<ArpEntry>>>>,
    stats: ArpStats,
    tx: ArpTxHook,
    weak_self: Weak<ArpEngine>,
}

impl ArpEngine {
    pub fn new(
        cfg: ArpConfig,
        our_ip: Ipv4Addr,
        our_mac: EthAddr,
        clock: Arc<Clock>,
        tx: ArpTxHook,
    ) -> Arc<ArpEngine> {
        Arc::new_cyclic(|weak| ArpEngine {
            our_ip,
            our_mac,
            cfg,
            clock,
            table: RwLock::new("arp_table", LockFlags::QUIET, HashMap::new()),
            stats: ArpStats::default(),
            tx,
            weak_self: weak.clone(),
        })
    }

    pub fn stats(&self) -> &ArpStats {
        &self.stats
    }

    /// Entries currently in the table.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-mutating lookup: the link address if the entry is resolved
    /// and not expired.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<EthAddr> {
        let entry = self.table.read().get(&ip).cloned()?;
        let e = entry.lock();
        match e.state {
            ArpState::Resolved { mac, expires_at_ms } => {
                if e.is_static || self.clock.now_ms() < expires_at_ms {
                    Some(mac)
                } else {
                    None
                }
            }
            ArpState::Incomplete { .. } => None,
        }
    }

    /// Resolve `ip`, parking `pending` on the entry if resolution is
    /// in flight.
    ///
    /// Never blocks. While incomplete, each call sends one more
    /// resolution request until the budget is spent, replacing any
    /// previously parked packet with the new one (the displaced packet
    /// is discarded). Once the budget is spent the outcome is
    /// `Unreachable` and the supplied packet is discarded.
    pub fn resolve(&self, ip: Ipv4Addr, pending: Option<PktBuf>) -> ResolveOutcome {
        let now = self.clock.now_ms();
        let entry = self.get_or_create(ip);
        let mut guard = entry.lock();
        let e = &mut *guard;

        let mut request = None;
        let outcome = match &mut e.state {
            ArpState::Resolved { mac, expires_at_ms } => {
                let mac = *mac;
                inc!(self.stats.cache_hits);
                // Preemptive refresh: expiry is imminent, so re-request
                // in the background without blocking this caller.
                if !e.is_static
                    && expires_at_ms.saturating_sub(now) <= self.cfg.refresh_margin_ms
                    && now.saturating_sub(e.last_refresh_ms) >= self.cfg.retry_ms
                {
                    e.last_refresh_ms = now;
                    inc!(self.stats.tx_requests);
                    request = Some(build_arp_request(self.our_mac, self.our_ip, ip));
                }
                ResolveOutcome::Resolved(mac)
            }
            ArpState::Incomplete { retries, pending: slot } => {
                inc!(self.stats.cache_misses);
                if *retries >= self.cfg.max_retries {
                    if pending.is_some() {
                        inc!(self.stats.pending_dropped);
                    }
                    ResolveOutcome::Unreachable
                } else {
                    if let Some(p) = pending {
                        if slot.is_some() {
                            // Single-slot policy: newest packet wins,
                            // the displaced one is gone.
                            inc!(self.stats.pending_replaced);
                            log::debug!("arp: pending packet for {} displaced", e.ip);
                        }
                        *slot = Some(p);
                    }
                    *retries += 1;
                    inc!(self.stats.tx_requests);
                    request = Some(build_arp_request(self.our_mac, self.our_ip, ip));
                    if e.callout.is_none() {
                        e.callout = Some(self.schedule_timer(ip, self.cfg.retry_ms));
                    }
                    ResolveOutcome::WouldBlock
                }
            }
        };
        drop(guard);

        if let Some(frame) = request {
            (self.tx)(PktBuf::from_frame(&frame));
        }
        outcome
    }

    /// Record a resolution reply (or any authoritative mapping for an
    /// address we are already tracking).
    ///
    /// A reply for an address with no entry is routine network noise
    /// and is ignored. Transitions the entry to resolved, resets the
    /// expiry, and hands the pending packet (if any) to the link
    /// exactly once, with its destination MAC filled in.
    pub fn on_reply(&self, ip: Ipv4Addr, mac: EthAddr) {
        let Some(entry) = self.table.read().get(&ip).cloned() else {
            return;
        };
        let now = self.clock.now_ms();
        let mut guard = entry.lock();
        let e = &mut *guard;

        if e.is_static {
            if !matches!(e.state, ArpState::Resolved { mac: m, .. } if m == mac) {
                inc!(self.stats.conflicts);
            }
            return;
        }
        if let ArpState::Resolved { mac: old, .. } = e.state {
            if old != mac {
                // Rebinding an established mapping smells like
                // poisoning; keep the old one until it expires.
                inc!(self.stats.conflicts);
                log::warn!("arp: rejecting rebind of {} from {} to {}", ip, old, mac);
                return;
            }
        }

        let pending = match &mut e.state {
            ArpState::Incomplete { pending, .. } => pending.take(),
            ArpState::Resolved { .. } => None,
        };
        if matches!(e.state, ArpState::Incomplete { .. }) {
            inc!(self.stats.resolved);
            log::debug!("arp: {} is at {}", ip, mac);
        }
        e.state = ArpState::Resolved {
            mac,
            expires_at_ms: now + self.cfg.ttl_ms,
        };
        e.last_refresh_ms = now;
        if let Some(id) = e.callout.take() {
            self.clock.cancel(id);
        }
        e.callout = Some(self.schedule_timer(ip, self.cfg.ttl_ms));
        drop(guard);

        if let Some(mut p) = pending {
            if p.len() >= ETH_HEADER_LEN {
                p.data_mut()[0..6].copy_from_slice(&mac.0);
            }
            inc!(self.stats.pending_flushed);
            (self.tx)(p);
        }
    }

    /// Process an inbound ARP packet (an Ethernet payload).
    pub fn input(&self, payload: &[u8]) -> ArpResult {
        inc!(self.stats.rx_packets);
        let pkt = match parse_arp(payload) {
            Ok(p) => p,
            Err(e) => {
                inc!(self.stats.rx_errors);
                return ArpResult::Dropped(e);
            }
        };
        match pkt.op {
            ArpOp::Request => inc!(self.stats.rx_requests),
            ArpOp::Reply => inc!(self.stats.rx_replies),
        };

        // A sender claiming our address with a different MAC is either
        // an address conflict or a reflection attempt; never learn it.
        if pkt.sender_ip == self.our_ip && pkt.sender_hw != self.our_mac {
            inc!(self.stats.conflicts);
            return ArpResult::Dropped(ArpError::CacheConflict);
        }

        match pkt.op {
            ArpOp::Reply => {
                if pkt.target_ip == self.our_ip && pkt.target_hw == self.our_mac {
                    self.on_reply(pkt.sender_ip, pkt.sender_hw);
                }
                ArpResult::Handled
            }
            ArpOp::Request => {
                // Merge into an existing entry (requests never create
                // entries; that is the resolver's job).
                self.on_reply(pkt.sender_ip, pkt.sender_hw);

                let gratuitous = pkt.sender_ip == pkt.target_ip;
                if pkt.target_ip == self.our_ip && !gratuitous {
                    inc!(self.stats.tx_replies);
                    ArpResult::Reply(build_arp_reply(
                        self.our_mac,
                        self.our_ip,
                        pkt.sender_hw,
                        pkt.sender_ip,
                    ))
                } else {
                    ArpResult::Handled
                }
            }
        }
    }

    /// Install a static mapping. Static entries never expire and are
    /// never overwritten; installing over a different static mapping
    /// is a conflict.
    pub fn add_static(&self, ip: Ipv4Addr, mac: EthAddr) -> Result<(), ArpError> {
        let entry = self.get_or_create(ip);
        let mut guard = entry.lock();
        let e = &mut *guard;
        if e.is_static {
            return match e.state {
                ArpState::Resolved { mac: m, .. } if m == mac => Ok(()),
                _ => {
                    inc!(self.stats.conflicts);
                    Err(ArpError::CacheConflict)
                }
            };
        }
        let dropped_pending = match &mut e.state {
            ArpState::Incomplete { pending, .. } => pending.take(),
            ArpState::Resolved { .. } => None,
        };
        if dropped_pending.is_some() {
            inc!(self.stats.pending_dropped);
        }
        e.is_static = true;
        e.state = ArpState::Resolved {
            mac,
            expires_at_ms: u64::MAX,
        };
        if let Some(id) = e.callout.take() {
            self.clock.cancel(id);
        }
        Ok(())
    }

    /// Drop every dynamic entry (interface teardown). Pending packets
    /// are discarded and counted.
    pub fn flush(&self) {
        let entries: Vec<Arc<Mutex<ArpEntry>>> = {
            let mut table = self.table.write();
            let dynamic: Vec<Ipv4Addr> = table
                .iter()
                .filter(|(_, e)| !e.lock().is_static)
                .map(|(ip, _)| *ip)
                .collect();
            dynamic
                .iter()
                .filter_map(|ip| table.remove(ip))
                .collect()
        };
        for entry in entries {
            let mut guard = entry.lock();
            let e = &mut *guard;
            if let Some(id) = e.callout.take() {
                self.clock.cancel(id);
            }
            if let ArpState::Incomplete { pending, .. } = &mut e.state {
                if pending.take().is_some() {
                    inc!(self.stats.pending_dropped);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Timer path
    // ------------------------------------------------------------------

    fn schedule_timer(&self, ip: Ipv4Addr, after_ms: u64) -> CalloutId {
        let weak = self.weak_self.clone();
        self.clock.schedule_ms(
            after_ms,
            Box::new(move |now| {
                if let Some(engine) = weak.upgrade() {
                    engine.entry_timer(ip, now);
                }
            }),
        )
    }

    /// Per-entry callout body: retry or discard an incomplete entry,
    /// refresh or re-arm a resolved one.
    fn entry_timer(&self, ip: Ipv4Addr, now: u64) {
        let Some(entry) = self.table.read().get(&ip).cloned() else {
            return;
        };
        let mut guard = entry.lock();
        let e = &mut *guard;
        e.callout = None;

        let mut request = None;
        let mut discard = false;
        match &mut e.state {
            ArpState::Incomplete { retries, pending } => {
                if *retries >= self.cfg.max_retries {
                    // Resolution failed for good; the entry goes away.
                    if pending.take().is_some() {
                        inc!(self.stats.pending_dropped);
                    }
                    inc!(self.stats.retries_exhausted);
                    log::debug!("arp: giving up on {} after {} requests", ip, retries);
                    discard = true;
                } else {
                    *retries += 1;
                    inc!(self.stats.tx_requests);
                    request = Some(build_arp_request(self.our_mac, self.our_ip, ip));
                    e.callout = Some(self.schedule_timer(ip, self.cfg.retry_ms));
                }
            }
            ArpState::Resolved { expires_at_ms, .. } => {
                if e.is_static {
                    // Static entries are never scheduled; nothing to do.
                } else if now >= *expires_at_ms {
                    inc!(self.stats.expired);
                    log::debug!("arp: entry for {} expired, refreshing", ip);
                    e.state = ArpState::Incomplete {
                        retries: 1,
                        pending: None,
                    };
                    inc!(self.stats.tx_requests);
                    request = Some(build_arp_request(self.our_mac, self.our_ip, ip));
                    e.callout = Some(self.schedule_timer(ip, self.cfg.retry_ms));
                } else {
                    // Woken early (reply re-armed the entry); re-arm
                    // for the remaining lifetime.
                    let remaining = *expires_at_ms - now;
                    e.callout = Some(self.schedule_timer(ip, remaining));
                }
            }
        }
        drop(guard);

        if discard {
            self.table.write().remove(&ip);
        }
        if let Some(frame) = request {
            (self.tx)(PktBuf::from_frame(&frame));
        }
    }

    fn get_or_create(&self, ip: Ipv4Addr) -> Arc<Mutex<ArpEntry>> {
        if let Some(e) = self.table.read().get(&ip) {
            return e.clone();
        }
        self.table
            .write()
            .entry(ip)
            .or_insert_with(|| {
                Arc::new(Mutex::new(
                    "arp_entry",
                    LockFlags::QUIET,
                    ArpEntry {
                        ip,
                        is_static: false,
                        state: ArpState::Incomplete {
                            retries: 0,
                            pending: None,
                        },
                        callout: None,
                        last_refresh_ms: 0,
                    },
                ))
            })
            .clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
