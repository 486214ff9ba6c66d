//! Port - the endpoint a right denotes
//!
//! The message queue lives elsewhere; this module only keeps what the
//! right layer needs: liveness, the receiver's identity, the aggregate
//! right counters and the registered notification requests.
//!
//! The counters are only changed with the port locked, and the port lock
//! is only taken through a held space write guard
//! ([`SpaceWrite::lock_port`](super::space::SpaceWrite::lock_port)) or,
//! during teardown of an inactive space, on its own.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use super::entry::{DnRequestIndex, MachPortName};
use super::notify::Notification;
use super::space::SpaceId;

/// Unique identifier for ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PortId(u64);

impl PortId {
    fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn value(self) -> u64 {
        self.0
    }
}

/// A registered dead-name request
///
/// `notify` is a send-once right. Cancelling the request hands it back;
/// after the port dies the entry absorbs the request and the right is
/// released.
#[derive(Debug, Clone)]
pub struct DnRequest {
    /// Name the requesting space holds the port under
    pub name: MachPortName,
    /// Send-once right the notification is sent with
    pub notify: PortRef,
}

/// What a port's death leaves behind for the caller to deliver
///
/// Dead-name requests stay in the dead port's table; each is absorbed by
/// its entry the next time the entry is looked at.
#[derive(Debug, Default)]
pub struct PortDeath {
    /// No-senders request, answered with a send-once notification
    pub nsrequest: Option<PortRef>,
}

impl PortDeath {
    /// Turn the leftovers into notifications
    pub fn into_notifications(self) -> impl Iterator<Item = Notification> {
        self.nsrequest
            .into_iter()
            .map(|port| Notification::SendOnce { port })
    }
}

// ============================================================================
// Port State (guarded by the port lock)
// ============================================================================

/// Lock-protected port state
#[derive(Debug)]
pub struct PortState {
    active: bool,
    /// Space and name holding the receive right; None while in transit
    receiver: Option<(SpaceId, MachPortName)>,
    /// Port whose queue holds this port while its receive right is in transit
    destination: Option<PortRef>,
    /// Send rights outstanding: one per entry holding send, one per copy in flight
    srights: u32,
    /// Send-once rights outstanding
    sorights: u32,
    /// Make-send count, reported by no-senders notifications
    mscount: u32,
    /// No-senders request (a send-once right)
    nsrequest: Option<PortRef>,
    /// Dead-name requests, indexed by `DnRequestIndex`
    dnrequests: Vec<Option<DnRequest>>,
}

impl PortState {
    fn new(dnrequest_slots: usize) -> Self {
        let mut dnrequests = Vec::new();
        dnrequests.resize_with(dnrequest_slots, || None);
        Self {
            active: true,
            receiver: None,
            destination: None,
            srights: 0,
            sorights: 0,
            mscount: 0,
            nsrequest: None,
            dnrequests,
        }
    }

    /// Check if the port is alive
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Send rights outstanding
    #[inline]
    pub fn send_count(&self) -> u32 {
        self.srights
    }

    /// Send-once rights outstanding
    #[inline]
    pub fn send_once_count(&self) -> u32 {
        self.sorights
    }

    /// Make-send count
    #[inline]
    pub fn make_send_count(&self) -> u32 {
        self.mscount
    }

    /// Receiver identity
    #[inline]
    pub fn receiver(&self) -> Option<(SpaceId, MachPortName)> {
        self.receiver
    }

    pub(crate) fn set_receiver(&mut self, space: SpaceId, name: MachPortName) {
        self.receiver = Some((space, name));
    }

    pub(crate) fn clear_receiver(&mut self) {
        self.receiver = None;
    }

    /// Take the port this one was queued on while in transit
    pub(crate) fn take_destination(&mut self) -> Option<PortRef> {
        self.destination.take()
    }

    /// Account for a copied send right
    pub(crate) fn copy_send(&mut self) {
        self.srights = self
            .srights
            .checked_add(1)
            .expect("port send right count overflow");
    }

    /// Account for a send right made from the receive right
    pub(crate) fn make_send(&mut self) {
        self.mscount = self.mscount.wrapping_add(1);
        self.copy_send();
    }

    /// Account for a send-once right made from the receive right
    pub(crate) fn make_send_once(&mut self) {
        self.sorights = self
            .sorights
            .checked_add(1)
            .expect("port send-once right count overflow");
    }

    /// Release one send right, returning a no-senders notification when it
    /// was the last one and a request is registered
    pub(crate) fn release_send(&mut self) -> Option<Notification> {
        assert!(self.srights > 0, "send right released twice");
        self.srights -= 1;
        if self.srights == 0 && self.active {
            if let Some(notify) = self.nsrequest.take() {
                return Some(Notification::NoSenders {
                    notify,
                    mscount: self.mscount,
                });
            }
        }
        None
    }

    /// Release one send-once right
    pub(crate) fn release_send_once(&mut self) {
        assert!(self.sorights > 0, "send-once right released twice");
        self.sorights -= 1;
    }

    // ========================================================================
    // Dead-name requests
    // ========================================================================

    /// Register a request; hands the right back if the table is full
    pub(crate) fn dnrequest_alloc(
        &mut self,
        name: MachPortName,
        notify: PortRef,
    ) -> Result<DnRequestIndex, PortRef> {
        match self.dnrequests.iter().position(Option::is_none) {
            Some(index) => {
                self.dnrequests[index] = Some(DnRequest { name, notify });
                Ok(index)
            }
            None => Err(notify),
        }
    }

    /// Replace the notify right of an existing request, returning the old one
    pub(crate) fn dnrequest_replace(
        &mut self,
        index: DnRequestIndex,
        name: MachPortName,
        notify: PortRef,
    ) -> PortRef {
        let request = self.dnrequests[index]
            .as_mut()
            .expect("dead-name request vanished");
        assert_eq!(request.name, name);
        core::mem::replace(&mut request.notify, notify)
    }

    /// Cancel a request, returning its send-once right
    pub(crate) fn dnrequest_cancel(
        &mut self,
        index: DnRequestIndex,
        name: MachPortName,
    ) -> PortRef {
        let request = self
            .dnrequests
            .get_mut(index)
            .and_then(Option::take)
            .expect("dead-name request vanished");
        assert_eq!(request.name, name, "dead-name request registered under another name");
        request.notify
    }

    /// Move a request to a new name
    pub(crate) fn dnrequest_rename(
        &mut self,
        index: DnRequestIndex,
        old_name: MachPortName,
        new_name: MachPortName,
    ) {
        let request = self.dnrequests[index]
            .as_mut()
            .expect("dead-name request vanished");
        assert_eq!(request.name, old_name);
        request.name = new_name;
    }

    /// Number of registered dead-name requests
    pub fn dnrequest_count(&self) -> usize {
        self.dnrequests.iter().filter(|r| r.is_some()).count()
    }

    /// Mark the port dead and collect what needs notifying
    pub(crate) fn destroy(&mut self) -> PortDeath {
        self.active = false;
        self.receiver = None;
        self.destination = None;
        PortDeath {
            nsrequest: self.nsrequest.take(),
        }
    }
}

// ============================================================================
// Port handle
// ============================================================================

/// A Mach-style port
pub struct IpcPort {
    id: PortId,
    state: Mutex<PortState>,
}

/// Counted reference to a port
#[derive(Clone)]
pub struct PortRef(Arc<IpcPort>);

impl PortRef {
    /// Create a new live port with no rights outstanding
    pub fn new(dnrequest_slots: usize) -> Self {
        Self(Arc::new(IpcPort {
            id: PortId::generate(),
            state: Mutex::new(PortState::new(dnrequest_slots.max(1))),
        }))
    }

    /// Port identifier
    #[inline]
    pub fn id(&self) -> PortId {
        self.0.id
    }

    /// Check if two references denote the same port
    #[inline]
    pub fn ptr_eq(&self, other: &PortRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Key for the reverse index
    #[inline]
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Number of counted references to the port object
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Lock the port
    ///
    /// Callers hold the owning space's write lock, or are tearing down an
    /// inactive space, or hold no space lock at all.
    pub(crate) fn lock(&self) -> MutexGuard<'_, PortState> {
        self.0.state.lock()
    }

    // ========================================================================
    // Inspection (takes the port lock briefly; meaningful when quiescent)
    // ========================================================================

    /// Check if the port is alive
    pub fn is_active(&self) -> bool {
        self.lock().is_active()
    }

    /// Send rights outstanding
    pub fn send_count(&self) -> u32 {
        self.lock().send_count()
    }

    /// Send-once rights outstanding
    pub fn send_once_count(&self) -> u32 {
        self.lock().send_once_count()
    }

    /// Make-send count
    pub fn make_send_count(&self) -> u32 {
        self.lock().make_send_count()
    }

    /// Receiver identity
    pub fn receiver(&self) -> Option<(SpaceId, MachPortName)> {
        self.lock().receiver()
    }

    /// Number of registered dead-name requests
    pub fn dnrequest_count(&self) -> usize {
        self.lock().dnrequest_count()
    }

    /// Dead-name request table capacity
    pub fn dnrequest_capacity(&self) -> usize {
        self.lock().dnrequests.len()
    }

    // ========================================================================
    // Endpoint-side operations (no space lock held)
    // ========================================================================

    /// Make a naked send-once right to this port, e.g. a notification target
    pub fn make_send_once(&self) -> PortRef {
        self.lock().make_send_once();
        self.clone()
    }

    /// Consume a naked send-once right to this port
    pub fn release_send_once(&self) {
        self.lock().release_send_once();
    }

    /// Register a no-senders request, returning the previous one
    pub fn request_no_senders(&self, notify: Option<PortRef>) -> Option<PortRef> {
        let mut port = self.lock();
        core::mem::replace(&mut port.nsrequest, notify)
    }

    /// Record the port this one is queued on while its receive right is in transit
    pub fn set_destination(&self, dest: Option<PortRef>) -> Option<PortRef> {
        let mut port = self.lock();
        core::mem::replace(&mut port.destination, dest)
    }

    /// Double the dead-name request table
    ///
    /// Called with no locks held, between retries of a registration.
    pub fn grow_dnrequests(&self) {
        let mut port = self.lock();
        let new_len = (port.dnrequests.len() * 2).max(1);
        port.dnrequests.resize_with(new_len, || None);
    }

    /// Kill the port
    ///
    /// Returns the no-senders request the caller must answer once it holds
    /// no locks. Killing a dead port returns nothing.
    pub fn destroy(&self) -> PortDeath {
        let mut port = self.lock();
        if !port.is_active() {
            return PortDeath::default();
        }
        log::debug!("port {:?}: destroyed", self.id());
        port.destroy()
    }
}

impl fmt::Debug for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortRef({})", self.0.id.0)
    }
}

impl PartialEq for PortRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for PortRef {}
