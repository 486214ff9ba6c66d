//! IPC Rights - lifecycle and reference counting of a single entry
//!
//! Liveness check and dead-name degradation, dead-name requests, entry
//! destruction (one entry in a live space, or every entry of a dying
//! space), and user reference manipulation (`dealloc`, `delta`).
//!
//! Functions taking a [`SpaceWrite`] by value unlock the space before
//! returning, on every path, and deliver any notifications they produced
//! only after that. Functions taking `&mut SpaceWrite` leave the space
//! locked for the caller.

use super::entry::{DnRequestIndex, EntryRight, IpcEntry, IpcObject, MachPortName};
use super::entry::{MACH_PORT_TYPE_DNREQUEST, MACH_PORT_UREFS_MAX};
use super::error::{IpcError, IpcResult};
use super::notify::{Notification, PendingNotifications};
use super::port::{PortRef, PortState};
use super::space::{IpcSpace, SpaceWrite};
use super::PortRight;

// ============================================================================
// Liveness Check
// ============================================================================

/// Degrade an entry to a dead name if its port has died
///
/// Only send and send-once entries can degrade; an entry holding the
/// receive right keeps its port alive. The slot keeps its user references
/// and absorbs a registered dead-name request as one more reference,
/// releasing the request's send-once right. No notification is sent from
/// here.
///
/// Returns true if the entry was degraded.
pub fn check(space: &mut SpaceWrite<'_>, name: MachPortName) -> bool {
    let (right, port) = match space.entry(name) {
        Ok(entry) => match (entry.right(), entry.port()) {
            (right @ (EntryRight::Send { .. } | EntryRight::SendOnce), Some(port)) => {
                (right, port.clone())
            }
            (EntryRight::SendReceive { .. }, Some(port)) => {
                debug_assert!(
                    space.lock_port(port).is_active(),
                    "receive right to a dead port"
                );
                return false;
            }
            _ => return false,
        },
        Err(_) => return false,
    };

    let mut p = space.lock_port(&port);
    if p.is_active() {
        return false;
    }

    let Ok(entry) = space.entry_mut(name) else {
        return false;
    };
    let absorbed = dncancel(&mut p, name, entry);
    let mut urefs = right.urefs();
    if absorbed.is_some() {
        urefs = urefs.saturating_add(1);
    }
    // The table's reference to the dead port goes with the object
    drop(entry.make_dead_name(urefs));
    drop(p);

    if matches!(right, EntryRight::Send { .. }) {
        space.hash().delete(&port, name);
    }
    if let Some(soright) = absorbed {
        soright.release_send_once();
    }

    log::debug!(
        "space {:?}: name {:#x} degraded to dead name ({} urefs)",
        space.id(),
        name,
        urefs
    );
    true
}

// ============================================================================
// Dead-Name Requests
// ============================================================================

/// Cancel the dead-name request registered for an entry
///
/// The port must be locked; it may be dead, since a dead port keeps its
/// requests. Returns the request's send-once right.
pub fn dncancel(port: &mut PortState, name: MachPortName, entry: &mut IpcEntry) -> Option<PortRef> {
    let index = entry.request.take()?;
    Some(port.dnrequest_cancel(index, name))
}

/// One pass of a dead-name request registration
enum DnRequestStep {
    /// Finished; previous request right, if any
    Done(Option<PortRef>),
    /// The port died under us; the entry has been (or will be) degraded
    Retry,
    /// The port's request table is full
    NeedsGrowth(PortRef),
    /// The name is already dead: notify right away
    Immediate(PortRef),
}

fn dnrequest_step(
    space: &mut SpaceWrite<'_>,
    name: MachPortName,
    immediate: bool,
    notify: &mut Option<PortRef>,
) -> IpcResult<DnRequestStep> {
    let right = space.entry(name)?.right();

    if right.is_port_right() {
        if check(space, name) {
            return Ok(DnRequestStep::Retry);
        }

        let port = space
            .entry(name)?
            .port()
            .cloned()
            .expect("port right without a port");
        let mut p = space.lock_port(&port);
        if !p.is_active() {
            return Ok(DnRequestStep::Retry);
        }

        let entry = space.entry_mut(name)?;
        let previous = match (entry.request, notify.take()) {
            (Some(index), Some(n)) => Some(p.dnrequest_replace(index, name, n)),
            (Some(index), None) => {
                entry.request = None;
                Some(p.dnrequest_cancel(index, name))
            }
            (None, Some(n)) => match p.dnrequest_alloc(name, n) {
                Ok(index) => {
                    entry.request = Some(index);
                    None
                }
                Err(n) => {
                    *notify = Some(n);
                    drop(p);
                    return Ok(DnRequestStep::NeedsGrowth(port));
                }
            },
            (None, None) => None,
        };
        return Ok(DnRequestStep::Done(previous));
    }

    if let EntryRight::DeadName { urefs } = right {
        if immediate && notify.is_some() {
            let urefs = urefs.checked_add(1).ok_or(IpcError::InvalidValue)?;
            space.entry_mut(name)?.right = EntryRight::DeadName { urefs };
            let n = notify.take().expect("checked above");
            return Ok(DnRequestStep::Immediate(n));
        }
        return Err(IpcError::InvalidArgument);
    }

    Err(IpcError::InvalidRight)
}

/// Register (or cancel, with `notify == None`) a dead-name request
///
/// `notify` is a send-once right. On success it is owned by the port's
/// request table (or used for an immediate notification when the name is
/// already dead and `immediate` is set); on failure it is consumed.
/// Returns the send-once right of the request this one replaced.
///
/// Growing a port's request table happens with no locks held, after
/// which the registration starts over.
pub fn dnrequest(
    space: &IpcSpace,
    name: MachPortName,
    immediate: bool,
    notify: Option<PortRef>,
) -> IpcResult<Option<PortRef>> {
    log::trace!("dnrequest: name {:#x} immediate {}", name, immediate);
    let mut notify = notify;

    loop {
        let step = space
            .lookup_write(name)
            .and_then(|mut guard| dnrequest_step(&mut guard, name, immediate, &mut notify));

        match step {
            Ok(DnRequestStep::Done(previous)) => return Ok(previous),
            Ok(DnRequestStep::Retry) => continue,
            Ok(DnRequestStep::NeedsGrowth(port)) => port.grow_dnrequests(),
            Ok(DnRequestStep::Immediate(n)) => {
                space
                    .notifier()
                    .deliver(Notification::DeadName { notify: n, name });
                return Ok(None);
            }
            Err(e) => {
                if let Some(n) = notify.take() {
                    n.release_send_once();
                }
                return Err(e);
            }
        }
    }
}

// ============================================================================
// Releasing a port right
// ============================================================================

/// Release what an entry held on a locked port
///
/// Shared by `destroy` and `clean`: cancels the dead-name request, gives
/// back the entry's send right, destroys the port for a receive right
/// and consumes a send-once right.
fn release_port_right(
    p: &mut PortState,
    port: &PortRef,
    name: MachPortName,
    right: EntryRight,
    request: Option<DnRequestIndex>,
    pending: &mut PendingNotifications,
) {
    if !p.is_active() {
        // Only the reference to the port object goes; a request is absorbed
        assert!(!right.has_receive(), "receive right to a dead port");
        if let Some(index) = request {
            pending.release(p.dnrequest_cancel(index, name));
        }
        return;
    }

    if let Some(index) = request {
        pending.push(Notification::PortDeleted {
            notify: p.dnrequest_cancel(index, name),
            name,
        });
    }

    if right.has_send() {
        pending.push_opt(p.release_send());
    }

    if right.has_receive() {
        p.clear_receiver();
        let death = p.destroy();
        log::debug!("port {:?}: receive right destroyed", port.id());
        pending.extend(death.into_notifications());
    } else if right.is_send_once() {
        pending.push(Notification::SendOnce { port: port.clone() });
    }
}

// ============================================================================
// Destroy / Clean
// ============================================================================

/// Destroy the entry `name` entirely, whatever its user references
///
/// Frees the name. The space is unlocked on return.
pub fn destroy(space: SpaceWrite<'_>, name: MachPortName) -> IpcResult<()> {
    let mut space = space;
    let mut pending = PendingNotifications::new();
    log::trace!("destroy: space {:?} name {:#x}", space.id(), name);

    let entry = space.entry(name)?;
    let right = entry.right();
    let object = entry.object().cloned();

    match (right, object) {
        (EntryRight::None, _) | (EntryRight::DeadName { .. }, _) => {
            drop(space.entry_mut(name)?.clear());
            space.entry_free(name);
        }
        (EntryRight::PortSet, Some(IpcObject::PortSet(pset))) => {
            drop(space.entry_mut(name)?.clear());
            space.entry_free(name);
            pset.close();
        }
        (right, Some(IpcObject::Port(port))) if right.is_port_right() => {
            if matches!(right, EntryRight::Send { .. }) {
                space.hash().delete(&port, name);
            }
            let mut p = space.lock_port(&port);
            let entry = space.entry_mut(name)?;
            let request = entry.request;
            let released = entry.clear();
            release_port_right(&mut p, &port, name, right, request, &mut pending);
            drop(p);
            drop(released);
            space.entry_free(name);
        }
        (right, _) => panic!("destroy: inconsistent {} entry {:#x}", right.name(), name),
    }

    let space = space.unlock();
    pending.deliver(space.notifier());
    Ok(())
}

/// Clean up one entry of a space being torn down
///
/// The space is inactive and unlocked; nothing else can reach the entry.
/// Inconsistent entries are fatal.
pub fn clean(space: &IpcSpace, name: MachPortName, entry: IpcEntry) {
    assert!(entry.is_consistent(), "clean: inconsistent entry {:#x}", name);
    let mut pending = PendingNotifications::new();
    let right = entry.right();
    let request = entry.request();

    match entry.object {
        None => {}
        Some(IpcObject::PortSet(pset)) => pset.close(),
        Some(IpcObject::Port(port)) => {
            let mut p = port.lock();
            release_port_right(&mut p, &port, name, right, request, &mut pending);
        }
    }

    pending.deliver(space.notifier());
}

// ============================================================================
// Reference Counting
// ============================================================================

/// Apply `delta` to a dead name's user references
fn dead_name_delta(space: &mut SpaceWrite<'_>, name: MachPortName, delta: i32) -> IpcResult<()> {
    let entry = space.entry_mut(name)?;
    let EntryRight::DeadName { urefs } = entry.right() else {
        return Err(IpcError::InvalidRight);
    };

    let urefs = apply_delta(urefs, delta)?;
    if urefs == 0 {
        drop(entry.clear());
        space.entry_free(name);
    } else {
        entry.right = EntryRight::DeadName { urefs };
    }
    Ok(())
}

/// Add a signed delta to a user reference count, refusing to wrap
fn apply_delta(urefs: u16, delta: i32) -> IpcResult<u16> {
    let value = i64::from(urefs) + i64::from(delta);
    if value < 0 || value > i64::from(MACH_PORT_UREFS_MAX) {
        return Err(IpcError::InvalidValue);
    }
    Ok(value as u16)
}

/// Drop the last user reference of a send right
///
/// A send/receive entry keeps its receive right; a send-only entry is
/// freed.
fn release_last_send(
    space: &mut SpaceWrite<'_>,
    name: MachPortName,
    port: &PortRef,
    pending: &mut PendingNotifications,
) -> IpcResult<()> {
    let right = space.entry(name)?.right();
    if matches!(right, EntryRight::Send { .. }) {
        space.hash().delete(port, name);
    }

    let mut p = space.lock_port(port);
    pending.push_opt(p.release_send());

    let entry = space.entry_mut(name)?;
    if right.has_receive() {
        entry.right = EntryRight::Receive;
        return Ok(());
    }

    if let Some(notify) = dncancel(&mut p, name, entry) {
        pending.push(Notification::PortDeleted { notify, name });
    }
    drop(p);
    drop(entry.clear());
    space.entry_free(name);
    Ok(())
}

/// Consume a live send-once entry
fn release_send_once(
    space: &mut SpaceWrite<'_>,
    name: MachPortName,
    port: &PortRef,
    pending: &mut PendingNotifications,
) -> IpcResult<()> {
    let mut p = space.lock_port(port);
    let entry = space.entry_mut(name)?;
    if let Some(notify) = dncancel(&mut p, name, entry) {
        pending.push(Notification::PortDeleted { notify, name });
    }
    pending.push(Notification::SendOnce { port: port.clone() });
    drop(p);
    drop(entry.clear());
    space.entry_free(name);
    Ok(())
}

fn entry_port(space: &SpaceWrite<'_>, name: MachPortName) -> IpcResult<PortRef> {
    space
        .entry(name)?
        .port()
        .cloned()
        .ok_or(IpcError::InvalidRight)
}

/// Release one user reference of whatever right the entry holds
///
/// Receive rights and port sets are not reference counted and fail with
/// `InvalidRight`, as does an empty entry. The space is unlocked on return.
pub fn dealloc(space: SpaceWrite<'_>, name: MachPortName) -> IpcResult<()> {
    let mut space = space;
    let mut pending = PendingNotifications::new();
    log::trace!("dealloc: space {:?} name {:#x}", space.id(), name);

    let result = dealloc_locked(&mut space, name, &mut pending);

    let space = space.unlock();
    pending.deliver(space.notifier());
    result
}

fn dealloc_locked(
    space: &mut SpaceWrite<'_>,
    name: MachPortName,
    pending: &mut PendingNotifications,
) -> IpcResult<()> {
    let right = space.entry(name)?.right();

    match right {
        EntryRight::None | EntryRight::Receive | EntryRight::PortSet => Err(IpcError::InvalidRight),
        EntryRight::DeadName { .. } => dead_name_delta(space, name, -1),
        EntryRight::SendOnce => {
            if check(space, name) {
                return dead_name_delta(space, name, -1);
            }
            let port = entry_port(space, name)?;
            release_send_once(space, name, &port, pending)
        }
        EntryRight::Send { urefs } | EntryRight::SendReceive { urefs } => {
            if check(space, name) {
                return dead_name_delta(space, name, -1);
            }
            let port = entry_port(space, name)?;
            if urefs == 1 {
                return release_last_send(space, name, &port, pending);
            }
            let entry = space.entry_mut(name)?;
            entry.right = match right {
                EntryRight::Send { .. } => EntryRight::Send { urefs: urefs - 1 },
                _ => EntryRight::SendReceive { urefs: urefs - 1 },
            };
            Ok(())
        }
    }
}

/// Change the user references of one right held under `name`
///
/// `right` is the right the caller means, not the one the entry holds; a
/// mismatch is `InvalidRight`. Receive, send-once and port set rights
/// accept only 0 and -1. The space is unlocked on return.
pub fn delta(space: SpaceWrite<'_>, name: MachPortName, right: PortRight, delta: i32) -> IpcResult<()> {
    let mut space = space;
    let mut pending = PendingNotifications::new();
    log::trace!(
        "delta: space {:?} name {:#x} {:?} {:+}",
        space.id(),
        name,
        right,
        delta
    );

    let result = delta_locked(&mut space, name, right, delta, &mut pending);

    let space = space.unlock();
    pending.deliver(space.notifier());
    result
}

fn delta_locked(
    space: &mut SpaceWrite<'_>,
    name: MachPortName,
    right: PortRight,
    delta: i32,
    pending: &mut PendingNotifications,
) -> IpcResult<()> {
    let held = space.entry(name)?.right();

    match right {
        PortRight::Receive => {
            if !held.has_receive() {
                return Err(IpcError::InvalidRight);
            }
            match delta {
                0 => Ok(()),
                -1 => destroy_receive(space, name, held, pending),
                _ => Err(IpcError::InvalidValue),
            }
        }

        PortRight::SendOnce => {
            if !held.is_send_once() {
                return Err(IpcError::InvalidRight);
            }
            if delta != 0 && delta != -1 {
                return Err(IpcError::InvalidValue);
            }
            if check(space, name) {
                return dead_name_delta(space, name, delta);
            }
            if delta == 0 {
                return Ok(());
            }
            let port = entry_port(space, name)?;
            release_send_once(space, name, &port, pending)
        }

        PortRight::DeadName => {
            if held.is_port_right() && !check(space, name) {
                return Err(IpcError::InvalidRight);
            }
            dead_name_delta(space, name, delta)
        }

        PortRight::Send => {
            if !held.has_send() {
                return Err(IpcError::InvalidRight);
            }
            if check(space, name) {
                return dead_name_delta(space, name, delta);
            }

            let urefs = apply_delta(held.urefs(), delta)?;
            if delta == 0 {
                return Ok(());
            }
            if urefs == 0 {
                let port = entry_port(space, name)?;
                return release_last_send(space, name, &port, pending);
            }
            let entry = space.entry_mut(name)?;
            entry.right = match held {
                EntryRight::Send { .. } => EntryRight::Send { urefs },
                _ => EntryRight::SendReceive { urefs },
            };
            Ok(())
        }

        PortRight::PortSet => {
            if held != EntryRight::PortSet {
                return Err(IpcError::InvalidRight);
            }
            match delta {
                0 => Ok(()),
                -1 => {
                    let entry = space.entry_mut(name)?;
                    let object = entry.clear();
                    space.entry_free(name);
                    if let Some(IpcObject::PortSet(pset)) = object {
                        pset.close();
                    }
                    Ok(())
                }
                _ => Err(IpcError::InvalidValue),
            }
        }
    }
}

/// Destroy the receive right held under `name`
///
/// A send right held under the same name survives as a dead name: the
/// port is destroyed "first", so the send right is neither released nor
/// answered with no-senders, and a registered request is absorbed as one
/// more user reference.
fn destroy_receive(
    space: &mut SpaceWrite<'_>,
    name: MachPortName,
    held: EntryRight,
    pending: &mut PendingNotifications,
) -> IpcResult<()> {
    let port = entry_port(space, name)?;
    let mut p = space.lock_port(&port);
    let entry = space.entry_mut(name)?;

    let released = if let EntryRight::SendReceive { urefs } = held {
        let urefs = match dncancel(&mut p, name, entry) {
            Some(soright) => {
                pending.release(soright);
                urefs.saturating_add(1)
            }
            None => urefs,
        };
        entry.make_dead_name(urefs)
    } else {
        if let Some(notify) = dncancel(&mut p, name, entry) {
            pending.push(Notification::PortDeleted { notify, name });
        }
        let object = entry.clear();
        space.entry_free(name);
        object
    };

    p.clear_receiver();
    let death = p.destroy();
    log::debug!("port {:?}: receive right {:#x} destroyed", port.id(), name);
    pending.extend(death.into_notifications());
    drop(p);
    drop(released);
    Ok(())
}

// ============================================================================
// Queries
// ============================================================================

/// What an entry holds, as reported to the task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RightInfo {
    /// The right (after a liveness check)
    pub right: EntryRight,
    /// Type bits, with `MACH_PORT_TYPE_DNREQUEST` if a request is registered
    pub type_bits: u32,
    /// User references
    pub urefs: u16,
}

/// Describe the entry `name`, degrading it first if its port died
pub fn info(space: &IpcSpace, name: MachPortName) -> IpcResult<RightInfo> {
    let mut guard = space.lookup_write(name)?;
    check(&mut guard, name);

    let entry = guard.entry(name)?;
    let mut type_bits = entry.right().type_bits();
    if entry.request().is_some() {
        type_bits |= MACH_PORT_TYPE_DNREQUEST;
    }
    Ok(RightInfo {
        right: entry.right(),
        type_bits,
        urefs: entry.urefs(),
    })
}

/// Find the name under which this space holds a send or receive right to `port`
///
/// Dead ports have no name; a send entry found for one is degraded.
pub fn reverse(space: &mut SpaceWrite<'_>, port: &PortRef) -> Option<MachPortName> {
    {
        let p = space.lock_port(port);
        if !p.is_active() {
            drop(p);
            if let Some(name) = space.hash().lookup(port) {
                check(space, name);
            }
            return None;
        }
        if let Some((id, name)) = p.receiver() {
            if id == space.id() {
                return Some(name);
            }
        }
    }

    let name = space.hash().lookup(port)?;
    if check(space, name) {
        return None;
    }
    Some(name)
}
