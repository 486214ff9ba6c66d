//! Right transfer - moving rights into and out of messages
//!
//! `copyin` takes a right out of a space for transmission, `copyout`
//! installs a received right into a space. Both run with the space
//! write-locked by the caller; neither ever sends a notification, since
//! the send-once right of a cancelled dead-name request is handed back to
//! the caller as `soright`.
//!
//! # Send right accounting
//!
//! Every entry holding a send right accounts for exactly one of the
//! port's send rights, however many user references it carries, and
//! every send right in flight accounts for one more. Moving the last
//! user reference moves the entry's send right into the message; copying,
//! or moving one of several references, creates a new one.

use super::entry::{EntryRight, IpcEntry, IpcObject, MachPortName, MACH_PORT_UREFS_MAX};
use super::error::{IpcError, IpcResult};
use super::notify::Notification;
use super::port::PortRef;
use super::right::{check, dncancel, reverse};
use super::space::{IpcSpace, SpaceRead, SpaceWrite};
use super::{MsgTypeName, PortRight, MACH_PORT_DEAD};

/// What a copied-in right denotes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopiedObject {
    /// A right to this port, carrying one reference of the kind the
    /// message type names
    Port(PortRef),
    /// A dead name was copied in (only with `deadok`)
    Dead,
}

impl CopiedObject {
    /// The port, unless dead
    pub fn port(&self) -> Option<&PortRef> {
        match self {
            CopiedObject::Port(port) => Some(port),
            CopiedObject::Dead => None,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, CopiedObject::Dead)
    }
}

/// Result of a successful copyin
#[derive(Debug)]
pub struct CopyinResult {
    /// The right taken out of the space
    pub object: CopiedObject,
    /// Send-once right of a dead-name request the copyin cancelled; the
    /// caller sends the port-deleted notification with it
    pub soright: Option<PortRef>,
}

/// Result of copying in two send rights from one name
#[derive(Debug)]
pub struct CopyinTwoResult {
    pub first: PortRef,
    pub second: PortRef,
    pub soright: Option<PortRef>,
}

/// A right that could not be installed, handed back to the caller
#[derive(Debug, thiserror::Error)]
#[error("copyout failed: {error}")]
pub struct CopyoutError {
    pub error: IpcError,
    pub object: PortRef,
}

fn entry_port(space: &SpaceWrite<'_>, name: MachPortName) -> IpcResult<PortRef> {
    space
        .entry(name)?
        .port()
        .cloned()
        .ok_or(IpcError::InvalidRight)
}

// ============================================================================
// Copyin
// ============================================================================

/// Check whether `entry` could be copied in as `msgt`
///
/// Dead names (and entries whose port has died) pass for the send-like
/// types; whether a dead right is acceptable is up to the caller's
/// `deadok`. Nothing is modified.
pub fn copyin_check_entry(entry: &IpcEntry, msgt: MsgTypeName) -> bool {
    let right = entry.right();
    match msgt {
        MsgTypeName::MakeSend | MsgTypeName::MakeSendOnce | MsgTypeName::MoveReceive => {
            right.has_receive()
        }
        MsgTypeName::CopySend | MsgTypeName::MoveSend | MsgTypeName::MoveSendOnce => {
            if right.is_dead_name() {
                return true;
            }
            if !right.has_send() && !right.is_send_once() {
                return false;
            }
            let Some(port) = entry.port() else {
                return false;
            };
            if !port.lock().is_active() {
                return true;
            }
            if msgt == MsgTypeName::MoveSendOnce {
                right.is_send_once()
            } else {
                right.has_send()
            }
        }
    }
}

/// Check whether `name` could be copied in as `msgt`
pub fn copyin_check(space: &SpaceRead<'_>, name: MachPortName, msgt: MsgTypeName) -> bool {
    space
        .entry(name)
        .map(|entry| copyin_check_entry(entry, msgt))
        .unwrap_or(false)
}

/// Whether a send-like copyin of `name` must take the dead-name path
///
/// Liveness is settled before the right's kind: a dead send-once right
/// copied in as a send right is a dead name like any other. Entries that
/// hold neither kind are `InvalidRight`.
fn copyin_degraded(
    space: &mut SpaceWrite<'_>,
    name: MachPortName,
    right: EntryRight,
) -> IpcResult<bool> {
    if right.is_dead_name() {
        return Ok(true);
    }
    if !right.has_send() && !right.is_send_once() {
        return Err(IpcError::InvalidRight);
    }
    Ok(check(space, name))
}

/// Copy a dead name in
fn copyin_dead(
    space: &mut SpaceWrite<'_>,
    name: MachPortName,
    msgt: MsgTypeName,
    deadok: bool,
) -> IpcResult<CopyinResult> {
    if !deadok {
        return Err(IpcError::InvalidRight);
    }

    let entry = space.entry_mut(name)?;
    let EntryRight::DeadName { urefs } = entry.right() else {
        return Err(IpcError::InvalidRight);
    };
    if msgt.is_move() {
        if urefs == 1 {
            entry.clear();
            space.entry_free(name);
        } else {
            entry.right = EntryRight::DeadName { urefs: urefs - 1 };
        }
    }

    Ok(CopyinResult {
        object: CopiedObject::Dead,
        soright: None,
    })
}

/// Take a right out of the space for transmission as `msgt`
///
/// | `msgt`         | entry must hold               | effect                                  |
/// |----------------|-------------------------------|-----------------------------------------|
/// | `MakeSend`     | receive                       | new send right, make-send count bumped  |
/// | `MakeSendOnce` | receive                       | new send-once right                     |
/// | `MoveReceive`  | receive                       | receiver cleared, entry keeps any send  |
/// | `CopySend`     | send, or dead name (`deadok`) | new send right                          |
/// | `MoveSend`     | send, or dead name (`deadok`) | one user reference moves out            |
/// | `MoveSendOnce` | send-once, or dead (`deadok`) | entry freed                             |
///
/// For the last three, any send or send-once right whose port has died
/// counts as a dead name. An entry that empties is freed; a cancelled dead-name request's
/// send-once right is returned as `soright`. Errors leave the entry as it
/// was, except that a send or send-once entry whose port has died is
/// degraded to a dead name first.
pub fn copyin(
    space: &mut SpaceWrite<'_>,
    name: MachPortName,
    msgt: MsgTypeName,
    deadok: bool,
) -> IpcResult<CopyinResult> {
    log::trace!("copyin: space {:?} name {:#x} {:?}", space.id(), name, msgt);
    let right = space.entry(name)?.right();

    match msgt {
        MsgTypeName::MakeSend | MsgTypeName::MakeSendOnce => {
            if !right.has_receive() {
                return Err(IpcError::InvalidRight);
            }
            let port = entry_port(space, name)?;
            let mut p = space.lock_port(&port);
            assert!(p.is_active(), "receive right to a dead port");
            if msgt == MsgTypeName::MakeSend {
                p.make_send();
            } else {
                p.make_send_once();
            }
            drop(p);
            Ok(CopyinResult {
                object: CopiedObject::Port(port),
                soright: None,
            })
        }

        MsgTypeName::MoveReceive => {
            if !right.has_receive() {
                return Err(IpcError::InvalidRight);
            }
            let port = entry_port(space, name)?;
            let mut p = space.lock_port(&port);
            assert!(p.is_active(), "receive right to a dead port");

            let entry = space.entry_mut(name)?;
            let soright = if let EntryRight::SendReceive { urefs } = right {
                entry.right = EntryRight::Send { urefs };
                None
            } else {
                let soright = dncancel(&mut p, name, entry);
                entry.clear();
                soright
            };
            p.clear_receiver();
            drop(p);

            if right.has_send() {
                space.hash().insert(&port, name);
            } else {
                space.entry_free(name);
            }
            log::debug!("port {:?}: receive right {:#x} in transit", port.id(), name);
            Ok(CopyinResult {
                object: CopiedObject::Port(port),
                soright,
            })
        }

        MsgTypeName::CopySend => {
            if copyin_degraded(space, name, right)? {
                return copyin_dead(space, name, msgt, deadok);
            }
            if !right.has_send() {
                return Err(IpcError::InvalidRight);
            }
            let port = entry_port(space, name)?;
            space.lock_port(&port).copy_send();
            Ok(CopyinResult {
                object: CopiedObject::Port(port),
                soright: None,
            })
        }

        MsgTypeName::MoveSend => {
            if copyin_degraded(space, name, right)? {
                return copyin_dead(space, name, msgt, deadok);
            }
            if !right.has_send() {
                return Err(IpcError::InvalidRight);
            }

            let port = entry_port(space, name)?;
            let mut p = space.lock_port(&port);
            let entry = space.entry_mut(name)?;
            let urefs = right.urefs();

            if urefs > 1 {
                entry.right = match right {
                    EntryRight::SendReceive { .. } => EntryRight::SendReceive { urefs: urefs - 1 },
                    _ => EntryRight::Send { urefs: urefs - 1 },
                };
                p.copy_send();
                drop(p);
                return Ok(CopyinResult {
                    object: CopiedObject::Port(port),
                    soright: None,
                });
            }

            if right.has_receive() {
                entry.right = EntryRight::Receive;
                drop(p);
                return Ok(CopyinResult {
                    object: CopiedObject::Port(port),
                    soright: None,
                });
            }

            let soright = dncancel(&mut p, name, entry);
            entry.clear();
            drop(p);
            space.hash().delete(&port, name);
            space.entry_free(name);
            Ok(CopyinResult {
                object: CopiedObject::Port(port),
                soright,
            })
        }

        MsgTypeName::MoveSendOnce => {
            if copyin_degraded(space, name, right)? {
                return copyin_dead(space, name, msgt, deadok);
            }
            if !right.is_send_once() {
                return Err(IpcError::InvalidRight);
            }

            let port = entry_port(space, name)?;
            let mut p = space.lock_port(&port);
            let entry = space.entry_mut(name)?;
            let soright = dncancel(&mut p, name, entry);
            entry.clear();
            drop(p);
            space.entry_free(name);
            Ok(CopyinResult {
                object: CopiedObject::Port(port),
                soright,
            })
        }
    }
}

/// Put back a right taken by `copyin` with a send-like `msgt`
///
/// Used when a message that was partly copied in has to be abandoned.
/// The space must have stayed locked since the copyin. If the port died
/// in between, the name comes back as a dead name and the send-once
/// right of its cancelled request, if any, is returned so the caller can
/// send a dead-name notification with it.
pub fn copyin_undo(
    space: &mut SpaceWrite<'_>,
    name: MachPortName,
    msgt: MsgTypeName,
    copied: CopyinResult,
) -> Option<PortRef> {
    assert!(
        matches!(
            msgt,
            MsgTypeName::MoveSend | MsgTypeName::CopySend | MsgTypeName::MoveSendOnce
        ),
        "copyin_undo of {:?}",
        msgt
    );
    log::trace!("copyin_undo: space {:?} name {:#x} {:?}", space.id(), name, msgt);
    let CopyinResult { object, soright } = copied;

    if space.entry(name).is_err() {
        space
            .entry_alloc_name(name)
            .expect("copyin_undo: name reused while the space was locked");
    }

    let port = match object {
        CopiedObject::Dead => {
            assert!(soright.is_none(), "dead copyin with a request right");
            let entry = undo_entry(space, name);
            match entry.right() {
                EntryRight::None => entry.right = EntryRight::DeadName { urefs: 1 },
                EntryRight::DeadName { urefs } if msgt != MsgTypeName::CopySend => {
                    entry.right = EntryRight::DeadName {
                        urefs: urefs.saturating_add(1),
                    }
                }
                EntryRight::DeadName { .. } => {}
                other => panic!("copyin_undo: dead copyin but {} entry", other.name()),
            }
            return None;
        }
        CopiedObject::Port(port) => port,
    };

    let mut leftover = None;
    let mut reindex = false;
    let mut p = space.lock_port(&port);
    let entry = undo_entry(space, name);

    match entry.right() {
        EntryRight::None => {
            if p.is_active() {
                let right = match msgt {
                    MsgTypeName::MoveSend => {
                        reindex = true;
                        EntryRight::Send { urefs: 1 }
                    }
                    MsgTypeName::MoveSendOnce => EntryRight::SendOnce,
                    _ => panic!("copyin_undo: copy left an empty entry"),
                };
                entry.set(right, IpcObject::Port(port.clone()));
                if let Some(notify) = soright {
                    match p.dnrequest_alloc(name, notify) {
                        Ok(index) => entry.request = Some(index),
                        Err(notify) => leftover = Some(notify),
                    }
                }
            } else {
                let urefs = if soright.is_some() { 2 } else { 1 };
                entry.right = EntryRight::DeadName { urefs };
                leftover = soright;
            }
        }
        EntryRight::Receive => {
            assert_eq!(msgt, MsgTypeName::MoveSend);
            entry.right = EntryRight::SendReceive { urefs: 1 };
        }
        held @ (EntryRight::Send { urefs } | EntryRight::SendReceive { urefs }) => {
            if msgt == MsgTypeName::MoveSend {
                let urefs = urefs.saturating_add(1);
                entry.right = match held {
                    EntryRight::Send { .. } => EntryRight::Send { urefs },
                    _ => EntryRight::SendReceive { urefs },
                };
            }
            let stray = p.release_send();
            debug_assert!(stray.is_none(), "entry still holds a send right");
        }
        EntryRight::DeadName { urefs } => {
            let mut urefs = urefs;
            if msgt != MsgTypeName::CopySend {
                urefs = urefs.saturating_add(1);
            }
            if soright.is_some() {
                urefs = urefs.saturating_add(1);
            }
            entry.right = EntryRight::DeadName { urefs };
            leftover = soright;
        }
        other => panic!("copyin_undo: {} entry", other.name()),
    }
    drop(p);

    if reindex {
        space.hash().insert(&port, name);
    }
    check(space, name);
    leftover
}

fn undo_entry<'s>(space: &'s mut SpaceWrite<'_>, name: MachPortName) -> &'s mut IpcEntry {
    match space.entry_mut(name) {
        Ok(entry) => entry,
        Err(_) => panic!("copyin_undo: entry {:#x} vanished", name),
    }
}

/// Copy in two send rights from one name
///
/// The name must hold a send right with at least two user references and
/// a live port. Both references come out; an entry left without a send
/// right is freed (or keeps its receive right).
pub fn copyin_two(space: &mut SpaceWrite<'_>, name: MachPortName) -> IpcResult<CopyinTwoResult> {
    log::trace!("copyin_two: space {:?} name {:#x}", space.id(), name);
    let right = space.entry(name)?.right();
    let urefs = match right {
        EntryRight::Send { urefs } | EntryRight::SendReceive { urefs } => urefs,
        _ => return Err(IpcError::InvalidRight),
    };
    if urefs < 2 {
        return Err(IpcError::InvalidRight);
    }
    if check(space, name) {
        return Err(IpcError::InvalidRight);
    }

    let port = entry_port(space, name)?;
    let mut p = space.lock_port(&port);
    let entry = space.entry_mut(name)?;
    let mut soright = None;
    let mut freed = false;

    if urefs > 2 {
        entry.right = match right {
            EntryRight::SendReceive { .. } => EntryRight::SendReceive { urefs: urefs - 2 },
            _ => EntryRight::Send { urefs: urefs - 2 },
        };
        p.copy_send();
        p.copy_send();
    } else {
        // The entry's own send right goes out as one of the two
        p.copy_send();
        if right.has_receive() {
            entry.right = EntryRight::Receive;
        } else {
            soright = dncancel(&mut p, name, entry);
            entry.clear();
            freed = true;
        }
    }
    drop(p);

    if freed {
        space.hash().delete(&port, name);
        space.entry_free(name);
    }
    Ok(CopyinTwoResult {
        first: port.clone(),
        second: port,
        soright,
    })
}

// ============================================================================
// Copyout
// ============================================================================

/// Install a received right under `name`
///
/// `port` carries one right of the kind `msgt` transfers. The target
/// entry must be empty, or for a send right hold the send or receive
/// right to the same port, or for a receive right hold a send right to it.
/// An empty entry is refused if the space already names the port elsewhere.
/// A send right combining into an entry at the user reference ceiling
/// leaves the count at the ceiling and gives the extra right back.
/// On failure the right is handed back untouched.
pub fn copyout(
    space: &mut SpaceWrite<'_>,
    name: MachPortName,
    msgt: MsgTypeName,
    port: PortRef,
) -> Result<(), CopyoutError> {
    log::trace!("copyout: space {:?} name {:#x} {:?}", space.id(), name, msgt);
    let (right, same_port) = match space.entry(name) {
        Ok(entry) => (
            entry.right(),
            entry.port().is_some_and(|held| held.ptr_eq(&port)),
        ),
        Err(error) => return Err(CopyoutError { error, object: port }),
    };

    let fail = |port: PortRef| {
        Err(CopyoutError {
            error: IpcError::InvalidRight,
            object: port,
        })
    };

    match msgt.copyout_right() {
        PortRight::SendOnce => {
            if right != EntryRight::None {
                return fail(port);
            }
            let Ok(entry) = space.entry_mut(name) else {
                return fail(port);
            };
            entry.set(EntryRight::SendOnce, IpcObject::Port(port));
        }

        PortRight::Send => match right {
            EntryRight::None => {
                if named_elsewhere(space, name, &port) {
                    return fail(port);
                }
                space.hash().insert(&port, name);
                let Ok(entry) = space.entry_mut(name) else {
                    return fail(port);
                };
                entry.set(EntryRight::Send { urefs: 1 }, IpcObject::Port(port));
            }
            EntryRight::Send { urefs } | EntryRight::SendReceive { urefs } if same_port => {
                let mut p = space.lock_port(&port);
                let stray = p.release_send();
                debug_assert!(stray.is_none(), "entry still holds a send right");
                drop(p);

                if urefs < MACH_PORT_UREFS_MAX {
                    let Ok(entry) = space.entry_mut(name) else {
                        return fail(port);
                    };
                    entry.right = match right {
                        EntryRight::Send { .. } => EntryRight::Send { urefs: urefs + 1 },
                        _ => EntryRight::SendReceive { urefs: urefs + 1 },
                    };
                } else {
                    log::debug!("name {:#x}: user references saturated", name);
                }
            }
            EntryRight::Receive if same_port => {
                let Ok(entry) = space.entry_mut(name) else {
                    return fail(port);
                };
                entry.right = EntryRight::SendReceive { urefs: 1 };
            }
            _ => return fail(port),
        },

        PortRight::Receive => {
            let combined = match right {
                EntryRight::None if named_elsewhere(space, name, &port) => return fail(port),
                EntryRight::None => EntryRight::Receive,
                EntryRight::Send { urefs } if same_port => EntryRight::SendReceive { urefs },
                _ => return fail(port),
            };

            let mut p = space.lock_port(&port);
            assert!(p.receiver().is_none(), "receive right installed twice");
            p.set_receiver(space.id(), name);
            let destination = p.take_destination();
            drop(p);
            drop(destination);

            if right.has_send() {
                space.hash().delete(&port, name);
            }
            let Ok(entry) = space.entry_mut(name) else {
                return fail(port);
            };
            if combined == EntryRight::Receive {
                entry.set(combined, IpcObject::Port(port));
            } else {
                entry.right = combined;
            }
        }

        other => panic!("no copyout for {:?}", other),
    }

    Ok(())
}

/// Whether the space already holds a send or receive right to `port`
/// under some name other than `name`
///
/// A send entry whose port has died no longer counts; it is degraded.
fn named_elsewhere(space: &mut SpaceWrite<'_>, name: MachPortName, port: &PortRef) -> bool {
    if let Some(other) = space.hash().lookup(port) {
        if other != name && !check(space, other) {
            return true;
        }
    }
    let receiver = space.lock_port(port).receiver();
    matches!(receiver, Some((id, other)) if id == space.id() && other != name)
}

/// Destroy a copied-in right that will never be installed
///
/// A send right is released, a send-once right is consumed with a
/// send-once notification, and a receive right destroys its port.
pub fn destroy_copied(space: &IpcSpace, msgt: MsgTypeName, object: CopiedObject) {
    let CopiedObject::Port(port) = object else {
        return;
    };
    let notifier = space.notifier();

    match msgt.copyout_right() {
        PortRight::Send => {
            let notification = port.lock().release_send();
            if let Some(n) = notification {
                notifier.deliver(n);
            }
        }
        PortRight::SendOnce => notifier.deliver(Notification::SendOnce { port }),
        PortRight::Receive => {
            for n in port.destroy().into_notifications() {
                notifier.deliver(n);
            }
        }
        other => panic!("no copied right of kind {:?}", other),
    }
}

/// Install a received right, choosing its name
///
/// A send right joins the entry already naming its port (the receive
/// right's or an existing send right's); a receive right joins an
/// existing send entry; anything else gets a fresh name. A dead right
/// comes out as `MACH_PORT_DEAD`. On failure the right is destroyed.
pub fn copyout_object(
    space: &IpcSpace,
    msgt: MsgTypeName,
    object: CopiedObject,
) -> IpcResult<MachPortName> {
    let port = match object {
        CopiedObject::Dead => return Ok(MACH_PORT_DEAD),
        CopiedObject::Port(port) => port,
    };

    let mut guard = match space.write_lock() {
        Ok(guard) => guard,
        Err(e) => {
            destroy_copied(space, msgt, CopiedObject::Port(port));
            return Err(e);
        }
    };

    let existing = match msgt.copyout_right() {
        PortRight::Send => reverse(&mut guard, &port),
        PortRight::Receive => guard.hash().lookup(&port),
        _ => None,
    };

    let (name, fresh) = match existing {
        Some(name) => (name, false),
        None => match guard.entry_alloc() {
            Ok(name) => (name, true),
            Err(e) => {
                drop(guard);
                destroy_copied(space, msgt, CopiedObject::Port(port));
                return Err(e);
            }
        },
    };

    match copyout(&mut guard, name, msgt, port) {
        Ok(()) => Ok(name),
        Err(CopyoutError { error, object }) => {
            if fresh {
                guard.entry_free(name);
            }
            drop(guard);
            destroy_copied(space, msgt, CopiedObject::Port(object));
            Err(error)
        }
    }
}

// ============================================================================
// Rename
// ============================================================================

/// Move the right named `old` to the empty entry `new`
///
/// The dead-name request, the reverse index and the receiver identity
/// follow the right; `old` is freed.
pub fn rename(space: &mut SpaceWrite<'_>, old: MachPortName, new: MachPortName) -> IpcResult<()> {
    log::trace!("rename: space {:?} {:#x} -> {:#x}", space.id(), old, new);
    if old == new || !space.entry(new)?.is_none() {
        return Err(IpcError::InvalidArgument);
    }
    if space.entry(old)?.is_none() {
        return Err(IpcError::InvalidRight);
    }

    check(space, old);
    let entry = core::mem::take(space.entry_mut(old)?);

    match entry.object() {
        Some(IpcObject::Port(port)) => {
            let port = port.clone();
            let mut p = space.lock_port(&port);
            if let Some(index) = entry.request() {
                p.dnrequest_rename(index, old, new);
            }
            if entry.right().has_receive() {
                p.set_receiver(space.id(), new);
            }
            drop(p);

            if matches!(entry.right(), EntryRight::Send { .. }) {
                let hash = space.hash();
                hash.delete(&port, old);
                hash.insert(&port, new);
            }
        }
        Some(IpcObject::PortSet(pset)) => pset.set_name(new),
        None => {}
    }

    *space.entry_mut(new)? = entry;
    space.entry_free(old);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcConfig;
    use crate::ipc::notify::{NotifyType, RecordingNotifier};
    use crate::ipc::right::{dealloc, dnrequest, info};
    use alloc::sync::Arc;

    fn recording_space() -> (Arc<IpcSpace>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let config = IpcConfig::new().with_notifier(notifier.clone());
        (IpcSpace::with_config(&config), notifier)
    }

    /// A port whose receive right lives in `owner`, with `urefs` send
    /// references installed in `space` under a fresh name
    fn send_right(owner: &IpcSpace, space: &IpcSpace, urefs: u16) -> (MachPortName, PortRef) {
        let (recv, port) = owner.port_allocate().unwrap();
        let mut name = 0;
        for _ in 0..urefs {
            let mut guard = owner.write_lock().unwrap();
            let made = copyin(&mut guard, recv, MsgTypeName::MakeSend, false).unwrap();
            drop(guard);
            name = copyout_object(space, MsgTypeName::MakeSend, made.object).unwrap();
        }
        (name, port)
    }

    #[test]
    fn test_make_send_bumps_mscount() {
        let (space, _) = recording_space();
        let (recv, port) = space.port_allocate().unwrap();
        let mut guard = space.write_lock().unwrap();
        let made = copyin(&mut guard, recv, MsgTypeName::MakeSend, false).unwrap();
        assert_eq!(port.send_count(), 1);
        assert_eq!(port.make_send_count(), 1);
        assert!(made.soright.is_none());

        // Comes back to the receive entry
        copyout(&mut guard, recv, MsgTypeName::MakeSend, made.object.port().unwrap().clone())
            .unwrap();
        assert_eq!(guard.entry(recv).unwrap().right(), EntryRight::SendReceive { urefs: 1 });
        assert_eq!(port.send_count(), 1);
    }

    #[test]
    fn test_copyin_wrong_right() {
        let (space, _) = recording_space();
        let (recv, _port) = space.port_allocate().unwrap();
        let mut guard = space.write_lock().unwrap();
        assert_eq!(
            copyin(&mut guard, recv, MsgTypeName::CopySend, false).err(),
            Some(IpcError::InvalidRight)
        );
        assert_eq!(
            copyin(&mut guard, recv, MsgTypeName::MoveSendOnce, false).err(),
            Some(IpcError::InvalidRight)
        );
        assert!(!copyin_check_entry(guard.entry(recv).unwrap(), MsgTypeName::MoveSend));
        assert!(copyin_check_entry(guard.entry(recv).unwrap(), MsgTypeName::MakeSendOnce));
    }

    #[test]
    fn test_move_receive_keeps_send() {
        let (space, _) = recording_space();
        let (recv, port) = space.port_allocate().unwrap();
        let mut guard = space.write_lock().unwrap();
        let made = copyin(&mut guard, recv, MsgTypeName::MakeSend, false).unwrap();
        copyout(&mut guard, recv, MsgTypeName::MakeSend, made.object.port().unwrap().clone())
            .unwrap();

        let moved = copyin(&mut guard, recv, MsgTypeName::MoveReceive, false).unwrap();
        assert_eq!(guard.entry(recv).unwrap().right(), EntryRight::Send { urefs: 1 });
        assert_eq!(port.receiver(), None);

        // Receive comes back and rejoins the send entry through the reverse index
        drop(guard);
        let name = copyout_object(&space, MsgTypeName::MoveReceive, moved.object).unwrap();
        assert_eq!(name, recv);
        assert_eq!(port.receiver(), Some((space.id(), recv)));
        let guard = space.read_lock().unwrap();
        assert_eq!(guard.entry(recv).unwrap().right(), EntryRight::SendReceive { urefs: 1 });
    }

    #[test]
    fn test_move_send_last_ref_frees_and_returns_request() {
        let (owner, _) = recording_space();
        let (space, _) = recording_space();
        let (name, port) = send_right(&owner, &space, 1);
        let watcher = PortRef::new(1);
        dnrequest(&space, name, false, Some(watcher.make_send_once())).unwrap();

        let mut guard = space.write_lock().unwrap();
        let moved = copyin(&mut guard, name, MsgTypeName::MoveSend, false).unwrap();
        assert!(moved.soright.as_ref().unwrap().ptr_eq(&watcher));
        assert_eq!(guard.entry(name).err(), Some(IpcError::InvalidName));
        assert_eq!(port.send_count(), 1);
        assert_eq!(port.dnrequest_count(), 0);
        moved.soright.unwrap().release_send_once();
    }

    #[test]
    fn test_move_send_of_several_refs() {
        let (owner, _) = recording_space();
        let (space, _) = recording_space();
        let (name, port) = send_right(&owner, &space, 3);
        assert_eq!(port.send_count(), 1);

        let mut guard = space.write_lock().unwrap();
        let moved = copyin(&mut guard, name, MsgTypeName::MoveSend, false).unwrap();
        assert_eq!(guard.entry(name).unwrap().urefs(), 2);
        assert_eq!(port.send_count(), 2);

        let undone = copyin_undo(&mut guard, name, MsgTypeName::MoveSend, moved);
        assert!(undone.is_none());
        assert_eq!(guard.entry(name).unwrap().urefs(), 3);
        assert_eq!(port.send_count(), 1);
    }

    #[test]
    fn test_copy_send_dead() {
        let (owner, _) = recording_space();
        let (space, _) = recording_space();
        let (name, port) = send_right(&owner, &space, 1);
        drop(port.destroy());

        let mut guard = space.write_lock().unwrap();
        assert_eq!(
            copyin(&mut guard, name, MsgTypeName::CopySend, false).err(),
            Some(IpcError::InvalidRight)
        );
        assert!(guard.entry(name).unwrap().right().is_dead_name());

        let copied = copyin(&mut guard, name, MsgTypeName::CopySend, true).unwrap();
        assert!(copied.object.is_dead());
        assert_eq!(guard.entry(name).unwrap().urefs(), 1);

        let moved = copyin(&mut guard, name, MsgTypeName::MoveSend, true).unwrap();
        assert!(moved.object.is_dead());
        assert!(guard.entry(name).is_err());

        // Undo brings the dead name back
        copyin_undo(&mut guard, name, MsgTypeName::MoveSend, moved);
        assert_eq!(guard.entry(name).unwrap().right(), EntryRight::DeadName { urefs: 1 });
        drop(guard);
        assert_eq!(
            copyout_object(&space, MsgTypeName::MoveSend, CopiedObject::Dead),
            Ok(MACH_PORT_DEAD)
        );
    }

    #[test]
    fn test_undo_after_port_death_returns_request() {
        let (owner, _) = recording_space();
        let (space, _) = recording_space();
        let (name, port) = send_right(&owner, &space, 1);
        let watcher = PortRef::new(1);
        dnrequest(&space, name, false, Some(watcher.make_send_once())).unwrap();

        let mut guard = space.write_lock().unwrap();
        let moved = copyin(&mut guard, name, MsgTypeName::MoveSend, false).unwrap();
        drop(port.destroy());

        let leftover = copyin_undo(&mut guard, name, MsgTypeName::MoveSend, moved).unwrap();
        assert!(leftover.ptr_eq(&watcher));
        assert_eq!(guard.entry(name).unwrap().right(), EntryRight::DeadName { urefs: 2 });
        leftover.release_send_once();
    }

    #[test]
    fn test_copyin_two() {
        let (owner, _) = recording_space();
        let (space, _) = recording_space();
        let (name, port) = send_right(&owner, &space, 2);
        let (other, _) = send_right(&owner, &space, 1);

        let mut guard = space.write_lock().unwrap();
        let two = copyin_two(&mut guard, name).unwrap();
        assert!(two.first.ptr_eq(&two.second));
        assert!(guard.entry(name).is_err());
        assert_eq!(port.send_count(), 2);

        assert_eq!(copyin_two(&mut guard, other).err(), Some(IpcError::InvalidRight));
        assert_eq!(guard.entry(other).unwrap().urefs(), 1);
    }

    #[test]
    fn test_copyout_send_saturates() {
        let (owner, _) = recording_space();
        let (space, _) = recording_space();
        let (name, port) = send_right(&owner, &space, 1);
        {
            let mut guard = space.write_lock().unwrap();
            guard.entry_mut(name).unwrap().right = EntryRight::Send {
                urefs: MACH_PORT_UREFS_MAX,
            };
        }
        let (_, again) = {
            let mut guard = owner.write_lock().unwrap();
            let recv = port.receiver().unwrap().1;
            let made = copyin(&mut guard, recv, MsgTypeName::MakeSend, false).unwrap();
            (recv, made.object)
        };
        assert_eq!(copyout_object(&space, MsgTypeName::MakeSend, again), Ok(name));
        assert_eq!(info(&space, name).unwrap().urefs, MACH_PORT_UREFS_MAX);
        assert_eq!(port.send_count(), 1);
    }

    #[test]
    fn test_copyout_send_once_needs_empty_entry() {
        let (space, notifier) = recording_space();
        let (recv, port) = space.port_allocate().unwrap();
        let mut guard = space.write_lock().unwrap();
        let made = copyin(&mut guard, recv, MsgTypeName::MakeSendOnce, false).unwrap();
        let so = made.object.port().unwrap().clone();

        let err = copyout(&mut guard, recv, MsgTypeName::MakeSendOnce, so).unwrap_err();
        assert_eq!(err.error, IpcError::InvalidRight);
        drop(guard);

        destroy_copied(&space, MsgTypeName::MakeSendOnce, CopiedObject::Port(err.object));
        assert_eq!(port.send_once_count(), 0);
        assert_eq!(notifier.count(NotifyType::SendOnce), 1);
    }

    #[test]
    fn test_rename_moves_request_and_index() {
        let (owner, _) = recording_space();
        let (space, notifier) = recording_space();
        let (name, port) = send_right(&owner, &space, 2);
        let watcher = PortRef::new(1);
        dnrequest(&space, name, false, Some(watcher.make_send_once())).unwrap();

        let mut guard = space.write_lock().unwrap();
        guard.entry_alloc_name(77).unwrap();
        assert_eq!(rename(&mut guard, name, name), Err(IpcError::InvalidArgument));
        rename(&mut guard, name, 77).unwrap();
        assert!(guard.entry(name).is_err());
        assert_eq!(reverse(&mut guard, &port), Some(77));
        drop(guard);

        // The request follows the name
        dealloc(space.lookup_write(77).unwrap(), 77).unwrap();
        dealloc(space.lookup_write(77).unwrap(), 77).unwrap();
        let deleted = notifier.take();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name(), Some(77));
    }

    #[test]
    fn test_rename_receive_updates_receiver() {
        let (space, _) = recording_space();
        let (recv, port) = space.port_allocate().unwrap();
        let mut guard = space.write_lock().unwrap();
        guard.entry_alloc_name(5).unwrap();
        rename(&mut guard, recv, 5).unwrap();
        assert_eq!(port.receiver(), Some((space.id(), 5)));
    }

    #[test]
    fn test_dead_send_once_copies_in_as_send() {
        let (space, notifier) = recording_space();
        let port = PortRef::new(1);
        let mut guard = space.write_lock().unwrap();
        guard.entry_alloc_name(4).unwrap();
        copyout(&mut guard, 4, MsgTypeName::MakeSendOnce, port.make_send_once()).unwrap();
        drop(guard);
        drop(port.destroy());

        for msgt in [MsgTypeName::CopySend, MsgTypeName::MoveSend, MsgTypeName::MoveSendOnce] {
            assert!(copyin_check(&space.read_lock().unwrap(), 4, msgt));
        }

        let mut guard = space.write_lock().unwrap();
        assert_eq!(
            copyin(&mut guard, 4, MsgTypeName::CopySend, false).err(),
            Some(IpcError::InvalidRight)
        );
        assert_eq!(guard.entry(4).unwrap().right(), EntryRight::DeadName { urefs: 1 });

        let copied = copyin(&mut guard, 4, MsgTypeName::CopySend, true).unwrap();
        assert!(copied.object.is_dead());
        assert_eq!(guard.entry(4).unwrap().urefs(), 1);

        let moved = copyin(&mut guard, 4, MsgTypeName::MoveSend, true).unwrap();
        assert!(moved.object.is_dead());
        assert!(guard.entry(4).is_err());
        drop(guard);
        assert!(notifier.is_empty());
    }

    #[test]
    fn test_dead_send_copies_in_as_send_once() {
        let (owner, _) = recording_space();
        let (space, _) = recording_space();
        let (live, _) = send_right(&owner, &space, 1);
        let (name, port) = send_right(&owner, &space, 2);
        drop(port.destroy());

        assert!(!copyin_check(&space.read_lock().unwrap(), live, MsgTypeName::MoveSendOnce));
        assert!(copyin_check(&space.read_lock().unwrap(), name, MsgTypeName::MoveSendOnce));

        let mut guard = space.write_lock().unwrap();
        assert_eq!(
            copyin(&mut guard, live, MsgTypeName::MoveSendOnce, true).err(),
            Some(IpcError::InvalidRight)
        );
        assert_eq!(guard.entry(live).unwrap().right(), EntryRight::Send { urefs: 1 });

        let moved = copyin(&mut guard, name, MsgTypeName::MoveSendOnce, true).unwrap();
        assert!(moved.object.is_dead());
        assert!(moved.soright.is_none());
        assert_eq!(guard.entry(name).unwrap().right(), EntryRight::DeadName { urefs: 1 });
    }

    #[test]
    fn test_move_send_once_and_undo() {
        let (space, _) = recording_space();
        let (recv, port) = space.port_allocate().unwrap();
        let name = {
            let mut guard = space.write_lock().unwrap();
            let made = copyin(&mut guard, recv, MsgTypeName::MakeSendOnce, false).unwrap();
            let name = guard.entry_alloc().unwrap();
            copyout(&mut guard, name, MsgTypeName::MakeSendOnce, made.object.port().unwrap().clone())
                .unwrap();
            name
        };
        let watcher = PortRef::new(1);
        dnrequest(&space, name, false, Some(watcher.make_send_once())).unwrap();
        assert!(copyin_check(&space.read_lock().unwrap(), name, MsgTypeName::MoveSendOnce));
        assert!(!copyin_check(&space.read_lock().unwrap(), name, MsgTypeName::CopySend));

        let mut guard = space.write_lock().unwrap();
        assert_eq!(
            copyin(&mut guard, name, MsgTypeName::MoveSend, false).err(),
            Some(IpcError::InvalidRight)
        );
        let moved = copyin(&mut guard, name, MsgTypeName::MoveSendOnce, false).unwrap();
        assert!(moved.object.port().unwrap().ptr_eq(&port));
        assert!(moved.soright.as_ref().unwrap().ptr_eq(&watcher));
        assert!(guard.entry(name).is_err());
        assert_eq!(port.dnrequest_count(), 0);
        assert_eq!(port.send_once_count(), 1);

        // The request is registered again with the right
        assert!(copyin_undo(&mut guard, name, MsgTypeName::MoveSendOnce, moved).is_none());
        let entry = guard.entry(name).unwrap();
        assert_eq!(entry.right(), EntryRight::SendOnce);
        assert!(entry.request().is_some());
        assert_eq!(port.dnrequest_count(), 1);
        assert_eq!(port.send_once_count(), 1);
        assert_eq!(watcher.send_once_count(), 1);
    }

    #[test]
    fn test_copyout_refuses_a_second_name_for_a_port() {
        let (owner, _) = recording_space();
        let (space, _) = recording_space();
        let (name, port) = send_right(&owner, &space, 1);
        let recv = port.receiver().unwrap().1;

        let mut guard = owner.write_lock().unwrap();
        let made = copyin(&mut guard, recv, MsgTypeName::MakeSend, false).unwrap();
        let sent = made.object.port().unwrap().clone();

        // Under the receive right's name only
        let fresh = guard.entry_alloc().unwrap();
        let err = copyout(&mut guard, fresh, MsgTypeName::MakeSend, sent).unwrap_err();
        assert_eq!(err.error, IpcError::InvalidRight);
        assert!(guard.entry(fresh).unwrap().is_none());
        drop(guard);

        // Under the existing send entry's name only
        let mut guard = space.write_lock().unwrap();
        let fresh = guard.entry_alloc().unwrap();
        let err = copyout(&mut guard, fresh, MsgTypeName::MakeSend, err.object).unwrap_err();
        assert_eq!(err.error, IpcError::InvalidRight);
        assert!(err.object.ptr_eq(&port));
        assert!(guard.entry(fresh).unwrap().is_none());
        assert_eq!(guard.entry(name).unwrap().urefs(), 1);
        assert_eq!(reverse(&mut guard, &port), Some(name));
        drop(guard);
        assert_eq!(port.send_count(), 2);

        destroy_copied(&space, MsgTypeName::MakeSend, CopiedObject::Port(err.object));
        assert_eq!(port.send_count(), 1);
    }

    #[test]
    fn test_copyout_past_a_dead_send_entry() {
        let (space, _) = recording_space();
        let port = PortRef::new(1);
        let mut guard = space.write_lock().unwrap();
        guard.entry_alloc_name(3).unwrap();
        guard.lock_port(&port).copy_send();
        copyout(&mut guard, 3, MsgTypeName::CopySend, port.clone()).unwrap();
        drop(port.destroy());

        // The stale entry degrades instead of blocking the new name
        guard.entry_alloc_name(8).unwrap();
        guard.lock_port(&port).copy_send();
        copyout(&mut guard, 8, MsgTypeName::CopySend, port.clone()).unwrap();
        assert_eq!(guard.entry(3).unwrap().right(), EntryRight::DeadName { urefs: 1 });
        assert_eq!(guard.entry(8).unwrap().right(), EntryRight::Send { urefs: 1 });
    }

    #[test]
    fn test_rename_dead_entry_keeps_request() {
        let (owner, _) = recording_space();
        let (space, _) = recording_space();
        let (name, port) = send_right(&owner, &space, 1);
        let watcher = PortRef::new(1);
        dnrequest(&space, name, false, Some(watcher.make_send_once())).unwrap();
        drop(port.destroy());

        let mut guard = space.write_lock().unwrap();
        guard.entry_alloc_name(21).unwrap();
        rename(&mut guard, name, 21).unwrap();
        assert_eq!(guard.entry(21).unwrap().right(), EntryRight::DeadName { urefs: 2 });
        drop(guard);
        assert_eq!(port.dnrequest_count(), 0);
        assert_eq!(watcher.send_once_count(), 0);
    }
}
