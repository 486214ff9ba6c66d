//! IPC Notifications
//!
//! Right operations never deliver a notification while a space or port
//! lock is held. They queue [`Notification`]s in a
//! [`PendingNotifications`] and hand them to the space's [`Notifier`]
//! after unlocking.
//!
//! Every notification carries a send-once right (the request right, or
//! for `SendOnce` the right being consumed). Delivery consumes it; a
//! notifier that does not send a message must call
//! [`Notification::consume`].

use alloc::vec::Vec;
use spin::Mutex;

use super::entry::MachPortName;
use super::port::PortRef;

/// Types of port notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NotifyType {
    /// A watched port died
    DeadName = 0x0041,
    /// No more send rights exist
    NoSenders = 0x0046,
    /// A send-once right was destroyed unused
    SendOnce = 0x0047,
    /// A right with a dead-name request was deallocated
    PortDeleted = 0x0048,
}

impl NotifyType {
    /// Get message ID for this notification type
    pub fn msg_id(self) -> i32 {
        self as i32
    }
}

/// A notification ready for delivery
#[derive(Debug, Clone)]
pub enum Notification {
    /// The last send right to a port went away
    NoSenders { notify: PortRef, mscount: u32 },
    /// A send-once right to `port` was destroyed without being used
    SendOnce { port: PortRef },
    /// The right named `name` was deallocated while a request was registered
    PortDeleted { notify: PortRef, name: MachPortName },
    /// The port named `name` is dead
    DeadName { notify: PortRef, name: MachPortName },
}

impl Notification {
    /// Notification type
    pub fn notify_type(&self) -> NotifyType {
        match self {
            Notification::NoSenders { .. } => NotifyType::NoSenders,
            Notification::SendOnce { .. } => NotifyType::SendOnce,
            Notification::PortDeleted { .. } => NotifyType::PortDeleted,
            Notification::DeadName { .. } => NotifyType::DeadName,
        }
    }

    /// Port the notification is sent to
    pub fn target(&self) -> &PortRef {
        match self {
            Notification::NoSenders { notify, .. }
            | Notification::PortDeleted { notify, .. }
            | Notification::DeadName { notify, .. } => notify,
            Notification::SendOnce { port } => port,
        }
    }

    /// Name the notification is about, if any
    pub fn name(&self) -> Option<MachPortName> {
        match self {
            Notification::PortDeleted { name, .. } | Notification::DeadName { name, .. } => {
                Some(*name)
            }
            _ => None,
        }
    }

    /// Release the send-once right the notification travels on
    pub fn consume(&self) {
        self.target().release_send_once();
    }
}

/// Notification sink
///
/// Called with no locks held.
pub trait Notifier: Send + Sync {
    fn deliver(&self, notification: Notification);
}

/// Notifier that logs and consumes
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn deliver(&self, notification: Notification) {
        log::debug!(
            "notify {:?} -> {:?} (name {:?})",
            notification.notify_type(),
            notification.target(),
            notification.name()
        );
        notification.consume();
    }
}

/// Notifier that consumes and keeps every delivery for inspection
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything delivered so far
    pub fn take(&self) -> Vec<Notification> {
        core::mem::take(&mut *self.delivered.lock())
    }

    /// Number of deliveries of one type
    pub fn count(&self, notify_type: NotifyType) -> usize {
        self.delivered
            .lock()
            .iter()
            .filter(|n| n.notify_type() == notify_type)
            .count()
    }

    /// Number of deliveries so far
    pub fn len(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Notifier for RecordingNotifier {
    fn deliver(&self, notification: Notification) {
        notification.consume();
        self.delivered.lock().push(notification);
    }
}

/// Notifications queued under lock, delivered after unlock
///
/// Also carries send-once rights of absorbed dead-name requests, which
/// are released without a message.
#[derive(Debug, Default)]
#[must_use = "pending notifications must be delivered"]
pub struct PendingNotifications {
    notifications: Vec<Notification>,
    released: Vec<PortRef>,
}

impl PendingNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    pub fn push_opt(&mut self, notification: Option<Notification>) {
        if let Some(n) = notification {
            self.notifications.push(n);
        }
    }

    pub fn extend(&mut self, notifications: impl IntoIterator<Item = Notification>) {
        self.notifications.extend(notifications);
    }

    /// Queue a send-once right to be released without a notification
    pub fn release(&mut self, soright: PortRef) {
        self.released.push(soright);
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty() && self.released.is_empty()
    }

    /// Release absorbed rights, then hand everything to `notifier`
    pub fn deliver(self, notifier: &dyn Notifier) {
        for soright in self.released {
            soright.release_send_once();
        }
        for notification in self.notifications {
            notifier.deliver(notification);
        }
    }
}
