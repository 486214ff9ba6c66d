//! Property-based tests for right bookkeeping
//!
//! Random sequences of transfers, deallocations and port deaths across a
//! few spaces; after every step each entry must be consistent and each
//! live port's send right count must match the entries holding send
//! rights to it.

use std::sync::Arc;

use mach_rights::ipc::right::{dealloc, delta, destroy, reverse};
use mach_rights::ipc::transfer::{copyin, copyout_object};
use mach_rights::ipc::{EntryRight, IpcSpace, PortRef, RecordingNotifier};
use mach_rights::{IpcConfig, MachPortName, MsgTypeName, PortRight};
use proptest::prelude::*;

const SPACES: usize = 3;
const PORTS: usize = 2;

#[derive(Debug, Clone)]
enum Op {
    MakeSend { port: usize, to: usize },
    CopySend { from: usize, pick: usize, to: usize },
    MoveSend { from: usize, pick: usize, to: usize },
    Dealloc { space: usize, pick: usize },
    Delta { space: usize, pick: usize, amount: i32 },
    Destroy { space: usize, pick: usize },
    KillPort { port: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..PORTS, 0..SPACES).prop_map(|(port, to)| Op::MakeSend { port, to }),
        2 => (0..SPACES, any::<usize>(), 0..SPACES)
            .prop_map(|(from, pick, to)| Op::CopySend { from, pick, to }),
        2 => (0..SPACES, any::<usize>(), 0..SPACES)
            .prop_map(|(from, pick, to)| Op::MoveSend { from, pick, to }),
        2 => (0..SPACES, any::<usize>()).prop_map(|(space, pick)| Op::Dealloc { space, pick }),
        2 => (0..SPACES, any::<usize>(), -2i32..=2)
            .prop_map(|(space, pick, amount)| Op::Delta { space, pick, amount }),
        1 => (0..SPACES, any::<usize>()).prop_map(|(space, pick)| Op::Destroy { space, pick }),
        1 => (0..PORTS).prop_map(|port| Op::KillPort { port }),
    ]
}

struct World {
    owner: Arc<IpcSpace>,
    spaces: Vec<Arc<IpcSpace>>,
    ports: Vec<(MachPortName, PortRef)>,
}

impl World {
    fn new() -> Self {
        let notifier = Arc::new(RecordingNotifier::new());
        let config = IpcConfig::new().with_notifier(notifier);
        let owner = IpcSpace::with_config(&config);
        let ports = (0..PORTS).map(|_| owner.port_allocate().unwrap()).collect();
        let spaces = (0..SPACES).map(|_| IpcSpace::with_config(&config)).collect();
        Self {
            owner,
            spaces,
            ports,
        }
    }

    fn pick(&self, space: usize, pick: usize) -> Option<MachPortName> {
        let names = self.spaces[space].read_lock().unwrap().table().names();
        if names.is_empty() {
            None
        } else {
            Some(names[pick % names.len()])
        }
    }

    fn transfer(&self, from: usize, name: MachPortName, to: usize, msgt: MsgTypeName) {
        let copied = {
            let mut guard = self.spaces[from].write_lock().unwrap();
            copyin(&mut guard, name, msgt, true)
        };
        if let Ok(copied) = copied {
            assert!(copied.soright.is_none());
            copyout_object(&self.spaces[to], msgt, copied.object).unwrap();
        }
    }

    fn apply(&self, op: &Op) {
        match *op {
            Op::MakeSend { port, to } => {
                let (recv, ref port) = self.ports[port];
                if !port.is_active() {
                    return;
                }
                let made = {
                    let mut guard = self.owner.write_lock().unwrap();
                    copyin(&mut guard, recv, MsgTypeName::MakeSend, false).unwrap()
                };
                copyout_object(&self.spaces[to], MsgTypeName::MakeSend, made.object).unwrap();
            }
            Op::CopySend { from, pick, to } => {
                if let Some(name) = self.pick(from, pick) {
                    self.transfer(from, name, to, MsgTypeName::CopySend);
                }
            }
            Op::MoveSend { from, pick, to } => {
                if let Some(name) = self.pick(from, pick) {
                    self.transfer(from, name, to, MsgTypeName::MoveSend);
                }
            }
            Op::Dealloc { space, pick } => {
                if let Some(name) = self.pick(space, pick) {
                    let guard = self.spaces[space].lookup_write(name).unwrap();
                    let _ = dealloc(guard, name);
                }
            }
            Op::Delta {
                space,
                pick,
                amount,
            } => {
                if let Some(name) = self.pick(space, pick) {
                    let right = match self.spaces[space].read_lock().unwrap().entry(name) {
                        Ok(entry) if entry.right().is_dead_name() => PortRight::DeadName,
                        _ => PortRight::Send,
                    };
                    let guard = self.spaces[space].lookup_write(name).unwrap();
                    let _ = delta(guard, name, right, amount);
                }
            }
            Op::Destroy { space, pick } => {
                if let Some(name) = self.pick(space, pick) {
                    let guard = self.spaces[space].lookup_write(name).unwrap();
                    destroy(guard, name).unwrap();
                }
            }
            Op::KillPort { port } => {
                let (recv, ref port) = self.ports[port];
                if port.is_active() {
                    let guard = self.owner.lookup_write(recv).unwrap();
                    delta(guard, recv, PortRight::Receive, -1).unwrap();
                }
            }
        }
    }

    fn check_invariants(&self) {
        let mut holders = vec![0u32; PORTS];

        for space in &self.spaces {
            let mut guard = space.write_lock().unwrap();
            let mut sends = Vec::new();
            for (name, entry) in guard.table().iter() {
                assert!(entry.is_consistent(), "entry {:#x}: {:?}", name, entry);
                assert!(!entry.is_none(), "empty entry {:#x} left allocated", name);
                if let EntryRight::Send { .. } = entry.right() {
                    let port = entry.port().unwrap().clone();
                    for (i, (_, p)) in self.ports.iter().enumerate() {
                        if p.ptr_eq(&port) {
                            holders[i] += 1;
                        }
                    }
                    sends.push((name, port));
                }
            }

            // Every live send right is reachable through the reverse index
            for (name, port) in sends {
                if port.is_active() {
                    assert_eq!(reverse(&mut guard, &port), Some(name));
                }
            }
        }

        for (i, (_, port)) in self.ports.iter().enumerate() {
            if port.is_active() {
                assert_eq!(port.send_count(), holders[i], "port {}", i);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Entries stay consistent and send counts match the entries holding them
    #[test]
    fn send_rights_are_conserved(ops in prop::collection::vec(op(), 1..48)) {
        let world = World::new();
        for op in &ops {
            world.apply(op);
            world.check_invariants();
        }
    }

    /// Tearing every space down leaves no send rights behind
    #[test]
    fn space_teardown_releases_everything(ops in prop::collection::vec(op(), 1..32)) {
        let world = World::new();
        for op in &ops {
            world.apply(op);
        }
        for space in &world.spaces {
            space.destroy().unwrap();
        }
        for (_, port) in &world.ports {
            if port.is_active() {
                prop_assert_eq!(port.send_count(), 0);
            }
        }
    }
}
