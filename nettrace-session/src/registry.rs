//! Interface registrations of a session
//!
//! Indices are handed out in registration order starting at 0 and are never
//! reused for another interface. Restarting a capture on a known interface
//! keeps its index and its statistics.

use nettrace_core::{Error, InterfaceDescriptor, InterfaceStats, LinkType, Result, StatsAccumulator};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::scheduler::Command;

/// One registered interface
#[derive(Debug, Clone)]
pub struct RegisteredInterface {
    pub descriptor: InterfaceDescriptor,
    pub stats: StatsAccumulator,
    /// Set while a read loop feeds this interface
    pub active: Arc<AtomicBool>,
}

impl RegisteredInterface {
    pub fn index(&self) -> u32 {
        self.descriptor.index
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Outcome of [`InterfaceRegistry::register`]
#[derive(Debug, Clone)]
pub struct Registration {
    pub interface: RegisteredInterface,
    /// Whether an earlier capture already registered this interface
    pub reused: bool,
}

#[derive(Default)]
struct Inner {
    entries: Vec<RegisteredInterface>,
    by_name: HashMap<String, u32>,
}

/// Name to index mapping plus per-interface statistics
#[derive(Default)]
pub struct InterfaceRegistry {
    inner: Mutex<Inner>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` and mark it active
    ///
    /// A new interface is announced to the scheduler through `commands`
    /// while the registry lock is held, so announcements reach the writer in
    /// index order and before any record of the interface can be released.
    pub fn register(
        &self,
        name: &str,
        link_type: LinkType,
        snapshot_length: u32,
        commands: &UnboundedSender<Command>,
    ) -> Result<Registration> {
        let mut inner = self.inner.lock();

        if let Some(&index) = inner.by_name.get(name) {
            let entry = inner.entries[index as usize].clone();
            if entry.active.swap(true, Ordering::AcqRel) {
                return Err(Error::AlreadyExists(format!(
                    "capture on interface '{}' is still running",
                    name
                )));
            }

            if entry.descriptor.link_type != link_type {
                warn!(
                    interface = %name,
                    registered = %entry.descriptor.link_type,
                    restarted = %link_type,
                    "Restarted capture reports a different link type"
                );
            }

            entry.stats.begin_generation();
            debug!(interface = %name, index = index, "Reusing interface registration");
            return Ok(Registration {
                interface: entry,
                reused: true,
            });
        }

        if commands.is_closed() {
            return Err(Error::AlreadyClosed);
        }

        let index = inner.entries.len() as u32;
        let entry = RegisteredInterface {
            descriptor: InterfaceDescriptor {
                index,
                name: name.to_string(),
                link_type,
                snapshot_length,
            },
            stats: StatsAccumulator::new(),
            active: Arc::new(AtomicBool::new(true)),
        };

        commands
            .send(Command::RegisterInterface(entry.descriptor.clone()))
            .map_err(|_| Error::AlreadyClosed)?;

        inner.by_name.insert(name.to_string(), index);
        inner.entries.push(entry.clone());

        info!(
            interface = %name,
            index = index,
            link_type = %link_type,
            snaplen = snapshot_length,
            "Registered interface"
        );

        Ok(Registration {
            interface: entry,
            reused: false,
        })
    }

    pub fn get(&self, index: u32) -> Option<RegisteredInterface> {
        self.inner.lock().entries.get(index as usize).cloned()
    }

    pub fn find(&self, name: &str) -> Option<RegisteredInterface> {
        let inner = self.inner.lock();
        inner
            .by_name
            .get(name)
            .and_then(|&index| inner.entries.get(index as usize).cloned())
    }

    /// All registrations in index order
    pub fn descriptors(&self) -> Vec<InterfaceDescriptor> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Statistics of every interface stamped with `now`, in index order
    pub fn snapshot_all(&self, now: SystemTime) -> Vec<(u32, InterfaceStats)> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| (e.descriptor.index, e.stats.snapshot(now)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nettrace_core::SourceStats;
    use std::time::UNIX_EPOCH;
    use tokio::sync::mpsc;

    #[test]
    fn test_indices_follow_registration_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = InterfaceRegistry::new();

        let first = registry.register("h1/eth0", LinkType::ETHERNET, 1600, &tx).unwrap();
        let second = registry.register("h2/eth0", LinkType::ETHERNET, 1600, &tx).unwrap();
        assert_eq!(first.interface.index(), 0);
        assert_eq!(second.interface.index(), 1);
        assert!(!first.reused);

        for expected in 0..2 {
            match rx.try_recv().unwrap() {
                Command::RegisterInterface(desc) => assert_eq!(desc.index, expected),
                other => panic!("unexpected command {:?}", other),
            }
        }
    }

    #[test]
    fn test_restart_reuses_index() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = InterfaceRegistry::new();

        let first = registry.register("h1/eth0", LinkType::ETHERNET, 1600, &tx).unwrap();
        assert!(matches!(
            registry.register("h1/eth0", LinkType::ETHERNET, 1600, &tx),
            Err(Error::AlreadyExists(_))
        ));

        first.interface.active.store(false, Ordering::Release);
        let again = registry.register("h1/eth0", LinkType::ETHERNET, 1600, &tx).unwrap();
        assert!(again.reused);
        assert_eq!(again.interface.index(), 0);
        assert!(again.interface.is_active());
        assert_eq!(registry.len(), 1);

        // Only the first registration is announced
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_restart_keeps_stats_monotonic() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = InterfaceRegistry::new();

        let first = registry.register("h1/eth0", LinkType::ETHERNET, 1600, &tx).unwrap();
        first.interface.stats.observe_source(SourceStats {
            received: 40,
            dropped: 3,
        });
        let before = registry.snapshot_all(UNIX_EPOCH)[0].1.clone();
        first.interface.active.store(false, Ordering::Release);

        let again = registry.register("h1/eth0", LinkType::ETHERNET, 1600, &tx).unwrap();
        again.interface.stats.observe_source(SourceStats {
            received: 5,
            dropped: 0,
        });
        let after = registry.snapshot_all(UNIX_EPOCH)[0].1.clone();

        assert!(after.received >= before.received);
        assert!(after.dropped >= before.dropped);
        assert_eq!(after.received, 45);
        assert_eq!(after.dropped, 3);
    }

    #[test]
    fn test_register_after_close_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let registry = InterfaceRegistry::new();
        assert!(matches!(
            registry.register("h1/eth0", LinkType::ETHERNET, 1600, &tx),
            Err(Error::AlreadyClosed)
        ));
        assert!(registry.is_empty());
    }
}
