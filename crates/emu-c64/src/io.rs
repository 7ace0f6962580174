//! I/O address-space router for $D000-$DFFF.
//!
//! Chips and expansions register [`IoSource`]s covering an address range.
//! Ranges may overlap (mirrors, expansion registers inside the VIC-II
//! area); the router decides which source answers a read.
//!
//! # Read resolution
//!
//! | Priority | Behaviour |
//! |----------|-----------|
//! | High | First valid High source answers immediately |
//! | Normal | Sole valid source answers; disagreeing sources are a collision |
//! | Low | Answers only when no Normal source is valid (mirrors) |
//!
//! Writes go to every source covering the address, in registration order.
//! When nothing answers a read, the open-bus value (the last VIC-II phi1
//! fetch) is returned.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Most sources the router holds at once.
pub const MAX_IO_SOURCES: usize = 256;

/// How disagreeing Normal-priority sources are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionMode {
    /// Detach every colliding source; the read sees open bus.
    DetachAll,
    /// The first registered source wins; the others are detached.
    #[default]
    DetachLast,
    /// Values are ANDed together; nothing is detached.
    AndWires,
}

impl CollisionMode {
    /// Value of the `IOCollisionHandling` resource.
    #[must_use]
    pub const fn resource_value(self) -> i64 {
        match self {
            CollisionMode::DetachAll => 0,
            CollisionMode::DetachLast => 1,
            CollisionMode::AndWires => 2,
        }
    }

    #[must_use]
    pub const fn from_resource_value(v: i64) -> Option<Self> {
        match v {
            0 => Some(CollisionMode::DetachAll),
            1 => Some(CollisionMode::DetachLast),
            2 => Some(CollisionMode::AndWires),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IoPriority {
    Low,
    Normal,
    High,
}

/// What the owner should do when a collision detaches this source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachPolicy {
    /// Built-in chip; collisions never remove it.
    Never,
    /// Clear the named resource (set it to 0).
    Resource(&'static str),
}

/// Register-level behaviour behind an address range.
///
/// `addr` is already masked with the source's address mask.
pub trait IoDevice {
    /// `None` when the device does not drive the bus for this access.
    fn read(&mut self, addr: u16) -> Option<u8>;

    /// Side-effect-free read for monitors.
    fn peek(&self, addr: u16) -> Option<u8>;

    fn store(&mut self, addr: u16, value: u8);

    /// Human-readable register dump.
    fn dump(&self) -> Option<String> {
        None
    }
}

/// A registration request.
pub struct IoSource {
    pub name: &'static str,
    pub start: u16,
    pub end: u16,
    pub mask: u16,
    pub priority: IoPriority,
    pub detach: DetachPolicy,
    pub device: Box<dyn IoDevice>,
}

impl fmt::Debug for IoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoSource")
            .field("name", &self.name)
            .field("start", &format_args!("{:#06X}", self.start))
            .field("end", &format_args!("{:#06X}", self.end))
            .field("mask", &format_args!("{:#06X}", self.mask))
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl IoSource {
    fn covers(&self, addr: u16) -> bool {
        (self.start..=self.end).contains(&addr)
    }
}

/// Registration handle. Unique for the router's lifetime, so a handle whose
/// source is gone is simply stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoHandle(u64);

/// A source removed by collision handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detached {
    pub handle: IoHandle,
    pub name: &'static str,
    pub policy: DetachPolicy,
}

/// Summary of one registered source, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoSourceInfo {
    pub handle: IoHandle,
    pub name: &'static str,
    pub start: u16,
    pub end: u16,
    pub priority: IoPriority,
    pub order: u32,
}

struct Entry {
    handle: IoHandle,
    order: u32,
    source: IoSource,
}

/// The router.
pub struct IoRouter {
    entries: Vec<Entry>,
    next_handle: u64,
    next_order: u32,
    collision: CollisionMode,
    open_bus: u8,
    detached: Vec<Detached>,
}

impl Default for IoRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl IoRouter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_handle: 0,
            next_order: 0,
            collision: CollisionMode::default(),
            open_bus: 0xFF,
            detached: Vec::new(),
        }
    }

    #[must_use]
    pub fn collision_mode(&self) -> CollisionMode {
        self.collision
    }

    pub fn set_collision_mode(&mut self, mode: CollisionMode) {
        self.collision = mode;
    }

    /// Value seen when no source drives the bus.
    pub fn set_open_bus(&mut self, value: u8) {
        self.open_bus = value;
    }

    #[must_use]
    pub fn open_bus(&self) -> u8 {
        self.open_bus
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a source. Returns `None` when the table is full.
    pub fn register(&mut self, source: IoSource) -> Option<IoHandle> {
        if self.entries.len() >= MAX_IO_SOURCES {
            log::error!("I/O source table full, cannot register {}", source.name);
            return None;
        }
        let handle = IoHandle(self.next_handle);
        self.next_handle += 1;
        let order = self.next_order;
        self.next_order += 1;
        log::debug!(
            "registered I/O source {} at ${:04X}-${:04X} (order {order})",
            source.name,
            source.start,
            source.end
        );
        self.entries.push(Entry {
            handle,
            order,
            source,
        });
        Some(handle)
    }

    /// Remove a source. Stale handles are ignored.
    pub fn unregister(&mut self, handle: IoHandle) -> Option<IoSource> {
        let pos = self.entries.iter().position(|e| e.handle == handle)?;
        let entry = self.entries.remove(pos);
        if entry.order + 1 == self.next_order {
            self.next_order -= 1;
        }
        log::debug!("unregistered I/O source {}", entry.source.name);
        Some(entry.source)
    }

    #[must_use]
    pub fn is_registered(&self, handle: IoHandle) -> bool {
        self.entries.iter().any(|e| e.handle == handle)
    }

    /// Sources removed by collisions since the last call.
    pub fn take_detached(&mut self) -> Vec<Detached> {
        std::mem::take(&mut self.detached)
    }

    /// Sources covering `addr`, in registration order.
    #[must_use]
    pub fn sources_at(&self, addr: u16) -> Vec<IoSourceInfo> {
        self.entries
            .iter()
            .filter(|e| e.source.covers(addr))
            .map(Self::info)
            .collect()
    }

    /// Every registered source, in registration order.
    #[must_use]
    pub fn sources(&self) -> Vec<IoSourceInfo> {
        self.entries.iter().map(Self::info).collect()
    }

    fn info(e: &Entry) -> IoSourceInfo {
        IoSourceInfo {
            handle: e.handle,
            name: e.source.name,
            start: e.source.start,
            end: e.source.end,
            priority: e.source.priority,
            order: e.order,
        }
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        let mut value: Option<u8> = None;
        let mut first = 0u8;
        let mut from_low = false;
        let mut lowest_order = u32::MAX;
        let mut colliding = 0usize;
        // (index, value) of each valid Normal source
        let mut normals: Vec<(usize, u8)> = Vec::new();

        for (i, e) in self.entries.iter_mut().enumerate() {
            if !e.source.covers(addr) {
                continue;
            }
            let Some(v) = e.source.device.read(addr & e.source.mask) else {
                continue;
            };
            match e.source.priority {
                IoPriority::High => return v,
                IoPriority::Low => {
                    if value.is_none() {
                        value = Some(v);
                        first = v;
                        from_low = true;
                    }
                }
                IoPriority::Normal => {
                    normals.push((i, v));
                    if value.is_none() || from_low {
                        value = Some(v);
                        first = v;
                        from_low = false;
                        lowest_order = e.order;
                        colliding = 1;
                        continue;
                    }
                    if v != first {
                        colliding += 1;
                    }
                    match self.collision {
                        CollisionMode::DetachLast if e.order < lowest_order => {
                            lowest_order = e.order;
                            value = Some(v);
                        }
                        CollisionMode::AndWires => value = value.map(|x| x & v),
                        _ => {}
                    }
                }
            }
        }

        let Some(value) = value else {
            return self.open_bus;
        };
        if colliding <= 1 {
            return value;
        }

        let names: Vec<&str> = normals
            .iter()
            .map(|&(i, _)| self.entries[i].source.name)
            .collect();
        match self.collision {
            CollisionMode::DetachAll => {
                log::warn!(
                    "I/O read collision at ${addr:04X} from {}, all devices detached",
                    names.join(", ")
                );
                let victims: Vec<usize> = normals.iter().map(|&(i, _)| i).collect();
                self.detach(&victims);
                self.open_bus
            }
            CollisionMode::DetachLast => {
                log::warn!(
                    "I/O read collision at ${addr:04X} from {}, all but the first detached",
                    names.join(", ")
                );
                let victims: Vec<usize> = normals
                    .iter()
                    .map(|&(i, _)| i)
                    .filter(|&i| self.entries[i].order != lowest_order)
                    .collect();
                self.detach(&victims);
                value
            }
            CollisionMode::AndWires => {
                log::warn!("I/O read collision at ${addr:04X} from {}", names.join(", "));
                value
            }
        }
    }

    /// Remove the entries at `indices` unless they refuse detaching.
    fn detach(&mut self, indices: &[usize]) {
        let handles: Vec<(IoHandle, &'static str, DetachPolicy)> = indices
            .iter()
            .map(|&i| &self.entries[i])
            .filter(|e| e.source.detach != DetachPolicy::Never)
            .map(|e| (e.handle, e.source.name, e.source.detach))
            .collect();
        for (handle, name, policy) in handles {
            self.unregister(handle);
            self.detached.push(Detached {
                handle,
                name,
                policy,
            });
        }
    }

    /// Read without side effects: the first covering source that answers.
    #[must_use]
    pub fn peek(&self, addr: u16) -> u8 {
        self.entries
            .iter()
            .filter(|e| e.source.covers(addr))
            .find_map(|e| e.source.device.peek(addr & e.source.mask))
            .unwrap_or(self.open_bus)
    }

    /// Write to every covering source.
    pub fn store(&mut self, addr: u16, value: u8) {
        for e in &mut self.entries {
            if e.source.covers(addr) {
                e.source.device.store(addr & e.source.mask, value);
            }
        }
    }

    /// Register dump of the first covering source that has one.
    #[must_use]
    pub fn dump(&self, addr: u16) -> Option<String> {
        self.entries
            .iter()
            .filter(|e| e.source.covers(addr))
            .find_map(|e| e.source.device.dump())
    }
}
