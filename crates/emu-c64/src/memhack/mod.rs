//! RAM expansion "hacks": C64 256K, +60K and +256K.
//!
//! Each expansion adds a latch register in the I/O area and remaps RAM
//! accesses through it. At most one is active, selected by the
//! `MemoryHack` resource.
//!
//! ```text
//! Disabled --enable--> Activating --ok--> Enabled
//!     ^                    |                 |
//!     +------ failed ------+              disable
//!     |                                      v
//!     +--------------- ok --------------- Deactivating
//! ```
//!
//! Enabling loads the backing image (or creates a blank one), moves the
//! VIC-II I/O ranges out of the way of the latch window and asks the
//! machine for a reset. Disabling flushes the image and restores the plain
//! VIC-II ranges.

mod c64_256k;
mod plus256k;
mod plus60k;

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use emu_core::{ModuleReader, Snapshot, SnapshotError};
use serde::{Deserialize, Serialize};

use crate::config::MemHackConfig;
use crate::error::{MemHackError, SwitchError};
use crate::io::{DetachPolicy, IoDevice, IoHandle, IoPriority, IoRouter, IoSource};
use crate::machine::ResetMode;
use crate::vic::VicGlue;

pub use c64_256k::{C64_256K_BASES, C64_256K_DEFAULT_BASE, C64Ram256K};
pub use plus60k::{PLUS60K_BASES, PLUS60K_DEFAULT_BASE, Plus60K};
pub use plus256k::{PLUS256K_BASE, Plus256K};

/// Which expansion the `MemoryHack` resource selects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemHackKind {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "c64_256k")]
    Ram256K,
    #[serde(rename = "plus60k")]
    Plus60K,
    #[serde(rename = "plus256k")]
    Plus256K,
}

impl MemHackKind {
    #[must_use]
    pub const fn resource_value(self) -> i64 {
        match self {
            MemHackKind::None => 0,
            MemHackKind::Ram256K => 1,
            MemHackKind::Plus60K => 2,
            MemHackKind::Plus256K => 3,
        }
    }

    #[must_use]
    pub const fn from_resource_value(v: i64) -> Option<Self> {
        match v {
            0 => Some(MemHackKind::None),
            1 => Some(MemHackKind::Ram256K),
            2 => Some(MemHackKind::Plus60K),
            3 => Some(MemHackKind::Plus256K),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            MemHackKind::None => "none",
            MemHackKind::Ram256K => "C64 256K",
            MemHackKind::Plus60K => "+60K",
            MemHackKind::Plus256K => "+256K",
        }
    }
}

/// Lifecycle of the active expansion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HackState {
    #[default]
    Disabled,
    Activating,
    Enabled,
    Deactivating,
}

/// The latch register as an I/O source. The expansion keeps the other
/// handle to the same cell.
pub(crate) struct LatchIo {
    latch: Rc<Cell<u8>>,
    /// Bits that always read back as 1.
    read_set: u8,
    /// Bits a store keeps.
    write_mask: u8,
}

impl IoDevice for LatchIo {
    fn read(&mut self, _addr: u16) -> Option<u8> {
        Some(self.latch.get() | self.read_set)
    }

    fn peek(&self, _addr: u16) -> Option<u8> {
        Some(self.latch.get() | self.read_set)
    }

    fn store(&mut self, _addr: u16, value: u8) {
        self.latch.set(value & self.write_mask);
    }

    fn dump(&self) -> Option<String> {
        Some(format!("latch ${:02X}", self.latch.get()))
    }
}

pub(crate) fn latch_source(
    name: &'static str,
    start: u16,
    end: u16,
    latch: &Rc<Cell<u8>>,
    read_set: u8,
    write_mask: u8,
) -> IoSource {
    IoSource {
        name,
        start,
        end,
        mask: 0xFFFF,
        priority: IoPriority::Normal,
        detach: DetachPolicy::Resource("MemoryHack"),
        device: Box::new(LatchIo {
            latch: Rc::clone(latch),
            read_set,
            write_mask,
        }),
    }
}

/// Plain VIC-II layout: four pages of mirrored registers.
pub const VIC_DEFAULT_RANGES: [(u16, u16); 4] = [
    (0xD000, 0xD0FF),
    (0xD100, 0xD1FF),
    (0xD200, 0xD2FF),
    (0xD300, 0xD3FF),
];

/// The active expansion.
pub enum Expansion {
    Ram256K(C64Ram256K),
    Plus60K(Plus60K),
    Plus256K(Plus256K),
}

impl Expansion {
    fn new(kind: MemHackKind, config: &MemHackConfig) -> Option<Self> {
        match kind {
            MemHackKind::None => None,
            MemHackKind::Ram256K => Some(Expansion::Ram256K(C64Ram256K::new(config.c64_256k_base))),
            MemHackKind::Plus60K => Some(Expansion::Plus60K(Plus60K::new(config.plus60k_base))),
            MemHackKind::Plus256K => Some(Expansion::Plus256K(Plus256K::new())),
        }
    }

    #[must_use]
    pub fn kind(&self) -> MemHackKind {
        match self {
            Expansion::Ram256K(_) => MemHackKind::Ram256K,
            Expansion::Plus60K(_) => MemHackKind::Plus60K,
            Expansion::Plus256K(_) => MemHackKind::Plus256K,
        }
    }

    #[must_use]
    pub fn latch(&self) -> u8 {
        match self {
            Expansion::Ram256K(e) => e.latch(),
            Expansion::Plus60K(e) => e.latch(),
            Expansion::Plus256K(e) => e.latch(),
        }
    }

    fn reset_latch(&mut self) {
        match self {
            Expansion::Ram256K(e) => e.reset_latch(),
            Expansion::Plus60K(e) => e.reset_latch(),
            Expansion::Plus256K(e) => e.reset_latch(),
        }
    }

    fn clear(&mut self) {
        self.image_mut().fill(0);
    }

    /// The part of the backing store saved to the image file.
    fn image(&self) -> &[u8] {
        match self {
            Expansion::Ram256K(e) => e.image(),
            Expansion::Plus60K(e) => e.image(),
            Expansion::Plus256K(e) => e.image(),
        }
    }

    fn image_mut(&mut self) -> &mut [u8] {
        match self {
            Expansion::Ram256K(e) => e.image_mut(),
            Expansion::Plus60K(e) => e.image_mut(),
            Expansion::Plus256K(e) => e.image_mut(),
        }
    }

    fn io_sources(&self) -> Vec<IoSource> {
        match self {
            Expansion::Ram256K(e) => vec![e.io_source()],
            Expansion::Plus60K(e) => vec![e.io_source()],
            Expansion::Plus256K(e) => vec![e.io_source()],
        }
    }

    /// VIC-II ranges while this expansion is active.
    fn vic_ranges(&self) -> Vec<(u16, u16)> {
        match self {
            Expansion::Ram256K(_) => VIC_DEFAULT_RANGES.to_vec(),
            Expansion::Plus60K(e) => e.vic_ranges(),
            Expansion::Plus256K(_) => plus256k::VIC_RANGES.to_vec(),
        }
    }

    fn reset_mode(&self) -> ResetMode {
        match self {
            Expansion::Ram256K(_) => ResetMode::Hard,
            Expansion::Plus60K(_) | Expansion::Plus256K(_) => ResetMode::PowerCycle,
        }
    }

    /// Whether a failed image flush still lets the disable go ahead.
    fn flush_failure_is_fatal(&self) -> bool {
        !matches!(self, Expansion::Ram256K(_))
    }
}

/// Expansion manager owned by the memory layer.
#[derive(Default)]
pub struct MemHack {
    config: MemHackConfig,
    state: HackState,
    active: Option<Expansion>,
    handles: Vec<IoHandle>,
}

impl MemHack {
    /// Manager with the given file and base settings. Nothing is enabled
    /// until [`switch`](Self::switch).
    #[must_use]
    pub fn new(config: &MemHackConfig) -> Self {
        let mut config = config.clone();
        config.kind = MemHackKind::None;
        Self {
            config,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn kind(&self) -> MemHackKind {
        self.active.as_ref().map_or(MemHackKind::None, Expansion::kind)
    }

    #[must_use]
    pub fn state(&self) -> HackState {
        self.state
    }

    #[must_use]
    pub fn config(&self) -> &MemHackConfig {
        &self.config
    }

    #[must_use]
    pub fn active(&self) -> Option<&Expansion> {
        self.active.as_ref()
    }

    /// Handles of the expansion's own I/O sources.
    #[must_use]
    pub fn io_handles(&self) -> &[IoHandle] {
        &self.handles
    }

    /// Set an image filename. Takes effect on the next enable.
    pub fn set_filename(&mut self, kind: MemHackKind, path: Option<PathBuf>) {
        match kind {
            MemHackKind::Ram256K => self.config.c64_256k_filename = path,
            MemHackKind::Plus60K => self.config.plus60k_filename = path,
            MemHackKind::Plus256K => self.config.plus256k_filename = path,
            MemHackKind::None => {}
        }
    }

    #[must_use]
    pub fn filename(&self, kind: MemHackKind) -> Option<&Path> {
        match kind {
            MemHackKind::Ram256K => self.config.c64_256k_filename.as_deref(),
            MemHackKind::Plus60K => self.config.plus60k_filename.as_deref(),
            MemHackKind::Plus256K => self.config.plus256k_filename.as_deref(),
            MemHackKind::None => None,
        }
    }

    /// Record a new base. The caller re-enables the expansion if it is
    /// active so the latch window moves.
    pub fn set_base(&mut self, kind: MemHackKind, base: u16) {
        match kind {
            MemHackKind::Ram256K => self.config.c64_256k_base = base,
            MemHackKind::Plus60K => self.config.plus60k_base = base,
            _ => {}
        }
    }

    /// Power-on latch values. RAM contents survive; the image is the
    /// expansion's persistent store.
    pub fn power_on(&mut self) {
        if let Some(e) = &mut self.active {
            e.reset_latch();
        }
    }

    pub(crate) fn cpu_read(&self, ram: &[u8; 0x10000], addr: u16) -> Option<u8> {
        match self.active.as_ref()? {
            Expansion::Ram256K(e) => Some(e.read(addr)),
            Expansion::Plus60K(e) => e.read(ram, addr),
            Expansion::Plus256K(e) => Some(e.read(addr)),
        }
    }

    /// Returns false when the write should land in base RAM.
    pub(crate) fn cpu_write(&mut self, _ram: &mut [u8; 0x10000], addr: u16, value: u8) -> bool {
        match &mut self.active {
            None => false,
            Some(Expansion::Ram256K(e)) => {
                e.write(addr, value);
                true
            }
            Some(Expansion::Plus60K(e)) => e.write(addr, value),
            Some(Expansion::Plus256K(e)) => {
                e.write(addr, value);
                true
            }
        }
    }

    pub(crate) fn vic_read(&self, ram: &[u8; 0x10000], addr: u16) -> Option<u8> {
        match self.active.as_ref()? {
            Expansion::Ram256K(e) => Some(e.read(addr)),
            Expansion::Plus60K(e) => e.read(ram, addr),
            Expansion::Plus256K(e) => Some(e.vic_read(addr)),
        }
    }

    /// Make `kind` the active expansion, fully disabling the current one
    /// first. Returns the reset the machine must perform, if any.
    ///
    /// If the current expansion cannot be disabled it stays active. If the
    /// new one cannot be enabled the previous one is mapped back in, and
    /// the error carries the reset the disable still owes.
    pub fn switch(
        &mut self,
        kind: MemHackKind,
        io: &mut IoRouter,
        vic: &mut VicGlue,
    ) -> Result<Option<ResetMode>, SwitchError> {
        if kind == self.kind() {
            return Ok(None);
        }
        let previous = self
            .disable(io, vic)
            .map_err(|error| SwitchError { error, reset: None })?;
        let mut reset = previous.as_ref().map(Expansion::reset_mode);
        if kind == MemHackKind::None {
            return Ok(reset);
        }

        match self.enable(kind, io, vic) {
            Ok(mode) => Ok(Some(reset.map_or(mode, |r| r.max(mode)))),
            Err(error) => {
                if let Some(old) = previous {
                    let old_kind = old.kind();
                    match self.install(old, io, vic) {
                        Ok(mode) => {
                            log::warn!("{} RAM expansion kept after failed switch", old_kind.name());
                            reset = Some(reset.map_or(mode, |r| r.max(mode)));
                        }
                        Err(e) => log::error!("{}: cannot map back in: {e}", old_kind.name()),
                    }
                }
                Err(SwitchError { error, reset })
            }
        }
    }

    fn enable(
        &mut self,
        kind: MemHackKind,
        io: &mut IoRouter,
        vic: &mut VicGlue,
    ) -> Result<ResetMode, MemHackError> {
        let Some(mut expansion) = Expansion::new(kind, &self.config) else {
            return Ok(ResetMode::Soft);
        };
        self.state = HackState::Activating;

        if let Some(path) = self.filename(kind).map(Path::to_path_buf) {
            if let Err(e) = load_or_create(&path, expansion.image_mut()) {
                log::error!("{}: {e}", kind.name());
                self.state = HackState::Disabled;
                return Err(e);
            }
        }
        expansion.reset_latch();

        let mode = self.install(expansion, io, vic)?;
        log::info!("{} RAM expansion enabled", kind.name());
        Ok(mode)
    }

    /// Map `expansion` into the I/O area and make it the active one.
    fn install(
        &mut self,
        expansion: Expansion,
        io: &mut IoRouter,
        vic: &mut VicGlue,
    ) -> Result<ResetMode, MemHackError> {
        if let Err(e) = register_io(&mut self.handles, &expansion, io, vic) {
            self.state = HackState::Disabled;
            return Err(e);
        }
        let mode = expansion.reset_mode();
        self.active = Some(expansion);
        self.state = HackState::Enabled;
        Ok(mode)
    }

    /// Flush and unmap the active expansion, handing it back. `None` when
    /// nothing was active.
    fn disable(
        &mut self,
        io: &mut IoRouter,
        vic: &mut VicGlue,
    ) -> Result<Option<Expansion>, MemHackError> {
        let Some(expansion) = self.active.take() else {
            return Ok(None);
        };
        let kind = expansion.kind();
        self.state = HackState::Deactivating;

        if let Some(path) = self.filename(kind).map(Path::to_path_buf) {
            if let Err(source) = std::fs::write(&path, expansion.image()) {
                let err = MemHackError::Flush {
                    path: path.display().to_string(),
                    source,
                };
                if expansion.flush_failure_is_fatal() {
                    log::error!("{}: {err}, staying enabled", kind.name());
                    self.active = Some(expansion);
                    self.state = HackState::Enabled;
                    return Err(err);
                }
                log::warn!("{}: {err}", kind.name());
            }
        }

        for h in self.handles.drain(..) {
            io.unregister(h);
        }
        vic.unregister(io);
        vic.register(io, &VIC_DEFAULT_RANGES);

        self.state = HackState::Disabled;
        log::info!("{} RAM expansion disabled", kind.name());
        Ok(Some(expansion))
    }

    /// Re-map the active expansion at its own base, after a snapshot
    /// restore may have moved the latch window. The base settings follow.
    pub fn rebind(&mut self, io: &mut IoRouter, vic: &mut VicGlue) -> Result<(), MemHackError> {
        let Some(expansion) = &self.active else {
            return Ok(());
        };
        match expansion {
            Expansion::Ram256K(e) => self.config.c64_256k_base = e.base(),
            Expansion::Plus60K(e) => self.config.plus60k_base = e.base(),
            Expansion::Plus256K(_) => {}
        }
        for h in self.handles.drain(..) {
            io.unregister(h);
        }
        let result = register_io(&mut self.handles, expansion, io, vic);
        if result.is_err() {
            self.active = None;
            self.state = HackState::Disabled;
        }
        result
    }

    /// Drop the expansion's I/O registrations after the router detached
    /// them, and turn it off without touching the image file.
    pub fn detached(&mut self, io: &mut IoRouter, vic: &mut VicGlue) {
        if let Some(e) = self.active.take() {
            log::warn!("{} RAM expansion detached by I/O collision", e.kind().name());
            for h in self.handles.drain(..) {
                io.unregister(h);
            }
            vic.unregister(io);
            vic.register(io, &VIC_DEFAULT_RANGES);
            self.state = HackState::Disabled;
        }
    }

    /// Write the active expansion's snapshot module.
    pub fn write_snapshot(&self, snap: &mut Snapshot) -> Result<(), SnapshotError> {
        match &self.active {
            None => Ok(()),
            Some(Expansion::Ram256K(e)) => e.write_snapshot(snap),
            Some(Expansion::Plus60K(e)) => e.write_snapshot(snap),
            Some(Expansion::Plus256K(e)) => e.write_snapshot(snap),
        }
    }

    /// Restore the active expansion's module. The machine has already
    /// switched to the expansion recorded in its own module.
    pub fn read_snapshot(&mut self, snap: &Snapshot) -> Result<(), SnapshotError> {
        match &mut self.active {
            None => Ok(()),
            Some(Expansion::Ram256K(e)) => e.read_snapshot(snap),
            Some(Expansion::Plus60K(e)) => e.read_snapshot(snap),
            Some(Expansion::Plus256K(e)) => e.read_snapshot(snap),
        }
    }

    /// Zero the backing store (used before restoring a snapshot).
    pub fn clear(&mut self) {
        if let Some(e) = &mut self.active {
            e.clear();
        }
    }
}

/// Move the VIC-II out of the way and register the latch window. A full
/// I/O table undoes every registration.
fn register_io(
    handles: &mut Vec<IoHandle>,
    expansion: &Expansion,
    io: &mut IoRouter,
    vic: &mut VicGlue,
) -> Result<(), MemHackError> {
    vic.unregister(io);
    for source in expansion.io_sources() {
        if let Some(h) = io.register(source) {
            handles.push(h);
        } else {
            for h in handles.drain(..) {
                io.unregister(h);
            }
            vic.register(io, &VIC_DEFAULT_RANGES);
            return Err(MemHackError::IoTableFull);
        }
    }
    vic.register(io, &expansion.vic_ranges());
    Ok(())
}

/// Read a RAM block that must match `out` in size.
pub(crate) fn read_ram_block(
    m: &mut ModuleReader<'_>,
    out: &mut [u8],
) -> Result<(), SnapshotError> {
    let data = m.read_block()?;
    if data.len() != out.len() {
        return Err(m.invalid(format!("RAM block of {} bytes, expected {}", data.len(), out.len())));
    }
    out.copy_from_slice(data);
    Ok(())
}

/// Fill `image` from `path`, or write a blank image there if it cannot be
/// read or has the wrong size.
fn load_or_create(path: &Path, image: &mut [u8]) -> Result<(), MemHackError> {
    match std::fs::read(path) {
        Ok(data) if data.len() == image.len() => {
            image.copy_from_slice(&data);
            log::info!("loaded expansion image {}", path.display());
            return Ok(());
        }
        Ok(data) => log::warn!(
            "{}: expected {} bytes, found {}; creating a new image",
            path.display(),
            image.len(),
            data.len()
        ),
        Err(e) => log::warn!("{}: {e}; creating a new image", path.display()),
    }

    image.fill(0);
    std::fs::write(path, &*image).map_err(|source| MemHackError::Image {
        path: path.display().to_string(),
        source,
    })
}
