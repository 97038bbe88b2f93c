// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dynamic-reconfiguration connectors: the per-slot state machines through
//! which devices are plugged into and unplugged from a running guest.
//!
//! A connector crosses two orthogonal state axes.  Isolation is guest
//! controlled and signals whether the guest has stopped using the device;
//! allocation is host controlled and signals whether a device currently
//! backs the slot.  Unplug is asynchronous: the host requests a detach, the
//! connector latches the request, and removal only finalizes once the guest
//! transitions the slot back to isolated after having fully configured the
//! device.  Finalizing on an isolation transition of a device the guest is
//! still configuring would yank it mid-setup and can crash the guest, so
//! completion of the configuration walk gates removal; a machine reset
//! forces any still-pending removal through.

use std::sync::{Arc, Mutex};

use slog::debug;
use strum::FromRepr;
use thiserror::Error;

use crate::fdt::{self, Fdt, FdtCursor, FdtError, FdtNode, Step};
use crate::migrate::MigrateStateError;

const INDEX_TYPE_SHIFT: u32 = 28;
const INDEX_ID_MASK: u32 = (1 << INDEX_TYPE_SHIFT) - 1;

/// Connector type.  Values are the power-of-two identifiers the guest sees;
/// the bit position doubles as the type field of the connector index.
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromRepr)]
#[repr(u32)]
pub enum DrcType {
    Cpu = 1 << 1,
    Phb = 1 << 2,
    Vio = 1 << 3,
    Pci = 1 << 4,
    Lmb = 1 << 8,
}

impl DrcType {
    pub const fn type_shift(self) -> u32 {
        (self as u32).trailing_zeros()
    }

    fn connector_name(self, id: u32) -> String {
        match self {
            DrcType::Cpu => format!("CPU {}", id),
            DrcType::Phb => format!("PHB {}", id),
            // adaptor connectors use bare location codes
            DrcType::Vio | DrcType::Pci => format!("C{}", id),
            DrcType::Lmb => format!("LMB {}", id),
        }
    }
}

/// Globally unique connector identifier: type shift in the top nibble, slot
/// id in the low 28 bits.  Stable for the connector's lifetime and used as
/// the external lookup key.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct DrcIndex(u32);

impl DrcIndex {
    pub const fn new(dtype: DrcType, id: u32) -> Self {
        Self((dtype.type_shift() << INDEX_TYPE_SHIFT) | (id & INDEX_ID_MASK))
    }
    pub const fn get(&self) -> u32 {
        self.0
    }
}

/// Guest-controlled: whether it is safe for the host to reclaim the device.
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromRepr)]
#[repr(u32)]
pub enum IsolationState {
    Isolated = 0,
    Unisolated = 1,
}

/// Host-controlled: whether the resource is currently assigned to a device.
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromRepr)]
#[repr(u32)]
pub enum AllocationState {
    Unusable = 0,
    Usable = 1,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, FromRepr)]
#[repr(u32)]
pub enum IndicatorState {
    Inactive = 0,
    Active = 1,
}

/// Sensor value the guest reads to probe slot occupancy.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum EntitySense {
    Empty = 0,
    Present = 1,
    Unusable = 2,
}

/// Whether a host detach request is waiting on the guest.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum ReleaseState {
    Idle,
    DetachRequested,
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("an attached device is still awaiting release")]
    AwaitingRelease,

    #[error("connector already has an allocated device")]
    AlreadyAllocated,

    #[error("hotplugged device requires a configuration blob")]
    MissingConfig,
}

#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error("no configuration stream is installed")]
    NoStream,

    #[error(transparent)]
    Fdt(#[from] FdtError),
}

/// Device object backing an occupied connector.  The surrounding device-model
/// framework owns the device; the connector holds only a shared reference.
pub trait DrcDevice: Send + Sync {
    /// Human-readable identity, for logging and state snapshots.
    fn label(&self) -> String;
}

/// One-shot completion for a finalized detach.  Runs outside the connector
/// state lock, so it may call back into the connector.
pub type DetachFn = Box<dyn FnOnce(&Arc<dyn DrcDevice>) + Send>;

type DetachCompletion = (DetachFn, Arc<dyn DrcDevice>);

struct ConfigState {
    fdt: Option<Fdt>,
    cursor: FdtCursor,
    configured: bool,
}

impl Default for ConfigState {
    fn default() -> Self {
        Self { fdt: None, cursor: FdtCursor::new(0), configured: false }
    }
}

struct Inner {
    isolation: IsolationState,
    allocation: AllocationState,
    indicator: IndicatorState,
    release: ReleaseState,
    device: Option<Arc<dyn DrcDevice>>,
    detach_cb: Option<DetachFn>,
    config: ConfigState,
}

impl Inner {
    /// A pending detach may finalize only once the guest has walked the
    /// device's configuration stream to completion; an isolation transition
    /// before that point is part of configuration, not removal.
    fn removal_eligible(&self) -> bool {
        self.release == ReleaseState::DetachRequested && self.config.configured
    }
}

/// A dynamic-reconfiguration connector: one attachable/detachable slot.
pub struct Drc {
    dtype: DrcType,
    id: u32,
    name: String,
    log: slog::Logger,
    inner: Mutex<Inner>,
}

impl Drc {
    /// Creates a connector for slot `id` of `dtype`.  `(dtype, id)` pairs
    /// must be unique; the derived index is their packed form.
    pub fn new(dtype: DrcType, id: u32, log: &slog::Logger) -> Arc<Self> {
        let name = dtype.connector_name(id);
        let index = DrcIndex::new(dtype, id).get();
        Arc::new(Self {
            dtype,
            id,
            name,
            log: log.new(
                slog::o!("drc" => format!("{:x}", index)),
            ),
            inner: Mutex::new(Inner {
                isolation: IsolationState::Isolated,
                allocation: AllocationState::Unusable,
                indicator: IndicatorState::Inactive,
                release: ReleaseState::Idle,
                device: None,
                detach_cb: None,
                config: ConfigState::default(),
            }),
        })
    }

    pub fn dtype(&self) -> DrcType {
        self.dtype
    }
    pub fn id(&self) -> u32 {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn index(&self) -> DrcIndex {
        DrcIndex::new(self.dtype, self.id)
    }

    pub fn isolation_state(&self) -> IsolationState {
        self.inner.lock().unwrap().isolation
    }
    pub fn allocation_state(&self) -> AllocationState {
        self.inner.lock().unwrap().allocation
    }
    pub fn indicator_state(&self) -> IndicatorState {
        self.inner.lock().unwrap().indicator
    }

    pub fn set_allocation_state(&self, state: AllocationState) {
        debug!(self.log, "set_allocation_state"; "state" => ?state);
        self.inner.lock().unwrap().allocation = state;
    }
    pub fn set_indicator_state(&self, state: IndicatorState) {
        debug!(self.log, "set_indicator_state"; "state" => ?state);
        self.inner.lock().unwrap().indicator = state;
    }

    /// The attached device, while one is present.
    pub fn device(&self) -> Option<Arc<dyn DrcDevice>> {
        self.inner.lock().unwrap().device.clone()
    }

    /// Whether a host detach request is waiting on guest isolation.
    pub fn release_pending(&self) -> bool {
        self.inner.lock().unwrap().release == ReleaseState::DetachRequested
    }

    /// Binds `device` to the connector and installs its configuration
    /// stream.  The connector must be idle (isolated, unallocated), and a
    /// stream is mandatory unless the device is cold-plugged.
    pub fn attach(
        &self,
        device: Arc<dyn DrcDevice>,
        fdt: Option<Fdt>,
        fdt_start_offset: usize,
        coldplug: bool,
    ) -> Result<(), AttachError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.isolation != IsolationState::Isolated {
            return Err(AttachError::AwaitingRelease);
        }
        if inner.allocation != AllocationState::Unusable {
            return Err(AttachError::AlreadyAllocated);
        }
        if fdt.is_none() && !coldplug {
            return Err(AttachError::MissingConfig);
        }

        debug!(self.log, "attach"; "device" => device.label(), "coldplug" => coldplug);
        inner.isolation = IsolationState::Unisolated;
        inner.allocation = AllocationState::Usable;
        inner.indicator = IndicatorState::Active;
        inner.device = Some(device);
        inner.config = ConfigState {
            fdt,
            cursor: FdtCursor::new(fdt_start_offset),
            configured: false,
        };
        Ok(())
    }

    /// Requests removal of the attached device.
    ///
    /// If the guest still holds the device unisolated, the request is
    /// latched and removal defers to a later isolation transition (or a
    /// machine reset).  Otherwise removal finalizes immediately.  The
    /// completion, if any, runs at most once, on the finalizing path.
    pub fn detach(&self, completion: Option<DetachFn>) {
        let finalized = {
            let mut inner = self.inner.lock().unwrap();
            inner.detach_cb = completion;
            if inner.isolation != IsolationState::Isolated {
                debug!(
                    self.log,
                    "awaiting transition to isolated state before removal"
                );
                inner.release = ReleaseState::DetachRequested;
                None
            } else {
                self.finalize_detach_locked(&mut inner)
            }
        };
        if let Some((cb, dev)) = finalized {
            cb(&dev);
        }
    }

    /// Guest-driven isolation transition.  Transitioning to isolated
    /// finalizes an eligible pending removal and rewinds the configuration
    /// cursor for the next walk.
    pub fn set_isolation_state(&self, state: IsolationState) {
        let finalized = {
            let mut inner = self.inner.lock().unwrap();
            debug!(self.log, "set_isolation_state"; "state" => ?state);
            match state {
                IsolationState::Isolated => self.isolate_locked(&mut inner),
                IsolationState::Unisolated => {
                    inner.isolation = IsolationState::Unisolated;
                    None
                }
            }
        };
        if let Some((cb, dev)) = finalized {
            cb(&dev);
        }
    }

    /// Machine-level reset.  A pending removal is safe to complete here: the
    /// guest is gone, so force the isolation transition, and if the device
    /// was never configured (leaving the transition ineligible to finalize),
    /// force the detach through unconditionally.
    pub fn reset(&self) {
        let finalized = {
            let mut inner = self.inner.lock().unwrap();
            if inner.release != ReleaseState::DetachRequested {
                None
            } else {
                let fin = self.isolate_locked(&mut inner);
                if inner.release == ReleaseState::DetachRequested {
                    debug!(self.log, "forcing removal of unconfigured device");
                    self.finalize_detach_locked(&mut inner)
                } else {
                    fin
                }
            }
        };
        if let Some((cb, dev)) = finalized {
            cb(&dev);
        }
    }

    fn isolate_locked(&self, inner: &mut Inner) -> Option<DetachCompletion> {
        inner.isolation = IsolationState::Isolated;
        let finalized = if inner.removal_eligible() {
            debug!(self.log, "finalizing device removal");
            self.finalize_detach_locked(inner)
        } else {
            if inner.release == ReleaseState::DetachRequested {
                debug!(self.log, "deferring removal of unconfigured device");
            }
            None
        };
        // The guest restarts any configuration walk from scratch after
        // isolating, so the cursor rewinds and the configured flag clears.
        inner.config.cursor =
            FdtCursor::new(inner.config.cursor.start_offset());
        inner.config.configured = false;
        finalized
    }

    fn finalize_detach_locked(
        &self,
        inner: &mut Inner,
    ) -> Option<DetachCompletion> {
        debug!(self.log, "detach");
        inner.allocation = AllocationState::Unusable;
        inner.indicator = IndicatorState::Inactive;
        inner.release = ReleaseState::Idle;
        inner.config = ConfigState::default();
        let cb = inner.detach_cb.take();
        let dev = inner.device.take();
        match (cb, dev) {
            (Some(cb), Some(dev)) => Some((cb, dev)),
            _ => None,
        }
    }

    /// Slot-occupancy sensor.  PCI connectors report `Empty` for a vacant
    /// slot; logical connectors report `Unusable` instead, and also while a
    /// present device is deallocated.
    pub fn entity_sense(&self) -> EntitySense {
        let inner = self.inner.lock().unwrap();
        if inner.device.is_some() {
            if self.dtype != DrcType::Pci
                && inner.allocation == AllocationState::Unusable
            {
                EntitySense::Unusable
            } else {
                EntitySense::Present
            }
        } else if self.dtype == DrcType::Pci {
            EntitySense::Empty
        } else {
            EntitySense::Unusable
        }
    }

    /// Advances the configuration stream by exactly one response.  Callers
    /// must stop on `Success` or any error.  Reaching `Success` marks the
    /// device configured, which makes a pending removal eligible to finalize
    /// on the next isolation transition.
    pub fn configure(&self) -> Result<Step, ConfigureError> {
        let mut inner = self.inner.lock().unwrap();
        let config = &mut inner.config;
        let fdt = config.fdt.clone().ok_or(ConfigureError::NoStream)?;
        let step = config.cursor.step(&fdt)?;
        if step == Step::Success {
            config.configured = true;
        }
        Ok(step)
    }

    /// Structured snapshot of the whole configuration subtree, walked with
    /// an independent cursor.  The guest-facing cursor is not disturbed.
    pub fn config_view(&self) -> Result<Option<FdtNode>, FdtError> {
        let (fdt, start) = {
            let inner = self.inner.lock().unwrap();
            match &inner.config.fdt {
                None => return Ok(None),
                Some(fdt) => {
                    (fdt.clone(), inner.config.cursor.start_offset())
                }
            }
        };
        fdt::read_tree(&fdt, start).map(Some)
    }

    pub fn export(&self) -> migrate::DrcStateV1 {
        let inner = self.inner.lock().unwrap();
        migrate::DrcStateV1 {
            isolation: inner.isolation as u32,
            allocation: inner.allocation as u32,
            indicator: inner.indicator as u32,
            release_pending: inner.release == ReleaseState::DetachRequested,
            configured: inner.config.configured,
            device: inner.device.as_ref().map(|d| d.label()),
            fdt: inner.config.fdt.as_ref().map(|f| f.as_bytes().to_vec()),
            fdt_start_offset: inner.config.cursor.start_offset() as u64,
            fdt_offset: inner.config.cursor.offset() as u64,
            fdt_depth: inner.config.cursor.depth(),
        }
    }

    /// Restores connector state, including a mid-walk cursor.  The device
    /// reference itself is not part of the payload: the framework re-attaches
    /// devices before importing, and the import cross-checks identity.  A
    /// latched detach request is restored without its completion; the host
    /// side re-issues the unplug request after migration.
    pub fn import(
        &self,
        state: migrate::DrcStateV1,
    ) -> Result<(), MigrateStateError> {
        let isolation = IsolationState::from_repr(state.isolation)
            .ok_or_else(|| {
                MigrateStateError::ImportFailed(format!(
                    "invalid isolation state {}",
                    state.isolation
                ))
            })?;
        let allocation = AllocationState::from_repr(state.allocation)
            .ok_or_else(|| {
                MigrateStateError::ImportFailed(format!(
                    "invalid allocation state {}",
                    state.allocation
                ))
            })?;
        let indicator = IndicatorState::from_repr(state.indicator)
            .ok_or_else(|| {
                MigrateStateError::ImportFailed(format!(
                    "invalid indicator state {}",
                    state.indicator
                ))
            })?;

        let mut inner = self.inner.lock().unwrap();
        let bound = inner.device.as_ref().map(|d| d.label());
        if state.device != bound {
            return Err(MigrateStateError::ImportFailed(format!(
                "attached device mismatch: payload {:?}, connector {:?}",
                state.device, bound
            )));
        }

        inner.isolation = isolation;
        inner.allocation = allocation;
        inner.indicator = indicator;
        inner.release = if state.release_pending {
            ReleaseState::DetachRequested
        } else {
            ReleaseState::Idle
        };
        inner.config = ConfigState {
            fdt: state.fdt.map(Fdt::from_bytes),
            cursor: FdtCursor::restore(
                state.fdt_start_offset as usize,
                state.fdt_offset as usize,
                state.fdt_depth,
            ),
            configured: state.configured,
        };
        Ok(())
    }
}

pub mod migrate {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Deserialize, Serialize)]
    pub struct DrcStateV1 {
        pub isolation: u32,
        pub allocation: u32,
        pub indicator: u32,
        pub release_pending: bool,
        pub configured: bool,
        pub device: Option<String>,
        pub fdt: Option<Vec<u8>>,
        pub fdt_start_offset: u64,
        pub fdt_offset: u64,
        pub fdt_depth: u32,
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::fdt::FdtBuilder;

    struct TestDev(&'static str);
    impl DrcDevice for TestDev {
        fn label(&self) -> String {
            self.0.to_string()
        }
    }

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn test_dev() -> Arc<dyn DrcDevice> {
        Arc::new(TestDev("test-dev"))
    }

    fn test_fdt() -> Fdt {
        let mut b = FdtBuilder::new();
        b.begin_node("dev").prop_u32("reg", 0x800).end_node();
        b.finish()
    }

    fn counting_cb(count: &Arc<AtomicUsize>) -> DetachFn {
        let count = Arc::clone(count);
        Box::new(move |_dev| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// Drive the guest-facing configuration walk to completion.
    fn configure_fully(drc: &Drc) {
        loop {
            match drc.configure().unwrap() {
                Step::Success => break,
                _ => continue,
            }
        }
    }

    #[test]
    fn index_derivation() {
        let drc = Drc::new(DrcType::Pci, 0x0008, &test_log());
        assert_eq!(drc.index().get(), (4 << 28) | 0x08);
        assert_eq!(drc.index(), DrcIndex::new(DrcType::Pci, 0x0008));

        let lmb = Drc::new(DrcType::Lmb, 0x1234_5678, &test_log());
        assert_eq!(lmb.index().get(), (8 << 28) | 0x0234_5678);
    }

    #[test]
    fn connector_names() {
        assert_eq!(Drc::new(DrcType::Cpu, 4, &test_log()).name(), "CPU 4");
        assert_eq!(Drc::new(DrcType::Phb, 1, &test_log()).name(), "PHB 1");
        assert_eq!(Drc::new(DrcType::Pci, 9, &test_log()).name(), "C9");
        assert_eq!(Drc::new(DrcType::Vio, 2, &test_log()).name(), "C2");
        assert_eq!(Drc::new(DrcType::Lmb, 7, &test_log()).name(), "LMB 7");
    }

    #[test]
    fn attach_preconditions() {
        let drc = Drc::new(DrcType::Pci, 0, &test_log());

        // hotplug without a config stream is rejected
        assert!(matches!(
            drc.attach(test_dev(), None, 0, false),
            Err(AttachError::MissingConfig)
        ));

        // coldplug without one is fine
        drc.attach(test_dev(), None, 0, true).unwrap();
        assert_eq!(drc.isolation_state(), IsolationState::Unisolated);
        assert_eq!(drc.allocation_state(), AllocationState::Usable);
        assert_eq!(drc.indicator_state(), IndicatorState::Active);

        // double attach is rejected on the isolation check
        assert!(matches!(
            drc.attach(test_dev(), Some(test_fdt()), 0, false),
            Err(AttachError::AwaitingRelease)
        ));
    }

    #[test]
    fn entity_sense_by_type() {
        let pci = Drc::new(DrcType::Pci, 0, &test_log());
        assert_eq!(pci.entity_sense(), EntitySense::Empty);
        pci.attach(test_dev(), Some(test_fdt()), 0, false).unwrap();
        assert_eq!(pci.entity_sense(), EntitySense::Present);

        let cpu = Drc::new(DrcType::Cpu, 0, &test_log());
        assert_eq!(cpu.entity_sense(), EntitySense::Unusable);
        cpu.attach(test_dev(), Some(test_fdt()), 0, false).unwrap();
        assert_eq!(cpu.entity_sense(), EntitySense::Present);
        cpu.set_allocation_state(AllocationState::Unusable);
        assert_eq!(cpu.entity_sense(), EntitySense::Unusable);
    }

    #[test]
    fn immediate_detach_when_isolated() {
        let drc = Drc::new(DrcType::Pci, 0, &test_log());
        drc.attach(test_dev(), Some(test_fdt()), 0, false).unwrap();
        drc.set_isolation_state(IsolationState::Isolated);

        let count = Arc::new(AtomicUsize::new(0));
        drc.detach(Some(counting_cb(&count)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(drc.device().is_none());
        assert!(!drc.release_pending());
        assert_eq!(drc.allocation_state(), AllocationState::Unusable);
        assert_eq!(drc.indicator_state(), IndicatorState::Inactive);
    }

    #[test]
    fn deferred_detach_after_configuration() {
        let drc = Drc::new(DrcType::Pci, 0, &test_log());
        drc.attach(test_dev(), Some(test_fdt()), 0, false).unwrap();
        configure_fully(&drc);

        let count = Arc::new(AtomicUsize::new(0));
        drc.detach(Some(counting_cb(&count)));
        // guest still holds the device; nothing happens yet
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(drc.release_pending());
        assert!(drc.device().is_some());

        drc.set_isolation_state(IsolationState::Isolated);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!drc.release_pending());
        assert!(drc.device().is_none());
    }

    #[test]
    fn unconfigured_isolation_does_not_finalize() {
        let drc = Drc::new(DrcType::Pci, 0, &test_log());
        drc.attach(test_dev(), Some(test_fdt()), 0, false).unwrap();

        // walk partway: depth > 0, configured flag still clear
        assert!(matches!(
            drc.configure().unwrap(),
            Step::NextChild { .. }
        ));

        let count = Arc::new(AtomicUsize::new(0));
        drc.detach(Some(counting_cb(&count)));
        drc.set_isolation_state(IsolationState::Isolated);

        // the transition was part of configuration, not removal
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(drc.release_pending());
        assert!(drc.device().is_some());

        // only a reset forces it through
        drc.reset();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!drc.release_pending());
        assert!(drc.device().is_none());
    }

    #[test]
    fn reset_completes_configured_removal() {
        let drc = Drc::new(DrcType::Pci, 0, &test_log());
        drc.attach(test_dev(), Some(test_fdt()), 0, false).unwrap();
        configure_fully(&drc);

        let count = Arc::new(AtomicUsize::new(0));
        drc.detach(Some(counting_cb(&count)));
        drc.reset();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(drc.device().is_none());
    }

    #[test]
    fn reset_without_pending_release_is_a_nop() {
        let drc = Drc::new(DrcType::Pci, 0, &test_log());
        drc.attach(test_dev(), Some(test_fdt()), 0, false).unwrap();
        drc.reset();
        assert!(drc.device().is_some());
        assert_eq!(drc.allocation_state(), AllocationState::Usable);
    }

    #[test]
    fn isolation_rewinds_walk() {
        let drc = Drc::new(DrcType::Pci, 0, &test_log());
        drc.attach(test_dev(), Some(test_fdt()), 0, false).unwrap();
        configure_fully(&drc);

        // isolate + unisolate: the guest restarts the walk from the top
        drc.set_isolation_state(IsolationState::Isolated);
        drc.set_isolation_state(IsolationState::Unisolated);
        assert!(matches!(
            drc.configure().unwrap(),
            Step::NextChild { ref name } if name == "dev"
        ));
    }

    #[test]
    fn configure_without_stream() {
        let drc = Drc::new(DrcType::Pci, 0, &test_log());
        drc.attach(test_dev(), None, 0, true).unwrap();
        assert!(matches!(drc.configure(), Err(ConfigureError::NoStream)));
    }

    #[test]
    fn view_does_not_disturb_walk() {
        let drc = Drc::new(DrcType::Pci, 0, &test_log());
        drc.attach(test_dev(), Some(test_fdt()), 0, false).unwrap();

        assert!(matches!(
            drc.configure().unwrap(),
            Step::NextChild { .. }
        ));
        let view = drc.config_view().unwrap().unwrap();
        assert_eq!(view.name, "dev");
        assert_eq!(view.props.len(), 1);

        // primary cursor still mid-walk: next response is the property
        assert!(matches!(
            drc.configure().unwrap(),
            Step::NextProperty { ref name, .. } if name == "reg"
        ));
    }

    #[test]
    fn migrate_roundtrip_mid_walk() {
        let drc = Drc::new(DrcType::Pci, 3, &test_log());
        drc.attach(test_dev(), Some(test_fdt()), 0, false).unwrap();
        assert!(matches!(
            drc.configure().unwrap(),
            Step::NextChild { .. }
        ));
        let state = drc.export();

        let restored = Drc::new(DrcType::Pci, 3, &test_log());
        restored.attach(test_dev(), Some(test_fdt()), 0, false).unwrap();
        restored.import(state).unwrap();

        // the walk resumes where the source left off
        assert!(matches!(
            restored.configure().unwrap(),
            Step::NextProperty { ref name, .. } if name == "reg"
        ));
        assert_eq!(restored.isolation_state(), IsolationState::Unisolated);
    }

    #[test]
    fn migrate_rejects_bad_state() {
        let drc = Drc::new(DrcType::Pci, 0, &test_log());
        drc.attach(test_dev(), Some(test_fdt()), 0, false).unwrap();
        let mut state = drc.export();
        state.isolation = 7;
        assert!(drc.import(state).is_err());

        // device identity mismatch
        let mut state = drc.export();
        state.device = Some("other-dev".to_string());
        assert!(drc.import(state).is_err());
    }
}
