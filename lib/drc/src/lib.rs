// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod connector;
pub mod fdt;
pub mod migrate;
pub mod pci;
pub mod registry;

pub use connector::{
    AllocationState, AttachError, ConfigureError, DetachFn, Drc, DrcDevice,
    DrcIndex, DrcType, EntitySense, IndicatorState, IsolationState,
};
pub use registry::DrcRegistry;
