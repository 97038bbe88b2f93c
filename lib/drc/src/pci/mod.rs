// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::Result as FmtResult;
use std::fmt::{Display, Formatter};

use strum::FromRepr;

pub mod resources;

pub use resources::{PciResources, RegionKey, ResourceError, ResourceType};

/// Bus, Device, Function, packed into 16 bits (8/5/3).
///
/// Acts as an address for PCI device functionality.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd)]
pub struct Bdf(u16);

impl Bdf {
    /// Attempts to make a new [Bdf].
    ///
    /// Returns [`Option::None`] if `dev` or `func` are outside their
    /// respective valid ranges.
    pub const fn new(bus: u8, dev: u8, func: u8) -> Option<Self> {
        if dev < 32 && func < 8 {
            Some(Self(
                ((bus as u16) << 8) | ((dev as u16) << 3) | func as u16,
            ))
        } else {
            None
        }
    }

    pub const fn bus(&self) -> u8 {
        (self.0 >> 8) as u8
    }
    pub const fn dev(&self) -> u8 {
        ((self.0 >> 3) & 0x1f) as u8
    }
    pub const fn func(&self) -> u8 {
        (self.0 & 0x7) as u8
    }

    /// The packed representation.  Every 16-bit value is a valid [Bdf], so
    /// [`Self::from_raw`] is total.
    pub const fn raw(&self) -> u16 {
        self.0
    }
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }
}

impl Display for Bdf {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}.{}.{}", self.bus(), self.dev(), self.func())
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, FromRepr)]
#[repr(u8)]
pub enum BarN {
    BAR0 = 0,
    BAR1,
    BAR2,
    BAR3,
    BAR4,
    BAR5,
}
