// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Errors encountered while trying to export/import component state.
#[derive(Debug, Error)]
pub enum MigrateStateError {
    /// Encountered an error trying to deserialize state during import.
    #[error("could not deserialize state: {0}")]
    DeserializationFailed(String),

    /// The component failed to apply the deserialized state.
    #[error("failed to apply deserialized state: {0}")]
    ImportFailed(String),
}
