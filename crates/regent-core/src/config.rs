// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Runtime tuning knobs.

use crate::ident::AddressSpaceId;

/// Tunable limits for one runtime instance.
///
/// Plain data; every field may also be set directly. The defaults are safe
/// for tests and small machines.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RuntimeConfig {
    /// This runtime's address space in the distributed protocol.
    pub address_space: AddressSpaceId,
    /// Unmapped operations a context may hold before submission blocks.
    ///
    /// Zero blocks every submission; the scheduler raises it to one.
    pub max_task_window: usize,
    /// Ready operations a processor keeps back from thieves.
    pub min_tasks_to_keep: usize,
    /// Ready operations dispatched per scheduling pump.
    pub superscalar_width: usize,
    /// Mapping attempts per requirement before the operation fails.
    pub max_mapping_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            address_space: AddressSpaceId(0),
            max_task_window: 2048,
            min_tasks_to_keep: 1,
            superscalar_width: 4,
            max_mapping_retries: 8,
        }
    }
}

impl RuntimeConfig {
    /// Default limits for the given address space.
    #[must_use]
    pub fn new(address_space: AddressSpaceId) -> Self {
        Self {
            address_space,
            ..Self::default()
        }
    }

    /// Sets how many unmapped operations a context may hold.
    #[must_use]
    pub const fn with_max_task_window(mut self, max_task_window: usize) -> Self {
        self.max_task_window = max_task_window;
        self
    }

    /// Sets how many ready operations a processor keeps back from thieves.
    #[must_use]
    pub const fn with_min_tasks_to_keep(mut self, min_tasks_to_keep: usize) -> Self {
        self.min_tasks_to_keep = min_tasks_to_keep;
        self
    }

    /// Sets how many ready operations dispatch per scheduling pump.
    #[must_use]
    pub const fn with_superscalar_width(mut self, superscalar_width: usize) -> Self {
        self.superscalar_width = superscalar_width;
        self
    }

    /// Sets the mapping attempt budget per requirement.
    #[must_use]
    pub const fn with_max_mapping_retries(mut self, max_mapping_retries: u32) -> Self {
        self.max_mapping_retries = max_mapping_retries;
        self
    }
}
