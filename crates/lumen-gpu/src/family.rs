//! Queue families and capability-based queue selection.

use ash::vk;
use bitflags::bitflags;
use hashbrown::HashMap;

use crate::device::RawDevice;
use crate::error::{GpuError, Result};

bitflags! {
    /// Work a queue family can execute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueueCapabilities: u8 {
        /// Render passes and draws.
        const GRAPHICS = 0b0000_0001;
        /// Compute dispatches.
        const COMPUTE  = 0b0000_0010;
        /// Copies between buffers and images.
        const TRANSFER = 0b0000_0100;
        /// Presentation to a swapchain.
        const PRESENT  = 0b0000_1000;
    }
}

impl QueueCapabilities {
    /// Translate Vulkan queue flags.
    ///
    /// Graphics and compute families always accept transfer commands even
    /// when the driver does not advertise `TRANSFER`.
    #[must_use]
    pub fn from_vk(flags: vk::QueueFlags, supports_present: bool) -> Self {
        let mut caps = Self::empty();
        if flags.contains(vk::QueueFlags::GRAPHICS) {
            caps |= Self::GRAPHICS | Self::TRANSFER;
        }
        if flags.contains(vk::QueueFlags::COMPUTE) {
            caps |= Self::COMPUTE | Self::TRANSFER;
        }
        if flags.contains(vk::QueueFlags::TRANSFER) {
            caps |= Self::TRANSFER;
        }
        if supports_present {
            caps |= Self::PRESENT;
        }
        caps
    }
}

/// A queue family as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    /// Family index.
    pub index: u32,
    /// What the family can execute.
    pub capabilities: QueueCapabilities,
    /// Number of queues in the family.
    pub queue_count: u32,
}

/// Pick the family for a capability requirement.
///
/// The first family in index order whose capabilities equal or contain
/// `required` wins.
#[must_use]
pub fn select_family(families: &[QueueFamily], required: QueueCapabilities) -> Option<&QueueFamily> {
    families
        .iter()
        .filter(|family| family.queue_count > 0)
        .filter(|family| family.capabilities.contains(required))
        .min_by_key(|family| family.index)
}

/// A resolved hardware queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSlot {
    /// Family the queue belongs to.
    pub family: u32,
    /// Native queue handle.
    pub queue: vk::Queue,
}

/// The hardware queues owned by a submitter, one per family.
#[derive(Debug, Clone)]
pub struct QueueSet {
    families: Vec<QueueFamily>,
    queues: HashMap<u32, vk::Queue>,
}

impl QueueSet {
    /// Query the device's families and fetch queue 0 of each.
    pub fn new(device: &dyn RawDevice) -> Result<Self> {
        let mut families = device.queue_families();
        families.sort_by_key(|family| family.index);

        let queues: HashMap<u32, vk::Queue> = families
            .iter()
            .filter(|family| family.queue_count > 0)
            .map(|family| (family.index, device.queue(family.index, 0)))
            .collect();

        if queues.is_empty() {
            return Err(GpuError::NoSuitableDevice);
        }

        for family in &families {
            tracing::debug!(
                "Queue family {}: {:?} x{}",
                family.index,
                family.capabilities,
                family.queue_count
            );
        }

        Ok(Self { families, queues })
    }

    /// All known families, sorted by index.
    #[must_use]
    pub fn families(&self) -> &[QueueFamily] {
        &self.families
    }

    /// Resolve the queue that executes work with the given requirement.
    pub fn queue_for(&self, required: QueueCapabilities) -> Result<QueueSlot> {
        let family = select_family(&self.families, required).ok_or_else(|| {
            GpuError::UnsupportedOperation(format!("no queue family supports {required:?}"))
        })?;
        let queue = self.queues.get(&family.index).copied().ok_or_else(|| {
            GpuError::InvalidState(format!("queue family {} has no queue", family.index))
        })?;
        Ok(QueueSlot {
            family: family.index,
            queue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(index: u32, capabilities: QueueCapabilities) -> QueueFamily {
        QueueFamily {
            index,
            capabilities,
            queue_count: 1,
        }
    }

    #[test]
    fn vk_flags_imply_transfer() {
        let caps = QueueCapabilities::from_vk(vk::QueueFlags::COMPUTE, false);
        assert!(caps.contains(QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER));
        assert!(!caps.contains(QueueCapabilities::PRESENT));

        let caps = QueueCapabilities::from_vk(vk::QueueFlags::GRAPHICS, true);
        assert!(caps.contains(QueueCapabilities::GRAPHICS | QueueCapabilities::PRESENT));
    }

    #[test]
    fn first_superset_in_index_order_wins() {
        let families = [
            family(2, QueueCapabilities::TRANSFER),
            family(1, QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER),
            family(
                0,
                QueueCapabilities::GRAPHICS
                    | QueueCapabilities::COMPUTE
                    | QueueCapabilities::TRANSFER
                    | QueueCapabilities::PRESENT,
            ),
        ];

        let pick = |caps| select_family(&families, caps).map(|f| f.index);
        assert_eq!(pick(QueueCapabilities::TRANSFER), Some(0));
        assert_eq!(pick(QueueCapabilities::COMPUTE), Some(0));
        assert_eq!(pick(QueueCapabilities::PRESENT), Some(0));
    }

    #[test]
    fn exact_match_used_when_no_earlier_superset() {
        let families = [
            family(0, QueueCapabilities::GRAPHICS | QueueCapabilities::TRANSFER),
            family(1, QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER),
        ];

        assert_eq!(
            select_family(&families, QueueCapabilities::COMPUTE).map(|f| f.index),
            Some(1)
        );
        assert!(select_family(&families, QueueCapabilities::PRESENT).is_none());
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = [
            QueueFamily {
                index: 0,
                capabilities: QueueCapabilities::all(),
                queue_count: 0,
            },
            family(1, QueueCapabilities::all()),
        ];
        assert_eq!(
            select_family(&families, QueueCapabilities::GRAPHICS).map(|f| f.index),
            Some(1)
        );
    }
}
