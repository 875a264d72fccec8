//! Opaque GPU object handles.
//!
//! The submission core never owns resources. It only needs to know *which*
//! objects a piece of GPU work references, so every Vulkan handle is reduced
//! to an [`ObjectHandle`]: a category plus the raw 64-bit handle value.

use ash::vk::{self, Handle};
use hashbrown::HashSet;

/// Category of a GPU object referenced by recorded work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Buffer,
    Image,
    ImageView,
    Sampler,
    Pipeline,
    PipelineLayout,
    DescriptorSet,
    Framebuffer,
    RenderPass,
    CommandBuffer,
    Semaphore,
}

/// A typed, copyable reference to a GPU object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle {
    kind: ObjectKind,
    raw: u64,
}

impl ObjectHandle {
    /// Create a handle from a category and a raw handle value.
    #[must_use]
    pub const fn new(kind: ObjectKind, raw: u64) -> Self {
        Self { kind, raw }
    }

    /// The object category.
    #[must_use]
    pub const fn kind(self) -> ObjectKind {
        self.kind
    }

    /// The raw Vulkan handle value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.raw
    }

    /// Reinterpret the raw value as a Vulkan handle type.
    #[must_use]
    pub fn as_vk<H: Handle>(self) -> H {
        H::from_raw(self.raw)
    }
}

macro_rules! impl_from_vk {
    ($($vk:ty => $kind:ident),* $(,)?) => {
        $(
            impl From<$vk> for ObjectHandle {
                fn from(handle: $vk) -> Self {
                    Self::new(ObjectKind::$kind, handle.as_raw())
                }
            }
        )*
    };
}

impl_from_vk! {
    vk::Buffer => Buffer,
    vk::Image => Image,
    vk::ImageView => ImageView,
    vk::Sampler => Sampler,
    vk::Pipeline => Pipeline,
    vk::PipelineLayout => PipelineLayout,
    vk::DescriptorSet => DescriptorSet,
    vk::Framebuffer => Framebuffer,
    vk::RenderPass => RenderPass,
    vk::CommandBuffer => CommandBuffer,
    vk::Semaphore => Semaphore,
}

/// The set of objects referenced by one submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectSet {
    handles: HashSet<ObjectHandle>,
}

impl ObjectSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle. Null handles are ignored.
    pub fn insert(&mut self, handle: impl Into<ObjectHandle>) -> bool {
        let handle = handle.into();
        if handle.raw == 0 {
            return false;
        }
        self.handles.insert(handle)
    }

    /// Whether the set contains the handle.
    #[must_use]
    pub fn contains(&self, handle: impl Into<ObjectHandle>) -> bool {
        self.handles.contains(&handle.into())
    }

    /// Merge another set into this one.
    pub fn merge(&mut self, other: Self) {
        self.handles.extend(other.handles);
    }

    /// Number of handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Number of handles of one category.
    #[must_use]
    pub fn count(&self, kind: ObjectKind) -> usize {
        self.handles.iter().filter(|h| h.kind == kind).count()
    }

    /// Iterate over all handles.
    pub fn iter(&self) -> impl Iterator<Item = ObjectHandle> + '_ {
        self.handles.iter().copied()
    }
}

impl<H: Into<ObjectHandle>> Extend<H> for ObjectSet {
    fn extend<T: IntoIterator<Item = H>>(&mut self, iter: T) {
        for handle in iter {
            self.insert(handle);
        }
    }
}

impl<H: Into<ObjectHandle>> FromIterator<H> for ObjectSet {
    fn from_iter<T: IntoIterator<Item = H>>(iter: T) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl IntoIterator for ObjectSet {
    type Item = ObjectHandle;
    type IntoIter = hashbrown::hash_set::IntoIter<ObjectHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.handles.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_handles_keep_their_category() {
        let buffer = vk::Buffer::from_raw(7);
        let image = vk::Image::from_raw(7);

        let a = ObjectHandle::from(buffer);
        let b = ObjectHandle::from(image);

        assert_eq!(a.kind(), ObjectKind::Buffer);
        assert_eq!(b.kind(), ObjectKind::Image);
        assert_ne!(a, b);
        assert_eq!(a.as_vk::<vk::Buffer>(), buffer);
    }

    #[test]
    fn set_ignores_null_and_duplicates() {
        let mut set = ObjectSet::new();
        assert!(!set.insert(vk::Buffer::null()));
        assert!(set.insert(vk::Buffer::from_raw(1)));
        assert!(!set.insert(vk::Buffer::from_raw(1)));
        assert!(set.insert(vk::Sampler::from_raw(1)));

        assert_eq!(set.len(), 2);
        assert_eq!(set.count(ObjectKind::Buffer), 1);
        assert!(set.contains(vk::Sampler::from_raw(1)));
        assert!(!set.contains(vk::Sampler::from_raw(2)));
    }

    #[test]
    fn merge_unions_sets() {
        let mut a: ObjectSet = [vk::Buffer::from_raw(1), vk::Buffer::from_raw(2)]
            .into_iter()
            .collect();
        let b: ObjectSet = [vk::Buffer::from_raw(2), vk::Buffer::from_raw(3)]
            .into_iter()
            .collect();

        a.merge(b);
        assert_eq!(a.len(), 3);
    }
}
