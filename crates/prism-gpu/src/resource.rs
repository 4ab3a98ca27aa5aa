//! Shared-resource reference counting.
//!
//! Every shareable GPU resource carries a [`RefCount`]. A command recording
//! tracks each resource it touches in a [`UsageSet`]: the first touch
//! increments the counter, and completion of the recording's submission
//! decrements every tracked counter again. A resource may only be destroyed
//! once no recording references it.

use crate::buffer::DeviceBuffer;
use crate::descriptors::ResourceSet;
use crate::pipeline::{ComputePipeline, GraphicsPipeline};
use crate::renderpass::Framebuffer;
use crate::sampler::Sampler;
use crate::texture::Texture;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Number of in-flight recordings referencing a resource.
#[derive(Debug, Default)]
pub struct RefCount(AtomicU32);

impl RefCount {
    /// Create a counter with no references.
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub(crate) fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement(&self) {
        let previous = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "resource ref-count underflow");
    }

    /// Current reference count.
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Whether any in-flight recording still references the resource.
    pub fn is_in_use(&self) -> bool {
        self.count() > 0
    }
}

/// One resource held by a recording.
#[derive(Clone)]
pub(crate) enum TrackedResource {
    Buffer(Arc<DeviceBuffer>),
    Texture(Arc<Texture>),
    GraphicsPipeline(Arc<GraphicsPipeline>),
    ComputePipeline(Arc<ComputePipeline>),
    ResourceSet(Arc<ResourceSet>),
    Sampler(Arc<Sampler>),
    Framebuffer(Arc<Framebuffer>),
}

impl TrackedResource {
    fn refs(&self) -> &RefCount {
        match self {
            Self::Buffer(b) => &b.refs,
            Self::Texture(t) => &t.refs,
            Self::GraphicsPipeline(p) => &p.refs,
            Self::ComputePipeline(p) => &p.refs,
            Self::ResourceSet(s) => &s.refs,
            Self::Sampler(s) => &s.refs,
            Self::Framebuffer(f) => &f.refs,
        }
    }

    /// Pointer identity of the underlying resource.
    fn key(&self) -> usize {
        match self {
            Self::Buffer(b) => Arc::as_ptr(b) as usize,
            Self::Texture(t) => Arc::as_ptr(t) as usize,
            Self::GraphicsPipeline(p) => Arc::as_ptr(p) as usize,
            Self::ComputePipeline(p) => Arc::as_ptr(p) as usize,
            Self::ResourceSet(s) => Arc::as_ptr(s) as usize,
            Self::Sampler(s) => Arc::as_ptr(s) as usize,
            Self::Framebuffer(f) => Arc::as_ptr(f) as usize,
        }
    }
}

/// Set of resources referenced by one recording.
#[derive(Default)]
pub(crate) struct UsageSet {
    seen: HashSet<usize>,
    held: Vec<TrackedResource>,
}

impl UsageSet {
    /// Track a resource, incrementing its ref-count on first touch.
    pub fn record(&mut self, resource: TrackedResource) {
        if self.seen.insert(resource.key()) {
            resource.refs().increment();
            self.held.push(resource);
        }
    }

    /// Decrement every tracked ref-count and forget the set.
    pub fn release_all(&mut self) {
        for resource in self.held.drain(..) {
            resource.refs().decrement();
        }
        self.seen.clear();
    }

    /// Number of distinct tracked resources.
    pub fn len(&self) -> usize {
        self.held.len()
    }
}

impl Drop for UsageSet {
    fn drop(&mut self) {
        debug_assert!(
            self.held.is_empty(),
            "usage set dropped with unreleased resource refs"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    fn dummy_texture() -> Arc<Texture> {
        Arc::new(Texture::wrap_swapchain_image(
            vk::Image::null(),
            vk::ImageView::null(),
            vk::Format::B8G8R8A8_SRGB,
            vk::Extent2D {
                width: 1,
                height: 1,
            },
        ))
    }

    #[test]
    fn ref_count_starts_unused() {
        let refs = RefCount::new();
        assert_eq!(refs.count(), 0);
        assert!(!refs.is_in_use());
    }

    #[test]
    fn first_touch_increments_once() {
        let texture = dummy_texture();
        let mut usage = UsageSet::default();
        usage.record(TrackedResource::Texture(texture.clone()));
        usage.record(TrackedResource::Texture(texture.clone()));
        usage.record(TrackedResource::Texture(texture.clone()));
        assert_eq!(texture.refs.count(), 1);
        assert_eq!(usage.len(), 1);
        usage.release_all();
    }

    #[test]
    fn release_nets_zero() {
        let a = dummy_texture();
        let b = dummy_texture();
        let mut usage = UsageSet::default();
        usage.record(TrackedResource::Texture(a.clone()));
        usage.record(TrackedResource::Texture(b.clone()));
        assert!(a.refs.is_in_use());
        assert!(b.refs.is_in_use());
        usage.release_all();
        assert_eq!(a.refs.count(), 0);
        assert_eq!(b.refs.count(), 0);
    }

    #[test]
    fn distinct_recordings_stack_references() {
        let texture = dummy_texture();
        let mut first = UsageSet::default();
        let mut second = UsageSet::default();
        first.record(TrackedResource::Texture(texture.clone()));
        second.record(TrackedResource::Texture(texture.clone()));
        assert_eq!(texture.refs.count(), 2);
        first.release_all();
        assert_eq!(texture.refs.count(), 1);
        second.release_all();
        assert_eq!(texture.refs.count(), 0);
    }
}
