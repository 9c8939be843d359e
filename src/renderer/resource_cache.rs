//! Logical image ids to backing textures.
//!
//! Entries are keyed by id and only replaced when a request for that id
//! carries a different format or size. An id that is not requested for a few
//! frames keeps its texture, so a script branch toggling an image on and off
//! doesn't churn allocations.

use std::collections::{BTreeMap, HashSet};

use crate::errors::ResourceError;
use crate::gpu::{GpuBackend, TextureHandle};
use crate::protocol::{Extent, ImageRequest, PixelFormat};

/// Reserved id of the frame's final image.
pub const DISPLAY_IMAGE_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedImage {
    pub id: u32,
    pub texture: TextureHandle,
    pub format: PixelFormat,
    pub size: Extent,
}

#[derive(Debug, Default)]
pub struct ResourceCache {
    images: BTreeMap<u32, AllocatedImage>,
    failed: HashSet<u32>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new allocation epoch. Nothing is evicted.
    pub fn start_frame(&mut self) {
        self.failed.clear();
    }

    /// Make sure `request.id` is backed by a texture of the requested format
    /// and size, reallocating on mismatch.
    pub fn process_request<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        request: &ImageRequest,
    ) -> Result<TextureHandle, ResourceError> {
        if let Some(existing) = self.images.get(&request.id) {
            if existing.format == request.pixel_format && existing.size == request.size {
                self.failed.remove(&request.id);
                return Ok(existing.texture);
            }
            log::debug!(
                "image {} changed from {:?} {} to {:?} {}, reallocating",
                request.id,
                existing.format,
                existing.size,
                request.pixel_format,
                request.size
            );
            let stale = existing.texture;
            self.images.remove(&request.id);
            backend.destroy_texture(stale);
        }

        match backend.create_texture(request.pixel_format, request.size) {
            Ok(texture) => {
                self.failed.remove(&request.id);
                self.images.insert(
                    request.id,
                    AllocatedImage {
                        id: request.id,
                        texture,
                        format: request.pixel_format,
                        size: request.size,
                    },
                );
                Ok(texture)
            }
            Err(e) => {
                self.failed.insert(request.id);
                Err(ResourceError::AllocationFailed {
                    id: request.id,
                    format: request.pixel_format,
                    size: request.size,
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<&AllocatedImage> {
        self.images.get(&id)
    }

    pub fn get_image(&self, id: u32) -> Option<TextureHandle> {
        self.images.get(&id).map(|img| img.texture)
    }

    pub fn get_size(&self, id: u32) -> Option<Extent> {
        self.images.get(&id).map(|img| img.size)
    }

    pub fn failed_this_frame(&self, id: u32) -> bool {
        self.failed.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Destroy every backing texture.
    pub fn release_all<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for (_, image) in std::mem::take(&mut self.images) {
            backend.destroy_texture(image.texture);
        }
        self.failed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::RecordingBackend;
    use proptest::prelude::*;

    fn req(id: u32, format: PixelFormat, w: u32, h: u32) -> ImageRequest {
        ImageRequest::cached(id, format, Extent::new(w, h))
    }

    #[test]
    fn unrequested_ids_are_kept() {
        let mut gpu = RecordingBackend::new();
        let mut cache = ResourceCache::new();
        cache.start_frame();
        let a = cache
            .process_request(&mut gpu, &req(4, PixelFormat::Rgba8, 8, 8))
            .unwrap();
        cache.start_frame();
        assert_eq!(cache.get_image(4), Some(a));
        cache.start_frame();
        let again = cache
            .process_request(&mut gpu, &req(4, PixelFormat::Rgba8, 8, 8))
            .unwrap();
        assert_eq!(again, a);
        assert_eq!(gpu.live_texture_count(), 1);
    }

    #[test]
    fn failed_reallocation_leaves_id_unresolved() {
        let mut gpu = RecordingBackend::new();
        gpu.max_texture_dimension = 64;
        let mut cache = ResourceCache::new();
        cache.start_frame();
        cache
            .process_request(&mut gpu, &req(1, PixelFormat::Rgba16f, 32, 32))
            .unwrap();

        cache.start_frame();
        let err = cache
            .process_request(&mut gpu, &req(1, PixelFormat::Rgba16f, 128, 32))
            .unwrap_err();
        assert!(matches!(err, ResourceError::AllocationFailed { id: 1, .. }));
        assert_eq!(cache.get_image(1), None);
        assert_eq!(cache.get_size(1), None);
        assert!(cache.failed_this_frame(1));
        assert_eq!(gpu.live_texture_count(), 0);

        cache.start_frame();
        assert!(!cache.failed_this_frame(1));
        assert!(
            cache
                .process_request(&mut gpu, &req(1, PixelFormat::Rgba16f, 16, 16))
                .is_ok()
        );
    }

    #[test]
    fn release_all_destroys_textures() {
        let mut gpu = RecordingBackend::new();
        let mut cache = ResourceCache::new();
        cache.start_frame();
        for id in 0..3 {
            cache
                .process_request(&mut gpu, &req(id, PixelFormat::Rgba8, 4, 4))
                .unwrap();
        }
        assert_eq!(gpu.live_texture_count(), 3);
        cache.release_all(&mut gpu);
        assert!(cache.is_empty());
        assert_eq!(gpu.live_texture_count(), 0);
    }

    fn format_strategy() -> impl Strategy<Value = PixelFormat> {
        prop_oneof![
            Just(PixelFormat::Rgba8),
            Just(PixelFormat::Rgba16f),
            Just(PixelFormat::R32f),
        ]
    }

    proptest! {
        #[test]
        fn handles_change_exactly_when_shape_changes(
            steps in prop::collection::vec((0u32..3, format_strategy(), 1u32..4, 1u32..4), 1..40)
        ) {
            let mut gpu = RecordingBackend::new();
            let mut cache = ResourceCache::new();
            let mut last: BTreeMap<u32, (PixelFormat, Extent, TextureHandle)> = BTreeMap::new();

            for (id, format, w, h) in steps {
                cache.start_frame();
                let size = Extent::new(w, h);
                let handle = cache
                    .process_request(&mut gpu, &ImageRequest::cached(id, format, size))
                    .unwrap();
                if let Some((prev_format, prev_size, prev_handle)) = last.get(&id) {
                    if *prev_format == format && *prev_size == size {
                        prop_assert_eq!(handle, *prev_handle);
                    } else {
                        prop_assert_ne!(handle, *prev_handle);
                    }
                }
                last.insert(id, (format, size, handle));
                prop_assert_eq!(cache.get_size(id), Some(size));
            }
            prop_assert_eq!(gpu.live_texture_count(), cache.len());
        }
    }
}
