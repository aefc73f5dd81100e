//! The scratch-image pool: process-wide 2D images shared across solvers
//! and devices so that image-backed patterns avoid per-call allocation.
//!
//! Images are claimed per device; a given (image, device) pair appears at
//! most once. Selection is best-fit: among the images not used by the
//! requesting device and meeting the width/area minima, the one whose
//! area is closest to the requested best size wins.

use std::sync::Mutex;

use crate::compute::{Context, Device, ImageFormat, Mem};
use crate::error::{Error, Result};

/// Identifies a pooled image for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchImageHandle(u64);

#[derive(Debug)]
struct ImageNode {
    id: u64,
    image: Mem,
    context: Context,
    width: usize,
    height: usize,
    using_devices: Vec<Device>,
}

#[derive(Debug)]
struct PoolInner {
    images: Vec<ImageNode>,
    next_id: u64,
}

/// The pool itself. Disabled pools accept every operation as a no-op so
/// that callers need not branch on the capability bit.
#[derive(Debug)]
pub struct ScratchImages {
    inner: Mutex<PoolInner>,
    enabled: bool,
}

impl ScratchImages {
    pub fn new(enabled: bool) -> ScratchImages {
        ScratchImages {
            inner: Mutex::new(PoolInner {
                images: Vec::new(),
                next_id: 1,
            }),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Creates a `width` x `height` RGBA/uint32 image and attaches it to
    /// the pool. Returns `None` when scratch images are disabled.
    pub fn add(
        &self,
        context: &Context,
        width: usize,
        height: usize,
    ) -> Result<Option<ScratchImageHandle>> {
        if !self.enabled {
            return Ok(None);
        }
        if width == 0 || height == 0 {
            return Err(Error::InvalidValue("scratch image dimensions"));
        }

        let image = context.create_image_2d(ImageFormat::RGBA_U32, width, height)?;

        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.images.push(ImageNode {
            id,
            image,
            context: context.clone(),
            width,
            height,
            using_devices: Vec::new(),
        });
        Ok(Some(ScratchImageHandle(id)))
    }

    /// Claims the best-fitting unused image for `device`, or `None` when
    /// no pooled image qualifies.
    pub fn get(
        &self,
        context: &Context,
        device: &Device,
        best_size: u64,
        min_size: u64,
        min_width: usize,
    ) -> Option<Mem> {
        let mut inner = self.inner.lock().unwrap();

        let mut best: Option<(usize, u64)> = None;
        for (idx, node) in inner.images.iter().enumerate() {
            if node.context != *context {
                continue;
            }
            if node.using_devices.iter().any(|d| d == device) {
                continue;
            }
            let area = (node.width * node.height) as u64;
            if node.width < min_width || area < min_size {
                continue;
            }
            let extra = if area >= best_size { area - best_size } else { best_size - area };
            if best.map_or(true, |(_, e)| extra < e) {
                best = Some((idx, extra));
            }
        }

        let (idx, _) = best?;
        inner.images[idx].using_devices.push(device.clone());
        Some(inner.images[idx].image.clone())
    }

    /// Releases `device`'s claim on `image`. Unknown pairs are ignored.
    pub fn put(&self, device: &Device, image: &Mem) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.images.iter_mut().find(|n| n.image == *image) {
            if let Some(pos) = node.using_devices.iter().position(|d| d == device) {
                node.using_devices.remove(pos);
            }
        }
    }

    /// Detaches the image from the pool. Outstanding claims keep the
    /// underlying image alive.
    pub fn remove(&self, handle: ScratchImageHandle) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.images.iter().position(|n| n.id == handle.0) {
            Some(pos) => {
                inner.images.remove(pos);
                Ok(())
            }
            None => Err(Error::InvalidValue("scratch image handle")),
        }
    }

    /// Number of pooled images.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
