// SPDX-License-Identifier: CEPL-1.0
//! Authoritative layout/stage/access bookkeeping for long-lived images.
//!
//! Every use of the depth buffer, the HDR target or a swapchain image goes
//! through [`ImageStateTracker::transition`]. The tracker never asks the device
//! what state an image is in; what it recorded last is the truth, so nothing
//! else may change an image's layout behind its back.

use std::fmt;

use bitflags::bitflags;
use tracing::trace;

bitflags! {
    /// Pipeline stages a barrier waits on or blocks.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const TASK_SHADER = 1 << 1;
        const MESH_SHADER = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const FRAGMENT_SHADER = 1 << 4;
        const EARLY_FRAGMENT_TESTS = 1 << 5;
        const LATE_FRAGMENT_TESTS = 1 << 6;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 7;
        const COMPUTE_SHADER = 1 << 8;
        const TRANSFER = 1 << 9;
        const BOTTOM_OF_PIPE = 1 << 10;
        const ALL_COMMANDS = 1 << 11;
    }
}

bitflags! {
    /// Memory accesses made visible or made available by a barrier.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const SHADER_READ = 1 << 0;
        const SHADER_WRITE = 1 << 1;
        const COLOR_ATTACHMENT_READ = 1 << 2;
        const COLOR_ATTACHMENT_WRITE = 1 << 3;
        const DEPTH_STENCIL_READ = 1 << 4;
        const DEPTH_STENCIL_WRITE = 1 << 5;
        const TRANSFER_READ = 1 << 6;
        const TRANSFER_WRITE = 1 << 7;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachment,
    DepthAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageAspect {
    Color,
    Depth,
}

/// The layout/stage/access triple an image was last left in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageState {
    pub layout: ImageLayout,
    pub stages: PipelineStages,
    pub access: Access,
}

impl ImageState {
    pub const UNDEFINED: ImageState = ImageState {
        layout: ImageLayout::Undefined,
        stages: PipelineStages::TOP_OF_PIPE,
        access: Access::empty(),
    };

    pub const fn new(layout: ImageLayout, stages: PipelineStages, access: Access) -> Self {
        Self {
            layout,
            stages,
            access,
        }
    }
}

/// Named usages an image can be put into before a command touches it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageUsage {
    /// Freshly created or discarded contents.
    Undefined,
    /// Handed to (or just returned from) the presentation engine. The stage is
    /// color output because that is where the acquire semaphore is waited on,
    /// so a barrier out of this state chains behind the presentation read.
    Presented,
    ColorAttachment,
    DepthAttachment,
    TransferSrc,
    TransferDst,
    ShaderRead,
    Storage,
}

impl ImageUsage {
    pub const fn state(self) -> ImageState {
        use ImageLayout as L;
        use PipelineStages as S;
        match self {
            ImageUsage::Undefined => ImageState::UNDEFINED,
            ImageUsage::Presented => {
                ImageState::new(L::PresentSrc, S::COLOR_ATTACHMENT_OUTPUT, Access::empty())
            }
            ImageUsage::ColorAttachment => ImageState::new(
                L::ColorAttachment,
                S::COLOR_ATTACHMENT_OUTPUT,
                Access::COLOR_ATTACHMENT_READ.union(Access::COLOR_ATTACHMENT_WRITE),
            ),
            ImageUsage::DepthAttachment => ImageState::new(
                L::DepthAttachment,
                S::EARLY_FRAGMENT_TESTS.union(S::LATE_FRAGMENT_TESTS),
                Access::DEPTH_STENCIL_READ.union(Access::DEPTH_STENCIL_WRITE),
            ),
            ImageUsage::TransferSrc => {
                ImageState::new(L::TransferSrc, S::TRANSFER, Access::TRANSFER_READ)
            }
            ImageUsage::TransferDst => {
                ImageState::new(L::TransferDst, S::TRANSFER, Access::TRANSFER_WRITE)
            }
            ImageUsage::ShaderRead => ImageState::new(
                L::ShaderReadOnly,
                S::FRAGMENT_SHADER.union(S::COMPUTE_SHADER),
                Access::SHADER_READ,
            ),
            ImageUsage::Storage => ImageState::new(
                L::General,
                S::FRAGMENT_SHADER.union(S::COMPUTE_SHADER),
                Access::SHADER_READ.union(Access::SHADER_WRITE),
            ),
        }
    }
}

impl From<ImageUsage> for ImageState {
    fn from(usage: ImageUsage) -> Self {
        usage.state()
    }
}

/// Generation-checked handle into the tracker arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image#{}v{}", self.index, self.generation)
    }
}

/// One barrier the tracker decided is needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier<H> {
    pub image: H,
    pub aspect: ImageAspect,
    pub src: ImageState,
    pub dst: ImageState,
}

/// Receives barriers, typically by recording them into a command buffer.
pub trait BarrierSink<H> {
    fn image_barrier(&mut self, barrier: &ImageBarrier<H>);
}

impl<H: Copy> BarrierSink<H> for Vec<ImageBarrier<H>> {
    fn image_barrier(&mut self, barrier: &ImageBarrier<H>) {
        self.push(*barrier);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("{0} does not name a tracked image")]
    OutOfRange(ImageId),
    #[error("{id} is stale: '{name}' was retired")]
    Stale { id: ImageId, name: String },
}

#[derive(Debug)]
struct Entry<H> {
    generation: u32,
    slot: Option<Tracked<H>>,
}

#[derive(Debug)]
struct Tracked<H> {
    handle: H,
    aspect: ImageAspect,
    name: String,
    state: ImageState,
}

#[derive(Debug)]
pub struct ImageStateTracker<H> {
    entries: Vec<Entry<H>>,
    free: Vec<u32>,
    barriers: u64,
}

impl<H> Default for ImageStateTracker<H> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            barriers: 0,
        }
    }
}

impl<H: Copy> ImageStateTracker<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `handle` in [`ImageState::UNDEFINED`].
    pub fn register(&mut self, handle: H, aspect: ImageAspect, name: impl Into<String>) -> ImageId {
        self.register_in(handle, aspect, name, ImageState::UNDEFINED)
    }

    pub fn register_in(
        &mut self,
        handle: H,
        aspect: ImageAspect,
        name: impl Into<String>,
        state: ImageState,
    ) -> ImageId {
        let tracked = Tracked {
            handle,
            aspect,
            name: name.into(),
            state,
        };
        match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.slot = Some(tracked);
                ImageId {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 0,
                    slot: Some(tracked),
                });
                ImageId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Stops tracking `id`. Any copy of the id held elsewhere becomes stale.
    pub fn retire(&mut self, id: ImageId) -> Result<H, TrackerError> {
        self.tracked(id)?;
        let entry = &mut self.entries[id.index as usize];
        let tracked = entry.slot.take().ok_or(TrackerError::OutOfRange(id))?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        trace!(%id, name = %tracked.name, "image retired");
        Ok(tracked.handle)
    }

    pub fn get(&self, id: ImageId) -> Result<ImageState, TrackerError> {
        Ok(self.tracked(id)?.state)
    }

    /// Overwrites the recorded state without emitting a barrier. Only for
    /// callers that changed the layout through some other synchronized path
    /// (e.g. a render pass with an implicit final layout).
    pub fn set(&mut self, id: ImageId, state: ImageState) -> Result<(), TrackerError> {
        self.tracked_mut(id)?.state = state;
        Ok(())
    }

    pub fn handle(&self, id: ImageId) -> Result<H, TrackerError> {
        Ok(self.tracked(id)?.handle)
    }

    pub fn name(&self, id: ImageId) -> Result<&str, TrackerError> {
        Ok(&self.tracked(id)?.name)
    }

    /// Moves `id` into `to`, emitting a barrier only when the recorded state
    /// differs. Returns whether a barrier was emitted.
    pub fn transition(
        &mut self,
        id: ImageId,
        to: impl Into<ImageState>,
        sink: &mut impl BarrierSink<H>,
    ) -> Result<bool, TrackerError> {
        let to = to.into();
        let tracked = self.tracked_mut(id)?;
        if tracked.state == to {
            return Ok(false);
        }
        let barrier = ImageBarrier {
            image: tracked.handle,
            aspect: tracked.aspect,
            src: tracked.state,
            dst: to,
        };
        trace!(%id, name = %tracked.name, from = ?barrier.src.layout, to = ?to.layout, "image barrier");
        tracked.state = to;
        sink.image_barrier(&barrier);
        self.barriers += 1;
        Ok(true)
    }

    /// Declares the contents of `id` disposable. The layout becomes undefined
    /// but the last stage/access pair is kept, so the next transition still
    /// waits for earlier work on the image instead of racing it.
    pub fn discard(&mut self, id: ImageId) -> Result<(), TrackerError> {
        self.tracked_mut(id)?.state.layout = ImageLayout::Undefined;
        Ok(())
    }

    /// Number of barriers emitted since creation.
    pub fn barrier_count(&self) -> u64 {
        self.barriers
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tracked(&self, id: ImageId) -> Result<&Tracked<H>, TrackerError> {
        let entry = self
            .entries
            .get(id.index as usize)
            .ok_or(TrackerError::OutOfRange(id))?;
        match &entry.slot {
            Some(t) if entry.generation == id.generation => Ok(t),
            _ => Err(self.stale(id)),
        }
    }

    fn tracked_mut(&mut self, id: ImageId) -> Result<&mut Tracked<H>, TrackerError> {
        self.tracked(id)?;
        self.entries
            .get_mut(id.index as usize)
            .and_then(|e| e.slot.as_mut())
            .ok_or(TrackerError::OutOfRange(id))
    }

    fn stale(&self, id: ImageId) -> TrackerError {
        match self.entries.get(id.index as usize) {
            None => TrackerError::OutOfRange(id),
            Some(entry) => TrackerError::Stale {
                id,
                name: entry
                    .slot
                    .as_ref()
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| "<retired>".to_owned()),
            },
        }
    }
}
