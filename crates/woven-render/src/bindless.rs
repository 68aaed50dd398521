// SPDX-License-Identifier: CEPL-1.0
//! One global descriptor table addressed by integer index.
//!
//! [`BindlessTable`] keeps the CPU-side bookkeeping (capacities, which slots
//! were written, free lists) and forwards the actual descriptor writes and
//! binds to a [`DescriptorSink`] owned by the graphics backend. The backend
//! table is created update-after-bind and partially bound, so writes never
//! need to wait for frames in flight.

use serde::Deserialize;
use tracing::trace;

use crate::error::BackendError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindlessCategory {
    SampledImage,
    Sampler,
    StorageBuffer,
    UniformBuffer,
    StorageImage,
}

impl BindlessCategory {
    /// All categories in binding order.
    pub const ALL: [BindlessCategory; 5] = [
        BindlessCategory::Sampler,
        BindlessCategory::StorageBuffer,
        BindlessCategory::UniformBuffer,
        BindlessCategory::StorageImage,
        BindlessCategory::SampledImage,
    ];

    /// Binding number inside the set. Sampled images come last because only
    /// the highest binding may have a variable descriptor count.
    pub const fn binding(self) -> u32 {
        match self {
            BindlessCategory::Sampler => 0,
            BindlessCategory::StorageBuffer => 1,
            BindlessCategory::UniformBuffer => 2,
            BindlessCategory::StorageImage => 3,
            BindlessCategory::SampledImage => 4,
        }
    }

    pub const fn has_variable_count(self) -> bool {
        matches!(self, BindlessCategory::SampledImage)
    }

    pub const fn name(self) -> &'static str {
        match self {
            BindlessCategory::SampledImage => "sampled image",
            BindlessCategory::Sampler => "sampler",
            BindlessCategory::StorageBuffer => "storage buffer",
            BindlessCategory::UniformBuffer => "uniform buffer",
            BindlessCategory::StorageImage => "storage image",
        }
    }

    const fn slot(self) -> usize {
        self.binding() as usize
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BindlessCapacities {
    pub sampled_images: u32,
    pub samplers: u32,
    pub storage_buffers: u32,
    pub uniform_buffers: u32,
    pub storage_images: u32,
}

impl Default for BindlessCapacities {
    fn default() -> Self {
        Self {
            sampled_images: 16_384,
            samplers: 128,
            storage_buffers: 1_024,
            uniform_buffers: 256,
            storage_images: 512,
        }
    }
}

impl BindlessCapacities {
    pub const fn get(&self, category: BindlessCategory) -> u32 {
        match category {
            BindlessCategory::SampledImage => self.sampled_images,
            BindlessCategory::Sampler => self.samplers,
            BindlessCategory::StorageBuffer => self.storage_buffers,
            BindlessCategory::UniformBuffer => self.uniform_buffers,
            BindlessCategory::StorageImage => self.storage_images,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindlessError {
    #[error("{} capacity must be at least 1", .0.name())]
    ZeroCapacity(BindlessCategory),
    #[error("{} index {index} is outside the table (capacity {capacity})", .category.name())]
    OutOfRange {
        category: BindlessCategory,
        index: u32,
        capacity: u32,
    },
    #[error("resource of kind {} written to the {} table", .found.name(), .expected.name())]
    CategoryMismatch {
        expected: BindlessCategory,
        found: BindlessCategory,
    },
    #[error("all {capacity} {} slots are allocated", .category.name())]
    Exhausted {
        category: BindlessCategory,
        capacity: u32,
    },
    #[error("{} index {index} was not allocated", .category.name())]
    NotAllocated { category: BindlessCategory, index: u32 },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Backend half of the table: performs descriptor writes and binds the set.
pub trait DescriptorSink {
    type Resource;
    type Recorder;

    fn category_of(resource: &Self::Resource) -> BindlessCategory;
    fn write_descriptor(
        &mut self,
        category: BindlessCategory,
        index: u32,
        resource: &Self::Resource,
    ) -> Result<(), BackendError>;
    fn bind_table(&mut self, recorder: &Self::Recorder) -> Result<(), BackendError>;
}

#[derive(Debug, Default)]
struct CategoryState {
    capacity: u32,
    written: Vec<bool>,
    allocated: Vec<bool>,
    free: Vec<u32>,
    next_fresh: u32,
    high_water: u32,
}

impl CategoryState {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            written: vec![false; capacity as usize],
            allocated: vec![false; capacity as usize],
            ..Self::default()
        }
    }
}

pub struct BindlessTable<S> {
    sink: S,
    capacities: BindlessCapacities,
    categories: [CategoryState; 5],
    binds: u64,
}

impl<S: DescriptorSink> BindlessTable<S> {
    pub fn new(capacities: BindlessCapacities, sink: S) -> Result<Self, BindlessError> {
        if let Some(&empty) = BindlessCategory::ALL.iter().find(|c| capacities.get(**c) == 0) {
            return Err(BindlessError::ZeroCapacity(empty));
        }
        let categories = BindlessCategory::ALL.map(|c| CategoryState::new(capacities.get(c)));
        Ok(Self {
            sink,
            capacities,
            categories,
            binds: 0,
        })
    }

    /// Writes `resource` into slot `index`. Safe while earlier frames that
    /// reference the same slot are still executing; they keep the old
    /// descriptor.
    pub fn write(
        &mut self,
        category: BindlessCategory,
        index: u32,
        resource: &S::Resource,
    ) -> Result<(), BindlessError> {
        let found = S::category_of(resource);
        if found != category {
            return Err(BindlessError::CategoryMismatch {
                expected: category,
                found,
            });
        }
        let state = &mut self.categories[category.slot()];
        if index >= state.capacity {
            return Err(BindlessError::OutOfRange {
                category,
                index,
                capacity: state.capacity,
            });
        }
        self.sink.write_descriptor(category, index, resource)?;
        state.written[index as usize] = true;
        state.high_water = state.high_water.max(index + 1);
        trace!(category = category.name(), index, "bindless write");
        Ok(())
    }

    /// Binds the table once for a command recorder. Draws then address
    /// entries through push data only.
    pub fn bind_for(&mut self, recorder: &S::Recorder) -> Result<(), BindlessError> {
        self.sink.bind_table(recorder)?;
        self.binds += 1;
        Ok(())
    }

    /// Reserves the lowest never-used index, or a released one.
    pub fn allocate(&mut self, category: BindlessCategory) -> Result<u32, BindlessError> {
        let state = &mut self.categories[category.slot()];
        let index = match state.free.pop() {
            Some(i) => i,
            None if state.next_fresh < state.capacity => {
                state.next_fresh += 1;
                state.next_fresh - 1
            }
            None => {
                return Err(BindlessError::Exhausted {
                    category,
                    capacity: state.capacity,
                })
            }
        };
        state.allocated[index as usize] = true;
        Ok(index)
    }

    /// Returns `index` to the free list. The descriptor itself is left in
    /// place; partially bound tables tolerate stale unused entries.
    pub fn release(&mut self, category: BindlessCategory, index: u32) -> Result<(), BindlessError> {
        let state = &mut self.categories[category.slot()];
        match state.allocated.get_mut(index as usize) {
            Some(slot) if *slot => {
                *slot = false;
                state.free.push(index);
                Ok(())
            }
            _ => Err(BindlessError::NotAllocated { category, index }),
        }
    }

    pub fn is_written(&self, category: BindlessCategory, index: u32) -> bool {
        self.categories[category.slot()]
            .written
            .get(index as usize)
            .copied()
            .unwrap_or(false)
    }

    /// One past the highest index ever written in `category`.
    pub fn resident(&self, category: BindlessCategory) -> u32 {
        self.categories[category.slot()].high_water
    }

    pub fn capacity(&self, category: BindlessCategory) -> u32 {
        self.capacities.get(category)
    }

    pub fn capacities(&self) -> &BindlessCapacities {
        &self.capacities
    }

    pub fn bind_count(&self) -> u64 {
        self.binds
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Res {
        Texture(u32),
        Sampler(u32),
    }

    #[derive(Debug, PartialEq)]
    enum Op {
        Write(BindlessCategory, u32, Res),
        Bind(u32),
    }

    #[derive(Default)]
    struct Log(Vec<Op>);

    impl DescriptorSink for Log {
        type Resource = Res;
        type Recorder = u32;

        fn category_of(resource: &Res) -> BindlessCategory {
            match resource {
                Res::Texture(_) => BindlessCategory::SampledImage,
                Res::Sampler(_) => BindlessCategory::Sampler,
            }
        }

        fn write_descriptor(&mut self, c: BindlessCategory, i: u32, r: &Res) -> Result<(), BackendError> {
            self.0.push(Op::Write(c, i, *r));
            Ok(())
        }

        fn bind_table(&mut self, recorder: &u32) -> Result<(), BackendError> {
            self.0.push(Op::Bind(*recorder));
            Ok(())
        }
    }

    fn small() -> BindlessCapacities {
        BindlessCapacities {
            sampled_images: 4,
            samplers: 2,
            storage_buffers: 1,
            uniform_buffers: 1,
            storage_images: 1,
        }
    }

    #[test]
    fn default_capacities() {
        let c = BindlessCapacities::default();
        assert_eq!(c.get(BindlessCategory::SampledImage), 16_384);
        assert_eq!(c.get(BindlessCategory::Sampler), 128);
        assert_eq!(c.get(BindlessCategory::StorageBuffer), 1_024);
        assert_eq!(c.get(BindlessCategory::UniformBuffer), 256);
        assert_eq!(c.get(BindlessCategory::StorageImage), 512);
    }

    #[test]
    fn variable_count_binding_is_last() {
        let last = BindlessCategory::ALL.iter().max_by_key(|c| c.binding()).unwrap();
        assert!(last.has_variable_count());
        let bindings: Vec<u32> = BindlessCategory::ALL.iter().map(|c| c.binding()).collect();
        assert_eq!(bindings, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn write_before_bind_reaches_backend_in_order() {
        let mut table = BindlessTable::new(small(), Log::default()).unwrap();
        table.write(BindlessCategory::SampledImage, 2, &Res::Texture(11)).unwrap();
        table.bind_for(&7).unwrap();
        table.write(BindlessCategory::SampledImage, 2, &Res::Texture(12)).unwrap();
        table.bind_for(&8).unwrap();

        assert_eq!(
            table.sink().0,
            vec![
                Op::Write(BindlessCategory::SampledImage, 2, Res::Texture(11)),
                Op::Bind(7),
                Op::Write(BindlessCategory::SampledImage, 2, Res::Texture(12)),
                Op::Bind(8),
            ]
        );
        assert!(table.is_written(BindlessCategory::SampledImage, 2));
        assert!(!table.is_written(BindlessCategory::SampledImage, 1));
        assert_eq!(table.resident(BindlessCategory::SampledImage), 3);
        assert_eq!(table.bind_count(), 2);
    }

    #[test]
    fn rejects_out_of_range_and_wrong_kind() {
        let mut table = BindlessTable::new(small(), Log::default()).unwrap();
        let err = table.write(BindlessCategory::Sampler, 2, &Res::Sampler(1)).unwrap_err();
        assert!(matches!(err, BindlessError::OutOfRange { index: 2, capacity: 2, .. }));
        let err = table.write(BindlessCategory::Sampler, 0, &Res::Texture(1)).unwrap_err();
        assert!(matches!(err, BindlessError::CategoryMismatch { .. }));
        assert!(table.sink().0.is_empty());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let caps = BindlessCapacities {
            uniform_buffers: 0,
            ..small()
        };
        let err = BindlessTable::new(caps, Log::default()).err().unwrap();
        assert_eq!(err, BindlessError::ZeroCapacity(BindlessCategory::UniformBuffer));
    }

    #[test]
    fn allocate_release_reuses_indices() {
        let mut table = BindlessTable::new(small(), Log::default()).unwrap();
        assert_eq!(table.allocate(BindlessCategory::Sampler).unwrap(), 0);
        assert_eq!(table.allocate(BindlessCategory::Sampler).unwrap(), 1);
        assert!(matches!(
            table.allocate(BindlessCategory::Sampler),
            Err(BindlessError::Exhausted { capacity: 2, .. })
        ));
        table.release(BindlessCategory::Sampler, 0).unwrap();
        assert!(table.release(BindlessCategory::Sampler, 0).is_err());
        assert_eq!(table.allocate(BindlessCategory::Sampler).unwrap(), 0);
    }

    #[test]
    fn capacities_from_partial_toml() {
        let caps: BindlessCapacities = toml::from_str("samplers = 64").unwrap();
        assert_eq!(caps.samplers, 64);
        assert_eq!(caps.sampled_images, 16_384);
    }
}
