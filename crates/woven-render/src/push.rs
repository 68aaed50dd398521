// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};

/// Size of the single push-constant range every stage can see.
pub const PUSH_CONSTANT_BYTES: u32 = 128;

/// Per-draw data pushed to all stages. Bindless indices go after the fixed
/// fields once draws start referencing table entries.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PushBlock {
    pub time: f32,
    pub frame: u32,
    pub resolution: [f32; 2],
}

const _: () = assert!(std::mem::size_of::<PushBlock>() <= PUSH_CONSTANT_BYTES as usize);

impl PushBlock {
    pub fn new(time: f32, frame: u64, width: u32, height: u32) -> Self {
        Self {
            time,
            frame: frame as u32,
            resolution: [width as f32, height as f32],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_shader_block() {
        let p = PushBlock::new(1.5, 3, 1920, 1080);
        let bytes = p.as_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &1.5f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &1920f32.to_le_bytes());
    }
}
