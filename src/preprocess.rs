use std::sync::Arc;

use image::RgbImage;
use image::imageops::{self, FilterType};

use crate::error::TrainError;
use crate::{FRAME_HEIGHT, FRAME_PIXELS, FRAME_WIDTH, STACK_SIZE};

/// Luma values at or below this are treated as background.
pub const BINARIZE_THRESHOLD: u8 = 1;

/// A binarized single-channel frame, `FRAME_WIDTH`×`FRAME_HEIGHT`, row-major.
/// Each cell is 0 or 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    cells: Box<[u8]>,
}

impl Frame {
    pub fn blank() -> Self {
        Self {
            cells: vec![0u8; FRAME_PIXELS].into_boxed_slice(),
        }
    }

    #[cfg(test)]
    fn get(&self, x: usize, y: usize) -> f32 {
        self.cells[y * FRAME_WIDTH + x] as f32
    }

    pub fn values(&self) -> impl Iterator<Item = f32> + '_ {
        self.cells.iter().map(|&c| c as f32)
    }
}

/// Downsample, convert to luminance, and binarize a raw RGB game frame.
pub fn preprocess(raw: &RgbImage) -> Frame {
    let resized = imageops::resize(
        raw,
        FRAME_WIDTH as u32,
        FRAME_HEIGHT as u32,
        FilterType::Nearest,
    );
    let luma = imageops::grayscale(&resized);
    let cells = luma
        .as_raw()
        .iter()
        .map(|&l| u8::from(l > BINARIZE_THRESHOLD))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    debug_assert_eq!(cells.len(), FRAME_PIXELS);
    Frame { cells }
}

/// `preprocess` for frames straight from a game, rejecting empty images.
pub fn preprocess_checked(raw: &RgbImage) -> Result<Frame, TrainError> {
    if raw.width() == 0 || raw.height() == 0 {
        return Err(TrainError::Collaborator(format!(
            "empty {}x{} frame",
            raw.width(),
            raw.height()
        )));
    }
    Ok(preprocess(raw))
}

// =============================================================================
// Frame stack
// =============================================================================

/// The network input: the `STACK_SIZE` most recent frames, oldest first.
///
/// Frames are shared, so a transition's `state` and `next_state` only differ
/// by one allocation.
#[derive(Debug, Clone)]
pub struct State {
    frames: [Arc<Frame>; STACK_SIZE],
}

impl State {
    pub fn blank() -> Self {
        let blank = Arc::new(Frame::blank());
        Self {
            frames: std::array::from_fn(|_| Arc::clone(&blank)),
        }
    }

    /// Drop the oldest frame and append `frame` as the newest.
    pub fn push(&self, frame: Frame) -> Self {
        let newest = Arc::new(frame);
        Self {
            frames: std::array::from_fn(|i| {
                if i + 1 < STACK_SIZE {
                    Arc::clone(&self.frames[i + 1])
                } else {
                    Arc::clone(&newest)
                }
            }),
        }
    }

    #[cfg(test)]
    fn frames(&self) -> &[Arc<Frame>; STACK_SIZE] {
        &self.frames
    }

    #[cfg(test)]
    fn newest(&self) -> &Frame {
        &self.frames[STACK_SIZE - 1]
    }

    /// Append the stack as `(STACK_SIZE, FRAME_HEIGHT, FRAME_WIDTH)` floats.
    pub fn extend_into(&self, out: &mut Vec<f32>) {
        for frame in &self.frames {
            out.extend(frame.values());
        }
    }

    pub fn to_vec(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(STACK_SIZE * FRAME_PIXELS);
        self.extend_into(&mut out);
        out
    }
}

impl Default for State {
    fn default() -> Self {
        Self::blank()
    }
}

/// A full stack of distinct non-blank frames, so every input channel
/// reaches the first conv layer.
#[cfg(test)]
pub(crate) fn textured_state() -> State {
    (0..STACK_SIZE as u32).fold(State::blank(), |state, k| {
        let raw = RgbImage::from_fn(512, 288, |x, y| {
            image::Rgb([(((x * (k + 1)) ^ y) & 0xff) as u8, 0, 0])
        });
        state.push(preprocess(&raw))
    })
}
