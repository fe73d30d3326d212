//! GIF output for visualising how a tree refines, one merge depth per frame.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use gif::{Encoder, EncodingError, Frame, Repeat};
use image::RgbImage;
use thiserror::Error;

/// Delay of intermediate frames, in hundredths of a second.
pub const FRAME_DELAY: u16 = 50;
/// Delay of the last frame before the animation loops.
pub const FINAL_FRAME_DELAY: u16 = 400;
/// NeuQuant sampling speed, 1 (best) to 30 (fastest).
pub const QUANTIZER_SPEED: i32 = 10;

/// Reason why an animation couldn't be written.
#[derive(Debug, Error)]
pub enum AnimationError {
	#[error("could not create {}", .path.display())]
	Create {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("{width}x{height} is too large for a GIF frame")]
	TooLarge { width: u32, height: u32 },
	#[error("frame is {got:?}, but the animation is {expected:?}")]
	FrameSize { expected: (u32, u32), got: (u32, u32) },
	#[error("could not encode {}", .path.display())]
	Encode {
		path: PathBuf,
		#[source]
		source: EncodingError,
	},
	#[error("could not finish writing {}", .path.display())]
	Finish {
		path: PathBuf,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
}

/// Looping GIF encoder taking fixed-size RGB frames.
pub struct GifWriter {
	encoder: Encoder<BufWriter<File>>,
	width: u16,
	height: u16,
	path: PathBuf,
}

impl GifWriter {
	/// Creates `path` for a `width` by `height` animation that loops forever.
	pub fn create(path: &Path, width: u32, height: u32) -> Result<Self, AnimationError> {
		let (w, h) = match (u16::try_from(width), u16::try_from(height)) {
			(Ok(w), Ok(h)) => (w, h),
			_ => return Err(AnimationError::TooLarge { width, height }),
		};
		let file = File::create(path).map_err(|source| AnimationError::Create {
			path: path.to_path_buf(),
			source,
		})?;
		let encode_err = |source| AnimationError::Encode { path: path.to_path_buf(), source };
		let mut encoder = Encoder::new(BufWriter::new(file), w, h, &[]).map_err(encode_err)?;
		encoder.set_repeat(Repeat::Infinite).map_err(encode_err)?;
		Ok(GifWriter {
			encoder,
			width: w,
			height: h,
			path: path.to_path_buf(),
		})
	}

	/// Appends a frame shown for `delay` hundredths of a second.
	pub fn push(&mut self, frame: &RgbImage, delay: u16) -> Result<(), AnimationError> {
		let expected = (self.width as u32, self.height as u32);
		if frame.dimensions() != expected {
			return Err(AnimationError::FrameSize { expected, got: frame.dimensions() });
		}
		let mut gif_frame = Frame::from_rgb_speed(self.width, self.height, frame.as_raw(), QUANTIZER_SPEED);
		gif_frame.delay = delay;
		self.encoder.write_frame(&gif_frame).map_err(|source| AnimationError::Encode {
			path: self.path.clone(),
			source,
		})
	}

	/// Writes the trailer and flushes the file.
	pub fn finish(self) -> Result<(), AnimationError> {
		let path = self.path;
		let mut file = self.encoder.into_inner()
			.map_err(|e| AnimationError::Finish { path: path.clone(), source: e.into() })?;
		file.flush().map_err(|e| AnimationError::Finish { path, source: e.into() })
	}
}
