//! Pixel-buffer plumbing: loading, saving, reading blocks channel by
//! channel, and painting nodes back into a buffer.

use std::path::Path;

use image::{Rgb, RgbImage};

use super::error::{CodecError, TreeError};
use super::metric::ErrorMethod;
use super::{Block, QuadtreeNode};

/// Extensions (lowercase, without the dot) that `save` will write.
pub const OUTPUT_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

const BORDER: Rgb<u8> = Rgb([0, 0, 0]);

/// Colour channel of an RGB pixel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
	Red = 0,
	Green = 1,
	Blue = 2,
}

impl Channel {
	pub const ALL: [Channel; 3] = [Channel::Red, Channel::Green, Channel::Blue];
}

/// Reads an image from disk as 8-bit RGB.
///
/// An alpha channel is dropped, which renders the image fully opaque.
/// Greyscale images are refused.
pub fn load(path: &Path) -> Result<RgbImage, CodecError> {
	let img = image::open(path).map_err(|source| CodecError::Open {
		path: path.to_path_buf(),
		source,
	})?;
	let channels = img.color().channel_count();
	if channels < 3 {
		return Err(CodecError::MissingChannels { path: path.to_path_buf(), channels });
	}
	Ok(img.into_rgb8())
}

/// Whether `save` can write to `path`, judging by its extension.
pub fn is_supported_output(path: &Path) -> bool {
	path.extension()
		.and_then(|e| e.to_str())
		.map_or(false, |e| OUTPUT_EXTENSIONS.iter().any(|ok| ok.eq_ignore_ascii_case(e)))
}

/// Writes `img` to `path`, picking the format from the extension.
pub fn save(img: &RgbImage, path: &Path) -> Result<(), CodecError> {
	if !is_supported_output(path) {
		return Err(CodecError::UnsupportedFormat { path: path.to_path_buf() });
	}
	img.save(path).map_err(|source| CodecError::Save {
		path: path.to_path_buf(),
		source,
	})
}

/// Samples of one channel of `block`, row by row.
///
/// The iterator can be cloned to walk the block again. `block` must lie
/// inside `img`.
pub fn block_samples(
	img: &RgbImage,
	block: Block,
	channel: Channel
) -> impl Iterator<Item = u8> + Clone + '_ {
	let c = channel as usize;
	(block.row_start..=block.row_end).flat_map(move |row|
		(block.col_start..=block.col_end).map(move |col| img.get_pixel(col, row).0[c]))
}

/// Fills `block` with `color`.
///
/// With `border`, a one pixel black line is drawn along the top and right
/// edges of the block, except where they coincide with the image edge.
pub fn paint_block(
	img: &mut RgbImage,
	block: Block,
	color: Rgb<u8>,
	border: bool
) -> Result<(), TreeError> {
	if !block.fits(img.width(), img.height()) {
		return Err(TreeError::OutOfBounds {
			block,
			width: img.width(),
			height: img.height(),
		});
	}
	for row in block.row_start..=block.row_end {
		for col in block.col_start..=block.col_end {
			img.put_pixel(col, row, color);
		}
	}
	if border {
		if block.row_start != 0 {
			for col in block.col_start..=block.col_end {
				img.put_pixel(col, block.row_start, BORDER);
			}
		}
		if block.col_end != img.width() - 1 {
			for row in block.row_start..=block.row_end {
				img.put_pixel(block.col_end, row, BORDER);
			}
		}
	}
	Ok(())
}

impl QuadtreeNode {
	/// The cached average, rounded to 8-bit RGB.
	pub fn color(&self) -> Rgb<u8> {
		Rgb(self.average.map(|c| c.round().clamp(0., 255.) as u8))
	}

	/// Paints this node, descending at most `depth - 1` levels.
	///
	/// A node is painted with its average when `depth` is 1 or the node is a
	/// leaf; `depth` of -1 descends all the way to the leaves. Averages must
	/// be current.
	pub fn paint_depth(&self, img: &mut RgbImage, depth: i32, border: bool) -> Result<(), TreeError> {
		match self.sections {
			Some(ref sections) if depth != 1 => {
				let next = if depth < 0 { depth } else { depth - 1 };
				for section in sections.iter() {
					section.paint_depth(img, next, border)?;
				}
				Ok(())
			}
			_ => paint_block(img, self.block, self.color(), border),
		}
	}

	/// Paints the shallowest nodes whose score passes `threshold` (or leaves,
	/// when none do along a path). Averages must be current.
	pub fn paint_threshold(
		&self,
		img: &mut RgbImage,
		threshold: f64,
		method: ErrorMethod,
		border: bool
	) -> Result<(), TreeError> {
		match self.sections {
			Some(ref sections) if !method.is_below_threshold(self.error, threshold) => {
				for section in sections.iter() {
					section.paint_threshold(img, threshold, method, border)?;
				}
				Ok(())
			}
			_ => paint_block(img, self.block, self.color(), border),
		}
	}
}
