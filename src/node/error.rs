use std::path::PathBuf;

use image::ImageError;
use thiserror::Error;

use super::Block;

/// Reason why a quadtree operation was refused.
///
/// All of these are contract violations by the caller. Merges leave the
/// tree as it was; a `divide` pass keeps whatever splits it made before
/// failing.
#[derive(Debug, Error, PartialEq)]
pub enum TreeError {
	/// A node's block reaches outside the image it is read from.
	#[error("block {block} lies outside the {width}x{height} image")]
	OutOfBounds {
		block: Block,
		width: u32,
		height: u32,
	},
	/// The source image has no pixels to build a tree over.
	#[error("cannot build a quadtree over an empty {width}x{height} image")]
	EmptyImage { width: u32, height: u32 },
	/// Merge depth outside `-1..=tree_depth`.
	#[error("merge depth {depth} is outside -1..={max}")]
	InvalidDepth { depth: i32, max: u32 },
	/// Merge threshold below zero.
	#[error("merge threshold {0} must not be negative")]
	NegativeThreshold(f64),
}

/// Reason why an image couldn't be read or written.
#[derive(Debug, Error)]
pub enum CodecError {
	/// The file is missing, unreadable or not a decodable image.
	#[error("could not read image {}", .path.display())]
	Open {
		path: PathBuf,
		#[source]
		source: ImageError,
	},
	/// The image has fewer than three colour channels.
	#[error("image {} has {channels} channel(s), but RGB needs 3", .path.display())]
	MissingChannels { path: PathBuf, channels: u8 },
	/// The output extension is not one of the supported formats.
	#[error("cannot save {}: output must be .jpg, .jpeg, .png or .bmp", .path.display())]
	UnsupportedFormat { path: PathBuf },
	/// The encoder or the file system refused the write.
	#[error("could not write image {}", .path.display())]
	Save {
		path: PathBuf,
		#[source]
		source: ImageError,
	},
}
