pub mod error;
pub mod metric;
pub mod pixels;
pub mod tree;

use std::fmt;

use image::RgbImage;

use self::error::TreeError;
use self::pixels::Channel;
use self::metric::ErrorMethod;

/// Axis-aligned block of an image, with inclusive bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Block {
	pub row_start: u32,
	pub col_start: u32,
	pub row_end: u32,
	pub col_end: u32,
}

impl Block {
	pub fn new(row_start: u32, col_start: u32, row_end: u32, col_end: u32) -> Self {
		debug_assert!(row_start <= row_end && col_start <= col_end);
		Block { row_start, col_start, row_end, col_end }
	}

	/// The block covering a whole `width` by `height` image.
	///
	/// Both dimensions must be non-zero.
	pub fn covering(width: u32, height: u32) -> Self {
		Block::new(0, 0, height - 1, width - 1)
	}

	pub fn width(&self) -> u32 {
		self.col_end - self.col_start + 1
	}

	pub fn height(&self) -> u32 {
		self.row_end - self.row_start + 1
	}

	pub fn area(&self) -> u64 {
		self.width() as u64 * self.height() as u64
	}

	/// Whether the block lies entirely inside a `width` by `height` image.
	pub fn fits(&self, width: u32, height: u32) -> bool {
		self.row_end < height && self.col_end < width
	}

	/// Splits the block into four quadrants, in the order
	///
	/// ```text
	/// 0 1
	/// 2 3
	/// ```
	///
	/// The midpoint is rounded down, so an odd side gives its extra row or
	/// column to the first half. Returns `None` for blocks one pixel wide
	/// or tall, which cannot be split into four non-empty parts.
	pub fn quadrants(&self) -> Option<[Block; 4]> {
		if self.width() < 2 || self.height() < 2 {
			return None;
		}
		let row_mid = (self.row_start + self.row_end) / 2;
		let col_mid = (self.col_start + self.col_end) / 2;
		Some([
			Block::new(self.row_start, self.col_start, row_mid, col_mid),
			Block::new(self.row_start, col_mid + 1, row_mid, self.col_end),
			Block::new(row_mid + 1, self.col_start, self.row_end, col_mid),
			Block::new(row_mid + 1, col_mid + 1, self.row_end, self.col_end),
		])
	}
}

impl fmt::Display for Block {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "rows {}..={}, cols {}..={}",
			self.row_start, self.row_end, self.col_start, self.col_end)
	}
}

/// Node in a quadtree over an image.
///
/// May contain subnodes (branch node) or no subnodes (leaf node). Either
/// way it describes one block, carries that block's homogeneity score and,
/// once averages have been computed, the block's mean colour, so that
/// rendering can stop at any level and still cover the block.
#[derive(Clone, Debug)]
pub struct QuadtreeNode {
	pub block: Block,
	/// Homogeneity score of this block's own pixels.
	pub error: f64,
	/// Mean red, green and blue.
	pub average: [f64; 3],
	/// Cleared once the node is known to be too small or too uniform to split.
	pub divisible: bool,
	pub sections: Option<Box<[QuadtreeNode; 4]>>,
}

impl QuadtreeNode {
	pub fn new(block: Block) -> Self {
		QuadtreeNode {
			block,
			error: 0.,
			average: [0.; 3],
			divisible: true,
			sections: None,
		}
	}

	pub fn is_leaf(&self) -> bool {
		self.sections.is_none()
	}

	pub fn area(&self) -> u64 {
		self.block.area()
	}

	fn check_bounds(&self, img: &RgbImage) -> Result<(), TreeError> {
		if self.block.fits(img.width(), img.height()) {
			Ok(())
		} else {
			Err(TreeError::OutOfBounds {
				block: self.block,
				width: img.width(),
				height: img.height(),
			})
		}
	}

	/// Scores this node's block with `method` and caches the result in `error`.
	pub fn compute_error(&mut self, img: &RgbImage, method: ErrorMethod) -> Result<(), TreeError> {
		self.check_bounds(img)?;
		let [r, g, b] = Channel::ALL.map(|channel|
			method.channel_error(pixels::block_samples(img, self.block, channel)));
		self.error = method.aggregate(r, g, b);
		Ok(())
	}

	/// Fills in `average`.
	///
	/// Leaves average their own pixels. Branches take the area-weighted mean
	/// of their sections, which must already have been averaged.
	pub fn compute_average(&mut self, img: &RgbImage) -> Result<(), TreeError> {
		match self.sections {
			Some(ref sections) => {
				let mut sum = [0.; 3];
				for section in sections.iter() {
					let weight = section.area() as f64;
					for (s, a) in sum.iter_mut().zip(section.average.iter()) {
						*s += a * weight;
					}
				}
				let area = self.area() as f64;
				self.average = sum.map(|s| s / area);
			}
			None => {
				self.check_bounds(img)?;
				let area = self.area() as f64;
				self.average = Channel::ALL.map(|channel|
					pixels::block_samples(img, self.block, channel)
						.map(u64::from)
						.sum::<u64>() as f64 / area);
			}
		}
		Ok(())
	}

	/// Replaces this leaf with four sections covering its quadrants and
	/// scores each of them.
	///
	/// Returns the number of nodes created: 4, or 0 if the block is too
	/// thin to split.
	pub fn split(&mut self, img: &RgbImage, method: ErrorMethod) -> Result<usize, TreeError> {
		debug_assert!(self.is_leaf());
		let quadrants = match self.block.quadrants() {
			Some(q) => q,
			None => return Ok(0),
		};
		let mut sections = Box::new(quadrants.map(QuadtreeNode::new));
		for section in sections.iter_mut() {
			section.compute_error(img, method)?;
		}
		self.sections = Some(sections);
		Ok(4)
	}

	/// Smallest section area a split would produce, if the block can split.
	pub fn smallest_section_area(&self) -> Option<u64> {
		self.block.quadrants()
			.map(|q| q.iter().map(Block::area).min().unwrap_or(0))
	}

	/// Number of nodes in this subtree, this node included.
	pub fn count(&self) -> usize {
		1 + self.sections.as_ref()
			.map_or(0, |s| s.iter().map(QuadtreeNode::count).sum())
	}
}
