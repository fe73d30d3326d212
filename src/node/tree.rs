use std::rc::Rc;

use image::RgbImage;

use super::error::TreeError;
use super::metric::ErrorMethod;
use super::{Block, QuadtreeNode};

/// Cap on `tree_depth` for `divide_exhaust`.
///
/// Only pathological inputs get near it; a real image runs out of
/// splittable blocks long before.
pub const MAX_DEPTH: u32 = 50;

/// Parameters deciding where the tree splits.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TreeParams {
	/// Blocks at or below this area, or whose split would produce a smaller
	/// section, are never split.
	pub min_block_area: u64,
	pub threshold: f64,
	pub method: ErrorMethod,
}

/// Quadtree decomposition of one image.
///
/// The image is shared read-only with the caller and never modified; every
/// merge renders into a fresh copy of it.
#[derive(Clone, Debug)]
pub struct QuadTree {
	root: QuadtreeNode,
	image: Rc<RgbImage>,
	params: TreeParams,
	node_count: usize,
	tree_depth: u32,
	/// `tree_depth` at the time averages were last computed.
	averaged_at: Option<u32>,
}

impl QuadTree {
	/// Creates a single-node tree covering `image` and scores the root.
	pub fn new(image: Rc<RgbImage>, params: TreeParams) -> Result<Self, TreeError> {
		let (width, height) = image.dimensions();
		if width == 0 || height == 0 {
			return Err(TreeError::EmptyImage { width, height });
		}
		let mut root = QuadtreeNode::new(Block::covering(width, height));
		root.compute_error(&image, params.method)?;
		Ok(QuadTree {
			root,
			image,
			params,
			node_count: 1,
			tree_depth: 1,
			averaged_at: None,
		})
	}

	pub fn node_count(&self) -> usize {
		self.node_count
	}

	/// 1 for a lone root, plus one for every `divide` pass that split something.
	pub fn tree_depth(&self) -> u32 {
		self.tree_depth
	}

	pub fn params(&self) -> &TreeParams {
		&self.params
	}

	pub fn root(&self) -> &QuadtreeNode {
		&self.root
	}

	pub fn image(&self) -> &RgbImage {
		&self.image
	}

	/// Whether the cached node averages match the current tree shape.
	pub fn averages_current(&self) -> bool {
		self.averaged_at == Some(self.tree_depth)
	}

	/// Leaf nodes, depth first, top-left quadrant first.
	pub fn leaves(&self) -> impl Iterator<Item = &QuadtreeNode> {
		let mut stack = vec![&self.root];
		std::iter::from_fn(move || {
			while let Some(node) = stack.pop() {
				match node.sections {
					Some(ref sections) => stack.extend(sections.iter().rev()),
					None => return Some(node),
				}
			}
			None
		})
	}

	/// Scores of the nodes that have been split, depth first.
	///
	/// These are the only scores at which `merge_threshold` renders change.
	pub fn branch_errors(&self) -> impl Iterator<Item = f64> + '_ {
		let mut stack = vec![&self.root];
		std::iter::from_fn(move || {
			while let Some(node) = stack.pop() {
				if let Some(ref sections) = node.sections {
					stack.extend(sections.iter().rev());
					return Some(node.error);
				}
			}
			None
		})
	}

	/// Splits every divisible leaf once.
	///
	/// Returns the number of nodes created by this pass. If the pass fails
	/// partway, the splits it already made are kept and counted.
	pub fn divide(&mut self) -> Result<usize, TreeError> {
		let created = match divide_node(&mut self.root, &self.image, &self.params) {
			Ok(created) => created,
			Err(e) => {
				let count = self.root.count();
				if count > self.node_count {
					self.tree_depth += 1;
				}
				self.node_count = count;
				return Err(e);
			}
		};
		self.node_count += created;
		if created > 0 {
			self.tree_depth += 1;
		}
		Ok(created)
	}

	/// Divides until no leaf can be split or `MAX_DEPTH` is reached.
	pub fn divide_exhaust(&mut self) -> Result<(), TreeError> {
		while self.tree_depth < MAX_DEPTH {
			if self.divide()? == 0 {
				break;
			}
		}
		Ok(())
	}

	/// Recomputes node averages, unless the tree hasn't changed shape since
	/// the last time.
	pub fn compute_averages(&mut self) -> Result<(), TreeError> {
		if self.averages_current() {
			return Ok(());
		}
		average_subtree(&mut self.root, &self.image)?;
		self.averaged_at = Some(self.tree_depth);
		Ok(())
	}

	/// Renders the tree down to `depth` levels into a copy of the image.
	///
	/// `depth` 0 returns the image untouched; -1 renders every leaf. Anything
	/// below -1 or beyond `tree_depth` is refused.
	pub fn merge(&mut self, depth: i32, border: bool) -> Result<RgbImage, TreeError> {
		if depth < -1 || depth > self.tree_depth as i32 {
			return Err(TreeError::InvalidDepth { depth, max: self.tree_depth });
		}
		let mut output = (*self.image).clone();
		if depth == 0 {
			return Ok(output);
		}
		self.compute_averages()?;
		self.root.paint_depth(&mut output, depth, border)?;
		Ok(output)
	}

	/// Renders each path of the tree down to the first node whose score
	/// passes `threshold`, into a copy of the image.
	///
	/// The tree itself is not re-divided, so one exhaustively divided tree
	/// can be rendered at any number of thresholds.
	pub fn merge_threshold(&mut self, threshold: f64, border: bool) -> Result<RgbImage, TreeError> {
		if !(threshold >= 0.) {
			return Err(TreeError::NegativeThreshold(threshold));
		}
		let mut output = (*self.image).clone();
		self.compute_averages()?;
		self.root.paint_threshold(&mut output, threshold, self.params.method, border)?;
		Ok(output)
	}
}

fn divide_node(node: &mut QuadtreeNode, img: &RgbImage, params: &TreeParams) -> Result<usize, TreeError> {
	if let Some(ref mut sections) = node.sections {
		let mut created = 0;
		for section in sections.iter_mut() {
			created += divide_node(section, img, params)?;
		}
		return Ok(created);
	}
	if !node.divisible {
		return Ok(0);
	}
	let too_small = node.area() <= params.min_block_area
		|| node.smallest_section_area().map_or(true, |a| a < params.min_block_area);
	if too_small || params.method.is_below_threshold(node.error, params.threshold) {
		node.divisible = false;
		return Ok(0);
	}
	node.split(img, params.method)
}

fn average_subtree(node: &mut QuadtreeNode, img: &RgbImage) -> Result<(), TreeError> {
	if let Some(ref mut sections) = node.sections {
		for section in sections.iter_mut() {
			average_subtree(section, img)?;
		}
	}
	node.compute_average(img)
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::Rgb;

	/// Deterministic noise with a few flat patches.
	fn patchy_image(width: u32, height: u32) -> Rc<RgbImage> {
		let mut seed = 0x9e37_79b9_7f4a_7c15u64;
		Rc::new(RgbImage::from_fn(width, height, |x, y| {
			if x < width / 2 && y < height / 2 {
				return Rgb([40, 80, 120]);
			}
			seed ^= seed << 13;
			seed ^= seed >> 7;
			seed ^= seed << 17;
			let [a, b, c, ..] = seed.to_le_bytes();
			Rgb([a, b, c])
		}))
	}

	fn params(method: ErrorMethod, threshold: f64, min_block_area: u64) -> TreeParams {
		TreeParams { min_block_area, threshold, method }
	}

	fn branch_count(node: &QuadtreeNode) -> usize {
		node.sections.as_ref().map_or(0, |s| 1 + s.iter().map(branch_count).sum::<usize>())
	}

	#[test]
	fn uniform_image_stays_a_single_node() {
		let img = Rc::new(RgbImage::from_pixel(16, 16, Rgb([3, 4, 5])));
		let mut tree = QuadTree::new(img, params(ErrorMethod::Variance, 0., 1)).unwrap();
		tree.divide_exhaust().unwrap();
		assert_eq!(tree.node_count(), 1);
		assert_eq!(tree.tree_depth(), 1);
		assert!(!tree.root().divisible);
	}

	#[test]
	fn counts_track_splits() {
		let mut tree = QuadTree::new(patchy_image(37, 23), params(ErrorMethod::Variance, 0., 1)).unwrap();
		let mut productive = 0;
		loop {
			let created = tree.divide().unwrap();
			assert_eq!(created % 4, 0);
			if created == 0 {
				break;
			}
			productive += 1;
			assert_eq!(tree.node_count(), 1 + 4 * branch_count(tree.root()));
		}
		assert_eq!(tree.tree_depth(), 1 + productive);
		assert_eq!(tree.node_count(), tree.root().count());
	}

	#[test]
	fn exhaust_is_idempotent() {
		let mut tree = QuadTree::new(patchy_image(32, 32), params(ErrorMethod::Entropy, 0.5, 1)).unwrap();
		tree.divide_exhaust().unwrap();
		let (nodes, depth) = (tree.node_count(), tree.tree_depth());
		tree.divide_exhaust().unwrap();
		assert_eq!((tree.node_count(), tree.tree_depth()), (nodes, depth));
		assert_eq!(tree.divide().unwrap(), 0);
	}

	#[test]
	fn leaves_tile_the_image_and_respect_min_area() {
		let mut tree = QuadTree::new(patchy_image(50, 30), params(ErrorMethod::MaxPixelDifference, 10., 6)).unwrap();
		tree.divide_exhaust().unwrap();
		let area: u64 = tree.leaves().map(QuadtreeNode::area).sum();
		assert_eq!(area, 50 * 30);
		assert!(tree.leaves().all(|l| l.area() >= 6));
	}

	#[test]
	fn threshold_stops_uniform_quadrant() {
		let mut tree = QuadTree::new(patchy_image(16, 16), params(ErrorMethod::Variance, 0., 1)).unwrap();
		tree.divide().unwrap();
		tree.divide().unwrap();
		let flat = &tree.root().sections.as_ref().unwrap()[0];
		assert_eq!(flat.error, 0.);
		assert!(flat.is_leaf() && !flat.divisible);
	}

	#[test]
	fn ssim_threshold_polarity_drives_division() {
		let img = patchy_image(16, 16);
		let mut coarse = QuadTree::new(img.clone(), params(ErrorMethod::Ssim, 0., 1)).unwrap();
		coarse.divide_exhaust().unwrap();
		assert_eq!(coarse.node_count(), 1);
		let mut fine = QuadTree::new(img, params(ErrorMethod::Ssim, 1., 1)).unwrap();
		fine.divide_exhaust().unwrap();
		assert!(fine.node_count() > 1);
	}

	#[test]
	fn full_merge_matches_threshold_zero_merge() {
		let mut tree = QuadTree::new(patchy_image(40, 24), params(ErrorMethod::Variance, 0., 1)).unwrap();
		tree.divide_exhaust().unwrap();
		let by_depth = tree.merge(-1, false).unwrap();
		let by_threshold = tree.merge_threshold(0., false).unwrap();
		assert_eq!(by_depth, by_threshold);
		let deepest = tree.merge(tree.tree_depth() as i32, false).unwrap();
		assert_eq!(by_depth, deepest);
	}

	#[test]
	fn merge_depth_zero_is_the_source() {
		let img = patchy_image(8, 8);
		let mut tree = QuadTree::new(img.clone(), params(ErrorMethod::Variance, 0., 1)).unwrap();
		tree.divide_exhaust().unwrap();
		assert_eq!(tree.merge(0, true).unwrap(), *img);
		assert!(!tree.averages_current());
	}

	#[test]
	fn merge_depth_one_paints_the_root_average() {
		let mut tree = QuadTree::new(patchy_image(9, 7), params(ErrorMethod::Variance, 0., 1)).unwrap();
		tree.divide_exhaust().unwrap();
		let out = tree.merge(1, false).unwrap();
		let color = tree.root().color();
		assert!(out.pixels().all(|p| *p == color));
	}

	#[test]
	fn merge_rejects_bad_arguments() {
		let mut tree = QuadTree::new(patchy_image(8, 8), params(ErrorMethod::Variance, 0., 1)).unwrap();
		tree.divide().unwrap();
		assert_eq!(tree.merge(-2, false), Err(TreeError::InvalidDepth { depth: -2, max: 2 }));
		assert_eq!(tree.merge(3, false), Err(TreeError::InvalidDepth { depth: 3, max: 2 }));
		assert_eq!(tree.merge_threshold(-0.1, false), Err(TreeError::NegativeThreshold(-0.1)));
		assert!(tree.merge(2, true).is_ok());
	}

	#[test]
	fn averages_follow_tree_shape() {
		let img = patchy_image(21, 13);
		let mut tree = QuadTree::new(img.clone(), params(ErrorMethod::MeanAbsoluteDeviation, 0., 1)).unwrap();
		tree.divide().unwrap();
		tree.compute_averages().unwrap();
		assert!(tree.averages_current());
		assert!(tree.divide().unwrap() > 0);
		assert!(!tree.averages_current());
		tree.divide_exhaust().unwrap();
		tree.compute_averages().unwrap();

		let area = (21 * 13) as f64;
		let mut mean = [0.; 3];
		for p in img.pixels() {
			for c in 0..3 {
				mean[c] += p.0[c] as f64 / area;
			}
		}
		for c in 0..3 {
			assert!((tree.root().average[c] - mean[c]).abs() < 1e-6);
		}
		let weighted: f64 = tree.leaves().map(|l| l.average[1] * l.area() as f64).sum::<f64>() / area;
		assert!((weighted - tree.root().average[1]).abs() < 1e-6);
	}

	#[test]
	fn empty_image_is_refused() {
		let img = Rc::new(RgbImage::new(0, 5));
		assert_eq!(
			QuadTree::new(img, params(ErrorMethod::Variance, 0., 1)).err(),
			Some(TreeError::EmptyImage { width: 0, height: 5 })
		);
	}

	#[test]
	fn branch_errors_cover_every_split_node() {
		let mut tree = QuadTree::new(patchy_image(20, 12), params(ErrorMethod::Variance, 0., 1)).unwrap();
		tree.divide_exhaust().unwrap();
		let errors: Vec<f64> = tree.branch_errors().collect();
		assert_eq!(errors.len(), branch_count(tree.root()));
		assert_eq!(errors[0], tree.root().error);
		assert!(errors.iter().all(|&e| e > 0.));
		assert_eq!(tree.node_count(), 1 + 4 * errors.len());
	}

	#[test]
	fn failed_divide_keeps_counts_in_step() {
		let img = Rc::new(RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 37 + y * 91) as u8, (x * 11) as u8, (y * 53) as u8])));
		let mut tree = QuadTree::new(img, params(ErrorMethod::Variance, 0., 1)).unwrap();
		assert_eq!(tree.divide().unwrap(), 4);
		tree.compute_averages().unwrap();

		// The lower quadrants no longer fit, so the pass fails after
		// splitting the upper two.
		tree.image = Rc::new(RgbImage::new(8, 4));
		assert!(matches!(tree.divide(), Err(TreeError::OutOfBounds { .. })));
		assert_eq!(tree.node_count(), tree.root().count());
		assert_eq!(tree.node_count(), 13);
		assert_eq!(tree.tree_depth(), 3);
		assert!(!tree.averages_current());
	}
}
