//! End-to-end compression runs: validating parameters, building and
//! merging trees, searching for a target ratio, and writing the results.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::animation::{AnimationError, GifWriter, FINAL_FRAME_DELAY, FRAME_DELAY};
use crate::node::error::{CodecError, TreeError};
use crate::node::metric::ErrorMethod;
use crate::node::pixels;
use crate::node::tree::{QuadTree, TreeParams};
use crate::search::{self, SearchOutcome, SearchParams, SearchStrategy, ThresholdAxis};

/// Parameters of one compression run.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressionConfig {
	pub input: PathBuf,
	pub output: PathBuf,
	/// Where to write the refinement animation, if anywhere.
	pub gif: Option<PathBuf>,
	pub method: ErrorMethod,
	pub threshold: f64,
	pub min_block_area: u64,
	/// Share of the input size to shave off; 0 disables the search.
	pub target_ratio: f64,
	/// Overrides the method's default search strategy.
	pub search: Option<SearchStrategy>,
}

impl Default for CompressionConfig {
	fn default() -> Self {
		CompressionConfig {
			input: PathBuf::new(),
			output: PathBuf::new(),
			gif: None,
			method: ErrorMethod::default(),
			threshold: 0.,
			min_block_area: 1,
			target_ratio: 0.,
			search: None,
		}
	}
}

/// Reason why a `CompressionConfig` was rejected.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
	#[error("input image path is empty")]
	EmptyInput,
	#[error("output image path is empty")]
	EmptyOutput,
	#[error("cannot save to {}: output must be .jpg, .jpeg, .png or .bmp", .0.display())]
	UnsupportedOutput(PathBuf),
	#[error("animation path {} must end in .gif", .0.display())]
	GifExtension(PathBuf),
	#[error("error threshold {threshold} is out of range for {method}")]
	Threshold { threshold: f64, method: ErrorMethod },
	#[error("minimum block area must be at least 1")]
	MinBlockArea,
	#[error("target compression ratio {0} must be between 0 and 1")]
	TargetRatio(f64),
}

impl CompressionConfig {
	/// Checks every parameter without touching the file system.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.input.as_os_str().is_empty() {
			return Err(ConfigError::EmptyInput);
		}
		if self.output.as_os_str().is_empty() {
			return Err(ConfigError::EmptyOutput);
		}
		if !pixels::is_supported_output(&self.output) {
			return Err(ConfigError::UnsupportedOutput(self.output.clone()));
		}
		if let Some(ref gif) = self.gif {
			let is_gif = gif.extension().and_then(|e| e.to_str()).map_or(false, |e| e.eq_ignore_ascii_case("gif"));
			if !is_gif {
				return Err(ConfigError::GifExtension(gif.clone()));
			}
		}
		if !self.method.is_valid_threshold(self.threshold) {
			return Err(ConfigError::Threshold { threshold: self.threshold, method: self.method });
		}
		if self.min_block_area < 1 {
			return Err(ConfigError::MinBlockArea);
		}
		if !(0. ..=1.).contains(&self.target_ratio) {
			return Err(ConfigError::TargetRatio(self.target_ratio));
		}
		Ok(())
	}

	fn tree_params(&self, threshold: f64) -> TreeParams {
		TreeParams {
			min_block_area: self.min_block_area,
			threshold,
			method: self.method,
		}
	}
}

/// Reason why a compression run failed.
#[derive(Debug, Error)]
pub enum CompressionError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Codec(#[from] CodecError),
	#[error(transparent)]
	Tree(#[from] TreeError),
	#[error(transparent)]
	Animation(#[from] AnimationError),
	#[error("could not read the size of {}", .path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("could not remove temporary file {}", .path.display())]
	Cleanup {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("original file size is zero, so the compression ratio is undefined")]
	ZeroOriginalSize,
	#[error("cannot {0} before the image has been compressed")]
	NotCompressed(&'static str),
	#[error("no animation path was configured")]
	NoGifPath,
}

/// Sizes and tree shape of a finished run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompressionStats {
	pub original_size: u64,
	pub compressed_size: u64,
	/// `1 - compressed_size / original_size`
	pub ratio: f64,
	pub tree_depth: u32,
	pub node_count: usize,
	/// Threshold the final tree was divided at.
	pub threshold: f64,
}

/// `1 - compressed / original`; undefined for an empty original.
pub fn compression_ratio(original_size: u64, compressed_size: u64) -> Result<f64, CompressionError> {
	if original_size == 0 {
		return Err(CompressionError::ZeroOriginalSize);
	}
	Ok(1. - compressed_size as f64 / original_size as f64)
}

/// Size of the file at `path`, in bytes.
pub fn file_size(path: &Path) -> Result<u64, CompressionError> {
	fs::metadata(path)
		.map(|m| m.len())
		.map_err(|source| CompressionError::Io { path: path.to_path_buf(), source })
}

/// Scratch file used to measure candidate renders during the ratio search.
///
/// It sits next to `output` and shares its extension, so candidates are
/// encoded exactly as the final image will be.
pub fn search_scratch_path(output: &Path) -> PathBuf {
	let stem = output.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
	let ext = output.extension().and_then(|s| s.to_str()).unwrap_or("png");
	output.with_file_name(format!(".{}.search.{}", stem, ext))
}

/// One compression run, driven step by step.
///
/// The configuration is validated on construction and fixed from then on.
/// `compress` (or `compress_targeted`) must run before `save` and `form_gif`.
#[derive(Debug)]
pub struct Compression {
	config: CompressionConfig,
	input: Option<Rc<RgbImage>>,
	tree: Option<QuadTree>,
	output: Option<RgbImage>,
	search: Option<SearchOutcome>,
	stats: Option<CompressionStats>,
}

impl Compression {
	pub fn new(config: CompressionConfig) -> Result<Self, ConfigError> {
		config.validate()?;
		Ok(Compression {
			config,
			input: None,
			tree: None,
			output: None,
			search: None,
			stats: None,
		})
	}

	pub fn config(&self) -> &CompressionConfig {
		&self.config
	}

	/// The final tree, once compressed.
	pub fn tree(&self) -> Option<&QuadTree> {
		self.tree.as_ref()
	}

	/// The rendered output, once compressed.
	pub fn output(&self) -> Option<&RgbImage> {
		self.output.as_ref()
	}

	/// Outcome of the ratio search, if one ran.
	pub fn search_outcome(&self) -> Option<&SearchOutcome> {
		self.search.as_ref()
	}

	/// Sizes and tree shape, once saved.
	pub fn stats(&self) -> Option<&CompressionStats> {
		self.stats.as_ref()
	}

	fn load_input(&mut self) -> Result<Rc<RgbImage>, CompressionError> {
		if let Some(ref img) = self.input {
			return Ok(Rc::clone(img));
		}
		let img = Rc::new(pixels::load(&self.config.input)?);
		info!(path = %self.config.input.display(), width = img.width(), height = img.height(), "loaded input");
		self.input = Some(Rc::clone(&img));
		Ok(img)
	}

	/// Builds an exhaustively divided tree at `threshold` and renders it.
	fn build(&mut self, threshold: f64) -> Result<(), CompressionError> {
		let img = self.load_input()?;
		let mut tree = QuadTree::new(img, self.config.tree_params(threshold))?;
		tree.divide_exhaust()?;
		info!(
			method = %self.config.method,
			threshold,
			depth = tree.tree_depth(),
			nodes = tree.node_count(),
			"divided"
		);
		self.output = Some(tree.merge(-1, false)?);
		self.tree = Some(tree);
		Ok(())
	}

	/// Compresses at the configured error threshold.
	pub fn compress(&mut self) -> Result<(), CompressionError> {
		self.build(self.config.threshold)
	}

	/// Compresses at whatever threshold brings the encoded size closest to
	/// the configured target ratio.
	///
	/// One tree is divided as finely as the minimum block area allows and
	/// re-rendered at each candidate threshold; the chosen threshold is then
	/// used to build the final tree from scratch.
	pub fn compress_targeted(&mut self) -> Result<(), CompressionError> {
		let original_size = file_size(&self.config.input)?;
		if original_size == 0 {
			return Err(CompressionError::ZeroOriginalSize);
		}
		let img = self.load_input()?;
		let method = self.config.method;
		let mut reference = QuadTree::new(img, self.config.tree_params(method.finest_threshold()))?;
		reference.divide_exhaust()?;

		let strategy = self.config.search.unwrap_or_else(|| SearchStrategy::for_method(method));
		let params = SearchParams::for_method(method, self.config.target_ratio);
		let axis = ThresholdAxis::from_scores(method, reference.branch_errors());
		let scratch = search_scratch_path(&self.config.output);
		info!(
			?strategy,
			target_ratio = self.config.target_ratio,
			reference_nodes = reference.node_count(),
			thresholds = axis.knot_count(),
			"searching for threshold"
		);

		let outcome = with_scratch(&scratch, || {
			let mut objective = |threshold: f64| -> Result<f64, CompressionError> {
				let candidate = reference.merge_threshold(threshold, false)?;
				pixels::save(&candidate, &scratch)?;
				let size = file_size(&scratch)?;
				let ratio = compression_ratio(original_size, size)?;
				debug!(threshold, size, ratio, "evaluated candidate");
				Ok(ratio)
			};
			match strategy {
				SearchStrategy::Bisection => search::bisect(&mut objective, &axis, &params),
				SearchStrategy::GradientDescent => search::descend(&mut objective, &axis, &params),
			}
		})?;
		info!(
			threshold = outcome.threshold,
			ratio = ?outcome.ratio,
			evaluations = outcome.evaluations,
			converged = outcome.converged,
			"search finished"
		);
		self.search = Some(outcome);
		self.build(outcome.threshold)
	}

	/// Writes the compressed image and records the resulting sizes.
	pub fn save(&mut self) -> Result<&CompressionStats, CompressionError> {
		let (output, tree) = match (&self.output, &self.tree) {
			(Some(output), Some(tree)) => (output, tree),
			_ => return Err(CompressionError::NotCompressed("save")),
		};
		let original_size = file_size(&self.config.input)?;
		pixels::save(output, &self.config.output)?;
		let compressed_size = file_size(&self.config.output)?;
		let stats = CompressionStats {
			original_size,
			compressed_size,
			ratio: compression_ratio(original_size, compressed_size)?,
			tree_depth: tree.tree_depth(),
			node_count: tree.node_count(),
			threshold: tree.params().threshold,
		};
		info!(path = %self.config.output.display(), compressed_size, ratio = stats.ratio, "saved");
		Ok(self.stats.insert(stats))
	}

	/// Writes an animation stepping through the merge depths of the final
	/// tree, block borders drawn, ending on the finished image.
	pub fn form_gif(&mut self) -> Result<(), CompressionError> {
		let path = self.config.gif.clone().ok_or(CompressionError::NoGifPath)?;
		let tree = self.tree.as_mut().ok_or(CompressionError::NotCompressed("form an animation"))?;
		let (width, height) = tree.image().dimensions();
		let mut writer = GifWriter::create(&path, width, height)?;
		for depth in 1..tree.tree_depth() {
			writer.push(&tree.merge(depth as i32, true)?, FRAME_DELAY)?;
		}
		writer.push(&tree.merge(-1, false)?, FINAL_FRAME_DELAY)?;
		writer.finish()?;
		info!(path = %path.display(), frames = tree.tree_depth(), "wrote animation");
		Ok(())
	}
}

/// Runs `search`, then removes the scratch file at `path` whether or not
/// the search succeeded. A search error takes precedence over a failed
/// removal.
fn with_scratch<T, F>(path: &Path, search: F) -> Result<T, CompressionError>
where
	F: FnOnce() -> Result<T, CompressionError>,
{
	let result = search();
	match (result, remove_scratch(path)) {
		(Ok(value), Ok(())) => Ok(value),
		(Ok(_), Err(e)) => Err(e),
		(Err(e), cleanup) => {
			if let Err(cleanup) = cleanup {
				warn!(error = %cleanup, "scratch file left behind");
			}
			Err(e)
		}
	}
}

fn remove_scratch(path: &Path) -> Result<(), CompressionError> {
	match fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
		Err(source) => Err(CompressionError::Cleanup { path: path.to_path_buf(), source }),
	}
}
