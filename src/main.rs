use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use quadtree_compress::{Compression, CompressionConfig, ErrorMethod, SearchStrategy};

/// Compresses an image by averaging the blocks of a quadtree.
///
/// Exits with status 1 on invalid arguments or any failure while
/// compressing; the reason is printed to stderr.
#[derive(Parser, Debug)]
#[command(name = "quadtree_compress", version, author = "vkcz")]
struct Args {
	/// Image to compress
	input: PathBuf,
	/// Where to write the result (.jpg, .jpeg, .png or .bmp)
	output: PathBuf,
	/// How block uniformity is measured
	#[arg(short, long, value_enum, default_value_t = ErrorMethod::Variance)]
	method: ErrorMethod,
	/// Blocks scoring at or under this (at or over, for ssim) are not split
	#[arg(short, long, default_value_t = 0., allow_negative_numbers = true)]
	threshold: f64,
	/// Smallest block area, in pixels, that may result from a split
	#[arg(short = 'a', long, default_value_t = 1)]
	min_area: u64,
	/// Search for the threshold that shrinks the file by this share (0 to 1); 0 disables
	#[arg(short = 'r', long, default_value_t = 0.)]
	target_ratio: f64,
	/// Also write a GIF stepping through the tree depths
	#[arg(short, long)]
	gif: Option<PathBuf>,
	/// Search strategy for --target-ratio; defaults by method
	#[arg(short, long, value_enum)]
	search: Option<SearchStrategy>,
	/// Log every search evaluation
	#[arg(short, long)]
	verbose: bool,
}

fn main() {
	let args = Args::parse();

	let default_level = if args.verbose { "debug" } else { "info" };
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(default_level));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.init();

	if let Err(e) = run(args) {
		eprintln!("[Error] {:#}", e);
		std::process::exit(1);
	}
}

fn run(args: Args) -> anyhow::Result<()> {
	let config = CompressionConfig {
		input: args.input,
		output: args.output,
		gif: args.gif,
		method: args.method,
		threshold: args.threshold,
		min_block_area: args.min_area,
		target_ratio: args.target_ratio,
		search: args.search,
	};
	let targeted = config.target_ratio > 0.;
	let mut compression = Compression::new(config).context("invalid parameters")?;

	let started = Instant::now();
	if targeted {
		compression.compress_targeted().context("targeted compression failed")?;
	} else {
		compression.compress().context("compression failed")?;
	}
	let elapsed = started.elapsed();

	let stats = *compression.save().context("saving failed")?;
	if compression.config().gif.is_some() {
		compression.form_gif().context("writing the animation failed")?;
	}

	println!("------------------------------------------------------------");
	println!("Compression execution time: {}ms", elapsed.as_millis());
	println!("Image size before compression: {} bytes", stats.original_size);
	println!("Image size after compression: {} bytes", stats.compressed_size);
	println!("Compression percentage: {:.2}%", 100. * stats.ratio);
	if targeted {
		println!("Selected error threshold: {}", stats.threshold);
	}
	println!("Tree depth: {}", stats.tree_depth);
	println!("Number of nodes: {}", stats.node_count);
	Ok(())
}
