//! Block homogeneity metrics.
//!
//! Every metric scores one colour channel of a block from its samples,
//! then folds the three channel scores into a single block score that the
//! division pass compares against the configured threshold.

use std::fmt;

/// `C2` stabilising constant of the structural similarity index, `(0.03 * 255)^2`.
pub const SSIM_C2: f64 = 0.0009 * 255. * 255.;

/// How the homogeneity of a block is measured.
///
/// Selected once from the configuration and passed down to every node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum ErrorMethod {
	/// Variance of the channel samples.
	Variance,
	/// Mean absolute deviation from the channel mean.
	#[value(name = "mad")]
	MeanAbsoluteDeviation,
	/// Difference between the brightest and darkest sample.
	#[value(name = "max-diff")]
	MaxPixelDifference,
	/// Shannon entropy (bits) of the sample histogram.
	Entropy,
	/// Variance-only structural similarity, `C2 / (variance + C2)`.
	///
	/// Unlike the other methods, a *larger* score means a more uniform block.
	Ssim,
}

impl ErrorMethod {
	/// Scores one channel of a block.
	///
	/// The iterator is cloned when a metric needs a second pass over the
	/// samples. An empty sequence scores 0 for every method.
	pub fn channel_error<I>(self, samples: I) -> f64
	where
		I: Iterator<Item = u8> + Clone,
	{
		match self {
			ErrorMethod::Variance => variance(samples),
			ErrorMethod::MeanAbsoluteDeviation => mean_absolute_deviation(samples),
			ErrorMethod::MaxPixelDifference => max_pixel_difference(samples),
			ErrorMethod::Entropy => entropy(samples),
			ErrorMethod::Ssim => {
				if samples.clone().next().is_none() {
					return 0.;
				}
				SSIM_C2 / (variance(samples) + SSIM_C2)
			}
		}
	}

	/// Folds the red, green and blue channel scores into one block score.
	pub fn aggregate(self, r: f64, g: f64, b: f64) -> f64 {
		match self {
			ErrorMethod::Ssim => 0.299 * r + 0.587 * g + 0.114 * b,
			_ => (r + g + b) / 3.,
		}
	}

	/// Whether higher scores mean a *less* uniform block.
	pub fn ascending(self) -> bool {
		self != ErrorMethod::Ssim
	}

	/// Whether `score` is homogeneous enough to stop splitting at `threshold`.
	pub fn is_below_threshold(self, score: f64, threshold: f64) -> bool {
		if self.ascending() {
			score <= threshold
		} else {
			score >= threshold
		}
	}

	/// Whether `threshold` can be used with this method at all.
	pub fn is_valid_threshold(self, threshold: f64) -> bool {
		if self.ascending() {
			threshold >= 0.
		} else {
			(-1. ..=1.).contains(&threshold)
		}
	}

	/// Largest block score this method can produce on 8-bit samples.
	pub fn max_error(self) -> f64 {
		match self {
			ErrorMethod::Variance => 127.5 * 127.5,
			ErrorMethod::MeanAbsoluteDeviation => 127.5,
			ErrorMethod::MaxPixelDifference => 255.,
			ErrorMethod::Entropy => 8.,
			ErrorMethod::Ssim => 1.,
		}
	}

	/// Every threshold that can change a render, from 0 to the largest score.
	pub fn threshold_range(self) -> (f64, f64) {
		(0., self.max_error())
	}

	/// The threshold that splits as far as the minimum block area allows.
	pub fn finest_threshold(self) -> f64 {
		if self.ascending() { 0. } else { 1. }
	}
}

impl Default for ErrorMethod {
	fn default() -> Self {
		ErrorMethod::Variance
	}
}

impl fmt::Display for ErrorMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			ErrorMethod::Variance => "variance",
			ErrorMethod::MeanAbsoluteDeviation => "mean absolute deviation",
			ErrorMethod::MaxPixelDifference => "max pixel difference",
			ErrorMethod::Entropy => "entropy",
			ErrorMethod::Ssim => "SSIM",
		})
	}
}

/// Var(X) = E[X^2] - E[X]^2
fn variance<I: Iterator<Item = u8>>(samples: I) -> f64 {
	let (count, sum, sum_sq) = samples.fold((0u64, 0u64, 0u64), |(n, s, sq), x| {
		let x = x as u64;
		(n + 1, s + x, sq + x * x)
	});
	if count == 0 {
		return 0.;
	}
	let mean = sum as f64 / count as f64;
	(sum_sq as f64 / count as f64 - mean * mean).max(0.)
}

/// MAD(X) = E[|X - E[X]|]
fn mean_absolute_deviation<I: Iterator<Item = u8> + Clone>(samples: I) -> f64 {
	let (count, sum) = samples.clone().fold((0u64, 0u64), |(n, s), x| (n + 1, s + x as u64));
	if count == 0 {
		return 0.;
	}
	let mean = sum as f64 / count as f64;
	samples.map(|x| (x as f64 - mean).abs()).sum::<f64>() / count as f64
}

fn max_pixel_difference<I: Iterator<Item = u8>>(samples: I) -> f64 {
	samples
		.fold(None, |range: Option<(u8, u8)>, x| match range {
			Some((lo, hi)) => Some((lo.min(x), hi.max(x))),
			None => Some((x, x)),
		})
		.map_or(0., |(lo, hi)| (hi - lo) as f64)
}

/// H = -sum(p * log2(p)) over the observed sample values.
fn entropy<I: Iterator<Item = u8>>(samples: I) -> f64 {
	let mut histogram = [0u64; 256];
	let mut count = 0u64;
	for x in samples {
		histogram[x as usize] += 1;
		count += 1;
	}
	if count == 0 {
		return 0.;
	}
	histogram.iter()
		.filter(|&&f| f > 0)
		.map(|&f| {
			let p = f as f64 / count as f64;
			-p * p.log2()
		})
		.sum()
}

#[cfg(test)]
mod tests {
	use super::*;

	const ALL: [ErrorMethod; 5] = [
		ErrorMethod::Variance,
		ErrorMethod::MeanAbsoluteDeviation,
		ErrorMethod::MaxPixelDifference,
		ErrorMethod::Entropy,
		ErrorMethod::Ssim,
	];

	fn score(method: ErrorMethod, data: &[u8]) -> f64 {
		method.channel_error(data.iter().copied())
	}

	#[test]
	fn empty_sequence_scores_zero() {
		for method in ALL.iter() {
			assert_eq!(score(*method, &[]), 0., "{}", method);
		}
	}

	#[test]
	fn reference_values() {
		assert_eq!(score(ErrorMethod::Variance, &[1, 1, 1, 1, 1]), 0.);
		assert!((score(ErrorMethod::Variance, &[1, 2, 3, 4, 5]) - 2.).abs() < 1e-12);
		assert!((score(ErrorMethod::MeanAbsoluteDeviation, &[0, 1, 2, 3, 4]) - 1.2).abs() < 1e-12);
		assert_eq!(score(ErrorMethod::MaxPixelDifference, &[0, 0, 0, 4, 8]), 8.);
		assert_eq!(score(ErrorMethod::Entropy, &[1, 1, 1, 1, 1]), 0.);
		assert!((score(ErrorMethod::Entropy, &[0, 0, 255, 255]) - 1.).abs() < 1e-12);
	}

	#[test]
	fn entropy_of_skewed_histogram() {
		// 13 zeros and 4 twos
		let mut data = vec![0u8; 13];
		data.extend_from_slice(&[2; 4]);
		let (p0, p2) = (13. / 17., 4. / 17.);
		let expected = -(p0 * f64::log2(p0) + p2 * f64::log2(p2));
		assert!((score(ErrorMethod::Entropy, &data) - expected).abs() < 1e-12);
	}

	#[test]
	fn ssim_is_one_for_flat_blocks_and_falls_with_variance() {
		assert_eq!(score(ErrorMethod::Ssim, &[9, 9, 9, 9]), 1.);
		let low = score(ErrorMethod::Ssim, &[100, 101, 102, 103]);
		let high = score(ErrorMethod::Ssim, &[0, 255, 0, 255]);
		assert!(low < 1. && high < low && high > 0.);
	}

	#[test]
	fn aggregation() {
		assert_eq!(ErrorMethod::Variance.aggregate(3., 6., 9.), 6.);
		assert_eq!(ErrorMethod::Entropy.aggregate(0., 0., 3.), 1.);
		let luma = ErrorMethod::Ssim.aggregate(1., 1., 1.);
		assert!((luma - 1.).abs() < 1e-12);
		assert!((ErrorMethod::Ssim.aggregate(1., 0., 0.) - 0.299).abs() < 1e-12);
	}

	#[test]
	fn threshold_polarity() {
		for method in ALL.iter().filter(|m| m.ascending()) {
			assert!(method.is_below_threshold(5., 5.));
			assert!(method.is_below_threshold(4.9, 5.));
			assert!(!method.is_below_threshold(5.1, 5.));
		}
		let ssim = ErrorMethod::Ssim;
		assert!(ssim.is_below_threshold(0.8, 0.8));
		assert!(ssim.is_below_threshold(0.9, 0.8));
		assert!(!ssim.is_below_threshold(0.7, 0.8));
	}

	#[test]
	fn threshold_validity() {
		assert!(ErrorMethod::Variance.is_valid_threshold(0.));
		assert!(ErrorMethod::Entropy.is_valid_threshold(1000.));
		assert!(!ErrorMethod::MaxPixelDifference.is_valid_threshold(-0.5));
		assert!(ErrorMethod::Ssim.is_valid_threshold(-1.));
		assert!(ErrorMethod::Ssim.is_valid_threshold(1.));
		assert!(!ErrorMethod::Ssim.is_valid_threshold(1.01));
		assert!(!ErrorMethod::Ssim.is_valid_threshold(-1.5));
	}

	#[test]
	fn extreme_thresholds() {
		for method in ALL.iter() {
			let (low, high) = method.threshold_range();
			let (worst, coarsest) = if method.ascending() { (high, high) } else { (low, low) };
			assert!(method.is_below_threshold(worst, coarsest));
			assert!(!method.is_below_threshold(0.5, method.finest_threshold()), "{}", method);
		}
	}
}
