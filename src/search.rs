//! Searching for the error threshold that gives a target compression ratio.
//!
//! There is no closed form linking a threshold to the encoded size of the
//! render it produces, so both strategies treat the ratio as a black-box
//! function of the threshold and only ever sample it. The function is
//! supplied as a [`RatioObjective`], which lets the strategies run against
//! synthetic curves as well as against real encodes.

use tracing::{debug, warn};

use crate::node::metric::ErrorMethod;

/// Threshold-to-ratio function being searched.
pub trait RatioObjective {
	type Error;

	/// Measures the compression ratio reached at `threshold`.
	fn ratio(&mut self, threshold: f64) -> Result<f64, Self::Error>;
}

impl<F, E> RatioObjective for F
where
	F: FnMut(f64) -> Result<f64, E>,
{
	type Error = E;

	fn ratio(&mut self, threshold: f64) -> Result<f64, E> {
		self(threshold)
	}
}

/// How the threshold is searched for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum SearchStrategy {
	/// Halve a threshold bracket until it is narrow enough.
	Bisection,
	/// Follow the measured slope from several starting thresholds.
	#[value(name = "gradient")]
	GradientDescent,
}

impl SearchStrategy {
	/// Bisection relies on the ratio moving monotonically with the threshold,
	/// which holds well for the four score-like metrics. The bounded SSIM
	/// range is walked by slope instead.
	pub fn for_method(method: ErrorMethod) -> Self {
		if method.ascending() {
			SearchStrategy::Bisection
		} else {
			SearchStrategy::GradientDescent
		}
	}
}

/// Map from search positions in `[0, 1]` onto thresholds.
///
/// The axis runs piecewise linearly through its knots, which sit evenly
/// spaced in position. Two knots make a plain linear range. Built from the
/// scores of a divided tree, equal steps in position pass over equal
/// numbers of distinct scores, however those scores cluster within the
/// metric's full range. Position 0 is always the lowest threshold.
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdAxis {
	knots: Vec<f64>,
}

impl ThresholdAxis {
	pub fn linear(low: f64, high: f64) -> Self {
		debug_assert!(low <= high);
		ThresholdAxis { knots: vec![low, high] }
	}

	/// Axis through the distinct `scores` of a tree divided with `method`,
	/// extended to the method's finest threshold.
	///
	/// Only scores of split nodes move a threshold render, so those are the
	/// ones worth passing. With fewer than two distinct thresholds the
	/// method's whole range is used instead.
	pub fn from_scores<I>(method: ErrorMethod, scores: I) -> Self
	where
		I: IntoIterator<Item = f64>,
	{
		let mut knots: Vec<f64> = scores.into_iter()
			.filter(|s| s.is_finite() && *s >= 0.)
			.chain(std::iter::once(method.finest_threshold()))
			.collect();
		knots.sort_by(f64::total_cmp);
		knots.dedup();
		if knots.len() < 2 {
			let (low, high) = method.threshold_range();
			return ThresholdAxis::linear(low, high);
		}
		ThresholdAxis { knots }
	}

	pub fn low(&self) -> f64 {
		self.knots[0]
	}

	pub fn high(&self) -> f64 {
		self.knots[self.knots.len() - 1]
	}

	/// Number of knots, 2 for a linear axis.
	pub fn knot_count(&self) -> usize {
		self.knots.len()
	}

	/// Threshold at `position`, which is clamped to `[0, 1]`.
	pub fn threshold(&self, position: f64) -> f64 {
		let last = self.knots.len() - 1;
		let x = position.clamp(0., 1.) * last as f64;
		let i = (x.floor() as usize).min(last - 1);
		let (a, b) = (self.knots[i], self.knots[i + 1]);
		a + (x - i as f64) * (b - a)
	}
}

/// Tuning of a threshold search.
///
/// Lengths and tolerances along the threshold axis are in positions, so
/// they mean the same on every axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchParams {
	/// Compression ratio to approach, in `(0, 1]`.
	pub target: f64,
	/// Whether raising the threshold raises the ratio.
	pub ascending: bool,
	/// Evaluation cap for bisection.
	pub max_iterations: usize,
	/// Step cap per start for gradient descent; each step evaluates twice.
	pub steps_per_start: usize,
	/// Bisection stops once the bracket is narrower than this.
	pub bracket_tolerance: f64,
	/// Gradient descent stops once a ratio is this close to `target`.
	pub ratio_tolerance: f64,
	/// Starting positions for gradient descent.
	pub starts: &'static [f64],
	/// Forward-difference step.
	pub step: f64,
	/// Largest move per gradient step.
	pub max_move: f64,
}

impl SearchParams {
	pub fn for_method(method: ErrorMethod, target: f64) -> Self {
		SearchParams {
			target,
			ascending: method.ascending(),
			max_iterations: 20,
			steps_per_start: 8,
			bracket_tolerance: 1e-4,
			ratio_tolerance: 0.005,
			starts: &[0.25, 0.5, 0.75],
			step: 0.02,
			max_move: 0.25,
		}
	}

	/// Position of the threshold that merges the most.
	fn coarsest(&self) -> f64 {
		if self.ascending { 1. } else { 0. }
	}
}

/// Result of a threshold search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchOutcome {
	/// Best threshold found.
	pub threshold: f64,
	/// Ratio measured at `threshold`, unless it was never evaluated.
	pub ratio: Option<f64>,
	/// Number of objective evaluations.
	pub evaluations: usize,
	/// Whether the search met its stopping tolerance before its caps.
	pub converged: bool,
}

/// Bisects `axis` for the finest threshold whose ratio still reaches the
/// target.
///
/// If no sampled threshold reaches it, the coarsest end of the axis is
/// returned without a measured ratio.
pub fn bisect<O: RatioObjective>(
	objective: &mut O,
	axis: &ThresholdAxis,
	params: &SearchParams
) -> Result<SearchOutcome, O::Error> {
	let (mut low, mut high) = (0., 1.);
	let mut outcome = SearchOutcome {
		threshold: axis.threshold(params.coarsest()),
		ratio: None,
		evaluations: 0,
		converged: false,
	};

	while outcome.evaluations < params.max_iterations {
		if high - low <= params.bracket_tolerance {
			outcome.converged = true;
			break;
		}
		let mid = (low + high) / 2.;
		let threshold = axis.threshold(mid);
		let ratio = objective.ratio(threshold)?;
		outcome.evaluations += 1;
		debug!(threshold, ratio, low, high, "bisection step");

		let reached = ratio >= params.target;
		if reached {
			outcome.threshold = threshold;
			outcome.ratio = Some(ratio);
		}
		// Move towards finer blocks when the target is reached, coarser otherwise.
		if reached == params.ascending {
			high = mid;
		} else {
			low = mid;
		}
	}
	if !outcome.converged && high - low <= params.bracket_tolerance {
		outcome.converged = true;
	}
	if outcome.ratio.is_none() {
		warn!(target_ratio = params.target, "no sampled threshold reached the target ratio");
	}
	Ok(outcome)
}

/// Walks `axis` against the slope of `(ratio - target)^2` from each
/// configured start, keeping whichever sample lands closest to the target.
///
/// Each step measures the ratio at the current position and a little past
/// it, then moves by the damped Newton step `(ratio - target) * slope /
/// (slope^2 + damping)`, clamped to the axis. Where the two samples are
/// equal the curve gives no slope, so the walk heads towards finer or
/// coarser thresholds, whichever side the target lies on, with a move that
/// doubles for every flat step in a row. A start is abandoned once it is
/// pinned against an end of the axis, or after `steps_per_start`.
pub fn descend<O: RatioObjective>(
	objective: &mut O,
	axis: &ThresholdAxis,
	params: &SearchParams
) -> Result<SearchOutcome, O::Error> {
	const DAMPING: f64 = 0.01;

	let mut outcome = SearchOutcome {
		threshold: axis.threshold(params.coarsest()),
		ratio: None,
		evaluations: 0,
		converged: false,
	};
	let mut sample = |outcome: &mut SearchOutcome, u: f64| -> Result<f64, O::Error> {
		let threshold = axis.threshold(u);
		let ratio = objective.ratio(threshold)?;
		outcome.evaluations += 1;
		debug!(threshold, position = u, ratio, "gradient sample");
		let closer = outcome.ratio
			.map_or(true, |best| (ratio - params.target).abs() < (best - params.target).abs());
		if closer {
			outcome.threshold = threshold;
			outcome.ratio = Some(ratio);
		}
		if (ratio - params.target).abs() <= params.ratio_tolerance {
			outcome.converged = true;
		}
		Ok(ratio)
	};
	// Sign of the move that lowers the ratio.
	let finer = if params.ascending { 1. } else { -1. };

	for &start in params.starts {
		let mut u = start.clamp(0., 1.);
		let mut flat_move = params.step;
		for _ in 0..params.steps_per_start {
			let ratio = sample(&mut outcome, u)?;
			if outcome.converged {
				return Ok(outcome);
			}
			let ahead = if u + params.step <= 1. { u + params.step } else { u - params.step };
			let ahead_ratio = sample(&mut outcome, ahead)?;
			if outcome.converged {
				return Ok(outcome);
			}

			let slope = (ahead_ratio - ratio) / (ahead - u);
			let delta = if slope == 0. {
				flat_move = (flat_move * 2.).min(params.max_move);
				finer * (ratio - params.target).signum() * flat_move
			} else {
				flat_move = params.step;
				((ratio - params.target) * slope / (slope * slope + DAMPING))
					.clamp(-params.max_move, params.max_move)
			};
			let next = (u - delta).clamp(0., 1.);
			if (next - u).abs() < f64::EPSILON {
				break;
			}
			u = next;
		}
	}
	warn!(
		target_ratio = params.target,
		best = ?outcome.ratio,
		evaluations = outcome.evaluations,
		"gradient search ended without reaching the target tolerance"
	);
	Ok(outcome)
}
