//! Lossy image compression by quadtree decomposition.
//!
//! An image is split into quadrants, recursively, until each block is
//! uniform enough under the chosen [`ErrorMethod`] or too small to split.
//! Rendering paints every selected block with its average colour. A
//! [`Compression`] run can also search for the threshold that hits a
//! target reduction in encoded file size.

pub mod animation;
pub mod compression;
pub mod node;
pub mod search;

pub use node::*;

pub use compression::{Compression, CompressionConfig, CompressionError, CompressionStats};
pub use node::metric::ErrorMethod;
pub use node::tree::{QuadTree, TreeParams};
pub use search::SearchStrategy;
