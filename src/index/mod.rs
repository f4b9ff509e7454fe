//! Secondary indexes: ordered skip lists and the approximate
//! nearest-neighbour vector tree.

pub mod skiplist;
pub mod vector;

pub use skiplist::{IndexNode, Order};
