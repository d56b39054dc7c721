//! Pcap/pcap-ng parsing, indexing, slicing and flow search.

pub mod framing;
pub mod index;
pub mod search;
pub mod slicer;

pub use framing::{Block, BlockKind, FramingReader};
pub use index::{create_index, generate_slices, Envelope, Index, Section, Slot};
pub use search::{search, Protocol, SearchRequest};
pub use slicer::{Slice, SlicedReader};
