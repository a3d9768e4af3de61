pub mod error;
pub mod record;
pub mod codec;
pub mod catalog;
pub mod volume;
pub mod assemble;
pub mod frames;
pub mod config;
pub mod formats;
pub mod container;

pub use error::{OctError, Result};
pub use record::{DecodeError, Record, Schema, SchemaTable, Value};
pub use codec::{FloatLut, IntensityTransform};
pub use catalog::{CatalogEntry, ChunkCatalog};
pub use volume::{FundusImage, FundusPixels, Slice, SliceData, Volume, VolumeKey, VolumeMetadata};
pub use assemble::VolumeAssembler;
pub use frames::{Buffering, FrameBuffer, FrameGeometry};
pub use config::ReadOptions;
pub use container::{Container, FormatKind};
