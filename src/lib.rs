//! H5J writer library
//!
//! Packs each channel of a volumetric stack into padded frames, encodes them
//! as HEVC and stores the streams with their metadata in an HDF5 container.

pub mod cli;
pub mod config;
pub mod container;
pub mod encode;
pub mod error;
pub mod geometry;
pub mod pack;
pub mod progress;
pub mod stack;
pub mod workers;
pub mod writer;

pub use config::{EncoderTuning, IntensityMap, SaveOptions};
pub use container::{ContainerMetadata, ContainerWriter, write_container};
pub use encode::{ChannelEncoder, EncodedChannel, EncoderConfig, FrameEncoder};
pub use error::{ContainerWriteError, EncodeError, FramePackError, SaveError};
pub use geometry::PaddedGeometry;
pub use stack::{BitDepth, ImageStack, Plane, VolumeStack, VoxelSize};
pub use writer::{SaveProgress, SaveStage, save, save_movie, save_stack};
