//! H5J container layout on top of HDF5.
//!
//! ```text
//! /                      attrs: image_size f64[3], voxel_size f64[3], unit
//! /Channels              attrs: width, height, frames, pad_right, pad_bottom (i64),
//!                               spcx, spcy, spcz (f64), unit
//! /Channels/Channel_<c>  i8[]: encoded stream of channel c
//! ```
//!
//! Streams are stored as signed bytes to match files written by the Fiji
//! plugin; HDF5 would clamp values above 127 if a reader requested int8 from
//! a uint8 dataset.

use hdf5::types::VarLenUnicode;
use hdf5::{File, Group, Location};
use log::{debug, info};
use std::path::Path;
use std::str::FromStr;

use crate::encode::EncodedChannel;
use crate::error::ContainerWriteError;
use crate::geometry::PaddedGeometry;
use crate::stack::VoxelSize;

pub const CHANNELS_GROUP: &str = "Channels";

/// Dataset path for channel `c`.
pub fn channel_path(channel: usize) -> String {
    format!("/{}/Channel_{}", CHANNELS_GROUP, channel)
}

/// Global container metadata, written once per file.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerMetadata {
    /// Padded frame width.
    pub width: i64,
    /// Padded frame height.
    pub height: i64,
    pub frames: i64,
    pub pad_right: i64,
    pub pad_bottom: i64,
    /// Physical extent of the unpadded volume.
    pub image_size: [f64; 3],
    pub voxel_size: [f64; 3],
    pub unit: String,
    pub channels: usize,
}

impl ContainerMetadata {
    pub fn new(
        geometry: &PaddedGeometry,
        frames: usize,
        channels: usize,
        voxel: VoxelSize,
        unit: &str,
    ) -> Self {
        Self {
            width: geometry.scaled_width as i64,
            height: geometry.scaled_height as i64,
            frames: frames as i64,
            pad_right: geometry.pad_right() as i64,
            pad_bottom: geometry.pad_bottom() as i64,
            image_size: [
                geometry.width as f64 * voxel.x,
                geometry.height as f64 * voxel.y,
                frames as f64 * voxel.z,
            ],
            voxel_size: [voxel.x, voxel.y, voxel.z],
            unit: unit.to_string(),
            channels,
        }
    }
}

/// Sequential writer for one H5J file.
///
/// Channels must be written in ascending index order; the file is flushed
/// and closed by `finish`.
pub struct ContainerWriter {
    file: File,
    channels: Group,
    expected: usize,
    written: usize,
}

impl ContainerWriter {
    /// Replace any file at `path` and write the global metadata.
    pub fn create(path: &Path, metadata: &ContainerMetadata) -> Result<Self, ContainerWriteError> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|source| ContainerWriteError::Replace {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let file = File::create(path)?;
        set_attr_f64_array(&file, "image_size", &metadata.image_size)?;
        set_attr_f64_array(&file, "voxel_size", &metadata.voxel_size)?;
        set_attr_str(&file, "unit", &metadata.unit)?;

        let channels = file.create_group(CHANNELS_GROUP)?;
        set_attr_i64(&channels, "width", metadata.width)?;
        set_attr_i64(&channels, "height", metadata.height)?;
        set_attr_i64(&channels, "frames", metadata.frames)?;
        set_attr_i64(&channels, "pad_right", metadata.pad_right)?;
        set_attr_i64(&channels, "pad_bottom", metadata.pad_bottom)?;
        set_attr_f64(&channels, "spcx", metadata.voxel_size[0])?;
        set_attr_f64(&channels, "spcy", metadata.voxel_size[1])?;
        set_attr_f64(&channels, "spcz", metadata.voxel_size[2])?;
        set_attr_str(&channels, "unit", &metadata.unit)?;

        debug!(
            "Created {} ({}x{} padded, {} frames, {} channels)",
            path.display(),
            metadata.width,
            metadata.height,
            metadata.frames,
            metadata.channels
        );

        Ok(Self {
            file,
            channels,
            expected: metadata.channels,
            written: 0,
        })
    }

    /// Store one channel's stream; consumes the buffer.
    pub fn write_channel(&mut self, channel: EncodedChannel) -> Result<(), ContainerWriteError> {
        if channel.channel != self.written || channel.channel >= self.expected {
            return Err(ContainerWriteError::ChannelOrder {
                expected: self.written,
                found: channel.channel,
            });
        }

        let name = format!("Channel_{}", channel.channel);
        let bytes: &[i8] = bytemuck::cast_slice(&channel.data);
        let dataset = self
            .channels
            .new_dataset::<i8>()
            .shape(bytes.len())
            .create(name.as_str())?;
        dataset.write_raw(bytes)?;
        self.written += 1;

        info!(
            "{}: encoded channel is {} bytes",
            channel_path(channel.channel),
            bytes.len()
        );
        Ok(())
    }

    /// Flush and close; fails if channels are missing.
    pub fn finish(self) -> Result<(), ContainerWriteError> {
        if self.written != self.expected {
            return Err(ContainerWriteError::MissingChannels {
                expected: self.expected,
                written: self.written,
            });
        }
        self.file.flush()?;
        drop(self.channels);
        self.file.close()?;
        Ok(())
    }
}

/// Write a complete container in one call.
pub fn write_container(
    path: &Path,
    metadata: &ContainerMetadata,
    channels: Vec<EncodedChannel>,
) -> Result<(), ContainerWriteError> {
    let mut writer = ContainerWriter::create(path, metadata)?;
    for channel in channels {
        writer.write_channel(channel)?;
    }
    writer.finish()
}

/// Read back the global metadata of an H5J file.
pub fn read_metadata(path: &Path) -> Result<ContainerMetadata, ContainerWriteError> {
    let file = File::open(path)?;
    let channels = file.group(CHANNELS_GROUP)?;
    let count = channels
        .member_names()?
        .iter()
        .filter(|name| name.starts_with("Channel_"))
        .count();

    Ok(ContainerMetadata {
        width: channels.attr("width")?.read_scalar()?,
        height: channels.attr("height")?.read_scalar()?,
        frames: channels.attr("frames")?.read_scalar()?,
        pad_right: channels.attr("pad_right")?.read_scalar()?,
        pad_bottom: channels.attr("pad_bottom")?.read_scalar()?,
        image_size: read_attr_f64_array(&file, "image_size")?,
        voxel_size: read_attr_f64_array(&file, "voxel_size")?,
        unit: file.attr("unit")?.read_scalar::<VarLenUnicode>()?.to_string(),
        channels: count,
    })
}

/// Read back the encoded stream of one channel.
pub fn read_channel(path: &Path, channel: usize) -> Result<Vec<u8>, ContainerWriteError> {
    let file = File::open(path)?;
    let data = file.dataset(&channel_path(channel))?.read_raw::<i8>()?;
    Ok(bytemuck::cast_slice(&data).to_vec())
}

fn set_attr_i64(location: &Location, name: &str, value: i64) -> Result<(), ContainerWriteError> {
    location.new_attr::<i64>().create(name)?.write_scalar(&value)?;
    Ok(())
}

fn set_attr_f64(location: &Location, name: &str, value: f64) -> Result<(), ContainerWriteError> {
    location.new_attr::<f64>().create(name)?.write_scalar(&value)?;
    Ok(())
}

fn set_attr_f64_array(
    location: &Location,
    name: &str,
    values: &[f64; 3],
) -> Result<(), ContainerWriteError> {
    location
        .new_attr::<f64>()
        .shape(values.len())
        .create(name)?
        .write_raw(&values[..])?;
    Ok(())
}

fn set_attr_str(location: &Location, name: &'static str, value: &str) -> Result<(), ContainerWriteError> {
    let value = VarLenUnicode::from_str(value).map_err(|e| ContainerWriteError::Attribute {
        name,
        reason: e.to_string(),
    })?;
    location
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn read_attr_f64_array(location: &Location, name: &'static str) -> Result<[f64; 3], ContainerWriteError> {
    let values = location.attr(name)?.read_raw::<f64>()?;
    values
        .try_into()
        .map_err(|v: Vec<f64>| ContainerWriteError::Attribute {
            name,
            reason: format!("expected 3 values, found {}", v.len()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn metadata(channels: usize) -> ContainerMetadata {
        ContainerMetadata::new(
            &PaddedGeometry::new(10, 10),
            3,
            channels,
            VoxelSize { x: 0.5, y: 0.5, z: 2.0 },
            "micron",
        )
    }

    fn encoded(channel: usize, len: usize) -> EncodedChannel {
        EncodedChannel {
            channel,
            data: (0..len).map(|i| (i * 37 % 256) as u8).collect(),
        }
    }

    #[test]
    fn test_metadata_from_geometry() {
        let meta = metadata(2);
        assert_eq!((meta.width, meta.height), (16, 16));
        assert_eq!((meta.pad_right, meta.pad_bottom), (6, 6));
        assert_eq!(meta.frames, 3);
        assert_eq!(meta.image_size, [5.0, 5.0, 6.0]);
    }

    #[test]
    fn test_roundtrip_structure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roundtrip.h5j");
        let meta = metadata(2);

        write_container(&path, &meta, vec![encoded(0, 300), encoded(1, 17)]).unwrap();

        let loaded = read_metadata(&path).unwrap();
        assert_eq!(loaded, meta);

        // bytes above 127 survive the int8 storage
        assert_eq!(read_channel(&path, 0).unwrap(), encoded(0, 300).data);
        assert_eq!(read_channel(&path, 1).unwrap().len(), 17);
    }

    #[test]
    fn test_legacy_channel_attrs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("attrs.h5j");
        write_container(&path, &metadata(1), vec![encoded(0, 4)]).unwrap();

        let file = File::open(&path).unwrap();
        let channels = file.group("Channels").unwrap();
        assert_eq!(channels.attr("spcz").unwrap().read_scalar::<f64>().unwrap(), 2.0);
        let unit: VarLenUnicode = channels.attr("unit").unwrap().read_scalar().unwrap();
        assert_eq!(unit.as_str(), "micron");
    }

    #[test]
    fn test_existing_file_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.h5j");
        std::fs::write(&path, b"not an hdf5 file").unwrap();

        write_container(&path, &metadata(1), vec![encoded(0, 8)]).unwrap();
        assert_eq!(read_metadata(&path).unwrap().channels, 1);
    }

    #[test]
    fn test_out_of_order_channel_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("order.h5j");
        let mut writer = ContainerWriter::create(&path, &metadata(2)).unwrap();
        let err = writer.write_channel(encoded(1, 8)).unwrap_err();
        assert!(matches!(err, ContainerWriteError::ChannelOrder { expected: 0, found: 1 }));
    }

    #[test]
    fn test_missing_channels_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.h5j");
        let mut writer = ContainerWriter::create(&path, &metadata(2)).unwrap();
        writer.write_channel(encoded(0, 8)).unwrap();
        assert!(matches!(
            writer.finish(),
            Err(ContainerWriteError::MissingChannels { expected: 2, written: 1 })
        ));
    }
}
