use clap::Parser;
use std::path::PathBuf;

use crate::config::{SaveOptions, parse_crf_list};
use crate::stack::VoxelSize;

const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Video:  playa-ffmpeg 8.0 (static)\n",
    "Target: ",
    std::env::consts::ARCH,
    "-",
    std::env::consts::OS
);

/// Encode image-slice stacks into H5J (HEVC channels in HDF5)
#[derive(Parser, Debug)]
#[command(name = "h5j", author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Output .h5j file, or movie file with --movie (replaced if it exists)
    #[arg(value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Slice files of one channel as a glob, e.g. "ch0/*.tif" (repeat per channel)
    #[arg(short = 'c', long = "channel", value_name = "GLOB", required = true)]
    pub channels: Vec<String>,

    /// Voxel spacing
    #[arg(long = "voxel", value_names = ["X", "Y", "Z"], num_args = 3)]
    pub voxel: Option<Vec<f64>>,

    /// Physical unit of the voxel spacing
    #[arg(long = "unit", value_name = "UNIT", default_value = "pixel")]
    pub unit: String,

    /// Packing/encoder thread cap; 0 = all cores (default: H5J_THREADS, else all cores)
    #[arg(short = 't', long = "threads", value_name = "N")]
    pub threads: Option<usize>,

    /// Per-channel CRF list, e.g. "15,20" (0..=51)
    #[arg(long = "crf", value_name = "LIST")]
    pub crf: Option<String>,

    /// FFmpeg encoder name
    #[arg(long = "codec", value_name = "NAME")]
    pub codec: Option<String>,

    /// HEVC preset (ultrafast..veryslow)
    #[arg(long = "preset", value_name = "PRESET")]
    pub preset: Option<String>,

    /// Write channels 0..2 as the RGB lanes of one movie; the container
    /// comes from the OUTPUT extension
    #[arg(long = "movie")]
    pub movie: bool,

    /// JSON file with save options; CLI flags take priority
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write log to file instead of stderr
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Hide the progress bar
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

impl Args {
    /// Voxel spacing from `--voxel`, unit spacing otherwise.
    pub fn voxel_size(&self) -> VoxelSize {
        match self.voxel.as_deref() {
            Some(&[x, y, z]) => VoxelSize { x, y, z },
            _ => VoxelSize::default(),
        }
    }

    /// Overlay CLI flags on `base` (config file or defaults).
    pub fn apply_to(&self, mut base: SaveOptions) -> SaveOptions {
        if let Some(threads) = self.threads {
            base.threads = Some(threads);
        }
        if let Some(raw) = &self.crf {
            base.crf = parse_crf_list(raw);
        }
        if let Some(codec) = &self.codec {
            base.codec = codec.clone();
        }
        if let Some(preset) = &self.preset {
            base.preset = preset.clone();
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_full_command_line() {
        let args = Args::try_parse_from([
            "h5j", "out.h5j", "-c", "a/*.png", "-c", "b/*.png", "--voxel", "0.5", "0.5", "2",
            "--crf", "10,200", "--threads", "3", "-vv",
        ])
        .unwrap();

        assert_eq!(args.channels, vec!["a/*.png", "b/*.png"]);
        assert_eq!(args.voxel_size(), VoxelSize { x: 0.5, y: 0.5, z: 2.0 });
        assert_eq!(args.verbosity, 2);

        let opts = args.apply_to(SaveOptions::default());
        assert_eq!(opts.crf, vec![10, 200]);
        assert_eq!(opts.threads, Some(3));
        assert_eq!(opts.codec, "libx265");
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::try_parse_from(["h5j", "o.h5j", "-c", "*.tif", "--preset", "fast"]).unwrap();
        let base = SaveOptions {
            preset: "slow".into(),
            threads: Some(2),
            ..Default::default()
        };
        let opts = args.apply_to(base);
        assert_eq!(opts.preset, "fast");
        assert_eq!(opts.threads, Some(2));
    }

    #[test]
    fn test_zero_threads_overrides_config() {
        let args = Args::try_parse_from(["h5j", "o.h5j", "-c", "*.tif", "--threads", "0"]).unwrap();
        let base = SaveOptions {
            threads: Some(2),
            ..Default::default()
        };
        let opts = args.apply_to(base).with_env_fallback();
        assert_eq!(opts.threads, Some(0));
        assert_eq!(opts.worker_count(), num_cpus::get().max(1));
        assert_eq!(opts.tuning_for(0, crate::stack::BitDepth::Eight).pools, None);
    }

    #[test]
    fn test_movie_flag() {
        let args = Args::try_parse_from(["h5j", "out.mp4", "-c", "*.png", "--movie"]).unwrap();
        assert!(args.movie);
        let args = Args::try_parse_from(["h5j", "out.h5j", "-c", "*.png"]).unwrap();
        assert!(!args.movie);
    }

    #[test]
    fn test_malformed_threads_rejected() {
        assert!(Args::try_parse_from(["h5j", "o.h5j", "-c", "*.tif", "-t", "lots"]).is_err());
    }

    #[test]
    fn test_channel_required() {
        assert!(Args::try_parse_from(["h5j", "o.h5j"]).is_err());
    }
}
