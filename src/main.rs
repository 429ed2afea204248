use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::thread;

use h5j::cli::Args;
use h5j::config::SaveOptions;
use h5j::container::read_metadata;
use h5j::error::SaveError;
use h5j::progress::ConsoleProgress;
use h5j::stack::{ImageStack, VolumeStack};
use h5j::writer::{SaveProgress, save_movie, save_stack};

fn init_logging(args: &Args) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path) = &args.log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!(
            "Logging to file: {} (level: {:?})",
            log_path.display(),
            log_level
        );
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    debug!("Command-line args: {:?}", args);

    let base = match &args.config {
        Some(path) => SaveOptions::from_json_file(path)?,
        None => SaveOptions::default(),
    };
    let options = args.apply_to(base).with_env_fallback();
    debug!("Save options: {:?}", options);

    let stack = VolumeStack::from_slice_globs(&args.channels, args.voxel_size(), &args.unit)
        .context("Failed to load slice images")?;

    if args.movie {
        save_movie(&stack, &args.output, &options)
            .with_context(|| format!("Failed to save movie {}", args.output.display()))?;
        info!("Wrote movie {}", args.output.display());
        return Ok(());
    }

    let progress = if args.quiet {
        None
    } else {
        Some(ConsoleProgress::new(stack.channels()).context("Invalid progress template")?)
    };

    let (tx, rx) = crossbeam_channel::unbounded::<SaveProgress>();
    let output = args.output.clone();

    let result = thread::scope(|scope| -> Result<Result<(), SaveError>> {
        let saver = thread::Builder::new()
            .name("h5j-save".into())
            .spawn_scoped(scope, || {
                let result = save_stack(&stack, &output, &options, Some(&tx));
                drop(tx);
                result
            })
            .context("Failed to spawn save thread")?;

        // Ends when the save thread drops the sender
        for update in rx.iter() {
            if let Some(bar) = &progress {
                bar.update(&update);
            }
        }

        match saver.join() {
            Ok(result) => Ok(result),
            Err(_) => Err(anyhow::anyhow!("Save thread panicked")),
        }
    })?;

    match result {
        Ok(()) => {
            if let Some(bar) = &progress {
                bar.finish("done");
            }
        }
        Err(e) => {
            if let Some(bar) = &progress {
                bar.abandon();
            }
            return Err(e).with_context(|| format!("Failed to save {}", args.output.display()));
        }
    }

    let meta = read_metadata(&args.output)?;
    info!(
        "Wrote {}: {} channels, {}x{} padded (+{} right, +{} bottom), {} frames",
        args.output.display(),
        meta.channels,
        meta.width,
        meta.height,
        meta.pad_right,
        meta.pad_bottom,
        meta.frames
    );
    Ok(())
}
