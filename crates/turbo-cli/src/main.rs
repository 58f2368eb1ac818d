// Thin command-line front end over turbo-core.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use turbo_core::config::DownloadOptions;
use turbo_core::engine::{DownloadOutcome, Downloader};

/// Parallel, resumable file downloader.
#[derive(Debug, Parser)]
#[command(name = "turbo", version, about)]
struct Args {
    /// Source URL.
    url: String,

    /// Destination file path.
    dest: PathBuf,

    /// Bytes per chunk.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    chunk_size: u64,

    /// Maximum parallel chunk transfers.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Retries per chunk before giving up.
    #[arg(long, default_value_t = 10)]
    retries: u32,

    /// Disable the resume manifest.
    #[arg(long)]
    no_resume: bool,

    /// Byte value used to preallocate the destination file.
    #[arg(long, default_value_t = 0)]
    fill_byte: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut options = DownloadOptions::new(args.url, args.dest);
    options.chunk_size = args.chunk_size;
    options.concurrency = args.concurrency;
    options.retry_count = args.retries;
    options.can_be_resumed = !args.no_resume;
    options.fill_file_byte = args.fill_byte;
    let save_on_interrupt = options.can_be_resumed;

    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::with_template(
        "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    )?);

    let progress_bar = bar.clone();
    let downloader = Downloader::new(options)
        .context("invalid download options")?
        .on_progress(move |downloaded, total, _plan| {
            if let Some(total) = total {
                progress_bar.set_length(total);
            }
            progress_bar.set_position(downloaded);
        });

    // Ctrl-C stops the transfer; the manifest survives so a rerun resumes.
    let handle = downloader.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.abort(save_on_interrupt);
        }
    });

    let outcome = downloader.download().await.context("download failed")?;
    bar.finish_and_clear();

    match outcome {
        DownloadOutcome::Completed => println!("done"),
        DownloadOutcome::Aborted if save_on_interrupt => {
            println!("aborted, progress saved for resume")
        }
        DownloadOutcome::Aborted => println!("aborted"),
    }
    Ok(())
}
