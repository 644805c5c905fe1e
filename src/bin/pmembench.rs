//! Purpose: Micro-benchmark for the copy/flush/drain path into a mapped pool region.
//! Role: Developer tool for trend tracking; not lab-grade profiling.
//! Invariants: Prints tab-separated microseconds (total, copy, flush, drain) to stdout.
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pmemstore::core::error::Error;
use pmemstore::core::memcpy::{copy_nodrain, streamable};
use pmemstore::core::pmem::{MapConfig, MappedFile};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum Strategy {
    /// Plain memmove-style copy, then flush + drain.
    Memmove,
    /// Non-temporal streaming copy (fences itself), then drain only.
    Streaming,
}

#[derive(Debug, Parser)]
#[command(name = "pmembench", about = "Copy/flush/drain micro-benchmark")]
struct Args {
    /// File backing the mapped region; defaults to a file in the temp dir.
    #[arg(long)]
    path: Option<PathBuf>,

    /// Mapped region size in MiB.
    #[arg(long, default_value_t = 256)]
    size_mib: u64,

    /// Copy strategy under test.
    #[arg(long, value_enum, default_value_t = Strategy::Streaming)]
    strategy: Strategy,

    /// Keep the backing file around after the run.
    #[arg(long)]
    keep: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Args::parse()) {
        eprintln!("pmembench: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Error> {
    let len = (args.size_mib as usize) << 20;
    let path = args
        .path
        .unwrap_or_else(|| std::env::temp_dir().join("pmembench.pool"));
    let _ = std::fs::remove_file(&path);

    let config = MapConfig::from_env();
    let mut mapped = MappedFile::create(&path, len as u64, 0o600, &config)?;
    info!(
        path = %path.display(),
        len,
        is_pmem = mapped.is_pmem(),
        strategy = ?args.strategy,
        "mapped benchmark region"
    );

    // Over-allocate so the source buffer can be pinned to 16-byte alignment.
    let mut backing = vec![0u8; len + 16];
    let offset = backing.as_ptr().align_offset(16);
    let src = &mut backing[offset..offset + len];
    src.fill(0xFF);

    let t0 = Instant::now();
    let dst = &mut mapped.as_mut_slice()[..len];
    match args.strategy {
        Strategy::Streaming if streamable(dst.as_ptr(), src.as_ptr(), len) => {
            copy_nodrain(dst, src);
        }
        _ => dst.copy_from_slice(src),
    }
    let t1 = Instant::now();

    // The streaming path has already fenced its stores.
    if args.strategy == Strategy::Memmove {
        mapped.flush(0, len);
    }
    let t2 = Instant::now();

    mapped.drain();
    let t3 = Instant::now();

    if mapped.as_slice()[..len] != src[..] {
        return Err(Error::new(pmemstore::core::error::ErrorKind::Internal)
            .with_path(&path)
            .with_message("copied region does not match the source buffer"));
    }

    let copy_us = (t1 - t0).as_micros();
    let flush_us = (t2 - t1).as_micros();
    let drain_us = (t3 - t2).as_micros();
    println!(
        "{}\t{}\t{}\t{}",
        copy_us + flush_us + drain_us,
        copy_us,
        flush_us,
        drain_us
    );

    drop(mapped);
    if !args.keep {
        let _ = std::fs::remove_file(&path);
    }
    Ok(())
}
