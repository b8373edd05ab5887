#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::env;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;
use unfound::{
    CacheStatsSnapshot, DrainMode, Event, EventMask, OwnerId, Unfound, UnfoundConfig,
};

const BENCH_FILE: &str = "/testfile";
const BENCH_CHUNK: usize = 4096;
const SCATTERED_READS: usize = 100;
const SCATTER_STRIDE: usize = 7919;

#[derive(Debug, Serialize)]
struct PassReport {
    bytes: u64,
    seconds: f64,
    mib_per_sec: f64,
    cache: CacheStatsSnapshot,
    hit_rate: f64,
}

#[derive(Debug, Serialize)]
struct BenchReport {
    file_size: usize,
    sequential: PassReport,
    scattered: PassReport,
    total: CacheStatsSnapshot,
}

#[derive(Debug, Serialize)]
struct DemoReport {
    watched: PathBuf,
    mask: u32,
    file: PathBuf,
    events: Vec<Event>,
}

fn main() {
    init_tracing();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();
    let json = rest.iter().any(|arg| arg == "--json");

    match command.as_str() {
        "cache-bench" => {
            let config = load_config(&rest)?;
            let size = match flag_value(&rest, "--size")? {
                Some(raw) => raw
                    .parse::<usize>()
                    .with_context(|| format!("invalid --size value: {raw}"))?,
                None => 1024 * 1024,
            };
            cache_bench(config, size, json)
        }
        "notify-demo" => {
            let config = load_config(&rest)?;
            let mask = match flag_value(&rest, "--mask")? {
                Some(raw) => parse_mask(raw)?,
                None => EventMask::CREATE | EventMask::MODIFY | EventMask::DELETE,
            };
            notify_demo(config, mask, json)
        }
        "config" => {
            let config = load_config(&rest)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("serialize config")?
            );
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("unfound\n");
    println!("USAGE:");
    println!("  unfound cache-bench [--config <path>] [--size <bytes>] [--json]");
    println!("  unfound notify-demo [--config <path>] [--mask <kinds>] [--json]");
    println!("  unfound config [--config <path>]");
    println!();
    println!("<kinds> is a comma-separated list of create, modify, delete, access, rename, all.");
    println!("Logging is controlled by RUST_LOG (e.g. RUST_LOG=uf::cache=debug).");
}

/// Value following `flag`, if the flag is present.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Result<Option<&'a str>> {
    let Some(pos) = args.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    match args.get(pos + 1) {
        Some(value) if !value.starts_with("--") => Ok(Some(value)),
        _ => bail!("{flag} requires a value"),
    }
}

fn load_config(args: &[String]) -> Result<UnfoundConfig> {
    let config = match flag_value(args, "--config")? {
        Some(path) => UnfoundConfig::load(Path::new(path))
            .with_context(|| format!("failed to load config from {path}"))?,
        None => UnfoundConfig::default(),
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn parse_mask(raw: &str) -> Result<EventMask> {
    match EventMask::from_names(raw) {
        Some(mask) if !mask.is_empty() => Ok(mask),
        Some(_) => bail!("--mask selects no event kinds"),
        None => bail!("invalid --mask value: {raw}"),
    }
}

fn bench_byte(offset: usize) -> u8 {
    (offset.wrapping_mul(131) >> 3) as u8
}

fn pass_report(bytes: u64, elapsed: Duration, cache: CacheStatsSnapshot) -> PassReport {
    let seconds = elapsed.as_secs_f64();
    let mib = bytes as f64 / (1024.0 * 1024.0);
    PassReport {
        bytes,
        seconds,
        mib_per_sec: if seconds > 0.0 { mib / seconds } else { 0.0 },
        hit_rate: cache.hit_rate(),
        cache,
    }
}

fn cache_bench(config: UnfoundConfig, size: usize, json: bool) -> Result<()> {
    if size == 0 {
        bail!("--size must be > 0");
    }
    let system = Unfound::start(config).context("failed to start")?;
    let ns = system.namespace();
    let path = Path::new(BENCH_FILE);

    let data: Vec<u8> = (0..size).map(bench_byte).collect();
    ns.write_file(path, &data)
        .with_context(|| format!("failed to write {BENCH_FILE}"))?;
    ns.sync().context("failed to sync test file")?;
    info!(event = "bench_file_ready", size);

    // Sequential pass.
    let handle = ns.open(path).context("open for sequential pass")?;
    let mut buf = vec![0_u8; BENCH_CHUNK];
    let before = system.stats();
    let started = Instant::now();
    let mut total = 0_u64;
    loop {
        let n = ns.read(handle, &mut buf).context("sequential read")?;
        if n == 0 {
            break;
        }
        total += n as u64;
    }
    let sequential = pass_report(total, started.elapsed(), system.stats().since(&before));
    ns.close(handle).context("close after sequential pass")?;
    if total != size as u64 {
        bail!("sequential pass read {total} bytes, expected {size}");
    }

    // Scattered pass.
    let handle = ns.open(path).context("open for scattered pass")?;
    let before = system.stats();
    let started = Instant::now();
    let mut total = 0_u64;
    for i in 0..SCATTERED_READS {
        let offset = (i * SCATTER_STRIDE) % size;
        ns.seek(handle, SeekFrom::Start(offset as u64))
            .context("seek")?;
        let n = ns.read(handle, &mut buf).context("scattered read")?;
        if buf[..n].iter().enumerate().any(|(j, b)| *b != bench_byte(offset + j)) {
            bail!("data mismatch at offset {offset}");
        }
        total += n as u64;
    }
    let scattered = pass_report(total, started.elapsed(), system.stats().since(&before));
    ns.close(handle).context("close after scattered pass")?;

    let report = BenchReport {
        file_size: size,
        sequential,
        scattered,
        total: system.stats(),
    };
    system.shutdown().context("shutdown")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        println!("UCache benchmark ({} bytes, {BENCH_CHUNK}-byte reads)", report.file_size);
        for (name, pass) in [("sequential", &report.sequential), ("scattered", &report.scattered)] {
            println!(
                "{name:>10}: {} bytes in {:.3} ms, {:.1} MiB/s, hit rate {:.1}% ({} hits, {} misses)",
                pass.bytes,
                pass.seconds * 1000.0,
                pass.mib_per_sec,
                pass.hit_rate * 100.0,
                pass.cache.hits,
                pass.cache.misses
            );
        }
        let t = &report.total;
        println!(
            "     total: evictions={} write_backs={} prefetch issued={} completed={} dropped={} failed={}",
            t.evictions,
            t.write_backs,
            t.prefetch_issued,
            t.prefetch_completed,
            t.prefetch_dropped,
            t.prefetch_failed
        );
    }
    Ok(())
}

fn notify_demo(config: UnfoundConfig, mask: EventMask, json: bool) -> Result<()> {
    let system = Unfound::start(config).context("failed to start")?;
    let ns = system.namespace();
    let watched = PathBuf::from("/tmp");
    let file = watched.join("test.txt");

    ns.mkdir(&watched).context("mkdir /tmp")?;
    let wd = system
        .add_watch(&watched, mask, OwnerId(1))
        .context("add watch")?;

    let handle = ns.create(&file).context("create test file")?;
    ns.write(handle, b"Hello, UNotify!").context("write test file")?;
    ns.close(handle).context("close test file")?;

    let events = system
        .notify()
        .drain_events(wd, 10, DrainMode::Timeout(Duration::from_secs(1)))
        .context("drain events")?;
    system.notify().remove_watch(wd).context("remove watch")?;
    system.shutdown().context("shutdown")?;

    let report = DemoReport {
        watched,
        mask: mask.bits(),
        file,
        events,
    };
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        println!("watching {}", report.watched.display());
        for event in &report.events {
            println!("  {event}");
        }
        println!("{} event(s)", report.events.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn flag_value_parsing() {
        let a = args(&["--config", "c.json", "--json"]);
        assert_eq!(flag_value(&a, "--config").expect("ok"), Some("c.json"));
        assert_eq!(flag_value(&a, "--size").expect("ok"), None);
        assert!(flag_value(&args(&["--config"]), "--config").is_err());
        assert!(flag_value(&args(&["--config", "--json"]), "--config").is_err());
    }

    #[test]
    fn default_config_loads_without_flag() {
        let config = load_config(&[]).expect("defaults");
        assert_eq!(config, UnfoundConfig::default());
    }

    #[test]
    fn mask_flag_parsing() {
        assert_eq!(
            parse_mask("create,delete").expect("mask"),
            EventMask::CREATE | EventMask::DELETE
        );
        assert_eq!(parse_mask("all").expect("all"), EventMask::all());
        assert!(parse_mask("").is_err());
        assert!(parse_mask("create,chmod").is_err());
    }

    #[test]
    fn pass_report_handles_zero_elapsed() {
        let report = pass_report(4096, Duration::ZERO, CacheStatsSnapshot::default());
        assert!(report.mib_per_sec.abs() < f64::EPSILON);
        assert!(report.hit_rate.abs() < f64::EPSILON);
    }
}
