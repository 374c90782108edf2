//! PCM Streamer - 多源采样率转换与混音
//!
//! - plan: 显示采样率对的质因数分解和缩放级
//! - render: 解码若干音频文件，各自转换到同一输出格式，按刷新节拍混音写出原始 PCM

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use pcm_streamer::audio::mixer::DEFAULT_TICKS_PER_SECOND;
use pcm_streamer::audio::{mix_into, RefillPacer, WaveFormat};
use pcm_streamer::decode::AudioDecoder;
use pcm_streamer::engine::{SourceConfig, StreamingSource};
use pcm_streamer::resample::ratio::{factorize, plan, reduce, Factor};

/// PCM Streamer - real-time PCM rate conversion and mixing
#[derive(Parser)]
#[command(name = "pcm-streamer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the conversion stages for a sample-rate pair
    Plan {
        /// Input sample rate
        from: u32,
        /// Output sample rate
        to: u32,
    },

    /// Decode, convert and mix audio files into raw PCM
    Render(RenderArgs),
}

#[derive(clap::Args)]
struct RenderArgs {
    /// Audio files to mix
    #[arg(value_name = "INPUT", required = true)]
    inputs: Vec<PathBuf>,

    /// Output file (raw interleaved little-endian PCM)
    #[arg(short, long)]
    output: PathBuf,

    /// Output sample rate
    #[arg(long, default_value_t = 48000)]
    rate: u32,

    /// Output channel count (1 or 2)
    #[arg(long, default_value_t = 2)]
    channels: u16,

    /// Output bit depth (8 or 16)
    #[arg(long, default_value_t = 16)]
    bits: u16,

    /// Loop every input
    #[arg(long)]
    looped: bool,

    /// Stop after this many seconds of output
    #[arg(long)]
    seconds: Option<f64>,

    /// Convert on the feeder threads instead of the background workers
    #[arg(long)]
    sync: bool,

    /// Pace refill ticks at wall-clock speed
    #[arg(long)]
    realtime: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Plan { from, to } => show_plan(from, to),
        Commands::Render(ref args) => render(args),
    }
}

fn format_factors(factors: &[Factor]) -> String {
    if factors.is_empty() {
        return "1".to_string();
    }
    factors
        .iter()
        .map(|f| match f.count {
            1 => f.prime.to_string(),
            n => format!("{}^{}", f.prime, n),
        })
        .collect::<Vec<_>>()
        .join(" * ")
}

/// 显示比例规划
fn show_plan(from: u32, to: u32) -> anyhow::Result<()> {
    let mut l_factors = factorize(to).with_context(|| format!("cannot factorize {}", to))?;
    let mut m_factors = factorize(from).with_context(|| format!("cannot factorize {}", from))?;

    println!("{:>8} = {}", from, format_factors(&m_factors));
    println!("{:>8} = {}", to, format_factors(&l_factors));

    reduce(&mut l_factors, &mut m_factors);
    println!("\nReduced: L = {}, M = {}", format_factors(&l_factors), format_factors(&m_factors));

    let stages = plan(&l_factors, &m_factors);
    if stages.is_empty() {
        println!("\nNo rate conversion needed.");
        return Ok(());
    }

    println!("\nStages:");
    let mut rate = from as f64;
    for (i, stage) in stages.iter().enumerate() {
        rate = rate * stage.l as f64 / stage.m as f64;
        println!("  {}. x{} / {}  -> {:.1}Hz", i + 1, stage.l, stage.m, rate);
    }

    Ok(())
}

/// 单个输入：音频源 + 喂数据的线程
struct Input {
    path: PathBuf,
    source: Arc<StreamingSource>,
    fed: Arc<AtomicBool>,
    feeder: Option<JoinHandle<()>>,
}

/// 每次追加的块数（把小 packet 攒成整节点）
const FEED_BLOCKS: usize = 4096;

/// 解码并追加到音频源，直到文件结束或被中断
fn feed(decoder: &mut AudioDecoder, source: &StreamingSource, sync: bool, running: &AtomicBool) -> anyhow::Result<usize> {
    let format = decoder.format();
    let block = format.block_size();
    let mut pending: Vec<u8> = Vec::with_capacity(FEED_BLOCKS * block);
    let mut total = 0;

    let flush = |pending: &mut Vec<u8>| -> anyhow::Result<()> {
        let blocks = pending.len() / block;
        if sync {
            source.add(pending, blocks, format)?;
        } else {
            source.add_async(pending, blocks, format)?;
        }
        pending.clear();
        Ok(())
    };

    while running.load(Ordering::Acquire) {
        let Some((bytes, blocks)) = decoder.next_chunk()? else {
            break;
        };
        pending.extend_from_slice(bytes);
        total += blocks;
        if pending.len() >= FEED_BLOCKS * block {
            flush(&mut pending)?;
        }
    }
    flush(&mut pending)?;

    Ok(total)
}

fn spawn_input(index: usize, path: &Path, out_format: WaveFormat, args: &RenderArgs, running: &Arc<AtomicBool>) -> anyhow::Result<Input> {
    let mut decoder = AudioDecoder::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let info = decoder.info();
    log::info!(
        "Input {}: {} | Codec: {} | {} | Duration: {:.1}s",
        index,
        info.container,
        info.codec,
        info.format,
        info.duration_secs.unwrap_or(0.0)
    );

    let config = SourceConfig {
        looped: args.looped,
        ..SourceConfig::default()
    };
    let source = Arc::new(StreamingSource::new(out_format, config)?);
    let fed = Arc::new(AtomicBool::new(false));

    let feeder = {
        let source = Arc::clone(&source);
        let fed = Arc::clone(&fed);
        let running = Arc::clone(running);
        let sync = args.sync;
        let name = path.display().to_string();
        thread::Builder::new()
            .name(format!("feeder-{}", index))
            .spawn(move || {
                match feed(&mut decoder, &source, sync, &running) {
                    Ok(blocks) => log::info!("{}: fed {} blocks", name, blocks),
                    Err(e) => log::error!("{}: {:#}", name, e),
                }
                fed.store(true, Ordering::Release);
            })
            .context("failed to spawn feeder thread")?
    };

    Ok(Input {
        path: path.to_path_buf(),
        source,
        fed,
        feeder: Some(feeder),
    })
}

/// 解码、转换、混音并写出
fn render(args: &RenderArgs) -> anyhow::Result<()> {
    let out_format = WaveFormat::new(args.rate, args.channels, args.bits)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut inputs = args
        .inputs
        .iter()
        .enumerate()
        .map(|(i, path)| spawn_input(i, path, out_format, args, &running))
        .collect::<anyhow::Result<Vec<_>>>()?;

    if args.looped && args.seconds.is_none() {
        eprintln!("Looping without --seconds, press Ctrl+C to stop.");
    }

    // 离线渲染：先等全部数据转换完，避免输出中出现 underrun 静音
    if !args.realtime {
        while running.load(Ordering::SeqCst)
            && !inputs
                .iter()
                .all(|input| input.fed.load(Ordering::Acquire) && input.source.is_idle())
        {
            thread::sleep(Duration::from_millis(5));
        }
    }

    let file = File::create(&args.output).with_context(|| format!("failed to create {}", args.output.display()))?;
    let mut writer = BufWriter::new(file);

    let limit = args.seconds.map(|s| (s * out_format.sample_rate as f64) as u64);
    let mut pacer = RefillPacer::new(out_format.sample_rate, DEFAULT_TICKS_PER_SECOND);
    let block = out_format.block_size();
    let mut mix = vec![0u8; pacer.max_tick_blocks() * block];
    let mut scratch = vec![0u8; pacer.max_tick_blocks() * block];

    let started = Instant::now();
    let mut next_deadline = started;
    let mut written: u64 = 0;

    while running.load(Ordering::SeqCst) {
        let finished = inputs
            .iter()
            .all(|input| input.fed.load(Ordering::Acquire) && input.source.is_reclaimable());
        if finished || limit.is_some_and(|l| written >= l) {
            break;
        }

        let mut blocks = pacer.next_tick();
        if let Some(l) = limit {
            blocks = blocks.min((l - written) as usize);
        }
        let bytes = blocks * block;

        out_format.fill_silence(&mut mix[..bytes]);
        for input in &inputs {
            input.source.take(&mut scratch[..bytes], blocks);
            mix_into(&mut mix[..bytes], &scratch[..bytes], &out_format);
        }
        writer.write_all(&mix[..bytes])?;
        written += blocks as u64;

        if args.realtime {
            next_deadline += pacer.tick_duration();
            if let Some(wait) = next_deadline.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }
    }

    if !running.load(Ordering::SeqCst) {
        println!("\nRendering interrupted.");
    }
    running.store(false, Ordering::SeqCst);
    writer.flush()?;

    for input in &mut inputs {
        if let Some(feeder) = input.feeder.take() {
            if feeder.join().is_err() {
                log::warn!("Feeder for {} panicked", input.path.display());
            }
        }
    }

    println!(
        "Wrote {} blocks ({:.2}s, {}) to {} in {:.2}s",
        written,
        written as f64 / out_format.sample_rate as f64,
        out_format,
        args.output.display(),
        started.elapsed().as_secs_f64()
    );
    for input in &inputs {
        println!("\n{}", input.path.display());
        print!("{}", input.source.stats().report());
    }

    Ok(())
}
