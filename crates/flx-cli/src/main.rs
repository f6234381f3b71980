//! `flx`: command-line tools for FELIX card readout.
//!
//! ```text
//! USAGE:
//!   flx emu-gen [options]          Write a front-end emulator RAM config
//!   flx scan [options]             Synthesize or load a symbol stream and check every chunk
//!   flx crc <words>..              CRC-20 of hex data words
//!   flx run [options]              Emulated end-to-end readout with per-link rates
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crossbeam_channel::{after, select, tick};
use flx_driver::prelude::*;
use flx_format::card::{TRAILER_16B, TRAILER_32B};
use flx_format::chunk::HeaderLayout;
use flx_format::crc::{crc20, CrcVariant};
use flx_format::emu::{emu_config_lines, EmuOptions, FrameGenerator, Pattern};
use flx_format::scan::{FrameScanner, ScanItem};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Symbols in the emulator RAM of current firmware.
const EMU_RAM_WORDS: usize = 1024;

#[derive(Parser)]
#[command(name = "flx", about = "FELIX card readout tools", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Write the register sequence that loads the front-end emulator RAM.
    EmuGen {
        #[command(flatten)]
        frame: FrameArgs,
        /// Output file prefix; chunk size, idle gap and pattern are appended.
        #[arg(short, long, default_value = "emuconfig")]
        output: String,
    },
    /// Scan a symbol stream and report every chunk with its CRC status.
    Scan {
        #[command(flatten)]
        frame: FrameArgs,
        /// Read symbols from a file written by `emu-gen` instead of synthesizing.
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Compute the CRC-20 of hex data words.
    Crc {
        /// Data words, e.g. 0x030000AA 10AABB00
        #[arg(required = true)]
        words: Vec<String>,
        #[arg(long, value_enum, default_value_t = Poly::New)]
        crc: Poly,
    },
    /// Run the readout chain against the emulated card.
    Run(RunArgs),
}

#[derive(Args)]
struct FrameArgs {
    /// Emulator RAM size in symbols.
    #[arg(long, default_value_t = EMU_RAM_WORDS)]
    emu_size: usize,
    /// Chunk size in bytes, header included.
    #[arg(short, long, default_value_t = 464)]
    chunk_size: u32,
    /// IDLE symbols between chunks.
    #[arg(short, long, default_value_t = 1)]
    idle_gap: u32,
    /// Payload pattern: 0 incremental, 1 0xAA55AA55, 2 all ones, 3 all zeros.
    #[arg(short, long, default_value_t = 0)]
    pattern: u32,
    /// CRC polynomial.
    #[arg(long, value_enum, default_value_t = Poly::New)]
    crc: Poly,
    /// Use the chunk counter as stream id in header word 1.
    #[arg(long)]
    stream_id: bool,
    /// Randomise chunk sizes between half and the full chunk size.
    #[arg(long)]
    random: bool,
    /// Seed for random chunk sizes.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Bracket the idles after the first chunk with SOB/EOB.
    #[arg(long)]
    busy: bool,
    /// Drop the SOP of chunk 2.
    #[arg(long)]
    omit_sop: bool,
    /// Drop the EOP of chunk 2.
    #[arg(long)]
    omit_eop: bool,
    /// Corrupt the CRC of chunk 3.
    #[arg(long)]
    crc_error: bool,
}

impl FrameArgs {
    fn options(&self) -> EmuOptions {
        EmuOptions {
            chunk_size: self.chunk_size,
            pattern: Pattern::from_id(self.pattern),
            idle_gap: self.idle_gap,
            random_size: self.random,
            crc: self.crc.into(),
            layout: if self.stream_id {
                HeaderLayout::StreamId
            } else {
                HeaderLayout::FixedTag
            },
            busy: self.busy,
            omit_sop: self.omit_sop,
            omit_eop: self.omit_eop,
            crc_error: self.crc_error,
            seed: self.seed,
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// Seconds to run.
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,
    /// Links to enable.
    #[arg(short, long, value_delimiter = ',', default_value = "0,1")]
    links: Vec<u16>,
    /// DMA ring size in MiB.
    #[arg(long, default_value_t = 16)]
    ring_mib: usize,
    /// Chunk size the emulated card writes, in bytes.
    #[arg(short, long, default_value_t = 464)]
    chunk_size: usize,
    /// Use 32-bit subchunk trailers.
    #[arg(long)]
    trailer32: bool,
    /// Block size in KiB.
    #[arg(long, default_value_t = 1)]
    block_kb: usize,
    /// Wait for the data-available interrupt instead of polling.
    #[arg(long)]
    interrupt: bool,
    /// Flag a CRC error on every n-th chunk.
    #[arg(long)]
    crc_error_every: Option<u64>,
    /// Seconds between rate reports.
    #[arg(long, default_value_t = 1)]
    report: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum Poly {
    /// 0xC1ACF
    Legacy,
    /// 0x8359F
    New,
}

impl From<Poly> for CrcVariant {
    fn from(p: Poly) -> Self {
        match p {
            Poly::Legacy => CrcVariant::Legacy,
            Poly::New => CrcVariant::New,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::EmuGen { frame, output } => cmd_emu_gen(&frame, &output)?,
        Cmd::Scan { frame, input } => cmd_scan(&frame, input)?,
        Cmd::Crc { words, crc } => cmd_crc(&words, crc.into())?,
        Cmd::Run(args) => cmd_run(&args)?,
    }

    Ok(())
}

fn synthesize(frame: &FrameArgs) -> Result<Vec<u64>> {
    let options = frame.options();
    options.validate()?;
    let max = options.max_chunk_count(frame.emu_size);
    let mut symbols = vec![0u64; frame.emu_size];
    if !FrameGenerator::new(options).synthesize(&mut symbols) {
        tracing::warn!("fewer than {max} chunks fit the emulator RAM");
    }
    Ok(symbols)
}

fn cmd_emu_gen(frame: &FrameArgs, output: &str) -> Result<()> {
    let symbols = synthesize(frame)?;
    let path = frame.options().config_file_name(output);
    let file =
        std::fs::File::create(&path).with_context(|| format!("cannot create {path}"))?;
    let mut out = BufWriter::new(file);
    for line in emu_config_lines(&symbols) {
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    println!("Wrote {} symbols to {path}", symbols.len());
    Ok(())
}

/// Symbols from the data lines of an `emu-gen` file.
fn load_symbols(path: &Path) -> Result<Vec<u64>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    let mut symbols = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let Some(value) = line.trim().strip_prefix("FE_EMU_CONFIG_WRDATA=") else {
            continue;
        };
        let word = parse_hex(value).with_context(|| format!("line {}", n + 1))?;
        symbols.push(word);
    }
    if symbols.is_empty() {
        bail!("no FE_EMU_CONFIG_WRDATA lines in {}", path.display());
    }
    Ok(symbols)
}

fn parse_hex(s: &str) -> Result<u64> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).with_context(|| format!("bad hex word {s:?}"))
}

fn cmd_scan(frame: &FrameArgs, input: Option<PathBuf>) -> Result<()> {
    let symbols = match input {
        Some(path) => load_symbols(&path)?,
        None => synthesize(frame)?,
    };

    let mut scanner = FrameScanner::with_crc(&symbols, frame.crc.into());
    let (mut good, mut bad) = (0usize, 0usize);
    for (i, item) in scanner.by_ref().enumerate() {
        match item {
            ScanItem::Chunk(chunk) => {
                let ok = chunk.crc_ok() && chunk.size_ok();
                if ok {
                    good += 1;
                } else {
                    bad += 1;
                }
                let (counter, size) = chunk
                    .header()
                    .map_or((0, 0), |h| (h.counter, h.chunk_size()));
                println!(
                    "[{i:3}] chunk #{counter:<3} {size:5} B  crc {:05x}/{:05x} {}{}{}",
                    chunk.crc_expected,
                    chunk.crc_computed,
                    if chunk.crc_ok() { "ok" } else { "MISMATCH" },
                    if chunk.size_ok() { "" } else { "  size MISMATCH" },
                    if chunk.busy { "  busy" } else { "" },
                );
            }
            ScanItem::Truncated { words } => {
                bad += 1;
                println!("[{i:3}] truncated after {words} words");
            }
            ScanItem::Orphan { crc } => {
                bad += 1;
                println!("[{i:3}] EOP without SOP (crc {crc:05x})");
            }
        }
    }
    println!();
    println!("Chunks ok    : {good}");
    println!("Faults       : {bad}");
    println!("Stray words  : {}", scanner.stray_words());
    println!("Unknown K    : {}", scanner.unknown_kchars());
    Ok(())
}

fn cmd_crc(words: &[String], variant: CrcVariant) -> Result<()> {
    let words = words
        .iter()
        .map(|w| {
            let v = parse_hex(w)?;
            u32::try_from(v).with_context(|| format!("{w} does not fit 32 bits"))
        })
        .collect::<Result<Vec<u32>>>()?;
    println!("0x{:05x}", crc20(&words, variant));
    Ok(())
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let config = ReaderConfig {
        links_enabled: args.links.clone(),
        block_size_kb: args.block_kb,
        chunk_trailer_bits: if args.trailer32 { TRAILER_32B } else { TRAILER_16B },
        interrupt_mode: args.interrupt,
        dma_memory_size: args.ring_mib << 20,
        ..ReaderConfig::default()
    };
    config.validate()?;
    let emulator = EmulatorConfig {
        block_size: config.block_size(),
        trailer: config.trailer_format()?,
        elinks: config.tags(),
        chunk_size: args.chunk_size,
        crc_error_every: args.crc_error_every,
        ..EmulatorConfig::default()
    };
    let card = shared(EmulatedCard::new(emulator));

    let mut felix = FelixReader::new(config.clone(), card, HostPinnedAllocator::new());
    let mut handlers = Vec::new();
    for &link in &args.links {
        let handler = CountingHandler::new();
        handlers.push((link, handler.clone()));
        felix.add_link(link, handler)?;
    }
    felix.configure()?;
    felix.start()?;
    println!(
        "{} running: {} links, {} blocks of {} B",
        config.id(),
        args.links.len(),
        config.total_blocks(),
        config.block_size()
    );

    let report = tick(Duration::from_secs(args.report.max(1)));
    let done = after(Duration::from_secs(args.seconds));
    loop {
        select! {
            recv(report) -> _ => print_info(&felix.info()),
            recv(done) -> _ => break,
        }
    }
    felix.stop()?;
    print_info(&felix.info());

    println!();
    for (link, handler) in handlers {
        println!(
            "link {link}: {} payloads, {} bytes, {} with errors",
            handler.payloads(),
            handler.bytes(),
            handler.errors()
        );
    }
    Ok(())
}

fn print_info(info: &flx_driver::FelixInfo) {
    println!(
        "reader: {} blocks, {} reclaims, {} card errors, {} unexpected elinks",
        info.reader.blocks, info.reader.reclaim_updates, info.reader.card_errors, info.unexpected_elinks
    );
    for link in &info.links {
        let c = &link.counts;
        println!(
            "  elink {:#05x}: {:8.1} kHz blocks {:8.1} kHz chunks  err chunks {} crc {} seq {} dropped {} stale {}",
            link.ids.tag,
            link.block_rate_khz,
            link.chunk_rate_khz,
            c.error_chunks + c.error_short_chunks,
            c.subchunk_crc_errors,
            c.seqnum_errors,
            c.dropped_blocks,
            c.stale_blocks,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(args: &[&str]) -> FrameArgs {
        let argv = ["flx", "scan"].iter().chain(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Cmd::Scan { frame, .. } => frame,
            _ => unreachable!(),
        }
    }

    #[test]
    fn emulator_ram_size_is_configurable() {
        assert_eq!(synthesize(&frame(&[])).unwrap().len(), EMU_RAM_WORDS);

        let big = frame(&["--emu-size", "4096"]);
        let symbols = synthesize(&big).unwrap();
        assert_eq!(symbols.len(), 4096);
        let chunks = FrameScanner::new(&symbols)
            .filter(|item| item.as_chunk().is_some())
            .count();
        assert_eq!(chunks, big.options().max_chunk_count(4096));
    }
}
