//! Native runner for the lin86 core: load raw images, start the CPU, stream the debug console.

#![forbid(unsafe_code)]

pub mod devices;
pub mod machine;
pub mod runner;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use machine::{parse_addr, CmdlineSpec, LoadSpec, MachineSpec};

#[derive(Debug, Parser)]
#[command(name = "lin86", about = "Run a raw x86 image on the lin86 CPU core")]
pub struct Args {
    /// JSON machine description. Flags given on the command line take precedence.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Guest RAM size in MiB.
    #[arg(long)]
    pub mem: Option<u32>,

    /// Copy a raw image into guest RAM (repeatable).
    #[arg(long, value_name = "PATH@ADDR")]
    pub load: Vec<LoadSpec>,

    /// Write a NUL-terminated command line into guest RAM.
    #[arg(long, value_name = "TEXT@ADDR")]
    pub cmdline: Option<CmdlineSpec>,

    /// Entry point. A physical address in real mode, EIP with `--protected`.
    #[arg(long, value_parser = parse_addr)]
    pub entry: Option<u32>,

    /// Start in flat 32-bit protected mode at CPL 0 instead of real mode.
    #[arg(long)]
    pub protected: bool,

    /// Stop after this many cycles.
    #[arg(long)]
    pub max_cycles: Option<u64>,

    /// Where port 0xE9 output goes: `stdout` (default), `none`, or a file path.
    #[arg(long)]
    pub debugcon: Option<String>,
}

impl Args {
    /// Reads `--config` if given and applies the command-line overrides on top.
    pub fn machine_spec(&self) -> Result<MachineSpec> {
        let mut spec = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                MachineSpec::from_json(&text)
                    .with_context(|| format!("in machine description {}", path.display()))?
            }
            None => MachineSpec::default(),
        };
        if self.mem.is_some() {
            spec.mem_mib = self.mem;
        }
        if !self.load.is_empty() {
            spec.load = self.load.clone();
        }
        if self.cmdline.is_some() {
            spec.cmdline = self.cmdline.clone();
        }
        if self.entry.is_some() {
            spec.entry = self.entry;
        }
        spec.protected |= self.protected;
        if self.max_cycles.is_some() {
            spec.max_cycles = self.max_cycles;
        }
        if self.debugcon.is_some() {
            spec.debugcon = self.debugcon.clone();
        }
        Ok(spec)
    }
}

/// Builds the machine described by `args`, runs it and prints the summary to stderr.
pub fn run(args: &Args) -> Result<runner::StopReason> {
    let spec = args.machine_spec()?;
    let mut cpu = spec.build()?;
    let sink = devices::open_sink(spec.debugcon.as_deref().unwrap_or("stdout"))?;
    let post_code = devices::attach(&mut cpu.io, sink);

    tracing::info!(
        mem_mib = spec.mem_mib.unwrap_or(machine::DEFAULT_MEM_MIB),
        protected = spec.protected,
        entry = format_args!("{:#x}", spec.entry.unwrap_or(0)),
        "starting"
    );
    let reason = runner::run(&mut cpu, spec.max_cycles);
    let summary = runner::Summary {
        cpu: &cpu,
        reason: &reason,
        post_code: &post_code,
    };
    eprintln!("{summary}");
    Ok(reason)
}
