//! Machine description: what to load where, and how to start the CPU.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use lin86_cpu_core::{Cpu, CpuConfig};
use serde::Deserialize;

pub const DEFAULT_MEM_MIB: u32 = 32;

/// Parses a decimal or `0x`-prefixed hexadecimal address.
pub fn parse_addr(s: &str) -> Result<u32> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.with_context(|| format!("invalid address `{s}`"))
}

/// `PATH@ADDR`: a raw image copied to physical address `ADDR`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoadSpec {
    pub path: PathBuf,
    #[serde(deserialize_with = "de_addr")]
    pub addr: u32,
}

impl FromStr for LoadSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((path, addr)) = s.rsplit_once('@') else {
            bail!("expected PATH@ADDR, got `{s}`");
        };
        if path.is_empty() {
            bail!("empty path in `{s}`");
        }
        Ok(Self {
            path: PathBuf::from(path),
            addr: parse_addr(addr)?,
        })
    }
}

/// `TEXT@ADDR`: a NUL-terminated kernel command line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CmdlineSpec {
    pub text: String,
    #[serde(deserialize_with = "de_addr")]
    pub addr: u32,
}

impl FromStr for CmdlineSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((text, addr)) = s.rsplit_once('@') else {
            bail!("expected TEXT@ADDR, got `{s}`");
        };
        Ok(Self {
            text: text.to_owned(),
            addr: parse_addr(addr)?,
        })
    }
}

/// Addresses in the JSON file may be numbers or strings like `"0x100000"`.
fn de_addr<'de, D>(de: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Addr {
        Num(u32),
        Text(String),
    }
    match Addr::deserialize(de)? {
        Addr::Num(n) => Ok(n),
        Addr::Text(s) => parse_addr(&s).map_err(serde::de::Error::custom),
    }
}

fn de_opt_addr<'de, D>(de: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    de_addr(de).map(Some)
}

/// Everything needed to set up a run. Read from `--config` and then overridden by flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineSpec {
    pub mem_mib: Option<u32>,
    pub load: Vec<LoadSpec>,
    pub cmdline: Option<CmdlineSpec>,
    #[serde(deserialize_with = "de_opt_addr")]
    pub entry: Option<u32>,
    pub protected: bool,
    pub max_cycles: Option<u64>,
    pub debugcon: Option<String>,
}

impl MachineSpec {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid machine description")
    }

    pub fn mem_bytes(&self) -> Result<usize> {
        let mib = self.mem_mib.unwrap_or(DEFAULT_MEM_MIB);
        if mib == 0 || mib > 4096 {
            bail!("memory size must be between 1 and 4096 MiB, got {mib}");
        }
        usize::try_from(u64::from(mib) << 20).context("memory size does not fit in usize")
    }

    /// Creates the CPU, copies images and the command line into RAM and sets the entry state.
    pub fn build(&self) -> Result<Cpu> {
        let mut cpu = Cpu::new(CpuConfig::with_mem_size(self.mem_bytes()?))
            .context("failed to allocate guest memory")?;

        for spec in &self.load {
            let bytes = std::fs::read(&spec.path)
                .with_context(|| format!("failed to read image {}", spec.path.display()))?;
            cpu.mem.load(spec.addr, &bytes).with_context(|| {
                format!(
                    "image {} ({} bytes) does not fit at {:#x}",
                    spec.path.display(),
                    bytes.len(),
                    spec.addr
                )
            })?;
            tracing::info!(
                path = %spec.path.display(),
                addr = format_args!("{:#x}", spec.addr),
                len = bytes.len(),
                "loaded image"
            );
        }

        if let Some(cmdline) = &self.cmdline {
            let mut bytes = cmdline.text.as_bytes().to_vec();
            bytes.push(0);
            cpu.mem
                .load(cmdline.addr, &bytes)
                .with_context(|| format!("command line does not fit at {:#x}", cmdline.addr))?;
        }

        let entry = self.entry.unwrap_or(0);
        if self.protected {
            cpu.set_flat_protected_mode(entry);
        } else {
            if entry > 0xF_FFFF {
                bail!("real-mode entry {entry:#x} is above 1 MiB");
            }
            cpu.set_real_mode_entry((entry >> 4) as u16, (entry & 0xF) as u16);
        }
        Ok(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_accept_hex_and_decimal() {
        assert_eq!(parse_addr("0x10_0000").unwrap(), 0x10_0000);
        assert_eq!(parse_addr("4096").unwrap(), 4096);
        assert!(parse_addr("0xZZ").is_err());
    }

    #[test]
    fn load_spec_splits_on_the_last_at() {
        let spec: LoadSpec = "images/a@b.bin@0x7c00".parse().unwrap();
        assert_eq!(spec.path, PathBuf::from("images/a@b.bin"));
        assert_eq!(spec.addr, 0x7C00);
        assert!("kernel.bin".parse::<LoadSpec>().is_err());
        assert!("@0x1000".parse::<LoadSpec>().is_err());
    }

    #[test]
    fn json_description_with_string_addresses() {
        let spec = MachineSpec::from_json(
            r#"{
                "mem_mib": 16,
                "load": [{ "path": "vmlinux.bin", "addr": "0x100000" }],
                "cmdline": { "text": "console=ttyS0", "addr": 36864 },
                "entry": "0x100000",
                "protected": true
            }"#,
        )
        .unwrap();
        assert_eq!(spec.mem_bytes().unwrap(), 16 << 20);
        assert_eq!(spec.load[0].addr, 0x10_0000);
        assert_eq!(spec.cmdline.as_ref().unwrap().addr, 0x9000);
        assert_eq!(spec.entry, Some(0x10_0000));
        assert!(spec.protected);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(MachineSpec::from_json(r#"{ "ram": 64 }"#).is_err());
    }

    #[test]
    fn real_mode_entry_is_split_into_segment_and_offset() {
        let spec = MachineSpec {
            mem_mib: Some(1),
            entry: Some(0x7C00),
            ..MachineSpec::default()
        };
        let cpu = spec.build().unwrap();
        assert_eq!(cpu.state.seg(lin86_cpu_core::SegReg::Cs).selector, 0x7C0);
        assert_eq!(cpu.state.eip, 0);
    }
}
