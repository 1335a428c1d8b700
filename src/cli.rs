use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "lite-pull")]
#[command(about = "Pull inputs and replicate them to files, processes and sockets")]
#[command(version)]
pub struct Args {
    /// Input files, concatenated in order, or `-` for standard input
    #[arg(required = true, value_name = "INPUT")]
    pub inputs: Vec<PathBuf>,

    /// Write to a file (repeatable)
    #[arg(short, long = "output", value_name = "FILE")]
    pub outputs: Vec<PathBuf>,

    /// Pipe to the standard input of a shell command (repeatable)
    #[arg(long = "exec", value_name = "CMD")]
    pub commands: Vec<String>,

    /// Send to a TCP server (repeatable)
    #[arg(long, value_name = "HOST:PORT")]
    pub connect: Vec<String>,

    /// Write to standard output
    #[arg(long)]
    pub stdout: bool,

    /// Pull more input once every sink has at most this many bytes pending
    #[arg(long, value_name = "SIZE", value_parser = parse_size, default_value = "128K")]
    pub low_water: u64,

    /// Read size of each chunk
    #[arg(long, value_name = "SIZE", value_parser = parse_size, default_value = "1M")]
    pub chunk: u64,

    /// Stop after this many bytes
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub max_bytes: Option<u64>,

    /// Print a JSON summary at the end
    #[arg(long)]
    pub json: bool,

    /// Debug logging of the transfer
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.outputs.is_empty()
            && self.commands.is_empty()
            && self.connect.is_empty()
            && !self.stdout
        {
            anyhow::bail!("no output given, use --output, --exec, --connect or --stdout");
        }
        if self.inputs.len() > 1 && self.inputs.iter().any(|input| input.as_os_str() == "-") {
            anyhow::bail!("standard input cannot be combined with other inputs");
        }
        Ok(())
    }

    pub fn from_stdin(&self) -> bool {
        matches!(self.inputs.as_slice(), [input] if input.as_os_str() == "-")
    }

    pub fn chunk_size(&self) -> usize {
        usize::try_from(self.chunk).unwrap_or(usize::MAX)
    }
}

/// Parses a byte count with an optional `K`, `M` or `G` suffix (powers of 1024).
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((i, _)) => s.split_at(i),
        None => (s, ""),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size: {:?}", s))?;
    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("invalid size unit: {:?}", unit)),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {:?}", s))
}

#[cfg(test)]
#[path = "cli_test.rs"]
mod cli_test;
