//! crushtool: the text <-> binary front-end for CRUSH placement maps.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::Cli;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
            let _ = err.print();
            return code;
        }
    };
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    if let Some(input) = &cli.decompile_input {
        decompile(cli, input)?;
    }
    if let Some(input) = &cli.compile_input {
        compile(cli, input)?;
    }
    Ok(())
}

fn compile(cli: &Cli, input: &Path) -> Result<()> {
    let source = std::fs::read_to_string(input)
        .with_context(|| format!("error reading '{}'", input.display()))?;
    let map = crush::compile(&source).map_err(|err| positioned(input, &err))?;
    info!(
        devices = map.max_devices(),
        buckets = map.max_buckets(),
        rules = map.max_rules(),
        "compiled '{}'",
        input.display()
    );

    match &cli.output {
        Some(output) => {
            check_clobber(cli, output)?;
            std::fs::write(output, map.encode())
                .with_context(|| format!("error writing '{}'", output.display()))?;
            info!("wrote crush map to {}", output.display());
        }
        None => {
            println!(
                "successfully compiled '{}'. Use -o <file> to write it out.",
                input.display()
            );
        }
    }
    Ok(())
}

fn decompile(cli: &Cli, input: &Path) -> Result<()> {
    let bytes = std::fs::read(input)
        .with_context(|| format!("error reading '{}'", input.display()))?;
    let map = crush::CrushMap::decode(&bytes).map_err(|err| positioned(input, &err))?;
    let text = crush::decompile(&map);

    match &cli.output {
        Some(output) => {
            check_clobber(cli, output)?;
            std::fs::write(output, text)
                .with_context(|| format!("error writing '{}'", output.display()))?;
            info!("wrote text map to {}", output.display());
        }
        None => print!("{text}"),
    }
    Ok(())
}

fn check_clobber(cli: &Cli, output: &Path) -> Result<()> {
    if output.exists() && !cli.clobber {
        bail!("'{}' already exists; pass --clobber to overwrite", output.display());
    }
    Ok(())
}

/// Render a library error as `<file>:<line>: <message>` when it carries a
/// position, `<file>: <message>` otherwise.
fn positioned(input: &Path, err: &crush::Error) -> anyhow::Error {
    match err.line() {
        Some(line) => anyhow!("{}:{line}: {}", input.display(), err.inner()),
        None => anyhow!("{}: {err}", input.display()),
    }
}
