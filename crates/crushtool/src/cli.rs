//! Command line interface definition.

use std::path::PathBuf;

use clap::Parser;

/// crushtool: compile and decompile CRUSH placement maps.
#[derive(Debug, Parser)]
#[command(name = "crushtool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Compile a text map.
    ///
    /// Without -o the map is only validated; nothing is written.
    #[arg(
        short = 'c',
        value_name = "MAP.TXT",
        conflicts_with = "decompile_input",
        required_unless_present = "decompile_input"
    )]
    pub compile_input: Option<PathBuf>,

    /// Decompile a binary map.
    ///
    /// Without -o the text goes to stdout.
    #[arg(short = 'd', value_name = "MAP")]
    pub decompile_input: Option<PathBuf>,

    /// Write the result here.
    #[arg(short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Overwrite the output file if it exists.
    #[arg(long)]
    pub clobber: bool,

    /// Increase verbosity; repeat for more.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}
