//! Integration with `clap`

use clap::Parser;

/// Command line arguments
#[derive(Parser)]
#[clap(about, version)]
pub struct Args {}

pub fn parse() -> Args {
    Args::parse()
}
