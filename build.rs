//! Build script for generating the `kerneld` man page.
//!
//! Packaging picks the page up from the build output directory.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
#[expect(dead_code, reason = "the build script only needs the clap command tree")]
mod cli;

use cli::Cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = env::var_os("OUT_DIR").map(PathBuf::from).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
    })?;

    let mut page = File::create(out_dir.join("kerneld.1"))?;
    Man::new(Cli::command()).render(&mut page)?;
    page.flush()?;

    Ok(())
}
