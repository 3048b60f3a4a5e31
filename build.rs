//! Build script rendering the `vetter` manual pages.
//!
//! Packaging installs `vetter.1` plus one `vetter-<command>.1` page per
//! subcommand from the build output directory.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const MANUAL: &str = "vetter manual";

const EXIT_STATUS: &str = "\
Exit status:
  0   success
  1   generic failure, including invalid configuration entries
  10  configuration file not found
  11  label not found in a configuration file
  12  credential missing
  20  authentication rejected
  50  image not found
  60  request rejected as malformed
  61  request forbidden
  70  instance failed to become active
  71  SSH port never opened
  80  tests failed

Configuration files (images.yaml, test.yaml, upload.yaml) are searched for
in ., ./vetter and /etc/vetter unless given explicitly.";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);
    let source = format!("vetter {}", env!("CARGO_PKG_VERSION"));

    let command = Cli::command().after_long_help(EXIT_STATUS);
    for subcommand in command.get_subcommands() {
        let name = format!("vetter-{}", subcommand.get_name());
        let page = subcommand.clone().bin_name(name.clone());
        render(&out_dir, &name, page, &source)?;
    }
    render(&out_dir, "vetter", command, &source)?;

    Ok(())
}

fn render(
    out_dir: &Path,
    name: &str,
    command: Command,
    source: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = Vec::new();
    Man::new(command)
        .title(name.to_ascii_uppercase())
        .section("1")
        .manual(MANUAL)
        .source(source.to_owned())
        .render(&mut buffer)?;
    fs::write(out_dir.join(format!("{name}.1")), buffer)?;
    Ok(())
}
