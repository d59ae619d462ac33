//! Renders manual pages for `lxd-provider` and each of its subcommands
//! (`apply`, `show`, `destroy`, `import`) into `OUT_DIR`.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const BIN_NAME: &str = "lxd-provider";

fn render(command: Command, target: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut page = Vec::new();
    Man::new(command).render(&mut page)?;
    fs::write(target, page)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = PathBuf::from(
        env::var_os("OUT_DIR").ok_or("OUT_DIR is only set when cargo runs the build script")?,
    );

    let command = Cli::command();
    for subcommand in command.get_subcommands() {
        let page = out_dir.join(format!("{BIN_NAME}-{}.1", subcommand.get_name()));
        render(subcommand.clone(), &page)?;
    }
    render(command, &out_dir.join(format!("{BIN_NAME}.1")))
}
