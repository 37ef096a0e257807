use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use clap::CommandFactory;
use clap_complete::{generate, Shell};

use crate::cli::{Cli, CompletionShell};
use crate::error::CliError;

const BIN_NAME: &str = "tandem";

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Self::Bash,
            CompletionShell::Zsh => Self::Zsh,
            CompletionShell::Fish => Self::Fish,
            CompletionShell::PowerShell => Self::PowerShell,
        }
    }
}

/// Write a completion script to `output_path`, or stdout when omitted
pub fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    let Some(path) = output_path else {
        let stdout = io::stdout();
        write_script(shell, &mut stdout.lock());
        return Ok(());
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    write_script(shell, &mut writer);
    writer.flush()?;
    println!("{}", path.display());
    Ok(())
}

fn write_script(shell: CompletionShell, out: &mut dyn Write) {
    generate(Shell::from(shell), &mut Cli::command(), BIN_NAME, out);
}
