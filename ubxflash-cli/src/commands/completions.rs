//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::{BIN_NAME, Cli};

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN_NAME, &mut io::stdout());
}

/// Detect the user's shell from `$SHELL`, or PowerShell on Windows.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let shell_name = Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match shell_name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

fn home_dir() -> Result<PathBuf> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .context("Could not determine home directory")
}

fn xdg_dir(var: &str, fallback: &[&str]) -> Result<PathBuf> {
    if let Ok(dir) = env::var(var) {
        return Ok(PathBuf::from(dir));
    }
    Ok(fallback
        .iter()
        .fold(home_dir()?, |dir, part| dir.join(part)))
}

/// Where the completion script for `shell` is installed.
fn completion_install_path(shell: Shell) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => xdg_dir("XDG_DATA_HOME", &[".local", "share"])?
            .join("bash-completion")
            .join("completions")
            .join(BIN_NAME),
        Shell::Zsh => home_dir()?
            .join(".zfunc")
            .join(format!("_{BIN_NAME}")),
        Shell::Fish => xdg_dir("XDG_CONFIG_HOME", &[".config"])?
            .join("fish")
            .join("completions")
            .join(format!("{BIN_NAME}.fish")),
        Shell::Elvish => xdg_dir("XDG_CONFIG_HOME", &[".config"])?
            .join("elvish")
            .join("lib")
            .join(format!("{BIN_NAME}.elv")),
        Shell::PowerShell => xdg_dir("XDG_CONFIG_HOME", &[".config"])?
            .join("powershell")
            .join("completions")
            .join(format!("{BIN_NAME}.ps1")),
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

/// Install shell completions for `shell_arg`, or the detected shell.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             ubxflash completions --install bash",
        )?,
    };

    let path = completion_install_path(shell)?;

    let mut buf = Vec::new();
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN_NAME, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓")
            .green()
            .bold(),
        style(format!("{shell:?}")).cyan(),
        style(path.display()).yellow()
    );

    match shell {
        Shell::Bash => eprintln!(
            "To activate now: {}",
            style(format!("source {}", path.display())).cyan()
        ),
        Shell::Zsh => eprintln!(
            "Add {} to ~/.zshrc and restart your shell",
            style("fpath=(~/.zfunc $fpath)").cyan()
        ),
        Shell::PowerShell => eprintln!(
            "Add {} to your PowerShell profile",
            style(format!(". {}", path.display())).cyan()
        ),
        _ => eprintln!("Completions load automatically in new sessions."),
    }

    Ok(())
}
