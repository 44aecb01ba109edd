#!/usr/bin/env cargo
//! Switchboard CI Tool
//!
//! Checks, tests and lints the switchboard workspace for continuous integration

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(
    name = "ci",
    about = "Switchboard CI tool for checking, testing and linting the workspace",
    long_about = r#"
Switchboard CI tool for checking, testing and linting the workspace

Examples:
  cargo run -p ci                      # Check compilation (default)
  cargo run -p ci -- check             # Check that every crate compiles
  cargo run -p ci -- test              # Run all tests
  cargo run -p ci -- lint              # Run rustfmt and clippy

The dispatcher tests open loopback sockets, so `test` needs a host where
binding 127.0.0.1 is allowed.
"#
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Parser)]
enum Commands {
    /// Check that every crate compiles
    Check,
    /// Run all tests
    Test,
    /// Check formatting and run clippy with warnings denied
    Lint,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Commands::Check) => run_check(),
        Some(Commands::Test) => run_test(),
        Some(Commands::Lint) => run_lint(),
        None => run_check(), // Default to check
    }
}

/// Check that every crate compiles
fn run_check() -> Result<()> {
    println!("🤖 Switchboard CI Check");
    println!("{}", "=".repeat(27));

    check_rust()?;
    cargo_step("check", &["check", "--workspace", "--all-targets"])?;

    println!("\n✅ Workspace check passed!");
    Ok(())
}

/// Run all tests
fn run_test() -> Result<()> {
    println!("🤖 Switchboard CI Test");
    println!("{}", "=".repeat(26));

    check_rust()?;
    run_rust_tests()?;

    println!("\n✅ All tests completed!");
    Ok(())
}

/// Check formatting and lints
fn run_lint() -> Result<()> {
    println!("🤖 Switchboard CI Lint");
    println!("{}", "=".repeat(26));

    check_rust()?;
    cargo_step("fmt", &["fmt", "--all", "--", "--check"])?;
    cargo_step(
        "clippy",
        &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
    )?;

    println!("\n✅ Lints passed!");
    Ok(())
}

fn check_rust() -> Result<()> {
    if which::which("cargo").is_err() {
        return Err(anyhow!(
            "❌ Error: Cargo not found. Please install Rust first.\n   Visit: https://rustup.rs/"
        ));
    }
    Ok(())
}

fn get_repo_root() -> Result<PathBuf> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").context(
        "❌ CI tool must be run via cargo. CARGO_MANIFEST_DIR not found.",
    )?;

    let manifest_path = PathBuf::from(manifest_dir);
    // If we're in the ci/ directory, go up to workspace root
    if manifest_path.file_name() == Some(std::ffi::OsStr::new("ci")) {
        if let Some(parent) = manifest_path.parent() {
            return Ok(parent.to_path_buf());
        }
    }
    Ok(manifest_path)
}

/// Run one cargo subcommand at the workspace root, capturing its output
fn cargo_step(name: &str, args: &[&str]) -> Result<()> {
    let repo_root = get_repo_root()?;

    println!("🦀 Running cargo {}...", name);
    println!("   Workspace: {}", repo_root.display());

    let output = Command::new("cargo")
        .args(args)
        .current_dir(&repo_root)
        .output()
        .with_context(|| format!("Failed to execute cargo {}", name))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Err(anyhow!(
            "❌ cargo {} failed:\n   stdout: {}\n   stderr: {}",
            name,
            stdout.trim(),
            stderr.trim()
        ));
    }

    println!("✅ cargo {} passed!", name);
    Ok(())
}

/// Run Rust tests with output streamed to the terminal
fn run_rust_tests() -> Result<()> {
    let repo_root = get_repo_root()?;

    println!("🦀 Running Rust tests...");
    println!("   Testing workspace in: {}", repo_root.display());

    let status = Command::new("cargo")
        .args(["test", "--workspace"])
        .env("RUST_BACKTRACE", "1")
        .current_dir(&repo_root)
        .status()
        .context("Failed to execute cargo test")?;

    if !status.success() {
        return Err(anyhow!("❌ Rust tests failed"));
    }

    println!("✅ Rust tests passed!");
    Ok(())
}
