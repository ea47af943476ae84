use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::process::{Command, Stdio};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "YAKKL extension task runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the background service worker with wasm-pack
    BuildExtension {
        /// Build without optimizations
        #[arg(long)]
        dev: bool,

        /// Output directory for the generated package
        #[arg(long, default_value = "extension/pkg")]
        out_dir: String,
    },

    /// Run tests
    Test {
        #[command(subcommand)]
        test_type: Option<TestType>,
    },

    /// Run clippy linter (native and wasm32)
    Clippy,

    /// Replay a recorded event stream against the in-memory host
    Replay {
        /// NDJSON file of session events ("-" for stdin)
        events: String,

        /// Session config file
        #[arg(short, long, default_value = "yakkl.toml")]
        config: String,
    },

    /// Write a session config with a fresh EIP-6963 provider uuid
    GenConfig {
        #[arg(short, long, default_value = "yakkl.toml")]
        output: String,

        /// Lock delay after going idle, in seconds
        #[arg(long, default_value = "60")]
        lock_delay: u64,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Remove build outputs
    Clean,
}

#[derive(Subcommand)]
enum TestType {
    /// Unit tests inside the extension crate
    Unit,

    /// End-to-end session flows
    Flows,

    /// Run all Rust tests
    All,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::BuildExtension { dev, out_dir } => build_extension(dev, &out_dir),
        Commands::Test { test_type } => test(test_type),
        Commands::Clippy => clippy(),
        Commands::Replay { events, config } => replay(&events, &config),
        Commands::GenConfig {
            output,
            lock_delay,
            force,
        } => gen_config(&output, lock_delay, force),
        Commands::Clean => clean(),
    }
}

fn build_extension(dev: bool, out_dir: &str) -> Result<()> {
    println!("🔨 Building background service worker...");
    let profile = if dev { "--dev" } else { "--release" };
    // wasm-pack resolves --out-dir relative to the crate
    let out_dir = Path::new(out_dir)
        .strip_prefix("extension")
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| out_dir.to_string());
    run_cmd(
        "wasm-pack",
        &[
            "build",
            "extension",
            profile,
            "--target",
            "no-modules",
            "--out-dir",
            &out_dir,
            "--no-typescript",
        ],
    )?;
    println!("✅ Background worker written to extension/{}", out_dir);
    Ok(())
}

fn test(test_type: Option<TestType>) -> Result<()> {
    match test_type.unwrap_or(TestType::All) {
        TestType::Unit => {
            println!("🧪 Running extension unit tests...");
            run_cmd("cargo", &["test", "-p", "yakkl-extension", "--lib"])?;
        }
        TestType::Flows => {
            println!("🧪 Running session flow tests...");
            run_cmd(
                "cargo",
                &["test", "-p", "yakkl-extension", "--test", "session_flow"],
            )?;
        }
        TestType::All => {
            println!("🧪 Running all Rust tests...");
            run_cmd("cargo", &["test", "--workspace"])?;
        }
    }
    Ok(())
}

fn clippy() -> Result<()> {
    println!("📎 Running clippy...");
    run_cmd(
        "cargo",
        &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
    )?;
    run_cmd(
        "cargo",
        &[
            "clippy",
            "-p",
            "yakkl-extension",
            "--lib",
            "--target",
            "wasm32-unknown-unknown",
            "--",
            "-D",
            "warnings",
        ],
    )?;
    Ok(())
}

fn replay(events: &str, config: &str) -> Result<()> {
    if events != "-" && !Path::new(events).exists() {
        anyhow::bail!("Event file not found: {}", events);
    }
    let status = Command::new("cargo")
        .args(["run", "-q", "-p", "yakkl-extension", "--bin", "session-replay", "--"])
        .arg(events)
        .env("CONFIG_PATH", config)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("Failed to run session-replay")?;
    if !status.success() {
        anyhow::bail!("session-replay failed on {}", events);
    }
    Ok(())
}

fn gen_config(output: &str, lock_delay_secs: u64, force: bool) -> Result<()> {
    if Path::new(output).exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output);
    }

    let config = format!(
        r#"# YAKKL background session

[idle]
strategy = "system"
threshold_ms = 180000
lock_delay_ms = {lock_delay_ms}
poll_interval_ms = 5000
failure_policy = "fail-open"

[popup]
base_url = "index.html"
width = 428
height = 926
focus_debounce_ms = 500

[blacklist]
warning_page = "phishing.html"
override_ttl_ms = 60000

[network]
default_chain_id = 1

[provider]
uuid = "{uuid}"
name = "YAKKL Smart Wallet"
icon = "images/logoBullFav128x128.png"
rdns = "com.yakkl"
"#,
        lock_delay_ms = lock_delay_secs * 1000,
        uuid = generate_uuid_v4(),
    );

    std::fs::write(output, config).with_context(|| format!("Failed to write {}", output))?;
    println!("✅ Wrote {}", output);
    Ok(())
}

fn clean() -> Result<()> {
    println!("🧹 Cleaning build outputs...");
    run_cmd("cargo", &["clean"])?;
    let pkg = Path::new("extension/pkg");
    if pkg.exists() {
        std::fs::remove_dir_all(pkg).context("Failed to remove extension/pkg")?;
    }
    println!("✅ Clean complete");
    Ok(())
}

fn run_cmd(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("Failed to run: {} {}", program, args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("Command failed: {} {}", program, args.join(" "));
    }

    Ok(())
}

fn generate_uuid_v4() -> String {
    use rand::Rng;
    let mut bytes: [u8; 16] = rand::thread_rng().gen();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(&bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

mod hex {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(bytes: &[u8]) -> String {
        let mut result = String::with_capacity(bytes.len() * 2);
        for &byte in bytes {
            result.push(HEX_CHARS[(byte >> 4) as usize] as char);
            result.push(HEX_CHARS[(byte & 0xf) as usize] as char);
        }
        result
    }
}
