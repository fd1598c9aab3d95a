//! hostmux CLI
//!
//! Interactive multi-host SSH sessions from one terminal.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use crossterm::terminal;
use tokio::io::AsyncReadExt;

use hostmux::config::{load_profiles, HostProfile, LoadOutcome};
use hostmux::connect::{ConnectionFactory, HostVerification, RetryPolicy};
use hostmux::mux::{Focus, Multiplexer, MuxConfig};
use hostmux::session::{Overflow, QueueConfig, SessionState};
use hostmux::transport::PtyRequest;

/// Ctrl-A, the command prefix in the interactive loop.
const PREFIX_KEY: u8 = 0x01;

/// How many times the host picker re-prompts on invalid input.
const MAX_PROMPT_ATTEMPTS: u32 = 3;

/// hostmux - interactive SSH sessions to many hosts at once.
#[derive(Parser, Debug)]
#[command(name = "hostmux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the host profile file
    #[arg(short, long, global = true, value_name = "FILE", default_value = "hosts.conf")]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List the host profiles in the config file
    Hosts,

    /// Connect to hosts and start the interactive loop
    Connect {
        /// Ids of the hosts to connect; prompts when omitted
        ids: Vec<String>,

        /// Connect to every host in the config file
        #[arg(long)]
        all: bool,

        /// Accept unknown host keys instead of rejecting them
        #[arg(long)]
        accept_unknown_hosts: bool,

        /// known_hosts file to verify against (defaults to ~/.ssh/known_hosts)
        #[arg(long, value_name = "FILE")]
        known_hosts: Option<PathBuf>,

        /// Terminal type advertised to the remote side
        #[arg(long, default_value = "xterm-256color")]
        term: String,

        /// Per-attempt dial timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,

        /// Retries after the first failed attempt
        #[arg(long, default_value = "2")]
        retries: u32,

        /// Input queue capacity per session
        #[arg(long, default_value = "64")]
        queue_capacity: usize,

        /// Block on a full input queue instead of dropping oldest input,
        /// waiting up to this many milliseconds
        #[arg(long, value_name = "MS")]
        block_input: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Hosts => run_hosts(&cli.config),
        Commands::Connect {
            ids,
            all,
            accept_unknown_hosts,
            known_hosts,
            term,
            timeout,
            retries,
            queue_capacity,
            block_input,
        } => {
            let outcome = load_profiles(&cli.config)?;
            report_skipped(&outcome);

            let profiles = select_profiles(outcome.profiles, &ids, all)?;
            if profiles.is_empty() {
                anyhow::bail!("no hosts selected");
            }

            let verification = if accept_unknown_hosts {
                HostVerification::AcceptAll
            } else {
                HostVerification::RejectUnknown {
                    known_hosts,
                }
            };
            let policy = RetryPolicy {
                timeout: Duration::from_secs(timeout),
                max_retries: retries,
                ..Default::default()
            };
            let overflow = match block_input {
                Some(ms) => Overflow::Block {
                    timeout: Duration::from_millis(ms),
                },
                None => Overflow::DropOldest,
            };
            let (cols, rows) = terminal::size().unwrap_or((80, 24));
            let cfg = MuxConfig {
                pty: PtyRequest { term, cols, rows },
                queue: QueueConfig {
                    capacity: queue_capacity,
                    overflow,
                },
                ..Default::default()
            };

            let factory = ConnectionFactory::ssh(verification, policy);
            run_connect(cfg, factory, profiles).await
        }
    }
}

fn run_hosts(path: &PathBuf) -> anyhow::Result<()> {
    let outcome = load_profiles(path)?;
    for profile in &outcome.profiles {
        println!(
            "{:<16} {:<24} user={}",
            profile.id,
            profile.addr(),
            profile.username
        );
    }
    report_skipped(&outcome);
    Ok(())
}

fn report_skipped(outcome: &LoadOutcome) {
    for err in &outcome.skipped {
        eprintln!("skipped record {}: {}", err.index, err.reason);
    }
}

/// Narrows the loaded profiles to the requested ones, prompting when the
/// command line named none.
fn select_profiles(
    profiles: Vec<HostProfile>,
    ids: &[String],
    all: bool,
) -> anyhow::Result<Vec<HostProfile>> {
    if all {
        return Ok(profiles);
    }
    if !ids.is_empty() {
        let mut selected = Vec::new();
        for id in ids {
            let profile = profiles
                .iter()
                .find(|p| &p.id == id)
                .ok_or_else(|| anyhow::anyhow!("no host with id {id:?} in the config file"))?;
            selected.push(profile.clone());
        }
        return Ok(selected);
    }
    prompt_for_profiles(profiles)
}

/// Interactive host picker. Re-prompts a bounded number of times, then
/// gives up instead of looping forever.
fn prompt_for_profiles(profiles: Vec<HostProfile>) -> anyhow::Result<Vec<HostProfile>> {
    println!("Available hosts:");
    for (n, profile) in profiles.iter().enumerate() {
        println!("  {}. {:<16} {}", n + 1, profile.id, profile.addr());
    }

    for attempt in 1..=MAX_PROMPT_ATTEMPTS {
        print!("Select hosts (numbers or ids, comma-separated, or 'all'): ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            break; // stdin closed
        }
        let line = line.trim();
        if line == "all" {
            return Ok(profiles);
        }

        let mut selected = Vec::new();
        let mut valid = !line.is_empty();
        for token in line.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let found = if let Ok(n) = token.parse::<usize>() {
                (1..=profiles.len()).contains(&n).then(|| profiles[n - 1].clone())
            } else {
                profiles.iter().find(|p| p.id == token).cloned()
            };
            match found {
                Some(profile) => selected.push(profile),
                None => {
                    eprintln!("unknown host {token:?}");
                    valid = false;
                    break;
                }
            }
        }
        if valid && !selected.is_empty() {
            return Ok(selected);
        }
        if attempt < MAX_PROMPT_ATTEMPTS {
            eprintln!("invalid selection, try again");
        }
    }
    anyhow::bail!("no valid host selection after {MAX_PROMPT_ATTEMPTS} attempts")
}

/// Restores the terminal even on early return or panic.
struct RawGuard;

impl RawGuard {
    fn enable() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

async fn run_connect(
    cfg: MuxConfig,
    factory: ConnectionFactory,
    profiles: Vec<HostProfile>,
) -> anyhow::Result<()> {
    let (mux, mut output) = Multiplexer::new(cfg, factory);

    for profile in profiles {
        let id = profile.id.clone();
        match mux.add_host(profile).await {
            Ok(_) => println!("connected {id}"),
            Err(err) => eprintln!("failed to connect {id}: {err}"),
        }
    }
    if mux
        .registry()
        .ids_in_state(SessionState::Active)
        .is_empty()
    {
        anyhow::bail!("no session came up");
    }
    println!("Ctrl-A then: n next host, b broadcast, l list, d disconnect, q quit");

    let _raw = RawGuard::enable()?;
    let mut stdin = tokio::io::stdin();
    let mut stdin_buf = [0u8; 1024];
    let mut winch = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut prefix_armed = false;

    loop {
        tokio::select! {
            read = stdin.read(&mut stdin_buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if handle_input(&mux, &stdin_buf[..n], &mut prefix_armed).await? {
                    break;
                }
            }
            chunk = output.recv() => {
                let Some(chunk) = chunk else { break };
                print_chunk(&mux, &chunk)?;
            }
            _ = winch.recv() => {
                if let Ok((cols, rows)) = terminal::size() {
                    if let Err(err) = mux.resize(cols, rows).await {
                        tracing::warn!(error = %err, "Resize failed");
                    }
                }
            }
            _ = sigterm.recv() => break,
        }

        // Leave once every session has ended on its own.
        if mux
            .list()
            .iter()
            .all(|row| row.state.is_terminal())
        {
            break;
        }
    }

    let rows = mux.list();
    let forced = mux.shutdown().await;
    drop(_raw);
    for id in forced {
        eprintln!("force-released {id}");
    }
    for row in rows {
        if let Some(code) = row.exit_code {
            println!("{} exited with {code}", row.id);
        }
    }
    Ok(())
}

/// Splits Ctrl-A commands out of the raw input stream and routes the rest.
/// Returns true when the user asked to quit.
async fn handle_input(
    mux: &Multiplexer,
    bytes: &[u8],
    prefix_armed: &mut bool,
) -> anyhow::Result<bool> {
    let mut pending = Vec::with_capacity(bytes.len());
    for &byte in bytes {
        if *prefix_armed {
            *prefix_armed = false;
            match byte {
                PREFIX_KEY => pending.push(PREFIX_KEY),
                b'q' => {
                    flush_input(mux, &mut pending).await;
                    return Ok(true);
                }
                b'n' => focus_next(mux),
                b'b' => {
                    let _ = mux.set_focus(Focus::Broadcast);
                    status_line("focus: broadcast")?;
                }
                b'l' => list_sessions(mux)?,
                b'd' => {
                    flush_input(mux, &mut pending).await;
                    disconnect_focused(mux).await?;
                }
                other => {
                    status_line(&format!("unknown command {:?}", other as char))?;
                }
            }
        } else if byte == PREFIX_KEY {
            *prefix_armed = true;
        } else {
            pending.push(byte);
        }
    }
    flush_input(mux, &mut pending).await;
    Ok(false)
}

async fn flush_input(mux: &Multiplexer, pending: &mut Vec<u8>) {
    if pending.is_empty() {
        return;
    }
    match mux.route_input(pending).await {
        Ok(report) => {
            for (id, err) in report.failed {
                tracing::warn!(session_id = %id, error = %err, "Input not delivered");
            }
        }
        Err(err) => tracing::warn!(error = %err, "Input not routed"),
    }
    pending.clear();
}

fn focus_next(mux: &Multiplexer) {
    let active = mux.registry().ids_in_state(SessionState::Active);
    if active.is_empty() {
        return;
    }
    let next = match mux.focus() {
        Focus::Session(current) => {
            let pos = active.iter().position(|id| id == &current);
            let next = pos.map_or(0, |p| (p + 1) % active.len());
            active[next].clone()
        }
        Focus::Broadcast => active[0].clone(),
    };
    let _ = status_line(&format!("focus: {next}"));
    let _ = mux.set_focus(Focus::Session(next));
}

async fn disconnect_focused(mux: &Multiplexer) -> anyhow::Result<()> {
    match mux.focus() {
        Focus::Session(id) => {
            mux.remove_host(&id).await?;
            status_line(&format!("disconnected {id}"))?;
            if let Focus::Session(next) = mux.focus() {
                status_line(&format!("focus: {next}"))?;
            }
        }
        Focus::Broadcast => status_line("select a host before disconnecting")?,
    }
    Ok(())
}

fn list_sessions(mux: &Multiplexer) -> anyhow::Result<()> {
    for row in mux.list() {
        let detail = match (&row.exit_code, &row.last_error) {
            (Some(code), _) => format!(" exit={code}"),
            (None, Some(err)) => format!(" error={err}"),
            (None, None) => String::new(),
        };
        status_line(&format!(
            "{:<16} {:<24} {:?}{detail}",
            row.id, row.addr, row.state
        ))?;
    }
    Ok(())
}

/// Writes a chunk of remote output. The focused session prints raw; in
/// broadcast mode every chunk is prefixed with its origin label.
fn print_chunk(mux: &Multiplexer, chunk: &hostmux::OutputChunk) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    match mux.focus() {
        Focus::Session(id) => {
            if id == chunk.session_id {
                stdout.write_all(&chunk.data)?;
            }
        }
        Focus::Broadcast => {
            write!(stdout, "[{}] ", chunk.label)?;
            stdout.write_all(&chunk.data)?;
        }
    }
    stdout.flush()?;
    Ok(())
}

/// Prints one status line. Raw mode needs the explicit carriage return.
fn status_line(text: &str) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    write!(stdout, "\r\n[hostmux] {text}\r\n")?;
    stdout.flush()?;
    Ok(())
}
