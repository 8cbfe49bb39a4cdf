use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ipt_core::{
    Command, DecodedPacket, EngineConfig, LoggingConfig, LogFormat, Table, Verdict,
    load_packets,
};
use ipt_metrics::EngineMetrics;
use similar::{ChangeTag, TextDiff};
use std::fs::OpenOptions;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "iptsim")]
#[command(version, about = "iptables-style firewall rule simulator", long_about = None)]
struct Cli {
    /// Engine configuration (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a packet file against a rule file
    Simulate {
        #[arg(short, long, default_value = "iptsim.rules")]
        rules: PathBuf,
        /// Decoded packets (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        packets: PathBuf,
        /// Chain to evaluate; defaults to the configured default chain
        #[arg(long)]
        chain: Option<String>,
        /// One decision per line is written here
        #[arg(short, long, default_value = "output.txt")]
        output: PathBuf,
        /// Compare decisions against an expected-decisions file
        #[arg(long)]
        expect: Option<PathBuf>,
        /// Print Prometheus metrics when done
        #[arg(long)]
        metrics: bool,
    },
    /// Append a command to a rule file after validating it
    AddRule {
        #[arg(short, long)]
        command: String,
        #[arg(short, long, default_value = "iptsim.rules")]
        file: PathBuf,
    },
    /// Load a rule file and list its chains and diagnostics
    Check {
        #[arg(short, long, default_value = "iptsim.rules")]
        rules: PathBuf,
    },
    /// Evaluate one packet described on the command line
    Eval {
        #[arg(short, long, default_value = "iptsim.rules")]
        rules: PathBuf,
        #[arg(long)]
        chain: Option<String>,
        #[arg(long)]
        src: IpAddr,
        #[arg(long)]
        dst: IpAddr,
        #[arg(long, value_enum, default_value_t = Proto::Tcp)]
        proto: Proto,
        #[arg(long, default_value_t = 0)]
        sport: u16,
        #[arg(long, default_value_t = 0)]
        dport: u16,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Proto {
    Tcp,
    Udp,
    Icmp,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    init_logging(&config.logging);

    match cli.command {
        Commands::Simulate {
            rules,
            packets,
            chain,
            output,
            expect,
            metrics,
        } => {
            let chain = chain.unwrap_or_else(|| config.default_chain.clone());
            simulate(&config, &rules, &packets, &chain, &output, expect.as_deref(), metrics)?;
        }
        Commands::AddRule { command, file } => add_rule(&command, &file)?,
        Commands::Check { rules } => check(&config, &rules)?,
        Commands::Eval {
            rules,
            chain,
            src,
            dst,
            proto,
            sport,
            dport,
        } => {
            let chain = chain.unwrap_or_else(|| config.default_chain.clone());
            let packet = match proto {
                Proto::Tcp => DecodedPacket::tcp(src, sport, dst, dport),
                Proto::Udp => DecodedPacket::udp(src, sport, dst, dport),
                Proto::Icmp => DecodedPacket::icmp(src, dst),
            };
            eval(&config, &rules, &chain, &packet)?;
        }
    }

    Ok(())
}

/// RUST_LOG wins over the configured level. Output goes to stderr so
/// decisions and metrics on stdout stay machine-readable.
fn init_logging(config: &LoggingConfig) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

fn load_table(config: &EngineConfig, rules: &Path, metrics: Option<&EngineMetrics>) -> Result<Table> {
    let mut table = Table::with_options(config.table_options());
    let report = table.load_rules(rules)?;

    for skipped in &report.skipped {
        eprintln!(
            "⚠️  {}:{}: {} ({})",
            rules.display(),
            skipped.line,
            skipped.reason,
            skipped.text.trim()
        );
    }
    if let Some(metrics) = metrics {
        metrics.observe_load(&report);
    }
    info!(
        applied = report.applied,
        unchanged = report.unchanged,
        skipped = report.skipped.len(),
        "rules loaded"
    );

    Ok(table)
}

fn simulate(
    config: &EngineConfig,
    rules: &Path,
    packets: &Path,
    chain: &str,
    output: &Path,
    expect: Option<&Path>,
    print_metrics: bool,
) -> Result<()> {
    let metrics = EngineMetrics::new()?;
    let table = load_table(config, rules, Some(&metrics))?;
    let packets = load_packets(packets)?;

    let mut decisions = String::new();
    for (idx, packet) in packets.iter().enumerate() {
        let verdict = match table.evaluate(chain, packet) {
            Ok(evaluation) => evaluation.verdict,
            Err(e) => {
                error!(packet = idx + 1, kind = e.kind(), error = %e, "evaluation aborted");
                metrics.record_error(&e);
                Verdict::Drop
            }
        };
        metrics.record_verdict(chain, verdict);
        decisions.push_str(verdict.as_str());
        decisions.push('\n');
    }

    std::fs::write(output, &decisions)
        .with_context(|| format!("Failed to write decisions to {:?}", output))?;
    println!(
        "✅ Wrote {} packet decisions to {}",
        packets.len(),
        output.display()
    );

    if print_metrics {
        metrics.observe_table(&table);
        print!("{}", metrics.render()?);
    }

    if let Some(expect) = expect {
        let expected = std::fs::read_to_string(expect)
            .with_context(|| format!("Failed to read expected decisions from {:?}", expect))?;
        if expected != decisions {
            println!("{}", render_diff(&expected, &decisions));
            anyhow::bail!("Decisions differ from {}", expect.display());
        }
        println!("✅ Decisions match {}", expect.display());
    }

    Ok(())
}

fn add_rule(command: &str, file: &Path) -> Result<()> {
    match Command::parse(command) {
        Ok(Some(parsed)) => info!(verb = parsed.verb().flag(), "command validated"),
        Ok(None) => anyhow::bail!("No iptables verb found in {:?}", command),
        Err(e) => {
            return Err(anyhow::Error::new(e).context(format!("Invalid command {:?}", command)));
        }
    }

    let mut handle = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file)
        .with_context(|| format!("Failed to open rules file {:?}", file))?;
    writeln!(handle, "{}", command.trim())
        .with_context(|| format!("Failed to write to {:?}", file))?;

    println!("✅ Added rule to {}", file.display());
    Ok(())
}

fn check(config: &EngineConfig, rules: &Path) -> Result<()> {
    let mut table = Table::with_options(config.table_options());
    let report = table.load_rules(rules)?;

    for chain in table.chains() {
        let policy = chain
            .default_policy()
            .map(|p| p.as_str())
            .unwrap_or("-");
        println!("Chain {} (policy {})", chain.name(), policy);
        for (idx, rule) in chain.rules().iter().enumerate() {
            println!("  {:>3}  {}", idx + 1, rule);
        }
    }

    if report.is_clean() {
        println!(
            "\n✅ {} applied, {} without effect",
            report.applied, report.unchanged
        );
        return Ok(());
    }

    println!();
    for skipped in &report.skipped {
        println!(
            "❌ line {} [{}]: {}\n     {}",
            skipped.line,
            skipped.reason.kind(),
            skipped.reason,
            skipped.text.trim()
        );
    }
    anyhow::bail!(
        "{} line(s) of {} were skipped",
        report.skipped.len(),
        rules.display()
    );
}

fn eval(config: &EngineConfig, rules: &Path, chain: &str, packet: &DecodedPacket) -> Result<()> {
    let table = load_table(config, rules, None)?;
    let evaluation = table
        .evaluate(chain, packet)
        .with_context(|| format!("Failed to evaluate chain {}", chain))?;

    for log in &evaluation.logs {
        println!("📝 LOG {}#{} {:?}", log.chain, log.position, log.prefix);
    }
    println!("{}", evaluation.verdict);
    Ok(())
}

fn render_diff(expected: &str, actual: &str) -> String {
    let diff = TextDiff::from_lines(expected, actual);
    let mut output = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        output.push(sign);
        output.push_str(change.value());
    }

    output
}
