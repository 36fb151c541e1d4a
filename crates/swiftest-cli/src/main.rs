//! Thin CLI wrapper around the Swiftest core.
//!
//! Parses flags into a `Config`, spawns a renderer thread over the event
//! channel, runs the pipeline, and maps the summary to an exit code.

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use clap::Parser;
use colored::Colorize;
use crossbeam_channel::Receiver;
use tracing_subscriber::EnvFilter;

use swiftest_core::events::{ChannelSink, Event, Outcome, Summary};
use swiftest_core::Config;

#[derive(Parser, Debug)]
#[command(name = "swiftest", version, about = "A fast pytest-style test runner for Python")]
struct Cli {
    /// Files or directories to collect tests from (default: current directory)
    paths: Vec<PathBuf>,

    /// Stop after the first failed or errored test
    #[arg(short = 'x', long = "fail-fast")]
    fail_fast: bool,

    /// Run only the tests that failed or errored last time
    #[arg(long = "lf", conflicts_with = "failed_first")]
    last_failed: bool,

    /// Run previously failed tests first, then the rest
    #[arg(long = "ff")]
    failed_first: bool,

    /// Only run tests whose id contains this substring
    #[arg(short = 'p', long = "pattern")]
    pattern: Option<String>,

    /// Do not capture stdout/stderr
    #[arg(short = 's', long = "no-capture")]
    no_capture: bool,

    /// ASCII-only output
    #[arg(long = "ascii")]
    ascii: bool,

    /// Cache directory (default: .swiftest_cache under the project root)
    #[arg(long = "cache-dir")]
    cache_dir: Option<PathBuf>,

    /// Extra source roots prepended to the import search path
    #[arg(long = "pythonpath", value_delimiter = ',')]
    pythonpath: Vec<PathBuf>,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_config(self) -> (Config, Vec<PathBuf>) {
        let config = Config {
            pythonpath: self.pythonpath,
            fail_fast: self.fail_fast,
            last_failed: self.last_failed,
            failed_first: self.failed_first,
            capture_output: !self.no_capture,
            pattern: self.pattern,
            ascii_mode: self.ascii,
            cache_dir: self.cache_dir,
        };
        (config, self.paths)
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("swiftest={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

struct Glyphs {
    pass: &'static str,
    fail: &'static str,
    skip: &'static str,
}

impl Glyphs {
    fn new(ascii: bool) -> Self {
        if ascii {
            Self {
                pass: "PASS",
                fail: "FAIL",
                skip: "SKIP",
            }
        } else {
            Self {
                pass: "✓",
                fail: "✗",
                skip: "∅",
            }
        }
    }
}

fn outcome_label(outcome: Outcome, glyphs: &Glyphs) -> String {
    match outcome {
        Outcome::Passed => format!("{} {}", glyphs.pass.green(), "passed".green()),
        Outcome::Failed => format!("{} {}", glyphs.fail.red(), "failed".red()),
        Outcome::Errored => format!("{} {}", glyphs.fail.red(), "errored".red().bold()),
        Outcome::Skipped => format!("{} {}", glyphs.skip.yellow(), "skipped".yellow()),
        Outcome::Xfailed => format!("{} {}", glyphs.pass.yellow(), "xfailed".yellow()),
        Outcome::Xpassed => format!("{} {}", glyphs.fail.yellow(), "xpassed".yellow()),
    }
}

fn render(rx: Receiver<Event>) {
    let mut glyphs = Glyphs::new(false);
    for event in rx {
        match event {
            Event::RunStarted {
                total_items,
                ascii_mode,
            } => {
                glyphs = Glyphs::new(ascii_mode);
                println!("{}", format!("collected {total_items} tests").bold());
            }
            Event::TestStarted { .. } => {}
            Event::TestEnded {
                id,
                outcome,
                duration,
                captured_stdout,
                captured_stderr,
                diagnostic,
            } => {
                println!(
                    "{} {} {}",
                    outcome_label(outcome, &glyphs),
                    id,
                    format!("({duration:.2?})").dimmed(),
                );
                if let Some(diagnostic) = diagnostic {
                    if outcome.is_failure() {
                        render_diagnostic(&diagnostic);
                        if !captured_stdout.is_empty() {
                            println!("  {}", "--- captured stdout ---".dimmed());
                            for line in captured_stdout.lines() {
                                println!("  {line}");
                            }
                        }
                        if !captured_stderr.is_empty() {
                            println!("  {}", "--- captured stderr ---".dimmed());
                            for line in captured_stderr.lines() {
                                println!("  {line}");
                            }
                        }
                    } else if outcome == Outcome::Skipped {
                        println!("    {}", diagnostic.message.dimmed());
                    }
                }
            }
            Event::Warning { message } => {
                eprintln!("{} {}", "warning:".yellow().bold(), message);
            }
            Event::RunEnded { summary } => render_summary(&summary),
        }
    }
}

fn render_diagnostic(diagnostic: &swiftest_core::Diagnostic) {
    println!(
        "    {}: {}",
        diagnostic.exc_type.red().bold(),
        diagnostic.message
    );
    if let (Some(received), Some(expected)) = (&diagnostic.received, &diagnostic.expected) {
        println!("      received: {}", received.red());
        println!("      expected: {}", expected.green());
    }
    if let Some(frame) = diagnostic.frames.last() {
        println!(
            "      at {}:{} in {}",
            frame.path, frame.line, frame.function
        );
        for context in &diagnostic.context {
            let marker = if context.line == frame.line { ">" } else { " " };
            println!("      {marker} {:>4} | {}", context.line, context.source);
        }
    }
}

fn render_summary(summary: &Summary) {
    let mut parts = Vec::new();
    if summary.passed > 0 {
        parts.push(format!("{} passed", summary.passed).green().to_string());
    }
    if summary.failed > 0 {
        parts.push(format!("{} failed", summary.failed).red().to_string());
    }
    if summary.errored > 0 {
        parts.push(format!("{} errored", summary.errored).red().to_string());
    }
    if summary.skipped > 0 {
        parts.push(format!("{} skipped", summary.skipped).yellow().to_string());
    }
    if summary.xfailed > 0 {
        parts.push(format!("{} xfailed", summary.xfailed).yellow().to_string());
    }
    if summary.xpassed > 0 {
        parts.push(format!("{} xpassed", summary.xpassed).yellow().to_string());
    }
    if parts.is_empty() {
        parts.push("no tests ran".dimmed().to_string());
    }
    println!(
        "\n{} {}",
        parts.join(", "),
        format!("in {:.2?}", summary.duration).dimmed(),
    );
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let (config, paths) = cli.into_config();

    let (tx, rx) = crossbeam_channel::unbounded();
    let renderer = thread::spawn(move || render(rx));
    let sink = ChannelSink::new(tx);

    let outcome = swiftest_execution::run(&config, &paths, &sink);

    // Dropping the sink closes the channel and lets the renderer drain.
    drop(sink);
    let _ = renderer.join();

    match outcome {
        Ok(report) => ExitCode::from(report.exit_code()),
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            ExitCode::from(2)
        }
    }
}
