use std::io::{self, Write};
use std::sync::Mutex;

use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink, TabularizeResult, UnifyResult};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_unify(result: &UnifyResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_tabularize(result: &TabularizeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Writes one line per progress event to stderr.
#[derive(Default)]
pub struct ConsoleProgress {
    lock: Mutex<()>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        let line = match parse_phase(event.message.trim()) {
            Some((phase, payload)) => format!("{phase:>10}  {payload}"),
            None => event.message.trim().to_string(),
        };
        let line = match event.elapsed {
            Some(elapsed) => format!("{line} ({:.1}s)", elapsed.as_secs_f64()),
            None => line,
        };
        let _guard = self.lock.lock();
        let _ = writeln!(io::stderr(), "{line}");
    }
}

fn parse_phase(message: &str) -> Option<(&str, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (phase, payload) = rest.split_once(';')?;
    Some((phase, payload.trim()))
}

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

pub fn print_unify_summary(result: &UnifyResult) {
    println!("{CYAN}firegrid archive {}{RESET}", result.version);
    println!(
        "{GREEN}grid: {} at {} ({} x {} cells){RESET}",
        result.grid.crs, result.grid.resolution, result.grid.width, result.grid.height
    );
    println!("{GREEN}range: {}{RESET}", result.range);
    println!("{GREEN}variables: {}{RESET}", result.variables.len());
    for source in &result.sources {
        let color = match source.expected_completeness {
            Some(expected) if source.observed_completeness < expected => YELLOW,
            _ => GREEN,
        };
        let expected = source
            .expected_completeness
            .map(|value| format!(", expected {:.0}%", value * 100.0))
            .unwrap_or_default();
        println!(
            "{color}  {} ({}): {:.0}% complete{expected}{RESET}",
            source.source,
            source.kind,
            source.observed_completeness * 100.0
        );
    }
    print_failures(&result.failures);
    println!("{CYAN}written to {}{RESET}", result.archive_path);
}

pub fn print_tabularize_summary(result: &TabularizeResult) {
    println!(
        "{CYAN}dataset from archive {}{RESET}",
        result.archive_version
    );
    for partition in &result.partitions {
        println!(
            "{GREEN}  {} {}: {} rows, {} positive{RESET}",
            partition.split, partition.range, partition.rows, partition.positives
        );
    }
    println!("{GREEN}rows: {}{RESET}", result.rows);
    if result.gaps > 0 {
        println!("{YELLOW}gap days written as missing: {}{RESET}", result.gaps);
    }
    print_failures(&result.failures);
    println!("{CYAN}written to {}{RESET}", result.output_dir);
}

fn print_failures(failures: &[crate::store::SourceFailure]) {
    if failures.is_empty() {
        println!("{GREEN}errors: 0{RESET}");
        return;
    }
    println!("{RED}errors: {}{RESET}", failures.len());
    for failure in failures {
        match failure.date {
            Some(date) => println!("{RED}  {} {date}: {}{RESET}", failure.source, failure.error),
            None => println!("{RED}  {}: {}{RESET}", failure.source, failure.error),
        }
    }
}
