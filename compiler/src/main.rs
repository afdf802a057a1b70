use clap::Parser;
use std::path::PathBuf;

use schedc::diag::Diagnostic;
use schedc::pipeline::{self, CompilationState, DriverOptions, EmitTarget};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    Schedule,
    Clone,
    Fingerprint,
    Deps,
}

impl From<EmitStage> for EmitTarget {
    fn from(stage: EmitStage) -> Self {
        match stage {
            EmitStage::Schedule => EmitTarget::Schedule,
            EmitStage::Clone => EmitTarget::Clone,
            EmitStage::Fingerprint => EmitTarget::Fingerprint,
            EmitStage::Deps => EmitTarget::Deps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum DiagFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "schedc",
    version,
    about = "Applies scheduling directive scripts to stages and prints the resulting schedules"
)]
struct Cli {
    /// Input directive script
    source: PathBuf,

    /// What to print
    #[arg(long, value_enum, default_value_t = EmitStage::Schedule)]
    emit: EmitStage,

    /// Fold constants in every schedule expression
    #[arg(long)]
    simplify: bool,

    /// Substitute `name=value` into every schedule expression (repeatable)
    #[arg(long = "bind", value_parser = parse_binding)]
    bindings: Vec<(String, i64)>,

    /// Diagnostic output format
    #[arg(long, value_enum, default_value_t = DiagFormat::Text)]
    diag_format: DiagFormat,

    /// Print pass timing and debug logs
    #[arg(long)]
    verbose: bool,
}

fn parse_binding(s: &str) -> Result<(String, i64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, found '{s}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing name in '{s}'"));
    }
    let value = value
        .trim()
        .parse()
        .map_err(|e| format!("bad value in '{s}': {e}"))?;
    Ok((name.to_string(), value))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "schedc=debug" } else { "off" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_text(path: &std::path::Path, source: &str, diags: &[Diagnostic]) {
    for diag in diags {
        match diag.span {
            Some(span) => {
                let (line, col) = pipeline::line_col(source, span.start);
                eprintln!("{}:{}:{}: {}", path.display(), line, col, diag);
            }
            None => eprintln!("schedc: {}", diag),
        }
    }
}

fn print_json(diags: &[Diagnostic]) {
    let reports: Vec<_> = diags.iter().map(Diagnostic::report).collect();
    match serde_json::to_string_pretty(&reports) {
        Ok(json) => eprintln!("{json}"),
        Err(e) => eprintln!("schedc: error: cannot serialize diagnostics: {e}"),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.verbose {
        eprintln!("schedc: source = {}", cli.source.display());
        eprintln!("schedc: emit   = {:?}", cli.emit);
    }

    let source = match std::fs::read_to_string(&cli.source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("schedc: error: {}: {}", cli.source.display(), e);
            std::process::exit(2);
        }
    };

    let options = DriverOptions {
        emit: cli.emit.into(),
        simplify: cli.simplify,
        bindings: cli.bindings.clone(),
        verbose: cli.verbose,
    };

    let mut state = CompilationState::new();
    let result = pipeline::run_pipeline(&mut state, &source, &options, |_, _| {});

    match cli.diag_format {
        DiagFormat::Text => print_text(&cli.source, &source, &state.diagnostics),
        DiagFormat::Json => print_json(&state.diagnostics),
    }

    if let Err(e) = result {
        if cli.verbose {
            eprintln!("schedc: failed in {} pass", e.failing_pass.name());
        }
        std::process::exit(1);
    }
    if let Some(out) = state.emitted {
        print!("{out}");
    }
}
