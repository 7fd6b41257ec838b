//! Pattern language CLI
//!
//! Runs pattern files against data files and renders the resulting
//! pattern tree as text or JSON, or just checks that a pattern parses.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use patl::{
    LogLevel, MemoryProvider, Pattern, PatternKind, PatternLanguage, PatternVisitor,
    RuntimeSettings, Value,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, warn};

#[derive(ClapParser)]
#[command(name = "patc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run binary pattern files against data files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pattern file against a data file
    Run {
        /// Pattern source file
        pattern: PathBuf,

        /// Binary data file to analyze
        data: PathBuf,

        /// Environment variables exposed to the pattern (KEY=VALUE)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// In-variables seeded into `in` globals (KEY=VALUE)
        #[arg(long = "in", value_name = "KEY=VALUE")]
        in_vars: Vec<String>,

        /// Permit calls to dangerous host functions
        #[arg(long)]
        allow_dangerous: bool,

        /// Emit the pattern tree as JSON instead of text
        #[arg(long)]
        json: bool,

        /// Base address the data is mapped at (display only)
        #[arg(long, value_name = "ADDRESS")]
        base_address: Option<u64>,
    },

    /// Parse and validate a pattern file without executing it
    Check {
        /// Pattern source file
        pattern: PathBuf,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            pattern,
            data,
            env,
            in_vars,
            allow_dangerous,
            json,
            base_address,
        } => run(
            &pattern,
            &data,
            &env,
            &in_vars,
            allow_dangerous,
            json,
            base_address,
        ),
        Commands::Check { pattern } => check(&pattern),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "patc", &mut io::stdout());
        }
    }
}

fn run(
    pattern_path: &Path,
    data_path: &Path,
    env: &[String],
    in_vars: &[String],
    allow_dangerous: bool,
    json: bool,
    base_address: Option<u64>,
) {
    let data = match std::fs::read(data_path) {
        Ok(data) => data,
        Err(e) => {
            error!("failed to read data file '{}': {}", data_path.display(), e);
            process::exit(1);
        }
    };
    let provider = MemoryProvider::with_base_address(data, base_address.unwrap_or(0));

    let env_vars = match parse_variables(env) {
        Ok(vars) => vars,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    let in_variables = match parse_variables(in_vars) {
        Ok(vars) => vars,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let mut runtime = PatternLanguage::new();
    if let Some(dir) = pattern_path.parent() {
        runtime.add_include_path(dir);
    }
    if allow_dangerous {
        runtime.allow_dangerous_functions(true);
    }

    let ok = runtime.execute_file(&provider, pattern_path, env_vars, in_variables);

    for (level, message) in runtime.get_console_log() {
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Warning => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
    }

    if !ok {
        if let Some(e) = runtime.get_error() {
            error!("pattern execution failed: {}", e);
        }
        process::exit(1);
    }

    let display_base = base_address.unwrap_or_else(|| {
        runtime.settings().base_address.unwrap_or(0)
    });

    if json {
        let report = Report::build(&runtime, display_base);
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                error!("failed to serialize report: {}", e);
                process::exit(1);
            }
        }
    } else {
        let mut renderer = TextRenderer::new(display_base);
        for pattern in runtime.get_patterns() {
            pattern.accept(&mut renderer);
        }
        print!("{}", renderer.output);

        if !runtime.get_out_variables().is_empty() {
            println!("out variables:");
            for (name, value) in runtime.get_out_variables() {
                println!("  {} = {}", name, value);
            }
        }
    }
}

fn check(pattern_path: &Path) {
    let source = match std::fs::read_to_string(pattern_path) {
        Ok(source) => source,
        Err(e) => {
            error!(
                "failed to read pattern file '{}': {}",
                pattern_path.display(),
                e
            );
            process::exit(1);
        }
    };

    let mut runtime = PatternLanguage::new();
    if let Some(dir) = pattern_path.parent() {
        runtime.add_include_path(dir);
    }

    let mut settings = RuntimeSettings::default();
    match runtime.parse_source(&source, &mut settings) {
        Ok(program) => {
            println!(
                "{}: OK ({} declarations, {} types, {} functions)",
                pattern_path.display(),
                program.declarations.len(),
                program.types.len(),
                program.functions.len()
            );
        }
        Err(e) => {
            error!("{}: {}", pattern_path.display(), e);
            process::exit(1);
        }
    }
}

/// Parse repeated `KEY=VALUE` options into typed values.
fn parse_variables(pairs: &[String]) -> Result<BTreeMap<String, Value>, String> {
    let mut vars = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(format!("invalid variable '{}', expected KEY=VALUE", pair));
        };
        vars.insert(key.to_string(), parse_value(value));
    }
    Ok(vars)
}

fn parse_value(text: &str) -> Value {
    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        if let Ok(v) = u128::from_str_radix(hex, 16) {
            return Value::Unsigned(v);
        }
    }
    if let Ok(v) = text.parse::<u128>() {
        return Value::Unsigned(v);
    }
    if let Ok(v) = text.parse::<i128>() {
        return Value::Signed(v);
    }
    if let Ok(v) = text.parse::<f64>() {
        return Value::Float(v);
    }
    Value::String(text.to_string())
}

/// Indented text rendering of the pattern tree.
struct TextRenderer {
    output: String,
    depth: usize,
    base: u64,
}

impl TextRenderer {
    fn new(base: u64) -> Self {
        TextRenderer {
            output: String::new(),
            depth: 0,
            base,
        }
    }

    fn line(&mut self, pattern: &Pattern) {
        if pattern.hidden {
            return;
        }
        let indent = "  ".repeat(self.depth);
        let value = pattern.format_value();
        let value = if value.is_empty() {
            String::new()
        } else {
            format!(" = {}", value)
        };
        self.output.push_str(&format!(
            "{}0x{:08X} | {:5} | {} {}{}\n",
            indent,
            self.base + pattern.offset,
            pattern.size,
            pattern.type_name,
            pattern.display_name(),
            value
        ));
    }

    fn nested(&mut self, pattern: &Pattern) {
        self.line(pattern);
        self.depth += 1;
        for child in pattern.children() {
            child.accept(self);
        }
        self.depth -= 1;
    }
}

impl PatternVisitor for TextRenderer {
    fn visit_unsigned(&mut self, pattern: &Pattern) {
        self.line(pattern);
    }
    fn visit_signed(&mut self, pattern: &Pattern) {
        self.line(pattern);
    }
    fn visit_float(&mut self, pattern: &Pattern) {
        self.line(pattern);
    }
    fn visit_boolean(&mut self, pattern: &Pattern) {
        self.line(pattern);
    }
    fn visit_character(&mut self, pattern: &Pattern) {
        self.line(pattern);
    }
    fn visit_character16(&mut self, pattern: &Pattern) {
        self.line(pattern);
    }
    fn visit_string(&mut self, pattern: &Pattern) {
        self.line(pattern);
    }
    fn visit_wide_string(&mut self, pattern: &Pattern) {
        self.line(pattern);
    }
    fn visit_enum(&mut self, pattern: &Pattern) {
        self.line(pattern);
    }
    fn visit_bitfield(&mut self, pattern: &Pattern) {
        self.nested(pattern);
    }
    fn visit_bitfield_field(&mut self, pattern: &Pattern) {
        self.line(pattern);
    }
    fn visit_struct(&mut self, pattern: &Pattern) {
        self.nested(pattern);
    }
    fn visit_union(&mut self, pattern: &Pattern) {
        self.nested(pattern);
    }
    fn visit_static_array(&mut self, pattern: &Pattern) {
        self.line(pattern);
        self.depth += 1;
        let count = match &pattern.kind {
            PatternKind::StaticArray { count, .. } => *count,
            _ => 0,
        };
        for index in 0..count {
            if let Some(entry) = pattern.array_entry(index) {
                entry.accept(self);
            }
        }
        self.depth -= 1;
    }
    fn visit_dynamic_array(&mut self, pattern: &Pattern) {
        self.nested(pattern);
    }
    fn visit_pointer(&mut self, pattern: &Pattern) {
        self.nested(pattern);
    }
    fn visit_padding(&mut self, _pattern: &Pattern) {}
    fn visit_error(&mut self, pattern: &Pattern) {
        self.line(pattern);
    }
}

#[derive(Serialize)]
struct Report {
    pattern_count: usize,
    patterns: Vec<serde_json::Value>,
    out_variables: BTreeMap<String, String>,
    console: Vec<String>,
}

impl Report {
    fn build(runtime: &PatternLanguage, base: u64) -> Self {
        Report {
            pattern_count: runtime.get_patterns().len(),
            patterns: runtime
                .get_patterns()
                .iter()
                .map(|p| pattern_to_json(p, base))
                .collect(),
            out_variables: runtime
                .get_out_variables()
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
            console: runtime
                .get_console_log()
                .iter()
                .map(|(level, message)| format!("[{}] {}", level.name(), message))
                .collect(),
        }
    }
}

fn pattern_to_json(pattern: &Pattern, base: u64) -> serde_json::Value {
    let mut node = serde_json::json!({
        "name": pattern.display_name(),
        "type": pattern.type_name,
        "address": base + pattern.offset,
        "size": pattern.size,
        "value": pattern.format_value(),
    });

    if let Some(comment) = &pattern.comment {
        node["comment"] = serde_json::json!(comment);
    }
    if let Some(color) = pattern.color {
        node["color"] = serde_json::json!(format!("{:06X}", color));
    }
    if pattern.hidden {
        node["hidden"] = serde_json::json!(true);
    }

    let children: Vec<serde_json::Value> = match &pattern.kind {
        PatternKind::StaticArray { count, .. } => (0..*count)
            .filter_map(|i| pattern.array_entry(i))
            .map(|entry| pattern_to_json(&entry, base))
            .collect(),
        _ => pattern
            .children()
            .iter()
            .map(|child| pattern_to_json(child, base))
            .collect(),
    };
    if !children.is_empty() {
        node["children"] = serde_json::Value::Array(children);
    }

    node
}
