//! littlelang Compiler CLI
//!
//! Runs littlelang programs in process or compiles them to relocatable
//! objects for the system linker.

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

use littlelang::x64::object::write_object_file;
use littlelang::{compile_object, run_source, ObjectFormat};

#[derive(Parser)]
#[command(name = "littlelang")]
#[command(version)]
#[command(about = "littlelang - a tiny language compiled to x86-64", long_about = None)]
struct Cli {
    /// Log compiler internals (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source file and execute it in memory
    Run {
        /// Input littlelang source file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Function to execute
        #[arg(long, default_value = "main")]
        entry: String,
    },

    /// Compile a source file to a relocatable object file
    Compile {
        /// Input littlelang source file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Object file format (default: the host's)
        #[arg(long, value_enum)]
        format: Option<FormatArg>,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Link the object into an executable next to it
        #[arg(long)]
        link: bool,

        /// C compiler driver used for linking
        #[arg(long, default_value = "cc")]
        linker: String,
    },

    /// Parse and compile a source file without running or writing it
    Check {
        /// Input littlelang source file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Elf,
    Macho,
}

impl From<FormatArg> for ObjectFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Elf => ObjectFormat::Elf,
            FormatArg::Macho => ObjectFormat::MachO,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run { file, entry } => cmd_run(&file, &entry),
        Commands::Compile {
            file,
            format,
            output,
            link,
            linker,
        } => {
            let format = format.map(ObjectFormat::from).unwrap_or_else(ObjectFormat::host);
            cmd_compile(&file, format, output, link.then_some(linker.as_str()))
        }
        Commands::Check { file } => cmd_check(&file),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn read_source(file: &Path) -> Option<String> {
    match fs::read_to_string(file) {
        Ok(s) => Some(s),
        Err(e) => {
            eprintln!("{}: could not read '{}': {}",
                "error".red().bold(), file.display(), e);
            None
        }
    }
}

/// Print a compilation error with source context
fn print_error(e: &littlelang::Error, source: &str) {
    let formatted = e.format_with_source(source);
    for line in formatted.lines() {
        if let Some(message) = line.strip_prefix("error:") {
            eprintln!("{}:{}", "error".red().bold(), message);
        } else {
            eprintln!("{}", line);
        }
    }
}

fn cmd_run(file: &Path, entry: &str) -> ExitCode {
    let Some(source) = read_source(file) else {
        return ExitCode::FAILURE;
    };

    match run_source(&source, entry) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&e, &source);
            ExitCode::FAILURE
        }
    }
}

fn cmd_compile(file: &Path, format: ObjectFormat, output: Option<PathBuf>, linker: Option<&str>) -> ExitCode {
    let Some(source) = read_source(file) else {
        return ExitCode::FAILURE;
    };

    let object = match compile_object(&source) {
        Ok(object) => object,
        Err(e) => {
            print_error(&e, &source);
            return ExitCode::FAILURE;
        }
    };

    let output_path = output.unwrap_or_else(|| file.with_extension("o"));
    if let Err(e) = write_object_file(&object, format, &output_path) {
        eprintln!("{}: could not write '{}': {}",
            "error".red().bold(), output_path.display(), e);
        return ExitCode::FAILURE;
    }
    println!("{} {} -> {}",
        "Compiled".green().bold(),
        file.display(),
        output_path.display());

    match linker {
        Some(linker) => link(linker, &output_path),
        None => ExitCode::SUCCESS,
    }
}

/// Executable name for a linked object: the object path without its
/// extension, or with `.out` appended when it has none
fn executable_path(object_path: &Path) -> PathBuf {
    let stripped = object_path.with_extension("");
    if stripped == object_path {
        object_path.with_extension("out")
    } else {
        stripped
    }
}

fn link(linker: &str, object_path: &Path) -> ExitCode {
    let executable = executable_path(object_path);
    let status = Command::new(linker)
        .arg(object_path)
        .arg("-o")
        .arg(&executable)
        .status();

    match status {
        Ok(status) if status.success() => {
            println!("{} {}", "Linked".green().bold(), executable.display());
            ExitCode::SUCCESS
        }
        Ok(status) => {
            eprintln!("{}: {} exited with {}", "error".red().bold(), linker, status);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{}: could not run '{}': {}", "error".red().bold(), linker, e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_check(file: &Path) -> ExitCode {
    let Some(source) = read_source(file) else {
        return ExitCode::FAILURE;
    };

    match compile_object(&source) {
        Ok(object) => {
            println!("{} {} ({} function(s), {} bytes)",
                "Checked".green().bold(),
                file.display(),
                object.symbols.len(),
                object.code().len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_error(&e, &source);
            ExitCode::FAILURE
        }
    }
}
