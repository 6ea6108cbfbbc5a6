// logtail - main.rs
//
// Command-line entry point. Handles:
// 1. CLI argument parsing
// 2. Configuration loading and logging initialisation
// 3. Filter construction from the command-line flags
// 4. Running the pipeline once (--once) or following it live

use clap::Parser;
use logtail::app::factory::LogSourceFactory;
use logtail::app::scheduler::{ManualScheduler, TaskScheduler, ThreadScheduler};
use logtail::app::source::{LogSource, LogSourceListener};
use logtail::core::column::{columns, ColumnDescriptor, RetrievalState};
use logtail::core::filter::{FilterState, Predicate};
use logtail::core::model::{LevelFlags, Modification, Section};
use logtail::core::property::PropertySet;
use logtail::platform::config::{load_config, PipelineConfig, PlatformPaths};
use logtail::util::constants;
use logtail::util::error::{FilterError, LogTailError};
use logtail::util::logging;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on manual passes in `--once` mode. Each pass moves at most
/// one read or filter batch through every stage.
const MAX_ONCE_PASSES: usize = 100_000;

/// Rows fetched per read when printing.
const PRINT_CHUNK: usize = 1_000;

#[derive(Parser, Debug)]
#[command(name = "logtail", version, about = "Tail, merge and filter log files")]
struct Cli {
    /// Log files to follow. More than one file is merged by timestamp.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Case-insensitive substring filter.
    #[arg(short = 'f', long = "filter")]
    filter: Option<String>,

    /// Regular expression filter.
    #[arg(short = 'r', long = "regex")]
    regex: Option<String>,

    /// Wildcard filter (`*` and `?`).
    #[arg(short = 'w', long = "wildcard")]
    wildcard: Option<String>,

    /// Comma-separated levels to keep, e.g. "warn,error".
    #[arg(short = 'l', long = "level")]
    level: Option<String>,

    /// Filter expression, e.g. `$level >= warning and not $message contains "retry"`.
    #[arg(short = 'e', long = "expr")]
    expr: Option<String>,

    /// Path to config.toml (defaults to the platform config directory).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Read what is there, print it and exit instead of following.
    #[arg(long = "once")]
    once: bool,

    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PlatformPaths::resolve().config_file());
    let (config, warnings) = load_config(&config_path);

    logging::init(
        cli.debug,
        config.log_level.as_deref(),
        config.log_file.as_deref(),
    );

    tracing::info!(
        version = constants::APP_VERSION,
        debug = cli.debug,
        files = cli.files.len(),
        once = cli.once,
        "logtail starting"
    );
    for warning in &warnings {
        tracing::warn!(config = %config_path.display(), "{}", warning);
    }

    let predicate = match build_predicate(&cli) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "Invalid filter");
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };

    let result = if cli.once {
        run_once(&cli, config, predicate)
    } else {
        run_live(&cli, config, predicate)
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "logtail failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Combine every filter flag into one predicate. Flags that were not given
/// do not constrain anything.
fn build_predicate(cli: &Cli) -> Result<Predicate, FilterError> {
    let mut state = FilterState::default();
    if let Some(text) = &cli.filter {
        state.set_text(text)?;
    }
    if let Some(pattern) = &cli.regex {
        state.set_regex(pattern)?;
    }
    if let Some(pattern) = &cli.wildcard {
        state.set_wildcard(pattern)?;
    }
    if let Some(expression) = &cli.expr {
        state.set_expression(expression)?;
    }
    if let Some(list) = &cli.level {
        state.levels = LevelFlags::parse_list(list)
            .ok_or_else(|| FilterError::UnknownLevel { list: list.clone() })?;
    }
    Ok(state.to_predicate())
}

/// Columns printed for each row.
fn output_columns(cli: &Cli) -> Vec<ColumnDescriptor> {
    if cli.files.len() > 1 {
        vec![columns::DATA_SOURCE_NAME, columns::RAW_CONTENT]
    } else {
        vec![columns::RAW_CONTENT]
    }
}

/// Write the readable rows of `[from, to)` to stdout, in order, stopping at
/// the first row a page cache has not fetched yet. Returns the first row
/// not printed.
fn print_rows(
    source: &dyn LogSource,
    from: usize,
    to: usize,
    shown: &[ColumnDescriptor],
) -> Result<usize, LogTailError> {
    let cached = source.columns().contains(&columns::RETRIEVAL_STATE);
    let mut wanted = shown.to_vec();
    if cached {
        wanted.push(columns::RETRIEVAL_STATE);
    }
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut index = from;
    while index < to {
        let count = (to - index).min(PRINT_CHUNK);
        let buffer = source.get_entries(Section::new(index, count), &wanted);
        for entry in &buffer {
            if cached && entry.retrieval_state() != RetrievalState::Retrieved {
                out.flush().map_err(stdout_error)?;
                return Ok(index);
            }
            let line = entry.raw_content().unwrap_or_default();
            let written = match entry
                .value(&columns::DATA_SOURCE_NAME)
                .and_then(|v| v.as_text())
            {
                Some(name) => writeln!(out, "{name}: {line}"),
                None => writeln!(out, "{line}"),
            };
            written.map_err(stdout_error)?;
            index += 1;
        }
    }
    out.flush().map_err(stdout_error)?;
    Ok(index)
}

fn stdout_error(source: std::io::Error) -> LogTailError {
    LogTailError::Output(source)
}

/// Prints the rows of a source in order as they become readable.
struct Printer {
    shown: Vec<ColumnDescriptor>,
    /// Rows already written.
    printed: usize,
    /// Rows the source has reported.
    known: usize,
}

impl Printer {
    fn new(shown: Vec<ColumnDescriptor>) -> Self {
        Self {
            shown,
            printed: 0,
            known: 0,
        }
    }

    fn is_caught_up(&self) -> bool {
        self.printed >= self.known
    }

    /// Print whatever is readable between `printed` and `known`.
    fn flush(&mut self, source: &dyn LogSource) -> Result<(), LogTailError> {
        if !self.is_caught_up() {
            self.printed = print_rows(source, self.printed, self.known, &self.shown)?;
        }
        Ok(())
    }

    fn on_event(&mut self, source: &dyn LogSource, event: Event) -> Result<(), LogTailError> {
        match event {
            Event::Modified(Modification::Appended(section)) => {
                self.known = self.known.max(section.end());
            }
            Event::Modified(Modification::Removed(section)) => {
                self.known = self.known.min(section.index);
                self.printed = self.printed.min(section.index);
                tracing::debug!(from = section.index, "Rows withdrawn upstream");
            }
            Event::Modified(Modification::Reset) => {
                self.known = 0;
                self.printed = 0;
                tracing::info!("Source reset; printing from the start");
            }
            Event::Retrieved(section) => {
                tracing::trace!(%section, "Rows retrieved");
            }
        }
        self.flush(source)
    }
}

/// Drive every stage by hand until nothing moves, then print the result.
fn run_once(cli: &Cli, config: PipelineConfig, predicate: Predicate) -> Result<(), LogTailError> {
    let scheduler = Arc::new(ManualScheduler::new());
    let factory = LogSourceFactory::new(scheduler.clone(), config);
    let pipeline = factory.open_pipeline(&cli.files, predicate);

    let mut previous = None;
    for pass in 0..MAX_ONCE_PASSES {
        scheduler.run_once();
        let count = pipeline.count();
        let mut props = PropertySet::new();
        pipeline.get_all_properties(&mut props);
        let done = props.percentage_processed() >= 100.0;
        if done && previous == Some(count) {
            tracing::debug!(passes = pass + 1, rows = count, "Pipeline settled");
            break;
        }
        previous = Some(count);
    }

    // Each pass lets the cache fetch the pages the previous print missed.
    let mut printer = Printer::new(output_columns(cli));
    printer.known = pipeline.count();
    let mut result = Ok(());
    for _ in 0..MAX_ONCE_PASSES {
        if let Err(e) = printer.flush(pipeline.as_ref()) {
            result = Err(e);
            break;
        }
        if printer.is_caught_up() {
            break;
        }
        scheduler.run_once();
    }
    pipeline.dispose();
    result
}

/// What the pipeline reports to the printing thread.
enum Event {
    Modified(Modification),
    Retrieved(Section),
}

/// Forwards pipeline notifications to the printing thread.
struct ChannelListener {
    sender: mpsc::Sender<Event>,
}

impl LogSourceListener for ChannelListener {
    fn on_modified(&self, _source: &dyn LogSource, modification: Modification) {
        // The receiver only goes away on shutdown.
        let _ = self.sender.send(Event::Modified(modification));
    }

    fn on_retrieved(&self, _source: &dyn LogSource, section: Section) {
        let _ = self.sender.send(Event::Retrieved(section));
    }
}

/// Follow the pipeline on worker threads, printing rows as they arrive.
fn run_live(cli: &Cli, config: PipelineConfig, predicate: Predicate) -> Result<(), LogTailError> {
    let scheduler: Arc<dyn TaskScheduler> = Arc::new(ThreadScheduler::new(config.worker_threads)?);
    let factory = LogSourceFactory::new(scheduler, config);
    let pipeline = factory.open_pipeline(&cli.files, predicate);

    let (sender, receiver) = mpsc::channel();
    pipeline.add_listener(
        Arc::new(ChannelListener { sender }),
        Duration::from_millis(constants::DEFAULT_LISTENER_MAX_WAIT_MS),
        constants::DEFAULT_LISTENER_BATCH_LINES,
    );

    let mut printer = Printer::new(output_columns(cli));
    for event in receiver {
        printer.on_event(pipeline.as_ref(), event)?;
    }

    pipeline.dispose();
    Ok(())
}
