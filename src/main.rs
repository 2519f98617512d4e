use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use text_buffer::{BufferConfig, LineEnding, RcLoader, TextBuffer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tbuf", about = "Inspect and edit files through the text buffer", version)]
struct Cli {
    /// Skip the backup copy written before saving
    #[arg(long, global = true)]
    no_backup: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print line, character and line ending counts
    Stats { file: PathBuf },
    /// Replace every regex match, expanding $1-style groups
    Replace {
        file: PathBuf,
        pattern: String,
        replacement: String,
        /// Print the result instead of saving it
        #[arg(long)]
        dry_run: bool,
    },
    /// Rewrite every line ending to one format
    Normalize {
        file: PathBuf,
        #[arg(value_enum)]
        format: Format,
    },
    /// Print a sample .tbufrc
    SampleRc,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Unix,
    Dos,
    Mac,
}

impl From<Format> for LineEnding {
    fn from(format: Format) -> Self {
        match format {
            Format::Unix => LineEnding::Unix,
            Format::Dos => LineEnding::Windows,
            Format::Mac => LineEnding::Mac,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "text_buffer=info,tbuf=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load RC configuration
    let mut config = RcLoader::load_config();
    if cli.no_backup {
        config.backup = false;
    }

    match cli.command {
        Commands::Stats { file } => stats(file, config)?,
        Commands::Replace {
            file,
            pattern,
            replacement,
            dry_run,
        } => {
            let mut buffer = TextBuffer::load(&file, config)?;
            let count = buffer.replace_pattern(&pattern, &replacement)?;
            if dry_run {
                print!("{}", buffer.get_text());
            } else if count > 0 {
                buffer.save()?;
            }
            info!(count, "replaced matches");
        }
        Commands::Normalize { file, format } => normalize(file, format.into(), config)?,
        Commands::SampleRc => print!("{}", RcLoader::generate_sample_rc()),
    }
    Ok(())
}

fn stats(file: PathBuf, config: BufferConfig) -> text_buffer::Result<()> {
    let buffer = TextBuffer::load(&file, config)?;
    let (mut unix, mut dos, mut mac) = (0, 0, 0);
    for row in 0..buffer.line_count() {
        match buffer.line_ending_for_row(row) {
            Some("\n") => unix += 1,
            Some("\r\n") => dos += 1,
            Some("\r") => mac += 1,
            _ => {}
        }
    }
    println!("{}", file.display());
    println!("  lines:      {}", buffer.line_count());
    println!("  characters: {}", buffer.max_character_index());
    println!("  blank rows: {}", (0..buffer.line_count()).filter(|row| buffer.is_row_blank(*row)).count());
    println!("  endings:    {unix} unix, {dos} dos, {mac} mac");
    Ok(())
}

fn normalize(file: PathBuf, ending: LineEnding, config: BufferConfig) -> text_buffer::Result<()> {
    let mut buffer = TextBuffer::load(&file, config)?;
    let changed = buffer
        .transact(None, |buffer| {
            let mut changed = 0;
            for row in 0..buffer.last_row() {
                if buffer.line_ending_for_row(row) == Some(ending.as_str()) {
                    continue;
                }
                let end = buffer.range_for_row(row, false).end;
                let next = buffer.range_for_row(row + 1, false).start;
                buffer.set_text_in_range_with(
                    text_buffer::Range::new(end, next),
                    ending.as_str(),
                    text_buffer::EditOptions {
                        normalize_line_endings: Some(false),
                        ..Default::default()
                    },
                )?;
                changed += 1;
            }
            Ok(changed)
        })?
        .unwrap_or(0);

    if changed > 0 {
        buffer.save()?;
    }
    info!(changed, path = %file.display(), "normalized line endings");
    Ok(())
}
