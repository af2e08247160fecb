use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use logroll::{
    parse_file_size, Clock, CloseRollingPolicy, DeletionRetry, FileNamePattern, RollingFileWriter, RolloverConfig,
    SystemClock, TimeBasedTrigger, Timezone, WriterConfig,
};

#[derive(Parser)]
#[command(name = "logroll", version, about = "Time-based log rollover with shutdown finalization")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append stdin lines to the active file, then finalize it on EOF
    Append {
        #[command(flatten)]
        rolling: RollingArgs,

        /// Line written at the top of each new active file
        #[arg(long)]
        header: Option<String>,

        /// Line written before the active file is closed
        #[arg(long)]
        footer: Option<String>,

        /// Flush after every line
        #[arg(long)]
        immediate_flush: bool,
    },
    /// Archive an existing active file for the current period
    Finalize {
        #[command(flatten)]
        rolling: RollingArgs,
    },
}

#[derive(Args)]
struct RollingArgs {
    /// Active log file (omit to write straight to the period's name)
    #[arg(long)]
    active: Option<PathBuf>,

    /// Archive file-name pattern, e.g. logs/app-%d{yyyy-MM-dd}.log.gz
    #[arg(long)]
    pattern: String,

    /// Timezone for period boundaries (UTC, Asia/Shanghai, +0800, ...)
    #[arg(long, default_value = "UTC")]
    timezone: String,

    /// Deflate level for .gz/.zip archives (1-9)
    #[arg(long, default_value_t = 6)]
    level: u32,

    /// Deletion attempts before leaving the uncompressed file behind
    #[arg(long, default_value_t = 10)]
    delete_attempts: u32,

    /// Also roll when the active file reaches this size (e.g. 10KB); the
    /// pattern needs %i
    #[arg(long)]
    max_file_size: Option<String>,
}

impl RollingArgs {
    fn build_policy(&self) -> Result<Arc<CloseRollingPolicy>> {
        let pattern = FileNamePattern::parse(&self.pattern)
            .with_context(|| format!("invalid pattern {}", self.pattern))?;
        let timezone: Timezone = self
            .timezone
            .parse()
            .with_context(|| format!("invalid timezone {}", self.timezone))?;
        let clock = Arc::new(SystemClock);
        let mut trigger = TimeBasedTrigger::new(pattern, timezone, clock.now())?;
        if let Some(size) = &self.max_file_size {
            let bytes =
                parse_file_size(size).with_context(|| format!("invalid size {size}"))?;
            trigger = trigger.with_max_file_size(bytes)?;
        }

        let mut config = match &self.active {
            Some(active) => RolloverConfig::new(active),
            None => RolloverConfig::prudent(),
        };
        config.compression_level = self.level;
        config.deletion_retry = DeletionRetry::default().max_attempts(self.delete_attempts);

        Ok(Arc::new(CloseRollingPolicy::new(
            config,
            Arc::new(trigger),
            clock,
        )))
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Append {
            rolling,
            header,
            footer,
            immediate_flush,
        } => {
            let policy = rolling.build_policy()?;
            let config = WriterConfig {
                header,
                footer,
                immediate_flush,
            };
            let writer = RollingFileWriter::open(config, Arc::clone(&policy))
                .context("failed to open active file")?;

            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = line.context("failed to read stdin")?;
                writer.append(line.as_bytes())?;
            }
            info!("stdin closed after {} lines", writer.records());
            writer.stop()?;
            wait_for_cleanup(&policy);
        }
        Commands::Finalize { rolling } => {
            let policy = rolling.build_policy()?;
            policy.on_shutdown();
            wait_for_cleanup(&policy);
        }
    }
    Ok(())
}

/// The process is about to exit, which would kill the deletion thread.
fn wait_for_cleanup(policy: &CloseRollingPolicy) {
    if let Some(deletion) = policy.pending_deletion() {
        if let Err(err) = deletion.wait() {
            log::error!("cleanup incomplete: {err}");
        }
    }
}
