use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use dixa_export::date_util::{parse_date_arg, previous_month_range, year_to_date_range};
use dixa_export::fetch::client::parse_base;
use dixa_export::{
    ClientConfig, DateWindow, DixaClient, DixaExport, ExportMode, ExportOptions, ExportReport,
    WindowReport, WindowStatus, DEFAULT_CHANNEL,
};

#[derive(Parser)]
#[command(name = "dixa-export", about = "Export Dixa phone conversations with call metrics to CSV")]
struct Cli {
    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Attempts per request before giving up on rate limits and server errors
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Initial retry delay in milliseconds
    #[arg(long, global = true)]
    base_delay_ms: Option<u64>,

    /// Override the API base URL (search and detail endpoints)
    #[arg(long, global = true)]
    api_base: Option<String>,

    /// Override the exports base URL (bulk endpoint)
    #[arg(long, global = true)]
    exports_base: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Weekly windows from the bulk export endpoint (default range: previous month)
    Bulk(ExportArgs),
    /// Daily windows from the search endpoint (default range: year to date)
    Search(ExportArgs),
}

#[derive(Args)]
#[group(multiple = false)]
struct RangeArgs {
    /// Explicit range, YYYY-MM-DD or ISO-8601, both ends inclusive
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    range: Option<Vec<String>>,
    /// The last 7 days through today
    #[arg(long)]
    last7: bool,
    /// January 1st through today
    #[arg(long)]
    ytd: bool,
    /// The previous calendar month
    #[arg(long)]
    prev_month: bool,
}

#[derive(Args)]
struct ExportArgs {
    #[command(flatten)]
    range: RangeArgs,
    /// Output CSV path
    #[arg(long)]
    out: Option<PathBuf>,
    /// Channel to keep
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    channel: String,
    /// Export every channel
    #[arg(long, conflicts_with = "channel")]
    any_channel: bool,
    /// Look up each conversation for accurate answer and assignment data
    #[arg(long)]
    enrich: bool,
    /// Records per search page
    #[arg(long, default_value = "200")]
    page_size: usize,
    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl dixa_export::ExportProgress for StderrProgress {
    fn on_window_start(&self, window: &DateWindow, index: usize, total: usize) {
        eprintln!("[{}/{}] Fetching {}...", index + 1, total, window);
    }

    fn on_retry(&self, target: &str, attempt: u32, delay: Duration) {
        eprintln!("  {target}: attempt {attempt} failed, waiting {:.1}s", delay.as_secs_f64());
    }

    fn on_page_fetched(&self, _window: &DateWindow, page: u32, count: usize) {
        eprintln!("  Page {page}: {count} records");
    }

    fn on_window_complete(&self, report: &WindowReport) {
        match report.status {
            WindowStatus::Complete => eprintln!("  Done: {} records", report.records),
            _ => eprintln!(
                "  {:?}: {} records ({})",
                report.status,
                report.records,
                report.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    fn on_enrich_progress(&self, current: usize, total: usize, ok: usize, failed: usize) {
        if current == total {
            eprint!("\r  Enriching: {current}/{total} (ok {ok}, failed {failed})   \n");
        } else {
            eprint!("\r  Enriching: {current}/{total} (ok {ok}, failed {failed})   ");
        }
    }
}

fn resolve_range(mode: ExportMode, args: &RangeArgs, today: NaiveDate) -> anyhow::Result<(NaiveDate, NaiveDate)> {
    if let Some(bounds) = &args.range {
        let [start, end] = bounds.as_slice() else {
            anyhow::bail!("--range takes exactly two dates");
        };
        return Ok((parse_date_arg(start)?, parse_date_arg(end)?));
    }
    if args.last7 {
        return Ok((today - chrono::Duration::days(7), today));
    }
    if args.ytd {
        return Ok(year_to_date_range(today));
    }
    if args.prev_month {
        return Ok(previous_month_range(today));
    }
    Ok(mode.default_range(today))
}

fn client_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = ClientConfig::from_env()?;
    if let Some(base) = &cli.api_base {
        config.api_base = parse_base(base)?;
    }
    if let Some(base) = &cli.exports_base {
        config.exports_base = parse_base(base)?;
    }
    if let Some(n) = cli.max_attempts {
        config.retry.max_attempts = n.max(1);
    }
    if let Some(ms) = cli.base_delay_ms {
        config.retry.base_delay = Duration::from_millis(ms);
    }
    Ok(config)
}

fn print_summary(report: &ExportReport, out: &std::path::Path) {
    let s = &report.summary;
    println!("Export: {} ({} to {})", out.display(), s.start, s.end);
    println!("  Rows:                    {}", s.total);
    println!("  Answered within 1 min:   {}", s.answered_within_1min);
    println!("  Rejected or forwarded:   {}", s.rejected_or_forwarded);
    println!("  Taken from queue:        {}", s.via_queue);
    println!("  Taken from forward:      {}", s.via_forward);
    println!("  Duplicates removed:      {}", s.duplicates_removed);
    if s.skipped > 0 {
        println!("  Skipped (no id):         {}", s.skipped);
    }
    if s.details_ok + s.details_failed > 0 {
        println!("  Details ok / failed:     {} / {}", s.details_ok, s.details_failed);
    }
    let incomplete: Vec<&WindowReport> = report
        .windows
        .iter()
        .filter(|w| w.status != WindowStatus::Complete)
        .collect();
    if !incomplete.is_empty() {
        println!("  Incomplete windows:      {}", incomplete.len());
        for w in incomplete {
            println!("    {} {:?}: {}", w.window, w.status, w.error.as_deref().unwrap_or(""));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let (mode, args) = match &cli.command {
        Commands::Bulk(args) => (ExportMode::Bulk, args),
        Commands::Search(args) => (ExportMode::Search, args),
    };

    let today = chrono::Utc::now().date_naive();
    let (start, end) = resolve_range(mode, &args.range, today)?;
    let options = ExportOptions {
        channel: (!args.any_channel).then(|| args.channel.clone()),
        enrich: args.enrich,
        page_size: args.page_size.max(1),
        ..ExportOptions::new(mode, start, end)
    };

    let client = DixaClient::new(client_config(&cli)?)?;
    let export = DixaExport::new(client);
    let report = export.run(&options, &StderrProgress).await?;

    let out = args
        .out
        .clone()
        .unwrap_or_else(|| PathBuf::from(mode.default_output()));
    dixa_export::write_csv(&out, &report.records)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.summary)?);
    } else {
        print_summary(&report, &out);
    }
    Ok(())
}
