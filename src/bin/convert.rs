#![forbid(unsafe_code)]

//! Command-line client: submits a video link to a conversion server, follows
//! the job until it settles and saves the resulting audio file.

use std::{
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tubeconvert::{
    client::{ApiClient, AsyncApiClient},
    config::{ClientOverrides, resolve_client_settings},
    error::PollError,
    job::JobStatus,
    poller::{PollProgress, poll_until_terminal},
    protocol::VideoInfo,
    security::{ensure_not_root, sanitize_filename},
    source::SourceUrl,
};

const FALLBACK_EXT: &str = "mp3";

#[derive(Debug, Parser)]
#[command(name = "convert", about = "Convert a YouTube video to an audio file")]
struct ConvertArgs {
    /// YouTube watch, short or youtu.be link.
    url: String,
    /// Base URL of the conversion API (defaults to API_BASE_URL).
    #[arg(long = "api")]
    api: Option<String>,
    /// Directory the audio file is written to.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
    /// Cookie header forwarded to the server as-is.
    #[arg(long)]
    cookie: Option<String>,
    /// Seconds between status checks.
    #[arg(long, value_parser = parse_seconds)]
    interval: Option<Duration>,
    /// Give up after this many seconds without a final status.
    #[arg(long, value_parser = parse_seconds)]
    timeout: Option<Duration>,
    /// Print the download URL instead of saving the file.
    #[arg(long)]
    no_download: bool,
    /// Only look the video up and print its title and length.
    #[arg(long, conflicts_with = "no_download")]
    info: bool,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    match value.parse::<u64>() {
        Ok(0) => Err("must be at least 1 second".into()),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => Err(format!("`{value}` is not a whole number of seconds")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ConvertArgs::parse();
    ensure_not_root("convert")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let saved = run(args).await?;
    println!("{saved}");
    Ok(())
}

async fn run(args: ConvertArgs) -> Result<String> {
    let source = SourceUrl::parse(&args.url).with_context(|| format!("checking {}", args.url))?;
    let settings = resolve_client_settings(ClientOverrides {
        api_base_url: args.api,
        cookie_header: args.cookie,
        poll_interval: args.interval,
        poll_ceiling: args.timeout,
        env_path: args.env_file,
    })?;

    let client = AsyncApiClient::new(
        ApiClient::new(&settings.api_base_url)
            .with_context(|| format!("using API at {}", settings.api_base_url))?
            .with_cookie(settings.cookie_header),
    );
    if args.info {
        let response = client
            .extract(&source.canonical())
            .await
            .context("looking up video")?;
        return Ok(format_info(&response.info));
    }

    let receipt = client
        .submit(&source.canonical())
        .await
        .context("submitting conversion")?;
    eprintln!("Submitted {} as job {}", source.video_id(), receipt.id);

    let mut reporter = ProgressLine::default();
    let outcome = poll_until_terminal(&client, &receipt.id, &settings.poll, |progress| {
        reporter.show(progress)
    })
    .await;
    reporter.finish();

    let done = outcome.map_err(|err| match err {
        PollError::Timeout { elapsed } => anyhow!(
            "no final status after {}s; job {} may still finish, check {}",
            elapsed.as_secs(),
            receipt.id,
            receipt.status_location()
        ),
        PollError::WorkerReportedFailure(detail) => anyhow!("conversion failed: {detail}"),
        other => anyhow!(other),
    })?;

    let url = client
        .blocking()
        .resolve(&done.download_url)
        .context("resolving download URL")?;
    if args.no_download {
        return Ok(url.to_string());
    }

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;
    let stem = done.title.as_deref().unwrap_or(&done.id);
    let dest = output_path(&args.output, stem, &done.id, &download_extension(url.path()));
    let bytes = client
        .download_to(url.as_str(), &dest)
        .await
        .with_context(|| format!("downloading {}", url))?;
    tracing::info!(job_id = %done.id, bytes, path = %dest.display(), "saved artifact");
    Ok(dest.display().to_string())
}

/// Extension of the served file, falling back to mp3 for odd paths.
fn download_extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| FALLBACK_EXT.to_string())
}

/// Destination for the download. An existing file is never overwritten; the
/// job id is appended instead.
fn output_path(dir: &Path, stem: &str, id: &str, ext: &str) -> PathBuf {
    let name = sanitize_filename(stem);
    let candidate = dir.join(format!("{name}.{ext}"));
    if candidate.exists() {
        dir.join(format!("{name}-{id}.{ext}"))
    } else {
        candidate
    }
}

fn format_info(info: &VideoInfo) -> String {
    let mut lines = vec![info.title.clone()];
    if let Some(secs) = info.duration {
        lines.push(format!("length: {}:{:02}", secs / 60, secs % 60));
    }
    if let Some(thumbnail) = &info.thumbnail {
        lines.push(format!("thumbnail: {thumbnail}"));
    }
    lines.join("\n")
}

/// Single self-overwriting status line on stderr.
#[derive(Default)]
struct ProgressLine {
    drawn: bool,
}

impl ProgressLine {
    fn show(&mut self, progress: &PollProgress) {
        let label = match progress.status {
            JobStatus::Pending => "queued",
            _ => "converting",
        };
        let title = progress.title.as_deref().unwrap_or("");
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r{label} {:>3}% {title}", progress.progress);
        let _ = stderr.flush();
        self.drawn = true;
    }

    fn finish(&mut self) {
        if self.drawn {
            eprintln!();
            self.drawn = false;
        }
    }
}
