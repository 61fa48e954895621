//! Conversion backend that shells out to yt-dlp.
//!
//! yt-dlp is asked to print machine readable lines alongside its normal
//! output:
//!
//! ```text
//! TITLE:<video title>
//! PROGRESS:<percent>%
//! FILE:<final path after post-processing>
//! ```
//!
//! Everything else on stdout/stderr is only kept to explain a failure.
//!
//! Lookups without conversion use `--dump-json`, which prints one JSON
//! object describing the video.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::io::ReaderStream;

use crate::backend::{
    ArtifactBody, ConversionBackend, ConversionRequest, WorkerHandle, WorkerReporter,
};
use crate::error::BackendError;
use crate::job::{ArtifactLocation, JobId, WorkerEvent};
use crate::protocol::VideoInfo;
use crate::source::SourceUrl;

const TITLE_PREFIX: &str = "TITLE:";
const PROGRESS_PREFIX: &str = "PROGRESS:";
const FILE_PREFIX: &str = "FILE:";

// Download progress stops short of 100 so post-processing still shows as work.
const MAX_DOWNLOAD_PROGRESS: u8 = 99;
const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct YtDlpSettings {
    pub program: PathBuf,
    pub output_dir: PathBuf,
    pub audio_format: String,
    /// Netscape-format cookies file passed with `--cookies`.
    pub cookies_file: Option<PathBuf>,
}

pub struct YtDlpBackend {
    settings: YtDlpSettings,
}

impl YtDlpBackend {
    pub fn new(settings: YtDlpSettings) -> Self {
        Self { settings }
    }

    fn output_template(&self, id: &JobId) -> PathBuf {
        self.settings.output_dir.join(format!("{id}.%(ext)s"))
    }

    fn command_args(&self, request: &ConversionRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "--newline",
            "--no-playlist",
            "--no-colors",
            "-x",
            "--audio-format",
            self.settings.audio_format.as_str(),
            "--audio-quality",
            "0",
            "--no-simulate",
            "--progress",
            "--print",
            "before_dl:TITLE:%(title)s",
            "--print",
            "after_move:FILE:%(filepath)s",
            "--progress-template",
            "download:PROGRESS:%(progress._percent_str)s",
            "-o",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(self.output_template(&request.job_id).to_string_lossy().into_owned());
        self.push_source(&mut args, &request.source, request.cookies.as_deref());
        args
    }

    fn describe_args(&self, source: &SourceUrl, cookies: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = [
            "--dump-json",
            "--no-download",
            "--no-playlist",
            "--no-warnings",
            "-f",
            "bestaudio/best",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        self.push_source(&mut args, source, cookies);
        args
    }

    /// Cookie material, then the URL behind `--` so it is never read as a flag.
    fn push_source(&self, args: &mut Vec<String>, source: &SourceUrl, cookies: Option<&str>) {
        if let Some(cookies_file) = &self.settings.cookies_file {
            args.push("--cookies".into());
            args.push(cookies_file.to_string_lossy().into_owned());
        }
        if let Some(cookies) = cookies {
            args.push("--add-header".into());
            args.push(format!("Cookie:{cookies}"));
        }
        args.push("--".into());
        args.push(source.canonical());
    }

    fn launch_error(&self, err: std::io::Error) -> BackendError {
        BackendError::Launch {
            tool: self.settings.program.display().to_string(),
            reason: err.to_string(),
        }
    }

    fn job_outputs(&self, id: &JobId) -> JobOutputs {
        JobOutputs {
            dir: self.settings.output_dir.clone(),
            job_id: id.clone(),
            audio_format: self.settings.audio_format.clone(),
        }
    }
}

/// Files yt-dlp writes for one job: `<dir>/<job id>.*`.
#[derive(Debug, Clone)]
struct JobOutputs {
    dir: PathBuf,
    job_id: JobId,
    audio_format: String,
}

impl JobOutputs {
    fn expected(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.job_id, self.audio_format))
    }

    /// Removes the finished file and any partial downloads of this job.
    async fn remove_all(&self) {
        let prefix = format!("{}.", self.job_id);
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                continue;
            }
            if let Err(err) = tokio::fs::remove_file(entry.path()).await {
                tracing::warn!(path = %entry.path().display(), error = %err, "could not remove leftover output");
            }
        }
    }
}

#[async_trait]
impl ConversionBackend for YtDlpBackend {
    fn name(&self) -> &'static str {
        "ytdlp"
    }

    async fn dispatch(&self, request: ConversionRequest) -> Result<WorkerHandle, BackendError> {
        tokio::fs::create_dir_all(&self.settings.output_dir).await?;

        let child = Command::new(&self.settings.program)
            .args(self.command_args(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| self.launch_error(err))?;

        tracing::debug!(job_id = %request.job_id, pid = child.id(), "yt-dlp started");
        let (reporter, handle) = WorkerHandle::channel();
        let outputs = self.job_outputs(&request.job_id);
        tokio::spawn(supervise(child, reporter, outputs));
        Ok(handle)
    }

    async fn open_artifact(
        &self,
        artifact: &ArtifactLocation,
    ) -> Result<ArtifactBody, BackendError> {
        let ArtifactLocation::File(path) = artifact else {
            return Err(BackendError::Unavailable(
                "yt-dlp backend only serves local files".into(),
            ));
        };
        let file = tokio::fs::File::open(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                BackendError::Unavailable(format!("{} no longer exists", path.display()))
            } else {
                BackendError::Io(err)
            }
        })?;
        let length = file.metadata().await.ok().map(|meta| meta.len());
        Ok(ArtifactBody::Stream {
            body: ReaderStream::new(file).boxed(),
            length,
        })
    }

    async fn describe(
        &self,
        source: &SourceUrl,
        cookies: Option<&str>,
    ) -> Result<VideoInfo, BackendError> {
        let mut command = Command::new(&self.settings.program);
        command
            .args(self.describe_args(source, cookies))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout(DESCRIBE_TIMEOUT, command.output())
            .await
            .map_err(|_| {
                BackendError::Upstream(format!(
                    "yt-dlp lookup timed out after {}s",
                    DESCRIBE_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|err| self.launch_error(err))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Upstream(lookup_failure(&stderr, output.status)));
        }
        parse_video_info(&output.stdout)
    }

    async fn discard_artifact(&self, artifact: &ArtifactLocation) -> Result<(), BackendError> {
        let ArtifactLocation::File(path) = artifact else {
            return Ok(());
        };
        if !path.starts_with(&self.settings.output_dir) {
            tracing::warn!(path = %path.display(), "refusing to delete file outside the artifact directory");
            return Ok(());
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OutputLine {
    Title(String),
    Progress(u8),
    File(PathBuf),
    Other(String),
}

fn parse_line(line: &str) -> OutputLine {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(title) = line.strip_prefix(TITLE_PREFIX) {
        return OutputLine::Title(title.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix(PROGRESS_PREFIX) {
        if let Some(percent) = parse_percent(rest) {
            return OutputLine::Progress(percent);
        }
    }
    if let Some(path) = line.strip_prefix(FILE_PREFIX) {
        let path = path.trim();
        if !path.is_empty() {
            return OutputLine::File(PathBuf::from(path));
        }
    }
    OutputLine::Other(line.trim().to_string())
}

fn parse_percent(raw: &str) -> Option<u8> {
    let digits: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f64 = digits.parse().ok()?;
    Some(value.clamp(0.0, 100.0).floor() as u8)
}

/// What one output stream told us besides progress.
#[derive(Debug, Default)]
struct StreamSummary {
    file: Option<PathBuf>,
    last_error: Option<String>,
    last_line: Option<String>,
}

async fn read_stream<R>(stream: R, reporter: WorkerReporter) -> StreamSummary
where
    R: AsyncRead + Unpin,
{
    let mut summary = StreamSummary::default();
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "stopped reading yt-dlp output");
                break;
            }
        };
        match parse_line(&line) {
            // Printed once, so it must not be dropped on a full buffer.
            OutputLine::Title(title) => {
                reporter.send(WorkerEvent::Title(title)).await;
            }
            OutputLine::Progress(percent) => {
                reporter.offer(WorkerEvent::Progress(percent.min(MAX_DOWNLOAD_PROGRESS)));
            }
            OutputLine::File(path) => summary.file = Some(path),
            OutputLine::Other(text) if text.is_empty() => {}
            OutputLine::Other(text) => {
                if text.starts_with("ERROR:") {
                    summary.last_error = Some(text.clone());
                }
                summary.last_line = Some(text);
            }
        }
    }
    summary
}

async fn supervise(mut child: Child, reporter: WorkerReporter, outputs: JobOutputs) {
    reporter.send(WorkerEvent::Started).await;

    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_stream(out, reporter.clone())));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_stream(err, reporter.clone())));

    let status = tokio::select! {
        status = child.wait() => Some(status),
        () = reporter.closed() => None,
    };
    let Some(status) = status else {
        tracing::debug!(job_id = %outputs.job_id, "job abandoned, stopping yt-dlp");
        if let Err(err) = child.kill().await {
            tracing::warn!(job_id = %outputs.job_id, error = %err, "could not stop yt-dlp");
        }
        join_summary(stdout).await;
        join_summary(stderr).await;
        outputs.remove_all().await;
        return;
    };
    let stdout = join_summary(stdout).await;
    let stderr = join_summary(stderr).await;

    let event = match status {
        Ok(status) if status.success() => {
            completion_event(stdout.file.or(stderr.file), &outputs.expected())
        }
        Ok(status) => WorkerEvent::Failed(failure_detail(status, &stderr, &stdout)),
        Err(err) => WorkerEvent::Failed(format!("could not wait for yt-dlp: {err}")),
    };
    reporter.send(event).await;
}

async fn join_summary(task: Option<tokio::task::JoinHandle<StreamSummary>>) -> StreamSummary {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => StreamSummary::default(),
    }
}

fn completion_event(reported: Option<PathBuf>, fallback: &Path) -> WorkerEvent {
    let candidate = reported
        .filter(|path| path.is_file())
        .or_else(|| fallback.is_file().then(|| fallback.to_path_buf()));
    match candidate {
        Some(path) => WorkerEvent::Completed {
            artifact: ArtifactLocation::File(path),
            title: None,
        },
        None => WorkerEvent::Failed("yt-dlp finished without producing an audio file".into()),
    }
}

fn failure_detail(status: ExitStatus, stderr: &StreamSummary, stdout: &StreamSummary) -> String {
    stderr
        .last_error
        .clone()
        .or_else(|| stdout.last_error.clone())
        .or_else(|| stderr.last_line.clone())
        .unwrap_or_else(|| format!("yt-dlp exited with {status}"))
}

/// The parts of yt-dlp's `--dump-json` output worth passing on.
#[derive(Debug, Deserialize)]
struct DumpedVideo {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<DumpedThumbnail>,
    #[serde(default)]
    duration: Option<f64>,
    /// Stream URL of the selected format.
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DumpedThumbnail {
    url: String,
}

fn parse_video_info(stdout: &[u8]) -> Result<VideoInfo, BackendError> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with('{'))
        .ok_or_else(|| BackendError::Upstream("yt-dlp printed no video metadata".into()))?;
    let dumped: DumpedVideo = serde_json::from_str(line)
        .map_err(|err| BackendError::Upstream(format!("unreadable yt-dlp metadata: {err}")))?;

    let title = dumped
        .title
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .ok_or_else(|| BackendError::Upstream("yt-dlp metadata has no title".into()))?;
    // yt-dlp lists thumbnails smallest first.
    let thumbnail = dumped
        .thumbnail
        .or_else(|| dumped.thumbnails.into_iter().last().map(|thumb| thumb.url));
    Ok(VideoInfo {
        title,
        thumbnail,
        duration: dumped
            .duration
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| secs.floor() as u64),
        audio_url: dumped.url,
    })
}

fn lookup_failure(stderr: &str, status: ExitStatus) -> String {
    let lines = || stderr.lines().map(str::trim).rev();
    lines()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines().find(|line| !line.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| format!("yt-dlp exited with {status}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceUrl;
    use tempfile::tempdir;

    fn request(id: &str, cookies: Option<&str>) -> ConversionRequest {
        ConversionRequest {
            job_id: JobId::parse(id).unwrap(),
            source: SourceUrl::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PL1")
                .unwrap(),
            cookies: cookies.map(str::to_string),
        }
    }

    fn backend(program: PathBuf, output_dir: PathBuf) -> YtDlpBackend {
        YtDlpBackend::new(YtDlpSettings {
            program,
            output_dir,
            audio_format: "mp3".into(),
            cookies_file: None,
        })
    }

    async fn collect(mut handle: WorkerHandle) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn parses_machine_readable_lines() {
        assert_eq!(parse_line("TITLE:Sample Track"), OutputLine::Title("Sample Track".into()));
        assert_eq!(parse_line("PROGRESS: 42.7%"), OutputLine::Progress(42));
        assert_eq!(parse_line("PROGRESS:100.0%\r"), OutputLine::Progress(100));
        assert_eq!(
            parse_line("FILE:/data/artifacts/j1.mp3"),
            OutputLine::File(PathBuf::from("/data/artifacts/j1.mp3"))
        );
        assert_eq!(
            parse_line("PROGRESS:  N/A"),
            OutputLine::Other("PROGRESS:  N/A".into())
        );
        assert_eq!(
            parse_line("[youtube] dQw4w9WgXcQ: Downloading webpage"),
            OutputLine::Other("[youtube] dQw4w9WgXcQ: Downloading webpage".into())
        );
    }

    #[test]
    fn command_uses_canonical_url_and_cookie_material() {
        let mut backend = backend(PathBuf::from("yt-dlp"), PathBuf::from("/data/artifacts"));
        backend.settings.cookies_file = Some(PathBuf::from("/data/cookies.txt"));
        let args = backend.command_args(&request("j1", Some("SID=1; HSID=2")));

        assert_eq!(args.last().unwrap(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(args[args.len() - 2], "--");
        let joined = args.join(" ");
        assert!(joined.contains("-x --audio-format mp3"));
        assert!(joined.contains("-o /data/artifacts/j1.%(ext)s"));
        assert!(joined.contains("--cookies /data/cookies.txt"));
        assert!(joined.contains("--add-header Cookie:SID=1; HSID=2"));
    }

    #[test]
    fn lookup_args_never_download() {
        let backend = backend(PathBuf::from("yt-dlp"), PathBuf::from("/data/artifacts"));
        let source = SourceUrl::parse("https://youtu.be/dQw4w9WgXcQ").unwrap();
        let args = backend.describe_args(&source, Some("SID=1"));
        assert_eq!(&args[..3], ["--dump-json", "--no-download", "--no-playlist"]);
        assert!(args.join(" ").contains("--add-header Cookie:SID=1 -- "));
        assert_eq!(args.last().unwrap(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }

    #[test]
    fn video_info_comes_from_the_last_json_line() {
        let stdout = br#"[info] something chatty
{"id": "dQw4w9WgXcQ", "title": " Sample Track ", "duration": 212.4, "url": "https://media.test/a", "thumbnails": [{"url": "https://i.ytimg.com/s.jpg"}, {"url": "https://i.ytimg.com/l.jpg"}]}
"#;
        let info = parse_video_info(stdout).unwrap();
        assert_eq!(info.title, "Sample Track");
        assert_eq!(info.duration, Some(212));
        assert_eq!(info.thumbnail.as_deref(), Some("https://i.ytimg.com/l.jpg"));
        assert_eq!(info.audio_url.as_deref(), Some("https://media.test/a"));

        assert!(matches!(
            parse_video_info(b"{\"title\": \"\"}"),
            Err(BackendError::Upstream(_))
        ));
        assert!(matches!(parse_video_info(b""), Err(BackendError::Upstream(_))));
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let temp = tempdir().unwrap();
        let backend = backend(
            temp.path().join("does-not-exist"),
            temp.path().join("artifacts"),
        );
        let err = backend.dispatch(request("j1", None)).await.unwrap_err();
        assert!(matches!(err, BackendError::Launch { .. }));
    }

    #[tokio::test]
    async fn refuses_to_discard_outside_output_dir() {
        let temp = tempdir().unwrap();
        let outside = temp.path().join("keep.mp3");
        std::fs::write(&outside, b"keep").unwrap();
        let backend = backend(PathBuf::from("yt-dlp"), temp.path().join("artifacts"));

        backend
            .discard_artifact(&ArtifactLocation::File(outside.clone()))
            .await
            .unwrap();
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn missing_artifact_is_unavailable() {
        let temp = tempdir().unwrap();
        let backend = backend(PathBuf::from("yt-dlp"), temp.path().to_path_buf());
        let err = backend
            .open_artifact(&ArtifactLocation::File(temp.path().join("gone.mp3")))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[cfg(unix)]
    mod stub {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::os::unix::process::ExitStatusExt;

        fn install_stub(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("yt-dlp");
            std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        #[test]
        fn failure_detail_prefers_error_lines() {
            let stderr = StreamSummary {
                file: None,
                last_error: Some("ERROR: Video unavailable".into()),
                last_line: Some("trailing noise".into()),
            };
            let status = ExitStatus::from_raw(1 << 8);
            assert_eq!(
                failure_detail(status, &stderr, &StreamSummary::default()),
                "ERROR: Video unavailable"
            );

            let quiet = StreamSummary::default();
            assert!(failure_detail(status, &quiet, &quiet).starts_with("yt-dlp exited with"));
        }

        const SUCCESS_SCRIPT: &str = r#"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) shift; out="$1" ;;
  esac
  shift
done
echo "[youtube] Extracting URL"
echo "TITLE:Stub Title"
echo "PROGRESS:  12.5%"
echo "PROGRESS: 100.0%"
file=$(printf '%s' "$out" | sed 's/%(ext)s/mp3/')
printf 'ID3stub' > "$file"
echo "FILE:$file"
"#;

        const FAILURE_SCRIPT: &str = r#"
echo "[youtube] Extracting URL"
echo "ERROR: [youtube] dQw4w9WgXcQ: Video unavailable" >&2
echo "cleanup done" >&2
exit 1
"#;

        #[tokio::test]
        async fn successful_run_reports_title_progress_and_file() {
            let temp = tempdir().unwrap();
            let stub = install_stub(temp.path(), SUCCESS_SCRIPT);
            let out_dir = temp.path().join("artifacts");
            let backend = backend(stub, out_dir.clone());

            let events = collect(backend.dispatch(request("j1", None)).await.unwrap()).await;

            assert_eq!(events.first(), Some(&WorkerEvent::Started));
            assert!(events.contains(&WorkerEvent::Title("Stub Title".into())));
            assert!(events.contains(&WorkerEvent::Progress(12)));
            assert!(events.contains(&WorkerEvent::Progress(99)));
            let expected = out_dir.join("j1.mp3");
            assert_eq!(
                events.last(),
                Some(&WorkerEvent::Completed {
                    artifact: ArtifactLocation::File(expected.clone()),
                    title: None,
                })
            );

            let body = backend
                .open_artifact(&ArtifactLocation::File(expected.clone()))
                .await
                .unwrap();
            match body {
                ArtifactBody::Stream { mut body, length } => {
                    assert_eq!(length, Some(7));
                    let mut bytes = Vec::new();
                    while let Some(chunk) = body.next().await {
                        bytes.extend_from_slice(&chunk.unwrap());
                    }
                    assert_eq!(bytes, b"ID3stub");
                }
                other => panic!("expected stream, got {other:?}"),
            }

            backend
                .discard_artifact(&ArtifactLocation::File(expected.clone()))
                .await
                .unwrap();
            assert!(!expected.exists());
        }

        #[tokio::test]
        async fn failing_run_reports_last_error_line() {
            let temp = tempdir().unwrap();
            let stub = install_stub(temp.path(), FAILURE_SCRIPT);
            let backend = backend(stub, temp.path().join("artifacts"));

            let events = collect(backend.dispatch(request("j1", None)).await.unwrap()).await;
            assert_eq!(
                events.last(),
                Some(&WorkerEvent::Failed(
                    "ERROR: [youtube] dQw4w9WgXcQ: Video unavailable".into()
                ))
            );
        }

        #[tokio::test]
        async fn clean_exit_without_output_file_fails() {
            let temp = tempdir().unwrap();
            let stub = install_stub(temp.path(), "echo \"TITLE:Nothing\"\n");
            let backend = backend(stub, temp.path().join("artifacts"));

            let events = collect(backend.dispatch(request("j1", None)).await.unwrap()).await;
            assert!(matches!(events.last(), Some(WorkerEvent::Failed(_))));
        }

        #[tokio::test]
        async fn title_survives_a_full_event_buffer() {
            let temp = tempdir().unwrap();
            let script = "i=0\nwhile [ $i -lt 200 ]; do echo \"PROGRESS: 1.0%\"; i=$((i+1)); done\necho \"TITLE:Late Title\"\n";
            let stub = install_stub(temp.path(), script);
            let backend = backend(stub, temp.path().join("artifacts"));

            let handle = backend.dispatch(request("j1", None)).await.unwrap();
            // Let the tool finish while nobody drains the channel.
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            let events = collect(handle).await;
            assert!(events.contains(&WorkerEvent::Title("Late Title".into())));
        }

        #[tokio::test]
        async fn dropped_handle_stops_the_tool_and_removes_partial_output() {
            let temp = tempdir().unwrap();
            let out_dir = temp.path().join("artifacts");
            std::fs::create_dir_all(&out_dir).unwrap();
            let unrelated = out_dir.join("other.mp3");
            std::fs::write(&unrelated, b"keep").unwrap();
            let pid_file = temp.path().join("pid");
            let script = format!(
                r#"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) shift; out="$1" ;;
  esac
  shift
done
file=$(printf '%s' "$out" | sed 's/%(ext)s/webm.part/')
printf 'partial' > "$file"
echo $$ > '{}'
exec sleep 30
"#,
                pid_file.display()
            );
            let stub = install_stub(temp.path(), &script);
            let backend = backend(stub, out_dir.clone());

            let mut handle = backend.dispatch(request("j1", None)).await.unwrap();
            assert_eq!(handle.next_event().await, Some(WorkerEvent::Started));
            let partial = out_dir.join("j1.webm.part");
            let mut pid = String::new();
            for _ in 0..500 {
                pid = std::fs::read_to_string(&pid_file).unwrap_or_default();
                if !pid.trim().is_empty() && partial.exists() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            assert!(!pid.trim().is_empty(), "stub never started");

            drop(handle);
            for _ in 0..500 {
                if !partial.exists() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            assert!(!partial.exists());
            assert!(unrelated.exists());
            let alive = std::process::Command::new("kill")
                .args(["-0", pid.trim()])
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(!alive.success(), "yt-dlp should have been stopped");
        }

        #[tokio::test]
        async fn describe_reads_dumped_metadata() {
            let temp = tempdir().unwrap();
            let script = r#"
case "$1" in
  --dump-json) ;;
  *) echo "ERROR: expected a lookup" >&2; exit 2 ;;
esac
echo '{"title": "Stub Title", "thumbnail": "https://i.ytimg.com/vi/dQw4w9WgXcQ/hq.jpg", "duration": 61}'
"#;
            let stub = install_stub(temp.path(), script);
            let backend = backend(stub, temp.path().join("artifacts"));
            let source = SourceUrl::parse("https://youtu.be/dQw4w9WgXcQ").unwrap();

            let info = backend.describe(&source, None).await.unwrap();
            assert_eq!(info.title, "Stub Title");
            assert_eq!(info.duration, Some(61));
            assert_eq!(
                info.thumbnail.as_deref(),
                Some("https://i.ytimg.com/vi/dQw4w9WgXcQ/hq.jpg")
            );
            assert!(info.audio_url.is_none());
            assert!(!temp.path().join("artifacts").exists());
        }

        #[tokio::test]
        async fn failed_lookup_reports_the_error_line() {
            let temp = tempdir().unwrap();
            let script = "echo \"ERROR: [youtube] dQw4w9WgXcQ: Private video\" >&2\necho \"bye\" >&2\nexit 1\n";
            let stub = install_stub(temp.path(), script);
            let backend = backend(stub, temp.path().join("artifacts"));
            let source = SourceUrl::parse("https://youtu.be/dQw4w9WgXcQ").unwrap();

            match backend.describe(&source, None).await {
                Err(BackendError::Upstream(detail)) => {
                    assert_eq!(detail, "ERROR: [youtube] dQw4w9WgXcQ: Private video")
                }
                other => panic!("expected upstream error, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn arguments_reach_the_tool() {
            let temp = tempdir().unwrap();
            let args_file = temp.path().join("args.txt");
            let script = format!(
                "for a in \"$@\"; do echo \"$a\" >> '{}'; done\nexit 1\n",
                args_file.display()
            );
            let stub = install_stub(temp.path(), &script);
            let backend = backend(stub, temp.path().join("artifacts"));

            collect(backend.dispatch(request("j1", Some("SID=abc"))).await.unwrap()).await;
            let args = std::fs::read_to_string(&args_file).unwrap();
            let lines: Vec<&str> = args.lines().collect();
            assert!(lines.contains(&"Cookie:SID=abc"));
            assert_eq!(lines.last(), Some(&"https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        }
    }
}
