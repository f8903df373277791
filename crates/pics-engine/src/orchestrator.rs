//! Batch orchestration: a bounded sliding window of per-file workers.
//!
//! Each request runs as its own task and resolves to exactly one
//! [`Outcome`]. The request's index travels with its task, so completions
//! may arrive in any order without being misattributed. Cancellation is
//! checked before a file is opened, before each tier, before a produced
//! file is committed, and before a per-file progress event is delivered.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use pics_codec::CodecBridge;
use pics_common::{
    reason, BatchId, BatchProgress, BatchSummary, CompressionRequest, EngineConfig, Error,
    ImageFormat, Outcome, Result,
};
use pics_tools::{ProcessRunner, Sandbox, SecureProcessRunner, ToolRegistry};

use crate::progress::ProgressSender;
use crate::selector::{Selection, Strategy, StrategySelector};
use crate::sink::{CsvLogSink, NullSink, StatsSink};
use crate::tiers::{TierExecutor, TierJob};
use crate::writer::{plan_destination, AtomicWriter};

/// Everything the orchestrator depends on, injected explicitly.
pub struct EngineServices {
    pub config: EngineConfig,
    pub sandbox: Arc<Sandbox>,
    pub selector: StrategySelector,
    pub runner: Arc<dyn ProcessRunner>,
    pub codecs: CodecBridge,
    pub writer: AtomicWriter,
    pub sink: Arc<dyn StatsSink>,
}

impl EngineServices {
    /// Production wiring: discovered tools, sandboxed processes, and the
    /// configured CSV log if any.
    ///
    /// `working_dirs` are added to the sandbox roots alongside
    /// `config.allowed_roots`.
    pub fn from_config(config: EngineConfig, working_dirs: &[PathBuf]) -> Result<Self> {
        let sandbox = Arc::new(Sandbox::new(
            working_dirs.iter().chain(config.allowed_roots.iter()),
        ));
        let codecs = CodecBridge::new();
        let sink: Arc<dyn StatsSink> = match CsvLogSink::from_config(&config.log)? {
            Some(log) => Arc::new(log),
            None => Arc::new(NullSink),
        };
        Ok(Self {
            runner: Arc::new(SecureProcessRunner::new(Arc::clone(&sandbox))),
            selector: StrategySelector::new(Arc::new(ToolRegistry::new()), codecs),
            writer: AtomicWriter::new(),
            sandbox,
            codecs,
            sink,
            config,
        })
    }

    /// Replace the sink.
    pub fn with_sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.sink = sink;
        self
    }
}

/// Everything a finished batch produced.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: BatchId,
    /// One outcome per request, in request order.
    pub outcomes: Vec<Outcome>,
    pub summary: BatchSummary,
}

struct Inner {
    config: EngineConfig,
    sandbox: Arc<Sandbox>,
    selector: StrategySelector,
    executor: TierExecutor,
    sink: Arc<dyn StatsSink>,
}

/// Runs batches of [`CompressionRequest`]s.
#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("config", &self.inner.config)
            .field("executor", &self.inner.executor)
            .finish_non_exhaustive()
    }
}

impl BatchOrchestrator {
    pub fn new(services: EngineServices) -> Self {
        let executor = TierExecutor::new(
            services.runner,
            services.codecs,
            services.writer,
            services.config.timeouts.clone(),
            services.config.max_output_bytes,
        );
        Self {
            inner: Arc::new(Inner {
                config: services.config,
                sandbox: services.sandbox,
                selector: services.selector,
                executor,
                sink: services.sink,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn selector(&self) -> &StrategySelector {
        &self.inner.selector
    }

    /// Process `requests` with at most `concurrency` files in flight
    /// (`None` uses the configured default).
    ///
    /// Always returns one outcome per request. Requests never submitted
    /// because of cancellation are reported as skipped `cancelled`.
    pub async fn run(
        &self,
        requests: Vec<CompressionRequest>,
        concurrency: Option<usize>,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let batch_id = BatchId::new();
        let total = requests.len();
        let limit = concurrency
            .filter(|&n| n > 0)
            .unwrap_or_else(|| self.inner.config.effective_concurrency());
        tracing::info!(%batch_id, total, concurrency = limit, "batch started");

        let mut slots: Vec<Option<Outcome>> = vec![None; total];
        let mut set: JoinSet<(usize, Outcome)> = JoinSet::new();
        let mut submitted = 0usize;
        let mut processed = 0usize;

        loop {
            while set.len() < limit && submitted < total && !cancel.is_cancelled() {
                let request = requests[submitted].clone();
                progress.send(&BatchProgress {
                    processed,
                    total,
                    current_file: Some(request.display_name()),
                });
                self.spawn_worker(&mut set, submitted, request, cancel.clone());
                submitted += 1;
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            match joined {
                Ok((index, outcome)) => {
                    processed += 1;
                    self.inner.sink.record_outcome(&outcome);
                    if !cancel.is_cancelled() {
                        progress.send(&BatchProgress {
                            processed,
                            total,
                            current_file: Some(requests[index].display_name()),
                        });
                    }
                    slots[index] = Some(outcome);
                }
                Err(e) => tracing::error!(%batch_id, "worker slot failed: {e}"),
            }
        }

        if submitted < total {
            tracing::info!(%batch_id, skipped = total - submitted, "batch cancelled");
        }

        let outcomes: Vec<Outcome> = slots
            .into_iter()
            .zip(&requests)
            .enumerate()
            .map(|(index, (slot, request))| {
                slot.unwrap_or_else(|| {
                    let outcome = if index >= submitted {
                        Outcome::skipped(request, ImageFormat::Unsupported, 0, reason::CANCELLED)
                    } else {
                        Outcome::error(request, ImageFormat::Unsupported, 0, reason::INTERNAL_ERROR)
                    };
                    self.inner.sink.record_outcome(&outcome);
                    outcome
                })
            })
            .collect();

        progress.send(&BatchProgress {
            processed,
            total,
            current_file: None,
        });

        let summary = BatchSummary::from_outcomes(batch_id, &outcomes);
        self.inner.sink.record_batch(&summary);
        tracing::info!(
            %batch_id,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            bytes_saved = summary.bytes_saved,
            "batch finished"
        );

        BatchReport {
            batch_id,
            outcomes,
            summary,
        }
    }

    /// Spawn the worker for `request`. The inner task isolates panics so a
    /// crashing worker still resolves to an outcome for its own request.
    fn spawn_worker(
        &self,
        set: &mut JoinSet<(usize, Outcome)>,
        index: usize,
        request: CompressionRequest,
        cancel: CancellationToken,
    ) {
        let inner = Arc::clone(&self.inner);
        set.spawn(async move {
            let worker_request = request.clone();
            let handle = tokio::spawn(async move { inner.process(&worker_request, &cancel).await });
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(file = %request.path().display(), "worker crashed: {e}");
                    Outcome::error(&request, ImageFormat::Unsupported, 0, reason::INTERNAL_ERROR)
                }
            };
            (index, outcome)
        });
    }
}

impl Inner {
    /// Resolve one request to its outcome.
    async fn process(&self, request: &CompressionRequest, cancel: &CancellationToken) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::skipped(request, ImageFormat::Unsupported, 0, reason::CANCELLED);
        }

        let path = request.path();
        if let Err(e) = self.sandbox.validate_path(path) {
            tracing::warn!(file = %path.display(), "input rejected: {e}");
            return Outcome::error(request, ImageFormat::Unsupported, 0, reason::INVALID_INPUT_PATH);
        }

        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Outcome::error(request, ImageFormat::Unsupported, 0, reason::FILE_NOT_FOUND);
            }
            Err(e) => {
                let code = Error::from(e).reason_code();
                return Outcome::error(request, ImageFormat::Unsupported, 0, code);
            }
        };
        if !metadata.is_file() {
            return Outcome::error(request, ImageFormat::Unsupported, 0, reason::NOT_A_FILE);
        }
        let size = metadata.len();
        if size > self.config.max_file_size_bytes {
            return Outcome::error(request, ImageFormat::Unsupported, size, reason::FILE_TOO_LARGE);
        }

        let format = match detect_format(path).await {
            Ok(format) => format,
            Err(e) => {
                let code = Error::from(e).reason_code();
                return Outcome::error(request, ImageFormat::Unsupported, size, code);
            }
        };

        let settings = request.settings();
        let tiers = match self.selector.select(format, settings) {
            Selection::Skip(code) => return Outcome::skipped(request, format, size, code),
            Selection::Tiers(tiers) => tiers,
        };
        if size < self.config.min_file_size_bytes {
            return Outcome::skipped(request, format, size, reason::FILE_TOO_SMALL);
        }
        if tiers.iter().all(|t| *t == Strategy::Unavailable) {
            return Outcome::skipped(request, format, size, reason::FORMAT_NOT_COMPRESSIBLE);
        }

        let fallback_ext = format.extension().unwrap_or("img");
        let destination = match plan_destination(path, settings.save_mode, fallback_ext) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(file = %path.display(), "{e}");
                return Outcome::error(request, format, size, reason::INVALID_INPUT_PATH);
            }
        };

        self.run_tiers(request, format, size, &tiers, &destination, cancel)
            .await
    }

    /// Try each tier in order; commit the first one that produces output.
    async fn run_tiers(
        &self,
        request: &CompressionRequest,
        format: ImageFormat,
        size: u64,
        tiers: &[Strategy],
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Outcome {
        let job = TierJob {
            request,
            format,
            destination,
        };
        let mut last_error = None;

        for strategy in tiers.iter().filter(|t| **t != Strategy::Unavailable) {
            if cancel.is_cancelled() {
                last_error = Some(Error::Cancelled);
                break;
            }
            let produced = match self.executor.produce(strategy, &job).await {
                Ok(temp) => temp,
                Err(e) => {
                    tracing::warn!(
                        file = %request.display_name(),
                        tier = %strategy,
                        "tier failed: {e}"
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            if cancel.is_cancelled() {
                drop(produced);
                last_error = Some(Error::Cancelled);
                break;
            }

            let writer = self.executor.writer().clone();
            let target = destination.to_path_buf();
            let original = request.path().to_path_buf();
            let mode = request.settings().save_mode;
            let committed = tokio::task::spawn_blocking(move || {
                writer.commit(produced, &target, &original, mode)
            })
            .await;

            return match committed {
                Ok(Ok(c)) if c.no_gain => {
                    Outcome::no_gain(request, format, c.output_path, c.original_size)
                }
                Ok(Ok(c)) => Outcome::success(
                    request,
                    format,
                    c.output_path,
                    c.original_size,
                    c.new_size,
                    strategy.success_reason(),
                ),
                Ok(Err(failure)) => {
                    tracing::warn!(file = %request.display_name(), "{failure}");
                    Outcome::error(request, format, size, failure.reason)
                }
                Err(e) => {
                    tracing::error!(file = %request.display_name(), "commit task failed: {e}");
                    Outcome::error(request, format, size, reason::INTERNAL_ERROR)
                }
            };
        }

        match last_error {
            Some(Error::Cancelled) => Outcome::skipped(request, format, size, reason::CANCELLED),
            Some(e) => Outcome::error(request, format, size, e.reason_code()),
            None => Outcome::error(request, format, size, reason::INTERNAL_ERROR),
        }
    }
}

/// Identify the container from the file's first bytes.
async fn detect_format(path: &Path) -> std::io::Result<ImageFormat> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || ImageFormat::detect(&path))
        .await
        .map_err(std::io::Error::other)?
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{FakeRunner, RunnerBehaviour};
    use image::{DynamicImage, Rgba, RgbaImage};
    use parking_lot::Mutex;
    use pics_common::{Preset, SaveMode, Settings, Status};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        outcomes: Mutex<Vec<Outcome>>,
        batches: Mutex<Vec<BatchSummary>>,
    }

    impl StatsSink for RecordingSink {
        fn record_outcome(&self, outcome: &Outcome) {
            self.outcomes.lock().push(outcome.clone());
        }

        fn record_batch(&self, summary: &BatchSummary) {
            self.batches.lock().push(summary.clone());
        }
    }

    struct Harness {
        files: TempDir,
        _tools: TempDir,
        runner: Arc<FakeRunner>,
        sink: Arc<RecordingSink>,
        orchestrator: BatchOrchestrator,
    }

    impl Harness {
        fn new(tools: &[&str], runner: FakeRunner) -> Self {
            Self::with(tools, runner, EngineConfig::default(), CodecBridge::new())
        }

        fn with(tools: &[&str], runner: FakeRunner, config: EngineConfig, codecs: CodecBridge) -> Self {
            let files = tempfile::tempdir().unwrap();
            let tool_dir = tempfile::tempdir().unwrap();
            for name in tools {
                let path = tool_dir.path().join(name);
                std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
            let registry = ToolRegistry::with_search_dirs(vec![tool_dir.path().to_path_buf()], false)
                .with_env_lookup(|_| None);
            let runner = Arc::new(runner);
            let sink = Arc::new(RecordingSink::default());
            let services = EngineServices {
                config,
                sandbox: Arc::new(Sandbox::new([files.path()])),
                selector: StrategySelector::new(Arc::new(registry), codecs),
                runner: runner.clone(),
                codecs,
                writer: AtomicWriter::new(),
                sink: sink.clone(),
            };
            Self {
                files,
                _tools: tool_dir,
                runner,
                sink,
                orchestrator: BatchOrchestrator::new(services),
            }
        }

        fn file(&self, name: &str, bytes: &[u8]) -> PathBuf {
            let path = self.files.path().join(name);
            std::fs::write(&path, bytes).unwrap();
            path
        }

        async fn run(&self, requests: Vec<CompressionRequest>, limit: usize) -> BatchReport {
            self.orchestrator
                .run(requests, Some(limit), &ProgressSender::noop(), &CancellationToken::new())
                .await
        }

        fn temp_leftovers(&self) -> usize {
            walk(self.files.path())
                .into_iter()
                .filter(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy().starts_with(".pics-"))
                        .unwrap_or(false)
                })
                .count()
        }
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
        out
    }

    fn fake_png(size: usize) -> Vec<u8> {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.resize(size, 0x42);
        bytes
    }

    fn fake_jpeg(size: usize) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
        bytes.resize(size, 0x11);
        bytes
    }

    fn tiny_gif() -> Vec<u8> {
        let mut bytes = b"GIF89a\x01\x00\x01\x00\x00\x00\x00".to_vec();
        bytes.extend_from_slice(b",\x00\x00\x00\x00\x01\x00\x01\x00\x00\x02\x02D\x01\x00;");
        bytes
    }

    fn gradient(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x * 255 / w) as u8, (y * 255 / h) as u8, ((x + y) % 256) as u8, 255])
        }))
    }

    #[tokio::test]
    async fn disabled_gifsicle_skips_tiny_gif() {
        let h = Harness::new(&["gifsicle"], FakeRunner::new(RunnerBehaviour::Write(1)));
        let path = h.file("dot.gif", &tiny_gif());
        let settings = Settings {
            enable_gifsicle: false,
            ..Settings::default()
        };
        let report = h.run(vec![CompressionRequest::new(&path, settings)], 2).await;

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status(), Status::Skipped);
        assert_eq!(outcome.reason(), reason::GIFSICLE_DISABLED);
        assert_eq!(h.runner.call_count(), 0);
    }

    #[tokio::test]
    async fn jpeg_with_tool_uses_suffix_output() {
        let h = Harness::new(&["cjpegli"], FakeRunner::new(RunnerBehaviour::Write(4_000)));
        let path = h.file("photo.jpg", &fake_jpeg(10 * 1024));
        let report = h
            .run(vec![CompressionRequest::new(&path, Settings::with_preset(Preset::Saving))], 2)
            .await;

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status(), Status::Success);
        assert_eq!(outcome.reason(), "jpegli-compression");
        assert!(outcome.new_size_bytes() < outcome.original_size_bytes());
        let output = outcome.output_path().unwrap();
        assert_eq!(output, h.files.path().join("photo_compressed.jpg"));
        assert_eq!(std::fs::metadata(output).unwrap().len(), 4_000);
        assert_eq!(std::fs::read(&path).unwrap(), fake_jpeg(10 * 1024));
        assert!(h.runner.invocations()[0].args.contains(&"82".to_string()));
    }

    #[tokio::test]
    async fn larger_output_is_no_gain_with_identical_bytes() {
        let h = Harness::new(&["oxipng"], FakeRunner::new(RunnerBehaviour::Write(5_000)));
        let original = fake_png(2_000);
        let path = h.file("icon.png", &original);
        let report = h.run(vec![CompressionRequest::new(&path, Settings::default())], 2).await;

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status(), Status::Success);
        assert_eq!(outcome.reason(), reason::NO_GAIN);
        assert_eq!(outcome.new_size_bytes(), outcome.original_size_bytes());
        assert_eq!(std::fs::read(outcome.output_path().unwrap()).unwrap(), original);
        assert_eq!(h.temp_leftovers(), 0);
    }

    #[tokio::test]
    async fn webp_overwrite_through_embedded_codec() {
        let h = Harness::new(&[], FakeRunner::new(RunnerBehaviour::Exit(0)));
        let img = gradient(128, 128).to_rgba8();
        let lossless = pics_codec::webp::encode_lossless_rgba(img.as_raw(), 128, 128).unwrap();
        let path = h.file("art.webp", &lossless);
        let settings = Settings {
            save_mode: SaveMode::Overwrite,
            ..Settings::default()
        };
        let report = h.run(vec![CompressionRequest::new(&path, settings)], 1).await;

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status(), Status::Success);
        assert_eq!(outcome.output_path(), Some(path.as_path()));
        let now = std::fs::read(&path).unwrap();
        assert_eq!(ImageFormat::sniff(&now), ImageFormat::WebP);
        if outcome.is_no_gain() {
            assert_eq!(now, lossless);
        } else {
            assert_eq!(outcome.reason(), "libwebp-compression");
            assert!(now.len() < lossless.len());
        }
        assert_eq!(h.runner.call_count(), 0);
        assert_eq!(h.temp_leftovers(), 0);
    }

    #[tokio::test]
    async fn failed_tools_fall_through_to_system_codec() {
        let h = Harness::new(&["cjpegli", "cjpeg"], FakeRunner::new(RunnerBehaviour::Exit(1)));
        // Maximum quality so the saving preset always shrinks it.
        let mut best = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut best, 100)
            .encode_image(&gradient(256, 256).to_rgb8())
            .unwrap();
        let path = h.file("g.jpg", &best);

        let report = h
            .run(vec![CompressionRequest::new(&path, Settings::with_preset(Preset::Saving))], 1)
            .await;
        let outcome = &report.outcomes[0];
        assert_eq!(h.runner.call_count(), 2);
        assert_eq!(outcome.status(), Status::Success);
        assert_eq!(outcome.reason(), "system-codec-compression");
    }

    #[tokio::test]
    async fn exhausted_tiers_report_last_error() {
        let h = Harness::new(&["gifsicle"], FakeRunner::new(RunnerBehaviour::Timeout));
        let mut gif = tiny_gif();
        gif.resize(400, 0);
        let path = h.file("anim.gif", &gif);
        let report = h.run(vec![CompressionRequest::new(&path, Settings::default())], 1).await;

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status(), Status::Error);
        assert_eq!(outcome.reason(), "process-timeout");
        assert!(outcome.output_path().is_none());
        assert_eq!(std::fs::read(&path).unwrap(), gif);
        assert_eq!(h.temp_leftovers(), 0);
    }

    #[tokio::test]
    async fn format_comes_from_content_not_extension() {
        let h = Harness::new(&["oxipng"], FakeRunner::new(RunnerBehaviour::Write(100)));
        let path = h.file("renamed.jpg", &fake_png(1_000));
        let report = h.run(vec![CompressionRequest::new(&path, Settings::default())], 1).await;

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.source_format(), ImageFormat::Png);
        assert_eq!(outcome.status(), Status::Success);
        assert!(h.runner.invocations()[0].program.ends_with("oxipng"));
    }

    #[tokio::test]
    async fn input_checks_map_to_reasons() {
        let config = EngineConfig {
            max_file_size_bytes: 10_000,
            ..EngineConfig::default()
        };
        let h = Harness::with(&[], FakeRunner::new(RunnerBehaviour::Exit(0)), config, CodecBridge::new());
        std::fs::create_dir(h.files.path().join("folder.png")).unwrap();
        let big = h.file("big.png", &fake_png(20_000));
        let small = h.file("small.png", &fake_png(50));
        let text = h.file("notes.png", &[b'x'; 500]);
        let mut heic = vec![0, 0, 0, 0x18];
        heic.extend_from_slice(b"ftypheic");
        heic.resize(500, 0);
        let heic = h.file("shot.heic", &heic);

        let paths = [
            h.files.path().join("missing.png"),
            h.files.path().join("folder.png"),
            big,
            small,
            text,
            heic,
            PathBuf::from("/etc/../etc/hosts"),
        ];
        let requests = paths
            .iter()
            .map(|p| CompressionRequest::new(p, Settings::default()))
            .collect();
        let report = h.run(requests, 3).await;

        let got: Vec<(Status, &str)> = report
            .outcomes
            .iter()
            .map(|o| (o.status(), o.reason()))
            .collect();
        assert_eq!(
            got,
            vec![
                (Status::Error, reason::FILE_NOT_FOUND),
                (Status::Error, reason::NOT_A_FILE),
                (Status::Error, reason::FILE_TOO_LARGE),
                (Status::Skipped, reason::FILE_TOO_SMALL),
                (Status::Skipped, reason::UNSUPPORTED_FORMAT),
                (Status::Skipped, reason::FORMAT_NOT_COMPRESSIBLE),
                (Status::Error, reason::INVALID_INPUT_PATH),
            ]
        );
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let runner = FakeRunner::new(RunnerBehaviour::Write(100)).with_delay(Duration::from_millis(25));
        let h = Harness::new(&["oxipng"], runner);
        let requests: Vec<_> = (0..12)
            .map(|i| {
                let path = h.file(&format!("{i}.png"), &fake_png(1_000 + i));
                CompressionRequest::new(path, Settings::default())
            })
            .collect();
        let ids: Vec<_> = requests.iter().map(|r| (r.id(), r.path().to_path_buf())).collect();

        let report = h.run(requests, 3).await;

        assert_eq!(h.runner.call_count(), 12);
        assert!(h.runner.max_in_flight() <= 3, "saw {}", h.runner.max_in_flight());
        assert!(h.runner.max_in_flight() >= 2);
        for (outcome, (id, path)) in report.outcomes.iter().zip(&ids) {
            assert_eq!(outcome.request_id(), *id);
            assert_eq!(outcome.original_path(), path.as_path());
            assert_eq!(outcome.status(), Status::Success);
        }
        assert_eq!(report.summary.succeeded, 12);
    }

    #[tokio::test]
    async fn cancellation_stops_new_submissions() {
        let h = Harness::new(&["oxipng"], FakeRunner::new(RunnerBehaviour::Write(100)));
        let originals: Vec<_> = (0..6).map(|i| fake_png(1_000 + i)).collect();
        let requests: Vec<_> = originals
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                CompressionRequest::new(h.file(&format!("{i}.png"), bytes), Settings::default())
            })
            .collect();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let events = Arc::new(Mutex::new(Vec::<BatchProgress>::new()));
        let seen = events.clone();
        let progress = ProgressSender::new(move |p| {
            seen.lock().push(p.clone());
            if p.processed >= 2 {
                trigger.cancel();
            }
        });

        let report = h.orchestrator.run(requests, Some(1), &progress, &cancel).await;

        assert_eq!(report.outcomes.len(), 6);
        assert_eq!(h.runner.call_count(), 2);
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.cancelled, 4);
        for (i, outcome) in report.outcomes.iter().enumerate().skip(2) {
            assert_eq!(outcome.reason(), reason::CANCELLED);
            assert_eq!(std::fs::read(outcome.original_path()).unwrap(), originals[i]);
        }
        assert_eq!(h.temp_leftovers(), 0);

        let events = events.lock();
        let finals: Vec<_> = events.iter().filter(|e| e.is_final()).collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].processed, 2);
        assert!(events.last().unwrap().is_final());
    }

    #[tokio::test]
    async fn cancellation_stops_tier_fallthrough() {
        let runner = FakeRunner::new(RunnerBehaviour::Exit(1)).with_delay(Duration::from_millis(200));
        let h = Harness::new(&["cjpegli", "cjpeg"], runner);
        let original = fake_jpeg(10 * 1024);
        let path = h.file("slow.jpg", &original);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let report = h
            .orchestrator
            .run(
                vec![CompressionRequest::new(&path, Settings::default())],
                Some(1),
                &ProgressSender::noop(),
                &cancel,
            )
            .await;

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status(), Status::Skipped);
        assert_eq!(outcome.reason(), reason::CANCELLED);
        assert_eq!(h.runner.call_count(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), original);
        assert_eq!(h.temp_leftovers(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let h = Harness::new(&["oxipng"], FakeRunner::new(RunnerBehaviour::Write(10)));
        let path = h.file("a.png", &fake_png(1_000));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h
            .orchestrator
            .run(
                vec![CompressionRequest::new(&path, Settings::default())],
                None,
                &ProgressSender::noop(),
                &cancel,
            )
            .await;
        assert_eq!(report.outcomes[0].reason(), reason::CANCELLED);
        assert_eq!(h.runner.call_count(), 0);
        assert_eq!(walk(h.files.path()), vec![path]);
    }

    #[tokio::test]
    async fn progress_ends_with_one_final_event() {
        let h = Harness::new(&["oxipng"], FakeRunner::new(RunnerBehaviour::Write(10)));
        let requests: Vec<_> = (0..5)
            .map(|i| CompressionRequest::new(h.file(&format!("{i}.png"), &fake_png(500)), Settings::default()))
            .collect();
        let events = Arc::new(Mutex::new(Vec::<BatchProgress>::new()));
        let seen = events.clone();
        let progress = ProgressSender::new(move |p| seen.lock().push(p.clone()));

        h.orchestrator
            .run(requests, Some(2), &progress, &CancellationToken::new())
            .await;

        let events = events.lock();
        // start + end per file, plus the final totals.
        assert_eq!(events.len(), 11);
        assert_eq!(events.iter().filter(|e| e.is_final()).count(), 1);
        assert_eq!(
            events.last().unwrap(),
            &BatchProgress {
                processed: 5,
                total: 5,
                current_file: None
            }
        );
    }

    #[tokio::test]
    async fn sink_sees_every_outcome_and_one_summary() {
        let h = Harness::new(&["oxipng"], FakeRunner::new(RunnerBehaviour::Write(10)));
        let good = h.file("a.png", &fake_png(1_000));
        let requests = vec![
            CompressionRequest::new(&good, Settings::default()),
            CompressionRequest::new(h.files.path().join("gone.png"), Settings::default()),
        ];
        let report = h.run(requests, 2).await;

        assert_eq!(h.sink.outcomes.lock().len(), 2);
        let batches = h.sink.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], report.summary);
        assert_eq!((report.summary.succeeded, report.summary.failed), (1, 1));
        assert_eq!(report.summary.bytes_saved, 990);
    }

    #[tokio::test]
    async fn crashed_worker_is_attributed_to_its_request() {
        let h = Harness::new(&["oxipng", "gifsicle"], FakeRunner::new(RunnerBehaviour::Panic));
        let png = h.file("a.png", &fake_png(1_000));
        let mut gif = tiny_gif();
        gif.resize(400, 0);
        let gif = h.file("b.gif", &gif);
        let skipped = h.file("c.gif", &tiny_gif());
        let no_gif = Settings {
            enable_gifsicle: false,
            ..Settings::default()
        };
        let requests = vec![
            CompressionRequest::new(&png, Settings::default()),
            CompressionRequest::new(&gif, Settings::default()),
            CompressionRequest::new(&skipped, no_gif),
        ];
        let report = h.run(requests, 3).await;

        assert_eq!(report.outcomes[0].reason(), reason::INTERNAL_ERROR);
        assert_eq!(report.outcomes[0].original_path(), png.as_path());
        assert_eq!(report.outcomes[1].reason(), reason::INTERNAL_ERROR);
        assert_eq!(report.outcomes[2].reason(), reason::GIFSICLE_DISABLED);
    }

    #[tokio::test]
    async fn separate_folder_mode_creates_folder() {
        let h = Harness::new(&["oxipng"], FakeRunner::new(RunnerBehaviour::Write(10)));
        let path = h.file("shot.png", &fake_png(1_000));
        let settings = Settings {
            save_mode: SaveMode::SeparateFolder,
            ..Settings::default()
        };
        let report = h.run(vec![CompressionRequest::new(&path, settings)], 1).await;
        assert_eq!(
            report.outcomes[0].output_path(),
            Some(h.files.path().join("Compressor").join("shot.png").as_path())
        );
        assert_eq!(h.temp_leftovers(), 0);
    }
}
