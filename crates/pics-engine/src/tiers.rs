//! Running one tier: turning a [`Strategy`] into a produced temp file.
//!
//! External tools write straight into a temp file next to the destination.
//! In-process codecs run on the blocking pool and write the same kind of
//! temp file. Either way the caller gets a [`NamedTempFile`] that the
//! [`AtomicWriter`] can commit.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::{NamedTempFile, TempDir};

use pics_codec::{pixels, system, CodecBridge};
use pics_common::{CompressionRequest, Error, ImageFormat, Preset, ResizeCondition, Result, Settings, TimeoutConfig};
use pics_tools::{Invocation, ProcessRunner, Tool};

use crate::selector::Strategy;
use crate::writer::AtomicWriter;

/// The per-request inputs every tier needs.
#[derive(Debug, Clone, Copy)]
pub struct TierJob<'a> {
    pub request: &'a CompressionRequest,
    pub format: ImageFormat,
    pub destination: &'a Path,
}

impl TierJob<'_> {
    fn temp_ext(&self) -> &'static str {
        self.format.extension().unwrap_or("img")
    }
}

/// Executes tiers for the orchestrator.
#[derive(Clone)]
pub struct TierExecutor {
    runner: Arc<dyn ProcessRunner>,
    codecs: CodecBridge,
    writer: AtomicWriter,
    timeouts: TimeoutConfig,
    max_output_bytes: usize,
}

impl std::fmt::Debug for TierExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierExecutor")
            .field("codecs", &self.codecs)
            .field("timeouts", &self.timeouts)
            .field("max_output_bytes", &self.max_output_bytes)
            .finish_non_exhaustive()
    }
}

impl TierExecutor {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        codecs: CodecBridge,
        writer: AtomicWriter,
        timeouts: TimeoutConfig,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            runner,
            codecs,
            writer,
            timeouts,
            max_output_bytes,
        }
    }

    pub fn writer(&self) -> &AtomicWriter {
        &self.writer
    }

    /// Run `strategy` and return the file it produced.
    ///
    /// Every error here is a tier failure; the caller moves on to the next
    /// tier.
    pub async fn produce(&self, strategy: &Strategy, job: &TierJob<'_>) -> Result<NamedTempFile> {
        match strategy {
            Strategy::ExternalTool { tool, path } => self.run_tool(*tool, path, job).await,
            Strategy::EmbeddedCodec => self.run_codec(CodecPath::Embedded, job).await,
            Strategy::SystemCodec => self.run_codec(CodecPath::System, job).await,
            Strategy::Unavailable => Err(Error::processing(
                "select",
                format!("no encoder available for {}", job.format),
            )),
        }
    }

    async fn run_tool(&self, tool: Tool, program: &Path, job: &TierJob<'_>) -> Result<NamedTempFile> {
        let output = self.writer.temp_for(job.destination, job.temp_ext())?;
        let staged = self.stage_input(tool, job).await?;
        let input = staged
            .as_ref()
            .map(|s| s.path.as_path())
            .unwrap_or_else(|| job.request.path());

        let args = tool_arguments(tool, job.request.settings(), input, output.path())?;
        let invocation = Invocation::new(
            program.to_path_buf(),
            args,
            self.timeouts.for_format(job.format),
        )
        .with_max_output_bytes(self.max_output_bytes);

        tracing::debug!(tool = %tool, file = %job.request.display_name(), "running tool");
        let result = self.runner.run(&invocation).await?;
        if result.truncated {
            tracing::debug!(tool = %tool, "tool output truncated");
        }
        result.into_success(tool.binary_name())?;
        Ok(output)
    }

    /// Write a resized / sRGB-normalised PNG for tools that cannot do it
    /// themselves. `None` means the original file can be fed as-is.
    async fn stage_input(&self, tool: Tool, job: &TierJob<'_>) -> Result<Option<StagedInput>> {
        let settings = job.request.shared_settings();
        // gifsicle resizes on its own and must keep animation frames.
        if tool == Tool::Gifsicle || !settings.needs_pixel_prep() {
            return Ok(None);
        }
        let codecs = self.codecs;
        let format = job.format;
        let path = job.request.path().to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<Option<StagedInput>> {
            let bytes = std::fs::read(&path)?;
            let img = match codecs.decode(format, &bytes) {
                Ok(img) => img,
                Err(e) => {
                    tracing::warn!(
                        file = %path.display(),
                        "cannot decode for pixel preparation, encoding unchanged: {e}"
                    );
                    return Ok(None);
                }
            };
            if !pixels::needs_preparation(&img, &settings) {
                return Ok(None);
            }
            let png = system::encode_png_lossless(&pixels::prepare(img, &settings))?;
            let dir = tempfile::Builder::new().prefix("pics-prep-").tempdir()?;
            let staged = dir.path().join("prepared.png");
            std::fs::write(&staged, png)?;
            Ok(Some(StagedInput {
                _dir: dir,
                path: staged,
            }))
        })
        .await
        .map_err(join_error)?
    }

    async fn run_codec(&self, codec: CodecPath, job: &TierJob<'_>) -> Result<NamedTempFile> {
        let mut output = self.writer.temp_for(job.destination, job.temp_ext())?;
        let codecs = self.codecs;
        let format = job.format;
        let settings = job.request.shared_settings();
        let path = job.request.path().to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<NamedTempFile> {
            let bytes = std::fs::read(&path)?;
            let encoded = match codec {
                CodecPath::System => codecs.recompress_system(format, &bytes, &settings)?,
                CodecPath::Embedded => codecs.recompress_embedded(format, &bytes, &settings)?,
            };
            output.write_all(&encoded)?;
            output.flush()?;
            Ok(output)
        })
        .await
        .map_err(join_error)?
    }
}

#[derive(Debug, Clone, Copy)]
enum CodecPath {
    System,
    Embedded,
}

/// A prepared intermediate; the directory is removed on drop.
struct StagedInput {
    _dir: TempDir,
    path: PathBuf,
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::processing("encode", format!("codec task failed: {e}"))
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str().map(str::to_owned).ok_or_else(|| {
        Error::processing(
            "arguments",
            format!("path is not valid UTF-8: {}", path.display()),
        )
    })
}

/// Command-line arguments for `tool` encoding `input` into `output`.
pub fn tool_arguments(tool: Tool, settings: &Settings, input: &Path, output: &Path) -> Result<Vec<String>> {
    let input = path_arg(input)?;
    let output = path_arg(output)?;
    let mut args: Vec<String> = Vec::new();

    match tool {
        Tool::Cjpegli => {
            args.extend(["--quality".into(), settings.jpeg_quality_percent().to_string()]);
            args.extend([input, output]);
        }
        Tool::Cjpeg => {
            args.extend([
                "-quality".into(),
                settings.jpeg_quality_percent().to_string(),
                "-optimize".into(),
                "-progressive".into(),
                "-dc-scan-opt".into(),
                "2".into(),
                "-outfile".into(),
                output,
                input,
            ]);
        }
        Tool::Oxipng => {
            let strip = if settings.preserve_metadata { "none" } else { "safe" };
            args.extend([
                "--opt".into(),
                settings.png_level().to_string(),
                "--strip".into(),
                strip.into(),
                "--alpha".into(),
                "--out".into(),
                output,
                input,
            ]);
        }
        Tool::Gifsicle => {
            args.push(format!("--optimize={}", settings.gif_level()));
            if settings.enable_gif_lossy {
                args.push("--lossy=80".into());
            }
            if settings.resize.enabled && settings.resize.target_pixels > 0 {
                let t = settings.resize.target_pixels;
                let fit = match settings.resize.condition {
                    ResizeCondition::Fit => format!("{t}x{t}"),
                    ResizeCondition::Width => format!("{t}x_"),
                    ResizeCondition::Height => format!("_x{t}"),
                };
                args.extend(["--resize-fit".into(), fit]);
            }
            args.extend(["--output".into(), output, input]);
        }
        Tool::Cwebp => {
            let metadata = if settings.preserve_metadata { "all" } else { "none" };
            args.extend([
                "-q".into(),
                settings.webp_quality().to_string(),
                "-m".into(),
                settings.webp_method().to_string(),
                "-mt".into(),
                "-metadata".into(),
                metadata.into(),
            ]);
            if settings.preset == Preset::Quality {
                args.extend(["-pass".into(), "10".into()]);
            }
            args.extend(["-o".into(), output, input]);
        }
        Tool::Avifenc => {
            args.extend([
                "--jobs".into(),
                "all".into(),
                "--min".into(),
                "0".into(),
                "--max".into(),
                "63".into(),
                "-a".into(),
                "end-usage=q".into(),
                "-a".into(),
                format!("cq-level={}", settings.avif_quality()),
                "-a".into(),
                "tune=ssim".into(),
                "-a".into(),
                "sharpness=2".into(),
                "-s".into(),
                settings.avif_speed().to_string(),
            ]);
            if !settings.preserve_metadata {
                args.extend(["--ignore-exif".into(), "--ignore-xmp".into()]);
            }
            args.extend([input, output]);
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeRunner, RunnerBehaviour};
    use pics_common::ResizeSpec;

    fn args(tool: Tool, settings: &Settings) -> Vec<String> {
        tool_arguments(tool, settings, Path::new("/in/a.x"), Path::new("/out/.pics-1.x")).unwrap()
    }

    #[test]
    fn jpeg_tools_share_quality() {
        let saving = Settings::with_preset(Preset::Saving);
        assert_eq!(
            args(Tool::Cjpegli, &saving),
            ["--quality", "82", "/in/a.x", "/out/.pics-1.x"]
        );
        assert_eq!(
            args(Tool::Cjpeg, &saving),
            [
                "-quality", "82", "-optimize", "-progressive", "-dc-scan-opt", "2", "-outfile",
                "/out/.pics-1.x", "/in/a.x"
            ]
        );
    }

    #[test]
    fn oxipng_strip_follows_metadata_flag() {
        let mut settings = Settings::with_preset(Preset::Quality);
        assert_eq!(
            args(Tool::Oxipng, &settings),
            ["--opt", "4", "--strip", "none", "--alpha", "--out", "/out/.pics-1.x", "/in/a.x"]
        );
        settings.preserve_metadata = false;
        assert!(args(Tool::Oxipng, &settings).contains(&"safe".to_string()));
    }

    #[test]
    fn gifsicle_lossy_and_resize() {
        let settings = Settings {
            enable_gif_lossy: true,
            resize: ResizeSpec {
                enabled: true,
                target_pixels: 320,
                condition: ResizeCondition::Width,
            },
            ..Settings::default()
        };
        assert_eq!(
            args(Tool::Gifsicle, &settings),
            [
                "--optimize=3", "--lossy=80", "--resize-fit", "320x_", "--output",
                "/out/.pics-1.x", "/in/a.x"
            ]
        );
    }

    #[test]
    fn cwebp_quality_preset_adds_passes() {
        let quality = args(Tool::Cwebp, &Settings::with_preset(Preset::Quality));
        assert_eq!(&quality[..4], ["-q", "95", "-m", "6"]);
        assert!(quality.windows(2).any(|w| w == ["-pass", "10"]));

        let balanced = args(Tool::Cwebp, &Settings::default());
        assert!(!balanced.contains(&"-pass".to_string()));
        assert_eq!(balanced.last().map(String::as_str), Some("/in/a.x"));
    }

    #[test]
    fn avifenc_arguments() {
        let a = args(Tool::Avifenc, &Settings::with_preset(Preset::Saving));
        assert!(a.contains(&"cq-level=35".to_string()));
        assert!(a.windows(2).any(|w| w == ["-s", "6"]));
        assert_eq!(&a[a.len() - 2..], ["/in/a.x", "/out/.pics-1.x"]);
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_paths_are_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;
        let bad = Path::new(OsStr::from_bytes(b"/in/\xff.png"));
        assert!(tool_arguments(Tool::Oxipng, &Settings::default(), bad, Path::new("/o")).is_err());
    }

    fn executor(runner: Arc<FakeRunner>) -> TierExecutor {
        TierExecutor::new(
            runner,
            CodecBridge::new(),
            AtomicWriter::new(),
            TimeoutConfig::default(),
            1024,
        )
    }

    #[tokio::test]
    async fn external_tool_writes_into_temp_next_to_destination() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.png");
        std::fs::write(&input, [1u8; 64]).unwrap();
        let destination = dir.path().join("a_compressed.png");
        let request = CompressionRequest::new(&input, Settings::default());

        let runner = Arc::new(FakeRunner::new(RunnerBehaviour::Write(10)));
        let job = TierJob {
            request: &request,
            format: ImageFormat::Png,
            destination: &destination,
        };
        let strategy = Strategy::ExternalTool {
            tool: Tool::Oxipng,
            path: PathBuf::from("/usr/bin/oxipng"),
        };
        let temp = executor(Arc::clone(&runner)).produce(&strategy, &job).await.unwrap();

        assert_eq!(temp.path().parent(), Some(dir.path()));
        assert_eq!(std::fs::metadata(temp.path()).unwrap().len(), 10);
        let calls = runner.invocations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].timeout, TimeoutConfig::default().for_format(ImageFormat::Png));
        assert_eq!(calls[0].max_output_bytes, 1024);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.jpg");
        std::fs::write(&input, [1u8; 64]).unwrap();
        let request = CompressionRequest::new(&input, Settings::default());
        let job = TierJob {
            request: &request,
            format: ImageFormat::Jpeg,
            destination: &input,
        };
        let strategy = Strategy::ExternalTool {
            tool: Tool::Cjpegli,
            path: PathBuf::from("/usr/bin/cjpegli"),
        };
        let err = executor(Arc::new(FakeRunner::new(RunnerBehaviour::Exit(1))))
            .produce(&strategy, &job)
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "tool-failed");
    }

    #[tokio::test]
    async fn system_codec_produces_png() {
        use image::{DynamicImage, Rgba, RgbaImage};
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.png");
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(32, 32, Rgba([10, 20, 30, 255])));
        std::fs::write(&input, system::encode_png_lossless(&img).unwrap()).unwrap();
        let request = CompressionRequest::new(&input, Settings::default());
        let job = TierJob {
            request: &request,
            format: ImageFormat::Png,
            destination: &input,
        };

        let temp = executor(Arc::new(FakeRunner::new(RunnerBehaviour::Exit(0))))
            .produce(&Strategy::SystemCodec, &job)
            .await
            .unwrap();
        let bytes = std::fs::read(temp.path()).unwrap();
        assert_eq!(ImageFormat::sniff(&bytes), ImageFormat::Png);
    }

    #[tokio::test]
    async fn resize_stages_a_prepared_png_for_tools() {
        use image::{DynamicImage, RgbImage};
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.png");
        let img = DynamicImage::ImageRgb8(RgbImage::new(200, 100));
        std::fs::write(&input, system::encode_png_lossless(&img).unwrap()).unwrap();
        let settings = Settings {
            resize: ResizeSpec {
                enabled: true,
                target_pixels: 50,
                condition: ResizeCondition::Fit,
            },
            ..Settings::default()
        };
        let request = CompressionRequest::new(&input, settings);
        let job = TierJob {
            request: &request,
            format: ImageFormat::Png,
            destination: &input,
        };
        let runner = Arc::new(FakeRunner::new(RunnerBehaviour::Write(5)));
        let strategy = Strategy::ExternalTool {
            tool: Tool::Oxipng,
            path: PathBuf::from("/usr/bin/oxipng"),
        };
        executor(Arc::clone(&runner)).produce(&strategy, &job).await.unwrap();

        let calls = runner.invocations();
        let staged = calls[0].args.last().unwrap();
        assert_ne!(Path::new(staged), input.as_path());
        assert!(staged.ends_with("prepared.png"));
        // Staging directory is gone once the tier returns.
        assert!(!Path::new(staged).exists());
    }

    #[tokio::test]
    async fn unavailable_never_produces() {
        let request = CompressionRequest::new("/tmp/a.heic", Settings::default());
        let job = TierJob {
            request: &request,
            format: ImageFormat::Heif,
            destination: Path::new("/tmp/a.heic"),
        };
        let err = executor(Arc::new(FakeRunner::new(RunnerBehaviour::Exit(0))))
            .produce(&Strategy::Unavailable, &job)
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "processing-failed");
    }
}
