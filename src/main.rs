use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use shader_script_runtime::gpu::GpuBackend;
use shader_script_runtime::protocol::Extent;
use shader_script_runtime::renderer::FrameOutcome;
use shader_script_runtime::{ReplayBundle, ReplayCompiler, Runtime, RuntimeConfig, WgpuBackend};

#[derive(Debug, Clone)]
struct Cli {
    bundle: Option<PathBuf>,
    frames: u32,
    size: Extent,
    output: PathBuf,
    config: Option<PathBuf>,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            bundle: None,
            frames: 1,
            size: Extent::new(256, 256),
            output: PathBuf::from("out.png"),
            config: None,
        }
    }
}

fn parse_size(s: &str) -> Result<Extent> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("invalid --size '{s}', expected WxH"))?;
    let width: u32 = w.trim().parse().with_context(|| format!("invalid width in '{s}'"))?;
    let height: u32 = h.trim().parse().with_context(|| format!("invalid height in '{s}'"))?;
    Ok(Extent::new(width, height))
}

fn parse_cli(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--bundle" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --bundle"));
                };
                cli.bundle = Some(PathBuf::from(v));
                i += 2;
            }
            "--frames" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --frames"));
                };
                cli.frames = v
                    .parse()
                    .with_context(|| format!("invalid --frames '{v}'"))?;
                i += 2;
            }
            "--size" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --size"));
                };
                cli.size = parse_size(v)?;
                i += 2;
            }
            "--output" | "-o" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --output"));
                };
                cli.output = PathBuf::from(v);
                i += 2;
            }
            "--config" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --config"));
                };
                cli.config = Some(PathBuf::from(v));
                i += 2;
            }
            other => {
                return Err(anyhow!(
                    "unknown argument: {other}. supported: --bundle <path> [--frames N] [--size WxH] [--output out.png] [--config cfg.json]"
                ));
            }
        }
    }
    Ok(cli)
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig> {
    let Some(path) = path else {
        return Ok(RuntimeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config json in {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli(&args)?;
    let bundle_path = cli
        .bundle
        .clone()
        .ok_or_else(|| anyhow!("--bundle <path> is required"))?;

    let bundle = ReplayBundle::from_path(&bundle_path)?;
    let config = load_config(cli.config.as_ref())?;
    let script = bundle.script.clone();

    let backend = WgpuBackend::new()?;
    let mut runtime = Runtime::new(backend, ReplayCompiler::new(bundle), config)
        .map_err(|e| anyhow!("composite pass failed to compile: {e}"))?;
    runtime
        .load_script(&script)
        .map_err(|e| anyhow!("script failed to load: {e}"))?;

    for i in 0..cli.frames.max(1) {
        let report = runtime.run_frame(cli.size, i as f32 / 60.0);
        log::info!(
            "frame {i}: {} executed, {} skipped, {} resource error(s)",
            report.executed,
            report.skipped,
            report.resource_errors.len()
        );
        if let FrameOutcome::EvaluationFailed(e) = &report.outcome {
            eprintln!("[frame {i}] evaluation failed: {e}");
        }
    }

    let image = runtime
        .backend_mut()
        .read_surface()
        .map_err(|e| anyhow!("surface readback failed: {e}"))?;
    image
        .save(&cli.output)
        .with_context(|| format!("failed to write {}", cli.output.display()))?;
    println!("wrote {}", cli.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_cli_bundle_frames_size_output() {
        let cli = parse_cli(&args(&[
            "--bundle",
            "scene.json",
            "--frames",
            "3",
            "--size",
            "64x32",
            "--output",
            "frame.png",
        ]))
        .unwrap();
        assert_eq!(cli.bundle.as_ref().unwrap(), &PathBuf::from("scene.json"));
        assert_eq!(cli.frames, 3);
        assert_eq!(cli.size, Extent::new(64, 32));
        assert_eq!(cli.output, PathBuf::from("frame.png"));
    }

    #[test]
    fn parse_cli_defaults() {
        let cli = parse_cli(&args(&["--bundle", "b.json"])).unwrap();
        assert_eq!(cli.frames, 1);
        assert_eq!(cli.size, Extent::new(256, 256));
        assert_eq!(cli.output, PathBuf::from("out.png"));
        assert!(cli.config.is_none());
    }

    #[test]
    fn parse_cli_rejects_bad_input() {
        assert!(parse_cli(&args(&["--size", "64"])).is_err());
        assert!(parse_cli(&args(&["--frames"])).is_err());
        assert!(parse_cli(&args(&["--headless"])).is_err());
    }
}
