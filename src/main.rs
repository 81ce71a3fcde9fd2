//! Hardware-free demonstration session.
//!
//! A random-walk device, a headless display and a throwaway model directory
//! run through Measure → Optimize → Execute in-process.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use resonanz::model::FitSettings;
use resonanz::prelude::*;

const PICTURES: [&str; 4] = ["forest.png", "city.png", "ocean.png", "desert.png"];
const KEYWORDS: [&str; 3] = ["calm", "focus", "storm"];

fn print_help() {
    println!("resonanz demo");
    println!();
    println!("Usage: resonanz [--seconds N] [--models DIR]");
    println!();
    println!("  --seconds N    Length of each phase (default 5)");
    println!("  --models DIR   Model directory (default: a fresh temp directory)");
}

fn parse_args() -> (Duration, PathBuf) {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut seconds = 5u64;
    let mut models = std::env::temp_dir().join(format!("resonanz-demo-{}", process::id()));
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" | "help" => {
                print_help();
                process::exit(0);
            }
            "--seconds" if i + 1 < args.len() => {
                seconds = args[i + 1].parse().unwrap_or_else(|_| {
                    eprintln!("--seconds needs an integer");
                    process::exit(2);
                });
                i += 1;
            }
            "--models" if i + 1 < args.len() => {
                models = PathBuf::from(&args[i + 1]);
                i += 1;
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_help();
                process::exit(2);
            }
        }
        i += 1;
    }
    (Duration::from_secs(seconds.max(1)), models)
}

fn wait_idle(engine: &Engine, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    let mut last = String::new();
    while Instant::now() < deadline {
        let status = engine.status();
        if status != last {
            println!("  {status}");
            last = status;
        }
        if !engine.is_busy() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    false
}

fn run() -> Result<()> {
    let (phase, model_dir) = parse_args();
    std::fs::create_dir_all(&model_dir)?;
    let media = MediaSources::new(PathBuf::from("pictures"), PathBuf::from("keywords.txt"), model_dir.clone());

    let training = TrainingConfig {
        min_samples_per_entity: 5,
        min_stream_len: 100,
        fit: FitSettings {
            max_iterations: 300,
            ..FitSettings::default()
        },
        ..TrainingConfig::default()
    };
    let config = EngineConfig::default()
        .with_seed(2024)
        .with_tick(Duration::from_millis(20))
        .with_estimator_period(Duration::from_millis(10))
        .with_measure_hold(Duration::from_millis(20))
        .with_training(training);

    let engine = Engine::start(
        Box::new(RandomDevice::new(3, Some(7)).with_step(0.03)),
        Box::new(HeadlessPresenter::new()),
        Arc::new(StaticCatalog::new(&PICTURES, &KEYWORDS)),
        Arc::new(FileStore),
        config,
    )?;
    println!("device: {} ({} signals)", engine.device_id(), engine.signal_names().len());
    println!("models: {}", model_dir.display());

    // ── Measure until every entity has enough samples ──
    println!("\n[measure]");
    engine.measure(media.clone())?;
    for _ in 0..10 {
        thread::sleep(phase);
        engine.stop()?;
        wait_idle(&engine, Duration::from_secs(10));
        let analysis = engine.analyze_models(&media)?;
        println!("  {analysis}");
        if analysis.min_samples >= 5 {
            break;
        }
        engine.measure(media.clone())?;
    }
    let deltas = engine.delta_statistics(&media)?;
    for (name, (m, s)) in engine.signal_names().iter().zip(deltas.mean.iter().zip(&deltas.stddev)) {
        println!("  {name}: Δ mean {m:+.4}/s, std {s:.4}");
    }

    // ── Optimize ──
    println!("\n[optimize]");
    engine.optimize(media.clone())?;
    if !wait_idle(&engine, Duration::from_secs(300)) {
        engine.stop()?;
        wait_idle(&engine, Duration::from_secs(10));
    }
    println!("  {}", engine.analyze_models(&media)?);

    // ── Execute a rising ramp on the first signal ──
    println!("\n[execute]");
    let first = engine.signal_names()[0].clone();
    let target = SignalTarget::new(first, vec![Some(0.3), None, None, Some(0.7)]).with_tolerance(0.5);
    engine.execute(media.clone(), vec![target], ExecuteFlags::default())?;
    let deadline = Instant::now() + phase;
    while engine.is_busy() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(250));
        let snap = engine.snapshot();
        println!("  {} | state {}/{}", snap.status, snap.brain_state, snap.state_count);
    }
    engine.stop()?;
    wait_idle(&engine, Duration::from_secs(10));
    println!("  {}", engine.program_statistics());

    engine.shutdown(Duration::from_secs(5))?;
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("demo failed: {e}");
        process::exit(1);
    }
}
