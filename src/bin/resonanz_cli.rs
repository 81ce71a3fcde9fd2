//! CLI client for the `resonanzd` daemon.
//!
//! Examples:
//!   resonanz-cli status
//!   resonanz-cli measure --pictures ~/pics --keywords ~/words.txt --models ~/models
//!   resonanz-cli optimize --wait
//!   resonanz-cli execute --target "Empty signal 1=0.2,_,0.8@0.5" --loop
//!   resonanz-cli set show-top-results 5
//!   resonanz-cli stop
//!
//! By default it talks to 127.0.0.1:9877; override with `--addr host:port`.
//! Media options left out fall back to the daemon's data directory.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use resonanz::analysis::{DeltaStatistics, ModelAnalysis};
use resonanz::command::{ExecuteFlags, MediaSources, SignalTarget, DEFAULT_TOLERANCE};
use resonanz::config::EngineConfig;
use resonanz::observer::EngineSnapshot;
use resonanz::program::ProgramStats;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    GetStatus,
    GetSignals,
    ShowRandom { media: Option<MediaSources> },
    Measure { media: Option<MediaSources> },
    Optimize { media: Option<MediaSources> },
    Execute {
        media: Option<MediaSources>,
        targets: Vec<SignalTarget>,
        flags: ExecuteFlags,
    },
    MeasureProgram {
        media_file: PathBuf,
        signals: Vec<String>,
        length: usize,
    },
    Stop,
    SetParameter { name: String, value: String },
    GetConfig,
    GetMeasuredProgram,
    InvalidateMeasuredProgram,
    GetProgramStats,
    AnalyzeModels { media: Option<MediaSources> },
    DeltaStatistics { media: Option<MediaSources> },
    DeleteModelData { model_dir: Option<PathBuf> },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Response {
    Status(StatusReply),
    Signals { device_id: String, names: Vec<String> },
    Config(EngineConfig),
    MeasuredProgram { program: Option<Vec<Vec<f32>>> },
    ProgramStats(ProgramStats),
    Analysis(ModelAnalysis),
    Deltas(DeltaStatistics),
    Success { message: String },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusReply {
    status: String,
    busy: bool,
    snapshot: EngineSnapshot,
}

fn usage() -> ! {
    eprintln!("resonanz-cli (talks to resonanzd @ 127.0.0.1:9877 by default)");
    eprintln!("Usage: resonanz-cli [--addr host:port] <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  status                          Show status, busy flag and snapshot");
    eprintln!("  signals                         List device signal names");
    eprintln!("  show-random [media] [--wait]    Display random stimuli");
    eprintln!("  measure [media] [--wait]        Record stimulus responses");
    eprintln!("  optimize [media] [--wait]       Train models from recorded data");
    eprintln!("  execute [media] --target NAME=v1,v2,_,v3[@tol] ... [--loop] [--blind] [--record] [--wait]");
    eprintln!("                                  Drive signals along a target program (`_` = unset step)");
    eprintln!("  measure-program FILE LENGTH SIGNAL... [--wait]");
    eprintln!("                                  Record signals while FILE plays");
    eprintln!("  stop                            Return to idle");
    eprintln!("  wait [seconds]                  Poll until the daemon is no longer busy");
    eprintln!("  set <name> <value>              Set a runtime parameter");
    eprintln!("  config                          Show the engine configuration");
    eprintln!("  program | clear-program         Show or discard the measured program");
    eprintln!("  stats                           Show executed program statistics");
    eprintln!("  analyze [media] | deltas [media]  Summarize a model directory");
    eprintln!("  delete [--models DIR]           Delete persisted datasets and models");
    eprintln!("  shutdown                        Stop the daemon");
    eprintln!("\nMedia options: --pictures DIR --keywords FILE --models DIR [--audio FILE]");
    process::exit(1);
}

fn fail(msg: &str) -> ! {
    eprintln!("{msg}");
    process::exit(1);
}

fn parse_args() -> (String, Vec<String>) {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }

    let mut addr = "127.0.0.1:9877".to_string();
    if args.len() >= 2 && args[0] == "--addr" {
        addr = args[1].clone();
        args.drain(0..2);
    }

    if args.is_empty() {
        usage();
    }

    (addr, args)
}

/// Options shared by the media-taking commands.
#[derive(Default)]
struct Options {
    pictures: Option<PathBuf>,
    keywords: Option<PathBuf>,
    models: Option<PathBuf>,
    audio: Option<PathBuf>,
    targets: Vec<SignalTarget>,
    flags: ExecuteFlags,
    wait: bool,
    positional: Vec<String>,
}

impl Options {
    fn parse(args: &[String]) -> Self {
        let mut o = Options::default();
        let mut it = args.iter();
        while let Some(a) = it.next() {
            let mut value = || it.next().cloned().unwrap_or_else(|| fail(&format!("{a} needs a value")));
            match a.as_str() {
                "--pictures" => o.pictures = Some(value().into()),
                "--keywords" => o.keywords = Some(value().into()),
                "--models" => o.models = Some(value().into()),
                "--audio" => o.audio = Some(value().into()),
                "--target" => o.targets.push(parse_target(&value())),
                "--loop" => o.flags.looping = true,
                "--blind" => o.flags.blind = true,
                "--record" => o.flags.record_video = true,
                "--wait" => o.wait = true,
                flag if flag.starts_with("--") => fail(&format!("unknown option {flag}")),
                _ => o.positional.push(a.clone()),
            }
        }
        o
    }

    /// `None` lets the daemon use its defaults; a partial set is an error.
    fn media(&self) -> Option<MediaSources> {
        match (&self.pictures, &self.keywords, &self.models) {
            (None, None, None) => None,
            (Some(p), Some(k), Some(m)) => {
                let media = MediaSources::new(p.clone(), k.clone(), m.clone());
                Some(match &self.audio {
                    Some(a) => media.with_audio(a.clone()),
                    None => media,
                })
            }
            _ => fail("--pictures, --keywords and --models must be given together"),
        }
    }
}

/// `NAME=v1,v2,_,v3[@tolerance]`
fn parse_target(spec: &str) -> SignalTarget {
    let (name, rest) = spec
        .split_once('=')
        .unwrap_or_else(|| fail(&format!("target `{spec}` is not NAME=values")));
    let (values, tolerance) = match rest.rsplit_once('@') {
        Some((v, t)) => (
            v,
            t.parse::<f32>()
                .unwrap_or_else(|_| fail(&format!("bad tolerance `{t}`"))),
        ),
        None => (rest, DEFAULT_TOLERANCE),
    };
    let values = values
        .split(',')
        .map(|v| match v.trim() {
            "_" | "" => None,
            x => Some(x.parse::<f32>().unwrap_or_else(|_| fail(&format!("bad target value `{x}`")))),
        })
        .collect();
    SignalTarget::new(name.trim(), values).with_tolerance(tolerance)
}

fn send_request(addr: &str, req: &Request) -> Result<Response, String> {
    let mut stream = TcpStream::connect(addr).map_err(|e| format!("connect: {e}"))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .map_err(|e| format!("set_read_timeout: {e}"))?;
    let mut reader = BufReader::new(stream.try_clone().map_err(|e| format!("clone: {e}"))?);

    let line = serde_json::to_string(req).map_err(|e| format!("serialize: {e}"))?;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(|e| format!("send: {e}"))?;

    let mut resp_line = String::new();
    reader
        .read_line(&mut resp_line)
        .map_err(|e| format!("recv: {e}"))?;
    serde_json::from_str(&resp_line).map_err(|e| format!("parse response: {e}"))
}

fn print_status(s: &StatusReply) {
    let snap = &s.snapshot;
    println!("status: {}", s.status);
    println!(
        "command={} busy={} state={}/{} pictures={} keywords={} models={}/{} samples={} stream={}",
        snap.command,
        s.busy,
        snap.brain_state,
        snap.state_count,
        snap.pictures,
        snap.keywords,
        snap.models_loaded.0,
        snap.models_loaded.1,
        snap.samples,
        snap.stream_len,
    );
    if let (Some(stage), Some(pct)) = (snap.stage, snap.training_percent) {
        match snap.training_eta_secs {
            Some(eta) => println!("training: {stage:?} {pct:.1}% eta={eta:.0}s"),
            None => println!("training: {stage:?} {pct:.1}%"),
        }
    }
    if snap.program.ticks > 0 {
        println!("program: {}", snap.program);
    }
}

fn print_response(resp: Response) {
    match resp {
        Response::Status(s) => print_status(&s),
        Response::Signals { device_id, names } => {
            println!("device: {device_id}");
            for (i, n) in names.iter().enumerate() {
                println!("  {i:>3}  {n}");
            }
        }
        Response::Config(c) => match serde_json::to_string_pretty(&c) {
            Ok(json) => println!("{json}"),
            Err(e) => fail(&format!("encode config: {e}")),
        },
        Response::MeasuredProgram { program: None } => println!("no measured program"),
        Response::MeasuredProgram { program: Some(steps) } => {
            for (i, step) in steps.iter().enumerate() {
                let row: Vec<String> = step.iter().map(|v| format!("{v:.4}")).collect();
                println!("{i:>5}  {}", row.join(" "));
            }
        }
        Response::ProgramStats(s) => println!("{s}"),
        Response::Analysis(a) => println!("{a}"),
        Response::Deltas(d) => {
            println!("{} samples", d.samples);
            for (i, (m, s)) in d.mean.iter().zip(&d.stddev).enumerate() {
                println!("  signal {i:>3}: mean={m:+.5} std={s:.5}");
            }
        }
        Response::Success { message } => println!("ok: {message}"),
        Response::Error { message } => fail(&format!("error: {message}")),
    }
}

/// Poll until the daemon reports not busy; prints status changes on the way.
fn wait_idle(addr: &str, limit: Option<Duration>) {
    let started = Instant::now();
    let mut last = String::new();
    loop {
        match send_request(addr, &Request::GetStatus) {
            Ok(Response::Status(s)) => {
                if s.status != last {
                    println!("{}", s.status);
                    last = s.status.clone();
                }
                if !s.busy {
                    return;
                }
            }
            Ok(other) => print_response(other),
            Err(e) => fail(&e),
        }
        if limit.is_some_and(|l| started.elapsed() > l) {
            fail("timed out waiting for the daemon");
        }
        thread::sleep(Duration::from_millis(250));
    }
}

fn main() {
    let (addr, args) = parse_args();
    let cmd = args[0].as_str();
    let opts = Options::parse(&args[1..]);

    let req = match cmd {
        "status" => Request::GetStatus,
        "signals" => Request::GetSignals,
        "show-random" => Request::ShowRandom { media: opts.media() },
        "measure" => Request::Measure { media: opts.media() },
        "optimize" => Request::Optimize { media: opts.media() },
        "execute" => {
            if opts.targets.is_empty() {
                fail("execute needs at least one --target");
            }
            Request::Execute {
                media: opts.media(),
                targets: opts.targets.clone(),
                flags: opts.flags,
            }
        }
        "measure-program" => {
            if opts.positional.len() < 3 {
                usage();
            }
            let length = opts.positional[1]
                .parse()
                .unwrap_or_else(|_| fail("LENGTH must be a positive integer"));
            Request::MeasureProgram {
                media_file: PathBuf::from(&opts.positional[0]),
                signals: opts.positional[2..].to_vec(),
                length,
            }
        }
        "stop" => Request::Stop,
        "wait" => {
            let limit = opts
                .positional
                .first()
                .map(|s| s.parse::<u64>().unwrap_or_else(|_| fail("seconds must be an integer")))
                .map(Duration::from_secs);
            wait_idle(&addr, limit);
            return;
        }
        "set" => {
            if opts.positional.len() < 2 {
                usage();
            }
            Request::SetParameter {
                name: opts.positional[0].clone(),
                value: opts.positional[1].clone(),
            }
        }
        "config" => Request::GetConfig,
        "program" => Request::GetMeasuredProgram,
        "clear-program" => Request::InvalidateMeasuredProgram,
        "stats" => Request::GetProgramStats,
        "analyze" => Request::AnalyzeModels { media: opts.media() },
        "deltas" => Request::DeltaStatistics { media: opts.media() },
        "delete" => Request::DeleteModelData {
            model_dir: opts.models.clone(),
        },
        "shutdown" => Request::Shutdown,
        _ => usage(),
    };

    match send_request(&addr, &req) {
        Ok(resp) => print_response(resp),
        Err(e) => fail(&e),
    }
    if opts.wait {
        wait_idle(&addr, None);
    }
}
