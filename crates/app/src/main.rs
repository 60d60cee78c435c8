use std::{
    io::{self, BufRead},
    path::{Path, PathBuf},
    thread,
};

use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{select, Receiver};
use rhythm_trainer_core::{
    score_offline, score_recording, AppConfig, BeatClock, BeatTick, CaptureMode, ClockEvent,
    MonotonicClock, PatternKind, RhythmError, SessionController, SessionEvent, SessionResult,
    TempoSpec, WavFrameSource,
};
use tracing_subscriber::EnvFilter;

fn main() -> rhythm_trainer_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Practice { session, input } => run_practice(&session, input.as_deref()),
        Commands::Score {
            session,
            taps,
            wav,
            lead_in,
        } => run_score(&session, taps, wav.as_deref(), lead_in),
        Commands::Metronome(args) => run_metronome(&args),
        Commands::Patterns { json } => list_patterns(json),
    }
}

fn run_practice(args: &SessionArgs, input: Option<&Path>) -> rhythm_trainer_core::Result<()> {
    let mut config = args.resolve_config()?;
    if input.is_some() {
        config.session.capture_mode = CaptureMode::Microphone;
    }
    let context = config.session_context()?;
    tracing::info!(
        bpm = context.tempo.bpm,
        pattern = %context.pattern.kind(),
        "starting practice session"
    );

    let how = match context.capture_mode {
        CaptureMode::Tap => "Press ENTER on every note",
        CaptureMode::Microphone => "Play along, the input is listening",
    };
    println!(
        "{} at {:.0} BPM for {:.0}s. {how}, `q` + ENTER to stop.",
        context.pattern.kind(),
        context.tempo.bpm,
        context.duration_seconds
    );

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let clock = MonotonicClock::shared();
    let session = match input {
        Some(path) => {
            let source = WavFrameSource::open(path, context.audio.block_size);
            SessionController::start_with_input(context, clock, events_tx, source)?
        }
        None => SessionController::start(context, clock, events_tx)?,
    };

    let lines = spawn_stdin_reader();
    let result = drive_session(&session, &events_rx, &lines)?;
    match result {
        Some(result) => print_result(&result, args.json),
        None => {
            println!("Session cancelled before it started.");
            Ok(())
        }
    }
}

fn drive_session(
    session: &SessionController,
    events: &Receiver<SessionEvent>,
    lines: &Receiver<String>,
) -> rhythm_trainer_core::Result<Option<SessionResult>> {
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(SessionEvent::Finished(_)) | Err(_) => return session.finish(),
                Ok(event) => render_event(&event),
            },
            recv(lines) -> line => match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("q") => return session.finish(),
                Ok(_) => match session.tap() {
                    Ok(()) => {}
                    Err(err) if !session.taps_enabled() => println!("  ({err})"),
                    Err(err) => tracing::debug!(%err, "tap after session end"),
                },
                Err(_) => return session.finish(),
            },
        }
    }
}

fn render_event(event: &SessionEvent) {
    match event {
        SessionEvent::CountdownTick { remaining } => println!("  {remaining}..."),
        SessionEvent::Started { .. } => println!("  Go!"),
        SessionEvent::BeatTick(tick) if !tick.target.is_rest => {
            println!("  {}", if tick.target.accented { "TICK" } else { "tick" });
        }
        SessionEvent::BeatTick(_) => println!("  (rest)"),
        SessionEvent::BeatResult(result) => {
            println!(
                "    beat {:>3}: {} ({:+.0} ms)",
                result.target_index + 1,
                result.accuracy,
                result.deviation_seconds * 1000.0
            );
        }
        SessionEvent::CaptureUnavailable(reason) => {
            println!("  Audio input unavailable ({reason}); keep tapping ENTER.");
        }
        SessionEvent::Finished(_) => {}
    }
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

const TEMPO_STEP: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum TempoCommand {
    Quit,
    Set(f64),
}

/// `+`/`-` nudge the tempo, a bare number sets it, `q` quits.
fn parse_tempo_command(line: &str, current_bpm: f64) -> Option<TempoCommand> {
    match line.trim() {
        "q" | "Q" => Some(TempoCommand::Quit),
        "+" => Some(TempoCommand::Set(current_bpm + TEMPO_STEP)),
        "-" => Some(TempoCommand::Set(current_bpm - TEMPO_STEP)),
        other => other
            .parse::<f64>()
            .ok()
            .filter(|bpm| bpm.is_finite())
            .map(TempoCommand::Set),
    }
}

fn click_text(tick: &BeatTick, audible: bool) -> String {
    let position = tick.slot_index + 1;
    if tick.target.is_rest {
        return format!("  - ({position})");
    }
    let bell = if audible { "\x07" } else { "" };
    let label = if tick.target.accented { "CLICK" } else { "click" };
    format!("{bell}  {label} ({position})")
}

fn run_metronome(args: &MetronomeArgs) -> rhythm_trainer_core::Result<()> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(bpm) = args.bpm {
        config.tempo.bpm = bpm;
    }
    if let Some(pattern) = args.pattern {
        config.tempo.pattern = pattern;
        config.tempo.custom = None;
    }
    let config = config.sanitized();
    let pattern = config.pattern()?;
    let tempo = TempoSpec::for_pattern(config.tempo.bpm, &pattern);

    let (ticks_tx, ticks_rx) = crossbeam_channel::unbounded();
    let clock = BeatClock::new(MonotonicClock::shared(), ticks_tx);
    clock.configure(tempo, pattern.clone())?;
    clock.set_countdown_beats(args.countdown)?;

    println!(
        "{} at {:.0} BPM. `+`/`-` or a BPM value + ENTER changes tempo, `q` + ENTER quits.",
        pattern.kind(),
        tempo.bpm
    );
    clock.start()?;

    let lines = spawn_stdin_reader();
    loop {
        select! {
            recv(ticks_rx) -> event => match event {
                Ok(ClockEvent::CountdownTick { remaining, .. }) => println!("  {remaining}..."),
                Ok(ClockEvent::CountdownComplete { .. }) => {}
                Ok(ClockEvent::Beat(tick)) => println!("{}", click_text(&tick, !args.silent)),
                Err(_) => break,
            },
            recv(lines) -> line => {
                let Ok(line) = line else { break };
                match parse_tempo_command(&line, clock.tempo()?.bpm) {
                    Some(TempoCommand::Quit) => break,
                    Some(TempoCommand::Set(bpm)) => {
                        clock.update_tempo(bpm)?;
                        println!("  tempo {:.0} BPM", clock.tempo()?.bpm);
                    }
                    None => println!("  expected `+`, `-`, a BPM value or `q`"),
                }
            },
        }
    }

    clock.stop()?;
    let drift = clock.drift_stats()?;
    tracing::info!(?drift, "metronome stopped");
    println!(
        "{} ticks, mean lateness {:.2} ms, worst {:.2} ms, {} over 1 ms",
        drift.ticks,
        drift.mean_lateness_nanos() / 1_000_000.0,
        drift.max_lateness_nanos as f64 / 1_000_000.0,
        drift.overruns
    );
    Ok(())
}

fn run_score(
    args: &SessionArgs,
    taps: Option<Vec<f64>>,
    wav: Option<&Path>,
    lead_in: f64,
) -> rhythm_trainer_core::Result<()> {
    let context = args.resolve_config()?.session_context()?;

    let result = match (taps, wav) {
        (Some(taps), None) => {
            tracing::info!(captures = taps.len(), "scoring tap list");
            score_offline(&context, &taps)
        }
        (None, Some(path)) => {
            tracing::info!(path = %path.display(), "scoring recording");
            let mut source = WavFrameSource::open(path, context.audio.block_size)?;
            score_recording(&context, &mut source, lead_in)?
        }
        _ => {
            return Err(RhythmError::InvalidInput(
                "pass exactly one of --taps or --wav",
            ))
        }
    };

    print_result(&result, args.json)
}

fn list_patterns(json: bool) -> rhythm_trainer_core::Result<()> {
    if json {
        let listing: Vec<serde_json::Value> = PatternKind::PRESETS
            .iter()
            .map(|kind| {
                serde_json::json!({
                    "id": kind.slug(),
                    "name": kind.name(),
                    "description": kind.description(),
                    "difficulty": kind.difficulty(),
                    "slots": kind.pattern().slot_count(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    for kind in PatternKind::PRESETS {
        println!(
            "{:<16} {:<18} difficulty {}  {}",
            kind.slug(),
            kind.name(),
            kind.difficulty(),
            kind.description()
        );
    }
    Ok(())
}

fn print_result(result: &SessionResult, json: bool) -> rhythm_trainer_core::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!();
    println!("Grade {}  ({:.1}%)", result.grade, result.accuracy_percentage);
    println!(
        "Perfect {}  Good {}  Inaccurate {}  Miss {}",
        result.counts.perfect, result.counts.good, result.counts.inaccurate, result.counts.miss
    );
    println!(
        "Average deviation {:.1} ms, {} early / {} late",
        result.average_deviation_ms, result.early_hits, result.late_hits
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Rhythm practice and timing scorer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play along with the metronome, tapping ENTER on each note.
    Practice {
        #[command(flatten)]
        session: SessionArgs,
        /// Recording to stream as live microphone input instead of tapping.
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Score a finished performance without real-time playback.
    Score {
        #[command(flatten)]
        session: SessionArgs,
        /// Capture times in seconds from the first beat, comma separated.
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        taps: Option<Vec<f64>>,
        /// WAV recording to run through onset detection.
        #[arg(long)]
        wav: Option<PathBuf>,
        /// Seconds of recording before the first beat.
        #[arg(long, default_value_t = 0.0)]
        lead_in: f64,
    },
    /// Free-running metronome with live tempo changes.
    Metronome(MetronomeArgs),
    /// List the built-in rhythm patterns.
    Patterns {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// JSON configuration file; flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    bpm: Option<f64>,
    /// Pattern id, see `patterns`.
    #[arg(long)]
    pattern: Option<PatternKind>,
    /// Session length in seconds.
    #[arg(long)]
    duration: Option<f64>,
    /// Pre-roll beats before the first scored beat.
    #[arg(long)]
    countdown: Option<u32>,
    /// Print the result as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct MetronomeArgs {
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    bpm: Option<f64>,
    #[arg(long)]
    pattern: Option<PatternKind>,
    /// Pre-roll beats before the first click.
    #[arg(long, default_value_t = 0)]
    countdown: u32,
    /// Print clicks without ringing the terminal bell.
    #[arg(long)]
    silent: bool,
}

impl SessionArgs {
    fn resolve_config(&self) -> rhythm_trainer_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };

        if let Some(bpm) = self.bpm {
            config.tempo.bpm = bpm;
        }
        if let Some(pattern) = self.pattern {
            config.tempo.pattern = pattern;
            config.tempo.custom = None;
        }
        if let Some(duration) = self.duration {
            config.session.duration_seconds = duration;
        }
        if let Some(countdown) = self.countdown {
            config.session.countdown_beats = countdown;
        }
        Ok(config.sanitized())
    }
}
