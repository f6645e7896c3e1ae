use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{ImageBuffer, Rgba, RgbaImage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

const SCREENSHOTS_DIR: &str = "screenshots";
const DEFAULT_PHASE_NAME: &str = "untitled";
const DEFAULT_DESCRIPTION: &str = "Some Mechanic";
const DEFAULT_TICK_MS: u64 = 10;
const CLIPBOARD_WAIT_MS: u64 = 1500;
const DESKTOP_BOUNDS_SCRIPT: &str =
    "tell application \"Finder\" to get bounds of window of desktop";

const SESSION_HELP: &str = r#"Commands:
  start | pause | resume | reset       timer lifecycle
  call [description]                   capture both regions at the current time
  +1s | -1s                            nudge the clock by one second
  goto <row>                           seek to a callout's timestamp
  region capture <x1,y1> <x2,y2>       set the capture rectangle (screen points)
  region castbar <x1,y1> <x2,y2>       set the cast-bar rectangle
  regions                              show configured rectangles
  list                                 print the timeline
  edit <row> time <seconds>            rewrite a callout's timestamp
  edit <row> desc <text>               rewrite a callout's description
  edit <row> notes <text>              rewrite a callout's notes
  edit <row> active true|false         include/exclude a callout from export
  export                               copy active callouts to the clipboard
  save [name] | new [name] | open <name>
  status | help | quit"#;

#[derive(Parser, Debug)]
#[command(
    name = "raidcall",
    version,
    about = "Stopwatch-driven callout recorder with screen captures and per-phase JSON timelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the interactive stopwatch session
    Session(SessionArgs),
    /// Render a saved phase as tab-separated callout lines
    Export(ExportArgs),
    /// Print a saved phase's timeline
    Show(ShowArgs),
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Phase name to start with
    #[arg(long, default_value = DEFAULT_PHASE_NAME)]
    phase: String,
    /// Base directory for phase files and screenshots
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Timer tick interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_TICK_MS)]
    tick_ms: u64,
    /// Display pixel density override (skips the startup probe)
    #[arg(long)]
    display_scale: Option<f64>,
    /// Burn the elapsed time into each capture artifact
    #[arg(long, action = ArgAction::SetTrue)]
    stamp: bool,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Phase name or path to a phase JSON file
    phase: String,
    /// Base directory for phase files
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Deliver to the system clipboard instead of stdout
    #[arg(long, action = ArgAction::SetTrue)]
    copy: bool,
}

#[derive(Args, Debug)]
struct ShowArgs {
    /// Phase name or path to a phase JSON file
    phase: String,
    /// Base directory for phase files
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Emit the raw JSON array
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Callout {
    timestamp: f64,
    description: String,
    active: bool,
    notes: String,
    screen_image_path: String,
    cast_image_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreChange {
    Inserted { first: usize, last: usize },
    Removed { first: usize, last: usize },
    Updated { row: usize },
}

#[derive(Debug, Default)]
struct Timeline {
    callouts: Vec<Callout>,
}

impl Timeline {
    fn new() -> Self {
        Self::default()
    }

    fn count(&self) -> usize {
        self.callouts.len()
    }

    fn get(&self, row: usize) -> Option<&Callout> {
        self.callouts.get(row)
    }

    fn callouts(&self) -> &[Callout] {
        &self.callouts
    }

    fn append(&mut self, callout: Callout) -> StoreChange {
        let row = self.callouts.len();
        self.callouts.push(callout);
        StoreChange::Inserted { first: row, last: row }
    }

    fn clear(&mut self) -> Option<StoreChange> {
        if self.callouts.is_empty() {
            return None;
        }
        let last = self.callouts.len() - 1;
        self.callouts.clear();
        Some(StoreChange::Removed { first: 0, last })
    }

    fn replace_all(&mut self, callouts: Vec<Callout>) -> Vec<StoreChange> {
        let mut changes = Vec::new();
        if let Some(removed) = self.clear() {
            changes.push(removed);
        }
        if !callouts.is_empty() {
            changes.push(StoreChange::Inserted {
                first: 0,
                last: callouts.len() - 1,
            });
            self.callouts = callouts;
        }
        changes
    }

    fn set_timestamp(&mut self, row: usize, timestamp_ms: f64) -> Result<StoreChange> {
        if !timestamp_ms.is_finite() || timestamp_ms < 0.0 {
            bail!("timestamp must be a non-negative number of milliseconds");
        }
        self.checked_mut(row)?.timestamp = timestamp_ms;
        Ok(StoreChange::Updated { row })
    }

    fn set_description(&mut self, row: usize, description: String) -> Result<StoreChange> {
        self.checked_mut(row)?.description = description;
        Ok(StoreChange::Updated { row })
    }

    fn set_active(&mut self, row: usize, active: bool) -> Result<StoreChange> {
        self.checked_mut(row)?.active = active;
        Ok(StoreChange::Updated { row })
    }

    fn set_notes(&mut self, row: usize, notes: String) -> Result<StoreChange> {
        self.checked_mut(row)?.notes = notes;
        Ok(StoreChange::Updated { row })
    }

    fn checked_mut(&mut self, row: usize) -> Result<&mut Callout> {
        let count = self.callouts.len();
        self.callouts
            .get_mut(row)
            .with_context(|| format!("no callout at row {row} (timeline has {count})"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Stopped,
    Paused,
    Running,
}

#[derive(Debug)]
struct PlaybackTimer {
    state: TimerState,
    elapsed_ms: f64,
    playback_row: usize,
    last_tick: Option<Instant>,
}

impl PlaybackTimer {
    fn new() -> Self {
        Self {
            state: TimerState::Stopped,
            elapsed_ms: 0.0,
            playback_row: 0,
            last_tick: None,
        }
    }

    fn start(&mut self, now: Instant) -> Result<()> {
        if self.state != TimerState::Stopped {
            bail!("timer already started; use pause, resume, or reset");
        }
        self.state = TimerState::Running;
        self.last_tick = Some(now);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if self.state != TimerState::Running {
            bail!("timer is not running");
        }
        self.state = TimerState::Paused;
        self.last_tick = None;
        Ok(())
    }

    fn resume(&mut self, now: Instant) -> Result<()> {
        if self.state != TimerState::Paused {
            bail!("timer is not paused");
        }
        self.state = TimerState::Running;
        self.last_tick = Some(now);
        Ok(())
    }

    fn reset(&mut self) {
        self.state = TimerState::Stopped;
        self.elapsed_ms = 0.0;
        self.playback_row = 0;
        self.last_tick = None;
    }

    /// Accumulates the wall-clock delta since the previous tick and advances
    /// the playback row. Returns the new row when it moved.
    fn tick(&mut self, now: Instant, timeline: &Timeline) -> Option<usize> {
        if self.state != TimerState::Running {
            return None;
        }
        let Some(last) = self.last_tick else {
            self.last_tick = Some(now);
            return None;
        };
        self.elapsed_ms += now.saturating_duration_since(last).as_secs_f64() * 1000.0;
        self.last_tick = Some(now);
        if self.advance(timeline) {
            Some(self.playback_row)
        } else {
            None
        }
    }

    /// Explicit seek: clamps at zero, then rescans from the first row so a
    /// backward jump lands correctly. Returns the resulting playback row.
    fn set_elapsed_ms(&mut self, elapsed_ms: f64, timeline: &Timeline) -> usize {
        self.elapsed_ms = elapsed_ms.max(0.0);
        self.playback_row = 0;
        self.advance(timeline);
        self.playback_row
    }

    fn advance(&mut self, timeline: &Timeline) -> bool {
        let mut moved = false;
        while let Some(callout) = timeline.get(self.playback_row) {
            if callout.timestamp > self.elapsed_ms {
                break;
            }
            self.playback_row += 1;
            moved = true;
        }
        moved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Capture,
    CastBar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
}

impl Region {
    fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }
}

#[derive(Debug, Default)]
struct RegionSelector {
    kind: Option<RegionKind>,
    begin: Option<(f64, f64)>,
    end: Option<(f64, f64)>,
}

impl RegionSelector {
    fn start(&mut self, kind: RegionKind) {
        *self = Self {
            kind: Some(kind),
            begin: None,
            end: None,
        };
    }

    fn press(&mut self, x: f64, y: f64) {
        self.begin = Some((x, y));
        self.end = Some((x, y));
    }

    fn drag(&mut self, x: f64, y: f64) {
        if self.begin.is_some() {
            self.end = Some((x, y));
        }
    }

    /// Normalizes the dragged corners (min/max on each axis), converts to
    /// device pixels with the display factor, and clears the selection.
    fn release(&mut self, x: f64, y: f64, display_scale: f64) -> Result<(RegionKind, Region)> {
        let kind = self.kind.context("no region selection in progress")?;
        self.drag(x, y);
        let (bx, by) = self.begin.context("no region selection in progress")?;
        let (ex, ey) = self.end.unwrap_or((bx, by));
        let region = Region {
            x1: (bx.min(ex) * display_scale).round() as i32,
            y1: (by.min(ey) * display_scale).round() as i32,
            x2: (bx.max(ex) * display_scale).round() as i32,
            y2: (by.max(ey) * display_scale).round() as i32,
        };
        *self = Self::default();
        Ok((kind, region))
    }
}

#[derive(Debug, Clone)]
struct CaptureJob {
    id: String,
    timestamp_ms: f64,
    description: String,
    capture_region: Region,
    cast_bar_region: Region,
    display_scale: f64,
    screen_image_path: PathBuf,
    cast_image_path: PathBuf,
    stamp: bool,
}

#[derive(Debug)]
struct CaptureReport {
    callout: Callout,
    warnings: Vec<String>,
}

enum Event {
    Tick,
    Input(String),
    InputClosed,
    CaptureFinished {
        id: String,
        outcome: Result<CaptureReport>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum SessionCommand {
    Start,
    Pause,
    Resume,
    Reset,
    Call {
        description: Option<String>,
    },
    Nudge {
        delta_ms: f64,
    },
    Goto {
        row: usize,
    },
    SelectRegion {
        kind: RegionKind,
        begin: (f64, f64),
        end: (f64, f64),
    },
    Regions,
    List,
    Edit {
        row: usize,
        field: EditField,
    },
    Export,
    Save {
        name: Option<String>,
    },
    New {
        name: Option<String>,
    },
    Open {
        name: String,
    },
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
enum EditField {
    Time(f64),
    Desc(String),
    Notes(String),
    Active(bool),
}

#[derive(Debug, Clone)]
struct ProbeDiagnostic {
    attempts: u32,
    message: Option<String>,
}

struct Session {
    base_dir: PathBuf,
    screenshots_dir: PathBuf,
    phase_name: String,
    timeline: Timeline,
    timer: PlaybackTimer,
    selector: RegionSelector,
    capture_region: Option<Region>,
    cast_bar_region: Option<Region>,
    display_scale: f64,
    stamp: bool,
    pending_captures: HashMap<String, JoinHandle<()>>,
    events_tx: Sender<Event>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Session(args) => command_session(args),
        Commands::Export(args) => command_export(args),
        Commands::Show(args) => command_show(args),
    }
}

fn command_session(args: SessionArgs) -> Result<()> {
    let base_dir = base_dir(args.dir.as_deref());
    let screenshots_dir = base_dir.join(SCREENSHOTS_DIR);
    fs::create_dir_all(&screenshots_dir).with_context(|| {
        format!(
            "failed to create screenshots directory: {}",
            screenshots_dir.display()
        )
    })?;

    let display_scale = match args.display_scale {
        Some(scale) if scale > 0.0 => scale,
        Some(scale) => bail!("--display-scale must be positive, got {scale}"),
        None => {
            let (scale, warnings) = probe_display_scale(&screenshots_dir);
            for warning in &warnings {
                eprintln!("warning: {warning}");
            }
            scale
        }
    };

    let (events_tx, events_rx) = mpsc::channel();
    let _ticker = spawn_tick_thread(events_tx.clone(), args.tick_ms.max(1));
    let _reader = spawn_stdin_thread(events_tx.clone());

    let session = Session {
        base_dir,
        screenshots_dir,
        phase_name: args.phase,
        timeline: Timeline::new(),
        timer: PlaybackTimer::new(),
        selector: RegionSelector::default(),
        capture_region: None,
        cast_bar_region: None,
        display_scale,
        stamp: args.stamp,
        pending_captures: HashMap::new(),
        events_tx,
    };

    println!(
        "phase '{}' (display scale {:.2}); type 'help' for commands",
        session.phase_name, session.display_scale
    );
    session.run(events_rx)
}

fn command_export(args: ExportArgs) -> Result<()> {
    let base_dir = base_dir(args.dir.as_deref());
    let path = resolve_phase_path(&base_dir, &args.phase);
    let callouts = load_phase(&path)?;
    let text = render_export(&callouts);
    let active = callouts.iter().filter(|c| c.active).count();

    if args.copy {
        if copy_to_clipboard(&text)? {
            eprintln!("copied {active} active callout(s) to clipboard");
            return Ok(());
        }
        eprintln!("warning: no clipboard helper found; printing to stdout");
    }
    print!("{text}");
    Ok(())
}

fn command_show(args: ShowArgs) -> Result<()> {
    let base_dir = base_dir(args.dir.as_deref());
    let path = resolve_phase_path(&base_dir, &args.phase);
    let callouts = load_phase(&path)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&callouts)?);
        return Ok(());
    }

    if callouts.is_empty() {
        println!("phase '{}' is empty", args.phase);
        return Ok(());
    }
    for (row, callout) in callouts.iter().enumerate() {
        println!(
            "{:>3}  {:>9}s  {}{}",
            row,
            format_ms(callout.timestamp),
            callout.description,
            if callout.active { "" } else { "  [muted]" }
        );
        if !callout.notes.is_empty() {
            println!("     notes: {}", callout.notes);
        }
    }
    Ok(())
}

impl Session {
    fn run(mut self, events_rx: Receiver<Event>) -> Result<()> {
        loop {
            let event = match events_rx.recv() {
                Ok(event) => event,
                Err(_) => break,
            };
            match event {
                Event::Tick => {
                    if let Some(row) = self.timer.tick(Instant::now(), &self.timeline) {
                        self.select_row(row);
                    }
                }
                Event::Input(line) => {
                    if self.handle_line(&line) {
                        break;
                    }
                }
                Event::InputClosed => break,
                Event::CaptureFinished { id, outcome } => self.finish_capture(id, outcome),
            }
        }
        self.drain_captures(&events_rx);
        Ok(())
    }

    /// Returns true when the session should end.
    fn handle_line(&mut self, line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return false;
        }
        match parse_command(trimmed) {
            Ok(SessionCommand::Quit) => true,
            Ok(command) => {
                if let Err(err) = self.dispatch(command) {
                    eprintln!("error: {err:#}");
                }
                false
            }
            Err(err) => {
                eprintln!("error: {err:#}");
                false
            }
        }
    }

    fn dispatch(&mut self, command: SessionCommand) -> Result<()> {
        match command {
            SessionCommand::Start => {
                self.timer.start(Instant::now())?;
                println!("timer running");
                self.select_row(0);
            }
            SessionCommand::Pause => {
                self.timer.pause()?;
                println!("paused at {}s", format_ms(self.timer.elapsed_ms));
            }
            SessionCommand::Resume => {
                self.timer.resume(Instant::now())?;
                println!("resumed at {}s", format_ms(self.timer.elapsed_ms));
            }
            SessionCommand::Reset => {
                self.timer.reset();
                println!("timer reset");
            }
            SessionCommand::Call { description } => self.trigger_capture(description)?,
            SessionCommand::Nudge { delta_ms } => {
                let row = self
                    .timer
                    .set_elapsed_ms(self.timer.elapsed_ms + delta_ms, &self.timeline);
                println!("clock at {}s", format_ms(self.timer.elapsed_ms));
                self.select_row(row);
            }
            SessionCommand::Goto { row } => {
                let timestamp = self
                    .timeline
                    .get(row)
                    .with_context(|| format!("no callout at row {row}"))?
                    .timestamp;
                let new_row = self.timer.set_elapsed_ms(timestamp, &self.timeline);
                println!("clock at {}s", format_ms(self.timer.elapsed_ms));
                self.select_row(new_row);
            }
            SessionCommand::SelectRegion { kind, begin, end } => {
                self.selector.start(kind);
                self.selector.press(begin.0, begin.1);
                let (kind, region) = self.selector.release(end.0, end.1, self.display_scale)?;
                let slot = match kind {
                    RegionKind::Capture => &mut self.capture_region,
                    RegionKind::CastBar => &mut self.cast_bar_region,
                };
                *slot = Some(region);
                println!(
                    "{} region set to {}",
                    region_kind_label(kind),
                    region_summary(&region)
                );
            }
            SessionCommand::Regions => {
                println!("capture:  {}", describe_slot(&self.capture_region));
                println!("cast-bar: {}", describe_slot(&self.cast_bar_region));
            }
            SessionCommand::List => {
                if self.timeline.count() == 0 {
                    println!("timeline empty");
                    return Ok(());
                }
                for (row, callout) in self.timeline.callouts().iter().enumerate() {
                    let cursor = if row == self.timer.playback_row { '>' } else { ' ' };
                    println!(
                        "{cursor}{:>3}  {:>9}s  {}{}",
                        row,
                        format_ms(callout.timestamp),
                        callout.description,
                        if callout.active { "" } else { "  [muted]" }
                    );
                    if !callout.notes.is_empty() {
                        println!("      notes: {}", callout.notes);
                    }
                }
            }
            SessionCommand::Edit { row, field } => {
                let change = match field {
                    EditField::Time(ms) => self.timeline.set_timestamp(row, ms)?,
                    EditField::Desc(text) => self.timeline.set_description(row, text)?,
                    EditField::Notes(text) => self.timeline.set_notes(row, text)?,
                    EditField::Active(flag) => self.timeline.set_active(row, flag)?,
                };
                if let StoreChange::Updated { row } = change {
                    println!("row {row} updated");
                }
            }
            SessionCommand::Export => {
                let text = render_export(self.timeline.callouts());
                let active = self
                    .timeline
                    .callouts()
                    .iter()
                    .filter(|c| c.active)
                    .count();
                if copy_to_clipboard(&text)? {
                    println!("copied {active} active callout(s) to clipboard");
                } else {
                    eprintln!("warning: no clipboard helper found; printing instead");
                    print!("{text}");
                }
            }
            SessionCommand::Save { name } => {
                if let Some(name) = name {
                    self.phase_name = name;
                }
                let path = phase_path(&self.base_dir, &self.phase_name);
                save_phase(&path, self.timeline.callouts())?;
                println!(
                    "saved {} callout(s) to {}",
                    self.timeline.count(),
                    path.display()
                );
            }
            SessionCommand::New { name } => {
                self.phase_name = name.unwrap_or_else(|| "new phase".to_string());
                self.timer.reset();
                self.timeline.clear();
                println!("new phase '{}'", self.phase_name);
            }
            SessionCommand::Open { name } => {
                let path = resolve_phase_path(&self.base_dir, &name);
                let callouts = load_phase(&path)?;
                self.timer.reset();
                let count = callouts.len();
                self.timeline.replace_all(callouts);
                self.phase_name = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .unwrap_or(DEFAULT_PHASE_NAME)
                    .to_string();
                println!("opened phase '{}' with {count} callout(s)", self.phase_name);
            }
            SessionCommand::Status => {
                let state = match self.timer.state {
                    TimerState::Stopped => "stopped",
                    TimerState::Paused => "paused",
                    TimerState::Running => "running",
                };
                println!(
                    "phase '{}': {} at {}s, playback row {}/{}, {} capture(s) in flight",
                    self.phase_name,
                    state,
                    format_ms(self.timer.elapsed_ms),
                    self.timer.playback_row,
                    self.timeline.count(),
                    self.pending_captures.len()
                );
            }
            SessionCommand::Help => println!("{SESSION_HELP}"),
            SessionCommand::Quit => {}
        }
        Ok(())
    }

    fn trigger_capture(&mut self, description: Option<String>) -> Result<()> {
        if self.timer.state != TimerState::Running {
            bail!("timer is not running; start it before calling");
        }
        let capture_region = self
            .capture_region
            .context("capture region not selected (region capture <x1,y1> <x2,y2>)")?;
        let cast_bar_region = self
            .cast_bar_region
            .context("cast-bar region not selected (region castbar <x1,y1> <x2,y2>)")?;

        let id = new_capture_id();
        let (screen_image_path, cast_image_path) =
            capture_artifact_paths(&self.screenshots_dir, &id);
        let job = CaptureJob {
            id: id.clone(),
            timestamp_ms: self.timer.elapsed_ms,
            description: description.unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            capture_region,
            cast_bar_region,
            display_scale: self.display_scale,
            screen_image_path,
            cast_image_path,
            stamp: self.stamp,
        };
        println!("capture {id} started at {}s", format_ms(job.timestamp_ms));
        let handle = spawn_capture(job, self.events_tx.clone());
        self.pending_captures.insert(id, handle);
        Ok(())
    }

    fn finish_capture(&mut self, id: String, outcome: Result<CaptureReport>) {
        if let Some(handle) = self.pending_captures.remove(&id) {
            let _ = handle.join();
        }
        match outcome {
            Ok(report) => {
                for warning in &report.warnings {
                    eprintln!("warning: {warning}");
                }
                let description = report.callout.description.clone();
                let timestamp = report.callout.timestamp;
                let change = self.timeline.append(report.callout);
                if let StoreChange::Inserted { last, .. } = change {
                    println!(
                        "callout '{description}' at {}s -> row {last}",
                        format_ms(timestamp)
                    );
                }
            }
            Err(err) => eprintln!("error: capture {id} failed: {err:#}"),
        }
    }

    /// Selection seam to the review surface: prints the row the playback
    /// pointer now targets.
    fn select_row(&self, row: usize) {
        if row >= self.timeline.count() {
            return;
        }
        if let Some(callout) = self.timeline.get(row) {
            println!(
                "-> row {row} [{}s] {}",
                format_ms(callout.timestamp),
                callout.description
            );
        }
    }

    fn drain_captures(&mut self, events_rx: &Receiver<Event>) {
        if self.pending_captures.is_empty() {
            return;
        }
        eprintln!(
            "waiting for {} in-flight capture(s)",
            self.pending_captures.len()
        );
        let handles: Vec<(String, JoinHandle<()>)> = self.pending_captures.drain().collect();
        for (_, handle) in handles {
            let _ = handle.join();
        }
        while let Ok(event) = events_rx.try_recv() {
            if let Event::CaptureFinished { id, outcome } = event {
                self.finish_capture(id, outcome);
            }
        }
    }
}

fn spawn_tick_thread(events_tx: Sender<Event>, tick_ms: u64) -> JoinHandle<()> {
    thread::spawn(move || loop {
        thread::sleep(Duration::from_millis(tick_ms));
        if events_tx.send(Event::Tick).is_err() {
            break;
        }
    })
}

fn spawn_stdin_thread(events_tx: Sender<Event>) -> JoinHandle<()> {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if events_tx.send(Event::Input(line)).is_err() {
                        return;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = events_tx.send(Event::InputClosed);
    })
}

fn parse_command(line: &str) -> Result<SessionCommand> {
    let mut parts = line.split_whitespace();
    let Some(head) = parts.next() else {
        bail!("empty command");
    };

    let command = match head.to_ascii_lowercase().as_str() {
        "start" => SessionCommand::Start,
        "pause" => SessionCommand::Pause,
        "resume" => SessionCommand::Resume,
        "reset" => SessionCommand::Reset,
        "call" => {
            let rest = parts.collect::<Vec<_>>().join(" ");
            SessionCommand::Call {
                description: if rest.is_empty() { None } else { Some(rest) },
            }
        }
        "+1s" => SessionCommand::Nudge { delta_ms: 1000.0 },
        "-1s" => SessionCommand::Nudge { delta_ms: -1000.0 },
        "goto" => {
            let raw = parts.next().context("usage: goto <row>")?;
            SessionCommand::Goto {
                row: raw
                    .parse()
                    .with_context(|| format!("invalid row '{raw}'"))?,
            }
        }
        "region" => {
            let usage = "usage: region capture|castbar <x1,y1> <x2,y2>";
            let kind = match parts.next().context(usage)? {
                "capture" => RegionKind::Capture,
                "castbar" => RegionKind::CastBar,
                other => bail!("unknown region kind '{other}' ({usage})"),
            };
            let begin = parse_point(parts.next().context(usage)?)?;
            let end = parse_point(parts.next().context(usage)?)?;
            SessionCommand::SelectRegion { kind, begin, end }
        }
        "regions" => SessionCommand::Regions,
        "list" => SessionCommand::List,
        "edit" => {
            let usage = "usage: edit <row> time|desc|notes|active <value>";
            let raw_row = parts.next().context(usage)?;
            let row: usize = raw_row
                .parse()
                .with_context(|| format!("invalid row '{raw_row}'"))?;
            let field_name = parts.next().context(usage)?.to_ascii_lowercase();
            let rest = parts.collect::<Vec<_>>().join(" ");
            let field = match field_name.as_str() {
                "time" => {
                    let seconds: f64 = rest
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid time '{rest}' (seconds)"))?;
                    EditField::Time(seconds * 1000.0)
                }
                "desc" => EditField::Desc(rest),
                "notes" => EditField::Notes(rest),
                "active" => match rest.trim() {
                    "true" => EditField::Active(true),
                    "false" => EditField::Active(false),
                    other => bail!("expected true or false, got '{other}'"),
                },
                other => bail!("unknown field '{other}' ({usage})"),
            };
            SessionCommand::Edit { row, field }
        }
        "export" => SessionCommand::Export,
        "save" => {
            let rest = parts.collect::<Vec<_>>().join(" ");
            SessionCommand::Save {
                name: if rest.is_empty() { None } else { Some(rest) },
            }
        }
        "new" => {
            let rest = parts.collect::<Vec<_>>().join(" ");
            SessionCommand::New {
                name: if rest.is_empty() { None } else { Some(rest) },
            }
        }
        "open" => {
            let rest = parts.collect::<Vec<_>>().join(" ");
            if rest.is_empty() {
                bail!("usage: open <name>");
            }
            SessionCommand::Open { name: rest }
        }
        "status" => SessionCommand::Status,
        "help" => SessionCommand::Help,
        "quit" | "exit" => SessionCommand::Quit,
        other => bail!("unknown command '{other}' (try 'help')"),
    };
    Ok(command)
}

fn parse_point(raw: &str) -> Result<(f64, f64)> {
    let (x, y) = raw
        .split_once(',')
        .with_context(|| format!("expected x,y point, got '{raw}'"))?;
    let x: f64 = x
        .trim()
        .parse()
        .with_context(|| format!("invalid coordinate in '{raw}'"))?;
    let y: f64 = y
        .trim()
        .parse()
        .with_context(|| format!("invalid coordinate in '{raw}'"))?;
    Ok((x, y))
}

fn region_kind_label(kind: RegionKind) -> &'static str {
    match kind {
        RegionKind::Capture => "capture",
        RegionKind::CastBar => "cast-bar",
    }
}

fn region_summary(region: &Region) -> String {
    format!(
        "({}, {}) -> ({}, {}) [{}x{} px]",
        region.x1,
        region.y1,
        region.x2,
        region.y2,
        region.width(),
        region.height()
    )
}

fn describe_slot(slot: &Option<Region>) -> String {
    match slot {
        Some(region) => region_summary(region),
        None => "unset".to_string(),
    }
}

fn new_capture_id() -> String {
    format!(
        "{}-{}-{}",
        timestamp_compact(),
        std::process::id(),
        rand::thread_rng().gen_range(1000..9999)
    )
}

fn capture_artifact_paths(screenshots_dir: &Path, id: &str) -> (PathBuf, PathBuf) {
    (
        screenshots_dir.join(format!("{id}_capture.png")),
        screenshots_dir.join(format!("{id}_cast_bar.png")),
    )
}

fn spawn_capture(job: CaptureJob, events_tx: Sender<Event>) -> JoinHandle<()> {
    thread::spawn(move || {
        let id = job.id.clone();
        let outcome = run_capture_job(&job);
        let _ = events_tx.send(Event::CaptureFinished { id, outcome });
    })
}

fn run_capture_job(job: &CaptureJob) -> Result<CaptureReport> {
    let mut warnings = Vec::new();
    grab_region(
        &job.capture_region,
        job.display_scale,
        &job.screen_image_path,
        &mut warnings,
    )?;
    grab_region(
        &job.cast_bar_region,
        job.display_scale,
        &job.cast_image_path,
        &mut warnings,
    )?;
    if job.stamp {
        stamp_elapsed_label(
            &job.screen_image_path,
            &format!("{}s", format_ms(job.timestamp_ms)),
        )?;
    }
    Ok(CaptureReport {
        callout: Callout {
            timestamp: job.timestamp_ms,
            description: job.description.clone(),
            active: true,
            notes: String::new(),
            screen_image_path: job.screen_image_path.display().to_string(),
            cast_image_path: job.cast_image_path.display().to_string(),
        },
        warnings,
    })
}

/// Grabs one region to `out_path`. Uses the native capture tool where
/// available; otherwise writes a placeholder of the region's size so the
/// timeline still gains a reviewable artifact. A failed artifact write is
/// terminal for the whole callout.
fn grab_region(
    region: &Region,
    display_scale: f64,
    out_path: &Path,
    warnings: &mut Vec<String>,
) -> Result<()> {
    ensure_parent_dir(out_path)?;

    if cfg!(target_os = "macos") && command_exists("screencapture") {
        // screencapture -R takes points, the region is device pixels.
        let scale = if display_scale > 0.0 { display_scale } else { 1.0 };
        let rect = format!(
            "{:.0},{:.0},{:.0},{:.0}",
            f64::from(region.x1) / scale,
            f64::from(region.y1) / scale,
            f64::from(region.width()) / scale,
            f64::from(region.height()) / scale
        );
        let grabbed = Command::new("screencapture")
            .arg("-x")
            .arg("-R")
            .arg(rect)
            .arg(out_path)
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if grabbed {
            return Ok(());
        }
        warnings.push(format!(
            "screencapture failed for {}; writing placeholder",
            out_path.display()
        ));
    } else {
        warnings.push(format!(
            "screen grab unavailable on this host; writing placeholder for {}",
            out_path.display()
        ));
    }

    write_placeholder_region(region, out_path)
}

fn write_placeholder_region(region: &Region, out_path: &Path) -> Result<()> {
    let width = region.width().max(1);
    let height = region.height().max(1);
    let placeholder: RgbaImage =
        ImageBuffer::from_pixel(width, height, Rgba([245, 245, 245, 255]));
    placeholder
        .save(out_path)
        .with_context(|| format!("failed to write capture artifact: {}", out_path.display()))
}

fn stamp_elapsed_label(path: &Path, label: &str) -> Result<()> {
    let mut img = image::open(path)
        .with_context(|| format!("failed to read capture artifact: {}", path.display()))?
        .to_rgba8();
    let scale = 2;
    let (x0, y0, x1, y1) = text_bbox(8, 8, label, scale);
    fill_rect_alpha(&mut img, x0 - 4, y0 - 4, x1 + 4, y1 + 4, Rgba([0, 0, 0, 160]));
    draw_bitmap_text(&mut img, 8, 8, label, Rgba([255, 255, 255, 255]), scale);
    img.save(path)
        .with_context(|| format!("failed to write capture artifact: {}", path.display()))
}

fn probe_display_scale(screenshots_dir: &Path) -> (f64, Vec<String>) {
    let mut warnings = Vec::new();
    if !cfg!(target_os = "macos") || !command_exists("screencapture") {
        warnings.push(
            "display scale probe needs the native capture tool; assuming 1.0 \
             (set --display-scale to override)"
                .to_string(),
        );
        return (1.0, warnings);
    }

    let (raw, diagnostic) = run_osascript_bounded(DESKTOP_BOUNDS_SCRIPT, 2, 120);
    let Some(raw) = raw else {
        let detail = diagnostic
            .message
            .map(|message| format!(": {message}"))
            .unwrap_or_default();
        warnings.push(format!(
            "desktop bounds query failed after {} attempt(s){detail}; assuming scale 1.0",
            diagnostic.attempts
        ));
        return (1.0, warnings);
    };
    let Some(points_width) = parse_desktop_bounds_width(&raw) else {
        warnings.push(format!(
            "unexpected desktop bounds output '{raw}'; assuming scale 1.0"
        ));
        return (1.0, warnings);
    };

    let probe_path = screenshots_dir.join(".scale-probe.png");
    let grabbed = Command::new("screencapture")
        .arg("-x")
        .arg(&probe_path)
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    if !grabbed {
        warnings.push("probe capture failed; assuming scale 1.0".to_string());
        return (1.0, warnings);
    }
    let dimensions = image::image_dimensions(&probe_path);
    let _ = fs::remove_file(&probe_path);
    let Ok((pixel_width, _)) = dimensions else {
        warnings.push("probe capture unreadable; assuming scale 1.0".to_string());
        return (1.0, warnings);
    };

    let scale = f64::from(pixel_width) / points_width;
    if !(0.5..=4.0).contains(&scale) {
        warnings.push(format!("implausible display scale {scale:.2}; assuming 1.0"));
        return (1.0, warnings);
    }
    (scale, warnings)
}

fn parse_desktop_bounds_width(raw: &str) -> Option<f64> {
    let parts: Vec<f64> = raw
        .split(',')
        .filter_map(|part| part.trim().parse::<f64>().ok())
        .collect();
    if parts.len() != 4 {
        return None;
    }
    let width = parts[2] - parts[0];
    (width > 0.0).then_some(width)
}

fn run_osascript_bounded(
    script: &str,
    attempts: u32,
    delay_ms: u64,
) -> (Option<String>, ProbeDiagnostic) {
    let max_attempts = attempts.max(1);
    let timeout = Duration::from_millis(450);
    let mut last_message = Some("osascript returned empty output".to_string());

    for attempt in 1..=max_attempts {
        let mut cmd = Command::new("osascript");
        cmd.arg("-e").arg(script);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        match cmd.spawn() {
            Ok(mut child) => match child.wait_timeout(timeout) {
                Ok(Some(_)) => match child.wait_with_output() {
                    Ok(output) => {
                        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                        if output.status.success() && !stdout.is_empty() {
                            return (
                                Some(stdout),
                                ProbeDiagnostic {
                                    attempts: attempt,
                                    message: None,
                                },
                            );
                        }
                        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                        last_message = Some(if stderr.is_empty() {
                            format!("osascript exited with {}", output.status)
                        } else {
                            stderr
                        });
                    }
                    Err(err) => last_message = Some(err.to_string()),
                },
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_message =
                        Some(format!("osascript timed out after {}ms", timeout.as_millis()));
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_message = Some(err.to_string());
                }
            },
            Err(err) => last_message = Some(err.to_string()),
        }

        if attempt < max_attempts {
            let backoff = delay_ms.saturating_mul(u64::from(attempt));
            thread::sleep(Duration::from_millis(backoff.max(10)));
        }
    }

    (
        None,
        ProbeDiagnostic {
            attempts: max_attempts,
            message: last_message,
        },
    )
}

fn render_export(callouts: &[Callout]) -> String {
    let mut out = String::new();
    for callout in callouts {
        if callout.active {
            out.push_str(&format!(
                "{}\t{}\n",
                format_ms(callout.timestamp),
                callout.description
            ));
        }
    }
    out
}

fn clipboard_helper() -> Option<&'static str> {
    ["pbcopy", "wl-copy", "xclip"]
        .into_iter()
        .find(|name| command_exists(name))
}

/// Pipes `text` into the platform clipboard helper with a bounded wait.
/// Returns false when no helper exists so the caller can fall back to stdout.
fn copy_to_clipboard(text: &str) -> Result<bool> {
    let Some(helper) = clipboard_helper() else {
        return Ok(false);
    };
    let mut cmd = Command::new(helper);
    if helper == "xclip" {
        cmd.arg("-selection").arg("clipboard");
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn clipboard helper {helper}"))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(text.as_bytes())
            .with_context(|| format!("failed to write to clipboard helper {helper}"))?;
    }
    match child.wait_timeout(Duration::from_millis(CLIPBOARD_WAIT_MS))? {
        Some(status) if status.success() => Ok(true),
        Some(status) => bail!("clipboard helper {helper} exited with {status}"),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            bail!("clipboard helper {helper} timed out");
        }
    }
}

fn save_phase(path: &Path, callouts: &[Callout]) -> Result<()> {
    ensure_parent_dir(path)?;
    let raw = serde_json::to_string_pretty(callouts)?;
    fs::write(path, raw)
        .with_context(|| format!("failed to write phase file: {}", path.display()))?;
    Ok(())
}

/// Reads a phase file into a fresh list. All six record fields must be
/// present and well typed or the whole load fails; the caller swaps its
/// timeline only on success.
fn load_phase(path: &Path) -> Result<Vec<Callout>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read phase file: {}", path.display()))?;
    let callouts: Vec<Callout> = serde_json::from_str(&raw)
        .with_context(|| format!("malformed phase file: {}", path.display()))?;
    Ok(callouts)
}

fn phase_path(base_dir: &Path, name: &str) -> PathBuf {
    base_dir.join(format!("{}.json", sanitize_phase_name(name)))
}

fn resolve_phase_path(base_dir: &Path, phase: &str) -> PathBuf {
    let as_path = Path::new(phase);
    if phase.ends_with(".json")
        || as_path.is_absolute()
        || phase.contains(std::path::MAIN_SEPARATOR)
    {
        as_path.to_path_buf()
    } else {
        phase_path(base_dir, phase)
    }
}

fn sanitize_phase_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else if matches!(ch, ' ' | '/' | ':') {
            out.push('_');
        }
    }
    if out.is_empty() {
        DEFAULT_PHASE_NAME.to_string()
    } else {
        out
    }
}

fn base_dir(flag: Option<&Path>) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| {
            env::var("RAIDCALL_DIR")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(".raidcall"))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}

fn format_ms(ms: f64) -> String {
    format!("{:.2}", ms / 1000.0)
}

fn timestamp_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S%3f").to_string()
}

fn command_exists(name: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {name} >/dev/null 2>&1"))
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn draw_bitmap_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let scale_i = scale.max(1) as i32;
    let mut cursor_x = x;
    for ch in text.chars() {
        let glyph = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?'));
        let Some(glyph) = glyph else {
            cursor_x += 8 * scale_i;
            continue;
        };
        for (row_idx, row) in glyph.iter().enumerate() {
            let row_bits = *row;
            for col_idx in 0..8 {
                if (row_bits >> col_idx) & 1 == 0 {
                    continue;
                }
                let px = cursor_x + col_idx * scale_i;
                let py = y + row_idx as i32 * scale_i;
                for sy in 0..scale_i {
                    for sx in 0..scale_i {
                        let tx = px + sx;
                        let ty = py + sy;
                        if tx >= 0 && ty >= 0 && tx < img.width() as i32 && ty < img.height() as i32
                        {
                            let dst = *img.get_pixel(tx as u32, ty as u32);
                            img.put_pixel(tx as u32, ty as u32, blend_pixel(dst, color));
                        }
                    }
                }
            }
        }
        cursor_x += 8 * scale_i;
    }
}

fn text_bbox(x: i32, y: i32, text: &str, scale: u32) -> (i32, i32, i32, i32) {
    let scale_i = scale.max(1) as i32;
    let width_chars = text.chars().count() as i32;
    (x, y, x + width_chars * 8 * scale_i, y + 8 * scale_i)
}

fn fill_rect_alpha(img: &mut RgbaImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    let min_x = clamp_i32(x0.min(x1), 0, img.width() as i32 - 1);
    let max_x = clamp_i32(x0.max(x1), 0, img.width() as i32 - 1);
    let min_y = clamp_i32(y0.min(y1), 0, img.height() as i32 - 1);
    let max_y = clamp_i32(y0.max(y1), 0, img.height() as i32 - 1);
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let dst = *img.get_pixel(x as u32, y as u32);
            img.put_pixel(x as u32, y as u32, blend_pixel(dst, color));
        }
    }
}

fn clamp_i32(value: i32, min_value: i32, max_value: i32) -> i32 {
    value.max(min_value).min(max_value)
}

fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let src_a = f64::from(src[3]) / 255.0;
    if src_a <= 0.0 {
        return dst;
    }
    let dst_a = f64::from(dst[3]) / 255.0;
    let out_a = src_a + dst_a * (1.0 - src_a);
    if out_a <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }
    let mut out = [0u8; 4];
    for i in 0..3 {
        let src_c = f64::from(src[i]) / 255.0;
        let dst_c = f64::from(dst[i]) / 255.0;
        out[i] = (((src_c * src_a + dst_c * dst_a * (1.0 - src_a)) / out_a) * 255.0).round() as u8;
    }
    out[3] = (out_a * 255.0).round() as u8;
    Rgba(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn callout(timestamp: f64, description: &str, active: bool) -> Callout {
        Callout {
            timestamp,
            description: description.to_string(),
            active,
            notes: String::new(),
            screen_image_path: "shots/a_capture.png".to_string(),
            cast_image_path: "shots/a_cast_bar.png".to_string(),
        }
    }

    fn timeline_with(timestamps: &[f64]) -> Timeline {
        let mut timeline = Timeline::new();
        for (i, ts) in timestamps.iter().enumerate() {
            timeline.append(callout(*ts, &format!("call {i}"), true));
        }
        timeline
    }

    #[test]
    fn append_preserves_order_and_count() {
        let mut timeline = Timeline::new();
        let change = timeline.append(callout(3000.0, "late", true));
        assert_eq!(change, StoreChange::Inserted { first: 0, last: 0 });
        let change = timeline.append(callout(1000.0, "early", true));
        assert_eq!(change, StoreChange::Inserted { first: 1, last: 1 });

        assert_eq!(timeline.count(), 2);
        assert_eq!(timeline.get(0).unwrap().description, "late");
        assert_eq!(timeline.get(1).unwrap().description, "early");
    }

    #[test]
    fn clear_empties_and_append_restarts_at_zero() {
        let mut timeline = timeline_with(&[1000.0, 2000.0]);
        let removed = timeline.clear();
        assert_eq!(removed, Some(StoreChange::Removed { first: 0, last: 1 }));
        assert_eq!(timeline.count(), 0);
        assert_eq!(timeline.clear(), None);

        let change = timeline.append(callout(500.0, "first again", true));
        assert_eq!(change, StoreChange::Inserted { first: 0, last: 0 });
    }

    #[test]
    fn replace_all_reports_remove_and_insert_ranges() {
        let mut timeline = timeline_with(&[1000.0, 2000.0]);
        let changes = timeline.replace_all(vec![
            callout(100.0, "a", true),
            callout(200.0, "b", true),
            callout(300.0, "c", true),
        ]);
        assert_eq!(
            changes,
            vec![
                StoreChange::Removed { first: 0, last: 1 },
                StoreChange::Inserted { first: 0, last: 2 },
            ]
        );
        assert_eq!(timeline.count(), 3);

        let changes = timeline.replace_all(Vec::new());
        assert_eq!(changes, vec![StoreChange::Removed { first: 0, last: 2 }]);
        assert_eq!(timeline.count(), 0);
    }

    #[test]
    fn checked_edits_update_in_place() {
        let mut timeline = timeline_with(&[1000.0]);
        assert_eq!(
            timeline.set_notes(0, "dodge left".to_string()).unwrap(),
            StoreChange::Updated { row: 0 }
        );
        assert_eq!(timeline.get(0).unwrap().notes, "dodge left");

        timeline.set_timestamp(0, 2500.0).unwrap();
        assert_eq!(timeline.get(0).unwrap().timestamp, 2500.0);
        timeline.set_active(0, false).unwrap();
        assert!(!timeline.get(0).unwrap().active);
        timeline.set_description(0, "tank swap".to_string()).unwrap();
        assert_eq!(timeline.get(0).unwrap().description, "tank swap");
    }

    #[test]
    fn checked_edits_reject_bad_rows_and_values() {
        let mut timeline = timeline_with(&[1000.0]);
        assert!(timeline.set_notes(5, "nope".to_string()).is_err());
        assert!(timeline.set_timestamp(0, -1.0).is_err());
        assert_eq!(timeline.get(0).unwrap().timestamp, 1000.0);
    }

    #[test]
    fn phase_round_trip_preserves_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p2.json");
        let mut records = vec![
            callout(0.0, "Pull", true),
            callout(65250.0, "Add spawn", false),
        ];
        records[1].notes = "ignore the adds".to_string();

        save_phase(&path, &records).unwrap();
        let loaded = load_phase(&path).unwrap();
        assert_eq!(loaded, records);
    }

    #[test]
    fn load_rejects_missing_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(
            &path,
            r#"[{"timestamp": 1000, "description": "Pull", "active": true}]"#,
        )
        .unwrap();
        let err = load_phase(&path).unwrap_err();
        assert!(err.to_string().contains("malformed phase file"));
    }

    #[test]
    fn load_rejects_mistyped_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mistyped.json");
        fs::write(
            &path,
            r#"[{"timestamp": "soon", "description": "Pull", "active": true,
                "notes": "", "screen_image_path": "a", "cast_image_path": "b"}]"#,
        )
        .unwrap();
        assert!(load_phase(&path).is_err());
    }

    #[test]
    fn playback_row_tracks_elapsed() {
        let timeline = timeline_with(&[1000.0, 2000.0, 3000.0]);
        let mut timer = PlaybackTimer::new();
        assert_eq!(timer.set_elapsed_ms(2500.0, &timeline), 2);
        assert_eq!(timer.set_elapsed_ms(3500.0, &timeline), 3);
        assert_eq!(timer.set_elapsed_ms(0.0, &timeline), 0);
    }

    #[test]
    fn playback_row_counts_equal_timestamp_as_reached() {
        let timeline = timeline_with(&[1000.0, 2000.0, 3000.0]);
        let mut timer = PlaybackTimer::new();
        assert_eq!(timer.set_elapsed_ms(2000.0, &timeline), 2);
    }

    #[test]
    fn tick_accumulates_wall_clock_and_advances() {
        let timeline = timeline_with(&[1000.0, 2000.0, 3000.0]);
        let mut timer = PlaybackTimer::new();
        let t0 = Instant::now();
        timer.start(t0).unwrap();

        assert_eq!(timer.tick(t0 + Duration::from_millis(500), &timeline), None);
        assert_eq!(timer.elapsed_ms, 500.0);
        assert_eq!(
            timer.tick(t0 + Duration::from_millis(1500), &timeline),
            Some(1)
        );
        assert_eq!(
            timer.tick(t0 + Duration::from_millis(3600), &timeline),
            Some(3)
        );
        assert_eq!(timer.playback_row, 3);
    }

    #[test]
    fn pause_freezes_elapsed_until_resume() {
        let timeline = Timeline::new();
        let mut timer = PlaybackTimer::new();
        let t0 = Instant::now();
        timer.start(t0).unwrap();
        timer.tick(t0 + Duration::from_millis(1000), &timeline);
        timer.pause().unwrap();

        assert_eq!(timer.tick(t0 + Duration::from_millis(5000), &timeline), None);
        assert_eq!(timer.elapsed_ms, 1000.0);

        timer.resume(t0 + Duration::from_millis(5000)).unwrap();
        timer.tick(t0 + Duration::from_millis(6000), &timeline);
        assert_eq!(timer.elapsed_ms, 2000.0);
    }

    #[test]
    fn full_cycle_ends_stopped_and_zeroed() {
        let timeline = timeline_with(&[1000.0]);
        let mut timer = PlaybackTimer::new();
        let t0 = Instant::now();
        timer.start(t0).unwrap();
        timer.tick(t0 + Duration::from_millis(4000), &timeline);
        timer.pause().unwrap();
        timer.resume(t0 + Duration::from_millis(4500)).unwrap();
        timer.tick(t0 + Duration::from_millis(5000), &timeline);
        timer.reset();

        assert_eq!(timer.state, TimerState::Stopped);
        assert_eq!(timer.elapsed_ms, 0.0);
        assert_eq!(timer.playback_row, 0);
    }

    #[test]
    fn set_elapsed_clamps_negative() {
        let timeline = timeline_with(&[1000.0]);
        let mut timer = PlaybackTimer::new();
        timer.set_elapsed_ms(500.0, &timeline);
        assert_eq!(timer.set_elapsed_ms(-1500.0, &timeline), 0);
        assert_eq!(timer.elapsed_ms, 0.0);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut timer = PlaybackTimer::new();
        assert!(timer.pause().is_err());
        assert!(timer.resume(Instant::now()).is_err());
        timer.start(Instant::now()).unwrap();
        assert!(timer.start(Instant::now()).is_err());
        assert!(timer.resume(Instant::now()).is_err());
    }

    #[test]
    fn selection_normalizes_and_scales() {
        let mut selector = RegionSelector::default();
        selector.start(RegionKind::Capture);
        selector.press(100.0, 100.0);
        let (kind, region) = selector.release(50.0, 40.0, 1.0).unwrap();
        assert_eq!(kind, RegionKind::Capture);
        assert_eq!(
            region,
            Region {
                x1: 50,
                y1: 40,
                x2: 100,
                y2: 100
            }
        );

        selector.start(RegionKind::CastBar);
        selector.press(100.0, 100.0);
        let (_, region) = selector.release(50.0, 40.0, 2.0).unwrap();
        assert_eq!(
            region,
            Region {
                x1: 100,
                y1: 80,
                x2: 200,
                y2: 200
            }
        );
    }

    #[test]
    fn selection_resets_between_invocations() {
        let mut selector = RegionSelector::default();
        selector.start(RegionKind::Capture);
        selector.press(10.0, 10.0);
        selector.drag(30.0, 25.0);
        selector.release(30.0, 25.0, 1.0).unwrap();

        assert!(selector.release(99.0, 99.0, 1.0).is_err());
    }

    #[test]
    fn export_formats_active_rows_only() {
        let callouts = vec![
            callout(0.0, "Pull", true),
            callout(30000.0, "skipped", false),
            callout(65250.0, "Add spawn", true),
        ];
        assert_eq!(render_export(&callouts), "0.00\tPull\n65.25\tAdd spawn\n");
        assert_eq!(render_export(&[]), "");
    }

    #[test]
    fn format_ms_renders_seconds_with_two_decimals() {
        assert_eq!(format_ms(0.0), "0.00");
        assert_eq!(format_ms(12500.0), "12.50");
        assert_eq!(format_ms(65250.0), "65.25");
    }

    #[test]
    fn capture_artifact_paths_use_id_suffixes() {
        let (screen, cast) = capture_artifact_paths(Path::new("shots"), "abc-1-2");
        assert_eq!(screen, Path::new("shots/abc-1-2_capture.png"));
        assert_eq!(cast, Path::new("shots/abc-1-2_cast_bar.png"));
    }

    #[test]
    fn placeholder_matches_region_dimensions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("shot.png");
        let region = Region {
            x1: 10,
            y1: 20,
            x2: 110,
            y2: 60,
        };
        write_placeholder_region(&region, &path).unwrap();
        assert_eq!(image::image_dimensions(&path).unwrap(), (100, 40));
    }

    #[test]
    fn sanitize_phase_name_keeps_safe_chars() {
        assert_eq!(sanitize_phase_name("p2: adds/west"), "p2__adds_west");
        assert_eq!(sanitize_phase_name("new phase"), "new_phase");
        assert_eq!(sanitize_phase_name("!!"), "untitled");
    }

    #[test]
    fn resolve_phase_path_handles_names_and_paths() {
        let base = Path::new(".raidcall");
        assert_eq!(
            resolve_phase_path(base, "p2 adds"),
            Path::new(".raidcall/p2_adds.json")
        );
        assert_eq!(
            resolve_phase_path(base, "elsewhere/p2.json"),
            Path::new("elsewhere/p2.json")
        );
    }

    #[test]
    fn parse_command_covers_session_surface() {
        assert_eq!(parse_command("start").unwrap(), SessionCommand::Start);
        assert_eq!(
            parse_command("call").unwrap(),
            SessionCommand::Call { description: None }
        );
        assert_eq!(
            parse_command("call tank swap").unwrap(),
            SessionCommand::Call {
                description: Some("tank swap".to_string())
            }
        );
        assert_eq!(
            parse_command("+1s").unwrap(),
            SessionCommand::Nudge { delta_ms: 1000.0 }
        );
        assert_eq!(
            parse_command("-1s").unwrap(),
            SessionCommand::Nudge { delta_ms: -1000.0 }
        );
        assert_eq!(
            parse_command("goto 3").unwrap(),
            SessionCommand::Goto { row: 3 }
        );
        assert_eq!(
            parse_command("region capture 10,20 300,200").unwrap(),
            SessionCommand::SelectRegion {
                kind: RegionKind::Capture,
                begin: (10.0, 20.0),
                end: (300.0, 200.0)
            }
        );
        assert_eq!(
            parse_command("edit 2 time 12.5").unwrap(),
            SessionCommand::Edit {
                row: 2,
                field: EditField::Time(12500.0)
            }
        );
        assert_eq!(
            parse_command("edit 0 active false").unwrap(),
            SessionCommand::Edit {
                row: 0,
                field: EditField::Active(false)
            }
        );
        assert_eq!(
            parse_command("open p2 adds").unwrap(),
            SessionCommand::Open {
                name: "p2 adds".to_string()
            }
        );
        assert_eq!(parse_command("quit").unwrap(), SessionCommand::Quit);

        assert!(parse_command("warp 9").is_err());
        assert!(parse_command("region capture 10,20").is_err());
        assert!(parse_command("edit one time 5").is_err());
        assert!(parse_command("goto").is_err());
    }

    #[test]
    fn parse_point_requires_two_coordinates() {
        assert_eq!(parse_point("100,100").unwrap(), (100.0, 100.0));
        assert_eq!(parse_point(" 3.5 , 7 ").unwrap(), (3.5, 7.0));
        assert!(parse_point("100").is_err());
        assert!(parse_point("a,b").is_err());
    }

    #[test]
    fn desktop_bounds_width_reads_corner_fields() {
        assert_eq!(parse_desktop_bounds_width("0, 0, 1512, 982"), Some(1512.0));
        assert_eq!(
            parse_desktop_bounds_width("100, 0, 1612, 982"),
            Some(1512.0)
        );
        assert_eq!(parse_desktop_bounds_width("0, 0, 1512"), None);
        assert_eq!(parse_desktop_bounds_width("garbage"), None);
    }

    #[test]
    fn stamp_label_bbox_spans_text() {
        let (x0, y0, x1, y1) = text_bbox(8, 8, "12.50s", 2);
        assert_eq!((x0, y0), (8, 8));
        assert_eq!(x1, 8 + 6 * 8 * 2);
        assert_eq!(y1, 8 + 8 * 2);
    }

    #[test]
    fn stamped_artifact_stays_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stamp.png");
        let region = Region {
            x1: 0,
            y1: 0,
            x2: 200,
            y2: 120,
        };
        write_placeholder_region(&region, &path).unwrap();
        stamp_elapsed_label(&path, "65.25s").unwrap();
        assert_eq!(image::image_dimensions(&path).unwrap(), (200, 120));
    }
}
