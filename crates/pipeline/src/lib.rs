//! The three-stage plotting pipeline.
//!
//! Commands come in through a [`Pipeline`] handle (stage A) and go into a
//! bounded queue. The planner stage (B) pops them, expands each one into
//! primitive moves and pushes those into a second bounded queue. The motor
//! stage (C) pops the moves and hands them to a [`MotionSink`]. A full queue
//! blocks its producer and an empty one blocks its consumer.
//!
//! Shutdown is a sentinel that travels down the queues behind any work that
//! was already submitted, so shutting down drains rather than discards.

use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt as _},
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
};
use vplot_geom::KinematicModel;
use vplot_planner::{MotionPlanner, PlannerConfig, PlotterState};
use vplot_protocol::{decode, DecodeError, MotionCommand, PrimitiveMove};

mod policy;
mod sink;

pub use policy::{RangeCheck, RangePolicy};
pub use sink::{
    HardwareConfig, HardwareSink, MotionSink, SimulatedSink, SinkError, TraceHandle, TracePoint,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("the pipeline has shut down")]
    Closed,

    #[error("motion sink failed to start")]
    SinkStart(#[source] SinkError),

    #[error("pipeline stage panicked")]
    Join(#[from] JoinError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Which kind of sink drives the motor stage. Resolved once, at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotorBackend {
    Hardware,
    #[default]
    Simulated,
}

impl FromStr for MotorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "hardware" => Ok(MotorBackend::Hardware),
            "simulated" => Ok(MotorBackend::Simulated),
            _ => Err(format!(
                "unknown backend '{s}', expected 'hardware' or 'simulated'"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Idle,
    Running,
    Draining,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineConfig {
    pub command_queue_capacity: usize,
    pub move_queue_capacity: usize,
    /// Log progress after this many commands (never, if zero).
    pub progress_interval: usize,
    pub planner: PlannerConfig,
    pub range_check: Option<RangeCheck>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            command_queue_capacity: 1000,
            move_queue_capacity: 100,
            progress_interval: 1000,
            planner: PlannerConfig::default(),
            range_check: None,
        }
    }
}

/// What happened over a pipeline's lifetime.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Status {
    pub plotter: PlotterState,
    pub commands: usize,
    pub skipped_lines: usize,
    pub rejected_targets: usize,
    pub moves: usize,
    pub move_faults: usize,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.plotter)?;
        writeln!(f, "Commands:         {}", self.commands)?;
        writeln!(f, "Skipped lines:    {}", self.skipped_lines)?;
        writeln!(f, "Rejected targets: {}", self.rejected_targets)?;
        writeln!(f, "Moves:            {}", self.moves)?;
        write!(f, "Move faults:      {}", self.move_faults)
    }
}

enum Ingest {
    Command(MotionCommand),
    Line(String),
    Shutdown,
}

enum Execute {
    Move(PrimitiveMove),
    Shutdown,
}

#[derive(Default)]
struct PlannerReport {
    commands: usize,
    skipped_lines: usize,
    rejected_targets: usize,
}

#[derive(Default)]
struct MotorReport {
    moves: usize,
    faults: usize,
}

pub struct Pipeline<S> {
    commands: mpsc::Sender<Ingest>,
    command_capacity: usize,
    // Lines that `feed` couldn't decode.
    skipped_lines: AtomicUsize,
    plotter: watch::Receiver<PlotterState>,
    planner_stage: watch::Receiver<StageState>,
    motor_stage: watch::Receiver<StageState>,
    planner: JoinHandle<Result<(PlannerReport, PlotterState), PipelineError>>,
    motors: JoinHandle<Result<(S, MotorReport), PipelineError>>,
}

impl<S: MotionSink> Pipeline<S> {
    /// Starts the planner and motor stages. Must be called from within a
    /// tokio runtime.
    pub fn start<M: KinematicModel>(model: M, sink: S, config: PipelineConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_capacity.max(1));
        let (move_tx, move_rx) = mpsc::channel(config.move_queue_capacity.max(1));

        let planner = MotionPlanner::new(model, config.planner);
        let (plotter_tx, plotter_rx) = watch::channel(*planner.state());
        let (planner_stage_tx, planner_stage_rx) = watch::channel(StageState::Idle);
        let (motor_stage_tx, motor_stage_rx) = watch::channel(StageState::Idle);

        let planner_stage = PlannerStage {
            planner,
            commands: cmd_rx,
            moves: move_tx,
            plotter: plotter_tx,
            stage: planner_stage_tx,
            range_check: config.range_check,
            progress_interval: config.progress_interval,
        };
        let planner = tokio::task::spawn_blocking(move || planner_stage.run());
        let motors = tokio::task::spawn_blocking(move || run_motors(sink, move_rx, motor_stage_tx));

        Pipeline {
            commands: cmd_tx,
            command_capacity: config.command_queue_capacity.max(1),
            skipped_lines: AtomicUsize::new(0),
            plotter: plotter_rx,
            planner_stage: planner_stage_rx,
            motor_stage: motor_stage_rx,
            planner,
            motors,
        }
    }

    async fn push(&self, msg: Ingest) -> Result<(), PipelineError> {
        self.commands
            .send(msg)
            .await
            .map_err(|_| PipelineError::Closed)
    }

    /// Queues a decoded command, waiting while the command queue is full.
    pub async fn submit(&self, cmd: MotionCommand) -> Result<(), PipelineError> {
        self.push(Ingest::Command(cmd)).await
    }

    /// Queues a raw protocol line, to be decoded by the planner stage.
    pub async fn submit_line(&self, line: impl Into<String>) -> Result<(), PipelineError> {
        self.push(Ingest::Line(line.into())).await
    }

    /// Decodes every line of `reader` and queues the commands. Lines that
    /// don't decode are skipped with a warning, and counted in the final
    /// [`Status`].
    ///
    /// Returns the number of commands queued.
    pub async fn feed<R: AsyncBufRead + Unpin>(&self, reader: R) -> Result<usize, PipelineError> {
        let mut lines = reader.lines();
        let mut line_no = 0;
        let mut count = 0;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            match decode(&line) {
                Ok(cmd) => {
                    self.submit(cmd).await?;
                    count += 1;
                }
                Err(DecodeError::Empty) => {}
                Err(e) => {
                    log::warn!("skipping line {line_no}: {e}");
                    self.skipped_lines.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(count)
    }

    /// The plotter state as of the last command the planner finished.
    pub fn plotter_state(&self) -> PlotterState {
        *self.plotter.borrow()
    }

    /// A receiver that sees every new plotter state.
    pub fn subscribe(&self) -> watch::Receiver<PlotterState> {
        self.plotter.clone()
    }

    /// The states of the planner and motor stages.
    pub fn stage_states(&self) -> (StageState, StageState) {
        (*self.planner_stage.borrow(), *self.motor_stage.borrow())
    }

    /// Watches for the planner and motor stage states, which stay readable
    /// after shutdown.
    pub fn stage_watches(&self) -> (watch::Receiver<StageState>, watch::Receiver<StageState>) {
        (self.planner_stage.clone(), self.motor_stage.clone())
    }

    /// How many commands are waiting for the planner.
    pub fn queued_commands(&self) -> usize {
        self.command_capacity - self.commands.capacity()
    }

    /// Sends the shutdown sentinel and waits for both stages to drain and stop.
    ///
    /// Returns the sink, so that a simulated trace can be read back, along
    /// with the final status.
    pub async fn shutdown(self) -> Result<(S, Status), PipelineError> {
        // If the planner is already gone, joining it tells us why.
        let _ = self.commands.send(Ingest::Shutdown).await;
        drop(self.commands);

        let planner = self.planner.await;
        let motors = self.motors.await;

        let (sink, motor_report) = motors??;
        let (planner_report, plotter) = planner??;

        let status = Status {
            plotter,
            commands: planner_report.commands,
            skipped_lines: planner_report.skipped_lines + self.skipped_lines.into_inner(),
            rejected_targets: planner_report.rejected_targets,
            moves: motor_report.moves,
            move_faults: motor_report.faults,
        };
        log::info!("pipeline stopped\n{status}");
        Ok((sink, status))
    }
}

struct PlannerStage<M> {
    planner: MotionPlanner<M>,
    commands: mpsc::Receiver<Ingest>,
    moves: mpsc::Sender<Execute>,
    plotter: watch::Sender<PlotterState>,
    stage: watch::Sender<StageState>,
    range_check: Option<RangeCheck>,
    progress_interval: usize,
}

impl<M: KinematicModel> PlannerStage<M> {
    fn run(mut self) -> Result<(PlannerReport, PlotterState), PipelineError> {
        self.stage.send_replace(StageState::Running);
        log::info!("planner stage started");
        let ret = self.process();
        self.stage.send_replace(StageState::Stopped);
        log::info!("planner stage stopped");
        ret.map(|report| (report, *self.planner.state()))
    }

    fn process(&mut self) -> Result<PlannerReport, PipelineError> {
        let mut report = PlannerReport::default();
        let start = Instant::now();

        // Running out of senders without a sentinel means the handle was
        // dropped; that drains the same way.
        while let Some(msg) = self.commands.blocking_recv() {
            let cmd = match msg {
                Ingest::Command(cmd) => cmd,
                Ingest::Line(line) => match decode(&line) {
                    Ok(cmd) => cmd,
                    Err(DecodeError::Empty) => continue,
                    Err(e) => {
                        log::warn!("skipping '{line}': {e}");
                        report.skipped_lines += 1;
                        continue;
                    }
                },
                Ingest::Shutdown => break,
            };

            let cmd = match &self.range_check {
                Some(check) => match check.apply(cmd, self.planner.state().current_position) {
                    Some(cmd) => cmd,
                    None => {
                        report.rejected_targets += 1;
                        continue;
                    }
                },
                None => cmd,
            };

            log::trace!("planning {cmd}");
            let moves = &self.moves;
            self.planner.execute(&cmd, &mut |mv| {
                moves
                    .blocking_send(Execute::Move(mv))
                    .map_err(|_| PipelineError::Closed)
            })?;
            self.plotter.send_replace(*self.planner.state());

            report.commands += 1;
            if self.progress_interval > 0 && report.commands % self.progress_interval == 0 {
                let ms = start.elapsed().as_secs_f64() * 1000.0 / report.commands as f64;
                log::info!(
                    "processed {} commands, {ms:.3} ms per command",
                    report.commands
                );
            }
        }

        self.stage.send_replace(StageState::Draining);
        self.moves
            .blocking_send(Execute::Shutdown)
            .map_err(|_| PipelineError::Closed)?;
        Ok(report)
    }
}

// Calls `finish` on the sink when dropped, so the hardware is released even if
// the motor stage unwinds.
struct FinishGuard<'a, S: MotionSink>(&'a mut S);

impl<S: MotionSink> Drop for FinishGuard<'_, S> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

fn run_motors<S: MotionSink>(
    mut sink: S,
    mut moves: mpsc::Receiver<Execute>,
    stage: watch::Sender<StageState>,
) -> Result<(S, MotorReport), PipelineError> {
    let mut report = MotorReport::default();
    {
        let mut guard = FinishGuard(&mut sink);
        if let Err(e) = guard.0.start() {
            log::error!("failed to start the motors: {e}");
            drop(guard);
            stage.send_replace(StageState::Stopped);
            return Err(PipelineError::SinkStart(e));
        }
        stage.send_replace(StageState::Running);
        log::info!("motor stage started");

        while let Some(msg) = moves.blocking_recv() {
            match msg {
                Execute::Move(mv) => match guard.0.apply(&mv) {
                    Ok(()) => report.moves += 1,
                    Err(e) => {
                        // The pen may already have moved, so there's nothing
                        // to roll back.
                        log::error!("failed to execute {mv:?}: {e}");
                        report.faults += 1;
                    }
                },
                Execute::Shutdown => {
                    stage.send_replace(StageState::Draining);
                    break;
                }
            }
        }
    }
    stage.send_replace(StageState::Stopped);
    log::info!("motor stage stopped");
    Ok((sink, report))
}
