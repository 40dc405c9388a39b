//! Measurement session
//!
//! Drives one full experiment against a freshly started dev server:
//!
//! 1. launch the server (optionally with a trace collector listening)
//! 2. time the first (cold) and second page loads, plus any extra loads
//! 3. open the change-notification stream
//! 4. for every dimension and iteration, apply a change and time the
//!    `building` and `built` notifications
//! 5. stop the server
//!
//! Any failure aborts the session; there are no partial results. The
//! server is interrupted and awaited on every exit path once it started.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use devprof_core::{
    Clock, ElapsedTimer, Measure, MonotonicClock, PageLoadSample, ProcessController,
    ProfileError, ProfileResult, Sample,
};
use devprof_http::{ConnectRetrier, EventMultiplexer, HttpProbe, Subscription, TraceCollector};
use tracing::{debug, info, warn};

use crate::config::{SessionConfig, SessionMode};
use crate::mutation::{ChangeTrigger, NonceMutator};
use crate::report::SessionReport;

/// Discriminator announcing that a rebuild started
pub const BUILDING: &str = "building";
/// Discriminator announcing that a rebuild finished
pub const BUILT: &str = "built";

/// Progress of one rebuild cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    AwaitingNotify,
    AwaitingComplete {
        notify_micros: u64,
    },
    Done {
        notify_micros: u64,
        complete_micros: u64,
    },
}

/// Per-iteration state machine: `AwaitingNotify -> AwaitingComplete -> Done`.
///
/// `built` is only accepted after `building`, and both readings come from
/// the same start point, so complete can never precede notify.
#[derive(Debug)]
pub struct RebuildCycle<C: Clock = MonotonicClock> {
    timer: ElapsedTimer<C>,
    started: Option<Measure<C>>,
    phase: CyclePhase,
}

impl<C: Clock + Clone> RebuildCycle<C> {
    /// Start timing now. Used when the session applies the change itself.
    pub fn started(timer: &ElapsedTimer<C>) -> Self {
        Self {
            timer: timer.clone(),
            started: Some(timer.start()),
            phase: CyclePhase::AwaitingNotify,
        }
    }

    /// Start timing at the `building` notification, recording notify as zero.
    /// Used when the operator applies changes by hand.
    pub fn on_notify(timer: &ElapsedTimer<C>) -> Self {
        Self {
            timer: timer.clone(),
            started: None,
            phase: CyclePhase::AwaitingNotify,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Feed the discriminator of the next structured event.
    pub fn observe(&mut self, action: Option<&str>) -> CyclePhase {
        self.phase = match (self.phase, action) {
            (CyclePhase::AwaitingNotify, Some(BUILDING)) => {
                let notify_micros = match &self.started {
                    Some(measure) => measure.elapsed_micros(),
                    None => {
                        self.started = Some(self.timer.start());
                        0
                    }
                };
                CyclePhase::AwaitingComplete { notify_micros }
            }
            (CyclePhase::AwaitingComplete { notify_micros }, Some(BUILT)) => {
                let complete_micros = self
                    .started
                    .as_ref()
                    .map_or(notify_micros, Measure::elapsed_micros);
                CyclePhase::Done {
                    notify_micros,
                    complete_micros,
                }
            }
            (phase, _) => phase,
        };
        self.phase
    }
}

/// Outcome of one page request
struct PageLoad {
    elapsed_micros: u64,
    response_length: usize,
    retries: u32,
}

/// One experiment against one dev server process
pub struct MeasurementSession<T = NonceMutator> {
    config: SessionConfig,
    trigger: T,
    timer: ElapsedTimer,
}

impl MeasurementSession<NonceMutator> {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_trigger(config, NonceMutator::new())
    }
}

impl<T: ChangeTrigger> MeasurementSession<T> {
    pub fn with_trigger(config: SessionConfig, trigger: T) -> Self {
        Self {
            config,
            trigger,
            timer: ElapsedTimer::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run the whole experiment.
    pub async fn run(&self) -> ProfileResult<SessionReport> {
        let collector = if self.config.capture_trace {
            Some(TraceCollector::start(&self.config.collector_addr).await?)
        } else {
            None
        };

        info!(command = %self.config.command, "Starting dev server");
        let process = ProcessController::start(&self.config.launch_spec())?;

        let measured = self.measure(&process).await;

        let traces = match collector {
            Some(collector) => Some(collector.finish().await),
            None => None,
        };

        info!(command = %self.config.command, "Terminating dev server");
        let exit = process.stop().await;

        let mut report = measured?;
        report.traces = traces.transpose()?;
        let exit = exit?;
        debug!(code = ?exit.code, signal = ?exit.signal, "Dev server stopped");

        Ok(report)
    }

    async fn measure(&self, process: &ProcessController) -> ProfileResult<SessionReport> {
        info!(url = %self.config.page_url(), "Measuring first page load");
        let first = self.load_page(process).await?;
        tokio::time::sleep(self.config.pause).await;

        info!("Measuring second page load");
        let second = self.load_page(process).await?;
        tokio::time::sleep(self.config.pause).await;

        let mut page_loads = Vec::with_capacity(self.config.page_load_iterations as usize);
        for iteration in 1..=self.config.page_load_iterations {
            let load = self.load_page(process).await?;
            debug!(iteration, elapsed_micros = load.elapsed_micros, "Page load measured");
            page_loads.push(PageLoadSample {
                iteration,
                elapsed_micros: load.elapsed_micros,
                response_length: load.response_length,
                retries: load.retries,
            });
            tokio::time::sleep(self.config.pause).await;
        }

        let events = EventMultiplexer::open(&self.config.event_url()).await?;
        info!(
            cycles = self.config.mode.total_cycles(),
            "Measuring rebuild cycles"
        );
        let samples = match &self.config.mode {
            SessionMode::Auto {
                targets,
                iterations,
            } => self.measure_auto(&events, targets, *iterations).await?,
            SessionMode::Manual { iterations } => self.measure_manual(&events, *iterations).await?,
        };
        events.close();

        Ok(SessionReport {
            generated_at: Utc::now(),
            page: self.config.page.clone(),
            first_page_load_micros: first.elapsed_micros,
            second_page_load_micros: second.elapsed_micros,
            page_loads,
            samples,
            traces: None,
        })
    }

    /// Request the page until the server answers and drain the body.
    async fn load_page(&self, process: &ProcessController) -> ProfileResult<PageLoad> {
        let url = self.config.page_url();
        let probe = HttpProbe::get(&url);
        let retrier = ConnectRetrier::with_deadline(self.config.startup_timeout);

        let measure = self.timer.start();
        let connected = tokio::select! {
            connected = retrier.connect(&probe) => connected?,
            exit = process.await_exit() => {
                return Err(ProfileError::ProcessExited {
                    command: process.command().to_string(),
                    code: exit?.code,
                });
            }
        };
        let body = connected
            .response
            .bytes()
            .await
            .map_err(|e| ProfileError::page_load(&url, e.to_string()))?;
        let elapsed_micros = measure.elapsed_micros();

        Ok(PageLoad {
            elapsed_micros,
            response_length: body.len(),
            retries: connected.retries,
        })
    }

    async fn measure_auto(
        &self,
        events: &EventMultiplexer,
        targets: &[PathBuf],
        iterations: u32,
    ) -> ProfileResult<Vec<Sample>> {
        let mut samples = Vec::with_capacity(targets.len() * iterations as usize);

        for (dimension, target) in (0u32..).zip(targets) {
            info!(dimension, file = %target.display(), iterations, "Measuring rebuilds");

            for iteration in 1..=iterations {
                let sample = self.auto_cycle(events, target, dimension, iteration).await?;
                samples.push(sample);
            }
        }

        Ok(samples)
    }

    async fn auto_cycle(
        &self,
        events: &EventMultiplexer,
        target: &Path,
        dimension: u32,
        iteration: u32,
    ) -> ProfileResult<Sample> {
        let commit = self.trigger.prepare(target).await?;

        let mut subscription = events.subscribe_all();
        let mut cycle = RebuildCycle::started(&self.timer);
        commit.await?;

        let (notify, complete) = self.finish_cycle(&mut subscription, &mut cycle).await?;
        debug!(
            dimension,
            iteration,
            notify_micros = notify,
            complete_micros = complete,
            "Rebuild measured"
        );

        Ok(Sample {
            iteration,
            dimension: Some(dimension),
            changed_file: Some(target.to_path_buf()),
            notify_elapsed_micros: notify,
            complete_elapsed_micros: complete,
        })
    }

    async fn measure_manual(
        &self,
        events: &EventMultiplexer,
        iterations: u32,
    ) -> ProfileResult<Vec<Sample>> {
        info!(
            iterations,
            "The profiler is ready to capture rebuild timings. Edit files used by the page \
             and wait for each build to complete before making the next change."
        );

        let mut samples = Vec::with_capacity(iterations as usize);
        for iteration in 1..=iterations {
            let mut subscription = events.subscribe_all();
            let mut cycle = RebuildCycle::on_notify(&self.timer);

            let (notify, complete) = self.finish_cycle(&mut subscription, &mut cycle).await?;
            debug!(iteration, complete_micros = complete, "Rebuild measured");

            samples.push(Sample {
                iteration,
                dimension: None,
                changed_file: None,
                notify_elapsed_micros: notify,
                complete_elapsed_micros: complete,
            });
        }

        Ok(samples)
    }

    /// Feed events into `cycle` until it is done.
    async fn finish_cycle<C: Clock + Clone>(
        &self,
        events: &mut Subscription,
        cycle: &mut RebuildCycle<C>,
    ) -> ProfileResult<(u64, u64)> {
        let wait = async {
            loop {
                let (action, _) = events.next_structured().await?;
                if let CyclePhase::Done {
                    notify_micros,
                    complete_micros,
                } = cycle.observe(action.as_deref())
                {
                    return Ok::<_, ProfileError>((notify_micros, complete_micros));
                }
            }
        };
        bounded(self.config.event_timeout, "rebuild to finish", wait).await
    }
}

/// Apply an optional deadline to `fut`.
async fn bounded<T, F>(limit: Option<Duration>, operation: &str, fut: F) -> ProfileResult<T>
where
    F: Future<Output = ProfileResult<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            warn!(operation, timeout_ms = limit.as_millis() as u64, "Deadline elapsed");
            Err(ProfileError::timeout(operation, limit))
        }),
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devprof_core::ManualClock;

    fn manual_timer() -> (ManualClock, ElapsedTimer<ManualClock>) {
        let clock = ManualClock::new();
        (clock.clone(), ElapsedTimer::with_clock(clock))
    }

    #[test]
    fn cycle_records_notify_then_complete() {
        let (clock, timer) = manual_timer();
        let mut cycle = RebuildCycle::started(&timer);

        clock.advance(Duration::from_micros(1500));
        assert_eq!(
            cycle.observe(Some(BUILDING)),
            CyclePhase::AwaitingComplete {
                notify_micros: 1500
            }
        );

        clock.advance(Duration::from_micros(2500));
        assert_eq!(
            cycle.observe(Some(BUILT)),
            CyclePhase::Done {
                notify_micros: 1500,
                complete_micros: 4000
            }
        );
    }

    #[test]
    fn built_before_building_is_ignored() {
        let (clock, timer) = manual_timer();
        let mut cycle = RebuildCycle::started(&timer);

        clock.advance(Duration::from_micros(10));
        assert_eq!(cycle.observe(Some(BUILT)), CyclePhase::AwaitingNotify);
        assert_eq!(cycle.observe(None), CyclePhase::AwaitingNotify);
        assert_eq!(cycle.observe(Some("sync")), CyclePhase::AwaitingNotify);

        clock.advance(Duration::from_micros(20));
        assert_eq!(
            cycle.observe(Some(BUILDING)),
            CyclePhase::AwaitingComplete { notify_micros: 30 }
        );
        // A second `building` does not move the notify reading.
        clock.advance(Duration::from_micros(5));
        assert_eq!(
            cycle.observe(Some(BUILDING)),
            CyclePhase::AwaitingComplete { notify_micros: 30 }
        );
    }

    #[test]
    fn done_is_terminal() {
        let (clock, timer) = manual_timer();
        let mut cycle = RebuildCycle::started(&timer);
        cycle.observe(Some(BUILDING));
        let done = cycle.observe(Some(BUILT));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cycle.observe(Some(BUILDING)), done);
        assert_eq!(cycle.observe(Some(BUILT)), done);
        assert_eq!(cycle.phase(), done);
    }

    #[test]
    fn operator_cycle_times_from_notify() {
        let (clock, timer) = manual_timer();
        let mut cycle = RebuildCycle::on_notify(&timer);

        clock.advance(Duration::from_secs(3));
        assert_eq!(
            cycle.observe(Some(BUILDING)),
            CyclePhase::AwaitingComplete { notify_micros: 0 }
        );

        clock.advance(Duration::from_micros(700));
        assert_eq!(
            cycle.observe(Some(BUILT)),
            CyclePhase::Done {
                notify_micros: 0,
                complete_micros: 700
            }
        );
    }

    #[tokio::test]
    async fn bounded_without_limit_waits() {
        let value = bounded(None, "op", async { Ok::<_, ProfileError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn bounded_reports_timeout() {
        let err = bounded(
            Some(Duration::from_millis(20)),
            "rebuild to finish",
            std::future::pending::<ProfileResult<()>>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProfileError::Timeout { .. }));
    }
}
