//! Multi-cadence dispatch of pipeline stages.
//!
//! Four [`TaskChain`]s count down independent deadlines in milliseconds. On
//! every scheduler tick [`ChainManager::run_thread`] fires the chains whose
//! deadline ran out and calls their handlers through a typed registry.

pub mod scheduler;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::export::health::HealthMetrics;
use crate::meta::{GlobalMeta, GlobalMetaGetter};

/// Scheduler tick, in milliseconds.
pub const TICK_MS: i64 = 10;

pub const SWITCH_GEAR_PERIOD_MS: i64 = 10;
pub const PREPROCESS_PERIOD_MS: i64 = 100;
pub const CLI_PERIOD_MS: i64 = 100;

/// Pipeline stage reachable from the chain manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandlerKind {
    Input,
    Policy,
    Collection,
    Output,
    Process,
    Stream,
    SwitchGear,
    Preprocess,
    Detect,
}

impl HandlerKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Policy => "policy",
            Self::Collection => "collection",
            Self::Output => "output",
            Self::Process => "process",
            Self::Stream => "stream",
            Self::SwitchGear => "switch_gear",
            Self::Preprocess => "preprocess",
            Self::Detect => "detect",
        }
    }
}

/// One pipeline stage. `option` is stage specific.
pub trait ChainHandler: Send {
    fn handle_request(&mut self, option: u32);
}

impl<F: FnMut(u32) + Send> ChainHandler for F {
    fn handle_request(&mut self, option: u32) {
        self(option)
    }
}

/// A periodic task and the stages it runs.
#[derive(Debug, Clone)]
pub struct TaskChain {
    name: &'static str,
    period_ms: i64,
    deadline_ms: i64,
    handlers: Vec<HandlerKind>,
}

impl TaskChain {
    pub fn new(name: &'static str, period_ms: i64, handlers: Vec<HandlerKind>) -> Self {
        Self {
            name,
            period_ms,
            deadline_ms: period_ms,
            handlers,
        }
    }

    /// Counts `delayed + 1` ticks off the deadline. Fires and rearms with
    /// the current period once the deadline is used up.
    pub fn is_run(&mut self, delayed: u32) -> bool {
        self.deadline_ms -= TICK_MS * (i64::from(delayed) + 1);
        if self.deadline_ms <= 0 {
            self.deadline_ms = self.period_ms;
            return true;
        }
        false
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn period_ms(&self) -> i64 {
        self.period_ms
    }

    pub fn deadline_ms(&self) -> i64 {
        self.deadline_ms
    }

    pub fn set_period_ms(&mut self, period_ms: i64) {
        self.period_ms = period_ms;
    }

    pub fn set_deadline_ms(&mut self, deadline_ms: i64) {
        self.deadline_ms = deadline_ms;
    }

    pub fn handlers(&self) -> &[HandlerKind] {
        &self.handlers
    }
}

/// Chains that fired on one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fired {
    pub switch_gear: bool,
    pub preprocess: bool,
    pub cli: bool,
    pub analysis: bool,
}

pub struct ChainManager {
    switch_gear: TaskChain,
    preprocess: TaskChain,
    cli: TaskChain,
    analysis: TaskChain,
    handlers: BTreeMap<HandlerKind, Box<dyn ChainHandler>>,
    global: Arc<GlobalMeta>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl ChainManager {
    pub fn new(global: Arc<GlobalMeta>, metrics: Option<Arc<HealthMetrics>>) -> Self {
        let analysis_ms = analysis_period_ms(global.streaming_interval());
        Self {
            switch_gear: TaskChain::new(
                "switch_gear",
                SWITCH_GEAR_PERIOD_MS,
                vec![HandlerKind::SwitchGear],
            ),
            preprocess: TaskChain::new(
                "preprocess",
                PREPROCESS_PERIOD_MS,
                vec![HandlerKind::Preprocess],
            ),
            cli: TaskChain::new(
                "cli",
                CLI_PERIOD_MS,
                vec![
                    HandlerKind::Input,
                    HandlerKind::Policy,
                    HandlerKind::Collection,
                    HandlerKind::Output,
                ],
            ),
            analysis: TaskChain::new(
                "analysis",
                analysis_ms,
                vec![
                    HandlerKind::Process,
                    HandlerKind::Stream,
                    HandlerKind::Detect,
                ],
            ),
            handlers: BTreeMap::new(),
            global,
            metrics,
        }
    }

    /// Installs the handler for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: HandlerKind, handler: Box<dyn ChainHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Runs one scheduler tick. `delayed` is the number of extra ticks that
    /// elapsed since the previous call.
    pub fn run_thread(&mut self, delayed: u32) -> Fired {
        let fired = Fired {
            switch_gear: self.switch_gear.is_run(delayed),
            preprocess: self.preprocess.is_run(delayed),
            cli: self.cli.is_run(delayed),
            analysis: self.analysis.is_run(delayed),
        };

        if fired.switch_gear {
            self.run_chain(Chain::SwitchGear, 0);
        }

        // Correlate right before an analysis pass so it sees fresh pairs.
        if fired.preprocess || fired.analysis {
            self.run_chain(Chain::Preprocess, u32::from(fired.analysis));
        }

        if fired.cli {
            self.run_chain(Chain::Cli, 0);
        }

        if self.global.take_streaming_update() {
            let period = analysis_period_ms(self.global.streaming_interval());
            self.analysis.set_period_ms(period);
            if fired.analysis {
                self.analysis.set_deadline_ms(period);
            }
            tracing::debug!(period_ms = period, "analysis period updated");
        }

        if fired.analysis {
            let interval = self.global.streaming_interval();
            self.run_chain(Chain::Analysis, interval);
        }

        fired
    }

    pub fn switch_gear_chain(&self) -> &TaskChain {
        &self.switch_gear
    }

    pub fn preprocess_chain(&self) -> &TaskChain {
        &self.preprocess
    }

    pub fn cli_chain(&self) -> &TaskChain {
        &self.cli
    }

    pub fn analysis_chain(&self) -> &TaskChain {
        &self.analysis
    }

    fn run_chain(&mut self, chain: Chain, option: u32) {
        let Self {
            switch_gear,
            preprocess,
            cli,
            analysis,
            handlers,
            metrics,
            ..
        } = self;
        let task = match chain {
            Chain::SwitchGear => &*switch_gear,
            Chain::Preprocess => &*preprocess,
            Chain::Cli => &*cli,
            Chain::Analysis => &*analysis,
        };

        if let Some(metrics) = metrics {
            metrics.chain_ticks.with_label_values(&[task.name()]).inc();
        }

        for kind in task.handlers() {
            let Some(handler) = handlers.get_mut(kind) else {
                tracing::trace!(stage = kind.as_str(), "no handler registered");
                continue;
            };
            let started = Instant::now();
            handler.handle_request(option);
            if let Some(metrics) = metrics {
                metrics
                    .stage_duration
                    .with_label_values(&[kind.as_str()])
                    .observe(started.elapsed().as_secs_f64());
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Chain {
    SwitchGear,
    Preprocess,
    Cli,
    Analysis,
}

fn analysis_period_ms(interval_secs: u32) -> i64 {
    i64::from(interval_secs.max(1)) * 1000
}
