use std::cmp::min;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{RunOutcome, RuntimeError};
use crate::graph::Graph;
use crate::observer::ObserverRef;
use crate::time::EngineTime;

/// Whether the engine runs against the wall clock or jumps through
/// scheduled times from a historical start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RunMode {
    RealTime,
    HistoricalFrom(EngineTime),
}

impl RunMode {
    pub fn start_time(&self) -> EngineTime {
        match self {
            RunMode::RealTime => EngineTime::now(),
            RunMode::HistoricalFrom(start_time) => *start_time,
        }
    }
}

/// Defines how long the engine should run for.  Can be a Duration, a
/// number of cycles or forever.
#[derive(Clone, Copy, Debug)]
pub enum RunFor {
    Duration(Duration),
    Cycles(u32),
    Forever,
}

/// Cooperative stop: settable from observers or producer threads,
/// observed by the tick loop at tick boundaries.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Drives one graph through start / tick loop / stop and fires the
/// observer callbacks around every phase.
pub struct EvaluationEngine {
    graph: Graph,
    run_mode: RunMode,
    observers: Vec<ObserverRef>,
    stop_flag: Arc<AtomicBool>,
    last_time: EngineTime,
}

impl EvaluationEngine {
    pub fn new(graph: Graph, run_mode: RunMode) -> Self {
        Self {
            graph,
            run_mode,
            observers: Vec::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            last_time: EngineTime::MIN_DT,
        }
    }

    pub fn add_observer(&mut self, observer: ObserverRef) {
        self.observers.push(observer);
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop_flag.clone())
    }

    /// Start, tick until the bound is reached, stop.  Stop runs even when
    /// a node body panics mid-tick; the panic then resumes.
    pub fn run(&mut self, run_for: RunFor) -> Result<RunOutcome, RuntimeError> {
        let start_time = self.run_mode.start_time();
        self.last_time = start_time;
        self.graph.start(start_time, &self.observers)?;
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_ticks(start_time, run_for)
        }));
        let stop_time = self.last_time;
        self.graph.stop(stop_time, &self.observers);
        match result {
            Ok(outcome) => outcome,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn run_ticks(
        &mut self,
        start_time: EngineTime,
        run_for: RunFor,
    ) -> Result<RunOutcome, RuntimeError> {
        let is_realtime = matches!(self.run_mode, RunMode::RealTime);
        let mut end_time = EngineTime::MAX_DT;
        let mut end_cycle = u32::MAX;
        match run_for {
            RunFor::Duration(duration) => {
                end_time = start_time + duration;
                log::debug!("end_time = {end_time}");
            }
            RunFor::Cycles(cycles) => {
                end_cycle = cycles;
                log::debug!("end_cycle = {end_cycle}");
            }
            RunFor::Forever => {}
        }
        let mut cycles: u32 = 0;
        let mut now = start_time;
        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                log::debug!("stop observed at {now}");
                return Ok(RunOutcome::Halted { at: now });
            }
            if cycles >= end_cycle {
                return Ok(RunOutcome::Completed { at: now });
            }
            let next = if is_realtime {
                match self.next_tick_realtime(now, end_time)? {
                    Some(next) => next,
                    None => return Ok(RunOutcome::Completed { at: now }),
                }
            } else {
                let mut next = self.graph.next_scheduled_evaluation_time();
                if !self.graph.inbox_is_empty() {
                    next = min(next, now);
                }
                next
            };
            if next.is_never() {
                log::debug!("no further work, terminating at {now}");
                return Ok(RunOutcome::Completed { at: now });
            }
            if next > end_time {
                return Ok(RunOutcome::Completed { at: end_time });
            }
            now = next;
            self.tick(now)?;
            cycles += 1;
            log::trace!("cycles={cycles}");
        }
    }

    /// Realtime: wait on the push inbox until the next scheduled time (or
    /// the run deadline).  Returns the wall time to tick at, or None when
    /// no work can ever arrive.
    fn next_tick_realtime(
        &mut self,
        now: EngineTime,
        end_time: EngineTime,
    ) -> Result<Option<EngineTime>, RuntimeError> {
        loop {
            let wall = EngineTime::now();
            if !self.graph.inbox_is_empty() {
                return Ok(Some(wall));
            }
            let next_sched = self.graph.next_scheduled_evaluation_time();
            if next_sched <= wall {
                return Ok(Some(wall.max(now)));
            }
            if next_sched.is_never() && !self.graph.has_push_source() {
                return Ok(None);
            }
            let deadline = min(next_sched, end_time);
            if deadline <= wall {
                return Ok(Some(wall));
            }
            let timeout = if deadline.is_never() {
                Duration::from_millis(50)
            } else {
                Duration::from(deadline - wall)
            };
            if let Some(envelope) = self.graph.wait_inbox(timeout) {
                let arrived = EngineTime::now();
                self.graph
                    .stage(envelope.node_ndx, envelope.value, arrived);
                return Ok(Some(arrived));
            }
            if self.stop_flag.load(Ordering::Relaxed) {
                return Ok(Some(EngineTime::now()));
            }
        }
    }

    fn tick(&mut self, now: EngineTime) -> Result<(), RuntimeError> {
        self.last_time = now;
        let info = self.graph.info();
        for observer in &self.observers {
            observer.borrow_mut().on_before_graph_evaluation(&info, now);
        }
        self.graph.drain_inbox(now);
        self.graph.evaluate_tick(now, &self.observers)?;
        for observer in &self.observers {
            observer
                .borrow_mut()
                .on_after_graph_push_nodes_evaluation(&info, now);
        }
        for observer in &self.observers {
            observer.borrow_mut().on_after_graph_evaluation(&info, now);
        }
        self.graph.end_tick(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::graph::GraphBuilder;
    use crate::meta::TypeMeta;
    use crate::value::HostValue;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;

    #[test]
    fn stop_handle_halts_at_tick_boundary() {
        let mut builder = GraphBuilder::new();
        builder.pull_source(
            "src",
            TypeMeta::int(),
            (0..100)
                .map(|i| (EngineTime::new(i), HostValue::Int(i as i64)))
                .collect(),
        );
        let graph = builder.build().unwrap();
        let mut engine = EvaluationEngine::new(graph, RunMode::HistoricalFrom(EngineTime::MIN_DT));
        engine.stop_handle().stop();
        let outcome = engine.run(RunFor::Forever).unwrap();
        assert!(matches!(outcome, crate::error::RunOutcome::Halted { .. }));
    }

    #[test]
    fn realtime_push_drives_the_graph() {
        let _ = env_logger::try_init();
        let mut builder = GraphBuilder::new();
        let src = builder.push_source("src", TypeMeta::int());
        let captured = Rc::new(RefCell::new(Vec::new()));
        let sink = captured.clone();
        builder.sink("capture", src, move |value, _| {
            sink.borrow_mut().push(value);
        });
        let graph = builder.build().unwrap();
        let handle = graph.push_handle(src).unwrap();
        let producer = thread::spawn(move || {
            for i in 0..3 {
                handle.push(HostValue::Int(i)).unwrap();
                thread::sleep(Duration::from_millis(2));
            }
        });
        let mut engine = EvaluationEngine::new(graph, RunMode::RealTime);
        engine.run(RunFor::Duration(Duration::from_millis(50))).unwrap();
        producer.join().unwrap();
        let seen = captured.borrow();
        assert!(!seen.is_empty());
        assert_eq!(seen.last(), Some(&HostValue::Int(2)));
    }
}
