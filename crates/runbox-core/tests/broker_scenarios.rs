//! Integration tests for the execution broker state machine.
//!
//! Workers are replaced by a scripted launcher so every reply, exit, and
//! race can be staged deterministically.

use std::sync::{Arc, Mutex};

use runbox_core::execute::{
    BrokerNotice, BrokerState, ChannelCallback, EMPTY_OUTPUT, ExecutionBroker, GENERIC_FAILURE,
    Outcome,
};
use runbox_core::ipc::{
    EventSink, Generation, WorkerEvents, WorkerLauncher, WorkerReply, WorkerRequest,
    WorkerTransport,
};
use runbox_core::{Error, Result};
use tokio::sync::mpsc::UnboundedReceiver;

// =============================================================================
// Test Helpers
// =============================================================================

struct FakeWorker {
    sink: EventSink,
    posted: Vec<WorkerRequest>,
    terminated: bool,
}

/// Every worker the scripted launcher has started, in spawn order.
#[derive(Clone, Default)]
struct Fleet(Arc<Mutex<Vec<FakeWorker>>>);

impl Fleet {
    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn posted(&self, index: usize) -> Vec<WorkerRequest> {
        self.0.lock().unwrap()[index].posted.clone()
    }

    fn is_terminated(&self, index: usize) -> bool {
        self.0.lock().unwrap()[index].terminated
    }

    /// Deliver a reply from worker `index`. Returns whether the sink accepted it.
    fn reply(&self, index: usize, reply: WorkerReply) -> bool {
        let sink = self.0.lock().unwrap()[index].sink.clone();
        sink.deliver(reply)
    }

    fn ack(&self, index: usize) -> bool {
        self.reply(index, WorkerReply::Init { error: None })
    }

    fn result(&self, index: usize, payload: &str) -> bool {
        self.reply(
            index,
            WorkerReply::Result {
                payload: payload.to_string(),
            },
        )
    }

    fn exit(&self, index: usize, reason: &str) -> bool {
        let sink = self.0.lock().unwrap()[index].sink.clone();
        sink.exited(reason)
    }
}

struct FakeTransport {
    fleet: Fleet,
    index: usize,
}

impl WorkerTransport for FakeTransport {
    fn post(&mut self, request: WorkerRequest) -> Result<()> {
        self.fleet.0.lock().unwrap()[self.index].posted.push(request);
        Ok(())
    }

    fn terminate(&mut self) {
        self.fleet.0.lock().unwrap()[self.index].terminated = true;
    }
}

struct ScriptedLauncher {
    fleet: Fleet,
    refuse: bool,
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self, sink: EventSink) -> Result<Box<dyn WorkerTransport>> {
        if self.refuse {
            return Err(Error::Ipc("Failed to spawn worker process 'fake'".to_string()));
        }
        let mut workers = self.fleet.0.lock().unwrap();
        workers.push(FakeWorker {
            sink,
            posted: Vec::new(),
            terminated: false,
        });
        Ok(Box::new(FakeTransport {
            fleet: self.fleet.clone(),
            index: workers.len() - 1,
        }))
    }
}

struct Harness {
    broker: ExecutionBroker,
    events: WorkerEvents,
    notices: UnboundedReceiver<BrokerNotice>,
    fleet: Fleet,
}

impl Harness {
    fn new() -> Self {
        Self::with_launcher(false)
    }

    fn with_launcher(refuse: bool) -> Self {
        let fleet = Fleet::default();
        let launcher = ScriptedLauncher {
            fleet: fleet.clone(),
            refuse,
        };
        let (callback, notices) = ChannelCallback::new();
        let (broker, events) = ExecutionBroker::new("sh", launcher, callback);
        Self {
            broker,
            events,
            notices,
            fleet,
        }
    }

    /// Construct and bring the first worker to ready.
    fn ready() -> Self {
        let mut h = Self::new();
        assert!(h.fleet.ack(0));
        h.pump();
        assert_eq!(h.drain(), vec![BrokerNotice::ReadyChanged(true)]);
        h
    }

    fn pump(&mut self) -> usize {
        self.broker.pump(&mut self.events)
    }

    fn drain(&mut self) -> Vec<BrokerNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }

    fn outcomes(notices: &[BrokerNotice]) -> Vec<Outcome> {
        notices
            .iter()
            .filter_map(|n| match n {
                BrokerNotice::Outcome(o) => Some(o.clone()),
                _ => None,
            })
            .collect()
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_construct_spawns_worker_and_sends_init() {
    let mut h = Harness::new();

    assert_eq!(h.broker.state(), BrokerState::AwaitingReady);
    assert_eq!(h.broker.generation(), Generation::new(0));
    assert!(!h.broker.is_ready());
    assert_eq!(
        h.fleet.posted(0),
        vec![WorkerRequest::Init {
            location: "sh".to_string()
        }]
    );
    assert!(h.drain().is_empty());
}

#[test]
fn test_run_rejected_while_awaiting_ready() {
    let mut h = Harness::new();

    assert!(matches!(h.broker.run("echo hi"), Err(Error::WorkerNotReady)));
    assert_eq!(h.broker.state(), BrokerState::AwaitingReady);
    assert_eq!(h.fleet.posted(0).len(), 1);
}

#[test]
fn test_scenario_a_run_to_success() {
    let mut h = Harness::ready();
    assert_eq!(h.broker.state(), BrokerState::Idle);

    h.broker.run("return 1").unwrap();
    assert_eq!(h.broker.state(), BrokerState::Running);
    assert_eq!(
        h.fleet.posted(0)[1],
        WorkerRequest::Run {
            source: "return 1".to_string()
        }
    );

    assert!(h.fleet.result(0, r#"{"buffer":"1"}"#));
    h.pump();

    assert_eq!(
        h.drain(),
        vec![BrokerNotice::Outcome(Outcome::Success {
            output: "1".to_string()
        })]
    );
    assert_eq!(h.broker.state(), BrokerState::Idle);
    assert!(h.broker.is_ready());
}

#[test]
fn test_execution_failure_keeps_broker_healthy() {
    let mut h = Harness::ready();

    h.broker.run("boom()").unwrap();
    h.fleet.result(0, r#"{"error":"undefined: boom"}"#);
    h.pump();
    assert_eq!(
        Harness::outcomes(&h.drain()),
        vec![Outcome::Failure {
            message: "undefined: boom".to_string()
        }]
    );

    h.broker.run("print()").unwrap();
    h.fleet.result(0, "{}");
    h.pump();
    assert_eq!(
        Harness::outcomes(&h.drain()),
        vec![Outcome::Success {
            output: EMPTY_OUTPUT.to_string()
        }]
    );
    assert_eq!(h.broker.generation(), Generation::new(0));
}

#[test]
fn test_malformed_result_becomes_generic_failure() {
    let mut h = Harness::ready();

    h.broker.run("x").unwrap();
    h.fleet.result(0, "definitely { not json");
    h.pump();

    assert_eq!(
        Harness::outcomes(&h.drain()),
        vec![Outcome::Failure {
            message: GENERIC_FAILURE.to_string()
        }]
    );
    assert_eq!(h.broker.state(), BrokerState::Idle);
}

#[test]
fn test_scenario_b_cancel_infinite_loop() {
    let mut h = Harness::ready();

    h.broker.run("while(true){}").unwrap();
    assert!(h.broker.cancel());

    // Cancelled is emitted synchronously, before any worker activity.
    assert_eq!(
        h.drain(),
        vec![
            BrokerNotice::ReadyChanged(false),
            BrokerNotice::Outcome(Outcome::Cancelled)
        ]
    );
    assert_eq!(h.broker.state(), BrokerState::Idle);
    assert_eq!(h.broker.generation(), Generation::new(1));
    assert!(h.fleet.is_terminated(0));
    assert_eq!(h.fleet.len(), 2);
    assert_eq!(
        h.fleet.posted(1),
        vec![WorkerRequest::Init {
            location: "sh".to_string()
        }]
    );

    // The old worker's late result never reaches the broker.
    assert!(!h.fleet.result(0, r#"{"buffer":"too late"}"#));
    h.pump();
    assert!(h.drain().is_empty());
}

#[test]
fn test_result_queued_before_cancel_is_dropped() {
    let mut h = Harness::ready();

    h.broker.run("slow()").unwrap();
    // Worker answered, but the broker has not seen it yet.
    assert!(h.fleet.result(0, r#"{"buffer":"raced"}"#));
    assert!(h.broker.cancel());
    h.pump();

    let notices = h.drain();
    assert_eq!(Harness::outcomes(&notices), vec![Outcome::Cancelled]);
    assert_eq!(h.broker.state(), BrokerState::Idle);
}

#[test]
fn test_stale_ack_does_not_make_replacement_ready() {
    let mut h = Harness::ready();

    h.broker.run("loop").unwrap();
    h.broker.cancel();
    h.drain();

    // An ack stamped with generation 0 is refused at the sink.
    assert!(!h.fleet.ack(0));
    h.pump();
    assert!(!h.broker.is_ready());
    assert!(matches!(h.broker.run("x"), Err(Error::WorkerNotReady)));

    assert!(h.fleet.ack(1));
    h.pump();
    assert!(h.broker.is_ready());
    assert_eq!(h.drain(), vec![BrokerNotice::ReadyChanged(true)]);
}

#[test]
fn test_double_cancel_yields_one_cancelled() {
    let mut h = Harness::ready();

    h.broker.run("while(true){}").unwrap();
    assert!(h.broker.cancel());
    assert!(!h.broker.cancel());

    let notices = h.drain();
    assert_eq!(Harness::outcomes(&notices), vec![Outcome::Cancelled]);
    assert_eq!(h.broker.state(), BrokerState::Idle);
    assert_eq!(h.fleet.len(), 2);

    h.fleet.ack(1);
    h.pump();
    assert!(h.broker.is_ready());
    assert_eq!(h.broker.state(), BrokerState::Idle);
}

#[test]
fn test_cancel_when_idle_is_noop() {
    let mut h = Harness::ready();

    assert!(!h.broker.cancel());
    assert_eq!(h.fleet.len(), 1);
    assert!(!h.fleet.is_terminated(0));
    assert!(h.drain().is_empty());
}

#[test]
fn test_rerun_after_cancel_uses_new_generation() {
    let mut h = Harness::ready();

    h.broker.run("loop").unwrap();
    h.broker.cancel();
    h.fleet.ack(1);
    h.pump();
    h.drain();

    h.broker.run("echo 2").unwrap();
    assert_eq!(
        h.fleet.posted(1)[1],
        WorkerRequest::Run {
            source: "echo 2".to_string()
        }
    );
    h.fleet.result(1, r#"{"buffer":"2"}"#);
    h.pump();
    assert_eq!(
        Harness::outcomes(&h.drain()),
        vec![Outcome::Success {
            output: "2".to_string()
        }]
    );
}

#[test]
fn test_at_most_one_outcome_per_run() {
    let mut h = Harness::ready();

    h.broker.run("x").unwrap();
    h.fleet.result(0, r#"{"buffer":"first"}"#);
    h.fleet.result(0, r#"{"buffer":"second"}"#);
    h.pump();

    assert_eq!(
        Harness::outcomes(&h.drain()),
        vec![Outcome::Success {
            output: "first".to_string()
        }]
    );
}

#[test]
fn test_many_cancel_cycles_one_outcome_each() {
    let mut h = Harness::ready();

    for round in 0..5u64 {
        h.broker.run("loop").unwrap();
        assert!(h.broker.cancel());
        let index = (round + 1) as usize;
        h.fleet.ack(index);
        h.pump();
        assert_eq!(h.broker.generation(), Generation::new(round + 1));
    }

    let notices = h.drain();
    assert_eq!(Harness::outcomes(&notices), vec![Outcome::Cancelled; 5]);
    assert_eq!(h.fleet.len(), 6);
    for index in 0..5 {
        assert!(h.fleet.is_terminated(index));
    }
}

#[test]
fn test_scenario_c_init_failure_is_permanent() {
    let mut h = Harness::new();

    h.fleet.reply(
        0,
        WorkerReply::Init {
            error: Some("runtime 'dlite' not found".to_string()),
        },
    );
    h.pump();

    assert_eq!(
        h.drain(),
        vec![BrokerNotice::InitFailed("runtime 'dlite' not found".to_string())]
    );
    assert!(!h.broker.is_ready());
    assert_eq!(h.broker.state(), BrokerState::AwaitingReady);

    for _ in 0..3 {
        assert!(matches!(h.broker.run("x"), Err(Error::WorkerNotReady)));
        h.pump();
    }
    // No retry was attempted.
    assert_eq!(h.fleet.len(), 1);
}

#[test]
fn test_worker_exit_before_ack_is_init_failure() {
    let mut h = Harness::new();

    h.fleet.exit(0, "worker closed its output");
    h.pump();

    let notices = h.drain();
    assert!(matches!(
        notices.as_slice(),
        [BrokerNotice::InitFailed(msg)] if msg.contains("before initialization")
    ));
    assert!(h.fleet.is_terminated(0));
    assert_eq!(h.fleet.len(), 1);
    assert!(matches!(h.broker.run("x"), Err(Error::WorkerNotReady)));
}

#[test]
fn test_init_error_then_exit_reports_one_failure() {
    let mut h = Harness::new();

    // The killed worker's exit is already queued when the error is handled.
    assert!(h.fleet.reply(
        0,
        WorkerReply::Init {
            error: Some("runtime 'x' not found".to_string()),
        },
    ));
    assert!(h.fleet.exit(0, "worker closed its output"));
    h.pump();

    assert_eq!(
        h.drain(),
        vec![BrokerNotice::InitFailed("runtime 'x' not found".to_string())]
    );
    assert_eq!(h.fleet.len(), 1);
}

#[test]
fn test_exit_after_init_failure_is_refused() {
    let mut h = Harness::new();

    h.fleet.reply(
        0,
        WorkerReply::Init {
            error: Some("runtime 'x' not found".to_string()),
        },
    );
    h.pump();
    assert_eq!(h.drain().len(), 1);

    assert!(!h.fleet.exit(0, "worker closed its output"));
    h.pump();
    assert!(h.drain().is_empty());
    assert_eq!(h.broker.state(), BrokerState::AwaitingReady);
    assert!(matches!(h.broker.run("x"), Err(Error::WorkerNotReady)));
}

#[test]
fn test_spawn_failure_is_init_failure() {
    let mut h = Harness::with_launcher(true);

    let notices = h.drain();
    assert!(matches!(
        notices.as_slice(),
        [BrokerNotice::InitFailed(msg)] if msg.contains("Failed to spawn")
    ));
    assert!(matches!(h.broker.run("x"), Err(Error::WorkerNotReady)));
}

#[test]
fn test_worker_crash_during_run_fails_and_respawns() {
    let mut h = Harness::ready();

    h.broker.run("crash()").unwrap();
    h.fleet.exit(0, "worker closed its output");
    h.pump();

    let notices = h.drain();
    assert_eq!(notices[0], BrokerNotice::ReadyChanged(false));
    assert!(matches!(
        &notices[1],
        BrokerNotice::Outcome(Outcome::Failure { message }) if message.contains("exited unexpectedly")
    ));
    assert_eq!(h.broker.state(), BrokerState::Idle);
    assert_eq!(h.broker.generation(), Generation::new(1));
    assert_eq!(h.fleet.len(), 2);

    h.fleet.ack(1);
    h.pump();
    assert!(h.broker.is_ready());
}

#[test]
fn test_idle_worker_crash_respawns_without_outcome() {
    let mut h = Harness::ready();

    h.fleet.exit(0, "killed externally");
    h.pump();

    assert_eq!(h.drain(), vec![BrokerNotice::ReadyChanged(false)]);
    assert_eq!(h.fleet.len(), 2);
    assert_eq!(h.broker.generation(), Generation::new(1));
}

#[test]
fn test_teardown_emits_nothing_and_stops_delivery() {
    let mut h = Harness::ready();

    h.broker.run("loop").unwrap();
    h.broker.teardown();
    h.broker.teardown();

    assert!(h.fleet.is_terminated(0));
    assert!(!h.fleet.result(0, r#"{"buffer":"late"}"#));
    h.pump();
    assert!(h.drain().is_empty());
    assert_eq!(h.fleet.len(), 1);
    assert!(matches!(h.broker.run("x"), Err(Error::WorkerTerminated)));
}

#[test]
fn test_drop_terminates_worker() {
    let h = Harness::ready();
    let fleet = h.fleet.clone();
    drop(h);
    assert!(fleet.is_terminated(0));
}
