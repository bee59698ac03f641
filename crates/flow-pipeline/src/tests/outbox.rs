use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flow_checkpoint::SuspensionPoint;
use flow_types::{
    ExternalCategory, ExternalErrorKind, ExternalOutcome, ExternalRequest, ExternalResponse, FlowEvent,
    FlowEventPayload, FlowId, FlowStatus, OutputRecord, Payload, RequestId,
};

use super::{Network, SIGNING_KEY};
use crate::demo::{demo_registry, SIGN_AND_STORE_FLOW};
use crate::pipeline::PipelineOutcome;
use crate::services::{DemoSigningService, ExternalService};

/// Fails transiently `failures` times before signing.
struct FlakySigner {
    failures: u32,
    calls: AtomicU32,
    inner: DemoSigningService,
}

impl ExternalService for FlakySigner {
    fn handle(&self, request: &ExternalRequest) -> ExternalOutcome {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return ExternalOutcome::Failure {
                kind: ExternalErrorKind::Transient,
                message: "hsm busy".into(),
            };
        }
        self.inner.handle(request)
    }
}

/// Always fails with `kind`.
struct BrokenService(ExternalErrorKind);

impl ExternalService for BrokenService {
    fn handle(&self, _request: &ExternalRequest) -> ExternalOutcome {
        ExternalOutcome::Failure {
            kind: self.0,
            message: "hsm offline".into(),
        }
    }
}

fn signature_of(document: &str) -> String {
    DemoSigningService::new(SIGNING_KEY).sign(&Payload::from(document))
}

fn response(flow_id: &FlowId, request: u64, category: ExternalCategory, payload: &str) -> FlowEvent {
    FlowEvent::new(
        flow_id.clone(),
        FlowEventPayload::ExternalResponse(ExternalResponse {
            request_id: RequestId::for_flow(flow_id, request),
            category,
            outcome: ExternalOutcome::Success {
                payload: Payload::from(payload),
            },
            timestamp: chrono::Utc::now(),
        }),
    )
}

fn requests(outputs: &[OutputRecord], category: ExternalCategory) -> Vec<ExternalRequest> {
    outputs
        .iter()
        .filter_map(|record| match record {
            OutputRecord::ExternalRequest(req) if req.category == category => Some(req.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_sign_then_store_completes() {
    let mut net = Network::new(demo_registry());
    let flow = net.start(SIGN_AND_STORE_FLOW, "alice", Payload::from("invoice-42"));
    net.run_until_idle();

    let signature = signature_of("invoice-42");
    assert_eq!(
        net.status(&flow),
        Some(FlowStatus::Completed {
            result: Payload::from(signature.clone())
        })
    );
    assert_eq!(net.persistence.get(flow.as_str()), Some(Payload::from(signature)));
    assert!(net.checkpoint(&flow).is_none());

    let outputs = net.committed_outputs(&flow);
    assert_eq!(requests(&outputs, ExternalCategory::Crypto).len(), 1);
    assert_eq!(requests(&outputs, ExternalCategory::Persistence).len(), 1);
}

#[test]
fn test_transient_external_failure_is_resent() {
    let signer = Arc::new(FlakySigner {
        failures: 2,
        calls: AtomicU32::new(0),
        inner: DemoSigningService::new(SIGNING_KEY),
    });
    let mut net = Network::builder(demo_registry())
        .service(ExternalCategory::Crypto, signer.clone())
        .build();

    let flow = net.start(SIGN_AND_STORE_FLOW, "alice", Payload::from("invoice-7"));
    net.run_until_idle();

    assert_eq!(signer.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        net.status(&flow),
        Some(FlowStatus::Completed {
            result: Payload::from(signature_of("invoice-7"))
        })
    );
    let attempts: Vec<u32> = requests(&net.committed_outputs(&flow), ExternalCategory::Crypto)
        .iter()
        .map(|req| req.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[test]
fn test_unanswered_request_is_resent_after_window() {
    let lost = Arc::new(AtomicBool::new(false));
    let lose_once = lost.clone();
    let mut net = Network::builder(demo_registry())
        .filter(move |record| match record {
            OutputRecord::ExternalRequest(_) => lose_once
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err(),
            _ => true,
        })
        .build();

    let flow = net.start(SIGN_AND_STORE_FLOW, "alice", Payload::from("invoice-9"));
    net.run_until_idle();
    assert_eq!(net.status(&flow), Some(FlowStatus::Running));

    net.advance(Duration::from_millis(999));
    assert_eq!(net.status(&flow), Some(FlowStatus::Running));

    net.advance(Duration::from_millis(1));
    assert!(matches!(net.status(&flow), Some(FlowStatus::Completed { .. })));

    let crypto = requests(&net.committed_outputs(&flow), ExternalCategory::Crypto);
    assert_eq!(crypto.len(), 2);
    assert_eq!(crypto[0].request_id, crypto[1].request_id);
    assert_eq!(crypto[1].attempt, 2);
}

#[test]
fn test_duplicate_and_stale_responses_are_ignored() {
    let mut net = Network::builder(demo_registry())
        .filter(|record| !matches!(record, OutputRecord::ExternalRequest(_)))
        .build();
    let flow = net.start(SIGN_AND_STORE_FLOW, "alice", Payload::from("invoice-1"));
    net.run_until_idle();

    net.submit(response(&flow, 1, ExternalCategory::Crypto, "sig"));
    net.run_until_idle();
    let awaiting_store = Some(SuspensionPoint::AwaitingExternal {
        category: ExternalCategory::Persistence,
        request_id: RequestId::for_flow(&flow, 2),
    });
    assert_eq!(net.checkpoint(&flow).unwrap().suspension, awaiting_store);

    // The same crypto answer again, then an answer for a request never made.
    net.submit(response(&flow, 1, ExternalCategory::Crypto, "sig-again"));
    net.submit(response(&flow, 7, ExternalCategory::Persistence, "bogus"));
    net.run_until_idle();
    let cp = net.checkpoint(&flow).unwrap();
    assert_eq!(cp.suspension, awaiting_store);
    assert!(cp.pending_requests[&ExternalCategory::Persistence].response.is_none());
    assert_eq!(net.status(&flow), Some(FlowStatus::Running));

    net.submit(response(&flow, 2, ExternalCategory::Persistence, "stored"));
    net.run_until_idle();
    assert_eq!(
        net.status(&flow),
        Some(FlowStatus::Completed {
            result: Payload::from("sig")
        })
    );
}

#[test]
fn test_platform_failure_reaches_the_flow() {
    let mut net = Network::new(demo_registry());
    // The signing service refuses empty documents.
    let flow = net.start(SIGN_AND_STORE_FLOW, "alice", Payload::empty());
    net.run_until_idle();

    assert_eq!(
        net.status(&flow),
        Some(FlowStatus::Failed {
            message: "nothing to sign".into()
        })
    );
    assert!(net.bus.dead_letters().is_empty());
}

#[test]
fn test_fatal_external_failure_dead_letters_the_flow() {
    let mut net = Network::builder(demo_registry())
        .service(ExternalCategory::Crypto, Arc::new(BrokenService(ExternalErrorKind::Fatal)))
        .build();
    let flow = net.start(SIGN_AND_STORE_FLOW, "alice", Payload::from("invoice-3"));
    net.run_until_idle();

    match net.status(&flow) {
        Some(FlowStatus::Failed { message }) => assert!(message.contains("hsm offline")),
        other => panic!("unexpected status {:?}", other),
    }
    assert!(matches!(
        net.outcomes_of(&flow).last(),
        Some(PipelineOutcome::DeadLettered { .. })
    ));
    assert_eq!(net.bus.dead_letters().len(), 1);
    assert!(net.checkpoint(&flow).is_none());
}
