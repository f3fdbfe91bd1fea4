//! End-to-end tests for workflow execution against the in-memory store.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use orchestrator::{
    ActionType, BroadcastEventSink, Container, EngineConfig, RetryPolicy, RunRequest, StepDefinition,
    StepError, StepInput, StepResponse, StepStatus, TransactionOrchestrator, TransactionStatus, WorkflowError,
    WorkflowEvent, WorkflowHandle, WorkflowId, WorkflowRegistry,
};
use serde::Deserialize;
use serde_json::{Value, json};
use transaction_store::{
    ErrorKind, ErrorRecord, InMemoryTransactionStore, StepKey, StepRecord, StepTable, TransactionHeader,
    TransactionId, TransactionQuery, TransactionSnapshot, TransactionStore, TransactionStoreError,
};

#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ordered record of step actions observed by the test.
#[derive(Clone, Default)]
struct Ledger(Arc<Mutex<Vec<String>>>);

impl Ledger {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    fn position(&self, entry: &str) -> usize {
        self.entries()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{entry} not recorded"))
    }
}

fn ok_step(ledger: &Ledger, id: &'static str) -> StepDefinition {
    let invoked = ledger.clone();
    let compensated = ledger.clone();
    StepDefinition::new(id, move |input, _ctx| {
        let ledger = invoked.clone();
        async move {
            ledger.push(format!("invoke:{id}"));
            Ok(StepResponse::new(json!({ "step": id, "input": input })))
        }
    })
    .with_compensation(move |_input, _ctx| {
        let ledger = compensated.clone();
        async move {
            ledger.push(format!("compensate:{id}"));
            Ok(())
        }
    })
}

fn failing_step(ledger: &Ledger, id: &'static str) -> StepDefinition {
    let invoked = ledger.clone();
    let compensated = ledger.clone();
    StepDefinition::new(id, move |_input, _ctx| {
        let ledger = invoked.clone();
        async move {
            ledger.push(format!("invoke:{id}"));
            Err::<StepResponse, _>(StepError::failed(format!("{id} failed")))
        }
    })
    .with_compensation(move |_input, _ctx| {
        let ledger = compensated.clone();
        async move {
            ledger.push(format!("compensate:{id}"));
            Ok(())
        }
    })
}

struct Harness {
    store: Arc<InMemoryTransactionStore>,
    registry: WorkflowRegistry,
}

impl Harness {
    fn new() -> Self {
        Self::with_orchestrator(|o| o)
    }

    fn with_orchestrator(
        configure: impl FnOnce(TransactionOrchestrator) -> TransactionOrchestrator,
    ) -> Self {
        let store = Arc::new(InMemoryTransactionStore::new());
        let orchestrator = configure(TransactionOrchestrator::new(store.clone()));
        Self {
            store,
            registry: WorkflowRegistry::new(Arc::new(orchestrator)),
        }
    }

    async fn handle(&self, workflow_id: &str) -> WorkflowHandle {
        self.registry
            .get_workflow(&WorkflowId::from(workflow_id))
            .await
            .unwrap()
    }
}

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::attempts(attempts)
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
}

#[tokio::test]
async fn sequential_failure_compensates_in_reverse_order() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("sequential", move |b| {
            let a = b.step(ok_step(&l, "a"), b.input())?;
            let s2 = b.step(ok_step(&l, "b"), a)?;
            let s3 = b.step(ok_step(&l, "c"), s2)?;
            b.step(failing_step(&l, "d"), s3)?;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = h.handle("sequential").await.run(json!({})).await.unwrap();

    assert_eq!(outcome.status(), TransactionStatus::Reverted);
    assert_eq!(
        ledger.entries(),
        vec![
            "invoke:a",
            "invoke:b",
            "invoke:c",
            "invoke:d",
            "compensate:c",
            "compensate:b",
            "compensate:a",
        ]
    );
    assert_eq!(ledger.count("compensate:d"), 0);

    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].step_id, "d");
    assert_eq!(outcome.errors[0].kind, ErrorKind::Domain);
    assert!(outcome.result.is_none());

    let snapshot = &outcome.transaction;
    for step in ["a", "b", "c"] {
        assert_eq!(snapshot.invoke(step).unwrap().status, StepStatus::Done);
        assert_eq!(snapshot.compensation(step).unwrap().status, StepStatus::Reverted);
    }
    assert_eq!(snapshot.invoke("d").unwrap().status, StepStatus::Failed);
    assert!(snapshot.compensation("d").is_none());

    let err = outcome.into_result().unwrap_err();
    assert!(matches!(err, WorkflowError::StepInvoke { ref step_id, attempt: 1, .. } if step_id == "d"));
}

#[tokio::test]
async fn rerunning_completed_transaction_returns_cached_result() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("replay", move |b| {
            let a = b.step(ok_step(&l, "a"), b.input())?;
            let s2 = b.step(ok_step(&l, "b"), a.field("input"))?;
            b.response(s2)
        })
        .await
        .unwrap();
    let handle = h.handle("replay").await;

    let first = handle
        .run_with(RunRequest::new(json!({"n": 1})).with_transaction_id("tx-replay"))
        .await
        .unwrap();
    let second = handle
        .run_with(RunRequest::new(json!({"n": 2})).with_transaction_id("tx-replay"))
        .await
        .unwrap();

    assert_eq!(first.status(), TransactionStatus::Done);
    assert_eq!(first.result, second.result);
    assert_eq!(
        first.result,
        Some(json!({"step": "b", "input": {"n": 1}}))
    );
    assert_eq!(ledger.count("invoke:a"), 1);
    assert_eq!(ledger.count("invoke:b"), 1);
}

#[tokio::test]
async fn failing_parallel_sibling_lets_others_settle_before_compensation() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    let slow_ledger = ledger.clone();

    h.registry
        .register_workflow("parallel", move |b| {
            b.step(ok_step(&l, "prepare"), b.input())?;
            b.parallel(|b| {
                b.step(failing_step(&l, "fast-fail"), b.input())?;
                let slow = StepDefinition::new("slow", move |_input, _ctx| {
                    let ledger = slow_ledger.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        ledger.push("invoke:slow");
                        Ok(StepResponse::new(json!("slow")))
                    }
                })
                .with_compensation({
                    let ledger = l.clone();
                    move |_input, _ctx| {
                        let ledger = ledger.clone();
                        async move {
                            ledger.push("compensate:slow");
                            Ok(())
                        }
                    }
                });
                b.step(slow, b.input())?;
                Ok(())
            })?;
            b.step(ok_step(&l, "after"), b.input())?;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = h.handle("parallel").await.run(json!({})).await.unwrap();

    assert_eq!(outcome.status(), TransactionStatus::Reverted);
    assert!(ledger.position("invoke:slow") < ledger.position("compensate:slow"));
    assert!(ledger.position("compensate:slow") < ledger.position("compensate:prepare"));
    assert_eq!(ledger.count("invoke:after"), 0);
    assert_eq!(ledger.count("compensate:fast-fail"), 0);
}

#[tokio::test]
async fn step_without_compensation_is_skipped_in_reverse_walk() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("skip-compensation", move |b| {
            b.step(ok_step(&l, "a"), b.input())?;
            let log = l.clone();
            b.step(
                StepDefinition::new("audit", move |_input, _ctx| {
                    let ledger = log.clone();
                    async move {
                        ledger.push("invoke:audit");
                        Ok(StepResponse::new(Value::Null))
                    }
                }),
                b.input(),
            )?;
            b.step(failing_step(&l, "c"), b.input())?;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = h
        .handle("skip-compensation")
        .await
        .run(json!({}))
        .await
        .unwrap();

    assert_eq!(outcome.status(), TransactionStatus::Reverted);
    assert_eq!(
        outcome.transaction.compensation("audit").unwrap().status,
        StepStatus::Skipped
    );
    assert_eq!(ledger.count("compensate:a"), 1);
}

#[derive(Debug, Deserialize)]
struct Cart {
    cart_id: String,
}

#[tokio::test]
async fn create_order_failure_compensates_cart_with_captured_id() {
    let h = Harness::new();
    let compensated_carts = Arc::new(Mutex::new(Vec::<String>::new()));
    let carts = compensated_carts.clone();
    let validated = Arc::new(AtomicU32::new(0));
    let validations = validated.clone();

    h.registry
        .register_workflow("create-order", move |b| {
            let create_cart = StepDefinition::new("create-cart", |_input, _ctx| async move {
                Ok(StepResponse::new(json!({"cart_id": "cart_123", "items": []}))
                    .with_compensation(json!({"cart_id": "cart_123"})))
            })
            .with_typed_compensation(move |cart: Cart, _ctx| {
                let carts = carts.clone();
                async move {
                    carts.lock().unwrap().push(cart.cart_id);
                    Ok(())
                }
            });
            let validate = StepDefinition::new("validate-sales-channel", move |_input, _ctx| {
                let validations = validations.clone();
                async move {
                    validations.fetch_add(1, Ordering::SeqCst);
                    Ok(StepResponse::new(json!({"valid": true})))
                }
            });
            let create_order = StepDefinition::new("create-order", |_input, _ctx| async move {
                Err::<StepResponse, _>(StepError::failed("inventory unavailable"))
            });

            let cart = b.step(create_cart, b.input())?;
            b.step(validate, cart.field("cart_id"))?;
            let order = b.step(create_order, cart.field("cart_id"))?;
            b.response(order)
        })
        .await
        .unwrap();

    let outcome = h
        .handle("create-order")
        .await
        .run(json!({"sales_channel_id": "sc_1"}))
        .await
        .unwrap();

    assert_eq!(outcome.status(), TransactionStatus::Reverted);
    assert_eq!(*compensated_carts.lock().unwrap(), vec!["cart_123".to_string()]);
    assert_eq!(validated.load(Ordering::SeqCst), 1);
    assert_eq!(
        outcome
            .transaction
            .compensation("validate-sales-channel")
            .unwrap()
            .status,
        StepStatus::Skipped
    );
    assert_eq!(outcome.errors[0].message, "inventory unavailable");
}

#[tokio::test]
async fn interrupted_transaction_resumes_at_next_attempt() {
    let h = Harness::new();
    let workflow_id = WorkflowId::from("checkout");
    let transaction_id = TransactionId::from("tx_1");

    // State left behind by a process that stopped while charge-payment was
    // waiting for its third attempt.
    let mut header = TransactionHeader::new(
        workflow_id.clone(),
        transaction_id.clone(),
        json!({"amount": 42}),
    );
    header.transition(TransactionStatus::Invoking);
    h.store.create_transaction(&header).await.unwrap();

    let mut cart = StepRecord::new();
    cart.mark_invoking(1);
    cart.mark_done(json!({"cart_id": "cart_1"}), None, 1);
    h.store
        .save_step(
            &StepKey::new(workflow_id.clone(), transaction_id.clone(), "create-cart", ActionType::Invoke),
            &cart,
        )
        .await
        .unwrap();

    let mut charge = StepRecord::new();
    charge.mark_invoking(2);
    charge.mark_waiting_for_retry(
        ErrorRecord::new(ErrorKind::Domain, "gateway timeout"),
        Utc::now() - chrono::Duration::seconds(1),
    );
    h.store
        .save_step(
            &StepKey::new(workflow_id.clone(), transaction_id.clone(), "charge-payment", ActionType::Invoke),
            &charge,
        )
        .await
        .unwrap();

    let ledger = Ledger::default();
    let attempts = Arc::new(Mutex::new(Vec::<u32>::new()));
    let l = ledger.clone();
    let seen = attempts.clone();
    h.registry
        .register_workflow("checkout", move |b| {
            let cart = b.step(ok_step(&l, "create-cart"), b.input())?;
            let charge = StepDefinition::new("charge-payment", move |input, ctx| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(ctx.attempt);
                    Ok(StepResponse::new(json!({"charged": input["cart_id"]})))
                }
            })
            .with_retry(fast_retry(3));
            let charged = b.step(charge, cart)?;
            b.response(charged)
        })
        .await
        .unwrap();

    let outcome = h
        .handle("checkout")
        .await
        .run_with(RunRequest::new(json!({"amount": 42})).with_transaction_id("tx_1"))
        .await
        .unwrap();

    assert_eq!(outcome.status(), TransactionStatus::Done);
    assert_eq!(*attempts.lock().unwrap(), vec![3]);
    assert_eq!(ledger.count("invoke:create-cart"), 0);
    assert_eq!(outcome.result, Some(json!({"charged": "cart_1"})));
    assert_eq!(outcome.transaction.invoke("charge-payment").unwrap().attempts, 3);
}

#[tokio::test]
async fn registering_a_workflow_twice_is_a_noop() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();

    assert!(
        h.registry
            .register_workflow("w1", move |b| {
                b.step(ok_step(&l, "first"), b.input())?;
                Ok(())
            })
            .await
            .unwrap()
    );
    let l = ledger.clone();
    assert!(
        !h.registry
            .register_workflow("w1", move |b| {
                b.step(ok_step(&l, "second"), b.input())?;
                Ok(())
            })
            .await
            .unwrap()
    );

    h.handle("w1").await.run(json!({})).await.unwrap();
    assert_eq!(ledger.entries(), vec!["invoke:first"]);
}

fn approval_workflow(ledger: &Ledger) -> impl FnOnce(&mut orchestrator::FlowBuilder) -> orchestrator::Result<()> {
    let l = ledger.clone();
    move |b| {
        let reserve = b.step(ok_step(&l, "reserve"), b.input())?;
        let log = l.clone();
        let approval = b.step(
            StepDefinition::new("await-approval", move |_input, _ctx| {
                let ledger = log.clone();
                async move {
                    ledger.push("invoke:await-approval");
                    Ok(StepResponse::pending())
                }
            }),
            reserve,
        )?;
        let ship = b.step(ok_step(&l, "ship"), approval.field("approver"))?;
        b.response(ship)
    }
}

#[tokio::test]
async fn pending_step_parks_until_success_signal() {
    let h = Harness::new();
    let ledger = Ledger::default();
    h.registry
        .register_workflow("approval", approval_workflow(&ledger))
        .await
        .unwrap();
    let handle = h.handle("approval").await;

    let parked = handle.run(json!({})).await.unwrap();
    assert!(parked.is_parked());
    assert!(parked.result.is_none());
    assert_eq!(
        parked.transaction.invoke("await-approval").unwrap().status,
        StepStatus::Pending
    );
    assert_eq!(ledger.count("invoke:ship"), 0);

    // Resuming without a signal leaves it parked and does not re-invoke
    let still_parked = handle.resume(parked.transaction_id().clone()).await.unwrap();
    assert!(still_parked.is_parked());
    assert_eq!(ledger.count("invoke:await-approval"), 1);

    let done = handle
        .register_step_success(
            parked.transaction_id().clone(),
            "await-approval",
            json!({"approver": "alice"}),
        )
        .await
        .unwrap();

    assert_eq!(done.status(), TransactionStatus::Done);
    assert_eq!(done.result, Some(json!({"step": "ship", "input": "alice"})));
    assert_eq!(ledger.count("invoke:reserve"), 1);
}

#[tokio::test]
async fn failure_signal_compensates_completed_steps() {
    let h = Harness::new();
    let ledger = Ledger::default();
    h.registry
        .register_workflow("approval", approval_workflow(&ledger))
        .await
        .unwrap();
    let handle = h.handle("approval").await;

    let parked = handle.run(json!({})).await.unwrap();
    let outcome = handle
        .register_step_failure(
            parked.transaction_id().clone(),
            "await-approval",
            StepError::permanent("rejected"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status(), TransactionStatus::Reverted);
    assert_eq!(ledger.count("compensate:reserve"), 1);
    assert_eq!(outcome.errors[0].kind, ErrorKind::Permanent);

    // A second signal for the same step is rejected
    let err = handle
        .register_step_success(parked.transaction_id().clone(), "await-approval", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));
}

#[tokio::test]
async fn signal_for_step_that_is_not_pending_is_rejected() {
    let h = Harness::new();
    let ledger = Ledger::default();
    h.registry
        .register_workflow("approval", approval_workflow(&ledger))
        .await
        .unwrap();
    let handle = h.handle("approval").await;
    let parked = handle.run(json!({})).await.unwrap();

    let err = handle
        .register_step_success(parked.transaction_id().clone(), "reserve", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));

    let err = handle
        .register_step_success(parked.transaction_id().clone(), "unknown", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownStep { .. }));
}

#[tokio::test]
async fn cancel_parked_transaction_compensates() {
    let h = Harness::new();
    let ledger = Ledger::default();
    h.registry
        .register_workflow("approval", approval_workflow(&ledger))
        .await
        .unwrap();
    let handle = h.handle("approval").await;

    let parked = handle.run(json!({})).await.unwrap();
    let cancelled = handle.cancel(parked.transaction_id().clone()).await.unwrap();

    assert_eq!(cancelled.status(), TransactionStatus::Reverted);
    assert_eq!(ledger.count("compensate:reserve"), 1);

    // Cancelling again returns the transaction unchanged
    let again = handle.cancel(parked.transaction_id().clone()).await.unwrap();
    assert_eq!(again.status(), TransactionStatus::Reverted);
    assert_eq!(ledger.count("compensate:reserve"), 1);
}

#[tokio::test]
async fn cancel_done_transaction_compensates_every_step() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("simple", move |b| {
            let a = b.step(ok_step(&l, "a"), b.input())?;
            b.step(ok_step(&l, "b"), a)?;
            Ok(())
        })
        .await
        .unwrap();
    let handle = h.handle("simple").await;

    let done = handle.run(json!({})).await.unwrap();
    assert!(done.is_done());

    let cancelled = handle.cancel(done.transaction_id().clone()).await.unwrap();
    assert_eq!(cancelled.status(), TransactionStatus::Reverted);
    assert!(ledger.position("compensate:b") < ledger.position("compensate:a"));
}

#[tokio::test]
async fn cancel_during_retry_backoff_stops_retrying() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    h.registry
        .register_workflow("flaky", move |b| {
            b.step(ok_step(&l, "a"), b.input())?;
            let flaky = StepDefinition::new("flaky", move |_input, _ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<StepResponse, _>(StepError::failed("try later"))
                }
            })
            .with_retry(
                RetryPolicy::attempts(5)
                    .with_base_delay(Duration::from_secs(30))
                    .with_max_delay(Duration::from_secs(30)),
            );
            b.step(flaky, b.input())?;
            Ok(())
        })
        .await
        .unwrap();
    let handle = h.handle("flaky").await;

    let run = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .run_with(RunRequest::new(json!({})).with_transaction_id("tx-flaky"))
                .await
        })
    };

    // Wait until the first attempt failed and the step sleeps in backoff
    while calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cancelled = tokio::time::timeout(Duration::from_secs(5), handle.cancel("tx-flaky"))
        .await
        .unwrap()
        .unwrap();
    let ran = run.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.count("compensate:a"), 1);
    assert!(ran.status().is_terminal());
    assert_eq!(cancelled.status(), TransactionStatus::Reverted);
}

#[tokio::test]
async fn branch_not_taken_skips_its_steps_and_consumers() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("shipping", move |b| {
            let express = b.when(
                b.input().field("express"),
                |v| v.as_bool().unwrap_or(false),
                |b| b.step(ok_step(&l, "express-shipping"), b.input()),
            )?;
            b.step(ok_step(&l, "label"), express.clone())?;
            let notify = b.step(ok_step(&l, "notify"), b.input())?;
            b.response(StepInput::object([
                ("express", StepInput::from(express)),
                ("notify", StepInput::from(notify)),
            ]))
        })
        .await
        .unwrap();
    let handle = h.handle("shipping").await;

    let standard = handle.run(json!({"express": false})).await.unwrap();
    assert_eq!(standard.status(), TransactionStatus::Done);
    assert_eq!(
        standard.transaction.invoke("express-shipping").unwrap().status,
        StepStatus::Skipped
    );
    assert_eq!(standard.transaction.invoke("label").unwrap().status, StepStatus::Skipped);
    assert_eq!(standard.result.as_ref().unwrap()["express"], Value::Null);
    assert_eq!(ledger.count("invoke:notify"), 1);

    let express = handle.run(json!({"express": true})).await.unwrap();
    assert_eq!(express.status(), TransactionStatus::Done);
    assert_eq!(ledger.count("invoke:express-shipping"), 1);
    assert_eq!(ledger.count("invoke:label"), 1);
}

#[tokio::test]
async fn non_saga_failure_does_not_compensate_and_can_be_retried() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    let healthy = Arc::new(AtomicBool::new(false));
    let mailer = healthy.clone();

    h.registry
        .register_workflow("signup", move |b| {
            let account = b.step(ok_step(&l, "create-account"), b.input())?;
            let email = StepDefinition::new("send-welcome-email", move |_input, _ctx| {
                let mailer = mailer.clone();
                async move {
                    if mailer.load(Ordering::SeqCst) {
                        Ok(StepResponse::new(json!("sent")))
                    } else {
                        Err(StepError::failed("smtp unavailable"))
                    }
                }
            })
            .continue_on_failure();
            let sent = b.step(email, account)?;
            b.step(ok_step(&l, "track-email"), sent)?;
            b.step(ok_step(&l, "finish"), b.input())?;
            Ok(())
        })
        .await
        .unwrap();
    let handle = h.handle("signup").await;

    let outcome = handle.run(json!({})).await.unwrap();
    assert_eq!(outcome.status(), TransactionStatus::Done);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(ledger.count("compensate:create-account"), 0);
    assert_eq!(ledger.count("invoke:finish"), 1);
    assert_eq!(
        outcome.transaction.invoke("track-email").unwrap().status,
        StepStatus::Skipped
    );

    healthy.store(true, Ordering::SeqCst);
    let retried = handle
        .retry_step(outcome.transaction_id().clone(), "send-welcome-email")
        .await
        .unwrap();

    assert_eq!(retried.status(), TransactionStatus::Done);
    assert!(retried.errors.is_empty());
    assert_eq!(
        retried.transaction.invoke("send-welcome-email").unwrap().status,
        StepStatus::Done
    );
    assert_eq!(ledger.count("invoke:track-email"), 1);
    assert_eq!(ledger.count("invoke:create-account"), 1);
}

#[tokio::test]
async fn retry_step_rejects_compensated_transactions() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("doomed", move |b| {
            b.step(failing_step(&l, "a"), b.input())?;
            Ok(())
        })
        .await
        .unwrap();
    let handle = h.handle("doomed").await;

    let outcome = handle.run(json!({})).await.unwrap();
    let err = handle
        .retry_step(outcome.transaction_id().clone(), "a")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let h = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    h.registry
        .register_workflow("retry", move |b| {
            let flaky = StepDefinition::new("flaky", move |_input, ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt < 3 {
                        Err(StepError::failed("not yet"))
                    } else {
                        Ok(StepResponse::new(json!(ctx.attempt)))
                    }
                }
            })
            .with_retry(fast_retry(3));
            let out = b.step(flaky, b.input())?;
            b.response(out)
        })
        .await
        .unwrap();

    let outcome = h.handle("retry").await.run(json!({})).await.unwrap();

    assert_eq!(outcome.result, Some(json!(3)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let record = outcome.transaction.invoke("flaky").unwrap();
    assert_eq!(record.attempts, 3);
    assert_eq!(record.last_error.as_ref().unwrap().message, "not yet");
}

#[tokio::test]
async fn exhausted_retries_and_permanent_errors_are_classified() {
    let h = Harness::new();
    let permanent_calls = Arc::new(AtomicU32::new(0));
    let counter = permanent_calls.clone();
    h.registry
        .register_workflow("exhausted", |b| {
            let flaky = StepDefinition::new("flaky", |_input, _ctx| async move {
                Err::<StepResponse, _>(StepError::failed("still down"))
            })
            .with_retry(fast_retry(2));
            b.step(flaky, b.input())?;
            Ok(())
        })
        .await
        .unwrap();
    h.registry
        .register_workflow("permanent", move |b| {
            let invalid = StepDefinition::new("invalid", move |_input, _ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<StepResponse, _>(StepError::permanent("bad card"))
                }
            })
            .with_retry(fast_retry(5));
            b.step(invalid, b.input())?;
            Ok(())
        })
        .await
        .unwrap();

    let exhausted = h.handle("exhausted").await.run(json!({})).await.unwrap();
    assert_eq!(exhausted.errors[0].kind, ErrorKind::RetryExhausted);
    assert_eq!(exhausted.errors[0].attempt, 2);
    assert!(matches!(
        exhausted.into_result(),
        Err(WorkflowError::RetryExhausted { attempts: 2, .. })
    ));

    let permanent = h.handle("permanent").await.run(json!({})).await.unwrap();
    assert_eq!(permanent.errors[0].kind, ErrorKind::Permanent);
    assert_eq!(permanent_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_attempt_times_out() {
    let h = Harness::new();
    h.registry
        .register_workflow("slow", |b| {
            let slow = StepDefinition::new("slow", |_input, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(StepResponse::new(Value::Null))
            })
            .with_timeout(Duration::from_millis(20));
            b.step(slow, b.input())?;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = h.handle("slow").await.run(json!({})).await.unwrap();
    assert_eq!(outcome.status(), TransactionStatus::Reverted);
    assert_eq!(outcome.errors[0].kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn compensation_failure_is_recorded_and_walk_continues() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("broken-undo", move |b| {
            b.step(ok_step(&l, "a"), b.input())?;
            let broken = StepDefinition::new("b", |_input, _ctx| async move {
                Ok(StepResponse::new(Value::Null))
            })
            .with_compensation(|_input, _ctx| async move { Err(StepError::failed("refund api down")) });
            b.step(broken, b.input())?;
            b.step(failing_step(&l, "c"), b.input())?;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = h.handle("broken-undo").await.run(json!({})).await.unwrap();

    assert_eq!(outcome.status(), TransactionStatus::Failed);
    assert_eq!(ledger.count("compensate:a"), 1);
    assert_eq!(
        outcome.transaction.compensation("b").unwrap().status,
        StepStatus::Failed
    );
    let compensation_error = outcome
        .errors
        .iter()
        .find(|e| e.action == ActionType::Compensate)
        .unwrap();
    assert_eq!(compensation_error.kind, ErrorKind::Compensation);
    assert_eq!(compensation_error.message, "refund api down");
}

#[tokio::test]
async fn store_write_failure_fails_the_transaction() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("outage", move |b| {
            b.step(ok_step(&l, "a"), b.input())?;
            Ok(())
        })
        .await
        .unwrap();

    h.store.set_fail_step_writes(true);
    let outcome = h.handle("outage").await.run(json!({})).await.unwrap();

    assert_eq!(outcome.status(), TransactionStatus::Failed);
    assert_eq!(outcome.errors[0].kind, ErrorKind::Infrastructure);
    assert_eq!(ledger.count("invoke:a"), 0);
}

/// In-memory store that rejects the first `done` write of one step.
struct RejectFirstDoneWrite {
    inner: InMemoryTransactionStore,
    step_id: &'static str,
    tripped: AtomicBool,
}

impl RejectFirstDoneWrite {
    fn new(step_id: &'static str) -> Self {
        Self {
            inner: InMemoryTransactionStore::new(),
            step_id,
            tripped: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl TransactionStore for RejectFirstDoneWrite {
    async fn create_transaction(&self, header: &TransactionHeader) -> transaction_store::Result<()> {
        self.inner.create_transaction(header).await
    }

    async fn save_transaction(&self, header: &TransactionHeader) -> transaction_store::Result<()> {
        self.inner.save_transaction(header).await
    }

    async fn get_transaction(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> transaction_store::Result<TransactionSnapshot> {
        self.inner.get_transaction(workflow_id, transaction_id).await
    }

    async fn save_step(&self, key: &StepKey, record: &StepRecord) -> transaction_store::Result<()> {
        if key.step_id == self.step_id
            && key.action == ActionType::Invoke
            && record.status == StepStatus::Done
            && !self.tripped.swap(true, Ordering::SeqCst)
        {
            return Err(TransactionStoreError::Unavailable(format!(
                "write rejected for {key}"
            )));
        }
        self.inner.save_step(key, record).await
    }

    async fn load_all(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> transaction_store::Result<StepTable> {
        self.inner.load_all(workflow_id, transaction_id).await
    }

    async fn list_transactions(
        &self,
        query: TransactionQuery,
    ) -> transaction_store::Result<Vec<TransactionHeader>> {
        self.inner.list_transactions(query).await
    }

    async fn delete_transaction(
        &self,
        workflow_id: &WorkflowId,
        transaction_id: &TransactionId,
    ) -> transaction_store::Result<bool> {
        self.inner.delete_transaction(workflow_id, transaction_id).await
    }
}

#[tokio::test]
async fn lost_done_write_still_compensates_the_step() {
    let store = Arc::new(RejectFirstDoneWrite::new("b"));
    let registry = WorkflowRegistry::new(Arc::new(TransactionOrchestrator::new(store.clone())));
    let ledger = Ledger::default();
    let l = ledger.clone();
    registry
        .register_workflow("lost-write", move |b| {
            let a = b.step(ok_step(&l, "a"), b.input())?;
            let s2 = b.step(ok_step(&l, "b"), a)?;
            b.step(ok_step(&l, "c"), s2)?;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = registry
        .get_workflow(&WorkflowId::from("lost-write"))
        .await
        .unwrap()
        .run(json!({}))
        .await
        .unwrap();

    assert_eq!(outcome.status(), TransactionStatus::Failed);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].step_id, "b");
    assert_eq!(outcome.errors[0].kind, ErrorKind::Infrastructure);
    assert_eq!(
        ledger.entries(),
        vec!["invoke:a", "invoke:b", "compensate:b", "compensate:a"]
    );
    assert_eq!(
        outcome.transaction.compensation("b").map(|r| r.status),
        Some(StepStatus::Reverted)
    );
}

#[tokio::test]
async fn panicking_step_is_recorded_as_failed() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("panicky", move |b| {
            let a = b.step(ok_step(&l, "a"), b.input())?;
            let boom = StepDefinition::new("boom", |_input, _ctx| async move {
                let items: Vec<u32> = Vec::new();
                let index = items.len() + 1;
                Ok(StepResponse::new(json!(items[index])))
            });
            b.step(boom, a)?;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = h
        .handle("panicky")
        .await
        .run_with(RunRequest::new(json!({})).with_transaction_id("tx-panic"))
        .await
        .unwrap();

    assert_eq!(outcome.status(), TransactionStatus::Reverted);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].step_id, "boom");
    assert_eq!(outcome.errors[0].kind, ErrorKind::Domain);
    assert!(outcome.errors[0].message.contains("panicked"));
    assert_eq!(ledger.entries(), vec!["invoke:a", "compensate:a"]);

    let stored = h
        .store
        .get_transaction(&WorkflowId::from("panicky"), &TransactionId::from("tx-panic"))
        .await
        .unwrap();
    assert_eq!(stored.invoke("boom").map(|r| r.status), Some(StepStatus::Failed));
    assert!(matches!(
        outcome.into_result(),
        Err(WorkflowError::StepInvoke { step_id, .. }) if step_id == "boom"
    ));
}

#[tokio::test]
async fn cancel_while_step_runs_lets_it_finish_then_compensates_it_first() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    let started = Arc::new(AtomicBool::new(false));
    let flag = started.clone();

    h.registry
        .register_workflow("slow-middle", move |b| {
            let a = b.step(ok_step(&l, "a"), b.input())?;
            let invoked = l.clone();
            let compensated = l.clone();
            let slow = StepDefinition::new("b", move |_input, _ctx| {
                let ledger = invoked.clone();
                let started = flag.clone();
                async move {
                    started.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    ledger.push("invoke:b");
                    Ok(StepResponse::new(json!({ "step": "b" })))
                }
            })
            .with_compensation(move |_input, _ctx| {
                let ledger = compensated.clone();
                async move {
                    ledger.push("compensate:b");
                    Ok(())
                }
            });
            let s2 = b.step(slow, a)?;
            b.step(ok_step(&l, "c"), s2)?;
            Ok(())
        })
        .await
        .unwrap();
    let handle = h.handle("slow-middle").await;

    let run = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .run_with(RunRequest::new(json!({})).with_transaction_id("tx-slow"))
                .await
        })
    };

    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let cancelled = tokio::time::timeout(Duration::from_secs(5), handle.cancel("tx-slow"))
        .await
        .unwrap()
        .unwrap();
    let ran = run.await.unwrap().unwrap();

    assert_eq!(ran.status(), TransactionStatus::Reverted);
    assert_eq!(cancelled.status(), TransactionStatus::Reverted);
    assert_eq!(
        ledger.entries(),
        vec!["invoke:a", "invoke:b", "compensate:b", "compensate:a"]
    );
    assert_eq!(ledger.count("invoke:c"), 0);
    assert_eq!(
        ran.transaction.invoke("b").map(|r| r.status),
        Some(StepStatus::Done)
    );
}

#[tokio::test]
async fn lifecycle_events_are_broadcast_in_order() {
    let sink = Arc::new(BroadcastEventSink::default());
    let mut events = sink.subscribe();
    let h = Harness::with_orchestrator(|o| o.with_events(sink.clone()));
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("events", move |b| {
            let a = b.step(ok_step(&l, "a"), b.input())?;
            b.step(ok_step(&l, "b"), a)?;
            Ok(())
        })
        .await
        .unwrap();

    h.handle("events")
        .await
        .run_with(RunRequest::new(json!({})).with_event_group("batch-7"))
        .await
        .unwrap();

    let mut types = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.event_group_id.as_deref(), Some("batch-7"));
        types.push(event.event.event_type());
    }
    assert_eq!(
        types,
        vec![
            "TransactionStarted",
            "StepStarted",
            "StepCompleted",
            "StepStarted",
            "StepCompleted",
            "TransactionCompleted",
        ]
    );
}

#[tokio::test]
async fn retry_events_carry_attempt_numbers() {
    let sink = Arc::new(BroadcastEventSink::default());
    let mut events = sink.subscribe();
    let h = Harness::with_orchestrator(|o| o.with_events(sink.clone()));
    h.registry
        .register_workflow("retry-events", |b| {
            let flaky = StepDefinition::new("flaky", |_input, ctx| async move {
                if ctx.attempt == 1 {
                    Err(StepError::failed("first attempt fails"))
                } else {
                    Ok(StepResponse::new(Value::Null))
                }
            })
            .with_retry(fast_retry(2));
            b.step(flaky, b.input())?;
            Ok(())
        })
        .await
        .unwrap();

    h.handle("retry-events").await.run(json!({})).await.unwrap();

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WorkflowEvent::StepRetryScheduled(data) = event.event {
            retries.push(data.attempt);
        }
    }
    assert_eq!(retries, vec![1]);
}

#[tokio::test]
async fn steps_resolve_services_from_the_container() {
    struct PriceList {
        unit_price: u64,
    }

    let store = Arc::new(InMemoryTransactionStore::new());
    let registry = WorkflowRegistry::new(Arc::new(TransactionOrchestrator::new(store)))
        .with_container(Container::new().with("prices", PriceList { unit_price: 250 }));

    #[derive(Deserialize)]
    struct Quote {
        quantity: u64,
    }

    registry
        .register_workflow("quote", |b| {
            let total = b.step(
                StepDefinition::typed("price", |quote: Quote, ctx| async move {
                    let prices = ctx
                        .resolve::<PriceList>("prices")
                        .ok_or_else(|| StepError::permanent("price list not registered"))?;
                    Ok::<_, StepError>(StepResponse::new(json!(quote.quantity * prices.unit_price)))
                }),
                b.input(),
            )?;
            b.response(total)
        })
        .await
        .unwrap();

    let handle = registry.get_workflow(&"quote".into()).await.unwrap();
    let outcome = handle.run(json!({"quantity": 4})).await.unwrap();
    assert_eq!(outcome.into_result().unwrap(), json!(1000));

    let bad_input = handle.run(json!({"quantity": "four"})).await.unwrap();
    assert_eq!(bad_input.errors[0].kind, ErrorKind::Permanent);
}

#[tokio::test]
async fn concurrent_transactions_run_independently() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("concurrent", move |b| {
            let a = b.step(ok_step(&l, "a"), b.input())?;
            b.response(a)
        })
        .await
        .unwrap();
    let handle = h.handle("concurrent").await;

    let runs: Vec<_> = (0..20)
        .map(|i| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.run(json!({ "i": i })).await })
        })
        .collect();

    for run in runs {
        assert!(run.await.unwrap().unwrap().is_done());
    }
    assert_eq!(ledger.count("invoke:a"), 20);
    assert_eq!(h.store.transaction_count().await, 20);
}

#[tokio::test]
async fn expired_transactions_are_purged() {
    let h = Harness::with_orchestrator(|o| {
        o.with_config(EngineConfig {
            retention: Some(Duration::ZERO),
            ..Default::default()
        })
    });
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("short-lived", move |b| {
            b.step(ok_step(&l, "a"), b.input())?;
            Ok(())
        })
        .await
        .unwrap();
    h.handle("short-lived").await.run(json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let purged = h.registry.orchestrator().purge_expired().await.unwrap();
    assert_eq!(purged, 1);
    assert_eq!(h.store.transaction_count().await, 0);
}

#[tokio::test]
async fn resuming_unknown_transaction_fails() {
    let h = Harness::new();
    let ledger = Ledger::default();
    let l = ledger.clone();
    h.registry
        .register_workflow("w1", move |b| {
            b.step(ok_step(&l, "a"), b.input())?;
            Ok(())
        })
        .await
        .unwrap();

    let err = h.handle("w1").await.resume("tx_missing").await.unwrap_err();
    assert!(matches!(err, WorkflowError::TransactionNotFound { .. }));
}
