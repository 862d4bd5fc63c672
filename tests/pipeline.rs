//! Pipeline integration tests.
//!
//! Covers the scheduling contract: deferred preprocessor completions,
//! notification ordering, and drain detection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use silt::pipeline::CompletionToken;
use silt::{
    Config, EntityType, Notification, Pipeline, PipelineContext, PipelineKind, Preprocessor,
    Processing, Result, Store, Uid,
};
use tempfile::tempdir;

/// Counts its invocations and completes synchronously.
struct Counting {
    invocations: Arc<AtomicUsize>,
}

impl Preprocessor for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn process(&mut self, _ctx: &PipelineContext<'_>) -> Result<Processing> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(Processing::Completed)
    }
}

/// Defers every completion, handing its tokens to the test.
struct Deferring {
    tokens: Arc<Mutex<Vec<CompletionToken>>>,
}

impl Preprocessor for Deferring {
    fn name(&self) -> &str {
        "deferring"
    }

    fn process(&mut self, ctx: &PipelineContext<'_>) -> Result<Processing> {
        self.tokens.lock().unwrap().push(ctx.completion_token());
        Ok(Processing::Pending)
    }
}

fn mail_payload(subject: &str) -> Vec<u8> {
    silt::domain::Mail {
        subject: subject.into(),
        ..Default::default()
    }
    .encode()
    .unwrap()
}

fn pipeline_with(
    dir: &tempfile::TempDir,
    preprocessors: impl Fn() -> Vec<Box<dyn Preprocessor>>,
) -> Pipeline {
    let config = Config::for_instance(dir.path(), "instance1");
    let store = Store::open(config.store_path(), silt::AccessMode::ReadWrite).unwrap();
    let mut pipeline = Pipeline::new(store, &config).unwrap();
    for kind in [PipelineKind::New, PipelineKind::Modified, PipelineKind::Deleted] {
        pipeline.set_preprocessors(EntityType::Mail, kind, preprocessors());
    }
    pipeline
}

fn drain_events(rx: &crossbeam_channel::Receiver<Notification>) -> Vec<Notification> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn deferred_completion_orders_notifications() {
    // Two preprocessors; the second defers completion. Three creates must
    // yield exactly three RevisionUpdated emissions in revision order and
    // exactly one PipelinesDrained after the last.
    let dir = tempdir().unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));
    let tokens = Arc::new(Mutex::new(Vec::new()));

    let mut pipeline = pipeline_with(&dir, || {
        vec![
            Box::new(Counting {
                invocations: Arc::clone(&invocations),
            }),
            Box::new(Deferring {
                tokens: Arc::clone(&tokens),
            }),
        ]
    });
    let rx = pipeline.subscribe();

    for i in 0..3 {
        let uid = Uid::from_bytes(format!("m{}", i).as_bytes());
        let revision = pipeline
            .new_entity(EntityType::Mail, &uid, &mail_payload("hello"), false)
            .unwrap();
        assert_eq!(revision, Some(i + 1));
    }

    // All three states are parked on the deferred second step.
    assert_eq!(pipeline.active_count(), 3);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert!(drain_events(&rx).is_empty(), "nothing completed yet");

    // The deferred work finishes later.
    std::thread::sleep(Duration::from_millis(50));
    let pending: Vec<CompletionToken> = tokens.lock().unwrap().drain(..).collect();
    assert_eq!(pending.len(), 3);
    for token in pending {
        pipeline.processing_completed(token);
    }
    assert!(pipeline.step_scheduled());
    pipeline.step_pipelines().unwrap();

    assert!(pipeline.is_drained());
    assert_eq!(
        drain_events(&rx),
        vec![
            Notification::RevisionUpdated(1),
            Notification::RevisionUpdated(2),
            Notification::RevisionUpdated(3),
            Notification::PipelinesDrained,
        ]
    );
}

#[test]
fn out_of_order_completions_keep_revision_order() {
    let dir = tempdir().unwrap();
    let tokens = Arc::new(Mutex::new(Vec::new()));

    let mut pipeline = pipeline_with(&dir, || {
        vec![Box::new(Deferring {
            tokens: Arc::clone(&tokens),
        })]
    });
    let rx = pipeline.subscribe();

    for i in 0..3 {
        let uid = Uid::from_bytes(format!("m{}", i).as_bytes());
        pipeline
            .new_entity(EntityType::Mail, &uid, &mail_payload("hello"), false)
            .unwrap();
    }

    // Complete in reverse order; subscribers still see ascending revisions.
    let pending: Vec<CompletionToken> = tokens.lock().unwrap().drain(..).collect();
    for token in pending.into_iter().rev() {
        pipeline.processing_completed(token);
        pipeline.step_pipelines().unwrap();
    }

    assert_eq!(
        drain_events(&rx),
        vec![
            Notification::RevisionUpdated(1),
            Notification::RevisionUpdated(2),
            Notification::RevisionUpdated(3),
            Notification::PipelinesDrained,
        ]
    );
}

#[test]
fn stale_completions_are_ignored() {
    let dir = tempdir().unwrap();
    let tokens = Arc::new(Mutex::new(Vec::new()));

    let mut pipeline = pipeline_with(&dir, || {
        vec![Box::new(Deferring {
            tokens: Arc::clone(&tokens),
        })]
    });
    let rx = pipeline.subscribe();

    pipeline
        .new_entity(
            EntityType::Mail,
            &Uid::from_bytes(b"m1"),
            &mail_payload("hello"),
            false,
        )
        .unwrap();

    let token = tokens.lock().unwrap().pop().unwrap();
    pipeline.processing_completed(token);
    // Replaying the same completion must not advance anything.
    pipeline.processing_completed(token);
    pipeline.step_pipelines().unwrap();
    pipeline.processing_completed(token);

    assert!(pipeline.is_drained());
    assert_eq!(
        drain_events(&rx),
        vec![
            Notification::RevisionUpdated(1),
            Notification::PipelinesDrained,
        ]
    );
}

#[test]
fn synchronous_chains_drain_inline() {
    let dir = tempdir().unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));

    let mut pipeline = pipeline_with(&dir, || {
        vec![Box::new(Counting {
            invocations: Arc::clone(&invocations),
        })]
    });

    pipeline
        .new_entity(
            EntityType::Mail,
            &Uid::from_bytes(b"m1"),
            &mail_payload("hello"),
            false,
        )
        .unwrap();

    // No parked states, no scheduled step: the chain ran inside the call.
    assert!(pipeline.is_drained());
    assert!(!pipeline.step_scheduled());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[test]
fn commands_for_one_uid_apply_in_submission_order() {
    let dir = tempdir().unwrap();
    let mut pipeline = pipeline_with(&dir, Vec::new);
    let uid = Uid::from_bytes(b"m1");

    pipeline
        .new_entity(EntityType::Mail, &uid, &mail_payload("first"), false)
        .unwrap();
    pipeline
        .modified_entity(EntityType::Mail, &uid, &mail_payload("second"), false)
        .unwrap();
    pipeline
        .modified_entity(EntityType::Mail, &uid, &mail_payload("third"), false)
        .unwrap();

    let txn = pipeline.store().begin(silt::AccessMode::ReadOnly).unwrap();
    let latest = silt::entity::read_latest(&txn, EntityType::Mail, &uid)
        .unwrap()
        .unwrap();
    assert_eq!(latest.metadata.revision(), Some(3));
    assert_eq!(
        silt::domain::Mail::decode(&latest.resource).unwrap().subject,
        "third"
    );
}
