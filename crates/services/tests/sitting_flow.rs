use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use exam_core::model::{
    AnswerValue, EngineSettings, ExamDefinition, ExamId, ProgramId, Question, QuestionId,
    SessionStatus, StudentId, Topic, TopicSelection,
};
use exam_core::time::fixed_now;
use exam_core::timer::Tick;
use services::{
    CacheEntry, Clock, Completion, ExamSitting, InMemoryUploader, SittingCache, SittingDrivers,
    SittingError, SittingEvent, SittingKey, SittingState, SubmitOutcome, SubmitReason,
};
use storage::repository::{
    ContentCatalog, InMemoryRepository, LocalCache, SessionStore, Storage,
};
use storage::SessionSubscription;
use tokio::sync::broadcast;

const PROGRAM: ProgramId = ProgramId::new(7);

fn key() -> SittingKey {
    SittingKey {
        exam: ExamId::new(100),
        student: StudentId::new(42),
        program: PROGRAM,
    }
}

fn topic(name: &str) -> Topic {
    Topic::new(name).unwrap()
}

fn single(name: &str) -> TopicSelection {
    TopicSelection::Single(topic(name))
}

/// Two 10-point choice questions; the correct answers are 0 and 1.
fn definition(id: u64, minutes: u32) -> ExamDefinition {
    let base = id * 10;
    ExamDefinition::new(
        ExamId::new(id),
        PROGRAM,
        format!("Topic exam {id}"),
        minutes,
        60,
        vec![
            Question::choice(
                QuestionId::new(base + 1),
                "First",
                vec!["A".into(), "B".into(), "C".into()],
                0,
                10,
            )
            .unwrap(),
            Question::choice(
                QuestionId::new(base + 2),
                "Second",
                vec!["A".into(), "B".into()],
                1,
                10,
            )
            .unwrap(),
        ],
    )
    .unwrap()
}

async fn seed(repo: &InMemoryRepository, topics: &[(&str, u64)], minutes: u32) {
    for (name, id) in topics {
        repo.upsert_exam(&topic(name), &definition(*id, minutes))
            .await
            .unwrap();
    }
}

fn sitting(repo: &InMemoryRepository, clock: Clock) -> Arc<ExamSitting> {
    Arc::new(ExamSitting::new(
        key(),
        &Storage::from_in_memory(repo),
        EngineSettings::default().with_fast_retries(),
        clock,
    ))
}

async fn drain(sitting: &ExamSitting, sub: &mut SessionSubscription) {
    while let Some(event) = sub.try_next() {
        sitting.apply_remote(event).await.unwrap();
    }
}

fn drain_events(rx: &mut broadcast::Receiver<SittingEvent>) -> Vec<SittingEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn completing_a_topic_flushes_answers_and_advances() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1), ("WORD", 2)], 180).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));

    let view = sitting.start(single("EXCEL")).await.unwrap();
    assert_eq!(view.state, SittingState::InTopic(single("EXCEL")));
    assert_eq!(view.remaining_seconds, Some(180 * 60));

    sitting
        .answer(QuestionId::new(11), AnswerValue::Choice(0))
        .await
        .unwrap();
    let completion = sitting.complete_topic(&single("EXCEL")).await.unwrap();

    assert_eq!(completion, Completion::Advanced(topic("WORD")));
    let view = sitting.view().await;
    assert_eq!(view.state, SittingState::InTopic(single("WORD")));
    assert_eq!(view.completed_topics, vec![topic("EXCEL")]);
    assert_eq!(sitting.questions().await.len(), 2);

    let stored = repo.get_session(sitting.session_id()).await.unwrap().unwrap();
    assert_eq!(stored.answer(QuestionId::new(11)), Some(&AnswerValue::Choice(0)));

    let cache = SittingCache::new(Arc::new(repo.clone()), sitting.session_id());
    assert_eq!(cache.load_completed().await.len(), 1);
    assert_eq!(cache.load_deadline().await, Some(stored.end_time()));
}

#[tokio::test]
async fn completing_twice_changes_nothing() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1), ("WORD", 2)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    sitting.start(single("EXCEL")).await.unwrap();

    sitting.complete_topic(&single("EXCEL")).await.unwrap();
    let before = sitting.view().await;
    let again = sitting.complete_topic(&single("EXCEL")).await.unwrap();

    assert_eq!(again, Completion::AlreadyCompleted);
    assert_eq!(sitting.view().await, before);
}

#[tokio::test]
async fn last_topic_completes_the_set() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("PRAKTIKUM", 5)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    sitting.start(single("PRAKTIKUM")).await.unwrap();

    let completion = sitting.complete_topic(&single("PRAKTIKUM")).await.unwrap();

    assert_eq!(completion, Completion::AllComplete);
    assert_eq!(sitting.view().await.state, SittingState::AllComplete);
}

#[tokio::test]
async fn missing_content_leaves_selection_untouched() {
    let repo = InMemoryRepository::new();
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));

    let err = sitting.start(single("PPT")).await.unwrap_err();

    assert!(matches!(err, SittingError::ContentUnavailable { .. }));
    assert_eq!(sitting.view().await.state, SittingState::SelectingTopic);
    assert!(repo.get_session(sitting.session_id()).await.unwrap().is_none());
}

#[tokio::test]
async fn auto_advance_into_empty_topic_returns_to_selection() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    sitting.start(single("EXCEL")).await.unwrap();

    let completion = sitting.complete_topic(&single("EXCEL")).await.unwrap();

    assert_eq!(completion, Completion::BackToSelection);
    assert_eq!(sitting.view().await.state, SittingState::SelectingTopic);
}

#[tokio::test]
async fn repeated_force_submit_writes_one_score() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    sitting.start(single("EXCEL")).await.unwrap();
    sitting
        .answer(QuestionId::new(11), AnswerValue::Choice(0))
        .await
        .unwrap();
    sitting
        .answer(QuestionId::new(12), AnswerValue::Choice(0))
        .await
        .unwrap();

    let (a, b, c) = tokio::join!(
        sitting.force_submit(SubmitReason::UserRequested),
        sitting.force_submit(SubmitReason::TimeExpired),
        sitting.force_submit(SubmitReason::Emergency),
    );
    let outcomes = [a.unwrap(), b.unwrap(), c.unwrap()];
    let submitted = outcomes
        .iter()
        .filter(|o| matches!(o, SubmitOutcome::Submitted(_)))
        .count();
    assert_eq!(submitted, 1);
    assert_eq!(
        sitting.force_submit(SubmitReason::UserRequested).await.unwrap(),
        SubmitOutcome::AlreadySubmitted
    );

    assert_eq!(repo.stats().status_writes(), 1);
    let stored = repo.get_session(sitting.session_id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), SessionStatus::Submitted);
    assert_eq!(stored.final_score(), Some(50));
    assert_eq!(sitting.view().await.final_score, Some(50));
}

#[tokio::test]
async fn submission_scores_the_full_question_set() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1), ("WORD", 2)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    sitting.start(single("EXCEL")).await.unwrap();
    sitting
        .answer(QuestionId::new(11), AnswerValue::Choice(0))
        .await
        .unwrap();
    sitting
        .answer(QuestionId::new(12), AnswerValue::Choice(1))
        .await
        .unwrap();

    match sitting.force_submit(SubmitReason::Emergency).await.unwrap() {
        SubmitOutcome::Submitted(report) => {
            assert_eq!(report.earned_points, 20);
            assert_eq!(report.total_points, 40);
            assert_eq!(report.score, 50);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn deadline_forces_exactly_one_submission() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1)], 180).await;
    let t0 = fixed_now();
    let clock = Clock::manual(t0);
    let mut time = clock.clone();
    let sitting = sitting(&repo, clock);
    sitting.start(single("EXCEL")).await.unwrap();

    time.advance(Duration::minutes(179) + Duration::seconds(59));
    assert_eq!(
        sitting.tick().await.unwrap(),
        Tick::Running {
            remaining_seconds: 1
        }
    );
    assert_eq!(repo.stats().status_writes(), 0);

    time.advance(Duration::seconds(2));
    assert_eq!(sitting.tick().await.unwrap(), Tick::Expired);
    assert_eq!(sitting.tick().await.unwrap(), Tick::Stopped);
    assert_eq!(
        sitting.force_submit(SubmitReason::TimeExpired).await.unwrap(),
        SubmitOutcome::AlreadySubmitted
    );

    assert_eq!(repo.stats().status_writes(), 1);
    let view = sitting.view().await;
    assert_eq!(view.state, SittingState::Submitted);
    assert_eq!(view.remaining_seconds, Some(0));
}

#[tokio::test]
async fn transient_failures_below_budget_are_invisible() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    sitting.start(single("EXCEL")).await.unwrap();

    repo.fail_next_writes(2);
    sitting
        .answer(QuestionId::new(11), AnswerValue::Choice(2))
        .await
        .unwrap();

    assert_eq!(sitting.view().await.pending_answers, 0);
}

#[tokio::test]
async fn exhausted_retries_keep_the_answer_pending() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1), ("WORD", 2)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    sitting.start(single("EXCEL")).await.unwrap();

    repo.fail_next_writes(3);
    let err = sitting
        .answer(QuestionId::new(11), AnswerValue::Choice(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SittingError::PersistenceFatal { attempts: 3, .. }));

    let view = sitting.view().await;
    assert_eq!(view.pending_answers, 1);
    assert_eq!(view.answers[&QuestionId::new(11)], AnswerValue::Choice(1));

    repo.fail_next_writes(3);
    assert!(matches!(
        sitting.complete_topic(&single("EXCEL")).await,
        Err(SittingError::PersistenceFatal { .. })
    ));
    assert_eq!(
        sitting.view().await.state,
        SittingState::InTopic(single("EXCEL"))
    );

    sitting.complete_topic(&single("EXCEL")).await.unwrap();
    let stored = repo.get_session(sitting.session_id()).await.unwrap().unwrap();
    assert_eq!(stored.answer(QuestionId::new(11)), Some(&AnswerValue::Choice(1)));
    assert_eq!(sitting.view().await.pending_answers, 0);
}

#[tokio::test]
async fn answers_are_validated_against_the_open_topic() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1), ("WORD", 2)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));

    assert!(matches!(
        sitting.answer(QuestionId::new(11), AnswerValue::Choice(0)).await,
        Err(SittingError::InvalidTransition { .. })
    ));

    sitting.start(single("EXCEL")).await.unwrap();
    assert_eq!(
        sitting
            .answer(QuestionId::new(21), AnswerValue::Choice(0))
            .await
            .unwrap_err(),
        SittingError::UnknownQuestion(QuestionId::new(21))
    );
    assert_eq!(
        sitting
            .answer(QuestionId::new(12), AnswerValue::Choice(2))
            .await
            .unwrap_err(),
        SittingError::AnswerMismatch(QuestionId::new(12))
    );
    assert_eq!(
        sitting
            .answer(QuestionId::new(12), AnswerValue::Reference("x".into()))
            .await
            .unwrap_err(),
        SittingError::AnswerMismatch(QuestionId::new(12))
    );
}

#[tokio::test]
async fn administrator_reset_clears_everything() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1), ("WORD", 2), ("PPT", 3)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    let mut events = sitting.events();
    let mut sub = sitting.subscribe().await.unwrap();

    sitting.start(single("EXCEL")).await.unwrap();
    sitting
        .answer(QuestionId::new(11), AnswerValue::Choice(0))
        .await
        .unwrap();
    sitting.complete_topic(&single("EXCEL")).await.unwrap();
    sitting.complete_topic(&single("WORD")).await.unwrap();
    drain(&sitting, &mut sub).await;
    assert_eq!(sitting.view().await.completed_topics.len(), 2);

    repo.delete_session(sitting.session_id()).await.unwrap();
    drain(&sitting, &mut sub).await;

    let view = sitting.view().await;
    assert_eq!(view.state, SittingState::SelectingTopic);
    assert!(view.completed_topics.is_empty());
    assert!(view.answers.is_empty());
    assert_eq!(view.remaining_seconds, None);
    assert_eq!(view.generation, 1);

    let cache = SittingCache::new(Arc::new(repo.clone()), sitting.session_id());
    for entry in CacheEntry::ALL {
        assert!(repo.get_entry(&cache.key(entry)).await.unwrap().is_none());
    }
    assert!(drain_events(&mut events).contains(&SittingEvent::Reset));

    // A fresh start after the reset gets a fresh deadline and topic set.
    sitting.start(single("EXCEL")).await.unwrap();
    assert!(repo.get_session(sitting.session_id()).await.unwrap().is_some());
}

#[tokio::test]
async fn answer_after_deletion_resets_before_the_watch_catches_up() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1), ("WORD", 2)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    let mut events = sitting.events();
    let _sub = sitting.subscribe().await.unwrap();

    sitting.start(single("EXCEL")).await.unwrap();
    repo.delete_session(sitting.session_id()).await.unwrap();

    // The watch still holds the deletion; the failed write finds it first.
    sitting
        .answer(QuestionId::new(11), AnswerValue::Choice(0))
        .await
        .unwrap();

    let view = sitting.view().await;
    assert_eq!(view.generation, 1);
    assert_eq!(view.state, SittingState::SelectingTopic);
    assert!(view.answers.is_empty());
    assert_eq!(view.pending_answers, 0);
    assert!(drain_events(&mut events).contains(&SittingEvent::Reset));

    let cache = SittingCache::new(Arc::new(repo.clone()), sitting.session_id());
    assert!(repo.get_entry(&cache.key(CacheEntry::Deadline)).await.unwrap().is_none());
}

#[tokio::test]
async fn completing_after_deletion_returns_to_selection() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1), ("WORD", 2)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));

    sitting.start(single("EXCEL")).await.unwrap();
    repo.fail_next_writes(3);
    assert!(matches!(
        sitting.answer(QuestionId::new(11), AnswerValue::Choice(0)).await,
        Err(SittingError::PersistenceFatal { .. })
    ));
    repo.delete_session(sitting.session_id()).await.unwrap();

    let completion = sitting.complete_topic(&single("EXCEL")).await.unwrap();
    assert_eq!(completion, Completion::BackToSelection);

    let view = sitting.view().await;
    assert_eq!(view.generation, 1);
    assert_eq!(view.state, SittingState::SelectingTopic);
    assert!(view.completed_topics.is_empty());
}

#[tokio::test]
async fn stale_missing_before_first_snapshot_is_ignored() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    // The initial event of a watch opened before the document exists.
    let mut sub = sitting.subscribe().await.unwrap();

    sitting.start(single("EXCEL")).await.unwrap();
    drain(&sitting, &mut sub).await;

    let view = sitting.view().await;
    assert_eq!(view.generation, 0);
    assert_eq!(view.state, SittingState::InTopic(single("EXCEL")));
}

#[tokio::test]
async fn connection_loss_never_resets() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    let mut sub = sitting.subscribe().await.unwrap();
    sitting.start(single("EXCEL")).await.unwrap();
    drain(&sitting, &mut sub).await;
    let mut events = sitting.events();

    repo.drop_connection(sitting.session_id());
    drain(&sitting, &mut sub).await;
    assert!(!sitting.view().await.connected);

    repo.reconnect(sitting.session_id()).unwrap();
    drain(&sitting, &mut sub).await;

    let view = sitting.view().await;
    assert!(view.connected);
    assert_eq!(view.generation, 0);
    assert_eq!(view.state, SittingState::InTopic(single("EXCEL")));
    assert_eq!(
        drain_events(&mut events),
        vec![SittingEvent::ConnectionLost, SittingEvent::Reconnected]
    );
}

#[tokio::test]
async fn deadline_elapsed_while_offline_is_enforced_on_reconnect() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1)], 30).await;
    let clock = Clock::manual(fixed_now());
    let mut time = clock.clone();
    let sitting = sitting(&repo, clock);
    let mut sub = sitting.subscribe().await.unwrap();
    sitting.start(single("EXCEL")).await.unwrap();
    drain(&sitting, &mut sub).await;

    repo.drop_connection(sitting.session_id());
    drain(&sitting, &mut sub).await;
    time.advance(Duration::minutes(45));
    repo.reconnect(sitting.session_id()).unwrap();
    drain(&sitting, &mut sub).await;

    assert_eq!(sitting.view().await.state, SittingState::Submitted);
    assert_eq!(repo.stats().status_writes(), 1);
    let stored = repo.get_session(sitting.session_id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), SessionStatus::Submitted);
}

#[tokio::test]
async fn remote_submission_switches_to_review() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    let mut sub = sitting.subscribe().await.unwrap();
    sitting.start(single("EXCEL")).await.unwrap();
    drain(&sitting, &mut sub).await;

    repo.set_status(
        sitting.session_id(),
        SessionStatus::Expired,
        Some(0),
        fixed_now(),
    )
    .await
    .unwrap();
    drain(&sitting, &mut sub).await;

    let view = sitting.view().await;
    assert_eq!(view.state, SittingState::Submitted);
    assert_eq!(view.final_score, Some(0));
    assert_eq!(
        sitting.answer(QuestionId::new(11), AnswerValue::Choice(0)).await,
        Err(SittingError::SessionClosed)
    );
    assert_eq!(
        sitting.force_submit(SubmitReason::UserRequested).await.unwrap(),
        SubmitOutcome::AlreadySubmitted
    );
    assert_eq!(repo.stats().status_writes(), 1);
}

#[tokio::test]
async fn reload_resumes_from_remote_and_cache() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1), ("WORD", 2)], 60).await;
    let first = sitting(&repo, Clock::fixed(fixed_now()));
    first.start(single("EXCEL")).await.unwrap();
    first
        .answer(QuestionId::new(12), AnswerValue::Choice(1))
        .await
        .unwrap();
    first.complete_topic(&single("EXCEL")).await.unwrap();
    drop(first);

    let reloaded = sitting(&repo, Clock::fixed(fixed_now() + Duration::minutes(10)));
    let view = reloaded.open().await.unwrap();

    assert_eq!(view.state, SittingState::SelectingTopic);
    assert_eq!(view.completed_topics, vec![topic("EXCEL")]);
    assert_eq!(view.remaining_seconds, Some(50 * 60));
    assert_eq!(view.answers[&QuestionId::new(12)], AnswerValue::Choice(1));
    assert_eq!(
        reloaded.start(single("EXCEL")).await.unwrap_err(),
        SittingError::TopicAlreadyCompleted(topic("EXCEL"))
    );
    reloaded.start(single("WORD")).await.unwrap();
}

#[tokio::test]
async fn reload_after_reset_purges_leftover_cache() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1), ("WORD", 2)], 60).await;
    let first = sitting(&repo, Clock::fixed(fixed_now()));
    first.start(single("EXCEL")).await.unwrap();
    first.complete_topic(&single("EXCEL")).await.unwrap();
    repo.delete_session(first.session_id()).await.unwrap();

    let reloaded = sitting(&repo, Clock::fixed(fixed_now()));
    let view = reloaded.open().await.unwrap();

    assert!(view.completed_topics.is_empty());
    assert_eq!(view.remaining_seconds, None);
    let cache = SittingCache::new(Arc::new(repo.clone()), reloaded.session_id());
    assert_eq!(cache.load_deadline().await, None);
}

#[tokio::test]
async fn confirm_final_asks_before_submitting_an_incomplete_set() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1), ("WORD", 2)], 60).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));
    sitting.start(single("EXCEL")).await.unwrap();
    sitting.complete_topic(&single("EXCEL")).await.unwrap();
    sitting.return_to_selection().await.unwrap();

    match sitting.confirm_final(false).await {
        Err(SittingError::ConfirmationRequired { remaining }) => assert_eq!(remaining.len(), 4),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(repo.stats().status_writes(), 0);

    assert!(matches!(
        sitting.confirm_final(true).await.unwrap(),
        SubmitOutcome::Submitted(_)
    ));
}

#[tokio::test]
async fn combined_mode_completes_every_topic_at_once() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1), ("WORD", 2)], 90).await;
    let sitting = sitting(&repo, Clock::fixed(fixed_now()));

    sitting.start(TopicSelection::Combined).await.unwrap();
    assert_eq!(sitting.questions().await.len(), 4);
    sitting
        .answer(QuestionId::new(21), AnswerValue::Choice(0))
        .await
        .unwrap();

    let completion = sitting.complete_topic(&TopicSelection::Combined).await.unwrap();
    assert_eq!(completion, Completion::AllComplete);
    assert_eq!(sitting.view().await.completed_topics.len(), 5);

    assert!(matches!(
        sitting.confirm_final(false).await.unwrap(),
        SubmitOutcome::Submitted(_)
    ));
}

#[tokio::test]
async fn file_answers_are_uploaded_then_recorded() {
    let repo = InMemoryRepository::new();
    let practical = ExamDefinition::new(
        ExamId::new(9),
        PROGRAM,
        "Practical",
        60,
        50,
        vec![Question::essay(QuestionId::new(91), "Upload your workbook", 40).unwrap()],
    )
    .unwrap();
    repo.upsert_exam(&topic("PRAKTIKUM"), &practical)
        .await
        .unwrap();
    let uploader =
        InMemoryUploader::new(url::Url::parse("https://files.example/uploads/").unwrap());
    let sitting = Arc::new(
        ExamSitting::new(
            key(),
            &Storage::from_in_memory(&repo),
            EngineSettings::default().with_fast_retries(),
            Clock::fixed(fixed_now()),
        )
        .with_uploader(Arc::new(uploader.clone())),
    );
    sitting.start(single("PRAKTIKUM")).await.unwrap();

    sitting
        .answer_with_upload(QuestionId::new(91), "book.xlsx", b"data".to_vec())
        .await
        .unwrap();

    let stored = repo.get_session(sitting.session_id()).await.unwrap().unwrap();
    let Some(AnswerValue::Reference(reference)) = stored.answer(QuestionId::new(91)) else {
        panic!("reference answer expected");
    };
    assert!(reference.starts_with("https://files.example/uploads/"));

    match sitting.force_submit(SubmitReason::UserRequested).await.unwrap() {
        SubmitOutcome::Submitted(report) => {
            assert_eq!(report.score, 0);
            assert_eq!(report.pending_manual, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn drivers_submit_on_expiry_and_follow_resets() {
    let repo = InMemoryRepository::new();
    seed(&repo, &[("EXCEL", 1)], 5).await;
    let clock = Clock::manual(fixed_now());
    let mut time = clock.clone();
    let sitting = sitting(&repo, clock);
    let mut events = sitting.events();
    let drivers = SittingDrivers::spawn(Arc::clone(&sitting)).await.unwrap();

    sitting.start(single("EXCEL")).await.unwrap();
    time.advance(Duration::minutes(6));

    let submitted = tokio::time::timeout(StdDuration::from_secs(30), async {
        loop {
            if let Ok(SittingEvent::Submitted { reason, .. }) = events.recv().await {
                return reason;
            }
        }
    })
    .await
    .expect("submitted before timeout");
    assert_eq!(submitted, SubmitReason::TimeExpired);

    repo.delete_session(sitting.session_id()).await.unwrap();
    tokio::time::timeout(StdDuration::from_secs(30), async {
        loop {
            if let Ok(SittingEvent::Reset) = events.recv().await {
                return;
            }
        }
    })
    .await
    .expect("reset before timeout");

    assert!(drivers.is_running());
    assert_eq!(sitting.view().await.state, SittingState::SelectingTopic);
    assert_eq!(repo.stats().status_writes(), 1);
}
