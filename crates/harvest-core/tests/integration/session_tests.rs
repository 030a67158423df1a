use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use harvest_core::testutil::{MockBrowser, Recorded, RecordingHandler, bool_result, string_result};
use harvest_core::{HarvestError, Page, SessionState, TabEvent};

use crate::integration::common::{
    ARTICLE_RULE, ARTICLE_URL, GROUP, article_browser, comments, store_with,
};

fn article_page(id: &str) -> Page {
    Page::new(id, ARTICLE_URL, GROUP).unwrap()
}

#[tokio::test]
async fn fields_then_batches_then_one_completion() {
    let store = store_with(&[ARTICLE_RULE]);
    let browser = article_browser(11);
    let handler = RecordingHandler::new();

    let session = article_page("p1")
        .collect(&browser, &store, Arc::new(handler.clone()))
        .await
        .unwrap();
    assert_eq!(session.wait().await, SessionState::Completed);

    let fields = HashMap::from([
        ("title".to_string(), "Rust 2024".to_string()),
        ("headline".to_string(), "RUST 2024".to_string()),
    ]);
    assert_eq!(
        handler.events(),
        [
            Recorded::Fields(fields),
            Recorded::Loop {
                index: 5,
                batch: comments(1..=5)
            },
            Recorded::Loop {
                index: 10,
                batch: comments(6..=10)
            },
            Recorded::Loop {
                index: 11,
                batch: comments(11..=11)
            },
            Recorded::Complete,
        ]
    );

    session.close().await.unwrap();
    assert!(browser.tabs()[0].is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_load_signals_run_pipeline_once() {
    let store = store_with(&[ARTICLE_RULE]);
    let browser = article_browser(3).without_load_event();
    let handler = RecordingHandler::new();

    let session = article_page("p1")
        .collect(&browser, &store, Arc::new(handler.clone()))
        .await
        .unwrap();

    let mut signals = Vec::new();
    for i in 0..16 {
        let session = session.clone();
        signals.push(tokio::spawn(async move {
            let event = if i % 2 == 0 {
                TabEvent::load_fired()
            } else {
                TabEvent::load_fired().into_synthetic()
            };
            session.on_event(event)
        }));
    }
    let mut claimed = 0;
    for signal in signals {
        if signal.await.unwrap() {
            claimed += 1;
        }
    }

    assert_eq!(claimed, 1);
    assert_eq!(session.wait().await, SessionState::Completed);
    assert_eq!(handler.fields().len(), 1);
    assert_eq!(handler.completions(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn real_and_synthetic_race_completes_once() {
    let rule = ARTICLE_RULE.replace("priority: 10", "priority: 10\ntimeout: 1ms");
    let store = store_with(&[&rule]);
    let browser = article_browser(2);
    let handler = RecordingHandler::new();

    let session = article_page("p1")
        .collect(&browser, &store, Arc::new(handler.clone()))
        .await
        .unwrap();
    session.wait().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(handler.completions(), 1);
    assert_eq!(handler.fields().len(), 1);
    assert_eq!(handler.batches().len(), 1);
}

#[tokio::test]
async fn timeout_fires_synthetic_load_event() {
    let rule = ARTICLE_RULE.replace("priority: 10", "priority: 10\ntimeout: 20ms");
    let store = store_with(&[&rule]);
    let browser = article_browser(1).without_load_event();
    let handler = RecordingHandler::new();

    let session = article_page("p1")
        .collect(&browser, &store, Arc::new(handler.clone()))
        .await
        .unwrap();
    assert_eq!(session.wait().await, SessionState::Completed);

    let fired = browser.tabs()[0].fired();
    assert_eq!(fired.len(), 1);
    assert!(fired[0].is_load_fired());
    assert!(fired[0].synthetic);
    assert_eq!(handler.batches(), [(1, comments(1..=1))]);
    assert_eq!(handler.completions(), 1);
}

#[tokio::test]
async fn timeout_does_not_wait_for_navigation_answer() {
    let rule = ARTICLE_RULE.replace("priority: 10", "priority: 10\ntimeout: 50ms");
    let store = store_with(&[&rule]);
    let browser = article_browser(1)
        .without_load_event()
        .delayed_navigate(Duration::from_secs(3));
    let handler = RecordingHandler::new();

    let session = tokio::time::timeout(
        Duration::from_millis(500),
        article_page("p1").collect(&browser, &store, Arc::new(handler.clone())),
    )
    .await
    .expect("collect waited for the navigation answer")
    .unwrap();
    let state = tokio::time::timeout(Duration::from_millis(500), session.wait())
        .await
        .expect("pipeline waited for the navigation answer");

    assert_eq!(state, SessionState::Completed);
    assert!(browser.tabs()[0].fired()[0].synthetic);
    assert_eq!(handler.completions(), 1);
}

#[tokio::test]
async fn dropped_session_still_collects_and_releases_tab() {
    let rule = ARTICLE_RULE.replace("priority: 10", "priority: 10\ntimeout: 20ms");
    let store = store_with(&[&rule]);
    let browser = article_browser(1).without_load_event();
    let handler = RecordingHandler::new();

    let session = article_page("p1")
        .collect(&browser, &store, Arc::new(handler.clone()))
        .await
        .unwrap();
    drop(session);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(handler.completions(), 1);
    assert_eq!(handler.batches(), [(1, comments(1..=1))]);
    assert!(browser.tabs()[0].is_closed());
}

#[tokio::test]
async fn invalid_page_fails_before_any_tab() {
    assert!(matches!(
        Page::new("p1", "", GROUP),
        Err(HarvestError::InvalidArgument(_))
    ));
    assert!(matches!(
        Page::new("p1", ARTICLE_URL, ""),
        Err(HarvestError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn unmatched_url_opens_no_tab() {
    let store = store_with(&[ARTICLE_RULE]);
    let browser = article_browser(1);

    for (url, group) in [
        ("https://news.example.com/about", GROUP),
        (ARTICLE_URL, "sports"),
    ] {
        let err = Page::new("p1", url, group)
            .unwrap()
            .collect(&browser, &store, Arc::new(RecordingHandler::new()))
            .await
            .err()
            .unwrap();
        assert!(err.is_pre_transport());
    }
    assert!(browser.tabs().is_empty());
}

#[tokio::test]
async fn tab_creation_failure_is_transport_error() {
    let store = store_with(&[ARTICLE_RULE]);
    let browser = article_browser(1).failing_new_tab();

    let err = article_page("p1")
        .collect(&browser, &store, Arc::new(RecordingHandler::new()))
        .await
        .err()
        .unwrap();

    assert!(matches!(err, HarvestError::Transport(_)));
    assert!(browser.tabs().is_empty());
}

#[tokio::test]
async fn navigation_failure_closes_tab() {
    let store = store_with(&[ARTICLE_RULE]);
    let browser = article_browser(1).failing_navigate();
    let handler = RecordingHandler::new();

    let err = article_page("p1")
        .collect(&browser, &store, Arc::new(handler.clone()))
        .await
        .err()
        .unwrap();

    assert!(matches!(err, HarvestError::Transport(msg) if msg.contains("ERR_NAME_NOT_RESOLVED")));
    let tabs = browser.tabs();
    assert_eq!(tabs.len(), 1);
    assert!(tabs[0].is_closed());
    assert!(handler.events().is_empty());
}

#[tokio::test]
async fn handler_stop_ends_loop_early() {
    let store = store_with(&[ARTICLE_RULE]);
    let browser = article_browser(usize::MAX);
    let handler = RecordingHandler::stop_after_batches(2);

    let session = article_page("p1")
        .collect(&browser, &store, Arc::new(handler.clone()))
        .await
        .unwrap();
    assert_eq!(session.wait().await, SessionState::Completed);

    assert_eq!(
        handler.batches(),
        [(5, comments(1..=5)), (10, comments(6..=10))]
    );
    assert_eq!(handler.events().last(), Some(&Recorded::Complete));
}

#[tokio::test]
async fn closed_prepare_gate_still_completes() {
    let rule = r#"
id: gated
group: news
patterns: ['example']
prepare:
  eval: "window.ready === true"
fields:
  - name: title
    eval: document.title
"#;
    let store = store_with(&[rule]);
    let browser = MockBrowser::new(|expr, _| match expr {
        "{window.ready === true}" => bool_result(false),
        _ => string_result("unused"),
    });
    let handler = RecordingHandler::new();

    let session = article_page("p1")
        .collect(&browser, &store, Arc::new(handler.clone()))
        .await
        .unwrap();

    assert_eq!(session.wait().await, SessionState::Completed);
    assert_eq!(
        handler.events(),
        [Recorded::Fields(HashMap::new()), Recorded::Complete]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sessions_share_one_store() {
    let store = store_with(&[ARTICLE_RULE]);
    let browser = article_browser(usize::MAX).without_load_event();
    let handler = RecordingHandler::stop_after_batches(1);

    let mut sessions = Vec::new();
    for i in 0..8 {
        let session = Page::new(format!("p{i}"), format!("{ARTICLE_URL}{i}"), GROUP)
            .unwrap()
            .collect(&browser, &store, Arc::new(handler.clone()))
            .await
            .unwrap();
        sessions.push(session);
    }
    for session in &sessions {
        assert!(session.on_event(TabEvent::load_fired()));
    }
    for session in &sessions {
        assert_eq!(session.wait().await, SessionState::Completed);
    }

    assert_eq!(browser.tabs().len(), 8);
    assert_eq!(handler.completions(), 8);
}
