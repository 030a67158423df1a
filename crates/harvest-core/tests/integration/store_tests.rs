use std::fs;
use std::sync::Arc;

use harvest_core::testutil::{RecordingHandler, rule_yaml};
use harvest_core::{InstallOutcome, LoadStatus, Page, RuleStore, SessionState};

use crate::integration::common::{ARTICLE_RULE, ARTICLE_URL, GROUP, article_browser, store_with};

#[test]
fn load_dir_reports_each_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("10-article.yml"), ARTICLE_RULE).unwrap();
    fs::write(
        dir.path().join("20-fallback.yaml"),
        rule_yaml("fallback", 1, GROUP, 100, "news\\.example\\.com"),
    )
    .unwrap();
    fs::write(dir.path().join("30-broken.yml"), "id: [unclosed").unwrap();
    fs::write(dir.path().join(".hidden.yml"), ARTICLE_RULE).unwrap();
    fs::write(dir.path().join("notes.txt"), "not a rule").unwrap();

    let store = RuleStore::new();
    let report = store.load_dir(dir.path()).unwrap();

    let names: Vec<_> = report
        .iter()
        .map(|r| r.path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, ["10-article.yml", "20-fallback.yaml", "30-broken.yml"]);
    assert!(matches!(
        report[0].status,
        LoadStatus::Loaded(InstallOutcome::Added { .. })
    ));
    assert!(matches!(report[2].status, LoadStatus::Failed { .. }));

    let ids: Vec<_> = store.rules(GROUP).iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, ["article", "fallback"]);
    assert_eq!(
        store.match_url(GROUP, "https://news.example.com/about").unwrap().id,
        "fallback"
    );
}

#[tokio::test]
async fn new_sessions_see_replaced_rule() {
    let store = store_with(&[ARTICLE_RULE]);
    let browser = article_browser(1);

    let first = Page::new("p1", ARTICLE_URL, GROUP)
        .unwrap()
        .collect(&browser, &store, Arc::new(RecordingHandler::new()))
        .await
        .unwrap();
    assert_eq!(first.rule().version, 1);

    let v2 = ARTICLE_RULE.replace("version: 1", "version: 2");
    let outcome = store.append(v2.as_bytes()).unwrap();
    assert!(matches!(
        outcome,
        InstallOutcome::Replaced {
            previous: 1,
            version: 2,
            ..
        }
    ));

    let second = Page::new("p2", ARTICLE_URL, GROUP)
        .unwrap()
        .collect(&browser, &store, Arc::new(RecordingHandler::new()))
        .await
        .unwrap();

    assert_eq!(second.rule().version, 2);
    assert_eq!(first.rule().version, 1);
    assert_eq!(first.wait().await, SessionState::Completed);
    assert_eq!(second.wait().await, SessionState::Completed);
}

#[tokio::test]
async fn removed_rule_no_longer_matches() {
    let store = store_with(&[ARTICLE_RULE]);
    assert_eq!(store.remove(GROUP, &["article"]).unwrap(), 1);

    let err = Page::new("p1", ARTICLE_URL, GROUP)
        .unwrap()
        .collect(&article_browser(1), &store, Arc::new(RecordingHandler::new()))
        .await
        .err()
        .unwrap();
    assert!(err.is_pre_transport());
}
