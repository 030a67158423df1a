use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use harvest_core::RuleStore;
use harvest_core::testutil::{MockBrowser, bool_result, string_result};

pub const GROUP: &str = "news";

/// Article rule: two fields, then a comment loop exporting every 5 iterations.
pub const ARTICLE_RULE: &str = r#"
id: article
version: 1
name: Article
group: news
priority: 10
patterns:
  - '^https://news\.example\.com/article/\d+'
fields:
  - name: title
    eval: document.title
  - name: headline
    eval: "field_title.toUpperCase()"
loop:
  name: comments
  export_cycle: 5
  eval: "comment(loop_count)"
  next: "hasMore(loop_count)"
"#;

pub const ARTICLE_URL: &str = "https://news.example.com/article/42";

pub fn store_with(rules: &[&str]) -> RuleStore {
    let store = RuleStore::new();
    for rule in rules {
        store.append(rule.as_bytes()).unwrap();
    }
    store
}

/// Browser serving the article page; `hasMore` turns false on its `comments`th call.
pub fn article_browser(comments: usize) -> MockBrowser {
    let next_calls = Arc::new(AtomicUsize::new(0));
    MockBrowser::new(move |expr, globals| match expr {
        "{document.title}" => string_result("Rust 2024"),
        "{field_title.toUpperCase()}" => {
            string_result(&globals["field_title"].to_uppercase())
        }
        "{comment(loop_count)}" => string_result(&format!("c{}", globals["loop_count"])),
        "{hasMore(loop_count)}" => {
            let n = next_calls.fetch_add(1, Ordering::SeqCst) + 1;
            bool_result(n < comments)
        }
        _ => string_result(""),
    })
}

pub fn comments(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|n| format!("c{n}")).collect()
}
