pub mod chromium;

pub use chromium::{ChromeBrowser, ChromeTab};
