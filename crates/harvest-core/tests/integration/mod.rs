mod common;
mod session_tests;
mod store_tests;
