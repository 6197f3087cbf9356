//! HTTP endpoint tests

mod health_tests;
mod ws_tests;
