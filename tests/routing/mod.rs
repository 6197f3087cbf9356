//! End-to-end routing tests

mod distributed_tests;
mod local_tests;
mod presence_tests;
