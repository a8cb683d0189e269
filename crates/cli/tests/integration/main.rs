mod common;

mod build_tests;
mod cleanup_tests;
mod fetch_tests;
mod venv_tests;
