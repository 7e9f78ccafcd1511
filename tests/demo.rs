//! Integration test for the bundled demo workflow.
use hydronet::commands::{DEMOS_DIR, handle_demo_run_command};

#[test]
fn test_demo_listing_contains_simple() {
    assert!(DEMOS_DIR.get_dir("simple").is_some());
}

#[test]
fn test_demo_run_command() {
    handle_demo_run_command("simple").unwrap();

    // an unknown demo is an error, not a panic
    assert!(handle_demo_run_command("no-such-demo").is_err());
}
