use once_cell::sync::Lazy;

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

/// Run `RUST_LOG=quorum_raft=debug cargo test` to see protocol traffic.
pub fn init_tracing() {
    Lazy::force(&TRACING);
}
