use std::sync::Once;

use lazy_static::lazy_static;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

lazy_static! {
    pub static ref RUNTIME: Runtime = Runtime::new().unwrap();
}
static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}
