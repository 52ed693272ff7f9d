pub fn init() {
    #[cfg(all(feature = "tracing-subscriber", not(feature = "console-subscriber")))]
    {
        use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

        // RUST_LOG wins when set; otherwise log the broker itself at info
        // and stay quiet about everything underneath it.
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("omnibusd=info"));
        FmtSubscriber::builder()
            .with_env_filter(filter)
            .finish()
            .init();
    }

    #[cfg(feature = "console-subscriber")]
    console_subscriber::init();
}
