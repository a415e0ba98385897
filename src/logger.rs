use std::path::Path;
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, Layer};

/// If a global tracing subscriber is not already configured, log to stderr and,
/// when `file_path` is given, to that file; then add our custom panic hook.
///
/// Records emitted through the `log` facade are forwarded to the subscriber.
pub fn install_logger(file_path: Option<&Path>) {
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::INFO)
        .with_filter(filter_fn(|m| {
            // Only our own records below `warn`.
            m.module_path()
                .is_some_and(|path| path.starts_with(env!("CARGO_CRATE_NAME")))
                || *m.level() <= LevelFilter::WARN
        }));

    let file = file_path.map(|file_path| {
        let writer = tracing_appender::rolling::never(
            file_path.parent().unwrap_or_else(|| Path::new(".")),
            file_path.file_name().unwrap_or_else(|| "experiment.log".as_ref()),
        );
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(LevelFilter::INFO)
    });

    if registry().with(stderr).with(file).try_init().is_ok() {
        update_panic_hook(file_path);
    }
}

fn update_panic_hook(file_path: Option<&Path>) {
    let hook = std::panic::take_hook();
    let file_path = file_path.map(|path| path.display().to_string());

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {info}");
        if let Some(file_path) = &file_path {
            eprintln!(
                "=== PANIC ===\nA fatal error happened, you can check the experiment logs here => \
                 '{file_path}'\n============="
            );
        }
        hook(info);
    }));
}
