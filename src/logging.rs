use slog::{o, Discard, Drain, Level, LevelFilter, Logger};

/// Terminal logger: full-format records written from a background thread.
///
/// Records below `info` are dropped unless `verbose` is set.
pub fn terminal(verbose: bool) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    let level = if verbose { Level::Debug } else { Level::Info };
    let drain = LevelFilter::new(drain, level).ignore_res();

    Logger::root(drain, o!("app" => "ruffle"))
}

/// Logger that swallows every record
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
